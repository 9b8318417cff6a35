pub mod fields;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::EndpointDataReferenceEntry;
use fields::{lookup, FieldValue};

pub const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown query operand '{0}'")]
    UnknownOperand(String),
}

/// Filter operators understood by both the in-memory evaluator and the SQL
/// translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriterionOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "in")]
    In,
}

/// Right-hand side of a criterion: a scalar for `=`/`!=`, a list for `in`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperandRight {
    Value(String),
    Values(Vec<String>),
}

impl OperandRight {
    pub fn as_values(&self) -> &[String] {
        match self {
            OperandRight::Value(v) => std::slice::from_ref(v),
            OperandRight::Values(vs) => vs,
        }
    }
}

/// A single filter predicate: `left-operand operator right-operand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub operand_left: String,
    pub operator: CriterionOperator,
    pub operand_right: OperandRight,
}

impl Criterion {
    pub fn eq(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            operand_left: left.into(),
            operator: CriterionOperator::Eq,
            operand_right: OperandRight::Value(right.into()),
        }
    }

    pub fn not_eq(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            operand_left: left.into(),
            operator: CriterionOperator::NotEq,
            operand_right: OperandRight::Value(right.into()),
        }
    }

    pub fn is_in(left: impl Into<String>, rights: Vec<String>) -> Self {
        Self {
            operand_left: left.into(),
            operator: CriterionOperator::In,
            operand_right: OperandRight::Values(rights),
        }
    }

    /// Evaluates this criterion against one entry. Unknown left-operands are
    /// rejected rather than silently matching nothing, so the in-memory and
    /// SQL paths fail identically.
    pub fn matches(&self, entry: &EndpointDataReferenceEntry) -> Result<bool, QueryError> {
        let field = lookup(&self.operand_left)
            .ok_or_else(|| QueryError::UnknownOperand(self.operand_left.clone()))?;
        let actual = (field.accessor)(entry);

        let matched = match self.operator {
            CriterionOperator::Eq => match &self.operand_right {
                OperandRight::Value(v) => value_equals(&actual, v),
                OperandRight::Values(_) => false,
            },
            // an absent value matches no operator, mirroring SQL
            // three-valued logic where NULL comparisons exclude the row
            CriterionOperator::NotEq => match (&self.operand_right, &actual) {
                (_, None) => false,
                (OperandRight::Value(v), Some(_)) => !value_equals(&actual, v),
                (OperandRight::Values(_), Some(_)) => false,
            },
            CriterionOperator::In => self
                .operand_right
                .as_values()
                .iter()
                .any(|v| value_equals(&actual, v)),
        };
        Ok(matched)
    }
}

fn value_equals(actual: &Option<FieldValue>, expected: &str) -> bool {
    match actual {
        None => false,
        Some(FieldValue::Text(s)) => s == expected,
        // numeric fields compare numerically so "007" never diverges
        // between the evaluators
        Some(FieldValue::Int(i)) => expected.parse::<i64>().map(|e| e == *i).unwrap_or(false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Generic query over cache entries: conjunction of criteria, optional sort,
/// offset/limit paging. Result sets are unordered unless `sort_field` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(default)]
    pub filter_expression: Vec<Criterion>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<SortOrder>,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            filter_expression: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort_field: None,
            sort_order: None,
        }
    }
}

impl QuerySpec {
    /// Unbounded query, for "give me everything" admin listings.
    pub fn max() -> Self {
        Self {
            limit: usize::MAX,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, criterion: Criterion) -> Self {
        self.filter_expression.push(criterion);
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_field = Some(field.into());
        self.sort_order = Some(order);
        self
    }

    /// In-memory evaluation: filter, sort, page. The SQL store translates
    /// the same spec into WHERE/ORDER BY/LIMIT fragments over the same field
    /// registry.
    pub fn evaluate(
        &self,
        entries: impl IntoIterator<Item = EndpointDataReferenceEntry>,
    ) -> Result<Vec<EndpointDataReferenceEntry>, QueryError> {
        // operands are validated before any entry is visited; an unknown
        // operand must fail the same way whether the store is empty or not
        for criterion in &self.filter_expression {
            lookup(&criterion.operand_left)
                .ok_or_else(|| QueryError::UnknownOperand(criterion.operand_left.clone()))?;
        }
        if let Some(sort_field) = &self.sort_field {
            lookup(sort_field).ok_or_else(|| QueryError::UnknownOperand(sort_field.clone()))?;
        }

        let mut matched = Vec::new();
        'outer: for entry in entries {
            for criterion in &self.filter_expression {
                if !criterion.matches(&entry)? {
                    continue 'outer;
                }
            }
            matched.push(entry);
        }

        if let Some(sort_field) = &self.sort_field {
            let field = lookup(sort_field)
                .ok_or_else(|| QueryError::UnknownOperand(sort_field.clone()))?;
            matched.sort_by(|a, b| fields::compare(&(field.accessor)(a), &(field.accessor)(b)));
            if self.sort_order == Some(SortOrder::Desc) {
                matched.reverse();
            }
        }

        Ok(matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect())
    }
}
