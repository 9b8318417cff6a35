//! Property-lookup registry mapping criterion operand names to entry
//! accessors and SQL columns.
//!
//! This is the single extension point both evaluators share: the in-memory
//! predicate reads through `accessor`, the SQL translator reads `column` and
//! `kind`. A closed static table instead of runtime reflection keeps the set
//! of queryable operands checkable at compile time.

use std::cmp::Ordering;

use crate::model::EndpointDataReferenceEntry;

/// Typed view of one entry field, so numeric operands compare numerically on
/// both evaluation paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Int,
}

pub struct FieldDef {
    /// Operand name as it appears in criteria (wire casing).
    pub name: &'static str,
    /// Column in the `edr_cache` table.
    pub column: &'static str,
    pub kind: FieldKind,
    pub accessor: fn(&EndpointDataReferenceEntry) -> Option<FieldValue>,
}

pub static FIELDS: &[FieldDef] = &[
    FieldDef {
        name: "transferProcessId",
        column: "transfer_process_id",
        kind: FieldKind::Text,
        accessor: |e| Some(FieldValue::Text(e.transfer_process_id.clone())),
    },
    FieldDef {
        name: "assetId",
        column: "asset_id",
        kind: FieldKind::Text,
        accessor: |e| Some(FieldValue::Text(e.asset_id.clone())),
    },
    FieldDef {
        name: "agreementId",
        column: "agreement_id",
        kind: FieldKind::Text,
        accessor: |e| Some(FieldValue::Text(e.agreement_id.clone())),
    },
    FieldDef {
        name: "providerId",
        column: "provider_id",
        kind: FieldKind::Text,
        accessor: |e| e.provider_id.clone().map(FieldValue::Text),
    },
    FieldDef {
        name: "contractNegotiationId",
        column: "contract_negotiation_id",
        kind: FieldKind::Text,
        accessor: |e| e.contract_negotiation_id.clone().map(FieldValue::Text),
    },
    FieldDef {
        name: "state",
        column: "state",
        kind: FieldKind::Int,
        accessor: |e| Some(FieldValue::Int(e.state as i64)),
    },
    FieldDef {
        name: "expirationTimestamp",
        column: "expiration_timestamp",
        kind: FieldKind::Int,
        accessor: |e| e.expiration_timestamp.map(FieldValue::Int),
    },
    FieldDef {
        name: "createdAt",
        column: "created_at",
        kind: FieldKind::Int,
        accessor: |e| Some(FieldValue::Int(e.created_at)),
    },
    FieldDef {
        name: "updatedAt",
        column: "updated_at",
        kind: FieldKind::Int,
        accessor: |e| Some(FieldValue::Int(e.updated_at)),
    },
];

pub fn lookup(name: &str) -> Option<&'static FieldDef> {
    FIELDS.iter().find(|f| f.name == name)
}

/// Ordering used by in-memory sorts; absent values sort first, mirroring
/// SQL's NULLS FIRST behavior for ascending order in SQLite.
pub fn compare(a: &Option<FieldValue>, b: &Option<FieldValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(FieldValue::Int(x)), Some(FieldValue::Int(y))) => x.cmp(y),
        (Some(FieldValue::Text(x)), Some(FieldValue::Text(y))) => x.cmp(y),
        // mixed kinds cannot occur for one field; fall back to textual form
        (Some(x), Some(y)) => render(x).cmp(&render(y)),
    }
}

fn render(value: &FieldValue) -> String {
    match value {
        FieldValue::Text(s) => s.clone(),
        FieldValue::Int(i) => i.to_string(),
    }
}
