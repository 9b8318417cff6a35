use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required field '{0}' is missing or empty")]
    MissingField(&'static str),
}

/// Metadata record describing the provenance of one endpoint data reference.
///
/// Keyed by `transfer_process_id` (unique). The record is immutable after
/// construction; the refresh path replaces the whole record through
/// `save` rather than mutating it in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDataReferenceEntry {
    pub transfer_process_id: String,
    pub asset_id: String,
    pub agreement_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_negotiation_id: Option<String>,
    /// Epoch millis, set once at creation.
    pub created_at: i64,
    /// Epoch millis, stamped by the store on every save.
    pub updated_at: i64,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub state_count: i32,
    #[serde(default)]
    pub state_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Epoch seconds at which the associated credential expires, derived from
    /// the credential's `expiresIn` property when the pair is saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp: Option<i64>,
}

impl EndpointDataReferenceEntry {
    pub fn builder() -> EndpointDataReferenceEntryBuilder {
        EndpointDataReferenceEntryBuilder::default()
    }

    /// New entry carrying over the identity of `self`, used by the refresh
    /// path. Timestamps deliberately start fresh: the replacement's
    /// `created_at` anchors the new credential's `expiresIn`, so the store
    /// stamps it at save time.
    pub fn with_same_identity(&self) -> EndpointDataReferenceEntryBuilder {
        EndpointDataReferenceEntryBuilder::default()
            .transfer_process_id(&self.transfer_process_id)
            .asset_id(&self.asset_id)
            .agreement_id(&self.agreement_id)
            .provider_id(self.provider_id.clone())
            .contract_negotiation_id(self.contract_negotiation_id.clone())
    }
}

#[derive(Debug, Default, Clone)]
pub struct EndpointDataReferenceEntryBuilder {
    transfer_process_id: Option<String>,
    asset_id: Option<String>,
    agreement_id: Option<String>,
    provider_id: Option<String>,
    contract_negotiation_id: Option<String>,
    created_at: Option<i64>,
    state: i32,
    state_count: i32,
    state_timestamp: i64,
    error_detail: Option<String>,
}

impl EndpointDataReferenceEntryBuilder {
    pub fn transfer_process_id(mut self, id: impl Into<String>) -> Self {
        self.transfer_process_id = Some(id.into());
        self
    }

    pub fn asset_id(mut self, id: impl Into<String>) -> Self {
        self.asset_id = Some(id.into());
        self
    }

    pub fn agreement_id(mut self, id: impl Into<String>) -> Self {
        self.agreement_id = Some(id.into());
        self
    }

    pub fn provider_id(mut self, id: Option<String>) -> Self {
        self.provider_id = id;
        self
    }

    pub fn contract_negotiation_id(mut self, id: Option<String>) -> Self {
        self.contract_negotiation_id = id;
        self
    }

    pub fn created_at(mut self, millis: i64) -> Self {
        self.created_at = Some(millis);
        self
    }

    pub fn state(mut self, state: i32) -> Self {
        self.state = state;
        self
    }

    pub fn state_timestamp(mut self, millis: i64) -> Self {
        self.state_timestamp = millis;
        self
    }

    pub fn error_detail(mut self, detail: Option<String>) -> Self {
        self.error_detail = detail;
        self
    }

    /// Validates the non-null invariant: transfer process id, asset id and
    /// agreement id must be present and non-empty.
    pub fn build(self) -> Result<EndpointDataReferenceEntry, ValidationError> {
        let transfer_process_id = require(self.transfer_process_id, "transferProcessId")?;
        let asset_id = require(self.asset_id, "assetId")?;
        let agreement_id = require(self.agreement_id, "agreementId")?;
        let created_at = self.created_at.unwrap_or(0);

        Ok(EndpointDataReferenceEntry {
            transfer_process_id,
            asset_id,
            agreement_id,
            provider_id: self.provider_id,
            contract_negotiation_id: self.contract_negotiation_id,
            created_at,
            updated_at: created_at,
            state: self.state,
            state_count: self.state_count,
            state_timestamp: self.state_timestamp,
            error_detail: self.error_detail,
            expiration_timestamp: None,
        })
    }
}

fn require(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}
