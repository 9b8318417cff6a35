use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ValidationError;

/// Property key carrying the credential lifetime in seconds, relative to the
/// owning entry's `created_at`. Stored as a decimal string like the rest of
/// the opaque property bag.
pub const EDR_PROPERTY_EXPIRES_IN: &str = "expiresIn";

/// The opaque access credential handed to data-plane callers.
///
/// Persisted separately from its entry: the SQL-backed store keeps only the
/// credential id in the relational table and puts this whole record, as a
/// JSON blob, into the injected secret store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDataReference {
    pub id: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_code: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl EndpointDataReference {
    pub fn builder() -> EndpointDataReferenceBuilder {
        EndpointDataReferenceBuilder::default()
    }

    /// Credential lifetime in seconds, when the issuer provided one.
    /// A malformed value is treated as absent, matching a credential that
    /// never expires.
    pub fn expires_in(&self) -> Option<i64> {
        self.properties
            .get(EDR_PROPERTY_EXPIRES_IN)
            .and_then(|raw| raw.parse::<i64>().ok())
    }
}

#[derive(Debug, Default, Clone)]
pub struct EndpointDataReferenceBuilder {
    id: Option<String>,
    endpoint: Option<String>,
    auth_key: Option<String>,
    auth_code: Option<String>,
    properties: HashMap<String, String>,
}

impl EndpointDataReferenceBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn auth_code(mut self, code: impl Into<String>) -> Self {
        self.auth_code = Some(code.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn expires_in(self, seconds: i64) -> Self {
        self.property(EDR_PROPERTY_EXPIRES_IN, seconds.to_string())
    }

    pub fn build(self) -> Result<EndpointDataReference, ValidationError> {
        let id = match self.id {
            Some(v) if !v.is_empty() => v,
            _ => return Err(ValidationError::MissingField("id")),
        };
        let endpoint = match self.endpoint {
            Some(v) if !v.is_empty() => v,
            _ => return Err(ValidationError::MissingField("endpoint")),
        };

        Ok(EndpointDataReference {
            id,
            endpoint,
            auth_key: self.auth_key,
            auth_code: self.auth_code,
            properties: self.properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_in_parses_property() {
        let edr = EndpointDataReference::builder()
            .id("edr1")
            .endpoint("http://provider/data")
            .expires_in(300)
            .build()
            .unwrap();
        assert_eq!(edr.expires_in(), Some(300));
    }

    #[test]
    fn expires_in_absent_or_malformed_is_none() {
        let without = EndpointDataReference::builder()
            .id("edr1")
            .endpoint("http://provider/data")
            .build()
            .unwrap();
        assert_eq!(without.expires_in(), None);

        let malformed = EndpointDataReference::builder()
            .id("edr1")
            .endpoint("http://provider/data")
            .property(EDR_PROPERTY_EXPIRES_IN, "soon")
            .build()
            .unwrap();
        assert_eq!(malformed.expires_in(), None);
    }

    #[test]
    fn build_requires_id_and_endpoint() {
        let result = EndpointDataReference::builder().endpoint("http://x").build();
        assert_eq!(result, Err(ValidationError::MissingField("id")));

        let result = EndpointDataReference::builder().id("edr1").build();
        assert_eq!(result, Err(ValidationError::MissingField("endpoint")));
    }

    #[test]
    fn round_trips_through_json() {
        let edr = EndpointDataReference::builder()
            .id("edr1")
            .endpoint("http://provider/data")
            .auth_key("Authorization")
            .auth_code("token-123")
            .expires_in(60)
            .build()
            .unwrap();

        let json = serde_json::to_string(&edr).unwrap();
        let back: EndpointDataReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, edr);
    }
}
