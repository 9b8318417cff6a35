pub mod entry;
pub mod reference;

pub use entry::{EndpointDataReferenceEntry, EndpointDataReferenceEntryBuilder, ValidationError};
pub use reference::{EndpointDataReference, EndpointDataReferenceBuilder, EDR_PROPERTY_EXPIRES_IN};
