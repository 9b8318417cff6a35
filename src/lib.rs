pub mod lease;
pub mod model;
pub mod query;
pub mod service;
pub mod store;
pub mod utils;
pub mod vault;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
