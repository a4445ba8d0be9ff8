//! Shared building blocks of the FalconDB schema-change controller: ids,
//! catalog object model, error taxonomy and node configuration.

pub mod config;
pub mod error;
pub mod schema;
pub mod types;
