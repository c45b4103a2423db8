//! REST API access for the infrastructure tables.
//!
//! `InfrastructureSource` is the seam the service loads through; `ApiClient`
//! implements it over HTTP with reqwest.

pub mod client;
pub mod error;
pub mod source;

pub use client::{extract_records, ApiClient, DEFAULT_API_BASE_URL, DEFAULT_REQUEST_TIMEOUT_SECS};
pub use error::ApiError;
pub use source::{InfrastructureSource, UpdateOutcome};
