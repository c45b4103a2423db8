//! Data models for GeoPPR infrastructure data.
//!
//! This module contains:
//!
//! - `ResourceType`: the API tables, dashboard and map-only
//! - `Record`, `RawCollectionSet`, `PropertyBag`: raw records and tolerant lookup
//! - `PisteAggregate`, `GlobalStats`, `ProcessedData`: derived views
//! - `PisteFilter`: typed filter state for consumers

pub mod dashboard;
pub mod filter;
pub mod record;
pub mod resource;

pub use dashboard::{ChausseeTally, DatasetMetadata, GlobalStats, PisteAggregate, PisteCounts, ProcessedData};
pub use filter::PisteFilter;
pub use record::{PropertyBag, RawCollectionSet, Record, UNASSIGNED_OWNER, UNKNOWN_COMMUNE};
pub use resource::{ResourceType, UnknownResourceType};
