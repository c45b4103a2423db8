//! GeoPPR core - acquisition, aggregation and caching of infrastructure data.
//!
//! Consumers hold an [`InfrastructureService`] and call
//! [`get_data`](InfrastructureService::get_data). The service reads the
//! memory tier, then the durable tier, and otherwise runs one single-flight
//! load of the fourteen dashboard collections shared by every caller.

pub mod aggregation;
pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod models;
pub mod service;
pub mod utils;

pub use aggregation::{aggregate, aggregate_with_report, AggregationReport};
pub use api::{ApiClient, ApiError, InfrastructureSource, UpdateOutcome};
pub use cache::{DurableCache, DurableStrategy, EphemeralCache};
pub use config::{CacheStrategyKind, Config};
pub use coordinator::{Acquire, LoadCoordinator, LoadGuard, LoadPending};
pub use models::{
    GlobalStats, PisteAggregate, PisteFilter, ProcessedData, RawCollectionSet, Record,
    ResourceType,
};
pub use service::{
    CacheStatus, DataSnapshot, DataSource, InfrastructureService, Liveness, LoadError,
    LoadProgress, LoadState, LoadedDataset,
};
