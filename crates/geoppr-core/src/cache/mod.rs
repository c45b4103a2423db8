//! Cache tiers for infrastructure data.
//!
//! Reads go through the tiers in precedence order:
//!
//! 1. `EphemeralCache`: in-process, no expiry, cleared explicitly
//! 2. `DurableCache`: JSON files on disk, TTL or session-boundary invalidation
//!
//! The durable tier holds one entry per logical name plus a small metadata
//! record used for cheap existence checks.

pub mod durable;
pub mod entry;
pub mod ephemeral;

pub use durable::{DurableCache, DurableStrategy, DEFAULT_TTL_HOURS};
pub use entry::{age_display, CacheEntry};
pub use ephemeral::EphemeralCache;

/// Durable key of the raw collections.
pub const INFRASTRUCTURE_DATA: &str = "infrastructure_data";

/// Durable key of the aggregated views.
pub const PROCESSED_DATA: &str = "processed_data";

/// Durable key of the dataset metadata record.
pub const METADATA: &str = "infrastructure_data_metadata";

/// Ephemeral key of the loaded dataset.
pub const DATASET: &str = "dataset";
