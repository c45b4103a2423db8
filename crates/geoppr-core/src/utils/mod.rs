//! Utility functions for display formatting.

pub mod format;

pub use format::{format_date, format_km, pad_right, truncate_string};
