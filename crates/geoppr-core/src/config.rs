//! Application configuration management.
//!
//! Configuration is stored at `<config_dir>/geoppr/config.json`. Every
//! field is optional; environment variables override the file:
//!
//! - `GEOPPR_API_URL`: API base URL
//! - `GEOPPR_CACHE_STRATEGY`: `ttl` or `session`
//! - `GEOPPR_SESSION_ID`: session id shared by cooperating processes
//! - `GEOPPR_API_TOKEN`: bearer token sent with every request

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::{DEFAULT_API_BASE_URL, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::cache::durable::generate_session_id;
use crate::cache::{DurableStrategy, DEFAULT_TTL_HOURS};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "geoppr";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_API_URL: &str = "GEOPPR_API_URL";
pub const ENV_CACHE_STRATEGY: &str = "GEOPPR_CACHE_STRATEGY";
pub const ENV_SESSION_ID: &str = "GEOPPR_SESSION_ID";
pub const ENV_API_TOKEN: &str = "GEOPPR_API_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategyKind {
    #[default]
    Ttl,
    Session,
}

impl FromStr for CacheStrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ttl" => Ok(CacheStrategyKind::Ttl),
            "session" => Ok(CacheStrategyKind::Session),
            other => Err(anyhow::anyhow!("Unknown cache strategy: {}", other)),
        }
    }
}

impl fmt::Display for CacheStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStrategyKind::Ttl => write!(f, "ttl"),
            CacheStrategyKind::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub cache_strategy: CacheStrategyKind,
    pub ttl_hours: Option<i64>,
    pub session_id: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub cache_dir: Option<PathBuf>,
    #[serde(skip)]
    api_token: Option<String>,
}

impl Config {
    /// Read the config file, if any, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {:?}", path))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Override fields from `lookup`, normally the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var(ENV_API_URL) {
            self.api_base_url = Some(url);
        }
        if let Some(strategy) = var(ENV_CACHE_STRATEGY) {
            match strategy.parse() {
                Ok(kind) => self.cache_strategy = kind,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_CACHE_STRATEGY),
            }
        }
        if let Some(session_id) = var(ENV_SESSION_ID) {
            self.session_id = Some(session_id);
        }
        if let Some(token) = var(ENV_API_TOKEN) {
            self.api_token = Some(token);
        }
    }

    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }

    pub fn api_token(&self) -> Option<String> {
        self.api_token.clone()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// The one durable strategy this process runs with.
    pub fn durable_strategy(&self) -> DurableStrategy {
        match self.cache_strategy {
            CacheStrategyKind::Ttl => DurableStrategy::Ttl {
                ttl: chrono::Duration::hours(
                    self.ttl_hours
                        .filter(|h| *h > 0)
                        .unwrap_or(DEFAULT_TTL_HOURS),
                ),
            },
            CacheStrategyKind::Session => DurableStrategy::SessionBoundary {
                session_id: self.session_id.clone().unwrap_or_else(generate_session_id),
            },
        }
    }
}
