use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::models::{Record, ResourceType};

/// Upstream the service loads from and writes back to.
///
/// `ApiClient` is the production implementation; tests plug in an
/// in-memory source.
pub trait InfrastructureSource: Send + Sync + 'static {
    /// Every record of one collection.
    fn fetch_collection(
        &self,
        resource: ResourceType,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send;

    /// Apply `fields` to the record `fid` of `resource`.
    ///
    /// A rejection by the server is an `Ok(UpdateOutcome::Rejected)`; only
    /// transport failures are errors.
    fn update_record(
        &self,
        resource: ResourceType,
        fid: &str,
        fields: &Map<String, Value>,
    ) -> impl Future<Output = Result<UpdateOutcome>> + Send;
}

impl<T: InfrastructureSource> InfrastructureSource for Arc<T> {
    fn fetch_collection(
        &self,
        resource: ResourceType,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send {
        (**self).fetch_collection(resource)
    }

    fn update_record(
        &self,
        resource: ResourceType,
        fid: &str,
        fields: &Map<String, Value>,
    ) -> impl Future<Output = Result<UpdateOutcome>> + Send {
        (**self).update_record(resource, fid, fields)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied {
        fid: Option<String>,
        updated_fields: Vec<String>,
        message: Option<String>,
    },
    Rejected {
        error: String,
    },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// Wire shape of the update endpoint's reply.
#[derive(Debug, Deserialize)]
pub(crate) struct UpdateEnvelope {
    success: bool,
    #[serde(default)]
    fid: Option<Value>,
    #[serde(default)]
    updated_fields: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<UpdateEnvelope> for UpdateOutcome {
    fn from(envelope: UpdateEnvelope) -> Self {
        if !envelope.success {
            return UpdateOutcome::Rejected {
                error: envelope
                    .error
                    .or(envelope.message)
                    .unwrap_or_else(|| "update rejected".to_string()),
            };
        }

        // Servers answer with either a list of names or the patched object
        let updated_fields = match envelope.updated_fields {
            Some(Value::Array(names)) => names
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::Object(fields)) => fields.keys().cloned().collect(),
            _ => Vec::new(),
        };

        UpdateOutcome::Applied {
            fid: envelope.fid.as_ref().and_then(crate::models::record::identifier),
            updated_fields,
            message: envelope.message,
        }
    }
}
