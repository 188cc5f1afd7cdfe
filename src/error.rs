use thiserror::Error;

use crate::client::version::{Feature, ServerVersion};

/// Typed failures that callers may want to match on. Everything else travels
/// as `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider is not configured")]
    NotConfigured,

    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("{feature} is not supported by PostgreSQL {version}")]
    UnsupportedFeature {
        feature: Feature,
        version: ServerVersion,
    },

    #[error("invalid value for {attribute}: {reason}")]
    InvalidAttribute { attribute: String, reason: String },

    #[error("invalid import ID {id:?}: expected {expected}")]
    InvalidImportId { id: String, expected: &'static str },

    #[error("{0} does not support import")]
    ImportNotSupported(&'static str),
}

impl ProviderError {
    pub fn invalid(attribute: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAttribute {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}
