use thiserror::Error;

use cabs_store::StoreError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("configuration has no \"type\" field")]
    MissingType,

    #[error("unknown store type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} configuration: {reason}")]
    InvalidConfig { kind: String, reason: String },

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub(crate) fn invalid(kind: &str, reason: impl ToString) -> Self {
        Self::InvalidConfig {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the configuration itself is at fault, as opposed to a store
    /// failing while it was opened.
    pub fn is_config(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
