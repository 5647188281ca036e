//! Error types for the verification core
//!
//! Stage-level collaborator failures are NOT represented here: they are
//! converted into a [`FailureClassification`](crate::types::FailureClassification)
//! and attached to the session. The errors below are contract violations and
//! infrastructure failures that the caller has to handle.

use thiserror::Error;
use uuid::Uuid;

use crate::image_store::ImageStoreError;
use crate::state_machine::TransitionError;
use crate::store::StoreError;

/// Main error type for the verification core
#[derive(Error, Debug)]
pub enum IdvError {
    #[error("Verification session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Illegal transition for session {session_id}: {source}")]
    IllegalTransition {
        session_id: Uuid,
        #[source]
        source: TransitionError,
    },

    #[error("Concurrent update conflict on session {session_id} after {attempts} attempts")]
    ConcurrentUpdate { session_id: Uuid, attempts: u32 },

    #[error("Session {session_id} has no {side} document")]
    MissingDocument { session_id: Uuid, side: String },

    #[error("Score {key} for session {session_id} is not a finite number: {value}")]
    InvalidScore {
        session_id: Uuid,
        key: &'static str,
        value: f64,
    },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Image storage error: {0}")]
    ImageStore(#[from] ImageStoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration loading / validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdvError>;
