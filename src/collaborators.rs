//! External Collaborators
//!
//! Interfaces for the OCR engine, barcode decoder, face comparison and
//! liveness models. Implementations live outside this crate; the core only
//! relies on these signatures and treats every call as fallible.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{DocumentType, FieldMap, QualityAnalysis};

/// Error type for collaborator calls
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator call failed: {0}")]
    Failed(String),

    #[error("Collaborator timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Invalid collaborator output: {0}")]
    InvalidOutput(String),
}

/// OCR output for one document side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub fields: FieldMap,
    pub quality: Option<QualityAnalysis>,
}

/// Optional challenge issued to the subject during live capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessChallenge {
    pub token: String,
    pub instruction: String,
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract_document_fields(
        &self,
        image: &[u8],
        document_type: DocumentType,
    ) -> Result<ExtractedDocument, CollaboratorError>;
}

/// PDF417 / barcode decoder for the back of a document
#[async_trait]
pub trait BackOfDocumentDecoder: Send + Sync {
    async fn decode_back_of_document(&self, image: &[u8]) -> Result<FieldMap, CollaboratorError>;
}

#[async_trait]
pub trait FaceComparator: Send + Sync {
    /// Similarity in 0..=1
    async fn compare_faces(&self, image_a: &[u8], image_b: &[u8]) -> Result<f64, CollaboratorError>;
}

#[async_trait]
pub trait LivenessDetector: Send + Sync {
    /// Liveness score in 0..=1
    async fn detect_liveness(
        &self,
        image: &[u8],
        challenge: Option<&LivenessChallenge>,
    ) -> Result<f64, CollaboratorError>;
}

/// Run a collaborator future with a deadline so no stage blocks forever.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, CollaboratorError>
where
    F: std::future::Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::TimedOut(limit)),
    }
}
