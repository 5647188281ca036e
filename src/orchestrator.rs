//! Verification Orchestrator
//!
//! Wires the external collaborators into the state manager. Each submission
//! stores the image, runs the collaborator calls under a deadline and turns
//! every collaborator failure into a recorded classification, so the owning
//! stage always completes. Only contract violations are returned as errors.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    with_timeout, BackOfDocumentDecoder, CollaboratorError, DocumentExtractor, ExtractedDocument,
    FaceComparator, LivenessChallenge,
};
use crate::cross_validation::CrossValidationEngine;
use crate::error::{IdvError, Result};
use crate::fallback::{FallbackPipeline, PipelineOutcome};
use crate::image_store::{image_key, ImageStore, ImageStoreError};
use crate::manager::VerificationStateManager;
use crate::types::{
    DocumentRecord, DocumentSide, DocumentType, ErrorContext, FailureClassification, ScoreBundle,
    Stage, VerificationResult,
};

pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// External services the orchestrator calls
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn DocumentExtractor>,
    pub back_decoder: Arc<dyn BackOfDocumentDecoder>,
    pub face_comparator: Arc<dyn FaceComparator>,
}

/// Result of a live capture, with the liveness audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveCaptureOutcome {
    pub result: VerificationResult,
    pub face_match: Option<f64>,
    pub liveness: PipelineOutcome,
}

pub struct VerificationOrchestrator {
    manager: Arc<VerificationStateManager>,
    images: Arc<dyn ImageStore>,
    collaborators: Collaborators,
    cross_validation: CrossValidationEngine,
    liveness: FallbackPipeline,
    timeout: Duration,
}

impl VerificationOrchestrator {
    pub fn new(
        manager: Arc<VerificationStateManager>,
        images: Arc<dyn ImageStore>,
        collaborators: Collaborators,
        liveness: FallbackPipeline,
    ) -> Self {
        let cross_validation = CrossValidationEngine::new(collaborators.face_comparator.clone());
        Self {
            manager,
            images,
            collaborators,
            cross_validation,
            liveness,
            timeout: DEFAULT_COLLABORATOR_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn manager(&self) -> &Arc<VerificationStateManager> {
        &self.manager
    }

    /// Store the front image, OCR it and complete the document stage.
    pub async fn submit_front_document(
        &self,
        session_id: Uuid,
        image: &[u8],
        document_type: DocumentType,
    ) -> Result<VerificationResult> {
        let path = self
            .images
            .store(&image_key(session_id, "front"), image, content_type(image))
            .await?;
        self.manager
            .register_document(
                session_id,
                DocumentRecord::new(session_id, DocumentSide::Front, document_type, path),
            )
            .await?;
        self.manager.begin_stage(session_id, Stage::Document).await?;

        let extracted = with_timeout(
            self.timeout,
            self.collaborators
                .extractor
                .extract_document_fields(image, document_type),
        )
        .await;

        match extracted {
            Ok(extracted) => {
                info!(%session_id, fields = extracted.fields.len(), "front document extracted");
                self.manager
                    .record_extraction(session_id, DocumentSide::Front, extracted)
                    .await?;
                self.manager
                    .complete_stage(session_id, Stage::Document, true)
                    .await?;
            }
            Err(e) => {
                self.manager
                    .record_error(
                        session_id,
                        FailureClassification::ExtractionFailure,
                        Stage::Document,
                        "document text extraction failed",
                        collaborator_context("extract_document_fields", &e),
                    )
                    .await?;
                return self.manager.get_verification_result(session_id).await;
            }
        }

        // The back may have been decoded while OCR was in flight
        self.cross_validate_if_ready(session_id).await?;
        self.manager.get_verification_result(session_id).await
    }

    /// Store the back image, decode it and cross-validate against the front.
    pub async fn submit_back_document(
        &self,
        session_id: Uuid,
        image: &[u8],
    ) -> Result<VerificationResult> {
        let session = self.manager.get_session(session_id).await?;
        let document_type = session
            .document(DocumentSide::Front)
            .map(|d| d.document_type)
            .unwrap_or(DocumentType::Other);

        let path = self
            .images
            .store(&image_key(session_id, "back"), image, content_type(image))
            .await?;
        self.manager
            .register_document(
                session_id,
                DocumentRecord::new(session_id, DocumentSide::Back, document_type, path),
            )
            .await?;
        self.manager
            .begin_stage(session_id, Stage::CrossValidation)
            .await?;

        let decoded = with_timeout(
            self.timeout,
            self.collaborators.back_decoder.decode_back_of_document(image),
        )
        .await;

        match decoded {
            Ok(codes) => {
                info!(%session_id, codes = codes.len(), "back document decoded");
                self.manager
                    .record_extraction(
                        session_id,
                        DocumentSide::Back,
                        ExtractedDocument {
                            fields: codes,
                            quality: None,
                        },
                    )
                    .await?;
            }
            Err(e) => {
                return self
                    .manager
                    .record_error(
                        session_id,
                        FailureClassification::ExtractionFailure,
                        Stage::CrossValidation,
                        "back of document could not be decoded",
                        collaborator_context("decode_back_of_document", &e),
                    )
                    .await;
            }
        }

        self.cross_validate_if_ready(session_id).await?;
        self.manager.get_verification_result(session_id).await
    }

    /// Face-match the selfie against the front photo and run the liveness
    /// pipeline. Both calls run concurrently.
    pub async fn submit_live_capture(
        &self,
        session_id: Uuid,
        selfie: &[u8],
        challenge: Option<LivenessChallenge>,
    ) -> Result<LiveCaptureOutcome> {
        let session = self.manager.get_session(session_id).await?;
        let front_path = session
            .document(DocumentSide::Front)
            .map(|d| d.image_path.clone())
            .ok_or_else(|| IdvError::MissingDocument {
                session_id,
                side: DocumentSide::Front.as_str().to_string(),
            })?;

        self.images
            .store(&image_key(session_id, "selfie"), selfie, content_type(selfie))
            .await?;
        let front_image = self.images.fetch(&front_path).await?;

        self.manager
            .begin_stage(session_id, Stage::FaceMatching)
            .await?;

        let (face, liveness) = tokio::join!(
            with_timeout(
                self.timeout,
                self.collaborators.face_comparator.compare_faces(selfie, &front_image),
            ),
            self.liveness.run(selfie, challenge.as_ref()),
        );

        let face = face.and_then(|score| {
            if score.is_finite() {
                Ok(score.clamp(0.0, 1.0))
            } else {
                Err(CollaboratorError::InvalidOutput(format!(
                    "face similarity is not finite: {}",
                    score
                )))
            }
        });

        let mut scores = ScoreBundle::default();
        if let Ok(score) = face {
            scores = scores.with_face_match(score);
        }
        if let Some(confidence) = liveness.confidence {
            scores = scores.with_liveness(confidence);
        }
        if !scores.is_empty() {
            self.manager.update_scores(session_id, scores).await?;
        }

        let result = match (&face, liveness.confidence) {
            (Err(e), _) => {
                self.manager
                    .record_error(
                        session_id,
                        FailureClassification::FaceRecognitionTechnicalError,
                        Stage::FaceMatching,
                        "face comparison failed",
                        collaborator_context("compare_faces", e),
                    )
                    .await?
            }
            (Ok(_), None) => {
                let layers = serde_json::to_value(&liveness.layers).unwrap_or_default();
                self.manager
                    .record_error(
                        session_id,
                        FailureClassification::FaceRecognitionTechnicalError,
                        Stage::FaceMatching,
                        "no liveness layer produced a usable signal",
                        ErrorContext::technical().with_detail("layers", layers),
                    )
                    .await?
            }
            (Ok(_), Some(_)) => {
                self.manager
                    .complete_stage(session_id, Stage::FaceMatching, true)
                    .await?
            }
        };

        Ok(LiveCaptureOutcome {
            result,
            face_match: face.ok(),
            liveness,
        })
    }

    async fn fetch_pair(
        &self,
        front_path: &str,
        back_path: &str,
    ) -> std::result::Result<(Vec<u8>, Vec<u8>), ImageStoreError> {
        let front = self.images.fetch(front_path).await?;
        let back = self.images.fetch(back_path).await?;
        Ok((front, back))
    }

    /// Run text and photo cross-validation once both sides are extracted.
    async fn cross_validate_if_ready(&self, session_id: Uuid) -> Result<()> {
        let session = self.manager.get_session(session_id).await?;

        if session.completed_stages.contains(&Stage::CrossValidation) {
            return Ok(());
        }
        let (Some(front), Some(back)) = (
            session.document(DocumentSide::Front),
            session.document(DocumentSide::Back),
        ) else {
            return Ok(());
        };
        // An empty decode still counts: cross_validate flags it for review
        if !session.completed_stages.contains(&Stage::Document) || !back.is_extracted() {
            debug!(%session_id, "cross-validation waiting for both sides");
            return Ok(());
        }

        let result = self
            .cross_validation
            .cross_validate(&front.extracted_fields, &back.extracted_codes);
        info!(
            %session_id,
            match_score = result.match_score,
            discrepancies = result.discrepancies.len(),
            requires_manual_review = result.requires_manual_review,
            "documents cross-validated"
        );

        let photo = match self.fetch_pair(&front.image_path, &back.image_path).await {
            Ok((front_image, back_image)) => {
                with_timeout(
                    self.timeout,
                    self.cross_validation.compare_photos(&front_image, &back_image),
                )
                .await
            }
            Err(e) => {
                error!(%session_id, error = %e, "document images unavailable for photo comparison");
                Err(CollaboratorError::Unavailable(format!("image store: {}", e)))
            }
        };

        let mut scores = ScoreBundle::default().with_cross_validation(result.match_score);
        self.manager
            .record_cross_validation(session_id, result)
            .await?;

        match photo {
            Ok(similarity) => {
                scores = scores.with_photo_consistency(similarity);
                self.manager.update_scores(session_id, scores).await?;
                self.manager
                    .complete_stage(session_id, Stage::CrossValidation, true)
                    .await?;
            }
            Err(e) => {
                // Fail closed: the fraud check is never skipped
                warn!(%session_id, error = %e, "document photo comparison failed");
                self.manager.update_scores(session_id, scores).await?;
                self.manager
                    .record_error(
                        session_id,
                        FailureClassification::PhotoMismatchFraud,
                        Stage::CrossValidation,
                        "document photo comparison could not be completed",
                        collaborator_context("compare_faces", &e),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn collaborator_context(operation: &str, error: &CollaboratorError) -> ErrorContext {
    ErrorContext::technical()
        .with_detail("operation", json!(operation))
        .with_detail("error", json!(error.to_string()))
}

fn content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else if bytes.starts_with(b"P6") {
        "image/x-portable-pixmap"
    } else {
        "application/octet-stream"
    }
}
