//! Verification Data Model
//!
//! Session aggregate, stages, scores, document records and the failure
//! taxonomy. The session owns its documents so that a single
//! compare-and-swap covers everything the decision engine reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::cross_validation::CrossValidationResult;
use crate::state_machine::{VerificationEvent, VerificationState};

/// Opaque key/value map produced by OCR or barcode decoding
pub type FieldMap = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Environment / Stage
// ============================================================================

/// Deployment environment a session runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    pub fn is_sandbox(&self) -> bool {
        matches!(self, Self::Sandbox)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }
}

/// A unit of verification work whose completion is tracked independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Front-of-document OCR
    Document,
    /// Back-of-document decode and cross-validation
    CrossValidation,
    /// Selfie face match and liveness
    FaceMatching,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::CrossValidation => "cross_validation",
            Self::FaceMatching => "face_matching",
        }
    }

    /// Classification used when a stage reports failure without a more
    /// specific reason.
    pub fn default_failure(&self) -> FailureClassification {
        match self {
            Self::Document | Self::CrossValidation => FailureClassification::ExtractionFailure,
            Self::FaceMatching => FailureClassification::FaceRecognitionTechnicalError,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Scores
// ============================================================================

/// Scores recorded on a session, each in 0..=1
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBundle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_match: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_validation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_consistency: Option<f64>,
}

impl ScoreBundle {
    pub fn with_face_match(mut self, score: f64) -> Self {
        self.face_match = Some(score);
        self
    }

    pub fn with_liveness(mut self, score: f64) -> Self {
        self.liveness = Some(score);
        self
    }

    pub fn with_cross_validation(mut self, score: f64) -> Self {
        self.cross_validation = Some(score);
        self
    }

    pub fn with_photo_consistency(mut self, score: f64) -> Self {
        self.photo_consistency = Some(score);
        self
    }

    /// Merge a partial bundle: keys present in `partial` overwrite, missing
    /// keys are left untouched. Non-finite values are never merged.
    pub fn merge(&mut self, partial: &ScoreBundle) {
        let finite = |v: Option<f64>| v.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 1.0));
        if let Some(v) = finite(partial.face_match) {
            self.face_match = Some(v);
        }
        if let Some(v) = finite(partial.liveness) {
            self.liveness = Some(v);
        }
        if let Some(v) = finite(partial.cross_validation) {
            self.cross_validation = Some(v);
        }
        if let Some(v) = finite(partial.photo_consistency) {
            self.photo_consistency = Some(v);
        }
    }

    /// First present score that is NaN or infinite, by key
    pub fn non_finite(&self) -> Option<(&'static str, f64)> {
        [
            ("face_match", self.face_match),
            ("liveness", self.liveness),
            ("cross_validation", self.cross_validation),
            ("photo_consistency", self.photo_consistency),
        ]
        .into_iter()
        .find_map(|(key, v)| v.filter(|v| !v.is_finite()).map(|v| (key, v)))
    }

    pub fn is_empty(&self) -> bool {
        self.face_match.is_none()
            && self.liveness.is_none()
            && self.cross_validation.is_none()
            && self.photo_consistency.is_none()
    }

    /// Mean of all present scores
    pub fn confidence(&self) -> Option<f64> {
        let present: Vec<f64> = [
            self.face_match,
            self.liveness,
            self.cross_validation,
            self.photo_consistency,
        ]
        .into_iter()
        .flatten()
        .collect();

        if present.is_empty() {
            None
        } else {
            Some(present.iter().sum::<f64>() / present.len() as f64)
        }
    }
}

// ============================================================================
// Failure taxonomy
// ============================================================================

/// Classified reason a session did not verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClassification {
    DataInconsistencyFraud,
    PhotoMismatchFraud,
    ExtractionFailure,
    FaceNotMatching,
    LivenessFailed,
    FaceRecognitionTechnicalError,
}

impl FailureClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataInconsistencyFraud => "DATA_INCONSISTENCY_FRAUD",
            Self::PhotoMismatchFraud => "PHOTO_MISMATCH_FRAUD",
            Self::ExtractionFailure => "EXTRACTION_FAILURE",
            Self::FaceNotMatching => "FACE_NOT_MATCHING",
            Self::LivenessFailed => "LIVENESS_FAILED",
            Self::FaceRecognitionTechnicalError => "FACE_RECOGNITION_TECHNICAL_ERROR",
        }
    }

    /// Active, positive signal of document/identity mismatch
    pub fn is_fraud(&self) -> bool {
        matches!(self, Self::DataInconsistencyFraud | Self::PhotoMismatchFraud)
    }

    /// Biometric score present but below threshold
    pub fn is_biometric(&self) -> bool {
        matches!(self, Self::FaceNotMatching | Self::LivenessFailed)
    }

    /// Lower value wins when several classifications compete
    pub fn priority(&self) -> u8 {
        match self {
            Self::PhotoMismatchFraud => 0,
            Self::DataInconsistencyFraud => 1,
            Self::FaceNotMatching => 2,
            Self::LivenessFailed => 3,
            Self::ExtractionFailure => 4,
            Self::FaceRecognitionTechnicalError => 5,
        }
    }

    /// Subject-facing explanation, distinct from the internal tag
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::DataInconsistencyFraud => {
                "The information on the front and back of the document does not match"
            }
            Self::PhotoMismatchFraud => {
                "The photos on the front and back of the document do not appear to be the same person"
            }
            Self::ExtractionFailure => {
                "We could not read the document clearly; it has been sent for manual review"
            }
            Self::FaceNotMatching => "The selfie does not match the photo on the document",
            Self::LivenessFailed => "We could not confirm that the selfie was taken live",
            Self::FaceRecognitionTechnicalError => {
                "Face verification could not be completed; it has been sent for manual review"
            }
        }
    }
}

impl std::fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extra context supplied with a recorded error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// The check could not run (collaborator threw / timed out) as opposed to
    /// running and disagreeing.
    #[serde(default)]
    pub technical: bool,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn technical() -> Self {
        Self {
            technical: true,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// A classification attached to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub classification: FailureClassification,
    pub stage: Stage,
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn is_technical(&self) -> bool {
        self.context.technical
    }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentSide {
    Front,
    Back,
}

impl DocumentSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Back => "back",
        }
    }

    /// Stage whose outcome depends on this side
    pub fn stage(&self) -> Stage {
        match self {
            Self::Front => Stage::Document,
            Self::Back => Stage::CrossValidation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Passport,
    DriversLicense,
    NationalId,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Image quality report produced alongside OCR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAnalysis {
    pub is_blurry: bool,
    pub blur_score: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub overall_quality: OverallQuality,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// One uploaded side of an identity document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub side: DocumentSide,
    pub document_type: DocumentType,
    /// Opaque path returned by the image store
    pub image_path: String,
    #[serde(default)]
    pub extracted_fields: FieldMap,
    #[serde(default)]
    pub extracted_codes: FieldMap,
    pub quality_analysis: Option<QualityAnalysis>,
    pub cross_validation_result: Option<CrossValidationResult>,
    pub uploaded_at: DateTime<Utc>,
    /// Set when the extractor or decoder answered, even with no fields
    #[serde(default)]
    pub extracted_at: Option<DateTime<Utc>>,
}

impl DocumentRecord {
    pub fn is_extracted(&self) -> bool {
        self.extracted_at.is_some()
    }

    pub fn new(
        session_id: Uuid,
        side: DocumentSide,
        document_type: DocumentType,
        image_path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            side,
            document_type,
            image_path: image_path.into(),
            extracted_fields: FieldMap::new(),
            extracted_codes: FieldMap::new(),
            quality_analysis: None,
            cross_validation_result: None,
            uploaded_at: Utc::now(),
            extracted_at: None,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Record of a state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: VerificationState,
    pub to: VerificationState,
    /// None for privileged repair transitions
    pub event: Option<VerificationEvent>,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub repaired: bool,
}

/// One verification attempt for one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSession {
    pub id: Uuid,
    pub subject_id: String,
    pub tenant_id: String,
    pub environment: Environment,
    pub status: VerificationState,
    /// Optimistic-concurrency counter, bumped on every successful write
    pub version: u64,
    #[serde(default)]
    pub started_stages: BTreeSet<Stage>,
    #[serde(default)]
    pub completed_stages: BTreeSet<Stage>,
    /// Stages re-run after a document re-upload whose outcome is pending
    #[serde(default)]
    pub reprocessing: BTreeSet<Stage>,
    #[serde(default)]
    pub scores: ScoreBundle,
    #[serde(default)]
    pub documents: BTreeMap<DocumentSide, DocumentRecord>,
    pub failure: Option<FailureRecord>,
    pub manual_review_reason: Option<String>,
    #[serde(default)]
    pub history: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationSession {
    pub fn new(
        id: Uuid,
        subject_id: impl Into<String>,
        tenant_id: impl Into<String>,
        environment: Environment,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            subject_id: subject_id.into(),
            tenant_id: tenant_id.into(),
            environment,
            status: VerificationState::Pending,
            version: 0,
            started_stages: BTreeSet::new(),
            completed_stages: BTreeSet::new(),
            reprocessing: BTreeSet::new(),
            scores: ScoreBundle::default(),
            documents: BTreeMap::new(),
            failure: None,
            manual_review_reason: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn document(&self, side: DocumentSide) -> Option<&DocumentRecord> {
        self.documents.get(&side)
    }

    /// Back-of-document cross-validation is required only once a back
    /// record exists.
    pub fn required_stages(&self) -> BTreeSet<Stage> {
        let mut required = BTreeSet::from([Stage::Document, Stage::FaceMatching]);
        if self.documents.contains_key(&DocumentSide::Back) {
            required.insert(Stage::CrossValidation);
        }
        required
    }

    pub fn all_required_complete(&self) -> bool {
        self.required_stages()
            .iter()
            .all(|s| self.completed_stages.contains(s))
    }

    /// Cross-validation result attached to the back document, if any
    pub fn cross_validation(&self) -> Option<&CrossValidationResult> {
        self.documents
            .get(&DocumentSide::Back)
            .and_then(|d| d.cross_validation_result.as_ref())
    }

    /// Record a state change
    pub fn transition_to(
        &mut self,
        to: VerificationState,
        event: Option<VerificationEvent>,
        repaired: bool,
    ) {
        let from = std::mem::replace(&mut self.status, to);
        let now = Utc::now();
        self.history.push(StateTransition {
            from,
            to,
            event,
            at: now,
            repaired,
        });
        self.updated_at = now;
    }
}

/// Read-only projection returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub session_id: Uuid,
    pub subject_id: String,
    pub status: VerificationState,
    pub is_terminal: bool,
    pub completed_stages: BTreeSet<Stage>,
    pub scores: ScoreBundle,
    pub confidence_score: Option<f64>,
    pub classification: Option<FailureClassification>,
    /// Human-readable explanation for the subject
    pub reason: Option<String>,
    pub manual_review_reason: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&VerificationSession> for VerificationResult {
    fn from(session: &VerificationSession) -> Self {
        let classification = session.failure.as_ref().map(|f| f.classification);
        let reason = match (&session.manual_review_reason, classification) {
            (Some(reason), _) => Some(reason.clone()),
            (None, Some(c)) => Some(c.user_message().to_string()),
            (None, None) => None,
        };

        Self {
            session_id: session.id,
            subject_id: session.subject_id.clone(),
            status: session.status,
            is_terminal: session.is_terminal(),
            completed_stages: session.completed_stages.clone(),
            scores: session.scores,
            confidence_score: session.scores.confidence(),
            classification,
            reason,
            manual_review_reason: session.manual_review_reason.clone(),
            version: session.version,
            updated_at: session.updated_at,
        }
    }
}
