//! Decision Engine
//!
//! Pure derivation of a session's status from its recorded facts: documents,
//! started/completed stages, scores, attached failure and manual override.
//! The same function serves live evaluation in the manager and re-derivation
//! in the consistency monitor, so both always agree on what a session implies.
//!
//! Precedence, highest first:
//! 1. manual override
//! 2. fraud signals (attached or score-derived) -> FAILED
//! 3. other attached classifications (technical / extraction -> MANUAL_REVIEW,
//!    biometric -> FAILED)
//! 4. not all required stages complete -> in-progress state
//! 5. biometric score below threshold -> FAILED
//! 6. cross-validation extraction unreliable -> MANUAL_REVIEW
//! 7. VERIFIED

use serde::{Deserialize, Serialize};

use crate::state_machine::VerificationState;
use crate::thresholds::{validate_scores, DecisionPolicy, PhotoCheckErrorPolicy, ScoreCheck, ScoreValidation};
use crate::types::{DocumentSide, FailureClassification, FailureRecord, Stage, VerificationSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    ManualOverride,
    FraudSignal,
    RecordedFailure,
    InProgress,
    ScoreThreshold,
    UnreliableExtraction,
    AllChecksPassed,
}

/// Outcome of evaluating a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub status: VerificationState,
    pub classification: Option<FailureClassification>,
    /// Stage the classification belongs to
    pub stage: Option<Stage>,
    pub source: DecisionSource,
    pub validation: ScoreValidation,
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn new(
        status: VerificationState,
        classification: Option<FailureClassification>,
        stage: Option<Stage>,
        source: DecisionSource,
        validation: ScoreValidation,
    ) -> Self {
        Self {
            status,
            classification,
            stage,
            source,
            validation,
        }
    }
}

/// Status a recorded failure resolves to on its own
pub fn resolve_failure(failure: &FailureRecord, policy: &DecisionPolicy) -> VerificationState {
    let c = failure.classification;
    if c.is_fraud() {
        if failure.is_technical() && policy.photo_check_error == PhotoCheckErrorPolicy::ManualReview {
            VerificationState::ManualReview
        } else {
            VerificationState::Failed
        }
    } else if c.is_biometric() {
        VerificationState::Failed
    } else {
        VerificationState::ManualReview
    }
}

/// Evaluate a session against a policy
pub fn evaluate(session: &VerificationSession, policy: &DecisionPolicy) -> Decision {
    let validation = validate_scores(&session.scores, &policy.thresholds);
    let attached = session.failure.as_ref();

    if session.manual_review_reason.is_some() {
        return Decision::new(
            VerificationState::ManualReview,
            attached.map(|f| f.classification),
            attached.map(|f| f.stage),
            DecisionSource::ManualOverride,
            validation,
        );
    }

    let extraction_unreliable = session
        .cross_validation()
        .map(|r| r.requires_manual_review)
        .unwrap_or(false);

    // Fraud signals
    let mut fraud: Vec<(FailureClassification, Stage)> = Vec::new();
    if let Some(f) = attached {
        if f.classification.is_fraud() && resolve_failure(f, policy) == VerificationState::Failed {
            fraud.push((f.classification, f.stage));
        }
    }
    if validation.failed(ScoreCheck::PhotoConsistency) {
        fraud.push((FailureClassification::PhotoMismatchFraud, Stage::CrossValidation));
    }
    if validation.failed(ScoreCheck::CrossValidation) && !extraction_unreliable {
        fraud.push((FailureClassification::DataInconsistencyFraud, Stage::CrossValidation));
    }
    if let Some((classification, stage)) = fraud.into_iter().min_by_key(|(c, _)| c.priority()) {
        return Decision::new(
            VerificationState::Failed,
            Some(classification),
            Some(stage),
            DecisionSource::FraudSignal,
            validation,
        );
    }

    if let Some(f) = attached {
        return Decision::new(
            resolve_failure(f, policy),
            Some(f.classification),
            Some(f.stage),
            DecisionSource::RecordedFailure,
            validation,
        );
    }

    if !session.all_required_complete() {
        return Decision::new(
            derive_progress(session),
            None,
            None,
            DecisionSource::InProgress,
            validation,
        );
    }

    if validation.failed(ScoreCheck::FaceMatch) {
        return Decision::new(
            VerificationState::Failed,
            Some(FailureClassification::FaceNotMatching),
            Some(Stage::FaceMatching),
            DecisionSource::ScoreThreshold,
            validation,
        );
    }
    if validation.failed(ScoreCheck::Liveness) {
        return Decision::new(
            VerificationState::Failed,
            Some(FailureClassification::LivenessFailed),
            Some(Stage::FaceMatching),
            DecisionSource::ScoreThreshold,
            validation,
        );
    }

    if extraction_unreliable {
        return Decision::new(
            VerificationState::ManualReview,
            Some(FailureClassification::ExtractionFailure),
            Some(Stage::CrossValidation),
            DecisionSource::UnreliableExtraction,
            validation,
        );
    }

    Decision::new(
        VerificationState::Verified,
        None,
        None,
        DecisionSource::AllChecksPassed,
        validation,
    )
}

/// In-progress state implied by the recorded facts.
///
/// Monotone in the facts: stage sets and scores only ever grow, so the
/// derived state never moves backwards.
pub fn derive_progress(session: &VerificationSession) -> VerificationState {
    let touched = |stage: Stage| {
        session.started_stages.contains(&stage) || session.completed_stages.contains(&stage)
    };
    let scores = &session.scores;

    if touched(Stage::FaceMatching) || scores.face_match.is_some() || scores.liveness.is_some() {
        if scores.liveness.is_some() {
            VerificationState::LivenessChecking
        } else if scores.face_match.is_some() {
            VerificationState::FaceMatching
        } else {
            VerificationState::LiveCaptureProcessing
        }
    } else if session.completed_stages.contains(&Stage::CrossValidation) {
        VerificationState::CrossValidationCompleted
    } else if touched(Stage::CrossValidation) || session.documents.contains_key(&DocumentSide::Back)
    {
        VerificationState::BackIdProcessing
    } else if session.completed_stages.contains(&Stage::Document) {
        VerificationState::OcrCompleted
    } else if session.started_stages.contains(&Stage::Document) {
        VerificationState::OcrProcessing
    } else if session.documents.contains_key(&DocumentSide::Front) {
        VerificationState::DocumentUploaded
    } else {
        VerificationState::Pending
    }
}
