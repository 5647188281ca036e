//! Verification State Machine
//!
//! Canonical states and legal transitions for a single verification session.
//! Transitions are keyed by `(state, event)`; anything not in the table is an
//! explicit [`TransitionError`], never a silent no-op. The only way out of a
//! terminal state is [`repair`], which is reserved for the consistency monitor
//! and operator recalculation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationState {
    Pending,
    DocumentUploaded,
    OcrProcessing,
    OcrCompleted,
    BackIdProcessing,
    CrossValidationCompleted,
    LiveCaptureProcessing,
    FaceMatching,
    LivenessChecking,
    Verified,
    Failed,
    ManualReview,
}

impl VerificationState {
    pub const ALL: [VerificationState; 12] = [
        Self::Pending,
        Self::DocumentUploaded,
        Self::OcrProcessing,
        Self::OcrCompleted,
        Self::BackIdProcessing,
        Self::CrossValidationCompleted,
        Self::LiveCaptureProcessing,
        Self::FaceMatching,
        Self::LivenessChecking,
        Self::Verified,
        Self::Failed,
        Self::ManualReview,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::ManualReview)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::DocumentUploaded => "DOCUMENT_UPLOADED",
            Self::OcrProcessing => "OCR_PROCESSING",
            Self::OcrCompleted => "OCR_COMPLETED",
            Self::BackIdProcessing => "BACK_ID_PROCESSING",
            Self::CrossValidationCompleted => "CROSS_VALIDATION_COMPLETED",
            Self::LiveCaptureProcessing => "LIVE_CAPTURE_PROCESSING",
            Self::FaceMatching => "FACE_MATCHING",
            Self::LivenessChecking => "LIVENESS_CHECKING",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
            Self::ManualReview => "MANUAL_REVIEW",
        }
    }
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for VerificationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Unknown verification state: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationEvent {
    DocumentUploaded,
    OcrStarted,
    OcrCompleted,
    BackIdStarted,
    CrossValidationCompleted,
    LiveCaptureStarted,
    FaceMatchingStarted,
    LivenessCheckStarted,
    Verified,
    Failed,
    ManualReviewRequired,
}

impl VerificationEvent {
    pub const ALL: [VerificationEvent; 11] = [
        Self::DocumentUploaded,
        Self::OcrStarted,
        Self::OcrCompleted,
        Self::BackIdStarted,
        Self::CrossValidationCompleted,
        Self::LiveCaptureStarted,
        Self::FaceMatchingStarted,
        Self::LivenessCheckStarted,
        Self::Verified,
        Self::Failed,
        Self::ManualReviewRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentUploaded => "document_uploaded",
            Self::OcrStarted => "ocr_started",
            Self::OcrCompleted => "ocr_completed",
            Self::BackIdStarted => "back_id_started",
            Self::CrossValidationCompleted => "cross_validation_completed",
            Self::LiveCaptureStarted => "live_capture_started",
            Self::FaceMatchingStarted => "face_matching_started",
            Self::LivenessCheckStarted => "liveness_check_started",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::ManualReviewRequired => "manual_review_required",
        }
    }
}

impl std::fmt::Display for VerificationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("event '{event}' is not valid from state {from}")]
    Illegal {
        from: VerificationState,
        event: VerificationEvent,
    },

    #[error("state {from} is terminal")]
    Terminal { from: VerificationState },

    #[error("no route from {from} to {to}")]
    NoRoute {
        from: VerificationState,
        to: VerificationState,
    },
}

/// Total transition function over `(state, event)`.
pub fn transition(
    from: VerificationState,
    event: VerificationEvent,
) -> Result<VerificationState, TransitionError> {
    use VerificationEvent as E;
    use VerificationState as S;

    if from.is_terminal() {
        return Err(TransitionError::Terminal { from });
    }

    let next = match (from, event) {
        (_, E::ManualReviewRequired) => Some(S::ManualReview),
        (_, E::Failed) => Some(S::Failed),

        (S::Pending, E::DocumentUploaded) => Some(S::DocumentUploaded),
        (S::DocumentUploaded, E::OcrStarted) => Some(S::OcrProcessing),
        (S::OcrProcessing, E::OcrCompleted) => Some(S::OcrCompleted),
        (S::OcrCompleted, E::BackIdStarted) => Some(S::BackIdProcessing),
        (S::BackIdProcessing, E::CrossValidationCompleted) => Some(S::CrossValidationCompleted),

        // Back of document is optional and the two uploads are independent,
        // so live capture may start while the back scan is still in flight.
        (S::OcrCompleted | S::BackIdProcessing | S::CrossValidationCompleted, E::LiveCaptureStarted) => {
            Some(S::LiveCaptureProcessing)
        }
        (S::LiveCaptureProcessing, E::FaceMatchingStarted) => Some(S::FaceMatching),
        (S::FaceMatching, E::LivenessCheckStarted) => Some(S::LivenessChecking),
        (S::LivenessChecking, E::Verified) => Some(S::Verified),

        _ => None,
    };

    next.ok_or(TransitionError::Illegal { from, event })
}

/// Shortest sequence of legal events leading from `from` to `to`.
///
/// Returns an empty route when already there.
pub fn plan_route(
    from: VerificationState,
    to: VerificationState,
) -> Result<Vec<VerificationEvent>, TransitionError> {
    if from == to {
        return Ok(Vec::new());
    }
    if from.is_terminal() {
        return Err(TransitionError::Terminal { from });
    }

    let mut came_from: HashMap<VerificationState, (VerificationState, VerificationEvent)> =
        HashMap::new();
    let mut queue = VecDeque::from([from]);

    while let Some(state) = queue.pop_front() {
        for event in VerificationEvent::ALL {
            let Ok(next) = transition(state, event) else {
                continue;
            };
            if next == from || came_from.contains_key(&next) {
                continue;
            }
            came_from.insert(next, (state, event));
            if next == to {
                let mut route = Vec::new();
                let mut cursor = to;
                while cursor != from {
                    let (prev, ev) = came_from[&cursor];
                    route.push(ev);
                    cursor = prev;
                }
                route.reverse();
                return Ok(route);
            }
            queue.push_back(next);
        }
    }

    Err(TransitionError::NoRoute { from, to })
}

/// Privileged transition used by consistency repair; bypasses the guard.
pub fn repair(from: VerificationState, to: VerificationState) -> VerificationState {
    if from != to {
        tracing::debug!(%from, %to, "privileged state repair");
    }
    to
}
