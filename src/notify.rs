//! Status notifications
//!
//! Emitted when a session's terminal status is set or changed by repair.
//! Delivery failures are logged and never fail the mutation that caused them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::collaborators::CollaboratorError;
use crate::state_machine::VerificationState;
use crate::types::{FailureClassification, VerificationSession};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub event_type: String,
    pub session_id: Uuid,
    pub subject_id: String,
    pub tenant_id: String,
    pub status: VerificationState,
    pub classification: Option<FailureClassification>,
    pub confidence_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl StatusNotification {
    pub fn from_session(session: &VerificationSession) -> Self {
        Self {
            event_type: format!("verification.{}", session.status.as_str().to_lowercase()),
            session_id: session.id,
            subject_id: session.subject_id.clone(),
            tenant_id: session.tenant_id.clone(),
            status: session.status,
            classification: session.failure.as_ref().map(|f| f.classification),
            confidence_score: session.scores.confidence(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, notification: &StatusNotification) -> Result<(), CollaboratorError>;
}

/// Logs notifications; the default when no delivery channel is configured
pub struct TracingNotifier;

#[async_trait]
impl StatusNotifier for TracingNotifier {
    async fn notify(&self, notification: &StatusNotification) -> Result<(), CollaboratorError> {
        info!(
            session_id = %notification.session_id,
            status = %notification.status,
            event_type = %notification.event_type,
            "verification status notification"
        );
        Ok(())
    }
}

/// Collects notifications in memory
#[derive(Default)]
pub struct RecordingNotifier {
    sent: tokio::sync::Mutex<Vec<StatusNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<StatusNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn notify(&self, notification: &StatusNotification) -> Result<(), CollaboratorError> {
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Environment, ScoreBundle};

    #[test]
    fn test_notification_payload() {
        let mut session =
            VerificationSession::new(Uuid::new_v4(), "user-9", "tenant", Environment::Production);
        session.status = VerificationState::Verified;
        session.scores = ScoreBundle::default().with_face_match(0.9).with_liveness(0.8);

        let n = StatusNotification::from_session(&session);
        assert_eq!(n.event_type, "verification.verified");
        assert_eq!(n.subject_id, "user-9");
        assert!((n.confidence_score.unwrap() - 0.85).abs() < 1e-9);
    }
}
