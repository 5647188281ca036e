//! Verification State Manager
//!
//! Stage tracking on top of the state machine. Every mutation is a
//! read-modify-write against the session store guarded by the session
//! version; on conflict the whole mutation is re-applied to a fresh read.
//! After each mutation the decision engine re-derives the status from the
//! recorded facts, so evaluation does not depend on the order in which
//! external results arrived.
//!
//! Terminal sessions: VERIFIED and FAILED accept no new facts except stage
//! completion (the completed set only grows). MANUAL_REVIEW sessions keep
//! collecting evidence for the reviewer but their status is not changed here,
//! with one exception: a re-uploaded document whose stage then succeeds
//! supersedes the classification that sent the session to review, and the
//! session is reopened at the state its facts imply. Any other change to a
//! terminal status is reserved for
//! [`recalculate_consistent_scores`](VerificationStateManager::recalculate_consistent_scores).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::ExtractedDocument;
use crate::cross_validation::CrossValidationResult;
use crate::decision::{derive_progress, evaluate, Decision, DecisionSource};
use crate::error::{IdvError, Result};
use crate::notify::{StatusNotification, StatusNotifier, TracingNotifier};
use crate::state_machine::{self, plan_route, transition, TransitionError, VerificationEvent, VerificationState};
use crate::store::SessionStore;
use crate::thresholds::{DecisionPolicy, ScoreCheck, ThresholdProvider};
use crate::types::{
    DocumentRecord, DocumentSide, Environment, ErrorContext, FailureClassification, FailureRecord,
    ScoreBundle, Stage, VerificationResult, VerificationSession,
};

/// Default bound on optimistic-concurrency retries
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 8;

/// Result of re-deriving a stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recalculation {
    pub session_id: Uuid,
    pub stored_status: VerificationState,
    pub derived_status: VerificationState,
    pub derived_classification: Option<FailureClassification>,
    pub outcome: RecalculationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalculationOutcome {
    Consistent,
    Repaired,
    /// Another writer got there first; not retried
    Conflict,
    /// Stored status is terminal but the recorded facts do not reach a
    /// decision; left for an operator rather than reopened
    Indeterminate,
}

pub struct VerificationStateManager {
    store: Arc<dyn SessionStore>,
    thresholds: Arc<ThresholdProvider>,
    notifier: Arc<dyn StatusNotifier>,
    max_cas_attempts: u32,
}

impl VerificationStateManager {
    pub fn new(store: Arc<dyn SessionStore>, thresholds: Arc<ThresholdProvider>) -> Self {
        Self {
            store,
            thresholds,
            notifier: Arc::new(TracingNotifier),
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn policy_for(&self, session: &VerificationSession) -> DecisionPolicy {
        self.thresholds.resolve(&session.tenant_id, session.environment)
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Create a session in PENDING. Idempotent per `session_id`.
    pub async fn initialize_verification(
        &self,
        session_id: Uuid,
        subject_id: &str,
        tenant_id: &str,
        environment: Environment,
    ) -> Result<VerificationResult> {
        let session = VerificationSession::new(session_id, subject_id, tenant_id, environment);

        if self.store.insert(&session).await? {
            info!(%session_id, tenant_id, environment = environment.as_str(), "verification initialized");
            return Ok(VerificationResult::from(&session));
        }

        debug!(%session_id, "verification already initialized");
        self.get_verification_result(session_id).await
    }

    /// Merge any subset of scores; missing keys are left untouched.
    pub async fn update_scores(
        &self,
        session_id: Uuid,
        partial: ScoreBundle,
    ) -> Result<VerificationResult> {
        // A NaN is a collaborator fault, never a failed check
        if let Some((key, value)) = partial.non_finite() {
            warn!(%session_id, key, value, "rejecting non-finite score");
            return Err(IdvError::InvalidScore {
                session_id,
                key,
                value,
            });
        }

        self.mutate(session_id, "update_scores", |s| {
            if closed_to_new_facts(s) {
                warn!(%session_id, status = %s.status, "ignoring late scores for terminal session");
                return Ok(());
            }
            s.scores.merge(&partial);
            Ok(())
        })
        .await
    }

    /// Mark a stage as in flight
    pub async fn begin_stage(&self, session_id: Uuid, stage: Stage) -> Result<VerificationResult> {
        self.mutate(session_id, "begin_stage", |s| {
            if !s.is_terminal() {
                s.started_stages.insert(stage);
            }
            Ok(())
        })
        .await
    }

    /// Mark a stage complete. A failed stage is routed to [`record_error`](Self::record_error)
    /// with the stage's default classification.
    pub async fn complete_stage(
        &self,
        session_id: Uuid,
        stage: Stage,
        success: bool,
    ) -> Result<VerificationResult> {
        if !success {
            return self
                .record_error(
                    session_id,
                    stage.default_failure(),
                    stage,
                    &format!("{} stage reported failure", stage),
                    ErrorContext::default(),
                )
                .await;
        }

        self.mutate(session_id, "complete_stage", |s| {
            s.completed_stages.insert(stage);
            if s.reprocessing.remove(&stage) {
                supersede_failure(s, stage);
            }
            Ok(())
        })
        .await
    }

    /// Attach a classification and mark the owning stage complete.
    ///
    /// The stage is completed even though it failed so that nothing
    /// downstream can wait on it forever.
    pub async fn record_error(
        &self,
        session_id: Uuid,
        classification: FailureClassification,
        stage: Stage,
        message: &str,
        context: ErrorContext,
    ) -> Result<VerificationResult> {
        error!(
            %session_id,
            %classification,
            %stage,
            technical = context.technical,
            detail = message,
            "verification stage error"
        );

        self.mutate(session_id, "record_error", |s| {
            s.completed_stages.insert(stage);
            s.reprocessing.remove(&stage);

            if closed_to_new_facts(s) {
                warn!(%session_id, status = %s.status, "session terminal; classification not attached");
                return Ok(());
            }

            let record = FailureRecord {
                classification,
                stage,
                message: message.to_string(),
                context: context.clone(),
                recorded_at: Utc::now(),
            };
            attach_failure(s, record);
            Ok(())
        })
        .await
    }

    pub async fn get_verification_result(&self, session_id: Uuid) -> Result<VerificationResult> {
        let session = self.load(session_id).await?;
        Ok(VerificationResult::from(&session))
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<VerificationSession> {
        self.load(session_id).await
    }

    /// Attach (or replace, on re-upload) a document side
    pub async fn register_document(
        &self,
        session_id: Uuid,
        record: DocumentRecord,
    ) -> Result<VerificationResult> {
        self.mutate(session_id, "register_document", |s| {
            if closed_to_new_facts(s) {
                warn!(%session_id, side = record.side.as_str(), "ignoring document for terminal session");
                return Ok(());
            }
            let mut record = record.clone();
            record.session_id = session_id;
            let stage = record.side.stage();
            if let Some(previous) = s.documents.insert(record.side, record) {
                info!(%session_id, side = previous.side.as_str(), previous_id = %previous.id, "document re-uploaded");
                // The old classification stands until the stage reports again
                if s.failure.as_ref().is_some_and(|f| f.stage == stage) {
                    s.reprocessing.insert(stage);
                }
            }
            Ok(())
        })
        .await
    }

    /// Store OCR output (front) or decoded codes (back) on a document record
    pub async fn record_extraction(
        &self,
        session_id: Uuid,
        side: DocumentSide,
        extracted: ExtractedDocument,
    ) -> Result<VerificationResult> {
        self.mutate(session_id, "record_extraction", |s| {
            if closed_to_new_facts(s) {
                return Ok(());
            }
            let doc = s.documents.get_mut(&side).ok_or_else(|| IdvError::MissingDocument {
                session_id,
                side: side.as_str().to_string(),
            })?;
            match side {
                DocumentSide::Front => doc.extracted_fields = extracted.fields.clone(),
                DocumentSide::Back => doc.extracted_codes = extracted.fields.clone(),
            }
            doc.extracted_at = Some(Utc::now());
            if extracted.quality.is_some() {
                doc.quality_analysis = extracted.quality.clone();
            }
            Ok(())
        })
        .await
    }

    /// Store the cross-validation result on the back document record
    pub async fn record_cross_validation(
        &self,
        session_id: Uuid,
        result: CrossValidationResult,
    ) -> Result<VerificationResult> {
        self.mutate(session_id, "record_cross_validation", |s| {
            if closed_to_new_facts(s) {
                return Ok(());
            }
            let doc = s
                .documents
                .get_mut(&DocumentSide::Back)
                .ok_or_else(|| IdvError::MissingDocument {
                    session_id,
                    side: DocumentSide::Back.as_str().to_string(),
                })?;
            doc.cross_validation_result = Some(result.clone());
            Ok(())
        })
        .await
    }

    /// Operator / manual override. Legal from any non-terminal state.
    pub async fn request_manual_review(
        &self,
        session_id: Uuid,
        reason: &str,
    ) -> Result<VerificationResult> {
        self.mutate(session_id, "request_manual_review", |s| {
            let event = VerificationEvent::ManualReviewRequired;
            let next = transition(s.status, event)
                .map_err(|source| IdvError::IllegalTransition { session_id, source })?;
            s.manual_review_reason = Some(reason.to_string());
            s.transition_to(next, Some(event), false);
            Ok(())
        })
        .await
    }

    /// Re-derive the status implied by stored facts and, on mismatch, repair
    /// it once through the privileged path.
    pub async fn recalculate_consistent_scores(&self, session_id: Uuid) -> Result<Recalculation> {
        let stored = self.load(session_id).await?;
        let policy = self.policy_for(&stored);
        let decision = evaluate(&stored, &policy);

        let mut recalculation = Recalculation {
            session_id,
            stored_status: stored.status,
            derived_status: decision.status,
            derived_classification: decision.classification,
            outcome: RecalculationOutcome::Consistent,
        };

        if decision.status == stored.status {
            return Ok(recalculation);
        }

        if stored.is_terminal() && !decision.is_terminal() {
            warn!(
                %session_id,
                stored = %stored.status,
                derived = %decision.status,
                "terminal session lacks the facts for a decision; not reopening"
            );
            recalculation.outcome = RecalculationOutcome::Indeterminate;
            return Ok(recalculation);
        }

        warn!(
            %session_id,
            stored = %stored.status,
            derived = %decision.status,
            source = ?decision.source,
            "status inconsistent with stored scores; repairing"
        );

        let mut repaired = stored.clone();
        let to = state_machine::repair(repaired.status, decision.status);
        repaired.transition_to(to, None, true);
        if decision.is_terminal() && decision.source != DecisionSource::ManualOverride {
            match decision.classification {
                Some(classification) => {
                    let record = derived_failure(&repaired, &decision, classification);
                    repaired.failure = Some(record);
                }
                None => repaired.failure = None,
            }
        }
        repaired.version = stored.version + 1;
        repaired.updated_at = Utc::now();

        if self.store.compare_and_swap(&repaired, stored.version).await? {
            info!(%session_id, status = %repaired.status, "session repaired");
            if repaired.is_terminal() {
                self.notify(&repaired).await;
            }
            recalculation.outcome = RecalculationOutcome::Repaired;
        } else {
            warn!(%session_id, "repair lost a version race; leaving for next audit");
            recalculation.outcome = RecalculationOutcome::Conflict;
        }

        Ok(recalculation)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load(&self, session_id: Uuid) -> Result<VerificationSession> {
        self.store
            .load(session_id)
            .await?
            .ok_or(IdvError::SessionNotFound(session_id))
    }

    async fn mutate<F>(&self, session_id: Uuid, op: &'static str, mut apply: F) -> Result<VerificationResult>
    where
        F: FnMut(&mut VerificationSession) -> Result<()>,
    {
        for attempt in 1..=self.max_cas_attempts {
            let loaded = self.load(session_id).await?;
            let mut session = loaded.clone();

            apply(&mut session)?;
            let decision = self.reconcile(&mut session);

            if session == loaded {
                return Ok(VerificationResult::from(&session));
            }

            session.version = loaded.version + 1;
            session.updated_at = Utc::now();

            if self.store.compare_and_swap(&session, loaded.version).await? {
                debug!(
                    %session_id,
                    op,
                    version = session.version,
                    status = %session.status,
                    source = ?decision.as_ref().map(|d| d.source),
                    "session updated"
                );
                if session.is_terminal() && session.status != loaded.status {
                    info!(%session_id, status = %session.status, "verification reached terminal status");
                    self.notify(&session).await;
                }
                return Ok(VerificationResult::from(&session));
            }

            debug!(%session_id, op, attempt, "version conflict; retrying");
        }

        warn!(%session_id, op, attempts = self.max_cas_attempts, "giving up after repeated version conflicts");
        Err(IdvError::ConcurrentUpdate {
            session_id,
            attempts: self.max_cas_attempts,
        })
    }

    /// Re-evaluate a non-terminal session and walk the state machine toward
    /// the derived status.
    fn reconcile(&self, session: &mut VerificationSession) -> Option<Decision> {
        if session.is_terminal() {
            return None;
        }

        let policy = self.policy_for(session);
        let decision = evaluate(session, &policy);

        for verdict in &decision.validation.verdicts {
            debug!(
                session_id = %session.id,
                check = verdict.check.as_str(),
                score = verdict.score,
                threshold = verdict.threshold,
                margin = verdict.margin,
                passed = verdict.passed,
                "score verdict"
            );
        }

        if decision.is_terminal() && decision.source != DecisionSource::ManualOverride {
            if let Some(classification) = decision.classification {
                let current = session.failure.as_ref().map(|f| f.classification);
                if current != Some(classification) {
                    let record = derived_failure(session, &decision, classification);
                    session.failure = Some(record);
                }
            }
        }

        advance(session, decision.status);
        Some(decision)
    }

    async fn notify(&self, session: &VerificationSession) {
        let notification = StatusNotification::from_session(session);
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(session_id = %session.id, error = %e, "status notification failed (non-fatal)");
        }
    }
}

/// VERIFIED and FAILED are closed; MANUAL_REVIEW keeps collecting evidence.
fn closed_to_new_facts(session: &VerificationSession) -> bool {
    matches!(
        session.status,
        VerificationState::Verified | VerificationState::Failed
    )
}

/// A re-run stage succeeded: drop the classification it had produced and,
/// if that classification alone held the session in review, reopen the
/// session at the in-progress state its facts imply.
fn supersede_failure(session: &mut VerificationSession, stage: Stage) {
    let Some(failure) = session.failure.as_ref().filter(|f| f.stage == stage) else {
        return;
    };
    info!(
        session_id = %session.id,
        classification = %failure.classification,
        %stage,
        "classification superseded by reprocessed stage"
    );
    session.failure = None;

    if session.status == VerificationState::ManualReview && session.manual_review_reason.is_none() {
        let to = state_machine::repair(session.status, derive_progress(session));
        session.transition_to(to, None, true);
    }
}

/// Keep the highest-priority classification; equal priority keeps the first.
fn attach_failure(session: &mut VerificationSession, record: FailureRecord) {
    match &session.failure {
        Some(existing) if existing.classification.priority() <= record.classification.priority() => {
            debug!(
                session_id = %session.id,
                existing = %existing.classification,
                incoming = %record.classification,
                "keeping existing classification"
            );
        }
        _ => session.failure = Some(record),
    }
}

/// Failure record for a classification the decision engine derived
fn derived_failure(
    session: &VerificationSession,
    decision: &Decision,
    classification: FailureClassification,
) -> FailureRecord {
    if let Some(existing) = session
        .failure
        .as_ref()
        .filter(|f| f.classification == classification)
    {
        return existing.clone();
    }

    let check = match classification {
        FailureClassification::PhotoMismatchFraud => Some(ScoreCheck::PhotoConsistency),
        FailureClassification::DataInconsistencyFraud => Some(ScoreCheck::CrossValidation),
        FailureClassification::FaceNotMatching => Some(ScoreCheck::FaceMatch),
        FailureClassification::LivenessFailed => Some(ScoreCheck::Liveness),
        _ => None,
    };

    let mut message = check
        .and_then(|c| decision.validation.verdict(c))
        .map(|v| {
            format!(
                "{} score {:.3} below threshold {:.3}",
                v.check.as_str(),
                v.score,
                v.threshold
            )
        })
        .unwrap_or_else(|| format!("{} derived from recorded results", classification));

    let discrepancies = session
        .cross_validation()
        .map(|r| r.discrepancies.clone())
        .unwrap_or_default();
    if classification == FailureClassification::DataInconsistencyFraud && !discrepancies.is_empty() {
        message = format!("{}: {}", message, discrepancies.join("; "));
    }

    FailureRecord {
        classification,
        stage: decision.stage.unwrap_or(Stage::Document),
        message,
        context: ErrorContext::default(),
        recorded_at: Utc::now(),
    }
}

/// Walk legal events from the current state to `target`. Never regresses.
fn advance(session: &mut VerificationSession, target: VerificationState) {
    match plan_route(session.status, target) {
        Ok(route) => {
            for event in route {
                match transition(session.status, event) {
                    Ok(next) => session.transition_to(next, Some(event), false),
                    Err(e) => {
                        error!(session_id = %session.id, error = %e, "planned route became illegal");
                        break;
                    }
                }
            }
        }
        Err(TransitionError::NoRoute { from, to }) if !to.is_terminal() => {
            debug!(session_id = %session.id, %from, %to, "derived state behind current; holding");
        }
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "cannot advance session");
        }
    }
}
