//! Consistency audit over sessions produced by real verification flows.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ob_idv::{
    CollaboratorError, ConsistencyMonitor, DocumentType, Environment, FailureClassification,
    MonitorConfig, RecalculationOutcome, VerificationState,
};
use tokio::sync::watch;

fn monitor_for(h: &Harness) -> Arc<ConsistencyMonitor> {
    Arc::new(ConsistencyMonitor::new(
        h.manager.clone(),
        MonitorConfig::default(),
    ))
}

async fn verified(h: &Harness) -> uuid::Uuid {
    let id = h.start(Environment::Production).await;
    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    h.orchestrator.submit_back_document(id, BACK).await.unwrap();
    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    assert_eq!(live.result.status, VerificationState::Verified);
    id
}

#[tokio::test]
async fn verified_sessions_with_passing_scores_are_left_alone() {
    let h = Script::default().build();
    let a = verified(&h).await;
    let b = verified(&h).await;
    let monitor = monitor_for(&h);

    let report = monitor.audit_once().await.unwrap();
    assert_eq!(report.audited, 2);
    assert_eq!(report.consistent, 2);
    assert!(report.repaired_sessions.is_empty());

    for id in [a, b] {
        let before = h.manager.get_session(id).await.unwrap();
        let recalculation = h.manager.recalculate_consistent_scores(id).await.unwrap();
        assert_eq!(recalculation.outcome, RecalculationOutcome::Consistent);
        assert_eq!(h.manager.get_session(id).await.unwrap().version, before.version);
    }
    assert!(!monitor.is_degraded().await);
}

#[tokio::test]
async fn drifted_verified_session_is_repaired_to_failed() {
    let h = Script::default().build();
    let healthy = verified(&h).await;
    let drifted = verified(&h).await;

    // A score written behind the manager's back
    let mut session = h.manager.get_session(drifted).await.unwrap();
    session.scores.face_match = Some(0.30);
    h.store.force_put(session).await;

    let monitor = monitor_for(&h);
    let report = monitor.audit_once().await.unwrap();
    assert_eq!(report.audited, 2);
    assert_eq!(report.consistent, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(report.repaired_sessions, vec![drifted]);
    assert_eq!(report.rate(), 0.5);
    assert!(monitor.is_degraded().await);

    let repaired = h.manager.get_session(drifted).await.unwrap();
    assert_eq!(repaired.status, VerificationState::Failed);
    assert_eq!(
        repaired.failure.as_ref().map(|f| f.classification),
        Some(FailureClassification::FaceNotMatching)
    );
    let last = repaired.history.last().unwrap();
    assert!(last.repaired);
    assert_eq!(last.from, VerificationState::Verified);

    let untouched = h.manager.get_session(healthy).await.unwrap();
    assert_eq!(untouched.status, VerificationState::Verified);

    // Second pass finds nothing left to repair
    let report = monitor.audit_once().await.unwrap();
    assert_eq!(report.consistent, 2);
    assert_eq!(report.repaired, 0);
    assert_eq!(monitor.stats().await.passes, 2);

    let sent = h.notifier.sent().await;
    assert_eq!(sent.last().unwrap().event_type, "verification.failed");
}

#[tokio::test]
async fn fraud_evidence_after_manual_review_is_escalated() {
    let h = Script {
        extractor: Arc::new(ScriptedExtractor(Err(CollaboratorError::Failed(
            "unreadable".into(),
        )))),
        faces: ScriptedFaces {
            documents: Ok(0.2),
            selfie: Ok(0.95),
        },
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    let front = h
        .orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    assert_eq!(front.status, VerificationState::ManualReview);

    // Reviewer-bound session keeps collecting evidence
    let back = h.orchestrator.submit_back_document(id, BACK).await.unwrap();
    assert_eq!(back.status, VerificationState::ManualReview);
    assert_eq!(back.scores.photo_consistency, Some(0.2));

    let monitor = monitor_for(&h);
    let report = monitor.audit_once().await.unwrap();
    assert_eq!(report.repaired_sessions, vec![id]);

    let session = h.manager.get_session(id).await.unwrap();
    assert_eq!(session.status, VerificationState::Failed);
    assert_eq!(
        session.failure.map(|f| f.classification),
        Some(FailureClassification::PhotoMismatchFraud)
    );
}

#[tokio::test(start_paused = true)]
async fn run_loop_audits_until_shutdown() {
    let h = Script::default().build();
    verified(&h).await;
    let monitor = monitor_for(&h);

    let (tx, rx) = watch::channel(false);
    let runner = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run(rx).await })
    };

    // First tick fires immediately; the next is a full interval away
    tokio::time::sleep(Duration::from_secs(1)).await;
    tx.send(true).unwrap();
    runner.await.unwrap();

    let stats = monitor.stats().await;
    assert_eq!(stats.passes, 1);
    assert_eq!(stats.audited, 1);
    assert_eq!(stats.consistent, 1);
}
