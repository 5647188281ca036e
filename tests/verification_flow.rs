//! End-to-end verification flows through the orchestrator with scripted
//! collaborators and in-memory storage.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ob_idv::fallback::LayerStatus;
use ob_idv::{
    CollaboratorError, DocumentSide, DocumentType, Environment, FailureClassification, IdvError,
    PhotoCheckErrorPolicy, SignalQuality, Stage, TenantOverride, ThresholdProvider,
    VerificationState,
};

#[tokio::test]
async fn verified_with_front_document_only() {
    let h = Script::default().build();
    let id = h.start(Environment::Production).await;

    let result = h
        .orchestrator
        .submit_front_document(id, FRONT, DocumentType::Passport)
        .await
        .unwrap();
    assert_eq!(result.status, VerificationState::OcrCompleted);

    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    assert_eq!(live.result.status, VerificationState::Verified);
    assert_eq!(live.result.scores.face_match, Some(0.92));
    assert_eq!(live.result.scores.liveness, Some(0.80));
    assert_eq!(live.result.classification, None);
    assert_eq!(live.liveness.quality, SignalQuality::Partial);
    assert_eq!(live.liveness.contributing_layers(), vec!["primary"]);

    let sent = h.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_type, "verification.verified");
}

#[tokio::test]
async fn verified_with_matching_back_document() {
    let h = Script::default().build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let result = h.orchestrator.submit_back_document(id, BACK).await.unwrap();
    assert_eq!(result.status, VerificationState::CrossValidationCompleted);
    assert_eq!(result.scores.cross_validation, Some(1.0));
    assert_eq!(result.scores.photo_consistency, Some(0.93));

    let session = h.manager.get_session(id).await.unwrap();
    let cv = session.cross_validation().unwrap();
    assert!(cv.documents_match);
    assert!(cv.discrepancies.is_empty());

    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    assert_eq!(live.result.status, VerificationState::Verified);
    assert!(live.result.completed_stages.contains(&Stage::CrossValidation));
}

#[tokio::test]
async fn back_uploaded_before_front_still_cross_validates() {
    let h = Script::default().build();
    let id = h.start(Environment::Production).await;

    h.orchestrator.submit_back_document(id, BACK).await.unwrap();
    let session = h.manager.get_session(id).await.unwrap();
    assert!(!session.completed_stages.contains(&Stage::CrossValidation));

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let session = h.manager.get_session(id).await.unwrap();
    assert!(session.completed_stages.contains(&Stage::CrossValidation));
    assert_eq!(session.scores.cross_validation, Some(1.0));
}

#[tokio::test]
async fn data_mismatch_is_fraud() {
    let h = Script {
        decoder: Ok(fields(&[
            ("DAQ", "X99999999"),
            ("DBA", "03012027"),
            ("issuing_state", "California DMV"),
        ])),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let result = h.orchestrator.submit_back_document(id, BACK).await.unwrap();

    assert_eq!(result.status, VerificationState::Failed);
    assert_eq!(
        result.classification,
        Some(FailureClassification::DataInconsistencyFraud)
    );
    let score = result.scores.cross_validation.unwrap();
    assert!(score < 0.7);

    let session = h.manager.get_session(id).await.unwrap();
    let cv = session.cross_validation().unwrap();
    assert!(!cv.documents_match);
    assert_eq!(cv.discrepancies.len(), 2);
}

#[tokio::test]
async fn back_scan_failure_goes_to_manual_review_and_live_capture_proceeds() {
    let h = Script {
        decoder: Err(CollaboratorError::Failed("PDF417 not found".into())),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let result = h.orchestrator.submit_back_document(id, BACK).await.unwrap();

    assert!(result.completed_stages.contains(&Stage::CrossValidation));
    assert_eq!(result.classification, Some(FailureClassification::ExtractionFailure));
    assert_eq!(result.status, VerificationState::ManualReview);
    assert!(result.reason.is_some());

    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    assert!(live.result.completed_stages.contains(&Stage::FaceMatching));
    assert_eq!(live.result.scores.face_match, Some(0.92));
    assert_eq!(live.result.status, VerificationState::ManualReview);
}

#[tokio::test]
async fn photo_comparison_outage_fails_closed() {
    let h = Script {
        faces: ScriptedFaces {
            documents: Err(CollaboratorError::Unavailable("vision offline".into())),
            selfie: Ok(0.95),
        },
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let result = h.orchestrator.submit_back_document(id, BACK).await.unwrap();

    assert_eq!(result.status, VerificationState::Failed);
    assert_eq!(result.classification, Some(FailureClassification::PhotoMismatchFraud));
    assert_eq!(result.scores.photo_consistency, None);

    let session = h.manager.get_session(id).await.unwrap();
    assert!(session.failure.unwrap().context.technical);
}

#[tokio::test]
async fn photo_comparison_outage_escalates_when_tenant_prefers_review() {
    let thresholds = ThresholdProvider::default().with_override(
        "tenant-a",
        TenantOverride {
            photo_check_error: Some(PhotoCheckErrorPolicy::ManualReview),
            ..TenantOverride::default()
        },
    );
    let h = Script {
        faces: ScriptedFaces {
            documents: Err(CollaboratorError::TimedOut(Duration::from_secs(5))),
            selfie: Ok(0.95),
        },
        thresholds,
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let result = h.orchestrator.submit_back_document(id, BACK).await.unwrap();

    assert_eq!(result.status, VerificationState::ManualReview);
    assert_eq!(result.classification, Some(FailureClassification::PhotoMismatchFraud));
}

#[tokio::test]
async fn low_photo_consistency_fails_even_with_good_biometrics() {
    let h = Script {
        faces: ScriptedFaces {
            documents: Ok(0.2),
            selfie: Ok(0.99),
        },
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let result = h.orchestrator.submit_back_document(id, BACK).await.unwrap();
    assert_eq!(result.status, VerificationState::Failed);
    assert_eq!(result.classification, Some(FailureClassification::PhotoMismatchFraud));

    // Terminal: later results do not move it
    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    assert_eq!(live.result.status, VerificationState::Failed);
    assert!(live.result.completed_stages.contains(&Stage::FaceMatching));
}

#[tokio::test]
async fn low_face_match_fails_with_face_not_matching() {
    let h = Script {
        faces: ScriptedFaces {
            documents: Ok(0.9),
            selfie: Ok(0.40),
        },
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::Passport)
        .await
        .unwrap();
    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();

    assert_eq!(live.result.status, VerificationState::Failed);
    assert_eq!(live.result.classification, Some(FailureClassification::FaceNotMatching));
    assert_eq!(
        live.result.reason.as_deref(),
        Some(FailureClassification::FaceNotMatching.user_message())
    );
}

#[tokio::test]
async fn sandbox_thresholds_are_looser() {
    let h = Script {
        faces: ScriptedFaces {
            documents: Ok(0.9),
            selfie: Ok(0.70),
        },
        liveness: Ok(0.55),
        ..Script::default()
    }
    .build();

    let prod = h.start(Environment::Production).await;
    let sandbox = h.start(Environment::Sandbox).await;
    for id in [prod, sandbox] {
        h.orchestrator
            .submit_front_document(id, FRONT, DocumentType::Passport)
            .await
            .unwrap();
        h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    }

    let prod = h.manager.get_verification_result(prod).await.unwrap();
    let sandbox = h.manager.get_verification_result(sandbox).await.unwrap();
    assert_eq!(prod.status, VerificationState::Failed);
    assert_eq!(sandbox.status, VerificationState::Verified);
}

#[tokio::test]
async fn no_liveness_signal_is_never_a_pass() {
    let h = Script {
        liveness: Err(CollaboratorError::Unavailable("model not loaded".into())),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::Passport)
        .await
        .unwrap();
    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();

    assert_eq!(live.liveness.confidence, None);
    assert_eq!(live.liveness.quality, SignalQuality::Unavailable);
    assert_eq!(live.result.status, VerificationState::ManualReview);
    assert_eq!(
        live.result.classification,
        Some(FailureClassification::FaceRecognitionTechnicalError)
    );
    assert!(live.result.completed_stages.contains(&Stage::FaceMatching));
}

#[tokio::test]
async fn heuristic_layer_takes_over_for_raw_frames() {
    let h = Script {
        liveness: Err(CollaboratorError::Failed("primary crashed".into())),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Sandbox).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::Passport)
        .await
        .unwrap();

    // Symmetric, textured, skin-toned 32x32 PPM frame
    let mut frame = b"P6\n32 32\n255\n".to_vec();
    for y in 0..32usize {
        for x in 0..32usize {
            let mx = x.min(31 - x);
            let grain = ((mx * 7 + y * 13) % 5) as u8 * 12;
            frame.extend_from_slice(&[180 + grain / 2, 130 + grain / 3, 100]);
        }
    }

    let live = h.orchestrator.submit_live_capture(id, &frame, None).await.unwrap();
    assert!(matches!(live.liveness.layers[0].status, LayerStatus::Error { .. }));
    assert_eq!(live.liveness.contributing_layers(), vec!["heuristic"]);
    assert!(live.liveness.confidence.unwrap() > 0.65);
    assert_eq!(live.result.status, VerificationState::Verified);
}

#[tokio::test(start_paused = true)]
async fn ocr_timeout_completes_document_stage() {
    let h = Script {
        extractor: Arc::new(HangingExtractor),
        timeout: Duration::from_millis(500),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    let result = h
        .orchestrator
        .submit_front_document(id, FRONT, DocumentType::Passport)
        .await
        .unwrap();

    assert!(result.completed_stages.contains(&Stage::Document));
    assert_eq!(result.classification, Some(FailureClassification::ExtractionFailure));
    assert_eq!(result.status, VerificationState::ManualReview);
}

#[tokio::test]
async fn live_capture_requires_front_document() {
    let h = Script::default().build();
    let id = h.start(Environment::Production).await;

    let err = h
        .orchestrator
        .submit_live_capture(id, SELFIE, None)
        .await
        .unwrap_err();
    assert!(matches!(err, IdvError::MissingDocument { .. }));
}

#[tokio::test]
async fn unknown_session_is_a_contract_error() {
    let h = Script::default().build();
    let err = h
        .orchestrator
        .submit_back_document(uuid::Uuid::new_v4(), BACK)
        .await
        .unwrap_err();
    assert!(matches!(err, IdvError::SessionNotFound(_)));
}

#[tokio::test]
async fn failed_front_reupload_replaces_record_and_keeps_classification() {
    let h = Script {
        extractor: Arc::new(ScriptedExtractor(Err(CollaboratorError::Failed("glare".into())))),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::Passport)
        .await
        .unwrap();
    let first = h.manager.get_session(id).await.unwrap();
    let first_doc = first.document(DocumentSide::Front).unwrap().id;
    assert_eq!(first.status, VerificationState::ManualReview);

    // Session is with a reviewer; the re-upload is recorded for them
    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::Passport)
        .await
        .unwrap();
    let second = h.manager.get_session(id).await.unwrap();
    assert_ne!(second.document(DocumentSide::Front).unwrap().id, first_doc);
    assert_eq!(second.documents.len(), 1);
    assert_eq!(second.status, VerificationState::ManualReview);
    assert!(second.reprocessing.is_empty());

    let result = h.manager.get_verification_result(id).await.unwrap();
    assert_eq!(result.classification, Some(FailureClassification::ExtractionFailure));
    assert!(result.reason.is_some());
}

#[tokio::test]
async fn clean_front_reupload_reopens_review_and_verifies() {
    let h = Script {
        extractor: Arc::new(FlakyExtractor::failing(1)),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    let first = h
        .orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    assert_eq!(first.status, VerificationState::ManualReview);
    assert_eq!(first.classification, Some(FailureClassification::ExtractionFailure));

    let second = h
        .orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    assert_eq!(second.classification, None);
    assert_eq!(second.status, VerificationState::OcrCompleted);
    assert!(!second.is_terminal);

    let session = h.manager.get_session(id).await.unwrap();
    let reopen = session.history.last().unwrap();
    assert!(reopen.repaired);
    assert_eq!(reopen.from, VerificationState::ManualReview);

    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    assert_eq!(live.result.status, VerificationState::Verified);
    assert_eq!(live.result.classification, None);

    // The reopened session is consistent with its facts
    let recalculation = h.manager.recalculate_consistent_scores(id).await.unwrap();
    assert_eq!(recalculation.outcome, ob_idv::RecalculationOutcome::Consistent);

    let sent = h.notifier.sent().await;
    assert_eq!(sent.last().unwrap().event_type, "verification.verified");
}

#[tokio::test]
async fn empty_back_decode_completes_cross_validation_into_review() {
    let h = Script {
        decoder: Ok(fields(&[])),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let back = h.orchestrator.submit_back_document(id, BACK).await.unwrap();
    assert!(back.completed_stages.contains(&Stage::CrossValidation));

    let session = h.manager.get_session(id).await.unwrap();
    let decoded = session.document(DocumentSide::Back).unwrap();
    assert!(decoded.is_extracted());
    let cross = session.cross_validation().unwrap();
    assert!(cross.requires_manual_review);
    assert!(!cross.documents_match);

    let live = h.orchestrator.submit_live_capture(id, SELFIE, None).await.unwrap();
    assert!(live.result.completed_stages.contains(&Stage::FaceMatching));
    assert_eq!(live.result.status, VerificationState::ManualReview);
    assert_eq!(live.result.classification, Some(FailureClassification::ExtractionFailure));
    assert!(live.result.reason.is_some());
}

#[tokio::test]
async fn unreadable_stored_images_fail_cross_validation_closed() {
    let h = Script {
        images: Arc::new(UnreadableImages::default()),
        ..Script::default()
    }
    .build();
    let id = h.start(Environment::Production).await;

    h.orchestrator
        .submit_front_document(id, FRONT, DocumentType::DriversLicense)
        .await
        .unwrap();
    let result = h.orchestrator.submit_back_document(id, BACK).await.unwrap();

    assert!(result.completed_stages.contains(&Stage::CrossValidation));
    assert_eq!(result.status, VerificationState::Failed);
    assert_eq!(result.classification, Some(FailureClassification::PhotoMismatchFraud));
    assert_eq!(result.scores.photo_consistency, None);

    let session = h.manager.get_session(id).await.unwrap();
    assert!(session.failure.unwrap().context.technical);
}
