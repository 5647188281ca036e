//! Scripted collaborators and wiring shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use ob_idv::types::FieldMap;
use ob_idv::{
    BackOfDocumentDecoder, CollaboratorError, CollaboratorLayer, Collaborators, DocumentExtractor,
    DocumentType, Environment, ExtractedDocument, FaceComparator, FallbackPipeline,
    HeuristicLivenessDetector, ImageStore, ImageStoreError, LivenessChallenge, LivenessDetector, MemoryImageStore,
    MemorySessionStore, RecordingNotifier, ThresholdProvider, VerificationOrchestrator,
    VerificationStateManager,
};

pub const FRONT: &[u8] = b"FRONT-jpeg";
pub const BACK: &[u8] = b"BACK-jpeg";
pub const SELFIE: &[u8] = b"SELFIE-jpeg";

pub struct ScriptedExtractor(pub Result<FieldMap, CollaboratorError>);

#[async_trait]
impl DocumentExtractor for ScriptedExtractor {
    async fn extract_document_fields(
        &self,
        _image: &[u8],
        _document_type: DocumentType,
    ) -> Result<ExtractedDocument, CollaboratorError> {
        self.0.clone().map(|fields| ExtractedDocument {
            fields,
            quality: None,
        })
    }
}

/// Never answers; exercises the collaborator deadline
pub struct HangingExtractor;

#[async_trait]
impl DocumentExtractor for HangingExtractor {
    async fn extract_document_fields(
        &self,
        _image: &[u8],
        _document_type: DocumentType,
    ) -> Result<ExtractedDocument, CollaboratorError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ExtractedDocument::default())
    }
}

/// Fails the first `failures` calls, then reads the front cleanly
pub struct FlakyExtractor {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyExtractor {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DocumentExtractor for FlakyExtractor {
    async fn extract_document_fields(
        &self,
        _image: &[u8],
        _document_type: DocumentType,
    ) -> Result<ExtractedDocument, CollaboratorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(CollaboratorError::Failed("glare".into()));
        }
        Ok(ExtractedDocument {
            fields: front_fields(),
            quality: None,
        })
    }
}

/// Accepts uploads but can never read them back
#[derive(Default)]
pub struct UnreadableImages(MemoryImageStore);

#[async_trait]
impl ImageStore for UnreadableImages {
    async fn store(
        &self,
        key: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<String, ImageStoreError> {
        self.0.store(key, content, content_type).await
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, ImageStoreError> {
        Err(ImageStoreError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, ImageStoreError> {
        self.0.exists(path).await
    }
}

pub struct ScriptedDecoder(pub Result<FieldMap, CollaboratorError>);

#[async_trait]
impl BackOfDocumentDecoder for ScriptedDecoder {
    async fn decode_back_of_document(&self, _image: &[u8]) -> Result<FieldMap, CollaboratorError> {
        self.0.clone()
    }
}

/// Answers document-photo comparisons and selfie comparisons separately
pub struct ScriptedFaces {
    pub documents: Result<f64, CollaboratorError>,
    pub selfie: Result<f64, CollaboratorError>,
}

#[async_trait]
impl FaceComparator for ScriptedFaces {
    async fn compare_faces(&self, _image_a: &[u8], image_b: &[u8]) -> Result<f64, CollaboratorError> {
        if image_b.starts_with(b"BACK") {
            self.documents.clone()
        } else {
            self.selfie.clone()
        }
    }
}

pub struct ScriptedLiveness(pub Result<f64, CollaboratorError>);

#[async_trait]
impl LivenessDetector for ScriptedLiveness {
    async fn detect_liveness(
        &self,
        _image: &[u8],
        _challenge: Option<&LivenessChallenge>,
    ) -> Result<f64, CollaboratorError> {
        self.0.clone()
    }
}

pub fn fields(pairs: &[(&str, &str)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

pub fn front_fields() -> FieldMap {
    fields(&[
        ("name", "JANE Q SAMPLE"),
        ("document_number", "D1234-5678"),
        ("expiration_date", "2030-01-15"),
        ("issuing_authority", "California DMV"),
    ])
}

pub fn matching_back_codes() -> FieldMap {
    fields(&[
        ("DAQ", "D12345678"),
        ("DBA", "01152030"),
        ("issuing_state", "California DMV"),
    ])
}

pub struct Harness {
    pub orchestrator: VerificationOrchestrator,
    pub manager: Arc<VerificationStateManager>,
    pub store: Arc<MemorySessionStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub struct Script {
    pub extractor: Arc<dyn DocumentExtractor>,
    pub decoder: Result<FieldMap, CollaboratorError>,
    pub faces: ScriptedFaces,
    pub liveness: Result<f64, CollaboratorError>,
    pub thresholds: ThresholdProvider,
    pub timeout: Duration,
    pub images: Arc<dyn ImageStore>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            extractor: Arc::new(ScriptedExtractor(Ok(front_fields()))),
            decoder: Ok(matching_back_codes()),
            faces: ScriptedFaces {
                documents: Ok(0.93),
                selfie: Ok(0.92),
            },
            liveness: Ok(0.80),
            thresholds: ThresholdProvider::default(),
            timeout: Duration::from_secs(5),
            images: Arc::new(MemoryImageStore::new()),
        }
    }
}

impl Script {
    pub fn build(self) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let manager = Arc::new(
            VerificationStateManager::new(store.clone(), Arc::new(self.thresholds))
                .with_notifier(notifier.clone()),
        );

        let liveness = FallbackPipeline::new(self.timeout)
            .with_layer(Arc::new(CollaboratorLayer::new(
                "primary",
                Arc::new(ScriptedLiveness(self.liveness)),
            )))
            .with_layer(Arc::new(HeuristicLivenessDetector::default()));

        let orchestrator = VerificationOrchestrator::new(
            manager.clone(),
            self.images,
            Collaborators {
                extractor: self.extractor,
                back_decoder: Arc::new(ScriptedDecoder(self.decoder)),
                face_comparator: Arc::new(self.faces),
            },
            liveness,
        )
        .with_timeout(self.timeout);

        Harness {
            orchestrator,
            manager,
            store,
            notifier,
        }
    }
}

impl Harness {
    pub async fn start(&self, environment: Environment) -> Uuid {
        let id = Uuid::new_v4();
        self.manager
            .initialize_verification(id, "subject-42", "tenant-a", environment)
            .await
            .unwrap();
        id
    }
}
