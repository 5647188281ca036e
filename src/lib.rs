//! Identity Verification Orchestration Core
//!
//! Stage-based verification of a subject from identity-document images and a
//! live selfie. Recognition itself is delegated to external collaborators; this
//! crate owns the state machine, score aggregation, failure classification and
//! the self-healing audit loop.
//!
//! # Architecture
//!
//! ```text
//!  front / back / selfie bytes
//!       │
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  VerificationOrchestrator               │
//! │  OCR · barcode · face compare · liveness│──► FallbackPipeline
//! │  (timeouts, failures → classification)  │    local layers → remote vision
//! └─────────────────────────────────────────┘
//!       │ facts: documents, stages, scores, failure
//!       ▼
//! ┌─────────────────────────────────────────┐
//! │  VerificationStateManager               │
//! │  CAS mutate → evaluate → walk FSM       │──► SessionStore (memory / Postgres)
//! └─────────────────────────────────────────┘
//!       ▲
//!       │ recalculate_consistent_scores
//! ┌─────────────────────────────────────────┐
//! │  ConsistencyMonitor (interval audit)    │
//! └─────────────────────────────────────────┘
//! ```

pub mod collaborators;
pub mod config;
pub mod cross_validation;
pub mod decision;
pub mod error;
pub mod fallback;
pub mod image_store;
pub mod manager;
pub mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod state_machine;
pub mod store;
pub mod thresholds;
pub mod types;

pub use collaborators::{
    BackOfDocumentDecoder, CollaboratorError, DocumentExtractor, ExtractedDocument,
    FaceComparator, LivenessChallenge, LivenessDetector,
};
pub use config::IdvConfig;
pub use cross_validation::{cross_validate, CrossValidationEngine, CrossValidationResult, FieldVerdict};
pub use decision::{evaluate, Decision, DecisionSource};
pub use error::{ConfigError, IdvError, Result};
pub use fallback::{
    CollaboratorLayer, FallbackPipeline, HeuristicLivenessDetector, PipelineOutcome,
    RemoteVisionLayer, SignalDetector, SignalQuality,
};
pub use image_store::{ImageStore, ImageStoreError, LocalImageStore, MemoryImageStore};
pub use manager::{Recalculation, RecalculationOutcome, VerificationStateManager};
pub use monitor::{AuditReport, ConsistencyMonitor, ConsistencyStats, MonitorConfig};
pub use notify::{RecordingNotifier, StatusNotification, StatusNotifier, TracingNotifier};
pub use orchestrator::{Collaborators, LiveCaptureOutcome, VerificationOrchestrator};
pub use state_machine::{transition, TransitionError, VerificationEvent, VerificationState};
pub use store::{MemorySessionStore, SessionStore, StoreError};
pub use thresholds::{
    validate_scores, DecisionPolicy, PhotoCheckErrorPolicy, ScoreCheck, ScoreValidation,
    TenantOverride, ThresholdProvider, ThresholdSet, ThresholdTable,
};
pub use types::{
    DocumentRecord, DocumentSide, DocumentType, Environment, ErrorContext, FailureClassification,
    FailureRecord, ScoreBundle, Stage, VerificationResult, VerificationSession,
};

#[cfg(feature = "database")]
pub use store::PgSessionStore;
