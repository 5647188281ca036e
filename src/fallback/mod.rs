//! Liveness Fallback Pipeline
//!
//! Ordered detector layers behind one capability interface. Every local layer
//! is attempted in order; remote layers run only when no local layer produced
//! a signal. The combined confidence is the arithmetic mean of all produced
//! signals. When nothing produced a signal the outcome carries no confidence
//! at all, never a default pass.

pub mod frame;
pub mod heuristic;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::collaborators::{with_timeout, CollaboratorError, LivenessChallenge, LivenessDetector};

pub use frame::{FrameDecoder, FrameError, PpmDecoder, RgbFrame};
pub use heuristic::{HeuristicLivenessDetector, HeuristicScores};
pub use remote::{HttpVisionClient, RemoteVisionLayer, VisionClient, VisionVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerTier {
    Local,
    Remote,
}

/// What a single layer reports back
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutcome {
    Signal(f64),
    /// Layer cannot judge this input (unsupported format, model not loaded)
    Unavailable(String),
}

#[async_trait]
pub trait SignalDetector: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> LayerTier;

    async fn detect(
        &self,
        image: &[u8],
        challenge: Option<&LivenessChallenge>,
    ) -> Result<DetectorOutcome, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LayerStatus {
    Signal { confidence: f64 },
    Unavailable { reason: String },
    Error { error: String },
    /// Not attempted because an earlier tier already produced a signal
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerReport {
    pub name: String,
    pub tier: LayerTier,
    pub status: LayerStatus,
    pub elapsed_ms: u64,
}

impl LayerReport {
    pub fn executed(&self) -> bool {
        self.status != LayerStatus::Skipped
    }

    pub fn signal(&self) -> Option<f64> {
        match self.status {
            LayerStatus::Signal { confidence } => Some(confidence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    /// Every local layer produced a signal
    Full,
    /// Some local layers produced a signal
    Partial,
    RemoteOnly,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub confidence: Option<f64>,
    pub quality: SignalQuality,
    pub layers: Vec<LayerReport>,
}

impl PipelineOutcome {
    /// Names of the layers that actually ran
    pub fn executed_layers(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|l| l.executed())
            .map(|l| l.name.as_str())
            .collect()
    }

    /// Names of the layers whose signal went into the confidence
    pub fn contributing_layers(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|l| l.signal().is_some())
            .map(|l| l.name.as_str())
            .collect()
    }
}

pub struct FallbackPipeline {
    layers: Vec<Arc<dyn SignalDetector>>,
    layer_timeout: Duration,
}

impl FallbackPipeline {
    pub fn new(layer_timeout: Duration) -> Self {
        Self {
            layers: Vec::new(),
            layer_timeout,
        }
    }

    /// Append a layer; order within a tier is attempt order
    pub fn with_layer(mut self, layer: Arc<dyn SignalDetector>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub async fn run(&self, image: &[u8], challenge: Option<&LivenessChallenge>) -> PipelineOutcome {
        let mut reports = Vec::with_capacity(self.layers.len());

        let (local, remote): (Vec<&dyn SignalDetector>, Vec<&dyn SignalDetector>) = self
            .layers
            .iter()
            .map(|l| l.as_ref())
            .partition(|l| l.tier() == LayerTier::Local);

        for layer in &local {
            reports.push(self.attempt(*layer, image, challenge).await);
        }

        let local_signals = reports.iter().filter(|r| r.signal().is_some()).count();

        for layer in &remote {
            if local_signals > 0 {
                reports.push(LayerReport {
                    name: layer.name().to_string(),
                    tier: LayerTier::Remote,
                    status: LayerStatus::Skipped,
                    elapsed_ms: 0,
                });
            } else {
                reports.push(self.attempt(*layer, image, challenge).await);
            }
        }

        let signals: Vec<f64> = reports.iter().filter_map(LayerReport::signal).collect();
        let confidence = if signals.is_empty() {
            None
        } else {
            Some(signals.iter().sum::<f64>() / signals.len() as f64)
        };

        let quality = if local_signals > 0 && local_signals == local.len() {
            SignalQuality::Full
        } else if local_signals > 0 {
            SignalQuality::Partial
        } else if confidence.is_some() {
            SignalQuality::RemoteOnly
        } else {
            SignalQuality::Unavailable
        };

        let outcome = PipelineOutcome {
            confidence,
            quality,
            layers: reports,
        };

        if quality == SignalQuality::Unavailable {
            warn!(layers = ?outcome.executed_layers(), "no liveness layer produced a usable signal");
        } else {
            info!(
                confidence = ?outcome.confidence,
                quality = ?outcome.quality,
                contributing = ?outcome.contributing_layers(),
                "liveness pipeline complete"
            );
        }
        outcome
    }

    async fn attempt(
        &self,
        layer: &dyn SignalDetector,
        image: &[u8],
        challenge: Option<&LivenessChallenge>,
    ) -> LayerReport {
        let started = Instant::now();
        let result = with_timeout(self.layer_timeout, layer.detect(image, challenge)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let status = match result {
            Ok(DetectorOutcome::Signal(score)) if score.is_finite() => LayerStatus::Signal {
                confidence: score.clamp(0.0, 1.0),
            },
            Ok(DetectorOutcome::Signal(score)) => LayerStatus::Error {
                error: format!("non-finite confidence {}", score),
            },
            Ok(DetectorOutcome::Unavailable(reason)) => LayerStatus::Unavailable { reason },
            Err(e) => {
                warn!(layer = layer.name(), error = %e, "liveness layer failed");
                LayerStatus::Error {
                    error: e.to_string(),
                }
            }
        };

        debug!(layer = layer.name(), status = ?status, elapsed_ms, "liveness layer attempted");

        LayerReport {
            name: layer.name().to_string(),
            tier: layer.tier(),
            status,
            elapsed_ms,
        }
    }
}

/// Adapts an external [`LivenessDetector`] as a local layer
pub struct CollaboratorLayer {
    name: String,
    detector: Arc<dyn LivenessDetector>,
}

impl CollaboratorLayer {
    pub fn new(name: impl Into<String>, detector: Arc<dyn LivenessDetector>) -> Self {
        Self {
            name: name.into(),
            detector,
        }
    }
}

#[async_trait]
impl SignalDetector for CollaboratorLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> LayerTier {
        LayerTier::Local
    }

    async fn detect(
        &self,
        image: &[u8],
        challenge: Option<&LivenessChallenge>,
    ) -> Result<DetectorOutcome, CollaboratorError> {
        match self.detector.detect_liveness(image, challenge).await {
            Ok(score) => Ok(DetectorOutcome::Signal(score)),
            Err(CollaboratorError::Unavailable(reason)) => Ok(DetectorOutcome::Unavailable(reason)),
            Err(e) => Err(e),
        }
    }
}
