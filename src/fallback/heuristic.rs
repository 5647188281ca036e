//! Secondary liveness heuristic.
//!
//! Weak signal analysis on a raw frame: left/right symmetry, local texture
//! variation (printed photos and screens are flat) and colour-channel
//! ordering typical of skin under visible light.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::frame::{FrameDecoder, FrameError, PpmDecoder, RgbFrame};
use super::{DetectorOutcome, LayerTier, SignalDetector};
use crate::collaborators::{CollaboratorError, LivenessChallenge};

const MIN_DIMENSION: usize = 16;
/// Mean neighbour luma delta treated as fully textured
const TEXTURE_SATURATION: f64 = 24.0;
/// Mean mirrored luma delta treated as fully asymmetric
const SYMMETRY_SATURATION: f64 = 96.0;

const SYMMETRY_WEIGHT: f64 = 0.40;
const TEXTURE_WEIGHT: f64 = 0.35;
const COLOUR_WEIGHT: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeuristicScores {
    pub symmetry: f64,
    pub texture: f64,
    pub colour_consistency: f64,
}

impl HeuristicScores {
    pub fn combined(&self) -> f64 {
        SYMMETRY_WEIGHT * self.symmetry
            + TEXTURE_WEIGHT * self.texture
            + COLOUR_WEIGHT * self.colour_consistency
    }
}

pub struct HeuristicLivenessDetector {
    decoder: Arc<dyn FrameDecoder>,
}

impl Default for HeuristicLivenessDetector {
    fn default() -> Self {
        Self::new(Arc::new(PpmDecoder))
    }
}

impl HeuristicLivenessDetector {
    pub fn new(decoder: Arc<dyn FrameDecoder>) -> Self {
        Self { decoder }
    }

    pub fn analyze(frame: &RgbFrame) -> HeuristicScores {
        HeuristicScores {
            symmetry: symmetry(frame),
            texture: texture(frame),
            colour_consistency: colour_consistency(frame),
        }
    }
}

fn symmetry(frame: &RgbFrame) -> f64 {
    let half = frame.width / 2;
    let mut total = 0.0;
    for y in 0..frame.height {
        for x in 0..half {
            total += (frame.luma(x, y) - frame.luma(frame.width - 1 - x, y)).abs();
        }
    }
    let samples = (half * frame.height).max(1) as f64;
    (1.0 - (total / samples) / SYMMETRY_SATURATION).clamp(0.0, 1.0)
}

fn texture(frame: &RgbFrame) -> f64 {
    let mut total = 0.0;
    let mut samples = 0usize;
    for y in 0..frame.height.saturating_sub(1) {
        for x in 0..frame.width.saturating_sub(1) {
            let here = frame.luma(x, y);
            total += (here - frame.luma(x + 1, y)).abs() + (here - frame.luma(x, y + 1)).abs();
            samples += 2;
        }
    }
    ((total / samples.max(1) as f64) / TEXTURE_SATURATION).clamp(0.0, 1.0)
}

/// Share of pixels with red > green >= blue
fn colour_consistency(frame: &RgbFrame) -> f64 {
    let skin_like = frame
        .pixels
        .iter()
        .filter(|[r, g, b]| r > g && g >= b)
        .count();
    skin_like as f64 / frame.pixels.len().max(1) as f64
}

#[async_trait]
impl SignalDetector for HeuristicLivenessDetector {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn tier(&self) -> LayerTier {
        LayerTier::Local
    }

    async fn detect(
        &self,
        image: &[u8],
        _challenge: Option<&LivenessChallenge>,
    ) -> Result<DetectorOutcome, CollaboratorError> {
        let frame = match self.decoder.decode(image) {
            Ok(frame) => frame,
            Err(FrameError::UnsupportedFormat) => {
                return Ok(DetectorOutcome::Unavailable("unsupported frame format".into()))
            }
            Err(e) => return Err(CollaboratorError::InvalidOutput(e.to_string())),
        };

        if frame.width < MIN_DIMENSION || frame.height < MIN_DIMENSION {
            return Ok(DetectorOutcome::Unavailable(format!(
                "frame {}x{} below {}px minimum",
                frame.width, frame.height, MIN_DIMENSION
            )));
        }

        let scores = Self::analyze(&frame);
        debug!(?scores, "heuristic liveness scores");
        Ok(DetectorOutcome::Signal(scores.combined()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from(width: usize, height: usize, f: impl Fn(usize, usize) -> [u8; 3]) -> RgbFrame {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        RgbFrame::new(width, height, pixels).unwrap()
    }

    /// Symmetric skin-toned face-ish frame with per-pixel texture
    fn lively() -> RgbFrame {
        frame_from(32, 32, |x, y| {
            let mx = x.min(31 - x);
            let grain = ((mx * 7 + y * 13) % 5) as u8 * 12;
            [180 + grain / 2, 130 + grain / 3, 100]
        })
    }

    fn flat_grey() -> RgbFrame {
        frame_from(32, 32, |_, _| [128, 128, 128])
    }

    #[test]
    fn test_flat_grey_scores_low() {
        let scores = HeuristicLivenessDetector::analyze(&flat_grey());
        assert_eq!(scores.texture, 0.0);
        assert_eq!(scores.colour_consistency, 0.0);
        assert_eq!(scores.symmetry, 1.0);
    }

    #[test]
    fn test_textured_skin_scores_higher_than_flat() {
        let live = HeuristicLivenessDetector::analyze(&lively());
        let flat = HeuristicLivenessDetector::analyze(&flat_grey());
        assert_eq!(live.symmetry, 1.0);
        assert_eq!(live.colour_consistency, 1.0);
        assert!(live.texture > 0.0);
        assert!(live.combined() > flat.combined());
    }

    #[tokio::test]
    async fn test_detect_stands_aside_for_unsupported_input() {
        let detector = HeuristicLivenessDetector::default();
        let outcome = detector.detect(b"\xff\xd8jpeg", None).await.unwrap();
        assert!(matches!(outcome, DetectorOutcome::Unavailable(_)));

        let tiny = frame_from(4, 4, |_, _| [200, 150, 100]).to_ppm();
        let outcome = detector.detect(&tiny, None).await.unwrap();
        assert!(matches!(outcome, DetectorOutcome::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_detect_produces_signal_for_ppm() {
        let detector = HeuristicLivenessDetector::default();
        let outcome = detector.detect(&lively().to_ppm(), None).await.unwrap();
        match outcome {
            DetectorOutcome::Signal(score) => assert!(score > 0.65 && score <= 1.0),
            other => panic!("expected signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_ppm_is_an_error() {
        let detector = HeuristicLivenessDetector::default();
        let result = detector.detect(b"P6 32 32 255\n\x00", None).await;
        assert!(matches!(result, Err(CollaboratorError::InvalidOutput(_))));
    }
}
