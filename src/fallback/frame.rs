//! Raw frame decoding for the heuristic detector.
//!
//! Only binary PPM (`P6`, 8-bit) is understood. Capture clients that want the
//! heuristic layer to participate send an uncompressed frame; anything else is
//! reported as an unsupported format and the layer stands aside.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Unsupported frame format")]
    UnsupportedFormat,

    #[error("Malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("Frame truncated: expected {expected} bytes of pixel data, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Decoded RGB frame, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<[u8; 3]>,
}

impl RgbFrame {
    pub fn new(width: usize, height: usize, pixels: Vec<[u8; 3]>) -> Option<Self> {
        (pixels.len() == width * height).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        self.pixels[y * self.width + x]
    }

    /// Rec. 601 luma
    pub fn luma(&self, x: usize, y: usize) -> f64 {
        let [r, g, b] = self.pixel(x, y);
        0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64
    }

    /// Encode as binary PPM
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.reserve(self.pixels.len() * 3);
        for px in &self.pixels {
            out.extend_from_slice(px);
        }
        out
    }
}

pub trait FrameDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<RgbFrame, FrameError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PpmDecoder;

impl FrameDecoder for PpmDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<RgbFrame, FrameError> {
        if !bytes.starts_with(b"P6") {
            return Err(FrameError::UnsupportedFormat);
        }

        let mut cursor = HeaderCursor { bytes, pos: 2 };
        let width = cursor.next_number("width")?;
        let height = cursor.next_number("height")?;
        let max_value = cursor.next_number("max value")?;

        if width == 0 || height == 0 {
            return Err(FrameError::MalformedHeader("zero dimension".into()));
        }
        if max_value == 0 || max_value > 255 {
            return Err(FrameError::MalformedHeader(format!(
                "max value {} not supported",
                max_value
            )));
        }

        // Exactly one whitespace byte separates the header from pixel data
        match bytes.get(cursor.pos) {
            Some(b) if b.is_ascii_whitespace() => cursor.pos += 1,
            _ => return Err(FrameError::MalformedHeader("missing raster separator".into())),
        }

        let expected = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| FrameError::MalformedHeader("dimensions overflow".into()))?;
        let raster = &bytes[cursor.pos..];
        if raster.len() < expected {
            return Err(FrameError::Truncated {
                expected,
                actual: raster.len(),
            });
        }

        let scale = |v: u8| -> u8 {
            if max_value == 255 {
                v
            } else {
                ((v as usize * 255) / max_value).min(255) as u8
            }
        };

        let pixels = raster[..expected]
            .chunks_exact(3)
            .map(|c| [scale(c[0]), scale(c[1]), scale(c[2])])
            .collect();

        Ok(RgbFrame {
            width,
            height,
            pixels,
        })
    }
}

struct HeaderCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl HeaderCursor<'_> {
    fn skip_whitespace_and_comments(&mut self) {
        while let Some(&b) = self.bytes.get(self.pos) {
            if b == b'#' {
                while let Some(&c) = self.bytes.get(self.pos) {
                    self.pos += 1;
                    if c == b'\n' {
                        break;
                    }
                }
            } else if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn next_number(&mut self, what: &str) -> Result<usize, FrameError> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FrameError::MalformedHeader(format!("missing {}", what)))
    }
}
