//! Cross-Validation Engine
//!
//! Compares data extracted from the front and back of a document, and
//! separately compares the two document photos for same-person consistency.
//!
//! An unreliable extraction (nothing comparable) is reported through
//! `requires_manual_review`, never as a mismatch.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::collaborators::{CollaboratorError, FaceComparator};
use crate::types::FieldMap;

/// Match score reported when no field could be compared
pub const UNCERTAIN_MATCH_SCORE: f64 = 0.5;

/// Minimum Jaro-Winkler similarity for issuing-authority names
const AUTHORITY_SIMILARITY_THRESHOLD: f64 = 0.88;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%d-%m-%Y", "%Y%m%d", "%m%d%Y", "%d %b %Y",
];

/// Fields compared across document sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossField {
    IdNumber,
    ExpiryDate,
    IssuingAuthority,
}

impl CrossField {
    pub const ALL: [CrossField; 3] = [Self::IdNumber, Self::ExpiryDate, Self::IssuingAuthority];

    /// Keys the OCR engine and barcode decoder use for this field
    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::IdNumber => &[
                "document_number",
                "id_number",
                "license_number",
                "customer_id_number",
                "DAQ",
            ],
            Self::ExpiryDate => &["expiration_date", "expiry_date", "date_of_expiry", "DBA"],
            Self::IssuingAuthority => &[
                "issuing_authority",
                "issuer",
                "issuing_jurisdiction",
                "issuing_state",
            ],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::IdNumber => "ID number",
            Self::ExpiryDate => "Expiry date",
            Self::IssuingAuthority => "Issuing authority",
        }
    }

    fn lookup(&self, fields: &FieldMap) -> Option<String> {
        self.aliases().iter().find_map(|key| {
            let value = fields.get(*key)?;
            let text = match value {
                serde_json::Value::String(s) => s.trim().to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            (!text.is_empty()).then_some(text)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldVerdict {
    Matched,
    Mismatched,
    /// Missing on one side or unparseable
    Indeterminate,
}

/// Outcome of comparing front and back data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationResult {
    /// matched / comparable, or 0.5 when nothing was comparable
    pub match_score: f64,
    pub field_verdicts: BTreeMap<CrossField, FieldVerdict>,
    pub discrepancies: Vec<String>,
    /// Extraction too unreliable to compare (signal unavailable)
    pub requires_manual_review: bool,
    /// At least one field compared and none disagreed
    pub documents_match: bool,
}

impl CrossValidationResult {
    pub fn comparable_fields(&self) -> usize {
        self.field_verdicts
            .values()
            .filter(|v| **v != FieldVerdict::Indeterminate)
            .count()
    }
}

pub struct CrossValidationEngine {
    face_comparator: Arc<dyn FaceComparator>,
}

impl CrossValidationEngine {
    pub fn new(face_comparator: Arc<dyn FaceComparator>) -> Self {
        Self { face_comparator }
    }

    pub fn cross_validate(&self, front: &FieldMap, back: &FieldMap) -> CrossValidationResult {
        cross_validate(front, back)
    }

    /// Same-person check between the two document photos.
    ///
    /// Errors are returned unchanged; the caller records them fail-closed.
    pub async fn compare_photos(
        &self,
        front_image: &[u8],
        back_image: &[u8],
    ) -> Result<f64, CollaboratorError> {
        let similarity = self
            .face_comparator
            .compare_faces(front_image, back_image)
            .await?;
        if !similarity.is_finite() {
            return Err(CollaboratorError::InvalidOutput(format!(
                "photo similarity is not finite: {}",
                similarity
            )));
        }
        Ok(similarity.clamp(0.0, 1.0))
    }
}

/// Compare overlapping fields between front OCR output and back decode output
pub fn cross_validate(front: &FieldMap, back: &FieldMap) -> CrossValidationResult {
    let mut field_verdicts = BTreeMap::new();
    let mut discrepancies = Vec::new();
    let mut matched = 0usize;
    let mut comparable = 0usize;

    for field in CrossField::ALL {
        let verdict = match (field.lookup(front), field.lookup(back)) {
            (Some(f), Some(b)) => {
                let verdict = compare_field(field, &f, &b);
                if verdict == FieldVerdict::Mismatched {
                    discrepancies.push(format!(
                        "{} mismatch: front '{}' vs back '{}'",
                        field.label(),
                        f,
                        b
                    ));
                }
                verdict
            }
            _ => FieldVerdict::Indeterminate,
        };

        match verdict {
            FieldVerdict::Matched => {
                matched += 1;
                comparable += 1;
            }
            FieldVerdict::Mismatched => comparable += 1,
            FieldVerdict::Indeterminate => {}
        }
        field_verdicts.insert(field, verdict);
    }

    let match_score = if comparable == 0 {
        UNCERTAIN_MATCH_SCORE
    } else {
        matched as f64 / comparable as f64
    };

    debug!(
        matched,
        comparable,
        match_score,
        discrepancies = discrepancies.len(),
        "cross-validation complete"
    );

    CrossValidationResult {
        match_score,
        field_verdicts,
        documents_match: comparable > 0 && discrepancies.is_empty(),
        discrepancies,
        requires_manual_review: comparable == 0,
    }
}

fn compare_field(field: CrossField, front: &str, back: &str) -> FieldVerdict {
    match field {
        CrossField::IdNumber => {
            let (f, b) = (normalize_id(front), normalize_id(back));
            if f.is_empty() || b.is_empty() {
                FieldVerdict::Indeterminate
            } else if f == b {
                FieldVerdict::Matched
            } else {
                FieldVerdict::Mismatched
            }
        }
        CrossField::ExpiryDate => match (parse_date(front), parse_date(back)) {
            (Some(f), Some(b)) if f == b => FieldVerdict::Matched,
            (Some(_), Some(_)) => FieldVerdict::Mismatched,
            _ => {
                let (f, b) = (digits(front), digits(back));
                if f.is_empty() || b.is_empty() {
                    FieldVerdict::Indeterminate
                } else if f == b {
                    FieldVerdict::Matched
                } else {
                    FieldVerdict::Mismatched
                }
            }
        },
        CrossField::IssuingAuthority => {
            if normalize_authority(front).is_empty() || normalize_authority(back).is_empty() {
                FieldVerdict::Indeterminate
            } else if authorities_match(front, back) {
                FieldVerdict::Matched
            } else {
                FieldVerdict::Mismatched
            }
        }
    }
}

fn normalize_id(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn normalize_authority(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fuzzy: substring either way, or close Jaro-Winkler similarity
fn authorities_match(front: &str, back: &str) -> bool {
    let (f, b) = (normalize_authority(front), normalize_authority(back));
    if f.is_empty() || b.is_empty() {
        return false;
    }
    f.contains(&b) || b.contains(&f) || strsim::jaro_winkler(&f, &b) >= AUTHORITY_SIMILARITY_THRESHOLD
}
