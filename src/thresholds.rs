//! Threshold Provider & Score Validator
//!
//! Thresholds are resolved per tenant and per environment. There is no shared
//! "current thresholds" state: a [`ThresholdProvider`] is built from config and
//! passed to whoever needs it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Environment, ScoreBundle};

/// Pass/fail cutoffs for each scored check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub face_match: f64,
    pub liveness: f64,
    pub cross_validation: f64,
    pub photo_consistency: f64,
}

impl ThresholdSet {
    pub const PRODUCTION: ThresholdSet = ThresholdSet {
        face_match: 0.85,
        liveness: 0.75,
        cross_validation: 0.70,
        photo_consistency: 0.70,
    };

    /// Looser bars for integration testing without real biometric capture
    pub const SANDBOX: ThresholdSet = ThresholdSet {
        face_match: 0.60,
        liveness: 0.50,
        cross_validation: 0.50,
        photo_consistency: 0.50,
    };

    pub fn get(&self, check: ScoreCheck) -> f64 {
        match check {
            ScoreCheck::FaceMatch => self.face_match,
            ScoreCheck::Liveness => self.liveness,
            ScoreCheck::CrossValidation => self.cross_validation,
            ScoreCheck::PhotoConsistency => self.photo_consistency,
        }
    }

    pub(crate) fn invalid_field(&self) -> Option<&'static str> {
        ScoreCheck::ALL
            .into_iter()
            .find(|c| !(0.0..=1.0).contains(&self.get(*c)))
            .map(|c| c.as_str())
    }
}

/// What to do when a fraud-relevant photo check could not run at all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoCheckErrorPolicy {
    /// Treat the outage as a failed fraud check
    #[default]
    FailClosed,
    /// Escalate to a human instead of rejecting
    ManualReview,
}

/// Everything the decision engine needs for one tenant + environment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    pub thresholds: ThresholdSet,
    pub photo_check_error: PhotoCheckErrorPolicy,
}

/// Default threshold table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTable {
    pub production: ThresholdSet,
    pub sandbox: ThresholdSet,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            production: ThresholdSet::PRODUCTION,
            sandbox: ThresholdSet::SANDBOX,
        }
    }
}

impl ThresholdTable {
    pub fn for_environment(&self, environment: Environment) -> ThresholdSet {
        match environment {
            Environment::Production => self.production,
            Environment::Sandbox => self.sandbox,
        }
    }
}

/// Per-tenant overrides; any missing environment falls back to the defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantOverride {
    #[serde(default)]
    pub production: Option<ThresholdSet>,
    #[serde(default)]
    pub sandbox: Option<ThresholdSet>,
    #[serde(default)]
    pub photo_check_error: Option<PhotoCheckErrorPolicy>,
}

/// Resolves thresholds for `(tenant, environment)`
#[derive(Debug, Clone, Default)]
pub struct ThresholdProvider {
    defaults: ThresholdTable,
    overrides: HashMap<String, TenantOverride>,
}

impl ThresholdProvider {
    pub fn new(defaults: ThresholdTable, overrides: HashMap<String, TenantOverride>) -> Self {
        Self {
            defaults,
            overrides,
        }
    }

    pub fn with_override(mut self, tenant_id: impl Into<String>, o: TenantOverride) -> Self {
        self.overrides.insert(tenant_id.into(), o);
        self
    }

    pub fn resolve_thresholds(&self, tenant_id: &str, is_sandbox: bool) -> ThresholdSet {
        let environment = if is_sandbox {
            Environment::Sandbox
        } else {
            Environment::Production
        };
        self.resolve(tenant_id, environment).thresholds
    }

    pub fn resolve(&self, tenant_id: &str, environment: Environment) -> DecisionPolicy {
        let tenant = self.overrides.get(tenant_id);

        let thresholds = tenant
            .and_then(|o| match environment {
                Environment::Production => o.production,
                Environment::Sandbox => o.sandbox,
            })
            .unwrap_or_else(|| self.defaults.for_environment(environment));

        DecisionPolicy {
            thresholds,
            photo_check_error: tenant
                .and_then(|o| o.photo_check_error)
                .unwrap_or_default(),
        }
    }
}

// ============================================================================
// Score Validator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreCheck {
    FaceMatch,
    Liveness,
    CrossValidation,
    PhotoConsistency,
}

impl ScoreCheck {
    pub const ALL: [ScoreCheck; 4] = [
        Self::FaceMatch,
        Self::Liveness,
        Self::CrossValidation,
        Self::PhotoConsistency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FaceMatch => "face_match",
            Self::Liveness => "liveness",
            Self::CrossValidation => "cross_validation",
            Self::PhotoConsistency => "photo_consistency",
        }
    }

    fn score(&self, scores: &ScoreBundle) -> Option<f64> {
        match self {
            Self::FaceMatch => scores.face_match,
            Self::Liveness => scores.liveness,
            Self::CrossValidation => scores.cross_validation,
            Self::PhotoConsistency => scores.photo_consistency,
        }
    }
}

/// Verdict for one present score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckVerdict {
    pub check: ScoreCheck,
    pub score: f64,
    pub threshold: f64,
    pub passed: bool,
    /// score - threshold
    pub margin: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreValidation {
    pub verdicts: Vec<CheckVerdict>,
}

impl ScoreValidation {
    pub fn all_passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }

    pub fn verdict(&self, check: ScoreCheck) -> Option<&CheckVerdict> {
        self.verdicts.iter().find(|v| v.check == check)
    }

    pub fn failed(&self, check: ScoreCheck) -> bool {
        self.verdict(check).map(|v| !v.passed).unwrap_or(false)
    }
}

/// Apply thresholds to every present score. Absent scores produce no verdict.
pub fn validate_scores(scores: &ScoreBundle, thresholds: &ThresholdSet) -> ScoreValidation {
    let verdicts = ScoreCheck::ALL
        .into_iter()
        .filter_map(|check| {
            let score = check.score(scores)?;
            let threshold = thresholds.get(check);
            Some(CheckVerdict {
                check,
                score,
                threshold,
                passed: score >= threshold,
                margin: score - threshold,
            })
        })
        .collect();

    ScoreValidation { verdicts }
}
