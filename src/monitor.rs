//! Consistency Monitor
//!
//! Periodic auditor over recently decided sessions. Each pass re-derives the
//! status implied by the stored facts, compares it to the stored status and
//! makes one repair attempt per inconsistent session version. A cumulative
//! consistency rate is tracked; falling below the configured floor raises a
//! degraded signal.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::decision::evaluate;
use crate::error::Result;
use crate::manager::{RecalculationOutcome, VerificationStateManager};

/// Backoff after a failed pass
const ERROR_BACKOFF_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between audit passes
    #[serde(with = "secs")]
    pub interval: Duration,
    /// How far back a pass looks for updated terminal sessions
    #[serde(with = "secs")]
    pub lookback: Duration,
    pub batch_limit: usize,
    /// Minimum acceptable consistency rate, 0..=1
    pub consistency_floor: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: Duration::from_secs(24 * 60 * 60),
            batch_limit: 500,
            consistency_floor: 0.90,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Outcome of a single audit pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub audited: usize,
    pub consistent: usize,
    pub repaired: usize,
    pub repair_failed: usize,
    /// Inconsistent, but a repair for this version was already attempted
    /// or the stored facts do not reach a decision
    pub skipped: usize,
    pub repaired_sessions: Vec<Uuid>,
}

impl AuditReport {
    /// Share of audited sessions that were consistent before repair
    pub fn rate(&self) -> f64 {
        if self.audited == 0 {
            1.0
        } else {
            self.consistent as f64 / self.audited as f64
        }
    }
}

/// Cumulative counters across passes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyStats {
    pub passes: u64,
    pub audited: u64,
    pub consistent: u64,
    pub repaired: u64,
    pub repair_failed: u64,
}

impl ConsistencyStats {
    pub fn rate(&self) -> f64 {
        if self.audited == 0 {
            1.0
        } else {
            self.consistent as f64 / self.audited as f64
        }
    }

    fn absorb(&mut self, report: &AuditReport) {
        self.passes += 1;
        self.audited += report.audited as u64;
        self.consistent += report.consistent as u64;
        self.repaired += report.repaired as u64;
        self.repair_failed += report.repair_failed as u64;
    }
}

pub struct ConsistencyMonitor {
    manager: Arc<VerificationStateManager>,
    config: MonitorConfig,
    stats: Mutex<ConsistencyStats>,
    /// session id -> version whose repair already failed
    attempted: Mutex<HashMap<Uuid, u64>>,
}

impl ConsistencyMonitor {
    pub fn new(manager: Arc<VerificationStateManager>, config: MonitorConfig) -> Self {
        Self {
            manager,
            config,
            stats: Mutex::new(ConsistencyStats::default()),
            attempted: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub async fn stats(&self) -> ConsistencyStats {
        self.stats.lock().await.clone()
    }

    /// Cumulative consistency rate is below the configured floor
    pub async fn is_degraded(&self) -> bool {
        self.stats.lock().await.rate() < self.config.consistency_floor
    }

    /// Run one audit pass over recently updated terminal sessions
    pub async fn audit_once(&self) -> Result<AuditReport> {
        let lookback = chrono::Duration::from_std(self.config.lookback)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let since = Utc::now() - lookback;

        let sessions = self
            .manager
            .store()
            .list_terminal_since(since, self.config.batch_limit)
            .await?;

        let mut report = AuditReport::default();
        let mut attempted = self.attempted.lock().await;

        // Forget sessions that aged out of the look-back window
        let batch: HashSet<Uuid> = sessions.iter().map(|s| s.id).collect();
        attempted.retain(|id, _| batch.contains(id));

        for session in sessions {
            report.audited += 1;
            let policy = self.manager.policy_for(&session);
            let decision = evaluate(&session, &policy);

            if decision.status == session.status {
                report.consistent += 1;
                attempted.remove(&session.id);
                continue;
            }

            if attempted.get(&session.id) == Some(&session.version) {
                debug!(session_id = %session.id, version = session.version, "repair already attempted for this version");
                report.skipped += 1;
                continue;
            }

            warn!(
                session_id = %session.id,
                tenant_id = %session.tenant_id,
                stored = %session.status,
                derived = %decision.status,
                derived_classification = ?decision.classification,
                "inconsistent verification status"
            );

            match self.manager.recalculate_consistent_scores(session.id).await {
                Ok(r) => match r.outcome {
                    RecalculationOutcome::Repaired => {
                        report.repaired += 1;
                        report.repaired_sessions.push(session.id);
                        attempted.remove(&session.id);
                    }
                    // Changed under us and is now consistent
                    RecalculationOutcome::Consistent => {
                        attempted.remove(&session.id);
                    }
                    RecalculationOutcome::Indeterminate => {
                        report.skipped += 1;
                        attempted.insert(session.id, session.version);
                    }
                    RecalculationOutcome::Conflict => {
                        report.repair_failed += 1;
                        attempted.insert(session.id, session.version);
                    }
                },
                Err(e) => {
                    error!(session_id = %session.id, error = %e, "repair failed");
                    report.repair_failed += 1;
                    attempted.insert(session.id, session.version);
                }
            }
        }
        drop(attempted);

        let cumulative_rate = {
            let mut stats = self.stats.lock().await;
            stats.absorb(&report);
            stats.rate()
        };

        info!(
            audited = report.audited,
            consistent = report.consistent,
            repaired = report.repaired,
            repair_failed = report.repair_failed,
            skipped = report.skipped,
            rate = report.rate(),
            "consistency audit complete"
        );

        if cumulative_rate < self.config.consistency_floor {
            warn!(
                rate = cumulative_rate,
                floor = self.config.consistency_floor,
                "verification consistency below floor"
            );
        }

        Ok(report)
    }

    /// Audit loop (blocks until shutdown signal)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "consistency monitor started");

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.audit_once().await {
                error!(error = %e, "consistency audit failed");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ERROR_BACKOFF_MS)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("consistency monitor shutting down");
    }
}
