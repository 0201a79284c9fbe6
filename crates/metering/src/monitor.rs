//! Grace period enforcement and consistency checks
//!
//! The grace sweep walks organizations in degraded payment standing and
//! blocks those whose grace window has lapsed. The consistency checks are
//! read-only; they report violations with enough context to debug but never
//! mutate state themselves.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::MeteringResult;
use crate::store::MeteringStore;

/// A single detected consistency violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthViolation {
    /// Which check was violated
    pub check: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Accounting may be wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of one consistency check run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<HealthViolation>,
    pub healthy: bool,
}

/// Outcome of one grace sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraceSweepReport {
    /// Degraded organizations examined
    pub examined: usize,
    /// Still inside their grace window
    pub within_grace: usize,
    /// Newly blocked this sweep
    pub blocked: usize,
    /// Errors, isolated per organization
    pub failed: usize,
}

/// Enforces grace deadlines and runs consistency checks
pub struct HealthMonitor {
    store: Arc<dyn MeteringStore>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    /// Block degraded organizations whose grace window has lapsed.
    ///
    /// Organizations still inside their window are left alone; access
    /// continues until the deadline. A degraded organization with no
    /// recorded deadline is treated as lapsed (fail-closed). Blocking is
    /// conditional in the store, so a concurrent sweep blocks each
    /// organization at most once.
    pub async fn run_grace_sweep(&self, now: OffsetDateTime) -> MeteringResult<GraceSweepReport> {
        let degraded = self.store.organizations_in_degraded_state().await?;
        let mut report = GraceSweepReport {
            examined: degraded.len(),
            ..Default::default()
        };

        for org in degraded {
            match org.grace_period_ends_at {
                Some(deadline) if deadline > now => {
                    tracing::debug!(
                        org_id = %org.id,
                        deadline = %deadline,
                        "Organization within grace window"
                    );
                    report.within_grace += 1;
                }
                deadline => {
                    let reason = match deadline {
                        Some(d) => format!("grace period expired at {d}"),
                        None => "payment past due with no grace deadline recorded".to_string(),
                    };
                    match self.store.block_organization(org.id, &reason, now).await {
                        Ok(true) => {
                            tracing::warn!(
                                org_id = %org.id,
                                reason = %reason,
                                "Blocked organization after grace period"
                            );
                            report.blocked += 1;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!(org_id = %org.id, error = %e, "Failed to block organization");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            within_grace = report.within_grace,
            blocked = report.blocked,
            failed = report.failed,
            "Grace sweep complete"
        );
        Ok(report)
    }

    /// Run all consistency checks and return a summary
    pub async fn run_all_checks(&self, now: OffsetDateTime) -> MeteringResult<HealthCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_no_negative_counters().await?);
        violations.extend(self.check_no_stuck_holds(now).await?);
        violations.extend(self.check_grace_deadline_recorded().await?);

        let checks_run = 3;
        let checks_failed = violations
            .iter()
            .map(|v| &v.check)
            .collect::<std::collections::HashSet<_>>()
            .len();

        let summary = HealthCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };

        if summary.healthy {
            tracing::info!(checks_run, "Consistency checks passed");
        } else {
            for v in &summary.violations {
                tracing::warn!(
                    check = %v.check,
                    severity = %v.severity,
                    description = %v.description,
                    "Consistency violation"
                );
            }
        }
        Ok(summary)
    }

    /// No usage counter may ever go negative. Any negative counter means an
    /// update bypassed the admission arithmetic.
    async fn check_no_negative_counters(&self) -> MeteringResult<Vec<HealthViolation>> {
        let org_ids = self.store.negative_counter_orgs().await?;
        if org_ids.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![HealthViolation {
            check: "no_negative_counters".to_string(),
            description: format!(
                "{} organization(s) have a negative usage counter",
                org_ids.len()
            ),
            context: serde_json::json!({ "count": org_ids.len() }),
            org_ids,
            severity: ViolationSeverity::Critical,
        }])
    }

    /// Holds older than twice their own TTL are still `held`. The expiry
    /// sweep should have caught them; if it has not, it is likely not
    /// running. Each hold is judged against its own TTL so long custom-TTL
    /// holds are not flagged early.
    async fn check_no_stuck_holds(&self, now: OffsetDateTime) -> MeteringResult<Vec<HealthViolation>> {
        let held = self.store.held_reservations().await?;
        let stuck: Vec<_> = held
            .into_iter()
            .filter(|r| now - r.expires_at > r.expires_at - r.created_at)
            .collect();
        if stuck.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![HealthViolation {
            check: "no_stuck_holds".to_string(),
            org_ids: stuck.iter().map(|r| r.org_id).collect(),
            description: format!(
                "{} reservation(s) remain held long past expiry; is the sweep running?",
                stuck.len()
            ),
            context: serde_json::json!({
                "reservation_ids": stuck.iter().map(|r| r.id).collect::<Vec<_>>(),
            }),
            severity: ViolationSeverity::High,
        }])
    }

    /// Every degraded organization should carry a grace deadline; without one
    /// the sweep blocks it immediately, which may surprise support.
    async fn check_grace_deadline_recorded(&self) -> MeteringResult<Vec<HealthViolation>> {
        let degraded = self.store.organizations_in_degraded_state().await?;
        let missing: Vec<_> = degraded
            .into_iter()
            .filter(|o| o.grace_period_ends_at.is_none())
            .collect();
        if missing.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![HealthViolation {
            check: "grace_deadline_recorded".to_string(),
            org_ids: missing.iter().map(|o| o.id).collect(),
            description: format!(
                "{} past-due organization(s) have no grace deadline recorded",
                missing.len()
            ),
            context: serde_json::json!({
                "org_names": missing.iter().map(|o| o.name.clone()).collect::<Vec<_>>(),
            }),
            severity: ViolationSeverity::Medium,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }
}
