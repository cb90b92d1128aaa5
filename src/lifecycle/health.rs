// src/lifecycle/health.rs

//! Storage health classification

use super::probe::StorageUsage;
use super::retention::RetentionPolicy;
use crate::db::models::CleanupRecord;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Usage ratios separating the health states
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub warning: f64,
    pub cleanup: f64,
    pub critical: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning: 0.70,
            cleanup: 0.75,
            critical: 0.85,
        }
    }
}

impl HealthThresholds {
    /// Thresholds must be ordered within (0, 1]
    pub fn validate(&self) -> Result<()> {
        let ordered = 0.0 < self.warning
            && self.warning <= self.cleanup
            && self.cleanup <= self.critical
            && self.critical <= 1.0;
        if !ordered {
            return Err(Error::InvalidInput(format!(
                "Thresholds must satisfy 0 < warning <= cleanup <= critical <= 1 (got {}, {}, {})",
                self.warning, self.cleanup, self.critical
            )));
        }
        Ok(())
    }

    pub fn classify(&self, ratio: f64) -> HealthStatus {
        if ratio >= self.critical {
            HealthStatus::Critical
        } else if ratio >= self.cleanup {
            HealthStatus::NeedsCleanup
        } else if ratio >= self.warning {
            HealthStatus::Caution
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Caution,
    NeedsCleanup,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Caution => "caution",
            HealthStatus::NeedsCleanup => "needs_cleanup",
            HealthStatus::Critical => "critical",
        }
    }

    /// Whether a cleanup run should be started
    pub fn needs_cleanup(&self) -> bool {
        matches!(self, HealthStatus::NeedsCleanup | HealthStatus::Critical)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot returned by `check_health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_ratio: f64,
    pub thresholds: HealthThresholds,
    /// Available package bytes per kind
    pub bytes_by_kind: BTreeMap<String, i64>,
    pub retention: RetentionPolicy,
    pub last_cleanup: Option<CleanupRecord>,
    pub recommendations: Vec<String>,
}

/// Operator advice for a usage level
pub fn recommendations(status: HealthStatus, usage: &StorageUsage, thresholds: &HealthThresholds) -> Vec<String> {
    let percent = usage.ratio() * 100.0;
    match status {
        HealthStatus::Healthy => Vec::new(),
        HealthStatus::Caution => vec![format!(
            "Storage at {:.1}%; cleanup starts at {:.0}%",
            percent,
            thresholds.cleanup * 100.0
        )],
        HealthStatus::NeedsCleanup => vec![
            format!("Storage at {:.1}%; run a cleanup", percent),
            "Lower retention limits for patch and hotfix packages".to_string(),
        ],
        HealthStatus::Critical => vec![
            format!(
                "Storage at {:.1}%; uploads are rejected at {:.0}% after emergency cleanup",
                percent,
                thresholds.critical * 100.0
            ),
            "Run a cleanup now and lower the full package retention limit".to_string(),
            "Unprotect versions that no longer need to be kept".to_string(),
            "Add storage capacity".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_boundaries() {
        let t = HealthThresholds::default();
        assert_eq!(t.classify(0.0), HealthStatus::Healthy);
        assert_eq!(t.classify(0.6999), HealthStatus::Healthy);
        assert_eq!(t.classify(0.70), HealthStatus::Caution);
        assert_eq!(t.classify(0.75), HealthStatus::NeedsCleanup);
        assert_eq!(t.classify(0.8499), HealthStatus::NeedsCleanup);
        assert_eq!(t.classify(0.85), HealthStatus::Critical);
        assert_eq!(t.classify(1.2), HealthStatus::Critical);
    }

    #[test]
    fn test_validate_ordering() {
        assert!(HealthThresholds::default().validate().is_ok());
        let bad = HealthThresholds {
            warning: 0.8,
            cleanup: 0.7,
            critical: 0.9,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_recommendations_grow_with_severity() {
        let t = HealthThresholds::default();
        let usage = StorageUsage::new(100, 90);
        assert!(recommendations(HealthStatus::Healthy, &usage, &t).is_empty());
        assert!(
            recommendations(HealthStatus::Critical, &usage, &t).len()
                > recommendations(HealthStatus::Caution, &usage, &t).len()
        );
    }
}
