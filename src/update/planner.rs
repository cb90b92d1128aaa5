// src/update/planner.rs

//! Incremental update planner
//!
//! Turns a manifest diff into an [`UpdatePlan`]: which files to add, delete,
//! replace in full, or patch. The planner never touches the registry.

use super::diff::{self, ModifiedEntry};
use super::manifest::Manifest;
use crate::delta::{DEFAULT_COMPRESSION_LEVEL, PatchEngine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Patch-vs-replace thresholds
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Files smaller than this (either side) are replaced
    pub min_patch_size: u64,
    /// Files larger than this (either side) are replaced
    pub max_patch_size: u64,
    /// Replace when `|new - old| / old` exceeds this
    pub max_size_ratio: f64,
    /// Patch only when `patch_size <= ratio * new_size`
    pub max_patch_ratio: f64,
    /// Bytes per second used for time estimates
    pub reference_rate: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_patch_size: 1024,
            max_patch_size: 100 * 1024 * 1024,
            max_size_ratio: 2.0,
            max_patch_ratio: 0.8,
            reference_rate: 1024 * 1024,
        }
    }
}

/// Why a modified file is shipped in full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceReason {
    TooSmall,
    TooLarge,
    TooDissimilar,
    PatchTooLarge,
}

/// Per-file decision for a modified path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchDecision {
    Patch { patch_size: u64, estimated: bool },
    Replace(ReplaceReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedFile {
    pub path: String,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacedFile {
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub reason: ReplaceReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchedFile {
    pub path: String,
    pub old_size: u64,
    pub old_hash: String,
    pub size: u64,
    pub hash: String,
    pub patch_size: u64,
    /// `false` when `patch_size` is the real size of an existing patch
    pub estimated: bool,
}

/// The set of file operations that moves one tree to another
///
/// Ephemeral: callers consume it and discard it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlan {
    pub to_add: Vec<PlannedFile>,
    pub to_delete: Vec<PlannedFile>,
    pub to_replace: Vec<ReplacedFile>,
    pub to_patch: Vec<PatchedFile>,
    pub unchanged: usize,
    /// Bytes that must cross the wire
    pub total_transfer_size: u64,
    /// Full size of every added or modified file
    pub total_original_size: u64,
    pub estimated_seconds: f64,
    /// `1 - total_transfer_size / total_original_size`
    pub compression_ratio: f64,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_delete.is_empty()
            && self.to_replace.is_empty()
            && self.to_patch.is_empty()
    }

    /// Number of files that need bytes transferred
    pub fn transfer_count(&self) -> usize {
        self.to_add.len() + self.to_replace.len() + self.to_patch.len()
    }
}

pub struct UpdatePlanner {
    config: PlannerConfig,
    engine: PatchEngine,
}

impl UpdatePlanner {
    pub fn new(config: PlannerConfig) -> Self {
        let engine = PatchEngine::new(DEFAULT_COMPRESSION_LEVEL, config.max_patch_ratio);
        Self { config, engine }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan using estimated patch sizes
    pub fn plan(&self, old: &Manifest, new: &Manifest) -> UpdatePlan {
        self.plan_with_patch_sizes(old, new, &HashMap::new())
    }

    /// Plan, preferring real patch sizes where `known` has them (keyed by path)
    pub fn plan_with_patch_sizes(
        &self,
        old: &Manifest,
        new: &Manifest,
        known: &HashMap<String, u64>,
    ) -> UpdatePlan {
        let diff = diff::diff(old, new);
        let mut plan = UpdatePlan {
            unchanged: diff.same.len(),
            ..Default::default()
        };

        for entry in diff.new {
            plan.to_add.push(PlannedFile {
                path: entry.path,
                size: entry.size,
                hash: entry.hash,
            });
        }
        for entry in diff.deleted {
            plan.to_delete.push(PlannedFile {
                path: entry.path,
                size: entry.size,
                hash: entry.hash,
            });
        }

        for modified in diff.modified {
            let decision = self.decide(&modified, known.get(&modified.path).copied());
            debug!("{}: {:?}", modified.path, decision);

            match decision {
                PatchDecision::Patch {
                    patch_size,
                    estimated,
                } => plan.to_patch.push(PatchedFile {
                    path: modified.path,
                    old_size: modified.old.size,
                    old_hash: modified.old.hash,
                    size: modified.new.size,
                    hash: modified.new.hash,
                    patch_size,
                    estimated,
                }),
                PatchDecision::Replace(reason) => plan.to_replace.push(ReplacedFile {
                    path: modified.path,
                    size: modified.new.size,
                    hash: modified.new.hash,
                    reason,
                }),
            }
        }

        self.aggregate(&mut plan);
        plan
    }

    /// Apply the patch-vs-replace policy in order
    pub fn decide(&self, modified: &ModifiedEntry, known_patch_size: Option<u64>) -> PatchDecision {
        let old_size = modified.old.size;
        let new_size = modified.new.size;
        let cfg = &self.config;

        if old_size < cfg.min_patch_size || new_size < cfg.min_patch_size {
            return PatchDecision::Replace(ReplaceReason::TooSmall);
        }
        if old_size > cfg.max_patch_size || new_size > cfg.max_patch_size {
            return PatchDecision::Replace(ReplaceReason::TooLarge);
        }
        if old_size == 0
            || old_size.abs_diff(new_size) as f64 / old_size as f64 > cfg.max_size_ratio
        {
            return PatchDecision::Replace(ReplaceReason::TooDissimilar);
        }

        let (patch_size, estimated) = match known_patch_size {
            Some(size) => (size, false),
            None => (
                self.engine
                    .estimate_sizes(old_size, new_size)
                    .estimated_patch_size,
                true,
            ),
        };

        if patch_size as f64 <= cfg.max_patch_ratio * new_size as f64 {
            PatchDecision::Patch {
                patch_size,
                estimated,
            }
        } else {
            PatchDecision::Replace(ReplaceReason::PatchTooLarge)
        }
    }

    fn aggregate(&self, plan: &mut UpdatePlan) {
        let add: u64 = plan.to_add.iter().map(|f| f.size).sum();
        let replace: u64 = plan.to_replace.iter().map(|f| f.size).sum();
        let patch: u64 = plan.to_patch.iter().map(|f| f.patch_size).sum();
        let patched_full: u64 = plan.to_patch.iter().map(|f| f.size).sum();

        plan.total_transfer_size = add + replace + patch;
        plan.total_original_size = add + replace + patched_full;
        plan.compression_ratio = if plan.total_original_size > 0 {
            1.0 - plan.total_transfer_size as f64 / plan.total_original_size as f64
        } else {
            0.0
        };
        plan.estimated_seconds = if self.config.reference_rate > 0 {
            plan.total_transfer_size as f64 / self.config.reference_rate as f64
        } else {
            0.0
        };
    }
}

impl Default for UpdatePlanner {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::manifest::FileEntry;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;

    fn one(path: &str, size: u64, hash: &str) -> Manifest {
        let mut m = Manifest::new();
        m.insert(path, FileEntry::new(size, hash));
        m
    }

    fn decide(old_size: u64, new_size: u64) -> PatchDecision {
        let planner = UpdatePlanner::default();
        let modified = ModifiedEntry {
            path: "f".into(),
            old: FileEntry::new(old_size, "a"),
            new: FileEntry::new(new_size, "b"),
        };
        planner.decide(&modified, None)
    }

    #[test]
    fn test_policy_order() {
        assert_eq!(decide(500, 50 * KIB), PatchDecision::Replace(ReplaceReason::TooSmall));
        assert_eq!(decide(50 * KIB, 500), PatchDecision::Replace(ReplaceReason::TooSmall));
        assert_eq!(
            decide(200 * MIB, 200 * MIB),
            PatchDecision::Replace(ReplaceReason::TooLarge)
        );
        assert_eq!(
            decide(10 * KIB, 40 * KIB),
            PatchDecision::Replace(ReplaceReason::TooDissimilar)
        );
        assert!(matches!(
            decide(100 * KIB, 101 * KIB),
            PatchDecision::Patch { estimated: true, .. }
        ));
    }

    #[test]
    fn test_large_shrink_patch_too_big() {
        // Halving passes the dissimilarity check but the estimate exceeds 0.8 * new
        assert_eq!(
            decide(100 * KIB, 50 * KIB),
            PatchDecision::Replace(ReplaceReason::PatchTooLarge)
        );
    }

    #[test]
    fn test_known_patch_size_overrides_estimate() {
        let planner = UpdatePlanner::default();
        let old = one("app.bin", 100 * KIB, "old");
        let new = one("app.bin", 100 * KIB, "new");

        let mut known = HashMap::new();
        known.insert("app.bin".to_string(), 90 * KIB);
        let plan = planner.plan_with_patch_sizes(&old, &new, &known);
        assert_eq!(plan.to_replace.len(), 1);
        assert_eq!(plan.to_replace[0].reason, ReplaceReason::PatchTooLarge);

        known.insert("app.bin".to_string(), 2 * KIB);
        let plan = planner.plan_with_patch_sizes(&old, &new, &known);
        assert_eq!(plan.to_patch.len(), 1);
        assert!(!plan.to_patch[0].estimated);
        assert_eq!(plan.total_transfer_size, 2 * KIB);
    }

    #[test]
    fn test_plan_aggregates() {
        let mut old = Manifest::new();
        old.insert("same.txt", FileEntry::new(10, "s"));
        old.insert("gone.txt", FileEntry::new(20, "g"));
        old.insert("small.cfg", FileEntry::new(100, "c1"));
        old.insert("big.bin", FileEntry::new(100 * KIB, "b1"));

        let mut new = Manifest::new();
        new.insert("same.txt", FileEntry::new(10, "s"));
        new.insert("added.txt", FileEntry::new(300, "a"));
        new.insert("small.cfg", FileEntry::new(120, "c2"));
        new.insert("big.bin", FileEntry::new(100 * KIB, "b2"));

        let planner = UpdatePlanner::new(PlannerConfig {
            reference_rate: 1000,
            ..Default::default()
        });
        let plan = planner.plan(&old, &new);

        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(plan.to_delete.len(), 1);
        assert_eq!(plan.to_replace.len(), 1);
        assert_eq!(plan.to_patch.len(), 1);

        let patch_size = plan.to_patch[0].patch_size;
        assert_eq!(plan.total_transfer_size, 300 + 120 + patch_size);
        assert_eq!(plan.total_original_size, 300 + 120 + 100 * KIB);
        let expected_ratio = 1.0 - plan.total_transfer_size as f64 / plan.total_original_size as f64;
        assert!((plan.compression_ratio - expected_ratio).abs() < 1e-9);
        assert!((plan.estimated_seconds - plan.total_transfer_size as f64 / 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_identical_manifests_empty_plan() {
        let m = one("a", 10, "h");
        let plan = UpdatePlanner::default().plan(&m, &m);
        assert!(plan.is_empty());
        assert_eq!(plan.total_transfer_size, 0);
        assert_eq!(plan.compression_ratio, 0.0);
    }
}
