// src/update/mod.rs

//! Manifests, difference detection and incremental update planning

pub mod diff;
pub mod manifest;
pub mod planner;

pub use diff::{DiffEntry, ManifestDiff, ModifiedEntry, diff};
pub use manifest::{FileEntry, Manifest};
pub use planner::{
    PatchDecision, PatchedFile, PlannedFile, PlannerConfig, ReplaceReason, ReplacedFile,
    UpdatePlan, UpdatePlanner,
};
