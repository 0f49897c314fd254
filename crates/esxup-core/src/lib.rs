//! Core decision logic for esxup.
//!
//! This crate provides reusable logic that is independent of the CLI and
//! the SSH transport:
//! - Patch-level version parsing and comparison.
//! - The update decision engine and its two comparison policies.
//! - Patch catalog loading and local repository reconciliation.
//! - Local patch bundle metadata extraction.

mod bundle;
mod decision;
mod repo;
mod version;

/// Patch bundle inspection: embedded image-profile version discovery.
pub use bundle::{BundleError, bundle_version};
/// Update decision engine and its comparison policies.
pub use decision::{Outcome, Policy, UpdateDecision, decide, numeric_suffix};
/// Patch catalog model and local repository sync.
pub use repo::{
    PatchCatalogEntry, RepoError, SyncOutcome, SyncStatus, find_patch, list_local_patches,
    load_catalog, sync,
};
/// Version model and ordinal comparison.
pub use version::{Comparison, Version, compare, latest_of};
