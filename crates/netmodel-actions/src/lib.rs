//! Action envelopes, deterministic validation, and copy-on-write application
//! over [`netmodel_core::Snapshot`], plus the readiness validator that scores
//! a network's fitness for each analysis kind.

pub mod apply;
pub mod envelope;
pub mod readiness;

pub use apply::{apply_action, apply_batch, ApplyError};
pub use envelope::{
    validate_action, ActionEnvelope, ActionId, ActionIssue, ActionIssueCode, ActionResult,
    ActionStatus, BatchActionResult, ParentSnapshotId, ACTION_TYPES,
};
pub use readiness::{
    validate_network, AnalysisAvailability, AnalysisMatrix, IssueCode, Severity, ValidationIssue,
    ValidationReport,
};
