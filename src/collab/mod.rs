//! Offline collaboration: branch extraction and merge reconciliation

pub mod branch;
pub mod merge;

pub use branch::{BranchInfo, BranchManager};
pub use merge::{
    MergeConflict, MergeCoordinator, MergeOutcome, MergeReport, MergeState, RejectPolicy,
    Resolution,
};
