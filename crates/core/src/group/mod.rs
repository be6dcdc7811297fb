//! # Groups
//!
//! Side-by-side comparison runs and the per-owner quota that bounds them.

pub mod coordinator;
pub mod quota;

pub use coordinator::{
    group_key, ComparisonType, GenerationGroup, GroupComparison, GroupConfig, GroupCoordinator,
    GroupReport, GroupStatus, MemberReport, SiblingProfile, StartGroupRequest, MAX_SIBLINGS,
    MIN_SIBLINGS,
};
pub use quota::{QuotaConfig, QuotaLedger};
