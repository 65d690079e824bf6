//! Pattern quality: evidence, conflicts, version compatibility and quarantine

pub mod cache;
pub mod conflicts;
pub mod evidence;
pub mod manager;
pub mod semver;

pub use conflicts::{
    conflict_penalty, Conflict, ConflictResolver, ConflictType, Resolution, ResolutionRule, Severity,
};
pub use evidence::{EvidenceQuality, EvidenceStandards, PromotionCriterion, PromotionDecision};
pub use manager::{PatternQualityManager, QualityScore, QualityStatus, QuarantineChange};
pub use semver::{
    declared_ranges, CompatibilityReport, Incompatibility, RangeSuggestion, SemverValidator, Version,
    VersionRange, VersionReport, VersionWarning,
};
