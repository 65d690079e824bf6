//! Semantic version ranges
//!
//! Supported range syntax:
//! - exact: `1.2.3`, `=1.2.3`
//! - caret/tilde: `^1.2.3`, `~1.2`
//! - comparisons: `>=1.0 <2.0`, `>1.2.3`, `<= 3`
//! - wildcards: `*`, `1.x`, `1.2.*`
//! - hyphen ranges: `1.2.3 - 2.0`
//! - alternatives: `^1.0 || ^2.0`
//!
//! Every AND-set reduces to one interval, which makes both `satisfies` and
//! `intersects` simple bound comparisons.

use crate::error::{PatternError, Result};
use crate::types::Pattern;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse `[v]MAJOR[.MINOR[.PATCH]][-PRE][+BUILD]`; missing parts are 0
    pub fn parse(raw: &str) -> Result<Self> {
        let partial = Partial::parse(raw)?;
        if partial.has_wildcard() {
            return Err(PatternError::validation(format!("'{}' is a range, not a version", raw)));
        }
        Ok(partial.floor())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                // a pre-release sorts before its release
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

/// A version with optional (wildcard) components
#[derive(Debug, Clone, Copy)]
struct Partial<'a> {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Option<&'a str>,
    wildcard: bool,
}

impl<'a> Partial<'a> {
    fn parse(raw: &'a str) -> Result<Self> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let without_build = trimmed.split_once('+').map_or(trimmed, |(v, _)| v);
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre)),
            Some(_) => return Err(PatternError::validation(format!("invalid version '{}'", raw))),
            None => (without_build, None),
        };

        if core.is_empty() {
            return Err(PatternError::validation(format!("invalid version '{}'", raw)));
        }

        let mut parts = [None; 3];
        let mut seen_wildcard = false;
        for (i, segment) in core.split('.').enumerate() {
            if i >= 3 {
                return Err(PatternError::validation(format!(
                    "version '{}' has more than three components",
                    raw
                )));
            }
            parts[i] = match segment {
                "x" | "X" | "*" => {
                    seen_wildcard = true;
                    None
                }
                digits => {
                    if seen_wildcard {
                        return Err(PatternError::validation(format!(
                            "version '{}' has a number after a wildcard",
                            raw
                        )));
                    }
                    Some(digits.parse::<u64>().map_err(|_| {
                        PatternError::validation(format!("invalid version component '{}' in '{}'", digits, raw))
                    })?)
                }
            };
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            pre,
            wildcard: seen_wildcard,
        })
    }

    fn has_wildcard(&self) -> bool {
        self.wildcard
    }

    fn is_any(&self) -> bool {
        self.major.is_none()
    }

    /// Lowest version the partial covers
    fn floor(&self) -> Version {
        Version {
            major: self.major.unwrap_or(0),
            minor: self.minor.unwrap_or(0),
            patch: self.patch.unwrap_or(0),
            pre: self.pre.map(String::from),
        }
    }

    /// First version past everything the partial covers; `None` if unbounded
    fn ceiling(&self) -> Result<Option<Version>> {
        Ok(match (self.major, self.minor, self.patch) {
            (None, _, _) => None,
            (Some(m), None, _) => Some(Version::new(bump(m)?, 0, 0)),
            (Some(m), Some(n), None) => Some(Version::new(m, bump(n)?, 0)),
            (Some(_), Some(_), Some(_)) => None,
        })
    }

    fn is_complete(&self) -> bool {
        self.patch.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bound {
    pub version: Version,
    pub inclusive: bool,
}

impl Bound {
    fn inclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: true,
        }
    }

    fn exclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: false,
        }
    }
}

/// Contiguous set of versions; `None` bounds are open
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: Option<Bound>,
    pub upper: Option<Bound>,
}

impl Interval {
    pub fn contains(&self, v: &Version) -> bool {
        let above = match &self.lower {
            None => true,
            Some(b) if b.inclusive => *v >= b.version,
            Some(b) => *v > b.version,
        };
        let below = match &self.upper {
            None => true,
            Some(b) if b.inclusive => *v <= b.version,
            Some(b) => *v < b.version,
        };
        above && below
    }

    fn raise_lower(&mut self, bound: Bound) {
        let replace = match &self.lower {
            None => true,
            Some(current) => match bound.version.cmp(&current.version) {
                Ordering::Greater => true,
                Ordering::Equal => current.inclusive && !bound.inclusive,
                Ordering::Less => false,
            },
        };
        if replace {
            self.lower = Some(bound);
        }
    }

    fn lower_upper(&mut self, bound: Bound) {
        let replace = match &self.upper {
            None => true,
            Some(current) => match bound.version.cmp(&current.version) {
                Ordering::Less => true,
                Ordering::Equal => current.inclusive && !bound.inclusive,
                Ordering::Greater => false,
            },
        };
        if replace {
            self.upper = Some(bound);
        }
    }

    pub fn intersect(&self, other: &Interval) -> Interval {
        let mut out = self.clone();
        if let Some(lower) = &other.lower {
            out.raise_lower(lower.clone());
        }
        if let Some(upper) = &other.upper {
            out.lower_upper(upper.clone());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lo), Some(hi)) => match lo.version.cmp(&hi.version) {
                Ordering::Greater => true,
                Ordering::Equal => !(lo.inclusive && hi.inclusive),
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    fn is_exact(&self) -> bool {
        matches!((&self.lower, &self.upper), (Some(lo), Some(hi)) if lo.inclusive && hi.inclusive && lo.version == hi.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    raw: String,
    /// Alternatives joined by `||`
    intervals: Vec<Interval>,
}

impl VersionRange {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PatternError::validation("version range is empty"));
        }

        let mut intervals = Vec::new();
        for alternative in trimmed.split("||") {
            let interval = parse_alternative(alternative.trim())
                .map_err(|e| PatternError::validation(format!("invalid range '{}': {}", raw, reason_of(e))))?;
            if interval.is_empty() {
                return Err(PatternError::validation(format!(
                    "range '{}' can never be satisfied",
                    raw
                )));
            }
            intervals.push(interval);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            intervals,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn satisfies(&self, version: &Version) -> bool {
        self.intervals.iter().any(|i| i.contains(version))
    }

    /// True if some version satisfies both ranges
    pub fn intersects(&self, other: &VersionRange) -> bool {
        self.intervals
            .iter()
            .any(|a| other.intervals.iter().any(|b| !a.intersect(b).is_empty()))
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn reason_of(e: PatternError) -> String {
    match e {
        PatternError::Validation { reason } => reason,
        other => other.to_string(),
    }
}

fn parse_alternative(text: &str) -> Result<Interval> {
    if text.is_empty() {
        return Err(PatternError::validation("empty alternative"));
    }

    let words: Vec<&str> = text.split_whitespace().collect();

    if let [from, "-", to] = words.as_slice() {
        let from = Partial::parse(from)?;
        let to = Partial::parse(to)?;
        let mut interval = Interval::default();
        if !from.is_any() {
            interval.raise_lower(Bound::inclusive(from.floor()));
        }
        if !to.is_any() {
            match to.ceiling()? {
                Some(ceiling) if !to.is_complete() => interval.lower_upper(Bound::exclusive(ceiling)),
                _ => interval.lower_upper(Bound::inclusive(to.floor())),
            }
        }
        return Ok(interval);
    }

    // Glue detached operators onto their operand: ">= 1.2" -> ">=1.2"
    let mut comparators: Vec<String> = Vec::new();
    let mut pending: Option<&str> = None;
    for word in words {
        if matches!(word, ">=" | "<=" | ">" | "<" | "=" | "^" | "~") {
            if pending.is_some() {
                return Err(PatternError::validation(format!("operator '{}' has no version", word)));
            }
            pending = Some(word);
            continue;
        }
        match pending.take() {
            Some(op) => comparators.push(format!("{}{}", op, word)),
            None => comparators.push(word.to_string()),
        }
    }
    if let Some(op) = pending {
        return Err(PatternError::validation(format!("operator '{}' has no version", op)));
    }

    let mut interval = Interval::default();
    for comparator in &comparators {
        apply_comparator(&mut interval, comparator)?;
    }
    Ok(interval)
}

fn apply_comparator(interval: &mut Interval, comparator: &str) -> Result<()> {
    let (op, rest) = split_operator(comparator);
    let partial = Partial::parse(rest)?;

    if partial.is_any() {
        return match op {
            "" | "=" | ">=" | "<=" | "^" | "~" => Ok(()),
            _ => Err(PatternError::validation(format!("'{}' matches nothing", comparator))),
        };
    }

    let floor = partial.floor();
    match op {
        "" | "=" => {
            interval.raise_lower(Bound::inclusive(floor.clone()));
            match partial.ceiling()? {
                Some(ceiling) => interval.lower_upper(Bound::exclusive(ceiling)),
                None => interval.lower_upper(Bound::inclusive(floor)),
            }
        }
        ">=" => interval.raise_lower(Bound::inclusive(floor)),
        ">" => match partial.ceiling()? {
            Some(ceiling) => interval.raise_lower(Bound::inclusive(ceiling)),
            None => interval.raise_lower(Bound::exclusive(floor)),
        },
        "<" => interval.lower_upper(Bound::exclusive(floor)),
        "<=" => match partial.ceiling()? {
            Some(ceiling) => interval.lower_upper(Bound::exclusive(ceiling)),
            None => interval.lower_upper(Bound::inclusive(floor)),
        },
        "^" => {
            let upper = match (floor.major, floor.minor) {
                (0, 0) if partial.is_complete() => Version::new(0, 0, bump(floor.patch)?),
                (0, minor) if partial.minor.is_some() => Version::new(0, bump(minor)?, 0),
                (major, _) => Version::new(bump(major)?, 0, 0),
            };
            interval.raise_lower(Bound::inclusive(floor));
            interval.lower_upper(Bound::exclusive(upper));
        }
        "~" => {
            let upper = match partial.minor {
                Some(minor) => Version::new(floor.major, bump(minor)?, 0),
                None => Version::new(bump(floor.major)?, 0, 0),
            };
            interval.raise_lower(Bound::inclusive(floor));
            interval.lower_upper(Bound::exclusive(upper));
        }
        other => {
            return Err(PatternError::validation(format!("unknown operator '{}'", other)));
        }
    }
    Ok(())
}

/// Next value of a version component
fn bump(component: u64) -> Result<u64> {
    component
        .checked_add(1)
        .ok_or_else(|| PatternError::validation(format!("version component {} is too large", component)))
}

fn split_operator(comparator: &str) -> (&str, &str) {
    for op in [">=", "<=", ">", "<", "=", "^", "~"] {
        if let Some(rest) = comparator.strip_prefix(op) {
            return (op, rest);
        }
    }
    ("", comparator)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionWarning {
    InvalidRange { package: String, range: String, reason: String },
    /// Declared but not present in the project
    Unknown { package: String, range: String },
    UnparseableVersion { package: String, version: String },
    Mismatch { package: String, range: String, installed: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSuggestion {
    pub package: String,
    pub current: String,
    pub suggested: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReport {
    pub warnings: Vec<VersionWarning>,
    pub suggestions: Vec<RangeSuggestion>,
}

impl VersionReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incompatibility {
    pub package: String,
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub incompatibilities: Vec<Incompatibility>,
}

impl CompatibilityReport {
    pub fn is_compatible(&self) -> bool {
        self.incompatibilities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SemverValidator;

impl SemverValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_range(&self, range: &str) -> Result<VersionRange> {
        VersionRange::parse(range)
    }

    /// Check declared `package -> range` against installed `package -> version`.
    ///
    /// Problems are reported as warnings; nothing here fails.
    pub fn check_versions(
        &self,
        declared: &BTreeMap<String, String>,
        installed: &BTreeMap<String, String>,
    ) -> VersionReport {
        let mut report = VersionReport::default();

        for (package, raw_range) in declared {
            let range = match VersionRange::parse(raw_range) {
                Ok(range) => range,
                Err(e) => {
                    report.warnings.push(VersionWarning::InvalidRange {
                        package: package.clone(),
                        range: raw_range.clone(),
                        reason: reason_of(e),
                    });
                    continue;
                }
            };

            if let Some(suggested) = looser_range(&range) {
                report.suggestions.push(RangeSuggestion {
                    package: package.clone(),
                    current: raw_range.clone(),
                    suggested,
                });
            }

            let found = installed
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(package))
                .map(|(_, v)| v);
            let Some(raw_version) = found else {
                report.warnings.push(VersionWarning::Unknown {
                    package: package.clone(),
                    range: raw_range.clone(),
                });
                continue;
            };

            match Version::parse(raw_version) {
                Ok(version) if range.satisfies(&version) => {}
                Ok(_) => report.warnings.push(VersionWarning::Mismatch {
                    package: package.clone(),
                    range: raw_range.clone(),
                    installed: raw_version.clone(),
                }),
                Err(_) => report.warnings.push(VersionWarning::UnparseableVersion {
                    package: package.clone(),
                    version: raw_version.clone(),
                }),
            }
        }

        report
    }

    /// Every package both patterns constrain with ranges that share no version
    pub fn check_pattern_compatibility(&self, a: &Pattern, b: &Pattern) -> CompatibilityReport {
        let left = declared_ranges(a);
        let right = declared_ranges(b);
        let mut report = CompatibilityReport::default();

        for (package, left_raw) in &left {
            let Some(right_raw) = right.get(package) else {
                continue;
            };
            match (VersionRange::parse(left_raw), VersionRange::parse(right_raw)) {
                (Ok(l), Ok(r)) => {
                    if !l.intersects(&r) {
                        report.incompatibilities.push(Incompatibility {
                            package: package.clone(),
                            left: left_raw.clone(),
                            right: right_raw.clone(),
                        });
                    }
                }
                _ => warn!(
                    package = %package,
                    left = %a.id,
                    right = %b.id,
                    "Skipping unparseable range in compatibility check"
                ),
            }
        }

        report
    }
}

/// Framework ranges from the scope plus `meta.semver`, keyed by lowercase name.
/// `meta.semver` wins on a clash.
pub fn declared_ranges(pattern: &Pattern) -> BTreeMap<String, String> {
    let mut ranges: BTreeMap<String, String> = pattern
        .scope
        .frameworks
        .iter()
        .filter_map(|f| f.version_range.as_ref().map(|r| (f.name.to_lowercase(), r.clone())))
        .collect();
    for (package, range) in &pattern.meta.semver {
        ranges.insert(package.to_lowercase(), range.clone());
    }
    ranges
}

/// Suggest a wider range for exact pins and ranges spanning at most one minor
fn looser_range(range: &VersionRange) -> Option<String> {
    let [interval] = range.intervals() else {
        return None;
    };
    let lower = interval.lower.as_ref()?;
    let upper = interval.upper.as_ref()?;
    let from = &lower.version;

    let narrow = interval.is_exact()
        || (from.major == upper.version.major && upper.version.minor <= from.minor.saturating_add(1));
    if !narrow {
        return None;
    }

    let base = Version::new(from.major, from.minor, from.patch);
    Some(if from.major == 0 {
        format!(">={} <1.0.0", base)
    } else {
        format!("^{}", base)
    })
}
