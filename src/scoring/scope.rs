use crate::quality::semver::{Version, VersionRange};
use crate::types::{PatternScope, QuerySignals};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Point budget for the scope factor
pub const SCOPE_BUDGET: f64 = 40.0;

const PATH_EXACT: f64 = 40.0;
const PATH_DIRECTORY: f64 = 30.0;
const PATH_GLOB: f64 = 5.0;
const LANGUAGE_MATCH: f64 = 20.0;
const FRAMEWORK_VERSIONED: f64 = 15.0;
const FRAMEWORK_NAME_ONLY: f64 = 8.0;

/// Best possible raw sum: exact path + language + versioned framework
const MAX_RAW: f64 = PATH_EXACT + LANGUAGE_MATCH + FRAMEWORK_VERSIONED;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeBreakdown {
    pub path: f64,
    pub language: f64,
    pub framework: f64,
    /// Raw sum before normalization to the budget
    pub raw: f64,
    pub points: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeScorer;

impl ScopeScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, scope: &PatternScope, signals: &QuerySignals) -> f64 {
        self.breakdown(scope, signals).points
    }

    pub fn breakdown(&self, scope: &PatternScope, signals: &QuerySignals) -> ScopeBreakdown {
        let path = path_points(&scope.paths, &signals.file_paths);
        let language = language_points(&scope.languages, signals.language.as_deref());
        let framework = framework_points(scope, signals);
        let raw = path + language + framework;

        ScopeBreakdown {
            path,
            language,
            framework,
            raw,
            points: (raw / MAX_RAW * SCOPE_BUDGET).clamp(0.0, SCOPE_BUDGET),
        }
    }
}

fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    unified.trim_start_matches("./").to_string()
}

fn is_glob(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// Best match of any declared path against any request file
fn path_points(scope_paths: &[String], files: &[String]) -> f64 {
    let files: Vec<String> = files.iter().map(|f| normalize_path(f)).collect();
    let mut best = 0.0_f64;

    for declared in scope_paths {
        let declared = normalize_path(declared);
        if declared.is_empty() {
            continue;
        }

        if is_glob(&declared) {
            let Ok(glob) = glob::Pattern::new(&declared) else {
                debug!(path = %declared, "ignoring invalid scope glob");
                continue;
            };
            if files.iter().any(|f| glob.matches(f)) {
                best = best.max(PATH_GLOB);
            }
            continue;
        }

        let dir = declared.trim_end_matches('/');
        for file in &files {
            if !declared.ends_with('/') && *file == declared {
                return PATH_EXACT;
            }
            if file.starts_with(dir) && file[dir.len()..].starts_with('/') {
                best = best.max(PATH_DIRECTORY);
            }
        }
    }

    best
}

fn language_points(languages: &[String], language: Option<&str>) -> f64 {
    match language {
        Some(lang) if languages.iter().any(|l| l.eq_ignore_ascii_case(lang)) => LANGUAGE_MATCH,
        _ => 0.0,
    }
}

/// Installed version for a framework name, from the explicit signal or the dependency map.
///
/// Outer `None` means the framework is not in play at all.
fn installed_version<'a>(name: &str, signals: &'a QuerySignals) -> Option<Option<&'a str>> {
    if signals
        .framework
        .as_deref()
        .is_some_and(|f| f.eq_ignore_ascii_case(name))
    {
        return Some(signals.framework_version.as_deref());
    }

    signals
        .dependencies
        .iter()
        .find(|(pkg, _)| pkg.eq_ignore_ascii_case(name))
        .map(|(_, version)| Some(version.as_str()))
}

fn framework_points(scope: &PatternScope, signals: &QuerySignals) -> f64 {
    let mut best = 0.0_f64;

    for framework in &scope.frameworks {
        let Some(version) = installed_version(&framework.name, signals) else {
            continue;
        };

        let satisfied = match (framework.version_range.as_deref(), version) {
            (Some(range), Some(version)) => match (VersionRange::parse(range), Version::parse(version)) {
                (Ok(range), Ok(version)) => range.satisfies(&version),
                _ => {
                    debug!(framework = %framework.name, range, version, "unparseable framework version");
                    false
                }
            },
            _ => false,
        };

        best = best.max(if satisfied {
            FRAMEWORK_VERSIONED
        } else {
            FRAMEWORK_NAME_ONLY
        });
    }

    best
}
