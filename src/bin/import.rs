//! Import patterns from JSON files
//!
//! Usage: cargo run --bin import -- [--db=<path>] <dir-or-file>...
//!
//! Each `.json` file holds one pattern or an array of patterns. Patterns that
//! already exist keep their learned state (trust, usage, evidence counters,
//! quality metadata); only their content is replaced.

use anyhow::{Context, Result};
use pattern_intel::{default_data_dir, Pattern, PatternStore, SqliteStore};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PatternFile {
    Many(Vec<Pattern>),
    One(Box<Pattern>),
}

impl PatternFile {
    fn into_patterns(self) -> Vec<Pattern> {
        match self {
            PatternFile::Many(patterns) => patterns,
            PatternFile::One(pattern) => vec![*pattern],
        }
    }
}

#[derive(Debug, Default)]
struct ImportTally {
    created: usize,
    updated: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (db_args, inputs): (Vec<String>, Vec<String>) = args.into_iter().partition(|a| a.starts_with("--db="));

    if inputs.is_empty() {
        eprintln!("Usage: import [--db=<path>] <dir-or-file>...");
        std::process::exit(1);
    }

    let db_path = db_args
        .iter()
        .find_map(|a| a.strip_prefix("--db="))
        .map(PathBuf::from)
        .unwrap_or_else(|| default_data_dir().join("patterns.db"));
    info!("Opening pattern store at {:?}", db_path);
    let store = SqliteStore::open(&db_path).with_context(|| format!("Failed to open {:?}", db_path))?;

    let mut tally = ImportTally::default();
    for input in &inputs {
        let root = PathBuf::from(input);
        if !root.exists() {
            warn!("{} does not exist, skipping", input);
            continue;
        }
        import_path(&store, &root, &mut tally).await?;
    }

    println!("Import complete!");
    println!("  Created:  {}", tally.created);
    println!("  Updated:  {}", tally.updated);
    println!("  Rejected: {}", tally.rejected);

    Ok(())
}

async fn import_path(store: &SqliteStore, root: &Path, tally: &mut ImportTally) -> Result<()> {
    let files = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|ext| ext == "json"));

    for entry in files {
        let path = entry.path();
        let patterns = match read_patterns(path) {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!("Skipping {:?}: {:#}", path, e);
                tally.rejected += 1;
                continue;
            }
        };

        for pattern in patterns {
            if let Err(e) = pattern.validate() {
                warn!(id = %pattern.id, "Rejected pattern from {:?}: {}", path, e);
                tally.rejected += 1;
                continue;
            }

            match store.get(&pattern.id).await? {
                Some(existing) => {
                    store
                        .upsert(&keep_learned_state(pattern, &existing), Some(existing.version))
                        .await?;
                    tally.updated += 1;
                }
                None => {
                    store.upsert(&pattern, Some(0)).await?;
                    tally.created += 1;
                }
            }
        }
    }

    Ok(())
}

fn read_patterns(path: &Path) -> Result<Vec<Pattern>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let file: PatternFile =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(file.into_patterns())
}

/// Numeric state only changes through recorded outcomes
fn keep_learned_state(mut incoming: Pattern, existing: &Pattern) -> Pattern {
    incoming.trust = existing.trust.clone();
    incoming.usage = existing.usage.clone();
    incoming.evidence_counts = existing.evidence_counts.clone();
    incoming.quality = existing.quality.clone();
    incoming.created_at = existing.created_at;
    incoming
}

#[cfg(test)]
mod tests {
    use super::*;
    use pattern_intel::TrustParams;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn test_import_keeps_learned_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_in_memory().unwrap();

        let mut seeded = Pattern::new("acme.web:LANG:http:retry", "Retry", "Old summary").unwrap();
        seeded.trust = TrustParams::new(9.0, 2.0);
        seeded.usage.successes = 8;
        store.upsert(&seeded, None).await.unwrap();

        write(
            dir.path(),
            "patterns.json",
            r#"[
                {"id": "acme.web:LANG:http:retry", "pattern_type": "LANG", "title": "Retry",
                 "summary": "New summary", "created_at": "2026-01-01T00:00:00Z"},
                {"id": "acme.web:ANTI:http:sleep-loop", "pattern_type": "ANTI", "title": "Sleep loop",
                 "summary": "Busy waiting", "created_at": "2026-01-01T00:00:00Z"}
            ]"#,
        );
        write(
            dir.path(),
            "bad.json",
            r#"{"id": "not-an-id", "pattern_type": "LANG", "title": "x", "summary": "x",
                "created_at": "2026-01-01T00:00:00Z"}"#,
        );
        write(dir.path(), "notes.txt", "ignored");

        let mut tally = ImportTally::default();
        import_path(&store, dir.path(), &mut tally).await.unwrap();

        assert_eq!(tally.created, 1);
        assert_eq!(tally.updated, 1);
        assert_eq!(tally.rejected, 1);

        let retry = store.get("acme.web:LANG:http:retry").await.unwrap().unwrap();
        assert_eq!(retry.summary, "New summary");
        assert_eq!(retry.trust.alpha, 9.0);
        assert_eq!(retry.usage.successes, 8);
        assert_eq!(retry.version, 2);
    }
}
