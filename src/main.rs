//! pattern-intel CLI
//!
//! Thin operator glue over [`RetrievalEngine`]. Every command prints JSON.
//!
//! Run with: cargo run -- --search "retry http calls" --lang=rust

use anyhow::{bail, Context, Result};
use pattern_intel::{
    default_data_dir, outcome::OutcomeEvent, EngineConfig, EvidenceType, RetrievalEngine, RetrievalRequest,
    SqliteStore,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

const USAGE: &str = "\
Usage: pattern-intel [--db=<path>] [--config=<path>] <command>

Commands:
  --search <task...> [--lang=<l>] [--framework=<name>@<version>] [--repo=<r>]
                     [--org=<o>] [--file=<path>]... [--limit=<n>] [--fast]
  --outcome <id> --success|--failure [--evidence <type>]
  --quality <id>
  --conflicts <id>
  --refresh <id>
  --quarantined
  --stats";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (globals, args): (Vec<String>, Vec<String>) = args
        .into_iter()
        .partition(|a| a.starts_with("--db=") || a.starts_with("--config="));

    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let engine = open_engine(&globals)?;
    let rest = &args[1..];

    match command.as_str() {
        "--search" => run_search(&engine, rest).await,
        "--outcome" => run_outcome(&engine, rest).await,
        "--quality" => print_json(&engine.assess_quality(required_id(rest)?).await?),
        "--conflicts" => print_json(&engine.detect_conflicts(required_id(rest)?).await?),
        "--refresh" => print_json(&engine.refresh_pattern(required_id(rest)?).await?),
        "--quarantined" => print_json(&engine.quarantined().await?),
        "--stats" => print_json(&engine.learning_stats().await?),
        other => bail!("Unknown command {}\n\n{}", other, USAGE),
    }
}

fn open_engine(globals: &[String]) -> Result<RetrievalEngine> {
    let data_dir = default_data_dir();

    let db_path = flag_value(globals, "--db=")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("patterns.db"));
    let config_path = flag_value(globals, "--config=")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("config.json"));

    let config = if config_path.exists() {
        EngineConfig::load(&config_path)?
    } else {
        EngineConfig::default()
    };

    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open pattern store at {:?}", db_path))?;
    tracing::debug!("Pattern store at {:?}", db_path);

    Ok(RetrievalEngine::new(Arc::new(store), config))
}

async fn run_search(engine: &RetrievalEngine, args: &[String]) -> Result<()> {
    let mut request = RetrievalRequest::default();
    let mut words = Vec::new();

    for arg in args {
        if let Some(lang) = arg.strip_prefix("--lang=") {
            request.signals.language = Some(lang.to_string());
        } else if let Some(framework) = arg.strip_prefix("--framework=") {
            match framework.split_once('@') {
                Some((name, version)) => {
                    request.signals.framework = Some(name.to_string());
                    request.signals.framework_version = Some(version.to_string());
                }
                None => request.signals.framework = Some(framework.to_string()),
            }
        } else if let Some(repo) = arg.strip_prefix("--repo=") {
            request.signals.repo = Some(repo.to_string());
        } else if let Some(org) = arg.strip_prefix("--org=") {
            request.signals.org = Some(org.to_string());
        } else if let Some(file) = arg.strip_prefix("--file=") {
            request.signals.file_paths.push(file.to_string());
        } else if let Some(limit) = arg.strip_prefix("--limit=") {
            request.limit = Some(limit.parse().with_context(|| format!("Invalid limit {}", limit))?);
        } else if let Some(intent) = arg.strip_prefix("--intent=") {
            request.intent = Some(intent.to_string());
        } else if arg == "--fast" {
            request.performance_mode = true;
        } else {
            words.push(arg.as_str());
        }
    }

    if words.is_empty() {
        bail!("--search needs a task description\n\n{}", USAGE);
    }
    request.task = words.join(" ");

    print_json(&engine.retrieve(&request).await?)
}

async fn run_outcome(engine: &RetrievalEngine, args: &[String]) -> Result<()> {
    let id = required_id(args)?;
    let mut success = None;
    let mut evidence = EvidenceType::DevelopmentUsage;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--success" => success = Some(true),
            "--failure" | "--failed" => success = Some(false),
            "--evidence" => {
                i += 1;
                let raw = args.get(i).context("--evidence needs a type")?;
                evidence = raw.parse()?;
            }
            other => bail!("Unexpected argument {}", other),
        }
        i += 1;
    }

    let Some(success) = success else {
        bail!("--outcome needs --success or --failure");
    };

    print_json(&engine.record_outcome(&OutcomeEvent::new(id, success, evidence)).await?)
}

fn required_id(args: &[String]) -> Result<&str> {
    match args.first() {
        Some(id) if !id.starts_with("--") => Ok(id),
        _ => bail!("Missing pattern id\n\n{}", USAGE),
    }
}

fn flag_value<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter().find_map(|a| a.strip_prefix(prefix))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
