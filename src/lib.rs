//! pattern-intel - Pattern Intelligence Retrieval
//!
//! Given a task description and project signals, returns a ranked list of
//! reusable patterns (proven solutions, anti-patterns, failure signatures,
//! policies), each with a calibrated trust score and a per-factor breakdown.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pattern_intel::{EngineConfig, RetrievalEngine, RetrievalRequest, SqliteStore};
//! use pattern_intel::outcome::OutcomeEvent;
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteStore::open(&db_path)?);
//! let engine = RetrievalEngine::new(store, EngineConfig::default());
//!
//! // Retrieve
//! let response = engine.retrieve(&RetrievalRequest {
//!     task: "rotate jwt signing keys".into(),
//!     ..Default::default()
//! }).await?;
//!
//! // Feed back what happened (the only way trust changes)
//! engine.record_outcome(&OutcomeEvent::new(&id, true, EvidenceType::AutomatedTest)).await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ RetrievalEngine                                           │
//! │  query    → safe parse, synonym expansion, fuzzy rerank   │
//! │  scoring  → trust 30 + freshness 20 + scope 40 + locality │
//! │  quality  → conflicts, evidence, semver, quarantine       │
//! │  outcome  → trust updates, per-pattern serialization      │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ PatternStore
//!                             ▼
//!                 MemoryStore / SqliteStore (FTS5)
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod quality;
pub mod query;
pub mod scoring;
pub mod storage;
pub mod trust;
pub mod types;

pub use config::{default_data_dir, EngineConfig};
pub use engine::{RankedCandidate, RetrievalEngine, RetrievalResponse};
pub use error::{PatternError, Result};
pub use storage::{MemoryStore, PatternStore, SqliteStore};
pub use trust::{TrustModel, TrustScore};
pub use types::*;

// Outcome feed
pub use outcome::{BatchOutcome, LearningStats, OutcomeEvent, OutcomeRecorder, OutcomeResult};

// Quality
pub use quality::{Conflict, ConflictResolver, PatternQualityManager, QualityScore};
