//! SQLite pattern store
//!
//! One `patterns` table holds the full pattern as JSON next to the columns
//! the FTS5 index needs. The index is external-content and kept in sync by
//! triggers, so a write is a single upsert. Single file, works offline.

use super::{Page, PatternStore, SearchHit};
use crate::error::{PatternError, Result};
use crate::query::SafeFtsQuery;
use crate::types::Pattern;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    pattern_type TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '',
    keywords TEXT NOT NULL DEFAULT '',
    body_json TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(pattern_type);

-- FTS5 index over the searchable columns
CREATE VIRTUAL TABLE IF NOT EXISTS patterns_fts USING fts5(
    title,
    summary,
    tags,
    keywords,
    content=patterns,
    content_rowid=rowid
);

-- Triggers to keep FTS in sync
CREATE TRIGGER IF NOT EXISTS patterns_ai AFTER INSERT ON patterns BEGIN
    INSERT INTO patterns_fts(rowid, title, summary, tags, keywords)
    VALUES (new.rowid, new.title, new.summary, new.tags, new.keywords);
END;

CREATE TRIGGER IF NOT EXISTS patterns_ad AFTER DELETE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, title, summary, tags, keywords)
    VALUES ('delete', old.rowid, old.title, old.summary, old.tags, old.keywords);
END;

CREATE TRIGGER IF NOT EXISTS patterns_au AFTER UPDATE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, title, summary, tags, keywords)
    VALUES ('delete', old.rowid, old.title, old.summary, old.tags, old.keywords);
    INSERT INTO patterns_fts(rowid, title, summary, tags, keywords)
    VALUES (new.rowid, new.title, new.summary, new.tags, new.keywords);
END;
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PatternError::storage(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PatternError::storage("connection lock poisoned"))?;
            f(&mut guard)
        })
        .await?
    }
}

fn decode(body: &str, version: i64) -> Result<Pattern> {
    let mut pattern: Pattern = serde_json::from_str(body)?;
    pattern.version = version.max(0) as u64;
    Ok(pattern)
}

#[async_trait]
impl PatternStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Pattern>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT body_json, version FROM patterns WHERE id = ?1",
                    [&id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            row.map(|(body, version)| decode(&body, version)).transpose()
        })
        .await
    }

    async fn list(&self, page: Page) -> Result<Vec<Pattern>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, body_json, version FROM patterns ORDER BY id LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(params![page.limit as i64, page.offset as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut patterns = Vec::with_capacity(rows.len());
            for (id, body, version) in rows {
                match decode(&body, version) {
                    Ok(p) => patterns.push(p),
                    Err(e) => warn!(id = %id, error = %e, "Skipping malformed pattern row"),
                }
            }
            Ok(patterns)
        })
        .await
    }

    async fn upsert(&self, pattern: &Pattern, expected_version: Option<u64>) -> Result<u64> {
        let mut stored = pattern.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let actual = tx
                .query_row("SELECT version FROM patterns WHERE id = ?1", [&stored.id], |row| {
                    row.get::<_, i64>(0)
                })
                .optional()?
                .map(|v| v.max(0) as u64)
                .unwrap_or(0);

            if let Some(expected) = expected_version {
                if expected != actual {
                    return Err(PatternError::VersionConflict {
                        id: stored.id.clone(),
                        expected,
                        actual,
                    });
                }
            }

            stored.version = actual + 1;
            let body = serde_json::to_string(&stored)?;
            tx.execute(
                r#"
                INSERT INTO patterns (id, pattern_type, title, summary, tags, keywords, body_json, version, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
                ON CONFLICT(id) DO UPDATE SET
                    pattern_type = excluded.pattern_type,
                    title = excluded.title,
                    summary = excluded.summary,
                    tags = excluded.tags,
                    keywords = excluded.keywords,
                    body_json = excluded.body_json,
                    version = excluded.version,
                    updated_at = excluded.updated_at
                "#,
                params![
                    stored.id,
                    stored.pattern_type.as_str(),
                    stored.title,
                    stored.summary,
                    stored.tags.join(" "),
                    stored.keywords.join(" "),
                    body,
                    stored.version as i64,
                ],
            )?;
            tx.commit()?;
            debug!(id = %stored.id, version = stored.version, "Stored pattern");
            Ok(stored.version)
        })
        .await
    }

    async fn search(&self, query: &SafeFtsQuery, limit: usize) -> Result<Vec<SearchHit>> {
        let fts_query = query.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT p.id, p.body_json, p.version, bm25(patterns_fts) AS score
                FROM patterns_fts
                JOIN patterns p ON patterns_fts.rowid = p.rowid
                WHERE patterns_fts MATCH ?1
                ORDER BY score, p.id
                LIMIT ?2
                "#,
            )?;
            let rows = stmt
                .query_map(params![fts_query, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut hits = Vec::with_capacity(rows.len());
            for (id, body, version, score) in rows {
                match decode(&body, version) {
                    // bm25 is lower-is-better
                    Ok(pattern) => hits.push(SearchHit {
                        pattern,
                        relevance: -score,
                    }),
                    Err(e) => warn!(id = %id, error = %e, "Skipping malformed search hit"),
                }
            }
            Ok(hits)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FtsQueryParser;
    use tempfile::tempdir;

    fn pattern(id: &str, title: &str, summary: &str, tags: &[&str]) -> Pattern {
        let mut p = Pattern::new(id, title, summary).unwrap();
        p.tags = tags.iter().map(|t| t.to_string()).collect();
        p
    }

    fn safe(q: &str) -> SafeFtsQuery {
        FtsQueryParser::default().parse(q).unwrap().safe
    }

    #[tokio::test]
    async fn test_schema_created() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.conn.lock().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(tables.contains(&"patterns".to_string()));
        assert!(tables.contains(&"patterns_fts".to_string()));
    }

    #[tokio::test]
    async fn test_roundtrip_and_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("patterns.db");

        let mut p = pattern("acme.web:LANG:http:retry", "Retry with backoff", "Exponential", &["http"]);
        p.usage.successes = 4;
        {
            let store = SqliteStore::open(&path).unwrap();
            assert_eq!(store.upsert(&p, Some(0)).await.unwrap(), 1);
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let loaded = reopened.get(&p.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.usage.successes, 4);
        assert!(reopened.get("acme.web:LANG:http:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = pattern("acme.web:LANG:http:retry", "Retry", "Retry", &[]);
        store.upsert(&p, None).await.unwrap();
        store.upsert(&p, Some(1)).await.unwrap();

        let err = store.upsert(&p, Some(1)).await.unwrap_err();
        assert!(matches!(
            err,
            PatternError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fts_search_follows_updates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut jwt = pattern("acme.web:LANG:auth:jwt", "JWT rotation", "Rotate auth tokens", &["auth"]);
        let session = pattern("acme.web:LANG:auth:session", "Session cookies", "Server auth", &["auth"]);
        store.upsert(&jwt, None).await.unwrap();
        store.upsert(&session, None).await.unwrap();

        let hits = store.search(&safe("auth NOT jwt"), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.id, session.id);

        jwt.title = "Token rotation".to_string();
        store.upsert(&jwt, None).await.unwrap();
        let hits = store.search(&safe("token"), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.version, 2);
    }

    #[tokio::test]
    async fn test_quoted_input_stays_literal() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert(&pattern("acme.web:LANG:misc:ops", "OR NOT AND", "operators as words", &[]), None)
            .await
            .unwrap();
        // Every leaf is quoted, so the emitted query is always valid FTS5
        let hits = store.search(&safe("\"OR\" \"NOT\""), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_grouped_queries_match() {
        let store = SqliteStore::open_in_memory().unwrap();
        let retry = pattern("acme.web:LANG:http:retry", "Retry with backoff", "Exponential delay", &["http"]);
        let circuit = pattern("acme.web:LANG:http:breaker", "Circuit breaker", "Backoff after errors", &["http"]);
        let sleep = pattern("acme.web:ANTI:http:sleep", "Sleep retry", "Fixed delay backoff loop", &["http"]);
        for p in [&retry, &circuit, &sleep] {
            store.upsert(p, None).await.unwrap();
        }

        let hits = store.search(&safe("(retry OR circuit) backoff"), 10).await.unwrap();
        assert_eq!(hits.len(), 3);

        let hits = store.search(&safe("backoff (retry OR circuit) NOT sleep"), 10).await.unwrap();
        let mut ids: Vec<&str> = hits.iter().map(|h| h.pattern.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec![circuit.id.as_str(), retry.id.as_str()]);

        let hits = store.search(&safe("backoff NOT (fixed loop)"), 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.pattern.id != sleep.id));
    }

    #[tokio::test]
    async fn test_expanded_query_matches() {
        let store = SqliteStore::open_in_memory().unwrap();
        let jwt = pattern("acme.web:LANG:auth:jwt", "JWT signing", "Authentication with rotating keys", &["jwt"]);
        store.upsert(&jwt, None).await.unwrap();

        let processed = crate::query::QueryProcessor::default().process("auth jwt", false).unwrap();
        assert!(processed.expansion.is_some());
        let hits = store.search(&processed.safe, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.id, jwt.id);
    }

    #[tokio::test]
    async fn test_list_skips_malformed_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert(&pattern("acme.web:LANG:http:a", "A", "A", &[]), None)
            .await
            .unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO patterns (id, pattern_type, title, summary, body_json) VALUES ('acme.web:LANG:http:b', 'LANG', 'B', 'B', '{not json')",
                [],
            )
            .unwrap();
        }

        let listed = store.list(Page::first(10)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.get("acme.web:LANG:http:b").await.is_err());
    }
}
