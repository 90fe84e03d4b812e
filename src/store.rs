//! SQLite-backed persistent store.
//!
//! Sole source of truth for mutations, decoded options, cached results,
//! tags, the pending-work queue, generator source tags, and run metadata.
//! Everything survives process restarts; the only transient field is the
//! queue's `running` flag, which every recompute pass clears.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use thiserror::Error;

/// Database file name inside the project's `database/` directory.
pub const DB_FILE: &str = "db.sqlite3";

const SCHEMA: &str = "
    CREATE TABLE mutations (
        mutation_id INTEGER PRIMARY KEY,
        mutation    TEXT NOT NULL
    );

    CREATE TABLE options (
        mutation_id INTEGER NOT NULL,
        opt_type    TEXT NOT NULL,
        opt_value   TEXT NOT NULL
    );

    CREATE TABLE results (
        mutation_id INTEGER NOT NULL,
        test        TEXT NOT NULL,
        result      TEXT NOT NULL,
        PRIMARY KEY (mutation_id, test)
    );

    CREATE TABLE tags (
        mutation_id INTEGER NOT NULL,
        tag         TEXT NOT NULL
    );

    CREATE TABLE queue (
        mutation_id INTEGER NOT NULL,
        test        TEXT NOT NULL,
        running     INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (mutation_id, test)
    );

    CREATE TABLE sources (
        srctag TEXT NOT NULL
    );

    CREATE TABLE meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Store-level errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The project database does not exist yet.
    #[error("no database found at {path}; run `mutcov init` first")]
    Unavailable {
        /// Expected database file path.
        path: String,
    },
    /// Refusing to clobber an existing database.
    #[error("database already exists at {path}")]
    AlreadyInitialized {
        /// Existing database file path.
        path: String,
    },
    /// Unknown mutation identity.
    #[error("no mutation with id {0}")]
    UnknownMutation(i64),
    /// SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One mutation's row in list views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationRow {
    /// Mutation identity.
    pub id: i64,
    /// Raw descriptor text.
    pub descriptor: String,
    /// Tags currently attached.
    pub tags: Vec<String>,
    /// Queue entries as `(test identity, running)`.
    pub queue: Vec<(String, bool)>,
    /// Cached results as `(test identity, token)`.
    pub results: Vec<(String, String)>,
}

/// Aggregate row for the `source` coverage view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCoverage {
    /// Source tag string.
    pub src: String,
    /// Mutations attributed to this source location.
    pub mutations: i64,
    /// Per-tag mutation counts at this location.
    pub tags: Vec<(String, i64)>,
}

/// Handle to the project database.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Create a fresh database under `dir` and install the schema.
    pub fn create(dir: &Path) -> Result<Self, StoreError> {
        let path = Self::db_path(dir);
        if path.exists() {
            return Err(StoreError::AlreadyInitialized {
                path: path.display().to_string(),
            });
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open the existing database under `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = Self::db_path(dir);
        if !path.exists() {
            return Err(StoreError::Unavailable {
                path: path.display().to_string(),
            });
        }
        let conn = Connection::open(&path)?;
        Ok(Self { conn })
    }

    /// In-memory store with the full schema, for unit tests.
    #[cfg(test)]
    pub(crate) fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory database should open");
        conn.execute_batch(SCHEMA)
            .expect("schema should install");
        Self { conn }
    }

    /// Database file path under a project directory.
    pub fn db_path(dir: &Path) -> PathBuf {
        dir.join(DB_FILE)
    }

    /// Begin a deferred transaction for a multi-statement unit.
    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self.conn.transaction()?)
    }

    // -- meta ---------------------------------------------------------------

    /// Persist the effective global seed.
    pub fn set_seed(&self, seed: u32) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('seed', ?1)",
            params![seed.to_string()],
        )?;
        Ok(())
    }

    /// Previously persisted global seed.
    pub fn seed(&self) -> Result<Option<u32>, StoreError> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'seed'", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    // -- mutations ----------------------------------------------------------

    /// Insert a mutation descriptor, decoding its `-type value` option
    /// pairs, and return the assigned identity.
    pub fn insert_mutation(&mut self, descriptor: &str) -> Result<i64, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO mutations (mutation) VALUES (?1)",
            params![descriptor],
        )?;
        let mid = tx.last_insert_rowid();

        let tokens: Vec<&str> = descriptor.split_whitespace().collect();
        let mut i = 0;
        while i + 1 < tokens.len() {
            if let Some(opt_type) = tokens[i].strip_prefix('-') {
                tx.execute(
                    "INSERT INTO options (mutation_id, opt_type, opt_value) VALUES (?1, ?2, ?3)",
                    params![mid, opt_type, tokens[i + 1]],
                )?;
                i += 2;
            } else {
                i += 1;
            }
        }
        tx.commit()?;
        Ok(mid)
    }

    /// All mutation identities in ascending order.
    pub fn mutation_ids(&self) -> Result<Vec<i64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT mutation_id FROM mutations ORDER BY mutation_id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Number of live mutations.
    pub fn mutation_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Raw descriptor for one mutation.
    pub fn descriptor(&self, mid: i64) -> Result<String, StoreError> {
        self.conn
            .query_row(
                "SELECT mutation FROM mutations WHERE mutation_id = ?1",
                params![mid],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::UnknownMutation(mid))
    }

    /// True when a descriptor string is already stored.
    pub fn has_descriptor(&self, descriptor: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT mutation_id FROM mutations WHERE mutation = ?1 LIMIT 1",
                params![descriptor],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -- sources ------------------------------------------------------------

    /// Replace all stored source tags.
    pub fn replace_sources(&mut self, srctags: &[String]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM sources", [])?;
        for srctag in srctags {
            tx.execute("INSERT INTO sources (srctag) VALUES (?1)", params![srctag])?;
        }
        tx.commit()?;
        Ok(())
    }

    // -- results ------------------------------------------------------------

    /// Cached result token for `(mutation, test identity)`.
    pub fn result(&self, mid: i64, test: &str) -> Result<Option<String>, StoreError> {
        result_on(&self.conn, mid, test)
    }

    /// All cached results for one mutation.
    pub fn results_for(&self, mid: i64) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT test, result FROM results WHERE mutation_id = ?1 ORDER BY test ASC",
        )?;
        let rows = stmt
            .query_map(params![mid], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Upsert a batch of `(mutation, test identity, token)` rows as one
    /// unit. Replace-on-write: at most one row per key.
    pub fn upsert_results(&mut self, rows: &[(i64, String, String)]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for (mid, test, token) in rows {
            tx.execute(
                "INSERT OR REPLACE INTO results (mutation_id, test, result) VALUES (?1, ?2, ?3)",
                params![mid, test, token],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // -- queue --------------------------------------------------------------

    /// Pending test identity with the most non-running queue entries.
    /// Equal counts fall back to lexical order on the identity string.
    pub fn next_test(&self, subset: Option<&[i64]>) -> Result<Option<(String, u64)>, StoreError> {
        let sql = format!(
            "SELECT test, COUNT(*) AS cnt FROM queue WHERE running = 0 AND {} \
             GROUP BY test ORDER BY cnt DESC, test ASC LIMIT 1",
            subset_clause(subset)
        );
        let row = self
            .conn
            .query_row(&sql, [], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        Ok(row.map(|(test, cnt)| (test, cnt as u64)))
    }

    /// Claim up to `limit` non-running entries for one test identity and
    /// mark them running, inside one exclusive transaction so concurrent
    /// selectors can never claim overlapping `(mutation, test)` pairs.
    pub fn claim_batch(
        &mut self,
        test: &str,
        limit: usize,
        subset: Option<&[i64]>,
    ) -> Result<Vec<i64>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let sql = format!(
            "SELECT mutation_id FROM queue WHERE running = 0 AND test = ?1 AND {} \
             ORDER BY mutation_id ASC LIMIT {limit}",
            subset_clause(subset)
        );
        let mids = {
            let mut stmt = tx.prepare(&sql)?;
            stmt.query_map(params![test], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?
        };

        for mid in &mids {
            tx.execute(
                "UPDATE queue SET running = 1 WHERE mutation_id = ?1 AND test = ?2",
                params![mid, test],
            )?;
        }
        tx.commit()?;
        Ok(mids)
    }

    /// Mark an explicit mutation list running for one test identity,
    /// inserting entries that do not exist (ad-hoc dispatch path).
    pub fn claim_adhoc(&mut self, test: &str, mids: &[i64]) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)?;
        for mid in mids {
            tx.execute(
                "INSERT OR REPLACE INTO queue (mutation_id, test, running) VALUES (?1, ?2, 1)",
                params![mid, test],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Roll the running flag back for specific `(mutation, test)` pairs.
    pub fn release_running(&mut self, test: &str, mids: &[i64]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for mid in mids {
            tx.execute(
                "UPDATE queue SET running = 0 WHERE mutation_id = ?1 AND test = ?2",
                params![mid, test],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Clear every running flag (ungraceful-shutdown recovery).
    pub fn reset_all_running(&self) -> Result<(), StoreError> {
        self.conn.execute("UPDATE queue SET running = 0", [])?;
        Ok(())
    }

    // -- projections ----------------------------------------------------------

    /// Cached result counts grouped by `(test identity, token)`.
    pub fn result_counts(&self) -> Result<Vec<(String, String, u64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT test, result, COUNT(*) FROM results GROUP BY test, result \
             ORDER BY test, result",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Tag counts grouped by tag name.
    pub fn tag_counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag, COUNT(*) FROM tags GROUP BY tag ORDER BY tag")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Queue entry counts grouped by test identity: `(test, total, running)`.
    pub fn queue_counts(&self) -> Result<Vec<(String, u64, u64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT test, COUNT(*), SUM(running) FROM queue GROUP BY test ORDER BY test",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of mutations carrying at least one tag.
    pub fn tagged_mutation_count(&self) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM (SELECT 1 FROM tags GROUP BY mutation_id)",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of mutations carrying a specific tag.
    pub fn tag_count(&self, tag: &str) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(DISTINCT mutation_id) FROM tags WHERE tag = ?1",
            params![tag],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// List rows, optionally restricted to explicit ids or a tag filter.
    pub fn list(
        &self,
        ids: Option<&[i64]>,
        tag: Option<&str>,
    ) -> Result<Vec<MutationRow>, StoreError> {
        let mut rows = Vec::new();
        let mut stmt = self
            .conn
            .prepare("SELECT mutation_id, mutation FROM mutations ORDER BY mutation_id ASC")?;
        let mutations = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        for (mid, descriptor) in mutations {
            if let Some(ids) = ids {
                if !ids.contains(&mid) {
                    continue;
                }
            }

            let mut tag_stmt = self
                .conn
                .prepare("SELECT tag FROM tags WHERE mutation_id = ?1 ORDER BY tag")?;
            let tags = tag_stmt
                .query_map(params![mid], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;

            if let Some(filter) = tag {
                if !tags.iter().any(|t| t == filter) {
                    continue;
                }
            }

            let mut queue_stmt = self
                .conn
                .prepare("SELECT test, running FROM queue WHERE mutation_id = ?1 ORDER BY test")?;
            let queue = queue_stmt
                .query_map(params![mid], |row| {
                    Ok((row.get(0)?, row.get::<_, i64>(1)? != 0))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let results = self.results_for(mid)?;

            rows.push(MutationRow {
                id: mid,
                descriptor,
                tags,
                queue,
                results,
            });
        }
        Ok(rows)
    }

    /// Coverage projection: one row per stored source tag, with the number
    /// of mutations attributed to it (via `src` options) and per-tag counts.
    pub fn source_coverage(&self) -> Result<Vec<SourceCoverage>, StoreError> {
        let mut src_stmt = self
            .conn
            .prepare("SELECT srctag FROM sources ORDER BY rowid")?;
        let srctags = src_stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut out = Vec::with_capacity(srctags.len());
        for src in srctags {
            let mutations: i64 = self.conn.query_row(
                "SELECT COUNT(DISTINCT mutation_id) FROM options \
                 WHERE opt_type = 'src' AND opt_value = ?1",
                params![&src],
                |row| row.get(0),
            )?;

            let mut tag_stmt = self.conn.prepare(
                "SELECT t.tag, COUNT(DISTINCT t.mutation_id) FROM tags t \
                 JOIN options o ON o.mutation_id = t.mutation_id \
                 WHERE o.opt_type = 'src' AND o.opt_value = ?1 \
                 GROUP BY t.tag ORDER BY t.tag",
            )?;
            let tags = tag_stmt
                .query_map(params![&src], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(String, i64)>, _>>()?;

            out.push(SourceCoverage {
                src,
                mutations,
                tags,
            });
        }
        Ok(out)
    }
}

/// SQL fragment restricting queue rows to a mutation-id subset; `1` when
/// no subset applies. Ids are integers, interpolated directly.
fn subset_clause(subset: Option<&[i64]>) -> String {
    match subset {
        None => "1".to_string(),
        Some(ids) if ids.is_empty() => "0".to_string(),
        Some(ids) => {
            let list = ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("mutation_id IN ({list})")
        }
    }
}

// Row-level helpers shared with the decision engine, which operates inside
// its own transaction (a `Transaction` derefs to `Connection`).

/// Delete the derived queue/tag rows for one mutation.
pub(crate) fn clear_derived_on(conn: &Connection, mid: i64) -> Result<(), StoreError> {
    conn.execute("DELETE FROM queue WHERE mutation_id = ?1", params![mid])?;
    conn.execute("DELETE FROM tags WHERE mutation_id = ?1", params![mid])?;
    Ok(())
}

/// Cached result lookup usable mid-transaction.
pub(crate) fn result_on(
    conn: &Connection,
    mid: i64,
    test: &str,
) -> Result<Option<String>, StoreError> {
    let token = conn
        .query_row(
            "SELECT result FROM results WHERE mutation_id = ?1 AND test = ?2",
            params![mid, test],
            |row| row.get(0),
        )
        .optional()?;
    Ok(token)
}

/// Record a tag mid-transaction.
pub(crate) fn add_tag_on(conn: &Connection, mid: i64, tag: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tags (mutation_id, tag) VALUES (?1, ?2)",
        params![mid, tag],
    )?;
    Ok(())
}

/// Record a pending queue request mid-transaction.
pub(crate) fn push_queue_on(conn: &Connection, mid: i64, test: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO queue (mutation_id, test, running) VALUES (?1, ?2, 0)",
        params![mid, test],
    )?;
    Ok(())
}
