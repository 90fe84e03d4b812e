//! Report Engine and status summary.
//!
//! The report procedure is a read-only projection over the store: its one
//! primitive, `tags`, counts tagged mutations. The status summary is the
//! fixed projection printed by `init`, `reset`, `status`, and `run`.

use std::fmt::Write as _;

use thiserror::Error;

use crate::config::Config;
use crate::script::{self, ScriptEnv, ScriptError};
use crate::store::{Store, StoreError};

/// Report-engine errors.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Fatal fault in the report procedure.
    #[error("report procedure failed: {0}")]
    Script(#[from] ScriptError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct ReportEnv<'a> {
    store: &'a Store,
    lines: Vec<String>,
}

impl ScriptEnv for ReportEnv<'_> {
    fn tag_count(&mut self, tag: Option<&str>) -> Result<i64, ScriptError> {
        let wrap = |e: StoreError| ScriptError::Env(Box::new(e));
        match tag {
            None => self.store.tagged_mutation_count().map_err(wrap),
            Some(tag) => match tag.strip_prefix('!') {
                Some(name) => {
                    let tagged = self.store.tagged_mutation_count().map_err(wrap)?;
                    let with = self.store.tag_count(name).map_err(wrap)?;
                    Ok(tagged - with)
                }
                None => self.store.tag_count(tag).map_err(wrap),
            },
        }
    }

    fn print_line(&mut self, line: &str) -> Result<(), ScriptError> {
        self.lines.push(line.to_string());
        Ok(())
    }
}

/// Run the report procedure and return its output lines.
pub fn render_report(store: &Store, cfg: &Config) -> Result<String, ReportError> {
    let mut env = ReportEnv {
        store,
        lines: Vec::new(),
    };
    script::run_program(&cfg.report, &mut env)?;
    Ok(env.lines.join("\n"))
}

/// Render the fixed status summary: cached results, tags, queue depth.
pub fn render_status(store: &Store) -> Result<String, StoreError> {
    let mut out = String::new();

    for (test, result, count) in store.result_counts()? {
        let _ = writeln!(
            out,
            "Database contains {count} cached \"{result}\" results for \"{test}\"."
        );
    }
    for (tag, count) in store.tag_counts()? {
        let _ = writeln!(out, "Tagged {count} mutations as \"{tag}\".");
    }
    for (test, total, running) in store.queue_counts()? {
        if running > 0 {
            let _ = writeln!(
                out,
                "Queued {total} tasks for test \"{test}\", {running} running."
            );
        } else {
            let _ = writeln!(out, "Queued {total} tasks for test \"{test}\".");
        }
    }

    Ok(out)
}
