//! Decision Engine.
//!
//! The engine is the only writer of tags and queue entries. For one
//! mutation it clears the derived rows, replays the decision procedure
//! against the cached results, and records whatever the procedure
//! produced: tags plus at most one pending test request (the first
//! `result(...)` fetch that found nothing cached). The whole rebuild is
//! one store transaction.
//!
//! Given unchanged cached results, re-running the engine always
//! reproduces the same tags and the same pending request, which is why
//! the full recompute pass is safe to run unconditionally at any time.

use rusqlite::Connection;
use thiserror::Error;

use crate::config::Config;
use crate::rng::MutationRng;
use crate::script::{self, Outcome, ScriptError};
use crate::store::{self, Store, StoreError};

/// Decision-engine errors. Script contract violations (bad cached token,
/// disallowed tag, unknown test) arrive as [`ScriptError`] variants; all
/// of them abort the entire run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal fault in the decision procedure.
    #[error("decision procedure failed for mutation {mid}: {source}")]
    Script {
        /// Mutation under evaluation.
        mid: i64,
        /// Underlying script fault.
        #[source]
        source: ScriptError,
    },
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Environment the decision procedure runs in: cached-result fetches,
/// tag recording, and the mutation's deterministic random stream.
struct DecisionEnv<'a> {
    conn: &'a Connection,
    cfg: &'a Config,
    mid: i64,
    rng: MutationRng,
}

impl script::ScriptEnv for DecisionEnv<'_> {
    fn fetch_result(&mut self, test: &str) -> Result<Option<String>, ScriptError> {
        let (_, test_cfg) = self
            .cfg
            .test_for_identity(test)
            .ok_or_else(|| ScriptError::UnknownTest(test.to_string()))?;

        let token = store::result_on(self.conn, self.mid, test)
            .map_err(|e| ScriptError::Env(Box::new(e)))?;

        if let (Some(token), Some(expect)) = (&token, &test_cfg.expect) {
            if !expect.contains(token) {
                return Err(ScriptError::ResultOutsideExpect {
                    test: test.to_string(),
                    result: token.clone(),
                });
            }
        }
        Ok(token)
    }

    fn add_tag(&mut self, tag: &str) -> Result<(), ScriptError> {
        if let Some(allowed) = &self.cfg.tags {
            if !allowed.contains(tag) {
                return Err(ScriptError::TagNotAllowed(tag.to_string()));
            }
        }
        store::add_tag_on(self.conn, self.mid, tag).map_err(|e| ScriptError::Env(Box::new(e)))
    }

    fn draw(&mut self, n: u32) -> Result<u32, ScriptError> {
        Ok(self.rng.draw(n))
    }
}

/// Re-evaluate one mutation: rebuild its tags and queue entry from the
/// currently cached results.
pub fn update_mutation(
    store: &mut Store,
    cfg: &Config,
    seed: u32,
    mid: i64,
) -> Result<(), EngineError> {
    let tx = store.transaction()?;
    store::clear_derived_on(&tx, mid)?;

    let mut env = DecisionEnv {
        conn: &tx,
        cfg,
        mid,
        rng: MutationRng::new(seed, mid),
    };
    let outcome = script::run_program(&cfg.logic, &mut env)
        .map_err(|source| EngineError::Script { mid, source })?;

    if let Outcome::Pending(test) = outcome {
        store::push_queue_on(&tx, mid, &test)?;
    }
    tx.commit().map_err(StoreError::from)?;
    Ok(())
}

/// Recompute queue and tags for every mutation from cached results.
///
/// Idempotent and safe to run unconditionally; since every queue row is
/// deleted and rebuilt, stuck running flags cannot survive it.
pub fn reset_all(store: &mut Store, cfg: &Config, seed: u32) -> Result<(), EngineError> {
    for mid in store.mutation_ids()? {
        update_mutation(store, cfg, seed, mid)?;
    }
    Ok(())
}
