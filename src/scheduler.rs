//! Batch Scheduler.
//!
//! Drives the work queue to empty: pick the test identity with the most
//! pending entries, claim a batch, dispatch one runner process per batch,
//! and on completion cache the results and re-evaluate every batch
//! member. Claiming and collecting all happen in this process; the store
//! claim transaction is what keeps concurrent schedulers from racing.
//!
//! Every abort path (fatal error or interrupt) kills the in-flight
//! children and rolls their running markers back, so an aborted run
//! leaves only clean pending entries behind.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::config::{self, Config, TestConfig};
use crate::engine::{self, EngineError};
use crate::store::{Store, StoreError};
use crate::task::{self, Task, TaskError, TaskPool};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static TASK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Scheduling and collection errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A queued test identity has no `[test NAME]` section.
    #[error("queue references unknown test \"{0}\"")]
    UnknownTest(String),
    /// A queued test identity has no run command to dispatch.
    #[error("no run command configured for test \"{0}\"")]
    NoRunCommand(String),
    /// Output artifact is missing, unparsable, or does not cover the
    /// batch exactly.
    #[error("malformed output from task {task}: {detail}")]
    MalformedOutput {
        /// Task identity.
        task: String,
        /// What was wrong.
        detail: String,
    },
    /// Runner reported a result token outside the test's expected set.
    #[error("task {task} reported \"{result}\" for test \"{test}\", outside the expected set")]
    ContractViolation {
        /// Task identity.
        task: String,
        /// Test identity.
        test: String,
        /// Offending token.
        result: String,
    },
    /// Signal handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    Signal(String),
    /// Child-process failure.
    #[error(transparent)]
    Task(#[from] TaskError),
    /// Re-evaluation failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Artifact IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Knobs for one scheduling run.
pub struct RunOptions {
    /// Concurrent task limit.
    pub jobs: usize,
    /// Keep task scratch directories after successful collection.
    pub keep: bool,
    /// Restrict scheduling to these mutation identities.
    pub subset: Option<Vec<i64>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            keep: false,
            subset: None,
        }
    }
}

fn install_signal_handler_once() -> Result<(), SchedulerError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(SchedulerError::Signal(msg.clone())),
    }
}

fn now_timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn generate_task_id() -> String {
    let seq = TASK_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!("task-{}-{}-{}", now_timestamp_ms(), std::process::id(), seq)
}

/// Run the scheduling loop until the (optionally subsetted) queue is
/// empty or an interrupt arrives.
pub fn run(
    store: &mut Store,
    cfg: &Config,
    project_dir: &Path,
    seed: u32,
    opts: &RunOptions,
) -> Result<(), SchedulerError> {
    install_signal_handler_once()?;
    INTERRUPTED.store(false, Ordering::SeqCst);

    let mut pool = TaskPool::new(opts.jobs);
    let result = drive(store, cfg, project_dir, seed, opts, &mut pool);

    // Fatal or interrupted: kill what is still in flight and roll the
    // running markers back so nothing stays claimed. A rollback failure
    // must not replace the diagnostic that aborted the run.
    let stranded = pool.terminate_all();
    let mut rollback: Result<(), StoreError> = Ok(());
    for task in &stranded {
        if let Err(err) = store.release_running(&task.test, &task.batch) {
            eprintln!("mutcov: could not release claim of task {}: {err}", task.id);
            if rollback.is_ok() {
                rollback = Err(err);
            }
        }
    }
    result?;
    rollback?;
    if INTERRUPTED.load(Ordering::SeqCst) {
        println!(
            "mutcov: interrupted, rolled back {} in-flight tasks",
            stranded.len()
        );
    }
    Ok(())
}

fn drive(
    store: &mut Store,
    cfg: &Config,
    project_dir: &Path,
    seed: u32,
    opts: &RunOptions,
    pool: &mut TaskPool,
) -> Result<(), SchedulerError> {
    let subset = opts.subset.as_deref();

    loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut failure: Option<SchedulerError> = None;
        for (task, status) in pool.reap()? {
            if failure.is_some() {
                store.release_running(&task.test, &task.batch)?;
                continue;
            }
            let outcome = if status.success() {
                collect(store, cfg, seed, &task, opts.keep)
            } else {
                Err(task.failure(status).into())
            };
            if let Err(err) = outcome {
                store.release_running(&task.test, &task.batch)?;
                failure = Some(err);
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        while pool.has_capacity() && !INTERRUPTED.load(Ordering::SeqCst) {
            let Some((test, pending)) = store.next_test(subset)? else {
                break;
            };
            let test_cfg = lookup_test(cfg, &test)?;
            let limit = test_cfg.max_batch_size.min(pending as usize).max(1);
            let batch = store.claim_batch(&test, limit, subset)?;
            if batch.is_empty() {
                break;
            }
            let task = dispatch(store, test_cfg, project_dir, &test, batch, opts.keep)?;
            println!(
                "mutcov: running task {} for test \"{}\" ({} mutations)",
                task.id,
                task.test,
                task.batch.len()
            );
            pool.dispatch(task);
        }

        if pool.is_empty() {
            return Ok(());
        }
        std::thread::sleep(task::POLL_INTERVAL);
    }
}

/// Run one test identity against an explicit mutation list, bypassing
/// queue selection and the batch size limit (`mutcov task`).
pub fn run_single(
    store: &mut Store,
    cfg: &Config,
    project_dir: &Path,
    seed: u32,
    test: &str,
    mids: &[i64],
    keep: bool,
) -> Result<(), SchedulerError> {
    install_signal_handler_once()?;
    INTERRUPTED.store(false, Ordering::SeqCst);

    let test_cfg = lookup_test(cfg, test)?;
    store.claim_adhoc(test, mids)?;

    let mut task = match dispatch(store, test_cfg, project_dir, test, mids.to_vec(), keep) {
        Ok(task) => task,
        Err(err) => {
            store.release_running(test, mids)?;
            return Err(err);
        }
    };

    loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            task.terminate();
            store.release_running(test, mids)?;
            println!("mutcov: interrupted, rolled back task {}", task.id);
            return Ok(());
        }
        match task.poll() {
            Ok(Some(status)) if status.success() => break,
            Ok(Some(status)) => {
                let err = TaskError::ProcessFailed {
                    command: task.command.clone(),
                    status: status.to_string(),
                    log: task.log_path().display().to_string(),
                };
                store.release_running(test, mids)?;
                return Err(err.into());
            }
            Ok(None) => std::thread::sleep(task::POLL_INTERVAL),
            Err(err) => {
                task.terminate();
                store.release_running(test, mids)?;
                return Err(err.into());
            }
        }
    }

    if let Err(err) = collect(store, cfg, seed, &task, keep) {
        store.release_running(test, mids)?;
        return Err(err);
    }
    Ok(())
}

fn lookup_test<'a>(cfg: &'a Config, test: &str) -> Result<&'a TestConfig, SchedulerError> {
    let (_, test_cfg) = cfg
        .test_for_identity(test)
        .ok_or_else(|| SchedulerError::UnknownTest(test.to_string()))?;
    if test_cfg.run.is_none() {
        return Err(SchedulerError::NoRunCommand(test.to_string()));
    }
    Ok(test_cfg)
}

/// Create the scratch directory and input artifact, then launch the
/// runner with the documented environment.
fn dispatch(
    store: &Store,
    test_cfg: &TestConfig,
    project_dir: &Path,
    test: &str,
    batch: Vec<i64>,
    keep: bool,
) -> Result<Task, SchedulerError> {
    let task_id = generate_task_id();
    let dir = project_dir.join("database").join("tasks").join(&task_id);
    std::fs::create_dir_all(&dir)?;

    let mut input = String::new();
    for (i, mid) in batch.iter().enumerate() {
        let _ = writeln!(input, "{} {}", i + 1, store.descriptor(*mid)?);
    }
    std::fs::write(dir.join("input.txt"), input)?;

    let run = test_cfg.run.as_deref().unwrap_or_default();
    let (_, args) = config::split_identity(test);
    let command = if args.is_empty() {
        run.to_string()
    } else {
        format!("{run} {args}")
    };

    let project = absolute(project_dir);
    let mutations = batch
        .iter()
        .map(|mid| mid.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let envs = vec![
        ("MUTCOV_TASK".to_string(), task_id.clone()),
        ("MUTCOV_PROJECT".to_string(), project.display().to_string()),
        (
            "MUTCOV_KEEPDIR".to_string(),
            if keep { "1" } else { "0" }.to_string(),
        ),
        ("MUTCOV_MUTATIONS".to_string(), mutations),
        (
            "MUTCOV_SCRIPTS".to_string(),
            project.join("scripts").display().to_string(),
        ),
    ];

    Ok(Task::spawn(
        task_id,
        test.to_string(),
        batch,
        dir,
        command,
        &envs,
    )?)
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Validate and ingest one finished task's output artifact, cache the
/// results, and re-evaluate every batch member.
fn collect(
    store: &mut Store,
    cfg: &Config,
    seed: u32,
    task: &Task,
    keep: bool,
) -> Result<(), SchedulerError> {
    let malformed = |detail: String| SchedulerError::MalformedOutput {
        task: task.id.clone(),
        detail,
    };

    let path = task.dir.join("output.txt");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| malformed(format!("cannot read {}: {e}", path.display())))?;

    let test_cfg = lookup_test(cfg, &task.test)?;
    let mut tokens: BTreeMap<usize, String> = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((index, token)) = line.split_once(char::is_whitespace) else {
            return Err(malformed(format!("line {line:?} has no result token")));
        };
        let token = token.trim();
        let Ok(index) = index.parse::<usize>() else {
            return Err(malformed(format!("line {line:?} has no batch index")));
        };
        if index == 0 || index > task.batch.len() {
            return Err(malformed(format!("index {index} outside the batch")));
        }
        if token.is_empty() || token.split_whitespace().count() != 1 {
            return Err(malformed(format!("line {line:?} has no single-word token")));
        }
        if let Some(expect) = &test_cfg.expect {
            if !expect.contains(token) {
                return Err(SchedulerError::ContractViolation {
                    task: task.id.clone(),
                    test: task.test.clone(),
                    result: token.to_string(),
                });
            }
        }
        if tokens.insert(index, token.to_string()).is_some() {
            return Err(malformed(format!("duplicate result for index {index}")));
        }
    }
    if tokens.len() != task.batch.len() {
        return Err(malformed(format!(
            "{} results for a batch of {}",
            tokens.len(),
            task.batch.len()
        )));
    }

    let rows: Vec<(i64, String, String)> = tokens
        .into_iter()
        .map(|(index, token)| (task.batch[index - 1], task.test.clone(), token))
        .collect();
    store.upsert_results(&rows)?;

    for &mid in &task.batch {
        engine::update_mutation(store, cfg, seed, mid)?;
    }

    if !keep {
        std::fs::remove_dir_all(&task.dir)?;
    }
    println!(
        "mutcov: finished task {} for test \"{}\" ({} mutations)",
        task.id,
        task.test,
        task.batch.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Mutex, MutexGuard};
    use tempfile::{TempDir, tempdir};

    // The interrupt flag is process-global and reset by every run; tests
    // that drive the loop must not overlap.
    static RUN_LOCK: Mutex<()> = Mutex::new(());

    fn run_lock() -> MutexGuard<'static, ()> {
        RUN_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Runner script: reads "index descriptor..." lines from input.txt,
    // reports FAIL for odd generator numbers and PASS for even ones.
    const PARITY_RUNNER: &str = r#"#!/bin/sh
while read idx num rest; do
    if [ $((num % 2)) -eq 1 ]; then
        echo "$idx FAIL"
    else
        echo "$idx PASS"
    fi
done < input.txt > output.txt
"#;

    const SMOKE_CONFIG: &str = r#"
[logic]
r = result("smoke")
if r == "FAIL": tag("broken")

[test smoke]
maxbatchsize 4
expect PASS FAIL
run sh "$MUTCOV_PROJECT/runner.sh"
"#;

    fn project_with_runner(script: &str) -> TempDir {
        let tmp = tempdir().expect("tempdir should be created");
        let path = tmp.path().join("runner.sh");
        std::fs::write(&path, script).expect("runner should be written");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("runner should be executable");
        tmp
    }

    fn populated(cfg_text: &str, n: i64) -> (Store, Config) {
        let cfg = Config::parse(cfg_text, "config.mcy").expect("config should parse");
        let mut store = Store::in_memory();
        for i in 1..=n {
            store
                .insert_mutation(&format!("{i} inv -src top.v:{i}"))
                .expect("mutation should insert");
        }
        engine::reset_all(&mut store, &cfg, 42).expect("reset should work");
        (store, cfg)
    }

    #[test]
    fn smoke_scenario_drains_the_queue_and_tags_failures() {
        let _guard = run_lock();
        let tmp = project_with_runner(PARITY_RUNNER);
        let (mut store, cfg) = populated(SMOKE_CONFIG, 10);

        let opts = RunOptions {
            jobs: 2,
            ..RunOptions::default()
        };
        run(&mut store, &cfg, tmp.path(), 42, &opts).expect("run should finish");

        assert!(store.next_test(None).expect("query should work").is_none());
        for mid in 1..=10 {
            let want = if mid % 2 == 1 { "FAIL" } else { "PASS" };
            assert_eq!(
                store.result(mid, "smoke").expect("result should load"),
                Some(want.to_string())
            );
        }
        assert_eq!(store.tag_count("broken").expect("count should work"), 5);

        // Scratch dirs are removed after successful collection.
        let tasks_dir = tmp.path().join("database/tasks");
        assert_eq!(
            std::fs::read_dir(tasks_dir)
                .expect("tasks dir should exist")
                .count(),
            0
        );
    }

    #[test]
    fn subset_restricts_scheduling() {
        let _guard = run_lock();
        let tmp = project_with_runner(PARITY_RUNNER);
        let (mut store, cfg) = populated(SMOKE_CONFIG, 6);

        let opts = RunOptions {
            subset: Some(vec![2, 3]),
            ..RunOptions::default()
        };
        run(&mut store, &cfg, tmp.path(), 42, &opts).expect("run should finish");

        assert!(store.result(2, "smoke").expect("result should load").is_some());
        assert!(store.result(1, "smoke").expect("result should load").is_none());
        let (_, pending) = store
            .next_test(None)
            .expect("query should work")
            .expect("others should stay pending");
        assert_eq!(pending, 4);
    }

    #[test]
    fn identity_arguments_are_appended_to_the_run_command() {
        let _guard = run_lock();
        // Runner writes its arguments into the output token position so
        // the command line is observable; expect set must admit it.
        let tmp = project_with_runner(
            "#!/bin/sh\necho \"1 ARG-$1\" > output.txt\n",
        );
        let cfg_text = r#"
[logic]
r = result("smoke -fast")
if r == "ARG--fast": tag("fast")

[test smoke]
run sh "$MUTCOV_PROJECT/runner.sh"
"#;
        let (mut store, cfg) = populated(cfg_text, 1);

        run(&mut store, &cfg, tmp.path(), 42, &RunOptions::default())
            .expect("run should finish");
        assert_eq!(
            store.result(1, "smoke -fast").expect("result should load"),
            Some("ARG--fast".to_string())
        );
        assert_eq!(store.tag_count("fast").expect("count should work"), 1);
    }

    #[test]
    fn unexpected_result_token_aborts_and_rolls_back() {
        let _guard = run_lock();
        let tmp = project_with_runner("#!/bin/sh\necho \"1 BANANA\" > output.txt\n");
        let (mut store, cfg) = populated(SMOKE_CONFIG, 1);

        let err = run(&mut store, &cfg, tmp.path(), 42, &RunOptions::default())
            .expect_err("run should abort");
        assert!(matches!(err, SchedulerError::ContractViolation { .. }));
        assert!(store.result(1, "smoke").expect("result should load").is_none());
    }

    #[test]
    fn incomplete_output_coverage_is_rejected() {
        let _guard = run_lock();
        // Batch of 4 but only one result line.
        let tmp = project_with_runner("#!/bin/sh\necho \"1 PASS\" > output.txt\n");
        let (mut store, cfg) = populated(SMOKE_CONFIG, 4);

        let err = run(&mut store, &cfg, tmp.path(), 42, &RunOptions::default())
            .expect_err("run should abort");
        assert!(matches!(err, SchedulerError::MalformedOutput { .. }));
    }

    #[test]
    fn garbage_output_line_is_rejected() {
        let _guard = run_lock();
        let tmp = project_with_runner("#!/bin/sh\necho \"first PASS\" > output.txt\n");
        let (mut store, cfg) = populated(SMOKE_CONFIG, 1);

        let err = run(&mut store, &cfg, tmp.path(), 42, &RunOptions::default())
            .expect_err("run should abort");
        assert!(matches!(err, SchedulerError::MalformedOutput { .. }));
    }

    #[test]
    fn nonzero_runner_exit_is_fatal_and_releases_the_claim() {
        let _guard = run_lock();
        let tmp = project_with_runner("#!/bin/sh\nexit 3\n");
        let (mut store, cfg) = populated(SMOKE_CONFIG, 2);

        let err = run(&mut store, &cfg, tmp.path(), 42, &RunOptions::default())
            .expect_err("run should abort");
        assert!(matches!(err, SchedulerError::Task(TaskError::ProcessFailed { .. })));
        assert_eq!(
            store.queue_counts().expect("counts should work"),
            vec![("smoke".to_string(), 2, 0)]
        );
    }

    #[test]
    fn fatal_failure_reports_first_diagnostic_and_releases_stranded_claims() {
        let _guard = run_lock();
        // First batch (carrying mutation 1) fails at once; the second
        // batch sleeps and is still in flight when the run aborts.
        let tmp = project_with_runner(
            "#!/bin/sh\nif grep -q \" 1 inv\" input.txt; then exit 3; fi\nsleep 60\n",
        );
        let (mut store, cfg) = populated(SMOKE_CONFIG, 5);

        let opts = RunOptions {
            jobs: 2,
            ..RunOptions::default()
        };
        let err = run(&mut store, &cfg, tmp.path(), 42, &opts).expect_err("run should abort");
        assert!(matches!(err, SchedulerError::Task(TaskError::ProcessFailed { .. })));

        // Both the failed batch and the stranded one are pending again.
        assert_eq!(
            store.queue_counts().expect("counts should work"),
            vec![("smoke".to_string(), 5, 0)]
        );
    }

    #[test]
    fn interrupt_kills_children_and_rolls_running_markers_back() {
        let _guard = run_lock();
        let tmp = project_with_runner("#!/bin/sh\nsleep 60\n");
        let (mut store, cfg) = populated(SMOKE_CONFIG, 2);

        let interrupter = std::thread::spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            INTERRUPTED.store(true, Ordering::SeqCst);
        });
        run(&mut store, &cfg, tmp.path(), 42, &RunOptions::default())
            .expect("interrupted run should stop cleanly");
        interrupter
            .join()
            .expect("interrupter thread should join cleanly");

        assert_eq!(
            store.queue_counts().expect("counts should work"),
            vec![("smoke".to_string(), 2, 0)]
        );
        assert!(store.result(1, "smoke").expect("result should load").is_none());
    }

    #[test]
    fn adhoc_dispatch_reruns_cached_mutations() {
        let _guard = run_lock();
        let tmp = project_with_runner(PARITY_RUNNER);
        let (mut store, cfg) = populated(SMOKE_CONFIG, 3);
        store
            .upsert_results(&[(1, "smoke".to_string(), "PASS".to_string())])
            .expect("upsert should work");
        engine::reset_all(&mut store, &cfg, 42).expect("reset should work");

        run_single(&mut store, &cfg, tmp.path(), 42, "smoke", &[1, 2], false)
            .expect("ad-hoc run should finish");

        // Mutation 1 had a cached PASS; the rerun replaced it.
        assert_eq!(
            store.result(1, "smoke").expect("result should load"),
            Some("FAIL".to_string())
        );
        assert_eq!(
            store.result(2, "smoke").expect("result should load"),
            Some("PASS".to_string())
        );
        assert!(store.result(3, "smoke").expect("result should load").is_none());
    }

    #[test]
    fn unknown_test_in_adhoc_dispatch_is_fatal() {
        let _guard = run_lock();
        let tmp = tempdir().expect("tempdir should be created");
        let (mut store, cfg) = populated(SMOKE_CONFIG, 1);

        let err = run_single(&mut store, &cfg, tmp.path(), 42, "nosuch", &[1], false)
            .expect_err("dispatch should fail");
        assert!(matches!(err, SchedulerError::UnknownTest(_)));
    }
}
