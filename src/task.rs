//! Process supervision.
//!
//! One OS process per dispatched task. The controller never blocks on a
//! single child: the pool is polled on a fixed interval and a bounded
//! capacity limits how many tasks are in flight. A nonzero exit code is
//! always fatal to the whole run; the diagnostic carries the command line
//! and, when output was redirected, the log artifact path.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Pause between completion polls of the in-flight set.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a terminated child gets to honor the stop request before it
/// is forcibly killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Supervision errors.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Child process could not be launched.
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        /// Shell command line.
        command: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Child exited with a nonzero code; the run aborts.
    #[error("command `{command}` exited with {status}; see {log}")]
    ProcessFailed {
        /// Shell command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Log artifact path, or "console output" when not redirected.
        log: String,
    },
    /// Poll or wait failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One supervised task: a test batch backed by a shell child process.
pub struct Task {
    /// Task identity (also the scratch directory name).
    pub id: String,
    /// Test identity this batch runs.
    pub test: String,
    /// Batch member mutation identities, dispatch order.
    pub batch: Vec<i64>,
    /// Scratch directory holding input/output artifacts and the log.
    pub dir: PathBuf,
    /// Shell command line, for diagnostics.
    pub command: String,
    child: Option<Child>,
}

impl Task {
    /// Launch a task under `sh -c`, with stdout/stderr redirected into
    /// `logfile.txt` inside the scratch directory.
    pub fn spawn(
        id: String,
        test: String,
        batch: Vec<i64>,
        dir: PathBuf,
        command: String,
        envs: &[(String, String)],
    ) -> Result<Self, TaskError> {
        let log = std::fs::File::create(dir.join("logfile.txt")).map_err(TaskError::Io)?;
        let log_err = log.try_clone().map_err(TaskError::Io)?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&dir)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| TaskError::Spawn {
                command: command.clone(),
                source,
            })?;

        Ok(Self {
            id,
            test,
            batch,
            dir,
            command,
            child: Some(child),
        })
    }

    /// Log artifact path inside the scratch directory.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join("logfile.txt")
    }

    /// Non-blocking completion check.
    pub fn poll(&mut self) -> Result<Option<ExitStatus>, TaskError> {
        match &mut self.child {
            Some(child) => {
                let status = child.try_wait()?;
                if status.is_some() {
                    self.child = None;
                }
                Ok(status)
            }
            None => Ok(None),
        }
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus, TaskError> {
        match self.child.take() {
            Some(mut child) => Ok(child.wait()?),
            None => Err(TaskError::Io(io::Error::other("task already reaped"))),
        }
    }

    /// Stop and reap the child, if still alive: request a graceful stop
    /// first, then force-kill once [`TERMINATE_GRACE`] runs out. Idempotent.
    pub fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let stopped = request_stop(&child).is_ok() && reap_within(&mut child, TERMINATE_GRACE);
        if !stopped {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Fatal diagnostic for a nonzero exit.
    pub(crate) fn failure(&self, status: ExitStatus) -> TaskError {
        TaskError::ProcessFailed {
            command: self.command.clone(),
            status: status.to_string(),
            log: self.log_path().display().to_string(),
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Bounded set of in-flight tasks, owned by the scheduler for the
/// duration of one run.
pub struct TaskPool {
    capacity: usize,
    tasks: Vec<Task>,
}

impl TaskPool {
    /// Pool with room for `capacity` concurrent tasks (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tasks: Vec::new(),
        }
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// True when another task may be dispatched.
    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.capacity
    }

    /// Take ownership of a freshly spawned task.
    pub fn dispatch(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Poll every in-flight task once and remove the finished ones.
    ///
    /// Exit statuses are returned alongside the tasks; judging them
    /// (nonzero exit is fatal) is the caller's job, since the caller
    /// also owns the rollback of each task's claim.
    pub fn reap(&mut self) -> Result<Vec<(Task, ExitStatus)>, TaskError> {
        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.tasks.len() {
            match self.tasks[i].poll()? {
                Some(status) => finished.push((self.tasks.remove(i), status)),
                None => i += 1,
            }
        }
        Ok(finished)
    }

    /// Kill every in-flight task and return them for rollback/cleanup.
    pub fn terminate_all(&mut self) -> Vec<Task> {
        for task in &mut self.tasks {
            task.terminate();
        }
        std::mem::take(&mut self.tasks)
    }
}

/// Ask the child to stop. SIGTERM lets runner scripts clean up their own
/// scratch state before exiting.
#[cfg(unix)]
fn request_stop(child: &Child) -> io::Result<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other("stop request was not delivered"))
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) -> io::Result<()> {
    Err(io::Error::other("no graceful stop on this platform"))
}

/// Poll for the child's exit until `grace` runs out; true when reaped.
fn reap_within(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            _ => return false,
        }
    }
}

/// Run one shell command to completion in `cwd`; nonzero exit is fatal.
/// Used for the mutation generator, whose output goes to the console.
pub fn run_shell(command: &str, cwd: &Path) -> Result<(), TaskError> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .status()
        .map_err(|source| TaskError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(TaskError::ProcessFailed {
            command: command.to_string(),
            status: status.to_string(),
            log: "console output".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spawn_in(dir: &Path, command: &str) -> Task {
        Task::spawn(
            "t1".to_string(),
            "smoke".to_string(),
            vec![1, 2],
            dir.to_path_buf(),
            command.to_string(),
            &[("MUTCOV_TASK".to_string(), "t1".to_string())],
        )
        .expect("task should spawn")
    }

    #[test]
    fn poll_reports_completion_once() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut task = spawn_in(tmp.path(), "exit 0");

        let status = loop {
            if let Some(status) = task.poll().expect("poll should work") {
                break status;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert!(status.success());
        assert!(task.poll().expect("poll should work").is_none());
    }

    #[test]
    fn env_and_log_redirection_reach_the_child() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut task = spawn_in(tmp.path(), "echo \"task=$MUTCOV_TASK\"; echo oops >&2");
        let status = task.wait().expect("wait should work");
        assert!(status.success());

        let log = std::fs::read_to_string(task.log_path()).expect("log should exist");
        assert!(log.contains("task=t1"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn pool_reap_returns_each_task_with_its_exit_status() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut pool = TaskPool::new(4);
        pool.dispatch(spawn_in(tmp.path(), "exit 0"));
        pool.dispatch(spawn_in(tmp.path(), "exit 3"));

        let mut finished = Vec::new();
        while finished.len() < 2 {
            finished.extend(pool.reap().expect("reap should work"));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(pool.is_empty());

        let failed = finished
            .iter()
            .find(|(_, status)| !status.success())
            .expect("one task should have failed");
        assert_eq!(failed.1.code(), Some(3));
        match failed.0.failure(failed.1) {
            TaskError::ProcessFailed { command, log, .. } => {
                assert_eq!(command, "exit 3");
                assert!(log.contains("logfile.txt"));
            }
            other => panic!("expected process failure, got {other}"),
        }
    }

    #[test]
    fn pool_capacity_is_enforced_by_has_capacity() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut pool = TaskPool::new(1);
        assert!(pool.has_capacity());
        pool.dispatch(spawn_in(tmp.path(), "sleep 5"));
        assert!(!pool.has_capacity());

        let stranded = pool.terminate_all();
        assert_eq!(stranded.len(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn terminate_kills_a_long_running_child() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut task = spawn_in(tmp.path(), "sleep 60");
        task.terminate();
        // Idempotent.
        task.terminate();
    }

    #[test]
    fn terminate_requests_a_graceful_stop_first() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut task = spawn_in(
            tmp.path(),
            "trap 'touch stopped-cleanly; exit 0' TERM; sleep 60 & wait",
        );
        // Let the shell install its trap before stopping it.
        std::thread::sleep(Duration::from_millis(200));
        task.terminate();
        assert!(tmp.path().join("stopped-cleanly").exists());
    }

    #[test]
    fn terminate_force_kills_a_child_that_ignores_the_stop_request() {
        let tmp = tempdir().expect("tempdir should be created");
        let mut task = spawn_in(tmp.path(), "trap '' TERM; sleep 60 & wait");
        std::thread::sleep(Duration::from_millis(200));
        task.terminate();
        // Reaped despite the ignored signal; nothing left to poll.
        assert!(task.poll().expect("poll should work").is_none());
    }

    #[test]
    fn run_shell_surfaces_nonzero_exit() {
        let tmp = tempdir().expect("tempdir should be created");
        run_shell("true", tmp.path()).expect("true should succeed");
        let err = run_shell("exit 7", tmp.path()).expect_err("exit 7 should fail");
        assert!(matches!(err, TaskError::ProcessFailed { .. }));
    }
}
