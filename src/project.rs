//! Project lifecycle: initialization, generator invocation, and
//! population top-up.
//!
//! The mutation generator itself is external (a yosys script assembled
//! from the `[script]` section); this module only writes the script,
//! runs it, and ingests the descriptor and source-tag lists it emits.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::Config;
use crate::engine::{self, EngineError};
use crate::rng;
use crate::store::{Store, StoreError};
use crate::task::{self, TaskError};

/// Project-relative directory holding the database and task scratch dirs.
pub const DATABASE_DIR: &str = "database";

/// Initialization and generator errors.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// `init` refuses to touch an existing database directory.
    #[error("found existing {}, refusing to re-initialize", .0.display())]
    AlreadyInitialized(PathBuf),
    /// Generator invocation failure.
    #[error(transparent)]
    Task(#[from] TaskError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Decision-engine failure while evaluating fresh mutations.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Filesystem failure around the generated artifacts.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database directory under a project directory.
pub fn database_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(DATABASE_DIR)
}

/// Open the store of an already initialized project.
pub fn open(project_dir: &Path) -> Result<Store, StoreError> {
    Store::open(&database_dir(project_dir))
}

/// Initialize a project: create the database, run the generator, ingest
/// its output, and evaluate every mutation once.
///
/// Returns the store and the effective seed. Refuses to run when the
/// database directory already exists.
pub fn init(project_dir: &Path, cfg: &Config) -> Result<(Store, u32), ProjectError> {
    let db_dir = database_dir(project_dir);
    if db_dir.exists() {
        return Err(ProjectError::AlreadyInitialized(db_dir));
    }
    std::fs::create_dir_all(db_dir.join("tasks"))?;

    let seed = match cfg.seed {
        Some(seed) => seed,
        None => rng::derive_time_seed(),
    };

    run_generator(project_dir, cfg, seed)?;

    let mut store = Store::create(&db_dir)?;
    store.set_seed(seed)?;

    for descriptor in read_lines(&db_dir.join("mutations.txt"))? {
        store.insert_mutation(&descriptor)?;
    }
    let srctags = read_lines(&db_dir.join("sources.txt"))?;
    store.replace_sources(&srctags)?;

    engine::reset_all(&mut store, cfg, seed)?;
    Ok((store, seed))
}

/// Bring the population back up to the configured size.
///
/// Re-invokes the generator when the live count is below `size`, inserts
/// only descriptors not already present, evaluates the newcomers, and
/// returns how many were added. The population never shrinks.
pub fn top_up(
    store: &mut Store,
    cfg: &Config,
    project_dir: &Path,
    seed: u32,
) -> Result<usize, ProjectError> {
    if store.mutation_count()? >= u64::from(cfg.size) {
        return Ok(0);
    }

    run_generator(project_dir, cfg, seed)?;

    let db_dir = database_dir(project_dir);
    let mut added = Vec::new();
    for descriptor in read_lines(&db_dir.join("mutations.txt"))? {
        if !store.has_descriptor(&descriptor)? {
            added.push(store.insert_mutation(&descriptor)?);
        }
    }
    let srctags = read_lines(&db_dir.join("sources.txt"))?;
    store.replace_sources(&srctags)?;

    for &mid in &added {
        engine::update_mutation(store, cfg, seed, mid)?;
    }
    Ok(added.len())
}

/// Write `database/design.ys` from the `[script]` section and run it
/// through yosys. The appended `mutate` pass emits the descriptor list
/// and the source-tag list the store ingests.
fn run_generator(project_dir: &Path, cfg: &Config, seed: u32) -> Result<(), ProjectError> {
    let mut script = String::new();
    for line in &cfg.script {
        let _ = writeln!(script, "{line}");
    }
    let _ = writeln!(
        script,
        "mutate -list {} -seed {} -o database/mutations.txt -s database/sources.txt",
        cfg.size, seed
    );
    let _ = writeln!(script, "write_rtlil database/design.il");

    std::fs::write(database_dir(project_dir).join("design.ys"), script)?;
    task::run_shell(
        "yosys -ql database/design.log database/design.ys",
        project_dir,
    )?;
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<String>, ProjectError> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    // Stand-in generator: a `yosys` script on PATH that copies canned
    // descriptor and source lists into place.
    fn install_fake_yosys(dir: &Path, mutations: &str, sources: &str) {
        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).expect("bin dir should be created");
        let script = format!(
            "#!/bin/sh\nprintf '%s' '{mutations}' > database/mutations.txt\n\
             printf '%s' '{sources}' > database/sources.txt\n"
        );
        let path = bin.join("yosys");
        std::fs::write(&path, script).expect("fake yosys should be written");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("fake yosys should be executable");
    }

    // PATH is process-global and tests run in parallel threads.
    static PATH_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_fake_path<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        let _guard = PATH_LOCK.lock().expect("path lock should not be poisoned");
        let old = std::env::var_os("PATH").unwrap_or_default();
        let mut paths: Vec<PathBuf> = vec![dir.join("bin")];
        paths.extend(std::env::split_paths(&old));
        let joined = std::env::join_paths(paths).expect("paths should join");
        unsafe { std::env::set_var("PATH", &joined) };
        let out = f();
        unsafe { std::env::set_var("PATH", &old) };
        out
    }

    fn config(size: u32) -> Config {
        Config::parse(
            &format!(
                r#"
[options]
size {size}
seed 42

[script]
read_verilog top.v

[logic]
r = result("smoke")
if r == "FAIL": tag("broken")

[test smoke]
expect PASS FAIL
"#
            ),
            "config.mcy",
        )
        .expect("config should parse")
    }

    #[test]
    fn init_generates_ingests_and_evaluates() {
        let tmp = tempdir().expect("tempdir should be created");
        install_fake_yosys(
            tmp.path(),
            "1 inv -src top.v:3\n2 const0 -src top.v:5\n",
            "top.v:3\ntop.v:5\n",
        );

        let cfg = config(2);
        let (store, seed) =
            with_fake_path(tmp.path(), || init(tmp.path(), &cfg)).expect("init should work");

        assert_eq!(seed, 42);
        assert_eq!(store.mutation_count().expect("count should work"), 2);
        assert_eq!(store.seed().expect("seed should load"), Some(42));

        // The generator script was assembled from the [script] body.
        let ys = std::fs::read_to_string(tmp.path().join("database/design.ys"))
            .expect("design.ys should exist");
        assert!(ys.starts_with("read_verilog top.v\n"));
        assert!(ys.contains("mutate -list 2 -seed 42"));

        // Every mutation was evaluated: all pending on the first fetch.
        let rows = store.list(None, None).expect("list should work");
        assert!(rows.iter().all(|r| r.queue == vec![("smoke".to_string(), false)]));
    }

    #[test]
    fn init_refuses_existing_database_dir() {
        let tmp = tempdir().expect("tempdir should be created");
        std::fs::create_dir_all(tmp.path().join(DATABASE_DIR))
            .expect("database dir should be created");

        let err = init(tmp.path(), &config(2)).expect_err("init should refuse");
        assert!(matches!(err, ProjectError::AlreadyInitialized(_)));
    }

    #[test]
    fn top_up_inserts_only_new_descriptors() {
        let tmp = tempdir().expect("tempdir should be created");
        install_fake_yosys(
            tmp.path(),
            "1 inv -src top.v:3\n2 const0 -src top.v:5\n",
            "top.v:3\ntop.v:5\n",
        );

        let (mut store, seed) = with_fake_path(tmp.path(), || init(tmp.path(), &config(2)))
            .expect("init should work");
        assert_eq!(store.mutation_count().expect("count should work"), 2);

        // Size raised: the regenerated list overlaps the existing
        // population and only the new descriptor may land.
        install_fake_yosys(
            tmp.path(),
            "1 inv -src top.v:3\n2 const0 -src top.v:5\n3 const1 -src top.v:7\n",
            "top.v:3\ntop.v:5\ntop.v:7\n",
        );
        let cfg = config(3);
        let added = with_fake_path(tmp.path(), || top_up(&mut store, &cfg, tmp.path(), seed))
            .expect("top-up should work");
        assert_eq!(added, 1);
        assert_eq!(store.mutation_count().expect("count should work"), 3);

        // The newcomer was evaluated and queued.
        let rows = store.list(Some(&[3]), None).expect("list should work");
        assert_eq!(rows[0].queue, vec![("smoke".to_string(), false)]);
    }

    #[test]
    fn top_up_is_a_no_op_at_target_size() {
        let tmp = tempdir().expect("tempdir should be created");
        let cfg = config(1);
        let mut store = Store::in_memory();
        store
            .insert_mutation("1 inv -src top.v:3")
            .expect("mutation should insert");

        // No generator on PATH; must not be invoked.
        let added = top_up(&mut store, &cfg, tmp.path(), 42).expect("top-up should work");
        assert_eq!(added, 0);
    }
}
