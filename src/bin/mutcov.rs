use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use mutcov::config::Config;
use mutcov::scheduler::RunOptions;
use mutcov::store::Store;
use mutcov::{engine, project, report, rng, scheduler};

#[derive(Debug, Parser)]
#[command(name = "mutcov")]
#[command(about = "Mutation coverage orchestration")]
struct Cli {
    /// Project directory (holds config.mcy and database/).
    #[arg(long, default_value = ".")]
    project: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database, generate mutations, and evaluate them all.
    Init,
    /// Recompute queue and tags for every mutation from cached results.
    Reset,
    /// Show cached results, tags, and queue depth.
    Status {
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// List mutations with their tags and queue entries.
    List {
        /// Show descriptors and cached results too.
        #[arg(long)]
        details: bool,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
        /// Only mutations carrying this tag.
        #[arg(long)]
        tag: Option<String>,
        /// Restrict to these mutation ids.
        ids: Vec<i64>,
    },
    /// Run queued tests until the queue is empty.
    Run {
        /// Concurrent task limit.
        #[arg(short = 'j', long = "jobs", default_value_t = 1)]
        jobs: usize,
        /// Recompute queue and tags before scheduling.
        #[arg(long)]
        reset: bool,
        /// Keep task scratch directories after collection.
        #[arg(long)]
        keep: bool,
        /// Restrict scheduling to these mutation ids.
        ids: Vec<i64>,
    },
    /// Run one test against explicit mutations, bypassing the queue.
    Task {
        /// Keep the task scratch directory after collection.
        #[arg(long)]
        keep: bool,
        /// Test identity (base name plus arguments).
        test: String,
        /// Mutation ids to dispatch.
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Per-source coverage projection.
    Source {
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
}

fn load_config(project_dir: &std::path::Path) -> Result<Config> {
    Ok(Config::load(&project_dir.join("config.mcy"))?)
}

/// Seed every command replays: persisted at init, falling back to the
/// configured or time-derived seed for databases predating the record.
fn effective_seed(store: &Store, cfg: &Config) -> Result<u32> {
    if let Some(seed) = store.seed()? {
        return Ok(seed);
    }
    let seed = cfg.seed.unwrap_or_else(rng::derive_time_seed);
    store.set_seed(seed)?;
    Ok(seed)
}

fn print_summary(store: &Store, cfg: &Config) -> Result<()> {
    print!("{}", report::render_status(store)?);
    let rendered = report::render_report(store, cfg)?;
    if !rendered.is_empty() {
        println!("{rendered}");
    }
    Ok(())
}

fn subset(ids: Vec<i64>) -> Option<Vec<i64>> {
    if ids.is_empty() { None } else { Some(ids) }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = cli.project;

    match cli.command {
        Command::Init => {
            let cfg = load_config(&project_dir)?;
            let (store, seed) = project::init(&project_dir, &cfg)?;
            println!("mutcov: initialized with seed {seed}");
            print_summary(&store, &cfg)?;
        }
        Command::Reset => {
            let cfg = load_config(&project_dir)?;
            let mut store = project::open(&project_dir)?;
            let seed = effective_seed(&store, &cfg)?;
            engine::reset_all(&mut store, &cfg, seed)?;
            print_summary(&store, &cfg)?;
        }
        Command::Status { json } => {
            let cfg = load_config(&project_dir)?;
            let store = project::open(&project_dir)?;
            if json {
                let results: Vec<_> = store
                    .result_counts()?
                    .into_iter()
                    .map(|(test, result, count)| {
                        serde_json::json!({ "test": test, "result": result, "count": count })
                    })
                    .collect();
                let tags: Vec<_> = store
                    .tag_counts()?
                    .into_iter()
                    .map(|(tag, count)| serde_json::json!({ "tag": tag, "count": count }))
                    .collect();
                let queue: Vec<_> = store
                    .queue_counts()?
                    .into_iter()
                    .map(|(test, total, running)| {
                        serde_json::json!({ "test": test, "total": total, "running": running })
                    })
                    .collect();
                let output = serde_json::json!({
                    "results": results,
                    "tags": tags,
                    "queue": queue,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_summary(&store, &cfg)?;
            }
        }
        Command::List {
            details,
            json,
            tag,
            ids,
        } => {
            let store = project::open(&project_dir)?;
            let rows = store.list(subset(ids).as_deref(), tag.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    let mut line = format!("{}:", row.id);
                    for tag in &row.tags {
                        line.push_str(&format!(" {tag}"));
                    }
                    for (test, running) in &row.queue {
                        if *running {
                            line.push_str(&format!(" [{test}]"));
                        } else {
                            line.push_str(&format!(" ({test})"));
                        }
                    }
                    println!("{line}");
                    if details {
                        println!("  {}", row.descriptor);
                        for (test, result) in &row.results {
                            println!("  result from \"{test}\": {result}");
                        }
                    }
                }
            }
        }
        Command::Run {
            jobs,
            reset,
            keep,
            ids,
        } => {
            let cfg = load_config(&project_dir)?;
            let mut store = project::open(&project_dir)?;
            let seed = effective_seed(&store, &cfg)?;
            if reset {
                engine::reset_all(&mut store, &cfg, seed)?;
            }
            let added = project::top_up(&mut store, &cfg, &project_dir, seed)?;
            if added > 0 {
                println!("mutcov: generated {added} new mutations");
            }
            let opts = RunOptions {
                jobs,
                keep,
                subset: subset(ids),
            };
            scheduler::run(&mut store, &cfg, &project_dir, seed, &opts)?;
            print_summary(&store, &cfg)?;
        }
        Command::Task { keep, test, ids } => {
            let cfg = load_config(&project_dir)?;
            let mut store = project::open(&project_dir)?;
            let seed = effective_seed(&store, &cfg)?;
            scheduler::run_single(&mut store, &cfg, &project_dir, seed, &test, &ids, keep)?;
            print_summary(&store, &cfg)?;
        }
        Command::Source { json } => {
            let store = project::open(&project_dir)?;
            let coverage = store.source_coverage()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&coverage)?);
            } else {
                for row in coverage {
                    let mut line = format!("{}: {} mutations", row.src, row.mutations);
                    for (tag, count) in &row.tags {
                        line.push_str(&format!(", {count} {tag}"));
                    }
                    println!("{line}");
                }
            }
        }
    }

    Ok(())
}
