use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use game_harvest::catalog::{self, JobSpec};
use game_harvest::config::{job_config, resolve_worker, session_key, HarvestPaths, RunOptions};
use game_harvest::extract::HttpJsonExtractor;
use game_harvest::logging::{init_tracing, LogStyle};
use game_harvest::remote::{RemoteConfig, RemoteSync};
use game_harvest::session::{LoopExit, SessionRunner, SessionStore, StopSignal};
use game_harvest::util::env;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "harvest", version, about = "Resumable extraction jobs for the game data pipeline")]
struct Cli {
    /// Log target, file and line on every event
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run (or resume) a job over its partition
    Run {
        job: String,
        /// Worker identifier in [1, workers]; falls back to HARVEST_WORKER_ID
        #[arg(long)]
        worker: Option<u32>,
        /// Number of workers sharing the work list (default HARVEST_WORKERS or 6)
        #[arg(long)]
        workers: Option<u32>,
        /// Ignore the stored session and plan a new range
        #[arg(long, default_value_t = false)]
        restart: bool,
        /// Erase the existing dataset (and its remote mirror) before extracting
        #[arg(long, default_value_t = false)]
        overwrite: bool,
        /// First index of a manual range (starts a new session)
        #[arg(long, requires = "end")]
        start: Option<i64>,
        /// Last index of a manual range
        #[arg(long, requires = "start")]
        end: Option<i64>,
        /// Mirror sources, dataset and error log through the configured remote
        #[arg(long, default_value_t = false)]
        remote: bool,
        /// URL with an `{id}` (or `{refs}`) placeholder; required for jobs without a default
        #[arg(long)]
        url_template: Option<String>,
        /// Fixed delay between items, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Extra random delay on top of --delay-ms, in milliseconds
        #[arg(long)]
        jitter_ms: Option<u64>,
    },
    /// Show stored sessions and whether they are pending or exhausted
    Status { job: Option<String> },
    /// Forget a job's stored session
    Reset {
        job: String,
        #[arg(long)]
        worker: Option<u32>,
    },
    /// Merge a staging file left by an interrupted run, without extracting
    Finalize {
        job: String,
        #[arg(long)]
        worker: Option<u32>,
        #[arg(long)]
        workers: Option<u32>,
        #[arg(long, default_value_t = false)]
        remote: bool,
    },
    /// List the built-in jobs and their prerequisites
    Jobs {
        #[arg(long, default_value_t = false)]
        remote: bool,
    },
}

fn job_spec(name: &str) -> Result<&'static JobSpec> {
    catalog::find(name).ok_or_else(|| {
        anyhow!(
            "unknown job {name:?}; known jobs: {}",
            catalog::names().join(", ")
        )
    })
}

/// `--remote`, or `HARVEST_REMOTE=1` in the environment.
fn remote_enabled(flag: bool) -> bool {
    flag || env::env_flag("HARVEST_REMOTE", false)
}

fn remote_backend(enabled: bool) -> Result<Option<Box<dyn RemoteSync>>> {
    if !enabled {
        return Ok(None);
    }
    let cfg = RemoteConfig::from_env()
        .ok_or_else(|| anyhow!("--remote needs HARVEST_REMOTE_DIR or HARVEST_REMOTE_URL"))?;
    let backend = cfg.build()?;
    info!(target: "remote", location = %backend.describe(), "remote mode enabled");
    Ok(Some(backend))
}

fn build_extractor(spec: &JobSpec, template: Option<String>) -> Result<HttpJsonExtractor> {
    let template = template
        .or_else(|| spec.url_template.map(str::to_string))
        .ok_or_else(|| anyhow!("job {} has no default source URL; pass --url-template", spec.name))?;
    let mut extractor = HttpJsonExtractor::new(template)?
        .with_field(spec.field)
        .with_bearer(env::env_opt("HARVEST_EXTRACT_TOKEN"));
    if let Some(field) = spec.refs_field {
        extractor = extractor.with_refs(field);
    }
    if let Some((param, key)) = spec.query_secret {
        extractor = extractor.with_query(param, env::env_req(key)?);
    }
    Ok(extractor)
}

fn runner_for(
    spec: &JobSpec,
    paths: &HarvestPaths,
    opts: &RunOptions,
    remote: Option<Box<dyn RemoteSync>>,
) -> Result<SessionRunner> {
    let config = job_config(spec, paths, opts)?;
    let mut runner = SessionRunner::new(config);
    if let Some(remote) = remote {
        runner = runner.with_remote(remote);
    }
    Ok(runner)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env::init_env();
    let style = if cli.verbose {
        LogStyle::Verbose
    } else {
        LogStyle::Compact
    };
    init_tracing("info", style)?;
    env::bootstrap_cli("harvest");
    let paths = HarvestPaths::from_env();

    match cli.command {
        Commands::Run {
            job,
            worker,
            workers,
            restart,
            overwrite,
            start,
            end,
            remote,
            url_template,
            delay_ms,
            jitter_ms,
        } => {
            let spec = job_spec(&job)?;
            env::preflight_check(
                spec.name,
                spec.required_env,
                &[
                    "HARVEST_DATA_DIR",
                    "HARVEST_WORKER_ID",
                    "HARVEST_WORKERS",
                    "HARVEST_REMOTE_URL",
                    "HARVEST_REMOTE_DIR",
                    "HARVEST_REMOTE_TOKEN",
                ],
            )?;
            let opts = RunOptions {
                worker,
                workers,
                restart,
                overwrite,
                range: start.zip(end),
                remote: remote_enabled(remote),
                delay_ms,
                jitter_ms,
            };
            let backend = remote_backend(opts.remote)?;
            let missing: Vec<String> = spec
                .check_dependencies(&paths, backend.as_deref())
                .await
                .into_iter()
                .filter(|d| !d.ok)
                .map(|d| d.label)
                .collect();
            if !missing.is_empty() {
                bail!("job {} is missing prerequisites: {}", spec.name, missing.join(", "));
            }
            let runner = runner_for(spec, &paths, &opts, backend)?;

            let extractor = build_extractor(spec, url_template)?;
            let stop = StopSignal::new();
            stop.install_ctrl_c();

            let summary = runner
                .run(&extractor, stop)
                .await
                .with_context(|| format!("job {}", runner.config().job_name))?;
            if summary.exit == Some(LoopExit::Cancelled) {
                warn!(job = %summary.job, "run cancelled; progress saved");
            }
            println!(
                "{}: {} ({} attempted, {} new records, {} failed)",
                summary.job, summary.status, summary.attempted, summary.merge.added, summary.failed
            );
        }
        Commands::Status { job } => {
            let store = SessionStore::new(paths.session_file());
            let entries = store.entries()?;
            let mut shown = 0usize;
            for (name, state) in &entries {
                if let Some(filter) = &job {
                    if name != filter && !name.starts_with(&format!("{filter}-w")) {
                        continue;
                    }
                }
                shown += 1;
                println!(
                    "{name:<24} {state}  pending {:>6}  {}",
                    state.pending(),
                    state.phase()
                );
            }
            if shown == 0 {
                println!("no stored sessions");
            }
        }
        Commands::Reset { job, worker } => {
            let spec = job_spec(&job)?;
            let (worker, _) = resolve_worker(&RunOptions {
                worker,
                ..RunOptions::default()
            })?;
            let key = session_key(spec.name, worker);
            let store = SessionStore::new(paths.session_file());
            if store.remove(&key)? {
                info!(job = %key, "session removed");
            } else {
                println!("{key}: no stored session");
            }
        }
        Commands::Finalize {
            job,
            worker,
            workers,
            remote,
        } => {
            let spec = job_spec(&job)?;
            let opts = RunOptions {
                worker,
                workers,
                remote: remote_enabled(remote),
                ..RunOptions::default()
            };
            let runner = runner_for(spec, &paths, &opts, remote_backend(opts.remote)?)?;
            match runner.finalize_only().await? {
                Some(summary) => println!(
                    "{}: merged {} records, {} ({})",
                    summary.job, summary.merge.added, summary.status, summary.state
                ),
                None => println!("{}: nothing to finalize", runner.config().job_name),
            }
        }
        Commands::Jobs { remote } => {
            let backend = remote_backend(remote_enabled(remote))?;
            for spec in catalog::CATALOG {
                println!("{:<16} {} -> {}", spec.name, spec.about, spec.dataset);
                for dep in spec.check_dependencies(&paths, backend.as_deref()).await {
                    let mark = if dep.ok { "ok" } else { "missing" };
                    println!("    {:<48} {mark}", dep.label);
                }
            }
        }
    }
    Ok(())
}
