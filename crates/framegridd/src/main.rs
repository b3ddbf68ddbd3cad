//! framegridd: the framegrid render scheduler daemon.
//!
//! Single binary that assembles all framegrid subsystems:
//! - State store (redb)
//! - Scheduler (queue, placement, retries, cost)
//! - Simulated render nodes and their heartbeats
//! - Metrics collector
//! - Autoscaler
//!
//! # Usage
//!
//! ```text
//! framegridd init --output framegrid.toml
//! framegridd run --config framegrid.toml --data-dir /var/lib/framegrid
//! framegridd run --log-format json --config framegrid.toml
//! framegridd status --data-dir /var/lib/framegrid
//! ```

mod simulator;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use framegrid_autoscale::Autoscaler;
use framegrid_core::FleetConfig;
use framegrid_cost::CostRates;
use framegrid_metrics::{InMemoryMetricsSource, MetricsCollector};
use framegrid_scheduler::{Decomposer, JobRequest, Scheduler, SchedulerConfig, SchedulerEvent};
use framegrid_state::{FrameRange, StateStore, TaskPriority, TaskType, epoch_millis};

use simulator::SimulatedExecutor;

const DB_FILE: &str = "framegrid.redb";

#[derive(Parser)]
#[command(name = "framegridd", about = "framegrid render scheduler daemon", version)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler with simulated render nodes.
    Run {
        /// Fleet configuration file.
        #[arg(long, default_value = "framegrid.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/framegrid")]
        data_dir: PathBuf,

        /// Metrics sampling interval in seconds.
        #[arg(long, default_value = "30")]
        metrics_interval: u64,

        /// Wall-clock seconds per simulated render second.
        #[arg(long, default_value = "0.01")]
        time_scale: f64,

        /// Submit a demo video job at startup.
        #[arg(long)]
        demo: bool,
    },
    /// Parse a fleet configuration and print a summary.
    Validate {
        #[arg(long, default_value = "framegrid.toml")]
        config: PathBuf,
    },
    /// Write a scaffold fleet configuration.
    Init {
        #[arg(short, long, default_value = "framegrid.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the persisted fleet state.
    Status {
        #[arg(long, default_value = "/var/lib/framegrid")]
        data_dir: PathBuf,

        /// Output format: prometheus or json.
        #[arg(short, long, default_value = "prometheus")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            metrics_interval,
            time_scale,
            demo,
        } => run(&config, &data_dir, metrics_interval, time_scale, demo).await,
        Command::Validate { config } => validate(&config),
        Command::Init { output, force } => init(&output, force),
        Command::Status { data_dir, format } => status(&data_dir, &format),
    }
}

fn scheduler_config(config: &FleetConfig) -> anyhow::Result<SchedulerConfig> {
    let settings = config.scheduler_settings()?;
    let defaults = CostRates::default();
    let cost = config.cost.clone().unwrap_or_default();

    Ok(SchedulerConfig {
        tick_interval: settings.tick_interval,
        missed_heartbeats: settings.missed_heartbeats,
        decomposer: Decomposer {
            chunk_frames: settings.chunk_frames,
            ms_per_frame: settings.ms_per_frame,
            default_max_retries: settings.default_max_retries,
        },
        cost_rates: CostRates {
            compute_per_hour: cost.compute_per_hour.unwrap_or(defaults.compute_per_hour),
            storage_per_gb: cost.storage_per_gb.unwrap_or(defaults.storage_per_gb),
            bandwidth_per_gb: cost.bandwidth_per_gb.unwrap_or(defaults.bandwidth_per_gb),
            urgent_premium_multiplier: cost
                .urgent_premium_multiplier
                .unwrap_or(defaults.urgent_premium_multiplier),
        },
        ..SchedulerConfig::default()
    })
}

async fn run(
    config_path: &Path,
    data_dir: &Path,
    metrics_interval: u64,
    time_scale: f64,
    demo: bool,
) -> anyhow::Result<()> {
    info!("framegrid daemon starting");

    let config = FleetConfig::from_file(config_path)?;
    config.validate()?;
    let scheduler_config = scheduler_config(&config)?;
    let tick_interval = scheduler_config.tick_interval;
    let autoscale_interval = config.autoscale_interval()?;

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(DB_FILE);

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (executor, reports) = SimulatedExecutor::new(time_scale);
    let scheduler = Arc::new(Scheduler::new(scheduler_config, state.clone(), Arc::new(executor)));
    let events = scheduler.subscribe();
    scheduler.initialize().await?;

    for cluster in config.build_clusters(epoch_millis())? {
        if scheduler.get_cluster(&cluster.id).await.is_none() {
            info!(cluster_id = %cluster.id, nodes = cluster.nodes.len(), "registering configured cluster");
            scheduler.add_cluster(cluster).await?;
        }
    }

    let source = Arc::new(InMemoryMetricsSource::new());
    let usage_scheduler = scheduler.clone();
    let metrics = MetricsCollector::new(
        source.clone(),
        state.clone(),
        Duration::from_secs(metrics_interval),
    )
    .with_usage_fn(Box::new(move |node_id, usage| {
        let scheduler = usage_scheduler.clone();
        Box::pin(async move {
            scheduler
                .record_node_usage(&node_id, usage)
                .await
                .map_err(anyhow::Error::from)
        })
    }));
    info!(interval = metrics_interval, "metrics collector initialized");

    let mut autoscaler = Autoscaler::new(state.clone()).with_scale_fn(Box::new(|intent| {
        Box::pin(async move {
            info!(
                cluster_id = %intent.cluster_id,
                direction = ?intent.direction,
                desired_nodes = intent.desired_nodes,
                "scale intent handed to fleet manager"
            );
            Ok(())
        })
    }));
    info!(interval_secs = autoscale_interval.as_secs(), "autoscaler initialized");

    if demo {
        let job = scheduler
            .submit_job(
                JobRequest::new("demo", "demo-deck", TaskType::VideoRender, FrameRange { start: 0, end: 899 })
                    .with_priority(TaskPriority::High),
            )
            .await?;
        info!(job_id = %job.id, tasks = job.task_ids.len(), "demo job submitted");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let heartbeat_interval = config
        .build_clusters(0)?
        .iter()
        .map(|c| Duration::from_secs(c.load_balancer.health_check_interval_secs))
        .min()
        .unwrap_or(Duration::from_secs(10))
        .max(Duration::from_secs(1));

    let handles = vec![
        tokio::spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown_rx.clone();
            async move { scheduler.run(tick_interval, shutdown).await }
        }),
        tokio::spawn(simulator::forward_reports(
            scheduler.clone(),
            reports,
            shutdown_rx.clone(),
        )),
        tokio::spawn(simulator::run_node_agents(
            scheduler.clone(),
            source,
            heartbeat_interval,
            shutdown_rx.clone(),
        )),
        tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { metrics.run(shutdown).await }
        }),
        tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { autoscaler.run(autoscale_interval, shutdown).await }
        }),
        tokio::spawn(log_events(events, shutdown_rx)),
    ];

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("framegrid daemon stopped");
    Ok(())
}

/// Log scheduler events until shutdown.
async fn log_events(mut events: broadcast::Receiver<SchedulerEvent>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

fn log_event(event: &SchedulerEvent) {
    let kind = event.kind();
    match event {
        SchedulerEvent::JobSubmitted(job)
        | SchedulerEvent::JobCompleted(job)
        | SchedulerEvent::JobFailed(job)
        | SchedulerEvent::JobCancelled(job) => {
            info!(event = kind, job_id = %job.id, status = job.status.as_str(), cost = job.cost.actual, "job event");
        }
        SchedulerEvent::TaskFailed(task) | SchedulerEvent::TaskRetried(task) => {
            warn!(event = kind, task_id = %task.id, error = task.error.as_deref().unwrap_or(""), "task event");
        }
        SchedulerEvent::TaskSubmitted(task)
        | SchedulerEvent::TaskAssigned(task)
        | SchedulerEvent::TaskCompleted(task)
        | SchedulerEvent::TaskCancelled(task) => {
            debug!(event = kind, task_id = %task.id, node_id = task.assigned_node.as_deref().unwrap_or("-"), "task event");
        }
        SchedulerEvent::NodeFailedOver { cluster_id, node } => {
            warn!(event = kind, %cluster_id, node_id = %node.id, "node failed over");
        }
        SchedulerEvent::InitializationError(error) => {
            warn!(event = kind, %error, "initialization error");
        }
        _ => info!(event = kind, "fleet event"),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)?;
    config.validate()?;
    let settings = config.scheduler_settings()?;
    let clusters = config.build_clusters(0)?;

    println!("{} is valid", path.display());
    println!(
        "  scheduler: tick {:?}, {} missed heartbeats, {} retries, {} frames per chunk",
        settings.tick_interval, settings.missed_heartbeats, settings.default_max_retries, settings.chunk_frames
    );
    for cluster in &clusters {
        let slots: u32 = cluster.nodes.iter().map(|n| n.max_load).sum();
        println!(
            "  cluster {} ({}): {} nodes, {} task slots, {:?}",
            cluster.id,
            cluster.region,
            cluster.nodes.len(),
            slots,
            cluster.load_balancer.algorithm
        );
    }
    Ok(())
}

fn init(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    std::fs::write(output, FleetConfig::scaffold().to_toml_string()?)?;
    println!("wrote {}", output.display());
    Ok(())
}

fn status(data_dir: &Path, format: &str) -> anyhow::Result<()> {
    let state = StateStore::open(&data_dir.join(DB_FILE))?;
    let clusters = state.list_clusters()?;
    let jobs = state.list_jobs()?;
    let tasks = state.list_tasks()?;

    match format {
        "prometheus" => print!("{}", framegrid_metrics::render_prometheus(&clusters, &jobs, &tasks)),
        "json" => {
            let summary = serde_json::json!({
                "clusters": clusters,
                "jobs": jobs,
                "tasks": tasks.len(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        other => anyhow::bail!("unknown format `{other}` (expected prometheus or json)"),
    }
    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,framegridd=debug,framegrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().with_current_span(false).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_applies_defaults() {
        let config = scheduler_config(&FleetConfig::default()).unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.decomposer.chunk_frames, 300);
        assert_eq!(config.cost_rates.compute_per_hour, 2.5);
    }

    #[test]
    fn scaffold_round_trips_through_init_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framegrid.toml");

        init(&path, false).unwrap();
        assert!(init(&path, false).is_err());
        init(&path, true).unwrap();
        validate(&path).unwrap();

        let config = FleetConfig::from_file(&path).unwrap();
        let settings = scheduler_config(&config).unwrap();
        assert_eq!(settings.cost_rates.urgent_premium_multiplier, 1.5);
    }

    #[test]
    fn log_format_is_a_global_flag() {
        let cli = Cli::try_parse_from(["framegridd", "status", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);

        let cli = Cli::try_parse_from(["framegridd", "validate"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);

        assert!(Cli::try_parse_from(["framegridd", "--log-format", "xml", "validate"]).is_err());
    }

    #[test]
    fn status_rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        assert!(status(dir.path(), "yaml").is_err());
        status(dir.path(), "prometheus").unwrap();
    }
}
