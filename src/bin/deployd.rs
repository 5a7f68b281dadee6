//! deployd: deployment scheduling daemon and queue operator tool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};

use deployd_rs::bounce::CommandExecutor;
use deployd_rs::catalog::{ServiceCatalog, SoaDir};
use deployd_rs::cluster::ClusterStateFile;
use deployd_rs::config::Config;
use deployd_rs::config::secrets::expose_database_url;
use deployd_rs::coord::Coordinator;
use deployd_rs::coord::memory::MemoryEnsemble;
use deployd_rs::coord::postgres::{PgCoordinator, PgCoordinatorOptions};
use deployd_rs::engine::{DaemonDeps, DeployDaemon, build_queue};
use deployd_rs::leader::{ControlMessage, LeaderElection};
use deployd_rs::model::ServiceInstance;
use deployd_rs::queue::{CoordinatedQueue, DelayDeadlineQueue, QueuedInstance};
use deployd_rs::telemetry::{TelemetryConfig, init_telemetry};
use deployd_rs::watchers::WatcherDeps;

#[derive(Parser)]
#[command(name = "deployd", about = "Schedules service instance bounces")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (contends for leadership first)
    Serve,
    /// Distributed queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show available and waiting entries
    List,
    /// Enqueue a bounce by hand
    Put {
        service: String,
        instance: String,
        /// Hold the bounce back for this many seconds
        #[arg(long, default_value_t = 0)]
        delay_secs: u64,
    },
}

/// The coordination client plus the handle needed to close it cleanly.
struct Coordination {
    client: Arc<dyn Coordinator>,
    postgres: Option<Arc<PgCoordinator>>,
}

impl Coordination {
    fn connect(config: &Config, handle: &Handle) -> anyhow::Result<Self> {
        match &config.database_url {
            Some(url) => {
                let pg = PgCoordinator::connect(
                    handle.clone(),
                    expose_database_url(url),
                    PgCoordinatorOptions::default(),
                )
                .context("connecting to postgres coordination backend")?;
                Ok(Self {
                    client: pg.clone(),
                    postgres: Some(pg),
                })
            }
            None => {
                warn!("DATABASE_URL not set; coordination is local to this process");
                Ok(Self {
                    client: MemoryEnsemble::new()?.connect(),
                    postgres: None,
                })
            }
        }
    }

    fn close(self) {
        if let Some(pg) = self.postgres {
            if let Err(e) = pg.close() {
                warn!(error = %e, "failed to close coordination session");
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("deployd-io")
        .build()?;
    // OTLP exporters need a runtime context while they are built.
    let _enter = runtime.enter();
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "deployd".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let coordination = Coordination::connect(&config, runtime.handle())?;
    let result = match cli.command {
        Command::Serve => cmd_serve(&config, &coordination, &runtime),
        Command::Queue { action } => cmd_queue(&config, &coordination, action),
    };
    coordination.close();
    result
}

fn cmd_serve(
    config: &Config,
    coordination: &Coordination,
    runtime: &Runtime,
) -> anyhow::Result<()> {
    let client = Arc::clone(&coordination.client);
    let catalog: Arc<dyn ServiceCatalog> = Arc::new(SoaDir::new(
        &config.soa_dir,
        &config.system_config_dir,
        &config.cluster,
    ));
    let cluster_state = Arc::new(ClusterStateFile::new(&config.cluster_state_path));
    let queue = build_queue(
        config.use_distributed_queue,
        Arc::clone(&client),
        &config.queue_root,
    )?;
    let daemon_config = config.daemon_config();

    let watcher_deps = WatcherDeps {
        coordinator: Arc::clone(&client),
        catalog: Arc::clone(&catalog),
        cluster_state: cluster_state.clone(),
        drains: cluster_state.clone(),
        autoscaling_root: "/autoscaling".to_string(),
        big_bounce_rate: config.big_bounce_rate,
        poll_interval: daemon_config.poll_interval,
        file_poll_interval: daemon_config.file_poll_interval,
        maintenance_poll_interval: daemon_config.maintenance_poll_interval,
    };
    let watchers = config
        .watchers
        .iter()
        .map(|kind| kind.build(&watcher_deps))
        .collect();
    let executor = CommandExecutor::new(&config.bounce_command, &config.cluster)
        .with_catalog(Arc::clone(&catalog));

    let reconnect = daemon_config.reconnect;
    let daemon = DeployDaemon::new(
        daemon_config,
        DaemonDeps {
            queue,
            executor: Arc::new(executor),
            metrics: config.metrics_provider.build(),
            catalog,
            cluster_state,
            watchers,
        },
    );
    let election = Arc::new(LeaderElection::new(
        client,
        &config.leader_path,
        &config.identity,
        daemon.control(),
        reconnect,
    ));

    let control = daemon.control();
    let on_signal = Arc::clone(&election);
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; shutting down");
            let _ = control.send(ControlMessage::Abort);
            on_signal.cancel();
        }
    });

    info!(identity = %config.identity, cluster = %config.cluster, "deployd starting");
    match election.run(|| daemon.run())? {
        Some(Ok(())) => {
            info!("leadership ended");
            Ok(())
        }
        Some(Err(e)) => Err(e).context("daemon stopped"),
        None => {
            info!("stopped before becoming leader");
            Ok(())
        }
    }
}

fn cmd_queue(
    config: &Config,
    coordination: &Coordination,
    action: QueueAction,
) -> anyhow::Result<()> {
    if coordination.postgres.is_none() {
        bail!("queue commands need DATABASE_URL to reach the shared queue");
    }
    let queue = CoordinatedQueue::new(Arc::clone(&coordination.client), &config.queue_root)?;

    match action {
        QueueAction::List => {
            print_rows("available", &queue.get_available_service_instances(true)?);
            print_rows("waiting", &queue.get_unavailable_service_instances(true)?);
        }
        QueueAction::Put {
            service,
            instance,
            delay_secs,
        } => {
            let delay = TimeDelta::from_std(Duration::from_secs(delay_secs))?;
            let item = ServiceInstance::new(service, instance, "cli").wait_until(Utc::now() + delay);
            println!("queued {item} (wait until {})", item.wait_until);
            queue.put(item)?;
        }
    }
    Ok(())
}

fn print_rows(label: &str, rows: &[QueuedInstance]) {
    println!("{label}: {}", rows.len());
    for row in rows {
        let name = row
            .instance
            .as_ref()
            .map(|item| format!("{item} (watcher {}, failures {})", item.watcher, item.failures))
            .unwrap_or_else(|| "<unreadable>".to_string());
        println!(
            "  {name}  wait_until={}  bounce_by={}",
            row.wait_until, row.bounce_by
        );
    }
}
