use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rule_evaluator::{
    actors::{
        ActorSupervisor,
        discovery::DiscoveryManager,
        export::{ExportOptions, ExportStorage},
        notifier::{NotificationManager, NotifierOptions},
        reload::{ReloadListener, initial_load_actor},
        reload_targets,
        rules::RuleManager,
        signals::{hangup_signals, termination_actor},
    },
    alerts::AlertSender,
    api::{ApiState, ControlPlane},
    config,
    query::{MetricsSource, http::PrometheusClient},
    reload::ReloadCoordinator,
    telemetry,
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// The Prometheus rule evaluator
#[derive(Debug, Clone, Parser)]
#[command(name = "rule-evaluator")]
struct Args {
    /// The address of the Prometheus server query endpoint
    #[arg(long = "query.target-url")]
    query_target_url: String,

    /// The address to listen on for HTTP requests
    #[arg(long = "web.listen-address", default_value = "0.0.0.0:9091")]
    web_listen_address: SocketAddr,

    /// Configuration file path
    #[arg(long = "config.file", default_value = "rule-evaluator.toml")]
    config_file: String,

    /// The capacity of the queue for pending alertmanager notifications
    #[arg(long = "alertmanager.notification-queue-capacity", default_value_t = 10_000)]
    notification_queue_capacity: usize,

    /// Timeout of the readiness query in seconds
    #[arg(long = "web.ready-timeout", default_value_t = 10)]
    web_ready_timeout: u64,

    /// Endpoint receiving recorded samples, discarded when unset
    #[arg(long = "export.url")]
    export_url: Option<String>,

    /// Interval in seconds after which pending samples are exported
    #[arg(long = "export.flush-interval", default_value_t = 5)]
    export_flush_interval: u64,

    /// Number of samples that triggers an export
    #[arg(long = "export.batch-size", default_value_t = 200)]
    export_batch_size: usize,

    /// Log level of the rule evaluator
    #[arg(long = "log.level", default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("rule_evaluator", level),
        ("tower_http", LevelFilter::WARN),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // clap exits with code 2 on invalid arguments
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {args:?}");

    if let Err(e) = config::load_file(&args.config_file) {
        error!("error loading config (--config.file={}): {e}", args.config_file);
        return ExitCode::from(2);
    }

    let source: Arc<dyn MetricsSource> = match PrometheusClient::new(&args.query_target_url) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(2);
        }
    };

    match run(args, source).await {
        Ok(()) => {
            info!("rule evaluator stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args, source: Arc<dyn MetricsSource>) -> anyhow::Result<()> {
    let metrics = telemetry::install_recorder()?;

    let discovery = Arc::new(DiscoveryManager::new("notify"));
    let notifier = Arc::new(NotificationManager::new(NotifierOptions {
        queue_capacity: args.notification_queue_capacity,
        ..NotifierOptions::default()
    })?);
    let (export, appender) = ExportStorage::new(ExportOptions {
        url: args.export_url.clone(),
        batch_size: args.export_batch_size,
        flush_interval: Duration::from_secs(args.export_flush_interval),
    })?;

    let sender = AlertSender::new(notifier.clone(), args.query_target_url.clone());
    let rules = Arc::new(RuleManager::new(
        Arc::clone(&source),
        Arc::new(appender),
        sender,
    ));

    let coordinator = ReloadCoordinator::new(
        &args.config_file,
        reload_targets(notifier.clone(), discovery.clone(), rules.clone()),
    );
    let (listener, reload) = ReloadListener::new(coordinator);

    let plane = ControlPlane::bind(args.web_listen_address).await?;
    let state = ApiState::new(reload.clone(), source, metrics)
        .with_ready_timeout(Duration::from_secs(args.web_ready_timeout));

    let sync_rx = discovery.sync_channel();
    let supervisor = ActorSupervisor::new()
        .with(termination_actor())
        .with(rules.actor())
        .with(notifier.actor(sync_rx))
        .with(discovery.actor())
        .with(export.actor())
        .with(plane.actor(state))
        .with(listener.actor(hangup_signals()))
        .with(initial_load_actor(reload));

    info!(actors = supervisor.len(), "starting rule evaluator");
    supervisor.run().await?;
    Ok(())
}
