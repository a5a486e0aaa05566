use clap::Parser;
use fleet_monitoring::{
    config::{CoordinatorConfig, read_config_file},
    coordinator::Coordinator,
    notify::Notifier,
};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file; defaults apply when omitted
    #[arg(short)]
    file: Option<String>,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_monitoring", LevelFilter::DEBUG),
        ("coordinator", LevelFilter::TRACE),
        ("tower_http", LevelFilter::DEBUG),
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
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = match &args.file {
        Some(file) => read_config_file::<CoordinatorConfig>(file)?,
        None => CoordinatorConfig::default(),
    };

    let notifier = Notifier::from_configs(&config.providers, config.provider_timeout);
    if notifier.is_empty() {
        warn!("no notification providers configured, alerts will only be recorded");
    }

    let history = match &config.history {
        Some(history) => Some(history.open().await?),
        None => None,
    };

    let coordinator = Coordinator::start(config, notifier, history).await?;

    #[cfg(feature = "api")]
    if let Some(api) = &coordinator.config().api {
        use fleet_monitoring::api::{ApiState, spawn_api_server};

        let state = ApiState::from_coordinator(&coordinator);
        spawn_api_server(api, state).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("received interrupt");

    coordinator.shutdown().await;
    Ok(())
}
