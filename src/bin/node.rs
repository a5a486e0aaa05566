use std::time::Duration;

use clap::Parser;
use fleet_monitoring::{
    config::{NodeConfig, read_config_file},
    node::NodeAgent,
};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Pause before a new session once the coordinator went away
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file; defaults and environment apply when omitted
    #[arg(short)]
    file: Option<String>,

    /// Override the node id
    #[arg(long)]
    node_id: Option<String>,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_monitoring", LevelFilter::DEBUG),
        ("node", LevelFilter::TRACE),
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

    let mut config = match &args.file {
        Some(file) => read_config_file::<NodeConfig>(file)?,
        None => NodeConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    let mut agent = NodeAgent::new(config)?;
    info!("starting node {}", agent.node_id());

    loop {
        if let Err(e) = agent.start().await {
            error!("could not join coordinator: {e}");
        } else {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received interrupt");
                    agent.stop().await;
                    return Ok(());
                }
                _ = agent.wait() => {
                    warn!("lost connection to coordinator");
                }
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt");
                return Ok(());
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
