use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use coordinator::engine::Outcome;
use coordinator::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Finds the load a data store sustains within its SLA using a fleet of
/// benchmark drivers
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// rating configuration with one #clientinfo block per node
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    color_eyre::install().unwrap();

    let args = Args::parse();
    let conf = Config::from_file(&args.config).wrap_err("Could not load rating config")?;

    let abort = CancellationToken::new();
    let on_signal = abort.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, killing the current round");
                on_signal.cancel();
            }
            Err(e) => warn!("could not listen for ctrl-c: {e:?}"),
        }
    });

    match coordinator::run(&conf, abort).await? {
        Outcome::Rated { thread_count, .. } => info!("rated at {thread_count} threads"),
        other => warn!("rating did not succeed: {other:?}"),
    }
    Ok(())
}

fn setup_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{filter, fmt};

    let filter = filter::EnvFilter::builder()
        .parse("info,coordinator::round=debug")
        .unwrap();

    let uptime = fmt::time::uptime();
    let fmt_layer = fmt::layer()
        .pretty()
        .with_line_number(true)
        .with_timer(uptime);

    let _ignore_err = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
