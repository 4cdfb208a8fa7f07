use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use listener::{Config, Listener};

/// Bridges the rating coordinator to the benchmark driver on this node
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// file with a port=<number> line and extra driver properties
    config: PathBuf,
    /// Optional, overrides the port from the config file
    #[clap(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    color_eyre::install().unwrap();

    let args = Args::parse();
    let mut conf = Config::from_file(&args.config).wrap_err("Could not load listener config")?;
    if let Some(port) = args.port {
        conf.port = port;
    }

    let listener = Listener::bind(conf).await?;
    listener.run().await
}

fn setup_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{filter, fmt};

    let filter = filter::EnvFilter::builder()
        .parse("info,listener::driver=debug")
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
