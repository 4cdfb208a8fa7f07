use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::{eyre, Result, WrapErr};
use futures::SinkExt;
use protocol::connection::{self, read_message, Channel};
use protocol::properties::{self, Line, Properties};
use protocol::{is_population, Metric, MetricLine, Token, ONETIME, REPEATED};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{info, warn};

/// Leading option: exit before starting if the marker file does not exist
/// yet, creating it. The next start goes through.
const FAIL_FIRST_START: &str = "--fail-first-start=";

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    color_eyre::install().unwrap();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(marker) = args.first().and_then(|a| a.strip_prefix(FAIL_FIRST_START)) {
        fail_first_start(Path::new(marker))?;
        args.remove(0);
    }
    match args.first().map(String::as_str) {
        Some(ONETIME) => one_shot(&args[1..]).await,
        Some(REPEATED) => {
            let port = args
                .get(1)
                .ok_or_else(|| eyre!("repeated mode needs a port"))?
                .parse()
                .wrap_err("port is not a number")?;
            persistent(port).await
        }
        _ => Err(eyre!("expected {ONETIME} or {REPEATED} as first argument")),
    }
}

/// Collects the `-p key=value` pairs
fn properties(args: &[String]) -> Properties {
    args.windows(2)
        .filter(|pair| pair[0] == "-p")
        .filter_map(|pair| match properties::parse_line(&pair[1]) {
            Line::Pair { key, value } => Some((key.to_owned(), value.to_owned())),
            Line::Blank | Line::Malformed => None,
        })
        .collect()
}

fn fail_first_start(marker: &Path) -> Result<()> {
    if marker.exists() {
        return Ok(());
    }
    std::fs::write(marker, "").wrap_err("Could not create start marker")?;
    Err(eyre!("failing the first start as asked"))
}

async fn populate() {
    println!("Loading the social graph");
    sleep(Duration::from_millis(20)).await;
    println!("Data loaded");
}

async fn one_shot(args: &[String]) -> Result<()> {
    if is_population(args) {
        populate().await;
        return Ok(());
    }

    let props = properties(args);
    let workload = Workload::from_props(&props)?;
    let port = props
        .get("port")
        .ok_or_else(|| eyre!("simulation without a port"))?
        .parse()
        .wrap_err("port is not a number")?;

    let socket = TcpListener::bind(("127.0.0.1", port)).await?;
    println!("Started");
    let (stream, _) = socket.accept().await?;
    let mut channel = Channel::wrap(stream);
    channel.writer.send(Token::Initiated).await?;
    simulate(&mut channel, &workload, 1).await
}

async fn persistent(port: u16) -> Result<()> {
    let socket = TcpListener::bind(("127.0.0.1", port)).await?;
    println!("Started");

    let mut rounds = 0;
    loop {
        let (stream, _) = socket.accept().await?;
        let mut channel = Channel::wrap(stream);
        let message = match read_message(&mut channel.reader).await? {
            Some(message) => message,
            None => continue,
        };
        let args: Vec<String> = message.split_whitespace().map(str::to_owned).collect();

        if args.iter().any(|a| a == Token::Shutdown.as_str()) {
            println!("Bye! mock driver on {port} stopping");
            return Ok(());
        }
        if is_population(&args) {
            populate().await;
            println!("EXECUTIONDONE");
            continue;
        }

        rounds += 1;
        let workload = Workload::from_props(&properties(&args))?;
        simulate(&mut channel, &workload, rounds).await?;
        println!("EXECUTIONDONE");
    }
}

async fn simulate(channel: &mut Channel, workload: &Workload, round: u32) -> Result<()> {
    println!("Connected");
    connection::wait_for(&mut channel.reader, Token::StartSimulation).await?;
    println!("Running with {} threads", workload.threads);

    let killed = tokio::select! {
        _ = workload.run() => false,
        res = connection::wait_for(&mut channel.reader, Token::Kill) => {
            res?;
            true
        }
    };
    if killed {
        warn!("killed during round {round}");
        println!("KILLDONE");
        return Ok(());
    }

    for word in workload.stats(round) {
        channel.writer.send(word).await?;
    }
    channel.writer.send(Token::EndOfStats).await?;
    println!("DONE");
    info!("round {round} done");
    Ok(())
}

/// Fake workload, steered by properties on the command:
/// - `mocksatisfiedupto`: highest thread count per node that meets the SLA
/// - `mockstaleness`: staleness reported every round
/// - `mockhang`: a round never finishes on its own, only a kill ends it
/// - `mocktick`: milliseconds a simulated second takes, default 1000
#[derive(Debug)]
struct Workload {
    threads: u32,
    duration_secs: u64,
    monitor_secs: u64,
    satisfied_upto: u32,
    staleness: f64,
    hang: bool,
    tick: Duration,
}

impl Workload {
    fn from_props(props: &Properties) -> Result<Self> {
        fn get<T: std::str::FromStr>(props: &Properties, key: &str, default: T) -> Result<T> {
            match props.get(key) {
                None => Ok(default),
                Some(value) => value
                    .parse()
                    .map_err(|_| eyre!("invalid value {value:?} for {key}")),
            }
        }

        Ok(Self {
            threads: get(props, "threadcount", 1)?,
            duration_secs: get(props, "maxexecutiontime", 1)?,
            monitor_secs: get(props, "monitor", 0)?,
            satisfied_upto: get(props, "mocksatisfiedupto", u32::MAX)?,
            staleness: get(props, "mockstaleness", 0.0)?,
            hang: get(props, "mockhang", false)?,
            tick: Duration::from_millis(get(props, "mocktick", 1000)?),
        })
    }

    fn satisfied(&self) -> bool {
        self.threads <= self.satisfied_upto
    }

    fn confidence(&self) -> f64 {
        if self.satisfied() {
            99.0
        } else {
            50.0
        }
    }

    /// Sleeps through the round, printing a monitoring triple every interval
    async fn run(&self) {
        if self.hang {
            std::future::pending::<()>().await;
        }

        let mut elapsed = 0;
        while elapsed < self.duration_secs {
            let remaining = self.duration_secs - elapsed;
            let step = match self.monitor_secs {
                0 => remaining,
                interval => interval.min(remaining),
            };
            sleep(self.tick * step as u32).await;
            elapsed += step;

            if self.monitor_secs > 0 && step == self.monitor_secs {
                let threads = f64::from(self.threads);
                println!("{}", MetricLine::new(Metric::MonitorSessionThroughput, threads * 10.0));
                println!("{}", MetricLine::new(Metric::MonitorActionThroughput, threads * 100.0));
                println!("{}", MetricLine::new(Metric::MonitorSatisfyingOps, self.confidence()));
            }
        }
    }

    fn stats(&self, round: u32) -> Vec<String> {
        let threads = f64::from(self.threads);
        let runtime = self.duration_secs as f64 * 1000.0;
        let mut words: Vec<String> = [
            (Metric::OverallRuntimeMs, runtime),
            (Metric::OverallSessionThroughput, threads * 10.0),
            (Metric::OverallActionThroughput, threads * 100.0),
            (Metric::RampedRuntimeMs, runtime),
            (Metric::RampedSessionThroughput, threads * 10.0),
            (Metric::RampedActionThroughput, threads * 100.0),
            (Metric::Staleness, self.staleness),
            (Metric::SatisfyingOps, self.confidence()),
        ]
        .into_iter()
        .map(|(metric, value)| MetricLine::new(metric, value).to_string())
        .collect();
        words.push(format!("MOCK-ROUND:{round}"));
        words
    }
}

fn setup_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{filter, fmt};

    let filter = filter::EnvFilter::builder().parse("info").unwrap();
    let fmt_layer = fmt::layer()
        .with_line_number(true)
        .with_writer(std::io::stderr);

    let _ignore_err = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
