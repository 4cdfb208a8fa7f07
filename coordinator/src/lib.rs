use color_eyre::eyre::{Result, WrapErr};
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use protocol::connection::Channel;
use protocol::Token;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub mod config;
pub mod engine;
pub mod message;
pub mod population;
pub mod report;
pub mod round;

pub use config::{Config, ConfigError};
use engine::{Durations, Limits, Outcome, RatingEngine, MAX_THREADS};
use report::Reports;

/// Runs population, the rating and finally tells every listener to shut
/// down its driver. Cancelling `abort` kills the round in flight, the
/// shutdown still happens.
#[instrument(skip_all, fields(nodes = conf.nodes.len()))]
pub async fn run(conf: &Config, abort: CancellationToken) -> Result<Outcome> {
    let mut reports = Reports::create(conf)?;
    reports.event(&format!(
        "Rating {} with {} nodes",
        conf.datastore(),
        conf.nodes.len()
    ))?;

    let outcome = rate(conf, &mut reports, &abort).await;
    shutdown(conf).await;

    let outcome = outcome?;
    reports.outcome(&outcome)?;
    Ok(outcome)
}

async fn rate(conf: &Config, reports: &mut Reports, abort: &CancellationToken) -> Result<Outcome> {
    let settings = &conf.settings;
    let mut engine = RatingEngine::new(
        settings.strategy,
        Limits {
            initial: settings.initial_thread_count,
            min: settings.min_thread_count,
            max: MAX_THREADS,
        },
        Durations {
            probe: settings.rating_unit,
            full: settings.final_execution_time,
            monitor: settings.monitor,
        },
    );

    if !settings.load_between_rounds {
        population::populate(conf).await?;
    }

    while let Some(plan) = engine.next_round() {
        if abort.is_cancelled() {
            engine.abort();
            break;
        }
        if settings.load_between_rounds {
            population::populate(conf).await?;
        }

        info!("next round: {plan:?}");
        reports.event(&format!(
            "Starting round with {} threads for {}s{}",
            plan.thread_count,
            plan.duration_secs,
            if plan.is_final { ", final round" } else { "" }
        ))?;
        let result = round::run_round(conf, &plan, abort).await?;
        if abort.is_cancelled() {
            engine.abort();
            break;
        }

        reports.round(engine.strategy(), &result)?;
        engine.record(&result);
    }

    let outcome = engine
        .outcome()
        .cloned()
        .unwrap_or(Outcome::Aborted { thread_count: 0 });
    Ok(outcome)
}

/// Asks every listener to shut down its driver, waits until each closed the
/// connection. Unreachable listeners are only logged.
#[instrument(skip_all)]
pub async fn shutdown(conf: &Config) {
    let limit = conf.settings.ready_timeout;
    let requests = conf.nodes.iter().map(|node| async move {
        let res = timeout(limit, shutdown_node(conf, node)).await;
        match res {
            Ok(Ok(())) => info!("{} shut down", node.label()),
            Ok(Err(e)) => warn!("could not shut down {}: {e:?}", node.label()),
            Err(_) => warn!("{} did not shut down within {limit:?}", node.label()),
        }
    });
    join_all(requests).await;
}

async fn shutdown_node(conf: &Config, node: &config::NodeDescriptor) -> Result<()> {
    let backoff = protocol::connection::Backoff {
        attempts: conf.settings.backoff.attempts.min(3),
        ..conf.settings.backoff.clone()
    };
    let stream = backoff
        .connect((node.address.as_str(), node.port))
        .await
        .wrap_err("Could not reach listener")?;
    let mut channel = Channel::wrap(stream);
    channel
        .writer
        .send(format!("{} {}", Token::Shutdown, protocol::END_OF_MESSAGE))
        .await?;
    // the listener hangs up once its driver is gone
    while channel.reader.next().await.transpose()?.is_some() {}
    Ok(())
}
