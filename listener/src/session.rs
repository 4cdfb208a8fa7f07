use color_eyre::eyre::{eyre, Result, WrapErr};
use futures::SinkExt;
use protocol::connection::{self, Channel};
use protocol::Token;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::driver::{free_port, Driver};
use crate::relay::{self, RoundEnd};
use crate::request::DriverCommand;

async fn ready<F, T>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| eyre!("timed out after {limit:?} waiting for {what}"))?
}

/// Runs a populating driver to completion
#[instrument(skip_all)]
pub async fn populate_once(cmd: &DriverCommand, conf: &Config, coord: &mut Channel) -> Result<()> {
    let mut driver = Driver::spawn(&cmd.one_shot_argv(None, &conf.extra), 0)?;
    driver.drain().await?;
    let status = driver.wait().await?;
    if !status.success() {
        return Err(eyre!("populating driver failed: {status}"));
    }

    coord.writer.send(Token::LoadingCompleted).await?;
    info!("population done");
    Ok(())
}

/// Spawns a driver for this round only, it is gone when this returns
#[instrument(skip_all)]
pub async fn simulate_once(cmd: &DriverCommand, conf: &Config, coord: &mut Channel) -> Result<()> {
    let port = free_port().await?;
    let mut driver = Driver::spawn(&cmd.one_shot_argv(Some(port), &conf.extra), port)?;
    ready(conf.ready_timeout, "driver start", driver.wait_for(Token::Started)).await?;

    let mut socket = driver.connect(&conf.backoff).await?;
    ready(conf.ready_timeout, "driver socket", async {
        connection::wait_for(&mut socket.reader, Token::Initiated)
            .await
            .wrap_err("Driver closed its socket")
    })
    .await?;
    ready(conf.ready_timeout, "driver connect", driver.wait_for(Token::Connected)).await?;

    let end = relay::relay_round(&mut driver, &mut socket, coord).await?;
    if let RoundEnd::Completed(_) = end {
        driver.drain().await?;
        let status = driver.wait().await?;
        if !status.success() {
            warn!("driver exited with {status}");
        }
    } else {
        driver.terminate().await;
    }
    relay::report(&mut coord.writer, end).await
}

/// Forwards a populate request to a long lived driver
#[instrument(skip_all, fields(port = driver.port))]
pub async fn populate_persistent(
    driver: &mut Driver,
    cmd: &DriverCommand,
    conf: &Config,
    coord: &mut Channel,
) -> Result<()> {
    let mut socket = driver.connect(&conf.backoff).await?;
    socket
        .writer
        .send(cmd.forwarded(driver.port, &conf.extra))
        .await?;
    driver.wait_for(Token::ExecutionDone).await?;

    coord.writer.send(Token::LoadingCompleted).await?;
    info!("population done");
    Ok(())
}

/// One round on a long lived driver. The driver is idle again once this
/// returns `Completed`.
#[instrument(skip_all, fields(port = driver.port))]
pub async fn simulate_persistent(
    driver: &mut Driver,
    cmd: &DriverCommand,
    conf: &Config,
    coord: &mut Channel,
) -> Result<RoundEnd> {
    let mut socket = driver.connect(&conf.backoff).await?;
    socket
        .writer
        .send(cmd.forwarded(driver.port, &conf.extra))
        .await?;
    ready(conf.ready_timeout, "driver connect", driver.wait_for(Token::Connected)).await?;

    let end = relay::relay_round(driver, &mut socket, coord).await?;
    if let RoundEnd::Completed(_) = end {
        driver.wait_for(Token::ExecutionDone).await?;
    }
    Ok(end)
}

/// Starts a long lived driver. A driver that never reports it started most
/// likely lost the race for its port, it is retried on a fresh one.
#[instrument(skip_all)]
pub async fn start_persistent(cmd: &DriverCommand, conf: &Config) -> Result<Driver> {
    const ATTEMPTS: usize = 3;
    for attempt in 1..=ATTEMPTS {
        let port = free_port().await?;
        let mut driver = Driver::spawn(&cmd.persistent_argv(port), port)?;
        match ready(conf.ready_timeout, "driver start", driver.wait_for(Token::Started)).await {
            Ok(()) => {
                info!("persistent driver listening on {port}");
                return Ok(driver);
            }
            Err(e) => warn!("attempt {attempt}/{ATTEMPTS} to start driver failed: {e:?}"),
        }
        driver.terminate().await;
    }
    Err(eyre!("driver never reported it started"))
}

/// Asks a long lived driver to exit and waits for its goodbye
#[instrument(skip_all, fields(port = driver.port))]
pub async fn shutdown_persistent(mut driver: Driver, conf: &Config) -> Result<()> {
    let mut socket = driver.connect(&conf.backoff).await?;
    let message = format!("{} -p port={} #", Token::Shutdown, driver.port);
    socket.writer.send(message).await?;
    let res = ready(conf.ready_timeout, "driver goodbye", driver.wait_for(Token::Bye)).await;
    driver.terminate().await;
    res?;
    info!("persistent driver shut down");
    Ok(())
}
