use color_eyre::eyre::{eyre, Result, WrapErr};
use futures::{SinkExt, StreamExt};
use protocol::connection::{self, Channel, TokenReader, TokenWriter};
use protocol::{classify, Event, MonitorTriple, Token, END_OF_STATS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::driver::Driver;

#[derive(Debug, Clone, PartialEq)]
pub enum RoundEnd {
    /// the statistics the driver reported, without the end marker
    Completed(Vec<String>),
    Killed,
}

/// Runs a round on a driver that already reported it is connected. The kill
/// watcher runs concurrently with the output relay and stops once the
/// driver's output reaches a terminal line.
#[instrument(skip_all, fields(driver_port = driver.port))]
pub async fn relay_round(
    driver: &mut Driver,
    socket: &mut Channel,
    coord: &mut Channel,
) -> Result<RoundEnd> {
    let Channel {
        reader: coord_reader,
        writer: coord_writer,
    } = coord;

    coord_writer.send(Token::Connected).await?;
    connection::wait_for(coord_reader, Token::StartSimulation)
        .await
        .wrap_err("Coordinator never sent the start signal")?;
    socket.writer.send(Token::StartSimulation).await?;
    info!("round started");

    let stop = CancellationToken::new();
    let hung_up = CancellationToken::new();
    let watcher = async {
        let res = forward_kill(coord_reader, &mut socket.writer, stop.clone()).await;
        if res.is_err() {
            hung_up.cancel();
        }
        res
    };
    let output = async {
        let res = tokio::select! {
            res = relay_output(driver, coord_writer) => res,
            _ = hung_up.cancelled() => Err(eyre!("round abandoned")),
        };
        stop.cancel();
        res
    };
    let (killed, watched) = tokio::join!(output, watcher);
    // the caller drops the driver on error, which kills it
    watched.wrap_err("Lost the coordinator during the round")?;

    if killed? {
        info!("driver killed");
        return Ok(RoundEnd::Killed);
    }
    let stats = collect_stats(&mut socket.reader).await?;
    Ok(RoundEnd::Completed(stats))
}

/// Streams monitoring triples upstream until the driver prints a terminal
/// line. Returns true if the driver was killed.
async fn relay_output(driver: &mut Driver, coord: &mut TokenWriter) -> Result<bool> {
    let mut triple = MonitorTriple::default();
    while let Some(line) = driver.next_line().await? {
        match classify(&line) {
            Event::Metric(metric) => {
                if let Some(complete) = triple.push(metric) {
                    for metric in complete {
                        coord.send(metric.to_string()).await?;
                    }
                }
            }
            Event::Token(Token::Done) => return Ok(false),
            Event::Token(Token::KillDone) => return Ok(true),
            _ => (),
        }
    }
    Err(eyre!("driver output ended before the round finished"))
}

/// Forwards a kill request from the coordinator to the driver, at most once.
/// Returns true if a kill was forwarded, a coordinator that hangs up is an
/// error.
async fn forward_kill(
    coord: &mut TokenReader,
    driver: &mut TokenWriter,
    stop: CancellationToken,
) -> Result<bool> {
    loop {
        let word = tokio::select! {
            _ = stop.cancelled() => return Ok(false),
            word = coord.next() => word,
        };

        match word {
            Some(Ok(word)) if word == Token::Kill.as_str() => {
                info!("coordinator wants the driver to stop");
                driver.send(Token::Kill).await?;
                return Ok(true);
            }
            Some(Ok(word)) => debug!("ignoring {word:?} from coordinator"),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(eyre!("coordinator hung up during the round")),
        }
    }
}

async fn collect_stats(socket: &mut TokenReader) -> Result<Vec<String>> {
    let mut stats = Vec::new();
    while let Some(word) = socket.next().await {
        let word = word?;
        if word == END_OF_STATS {
            return Ok(stats);
        }
        stats.push(word);
    }
    Err(eyre!("driver closed its socket before sending all statistics"))
}

/// Final word on a round towards the coordinator
pub async fn report(coord: &mut TokenWriter, end: RoundEnd) -> Result<()> {
    match end {
        RoundEnd::Completed(stats) => {
            for word in stats {
                coord.send(word).await?;
            }
            coord.send(Token::Done).await?;
        }
        RoundEnd::Killed => coord.send(Token::KillDone).await?,
    }
    Ok(())
}
