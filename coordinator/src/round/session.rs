use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use futures::{SinkExt, StreamExt};
use protocol::connection::{self, Backoff, Channel};
use protocol::{classify, Event, Token};
use tokio::sync::Barrier;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::stats::NodeStats;
use crate::config::NodeDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// the node reported its final statistics
    Completed,
    /// the node was stopped before it finished
    Killed,
    /// no terminal token before the deadline or the connection broke
    Lost,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub label: String,
    pub thread_count: u32,
    pub completion: Completion,
    pub stats: NodeStats,
}

#[derive(Debug, Clone)]
pub struct Timing {
    /// bound on connecting and getting the node ready
    pub ready: Duration,
    /// bound on the round itself, counted from the start signal
    pub deadline: Duration,
    pub backoff: Backoff,
}

/// Connects, hands over the message and waits until the node is ready to
/// start
pub async fn initiate(node: &NodeDescriptor, message: &str, backoff: &Backoff) -> Result<Channel> {
    let stream = backoff
        .connect((node.address.as_str(), node.port))
        .await
        .wrap_err("Could not reach listener")?;
    let mut channel = Channel::wrap(stream);
    channel.writer.send(message).await?;
    connection::wait_for(&mut channel.reader, Token::Connected)
        .await
        .wrap_err("Listener never reported its driver connected")?;
    Ok(channel)
}

/// One node's part in a round. Every session reaches the barrier, also the
/// ones that failed to get ready, so the others are never left waiting.
#[instrument(skip_all, fields(node = %node.label(), threads = thread_count))]
pub async fn run_node(
    node: NodeDescriptor,
    thread_count: u32,
    message: String,
    timing: Timing,
    barrier: Arc<Barrier>,
    abort: CancellationToken,
) -> NodeReport {
    let ready = tokio::select! {
        res = timeout(timing.ready, initiate(&node, &message, &timing.backoff)) => match res {
            Ok(Ok(channel)) => Some(channel),
            Ok(Err(e)) => {
                warn!("node did not get ready: {e:?}");
                None
            }
            Err(_) => {
                warn!("node not ready within {:?}", timing.ready);
                None
            }
        },
        _ = abort.cancelled() => None,
    };

    barrier.wait().await;
    let (completion, stats) = match ready {
        Some(_) if abort.is_cancelled() => (Completion::Killed, NodeStats::default()),
        Some(channel) => consume(channel, timing.deadline, &abort).await,
        None => (Completion::Lost, NodeStats::default()),
    };
    info!("node finished: {completion:?}");

    NodeReport {
        label: node.label(),
        thread_count,
        completion,
        stats,
    }
}

/// Starts the node and reads what it reports until a terminal token. An
/// abort forwards a single kill, a node that already finished is left be.
async fn consume(
    mut channel: Channel,
    deadline: Duration,
    abort: &CancellationToken,
) -> (Completion, NodeStats) {
    let mut stats = NodeStats::default();
    if let Err(e) = channel.writer.send(Token::StartSimulation).await {
        warn!("could not start node: {e:?}");
        return (Completion::Lost, stats);
    }

    let deadline = Instant::now() + deadline;
    let mut kill_sent = false;
    loop {
        let word = tokio::select! {
            word = channel.reader.next() => word,
            _ = abort.cancelled(), if !kill_sent => {
                kill_sent = true;
                if let Err(e) = channel.writer.send(Token::Kill).await {
                    warn!("could not forward kill: {e:?}");
                }
                continue;
            }
            _ = sleep_until(deadline) => {
                warn!("no result before the round deadline");
                // the listener tears the driver down once we hang up as well
                if !kill_sent {
                    if let Err(e) = channel.writer.send(Token::Kill).await {
                        debug!("could not stop the late node: {e:?}");
                    }
                }
                return (Completion::Lost, stats);
            }
        };

        let word = match word {
            Some(Ok(word)) => word,
            Some(Err(e)) => {
                warn!("connection to listener failed: {e:?}");
                return (Completion::Lost, stats);
            }
            None => {
                warn!("listener hung up before the round finished");
                return (Completion::Lost, stats);
            }
        };

        match classify(&word) {
            Event::Token(Token::Done) => return (Completion::Completed, stats),
            Event::Token(Token::KillDone) => return (Completion::Killed, stats),
            Event::Metric(line) => {
                if let Some(sample) = stats.record(line) {
                    debug!(
                        "monitoring round {}: confidence {}, actions/s {}",
                        stats.monitoring_rounds, sample.confidence, sample.act_throughput
                    );
                }
            }
            _ => debug!("skipping {word:?}"),
        }
    }
}
