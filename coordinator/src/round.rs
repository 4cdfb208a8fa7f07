use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr};
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{Config, Sla};
use crate::engine::RoundPlan;
use crate::message::{self, Placement};

mod session;
mod stats;

pub use session::{Completion, NodeReport};
pub use stats::{MonitorSample, NodeStats};

#[derive(Debug, Clone, PartialEq)]
pub struct RoundRequest {
    pub thread_count_for_node: u32,
    pub total_thread_count: u32,
    pub node_share: f64,
    pub round_duration_secs: u64,
    pub monitoring_interval_secs: u64,
    pub is_final_round: bool,
}

#[derive(Debug, Clone)]
pub struct RoundResult {
    pub thread_count: u32,
    pub node_count: usize,
    pub is_final: bool,
    /// attempted sessions per second summed over the nodes
    pub throughput: f64,
    /// actual actions per second summed over the nodes
    pub act_throughput: f64,
    pub staleness: f64,
    pub confidence: f64,
    pub satisfied: usize,
    /// highest monitoring round any node reached, only set for final rounds
    pub max_monitoring_round: u32,
    pub nodes: Vec<NodeReport>,
}

impl RoundResult {
    pub fn fully_satisfied(&self) -> bool {
        self.node_count > 0 && self.satisfied == self.node_count
    }

    /// Only nodes that completed count towards the totals, each weighs in
    /// for one node's share of staleness and confidence.
    pub fn aggregate(thread_count: u32, is_final: bool, nodes: Vec<NodeReport>, sla: &Sla) -> Self {
        let node_count = nodes.len();
        let weight = 1.0 / node_count.max(1) as f64;

        let mut result = Self {
            thread_count,
            node_count,
            is_final,
            throughput: 0.0,
            act_throughput: 0.0,
            staleness: 0.0,
            confidence: 0.0,
            satisfied: 0,
            max_monitoring_round: 0,
            nodes: Vec::new(),
        };

        for node in nodes.iter().filter(|n| n.completion == Completion::Completed) {
            let stats = &node.stats;
            result.throughput += stats.sessions_per_sec();
            result.act_throughput += stats.actions_per_sec();
            result.staleness += stats.staleness() * weight;
            result.confidence += stats.confidence() * weight;
            if sla.satisfied(stats.confidence(), stats.staleness()) {
                result.satisfied += 1;
            }
            if is_final {
                result.max_monitoring_round =
                    result.max_monitoring_round.max(stats.monitoring_rounds);
            }
        }

        result.nodes = nodes;
        result
    }
}

/// Spreads `total` threads over `n` nodes, the first nodes take the
/// remainder
pub fn split_threads(total: u32, n: usize) -> Vec<u32> {
    let n = n as u32;
    if n == 0 {
        return Vec::new();
    }
    let (base, rest) = (total / n, total % n);
    (0..n).map(|i| base + u32::from(i < rest)).collect()
}

#[instrument(skip(conf, abort), fields(threads = plan.thread_count))]
pub async fn run_round(
    conf: &Config,
    plan: &RoundPlan,
    abort: &CancellationToken,
) -> Result<RoundResult> {
    let settings = &conf.settings;
    let node_count = conf.nodes.len();
    let timing = session::Timing {
        ready: settings.ready_timeout,
        deadline: Duration::from_secs(plan.duration_secs) + settings.round_grace,
        backoff: settings.backoff.clone(),
    };

    let barrier = Arc::new(Barrier::new(node_count));
    let mut tasks = JoinSet::new();
    let shares = split_threads(plan.thread_count, node_count);
    for (idx, (node, threads)) in conf.nodes.iter().zip(shares).enumerate() {
        let placement = Placement {
            machine_id: idx,
            node_count,
            user_count: node.user_count,
            user_offset: node.user_offset,
        };
        let request = RoundRequest {
            thread_count_for_node: threads,
            total_thread_count: plan.thread_count,
            node_share: 1.0 / node_count as f64,
            round_duration_secs: plan.duration_secs,
            monitoring_interval_secs: settings.monitor,
            is_final_round: plan.is_final,
        };
        let message = message::simulation_message(
            &placement,
            &request,
            &conf.props.common,
            &conf.props.benchmark,
        )
        .wrap_err("Could not build simulation message")?;

        let session = session::run_node(
            node.clone(),
            threads,
            message,
            timing.clone(),
            barrier.clone(),
            abort.clone(),
        );
        tasks.spawn(async move { (idx, session.await) });
    }

    let mut reports = Vec::with_capacity(node_count);
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(report) => reports.push(report),
            Err(e) => warn!("node session crashed: {e:?}"),
        }
    }
    reports.sort_by_key(|(idx, _)| *idx);
    let reports: Vec<_> = reports.into_iter().map(|(_, report)| report).collect();

    let result = RoundResult::aggregate(plan.thread_count, plan.is_final, reports, &conf.sla);
    info!(
        "round done, {}/{} nodes satisfied, actions/s: {}",
        result.satisfied, result.node_count, result.act_throughput
    );
    Ok(result)
}
