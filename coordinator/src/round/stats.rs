use std::collections::HashMap;

use protocol::{Metric, MetricLine, MonitorTriple};

/// One monitoring interval as reported while the round runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSample {
    pub session_throughput: f64,
    pub act_throughput: f64,
    pub confidence: f64,
}

/// Everything a node reported during one round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStats {
    values: HashMap<Metric, f64>,
    pending: MonitorTriple,
    /// number of complete monitoring triples seen
    pub monitoring_rounds: u32,
    pub samples: Vec<MonitorSample>,
}

impl NodeStats {
    /// Stores the value, returns a sample once it completes a monitoring
    /// triple
    pub fn record(&mut self, line: MetricLine) -> Option<MonitorSample> {
        self.values.insert(line.metric, line.value);

        let [session, action, confidence] = self.pending.push(line)?;
        let sample = MonitorSample {
            session_throughput: session.value,
            act_throughput: action.value,
            confidence: confidence.value,
        };
        self.monitoring_rounds += 1;
        self.samples.push(sample);
        Some(sample)
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.get(&metric).copied()
    }

    fn rate(&self, count: Metric, runtime_ms: Metric) -> Option<f64> {
        let count = self.get(count)?;
        let runtime = self.get(runtime_ms)?;
        (runtime > 0.0).then(|| count / runtime * 1000.0)
    }

    /// Attempted sessions per second after ramp up. Falls back to the
    /// counters and then to the overall figures for drivers that skip some
    /// of the ramped metrics.
    pub fn sessions_per_sec(&self) -> f64 {
        use Metric::*;
        self.get(RampedSessionThroughput)
            .or_else(|| self.rate(RampedSessionCount, RampedRuntimeMs))
            .or_else(|| self.get(OverallSessionThroughput))
            .or_else(|| self.rate(OverallSessionCount, OverallRuntimeMs))
            .unwrap_or(0.0)
    }

    /// Actual actions per second after ramp up, with the same fallbacks
    pub fn actions_per_sec(&self) -> f64 {
        use Metric::*;
        self.get(RampedActionThroughput)
            .or_else(|| self.rate(RampedActionCount, RampedRuntimeMs))
            .or_else(|| self.get(OverallActionThroughput))
            .or_else(|| self.rate(OverallActionCount, OverallRuntimeMs))
            .unwrap_or(0.0)
    }

    /// Final confidence, the last monitoring value if the driver sent none
    pub fn confidence(&self) -> f64 {
        self.get(Metric::SatisfyingOps)
            .or_else(|| self.get(Metric::MonitorSatisfyingOps))
            .unwrap_or(0.0)
    }

    pub fn staleness(&self) -> f64 {
        self.get(Metric::Staleness).unwrap_or(0.0)
    }
}
