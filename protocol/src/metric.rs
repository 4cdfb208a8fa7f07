use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    MonitorSessionThroughput,
    MonitorActionThroughput,
    MonitorSatisfyingOps,
    OverallSessionCount,
    OverallActionCount,
    OverallRuntimeMs,
    OverallSessionThroughput,
    OverallActionThroughput,
    RampedRuntimeMs,
    RampedSessionCount,
    RampedActionCount,
    RampedSessionThroughput,
    RampedActionThroughput,
    Staleness,
    SatisfyingOps,
}

impl Metric {
    pub const ALL: [Metric; 15] = [
        Metric::MonitorSessionThroughput,
        Metric::MonitorActionThroughput,
        Metric::MonitorSatisfyingOps,
        Metric::OverallSessionCount,
        Metric::OverallActionCount,
        Metric::OverallRuntimeMs,
        Metric::OverallSessionThroughput,
        Metric::OverallActionThroughput,
        Metric::RampedRuntimeMs,
        Metric::RampedSessionCount,
        Metric::RampedActionCount,
        Metric::RampedSessionThroughput,
        Metric::RampedActionThroughput,
        Metric::Staleness,
        Metric::SatisfyingOps,
    ];

    pub fn name(self) -> &'static str {
        use Metric::*;
        match self {
            MonitorSessionThroughput => "MONITOR-THROUGHPUT(SESSIONS/SEC)",
            MonitorActionThroughput => "MONITOR-THROUGHPUT(ACTIONS/SEC)",
            MonitorSatisfyingOps => "MONITOR-SATISFYINGOPS(%)",
            OverallSessionCount => "OVERALLOPCOUNT(SESSIONS)",
            OverallActionCount => "OVERALLOPCOUNT(ACTIONS)",
            OverallRuntimeMs => "OVERALLRUNTIME(ms)",
            OverallSessionThroughput => "OVERALLTHROUGHPUT(SESSIONS/SECS)",
            OverallActionThroughput => "OVERALLTHROUGHPUT(ACTIONS/SECS)",
            RampedRuntimeMs => "RAMPEDRUNTIME(ms)",
            RampedSessionCount => "RAMPEDOPCOUNT(SESSIONS)",
            RampedActionCount => "RAMPEDOPCOUNT(ACTIONS)",
            RampedSessionThroughput => "RAMPEDTHROUGHPUT(SESSIONS/SECS)",
            RampedActionThroughput => "RAMPEDTHROUGHPUT(ACTIONS/SECS)",
            Staleness => "STALENESS(OPS)",
            SatisfyingOps => "SATISFYINGOPS(%)",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// position within the triple emitted every monitoring interval
    fn monitor_slot(self) -> Option<usize> {
        match self {
            Metric::MonitorSessionThroughput => Some(0),
            Metric::MonitorActionThroughput => Some(1),
            Metric::MonitorSatisfyingOps => Some(2),
            _ => None,
        }
    }
}

/// A `NAME:value` line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricLine {
    pub metric: Metric,
    pub value: f64,
}

impl MetricLine {
    pub fn new(metric: Metric, value: f64) -> Self {
        Self { metric, value }
    }

    /// The name has to match exactly, a prefix match would confuse
    /// `SATISFYINGOPS(%)` with `MONITOR-SATISFYINGOPS(%)`.
    pub fn parse(input: &str) -> Option<Self> {
        let (name, value) = input.trim().split_once(':')?;
        let metric = Metric::from_name(name)?;
        let value = value.trim().parse().ok()?;
        Some(Self { metric, value })
    }
}

/// Collects the three monitoring values emitted every interval. Each value
/// occupies its own slot, a repeated value replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorTriple {
    slots: [Option<MetricLine>; 3],
}

impl MonitorTriple {
    /// Returns the full triple, in session throughput, action throughput,
    /// confidence order, once the last missing value arrives. Lines that are
    /// not monitoring values are ignored.
    pub fn push(&mut self, line: MetricLine) -> Option<[MetricLine; 3]> {
        let slot = line.metric.monitor_slot()?;
        self.slots[slot] = Some(line);
        match self.slots {
            [Some(a), Some(b), Some(c)] => {
                self.slots = [None; 3];
                Some([a, b, c])
            }
            _ => None,
        }
    }
}

impl fmt::Display for MetricLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.metric.name(), self.value)
    }
}
