use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use color_eyre::eyre::{Result, WrapErr};
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::info;

use crate::config::{Config, Sla};
use crate::engine::{Outcome, Strategy};
use crate::round::{Completion, NodeReport, RoundResult};

pub const EVENT_LOG: &str = "log.txt";
pub const SNAPSHOTS: &str = "Results.txt";

pub fn summary_name(datastore: &str) -> String {
    format!("FinalResults{datastore}.txt")
}

#[derive(Debug)]
struct LogFile {
    writer: BufWriter<File>,
    timestamped: bool,
}

impl LogFile {
    fn open(path: &Path, truncate: bool, timestamped: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(!truncate)
            .truncate(truncate)
            .open(path)
            .wrap_err_with(|| format!("Could not open {path:?}"))?;
        Ok(Self {
            writer: BufWriter::new(file),
            timestamped,
        })
    }

    fn line(&mut self, line: &str) -> io::Result<()> {
        if self.timestamped {
            let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
            let format = format_description!("[year]/[month]/[day] [hour]:[minute]:[second]");
            let stamp = now
                .format(format)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            write!(self.writer, "{stamp}\t")?;
        }
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Entry {
    #[serde(rename = "Type")]
    kind: String,
    threads: u32,
    /// share of the load a node carries, 1 for the overall entry
    workload_percentage: f64,
    throughput: f64,
    confidence: f64,
    staleness: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Snapshot {
    results: Vec<Entry>,
}

impl Snapshot {
    fn of(result: &RoundResult) -> Self {
        let share = 1.0 / result.node_count.max(1) as f64;
        let nodes = result.nodes.iter().map(|node| {
            // nodes that did not finish count as zero
            let weight = match node.completion {
                Completion::Completed => 1.0,
                Completion::Killed | Completion::Lost => 0.0,
            };
            Entry {
                kind: node.label.clone(),
                threads: node.thread_count,
                workload_percentage: share,
                throughput: node.stats.actions_per_sec() * weight,
                confidence: node.stats.confidence() * weight,
                staleness: node.stats.staleness() * weight,
            }
        });
        let overall = Entry {
            kind: "Overall".to_owned(),
            threads: result.thread_count,
            workload_percentage: 1.0,
            throughput: result.act_throughput,
            confidence: result.confidence,
            staleness: result.staleness,
        };
        Self {
            results: nodes.chain(std::iter::once(overall)).collect(),
        }
    }
}

/// `log.txt` events, the `FinalResults<datastore>.txt` summary and the
/// `Results.txt` snapshots of one run
pub struct Reports {
    event_log: LogFile,
    summary: LogFile,
    snapshots: LogFile,
    started: Instant,
    sla: Sla,
}

impl Reports {
    pub fn create(conf: &Config) -> Result<Self> {
        let dir = &conf.settings.output_dir;
        fs::create_dir_all(dir).wrap_err("Could not create output directory")?;

        let mut summary = LogFile::open(&dir.join(summary_name(conf.datastore())), false, true)?;
        summary.line(&format!(", BGconfigFile, {}", conf.source.display()))?;
        summary.line(
            ",time ,Objective, SLA Latency, SLA Confidence, numClients, ThreadCount, \
             Throughput, ActThroughput, totalStaleness,  TotalClientsSucceeded",
        )?;

        Ok(Self {
            event_log: LogFile::open(&dir.join(EVENT_LOG), true, true)?,
            summary,
            snapshots: LogFile::open(&dir.join(SNAPSHOTS), false, false)?,
            started: Instant::now(),
            sla: conf.sla.clone(),
        })
    }

    pub fn event(&mut self, line: &str) -> Result<()> {
        self.event_log.line(line).wrap_err("Could not write event log")
    }

    pub fn round(&mut self, strategy: Strategy, result: &RoundResult) -> Result<()> {
        let elapsed_ms = self.started.elapsed().as_millis();
        self.event(&node_line(result, elapsed_ms, &self.sla))?;
        for node in &result.nodes {
            for sample in &node.stats.samples {
                self.event(&format!(
                    "Monitoring:{},LatencyConfidenceGained:{} ,ActThroughput:{}, true",
                    node.label, sample.confidence, sample.act_throughput
                ))?;
            }
        }

        let when = match result.is_final {
            true => "LastRound".to_owned(),
            false => elapsed_ms.to_string(),
        };
        let line = format!(
            ",{when},{},{},{},{},{},{},{},{},{}",
            strategy.label(),
            self.sla.latency.as_deref().unwrap_or_default(),
            self.sla.confidence,
            result.node_count,
            result.thread_count,
            result.throughput,
            result.act_throughput,
            result.staleness,
            result.satisfied,
        );
        self.summary
            .line(&line)
            .wrap_err("Could not write summary log")?;

        let snapshot = serde_json::to_string(&Snapshot::of(result))?;
        self.snapshots
            .line(&snapshot)
            .wrap_err("Could not write results snapshot")?;
        Ok(())
    }

    pub fn outcome(&mut self, outcome: &Outcome) -> Result<()> {
        let lines = match outcome {
            Outcome::Rated {
                thread_count,
                throughput,
                act_throughput,
            } => vec![
                format!("Max Decided ThreadCount:{thread_count}"),
                format!("Max Decided ThreadCounts - Throughput(sessions) :{throughput}"),
                format!("Max Decided ThreadCounts - Throughput(actions) :{act_throughput}"),
            ],
            Outcome::WarmUpFailed { thread_count } => vec![format!(
                "First round with {thread_count} threads did not meet the SLA, rating failed"
            )],
            Outcome::Exhausted { thread_count } => vec![format!(
                "Final round with {thread_count} threads failed and there is no lower thread count left, rating failed"
            )],
            Outcome::Aborted { thread_count } => {
                vec![format!("Rating aborted at {thread_count} threads")]
            }
        };

        for line in &lines {
            info!("{line}");
            self.event(line)?;
        }
        self.summary
            .line(&format!(",Outcome,{}", lines.join(" ")))
            .wrap_err("Could not write summary log")?;
        Ok(())
    }
}

/// `#<actions/s>##<threads>#` followed by one block per node
fn node_line(result: &RoundResult, elapsed_ms: u128, sla: &Sla) -> String {
    let mut line = format!("#{}##{}#", result.act_throughput, result.thread_count);
    let share = 1.0 / result.node_count.max(1) as f64;
    for node in &result.nodes {
        line.push_str(&node_block(node, elapsed_ms, share, sla));
    }
    line
}

fn node_block(node: &NodeReport, elapsed_ms: u128, share: f64, sla: &Sla) -> String {
    use protocol::Metric::*;
    let stats = &node.stats;
    let value = |metric| stats.get(metric).unwrap_or(0.0);
    let succeeded = node.completion == Completion::Completed
        && sla.satisfied(stats.confidence(), stats.staleness());
    format!(
        "{elapsed_ms},{},{share},{},{},{},{},{},{},{},{},{},{},{}, {},{},{succeeded},#,",
        node.label,
        node.thread_count,
        value(OverallRuntimeMs),
        value(OverallSessionCount),
        value(OverallSessionThroughput),
        value(OverallActionCount),
        value(OverallActionThroughput),
        value(RampedRuntimeMs),
        value(RampedSessionCount),
        value(RampedSessionThroughput),
        value(RampedActionCount),
        value(RampedActionThroughput),
        stats.staleness(),
        stats.confidence(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::EXAMPLE;
    use crate::round::NodeStats;
    use protocol::{Metric, MetricLine};

    fn result(is_final: bool) -> RoundResult {
        let mut stats = NodeStats::default();
        stats.record(MetricLine::new(Metric::RampedActionThroughput, 120.0));
        stats.record(MetricLine::new(Metric::SatisfyingOps, 99.0));
        let nodes = vec![
            NodeReport {
                label: "10.0.0.10:10655".to_owned(),
                thread_count: 2,
                completion: Completion::Completed,
                stats,
            },
            NodeReport {
                label: "10.0.0.11:10655".to_owned(),
                thread_count: 2,
                completion: Completion::Lost,
                stats: NodeStats::default(),
            },
        ];
        RoundResult {
            thread_count: 4,
            node_count: 2,
            is_final,
            throughput: 12.0,
            act_throughput: 120.0,
            staleness: 0.0,
            confidence: 49.5,
            satisfied: 1,
            max_monitoring_round: 0,
            nodes,
        }
    }

    #[test]
    fn snapshot_json() {
        let json = serde_json::to_string(&Snapshot::of(&result(false))).unwrap();
        assert!(json.starts_with(r#"{"Results":[{"Type":"10.0.0.10:10655","Threads":2,"WorkloadPercentage":0.5,"Throughput":120.0"#));
        assert!(json.contains(r#"{"Type":"10.0.0.11:10655","Threads":2,"WorkloadPercentage":0.5,"Throughput":0.0,"Confidence":0.0,"Staleness":0.0}"#));
        assert!(json.contains(r#"{"Type":"Overall","Threads":4,"WorkloadPercentage":1.0,"Throughput":120.0,"Confidence":49.5"#));
    }

    #[test]
    fn artifacts_are_written() {
        let dir = mktemp::Temp::new_dir().unwrap();
        let mut conf = crate::config::Config::parse(EXAMPLE).unwrap();
        conf.settings.output_dir = dir.to_path_buf();

        let mut reports = Reports::create(&conf).unwrap();
        reports.round(Strategy::Socialite, &result(false)).unwrap();
        reports.round(Strategy::Socialite, &result(true)).unwrap();
        reports
            .outcome(&Outcome::Rated {
                thread_count: 4,
                throughput: 12.0,
                act_throughput: 120.0,
            })
            .unwrap();

        let summary = fs::read_to_string(dir.join("FinalResultsBar.txt")).unwrap();
        let lines: Vec<_> = summary.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with(", BGconfigFile, "));
        assert!(lines[3].ends_with(",LastRound,Socialites,0.1,95,2,4,12,120,0,1"));

        let events = fs::read_to_string(dir.join(EVENT_LOG)).unwrap();
        assert!(events.contains("#120##4#"));
        assert!(events.contains(",10.0.0.10:10655,0.5,2,0,0,0,0,0,0,0,0,0,120, 0,99,true,#,"));
        assert!(events.contains(",10.0.0.11:10655,0.5,2,0,0,0,0,0,0,0,0,0,0, 0,0,false,#,"));
        assert!(events.contains("Max Decided ThreadCount:4"));

        let snapshots = fs::read_to_string(dir.join(SNAPSHOTS)).unwrap();
        assert_eq!(snapshots.lines().count(), 2);
        assert!(snapshots.lines().all(|l| l.starts_with(r#"{"Results":["#)));
    }
}
