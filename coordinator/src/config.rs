//! The run configuration: which nodes take part, the properties forwarded to
//! the drivers and the settings that steer the rating itself.
//!
//! ```text
//! exe=java -cp bg.jar BGMainClass
//! datastore=MongoDbClient
//! schema:mongodb.url=10.0.0.2:27017
//! #clientinfo
//! ip=10.0.0.10
//! port=10655
//! usercount=10000
//! useroffset=0
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use protocol::connection::Backoff;
use protocol::properties::{self, Line, Properties};

use crate::engine::Strategy;

pub const CLIENT_INFO: &str = "#clientinfo";
const SCHEMA_PREFIX: &str = "schema:";
const LOAD_PREFIX: &str = "load:";
const BENCHMARK_PREFIX: &str = "benchmark:";

pub const EXE: &str = "exe";
pub const DATASTORE: &str = "datastore";
pub const WORKLOAD_FILE: &str = "workloadfile";
pub const LOAD_WORKLOAD_FILE: &str = "loadworkloadfile";
pub const RATING_UNIT: &str = "ratingunit";
pub const FINAL_EXECUTION_TIME: &str = "finalexecutiontime";
pub const EXPECTED_LATENCY: &str = "expectedlatency";
pub const EXPECTED_CONFIDENCE: &str = "expectedconfidence";
pub const EXPECTED_STALENESS: &str = "expectedstaleness";
pub const BG_MODE: &str = "bgmode";

/// Keys that steer the coordinator, these never reach a driver
mod setting {
    pub const THREAD_COUNT: &str = "threadcount";
    pub const NUM_CLIENTS: &str = "numclients";
    pub const LOAD_BETWEEN_ROUNDS: &str = "loadbetweenrounds";
    pub const RATING_TYPE: &str = "ratingtype";
    pub const MONITOR: &str = "monitor";
    pub const NUM_LOAD_THREADS: &str = "numloadthreads";
    pub const MIN_THREAD_COUNT: &str = "minthreadcount";
    pub const OUTPUT_DIR: &str = "outputdir";
    pub const READY_TIMEOUT: &str = "readytimeout";
    pub const ROUND_GRACE: &str = "roundgrace";
    pub const CONNECT_ATTEMPTS: &str = "connectattempts";
    pub const CONNECT_INITIAL_DELAY: &str = "connectinitialdelay";
    pub const CONNECT_MULTIPLIER: &str = "connectmultiplier";
    pub const CONNECT_MAX_DELAY: &str = "connectmaxdelay";
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Line {line_no} is not a key=value pair: {line:?}")]
    Malformed { line_no: usize, line: String },
    #[error("Client info block starting at line {line_no} is incomplete, missing {missing}")]
    ClientInfo { line_no: usize, missing: &'static str },
    #[error("Required property {0} is not set")]
    Missing(&'static str),
    #[error("Value {value:?} for {key} is not valid")]
    Invalid { key: String, value: String },
    #[error("numclients is {declared} but {found} client info blocks are configured")]
    NodeCount { declared: usize, found: usize },
    #[error("No nodes configured, add at least one {CLIENT_INFO} block")]
    NoNodes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub address: String,
    pub port: u16,
    pub user_count: u64,
    pub user_offset: u64,
}

impl NodeDescriptor {
    pub fn label(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Driver properties per phase, a phase entry overrides a common one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    pub common: Properties,
    pub schema: Properties,
    pub load: Properties,
    pub benchmark: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sla {
    /// only reported, the drivers judge latency themselves
    pub latency: Option<String>,
    pub confidence: f64,
    pub staleness: f64,
}

impl Sla {
    pub fn satisfied(&self, confidence: f64, staleness: f64) -> bool {
        confidence >= self.confidence && staleness <= self.staleness
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub initial_thread_count: u32,
    pub min_thread_count: u32,
    pub strategy: Strategy,
    pub load_between_rounds: bool,
    pub load_threads: u32,
    /// length of a probe round
    pub rating_unit: u64,
    /// length of a confirmation round
    pub final_execution_time: u64,
    /// seconds between monitoring reports, 0 disables them
    pub monitor: u64,
    pub output_dir: PathBuf,
    pub ready_timeout: Duration,
    pub round_grace: Duration,
    pub backoff: Backoff,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub nodes: Vec<NodeDescriptor>,
    pub props: PropertySet,
    pub sla: Sla,
    pub settings: Settings,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut conf = Self::parse(&text)?;
        conf.source = path.to_owned();
        Ok(conf)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut nodes = Vec::new();
        let mut props = PropertySet::default();

        let mut lines = text.lines().enumerate().map(|(idx, line)| (idx + 1, line));
        while let Some((line_no, line)) = lines.next() {
            if line.trim().starts_with(CLIENT_INFO) {
                nodes.push(client_info(line_no, &mut lines)?);
                continue;
            }

            let (key, value) = match properties::parse_line(line) {
                Line::Blank => continue,
                Line::Pair { key, value } => (key, value.to_owned()),
                Line::Malformed => {
                    return Err(ConfigError::Malformed {
                        line_no,
                        line: line.to_owned(),
                    })
                }
            };

            if let Some(key) = key.strip_prefix(SCHEMA_PREFIX) {
                props.schema.insert(key.to_owned(), value);
            } else if let Some(key) = key.strip_prefix(LOAD_PREFIX) {
                props.load.insert(key.to_owned(), value);
            } else if let Some(key) = key.strip_prefix(BENCHMARK_PREFIX) {
                props.benchmark.insert(key.to_owned(), value);
            } else {
                props.common.insert(key.to_owned(), value);
            }
        }

        let settings = take_settings(&mut props.common, nodes.len())?;
        for key in [
            EXE,
            DATASTORE,
            WORKLOAD_FILE,
            LOAD_WORKLOAD_FILE,
            RATING_UNIT,
            FINAL_EXECUTION_TIME,
            EXPECTED_CONFIDENCE,
            EXPECTED_STALENESS,
        ] {
            if !props.common.contains_key(key) {
                return Err(ConfigError::Missing(key));
            }
        }
        let sla = Sla {
            latency: props.common.get(EXPECTED_LATENCY).cloned(),
            confidence: required(&props.common, EXPECTED_CONFIDENCE)?,
            staleness: required(&props.common, EXPECTED_STALENESS)?,
        };

        Ok(Self {
            source: PathBuf::new(),
            nodes,
            props,
            sla,
            settings,
        })
    }

    /// The data store under test, a benchmark phase entry wins
    pub fn datastore(&self) -> &str {
        self.props
            .benchmark
            .get(DATASTORE)
            .or_else(|| self.props.common.get(DATASTORE))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

fn client_info<'a>(
    header: usize,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<NodeDescriptor, ConfigError> {
    let mut info = Properties::new();
    for (line_no, line) in lines.by_ref() {
        match properties::parse_line(line) {
            Line::Blank => continue,
            Line::Pair { key, value } => {
                info.insert(key.to_owned(), value.to_owned());
            }
            Line::Malformed => {
                return Err(ConfigError::Malformed {
                    line_no,
                    line: line.to_owned(),
                })
            }
        }
        if info.len() == 4 {
            break;
        }
    }

    let field = |key: &'static str| {
        info.get(key).ok_or(ConfigError::ClientInfo {
            line_no: header,
            missing: key,
        })
    };
    Ok(NodeDescriptor {
        address: field("ip")?.clone(),
        port: parse_value("port", field("port")?)?,
        user_count: parse_value("usercount", field("usercount")?)?,
        user_offset: parse_value("useroffset", field("useroffset")?)?,
    })
}

fn take_settings(common: &mut Properties, node_count: usize) -> Result<Settings, ConfigError> {
    use setting::*;

    if node_count == 0 {
        return Err(ConfigError::NoNodes);
    }
    if let Some(declared) = take::<usize>(common, NUM_CLIENTS)? {
        if declared != node_count {
            return Err(ConfigError::NodeCount {
                declared,
                found: node_count,
            });
        }
    }

    let strategy = match common.remove(RATING_TYPE) {
        None => Strategy::Socialite,
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key: RATING_TYPE.to_owned(),
            value,
        })?,
    };

    let defaults = Backoff::default();
    let backoff = Backoff {
        attempts: take(common, CONNECT_ATTEMPTS)?.unwrap_or(defaults.attempts),
        initial: take(common, CONNECT_INITIAL_DELAY)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial),
        multiplier: take(common, CONNECT_MULTIPLIER)?.unwrap_or(defaults.multiplier),
        max_delay: take(common, CONNECT_MAX_DELAY)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
    };

    let initial_thread_count = take(common, THREAD_COUNT)?.unwrap_or(1);
    let min_thread_count = take(common, MIN_THREAD_COUNT)?.unwrap_or(1);
    if initial_thread_count < min_thread_count || min_thread_count == 0 {
        return Err(ConfigError::Invalid {
            key: THREAD_COUNT.to_owned(),
            value: initial_thread_count.to_string(),
        });
    }

    Ok(Settings {
        initial_thread_count,
        min_thread_count,
        strategy,
        load_between_rounds: take(common, LOAD_BETWEEN_ROUNDS)?.unwrap_or(false),
        load_threads: take(common, NUM_LOAD_THREADS)?.unwrap_or(10),
        rating_unit: required(common, RATING_UNIT)?,
        final_execution_time: required(common, FINAL_EXECUTION_TIME)?,
        monitor: take(common, MONITOR)?.unwrap_or(0),
        output_dir: common
            .remove(OUTPUT_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
        ready_timeout: Duration::from_secs(take(common, READY_TIMEOUT)?.unwrap_or(600)),
        round_grace: Duration::from_secs(take(common, ROUND_GRACE)?.unwrap_or(120)),
        backoff,
    })
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

/// removes a setting so it is not forwarded to the drivers
fn take<T: FromStr>(common: &mut Properties, key: &str) -> Result<Option<T>, ConfigError> {
    common
        .remove(key)
        .map(|value| parse_value(key, &value))
        .transpose()
}

fn required<T: FromStr>(common: &Properties, key: &'static str) -> Result<T, ConfigError> {
    let value = common.get(key).ok_or(ConfigError::Missing(key))?;
    parse_value(key, value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const EXAMPLE: &str = "\
exe=bg
datastore=Foo
workloadfile=workloads/SymmetricHighUpdateActions
loadworkloadfile=workloads/populateDB
ratingunit=30
finalexecutiontime=600
expectedlatency=0.1
expectedconfidence=95
expectedstaleness=0.01
threadcount=4
ratingtype=soar
monitor=10
// listeners
#clientinfo
ip=10.0.0.10
port=10655
usercount=1000
useroffset=0

#clientinfo
ip=10.0.0.11
port=10655
usercount=1000
useroffset=1000
schema:x=1
load:y=2
benchmark:datastore=Bar
numclients=2
";

    #[test]
    fn example_config() {
        let conf = Config::parse(EXAMPLE).unwrap();
        assert_eq!(conf.nodes.len(), 2);
        assert_eq!(conf.nodes[1].label(), "10.0.0.11:10655");
        assert_eq!(conf.nodes[1].user_offset, 1000);

        assert_eq!(conf.settings.initial_thread_count, 4);
        assert_eq!(conf.settings.strategy, Strategy::ThroughputHillClimb);
        assert_eq!(conf.settings.monitor, 10);
        assert_eq!(conf.settings.rating_unit, 30);
        assert_eq!(conf.settings.load_threads, 10);

        assert_eq!(conf.props.schema["x"], "1");
        assert_eq!(conf.props.load["y"], "2");
        assert_eq!(conf.datastore(), "Bar");
        // settings are not forwarded, SLA and durations are
        assert!(!conf.props.common.contains_key("threadcount"));
        assert!(!conf.props.common.contains_key("numclients"));
        assert!(conf.props.common.contains_key("expectedlatency"));
        assert_eq!(conf.sla.confidence, 95.0);
        assert_eq!(conf.sla.latency.as_deref(), Some("0.1"));
    }

    #[test]
    fn node_count_must_match() {
        let text = EXAMPLE.replace("numclients=2", "numclients=3");
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::NodeCount {
                declared: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn incomplete_client_info() {
        let text = EXAMPLE.replace("useroffset=1000", "");
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::ClientInfo {
                missing: "useroffset",
                ..
            })
        ));
    }

    #[test]
    fn required_properties() {
        let text = EXAMPLE.replace("workloadfile=workloads/SymmetricHighUpdateActions\n", "");
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::Missing(WORKLOAD_FILE))
        ));
    }

    #[test]
    fn sla() {
        let sla = Sla {
            latency: None,
            confidence: 0.95,
            staleness: 0.05,
        };
        assert!(sla.satisfied(0.97, 0.02));
        assert!(sla.satisfied(0.95, 0.05));
        assert!(!sla.satisfied(0.80, 0.10));
        assert!(!sla.satisfied(0.99, 0.06));
    }
}
