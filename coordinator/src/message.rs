use itertools::Itertools;
use protocol::properties::Properties;
use protocol::{END_OF_MESSAGE, ONETIME};

use crate::config::{BG_MODE, DATASTORE, EXE, LOAD_WORKLOAD_FILE, WORKLOAD_FILE};
use crate::round::RoundRequest;

/// Never forwarded as is, the builder computes these for every message
const EXCLUDED: [&str; 17] = [
    EXE,
    "loadexe",
    WORKLOAD_FILE,
    LOAD_WORKLOAD_FILE,
    "threadcount",
    BG_MODE,
    "finalexecutiontime",
    "ratingunit",
    "maxexecutiontime",
    "monitor",
    "ratingmode",
    "machineid",
    "usercount",
    "useroffset",
    "probs",
    "numclients",
    "port",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Property {0} is required to build this message")]
    Missing(&'static str),
}

/// Where a node sits in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub machine_id: usize,
    pub node_count: usize,
    pub user_count: u64,
    pub user_offset: u64,
}

impl Placement {
    /// every node gets an equal share of the work: `1/n` per node, each
    /// terminated by `@`
    fn probabilities(&self) -> String {
        let share = 1.0 / self.node_count as f64;
        (0..self.node_count).map(|_| format!("{share:?}@")).collect()
    }

    fn properties(&self) -> String {
        format!(
            "-p usercount={} -p probs={} -p numclients={}",
            self.user_count,
            self.probabilities(),
            self.node_count
        )
    }
}

fn require<'a>(props: &'a Properties, key: &'static str) -> Result<&'a str, MessageError> {
    props
        .get(key)
        .map(String::as_str)
        .ok_or(MessageError::Missing(key))
}

fn merged(common: &Properties, phase: &Properties) -> Properties {
    let mut merged = common.clone();
    merged.extend(phase.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// `-db <store>` followed by every forwarded property
fn pass_through(props: &Properties) -> String {
    let db = props.get(DATASTORE).map(|db| format!("-db {db}"));
    let rest = props
        .iter()
        .filter(|(key, _)| key.as_str() != DATASTORE && !EXCLUDED.contains(&key.as_str()))
        .map(|(key, value)| format!("-p {key}={value}"));
    db.into_iter().chain(rest).join(" ")
}

fn words<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().filter(|p| !p.is_empty()).join(" ")
}

/// The command creating the schema. The coordinator runs it locally, it
/// carries no end of message marker.
pub fn schema_message(common: &Properties, schema: &Properties) -> Result<String, MessageError> {
    let props = merged(common, schema);
    require(&props, DATASTORE)?;
    let exe = props.get(EXE).map(String::as_str).unwrap_or_default();
    Ok(words([
        exe,
        ONETIME,
        "-schema -p ratingmode=false",
        pass_through(&props).as_str(),
    ]))
}

pub fn load_message(
    placement: &Placement,
    common: &Properties,
    load: &Properties,
    load_threads: u32,
) -> Result<String, MessageError> {
    let props = merged(common, load);
    let exe = require(&props, EXE)?;
    let file = require(&props, LOAD_WORKLOAD_FILE)?;
    Ok(words([
        exe,
        ONETIME,
        "-loadindex -P",
        file,
        format!("-p machineid={} -p ratingmode=false", placement.machine_id).as_str(),
        pass_through(&props).as_str(),
        placement.properties().as_str(),
        format!("-p threadcount={load_threads}").as_str(),
        format!("-p useroffset={}", placement.user_offset).as_str(),
        END_OF_MESSAGE,
    ]))
}

pub fn simulation_message(
    placement: &Placement,
    request: &RoundRequest,
    common: &Properties,
    benchmark: &Properties,
) -> Result<String, MessageError> {
    let props = merged(common, benchmark);
    let exe = require(&props, EXE)?;
    let file = require(&props, WORKLOAD_FILE)?;
    let mode = props
        .get(BG_MODE)
        .map(String::as_str)
        .unwrap_or(protocol::REPEATED);
    Ok(words([
        exe,
        mode,
        "-t -P",
        file,
        format!(
            "-s -p machineid={} -p threadcount={}",
            placement.machine_id, request.thread_count_for_node
        )
        .as_str(),
        pass_through(&props).as_str(),
        format!(
            "-p maxexecutiontime={} -p monitor={} -p ratingmode=true",
            request.round_duration_secs, request.monitoring_interval_secs
        )
        .as_str(),
        placement.properties().as_str(),
        format!("-p useroffset={}", placement.user_offset).as_str(),
        END_OF_MESSAGE,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn placement() -> Placement {
        Placement {
            machine_id: 1,
            node_count: 2,
            user_count: 1000,
            user_offset: 500,
        }
    }

    fn request() -> RoundRequest {
        RoundRequest {
            thread_count_for_node: 7,
            total_thread_count: 13,
            node_share: 0.5,
            round_duration_secs: 30,
            monitoring_interval_secs: 10,
            is_final_round: false,
        }
    }

    #[test]
    fn schema_message_scenario() {
        let common = props(&[("datastore", "Foo"), ("x", "1")]);
        let schema = props(&[("y", "2")]);
        let msg = schema_message(&common, &schema).unwrap();

        assert_eq!(msg, "onetime -schema -p ratingmode=false -db Foo -p x=1 -p y=2");
        assert!(!msg.contains("threadcount"));
        assert!(!msg.contains("workloadfile"));
    }

    #[test]
    fn schema_overrides_common() {
        let common = props(&[("exe", "bg"), ("datastore", "Foo"), ("x", "1")]);
        let schema = props(&[("x", "2"), ("datastore", "Bar")]);
        let msg = schema_message(&common, &schema).unwrap();
        assert_eq!(msg, "bg onetime -schema -p ratingmode=false -db Bar -p x=2");
        assert_eq!(
            schema_message(&props(&[("x", "1")]), &schema),
            Ok("onetime -schema -p ratingmode=false -db Bar -p x=2".to_owned())
        );
        assert_eq!(
            schema_message(&props(&[("x", "1")]), &Properties::new()),
            Err(MessageError::Missing(DATASTORE))
        );
    }

    #[test]
    fn load_message_carries_placement() {
        let common = props(&[
            ("exe", "bg"),
            ("loadworkloadfile", "populate"),
            ("workloadfile", "run"),
            ("datastore", "Foo"),
        ]);
        let msg = load_message(&placement(), &common, &props(&[("z", "3")]), 10).unwrap();
        assert_eq!(
            msg,
            "bg onetime -loadindex -P populate -p machineid=1 -p ratingmode=false \
             -db Foo -p z=3 -p usercount=1000 -p probs=0.5@0.5@ -p numclients=2 \
             -p threadcount=10 -p useroffset=500 #"
        );
    }

    #[test]
    fn simulation_message_replaces_computed_keys() {
        let common = props(&[
            ("exe", "bg"),
            ("workloadfile", "run"),
            ("loadworkloadfile", "populate"),
            ("datastore", "Foo"),
            ("threadcount", "99"),
            ("ratingunit", "30"),
            ("finalexecutiontime", "600"),
            ("monitor", "99"),
            ("expectedconfidence", "95"),
        ]);
        let benchmark = props(&[("bgmode", "onetime")]);
        let msg = simulation_message(&placement(), &request(), &common, &benchmark).unwrap();
        assert_eq!(
            msg,
            "bg onetime -t -P run -s -p machineid=1 -p threadcount=7 -db Foo \
             -p expectedconfidence=95 -p maxexecutiontime=30 -p monitor=10 \
             -p ratingmode=true -p usercount=1000 -p probs=0.5@0.5@ -p numclients=2 \
             -p useroffset=500 #"
        );
    }

    #[test]
    fn simulation_rendering_is_idempotent() {
        let common = props(&[
            ("exe", "java -cp bg.jar BGMainClass"),
            ("workloadfile", "run"),
            ("datastore", "Foo"),
            ("b", "2"),
            ("a", "1"),
        ]);
        let first = simulation_message(&placement(), &request(), &common, &Properties::new());
        let second = simulation_message(&placement(), &request(), &common, &Properties::new());
        assert_eq!(first, second);

        let msg = first.unwrap();
        assert!(msg.starts_with("java -cp bg.jar BGMainClass repeated -t"));
        assert!(msg.contains("-p a=1 -p b=2"));
    }

    #[test]
    fn probabilities_for_three() {
        let placement = Placement {
            node_count: 3,
            ..placement()
        };
        assert_eq!(
            placement.probabilities(),
            "0.3333333333333333@0.3333333333333333@0.3333333333333333@"
        );
    }
}
