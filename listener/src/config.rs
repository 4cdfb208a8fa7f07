use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use protocol::connection::Backoff;
use protocol::properties::{self, Line, Properties};

const PORT: &str = "port";
const READY_TIMEOUT: &str = "readytimeout";

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
    #[error("No control port configured, add a line port=<number>")]
    MissingPort,
    #[error("Value {value:?} for {key} is not valid")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// control port the coordinator connects to, 0 lets the OS pick one
    pub port: u16,
    /// bound on every wait for a driver to become ready
    pub ready_timeout: Duration,
    pub backoff: Backoff,
    /// appended to every driver command as `-p key=value`
    pub extra: Properties,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut port = None;
        let mut ready_timeout = Duration::from_secs(600);
        let mut extra = Properties::new();

        for (idx, line) in text.lines().enumerate() {
            let (key, value) = match properties::parse_line(line) {
                Line::Blank => continue,
                Line::Pair { key, value } => (key, value),
                Line::Malformed => {
                    return Err(ConfigError::Malformed {
                        line_no: idx + 1,
                        line: line.to_owned(),
                    })
                }
            };

            match key {
                PORT => port = Some(parse_value(PORT, value)?),
                READY_TIMEOUT => {
                    ready_timeout = Duration::from_secs(parse_value(READY_TIMEOUT, value)?)
                }
                _ => {
                    extra.insert(key.to_owned(), value.to_owned());
                }
            }
        }

        Ok(Self {
            port: port.ok_or(ConfigError::MissingPort)?,
            ready_timeout,
            backoff: Backoff::default(),
            extra,
        })
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_and_extras() {
        let conf = Config::parse(
            "port=10655\n\n// connection to the store\ndb.url=jdbc:mysql://10.0.0.2/bg?x=1\nreadytimeout=30\n",
        )
        .unwrap();
        assert_eq!(conf.port, 10655);
        assert_eq!(conf.ready_timeout, Duration::from_secs(30));
        assert_eq!(conf.extra.len(), 1);
        assert_eq!(conf.extra["db.url"], "jdbc:mysql://10.0.0.2/bg?x=1");
    }

    #[test]
    fn port_is_required() {
        assert!(matches!(
            Config::parse("db.user=bg"),
            Err(ConfigError::MissingPort)
        ));
        assert!(matches!(
            Config::parse("port=http"),
            Err(ConfigError::InvalidValue { key: "port", .. })
        ));
    }

    #[test]
    fn reads_from_disk() {
        let dir = mktemp::Temp::new_dir().unwrap();
        let path = dir.join("listener.conf");
        fs::write(&path, "port=0\n").unwrap();
        let conf = Config::from_file(&path).unwrap();
        assert_eq!(conf.port, 0);
        assert!(conf.extra.is_empty());
    }
}
