use protocol::properties::{self, Properties};
use protocol::{is_population, Token, END_OF_MESSAGE, ONETIME, REPEATED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// fresh driver process for this request only
    OneTime,
    /// driver process kept alive between requests
    Repeated,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::OneTime => ONETIME,
            Mode::Repeated => REPEATED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Populate,
    Simulate,
}

/// A driver invocation as sent by the coordinator: the executable (which may
/// span several words, think `java -cp .. Main`), the mode word and the
/// remaining arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCommand {
    pub exe: Vec<String>,
    pub mode: Mode,
    pub phase: Phase,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Shutdown,
    Driver(DriverCommand),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Request names no driver mode, expected {ONETIME} or {REPEATED}")]
    NoMode,
    #[error("Request names no driver executable")]
    NoExe,
}

impl Request {
    pub fn parse(message: &str) -> Result<Self, ParseError> {
        let words: Vec<&str> = message.split_whitespace().collect();
        if words.iter().any(|w| *w == Token::Shutdown.as_str()) {
            return Ok(Request::Shutdown);
        }

        let (mode_idx, mode) = words
            .iter()
            .enumerate()
            .find_map(|(idx, word)| match *word {
                ONETIME => Some((idx, Mode::OneTime)),
                REPEATED => Some((idx, Mode::Repeated)),
                _ => None,
            })
            .ok_or(ParseError::NoMode)?;
        if mode_idx == 0 {
            return Err(ParseError::NoExe);
        }

        let args: Vec<String> = words[mode_idx + 1..]
            .iter()
            .filter(|w| **w != END_OF_MESSAGE)
            .map(|w| w.to_string())
            .collect();
        let phase = if is_population(&args) {
            Phase::Populate
        } else {
            Phase::Simulate
        };

        Ok(Request::Driver(DriverCommand {
            exe: words[..mode_idx].iter().map(|w| w.to_string()).collect(),
            mode,
            phase,
            args,
        }))
    }
}

impl DriverCommand {
    fn words(&self) -> impl Iterator<Item = String> + '_ {
        self.exe
            .iter()
            .cloned()
            .chain(Some(self.mode.as_str().to_owned()))
            .chain(self.args.iter().cloned())
    }

    /// Command line for a driver that serves this request and then exits.
    /// Simulations get a private port to talk to the listener on.
    pub fn one_shot_argv(&self, port: Option<u16>, extra: &Properties) -> Vec<String> {
        let mut argv: Vec<String> = self.words().collect();
        if let Some(port) = port {
            argv.push("-p".to_owned());
            argv.push(format!("port={port}"));
        }
        argv.extend(properties::as_driver_args(extra));
        argv
    }

    /// Command line that starts a long lived driver listening on `port`
    pub fn persistent_argv(&self, port: u16) -> Vec<String> {
        let mut argv = self.exe.clone();
        argv.push(REPEATED.to_owned());
        argv.push(port.to_string());
        argv
    }

    /// The request as forwarded over the socket of a running driver
    pub fn forwarded(&self, port: u16, extra: &Properties) -> String {
        let mut words: Vec<String> = self.words().collect();
        words.push("-p".to_owned());
        words.push(format!("port={port}"));
        words.extend(properties::as_driver_args(extra));
        words.push(END_OF_MESSAGE.to_owned());
        words.join(" ")
    }
}
