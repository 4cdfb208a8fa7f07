use std::fmt;

pub mod connection;
mod metric;
pub mod properties;

pub use metric::{Metric, MetricLine, MonitorTriple};

/// Closes every command sent to a listener or driver
pub const END_OF_MESSAGE: &str = "#";
/// Closes the statistics a driver sends back over its socket after a round
pub const END_OF_STATS: &str = "THEEND.";

/// Driver lifecycle modes as they appear in a command message
pub const ONETIME: &str = "onetime";
pub const REPEATED: &str = "repeated";

/// Driver flags that mark a command as populating the data store
pub const POPULATE_FLAGS: [&str; 3] = ["-schema", "-loadindex", "-load"];

pub fn is_population<S: AsRef<str>>(args: &[S]) -> bool {
    args.iter().any(|a| POPULATE_FLAGS.contains(&a.as_ref()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    EndOfMessage,
    EndOfStats,
    /// driver process is up
    Started,
    /// driver socket is listening
    Initiated,
    /// driver is reachable and waiting for the start signal
    Connected,
    StartSimulation,
    Kill,
    Shutdown,
    Done,
    KillDone,
    LoadingCompleted,
    ExecutionDone,
    Bye,
}

impl Token {
    pub const ALL: [Token; 13] = [
        Token::EndOfMessage,
        Token::EndOfStats,
        Token::Started,
        Token::Initiated,
        Token::Connected,
        Token::StartSimulation,
        Token::Kill,
        Token::Shutdown,
        Token::Done,
        Token::KillDone,
        Token::LoadingCompleted,
        Token::ExecutionDone,
        Token::Bye,
    ];

    pub fn as_str(self) -> &'static str {
        use Token::*;
        match self {
            EndOfMessage => END_OF_MESSAGE,
            EndOfStats => END_OF_STATS,
            Started => "Started",
            Initiated => "Initiated",
            Connected => "Connected",
            StartSimulation => "StartSimulation",
            Kill => "KILL",
            Shutdown => "shutdown",
            Done => "DONE",
            KillDone => "KILLDONE",
            LoadingCompleted => "LoadingCompleted",
            ExecutionDone => "EXECUTIONDONE",
            Bye => "Bye!",
        }
    }

    /// exact, case sensitive match
    pub fn parse(word: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == word)
    }

    /// true if `line` (a full line of driver console output) is this token
    pub fn is_line(self, line: &str) -> bool {
        match self {
            // the driver may print its farewell with some decoration
            Token::Bye => line.contains(self.as_str()),
            _ => line.trim() == self.as_str(),
        }
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single token or console line turned out to be. Anything the
/// protocol does not know ends up as `Other` so callers can skip the
/// diagnostics a driver interleaves with its output.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<'a> {
    Token(Token),
    Metric(MetricLine),
    Other(&'a str),
}

pub fn classify(input: &str) -> Event<'_> {
    let input = input.trim();
    if let Some(token) = Token::parse(input) {
        return Event::Token(token);
    }
    match MetricLine::parse(input) {
        Some(line) => Event::Metric(line),
        None => Event::Other(input),
    }
}
