// shared by several test binaries, each uses a part
#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use listener::Listener;
use protocol::connection::{Backoff, Channel};
use protocol::properties::Properties;
use protocol::Token;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const MOCK_DRIVER: &str = env!("CARGO_BIN_EXE_mock-driver");
pub const LIMIT: Duration = Duration::from_secs(20);

pub fn setup_tracing() {
    use tracing_subscriber::{filter, fmt, prelude::*};

    let filter = filter::EnvFilter::builder()
        .parse("info,listener=debug,coordinator=debug")
        .unwrap();
    let fmt = fmt::layer()
        .pretty()
        .with_line_number(true)
        .with_test_writer();

    let _ignore_err = tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init();
}

/// Starts a listener on a port picked by the OS and returns that port
pub async fn start_listener(extra: &[(&str, &str)]) -> u16 {
    let extra: Properties = extra
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let conf = listener::Config {
        port: 0,
        ready_timeout: Duration::from_secs(10),
        backoff: Backoff::default(),
        extra,
    };
    let listener = Listener::bind(conf).await.unwrap();
    let port = listener.port();
    tokio::spawn(listener.run());
    port
}

pub async fn connect(port: u16) -> Channel {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    Channel::wrap(stream)
}

/// Reads words until `last` arrives, `last` included
pub async fn read_until(channel: &mut Channel, last: &[Token]) -> Vec<String> {
    let read = async {
        let mut words = Vec::new();
        while let Some(word) = channel.reader.next().await {
            let word = word.unwrap();
            let done = last.iter().any(|t| t.as_str() == word);
            words.push(word);
            if done {
                return words;
            }
        }
        panic!("connection closed, got: {words:?}");
    };
    timeout(LIMIT, read).await.unwrap()
}

/// Sends a simulation message and runs the round to its end
pub async fn round(port: u16, message: &str) -> Vec<String> {
    let mut channel = connect(port).await;
    channel.writer.send(message).await.unwrap();
    read_until(&mut channel, &[Token::Connected]).await;
    channel.writer.send(Token::StartSimulation).await.unwrap();
    read_until(&mut channel, &[Token::Done, Token::KillDone]).await
}

pub fn simulation(mode: &str, props: &str) -> String {
    format!("{MOCK_DRIVER} {mode} -t -P workloads/run -s -p threadcount=4 -p maxexecutiontime=1 -p mocktick=20 {props} #")
}
