use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::{ExitStatus, Stdio};

use color_eyre::eyre::{eyre, Result, WrapErr};
use color_eyre::Help;
use futures::StreamExt;
use protocol::connection::{Backoff, Channel};
use protocol::Token;
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, instrument};

/// console lines longer than this are an error, not something to buffer
const MAX_LINE_LEN: usize = 64 * 1024;

/// A running benchmark driver process. The process is killed when this is
/// dropped.
pub struct Driver {
    child: Child,
    stdout: FramedRead<ChildStdout, LinesCodec>,
    /// port the driver listens on for the listener
    pub port: u16,
}

impl Driver {
    #[instrument(skip(port))]
    pub fn spawn(argv: &[String], port: u16) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| eyre!("driver command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .wrap_err("Could not start driver")
            .with_note(|| format!("command: {}", argv.join(" ")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("driver stdout is not captured"))?;

        Ok(Self {
            child,
            stdout: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LEN)),
            port,
        })
    }

    /// Next line of console output, `None` once the driver closed stdout
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        match self.stdout.next().await {
            Some(line) => {
                let line = line.wrap_err("Could not read driver output")?;
                debug!("driver: {line}");
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }

    /// Skips console output until the line `token` shows up
    pub async fn wait_for(&mut self, token: Token) -> Result<()> {
        while let Some(line) = self.next_line().await? {
            if token.is_line(&line) {
                return Ok(());
            }
        }
        Err(eyre!("driver output ended before {token}"))
    }

    pub async fn connect(&self, backoff: &Backoff) -> Result<Channel> {
        let stream = backoff
            .connect(("127.0.0.1", self.port))
            .await
            .wrap_err("Could not connect to driver")
            .with_note(|| format!("driver port: {}", self.port))?;
        Ok(Channel::wrap(stream))
    }

    /// Reads output until the driver closes stdout
    pub async fn drain(&mut self) -> Result<()> {
        while self.next_line().await?.is_some() {}
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.wrap_err("Could not wait on driver")
    }

    pub async fn terminate(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("driver already gone: {e:?}");
        }
    }
}

/// Asks the OS for a port nobody is listening on. The port is free once this
/// returns, another process could still claim it before the driver does.
pub async fn free_port() -> Result<u16> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let socket = TcpListener::bind(addr)
        .await
        .wrap_err("Could not reserve a port for the driver")?;
    Ok(socket.local_addr()?.port())
}
