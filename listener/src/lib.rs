use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use color_eyre::eyre::{Result, WrapErr};
use protocol::connection::{read_message, Channel};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

pub mod config;
mod driver;
mod relay;
pub mod request;
mod session;

pub use config::{Config, ConfigError};
use driver::Driver;
use relay::RoundEnd;
use request::{DriverCommand, Mode, Phase, Request};

pub struct Listener {
    conf: Config,
    socket: TcpListener,
    port: u16,
    /// driver kept alive between rounds
    persistent: Option<Driver>,
}

impl Listener {
    pub async fn bind(conf: Config) -> Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), conf.port);
        let socket = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("Could not bind to address: {addr}"))?;
        let port = socket.local_addr()?.port();
        Ok(Self {
            conf,
            socket,
            port,
            persistent: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serves coordinator connections one after the other, forever. A failed
    /// session is logged and its connection dropped.
    #[instrument(skip_all, fields(port = self.port))]
    pub async fn run(mut self) -> Result<()> {
        info!("waiting for coordinator connections");
        loop {
            let (stream, peer) = self
                .socket
                .accept()
                .await
                .wrap_err("Could not accept coordinator connection")?;
            info!("connection from {peer}");
            let channel = Channel::wrap(stream);
            if let Err(e) = self.serve(channel).await {
                warn!("session with {peer} failed: {e:?}");
            }
        }
    }

    async fn serve(&mut self, mut coord: Channel) -> Result<()> {
        let message = match read_message(&mut coord.reader).await? {
            Some(message) => message,
            None => {
                debug!("coordinator left without a request");
                return Ok(());
            }
        };
        debug!("request: {message}");

        let cmd = match Request::parse(&message).wrap_err("Malformed request")? {
            Request::Shutdown => return self.shutdown_persistent().await,
            Request::Driver(cmd) => cmd,
        };

        match cmd.mode {
            Mode::OneTime => {
                // a one time driver may need the resources the long lived one holds
                self.shutdown_persistent().await?;
                match cmd.phase {
                    Phase::Populate => session::populate_once(&cmd, &self.conf, &mut coord).await,
                    Phase::Simulate => session::simulate_once(&cmd, &self.conf, &mut coord).await,
                }
            }
            Mode::Repeated => self.serve_persistent(&cmd, &mut coord).await,
        }
    }

    /// The driver is only put back after a request it finished normally. A
    /// killed or failed driver is torn down and the next request starts a
    /// new one.
    async fn serve_persistent(&mut self, cmd: &DriverCommand, coord: &mut Channel) -> Result<()> {
        let mut driver = match self.persistent.take() {
            Some(driver) => driver,
            None => session::start_persistent(cmd, &self.conf).await?,
        };

        match cmd.phase {
            Phase::Populate => {
                session::populate_persistent(&mut driver, cmd, &self.conf, coord).await?;
                self.persistent = Some(driver);
            }
            Phase::Simulate => {
                let end = session::simulate_persistent(&mut driver, cmd, &self.conf, coord).await?;
                match end {
                    RoundEnd::Completed(_) => self.persistent = Some(driver),
                    RoundEnd::Killed => driver.terminate().await,
                }
                relay::report(&mut coord.writer, end).await?;
            }
        }
        Ok(())
    }

    async fn shutdown_persistent(&mut self) -> Result<()> {
        match self.persistent.take() {
            Some(driver) => session::shutdown_persistent(driver, &self.conf).await,
            None => {
                debug!("no persistent driver to shut down");
                Ok(())
            }
        }
    }
}
