//! Miner API client: one TCP exchange per command, plus process control by name

use crate::collector::{LinuxProcessCollector, ProcessCollector};
use crate::config::Config;
use crate::executor;
use crate::wire::Command;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Launches allowed without a successful exchange in between.
pub const MAX_CONSECUTIVE_LAUNCHES: u32 = 20;

/// Outcome of one command. Failures leave `payload` empty.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub payload: Vec<u8>,
    /// Set only on the first success after a failure (never for `quit`).
    pub connected: bool,
    /// Diagnostic for failures worth surfacing; plain socket failures stay quiet.
    pub fault: Option<String>,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),
    #[error("timed out connecting to {address} after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LinkError {
    /// Refused/unreachable endpoints are routine while the miner is down.
    pub fn is_routine(&self) -> bool {
        matches!(self, LinkError::Connect(_))
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Unable to perform launch command: {}", .0.display())]
    MissingProgram(PathBuf),
    #[error(
        "Maximum consecutive launches [{0}] reached. There appears to be a problem that requires manual intervention. Correct the issue and then restart this daemon to continue - no further action will automatically occur."
    )]
    TooManyLaunches(u32),
    #[error("Failed to start {}: {source}", path.display())]
    Spawn { path: PathBuf, source: io::Error },
}

/// Everything the supervisor needs from the outside world.
#[async_trait::async_trait]
pub trait MinerLink: Send {
    async fn execute(&mut self, command: &Command) -> Exchange;

    fn is_miner_running(&self) -> bool;

    fn is_important_process_running(&self) -> bool;

    /// `Ok(false)` when the miner is already running.
    fn launch(&mut self, visible: bool) -> Result<bool, LaunchError>;

    fn kill(&mut self);
}

pub struct TcpMinerLink<C: ProcessCollector = LinuxProcessCollector> {
    address: String,
    process_name: String,
    launch_command: PathBuf,
    important: Vec<String>,
    collector: C,
    consecutive_launches: u32,
    known_connected: bool,
}

impl TcpMinerLink<LinuxProcessCollector> {
    pub fn new(
        address: impl Into<String>,
        process_name: impl Into<String>,
        launch_command: impl Into<PathBuf>,
        important: Vec<String>,
    ) -> Self {
        Self {
            address: address.into(),
            process_name: process_name.into(),
            launch_command: launch_command.into(),
            important,
            collector: LinuxProcessCollector::new(),
            consecutive_launches: 0,
            known_connected: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            format!("{}:{}", config.miner.api_host, config.miner.api_port),
            config.miner.process_name.clone(),
            config.miner.launch_command.clone(),
            config.important.process_names.clone(),
        )
    }
}

impl<C: ProcessCollector> TcpMinerLink<C> {
    pub fn with_collector<D: ProcessCollector>(self, collector: D) -> TcpMinerLink<D> {
        TcpMinerLink {
            address: self.address,
            process_name: self.process_name,
            launch_command: self.launch_command,
            important: self.important,
            collector,
            consecutive_launches: self.consecutive_launches,
            known_connected: self.known_connected,
        }
    }

    pub fn consecutive_launches(&self) -> u32 {
        self.consecutive_launches
    }

    /// Connect, send, then read until the peer closes. No read timeout.
    async fn exchange(&self, command: &Command) -> Result<Vec<u8>, LinkError> {
        let request = command.to_bytes()?;

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| LinkError::ConnectTimeout {
                address: self.address.clone(),
                timeout: CONNECT_TIMEOUT,
            })?
            .map_err(LinkError::Connect)?;

        stream.write_all(&request).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(response)
    }
}

#[async_trait::async_trait]
impl<C: ProcessCollector + 'static> MinerLink for TcpMinerLink<C> {
    async fn execute(&mut self, command: &Command) -> Exchange {
        match self.exchange(command).await {
            Ok(payload) => {
                let mut connected = false;
                if !command.is_quit() {
                    self.consecutive_launches = 0;
                    if !self.known_connected {
                        info!("Miner API reachable at {}", self.address);
                        connected = true;
                    }
                    self.known_connected = true;
                }
                Exchange { payload, connected, fault: None }
            }
            Err(e) => {
                self.known_connected = false;
                let fault = if e.is_routine() {
                    debug!("{} failed: {}", command.command, e);
                    None
                } else {
                    warn!("{} failed: {}", command.command, e);
                    Some(format!("Unexpected error executing [{}]: {}", command.command, e))
                };
                Exchange { payload: Vec::new(), connected: false, fault }
            }
        }
    }

    fn is_miner_running(&self) -> bool {
        !self.collector.find_by_name(&self.process_name).is_empty()
    }

    fn is_important_process_running(&self) -> bool {
        self.collector.any_running(&self.important)
    }

    fn launch(&mut self, visible: bool) -> Result<bool, LaunchError> {
        if self.is_miner_running() {
            return Ok(false);
        }
        if !self.launch_command.is_file() {
            return Err(LaunchError::MissingProgram(self.launch_command.clone()));
        }
        if self.consecutive_launches >= MAX_CONSECUTIVE_LAUNCHES {
            return Err(LaunchError::TooManyLaunches(MAX_CONSECUTIVE_LAUNCHES));
        }

        self.consecutive_launches += 1;
        let pid = executor::launch(&self.launch_command, visible).map_err(|source| {
            LaunchError::Spawn { path: self.launch_command.clone(), source }
        })?;
        info!(
            "Launched {:?} as pid {} ({}/{})",
            self.launch_command, pid, self.consecutive_launches, MAX_CONSECUTIVE_LAUNCHES
        );
        Ok(true)
    }

    fn kill(&mut self) {
        self.consecutive_launches = 0;
        for process in self.collector.find_by_name(&self.process_name) {
            match executor::kill(process.pid) {
                Ok(()) => info!("Killed {} (pid {})", process.name, process.pid),
                Err(e) => warn!("Failed to kill {} (pid {}): {}", process.name, process.pid, e),
            }
        }
    }
}
