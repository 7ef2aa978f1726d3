//! Miner watchdog: reconciles the miner process with the desired state and
//! polls its summary telemetry on a timer.
//!
//! All state lives in one [`Supervisor`] owned by a single task. Timer ticks and
//! control requests are handled strictly one after another, so a tick (and any
//! reconciliation it triggers) always completes before the next one starts.

use crate::events::{Event, EventBus};
use crate::link::{LaunchError, MinerLink};
use crate::telemetry::{SummaryPoint, FLOOR_RATE};
use crate::wire::{
    self, Command, DevicesReply, Reply, StatusKind, StatusReply, SummaryReply, WireError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Polling interval while a stop is in progress.
pub const STOPPING_PERIOD: Duration = Duration::from_secs(3);

/// Shutdown requests sent before the miner is killed outright.
pub const MAX_POLITE_STOP_ATTEMPTS: u32 = 3;

/// Device whose intensity is read and written.
pub const CANONICAL_DEVICE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Unknown,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Unknown,
    Connected,
    Disconnected,
}

/// The three polling intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub steady: Duration,
    /// Half the steady period: quick enough to notice the miner coming up,
    /// slow enough not to relaunch it while it is still starting.
    pub starting: Duration,
    pub stopping: Duration,
}

impl Cadence {
    pub fn from_period(period: Duration) -> Self {
        Self { steady: period, starting: period / 2, stopping: STOPPING_PERIOD }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub desired: DesiredState,
    pub connectivity: Connectivity,
    pub interval_secs: f64,
    pub quiesced: bool,
    pub halted: bool,
    pub stop_attempts: u32,
    pub visible: bool,
}

pub struct Supervisor<L: MinerLink> {
    link: L,
    events: EventBus,
    cadence: Cadence,
    interval: Duration,
    desired: DesiredState,
    connectivity: Connectivity,
    visible: bool,
    stop_attempts: u32,
    quiesced: bool,
    halted: bool,
    /// Set by a launch; the run loop restarts the timer so the miner gets a full period.
    warming_up: bool,
}

impl<L: MinerLink> Supervisor<L> {
    pub fn new(link: L, events: EventBus, polling_period: Duration) -> Self {
        let cadence = Cadence::from_period(polling_period);
        Self {
            link,
            events,
            cadence,
            interval: cadence.starting,
            desired: DesiredState::Unknown,
            connectivity: Connectivity::Unknown,
            visible: false,
            stop_attempts: 0,
            quiesced: true,
            halted: false,
            warming_up: false,
        }
    }

    pub fn desired_state(&self) -> DesiredState {
        self.desired
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn stop_attempts(&self) -> u32 {
        self.stop_attempts
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced
    }

    /// The timer stops for good after a launch failure that needs the operator.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            desired: self.desired,
            connectivity: self.connectivity,
            interval_secs: self.interval.as_secs_f64(),
            quiesced: self.quiesced,
            halted: self.halted,
            stop_attempts: self.stop_attempts,
            visible: self.visible,
        }
    }

    pub fn is_important_process_running(&self) -> bool {
        self.link.is_important_process_running()
    }

    pub async fn set_desired_state(&mut self, state: DesiredState) {
        info!("Desired miner state: {:?}", state);
        self.stop_attempts = 0;
        self.desired = state;
        self.reconcile().await;
    }

    /// One timer-driven watchdog tick.
    pub async fn on_tick(&mut self) {
        if self.quiesced {
            // no polling traffic while the miner is meant to be down
            self.events.emit(Event::Summary { point: SummaryPoint::placeholder(Utc::now()) });
            if self.desired != DesiredState::Unknown {
                self.reconcile().await;
            }
            return;
        }

        self.poll().await;

        let running = self.link.is_miner_running();
        let mismatch = match self.desired {
            DesiredState::Running => !running,
            DesiredState::Stopped => running,
            DesiredState::Unknown => false,
        };
        if mismatch {
            debug!("Miner running={} but desired {:?}, reconciling", running, self.desired);
            self.reconcile().await;
        }
    }

    async fn poll(&mut self) {
        let payload = self.execute(&Command::summary()).await;
        let reply = wire::parse::<SummaryReply>(&payload);

        match &reply {
            Ok(summary) => match summary.status() {
                Some(status) if status.kind == StatusKind::Success => self.mark_connected(),
                Some(status) => {
                    self.mark_disconnected();
                    self.say(format!(
                        "Watchdog check received an unexpected status [{}] [{}]",
                        status.kind, status.message
                    ));
                }
                None => self.mark_disconnected(),
            },
            Err(WireError::Empty) => self.mark_disconnected(),
            Err(e) => {
                self.mark_disconnected();
                self.say(format!("Watchdog check could not read the summary: {}", e));
            }
        }

        let point = summarize(reply.ok().as_ref(), Utc::now());
        self.events.emit(Event::Summary { point });
    }

    async fn reconcile(&mut self) {
        match self.desired {
            DesiredState::Running => self.start().await,
            DesiredState::Stopped | DesiredState::Unknown => self.stop().await,
        }
    }

    async fn start(&mut self) {
        let mut launched = false;

        if !self.link.is_miner_running() {
            match self.link.launch(self.visible) {
                Ok(true) => {
                    launched = true;
                    self.warming_up = true;
                    self.say("Miner does not appear to be running - launching miner.");
                }
                Ok(false) => {}
                Err(e) => {
                    self.abandon(e).await;
                    return;
                }
            }
        } else {
            self.say("The miner appears to be running.");
        }

        self.quiesced = false;

        // a fresh miner gets a full period to come up; querying it early can spawn a duplicate
        if !launched {
            self.poll().await;
        }
    }

    /// Terminal launch failure: stop, and never tick again.
    async fn abandon(&mut self, e: LaunchError) {
        error!("Launch failed: {}", e);
        self.say(e.to_string());
        if matches!(e, LaunchError::MissingProgram(_) | LaunchError::Spawn { .. }) {
            self.say("Configure launch_command in the [miner] section of the config file.");
            self.say("It must point at the miner executable, started with its API enabled.");
            self.say("Restart this daemon after the updated configuration file has been saved.");
        }

        self.desired = DesiredState::Stopped;
        self.stop().await;
        self.halted = true;
        warn!("Watchdog halted; operator intervention required");
    }

    async fn stop(&mut self) {
        self.quiesced = true;
        self.mark_disconnected();

        if self.link.is_miner_running() {
            if self.stop_attempts >= MAX_POLITE_STOP_ATTEMPTS {
                self.say("Killing miner process...");
                self.link.kill();
            } else {
                self.stop_attempts += 1;
                self.execute(&Command::quit()).await;
                self.say(format!(
                    "Miner has been requested to shutdown [{}/{}].",
                    self.stop_attempts, MAX_POLITE_STOP_ATTEMPTS
                ));
            }
            self.set_interval(self.cadence.stopping);
        } else {
            self.stop_attempts = 0;
        }
    }

    pub async fn read_intensity(&mut self) -> Result<i32, WireError> {
        let payload = self.execute(&Command::devs()).await;
        let reply: DevicesReply = wire::parse(&payload)?;
        wire::expect_status(&reply, StatusKind::Success)?;
        reply.devices.first().map(|d| d.intensity).ok_or(WireError::NoDevices)
    }

    pub async fn write_intensity(&mut self, value: i32) -> Result<(), WireError> {
        let payload = self.execute(&Command::gpu_intensity(CANONICAL_DEVICE, value)).await;
        let reply: StatusReply = wire::parse(&payload)?;
        if let Err(e) = wire::expect_status(&reply, StatusKind::Informational) {
            let (kind, message) = match &e {
                WireError::Status { kind, message } => (*kind, message.as_str()),
                _ => (StatusKind::Unknown, ""),
            };
            self.say(format!(
                "Call to gpuintensity returned a status of [{}] [{}]",
                kind, message
            ));
            return Err(e);
        }
        Ok(())
    }

    pub async fn read_version(&mut self) -> Result<String, WireError> {
        let payload = self.execute(&Command::version()).await;
        let reply: StatusReply = wire::parse(&payload)?;
        reply.status().map(|s| s.description.clone()).ok_or(WireError::NoStatus)
    }

    async fn execute(&mut self, command: &Command) -> Vec<u8> {
        let exchange = self.link.execute(command).await;
        if let Some(fault) = exchange.fault {
            self.say(fault);
        }
        if exchange.connected {
            self.mark_connected();
        }
        exchange.payload
    }

    fn mark_connected(&mut self) {
        if self.connectivity != Connectivity::Connected {
            info!("Miner connected");
            self.connectivity = Connectivity::Connected;
            self.set_interval(self.cadence.steady);
            self.events.emit(Event::Connected);
        }
    }

    fn mark_disconnected(&mut self) {
        self.set_interval(self.cadence.starting);
        if self.connectivity != Connectivity::Disconnected {
            info!("Miner disconnected");
            self.connectivity = Connectivity::Disconnected;
            self.events.emit(Event::Disconnected);
        }
    }

    fn set_interval(&mut self, interval: Duration) {
        if self.interval != interval {
            debug!("Watchdog interval {:?} -> {:?}", self.interval, interval);
            self.interval = interval;
        }
    }

    fn say(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.events.message(text);
    }

    async fn handle(&mut self, control: Control) {
        match control {
            Control::SetDesiredState(state) => self.set_desired_state(state).await,
            Control::SetVisible(visible) => self.set_visible(visible),
            Control::ReadIntensity(reply) => {
                let _ = reply.send(self.read_intensity().await);
            }
            Control::WriteIntensity(value, reply) => {
                let _ = reply.send(self.write_intensity(value).await);
            }
            Control::ReadVersion(reply) => {
                let _ = reply.send(self.read_version().await);
            }
            Control::ImportantProcessRunning(reply) => {
                let _ = reply.send(self.is_important_process_running());
            }
            Control::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Drive the watchdog until every [`SupervisorHandle`] is dropped.
    ///
    /// Interval changes and launches re-arm the timer; after a halt only control requests are served.
    pub async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        let mut deadline = Instant::now() + self.interval;
        loop {
            let halted = self.halted;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline), if !halted => {
                    self.on_tick().await;
                    self.warming_up = false;
                    deadline = Instant::now() + self.interval;
                }
                request = control.recv() => {
                    let Some(request) = request else { break };
                    let before = self.interval;
                    self.handle(request).await;
                    let launched = std::mem::take(&mut self.warming_up);
                    if launched || self.interval != before {
                        deadline = Instant::now() + self.interval;
                    }
                }
            }
        }
        info!("Watchdog stopped");
    }
}

impl<L: MinerLink + 'static> Supervisor<L> {
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(rx));
        (SupervisorHandle { tx }, task)
    }
}

/// Aggregate a summary reply; `None` yields a placeholder.
pub fn summarize(reply: Option<&SummaryReply>, at: DateTime<Utc>) -> SummaryPoint {
    let Some(reply) = reply else {
        return SummaryPoint::placeholder(at);
    };
    let entries = &reply.summary;
    let mhs: f64 = entries.iter().map(|s| s.mhs_5s).sum();
    SummaryPoint {
        timestamp: at,
        kilohashes_5s: (mhs * 1000.0).max(FLOOR_RATE),
        hardware_errors: entries.iter().map(|s| s.hardware_errors).sum(),
        stale: entries.iter().map(|s| s.stale).sum(),
    }
}

pub enum Control {
    SetDesiredState(DesiredState),
    SetVisible(bool),
    ReadIntensity(oneshot::Sender<Result<i32, WireError>>),
    WriteIntensity(i32, oneshot::Sender<Result<(), WireError>>),
    ReadVersion(oneshot::Sender<Result<String, WireError>>),
    ImportantProcessRunning(oneshot::Sender<bool>),
    Status(oneshot::Sender<SupervisorStatus>),
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("watchdog is no longer running")]
    Gone,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Cloneable front door to a spawned [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Control>,
}

impl SupervisorHandle {
    async fn send(&self, control: Control) -> Result<(), HandleError> {
        self.tx.send(control).await.map_err(|_| HandleError::Gone)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Control) -> Result<T, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| HandleError::Gone)
    }

    pub async fn set_desired_state(&self, state: DesiredState) -> Result<(), HandleError> {
        self.send(Control::SetDesiredState(state)).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), HandleError> {
        self.send(Control::SetVisible(visible)).await
    }

    pub async fn read_intensity(&self) -> Result<i32, HandleError> {
        Ok(self.ask(Control::ReadIntensity).await??)
    }

    pub async fn write_intensity(&self, value: i32) -> Result<(), HandleError> {
        Ok(self.ask(|tx| Control::WriteIntensity(value, tx)).await??)
    }

    pub async fn read_version(&self) -> Result<String, HandleError> {
        Ok(self.ask(Control::ReadVersion).await??)
    }

    pub async fn is_important_process_running(&self) -> Result<bool, HandleError> {
        self.ask(Control::ImportantProcessRunning).await
    }

    pub async fn status(&self) -> Result<SupervisorStatus, HandleError> {
        self.ask(Control::Status).await
    }
}
