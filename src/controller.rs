//! Periodic polling of one device and the state published to consumers.
//!
//! A [`PollingController`] runs one cycle per interval against its
//! [`ConnectionSession`]. Cycles never overlap. The [`ControllerHandle`] it
//! hands out is the outward interface: a read-only [`PublishedState`]
//! snapshot, the charge/discharge switches and the connection switch.
//! Commands and poll cycles share the session through one async mutex.

use crate::config::PollConfig;
use crate::error::{DecodeError, Error, TransportError};
use crate::metrics::{DerivedMetrics, Sample, TrendTracker};
use crate::protocol::Command;
use crate::session::{ConnectionSession, DeviceRegistry};
use crate::transport::BleTransport;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

/// Terminal outcome of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollCycleResult {
    Success(Box<DerivedMetrics>),
    Timeout,
    DecodeError(DecodeError),
    TransportError(TransportError),
    Disabled,
}

impl From<Error> for PollCycleResult {
    fn from(err: Error) -> Self {
        match err {
            Error::Decode(err) => PollCycleResult::DecodeError(err),
            Error::Transport(err) => PollCycleResult::TransportError(err),
            Error::Timeout => PollCycleResult::Timeout,
            Error::Disabled => PollCycleResult::Disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Reading {
    /// No status frame was decoded yet.
    Unavailable,
    /// Metrics of the most recent cycle.
    Fresh(Box<DerivedMetrics>),
    /// Last known good metrics; later cycles failed.
    Stale(Box<DerivedMetrics>),
}

impl Reading {
    pub fn metrics(&self) -> Option<&DerivedMetrics> {
        match self {
            Reading::Unavailable => None,
            Reading::Fresh(metrics) | Reading::Stale(metrics) => Some(metrics),
        }
    }

    fn into_stale(self) -> Self {
        match self {
            Reading::Fresh(metrics) => Reading::Stale(metrics),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedState {
    pub reading: Reading,
    pub online: bool,
    pub connection_enabled: bool,
    pub consecutive_failures: u32,
}

impl Default for PublishedState {
    fn default() -> Self {
        Self {
            reading: Reading::Unavailable,
            online: false,
            connection_enabled: true,
            consecutive_failures: 0,
        }
    }
}

struct Shared<T> {
    address: String,
    session: Mutex<ConnectionSession<T>>,
    enabled: watch::Sender<bool>,
    state: watch::Sender<PublishedState>,
    refresh: Notify,
    /// Set when the switch goes from off to on, consumed by the next cycle.
    reenabled: AtomicBool,
}

impl<T: BleTransport> Shared<T> {
    async fn disconnect(&self) {
        self.session.lock().await.disconnect().await;
    }
}

/// Resolves once the connection switch is off.
async fn disabled(mut enabled: watch::Receiver<bool>) {
    while *enabled.borrow_and_update() {
        if enabled.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct PollingController<T> {
    shared: Arc<Shared<T>>,
    config: PollConfig,
    enabled: watch::Receiver<bool>,
    consecutive_failures: u32,
    link_failures: u32,
    reconnect_pending: bool,
    trend: TrendTracker,
}

impl<T: BleTransport> PollingController<T> {
    pub fn new(session: ConnectionSession<T>, mut config: PollConfig) -> (Self, ControllerHandle<T>) {
        let (enabled, enabled_rx) = watch::channel(true);
        let (state, _) = watch::channel(PublishedState::default());
        let shared = Arc::new(Shared {
            address: session.address().to_string(),
            session: Mutex::new(session),
            enabled,
            state,
            refresh: Notify::new(),
            reenabled: AtomicBool::new(false),
        });
        config.metrics = config.metrics.validated();
        let controller = Self {
            shared: Arc::clone(&shared),
            config,
            enabled: enabled_rx,
            consecutive_failures: 0,
            link_failures: 0,
            reconnect_pending: false,
            trend: TrendTracker::default(),
        };
        (controller, ControllerHandle { shared })
    }

    /// Polls until the task is dropped. Waits one interval between cycles, or
    /// less when a refresh is requested or the connection switch changes.
    pub async fn run(mut self) {
        log::info!(
            "{}: polling every {:?}",
            self.shared.address,
            self.config.interval
        );
        loop {
            let result = self.run_cycle().await;
            log::trace!("{}: cycle result {result:?}", self.shared.address);
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.shared.refresh.notified() => {
                    log::debug!("{}: refresh requested", self.shared.address);
                }
                _ = self.enabled.changed() => {}
            }
        }
    }

    /// Runs a single cycle and publishes its outcome.
    pub async fn run_cycle(&mut self) -> PollCycleResult {
        if self.shared.reenabled.swap(false, Ordering::AcqRel) {
            self.consecutive_failures = 0;
            self.link_failures = 0;
            self.reconnect_pending = false;
        }
        let result = if *self.enabled.borrow_and_update() {
            let enabled = self.enabled.clone();
            let outcome = tokio::select! {
                result = self.poll() => Some(result),
                () = disabled(enabled) => None,
            };
            match outcome {
                Some(result) => result,
                None => {
                    log::info!("{}: connection disabled during poll", self.shared.address);
                    self.shared.disconnect().await;
                    PollCycleResult::Disabled
                }
            }
        } else {
            PollCycleResult::Disabled
        };
        self.record(&result);
        result
    }

    async fn poll(&mut self) -> PollCycleResult {
        let shared = Arc::clone(&self.shared);
        let mut session = shared.session.lock().await;
        if self.reconnect_pending {
            log::warn!(
                "{}: resetting link after {} consecutive failures",
                shared.address,
                self.link_failures
            );
            session.disconnect().await;
            self.reconnect_pending = false;
            self.link_failures = 0;
        }
        if !session.is_connected() {
            if let Err(err) = session.connect().await {
                return err.into();
            }
        }
        match session.query().await {
            Ok(frame) => PollCycleResult::Success(Box::new(
                self.trend.observe(Sample::now(frame), &self.config.metrics),
            )),
            Err(err) => err.into(),
        }
    }

    fn record(&mut self, result: &PollCycleResult) {
        let address = &self.shared.address;
        match result {
            PollCycleResult::Success(_) => {
                if self.consecutive_failures >= self.config.offline_threshold {
                    log::info!("{address}: back online");
                }
                self.consecutive_failures = 0;
                self.link_failures = 0;
            }
            PollCycleResult::Timeout | PollCycleResult::TransportError(_) => {
                self.consecutive_failures += 1;
                self.link_failures += 1;
                if self.link_failures >= self.config.reconnect_threshold {
                    log::warn!(
                        "{address}: {} consecutive link failures, last: {result:?}",
                        self.link_failures
                    );
                    self.reconnect_pending = true;
                } else {
                    log::debug!("{address}: poll failed: {result:?}");
                }
            }
            PollCycleResult::DecodeError(_) => self.consecutive_failures += 1,
            PollCycleResult::Disabled => {
                self.link_failures = 0;
                self.reconnect_pending = false;
            }
        }
        if self.consecutive_failures == self.config.offline_threshold {
            log::warn!("{address}: offline after {} failed cycles", self.consecutive_failures);
        }

        let connection_enabled = *self.enabled.borrow();
        let consecutive_failures = self.consecutive_failures;
        let online_threshold = self.config.offline_threshold;
        self.shared.state.send_modify(|state| {
            let previous = std::mem::replace(&mut state.reading, Reading::Unavailable);
            state.reading = match result {
                PollCycleResult::Success(metrics) => Reading::Fresh(metrics.clone()),
                _ => previous.into_stale(),
            };
            state.connection_enabled = connection_enabled;
            state.consecutive_failures = consecutive_failures;
            state.online = connection_enabled
                && state.reading.metrics().is_some()
                && consecutive_failures < online_threshold;
        });
    }
}

/// Outward interface of one [`PollingController`].
pub struct ControllerHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ControllerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: BleTransport> ControllerHandle<T> {
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> PublishedState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishedState> {
        self.shared.state.subscribe()
    }

    pub fn connection_enabled(&self) -> bool {
        *self.shared.enabled.borrow()
    }

    pub async fn set_charging(&self, enable: bool) -> Result<(), Error> {
        self.command(Command::charge(enable)).await
    }

    pub async fn set_discharging(&self, enable: bool) -> Result<(), Error> {
        self.command(Command::discharge(enable)).await
    }

    /// Turning the switch off aborts an in-flight cycle and disconnects.
    /// Turning it on triggers an immediate cycle.
    pub async fn set_connection_enabled(&self, enable: bool) {
        let changed = self.shared.enabled.send_if_modified(|enabled| {
            let changed = *enabled != enable;
            *enabled = enable;
            changed
        });
        if changed {
            if enable {
                self.shared.reenabled.store(true, Ordering::Release);
            }
            log::info!(
                "{}: connection {}",
                self.shared.address,
                if enable { "enabled" } else { "disabled" }
            );
        }
        if enable {
            self.shared.refresh.notify_one();
        } else {
            self.shared.disconnect().await;
        }
    }

    async fn command(&self, command: Command) -> Result<(), Error> {
        if !self.connection_enabled() {
            return Err(Error::Disabled);
        }
        {
            let mut session = self.shared.session.lock().await;
            // The switch may have been turned off while waiting for the lock.
            if !self.connection_enabled() {
                return Err(Error::Disabled);
            }
            if !session.is_connected() {
                session.connect().await?;
            }
            session.write_command(command).await?;
        }
        self.shared.refresh.notify_one();
        Ok(())
    }
}

struct FleetEntry<T> {
    handle: ControllerHandle<T>,
    task: JoinHandle<()>,
}

/// The controllers of several devices, keyed by address.
pub struct Fleet<T> {
    registry: DeviceRegistry,
    controllers: HashMap<String, FleetEntry<T>>,
}

impl<T> Default for Fleet<T> {
    fn default() -> Self {
        Self {
            registry: DeviceRegistry::default(),
            controllers: HashMap::new(),
        }
    }
}

impl<T: BleTransport + 'static> Fleet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `address` and spawns its poll loop.
    pub fn add(
        &mut self,
        address: &str,
        transport: T,
        config: PollConfig,
    ) -> Result<ControllerHandle<T>, TransportError> {
        let session =
            ConnectionSession::open(&self.registry, address, transport, config.session.clone())?;
        let address = session.address().to_string();
        let (controller, handle) = PollingController::new(session, config);
        let task = tokio::spawn(controller.run());
        self.controllers.insert(
            address,
            FleetEntry {
                handle: handle.clone(),
                task,
            },
        );
        Ok(handle)
    }

    pub fn get(&self, address: &str) -> Option<&ControllerHandle<T>> {
        self.controllers
            .get(&address.trim().to_ascii_uppercase())
            .map(|entry| &entry.handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ControllerHandle<T>> {
        self.controllers.values().map(|entry| &entry.handle)
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Stops the controller of `address`, disconnects and releases the device.
    pub async fn remove(&mut self, address: &str) -> bool {
        match self.controllers.remove(&address.trim().to_ascii_uppercase()) {
            Some(entry) => {
                Self::stop(entry).await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(mut self) {
        for (_, entry) in self.controllers.drain() {
            Self::stop(entry).await;
        }
    }

    async fn stop(entry: FleetEntry<T>) {
        entry.handle.set_connection_enabled(false).await;
        entry.task.abort();
        let _ = entry.task.await;
    }
}
