//! Owns the BLE link to one BMS.
//!
//! The BMS accepts a single client, so a session can only be opened with a
//! [`DeviceClaim`] obtained from a [`DeviceRegistry`]. All operations take
//! `&mut self`; callers sharing a session put it behind an async mutex, which
//! queues a second query behind the first instead of interleaving them.
//!
//! Every suspension point (connect, subscribe, write, awaiting the response,
//! disconnect) is bounded by a deadline from [`SessionConfig`].

use crate::config::SessionConfig;
use crate::error::{Error, TransportError};
use crate::protocol::{
    self, Command, ResponseAssembler, StatusFrame, NOTIFY_CHARACTERISTIC_UUID,
    WRITE_CHARACTERISTIC_UUID,
};
use crate::transport::{BleTransport, NotificationStream};
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingResponse,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    /// Transport connected and notifications subscribed.
    LinkReady,
    QuerySent,
    ResponseReceived,
    ResponseTimedOut,
    /// A query future was dropped while waiting for its response.
    QueryAbandoned,
    TransportFailed,
    DisconnectRequested,
    DisconnectCompleted,
}

impl ConnectionState {
    /// Next state for `event`, or `None` if the event is not accepted in this state.
    pub fn on(self, event: SessionEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use SessionEvent::*;
        match (self, event) {
            (_, TransportFailed) => Some(Disconnected),
            (_, DisconnectRequested) => Some(Disconnecting),
            (Disconnected, ConnectRequested) => Some(Connecting),
            (Connecting, LinkReady) => Some(Connected),
            (Connected, QuerySent) => Some(AwaitingResponse),
            (AwaitingResponse, ResponseReceived | ResponseTimedOut | QueryAbandoned) => {
                Some(Connected)
            }
            (Disconnecting, DisconnectCompleted) => Some(Disconnected),
            (Disconnected | Connecting | Connected | AwaitingResponse | Disconnecting, _) => None,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::AwaitingResponse
        )
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

/// Tracks which device addresses currently have an open session.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `address` for one session. Fails with `AlreadyInUse` while another claim is alive.
    pub fn claim(&self, address: &str) -> Result<DeviceClaim, TransportError> {
        let address = normalize_address(address);
        if !self.lock().insert(address.clone()) {
            log::warn!("Device {address} is already claimed by another session");
            return Err(TransportError::AlreadyInUse(address));
        }
        Ok(DeviceClaim {
            address,
            claimed: Arc::clone(&self.claimed),
        })
    }

    pub fn is_claimed(&self, address: &str) -> bool {
        self.lock().contains(&normalize_address(address))
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive right to talk to one device. Released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    address: String,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl DeviceClaim {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.address);
    }
}

pub struct ConnectionSession<T> {
    claim: DeviceClaim,
    transport: T,
    config: SessionConfig,
    state: ConnectionState,
    notifications: Option<NotificationStream>,
    assembler: ResponseAssembler,
}

impl<T: BleTransport> ConnectionSession<T> {
    pub fn new(claim: DeviceClaim, transport: T, config: SessionConfig) -> Self {
        Self {
            claim,
            transport,
            config,
            state: ConnectionState::Disconnected,
            notifications: None,
            assembler: ResponseAssembler::default(),
        }
    }

    /// Claims `address` in `registry` and creates a disconnected session for it.
    pub fn open(
        registry: &DeviceRegistry,
        address: &str,
        transport: T,
        config: SessionConfig,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(registry.claim(address)?, transport, config))
    }

    pub fn address(&self) -> &str {
        self.claim.address()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn apply(&mut self, event: SessionEvent) {
        match self.state.on(event) {
            Some(next) => {
                log::debug!(
                    "{}: {:?} --{:?}--> {:?}",
                    self.claim.address(),
                    self.state,
                    event,
                    next
                );
                self.state = next;
            }
            None => log::warn!(
                "{}: event {:?} not accepted in state {:?}",
                self.claim.address(),
                event,
                self.state
            ),
        }
    }

    /// Connects and subscribes to status notifications.
    pub async fn connect(&mut self) -> Result<(), Error> {
        match self.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::AwaitingResponse => {
                self.abandon_query();
                return Ok(());
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                // left over from a cancelled call
                self.disconnect().await;
            }
            ConnectionState::Disconnected => {}
        }

        self.apply(SessionEvent::ConnectRequested);
        log::info!("Connecting to {}", self.claim.address());
        match self.establish().await {
            Ok(stream) => {
                self.notifications = Some(stream);
                self.assembler.clear();
                self.apply(SessionEvent::LinkReady);
                log::info!("Connected to {}", self.claim.address());
                Ok(())
            }
            Err(err) => {
                self.fail(&err).await;
                Err(err.into())
            }
        }
    }

    async fn establish(&mut self) -> Result<NotificationStream, TransportError> {
        let deadline = self.config.connect_timeout;
        let address = self.claim.address().to_string();
        timeout(deadline, self.transport.connect(&address))
            .await
            .map_err(|_| {
                TransportError::ConnectFailed(format!("no connection within {deadline:?}"))
            })??;
        timeout(deadline, self.transport.subscribe(NOTIFY_CHARACTERISTIC_UUID))
            .await
            .map_err(|_| {
                TransportError::NotifySubscribeFailed(format!("no subscription within {deadline:?}"))
            })?
    }

    /// Requests a status frame and waits for the matching notification.
    ///
    /// Timeouts and decode errors leave the session connected; transport
    /// errors drop it to `Disconnected`.
    pub async fn query(&mut self) -> Result<StatusFrame, Error> {
        self.ensure_ready()?;
        self.drain_stale();
        self.send(Command::QueryStatus).await?;
        self.apply(SessionEvent::QuerySent);

        match timeout(self.config.response_timeout, self.next_response()).await {
            Err(_) => {
                log::debug!(
                    "{}: timeout waiting for response ({} bytes buffered)",
                    self.claim.address(),
                    self.assembler.buffered()
                );
                self.assembler.clear();
                self.apply(SessionEvent::ResponseTimedOut);
                Err(Error::Timeout)
            }
            Ok(Err(err)) => {
                self.fail(&err).await;
                Err(err.into())
            }
            Ok(Ok(rx_buffer)) => {
                self.apply(SessionEvent::ResponseReceived);
                protocol::decode(&rx_buffer).map_err(|err| {
                    log::warn!(
                        "{}: failed to decode response: {err}",
                        self.claim.address()
                    );
                    err.into()
                })
            }
        }
    }

    /// Writes a control command. Success means the transport accepted the write.
    pub async fn write_command(&mut self, command: Command) -> Result<(), Error> {
        self.ensure_ready()?;
        log::info!("{}: sending {command}", self.claim.address());
        self.send(command).await
    }

    /// Tears the link down. Immediate when there is no live connection.
    pub async fn disconnect(&mut self) {
        let live = self.state != ConnectionState::Disconnected;
        self.apply(SessionEvent::DisconnectRequested);
        self.notifications = None;
        self.assembler.clear();
        if live {
            match timeout(self.config.write_timeout, self.transport.disconnect()).await {
                Ok(Ok(())) => log::info!("Disconnected from {}", self.claim.address()),
                Ok(Err(err)) => log::debug!("{}: disconnect failed: {err}", self.claim.address()),
                Err(_) => log::debug!("{}: disconnect timed out", self.claim.address()),
            }
        }
        self.apply(SessionEvent::DisconnectCompleted);
    }

    fn ensure_ready(&mut self) -> Result<(), TransportError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::AwaitingResponse => {
                self.abandon_query();
                Ok(())
            }
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Disconnecting => Err(TransportError::NotConnected),
        }
    }

    fn abandon_query(&mut self) {
        log::debug!("{}: previous query was abandoned", self.claim.address());
        self.assembler.clear();
        self.apply(SessionEvent::QueryAbandoned);
    }

    /// Drops notifications that arrived after an earlier query gave up on them.
    fn drain_stale(&mut self) {
        self.assembler.clear();
        if let Some(stream) = self.notifications.as_mut() {
            while let Some(Some(chunk)) = stream.next().now_or_never() {
                log::trace!("Discarding stale notification: {chunk:02X?}");
            }
        }
    }

    async fn next_response(&mut self) -> Result<Vec<u8>, TransportError> {
        let stream = self
            .notifications
            .as_mut()
            .ok_or(TransportError::NotConnected)?;
        loop {
            match stream.next().await {
                Some(chunk) => {
                    log::trace!("RX notification: {chunk:02X?}");
                    if let Some(rx_buffer) = self.assembler.push(&chunk) {
                        return Ok(rx_buffer);
                    }
                }
                None => return Err(TransportError::LinkLost),
            }
        }
    }

    async fn send(&mut self, command: Command) -> Result<(), Error> {
        let frame = protocol::encode(command);
        log::trace!("write bytes: {frame:?}");
        let deadline = self.config.write_timeout;
        let result = timeout(
            deadline,
            self.transport
                .write(WRITE_CHARACTERISTIC_UUID, frame.as_slice()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::WriteFailed(format!(
                "no completion within {deadline:?}"
            )))
        });
        if let Err(err) = result {
            self.fail(&err).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Handles a fatal transport error: the link is dropped and the session is `Disconnected`.
    async fn fail(&mut self, err: &TransportError) {
        log::warn!("{}: {err}", self.claim.address());
        self.apply(SessionEvent::TransportFailed);
        self.notifications = None;
        self.assembler.clear();
        if let Ok(Err(err)) = timeout(self.config.write_timeout, self.transport.disconnect()).await
        {
            log::debug!("{}: cleanup disconnect failed: {err}", self.claim.address());
        }
    }
}
