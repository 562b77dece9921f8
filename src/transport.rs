//! The BLE capability the session drives.
//!
//! Scanning, GATT connect, notify subscription and writes are provided by the
//! platform. [`crate::btleplug_transport`] implements this trait on top of
//! `btleplug`; tests use a scripted fake.

use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use uuid::Uuid;

/// Raw notification payloads of one subscribed characteristic, in arrival order.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// One BLE link to one peripheral.
///
/// Implementations do not need to apply deadlines; the session wraps every
/// call in a timeout.
#[async_trait]
pub trait BleTransport: Send {
    /// Lists peripherals advertising `service` seen within `duration`.
    async fn scan(
        &mut self,
        service: Uuid,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError>;

    async fn connect(&mut self, address: &str) -> Result<(), TransportError>;

    async fn subscribe(&mut self, characteristic: Uuid)
        -> Result<NotificationStream, TransportError>;

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory transport.
    //!
    //! Each write pops the next [`Reply`] and delivers its chunks on the
    //! notification stream. The shared [`FakeLog`] records what the session did.

    use super::*;
    use futures_util::StreamExt;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        /// Deliver these notifications after the write.
        Notify(Vec<Vec<u8>>),
        /// Accept the write, never answer.
        Silence,
        /// Reject the write.
        WriteError,
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeLog {
        pub connects: usize,
        pub disconnects: usize,
        pub writes: Vec<Vec<u8>>,
        pub connect_failures: usize,
        /// Connect attempts never complete.
        pub connect_hangs: bool,
        pub replies: VecDeque<Reply>,
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeTransport {
        pub log: Arc<Mutex<FakeLog>>,
        sender: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn push_reply(&self, reply: Reply) {
            self.log.lock().unwrap().replies.push_back(reply);
        }

        pub(crate) fn fail_next_connects(&self, n: usize) {
            self.log.lock().unwrap().connect_failures = n;
        }

        pub(crate) fn hang_connects(&self) {
            self.log.lock().unwrap().connect_hangs = true;
        }

        pub(crate) fn connects(&self) -> usize {
            self.log.lock().unwrap().connects
        }

        pub(crate) fn disconnects(&self) -> usize {
            self.log.lock().unwrap().disconnects
        }

        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.log.lock().unwrap().writes.clone()
        }

        /// Sends an unsolicited notification.
        pub(crate) fn notify(&self, chunk: Vec<u8>) {
            if let Some(sender) = self.sender.lock().unwrap().as_ref() {
                let _ = sender.send(chunk);
            }
        }
    }

    #[async_trait]
    impl BleTransport for FakeTransport {
        async fn scan(
            &mut self,
            _service: Uuid,
            _duration: Duration,
        ) -> Result<Vec<DiscoveredDevice>, TransportError> {
            Ok(vec![DiscoveredDevice {
                address: "C8:47:80:00:00:01".to_string(),
                name: Some("L-12100BNNA70".to_string()),
                rssi: Some(-60),
            }])
        }

        async fn connect(&mut self, _address: &str) -> Result<(), TransportError> {
            let hangs = {
                let mut log = self.log.lock().unwrap();
                log.connects += 1;
                if log.connect_failures > 0 {
                    log.connect_failures -= 1;
                    return Err(TransportError::ConnectFailed("out of range".to_string()));
                }
                log.connect_hangs
            };
            if hangs {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn subscribe(
            &mut self,
            _characteristic: Uuid,
        ) -> Result<NotificationStream, TransportError> {
            let (sender, receiver) = mpsc::unbounded_channel();
            *self.sender.lock().unwrap() = Some(sender);
            Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|chunk| (chunk, receiver))
            })
            .boxed())
        }

        async fn write(&mut self, _characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
            let reply = {
                let mut log = self.log.lock().unwrap();
                log.writes.push(data.to_vec());
                log.replies.pop_front().unwrap_or(Reply::Silence)
            };
            match reply {
                Reply::Notify(chunks) => {
                    for chunk in chunks {
                        self.notify(chunk);
                    }
                    Ok(())
                }
                Reply::Silence => Ok(()),
                Reply::WriteError => Err(TransportError::WriteFailed("GATT error".to_string())),
            }
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.log.lock().unwrap().disconnects += 1;
            *self.sender.lock().unwrap() = None;
            Ok(())
        }
    }
}
