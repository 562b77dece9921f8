//! [`BleTransport`] on top of the platform BLE stack via `btleplug`.

use crate::error::TransportError;
use crate::protocol::SERVICE_UUID;
use crate::transport::{BleTransport, DiscoveredDevice, NotificationStream};
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::time::Duration;
use uuid::Uuid;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    /// A scan was started and not yet stopped, possibly by a cancelled connect.
    scanning: bool,
}

impl BtleplugTransport {
    /// Uses the first Bluetooth adapter of the host.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(connect_failed)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(connect_failed)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::ConnectFailed("no Bluetooth adapter found".into()))?;
        if let Ok(info) = adapter.adapter_info().await {
            log::debug!("Using Bluetooth adapter {info}");
        }
        Ok(Self {
            adapter,
            peripheral: None,
            scanning: false,
        })
    }

    fn peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or_else(|| TransportError::ConnectFailed(format!("characteristic {uuid} not found")))
    }

    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(connect_failed)?;
        self.scanning = true;
        Ok(())
    }

    async fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }
        if let Err(err) = self.adapter.stop_scan().await {
            log::debug!("stop scan failed: {err}");
        }
        self.scanning = false;
    }

    async fn find(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await.map_err(connect_failed)? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address)
                || peripheral.id().to_string().eq_ignore_ascii_case(address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

fn connect_failed(err: btleplug::Error) -> TransportError {
    TransportError::ConnectFailed(err.to_string())
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn scan(
        &mut self,
        service: Uuid,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        self.start_scan(service).await?;
        tokio::time::sleep(duration).await;
        let peripherals = self.adapter.peripherals().await;
        self.stop_scan().await;
        let peripherals = peripherals.map_err(connect_failed)?;

        let mut devices = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !properties.services.contains(&service) {
                continue;
            }
            devices.push(DiscoveredDevice {
                address: peripheral.address().to_string(),
                name: properties.local_name,
                rssi: properties.rssi,
            });
        }
        Ok(devices)
    }

    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        // Cancellation or a timeout leaves the scan to `disconnect`.
        self.start_scan(SERVICE_UUID).await?;
        let peripheral = loop {
            match self.find(address).await {
                Ok(Some(peripheral)) => break peripheral,
                Ok(None) => tokio::time::sleep(SCAN_POLL_INTERVAL).await,
                Err(err) => {
                    self.stop_scan().await;
                    return Err(err);
                }
            }
        };
        self.stop_scan().await;

        if !peripheral.is_connected().await.map_err(connect_failed)? {
            peripheral.connect().await.map_err(connect_failed)?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(connect_failed)?;
        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        let target = self.characteristic(characteristic).map_err(|err| {
            TransportError::NotifySubscribeFailed(err.to_string())
        })?;
        let peripheral = self.peripheral()?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(|err| TransportError::NotifySubscribeFailed(err.to_string()))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|err| TransportError::NotifySubscribeFailed(err.to_string()))?;
        Ok(notifications
            .filter_map(move |notification| {
                futures_util::future::ready(
                    (notification.uuid == characteristic).then_some(notification.value),
                )
            })
            .boxed())
    }

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let target = self
            .characteristic(characteristic)
            .map_err(|err| TransportError::WriteFailed(err.to_string()))?;
        let write_type = if target
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.peripheral()?
            .write(&target, data, write_type)
            .await
            .map_err(|err| TransportError::WriteFailed(err.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_scan().await;
        match self.peripheral.take() {
            Some(peripheral) => peripheral
                .disconnect()
                .await
                .map_err(|err| TransportError::ConnectFailed(err.to_string())),
            None => Ok(()),
        }
    }
}
