use std::time::Duration;

use async_trait::async_trait;
use btleplug::{
    api::{Characteristic, Peripheral as _, WriteType},
    platform::Peripheral,
};
use futures::stream::StreamExt;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{BandError, Result};

/// GATT link to one device
///
/// Abstracts the Bluetooth stack so the protocol layers can run against a
/// scripted link in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect the link, bounded by `connect_timeout`
    async fn connect(&self, connect_timeout: Duration) -> Result<()>;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;

    /// Whether the link is currently up
    async fn is_connected(&self) -> bool;

    /// Discover GATT services and return their UUIDs
    async fn discover_services(&self) -> Result<Vec<Uuid>>;

    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value
    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Subscribe to characteristic notifications
    ///
    /// Values arrive on the returned channel until the link drops or the
    /// subscription is torn down.
    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::UnboundedReceiver<Vec<u8>>>;

    /// Stop characteristic notifications
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Address of the device behind this link
    fn address(&self) -> String;
}

/// Production [`Transport`] backed by a btleplug peripheral
pub struct BtleplugTransport {
    peripheral: Peripheral,
    address: String,
}

impl BtleplugTransport {
    /// Wrap a peripheral obtained from discovery
    #[must_use]
    pub fn new(peripheral: Peripheral) -> Self {
        let address = peripheral.address().to_string();
        Self {
            peripheral,
            address,
        }
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .services()
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| BandError::CharacteristicNotFound {
                address: self.address.clone(),
                uuid: uuid.to_string(),
            })
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn connect(&self, connect_timeout: Duration) -> Result<()> {
        debug!(address = %self.address, "connecting");
        timeout(connect_timeout, self.peripheral.connect())
            .await
            .map_err(|_| BandError::Timeout {
                timeout_ms: connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| BandError::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        debug!(address = %self.address, "disconnecting");
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<Vec<Uuid>> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .iter()
            .map(|s| s.uuid)
            .collect())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let gatt_char = self.find_characteristic(characteristic)?;
        let value =
            self.peripheral
                .read(&gatt_char)
                .await
                .map_err(|e| BandError::ReadFailed {
                    address: self.address.clone(),
                    uuid: characteristic.to_string(),
                    reason: e.to_string(),
                })?;
        trace!(address = %self.address, %characteristic, len = value.len(), "read");
        Ok(value)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let gatt_char = self.find_characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        trace!(address = %self.address, %characteristic, data = %crate::codec::bytes_to_hex(data), "write");
        self.peripheral
            .write(&gatt_char, data, write_type)
            .await
            .map_err(|e| BandError::WriteFailed {
                address: self.address.clone(),
                uuid: characteristic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let gatt_char = self.find_characteristic(characteristic)?;
        self.peripheral
            .subscribe(&gatt_char)
            .await
            .map_err(|e| BandError::NotificationFailed {
                address: self.address.clone(),
                uuid: characteristic.to_string(),
                reason: e.to_string(),
            })?;

        let mut stream =
            self.peripheral
                .notifications()
                .await
                .map_err(|e| BandError::NotificationFailed {
                    address: self.address.clone(),
                    uuid: characteristic.to_string(),
                    reason: e.to_string(),
                })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic
                    && tx.send(notification.value).is_err()
                {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let gatt_char = self.find_characteristic(characteristic)?;
        self.peripheral
            .unsubscribe(&gatt_char)
            .await
            .map_err(|e| BandError::NotificationFailed {
                address: self.address.clone(),
                uuid: characteristic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}
