//! Identification pass: a driver handshake against one candidate

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

use crate::adapters::{DeviceDriver, DriverHandle, DriverSettings};
use crate::device::{DriverKind, Identification};
use crate::error::Result;
use crate::transport::RetryPolicy;

/// Runs one driver's handshake against one address.
#[async_trait]
pub trait Identifier: Send + Sync {
    async fn identify(
        &self,
        kind: DriverKind,
        address: IpAddr,
        port: u16,
    ) -> Result<Identification>;
}

/// Opens the real driver with identification deadlines and closes it after.
pub struct DriverIdentifier {
    settings: DriverSettings,
}

impl DriverIdentifier {
    /// `timeout` bounds the connect and each handshake command.
    pub fn new(settings: &DriverSettings, timeout: Duration) -> Self {
        let mut settings = settings.with_command_timeout(timeout);
        settings.connect_timeout = settings.connect_timeout.min(timeout);
        // One attempt per address; discovery covers many hosts
        settings.retry = RetryPolicy::single_attempt();
        Self { settings }
    }
}

#[async_trait]
impl Identifier for DriverIdentifier {
    async fn identify(
        &self,
        kind: DriverKind,
        address: IpAddr,
        port: u16,
    ) -> Result<Identification> {
        let driver = DriverHandle::open(kind, address, port, &self.settings).await?;
        let outcome = driver.identify().await;
        driver.close().await;
        outcome
    }
}
