//! DriverHandle - one driver for one device, selected by kind
//!
//! The kind is fixed when the device is identified. Everything above this
//! layer talks to a `DriverHandle` and never branches on vendor strings.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::atlas::AtlasDriver;
use super::directv::{DirectvDriver, DEFAULT_CLIENT_ADDR};
use super::itach::ItachDriver;
use super::traits::DeviceDriver;
use super::wolfpack::{MatrixSize, WolfpackDriver};
use crate::device::{DriverKind, Identification};
use crate::error::{DeviceError, Result};
use crate::transport::RetryPolicy;

/// Timeouts and per-driver settings used when opening a driver.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
    pub matrix: MatrixSize,
    pub satellite_client_addr: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_millis(7000),
            retry: RetryPolicy::default(),
            matrix: MatrixSize::default(),
            satellite_client_addr: DEFAULT_CLIENT_ADDR.to_string(),
        }
    }
}

impl DriverSettings {
    /// Same settings with a shorter command deadline (identification passes).
    pub fn with_command_timeout(&self, command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            ..self.clone()
        }
    }
}

/// A live driver of any kind.
pub enum DriverHandle {
    Gain(AtlasDriver),
    Satellite(DirectvDriver),
    Ir(ItachDriver),
    Matrix(WolfpackDriver),
}

impl DriverHandle {
    /// Open the driver for `kind` at `address:port`.
    ///
    /// Stream drivers connect here; the HTTP driver connects per request.
    pub async fn open(
        kind: DriverKind,
        address: IpAddr,
        port: u16,
        settings: &DriverSettings,
    ) -> Result<Self> {
        let handle = match kind {
            DriverKind::Gain => DriverHandle::Gain(
                AtlasDriver::connect(
                    address,
                    port,
                    settings.connect_timeout,
                    settings.command_timeout,
                )
                .await?,
            ),
            DriverKind::Satellite => DriverHandle::Satellite(
                DirectvDriver::new(address, port, settings.command_timeout, settings.retry)?
                    .with_client_addr(settings.satellite_client_addr.clone()),
            ),
            DriverKind::Ir => DriverHandle::Ir(
                ItachDriver::connect(
                    address,
                    port,
                    settings.connect_timeout,
                    settings.command_timeout,
                )
                .await?,
            ),
            DriverKind::Matrix => DriverHandle::Matrix(
                WolfpackDriver::connect(
                    address,
                    port,
                    settings.matrix,
                    settings.connect_timeout,
                    settings.command_timeout,
                )
                .await?,
            ),
        };
        tracing::debug!("Opened {} driver for {}:{}", kind, address, port);
        Ok(handle)
    }

    fn driver(&self) -> &dyn DeviceDriver {
        match self {
            DriverHandle::Gain(d) => d,
            DriverHandle::Satellite(d) => d,
            DriverHandle::Ir(d) => d,
            DriverHandle::Matrix(d) => d,
        }
    }

    /// Token cancelled when a persistent link drops. `None` for HTTP.
    pub fn lost(&self) -> Option<CancellationToken> {
        match self {
            DriverHandle::Gain(d) => Some(d.link().lost()),
            DriverHandle::Ir(d) => Some(d.link().lost()),
            DriverHandle::Matrix(d) => Some(d.link().lost()),
            DriverHandle::Satellite(_) => None,
        }
    }

    /// False when a stream link has been retired and must be reopened.
    pub fn accepts_commands(&self) -> bool {
        match self {
            DriverHandle::Gain(d) => d.link().accepts_commands(),
            DriverHandle::Ir(d) => d.link().accepts_commands(),
            DriverHandle::Matrix(d) => d.link().accepts_commands(),
            DriverHandle::Satellite(_) => true,
        }
    }

    pub fn as_gain(&self) -> Result<&AtlasDriver> {
        match self {
            DriverHandle::Gain(d) => Ok(d),
            other => Err(wrong_kind(DriverKind::Gain, other.kind())),
        }
    }

    pub fn as_satellite(&self) -> Result<&DirectvDriver> {
        match self {
            DriverHandle::Satellite(d) => Ok(d),
            other => Err(wrong_kind(DriverKind::Satellite, other.kind())),
        }
    }

    pub fn as_ir(&self) -> Result<&ItachDriver> {
        match self {
            DriverHandle::Ir(d) => Ok(d),
            other => Err(wrong_kind(DriverKind::Ir, other.kind())),
        }
    }

    pub fn as_matrix(&self) -> Result<&WolfpackDriver> {
        match self {
            DriverHandle::Matrix(d) => Ok(d),
            other => Err(wrong_kind(DriverKind::Matrix, other.kind())),
        }
    }
}

fn wrong_kind(wanted: DriverKind, actual: DriverKind) -> DeviceError {
    DeviceError::DomainValidation(format!(
        "device is driven as {}, not {}",
        actual, wanted
    ))
}

#[async_trait]
impl DeviceDriver for DriverHandle {
    fn kind(&self) -> DriverKind {
        match self {
            DriverHandle::Gain(_) => DriverKind::Gain,
            DriverHandle::Satellite(_) => DriverKind::Satellite,
            DriverHandle::Ir(_) => DriverKind::Ir,
            DriverHandle::Matrix(_) => DriverKind::Matrix,
        }
    }

    async fn ping(&self) -> Result<()> {
        self.driver().ping().await
    }

    async fn identify(&self) -> Result<Identification> {
        self.driver().identify().await
    }

    async fn close(&self) {
        self.driver().close().await
    }
}
