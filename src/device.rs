//! Device records as the control core sees them
//!
//! The registry owns persistence; this module owns the rules: which status
//! transitions are legal and which fields may never change once assigned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Stable registry key for a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for a device first seen at `address:port` by a driver of `kind`.
    pub fn for_endpoint(kind: DriverKind, address: IpAddr, port: u16) -> Self {
        Self(format!("{}-{}-{}", kind, address, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which vendor driver speaks to a device. Chosen once, at identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Atlas AZM-series DSP gain control
    Gain,
    /// DirecTV receiver
    Satellite,
    /// Global Caché iTach IR blaster
    Ir,
    /// Wolfpack HDMI matrix
    Matrix,
}

impl DriverKind {
    pub const ALL: [DriverKind; 4] = [
        DriverKind::Gain,
        DriverKind::Satellite,
        DriverKind::Ir,
        DriverKind::Matrix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Gain => "gain",
            DriverKind::Satellite => "satellite",
            DriverKind::Ir => "ir",
            DriverKind::Matrix => "matrix",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gain" | "atlas" | "dsp" => Ok(DriverKind::Gain),
            "satellite" | "directv" | "receiver" => Ok(DriverKind::Satellite),
            "ir" | "itach" | "globalcache" => Ok(DriverKind::Ir),
            "matrix" | "wolfpack" => Ok(DriverKind::Matrix),
            other => Err(format!("unknown driver kind: {}", other)),
        }
    }
}

/// One thing a device can do, with its hardware limits where they matter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Capability {
    ZoneGain { zones: u16 },
    SourceGain { sources: u16 },
    Routing { inputs: u16, outputs: u16 },
    IrPorts { ports: u8 },
    Tune,
    KeyPress,
    ProgramInfo,
}

/// Lifecycle status.
///
/// ```text
/// unknown -> discovered -> identifying -> { online, error, unidentified }
/// online  -> offline            (transport failure)
/// offline -> online             (explicit successful test only)
/// error / unidentified -> discovered   (manual retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Unknown,
    Discovered,
    Identifying,
    Online,
    Offline,
    Error,
    /// Reachable, but the handshake could not settle vendor/model
    Unidentified,
}

impl DeviceStatus {
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, next),
            (Unknown, Discovered)
                | (Discovered, Identifying)
                | (Identifying, Online)
                | (Identifying, Error)
                | (Identifying, Unidentified)
                | (Online, Online)
                | (Online, Offline)
                | (Offline, Offline)
                | (Offline, Online)
                | (Error, Discovered)
                | (Unidentified, Discovered)
        )
    }

    pub fn transition(self, next: DeviceStatus) -> Result<DeviceStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Discovered => "discovered",
            DeviceStatus::Identifying => "identifying",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Unidentified => "unidentified",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

/// Outcome of a driver handshake against one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Identification {
    Confirmed {
        vendor: String,
        model: Option<String>,
        capabilities: Vec<Capability>,
    },
    /// Reachable but inconclusive. Never resolved by guessing a model.
    Unidentified {
        vendor: Option<String>,
        reason: String,
    },
}

/// A piece of controlled hardware.
///
/// Address and port are fixed at construction; moving a device to a new
/// endpoint means creating a new `Device`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    id: DeviceId,
    address: IpAddr,
    port: u16,
    pub kind: Option<DriverKind>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub capabilities: Vec<Capability>,
    status: DeviceStatus,
    last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// A device first observed at an address, not yet identified.
    pub fn new(id: DeviceId, address: IpAddr, port: u16) -> Self {
        Self {
            id,
            address,
            port,
            kind: None,
            vendor: None,
            model: None,
            capabilities: Vec::new(),
            status: DeviceStatus::Unknown,
            last_seen: None,
        }
    }

    /// Manual entry with a known driver.
    pub fn with_kind(id: DeviceId, address: IpAddr, port: u16, kind: DriverKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::new(id, address, port)
        }
    }

    /// Record built from a discovery handshake.
    pub fn identified(
        kind: DriverKind,
        address: IpAddr,
        port: u16,
        identification: &Identification,
        seen: DateTime<Utc>,
    ) -> Self {
        let id = DeviceId::for_endpoint(kind, address, port);
        let mut device = Self::with_kind(id, address, port, kind);
        device.last_seen = Some(seen);
        match identification {
            Identification::Confirmed {
                vendor,
                model,
                capabilities,
            } => {
                device.vendor = Some(vendor.clone());
                device.model = model.clone();
                device.capabilities = capabilities.clone();
                device.status = DeviceStatus::Online;
            }
            Identification::Unidentified { vendor, .. } => {
                device.vendor = vendor.clone();
                device.status = DeviceStatus::Unidentified;
            }
        }
        device
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        std::net::SocketAddr::new(self.address, self.port).to_string()
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Apply a validated status change.
    pub fn set_status(
        &mut self,
        next: DeviceStatus,
        seen: Option<DateTime<Utc>>,
    ) -> Result<(), InvalidTransition> {
        self.status = self.status.transition(next)?;
        if seen.is_some() {
            self.last_seen = seen;
        }
        Ok(())
    }

    pub fn zone_count(&self) -> Option<u16> {
        self.capabilities.iter().find_map(|c| match c {
            Capability::ZoneGain { zones } => Some(*zones),
            _ => None,
        })
    }

    pub fn source_count(&self) -> Option<u16> {
        self.capabilities.iter().find_map(|c| match c {
            Capability::SourceGain { sources } => Some(*sources),
            _ => None,
        })
    }

    pub fn matrix_size(&self) -> Option<(u16, u16)> {
        self.capabilities.iter().find_map(|c| match c {
            Capability::Routing { inputs, outputs } => Some((*inputs, *outputs)),
            _ => None,
        })
    }
}
