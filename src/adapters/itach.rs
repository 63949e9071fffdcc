//! Global Caché iTach IP2IR blaster
//!
//! Persistent TCP connection on port 4998, carriage-return terminated ASCII.
//!
//! ```text
//! -> sendir,1:2,17,38000,1,1,342,171,21,21,...\r
//! <- completeir,1:2,17\r
//! <- ERR_1:2,014\r
//! <- busyIR,1:2,17\r
//! ```
//!
//! Error lines carry no command id, so the link runs one command at a time.
//! Acknowledgments echo the id and are checked against the pending command.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{CorrelationMode, DeviceDriver, FrameCodec};
use crate::device::{Capability, DriverKind, Identification};
use crate::error::{DeviceError, Result};
use crate::transport::Correlator;

pub const DEFAULT_PORT: u16 = 4998;

/// IR connectors on an IP2IR
pub const IR_PORTS: u8 = 3;

/// Module address of the IR connectors
const MODULE: u8 = 1;
const MAX_WIRE_ID: u64 = 65535;
const VENDOR: &str = "Global Cache";

/// What to blast: a learned raw code or a name from the code library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrCommand {
    Preset(String),
    Raw(String),
}

impl IrCommand {
    /// Raw codes start with the carrier frequency; anything else is a preset.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.starts_with(|c: char| c.is_ascii_digit()) && text.contains(',') {
            IrCommand::Raw(text.to_string())
        } else {
            IrCommand::Preset(text.to_string())
        }
    }
}

/// Named learned codes, loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrLibrary {
    codes: HashMap<String, String>,
}

impl IrLibrary {
    pub fn new(codes: HashMap<String, String>) -> Self {
        Self { codes }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Resolve a command to a validated raw code.
    pub fn resolve(&self, command: &IrCommand) -> Result<String> {
        let code = match command {
            IrCommand::Raw(code) => code.clone(),
            IrCommand::Preset(name) => self
                .codes
                .get(name)
                .cloned()
                .ok_or_else(|| DeviceError::DomainValidation(format!("unknown IR preset {:?}", name)))?,
        };
        validate_code(&code)?;
        Ok(code)
    }

    /// Build a ready-to-send request; nothing touches the network.
    pub fn prepare(&self, port: u8, command: &IrCommand) -> Result<IrRequest> {
        validate_port(port)?;
        Ok(IrRequest::Send {
            port,
            code: self.resolve(command)?,
        })
    }
}

pub fn validate_port(port: u8) -> Result<()> {
    if (1..=IR_PORTS).contains(&port) {
        Ok(())
    } else {
        Err(DeviceError::DomainValidation(format!(
            "IR port {} outside 1..={}",
            port, IR_PORTS
        )))
    }
}

/// frequency,repeat,offset,on,off[,on,off...]
fn validate_code(code: &str) -> Result<()> {
    let fields: Vec<&str> = code.split(',').map(str::trim).collect();
    if fields.len() >= 5 && fields.iter().all(|f| f.parse::<u32>().is_ok()) {
        Ok(())
    } else {
        Err(DeviceError::DomainValidation(format!(
            "malformed IR code {:?}",
            code
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrRequest {
    Send { port: u8, code: String },
    GetVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrReply {
    Complete { port: u8, id: u16 },
    /// Any other non-error line (version strings)
    Text(String),
}

fn wire_id(id: u64) -> u64 {
    (id.saturating_sub(1) % MAX_WIRE_ID) + 1
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ItachCodec;

impl FrameCodec for ItachCodec {
    type Request = IrRequest;
    type Reply = IrReply;

    fn terminator(&self) -> &'static [u8] {
        b"\r"
    }

    fn correlation(&self) -> CorrelationMode {
        CorrelationMode::Serial
    }

    fn encode(&self, request: &IrRequest, id: u64) -> Result<Vec<u8>> {
        let line = match request {
            IrRequest::Send { port, code } => {
                validate_port(*port)?;
                validate_code(code)?;
                format!("sendir,{}:{},{},{}\r", MODULE, port, wire_id(id), code)
            }
            IrRequest::GetVersion => "getversion\r".to_string(),
        };
        Ok(line.into_bytes())
    }

    /// Only `completeir` echoes the id; error lines answer whatever is pending.
    fn correlation_id(&self, frame: &[u8]) -> Option<u64> {
        let line = std::str::from_utf8(frame).ok()?.trim();
        match parse_complete(line.strip_prefix("completeir,")?)? {
            IrReply::Complete { id, .. } => Some(u64::from(id)),
            IrReply::Text(_) => None,
        }
    }

    fn wire_id(&self, id: u64) -> u64 {
        wire_id(id)
    }

    fn echoes_id(&self) -> bool {
        true
    }

    fn decode(&self, frame: &[u8]) -> Result<IrReply> {
        let line = String::from_utf8_lossy(frame).trim().to_string();
        if line.starts_with("ERR") {
            return Err(DeviceError::protocol("blaster reported an error", line));
        }
        if line.starts_with("busyIR") {
            return Err(DeviceError::protocol("blaster busy", line));
        }
        if let Some(rest) = line.strip_prefix("completeir,") {
            return parse_complete(rest)
                .ok_or_else(|| DeviceError::protocol("malformed acknowledgment", line.clone()));
        }
        if line.is_empty() {
            return Err(DeviceError::protocol("empty reply", line));
        }
        Ok(IrReply::Text(line))
    }
}

/// `1:2,17` -> port 2, id 17
fn parse_complete(rest: &str) -> Option<IrReply> {
    let (address, id) = rest.split_once(',')?;
    let (_, port) = address.split_once(':')?;
    Some(IrReply::Complete {
        port: port.parse().ok()?,
        id: id.trim().parse().ok()?,
    })
}

/// IR blaster client bound to one connection.
pub struct ItachDriver {
    link: Correlator<ItachCodec>,
    command_timeout: Duration,
}

impl ItachDriver {
    pub async fn connect(
        address: IpAddr,
        port: u16,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        let link = Correlator::open(Arc::new(ItachCodec), address, port, connect_timeout).await?;
        Ok(Self::new(link, command_timeout))
    }

    pub fn new(link: Correlator<ItachCodec>, command_timeout: Duration) -> Self {
        Self {
            link,
            command_timeout,
        }
    }

    pub fn link(&self) -> &Correlator<ItachCodec> {
        &self.link
    }

    /// Blast a prepared request and wait for the blaster's acknowledgment.
    pub async fn send(&self, request: &IrRequest) -> Result<()> {
        let expected = match request {
            IrRequest::Send { port, .. } => *port,
            IrRequest::GetVersion => {
                return Err(DeviceError::DomainValidation(
                    "getversion is not a blast command".into(),
                ))
            }
        };
        match self.link.send_command(request, self.command_timeout).await? {
            IrReply::Complete { port, .. } if port == expected => Ok(()),
            IrReply::Complete { port, id } => Err(DeviceError::protocol(
                format!("acknowledged port {} instead of {}", port, expected),
                format!("completeir,{}:{},{}", MODULE, port, id),
            )),
            IrReply::Text(text) => Err(DeviceError::protocol("unexpected reply to sendir", text)),
        }
    }

    pub async fn version(&self) -> Result<String> {
        match self
            .link
            .send_command(&IrRequest::GetVersion, self.command_timeout)
            .await?
        {
            IrReply::Text(version) => Ok(version),
            other => Err(DeviceError::protocol(
                "unexpected reply to getversion",
                format!("{:?}", other),
            )),
        }
    }
}

#[async_trait]
impl DeviceDriver for ItachDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Ir
    }

    async fn ping(&self) -> Result<()> {
        self.version().await.map(|_| ())
    }

    async fn identify(&self) -> Result<Identification> {
        match self.version().await {
            Ok(version) => Ok(Identification::Confirmed {
                vendor: VENDOR.to_string(),
                model: Some(version),
                capabilities: vec![Capability::IrPorts { ports: IR_PORTS }],
            }),
            Err(DeviceError::CommandTimeout { .. }) => Ok(Identification::Unidentified {
                vendor: None,
                reason: "no reply to getversion".to_string(),
            }),
            Err(DeviceError::Protocol { raw, .. }) => Ok(Identification::Unidentified {
                vendor: None,
                reason: format!("getversion answered {:?}", raw),
            }),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) {
        self.link.shutdown();
    }
}
