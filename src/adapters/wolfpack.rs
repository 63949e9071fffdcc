//! Wolfpack HDMI matrix switch
//!
//! Plain ASCII commands on TCP port 5000, each terminated by `.`:
//!
//! ```text
//! -> 1X5.          route input 1 to output 5
//! -> 2X1&3&4.      route input 2 to outputs 1, 3 and 4
//! <- OK\r\n
//! <- ERR\r\n
//! ```
//!
//! Replies carry no id, so the link runs one command at a time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{CorrelationMode, DeviceDriver, FrameCodec};
use crate::device::{DriverKind, Identification};
use crate::error::{DeviceError, Result};
use crate::transport::Correlator;

pub const DEFAULT_PORT: u16 = 5000;

/// Configured matrix dimensions. Inputs and outputs are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixSize {
    pub inputs: u16,
    pub outputs: u16,
}

impl Default for MatrixSize {
    fn default() -> Self {
        Self {
            inputs: 8,
            outputs: 8,
        }
    }
}

impl MatrixSize {
    pub fn new(inputs: u16, outputs: u16) -> Self {
        Self { inputs, outputs }
    }

    /// Validate a route against this size. Duplicate outputs collapse,
    /// first occurrence wins.
    pub fn route(&self, input: u16, outputs: &[u16]) -> Result<RouteRequest> {
        if input == 0 || input > self.inputs {
            return Err(DeviceError::DomainValidation(format!(
                "input {} outside 1..={}",
                input, self.inputs
            )));
        }
        if outputs.is_empty() {
            return Err(DeviceError::DomainValidation(
                "route needs at least one output".into(),
            ));
        }

        let mut unique = Vec::with_capacity(outputs.len());
        for &output in outputs {
            if output == 0 || output > self.outputs {
                return Err(DeviceError::DomainValidation(format!(
                    "output {} outside 1..={}",
                    output, self.outputs
                )));
            }
            if !unique.contains(&output) {
                unique.push(output);
            }
        }

        Ok(RouteRequest {
            input,
            outputs: unique,
        })
    }
}

/// A validated routing command. Only `MatrixSize::route` builds one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteRequest {
    input: u16,
    outputs: Vec<u16>,
}

impl RouteRequest {
    pub fn input(&self) -> u16 {
        self.input
    }

    pub fn outputs(&self) -> &[u16] {
        &self.outputs
    }

    /// `1X5.` or `2X1&3&4.`
    pub fn command(&self) -> String {
        let outputs: Vec<String> = self.outputs.iter().map(u16::to_string).collect();
        format!("{}X{}.", self.input, outputs.join("&"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixAck;

#[derive(Debug, Default, Clone, Copy)]
pub struct WolfpackCodec;

impl FrameCodec for WolfpackCodec {
    type Request = RouteRequest;
    type Reply = MatrixAck;

    fn terminator(&self) -> &'static [u8] {
        b"\r\n"
    }

    fn correlation(&self) -> CorrelationMode {
        CorrelationMode::Serial
    }

    fn encode(&self, request: &RouteRequest, _id: u64) -> Result<Vec<u8>> {
        if request.outputs.is_empty() {
            return Err(DeviceError::DomainValidation(
                "route needs at least one output".into(),
            ));
        }
        Ok(request.command().into_bytes())
    }

    fn correlation_id(&self, _frame: &[u8]) -> Option<u64> {
        None
    }

    fn decode(&self, frame: &[u8]) -> Result<MatrixAck> {
        let reply = String::from_utf8_lossy(frame).trim().to_string();
        match reply.as_str() {
            "OK" => Ok(MatrixAck),
            "ERR" => Err(DeviceError::protocol("matrix rejected command", reply)),
            _ => Err(DeviceError::protocol("unexpected matrix reply", reply)),
        }
    }
}

/// Matrix client bound to one connection.
pub struct WolfpackDriver {
    link: Correlator<WolfpackCodec>,
    size: MatrixSize,
    command_timeout: Duration,
}

impl WolfpackDriver {
    pub async fn connect(
        address: IpAddr,
        port: u16,
        size: MatrixSize,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        let link = Correlator::open(Arc::new(WolfpackCodec), address, port, connect_timeout).await?;
        Ok(Self::new(link, size, command_timeout))
    }

    pub fn new(link: Correlator<WolfpackCodec>, size: MatrixSize, command_timeout: Duration) -> Self {
        Self {
            link,
            size,
            command_timeout,
        }
    }

    pub fn link(&self) -> &Correlator<WolfpackCodec> {
        &self.link
    }

    pub fn size(&self) -> MatrixSize {
        self.size
    }

    pub async fn route(&self, request: &RouteRequest) -> Result<()> {
        tracing::debug!("Matrix {}: {}", self.link.peer(), request.command());
        self.link
            .send_command(request, self.command_timeout)
            .await
            .map(|_| ())
    }

    /// Validate against this matrix and route.
    pub async fn switch(&self, input: u16, outputs: &[u16]) -> Result<()> {
        let request = self.size.route(input, outputs)?;
        self.route(&request).await
    }
}

#[async_trait]
impl DeviceDriver for WolfpackDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Matrix
    }

    /// The matrix has no side-effect-free query; a live link is the proof.
    async fn ping(&self) -> Result<()> {
        if self.link.is_closed() {
            Err(DeviceError::connectivity(self.link.peer(), "connection is closed"))
        } else {
            Ok(())
        }
    }

    async fn identify(&self) -> Result<Identification> {
        self.ping().await?;
        Ok(Identification::Unidentified {
            vendor: None,
            reason: format!(
                "{} accepts connections; matrix protocol has no identification query",
                self.link.peer()
            ),
        })
    }

    async fn close(&self) {
        self.link.shutdown();
    }
}
