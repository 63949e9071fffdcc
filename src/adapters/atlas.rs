//! Atlas AZM-series DSP gain control
//!
//! Persistent TCP connection on port 5321 carrying CRLF-terminated JSON
//! envelopes. Requests are pipelined and matched by `id`.
//!
//! ```text
//! -> {"id":7,"method":"set","param":"ZoneGain_2","value":-10.0}
//! <- {"id":7,"result":"OK"}
//! -> {"id":8,"method":"get","param":"ZoneGain_2"}
//! <- {"id":8,"result":{"value":-10.0}}
//! <- {"id":9,"error":"invalid parameter"}
//! ```
//!
//! Callers number channels from 1; the wire numbers parameters from 0.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{CorrelationMode, DeviceDriver, FrameCodec};
use crate::device::{Capability, DriverKind, Identification};
use crate::error::{DeviceError, Result};
use crate::transport::Correlator;

pub const DEFAULT_PORT: u16 = 5321;

/// Quietest setting the DSP accepts (dB)
pub const MIN_GAIN_DB: f64 = -80.0;
/// Unity gain (dB)
pub const MAX_GAIN_DB: f64 = 0.0;

const VENDOR: &str = "Atlas";

/// Zone probed during identification; only 8-zone models answer it
const AZM8_PROBE_CHANNEL: u16 = 5;

/// Which gain stage a parameter addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GainTarget {
    Zone,
    Source,
}

impl GainTarget {
    fn wire_prefix(&self) -> &'static str {
        match self {
            GainTarget::Zone => "ZoneGain",
            GainTarget::Source => "SourceGain",
        }
    }

    fn from_wire_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "ZoneGain" => Some(GainTarget::Zone),
            "SourceGain" => Some(GainTarget::Source),
            _ => None,
        }
    }
}

/// Convert a caller-facing 1-based channel to the 0-based wire index.
pub fn to_internal(channel: u16) -> Result<u16> {
    channel
        .checked_sub(1)
        .ok_or_else(|| DeviceError::DomainValidation("channels are numbered from 1".into()))
}

/// Convert a 0-based wire index back to the caller-facing channel.
pub fn to_external(index: u16) -> Result<u16> {
    index
        .checked_add(1)
        .ok_or_else(|| DeviceError::DomainValidation(format!("parameter index {} out of range", index)))
}

/// Reject anything outside [-80, 0] dB (NaN and infinities included).
pub fn validate_gain(value: f64) -> Result<f64> {
    if value.is_finite() && (MIN_GAIN_DB..=MAX_GAIN_DB).contains(&value) {
        Ok(value)
    } else {
        Err(DeviceError::DomainValidation(format!(
            "gain {} dB outside {}..={} dB",
            value, MIN_GAIN_DB, MAX_GAIN_DB
        )))
    }
}

/// A gain stage and its value. Construction validates both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GainParameter {
    target: GainTarget,
    channel: u16,
    value: f64,
}

impl GainParameter {
    pub fn new(target: GainTarget, channel: u16, value: f64) -> Result<Self> {
        to_internal(channel)?;
        Ok(Self {
            target,
            channel,
            value: validate_gain(value)?,
        })
    }

    /// Rebuild from a wire parameter name (`ZoneGain_2`) and value.
    pub fn from_wire(param: &str, value: f64) -> Result<Self> {
        let (target, channel) = parse_param(param)
            .ok_or_else(|| DeviceError::protocol("unknown gain parameter", param))?;
        Self::new(target, channel, value)
    }

    pub fn target(&self) -> GainTarget {
        self.target
    }

    /// 1-based channel
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// 0-based wire index
    pub fn index(&self) -> u16 {
        self.channel - 1
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn wire_name(&self) -> String {
        param_name(self.target, self.channel - 1)
    }

    /// Check the channel against the model's zone/source count, if known.
    pub fn check_limit(&self, count: Option<u16>) -> Result<()> {
        match count {
            Some(count) if self.channel > count => Err(DeviceError::DomainValidation(format!(
                "{:?} channel {} exceeds device limit of {}",
                self.target, self.channel, count
            ))),
            _ => Ok(()),
        }
    }
}

fn param_name(target: GainTarget, index: u16) -> String {
    format!("{}_{}", target.wire_prefix(), index)
}

/// `ZoneGain_2` -> (Zone, channel 3)
fn parse_param(param: &str) -> Option<(GainTarget, u16)> {
    let (prefix, index) = param.rsplit_once('_')?;
    let target = GainTarget::from_wire_prefix(prefix)?;
    let index: u16 = index.parse().ok()?;
    Some((target, to_external(index).ok()?))
}

/// A validated command for the DSP.
#[derive(Debug, Clone, PartialEq)]
pub enum GainRequest {
    Get { target: GainTarget, channel: u16 },
    Set(GainParameter),
}

impl GainRequest {
    pub fn get(target: GainTarget, channel: u16) -> Result<Self> {
        to_internal(channel)?;
        Ok(GainRequest::Get { target, channel })
    }

    pub fn set(parameter: GainParameter) -> Self {
        GainRequest::Set(parameter)
    }
}

// =============================================================================
// Wire envelopes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Set,
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub method: Method,
    pub param: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl RequestEnvelope {
    /// Back to the validated request it was built from.
    pub fn into_request(self) -> Result<GainRequest> {
        match (self.method, self.value) {
            (Method::Set, Some(value)) => {
                Ok(GainRequest::Set(GainParameter::from_wire(&self.param, value)?))
            }
            (Method::Get, None) => {
                let (target, channel) = parse_param(&self.param)
                    .ok_or_else(|| DeviceError::protocol("unknown gain parameter", &self.param))?;
                GainRequest::get(target, channel)
            }
            _ => Err(DeviceError::protocol("method/value mismatch", &self.param)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum ResultBody {
    Value { value: f64 },
    Status(String),
}

/// Inbound reply envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum ReplyEnvelope {
    Success { id: u64, result: ResultBody },
    Failure { id: u64, error: serde_json::Value },
}

#[derive(Deserialize)]
struct IdOnly {
    id: u64,
}

/// Decoded DSP reply.
#[derive(Debug, Clone, PartialEq)]
pub enum GainReply {
    Ok,
    Value(f64),
    /// Error envelope, with the device's message
    Rejected(String),
}

// =============================================================================
// Codec
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct AtlasCodec;

impl FrameCodec for AtlasCodec {
    type Request = GainRequest;
    type Reply = GainReply;

    fn terminator(&self) -> &'static [u8] {
        b"\r\n"
    }

    fn correlation(&self) -> CorrelationMode {
        CorrelationMode::ById
    }

    fn encode(&self, request: &GainRequest, id: u64) -> Result<Vec<u8>> {
        let envelope = match request {
            GainRequest::Get { target, channel } => RequestEnvelope {
                id,
                method: Method::Get,
                param: param_name(*target, to_internal(*channel)?),
                value: None,
            },
            GainRequest::Set(parameter) => RequestEnvelope {
                id,
                method: Method::Set,
                param: parameter.wire_name(),
                value: Some(validate_gain(parameter.value())?),
            },
        };
        let mut bytes = serde_json::to_vec(&envelope)
            .map_err(|e| DeviceError::protocol(format!("encode failed: {}", e), ""))?;
        bytes.extend_from_slice(b"\r\n");
        Ok(bytes)
    }

    fn correlation_id(&self, frame: &[u8]) -> Option<u64> {
        serde_json::from_slice::<IdOnly>(frame).ok().map(|m| m.id)
    }

    fn decode(&self, frame: &[u8]) -> Result<GainReply> {
        let raw = || String::from_utf8_lossy(frame).to_string();
        let envelope: ReplyEnvelope = serde_json::from_slice(frame)
            .map_err(|e| DeviceError::protocol(format!("unparseable reply: {}", e), raw()))?;

        match envelope {
            ReplyEnvelope::Success {
                result: ResultBody::Value { value },
                ..
            } => Ok(GainReply::Value(value)),
            ReplyEnvelope::Success {
                result: ResultBody::Status(status),
                ..
            } if status.eq_ignore_ascii_case("OK") => Ok(GainReply::Ok),
            ReplyEnvelope::Success {
                result: ResultBody::Status(status),
                ..
            } => Err(DeviceError::protocol(
                format!("unexpected result status {:?}", status),
                raw(),
            )),
            ReplyEnvelope::Failure { error, .. } => Ok(GainReply::Rejected(match error {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Gain-control client bound to one DSP connection.
pub struct AtlasDriver {
    link: Correlator<AtlasCodec>,
    command_timeout: Duration,
}

impl AtlasDriver {
    pub async fn connect(
        address: IpAddr,
        port: u16,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        let link = Correlator::open(Arc::new(AtlasCodec), address, port, connect_timeout).await?;
        Ok(Self::new(link, command_timeout))
    }

    pub fn new(link: Correlator<AtlasCodec>, command_timeout: Duration) -> Self {
        Self {
            link,
            command_timeout,
        }
    }

    pub fn link(&self) -> &Correlator<AtlasCodec> {
        &self.link
    }

    /// Read the current value of one gain stage.
    pub async fn get(&self, target: GainTarget, channel: u16) -> Result<GainParameter> {
        let request = GainRequest::get(target, channel)?;
        match self.link.send_command(&request, self.command_timeout).await? {
            GainReply::Value(value) => GainParameter::new(target, channel, value),
            GainReply::Ok => Err(DeviceError::protocol("get answered without a value", "OK")),
            GainReply::Rejected(message) => Err(rejected(message)),
        }
    }

    /// Write a gain stage. Returns the value the DSP confirmed.
    pub async fn set(&self, parameter: GainParameter) -> Result<GainParameter> {
        let request = GainRequest::set(parameter);
        match self.link.send_command(&request, self.command_timeout).await? {
            GainReply::Ok => Ok(parameter),
            GainReply::Value(value) => {
                GainParameter::new(parameter.target(), parameter.channel(), value)
            }
            GainReply::Rejected(message) => Err(rejected(message)),
        }
    }
}

fn rejected(message: String) -> DeviceError {
    DeviceError::protocol("device rejected command", message)
}

fn model_capabilities(zones: u16) -> Vec<Capability> {
    vec![
        Capability::ZoneGain { zones },
        Capability::SourceGain { sources: zones },
    ]
}

#[async_trait]
impl DeviceDriver for AtlasDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Gain
    }

    async fn ping(&self) -> Result<()> {
        self.get(GainTarget::Zone, 1).await.map(|_| ())
    }

    async fn identify(&self) -> Result<Identification> {
        let first = GainRequest::get(GainTarget::Zone, 1)?;
        match self.link.send_command(&first, self.command_timeout).await {
            Ok(GainReply::Value(_)) | Ok(GainReply::Ok) => {}
            Ok(GainReply::Rejected(message)) => {
                return Ok(Identification::Unidentified {
                    vendor: Some(VENDOR.to_string()),
                    reason: format!("zone 1 probe rejected: {}", message),
                })
            }
            Err(DeviceError::CommandTimeout { .. }) => {
                return Ok(Identification::Unidentified {
                    vendor: None,
                    reason: "no gain-control reply".to_string(),
                })
            }
            Err(e) => return Err(e),
        }

        let probe = GainRequest::get(GainTarget::Zone, AZM8_PROBE_CHANNEL)?;
        let (model, zones) = match self.link.send_command(&probe, self.command_timeout).await {
            Ok(GainReply::Value(_)) | Ok(GainReply::Ok) => ("AZM8", 8),
            Ok(GainReply::Rejected(_)) => ("AZM4", 4),
            Err(DeviceError::CommandTimeout { .. }) | Err(DeviceError::Protocol { .. }) => {
                return Ok(Identification::Unidentified {
                    vendor: Some(VENDOR.to_string()),
                    reason: format!("zone {} probe inconclusive", AZM8_PROBE_CHANNEL),
                })
            }
            Err(e) => return Err(e),
        };

        Ok(Identification::Confirmed {
            vendor: VENDOR.to_string(),
            model: Some(model.to_string()),
            capabilities: model_capabilities(zones),
        })
    }

    async fn close(&self) {
        self.link.shutdown();
    }
}
