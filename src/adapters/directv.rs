//! DirecTV receiver control over SHEF (Set-top HTTP Exported Functionality)
//!
//! One HTTP GET per exchange on port 8080. Every JSON body carries a
//! `status` object; the receiver answers 403 when "External Device Access"
//! is switched off in its settings.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;

use super::traits::DeviceDriver;
use crate::device::{Capability, DriverKind, Identification};
use crate::error::{DeviceError, Result};
use crate::transport::RetryPolicy;

pub const DEFAULT_PORT: u16 = 8080;

/// `clientAddr` of the main receiver (as opposed to a Genie client box)
pub const DEFAULT_CLIENT_ADDR: &str = "0";

const VENDOR: &str = "DirecTV";
const FORBIDDEN: u16 = 403;

/// Remote keys accepted by `/remote/processKey`.
pub const KEYS: &[&str] = &[
    "power", "poweron", "poweroff", "format", "pause", "rew", "replay", "stop", "advance",
    "ffwd", "record", "play", "guide", "active", "list", "exit", "back", "menu", "info", "up",
    "down", "left", "right", "select", "red", "green", "yellow", "blue", "chanup", "chandown",
    "prev", "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "dash", "enter",
];

/// `status` object present in every SHEF reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShefStatus {
    pub code: u16,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusOnly {
    status: ShefStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub access_card_id: Option<String>,
    #[serde(default)]
    pub stb_software_version: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub system_time: Option<i64>,
}

/// Power state reported by `/info/mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverMode {
    Active,
    Standby,
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    mode: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramInfo {
    #[serde(default)]
    pub callsign: Option<String>,
    pub major: u16,
    #[serde(default)]
    pub minor: Option<u16>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub episode_title: Option<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub is_off_air: Option<bool>,
}

/// Classify one SHEF exchange by HTTP status and body.
///
/// 403 in either place is `FeatureDisabled`; any other failure status or a
/// body without a readable `status` object is a `Protocol` error.
pub fn classify(http_status: u16, body: &str) -> Result<serde_json::Value> {
    if http_status == FORBIDDEN {
        return Err(forbidden());
    }

    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if !(200..300).contains(&http_status) => {
            return Err(DeviceError::protocol(format!("HTTP {}", http_status), body))
        }
        Err(e) => return Err(DeviceError::protocol(format!("unparseable reply: {}", e), body)),
    };

    let status = serde_json::from_value::<StatusOnly>(value.clone())
        .map_err(|_| DeviceError::protocol("reply has no status object", body))?
        .status;

    if status.code == FORBIDDEN {
        return Err(forbidden());
    }
    if status.code != 200 || !(200..300).contains(&http_status) {
        return Err(DeviceError::protocol(
            format!("status {}: {}", status.code, status.msg),
            body,
        ));
    }
    Ok(value)
}

fn forbidden() -> DeviceError {
    DeviceError::FeatureDisabled("external device access disabled".to_string())
}

pub fn validate_channel(major: u16, minor: Option<u16>) -> Result<()> {
    if major == 0 || major > 9999 {
        return Err(DeviceError::DomainValidation(format!(
            "channel {} outside 1..=9999",
            major
        )));
    }
    if minor == Some(0) {
        return Err(DeviceError::DomainValidation("sub-channel 0 is not valid".into()));
    }
    Ok(())
}

pub fn validate_key(key: &str) -> Result<()> {
    if KEYS.contains(&key) {
        Ok(())
    } else {
        Err(DeviceError::DomainValidation(format!("unknown remote key {:?}", key)))
    }
}

fn validate_serial(command: &str) -> Result<()> {
    if !command.is_empty()
        && command.len() % 2 == 0
        && command.chars().all(|c| c.is_ascii_hexdigit())
    {
        Ok(())
    } else {
        Err(DeviceError::DomainValidation(format!(
            "serial command {:?} is not an even-length hex string",
            command
        )))
    }
}

/// SHEF client for one receiver.
pub struct DirectvDriver {
    http: Client,
    base: Url,
    peer: String,
    client_addr: String,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl DirectvDriver {
    pub fn new(
        address: IpAddr,
        port: u16,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let peer = SocketAddr::new(address, port).to_string();
        let base = Url::parse(&format!("http://{}/", peer))
            .map_err(|e| DeviceError::connectivity(&peer, e))?;
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DeviceError::connectivity(&peer, format!("HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base,
            peer,
            client_addr: DEFAULT_CLIENT_ADDR.to_string(),
            request_timeout,
            retry,
        })
    }

    /// Address a Genie client box instead of the main receiver.
    pub fn with_client_addr(mut self, client_addr: impl Into<String>) -> Self {
        self.client_addr = client_addr.into();
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn version(&self) -> Result<VersionInfo> {
        self.fetch("/info/getVersion", &[], &self.retry).await
    }

    pub async fn mode(&self) -> Result<ReceiverMode> {
        let body: ModeBody = self.fetch("/info/mode", &[], &self.retry).await?;
        match body.mode {
            0 => Ok(ReceiverMode::Active),
            1 => Ok(ReceiverMode::Standby),
            other => Err(DeviceError::protocol(
                "unknown receiver mode",
                other.to_string(),
            )),
        }
    }

    pub async fn tune(&self, major: u16, minor: Option<u16>) -> Result<()> {
        validate_channel(major, minor)?;
        let query = channel_query(major, minor);
        self.fetch::<StatusOnly>("/tv/tune", &query, &self.retry)
            .await
            .map(|_| ())
    }

    pub async fn program_info(&self, major: u16, minor: Option<u16>) -> Result<ProgramInfo> {
        validate_channel(major, minor)?;
        let query = channel_query(major, minor);
        self.fetch("/tv/getProgInfo", &query, &self.retry).await
    }

    /// Press one remote key. Not retried: a repeated press is not harmless.
    pub async fn key_press(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let query = [("key", key.to_string()), ("hold", "keyPress".to_string())];
        self.fetch::<StatusOnly>("/remote/processKey", &query, &RetryPolicy::single_attempt())
            .await
            .map(|_| ())
    }

    /// Raw serial command (hex). Not retried.
    pub async fn serial_command(&self, command: &str) -> Result<serde_json::Value> {
        validate_serial(command)?;
        let query = [("cmd", command.to_ascii_uppercase())];
        self.fetch(
            "/serial/processCommand",
            &query,
            &RetryPolicy::single_attempt(),
        )
        .await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        retry: &RetryPolicy,
    ) -> Result<T> {
        let url = self.url(path, query)?;
        let value = retry.run(path, || self.exchange(url.clone())).await?;
        serde_json::from_value(value.clone())
            .map_err(|e| DeviceError::protocol(format!("unexpected {} body: {}", path, e), value.to_string()))
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| DeviceError::connectivity(&self.peer, e))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            pairs.append_pair("clientAddr", &self.client_addr);
        }
        Ok(url)
    }

    async fn exchange(&self, url: Url) -> Result<serde_json::Value> {
        tracing::debug!("SHEF -> {}", url);
        let response = self.http.get(url).send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        tracing::debug!("SHEF <- {} {}", status, body);
        classify(status, &body)
    }

    fn transport_error(&self, e: reqwest::Error) -> DeviceError {
        if e.is_timeout() {
            DeviceError::CommandTimeout {
                after: self.request_timeout,
            }
        } else {
            DeviceError::connectivity(&self.peer, e)
        }
    }
}

fn channel_query(major: u16, minor: Option<u16>) -> Vec<(&'static str, String)> {
    let mut query = vec![("major", major.to_string())];
    if let Some(minor) = minor {
        query.push(("minor", minor.to_string()));
    }
    query
}

#[async_trait]
impl DeviceDriver for DirectvDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Satellite
    }

    async fn ping(&self) -> Result<()> {
        self.mode().await.map(|_| ())
    }

    async fn identify(&self) -> Result<Identification> {
        match self.version().await {
            Ok(version) => Ok(Identification::Confirmed {
                vendor: VENDOR.to_string(),
                model: version.stb_software_version,
                capabilities: vec![Capability::Tune, Capability::KeyPress, Capability::ProgramInfo],
            }),
            Err(DeviceError::Protocol { reason, .. }) => Ok(Identification::Unidentified {
                vendor: None,
                reason: format!("no SHEF version reply: {}", reason),
            }),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_STATUS: &str = r#""status":{"code":200,"msg":"OK.","query":"/tv/tune?major=206"}"#;

    #[test]
    fn http_403_is_feature_disabled() {
        let body = r#"{"status":{"code":403,"msg":"Forbidden.","commandResult":1}}"#;
        assert!(matches!(
            classify(403, body),
            Err(DeviceError::FeatureDisabled(_))
        ));
        assert!(matches!(
            classify(403, "<html>forbidden</html>"),
            Err(DeviceError::FeatureDisabled(_))
        ));
    }

    #[test]
    fn status_code_403_in_body_is_feature_disabled() {
        let body = r#"{"status":{"code":403,"msg":"Forbidden."}}"#;
        assert!(matches!(
            classify(200, body),
            Err(DeviceError::FeatureDisabled(_))
        ));
    }

    #[test]
    fn other_failures_are_protocol_errors() {
        let bad_channel = r#"{"status":{"code":500,"msg":"Invalid channel."}}"#;
        match classify(200, bad_channel) {
            Err(DeviceError::Protocol { reason, raw }) => {
                assert!(reason.contains("Invalid channel"));
                assert_eq!(raw, bad_channel);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(matches!(
            classify(404, "Not Found"),
            Err(DeviceError::Protocol { .. })
        ));
        assert!(matches!(
            classify(200, "{\"mode\":0}"),
            Err(DeviceError::Protocol { .. })
        ));
        assert!(matches!(
            classify(200, ""),
            Err(DeviceError::Protocol { .. })
        ));
    }

    #[test]
    fn success_returns_body() {
        let body = format!("{{{}}}", OK_STATUS);
        let value = classify(200, &body).unwrap();
        assert_eq!(value["status"]["code"], 200);
    }

    #[test]
    fn program_info_tolerates_missing_fields() {
        let body = format!(
            r#"{{"callsign":"ESPNHD","major":206,"minor":65535,"title":"SportsCenter",{}}}"#,
            OK_STATUS
        );
        let info: ProgramInfo = serde_json::from_value(classify(200, &body).unwrap()).unwrap();
        assert_eq!(info.callsign.as_deref(), Some("ESPNHD"));
        assert_eq!(info.major, 206);
        assert_eq!(info.episode_title, None);
    }

    #[test]
    fn local_validation() {
        assert!(validate_channel(206, None).is_ok());
        assert!(validate_channel(0, None).is_err());
        assert!(validate_channel(10000, None).is_err());
        assert!(validate_channel(2, Some(0)).is_err());
        assert!(validate_key("chanup").is_ok());
        assert!(validate_key("selfdestruct").is_err());
        assert!(validate_serial("FA87").is_ok());
        assert!(validate_serial("FA8").is_err());
        assert!(validate_serial("ZZ").is_err());
    }

    #[test]
    fn urls_carry_client_addr() {
        let driver = DirectvDriver::new(
            "10.1.1.20".parse().unwrap(),
            DEFAULT_PORT,
            Duration::from_secs(2),
            RetryPolicy::default(),
        )
        .unwrap();
        let url = driver
            .url("/tv/tune", &channel_query(206, Some(1)))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://10.1.1.20:8080/tv/tune?major=206&minor=1&clientAddr=0"
        );
    }

    #[tokio::test]
    async fn silent_receiver_is_bounded_by_request_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and never answer
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let driver = DirectvDriver::new(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_millis(200),
            RetryPolicy::default(),
        )
        .unwrap();
        let started = std::time::Instant::now();
        let result = driver.key_press("guide").await;

        assert_eq!(
            result,
            Err(DeviceError::CommandTimeout {
                after: Duration::from_millis(200)
            })
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        holder.abort();
    }
}
