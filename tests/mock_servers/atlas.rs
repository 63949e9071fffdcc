#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock Atlas AZM DSP
//!
//! CRLF-terminated JSON frames on a random port. Channels past the model's
//! zone count answer with an error envelope, which is how the real unit
//! distinguishes an AZM4 from an AZM8.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockAtlasState {
    pub zones: u16,
    /// Wire parameter name -> dB
    pub gains: HashMap<String, f64>,
    /// Swallow requests without replying
    pub silent: bool,
    /// Reply delay
    pub delay: Duration,
    /// Answer pipelined requests newest first
    pub reverse_order: bool,
    /// Raw frames received
    pub received: Vec<String>,
}

impl MockAtlasState {
    fn new(zones: u16) -> Self {
        Self {
            zones,
            gains: HashMap::new(),
            silent: false,
            delay: Duration::ZERO,
            reverse_order: false,
            received: Vec::new(),
        }
    }
}

pub struct MockAtlasDsp {
    addr: SocketAddr,
    state: Arc<RwLock<MockAtlasState>>,
    handle: JoinHandle<()>,
}

impl MockAtlasDsp {
    /// Start a mock DSP with `zones` zones (4 = AZM4, 8 = AZM8)
    pub async fn start(zones: u16) -> Self {
        let state = Arc::new(RwLock::new(MockAtlasState::new(zones)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state_clone = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state_clone.clone();
                tokio::spawn(async move {
                    handle_connection(stream, state).await;
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn set_gain(&self, param: &str, value: f64) {
        self.state.write().await.gains.insert(param.to_string(), value);
    }

    pub async fn gain(&self, param: &str) -> Option<f64> {
        self.state.read().await.gains.get(param).copied()
    }

    pub async fn set_silent(&self, silent: bool) {
        self.state.write().await.silent = silent;
    }

    pub async fn set_delay(&self, delay: Duration) {
        self.state.write().await.delay = delay;
    }

    pub async fn set_reverse_order(&self, reverse: bool) {
        self.state.write().await.reverse_order = reverse;
    }

    pub async fn received(&self) -> Vec<String> {
        self.state.read().await.received.clone()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RwLock<MockAtlasState>>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut held: Vec<String> = Vec::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let frame = line.trim().to_string();
                let (reply, silent, delay, reverse) = {
                    let mut state = state.write().await;
                    state.received.push(frame.clone());
                    let reply = process_request(&frame, &mut state);
                    (reply, state.silent, state.delay, state.reverse_order)
                };
                if silent {
                    continue;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if reverse {
                    // Hold one reply back and release the pair newest first
                    held.push(reply);
                    if held.len() < 2 {
                        continue;
                    }
                    let mut out = String::new();
                    while let Some(r) = held.pop() {
                        out.push_str(&r);
                    }
                    if writer.write_all(out.as_bytes()).await.is_err() {
                        break;
                    }
                } else if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn process_request(frame: &str, state: &mut MockAtlasState) -> String {
    let Ok(request) = serde_json::from_str::<Value>(frame) else {
        return "garbage\r\n".to_string();
    };
    let id = request["id"].as_u64().unwrap_or(0);
    let method = request["method"].as_str().unwrap_or_default();
    let param = request["param"].as_str().unwrap_or_default().to_string();

    let index: Option<u16> = param.split_once('_').and_then(|(_, i)| i.parse().ok());
    let known = index.is_some_and(|i| i < state.zones)
        && (param.starts_with("ZoneGain_") || param.starts_with("SourceGain_"));

    let reply = if !known {
        json!({ "id": id, "error": format!("Invalid parameter {}", param) })
    } else if method == "set" {
        let value = request["value"].as_f64().unwrap_or_default();
        state.gains.insert(param, value);
        json!({ "id": id, "result": "OK" })
    } else {
        let value = state.gains.get(&param).copied().unwrap_or(-20.0);
        json!({ "id": id, "result": { "value": value } })
    };
    format!("{}\r\n", reply)
}
