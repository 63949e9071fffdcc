#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock DirecTV receiver (SHEF over HTTP/1.1)
//!
//! A bare TCP responder: one request per connection, JSON body,
//! `Connection: close`.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Clone)]
pub struct MockDirectvState {
    /// "External Device Access" switched off: every call answers 403
    pub access_disabled: bool,
    pub standby: bool,
    pub major: u16,
    pub minor: Option<u16>,
    /// Request paths with query, in arrival order
    pub requests: Vec<String>,
    /// Drop this many connections before answering
    pub fail_next: u32,
}

impl Default for MockDirectvState {
    fn default() -> Self {
        Self {
            access_disabled: false,
            standby: false,
            major: 202,
            minor: None,
            requests: Vec::new(),
            fail_next: 0,
        }
    }
}

pub struct MockDirectvReceiver {
    addr: SocketAddr,
    state: Arc<RwLock<MockDirectvState>>,
    handle: JoinHandle<()>,
}

impl MockDirectvReceiver {
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockDirectvState::default()));
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

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn set_access_disabled(&self, disabled: bool) {
        self.state.write().await.access_disabled = disabled;
    }

    pub async fn set_fail_next(&self, count: u32) {
        self.state.write().await.fail_next = count;
    }

    pub async fn channel(&self) -> (u16, Option<u16>) {
        let state = self.state.read().await;
        (state.major, state.minor)
    }

    pub async fn requests(&self) -> Vec<String> {
        self.state.read().await.requests.clone()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<RwLock<MockDirectvState>>) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let request = String::from_utf8_lossy(&request).to_string();
    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let (status, body) = {
        let mut state = state.write().await;
        state.requests.push(target.clone());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return;
        }
        respond(&target, &mut state)
    };

    let body = body.to_string();
    let reason = if status == 200 { "OK" } else { "Forbidden" };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn ok_status(query: &str) -> Value {
    json!({ "code": 200, "commandResult": 0, "msg": "OK.", "query": query })
}

fn respond(target: &str, state: &mut MockDirectvState) -> (u16, Value) {
    let url = Url::parse(&format!("http://receiver{}", target)).unwrap();
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.to_string())
    };

    if state.access_disabled {
        return (
            403,
            json!({ "status": { "code": 403, "msg": "Forbidden.", "query": target } }),
        );
    }

    match url.path() {
        "/info/getVersion" => (
            200,
            json!({
                "accessCardId": "0021-1495-6572",
                "receiverId": "0288 7745 5858",
                "stbSoftwareVersion": "0x4ed7",
                "systemTime": 1_700_000_000,
                "version": "1.2",
                "status": ok_status(target),
            }),
        ),
        "/info/mode" => (
            200,
            json!({ "mode": if state.standby { 1 } else { 0 }, "status": ok_status(target) }),
        ),
        "/tv/tune" => {
            let major = param("major").and_then(|m| m.parse().ok());
            match major {
                Some(major) => {
                    state.major = major;
                    state.minor = param("minor").and_then(|m| m.parse().ok());
                    (200, json!({ "status": ok_status(target) }))
                }
                None => (
                    200,
                    json!({ "status": { "code": 400, "msg": "Missing major.", "query": target } }),
                ),
            }
        }
        "/tv/getProgInfo" => (
            200,
            json!({
                "callsign": "CNNHD",
                "major": param("major").and_then(|m| m.parse::<u16>().ok()).unwrap_or(state.major),
                "minor": 65535,
                "title": "Newsroom",
                "startTime": 1_700_000_000,
                "duration": 3600,
                "isOffAir": false,
                "status": ok_status(target),
            }),
        ),
        "/remote/processKey" => (
            200,
            json!({ "hold": "keyPress", "key": param("key"), "status": ok_status(target) }),
        ),
        _ => (
            200,
            json!({ "status": { "code": 404, "msg": "Not found.", "query": target } }),
        ),
    }
}
