#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock Global Cache iTach IR blaster
//!
//! CR-terminated ASCII lines. `sendir` is acknowledged with `completeir`,
//! ports outside 1..=3 answer `ERR_1:<port>,003`.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub const VERSION: &str = "710-1005-05";

#[derive(Debug, Clone, Default)]
pub struct MockItachState {
    pub received: Vec<String>,
    pub busy: bool,
}

pub struct MockItach {
    addr: SocketAddr,
    state: Arc<RwLock<MockItachState>>,
    handle: JoinHandle<()>,
}

impl MockItach {
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockItachState::default()));
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

    pub async fn set_busy(&self, busy: bool) {
        self.state.write().await.busy = busy;
    }

    pub async fn received(&self) -> Vec<String> {
        self.state.read().await.received.clone()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<RwLock<MockItachState>>) {
    let mut buf = [0u8; 1024];
    let mut pending = Vec::new();

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            let reply = {
                let mut state = state.write().await;
                state.received.push(line.clone());
                process_line(&line, state.busy)
            };
            if stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn process_line(line: &str, busy: bool) -> String {
    if line == "getversion" {
        return format!("{}\r", VERSION);
    }
    let Some(rest) = line.strip_prefix("sendir,") else {
        return "ERR_0:0,001\r".to_string();
    };
    let mut fields = rest.splitn(3, ',');
    let address = fields.next().unwrap_or_default();
    let id = fields.next().unwrap_or_default();
    let port: u8 = address
        .split_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(0);

    if !(1..=3).contains(&port) {
        return format!("ERR_1:{},003\r", port);
    }
    if busy {
        return format!("busyIR,1:{},{}\r", port, id);
    }
    format!("completeir,1:{},{}\r", port, id)
}
