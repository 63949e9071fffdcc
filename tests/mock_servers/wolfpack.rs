#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock Wolfpack HDMI matrix
//!
//! Commands end with `.`; each is answered `OK` or `ERR` (CRLF).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct MockWolfpackState {
    pub inputs: u16,
    pub outputs: u16,
    /// output -> input
    pub routes: HashMap<u16, u16>,
    pub received: Vec<String>,
    /// Record commands without answering them
    pub silent: bool,
}

pub struct MockWolfpack {
    addr: SocketAddr,
    state: Arc<RwLock<MockWolfpackState>>,
    handle: JoinHandle<()>,
    drop_tx: tokio::sync::watch::Sender<bool>,
}

impl MockWolfpack {
    pub async fn start(inputs: u16, outputs: u16) -> Self {
        let state = Arc::new(RwLock::new(MockWolfpackState {
            inputs,
            outputs,
            ..Default::default()
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (drop_tx, drop_rx) = tokio::sync::watch::channel(false);

        let state_clone = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state_clone.clone();
                let drop_rx = drop_rx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, state, drop_rx).await;
                });
            }
        });

        Self {
            addr,
            state,
            handle,
            drop_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn route_of(&self, output: u16) -> Option<u16> {
        self.state.read().await.routes.get(&output).copied()
    }

    pub async fn received(&self) -> Vec<String> {
        self.state.read().await.received.clone()
    }

    pub async fn set_silent(&self, silent: bool) {
        self.state.write().await.silent = silent;
    }

    /// Close every open client connection from the device side.
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(true);
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<RwLock<MockWolfpackState>>,
    mut drop_rx: tokio::sync::watch::Receiver<bool>,
) {
    // Only drops requested after this connection opened apply to it
    drop_rx.borrow_and_update();
    let mut buf = [0u8; 512];
    let mut pending = Vec::new();

    loop {
        let n = tokio::select! {
            _ = drop_rx.changed() => return,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
        };
        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|&b| b == b'.') {
            let command: Vec<u8> = pending.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&command).trim().to_string();
            let reply = {
                let mut state = state.write().await;
                state.received.push(command.clone());
                if state.silent {
                    continue;
                }
                apply(&command, &mut state)
            };
            if stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

fn apply(command: &str, state: &mut MockWolfpackState) -> &'static str {
    let body = command.trim_end_matches('.');
    let Some((input, outputs)) = body.split_once('X') else {
        return "ERR\r\n";
    };
    let Ok(input) = input.parse::<u16>() else {
        return "ERR\r\n";
    };
    let outputs: Option<Vec<u16>> = outputs.split('&').map(|o| o.parse().ok()).collect();
    let Some(outputs) = outputs else {
        return "ERR\r\n";
    };
    let in_range = (1..=state.inputs).contains(&input)
        && outputs.iter().all(|o| (1..=state.outputs).contains(o));
    if !in_range {
        return "ERR\r\n";
    }
    for output in outputs {
        state.routes.insert(output, input);
    }
    "OK\r\n"
}
