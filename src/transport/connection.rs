//! One TCP stream to one device
//!
//! The read half is owned by a reader task that frames the inbound stream and
//! forwards each message over a bounded channel. The write half sits behind a
//! mutex so concurrent senders never interleave partial frames.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::framing::FrameBuffer;
use super::FrameSink;
use crate::error::{DeviceError, Result};

/// Inbound frames buffered between the reader task and the correlator
const EVENT_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

/// What a connection reports to whoever consumes its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete message, terminator stripped.
    Frame(Vec<u8>),
    /// Socket error or close. Always the last event.
    Closed(String),
}

/// A live stream socket with its reader task.
pub struct Connection {
    peer: String,
    writer: Mutex<OwnedWriteHalf>,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Connect within `connect_timeout` and start framing with `terminator`.
    ///
    /// Refusal, unreachability and the connect deadline all map to
    /// `DeviceError::Connectivity`, never to `CommandTimeout`.
    pub async fn open(
        address: IpAddr,
        port: u16,
        connect_timeout: Duration,
        terminator: &'static [u8],
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let addr = SocketAddr::new(address, port);
        let peer = addr.to_string();

        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                DeviceError::connectivity(
                    &peer,
                    format!("connect timed out after {}ms", connect_timeout.as_millis()),
                )
            })?
            .map_err(|e| DeviceError::connectivity(&peer, e))?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(
            read_half,
            FrameBuffer::new(terminator),
            tx,
            alive.clone(),
            shutdown.clone(),
            peer.clone(),
        ));

        tracing::debug!("Connected to {}", peer);

        Ok((
            Self {
                peer,
                writer: Mutex::new(write_half),
                alive,
                shutdown,
            },
            rx,
        ))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Write one already-framed command.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(DeviceError::connectivity(&self.peer, "connection is closed"));
        }

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        result.map_err(|e| {
            tracing::warn!("Write to {} failed: {}", self.peer, e);
            self.alive.store(false, Ordering::Release);
            self.shutdown.cancel();
            DeviceError::connectivity(&self.peer, e)
        })
    }

    /// Stop the reader; consumers receive a final `Closed` event.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.shutdown.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl FrameSink for Connection {
    async fn send_frame(&self, bytes: &[u8]) -> Result<()> {
        self.send(bytes).await
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn close(&self) {
        Connection::close(self);
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut frames: FrameBuffer,
    tx: mpsc::Sender<TransportEvent>,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
    peer: String,
) {
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break "connection closed".to_string(),
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break "peer closed the connection".to_string(),
                Ok(n) => {
                    let complete = match frames.push(&chunk[..n]) {
                        Ok(complete) => complete,
                        Err(overflow) => {
                            tracing::warn!("Dropping stream from {}: {}", peer, overflow);
                            break overflow.to_string();
                        }
                    };
                    for frame in complete {
                        if tx.send(TransportEvent::Frame(frame)).await.is_err() {
                            // Nobody is listening any more
                            alive.store(false, Ordering::Release);
                            return;
                        }
                    }
                }
                Err(e) => break e.to_string(),
            }
        }
    };

    alive.store(false, Ordering::Release);
    if !frames.pending().is_empty() {
        tracing::debug!(
            "Dropping {} unterminated bytes from {}",
            frames.pending().len(),
            peer
        );
    }
    tracing::debug!("Connection to {} ended: {}", peer, reason);
    if tx.send(TransportEvent::Closed(reason)).await.is_err() {
        tracing::trace!("No dispatcher left for {}", peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::MAX_PENDING_BYTES;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn emits_frames_in_order_then_closed() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"OK\r\nER").await.unwrap();
            sock.write_all(b"R\r\npartial").await.unwrap();
            // Dropping the socket closes it
        });

        let (conn, mut rx) = Connection::open(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_secs(1),
            b"\r\n",
        )
        .await
        .unwrap();
        server.await.unwrap();

        assert_eq!(rx.recv().await, Some(TransportEvent::Frame(b"OK".to_vec())));
        assert_eq!(rx.recv().await, Some(TransportEvent::Frame(b"ERR".to_vec())));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed(_))));
        assert_eq!(rx.recv().await, None);
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn refused_connect_is_connectivity_error() {
        let (listener, port) = listener().await;
        drop(listener);

        let result = Connection::open(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_secs(1),
            b"\r\n",
        )
        .await;
        assert!(matches!(result, Err(DeviceError::Connectivity { .. })));
    }

    #[tokio::test]
    async fn send_after_close_fails_without_writing() {
        let (listener, port) = listener().await;
        let _accept = tokio::spawn(async move { listener.accept().await });

        let (conn, mut rx) = Connection::open(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_secs(1),
            b"\r",
        )
        .await
        .unwrap();

        conn.close();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed("connection closed".to_string()))
        );
        assert!(matches!(
            conn.send(b"getversion\r").await,
            Err(DeviceError::Connectivity { .. })
        ));
    }

    #[tokio::test]
    async fn unterminated_flood_closes_the_connection() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"OK\r").await.unwrap();
            let junk = vec![b'x'; MAX_PENDING_BYTES + 1];
            // The reader may hang up before the whole flood is written
            let _ = sock.write_all(&junk).await;
            sock
        });

        let (conn, mut rx) = Connection::open(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_secs(1),
            b"\r",
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await, Some(TransportEvent::Frame(b"OK".to_vec())));
        match rx.recv().await {
            Some(TransportEvent::Closed(reason)) => assert!(reason.contains("terminator")),
            other => panic!("expected Closed, got {:?}", other),
        }
        assert_eq!(rx.recv().await, None);
        assert!(!conn.is_alive());
        drop(server);
    }
}
