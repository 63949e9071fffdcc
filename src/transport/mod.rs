//! Stream transport and command correlation
//!
//! `Connection` owns a socket and turns its byte stream into discrete frames;
//! `Correlator` pairs those frames with the commands that asked for them.
//! `RetryPolicy` sits above both and is chosen per driver.

pub mod connection;
pub mod correlator;
pub mod framing;
pub mod retry;

use async_trait::async_trait;

use crate::error::Result;

pub use connection::{Connection, TransportEvent};
pub use correlator::Correlator;
pub use framing::{FrameBuffer, FrameOverflow};
pub use retry::RetryPolicy;

/// Outbound half of a connection as seen by the correlator.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, bytes: &[u8]) -> Result<()>;

    /// `host:port` of the remote end, for errors and logs.
    fn peer(&self) -> &str;

    fn close(&self) {}
}
