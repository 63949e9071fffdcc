use async_trait::async_trait;

use crate::device::{DriverKind, Identification};
use crate::error::Result;

// =============================================================================
// FrameCodec - per-vendor wire encoding for persistent stream protocols
// =============================================================================

/// How replies on a stream are matched to the commands that caused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationMode {
    /// Replies carry the request id; commands may be pipelined.
    ById,
    /// One command in flight; the next frame answers it unless it echoes a
    /// different id.
    Serial,
}

/// Encode/decode capability shared by the stream-based drivers.
///
/// Implementations are pure: no I/O, no state. Validation that can be done
/// without the device (value ranges, port numbers) belongs in `encode` so a
/// bad request never reaches the wire.
pub trait FrameCodec: Send + Sync + 'static {
    type Request: Send + Sync;
    type Reply: Send + 'static;

    /// Inbound message terminator.
    fn terminator(&self) -> &'static [u8];

    fn correlation(&self) -> CorrelationMode;

    /// Build the framed bytes for `request`, tagged with correlation `id`.
    fn encode(&self, request: &Self::Request, id: u64) -> Result<Vec<u8>>;

    /// Extract the correlation id an inbound frame carries, if any.
    ///
    /// `Serial` codecs return the echoed wire id of acknowledgments so an
    /// answer to an earlier, timed-out command is not taken for the current one.
    fn correlation_id(&self, frame: &[u8]) -> Option<u64>;

    /// `id` as it appears on the wire, for codecs whose ids wrap.
    fn wire_id(&self, id: u64) -> u64 {
        id
    }

    /// Whether a `Serial` device echoes the wire id in its success replies.
    ///
    /// When it does not, a late reply cannot be told apart from the next
    /// command's, so the link stops accepting commands after a timeout.
    fn echoes_id(&self) -> bool {
        false
    }

    /// Turn one inbound frame into a reply or a typed error.
    fn decode(&self, frame: &[u8]) -> Result<Self::Reply>;
}

// =============================================================================
// DeviceDriver - what the connection manager and discovery need from any driver
// =============================================================================

/// Uniform lifecycle surface over every vendor driver.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// One lightweight round-trip proving the device answers.
    async fn ping(&self) -> Result<()>;

    /// Handshake that confirms the vendor and, where possible, the model.
    async fn identify(&self) -> Result<Identification>;

    /// Release the underlying link and fail anything still outstanding.
    async fn close(&self);
}
