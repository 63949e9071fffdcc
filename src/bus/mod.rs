//! Event bus for the orchestration layer
//!
//! The control core publishes status changes, connection lifecycle and
//! discovery progress here. Dashboards and loggers subscribe; nothing in the
//! core waits on a subscriber.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::device::{DeviceId, DeviceStatus, DriverKind};

/// Event types that can be published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    // Device lifecycle
    DeviceStatusChanged {
        device_id: DeviceId,
        from: DeviceStatus,
        to: DeviceStatus,
    },

    // Connection manager
    ConnectionOpened { device_id: DeviceId, peer: String },
    ConnectionLost { device_id: DeviceId, reason: String },
    CommandTimedOut { device_id: DeviceId, after_ms: u64 },

    // Discovery
    CandidateFound { address: IpAddr, source: String },
    DiscoveryCompleted {
        kind: Option<DriverKind>,
        identified: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}

/// Broadcast fan-out of `BusEvent`s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver `event` to every current subscriber. Returns how many got it;
    /// zero subscribers is normal.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

/// Events a slow subscriber may fall behind by before it sees `Lagged`
pub const BUS_CAPACITY: usize = 256;

pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}
