//! Device registry seam
//!
//! Persistence lives outside this crate. The control core reads endpoint,
//! vendor/model and capabilities from the registry and writes back only
//! status and last-seen.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::device::{Device, DeviceId, DeviceStatus, InvalidTransition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown device: {0}")]
    NotFound(DeviceId),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// External collaborator holding device records.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get(&self, id: &DeviceId) -> Option<Device>;

    async fn list(&self) -> Vec<Device>;

    /// Insert or replace a record (manual entry, confirmed discovery).
    async fn insert(&self, device: Device);

    async fn remove(&self, id: &DeviceId) -> Option<Device>;

    /// Write a status change. Illegal transitions are rejected.
    async fn record_status(
        &self,
        id: &DeviceId,
        status: DeviceStatus,
        seen: Option<DateTime<Utc>>,
    ) -> Result<DeviceStatus, RegistryError>;
}

pub type SharedRegistry = Arc<dyn DeviceRegistry>;

/// Registry kept in process memory.
#[derive(Default)]
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    async fn insert(&self, device: Device) {
        self.devices
            .write()
            .await
            .insert(device.id().clone(), device);
    }

    async fn remove(&self, id: &DeviceId) -> Option<Device> {
        self.devices.write().await.remove(id)
    }

    async fn record_status(
        &self,
        id: &DeviceId,
        status: DeviceStatus,
        seen: Option<DateTime<Utc>>,
    ) -> Result<DeviceStatus, RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let previous = device.status();
        device.set_status(status, seen)?;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DriverKind;

    fn device(id: &str) -> Device {
        Device::with_kind(
            DeviceId::new(id),
            "10.0.0.5".parse().unwrap(),
            5000,
            DriverKind::Matrix,
        )
    }

    #[tokio::test]
    async fn record_status_returns_previous_and_stamps_last_seen() {
        let registry = InMemoryRegistry::new();
        registry.insert(device("wolfpack-1")).await;

        let id = DeviceId::new("wolfpack-1");
        let seen = Utc::now();
        let previous = registry
            .record_status(&id, DeviceStatus::Discovered, Some(seen))
            .await
            .unwrap();

        assert_eq!(previous, DeviceStatus::Unknown);
        let stored = registry.get(&id).await.unwrap();
        assert_eq!(stored.status(), DeviceStatus::Discovered);
        assert_eq!(stored.last_seen(), Some(seen));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_not_written() {
        let registry = InMemoryRegistry::new();
        registry.insert(device("wolfpack-2")).await;
        let id = DeviceId::new("wolfpack-2");

        let result = registry
            .record_status(&id, DeviceStatus::Online, None)
            .await;
        assert!(matches!(result, Err(RegistryError::Transition(_))));
        assert_eq!(
            registry.get(&id).await.unwrap().status(),
            DeviceStatus::Unknown
        );
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let registry = InMemoryRegistry::new();
        let result = registry
            .record_status(&DeviceId::new("nope"), DeviceStatus::Discovered, None)
            .await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }
}
