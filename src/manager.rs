//! Connection manager
//!
//! Owns at most one live driver per device id. Drivers are opened lazily on
//! the first command and released on `close` or when the link drops. Status
//! moves only along the device state machine:
//!
//! - a dropped link takes an online device offline
//! - only an explicit `test` brings an offline device back
//! - `error` stays put until `retry`
//!
//! There is no background reconnect loop.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::adapters::atlas::{GainParameter, GainTarget};
use crate::adapters::directv::{self, ProgramInfo, ReceiverMode};
use crate::adapters::itach::{IrCommand, IrLibrary};
use crate::adapters::wolfpack::{MatrixSize, RouteRequest};
use crate::adapters::{DeviceDriver, DriverHandle, DriverSettings};
use crate::bus::{BusEvent, SharedBus};
use crate::device::{Device, DeviceId, DeviceStatus};
use crate::error::DeviceError;
use crate::registry::{RegistryError, SharedRegistry};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown device: {0}")]
    NotFound(DeviceId),
    #[error("device {0} has no driver assigned")]
    NoDriver(DeviceId),
    #[error("device {0} is in error; manual retry required")]
    RequiresRetry(DeviceId),
    #[error("device {0} is offline; run a test to bring it back")]
    Offline(DeviceId),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

type Slot = Arc<OnceCell<Arc<DriverHandle>>>;
type Slots = Arc<Mutex<HashMap<DeviceId, Slot>>>;

fn lock(slots: &Mutex<HashMap<DeviceId, Slot>>) -> MutexGuard<'_, HashMap<DeviceId, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `id` only if it still maps to the slot `ours` points at.
fn remove_slot(
    slots: &Mutex<HashMap<DeviceId, Slot>>,
    id: &DeviceId,
    ours: *const OnceCell<Arc<DriverHandle>>,
) -> Option<Slot> {
    let mut map = lock(slots);
    if map.get(id).is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), ours)) {
        map.remove(id)
    } else {
        None
    }
}

/// Status writes plus the matching bus event.
#[derive(Clone)]
struct StatusWriter {
    registry: SharedRegistry,
    bus: SharedBus,
}

impl StatusWriter {
    async fn set(&self, id: &DeviceId, to: DeviceStatus) -> Result<DeviceStatus, RegistryError> {
        let seen = matches!(to, DeviceStatus::Online).then(Utc::now);
        let from = self.registry.record_status(id, to, seen).await?;
        if from != to {
            tracing::info!("{}: {} -> {}", id, from, to);
            self.bus.publish(BusEvent::DeviceStatusChanged {
                device_id: id.clone(),
                from,
                to,
            });
        }
        Ok(from)
    }

    /// Online -> offline after a transport failure. Other states are left alone.
    async fn mark_offline(&self, id: &DeviceId) {
        let online = self
            .registry
            .get(id)
            .await
            .is_some_and(|d| d.status() == DeviceStatus::Online);
        if online {
            if let Err(e) = self.set(id, DeviceStatus::Offline).await {
                tracing::warn!("{}: could not record offline: {}", id, e);
            }
        }
    }
}

pub struct ConnectionManager {
    status: StatusWriter,
    settings: DriverSettings,
    ir_library: IrLibrary,
    slots: Slots,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        registry: SharedRegistry,
        bus: SharedBus,
        settings: DriverSettings,
        ir_library: IrLibrary,
    ) -> Self {
        Self {
            status: StatusWriter { registry, bus },
            settings,
            ir_library,
            slots: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    fn registry(&self) -> &SharedRegistry {
        &self.status.registry
    }

    async fn device(&self, id: &DeviceId) -> Result<Device, ManagerError> {
        self.registry()
            .get(id)
            .await
            .ok_or_else(|| ManagerError::NotFound(id.clone()))
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        lock(&self.slots)
            .get(id)
            .is_some_and(|slot| slot.initialized())
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Live driver for `id`, opened on first use.
    ///
    /// Refused for devices in `error` (retry first) and `offline` (test first).
    pub async fn get_connection(&self, id: &DeviceId) -> Result<Arc<DriverHandle>, ManagerError> {
        let device = self.device(id).await?;
        match device.status() {
            DeviceStatus::Error => return Err(ManagerError::RequiresRetry(id.clone())),
            DeviceStatus::Offline => return Err(ManagerError::Offline(id.clone())),
            _ => {}
        }
        match self.connect(&device).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if e.is_transport_failure() {
                    self.status.mark_offline(id).await;
                }
                Err(e.into())
            }
        }
    }

    async fn connect(&self, device: &Device) -> Result<Arc<DriverHandle>, DeviceError> {
        let id = device.id().clone();
        let kind = device.kind.ok_or_else(|| {
            DeviceError::DomainValidation(format!("device {} has no driver assigned", id))
        })?;

        let slot = lock(&self.slots).entry(id.clone()).or_default().clone();
        let opened = slot
            .get_or_try_init(|| async {
                let handle =
                    DriverHandle::open(kind, device.address(), device.port(), &self.settings)
                        .await?;
                let handle = Arc::new(handle);
                if let Some(lost) = handle.lost() {
                    self.watch(id.clone(), Arc::downgrade(&slot), lost);
                }
                tracing::info!("{}: connected to {}", id, device.endpoint());
                self.status.bus.publish(BusEvent::ConnectionOpened {
                    device_id: id.clone(),
                    peer: device.endpoint(),
                });
                Ok::<_, DeviceError>(handle)
            })
            .await;

        match opened {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                remove_slot(&self.slots, &id, Arc::as_ptr(&slot));
                Err(e)
            }
        }
    }

    /// Take the device offline when its persistent link drops.
    fn watch(
        &self,
        id: DeviceId,
        slot: Weak<OnceCell<Arc<DriverHandle>>>,
        lost: CancellationToken,
    ) {
        let slots = self.slots.clone();
        let status = self.status.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = lost.cancelled() => {}
            }
            // Closed on purpose: the slot is already gone
            if remove_slot(&slots, &id, slot.as_ptr()).is_none() {
                return;
            }
            tracing::warn!("{}: connection lost", id);
            status.bus.publish(BusEvent::ConnectionLost {
                device_id: id.clone(),
                reason: "transport closed".to_string(),
            });
            status.mark_offline(&id).await;
        });
    }

    /// One lightweight round-trip; status follows the result.
    ///
    /// New and unidentified devices walk through `identifying` to `online`
    /// or `error`. Online and offline devices land on `online` or `offline`.
    pub async fn test(&self, id: &DeviceId) -> Result<DeviceStatus, ManagerError> {
        let device = self.device(id).await?;
        if device.kind.is_none() {
            return Err(ManagerError::NoDriver(id.clone()));
        }

        let (on_failure, path): (DeviceStatus, &[DeviceStatus]) = match device.status() {
            DeviceStatus::Error => return Err(ManagerError::RequiresRetry(id.clone())),
            DeviceStatus::Unknown => (
                DeviceStatus::Error,
                &[DeviceStatus::Discovered, DeviceStatus::Identifying],
            ),
            DeviceStatus::Discovered => (DeviceStatus::Error, &[DeviceStatus::Identifying]),
            DeviceStatus::Unidentified => (
                DeviceStatus::Error,
                &[DeviceStatus::Discovered, DeviceStatus::Identifying],
            ),
            DeviceStatus::Identifying => (DeviceStatus::Error, &[]),
            DeviceStatus::Online | DeviceStatus::Offline => (DeviceStatus::Offline, &[]),
        };
        for &step in path {
            self.status.set(id, step).await?;
        }

        let outcome = match self.connect(&device).await {
            Ok(handle) => handle.ping().await,
            Err(e) => Err(e),
        };

        let next = match &outcome {
            Ok(()) => DeviceStatus::Online,
            Err(e) => {
                tracing::warn!("{}: test failed: {}", id, e);
                self.close(id).await;
                on_failure
            }
        };
        self.status.set(id, next).await?;
        Ok(next)
    }

    /// Manual retry: `error` or `unidentified` back to `discovered`.
    pub async fn retry(&self, id: &DeviceId) -> Result<DeviceStatus, ManagerError> {
        self.device(id).await?;
        self.status.set(id, DeviceStatus::Discovered).await?;
        Ok(DeviceStatus::Discovered)
    }

    /// Release the driver; outstanding commands fail with a connectivity error.
    /// Returns false when nothing was open.
    pub async fn close(&self, id: &DeviceId) -> bool {
        let slot = lock(&self.slots).remove(id);
        match slot.and_then(|slot| slot.get().cloned()) {
            Some(handle) => {
                handle.close().await;
                tracing::info!("{}: connection closed", id);
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<(DeviceId, Slot)> = lock(&self.slots).drain().collect();
        for (id, slot) in drained {
            if let Some(handle) = slot.get() {
                handle.close().await;
                tracing::debug!("{}: connection closed", id);
            }
        }
    }

    /// Record side effects of one command outcome.
    async fn observe<T>(
        &self,
        id: &DeviceId,
        result: Result<T, DeviceError>,
    ) -> Result<T, ManagerError> {
        match &result {
            Ok(_) => {
                let online = self
                    .registry()
                    .get(id)
                    .await
                    .is_some_and(|d| d.status() == DeviceStatus::Online);
                if online {
                    if let Err(e) = self
                        .registry()
                        .record_status(id, DeviceStatus::Online, Some(Utc::now()))
                        .await
                    {
                        tracing::debug!("{}: last-seen not recorded: {}", id, e);
                    }
                }
            }
            Err(DeviceError::CommandTimeout { after }) => {
                self.status.bus.publish(BusEvent::CommandTimedOut {
                    device_id: id.clone(),
                    after_ms: after.as_millis() as u64,
                });
                let retired = lock(&self.slots)
                    .get(id)
                    .and_then(|slot| slot.get().cloned())
                    .is_some_and(|handle| !handle.accepts_commands());
                if retired {
                    // Reopened on the next command; status stays as it was
                    self.close(id).await;
                }
            }
            Err(e) if e.is_transport_failure() => {
                // No slot left means closed on purpose or already seen by the watcher
                if self.close(id).await {
                    self.status.mark_offline(id).await;
                }
            }
            Err(_) => {}
        }
        result.map_err(ManagerError::from)
    }

    // =========================================================================
    // Device operations. Local validation runs before any connection opens.
    // =========================================================================

    pub async fn set_gain(
        &self,
        id: &DeviceId,
        parameter: GainParameter,
    ) -> Result<GainParameter, ManagerError> {
        let device = self.device(id).await?;
        parameter.check_limit(channel_limit(&device, parameter.target()))?;
        let handle = self.get_connection(id).await?;
        let result = handle.as_gain()?.set(parameter).await;
        self.observe(id, result).await
    }

    pub async fn get_gain(
        &self,
        id: &DeviceId,
        target: GainTarget,
        channel: u16,
    ) -> Result<GainParameter, ManagerError> {
        let device = self.device(id).await?;
        crate::adapters::atlas::to_internal(channel)?;
        if let Some(limit) = channel_limit(&device, target) {
            if channel > limit {
                return Err(DeviceError::DomainValidation(format!(
                    "{:?} channel {} exceeds device limit of {}",
                    target, channel, limit
                ))
                .into());
            }
        }
        let handle = self.get_connection(id).await?;
        let result = handle.as_gain()?.get(target, channel).await;
        self.observe(id, result).await
    }

    pub async fn route(
        &self,
        id: &DeviceId,
        input: u16,
        outputs: &[u16],
    ) -> Result<RouteRequest, ManagerError> {
        let device = self.device(id).await?;
        let size = device
            .matrix_size()
            .map(|(inputs, outputs)| MatrixSize::new(inputs, outputs))
            .unwrap_or(self.settings.matrix);
        let request = size.route(input, outputs)?;
        let handle = self.get_connection(id).await?;
        let result = handle.as_matrix()?.route(&request).await;
        self.observe(id, result.map(|()| request)).await
    }

    pub async fn send_ir(
        &self,
        id: &DeviceId,
        port: u8,
        command: &IrCommand,
    ) -> Result<(), ManagerError> {
        self.device(id).await?;
        let request = self.ir_library.prepare(port, command)?;
        let handle = self.get_connection(id).await?;
        let result = handle.as_ir()?.send(&request).await;
        self.observe(id, result).await
    }

    pub async fn tune(
        &self,
        id: &DeviceId,
        major: u16,
        minor: Option<u16>,
    ) -> Result<(), ManagerError> {
        directv::validate_channel(major, minor)?;
        let handle = self.get_connection(id).await?;
        let result = handle.as_satellite()?.tune(major, minor).await;
        self.observe(id, result).await
    }

    pub async fn key_press(&self, id: &DeviceId, key: &str) -> Result<(), ManagerError> {
        directv::validate_key(key)?;
        let handle = self.get_connection(id).await?;
        let result = handle.as_satellite()?.key_press(key).await;
        self.observe(id, result).await
    }

    pub async fn program_info(
        &self,
        id: &DeviceId,
        major: u16,
        minor: Option<u16>,
    ) -> Result<ProgramInfo, ManagerError> {
        directv::validate_channel(major, minor)?;
        let handle = self.get_connection(id).await?;
        let result = handle.as_satellite()?.program_info(major, minor).await;
        self.observe(id, result).await
    }

    pub async fn receiver_mode(&self, id: &DeviceId) -> Result<ReceiverMode, ManagerError> {
        let handle = self.get_connection(id).await?;
        let result = handle.as_satellite()?.mode().await;
        self.observe(id, result).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn channel_limit(device: &Device, target: GainTarget) -> Option<u16> {
    match target {
        GainTarget::Zone => device.zone_count(),
        GainTarget::Source => device.source_count(),
    }
}
