//! Discovery engine
//!
//! Two strategies feed one candidate set: SSDP responders heard within a
//! bounded window, and a port scan over an address range with a hard cap on
//! probes in flight. Candidates are deduplicated by address and each one gets
//! a single identification pass. One address failing never hides or delays
//! the others.

pub mod identify;
pub mod scan;
pub mod ssdp;

pub use identify::{DriverIdentifier, Identifier};
pub use scan::{AddressRange, Prober, RangeError, TcpProber};
pub use ssdp::{AnnounceListener, Announcement, SsdpListener};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapters::DriverSettings;
use crate::bus::{BusEvent, SharedBus};
use crate::config::{Config, PortConfig};
use crate::device::{Device, DeviceStatus, DriverKind, Identification};
use crate::registry::SharedRegistry;

/// Where a candidate address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Multicast,
    Scan,
}

impl CandidateSource {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::Multicast => "multicast",
            CandidateSource::Scan => "scan",
        }
    }
}

/// An address worth identifying, with the driver kinds to try in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub address: IpAddr,
    pub kinds: Vec<DriverKind>,
    pub sources: Vec<CandidateSource>,
}

/// What to look for.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    /// Hosts to port-scan; no scan when absent
    pub range: Option<AddressRange>,
    /// Restrict to one driver; every kind when absent
    pub kind: Option<DriverKind>,
    pub multicast: bool,
}

impl DiscoveryRequest {
    fn kinds(&self) -> Vec<DriverKind> {
        match self.kind {
            Some(kind) => vec![kind],
            None => DriverKind::ALL.to_vec(),
        }
    }
}

/// Outcome of one discovery run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryResult {
    pub candidates: Vec<Candidate>,
    /// Every address that completed a handshake, confirmed or unidentified
    pub devices: Vec<Device>,
    /// Per-address identification failures
    pub errors: BTreeMap<IpAddr, String>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl DiscoveryResult {
    /// Devices whose vendor was confirmed.
    pub fn identified(&self) -> impl Iterator<Item = &Device> {
        self.devices
            .iter()
            .filter(|d| d.status() == DeviceStatus::Online)
    }

    pub fn device_at(&self, address: IpAddr) -> Option<&Device> {
        self.devices.iter().find(|d| d.address() == address)
    }
}

fn as_millis<S: Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(elapsed.as_millis() as u64)
}

pub struct DiscoveryEngine {
    prober: Arc<dyn Prober>,
    identifier: Arc<dyn Identifier>,
    listener: Arc<dyn AnnounceListener>,
    registry: SharedRegistry,
    bus: SharedBus,
    ports: PortConfig,
    concurrency: usize,
    multicast_window: Duration,
}

impl DiscoveryEngine {
    /// Engine with the real TCP prober, SSDP listener and driver handshakes.
    pub fn new(config: &Config, registry: SharedRegistry, bus: SharedBus) -> Self {
        let settings: DriverSettings = config.driver_settings();
        Self {
            prober: Arc::new(TcpProber::new(config.discovery.probe_timeout())),
            identifier: Arc::new(DriverIdentifier::new(
                &settings,
                config.discovery.identify_timeout(),
            )),
            listener: Arc::new(SsdpListener),
            registry,
            bus,
            ports: config.ports.clone(),
            concurrency: config.discovery.concurrency(),
            multicast_window: config.discovery.multicast_window(),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_identifier(mut self, identifier: Arc<dyn Identifier>) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn AnnounceListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn discover(&self, request: &DiscoveryRequest) -> DiscoveryResult {
        let started = Instant::now();
        let kinds = request.kinds();
        let targets: Vec<(DriverKind, u16)> = kinds
            .iter()
            .map(|&kind| (kind, self.ports.for_kind(kind)))
            .collect();

        tracing::info!(
            "Discovery started (range: {}, kinds: {:?}, multicast: {})",
            request
                .range
                .map(|r| r.to_string())
                .unwrap_or_else(|| "none".to_string()),
            kinds,
            request.multicast
        );

        let multicast = async {
            if request.multicast {
                self.listener.listen(self.multicast_window).await
            } else {
                Vec::new()
            }
        };
        let scanned = async {
            match &request.range {
                Some(range) => {
                    scan::scan(range, &targets, self.prober.as_ref(), self.concurrency).await
                }
                None => Vec::new(),
            }
        };
        let (announced, scanned) = tokio::join!(multicast, scanned);

        let candidates = merge_candidates(scanned, announced, &kinds);
        for candidate in &candidates {
            self.bus.publish(BusEvent::CandidateFound {
                address: candidate.address,
                source: candidate
                    .sources
                    .iter()
                    .map(CandidateSource::as_str)
                    .collect::<Vec<_>>()
                    .join("+"),
            });
        }

        let outcomes: Vec<(IpAddr, Result<Device, String>)> = stream::iter(candidates.iter())
            .map(|candidate| async move {
                (candidate.address, self.identify_candidate(candidate).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut result = DiscoveryResult {
            candidates,
            ..DiscoveryResult::default()
        };
        for (address, outcome) in outcomes {
            match outcome {
                Ok(device) => result.devices.push(device),
                Err(error) => {
                    tracing::warn!("Identification of {} failed: {}", address, error);
                    result.errors.insert(address, error);
                }
            }
        }
        result.devices.sort_by_key(|d| d.address());

        for device in result.identified() {
            if self.registry.get(device.id()).await.is_some() {
                tracing::debug!("{} already registered, leaving its status alone", device.id());
                continue;
            }
            tracing::info!(
                "Registered {} ({} {})",
                device.id(),
                device.vendor.as_deref().unwrap_or("?"),
                device.model.as_deref().unwrap_or("")
            );
            self.registry.insert(device.clone()).await;
        }

        result.elapsed = started.elapsed();
        let identified = result.identified().count();
        self.bus.publish(BusEvent::DiscoveryCompleted {
            kind: request.kind,
            identified,
            failed: result.errors.len(),
            elapsed_ms: result.elapsed.as_millis() as u64,
        });
        tracing::info!(
            "Discovery finished in {:?}: {} candidate(s), {} identified, {} failed",
            result.elapsed,
            result.candidates.len(),
            identified,
            result.errors.len()
        );
        result
    }

    /// Try each kind in order. The first confirmation wins; otherwise the
    /// first inconclusive handshake; otherwise every error joined.
    async fn identify_candidate(&self, candidate: &Candidate) -> Result<Device, String> {
        let mut inconclusive: Option<(DriverKind, u16, Identification)> = None;
        let mut errors = Vec::new();

        for &kind in &candidate.kinds {
            let port = self.ports.for_kind(kind);
            match self.identifier.identify(kind, candidate.address, port).await {
                Ok(identification @ Identification::Confirmed { .. }) => {
                    return Ok(Device::identified(
                        kind,
                        candidate.address,
                        port,
                        &identification,
                        Utc::now(),
                    ));
                }
                Ok(identification) => {
                    tracing::debug!(
                        "{} handshake with {} inconclusive: {:?}",
                        kind,
                        candidate.address,
                        identification
                    );
                    if inconclusive.is_none() {
                        inconclusive = Some((kind, port, identification));
                    }
                }
                Err(e) => errors.push(format!("{}: {}", kind, e)),
            }
        }

        match inconclusive {
            Some((kind, port, identification)) => Ok(Device::identified(
                kind,
                candidate.address,
                port,
                &identification,
                Utc::now(),
            )),
            None => Err(errors.join("; ")),
        }
    }
}

/// Union scan hits and multicast responders by address.
fn merge_candidates(
    scanned: Vec<(IpAddr, Vec<DriverKind>)>,
    announced: Vec<Announcement>,
    kinds: &[DriverKind],
) -> Vec<Candidate> {
    let mut merged: BTreeMap<IpAddr, Candidate> = BTreeMap::new();

    for (address, hit_kinds) in scanned {
        merged.insert(
            address,
            Candidate {
                address,
                kinds: hit_kinds,
                sources: vec![CandidateSource::Scan],
            },
        );
    }

    for announcement in announced {
        merged
            .entry(announcement.address)
            .and_modify(|c| {
                if !c.sources.contains(&CandidateSource::Multicast) {
                    c.sources.push(CandidateSource::Multicast);
                }
            })
            .or_insert_with(|| Candidate {
                address: announcement.address,
                kinds: kinds.to_vec(),
                sources: vec![CandidateSource::Multicast],
            });
    }

    merged.into_values().collect()
}
