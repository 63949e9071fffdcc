//! Address ranges and the bounded-concurrency port scan

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::device::DriverKind;

/// Largest range a single scan accepts (a /16)
pub const MAX_RANGE_HOSTS: u64 = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("invalid address range {0:?}")]
    Invalid(String),
    #[error("range {0} is reversed")]
    Reversed(String),
    #[error("range covers {0} hosts, limit is 65536")]
    TooLarge(u64),
}

/// Inclusive IPv4 host range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl AddressRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, RangeError> {
        if u32::from(start) > u32::from(end) {
            return Err(RangeError::Reversed(format!("{}-{}", start, end)));
        }
        let range = Self { start, end };
        if range.len() > MAX_RANGE_HOSTS {
            return Err(RangeError::TooLarge(range.len()));
        }
        Ok(range)
    }

    /// Usable hosts of a CIDR block. Network and broadcast addresses are
    /// dropped for prefixes shorter than /31.
    pub fn cidr(network: Ipv4Addr, prefix: u8) -> Result<Self, RangeError> {
        if prefix > 32 {
            return Err(RangeError::Invalid(format!("{}/{}", network, prefix)));
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        let first = u32::from(network) & mask;
        let last = first | !mask;
        let (start, end) = if prefix < 31 {
            (first + 1, last - 1)
        } else {
            (first, last)
        };
        Self::new(Ipv4Addr::from(start), Ipv4Addr::from(end))
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        match address {
            IpAddr::V4(v4) => (self.start..=self.end).contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = IpAddr> {
        (u32::from(self.start)..=u32::from(self.end)).map(|n| IpAddr::V4(Ipv4Addr::from(n)))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for AddressRange {
    type Err = RangeError;

    /// `192.168.1.0/24`, `10.0.0.10-10.0.0.40`, or a single address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || RangeError::Invalid(s.to_string());

        if let Some((network, prefix)) = s.split_once('/') {
            let network: Ipv4Addr = network.parse().map_err(|_| invalid())?;
            let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
            return Self::cidr(network, prefix);
        }
        if let Some((start, end)) = s.split_once('-') {
            let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
            let end: Ipv4Addr = end.trim().parse().map_err(|_| invalid())?;
            return Self::new(start, end);
        }
        let single: Ipv4Addr = s.parse().map_err(|_| invalid())?;
        Self::new(single, single)
    }
}

/// Reachability test for one address and port.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: IpAddr, port: u16) -> bool;
}

/// TCP connect probe; the socket is dropped as soon as it opens.
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: IpAddr, port: u16) -> bool {
        matches!(
            timeout(self.timeout, TcpStream::connect(SocketAddr::new(address, port))).await,
            Ok(Ok(_))
        )
    }
}

/// Probe every host in `range` on each kind's port, at most `concurrency`
/// probes in flight. Returns responders with the kinds whose port answered,
/// in address order. Silent hosts produce nothing.
pub async fn scan(
    range: &AddressRange,
    targets: &[(DriverKind, u16)],
    prober: &dyn Prober,
    concurrency: usize,
) -> Vec<(IpAddr, Vec<DriverKind>)> {
    let work = range
        .hosts()
        .flat_map(|address| targets.iter().map(move |&(kind, port)| (address, kind, port)));

    let mut hits: Vec<(IpAddr, DriverKind)> = stream::iter(work)
        .map(|(address, kind, port)| async move {
            prober.probe(address, port).await.then_some((address, kind))
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|hit| async move { hit })
        .collect()
        .await;

    hits.sort_by_key(|(address, kind)| {
        let order = DriverKind::ALL.iter().position(|k| k == kind);
        (*address, order)
    });

    let mut grouped: Vec<(IpAddr, Vec<DriverKind>)> = Vec::new();
    for (address, kind) in hits {
        match grouped.last_mut() {
            Some((last, kinds)) if *last == address => kinds.push(kind),
            _ => grouped.push((address, vec![kind])),
        }
    }
    grouped
}
