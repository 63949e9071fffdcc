//! Multicast (SSDP) announce listening

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use ssdp_client::SearchTarget;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

/// SSDP MX: responders spread their replies over this many seconds
const SEARCH_MX: usize = 2;

/// One multicast responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Announcement {
    pub address: IpAddr,
    pub location: String,
    pub server: Option<String>,
}

/// Source of multicast responders, listened to for a bounded window.
#[async_trait]
pub trait AnnounceListener: Send + Sync {
    async fn listen(&self, window: Duration) -> Vec<Announcement>;
}

/// `ssdp:all` M-SEARCH on the default multicast group.
#[derive(Debug, Default, Clone, Copy)]
pub struct SsdpListener;

#[async_trait]
impl AnnounceListener for SsdpListener {
    async fn listen(&self, window: Duration) -> Vec<Announcement> {
        let mut found = Vec::new();

        let responses = match ssdp_client::search(&SearchTarget::All, window, SEARCH_MX, None).await
        {
            Ok(responses) => responses,
            Err(e) => {
                tracing::warn!("SSDP search failed: {}", e);
                return found;
            }
        };
        futures::pin_mut!(responses);

        // The search stream ends on its own; the outer deadline guards a stuck socket
        let deadline = tokio::time::sleep(window + Duration::from_millis(250));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = responses.next() => match next {
                    Some(Ok(response)) => {
                        let location = response.location().to_string();
                        match location_host(&location) {
                            Some(address) => {
                                tracing::debug!("SSDP responder {} ({})", address, location);
                                found.push(Announcement {
                                    address,
                                    location,
                                    server: Some(response.server().to_string()),
                                });
                            }
                            None => tracing::debug!("SSDP LOCATION without IP host: {}", location),
                        }
                    }
                    Some(Err(e)) => tracing::debug!("SSDP response error: {}", e),
                    None => break,
                }
            }
        }

        dedup_by_address(found)
    }
}

/// Host of an SSDP LOCATION URL, when it is a literal IP address.
pub fn location_host(location: &str) -> Option<IpAddr> {
    let url = Url::parse(location).ok()?;
    match url.host()? {
        url::Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
        url::Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
        url::Host::Domain(_) => None,
    }
}

/// Keep the first announcement per address.
pub fn dedup_by_address(announcements: Vec<Announcement>) -> Vec<Announcement> {
    let mut seen = std::collections::HashSet::new();
    announcements
        .into_iter()
        .filter(|a| seen.insert(a.address))
        .collect()
}
