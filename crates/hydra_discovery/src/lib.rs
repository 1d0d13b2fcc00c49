//! mDNS peer discovery for the mesh transport.
//!
//! Each node announces itself under the messenger service type and browses
//! for other instances, keeping a cache of `(instance name → host:port)`
//! drawn from IPv4 answers. The cache only grows during a session; a peer
//! that vanishes simply fails its dial and the chain moves on.

pub mod reconciler;

pub use reconciler::{AutoPeerConfig, AutoPeerManager, PeerSource};

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_SERVICE_TYPE: &str = "_hydra-messenger._tcp";

const INSTANCE_NAME: &str = "Hydra Messenger";

/// Upper bound on waiting for one browse answer per query cycle.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Announces the local service and maintains a live set of discovered peers.
pub struct ServiceDiscovery {
    service_type: String,
    peers: Arc<RwLock<HashMap<String, String>>>,
    daemon: Mutex<Option<ServiceDaemon>>,
    cancel: CancellationToken,
}

impl ServiceDiscovery {
    pub fn new(service_type: &str) -> Self {
        Self {
            service_type: normalize_service_type(service_type),
            peers: Arc::new(RwLock::new(HashMap::new())),
            daemon: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Announce ourselves at `ip:port` and start browsing for peers.
    pub fn start(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let daemon = ServiceDaemon::new().context("create mDNS daemon")?;

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "hydra-node".into());

        let properties = [
            ("txtv".to_string(), "1".to_string()),
            ("type".to_string(), "messenger".to_string()),
        ];

        let service = ServiceInfo::new(
            &self.service_type,
            INSTANCE_NAME,
            &format!("{host}.local."),
            IpAddr::V4(ip),
            port,
            &properties[..],
        )
        .context("create mDNS service info")?;
        let own_fullname = service.get_fullname().to_string();

        daemon.register(service).context("register mDNS service")?;

        let receiver = daemon
            .browse(&self.service_type)
            .context("start mDNS browse")?;

        info!(
            "mDNS discovery started, service {} on {ip}:{port}",
            self.service_type
        );

        let peers = self.peers.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("mDNS browse loop stopping");
                        break;
                    }
                    event = tokio::time::timeout(QUERY_TIMEOUT, receiver.recv_async()) => match event {
                        Ok(Ok(event)) => handle_event(&peers, &own_fullname, event),
                        Ok(Err(_)) => {
                            debug!("mDNS browse channel closed");
                            break;
                        }
                        Err(_) => {
                            // Quiet cycle; the daemon keeps querying.
                        }
                    },
                }
            }
        });

        *self.daemon.lock().unwrap() = Some(daemon);
        Ok(())
    }

    /// Stop browsing and withdraw the announcement.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(daemon) = self.daemon.lock().unwrap().take() {
            daemon.shutdown().ok();
        }
    }

    /// Copy of all discovered peer endpoints.
    pub fn get_peers(&self) -> Vec<String> {
        self.peers.read().unwrap().values().cloned().collect()
    }
}

fn handle_event(
    peers: &RwLock<HashMap<String, String>>,
    own_fullname: &str,
    event: ServiceEvent,
) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            if info.get_fullname() == own_fullname {
                return;
            }
            let Some(ip) = first_ipv4(info.get_addresses().iter()) else {
                return;
            };
            record_peer(peers, info.get_fullname(), ip, info.get_port());
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            // Entries are kept for the session; a vanished peer fails its
            // dial and the send falls through.
            debug!("mDNS service removed: {fullname}");
        }
        ServiceEvent::SearchStarted(_) => debug!("mDNS browse started"),
        _ => {}
    }
}

fn record_peer(peers: &RwLock<HashMap<String, String>>, name: &str, ip: Ipv4Addr, port: u16) {
    if ip.is_loopback() {
        return;
    }
    let endpoint = format!("{ip}:{port}");
    let mut map = peers.write().unwrap();
    let is_new = map.insert(name.to_string(), endpoint.clone()).is_none();
    if is_new {
        info!("discovered peer {name} at {endpoint}");
    } else {
        debug!("refreshed peer {name} at {endpoint}");
    }
}

fn first_ipv4<'a>(addrs: impl Iterator<Item = &'a IpAddr>) -> Option<Ipv4Addr> {
    let mut addrs = addrs;
    addrs.find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        _ => None,
    })
}

fn normalize_service_type(service_type: &str) -> String {
    if service_type.ends_with(".local.") {
        service_type.to_string()
    } else {
        format!("{service_type}.local.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_is_normalized() {
        assert_eq!(
            normalize_service_type("_hydra-messenger._tcp"),
            "_hydra-messenger._tcp.local."
        );
        assert_eq!(
            normalize_service_type("_hydra-messenger._tcp.local."),
            "_hydra-messenger._tcp.local."
        );
    }

    #[test]
    fn recorded_peers_accumulate_monotonically() {
        let discovery = ServiceDiscovery::new(DEFAULT_SERVICE_TYPE);

        record_peer(&discovery.peers, "nodeA", Ipv4Addr::new(10, 0, 0, 5), 7100);
        record_peer(&discovery.peers, "nodeB", Ipv4Addr::new(10, 0, 0, 6), 7100);
        // A refresh with a new port replaces the entry, never removes it.
        record_peer(&discovery.peers, "nodeA", Ipv4Addr::new(10, 0, 0, 5), 7200);

        let mut peers = discovery.get_peers();
        peers.sort();
        assert_eq!(peers, vec!["10.0.0.5:7200", "10.0.0.6:7100"]);
    }

    #[test]
    fn loopback_answers_are_ignored() {
        let discovery = ServiceDiscovery::new(DEFAULT_SERVICE_TYPE);
        record_peer(&discovery.peers, "nodeA", Ipv4Addr::new(127, 0, 0, 1), 7100);
        assert!(discovery.get_peers().is_empty());
    }

    #[test]
    fn ipv4_answers_are_preferred_over_ipv6() {
        let addrs = [
            IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        ];
        assert_eq!(
            first_ipv4(addrs.iter()),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );

        let only_v6 = [IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)];
        assert_eq!(first_ipv4(only_v6.iter()), None);
    }

    #[test]
    fn stop_before_start_is_safe() {
        let discovery = ServiceDiscovery::new(DEFAULT_SERVICE_TYPE);
        discovery.stop();
        assert!(discovery.get_peers().is_empty());
    }
}
