//! Bridges discovery output to the mesh peer list.
//!
//! The mesh transport never learns where its peers come from; it only sees
//! wholesale list replacements. That keeps the same transport working with
//! static lists, mDNS, or an external directory.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use hydra_transport::{sanitize_peers, MeshTransport, Transport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ServiceDiscovery;

/// Anything that can produce a peer snapshot.
pub trait PeerSource: Send + Sync {
    fn get_peers(&self) -> Vec<String>;
}

impl PeerSource for ServiceDiscovery {
    fn get_peers(&self) -> Vec<String> {
        ServiceDiscovery::get_peers(self)
    }
}

#[derive(Debug, Clone)]
pub struct AutoPeerConfig {
    pub update_interval: Duration,
}

impl Default for AutoPeerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(15),
        }
    }
}

/// Periodically copies the discovered peer set into the mesh transport.
pub struct AutoPeerManager {
    source: Arc<dyn PeerSource>,
    mesh: Arc<MeshTransport>,
    discovery: Option<Arc<ServiceDiscovery>>,
    config: AutoPeerConfig,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoPeerManager {
    /// mDNS-fed reconciler. Stopping the reconciler also stops discovery.
    pub fn new(
        discovery: Arc<ServiceDiscovery>,
        mesh: Arc<MeshTransport>,
        config: AutoPeerConfig,
    ) -> Self {
        Self {
            source: discovery.clone(),
            mesh,
            discovery: Some(discovery),
            config,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Reconciler over an arbitrary peer source; the caller owns the
    /// source's lifecycle.
    pub fn with_source(
        source: Arc<dyn PeerSource>,
        mesh: Arc<MeshTransport>,
        config: AutoPeerConfig,
    ) -> Self {
        Self {
            source,
            mesh,
            discovery: None,
            config,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn mesh(&self) -> Arc<MeshTransport> {
        self.mesh.clone()
    }

    /// Connect the mesh listener, announce it over mDNS, and start the
    /// update loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.mesh
            .connect(&self.cancel)
            .await
            .context("connect mesh transport")?;

        if let Some(discovery) = &self.discovery {
            let port = self.mesh.local_port().context("mesh listener not bound")?;
            let ip = match self.mesh.announced_ip() {
                Some(ip) => ip,
                None => {
                    warn!("no non-loopback IPv4 found, announcing loopback");
                    Ipv4Addr::LOCALHOST
                }
            };
            discovery.start(ip, port).context("start discovery")?;
        }

        let source = self.source.clone();
        let mesh = self.mesh.clone();
        let cancel = self.cancel.clone();
        let period = self.config.update_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let discovered =
                            sanitize_peers(source.get_peers(), mesh.self_endpoint().as_deref());
                        if !discovered.is_empty() {
                            debug!("reconciling {} discovered peers", discovered.len());
                            mesh.update_peers(discovered);
                        }
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);

        info!("auto peer manager started");
        Ok(())
    }

    /// Stop the update loop and, when mDNS-fed, discovery with it.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(discovery) = &self.discovery {
            discovery.stop();
        }
        let _ = self.task.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        peers: Mutex<Vec<String>>,
    }

    impl FixedSource {
        fn new(peers: Vec<String>) -> Self {
            Self {
                peers: Mutex::new(peers),
            }
        }
    }

    impl PeerSource for FixedSource {
        fn get_peers(&self) -> Vec<String> {
            self.peers.lock().unwrap().clone()
        }
    }

    async fn wait_for_peers(mesh: &MeshTransport, expected: &[String]) -> bool {
        for _ in 0..100 {
            if mesh.get_peers() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn discovered_peers_reach_the_mesh() {
        let source = Arc::new(FixedSource::new(vec!["10.0.0.5:7100".into()]));
        let mesh = Arc::new(MeshTransport::new(vec![], 0));
        let manager = AutoPeerManager::with_source(
            source,
            mesh.clone(),
            AutoPeerConfig {
                update_interval: Duration::from_millis(20),
            },
        );

        manager.start().await.unwrap();
        assert!(wait_for_peers(&mesh, &["10.0.0.5:7100".to_string()]).await);
        manager.stop();
    }

    #[tokio::test]
    async fn loopback_and_self_never_reach_the_mesh() {
        let source = Arc::new(FixedSource::new(vec![]));
        let mesh = Arc::new(MeshTransport::new(vec![], 0));
        let manager = AutoPeerManager::with_source(
            source.clone(),
            mesh.clone(),
            AutoPeerConfig {
                update_interval: Duration::from_millis(20),
            },
        );

        manager.start().await.unwrap();

        let mut snapshot = vec!["127.0.0.1:9999".to_string(), "10.0.0.5:7100".to_string()];
        if let Some(self_endpoint) = mesh.self_endpoint() {
            snapshot.push(self_endpoint);
        }
        *source.peers.lock().unwrap() = snapshot;

        assert!(wait_for_peers(&mesh, &["10.0.0.5:7100".to_string()]).await);
        manager.stop();
    }

    #[tokio::test]
    async fn empty_snapshots_do_not_clear_existing_peers() {
        let source = Arc::new(FixedSource::new(vec![]));
        let mesh = Arc::new(MeshTransport::new(vec!["10.0.0.9:7100".into()], 0));
        let manager = AutoPeerManager::with_source(
            source,
            mesh.clone(),
            AutoPeerConfig {
                update_interval: Duration::from_millis(20),
            },
        );

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(mesh.get_peers(), vec!["10.0.0.9:7100".to_string()]);
        manager.stop();
    }

    #[tokio::test]
    async fn loop_exits_after_stop() {
        let source = Arc::new(FixedSource::new(vec!["10.0.0.5:7100".into()]));
        let mesh = Arc::new(MeshTransport::new(vec![], 0));
        let manager = AutoPeerManager::with_source(
            source.clone(),
            mesh.clone(),
            AutoPeerConfig {
                update_interval: Duration::from_millis(20),
            },
        );

        manager.start().await.unwrap();
        assert!(wait_for_peers(&mesh, &["10.0.0.5:7100".to_string()]).await);
        manager.stop();

        // Updates after stop never land.
        *source.peers.lock().unwrap() = vec!["10.0.0.7:7100".into()];
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(mesh.get_peers(), vec!["10.0.0.5:7100".to_string()]);
    }
}
