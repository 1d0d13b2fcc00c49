//! Mesh transport: TCP fan-out to peers on the local network.
//!
//! Wire format: one connection carries one message, written whole and
//! terminated by closing the write half. Receivers read to EOF.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use get_if_addrs::{get_if_addrs, IfAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::transport::Transport;

pub const MESH_NAME: &str = "mesh";

const PEER_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Delivers to the first reachable peer over plain TCP and listens for
/// inbound messages so peers can reach this node reciprocally.
pub struct MeshTransport {
    listen_port: u16,
    peers: Mutex<Vec<String>>,
    bound: Mutex<Option<SocketAddr>>,
    announced_ip: Mutex<Option<Ipv4Addr>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MeshTransport {
    /// `listen_port` 0 binds an ephemeral port at connect time.
    pub fn new(peers: Vec<String>, listen_port: u16) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            listen_port,
            peers: Mutex::new(peers),
            bound: Mutex::new(None),
            announced_ip: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Replace the peer list wholesale. No dedup or health probing here;
    /// the discovery layer owns the quality of the list.
    pub fn update_peers(&self, new_peers: Vec<String>) {
        let mut peers = self.peers.lock().unwrap();
        *peers = new_peers;
        info!("mesh peers updated: {:?}", *peers);
    }

    pub fn get_peers(&self) -> Vec<String> {
        self.peers.lock().unwrap().clone()
    }

    /// Port of the inbound listener, once connected.
    pub fn local_port(&self) -> Option<u16> {
        self.bound.lock().unwrap().map(|addr| addr.port())
    }

    /// First non-loopback IPv4 found at connect time; this is what
    /// discovery announces.
    pub fn announced_ip(&self) -> Option<Ipv4Addr> {
        *self.announced_ip.lock().unwrap()
    }

    /// `announced_ip:port` once connected. Producers use it to keep this
    /// node out of its own peer list.
    pub fn self_endpoint(&self) -> Option<String> {
        let port = self.local_port()?;
        let ip = self.announced_ip()?;
        Some(format!("{ip}:{port}"))
    }

    /// Claim the inbound message stream. Each item is one connection read
    /// to EOF. Returns `None` after the first call.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inbound_rx.lock().unwrap().take()
    }

    fn detect_local_ipv4() -> Option<Ipv4Addr> {
        match get_if_addrs() {
            Ok(ifaces) => ifaces.into_iter().find_map(|iface| match iface.addr {
                IfAddr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip),
                _ => None,
            }),
            Err(err) => {
                warn!("failed to enumerate interfaces: {err}");
                None
            }
        }
    }
}

/// Drop entries that violate the peer-list invariant: loopback hosts and
/// the node's own endpoint. `update_peers` applies no filtering itself;
/// whoever produces a list sanitizes it first.
pub fn sanitize_peers(peers: Vec<String>, self_endpoint: Option<&str>) -> Vec<String> {
    peers
        .into_iter()
        .filter(|peer| {
            if Some(peer.as_str()) == self_endpoint {
                debug!("dropping self endpoint {peer}");
                return false;
            }
            if is_loopback_host(peer) {
                debug!("dropping loopback peer {peer}");
                return false;
            }
            true
        })
        .collect()
}

/// True when the host part is a literal loopback IP. Hostnames are kept;
/// only provably-loopback entries are dropped.
fn is_loopback_host(peer: &str) -> bool {
    peer.rsplit_once(':')
        .and_then(|(host, _)| host.parse::<IpAddr>().ok())
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl Transport for MeshTransport {
    fn name(&self) -> &'static str {
        MESH_NAME
    }

    async fn connect(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        if self.bound.lock().unwrap().is_some() {
            return Ok(());
        }

        if let Some(ip) = Self::detect_local_ipv4() {
            *self.announced_ip.lock().unwrap() = Some(ip);
        }

        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .context("bind mesh listener")?;
        let addr = listener.local_addr().context("mesh listener address")?;
        *self.bound.lock().unwrap() = Some(addr);
        info!("mesh transport listening on {addr}");

        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, peer)) => {
                        let inbound = inbound.clone();
                        tokio::spawn(async move {
                            let mut buf = Vec::new();
                            match stream.read_to_end(&mut buf).await {
                                Ok(_) if !buf.is_empty() => {
                                    debug!("mesh received {} bytes from {peer}", buf.len());
                                    let _ = inbound.send(buf);
                                }
                                Ok(_) => {}
                                Err(err) => debug!("mesh read from {peer} failed: {err}"),
                            }
                        });
                    }
                    Err(err) => {
                        warn!("mesh accept failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), SendError> {
        let peers = self.get_peers();
        if peers.is_empty() {
            return Err(SendError::NoPeers);
        }

        let mut last_error = String::new();
        for peer in peers {
            if cancel.is_cancelled() {
                return Err(SendError::Cancelled);
            }

            let mut stream = match timeout(PEER_DIAL_TIMEOUT, TcpStream::connect(peer.as_str())).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!("mesh dial {peer} failed: {err}");
                    last_error = format!("connect to {peer}: {err}");
                    continue;
                }
                Err(_) => {
                    debug!("mesh dial {peer} timed out");
                    last_error = format!("connect to {peer} timed out");
                    continue;
                }
            };

            match stream.write_all(payload).await {
                Ok(()) => {
                    stream.shutdown().await.ok();
                    info!("message sent via mesh to {peer}");
                    return Ok(());
                }
                Err(err) => {
                    debug!("mesh write to {peer} failed: {err}");
                    last_error = format!("write to {peer}: {err}");
                }
            }
        }

        Err(SendError::AllPeersFailed { last: last_error })
    }

    fn is_available(&self) -> bool {
        // The local network is assumed reachable.
        true
    }
}
