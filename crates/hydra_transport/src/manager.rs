//! Priority-ordered fallback across transports.
//!
//! The chain encodes the censorship-resistance policy: stealthy wide-area
//! channels first, same-LAN mesh as the terminal fallback.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, SendError};
use crate::fronting::{FrontingTransport, FRONTING_NAME};
use crate::mesh::MeshTransport;
use crate::transport::Transport;

pub const MANAGER_NAME: &str = "transport-manager";

pub struct TransportManager {
    transports: Vec<Arc<dyn Transport>>,
    /// Index of the transport that delivered the most recent message.
    /// Observational only; dispatch order is always priority order.
    /// The lock is held across an entire send, so sends are strictly
    /// serialized and the classification-driven iteration cannot
    /// interleave with the sticky index.
    current_index: Mutex<usize>,
}

impl TransportManager {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            transports,
            current_index: Mutex::new(0),
        }
    }

    /// Canonical chain: one fronting transport per front domain, all
    /// sharing the hidden domain, then a single mesh transport as the
    /// terminal fallback.
    pub fn build_chain(
        front_domains: &[String],
        hidden_domain: &str,
        mesh: Arc<MeshTransport>,
    ) -> anyhow::Result<Self> {
        let mut transports: Vec<Arc<dyn Transport>> =
            Vec::with_capacity(front_domains.len() + 1);
        for front in front_domains {
            transports.push(Arc::new(FrontingTransport::new(front, hidden_domain)?));
        }
        transports.push(mesh);
        Ok(Self::new(transports))
    }

    /// Connect every transport in order. Individual failures are logged,
    /// not propagated; availability is re-checked on every dispatch.
    pub async fn connect(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        for transport in &self.transports {
            if let Err(err) = transport.connect(cancel).await {
                warn!("failed to connect {}: {err:#}", transport.name());
            }
        }
        Ok(())
    }

    /// Deliver one payload via the first transport that works.
    pub async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), SendError> {
        let mut current = self.current_index.lock().await;

        let mut last_error: Option<SendError> = None;
        for (index, transport) in self.transports.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SendError::Cancelled);
            }
            if !transport.is_available() {
                debug!("transport {} unavailable, skipping", transport.name());
                continue;
            }

            debug!("attempting send via {}", transport.name());
            match transport.send(cancel, payload).await {
                Ok(()) => {
                    *current = index;
                    info!("message sent via {}", transport.name());
                    return Ok(());
                }
                Err(err) => {
                    let class = err.class();
                    if class == ErrorClass::Cancelled {
                        return Err(err);
                    }
                    if transport.name() == FRONTING_NAME && class == ErrorClass::Blocking {
                        // Active interference at this CDN edge; sibling
                        // fronts route differently, so move on at once.
                        debug!("blocking error on {}: {err}", transport.name());
                    } else {
                        warn!("send via {} failed ({class:?}): {err}", transport.name());
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(SendError::AllTransportsFailed {
            last: Box::new(
                last_error.unwrap_or_else(|| SendError::Other("no transport available".into())),
            ),
        })
    }

    /// The transport that delivered the most recent message.
    pub async fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        let current = self.current_index.lock().await;
        self.transports.get(*current).cloned()
    }

    /// Point the sticky index at the first transport with the given name.
    /// Does not pin subsequent dispatches.
    pub async fn switch_to(&self, name: &str) -> anyhow::Result<()> {
        for (index, transport) in self.transports.iter().enumerate() {
            if transport.name() == name {
                *self.current_index.lock().await = index;
                info!("switched current transport to {name}");
                return Ok(());
            }
        }
        anyhow::bail!("transport {name} not found")
    }

    /// Availability snapshot, transport name to "available"/"unavailable".
    pub fn status(&self) -> HashMap<String, String> {
        self.transports
            .iter()
            .map(|t| {
                let state = if t.is_available() {
                    "available"
                } else {
                    "unavailable"
                };
                (t.name().to_string(), state.to_string())
            })
            .collect()
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }
}

/// The manager satisfies the transport contract itself, so collaborators
/// that take a transport (the voice processor, the host surface) can be
/// handed the whole chain.
#[async_trait::async_trait]
impl Transport for TransportManager {
    fn name(&self) -> &'static str {
        MANAGER_NAME
    }

    async fn connect(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        TransportManager::connect(self, cancel).await
    }

    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), SendError> {
        TransportManager::send(self, cancel, payload).await
    }

    fn is_available(&self) -> bool {
        self.transports.iter().any(|t| t.is_available())
    }
}
