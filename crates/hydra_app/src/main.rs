use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hydra_discovery::{AutoPeerConfig, AutoPeerManager, ServiceDiscovery, DEFAULT_SERVICE_TYPE};
use hydra_transport::{sanitize_peers, MeshTransport, Transport, TransportManager};
use hydra_voice::VoiceProcessor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const VOICE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const VOICE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, serde::Deserialize)]
struct HydraConfig {
    #[serde(default = "default_front_domains")]
    front_domains: Vec<String>,
    #[serde(default = "default_hidden_domain")]
    hidden_domain: String,
    /// 0 binds an ephemeral mesh port.
    #[serde(default)]
    mesh_port: u16,
    #[serde(default)]
    bootstrap_peers: Vec<String>,
    #[serde(default = "default_service_type")]
    service_type: String,
    #[serde(default = "default_voice_storage")]
    voice_storage: PathBuf,
}

fn default_front_domains() -> Vec<String> {
    [
        "ajax.googleapis.com",
        "cdn.cloudflare.com",
        "d3a2p9q8.stackpathcdn.com",
        "assets.buymeacoffee.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_hidden_domain() -> String {
    "secret-chat.appspot.com".into()
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.into()
}

fn default_voice_storage() -> PathBuf {
    PathBuf::from("./voice_storage")
}

impl Default for HydraConfig {
    fn default() -> Self {
        Self {
            front_domains: default_front_domains(),
            hidden_domain: default_hidden_domain(),
            mesh_port: 0,
            bootstrap_peers: Vec::new(),
            service_type: default_service_type(),
            voice_storage: default_voice_storage(),
        }
    }
}

fn load_config() -> Result<HydraConfig> {
    let config_path = PathBuf::from("hydra.toml");
    if config_path.exists() {
        let text = std::fs::read_to_string(&config_path).context("read hydra.toml")?;
        toml::from_str(&text).context("parse hydra.toml")
    } else {
        Ok(HydraConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;

    tracing::info!("hydra relay starting...");
    tracing::info!("fronts = {:?}", config.front_domains);
    tracing::info!("hidden = {}", config.hidden_domain);

    let bootstrap = sanitize_peers(config.bootstrap_peers.clone(), None);
    if bootstrap.len() < config.bootstrap_peers.len() {
        tracing::warn!(
            "dropped {} bootstrap peer(s) with loopback hosts",
            config.bootstrap_peers.len() - bootstrap.len()
        );
    }

    let mesh = Arc::new(MeshTransport::new(bootstrap, config.mesh_port));
    let manager = Arc::new(TransportManager::build_chain(
        &config.front_domains,
        &config.hidden_domain,
        mesh.clone(),
    )?);

    let cancel = CancellationToken::new();
    manager.connect(&cancel).await?;

    let discovery = Arc::new(ServiceDiscovery::new(&config.service_type));
    let peers = AutoPeerManager::new(discovery, mesh, AutoPeerConfig::default());
    peers.start().await.context("start auto peer manager")?;

    let voice = Arc::new(
        VoiceProcessor::new(
            manager.clone() as Arc<dyn Transport>,
            &config.voice_storage,
        )
        .context("create voice processor")?,
    );
    tracing::info!("voice storage at {}", config.voice_storage.display());
    {
        let voice = voice.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(VOICE_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => voice.cleanup(VOICE_MAX_AGE),
                }
            }
        });
    }

    for (name, state) in manager.status() {
        tracing::info!("transport {name}: {state}");
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    peers.stop();
    cancel.cancel();

    Ok(())
}
