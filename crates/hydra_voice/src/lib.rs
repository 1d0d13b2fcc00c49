//! Voice message capture, storage, and transport framing.
//!
//! Audio bytes come in from the host application, are persisted under the
//! storage directory, and go out through whatever [`Transport`] is wired
//! in as a JSON envelope with a base64 payload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hydra_transport::Transport;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rough opus/ogg rate: one KiB of audio is about 0.06 seconds.
const SECONDS_PER_KIB: f64 = 0.06;

const MAX_FILE_SIZE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: usize, max: usize },
    #[error("not a voice message")]
    NotVoice,
    #[error("voice message {0} not found")]
    NotFound(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub id: String,
    pub user_id: String,
    pub timestamp_unix_ms: u64,
    /// Estimated duration in seconds.
    pub duration: f64,
    /// Content type, e.g. `audio/webm`.
    pub format: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub file_path: PathBuf,
}

/// Wire form: metadata plus base64 audio, tagged so receivers can tell
/// voice frames from other traffic.
#[derive(Debug, Serialize, Deserialize)]
struct VoiceEnvelope {
    r#type: String,
    id: String,
    user_id: String,
    timestamp_unix_ms: u64,
    duration: f64,
    format: String,
    data: String,
}

pub struct VoiceProcessor {
    transport: Arc<dyn Transport>,
    storage_dir: PathBuf,
}

impl VoiceProcessor {
    /// Creates the storage directory up front; a missing directory fails
    /// here rather than on the first write.
    pub fn new(transport: Arc<dyn Transport>, storage_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(storage_dir)
            .with_context(|| format!("create voice storage directory {}", storage_dir.display()))?;
        Ok(Self {
            transport,
            storage_dir: storage_dir.to_path_buf(),
        })
    }

    /// Persist a recorded clip and build its message.
    pub fn record(
        &self,
        user_id: &str,
        data: &[u8],
        filename: &str,
        format: &str,
    ) -> Result<VoiceMessage, VoiceError> {
        if data.len() > MAX_FILE_SIZE_BYTES {
            return Err(VoiceError::FileTooLarge {
                size: data.len(),
                max: MAX_FILE_SIZE_BYTES,
            });
        }

        let id = format!("vm_{}", uuid::Uuid::new_v4().simple());
        let file_path = self.storage_dir.join(format!("voice_{id}_{filename}"));
        std::fs::write(&file_path, data).map_err(|e| VoiceError::Storage(e.to_string()))?;
        debug!("stored voice clip {id} ({} bytes)", data.len());

        Ok(VoiceMessage {
            id,
            user_id: user_id.to_string(),
            timestamp_unix_ms: unix_ms(),
            duration: estimate_duration(data.len()),
            format: format.to_string(),
            data: data.to_vec(),
            file_path,
        })
    }

    /// Dispatch a voice message through the wired transport.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        message: &VoiceMessage,
    ) -> Result<(), VoiceError> {
        let envelope = VoiceEnvelope {
            r#type: "voice".into(),
            id: message.id.clone(),
            user_id: message.user_id.clone(),
            timestamp_unix_ms: message.timestamp_unix_ms,
            duration: message.duration,
            format: message.format.clone(),
            data: BASE64.encode(&message.data),
        };
        let json = serde_json::to_vec(&envelope).map_err(|e| VoiceError::Encode(e.to_string()))?;

        self.transport
            .send(cancel, &json)
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))
    }

    /// Parse and persist an incoming voice frame.
    pub fn receive(&self, data: &[u8]) -> Result<VoiceMessage, VoiceError> {
        let envelope: VoiceEnvelope =
            serde_json::from_slice(data).map_err(|e| VoiceError::Encode(e.to_string()))?;
        if envelope.r#type != "voice" {
            return Err(VoiceError::NotVoice);
        }

        let audio = BASE64
            .decode(&envelope.data)
            .map_err(|e| VoiceError::Encode(e.to_string()))?;
        let file_path = self
            .storage_dir
            .join(format!("received_voice_{}", envelope.id));
        std::fs::write(&file_path, &audio).map_err(|e| VoiceError::Storage(e.to_string()))?;
        info!(
            "stored received voice message {} ({} bytes)",
            envelope.id,
            audio.len()
        );

        Ok(VoiceMessage {
            id: envelope.id,
            user_id: envelope.user_id,
            timestamp_unix_ms: envelope.timestamp_unix_ms,
            duration: envelope.duration,
            format: envelope.format,
            data: audio,
            file_path,
        })
    }

    /// Path of a stored audio file, by message id.
    pub fn find_by_id(&self, voice_id: &str) -> Result<PathBuf, VoiceError> {
        let entries =
            std::fs::read_dir(&self.storage_dir).map_err(|e| VoiceError::Storage(e.to_string()))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.path().is_file() && name.contains(voice_id) {
                return Ok(entry.path());
            }
        }
        Err(VoiceError::NotFound(voice_id.to_string()))
    }

    /// Delete stored audio older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let entries = match std::fs::read_dir(&self.storage_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to read voice storage directory: {err}");
                return;
            }
        };

        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() > max_age {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!("deleted old audio file {}", path.display()),
                    Err(err) => warn!("failed to delete {}: {err}", path.display()),
                }
            }
        }
    }
}

/// Size-based duration estimate, linear in the payload length.
pub fn estimate_duration(data_size: usize) -> f64 {
    data_size as f64 / 1024.0 * SECONDS_PER_KIB
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
