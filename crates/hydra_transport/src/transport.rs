//! Transport abstraction for censorship-resistant delivery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::SendError;

/// One way of moving an opaque payload to the other side. Implementations
/// own their I/O resources and live for the process lifetime.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Stable family tag used for logging and classification
    /// (e.g. "domain-fronting", "mesh").
    fn name(&self) -> &'static str;

    /// One-time setup (opening a listener, priming state). Idempotent; a
    /// no-op for stateless strategies.
    async fn connect(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Deliver one opaque payload. Must return promptly once `cancel` fires.
    async fn send(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), SendError>;

    /// Cheap liveness probe; the manager uses it as a pre-filter only.
    fn is_available(&self) -> bool;
}

/// Mock transport for testing: records sent payloads and returns scripted
/// outcomes (defaulting to success once the script runs out).
pub struct MockTransport {
    name: &'static str,
    available: AtomicBool,
    outcomes: Mutex<VecDeque<Result<(), SendError>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    attempts: AtomicUsize,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            available: AtomicBool::new(true),
            outcomes: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn push_outcome(&self, outcome: Result<(), SendError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// How many times `send` was invoked.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn connect(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, _cancel: &CancellationToken, payload: &[u8]) -> Result<(), SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(payload.to_vec());
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
