//! Remote firmware update plumbing shared by every listener implementation.
//!
//! The transport (an HTTP server on the device or on the host) runs on the
//! platform's own threads. It streams an image through an [`UpdateSession`]
//! and reports progress into an [`UpdateTracker`]; the sample loop observes
//! the tracker only through [`UpdateListener::service`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TOKEN_HEADER: &str = "x-update-token";
pub const SHA256_HEADER: &str = "x-update-sha256";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("update listener is not armed")]
    NotArmed,
    #[error("invalid update token")]
    Unauthorized,
    #[error("an update is already in progress")]
    Busy,
    #[error("expected sha256 must be 64 hex characters")]
    MalformedDigest,
    #[error("image digest mismatch (expected {expected}, got {actual})")]
    DigestMismatch { expected: String, actual: String },
    #[error("update image is empty")]
    EmptyImage,
    #[error("update sink error: {0}")]
    Sink(String),
    #[error("update listener failed to start: {0}")]
    Listener(String),
}

impl UpdateError {
    /// Status code an HTTP listener answers with when a request ends in this
    /// error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotArmed | Self::Listener(_) => 503,
            Self::Unauthorized => 403,
            Self::Busy => 409,
            Self::MalformedDigest | Self::EmptyImage => 400,
            Self::DigestMismatch { .. } => 422,
            Self::Sink(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePoll {
    Idle,
    Receiving { bytes: u64 },
    Completed { bytes: u64 },
    Failed(String),
}

/// Remote-update endpoint as seen by the connectivity manager.
pub trait UpdateListener {
    fn arm(&mut self, hostname: &str, auth_token: &str) -> Result<(), UpdateError>;

    fn disarm(&mut self);

    /// Lets a pending session make progress and reports its state. Terminal
    /// states are reported once.
    fn service(&mut self) -> UpdatePoll;
}

/// Destination of an image: an OTA partition on the device, a staging file
/// on the host.
pub trait UpdateSink {
    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError>;

    fn commit(self) -> Result<(), UpdateError>;

    fn abort(self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    pub bytes: u64,
    pub sha256: String,
}

/// Upload credentials, checked before any sink is opened so a rejected
/// request never touches the update target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    expected_sha256: Option<String>,
}

impl UpdateRequest {
    pub fn authorize(
        provided_token: &str,
        expected_token: &str,
        expected_sha256: Option<&str>,
    ) -> Result<Self, UpdateError> {
        if !token_matches(provided_token, expected_token) {
            return Err(UpdateError::Unauthorized);
        }

        let expected_sha256 = match expected_sha256.map(normalize_digest) {
            Some(Some(digest)) => Some(digest),
            Some(None) => return Err(UpdateError::MalformedDigest),
            None => None,
        };

        Ok(Self { expected_sha256 })
    }

    pub fn open<S: UpdateSink>(self, sink: S) -> UpdateSession<S> {
        UpdateSession {
            sink,
            hasher: Sha256::new(),
            bytes: 0,
            expected_sha256: self.expected_sha256,
        }
    }
}

pub struct UpdateSession<S> {
    sink: S,
    hasher: Sha256,
    bytes: u64,
    expected_sha256: Option<String>,
}

impl<S: UpdateSink> UpdateSession<S> {
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        self.sink.write(chunk)?;
        self.hasher.update(chunk);
        self.bytes = self.bytes.saturating_add(chunk.len() as u64);
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> Result<UpdateSummary, UpdateError> {
        if self.bytes == 0 {
            self.sink.abort();
            return Err(UpdateError::EmptyImage);
        }

        let actual = to_hex(&self.hasher.finalize());
        if let Some(expected) = self.expected_sha256 {
            if expected != actual {
                self.sink.abort();
                return Err(UpdateError::DigestMismatch { expected, actual });
            }
        }

        self.sink.commit()?;
        Ok(UpdateSummary {
            bytes: self.bytes,
            sha256: actual,
        })
    }

    pub fn abort(self) {
        self.sink.abort();
    }
}

/// An empty configured token leaves the endpoint open, matching an update
/// service started without a password.
pub fn token_matches(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .iter()
        .zip(expected)
        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn normalize_digest(raw: &str) -> Option<String> {
    let digest = raw.trim().to_ascii_lowercase();
    (digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())).then_some(digest)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Default)]
struct TrackerState {
    armed: bool,
    hostname: String,
    auth_token: String,
    in_progress: bool,
    bytes: u64,
    finished: Option<UpdatePoll>,
}

/// Shared view of the update endpoint between the server threads and the
/// sample loop.
#[derive(Debug, Clone, Default)]
pub struct UpdateTracker {
    inner: Arc<Mutex<TrackerState>>,
}

impl UpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn arm(&self, hostname: &str, auth_token: &str) {
        let mut state = self.lock();
        state.armed = true;
        state.hostname = hostname.to_string();
        state.auth_token = auth_token.to_string();
    }

    pub fn disarm(&self) {
        self.lock().armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    pub fn hostname(&self) -> String {
        self.lock().hostname.clone()
    }

    /// Claims the endpoint for one upload and returns the token it must
    /// present.
    pub fn try_start(&self) -> Result<String, UpdateError> {
        let mut state = self.lock();
        if !state.armed {
            return Err(UpdateError::NotArmed);
        }
        if state.in_progress || matches!(state.finished, Some(UpdatePoll::Completed { .. })) {
            return Err(UpdateError::Busy);
        }
        state.in_progress = true;
        state.bytes = 0;
        Ok(state.auth_token.clone())
    }

    pub fn progress(&self, bytes: u64) {
        self.lock().bytes = bytes;
    }

    pub fn complete(&self, bytes: u64) {
        let mut state = self.lock();
        state.in_progress = false;
        state.bytes = bytes;
        state.finished = Some(UpdatePoll::Completed { bytes });
    }

    pub fn fail(&self, reason: &UpdateError) {
        let mut state = self.lock();
        state.in_progress = false;
        state.finished = Some(UpdatePoll::Failed(reason.to_string()));
    }

    /// Current state; a terminal state is handed out once and then cleared.
    pub fn poll(&self) -> UpdatePoll {
        let mut state = self.lock();
        if let Some(finished) = state.finished.take() {
            return finished;
        }
        if state.in_progress {
            UpdatePoll::Receiving { bytes: state.bytes }
        } else {
            UpdatePoll::Idle
        }
    }
}
