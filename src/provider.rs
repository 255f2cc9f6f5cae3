//! The provider seam.
//!
//! A [`Provider`] wraps one concrete backend (transport, authentication, and
//! wire format are its private business). The relay only ever talks to the
//! trait. Two implementations ship in-crate: the deterministic
//! [`OfflineProvider`] that terminates every failover chain, and a
//! [`ScriptedProvider`] for tests and demos.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use crate::request::{Prompt, ProviderResponse};

/// Errors a provider call can produce.
///
/// The recovery manager classifies these as retryable (backoff, then retry
/// on the same provider) or fatal (advance to the next provider immediately).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl ProviderError {
    /// Whether backoff-and-retry on the same provider is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::ServerError(_)
                | ProviderError::ConnectionReset(_)
        )
    }

    /// Fatal errors skip retries and advance the failover chain directly.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

/// One backend in the failover chain.
///
/// `call` may block its executor (the threaded dispatcher runs it on a worker
/// thread); it must never be called on the pump thread for an I/O-bound
/// backend.
pub trait Provider: Send + Sync {
    /// Stable provider name, used in health reporting and logs.
    fn name(&self) -> &str;

    /// Cheap availability probe. A provider reporting `false` is routed
    /// around exactly like a degraded one.
    fn is_available(&self) -> bool {
        true
    }

    /// Execute one call.
    fn call(&self, call_type: &str, prompt: &Prompt) -> Result<ProviderResponse, ProviderError>;
}

/// Shared handle to a provider.
pub type SharedProvider = Arc<dyn Provider>;

/// The terminal offline fallback.
///
/// Deterministic, dependency-free, and infallible: the same (call type,
/// prompt) pair always yields the same canned content, so a chain ending in
/// this provider guarantees every request terminates successfully.
pub struct OfflineProvider {
    name: String,
}

impl OfflineProvider {
    pub fn new() -> Self {
        Self {
            name: "offline-fallback".into(),
        }
    }
}

impl Default for OfflineProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for OfflineProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, call_type: &str, prompt: &Prompt) -> Result<ProviderResponse, ProviderError> {
        let mut hasher = Sha256::new();
        hasher.update(call_type.as_bytes());
        hasher.update(b"\n");
        hasher.update(prompt.text.as_bytes());
        let digest = hex::encode(&hasher.finalize()[..4]);

        // Canned, recognizably-degraded content. The digest suffix keeps
        // distinct prompts distinguishable downstream.
        let content = match call_type {
            "decision" => format!("{{\"action\":\"wait\",\"fallback\":\"{digest}\"}}"),
            "narrative" => format!("The moment passes without incident. [{digest}]"),
            other => format!("[offline:{other}:{digest}]"),
        };
        let input_tokens = (prompt.text.len() / 4) as u32 + 1;
        Ok(ProviderResponse {
            content,
            model: "offline".into(),
            input_tokens,
            completion_tokens: 16,
        })
    }
}

/// A provider that replays a fixed script of outcomes.
///
/// Each call pops the next scripted result; once the script is exhausted
/// every further call succeeds with a generic response. Used throughout the
/// test suites to stage failures and recoveries.
pub struct ScriptedProvider {
    name: String,
    script: parking_lot::Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    /// What to do once the script runs out: succeed generically, or keep
    /// returning a fixed error.
    exhausted_outcome: parking_lot::Mutex<Result<(), ProviderError>>,
    calls: parking_lot::Mutex<Vec<String>>,
    available: std::sync::atomic::AtomicBool,
}

impl ScriptedProvider {
    pub fn new(
        name: impl Into<String>,
        script: Vec<Result<ProviderResponse, ProviderError>>,
    ) -> Self {
        Self {
            name: name.into(),
            script: parking_lot::Mutex::new(script.into()),
            exhausted_outcome: parking_lot::Mutex::new(Ok(())),
            calls: parking_lot::Mutex::new(Vec::new()),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// A provider that always fails with the given error.
    pub fn always_failing(name: impl Into<String>, error: ProviderError) -> Self {
        let provider = Self::new(name, Vec::new());
        *provider.exhausted_outcome.lock() = Err(error);
        provider
    }

    /// Flip the `is_available` probe.
    pub fn set_available(&self, available: bool) {
        self.available
            .store(available, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of calls this provider has received.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Prompts seen so far, in call order.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl ScriptedProvider {
    fn default_response(&self, prompt: &Prompt) -> ProviderResponse {
        ProviderResponse {
            content: format!("scripted reply from {}", self.name),
            model: format!("{}-model", self.name),
            input_tokens: (prompt.text.len() / 4) as u32 + 1,
            completion_tokens: 32,
        }
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn call(&self, _call_type: &str, prompt: &Prompt) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().push(prompt.text.clone());
        match self.script.lock().pop_front() {
            Some(outcome) => outcome,
            None => match &*self.exhausted_outcome.lock() {
                Ok(()) => Ok(self.default_response(prompt)),
                Err(error) => Err(error.clone()),
            },
        }
    }
}
