//! Request and completion types shared across the relay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Priority class assigned to a request.
///
/// Dequeue order is strictly `High` > `Medium` > `Low`, FIFO within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Urgent calls on the interactive path (e.g. decision interpretation).
    High,
    /// Calls that can tolerate several seconds of latency.
    Medium,
    /// Background calls (e.g. ambient narrative generation).
    Low,
}

impl Tier {
    /// All tiers in dispatch-priority order.
    pub const ALL: [Tier; 3] = [Tier::High, Tier::Medium, Tier::Low];

    /// Dense index for per-tier arrays.
    pub(crate) fn index(self) -> usize {
        match self {
            Tier::High => 0,
            Tier::Medium => 1,
            Tier::Low => 2,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::High => write!(f, "high"),
            Tier::Medium => write!(f, "medium"),
            Tier::Low => write!(f, "low"),
        }
    }
}

/// A prompt payload plus its generation parameters.
///
/// Parameters are kept in a `BTreeMap` so their iteration order is stable,
/// which keeps cache keys and replay hashes deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// The prompt text sent to the backend.
    pub text: String,
    /// Backend-agnostic generation parameters (temperature, max tokens, ...).
    pub params: BTreeMap<String, String>,
}

impl Prompt {
    /// Create a prompt with no parameters.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a generation parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A successful response from a provider backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Generated content.
    pub content: String,
    /// Model that produced the content, as reported by the provider.
    pub model: String,
    /// Prompt-side token count.
    pub input_tokens: u32,
    /// Completion-side token count.
    pub completion_tokens: u32,
}

impl ProviderResponse {
    /// Total tokens billed for this response.
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.completion_tokens
    }
}

/// Where a completed request was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServedFrom {
    /// Response cache hit; no provider was contacted.
    Cache,
    /// A live provider in the failover chain.
    Provider,
    /// A recorded entry during a replay run.
    Replay,
    /// The terminal deterministic offline provider.
    Fallback,
}

impl std::fmt::Display for ServedFrom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServedFrom::Cache => write!(f, "cache"),
            ServedFrom::Provider => write!(f, "provider"),
            ServedFrom::Replay => write!(f, "replay"),
            ServedFrom::Fallback => write!(f, "fallback"),
        }
    }
}

/// Delivered to the caller's completion callback, exactly once per admitted
/// request.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The request this completion belongs to.
    pub request_id: Uuid,
    /// Call type the request was submitted with.
    pub call_type: String,
    /// Whether content was produced. `false` only for a terminal timeout or a
    /// strict replay divergence.
    pub success: bool,
    /// Generated (or recorded, or cached) content. Empty on failure.
    pub content: String,
    /// Total tokens attributed to this completion.
    pub tokens_used: u32,
    /// Cost charged for this completion. Zero for cache and replay hits.
    pub cost_usd: f64,
    /// Source of the content. `None` on failure.
    pub served_from: Option<ServedFrom>,
    /// Failure description, when `success` is false.
    pub error: Option<String>,
}

impl Completion {
    /// A successful completion served from `source`.
    pub(crate) fn served(
        request_id: Uuid,
        call_type: String,
        content: String,
        tokens_used: u32,
        cost_usd: f64,
        source: ServedFrom,
    ) -> Self {
        Self {
            request_id,
            call_type,
            success: true,
            content,
            tokens_used,
            cost_usd,
            served_from: Some(source),
            error: None,
        }
    }

    /// A terminal failure (deadline elapsed, or strict replay divergence).
    pub(crate) fn failed(request_id: Uuid, call_type: String, error: String) -> Self {
        Self {
            request_id,
            call_type,
            success: false,
            content: String::new(),
            tokens_used: 0,
            cost_usd: 0.0,
            served_from: None,
            error: Some(error),
        }
    }
}

/// The stored continuation invoked when a request completes.
pub type OnComplete = Box<dyn FnOnce(Completion) + Send>;

/// A request admitted into the relay.
///
/// Exclusively owned by the queue (then the in-flight table) from admission
/// until [`complete`](Request::complete) consumes it, which guarantees the
/// continuation fires exactly once.
pub struct Request {
    /// Unique request id, returned to the caller by `submit`.
    pub id: Uuid,
    /// Priority tier.
    pub tier: Tier,
    /// Caller-defined call type (e.g. `"decision"`, `"narrative"`).
    pub call_type: String,
    /// Prompt payload and parameters.
    pub prompt: Prompt,
    /// Logical tick at which the request was submitted.
    pub submitted_at_tick: u64,
    /// Absolute wall-clock deadline in epoch milliseconds.
    pub deadline_ms: u64,
    /// Normalized prompt key; doubles as the cache key and replay hash.
    pub(crate) normalized_key: String,
    /// Replay sequence reserved at submission, keyed with
    /// `submitted_at_tick` and `call_type`.
    pub(crate) replay_sequence: u32,
    on_complete: OnComplete,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tier: Tier,
        call_type: String,
        prompt: Prompt,
        submitted_at_tick: u64,
        deadline_ms: u64,
        normalized_key: String,
        replay_sequence: u32,
        on_complete: OnComplete,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tier,
            call_type,
            prompt,
            submitted_at_tick,
            deadline_ms,
            normalized_key,
            replay_sequence,
            on_complete,
        }
    }

    /// Consume the request and fire its continuation.
    pub(crate) fn complete(self, completion: Completion) {
        (self.on_complete)(completion);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("call_type", &self.call_type)
            .field("submitted_at_tick", &self.submitted_at_tick)
            .field("deadline_ms", &self.deadline_ms)
            .field("on_complete", &"<continuation>")
            .finish()
    }
}
