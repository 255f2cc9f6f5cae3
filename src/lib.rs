//! `llm-relay` — resilient request orchestration between a game simulation
//! and LLM providers.
//!
//! The relay sits between a deterministic game loop and unreliable,
//! rate-limited, paid LLM backends. It owns:
//!
//! - a three-tier priority queue with admission control and deadlines,
//! - a token-bucket rate limiter gating every live dispatch,
//! - a normalized response cache with TTL expiry and FIFO eviction,
//! - retry with exponential backoff and jitter, plus provider failover
//!   terminating in a deterministic offline fallback,
//! - record/replay of completed calls for reproducing whole sessions,
//! - an advisory usage and budget tracker.
//!
//! Everything is driven from the host's loop through [`LlmRelay::pump`];
//! completions come back through per-request callbacks, never by blocking.
//!
//! ```no_run
//! use llm_relay::{LlmRelay, Prompt, RelayConfig, Tier};
//!
//! let mut relay = LlmRelay::new(RelayConfig::default()).expect("default config is valid");
//! relay
//!     .submit(Tier::High, "decision", Prompt::text("goblin attacks, respond"), |c| {
//!         println!("served from {:?}: {}", c.served_from, c.content);
//!     })
//!     .expect("queue has room");
//! for tick in 0..600 {
//!     relay.pump(tick).expect("pump");
//! }
//! ```

// clock module
pub mod clock;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

// error module
pub mod error;
pub use error::{RelayError, RelayResult};

// request types
pub mod request;
pub use request::{Completion, OnComplete, Prompt, ProviderResponse, Request, ServedFrom, Tier};

// configuration
pub mod config;
pub use config::{BudgetConfig, ConfigError, RelayConfig};

// priority queue
pub mod queue;
pub use queue::SubmitError;

// rate limiter
pub mod limiter;
pub use limiter::TokenBucket;

// response cache
pub mod cache;
pub use cache::{CacheStats, CachedResponse, ResponseCache, cache_key};

// provider seam
pub mod provider;
pub use provider::{OfflineProvider, Provider, ProviderError, ScriptedProvider, SharedProvider};

// failover chain and health
pub mod failover;
pub use failover::{FailoverChain, HealthStatus, ProviderHealth};

// retry/backoff recovery
pub mod recovery;
pub use recovery::RetryPolicy;

// record/replay
pub mod replay;
pub use replay::{
    DivergencePoint, ReplayError, ReplayLog, ReplayLogEntry, ReplayMode, ReplayValidator,
};

// usage and budget tracking
pub mod usage;
pub use usage::{BudgetAlert, ModelPricing, PricingTable, UsageReport, UsageTotals, UsageTracker};

// dispatcher seam
pub mod dispatch;
pub use dispatch::{CallJob, CallResult, Dispatcher, InlineDispatcher, ThreadedDispatcher};

// the relay itself
pub mod relay;
pub use relay::{LlmRelay, PumpReport, RelayBuilder};
