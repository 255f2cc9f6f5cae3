//! Three-tier FIFO request queue with admission control.
//!
//! Each tier owns a bounded pending queue and an in-flight counter. Dequeue
//! order is strictly high > medium > low and FIFO within a tier, which is
//! what makes record/replay meaningful. In-flight caps are enforced globally
//! per tier (not per provider within the failover chain) — that matches the
//! documented "max concurrent" table, and the tests assert it.

use thiserror::Error;

use crate::config::QueueConfig;
use crate::request::{Request, Tier};

/// Synchronous admission failures, returned from `submit` before a request
/// is ever owned by the queue. Never retried internally.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// The tier's pending queue is at capacity.
    #[error("queue full for tier {tier}: {capacity} requests already pending")]
    QueueFull { tier: Tier, capacity: usize },

    /// An identical (call type, normalized payload) request is already
    /// pending in the same tier. Submission is otherwise idempotent per tier.
    #[error("duplicate request already pending in tier {tier} for call type '{call_type}'")]
    DuplicateRequest { tier: Tier, call_type: String },
}

#[derive(Default)]
struct TierState {
    pending: std::collections::VecDeque<Request>,
    in_flight: usize,
}

/// The priority queue proper.
pub struct RequestQueue {
    tiers: [TierState; 3],
    config: QueueConfig,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            tiers: Default::default(),
            config,
        }
    }

    /// Admission check, performed before a [`Request`] is constructed so a
    /// rejected submission never consumes the caller's continuation.
    pub fn can_admit(
        &self,
        tier: Tier,
        call_type: &str,
        normalized_key: &str,
    ) -> Result<(), SubmitError> {
        let state = &self.tiers[tier.index()];
        let capacity = self.config.tier(tier).max_pending;
        if state.pending.len() >= capacity {
            return Err(SubmitError::QueueFull { tier, capacity });
        }
        if state
            .pending
            .iter()
            .any(|r| r.normalized_key == normalized_key)
        {
            return Err(SubmitError::DuplicateRequest {
                tier,
                call_type: call_type.to_string(),
            });
        }
        Ok(())
    }

    /// Append an admitted request to its tier.
    pub fn push(&mut self, request: Request) {
        debug_assert!(
            self.can_admit(request.tier, &request.call_type, &request.normalized_key)
                .is_ok(),
            "push without admission check"
        );
        self.tiers[request.tier.index()].pending.push_back(request);
    }

    /// Remove and return every pending request whose deadline has elapsed.
    pub fn expire(&mut self, now_ms: u64) -> Vec<Request> {
        let mut expired = Vec::new();
        for state in &mut self.tiers {
            let mut keep = std::collections::VecDeque::with_capacity(state.pending.len());
            while let Some(request) = state.pending.pop_front() {
                if request.deadline_ms <= now_ms {
                    expired.push(request);
                } else {
                    keep.push_back(request);
                }
            }
            state.pending = keep;
        }
        expired
    }

    /// Pop the next dispatchable request: highest tier first, FIFO within a
    /// tier, skipping tiers whose in-flight cap is reached. Increments the
    /// tier's in-flight count.
    pub fn dequeue(&mut self) -> Option<Request> {
        for tier in Tier::ALL {
            let cap = self.config.tier(tier).max_in_flight;
            let state = &mut self.tiers[tier.index()];
            if state.in_flight >= cap || state.pending.is_empty() {
                continue;
            }
            state.in_flight += 1;
            return state.pending.pop_front();
        }
        None
    }

    /// Return a dequeued-but-undispatched request to the head of its tier
    /// (rate-limiter denial), releasing its in-flight slot.
    pub fn requeue_front(&mut self, request: Request) {
        let state = &mut self.tiers[request.tier.index()];
        state.in_flight = state.in_flight.saturating_sub(1);
        state.pending.push_front(request);
    }

    /// Release an in-flight slot after completion by any path.
    pub fn mark_complete(&mut self, tier: Tier) {
        let state = &mut self.tiers[tier.index()];
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    pub fn pending_len(&self, tier: Tier) -> usize {
        self.tiers[tier.index()].pending.len()
    }

    pub fn in_flight(&self, tier: Tier) -> usize {
        self.tiers[tier.index()].in_flight
    }

    pub fn total_pending(&self) -> usize {
        self.tiers.iter().map(|s| s.pending.len()).sum()
    }
}
