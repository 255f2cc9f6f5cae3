//! The dispatcher seam between the pump loop and provider execution.
//!
//! The relay never blocks the pump thread on a provider call. It hands a
//! [`CallJob`] to a [`Dispatcher`] and collects [`CallResult`]s on a later
//! pump via `poll`. Two implementations:
//!
//! - [`InlineDispatcher`] executes the provider during `dispatch` and buffers
//!   the result for the next `poll`. Correct for deterministic/offline
//!   providers and tests, where `call` is cheap.
//! - [`ThreadedDispatcher`] runs blocking transports on a small worker pool
//!   over crossbeam channels.

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::collections::VecDeque;
use std::thread::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::provider::{ProviderError, SharedProvider};
use crate::request::{Prompt, ProviderResponse};

/// One provider attempt to execute.
pub struct CallJob {
    /// Identifies the in-flight call this attempt belongs to.
    pub call_id: Uuid,
    pub provider: SharedProvider,
    pub call_type: String,
    pub prompt: Prompt,
}

/// The outcome of one provider attempt.
pub struct CallResult {
    pub call_id: Uuid,
    pub outcome: Result<ProviderResponse, ProviderError>,
    pub duration_ms: u64,
}

/// Executes provider attempts off the pump's critical path.
pub trait Dispatcher: Send {
    /// Hand an attempt to the executor. Must not block.
    fn dispatch(&mut self, job: CallJob);

    /// Drain every finished attempt. Called once per pump.
    fn poll(&mut self) -> Vec<CallResult>;
}

/// Runs each job synchronously inside `dispatch` and hands the result back on
/// the next `poll`. Keeps the pump fully deterministic.
#[derive(Default)]
pub struct InlineDispatcher {
    ready: VecDeque<CallResult>,
}

impl InlineDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dispatcher for InlineDispatcher {
    fn dispatch(&mut self, job: CallJob) {
        let started = std::time::Instant::now();
        let outcome = job.provider.call(&job.call_type, &job.prompt);
        self.ready.push_back(CallResult {
            call_id: job.call_id,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn poll(&mut self) -> Vec<CallResult> {
        self.ready.drain(..).collect()
    }
}

/// Worker-pool dispatcher for providers whose `call` blocks on I/O.
pub struct ThreadedDispatcher {
    job_tx: Option<Sender<CallJob>>,
    result_rx: Receiver<CallResult>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadedDispatcher {
    /// Spawn `workers` threads. One or two is plenty: per-tier in-flight caps
    /// already bound outstanding calls.
    pub fn new(workers: usize) -> Self {
        let (job_tx, job_rx) = unbounded::<CallJob>();
        let (result_tx, result_rx) = unbounded::<CallResult>();

        let handles = (0..workers.max(1))
            .map(|idx| {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                std::thread::Builder::new()
                    .name(format!("llm-relay-worker-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            let started = std::time::Instant::now();
                            let outcome = job.provider.call(&job.call_type, &job.prompt);
                            let result = CallResult {
                                call_id: job.call_id,
                                outcome,
                                duration_ms: started.elapsed().as_millis() as u64,
                            };
                            // Receiver gone means the relay is shutting down.
                            if result_tx.send(result).is_err() {
                                break;
                            }
                        }
                    })
                    .expect("spawning dispatcher worker")
            })
            .collect();

        Self {
            job_tx: Some(job_tx),
            result_rx,
            workers: handles,
        }
    }
}

impl Dispatcher for ThreadedDispatcher {
    fn dispatch(&mut self, job: CallJob) {
        if let Some(tx) = &self.job_tx {
            debug!(call_id = %job.call_id, provider = job.provider.name(), "dispatching to worker pool");
            // Send only fails when every worker has exited; the result simply
            // never arrives and the request times out at its deadline.
            let _ = tx.send(job);
        }
    }

    fn poll(&mut self) -> Vec<CallResult> {
        let mut results = Vec::new();
        loop {
            match self.result_rx.try_recv() {
                Ok(result) => results.push(result),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        results
    }
}

impl Drop for ThreadedDispatcher {
    fn drop(&mut self) {
        // Closing the job channel lets workers drain and exit.
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
