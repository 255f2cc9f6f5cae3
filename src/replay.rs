//! Deterministic record/replay of completed calls.
//!
//! Entries are keyed by `(tick, call_type, sequence)`, where `tick` is the
//! logical tick the call was submitted at and `sequence` is reserved from a
//! per-(tick, call type) cursor at submission time. Both modes consume the
//! same cursor, so a recorded run and its replay number calls identically
//! even though completions land on later ticks than submissions.
//!
//! In Record mode every completed call — cache hit, live provider, or
//! offline fallback — is appended under its reserved key. In Replay mode
//! lookups return the recorded output, bypassing cache, limiter, and
//! providers. The two modes are mutually exclusive for the lifetime of a
//! run.
//!
//! The log persists as JSON lines: one entry per line, append-only, fully
//! loaded into memory at Replay startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::error::{RelayError, RelayResult};

/// Record (default) or Replay, chosen once per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayMode {
    #[default]
    Record,
    Replay,
}

/// One recorded call completion. Immutable once written within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayLogEntry {
    /// Logical tick at which the call was submitted.
    pub tick: u64,
    /// Caller-defined call type.
    pub call_type: String,
    /// Disambiguates multiple calls of the same type within one tick.
    pub sequence: u32,
    /// Hash of the normalized prompt; replay verifies it matches.
    pub prompt_hash: String,
    /// The delivered content.
    pub output: String,
    /// Total tokens attributed to the completion.
    pub tokens_used: u32,
    /// Wall-time the call took, for diagnostics only.
    pub duration_ms: u64,
}

/// Identifies the logical point of a divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergencePoint {
    pub tick: u64,
    pub call_type: String,
    pub sequence: u32,
}

/// Replay sub-system errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplayError {
    /// The replayed run issued a call the recorded run did not (or with a
    /// different prompt). Fatal to a strict replay session; never retried.
    #[error("replay divergence at tick {tick}, call type '{call_type}', sequence {sequence}")]
    Divergence {
        tick: u64,
        call_type: String,
        sequence: u32,
    },

    /// A write was attempted while in Replay mode (or a lookup in Record).
    #[error("operation not permitted in {0:?} mode")]
    ModeMismatch(ReplayMode),

    /// The persisted log could not be parsed.
    #[error("corrupt replay log at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Append-only replay log with per-(tick, call type) sequence assignment.
#[derive(Debug)]
pub struct ReplayLog {
    mode: ReplayMode,
    entries: Vec<ReplayLogEntry>,
    index: HashMap<(u64, String, u32), usize>,
    /// Next sequence per (tick, call type). Record mode assigns from it;
    /// Replay mode consumes it so both runs number calls identically.
    cursor: HashMap<(u64, String), u32>,
}

impl ReplayLog {
    /// An empty log in Record mode.
    pub fn record() -> Self {
        Self {
            mode: ReplayMode::Record,
            entries: Vec::new(),
            index: HashMap::new(),
            cursor: HashMap::new(),
        }
    }

    /// Load a recorded session for replay.
    pub fn load(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(RelayError::from)
            .map_err(error_stack::Report::new)
            .map_err(|r| r.attach(format!("reading replay log {}", path.display())))?;
        Self::from_json_lines(&raw)
    }

    /// Parse a JSON-lines dump into a Replay-mode log.
    pub fn from_json_lines(raw: &str) -> RelayResult<Self> {
        let mut log = Self {
            mode: ReplayMode::Replay,
            entries: Vec::new(),
            index: HashMap::new(),
            cursor: HashMap::new(),
        };
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: ReplayLogEntry =
                serde_json::from_str(line).map_err(|e| {
                    error_stack::Report::new(RelayError::Replay(ReplayError::Corrupt {
                        line: line_no + 1,
                        reason: e.to_string(),
                    }))
                })?;
            log.insert(entry);
        }
        Ok(log)
    }

    fn insert(&mut self, entry: ReplayLogEntry) {
        let key = (entry.tick, entry.call_type.clone(), entry.sequence);
        self.index.insert(key, self.entries.len());
        self.entries.push(entry);
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ReplayLogEntry] {
        &self.entries
    }

    fn next_sequence(&mut self, tick: u64, call_type: &str) -> u32 {
        let counter = self
            .cursor
            .entry((tick, call_type.to_string()))
            .or_insert(0);
        let sequence = *counter;
        *counter += 1;
        sequence
    }

    /// Reserve the sequence number for a call of `call_type` submitted at
    /// `tick`. Both modes consume the same cursor, which is what keeps the
    /// numbering of a recorded run and its replay aligned.
    pub fn reserve(&mut self, tick: u64, call_type: &str) -> u32 {
        self.next_sequence(tick, call_type)
    }

    /// Append a completed call under a previously reserved key (Record mode
    /// only). Completions may arrive out of reservation order; the explicit
    /// sequence keeps the key stable regardless.
    #[allow(clippy::too_many_arguments)]
    pub fn append_at(
        &mut self,
        tick: u64,
        call_type: &str,
        sequence: u32,
        prompt_hash: &str,
        output: &str,
        tokens_used: u32,
        duration_ms: u64,
    ) -> Result<(), ReplayError> {
        if self.mode != ReplayMode::Record {
            return Err(ReplayError::ModeMismatch(self.mode));
        }
        self.insert(ReplayLogEntry {
            tick,
            call_type: call_type.to_string(),
            sequence,
            prompt_hash: prompt_hash.to_string(),
            output: output.to_string(),
            tokens_used,
            duration_ms,
        });
        Ok(())
    }

    /// Append a completed call, reserving the next sequence (Record mode
    /// only). Returns the assigned sequence number.
    pub fn append(
        &mut self,
        tick: u64,
        call_type: &str,
        prompt_hash: &str,
        output: &str,
        tokens_used: u32,
        duration_ms: u64,
    ) -> Result<u32, ReplayError> {
        if self.mode != ReplayMode::Record {
            return Err(ReplayError::ModeMismatch(self.mode));
        }
        let sequence = self.next_sequence(tick, call_type);
        self.append_at(
            tick,
            call_type,
            sequence,
            prompt_hash,
            output,
            tokens_used,
            duration_ms,
        )?;
        Ok(sequence)
    }

    /// Look up a previously reserved key (Replay mode only).
    ///
    /// A missing key — or a recorded entry whose prompt hash differs — is a
    /// [`ReplayError::Divergence`].
    pub fn lookup_at(
        &self,
        tick: u64,
        call_type: &str,
        sequence: u32,
        prompt_hash: &str,
    ) -> Result<ReplayLogEntry, ReplayError> {
        if self.mode != ReplayMode::Replay {
            return Err(ReplayError::ModeMismatch(self.mode));
        }
        match self.index.get(&(tick, call_type.to_string(), sequence)) {
            Some(&idx) if self.entries[idx].prompt_hash == prompt_hash => {
                Ok(self.entries[idx].clone())
            }
            _ => Err(ReplayError::Divergence {
                tick,
                call_type: call_type.to_string(),
                sequence,
            }),
        }
    }

    /// Look up the next call of `call_type` within `tick`, reserving its
    /// sequence from the shared cursor (Replay mode only).
    pub fn lookup(
        &mut self,
        tick: u64,
        call_type: &str,
        prompt_hash: &str,
    ) -> Result<ReplayLogEntry, ReplayError> {
        if self.mode != ReplayMode::Replay {
            return Err(ReplayError::ModeMismatch(self.mode));
        }
        let sequence = self.next_sequence(tick, call_type);
        self.lookup_at(tick, call_type, sequence, prompt_hash)
    }

    /// Write the whole log as JSON lines.
    pub fn flush_to(&self, path: impl AsRef<Path>) -> RelayResult<()> {
        let path = path.as_ref();
        let mut file = std::fs::File::create(path)
            .map_err(RelayError::from)
            .map_err(error_stack::Report::new)
            .map_err(|r| r.attach(format!("creating replay log {}", path.display())))?;
        for entry in &self.entries {
            let line = serde_json::to_string(entry)
                .map_err(RelayError::from)
                .map_err(error_stack::Report::new)?;
            writeln!(file, "{line}")
                .map_err(RelayError::from)
                .map_err(error_stack::Report::new)?;
        }
        Ok(())
    }
}

/// Accumulates divergence statistics for a tolerant validation pass.
///
/// When tolerant validation is requested, divergences are counted here and
/// the offending calls fall through to the live path instead of halting the
/// session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayValidator {
    divergence_count: u64,
    first_divergence: Option<DivergencePoint>,
}

impl ReplayValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, point: DivergencePoint) {
        self.divergence_count += 1;
        if self.first_divergence.is_none() {
            self.first_divergence = Some(point);
        }
    }

    pub fn divergence_count(&self) -> u64 {
        self.divergence_count
    }

    pub fn first_divergence(&self) -> Option<&DivergencePoint> {
        self.first_divergence.as_ref()
    }

    pub fn is_clean(&self) -> bool {
        self.divergence_count == 0
    }
}
