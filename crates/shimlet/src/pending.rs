//! Outstanding invocations awaiting a response line.
//!
//! In sequential mode the table behaves as a single slot: at most one entry,
//! and a response is matched purely by arrival order. In correlated mode it is
//! a concurrent map keyed by the id echoed back by the worker. A response
//! without an id always goes to the oldest entry, so a worker that answers in
//! order without echoing ids is still served correctly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::bridge::protocol::CorrelationId;
use crate::config::CorrelationMode;
use crate::invocation::Completion;

struct PendingEntry {
    /// Install order; requests are written to the worker in this order.
    seq: u64,
    completion: Completion,
    submitted_at: Instant,
}

/// A pending invocation removed from the table; the caller must complete it.
#[derive(Debug)]
pub struct Claimed {
    pub id: CorrelationId,
    pub completion: Completion,
    pub elapsed: Duration,
}

/// Why a response line matched no pending invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unmatched {
    #[error("no invocation is pending")]
    Empty,
    #[error("no pending invocation with id {0}")]
    UnknownId(CorrelationId),
}

pub struct PendingTable {
    mode: CorrelationMode,
    entries: DashMap<CorrelationId, PendingEntry>,
    /// Sequential mode: set while the single slot is taken.
    occupied: AtomicBool,
    next_seq: AtomicU64,
}

impl PendingTable {
    pub fn new(mode: CorrelationMode) -> Self {
        Self {
            mode,
            entries: DashMap::new(),
            occupied: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Register a completion under `id`.
    ///
    /// In sequential mode this fails while another invocation is pending and
    /// hands the completion back untouched.
    pub fn install(&self, id: CorrelationId, completion: Completion) -> Result<(), Completion> {
        if self.mode == CorrelationMode::Sequential
            && self
                .occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(completion);
        }

        self.entries.insert(
            id,
            PendingEntry {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                completion,
                submitted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove the entry a response line belongs to.
    ///
    /// Sequential mode ignores ids. Without an id the oldest entry is taken.
    pub fn claim(&self, response_id: Option<CorrelationId>) -> Result<Claimed, Unmatched> {
        match (self.mode, response_id) {
            (CorrelationMode::Correlated, Some(id)) => {
                self.take(id).ok_or(Unmatched::UnknownId(id))
            }
            _ => self.claim_oldest().ok_or(Unmatched::Empty),
        }
    }

    /// Remove the longest-waiting entry.
    pub fn claim_oldest(&self) -> Option<Claimed> {
        let id = self
            .entries
            .iter()
            .min_by_key(|e| e.value().seq)
            .map(|e| *e.key())?;
        self.take(id)
    }

    /// Remove a specific entry, e.g. when its request could not be written.
    pub fn take(&self, id: CorrelationId) -> Option<Claimed> {
        let (id, entry) = self.entries.remove(&id)?;
        if self.mode == CorrelationMode::Sequential {
            self.occupied.store(false, Ordering::Release);
        }
        Some(Claimed {
            id,
            completion: entry.completion,
            elapsed: entry.submitted_at.elapsed(),
        })
    }

    /// Remove every entry, oldest first.
    pub fn drain(&self) -> Vec<Claimed> {
        let mut ids: Vec<(u64, CorrelationId)> = self
            .entries
            .iter()
            .map(|e| (e.value().seq, *e.key()))
            .collect();
        ids.sort_unstable_by_key(|(seq, _)| *seq);
        ids.into_iter().filter_map(|(_, id)| self.take(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
