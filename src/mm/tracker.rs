//! Per-segment page-state tracking
//!
//! Each segment owns one [`PageTracker`]: an array of atomic per-page
//! states, one per page-aligned unit of the segment's memory extent. The
//! fault handler is the only writer after publication, and its transitions
//! are monotonic: `Unmapped` → `Filling` → `Mapped`, never back (the whole
//! tracker is discarded at teardown).
//!
//! The `Filling` state is what makes concurrent faults on one page sound
//! without a lock: exactly one faulting thread wins the claim and
//! materializes the page, any other thread spins until the winner commits
//! and then simply returns to retry the access.

use core::sync::atomic::{AtomicU8, Ordering};

const UNMAPPED: u8 = 0;
const FILLING: u8 = 1;
const MAPPED: u8 = 2;

/// Observable state of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Never materialized.
    Unmapped,
    /// A faulting thread is materializing it right now.
    Filling,
    /// Materialized; stays resident for the process's lifetime.
    Mapped,
}

/// Outcome of trying to claim a page for materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the fill; it must call `commit` when done.
    Won,
    /// Another thread owns the fill; wait for it with `wait_mapped`.
    InProgress,
    /// The page is already mapped; the fault is not a missing-page fault.
    AlreadyMapped,
}

/// Atomic per-page state for one segment.
pub struct PageTracker {
    states: Box<[AtomicU8]>,
}

impl PageTracker {
    /// Create a tracker with every page `Unmapped`.
    pub fn new(pages: usize) -> Self {
        Self {
            states: (0..pages).map(|_| AtomicU8::new(UNMAPPED)).collect(),
        }
    }

    /// Number of tracked pages.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True if the tracker covers no pages.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current state of page `index`.
    pub fn state(&self, index: usize) -> PageState {
        match self.states[index].load(Ordering::Acquire) {
            UNMAPPED => PageState::Unmapped,
            FILLING => PageState::Filling,
            _ => PageState::Mapped,
        }
    }

    /// Try to take ownership of materializing page `index`.
    pub fn claim(&self, index: usize) -> Claim {
        match self.states[index].compare_exchange(
            UNMAPPED,
            FILLING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => Claim::Won,
            Err(FILLING) => Claim::InProgress,
            Err(_) => Claim::AlreadyMapped,
        }
    }

    /// Mark page `index` as mapped. Called only by the claim winner, after
    /// the page content is fully correct.
    pub fn commit(&self, index: usize) {
        self.states[index].store(MAPPED, Ordering::Release);
    }

    /// Spin until page `index` reaches `Mapped`.
    pub fn wait_mapped(&self, index: usize) {
        while self.states[index].load(Ordering::Acquire) != MAPPED {
            core::hint::spin_loop();
        }
    }

    /// Indices of all pages currently `Mapped`. Used by teardown.
    pub fn mapped_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.load(Ordering::Acquire) == MAPPED)
            .map(|(i, _)| i)
    }
}
