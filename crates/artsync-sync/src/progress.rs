use std::sync::{Mutex, PoisonError};

use artsync_core::BatchResult;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub completed_batches: usize,
    pub total_batches: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ProgressState {
    pub fn result(&self) -> BatchResult {
        BatchResult {
            processed: self.processed,
            skipped: self.skipped,
            errors: self.errors,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total_batches == 0 {
            return 100.0;
        }
        self.completed_batches as f64 * 100.0 / self.total_batches as f64
    }
}

/// Shared run counters; every update is applied atomically under one lock.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(total_batches: usize) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                total_batches,
                ..Default::default()
            }),
        }
    }

    pub fn update(&self, result: &BatchResult) -> ProgressState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.completed_batches += 1;
        state.processed += result.processed;
        state.skipped += result.skipped;
        state.errors += result.errors;
        let snapshot = *state;
        drop(state);

        info!(
            completed = snapshot.completed_batches,
            total = snapshot.total_batches,
            percent = (snapshot.percent() * 10.0).round() / 10.0,
            processed = snapshot.processed,
            skipped = snapshot.skipped,
            errors = snapshot.errors,
            "migration progress"
        );
        snapshot
    }

    pub fn snapshot(&self) -> ProgressState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
