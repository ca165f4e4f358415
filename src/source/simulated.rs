//! Simulated traversal job.
//!
//! Walks a finite pool of documents, one at a time, with an optional delay
//! per document. Used by the host binary's demo mode and by tests.
//!
//! A cancel that arrives while no batch is in progress applies to the next
//! batch, which then stops before taking any document.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{BatchResult, TraversalDelayPolicy};
use crate::error::{Result, TraversalError};
use crate::source::BatchJob;

#[derive(Default)]
struct CancelState {
    token: CancellationToken,
    active: bool,
    pending: bool,
}

pub struct SimulatedJob {
    remaining: Mutex<usize>,
    per_document: Duration,
    failure: Option<String>,
    cancel: Mutex<CancelState>,
    hints: Mutex<Vec<usize>>,
    cancels: AtomicUsize,
}

impl SimulatedJob {
    /// A job with `documents` waiting to be traversed.
    pub fn new(documents: usize) -> Self {
        Self {
            remaining: Mutex::new(documents),
            per_document: Duration::ZERO,
            failure: None,
            cancel: Mutex::new(CancelState::default()),
            hints: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
        }
    }

    pub fn with_per_document(mut self, per_document: Duration) -> Self {
        self.per_document = per_document;
        self
    }

    /// Make every batch fail with `message`.
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// New documents showed up in the repository.
    pub fn add_documents(&self, count: usize) {
        *self.remaining.lock().unwrap_or_else(PoisonError::into_inner) += count;
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hints received so far, one per batch.
    pub fn hints(&self) -> Vec<usize> {
        self.hints.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn batch_count(&self) -> usize {
        self.hints.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn take_document(&self) -> bool {
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }
}

#[async_trait]
impl BatchJob for SimulatedJob {
    async fn run_batch(&self, batch_hint: usize) -> Result<BatchResult> {
        let start = Instant::now();
        let token = self.begin_batch();
        // Recorded after the token is in place, so a cancel seen by callers
        // that waited on `batch_count` always lands.
        self.hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch_hint);

        let result = self.traverse(batch_hint, &token, start).await;
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).active = false;
        result
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel.active {
            cancel.token.cancel();
        } else {
            cancel.pending = true;
        }
    }
}

impl SimulatedJob {
    fn begin_batch(&self) -> CancellationToken {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        cancel.token = CancellationToken::new();
        if std::mem::take(&mut cancel.pending) {
            cancel.token.cancel();
        }
        cancel.active = true;
        cancel.token.clone()
    }

    async fn traverse(&self, batch_hint: usize, token: &CancellationToken, start: Instant) -> Result<BatchResult> {
        if let Some(message) = &self.failure {
            return Err(TraversalError::Batch(message.clone()));
        }

        let mut processed = 0;
        while processed < batch_hint {
            if token.is_cancelled() {
                return Ok(BatchResult::finished(TraversalDelayPolicy::Error, processed, start));
            }
            if !self.take_document() {
                return Ok(BatchResult::finished(TraversalDelayPolicy::Poll, processed, start));
            }
            if !self.per_document.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.per_document) => {}
                    _ = token.cancelled() => {
                        // The interrupted document goes back to the pool.
                        self.add_documents(1);
                        return Ok(BatchResult::finished(TraversalDelayPolicy::Error, processed, start));
                    }
                }
            }
            processed += 1;
        }

        let policy = if self.remaining() == 0 {
            TraversalDelayPolicy::Poll
        } else {
            TraversalDelayPolicy::Immediate
        };
        Ok(BatchResult::finished(policy, processed, start))
    }
}
