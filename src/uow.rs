//! Unit of work: the scope across which deferred aggregate mutations are
//! batched into a single write-back.
//!
//! Participants register a completion callback (run on commit) and an abort
//! callback (run on rollback, on a failed commit, or when the transaction is
//! dropped unfinished). The engine never depends on a host framework's
//! transaction API; hosts drive a [`Transaction`] directly.

use std::mem;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::error::StoreError;

pub type CompletionCallback = Box<dyn FnOnce() -> Result<(), StoreError> + Send>;
pub type AbortCallback = Box<dyn FnOnce() + Send>;

pub trait UnitOfWork {
    fn on_complete(&self, callback: CompletionCallback);
    fn on_abort(&self, callback: AbortCallback);
}

pub struct Transaction {
    id: Uuid,
    completions: Mutex<Vec<CompletionCallback>>,
    aborts: Mutex<Vec<AbortCallback>>,
    finished: bool,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::begin()
    }
}

impl Transaction {
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            completions: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run completion callbacks in registration order. The first failure
    /// stops the remaining completions, runs every abort callback and is
    /// returned.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        let completions = mem::take(
            self.completions
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for callback in completions {
            if let Err(e) = callback() {
                tracing::warn!(
                    transaction = %self.id,
                    error = %e,
                    "Unit of work failed to complete"
                );
                self.run_aborts();
                return Err(e);
            }
        }

        tracing::trace!(transaction = %self.id, "Unit of work committed");
        Ok(())
    }

    /// Discard all participant state without writing anything back.
    pub fn abort(mut self) {
        self.finished = true;
        self.run_aborts();
        tracing::trace!(transaction = %self.id, "Unit of work aborted");
    }

    fn run_aborts(&mut self) {
        let aborts = mem::take(self.aborts.get_mut().unwrap_or_else(PoisonError::into_inner));
        for callback in aborts {
            callback();
        }
    }
}

impl UnitOfWork for Transaction {
    fn on_complete(&self, callback: CompletionCallback) {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn on_abort(&self, callback: AbortCallback) {
        self.aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.run_aborts();
        }
    }
}
