//! Bookkeeping for tracked calls that are waiting on an [`Outcome`].

use crate::{dispatcher::panic_message, message::Outcome, types::CallId};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Invoked with the matching [`Outcome`] once it arrives.
pub type Continuation = Box<dyn FnOnce(Outcome) + Send + 'static>;

struct PendingCall {
    method: String,
    on_success: Continuation,
    on_error: Option<Continuation>,
}

/// Which continuation, if any, an [`Outcome`] was delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    Failed,
    /// The outcome carried an error but the caller registered no error continuation.
    Unhandled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("call id {0} is already pending")]
    DuplicateId(CallId),
    #[error("no pending call with id {0}")]
    UnknownId(CallId),
}

/// In-flight tracked calls keyed by id.
///
/// An entry is removed before its continuation runs, so each id is fulfilled at
/// most once and a repeated outcome is reported as [`RegistryError::UnknownId`].
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CallId, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: CallId,
        method: impl Into<String>,
        on_success: Continuation,
        on_error: Option<Continuation>,
    ) -> Result<(), RegistryError> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let _ = calls.insert(
            id,
            PendingCall {
                method: method.into(),
                on_success,
                on_error,
            },
        );
        debug!(id, pending = calls.len(), "registered pending call");
        Ok(())
    }

    pub fn resolve(&self, outcome: Outcome) -> Result<Resolution, RegistryError> {
        // The guard is a temporary, so the lock is released before any continuation runs.
        let call = self
            .calls
            .lock()
            .remove(&outcome.id)
            .ok_or(RegistryError::UnknownId(outcome.id))?;

        let PendingCall {
            method,
            on_success,
            on_error,
        } = call;

        if !outcome.is_error() {
            run_contained(&method, on_success, outcome);
            return Ok(Resolution::Succeeded);
        }
        if let Some(on_error) = on_error {
            run_contained(&method, on_error, outcome);
            return Ok(Resolution::Failed);
        }
        let error = outcome.error.unwrap_or_default();
        warn!(
            id = outcome.id,
            %method,
            %error,
            result = %outcome.result,
            "unhandled error outcome"
        );
        Ok(Resolution::Unhandled)
    }

    /// Drop the entry for `id` without invoking it.
    pub fn remove(&self, id: CallId) -> bool {
        self.calls.lock().remove(&id).is_some()
    }

    /// Drop every entry without invoking it and return the abandoned ids.
    pub fn abandon_all(&self) -> Vec<CallId> {
        let drained: Vec<_> = self.calls.lock().drain().collect();
        let mut ids: Vec<CallId> = drained
            .into_iter()
            .map(|(id, call)| {
                debug!(id, method = %call.method, "abandoning pending call");
                id
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn pending_ids(&self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.calls.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run a continuation, logging instead of unwinding if it panics.
fn run_contained(method: &str, continuation: Continuation, outcome: Outcome) {
    let id = outcome.id;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || continuation(outcome))) {
        warn!(id, %method, panic = %panic_message(&*payload), "continuation panicked");
    }
}
