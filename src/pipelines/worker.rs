// SPDX-License-Identifier: GPL-3.0-only

//! Thread lifecycle management for the capture and encode loops
//!
//! A [`WorkerThread`] owns a state value for as long as its thread runs and
//! hands it back when joined. This lets the device handle and the encoder
//! state live on exactly one thread at a time without any locking: the
//! owner gives them to the worker on start and takes them back on stop.

use super::work_queue::CancelToken;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by the loop closure to control loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    /// Run another iteration
    Continue,
    /// Leave the loop and finish the thread
    Stop,
}

type Waker = Box<dyn Fn() + Send + Sync>;

/// Thread creation failed. The state the thread would have owned is
/// handed back so the caller can keep its resources.
#[derive(Debug)]
pub struct SpawnError<S> {
    pub error: io::Error,
    pub state: Option<S>,
}

impl<S> std::fmt::Display for SpawnError<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

/// Slot that passes the state into a thread that may never start
struct Handoff<S>(Arc<Mutex<Option<S>>>);

impl<S> Handoff<S> {
    fn new(state: S) -> Self {
        Self(Arc::new(Mutex::new(Some(state))))
    }

    fn share(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    fn take(&self) -> Option<S> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A named loop thread that returns its state on join
pub struct WorkerThread<S> {
    handle: Option<JoinHandle<Option<S>>>,
    cancel: CancelToken,
    waker: Option<Waker>,
    name: String,
}

impl<S: Send + 'static> WorkerThread<S> {
    /// Spawn a thread running `loop_fn` against `state`.
    ///
    /// The closure is called repeatedly until it returns [`LoopAction::Stop`]
    /// or `cancel` fires. The cancel flag is checked before every iteration.
    /// If the thread cannot be created, `state` comes back in the error.
    pub fn spawn<F>(
        name: &str,
        cancel: CancelToken,
        state: S,
        mut loop_fn: F,
    ) -> Result<Self, SpawnError<S>>
    where
        F: FnMut(&mut S, &CancelToken) -> LoopAction + Send + 'static,
    {
        let thread_cancel = cancel.clone();
        let thread_name = name.to_string();
        let handoff = Handoff::new(state);
        let thread_handoff = handoff.share();

        info!(name = %name, "Starting worker thread");

        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = thread_handoff.take()?;
                debug!(name = %thread_name, "Worker thread started");
                loop {
                    if thread_cancel.is_cancelled() {
                        debug!(name = %thread_name, "Stop signal received");
                        break;
                    }
                    if loop_fn(&mut state, &thread_cancel) == LoopAction::Stop {
                        debug!(name = %thread_name, "Loop requested stop");
                        break;
                    }
                }
                info!(name = %thread_name, "Worker thread exiting");
                Some(state)
            });

        match spawned {
            Ok(handle) => Ok(Self {
                handle: Some(handle),
                cancel,
                waker: None,
                name: name.to_string(),
            }),
            Err(error) => {
                warn!(name = %name, error = %error, "Failed to spawn worker thread");
                Err(SpawnError {
                    error,
                    state: handoff.take(),
                })
            }
        }
    }

    /// Run `waker` right after the cancel flag is raised.
    ///
    /// Used to unpark a thread blocked on a condition variable.
    pub fn with_waker(mut self, waker: impl Fn() + Send + Sync + 'static) -> Self {
        self.waker = Some(Box::new(waker));
        self
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Raise the cancel flag without waiting
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting worker stop");
        self.cancel.cancel();
        if let Some(waker) = &self.waker {
            waker();
        }
    }

    /// Stop the loop, wait for the thread and take its state back.
    ///
    /// Returns `None` if the thread panicked; its state was released while
    /// unwinding.
    pub fn stop(mut self) -> Option<S> {
        self.request_stop();
        self.join()
    }

    fn join(&mut self) -> Option<S> {
        let handle = self.handle.take()?;
        debug!(name = %self.name, "Waiting for worker thread to finish");
        match handle.join() {
            Ok(state) => {
                debug!(name = %self.name, "Worker thread finished");
                state
            }
            Err(e) => {
                warn!(name = %self.name, "Worker thread panicked: {:?}", e);
                None
            }
        }
    }
}

impl<S> Drop for WorkerThread<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(name = %self.name, "WorkerThread dropped, stopping loop");
            self.cancel.cancel();
            if let Some(waker) = &self.waker {
                waker();
            }
            let _ = handle.join();
        }
    }
}
