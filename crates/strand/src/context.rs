// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

//! Dispatch-context bridge and cooperative cancellation.
//!
//! [`Dispatcher`] is the seam continuation-style code is written against:
//! anything that must resume on "the right thread" takes a dispatcher and
//! posts its continuation through it, without knowing about [`Worker`].
//! [`WorkerContext`] is the bridge that routes such work onto a worker's
//! dedicated thread.

use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};

use crate::{error::Result, worker::Worker};

/// A zero-argument unit of work dispatched onto a worker.
///
/// Ownership transfers to whichever queue or table holds it until it is
/// invoked exactly once.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// A cancellation flag shared between a worker and its callbacks.
///
/// Cancellation is cooperative: setting the flag never interrupts a running
/// callback, it only stops the loop from starting the next wait. Callbacks
/// doing long work can poll [`CancellationToken::is_cancelled`] to bail out
/// early.
#[derive(Clone)]
pub struct CancellationToken {
	cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
	pub fn new() -> Self {
		Self {
			cancelled: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Signal cancellation.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	/// Check if cancellation was requested.
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	/// Re-arm the token for a fresh run.
	pub(crate) fn reset(&self) {
		self.cancelled.store(false, Ordering::SeqCst);
	}
}

impl Default for CancellationToken {
	fn default() -> Self {
		Self::new()
	}
}

/// A target that work can be dispatched onto from any thread.
pub trait Dispatcher: Send + Sync {
	/// Fire-and-forget dispatch of `action` onto the target thread.
	fn post(&self, action: Action);

	/// Blocking dispatch: returns once `action` has run on the target
	/// thread, or with an error if the target is gone.
	fn send(&self, action: Action) -> Result<()>;
}

/// Bridges a [`Worker`] to the [`Dispatcher`] seam.
///
/// A pure adapter with no state beyond the back-reference: `post` and `send`
/// delegate to the worker, including the own-thread inline short-circuit of
/// [`Worker::send`].
#[derive(Clone)]
pub struct WorkerContext {
	worker: Worker,
}

impl WorkerContext {
	pub(crate) fn new(worker: Worker) -> Self {
		Self {
			worker,
		}
	}

	/// The worker this context dispatches onto.
	pub fn worker(&self) -> &Worker {
		&self.worker
	}
}

impl Dispatcher for WorkerContext {
	fn post(&self, action: Action) {
		self.worker.post_boxed(action);
	}

	fn send(&self, action: Action) -> Result<()> {
		self.worker.send(action)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_cancellation_token() {
		let token = CancellationToken::new();
		assert!(!token.is_cancelled());

		let clone = token.clone();
		clone.cancel();
		assert!(token.is_cancelled());

		token.reset();
		assert!(!clone.is_cancelled());
	}
}
