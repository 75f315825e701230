// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

use thiserror::Error;

/// Errors surfaced by worker lifecycle and dispatch calls.
///
/// All variants are usage or liveness errors raised synchronously at the
/// call site; a panic inside a dispatched callback is not an error value but
/// goes through the worker's panic policy instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
	/// `start` was called while the worker already owns a live thread.
	#[error("worker `{name}` is already running")]
	AlreadyRunning {
		name: String,
	},

	/// A blocking call was made against a worker that is not running.
	#[error("worker `{name}` is not running")]
	NotRunning {
		name: String,
	},

	/// The worker thread exited while a blocking call was waiting on it.
	#[error("worker `{name}` stopped before the call completed")]
	Stopped {
		name: String,
	},

	/// `join` was called from the worker's own thread.
	#[error("cannot join worker `{name}` from its own thread")]
	SelfJoin {
		name: String,
	},
}

pub type Result<T> = std::result::Result<T, WorkerError>;
