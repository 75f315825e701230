// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

//! Waitable binary ready-flags.
//!
//! A [`Signal`] is the unit every event source is normalized to so that one
//! multiplexed wait can cover all of them: the inbound action queue, external
//! sources registered with a worker, and the worker's own wake-ups all raise
//! signals. A signal holds at most one readiness token, so any burst of
//! raises collapses into a single wake-up on the consumer side.

use std::{
	fmt,
	hash::{Hash, Hasher},
	sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, Sender, bounded};

/// Counter for generating unique signal ids.
static SIGNAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_signal_id() -> u64 {
	SIGNAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An opaque handle to something that can become "ready" and be waited upon.
///
/// Backed by a capacity-1 channel: [`Signal::raise`] deposits a readiness
/// token if none is pending, the owning loop consumes it with
/// [`Signal::reset`]. Clones share the same underlying source; equality and
/// hashing are by identity, never by state.
#[derive(Clone)]
pub struct Signal {
	id: u64,
	tx: Sender<()>,
	rx: Receiver<()>,
}

impl Signal {
	pub fn new() -> Self {
		let (tx, rx) = bounded(1);
		Self {
			id: next_signal_id(),
			tx,
			rx,
		}
	}

	/// Identity of the underlying source, shared by all clones.
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Mark the signal ready. Callable from any thread; never blocks.
	///
	/// Raising an already-raised signal is a no-op, which is what collapses
	/// a burst of raises into one wake-up.
	pub fn raise(&self) {
		let _ = self.tx.try_send(());
	}

	/// Consume the readiness token if one is pending.
	///
	/// Returns `true` if the signal was raised.
	pub fn reset(&self) -> bool {
		self.rx.try_recv().is_ok()
	}

	/// Observe readiness without consuming it.
	pub fn is_raised(&self) -> bool {
		!self.rx.is_empty()
	}

	/// The receiver registered with the wait-on-any multiplexer.
	pub(crate) fn receiver(&self) -> &Receiver<()> {
		&self.rx
	}
}

impl Default for Signal {
	fn default() -> Self {
		Self::new()
	}
}

impl PartialEq for Signal {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for Signal {}

impl Hash for Signal {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Debug for Signal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Signal").field("id", &self.id).field("raised", &self.is_raised()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_raise_and_reset() {
		let signal = Signal::new();
		assert!(!signal.is_raised());

		signal.raise();
		assert!(signal.is_raised());

		assert!(signal.reset());
		assert!(!signal.is_raised());
		assert!(!signal.reset());
	}

	#[test]
	fn test_burst_collapses_to_one_token() {
		let signal = Signal::new();
		signal.raise();
		signal.raise();
		signal.raise();

		assert!(signal.reset());
		assert!(!signal.reset());
	}

	#[test]
	fn test_clones_share_state_but_new_signals_differ() {
		let signal = Signal::new();
		let clone = signal.clone();
		let other = Signal::new();

		assert_eq!(signal, clone);
		assert_ne!(signal, other);

		clone.raise();
		assert!(signal.is_raised());
		assert!(signal.reset());
		assert!(!clone.is_raised());
	}
}
