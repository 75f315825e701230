// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

//! Thread-safe inbound action queue.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::{context::Action, signal::Signal};

/// Multi-producer, single-consumer queue of pending actions paired with a
/// ready [`Signal`].
///
/// The ready signal is deliberately decoupled from "non-empty": producers
/// raise it on every enqueue, but a raised signal carries a single token, so
/// a burst of enqueues costs the consumer one wake-up. The consumer pops
/// exactly one action per wake and the queue re-raises readiness while items
/// remain, which keeps the queue fair relative to other sources multiplexed
/// into the same wait.
pub struct SignalQueue {
	actions: Mutex<VecDeque<Action>>,
	ready: Signal,
}

impl SignalQueue {
	pub fn new() -> Self {
		Self {
			actions: Mutex::new(VecDeque::new()),
			ready: Signal::new(),
		}
	}

	/// Append an action and mark the queue ready. Never blocks.
	pub fn enqueue(&self, action: Action) {
		self.actions.lock().push_back(action);
		self.ready.raise();
	}

	/// Pop one action, consumer side only by convention.
	///
	/// Resets the ready signal before removal and re-raises it if items
	/// remain afterwards, so readiness survives partial drains and a
	/// producer racing the reset at worst causes one empty wake-up.
	pub fn try_dequeue(&self) -> Option<Action> {
		self.ready.reset();
		let mut actions = self.actions.lock();
		let action = actions.pop_front();
		if !actions.is_empty() {
			self.ready.raise();
		}
		action
	}

	/// Drop all pending actions and reset the ready signal.
	pub fn clear(&self) {
		self.actions.lock().clear();
		self.ready.reset();
	}

	pub fn len(&self) -> usize {
		self.actions.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.actions.lock().is_empty()
	}

	/// The signal raised whenever the queue holds work.
	pub fn ready_signal(&self) -> &Signal {
		&self.ready
	}
}

impl Default for SignalQueue {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	};

	use super::*;

	#[test]
	fn test_fifo_order() {
		let queue = SignalQueue::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		for i in 0..5 {
			let order = Arc::clone(&order);
			queue.enqueue(Box::new(move || order.lock().push(i)));
		}

		while let Some(action) = queue.try_dequeue() {
			action();
		}

		assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
	}

	#[test]
	fn test_burst_raises_single_token_and_rearms() {
		let queue = SignalQueue::new();
		let counter = Arc::new(AtomicUsize::new(0));

		for _ in 0..3 {
			let counter = Arc::clone(&counter);
			queue.enqueue(Box::new(move || {
				counter.fetch_add(1, Ordering::Relaxed);
			}));
		}

		// Three enqueues, one pending token.
		assert!(queue.ready_signal().is_raised());

		// One action per wake; readiness is re-raised while items remain.
		queue.try_dequeue().unwrap()();
		assert!(queue.ready_signal().is_raised());
		queue.try_dequeue().unwrap()();
		assert!(queue.ready_signal().is_raised());
		queue.try_dequeue().unwrap()();
		assert!(!queue.ready_signal().is_raised());

		assert!(queue.try_dequeue().is_none());
		assert_eq!(counter.load(Ordering::Relaxed), 3);
	}

	#[test]
	fn test_clear_drops_actions_and_resets() {
		let queue = SignalQueue::new();
		queue.enqueue(Box::new(|| {}));
		queue.enqueue(Box::new(|| {}));
		assert_eq!(queue.len(), 2);

		queue.clear();
		assert!(queue.is_empty());
		assert!(!queue.ready_signal().is_raised());
		assert!(queue.try_dequeue().is_none());
	}
}
