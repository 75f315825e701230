// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

//! Timers delivered into a dispatch target.
//!
//! - [`TimerRegistry`]: a set of independently cancellable timers driven by a
//!   coordinator thread
//! - [`TimerHandle`]: cancels a scheduled timer before it fires

use std::{
	fmt,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
};

mod registry;

pub use registry::TimerRegistry;

/// Handle to a scheduled timer.
///
/// Cancellation and firing race on one shared flag, and the winner of that
/// race decides: a timer fires at most once, and cancelling after it has
/// fired is a silent no-op.
#[derive(Clone)]
pub struct TimerHandle {
	id: u64,
	cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
	pub(crate) fn new(id: u64) -> Self {
		Self {
			id,
			cancelled: Arc::new(AtomicBool::new(false)),
		}
	}

	/// Cancel this timer.
	///
	/// Returns `true` if the timer had neither fired nor been cancelled yet.
	/// Calling it again, or after the timer has fired, is a no-op.
	pub fn cancel(&self) -> bool {
		self.cancelled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
	}

	/// Whether this timer will never fire again, either because it was
	/// cancelled or because a one-shot timer already fired.
	pub fn is_spent(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub(crate) fn cancelled_flag(&self) -> Arc<AtomicBool> {
		self.cancelled.clone()
	}
}

impl fmt::Debug for TimerHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TimerHandle").field("id", &self.id).field("spent", &self.is_spent()).finish()
	}
}

/// Counter for generating unique timer ids.
static TIMER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_timer_id() -> u64 {
	TIMER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}
