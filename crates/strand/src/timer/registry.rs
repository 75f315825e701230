// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

use std::{
	cmp::Ordering as CmpOrdering,
	collections::BinaryHeap,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use tracing::debug;

use super::{TimerHandle, next_timer_id};
use crate::context::{Action, Dispatcher};

struct TimerEntry {
	/// Unique timer id.
	id: u64,
	/// When the timer should fire.
	deadline: Instant,
	/// One-shot or repeating.
	kind: TimerKind,
	/// Shared flag raced by cancel and fire.
	cancelled: Arc<AtomicBool>,
}

enum TimerKind {
	Once {
		action: Action,
	},
	Repeat {
		callback: Arc<dyn Fn() -> bool + Send + Sync>,
		interval: Duration,
	},
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline && self.id == other.id
	}
}

impl Ord for TimerEntry {
	// BinaryHeap is a max-heap; reverse the ordering for a min-heap by deadline.
	fn cmp(&self, other: &Self) -> CmpOrdering {
		other.deadline.cmp(&self.deadline).then_with(|| other.id.cmp(&self.id))
	}
}

impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}

/// Commands sent to the coordinator thread.
enum Command {
	Once {
		id: u64,
		delay: Duration,
		action: Action,
		cancelled: Arc<AtomicBool>,
	},
	Repeat {
		id: u64,
		interval: Duration,
		callback: Arc<dyn Fn() -> bool + Send + Sync>,
		cancelled: Arc<AtomicBool>,
	},
	Shutdown,
}

/// A thread-safe set of independently cancellable timers.
///
/// Timers are tracked by a dedicated coordinator thread holding a min-heap of
/// deadlines. When the registry is bound to a [`Dispatcher`], an expiry is
/// **posted** through it — the timer action never runs on the coordinator
/// thread, so a worker bound this way keeps its thread-confinement guarantees
/// for timer-triggered work. An unbound registry runs expiries inline on the
/// coordinator.
pub struct TimerRegistry {
	command_tx: Sender<Command>,
	coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl TimerRegistry {
	/// Registry with inline delivery on the coordinator thread.
	pub fn new() -> Self {
		Self::with_dispatch(None)
	}

	/// Registry delivering every expiry through `dispatcher`.
	pub fn bound(dispatcher: Arc<dyn Dispatcher>) -> Self {
		Self::with_dispatch(Some(dispatcher))
	}

	fn with_dispatch(dispatch: Option<Arc<dyn Dispatcher>>) -> Self {
		let (command_tx, command_rx) = unbounded();

		let coordinator = thread::Builder::new()
			.name("strand-timers".to_string())
			.spawn(move || coordinator_loop(command_rx, dispatch))
			.expect("failed to spawn timer coordinator thread");

		Self {
			command_tx,
			coordinator: Mutex::new(Some(coordinator)),
		}
	}

	/// Schedule `action` to fire once after `delay`.
	///
	/// A zero delay fires at command-processing time. Returns a handle that
	/// cancels the timer if it has not fired yet.
	pub fn schedule<F>(&self, delay: Duration, action: F) -> TimerHandle
	where
		F: FnOnce() + Send + 'static,
	{
		let id = next_timer_id();
		let handle = TimerHandle::new(id);

		let _ = self.command_tx.send(Command::Once {
			id,
			delay,
			action: Box::new(action),
			cancelled: handle.cancelled_flag(),
		});

		handle
	}

	/// Schedule `callback` to fire every `interval` until it returns `false`
	/// or the returned handle is cancelled.
	pub fn schedule_repeat<F>(&self, interval: Duration, callback: F) -> TimerHandle
	where
		F: Fn() -> bool + Send + Sync + 'static,
	{
		let id = next_timer_id();
		let handle = TimerHandle::new(id);

		let _ = self.command_tx.send(Command::Repeat {
			id,
			interval,
			callback: Arc::new(callback),
			cancelled: handle.cancelled_flag(),
		});

		handle
	}

	/// Cancel every outstanding timer and stop the coordinator thread.
	///
	/// Idempotent; later `schedule` calls on a shut-down registry are
	/// silently dropped.
	pub fn shutdown(&self) {
		let _ = self.command_tx.send(Command::Shutdown);

		if let Some(handle) = self.coordinator.lock().take() {
			let _ = handle.join();
		}
	}
}

impl Default for TimerRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for TimerRegistry {
	fn drop(&mut self) {
		// Request shutdown without joining; drop must not block.
		let _ = self.command_tx.send(Command::Shutdown);
	}
}

fn deliver(dispatch: &Option<Arc<dyn Dispatcher>>, action: Action) {
	match dispatch {
		Some(target) => target.post(action),
		None => action(),
	}
}

/// The coordinator loop: sleep until the next deadline or command, fire due
/// timers, repeat.
fn coordinator_loop(command_rx: Receiver<Command>, dispatch: Option<Arc<dyn Dispatcher>>) {
	let mut heap: BinaryHeap<TimerEntry> = BinaryHeap::new();

	loop {
		let timeout = heap.peek().map(|entry| {
			let now = Instant::now();
			if entry.deadline <= now {
				Duration::ZERO
			} else {
				entry.deadline.duration_since(now)
			}
		});

		let command = match timeout {
			Some(wait) if wait.is_zero() => command_rx.try_recv().ok(),
			Some(wait) => match command_rx.recv_timeout(wait) {
				Ok(command) => Some(command),
				Err(RecvTimeoutError::Timeout) => None,
				Err(RecvTimeoutError::Disconnected) => return,
			},
			None => match command_rx.recv() {
				Ok(command) => Some(command),
				Err(_) => return,
			},
		};

		if let Some(command) = command {
			match command {
				Command::Once {
					id,
					delay,
					action,
					cancelled,
				} => {
					if delay.is_zero() {
						if cancelled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
							deliver(&dispatch, action);
						}
						continue;
					}

					heap.push(TimerEntry {
						id,
						deadline: Instant::now() + delay,
						kind: TimerKind::Once {
							action,
						},
						cancelled,
					});
				}
				Command::Repeat {
					id,
					interval,
					callback,
					cancelled,
				} => {
					heap.push(TimerEntry {
						id,
						deadline: Instant::now() + interval,
						kind: TimerKind::Repeat {
							callback,
							interval,
						},
						cancelled,
					});
				}
				Command::Shutdown => {
					debug!(outstanding = heap.len(), "timer registry shutting down");
					for entry in heap.drain() {
						entry.cancelled.store(true, Ordering::SeqCst);
					}
					return;
				}
			}
		}

		// Fire all due timers.
		let now = Instant::now();
		while let Some(entry) = heap.peek() {
			if entry.deadline > now {
				break;
			}

			let entry = heap.pop().unwrap();

			match entry.kind {
				TimerKind::Once {
					action,
				} => {
					// Mark spent before delivering; a racing cancel and the
					// fire path agree via this CAS on who wins.
					if entry.cancelled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
						deliver(&dispatch, action);
					}
				}
				TimerKind::Repeat {
					callback,
					interval,
				} => {
					if entry.cancelled.load(Ordering::SeqCst) {
						continue;
					}

					let cancelled = entry.cancelled.clone();
					let run = callback.clone();
					deliver(
						&dispatch,
						Box::new(move || {
							// Re-check at delivery time; a posted expiry may
							// run well after a cancel.
							if !cancelled.load(Ordering::SeqCst) && !run() {
								cancelled.store(true, Ordering::SeqCst);
							}
						}),
					);

					heap.push(TimerEntry {
						id: entry.id,
						deadline: now + interval,
						kind: TimerKind::Repeat {
							callback,
							interval,
						},
						cancelled: entry.cancelled,
					});
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{atomic::AtomicUsize, mpsc};

	use super::*;

	#[test]
	fn test_schedule_fires_once() {
		let registry = TimerRegistry::new();

		let (tx, rx) = mpsc::channel();
		registry.schedule(Duration::from_millis(10), move || {
			tx.send(()).unwrap();
		});

		rx.recv_timeout(Duration::from_secs(1)).unwrap();
		assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
		registry.shutdown();
	}

	#[test]
	fn test_schedule_zero_delay() {
		let registry = TimerRegistry::new();

		let (tx, rx) = mpsc::channel();
		registry.schedule(Duration::ZERO, move || {
			tx.send(()).unwrap();
		});

		rx.recv_timeout(Duration::from_secs(1)).unwrap();
		registry.shutdown();
	}

	#[test]
	fn test_cancel_before_fire() {
		let registry = TimerRegistry::new();

		let (tx, rx) = mpsc::channel();
		let handle = registry.schedule(Duration::from_millis(50), move || {
			tx.send(()).unwrap();
		});

		assert!(handle.cancel());
		assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

		// Second cancel is a no-op.
		assert!(!handle.cancel());
		registry.shutdown();
	}

	#[test]
	fn test_cancel_after_fire_is_noop() {
		let registry = TimerRegistry::new();
		let counter = Arc::new(AtomicUsize::new(0));

		let fired = Arc::clone(&counter);
		let handle = registry.schedule(Duration::from_millis(10), move || {
			fired.fetch_add(1, Ordering::SeqCst);
		});

		thread::sleep(Duration::from_millis(80));
		assert!(!handle.cancel());
		assert!(handle.is_spent());
		assert_eq!(counter.load(Ordering::SeqCst), 1);
		registry.shutdown();
	}

	#[test]
	fn test_deadline_ordering() {
		let registry = TimerRegistry::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		for i in 0..5u64 {
			let order = Arc::clone(&order);
			// Reverse order of scheduling vs deadlines.
			registry.schedule(Duration::from_millis((5 - i) * 20), move || {
				order.lock().push(i);
			});
		}

		thread::sleep(Duration::from_millis(250));
		assert_eq!(*order.lock(), vec![4, 3, 2, 1, 0]);
		registry.shutdown();
	}

	#[test]
	fn test_repeat_until_false() {
		let registry = TimerRegistry::new();
		let counter = Arc::new(AtomicUsize::new(0));

		let ticks = Arc::clone(&counter);
		registry.schedule_repeat(Duration::from_millis(10), move || {
			ticks.fetch_add(1, Ordering::SeqCst) < 2
		});

		thread::sleep(Duration::from_millis(150));
		assert_eq!(counter.load(Ordering::SeqCst), 3);
		registry.shutdown();
	}

	#[test]
	fn test_repeat_cancel() {
		let registry = TimerRegistry::new();
		let counter = Arc::new(AtomicUsize::new(0));

		let ticks = Arc::clone(&counter);
		let handle = registry.schedule_repeat(Duration::from_millis(10), move || {
			ticks.fetch_add(1, Ordering::SeqCst);
			true
		});

		let mut attempts = 0;
		while counter.load(Ordering::SeqCst) < 3 && attempts < 50 {
			thread::sleep(Duration::from_millis(10));
			attempts += 1;
		}
		assert!(counter.load(Ordering::SeqCst) >= 3);

		handle.cancel();
		thread::sleep(Duration::from_millis(30));
		let settled = counter.load(Ordering::SeqCst);
		thread::sleep(Duration::from_millis(60));
		assert_eq!(counter.load(Ordering::SeqCst), settled);
		registry.shutdown();
	}

	#[test]
	fn test_shutdown_cancels_outstanding() {
		let registry = TimerRegistry::new();

		let (tx, rx) = mpsc::channel();
		let handle = registry.schedule(Duration::from_millis(60), move || {
			tx.send(()).unwrap();
		});

		registry.shutdown();
		assert!(handle.is_spent());
		assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

		// Idempotent.
		registry.shutdown();
	}
}
