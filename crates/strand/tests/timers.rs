// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

//! Integration tests for timers delivered through a worker.

use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
		mpsc,
	},
	thread,
	time::Duration,
};

use strand::Worker;

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
	for _ in 0..400 {
		if cond() {
			return true;
		}
		thread::sleep(Duration::from_millis(5));
	}
	false
}

#[test]
fn test_timer_fires_on_worker_thread() {
	let worker = Worker::new("timer-host");
	worker.start().unwrap();

	let (tx, rx) = mpsc::channel();
	worker.schedule(Duration::from_millis(10), move || {
		tx.send(Worker::current().map(|w| w.name())).unwrap();
	});

	let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
	assert_eq!(name.as_deref(), Some("timer-host"));

	worker.stop().unwrap();
}

#[test]
fn test_timer_fires_exactly_once() {
	let worker = Worker::new("one-shot");
	worker.start().unwrap();

	let counter = Arc::new(AtomicUsize::new(0));
	let handle = {
		let counter = Arc::clone(&counter);
		worker.schedule(Duration::from_millis(10), move || {
			counter.fetch_add(1, Ordering::SeqCst);
		})
	};

	assert!(wait_until(|| counter.load(Ordering::SeqCst) == 1));
	assert!(handle.is_spent());

	// Cancelling after the fire changes nothing.
	assert!(!handle.cancel());
	thread::sleep(Duration::from_millis(50));
	assert_eq!(counter.load(Ordering::SeqCst), 1);

	worker.stop().unwrap();
}

#[test]
fn test_cancel_before_fire_never_runs() {
	let worker = Worker::new("cancelled");
	worker.start().unwrap();

	let counter = Arc::new(AtomicUsize::new(0));
	let handle = {
		let counter = Arc::clone(&counter);
		worker.schedule(Duration::from_millis(100), move || {
			counter.fetch_add(1, Ordering::SeqCst);
		})
	};

	assert!(handle.cancel());
	assert!(handle.is_spent());
	thread::sleep(Duration::from_millis(200));
	assert_eq!(counter.load(Ordering::SeqCst), 0);

	worker.stop().unwrap();
}

#[test]
fn test_zero_delay_fires_immediately() {
	let worker = Worker::new("instant");
	worker.start().unwrap();

	let counter = Arc::new(AtomicUsize::new(0));
	{
		let counter = Arc::clone(&counter);
		worker.schedule(Duration::ZERO, move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
	}

	assert!(wait_until(|| counter.load(Ordering::SeqCst) == 1));
	worker.stop().unwrap();
}

#[test]
fn test_repeat_runs_until_cancelled() {
	let worker = Worker::new("metronome");
	worker.start().unwrap();

	let counter = Arc::new(AtomicUsize::new(0));
	let handle = {
		let counter = Arc::clone(&counter);
		worker.schedule_repeat(Duration::from_millis(10), move || {
			counter.fetch_add(1, Ordering::SeqCst);
			true
		})
	};

	assert!(wait_until(|| counter.load(Ordering::SeqCst) >= 3));
	assert!(handle.cancel());

	// In-flight deliveries may still land, then the count must settle.
	thread::sleep(Duration::from_millis(50));
	let settled = counter.load(Ordering::SeqCst);
	thread::sleep(Duration::from_millis(100));
	assert_eq!(counter.load(Ordering::SeqCst), settled);

	worker.stop().unwrap();
}

#[test]
fn test_repeat_stops_when_callback_returns_false() {
	let worker = Worker::new("countdown");
	worker.start().unwrap();

	let counter = Arc::new(AtomicUsize::new(0));
	{
		let counter = Arc::clone(&counter);
		worker.schedule_repeat(Duration::from_millis(10), move || {
			counter.fetch_add(1, Ordering::SeqCst) + 1 < 3
		});
	}

	assert!(wait_until(|| counter.load(Ordering::SeqCst) == 3));
	thread::sleep(Duration::from_millis(100));
	assert_eq!(counter.load(Ordering::SeqCst), 3);

	worker.stop().unwrap();
}

#[test]
fn test_pending_timers_die_with_the_worker() {
	let worker = Worker::new("mortal");
	worker.start().unwrap();

	let counter = Arc::new(AtomicUsize::new(0));
	{
		let counter = Arc::clone(&counter);
		worker.schedule(Duration::from_millis(80), move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
	}

	worker.stop().unwrap();
	thread::sleep(Duration::from_millis(200));
	assert_eq!(counter.load(Ordering::SeqCst), 0);
}
