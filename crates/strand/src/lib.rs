// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

//! Dedicated-thread work executor.
//!
//! A [`Worker`] owns exactly one OS thread and multiplexes three independent
//! event sources onto it:
//!
//! - an inbound action queue ([`SignalQueue`]), fed by [`Worker::post`] and
//!   [`Worker::send`] from any thread,
//! - a dynamic table of external [`Signal`] sources registered with
//!   [`Worker::set_action`],
//! - timers ([`Worker::schedule`], [`Worker::schedule_repeat`]) whose
//!   expiries are posted back into the worker, never run on the timer
//!   thread.
//!
//! All callbacks run sequentially and exclusively on the worker's thread.
//! That makes a worker the confinement primitive for anything with thread
//! affinity — a UI toolkit handle, a database session — reachable from
//! arbitrary threads through the [`Dispatcher`] bridge ([`WorkerContext`]).
//!
//! ```no_run
//! use strand::Worker;
//!
//! let worker = Worker::new("example");
//! worker.start()?;
//!
//! worker.post(|| println!("fire and forget"));
//! let answer = worker.send_with(|| 6 * 7)?;
//! assert_eq!(answer, 42);
//!
//! worker.stop()?;
//! # Ok::<(), strand::WorkerError>(())
//! ```

mod context;
mod error;
mod queue;
mod signal;
mod timer;
mod worker;

pub use context::{Action, CancellationToken, Dispatcher, WorkerContext};
pub use error::{Result, WorkerError};
pub use queue::SignalQueue;
pub use signal::Signal;
pub use timer::{TimerHandle, TimerRegistry};
pub use worker::{PanicNotice, SourceGuard, Worker, WorkerBuilder};
