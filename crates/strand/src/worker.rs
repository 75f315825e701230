// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 the strand authors

//! The dedicated-thread work executor.
//!
//! A [`Worker`] owns exactly one OS thread and multiplexes three event
//! sources onto it: the inbound action queue, a dynamic table of external
//! [`Signal`] sources, and a timer registry. Every registered callback —
//! queue drains, timer expiries, external-signal callbacks — runs
//! sequentially and exclusively on that thread, which makes the worker a
//! thread-affinity primitive: state that must live on a single thread for
//! its whole lifetime is confined to a worker and reached from anywhere via
//! [`Worker::post`] and [`Worker::send`].

use std::{
	collections::HashMap,
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	thread::{self, JoinHandle, ThreadId},
	time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Select, Sender, bounded, unbounded};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
	context::{Action, CancellationToken, WorkerContext},
	error::{Result, WorkerError},
	queue::SignalQueue,
	signal::Signal,
	timer::{TimerHandle, TimerRegistry},
};

/// Interval at which a blocked `send` re-checks that the worker is alive.
const SEND_LIVENESS_INTERVAL: Duration = Duration::from_millis(10);

/// Interval at which a bounded `join` re-checks the thread.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Upper bound on dispatches performed while draining after a stop request,
/// so a callback that keeps re-posting itself cannot wedge shutdown.
const MAX_DRAIN_PASSES: usize = 4096;

/// Workers keyed by the thread they own. Maintained by the reactor loop:
/// inserted at loop entry, removed at loop exit.
static CURRENT_WORKERS: Lazy<Mutex<HashMap<ThreadId, Worker>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Callback associated with an external signal source. Re-invoked on every
/// readiness episode, unlike one-shot queue actions.
type SourceCallback = Box<dyn FnMut() + Send + 'static>;

type Hook = Box<dyn FnMut() + Send + 'static>;

type PanicHook = Box<dyn FnMut(&mut PanicNotice) + Send + 'static>;

/// Handle-table mutation requests, funnelled through a channel so the table
/// is only ever touched on the worker thread.
enum Control {
	SetAction {
		signal: Signal,
		callback: Option<SourceCallback>,
	},
}

/// Notification passed to the panic subscriber when a dispatched callback
/// panics.
///
/// Leaving the notice unhandled terminates the worker loop and remembers the
/// panic; acknowledging it with [`PanicNotice::mark_handled`] lets the loop
/// keep running.
pub struct PanicNotice {
	message: String,
	handled: bool,
}

impl PanicNotice {
	fn new(message: String) -> Self {
		Self {
			message,
			handled: false,
		}
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	/// Acknowledge the panic; the worker keeps running.
	pub fn mark_handled(&mut self) {
		self.handled = true;
	}

	pub fn is_handled(&self) -> bool {
		self.handled
	}
}

/// Token returned by [`Worker::set_action`]; removes the association when
/// disposed.
///
/// Disposal is explicit and idempotent. Dropping the guard does not remove
/// the association — the callback stays registered for the worker's lifetime
/// unless disposed or replaced.
pub struct SourceGuard {
	worker: Worker,
	signal: Signal,
	disposed: AtomicBool,
}

impl SourceGuard {
	/// Remove the association. Routed through the worker thread like every
	/// other handle-table mutation; calling it twice is a no-op.
	pub fn dispose(&self) {
		if self.disposed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
			self.worker.remove_action(&self.signal);
		}
	}

	pub fn signal(&self) -> &Signal {
		&self.signal
	}
}

struct Shared {
	/// Diagnostic name; also used to name the thread.
	name: RwLock<String>,
	/// Inbound action queue, drained one action per wake.
	queue: SignalQueue,
	/// Handle-table mutations; applied on the worker thread before each wait.
	control_tx: Sender<Control>,
	control_rx: Receiver<Control>,
	control_signal: Signal,
	/// Raised by `request_stop` so a parked wait returns promptly.
	stop_signal: Signal,
	cancel: CancellationToken,
	/// Skip the graceful drain; set by `halt`.
	immediate_stop: AtomicBool,
	running: AtomicBool,
	thread: Mutex<Option<JoinHandle<()>>>,
	thread_id: Mutex<Option<ThreadId>>,
	/// The panic that terminated the last run. Cleared on start.
	last_panic: Mutex<Option<String>>,
	/// Lazily created registry bound to this worker; torn down at loop exit.
	timers: Mutex<Option<Arc<TimerRegistry>>>,
	on_start: Mutex<Vec<Hook>>,
	on_stop: Mutex<Vec<Hook>>,
	on_panic: Mutex<Option<PanicHook>>,
}

impl Shared {
	fn shutdown_timers(&self) {
		let registry = self.timers.lock().take();
		if let Some(registry) = registry {
			registry.shutdown();
		}
	}
}

/// Configures and builds a [`Worker`].
pub struct WorkerBuilder {
	name: String,
	on_start: Vec<Hook>,
	on_stop: Vec<Hook>,
	on_panic: Option<PanicHook>,
}

impl WorkerBuilder {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			on_start: Vec::new(),
			on_stop: Vec::new(),
			on_panic: None,
		}
	}

	/// Run `f` on the worker thread at loop entry, every run.
	pub fn on_start<F>(mut self, f: F) -> Self
	where
		F: FnMut() + Send + 'static,
	{
		self.on_start.push(Box::new(f));
		self
	}

	/// Run `f` on the worker thread at loop exit, every run.
	pub fn on_stop<F>(mut self, f: F) -> Self
	where
		F: FnMut() + Send + 'static,
	{
		self.on_stop.push(Box::new(f));
		self
	}

	/// Install the panic subscriber consulted when a callback panics.
	pub fn on_panic<F>(mut self, f: F) -> Self
	where
		F: FnMut(&mut PanicNotice) + Send + 'static,
	{
		self.on_panic = Some(Box::new(f));
		self
	}

	pub fn build(self) -> Worker {
		let (control_tx, control_rx) = unbounded();

		Worker {
			shared: Arc::new(Shared {
				name: RwLock::new(self.name),
				queue: SignalQueue::new(),
				control_tx,
				control_rx,
				control_signal: Signal::new(),
				stop_signal: Signal::new(),
				cancel: CancellationToken::new(),
				immediate_stop: AtomicBool::new(false),
				running: AtomicBool::new(false),
				thread: Mutex::new(None),
				thread_id: Mutex::new(None),
				last_panic: Mutex::new(None),
				timers: Mutex::new(None),
				on_start: Mutex::new(self.on_start),
				on_stop: Mutex::new(self.on_stop),
				on_panic: Mutex::new(self.on_panic),
			}),
		}
	}
}

/// A dedicated-thread work executor.
///
/// Cheap-clone handle; all clones address the same worker. The lifecycle is
/// explicit: [`Worker::start`] spawns the thread, [`Worker::stop`] drains
/// queued work and joins it, [`Worker::halt`] skips the drain. A stopped
/// worker can be started again.
#[derive(Clone)]
pub struct Worker {
	shared: Arc<Shared>,
}

impl Worker {
	pub fn new(name: impl Into<String>) -> Self {
		WorkerBuilder::new(name).build()
	}

	/// The worker owning the calling thread, if any.
	///
	/// Resolves inside any callback dispatched by a worker; returns `None`
	/// on foreign threads. Each worker registers itself at loop entry and
	/// deregisters at loop exit, so concurrent workers resolve
	/// independently.
	pub fn current() -> Option<Worker> {
		CURRENT_WORKERS.lock().get(&thread::current().id()).cloned()
	}

	pub fn name(&self) -> String {
		self.shared.name.read().clone()
	}

	/// Rename the worker. Affects diagnostics and the thread name of the
	/// next run; the current thread keeps its name.
	pub fn set_name(&self, name: impl Into<String>) {
		*self.shared.name.write() = name.into();
	}

	pub fn is_running(&self) -> bool {
		self.shared.running.load(Ordering::Acquire)
	}

	/// The panic that terminated the last run, if any. Cleared by `start`.
	pub fn last_panic(&self) -> Option<String> {
		self.shared.last_panic.lock().clone()
	}

	/// Read-only cancellation flag for callbacks that want to check "should
	/// I stop early" cooperatively.
	pub fn cancellation(&self) -> CancellationToken {
		self.shared.cancel.clone()
	}

	/// The dispatch-context bridge for this worker.
	pub fn context(&self) -> WorkerContext {
		WorkerContext::new(self.clone())
	}

	/// Spawn the dedicated thread and enter the reactor loop.
	///
	/// Fails with [`WorkerError::AlreadyRunning`] if a live thread is
	/// already owned. A finished previous run is reaped first, so a stopped
	/// worker restarts cleanly; cancellation state and the remembered panic
	/// are reset.
	pub fn start(&self) -> Result<()> {
		let mut slot = self.shared.thread.lock();

		if let Some(handle) = slot.as_ref() {
			if !handle.is_finished() {
				return Err(WorkerError::AlreadyRunning {
					name: self.name(),
				});
			}
			if let Some(handle) = slot.take() {
				let _ = handle.join();
			}
		}

		self.shared.cancel.reset();
		self.shared.immediate_stop.store(false, Ordering::SeqCst);
		self.shared.stop_signal.reset();
		*self.shared.last_panic.lock() = None;
		self.shared.running.store(true, Ordering::Release);

		let shared = Arc::clone(&self.shared);
		let handle = thread::Builder::new()
			.name(self.name())
			.spawn(move || run_loop(shared))
			.expect("failed to spawn worker thread");

		*slot = Some(handle);
		Ok(())
	}

	/// Fire-and-forget dispatch.
	///
	/// Callable from any thread, including the worker's own; never blocks
	/// and never fails. Actions posted after a stop request may never run:
	/// the queue keeps accepting them but a stopped thread will not drain
	/// them.
	pub fn post<F>(&self, f: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.post_boxed(Box::new(f));
	}

	pub(crate) fn post_boxed(&self, action: Action) {
		self.shared.queue.enqueue(action);
	}

	/// Blocking dispatch: returns once `f` has run on the worker thread.
	pub fn send<F>(&self, f: F) -> Result<()>
	where
		F: FnOnce() + Send + 'static,
	{
		self.send_with(f)
	}

	/// Blocking dispatch returning the closure's value.
	///
	/// Called from the worker's own thread this executes inline, so
	/// re-entrant sends from inside a callback cannot deadlock. From any
	/// other thread the call blocks on a completion rendezvous,
	/// re-checking liveness at a bounded interval so a worker thread that
	/// dies mid-call surfaces [`WorkerError::Stopped`] instead of hanging
	/// the caller forever.
	pub fn send_with<F, R>(&self, f: F) -> Result<R>
	where
		F: FnOnce() -> R + Send + 'static,
		R: Send + 'static,
	{
		if self.on_own_thread() {
			return Ok(f());
		}

		if !self.thread_alive() {
			return Err(WorkerError::NotRunning {
				name: self.name(),
			});
		}

		let (done_tx, done_rx) = bounded(1);
		self.post(move || {
			let _ = done_tx.send(f());
		});

		loop {
			match done_rx.recv_timeout(SEND_LIVENESS_INTERVAL) {
				Ok(value) => return Ok(value),
				Err(RecvTimeoutError::Timeout) => {
					if !self.thread_alive() {
						// The value may have been produced right before the
						// thread exited.
						if let Ok(value) = done_rx.try_recv() {
							return Ok(value);
						}
						return Err(WorkerError::Stopped {
							name: self.name(),
						});
					}
				}
				Err(RecvTimeoutError::Disconnected) => {
					// Wrapper dropped without completing: the queue was
					// cleared at shutdown or the closure panicked.
					return Err(WorkerError::Stopped {
						name: self.name(),
					});
				}
			}
		}
	}

	/// Schedule `action` to run on this worker after `delay`.
	pub fn schedule<F>(&self, delay: Duration, action: F) -> TimerHandle
	where
		F: FnOnce() + Send + 'static,
	{
		self.timers().schedule(delay, action)
	}

	/// Schedule `callback` to run on this worker every `interval` until it
	/// returns `false` or the handle is cancelled.
	pub fn schedule_repeat<F>(&self, interval: Duration, callback: F) -> TimerHandle
	where
		F: Fn() -> bool + Send + Sync + 'static,
	{
		self.timers().schedule_repeat(interval, callback)
	}

	fn timers(&self) -> Arc<TimerRegistry> {
		let mut timers = self.shared.timers.lock();
		match timers.as_ref() {
			Some(registry) => Arc::clone(registry),
			None => {
				let registry = Arc::new(TimerRegistry::bound(Arc::new(self.context())));
				*timers = Some(Arc::clone(&registry));
				registry
			}
		}
	}

	/// Associate `callback` with an external signal source.
	///
	/// Whenever `signal` becomes ready while the loop runs, `callback` is
	/// invoked on the worker thread, once per readiness episode. The
	/// association replaces any previous callback for the same signal, is
	/// applied on the worker thread before its next wait, and is removed by
	/// disposing the returned guard.
	pub fn set_action<F>(&self, signal: &Signal, callback: F) -> SourceGuard
	where
		F: FnMut() + Send + 'static,
	{
		self.push_control(Control::SetAction {
			signal: signal.clone(),
			callback: Some(Box::new(callback)),
		});

		SourceGuard {
			worker: self.clone(),
			signal: signal.clone(),
			disposed: AtomicBool::new(false),
		}
	}

	/// Remove any callback associated with `signal`.
	pub fn remove_action(&self, signal: &Signal) {
		self.push_control(Control::SetAction {
			signal: signal.clone(),
			callback: None,
		});
	}

	fn push_control(&self, control: Control) {
		let _ = self.shared.control_tx.send(control);
		self.shared.control_signal.raise();
	}

	/// Request cooperative shutdown; never blocks.
	///
	/// The loop finishes the callback it is in, drains remaining ready work
	/// and exits. Long-running callbacks are never interrupted.
	pub fn request_stop(&self) {
		self.shared.cancel.cancel();
		self.shared.stop_signal.raise();
	}

	/// Request shutdown and wait for the thread to exit.
	pub fn stop(&self) -> Result<()> {
		self.request_stop();
		self.join(None)?;
		Ok(())
	}

	/// Stop without draining queued work.
	///
	/// Work already queued is abandoned; the callback currently running (if
	/// any) still finishes.
	pub fn halt(&self) -> Result<()> {
		self.shared.immediate_stop.store(true, Ordering::SeqCst);
		self.stop()
	}

	/// Wait until the worker thread exits or `timeout` elapses.
	///
	/// Returns `Ok(true)` once the thread has exited, `Ok(false)` if the
	/// timeout elapsed first, and [`WorkerError::SelfJoin`] when called
	/// from the worker's own thread. An abnormal exit is observed
	/// separately through [`Worker::last_panic`].
	pub fn join(&self, timeout: Option<Duration>) -> Result<bool> {
		if self.on_own_thread() {
			return Err(WorkerError::SelfJoin {
				name: self.name(),
			});
		}

		let Some(timeout) = timeout else {
			let handle = self.shared.thread.lock().take();
			if let Some(handle) = handle {
				let _ = handle.join();
			}
			return Ok(true);
		};

		let deadline = Instant::now() + timeout;
		loop {
			{
				let mut slot = self.shared.thread.lock();
				match slot.as_ref() {
					None => return Ok(true),
					Some(handle) if handle.is_finished() => {
						if let Some(handle) = slot.take() {
							let _ = handle.join();
						}
						return Ok(true);
					}
					Some(_) => {}
				}
			}

			if Instant::now() >= deadline {
				return Ok(false);
			}
			thread::sleep(JOIN_POLL_INTERVAL);
		}
	}

	/// Subscribe to loop entry; runs on the worker thread, every run.
	pub fn on_start<F>(&self, f: F)
	where
		F: FnMut() + Send + 'static,
	{
		self.shared.on_start.lock().push(Box::new(f));
	}

	/// Subscribe to loop exit; runs on the worker thread, every run.
	pub fn on_stop<F>(&self, f: F)
	where
		F: FnMut() + Send + 'static,
	{
		self.shared.on_stop.lock().push(Box::new(f));
	}

	/// Install the panic subscriber, replacing any previous one.
	pub fn on_panic<F>(&self, f: F)
	where
		F: FnMut(&mut PanicNotice) + Send + 'static,
	{
		*self.shared.on_panic.lock() = Some(Box::new(f));
	}

	fn on_own_thread(&self) -> bool {
		*self.shared.thread_id.lock() == Some(thread::current().id())
	}

	/// Liveness as a blocked caller sees it: the running flag is
	/// authoritative, but a thread that died without clearing it still
	/// counts as dead.
	fn thread_alive(&self) -> bool {
		if !self.is_running() {
			return false;
		}
		self.shared.thread.lock().as_ref().map_or(false, |handle| !handle.is_finished())
	}
}

/// Whether a dispatched callback left the loop able to continue.
enum Flow {
	Continue,
	Fatal,
}

/// Callback registered for an external signal source.
struct SourceEntry {
	signal: Signal,
	callback: SourceCallback,
}

// Positions of the built-in sources in the flattened wait list; table
// entries follow.
const STOP_INDEX: usize = 0;
const CONTROL_INDEX: usize = 1;
const QUEUE_INDEX: usize = 2;
const TABLE_BASE: usize = 3;

/// The reactor loop, run on the dedicated thread.
fn run_loop(shared: Arc<Shared>) {
	let name = shared.name.read().clone();
	let thread_id = thread::current().id();
	debug!(worker = %name, "worker thread starting");

	*shared.thread_id.lock() = Some(thread_id);
	CURRENT_WORKERS.lock().insert(
		thread_id,
		Worker {
			shared: Arc::clone(&shared),
		},
	);

	run_hooks(&name, "start", &shared.on_start);

	// The handle table and its flattened wait list live on this thread
	// only; every mutation request arrives through the control channel.
	let mut table: Vec<SourceEntry> = Vec::new();
	let mut cached: Option<Vec<Signal>> = None;
	let mut fatal = false;

	while !fatal && !shared.cancel.is_cancelled() {
		if apply_control(&shared, &mut table) {
			cached = None;
		}

		let index = {
			let sources = cached.get_or_insert_with(|| flatten_sources(&shared, &table));
			let mut select = Select::new();
			for signal in sources.iter() {
				select.recv(signal.receiver());
			}
			select.ready()
		};

		fatal = matches!(dispatch_ready(&shared, &mut table, index), Flow::Fatal);
	}

	if !fatal && !shared.immediate_stop.load(Ordering::SeqCst) {
		drain(&shared, &mut table, &mut cached, &name);
	}

	run_hooks(&name, "stop", &shared.on_stop);

	table.clear();
	shared.queue.clear();
	shared.shutdown_timers();

	CURRENT_WORKERS.lock().remove(&thread_id);
	*shared.thread_id.lock() = None;
	shared.running.store(false, Ordering::Release);
	debug!(worker = %name, "worker thread stopped");
}

/// The shutdown phase: keep invoking ready sources with a zero timeout until
/// none remain, the immediate-stop flag is set, or the pass cap is hit.
fn drain(shared: &Shared, table: &mut Vec<SourceEntry>, cached: &mut Option<Vec<Signal>>, name: &str) {
	let mut passes = 0;

	while passes < MAX_DRAIN_PASSES {
		if apply_control(shared, table) {
			*cached = None;
		}
		if shared.immediate_stop.load(Ordering::SeqCst) {
			return;
		}

		let index = {
			let sources = cached.get_or_insert_with(|| flatten_sources(shared, table));
			let mut select = Select::new();
			for signal in sources.iter() {
				select.recv(signal.receiver());
			}
			match select.try_ready() {
				Ok(index) => index,
				Err(_) => return,
			}
		};

		if matches!(dispatch_ready(shared, table, index), Flow::Fatal) {
			return;
		}
		passes += 1;
	}

	warn!(worker = %name, "drain pass cap reached, abandoning remaining work");
}

/// Apply pending handle-table mutations. Returns whether the table changed,
/// invalidating the flattened wait list.
fn apply_control(shared: &Shared, table: &mut Vec<SourceEntry>) -> bool {
	let mut changed = false;

	while let Ok(control) = shared.control_rx.try_recv() {
		match control {
			Control::SetAction {
				signal,
				callback,
			} => {
				table.retain(|entry| entry.signal != signal);
				if let Some(callback) = callback {
					table.push(SourceEntry {
						signal,
						callback,
					});
				}
				changed = true;
			}
		}
	}

	changed
}

fn flatten_sources(shared: &Shared, table: &[SourceEntry]) -> Vec<Signal> {
	let mut sources = Vec::with_capacity(TABLE_BASE + table.len());
	sources.push(shared.stop_signal.clone());
	sources.push(shared.control_signal.clone());
	sources.push(shared.queue.ready_signal().clone());
	sources.extend(table.iter().map(|entry| entry.signal.clone()));
	sources
}

/// Consume one readiness episode and invoke the associated callback.
fn dispatch_ready(shared: &Shared, table: &mut [SourceEntry], index: usize) -> Flow {
	match index {
		STOP_INDEX => {
			shared.stop_signal.reset();
			Flow::Continue
		}
		CONTROL_INDEX => {
			// Mutations are applied at the top of the next iteration.
			shared.control_signal.reset();
			Flow::Continue
		}
		QUEUE_INDEX => match shared.queue.try_dequeue() {
			Some(action) => absorb_panic(shared, catch_unwind(AssertUnwindSafe(action))),
			None => Flow::Continue,
		},
		index => {
			let entry = &mut table[index - TABLE_BASE];
			entry.signal.reset();
			let callback = &mut entry.callback;
			absorb_panic(shared, catch_unwind(AssertUnwindSafe(|| callback())))
		}
	}
}

/// Route a callback panic through the subscriber; unhandled panics are
/// remembered and terminate the loop.
fn absorb_panic(shared: &Shared, result: thread::Result<()>) -> Flow {
	let payload = match result {
		Ok(()) => return Flow::Continue,
		Err(payload) => payload,
	};

	let mut notice = PanicNotice::new(panic_message(payload.as_ref()));
	if let Some(hook) = shared.on_panic.lock().as_mut() {
		hook(&mut notice);
	}

	if notice.is_handled() {
		debug!("callback panic handled: {}", notice.message());
		return Flow::Continue;
	}

	warn!("callback panicked, stopping worker: {}", notice.message());
	*shared.last_panic.lock() = Some(notice.message().to_string());
	Flow::Fatal
}

fn run_hooks(name: &str, stage: &str, hooks: &Mutex<Vec<Hook>>) {
	for hook in hooks.lock().iter_mut() {
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook())) {
			warn!(worker = %name, stage, "lifecycle hook panicked: {}", panic_message(payload.as_ref()));
		}
	}
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&'static str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic payload".to_string()
	}
}
