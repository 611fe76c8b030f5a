use crate::{lock, rt};
use std::{
	cmp, collections,
	future::Future,
	pin::Pin,
	sync::{self, atomic},
	task, thread, time,
};

/// Timers not yet due, ordered so the earliest deadline sits on top
static TIMERS: sync::Mutex<collections::BinaryHeap<TimerTracker>> = sync::Mutex::new(collections::BinaryHeap::new());

/// Signalled whenever a timer is queued, so the timer thread can recompute its wait
static TIMERS_CHANGED: sync::Condvar = sync::Condvar::new();

/// Tie-breaker keeping equal deadlines in queueing order
static NEXT_SEQ: atomic::AtomicU64 = atomic::AtomicU64::new(0);

/// Whether the shared timer thread could be started, decided on first use
static TIMER_THREAD: sync::OnceLock<bool> = sync::OnceLock::new();

/// Selects the mechanism that resumes a suspended [`Delay`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
	/// A single background thread tracks every pending delay. Each due delay is resumed on a short-lived
	/// `resumable-resume` thread, so a body that blocks after resuming never holds up other timers.
	#[default]
	Shared,
	/// Each suspension spawns its own detached thread that sleeps, then resumes the task
	Detached,
}

/// Hand-off point between a suspended [`Delay`] and the timer that will resume it
#[derive(Debug)]
pub(crate) struct Slot {
	fired: atomic::AtomicBool,
	waker: sync::Mutex<Option<task::Waker>>,
}

impl Slot {
	pub(crate) fn new(waker: task::Waker) -> Self {
		Self { fired: atomic::AtomicBool::new(false), waker: sync::Mutex::new(Some(waker)) }
	}

	/// Marks the slot as due and resumes the stored waker. Only the first call has any effect.
	fn fire(&self) {
		if self.fired.swap(true, atomic::Ordering::AcqRel) {
			return;
		}

		// the guard is released before waking, the woken task may poll its Delay on this thread
		let waker = lock(&self.waker).take();
		if let Some(waker) = waker {
			waker.wake();
		}
	}
}

/// What the timer thread does once an entry is due
#[derive(Clone)]
enum Wakeup {
	Slot(sync::Arc<Slot>),
	Waker(task::Waker),
}

impl Wakeup {
	fn fire(self) {
		match self {
			Wakeup::Slot(slot) => slot.fire(),
			Wakeup::Waker(waker) => waker.wake(),
		}
	}

	/// Fires on a fresh thread, so the resumed body runs neither on the timer thread nor on the caller's
	fn dispatch(self) {
		let fallback = self.clone();

		if let Err(err) = thread::Builder::new().name("resumable-resume".into()).spawn(move || self.fire()) {
			trace!("unable to spawn resume thread, resuming inline: {}", err);
			fallback.fire();
		}
	}
}

/// Keeps track of when a timer is due, along with what to resume
struct TimerTracker {
	due: time::Instant,
	seq: u64,
	wakeup: Wakeup,
}

impl PartialEq for TimerTracker {
	fn eq(&self, other: &Self) -> bool {
		self.due == other.due && self.seq == other.seq
	}
}

impl Eq for TimerTracker {}

impl PartialOrd for TimerTracker {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TimerTracker {
	// reversed, BinaryHeap is a max-heap
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
	}
}

/// Starts the shared timer thread on first use, returns `false` if it could not be spawned
pub(crate) fn timer_thread_running() -> bool {
	*TIMER_THREAD.get_or_init(|| match thread::Builder::new().name("resumable-timer".into()).spawn(run_timer_thread) {
		Ok(_) => {
			trace!("shared timer thread started");
			true
		}
		Err(err) => {
			trace!("unable to start shared timer thread: {}", err);
			false
		}
	})
}

fn run_timer_thread() {
	let mut timers = lock(&TIMERS);

	loop {
		let now = time::Instant::now();

		// pop everything that is due, then fire without holding the lock
		let mut due = Vec::new();
		while timers.peek().is_some_and(|t| t.due <= now) {
			if let Some(TimerTracker { wakeup, .. }) = timers.pop() {
				due.push(wakeup);
			}
		}

		if !due.is_empty() {
			drop(timers);
			trace!("firing {} timer(s)", due.len());

			for wakeup in due {
				wakeup.dispatch();
			}

			timers = lock(&TIMERS);
			continue;
		}

		timers = match timers.peek().map(|t| t.due) {
			Some(next) => match TIMERS_CHANGED.wait_timeout(timers, next.saturating_duration_since(now)) {
				Ok((guard, _)) => guard,
				Err(poisoned) => poisoned.into_inner().0,
			},
			None => TIMERS_CHANGED.wait(timers).unwrap_or_else(sync::PoisonError::into_inner),
		};
	}
}

fn schedule(due: time::Instant, wakeup: Wakeup) {
	let seq = NEXT_SEQ.fetch_add(1, atomic::Ordering::Relaxed);
	lock(&TIMERS).push(TimerTracker { due, seq, wakeup });
	TIMERS_CHANGED.notify_one();
}

/// Spawns a detached thread that resumes `slot` once `due` has passed. Hands the slot back if no thread could be spawned.
pub(crate) fn spawn_detached(due: time::Instant, slot: sync::Arc<Slot>) -> Result<(), sync::Arc<Slot>> {
	let fallback = slot.clone();

	let spawned = thread::Builder::new().name("resumable-delay".into()).spawn(move || {
		// sleep may wake early on some platforms, keep going until the deadline really passed
		loop {
			let now = time::Instant::now();
			if now >= due {
				break;
			}

			thread::sleep(due - now);
		}

		slot.fire();
	});

	match spawned {
		Ok(_) => Ok(()),
		Err(err) => {
			trace!("unable to spawn delay thread: {}", err);
			Err(fallback)
		}
	}
}

/// Registers `slot` with the timer selected by `mode`, falling back to the other mechanism when a thread can't be spawned
fn arm(mode: TimerMode, due: time::Instant, slot: sync::Arc<Slot>) {
	arm_with(mode, due, slot, timer_thread_running, spawn_detached);
}

/// [`arm`] with the thread starters passed in
pub(crate) fn arm_with(
	mode: TimerMode,
	due: time::Instant,
	slot: sync::Arc<Slot>,
	shared: impl Fn() -> bool,
	detached: impl Fn(time::Instant, sync::Arc<Slot>) -> Result<(), sync::Arc<Slot>>,
) {
	const UNRESUMABLE: &str = "no timer thread could be started to resume a delay";

	match mode {
		TimerMode::Shared if shared() => schedule(due, Wakeup::Slot(slot)),
		TimerMode::Shared => {
			if detached(due, slot).is_err() {
				panic!("{}", UNRESUMABLE);
			}
		}
		TimerMode::Detached => match detached(due, slot) {
			Ok(()) => {}
			Err(slot) if shared() => schedule(due, Wakeup::Slot(slot)),
			Err(_) => panic!("{}", UNRESUMABLE),
		},
	}
}

/// Wakes `waker` off the calling thread as soon as possible, inline only if no thread can be spawned
pub(crate) fn defer(waker: task::Waker) {
	Wakeup::Waker(waker).dispatch();
}

/// Creates a new [`Delay`] that suspends the awaiting task for `duration`
pub fn delay(duration: time::Duration) -> Delay {
	Delay::new(duration)
}

/// An awaitable that always suspends its caller, then has a background timer resume it once `duration` has elapsed.
///
/// The timer starts on the first poll, not on construction. A zero duration still suspends, so the code after
/// `.await` never runs inline with the code before it.
#[derive(Debug)]
pub struct Delay {
	duration: time::Duration,
	mode: Option<TimerMode>,
	deadline: Option<time::Instant>,
	slot: Option<sync::Arc<Slot>>,
}

impl Delay {
	/// A delay resumed by the timer mode of the runtime polling it
	pub fn new(duration: time::Duration) -> Self {
		Self { duration, mode: None, deadline: None, slot: None }
	}

	/// A delay resumed by `mode`, whatever the runtime is configured with
	pub fn with_mode(duration: time::Duration, mode: TimerMode) -> Self {
		Self { mode: Some(mode), ..Self::new(duration) }
	}

	/// Readiness check. Always `false`: awaiting a [`Delay`] suspends unconditionally.
	pub fn is_ready(&self) -> bool {
		false
	}

	/// The requested duration
	pub fn duration(&self) -> time::Duration {
		self.duration
	}

	/// Instant after which the caller is resumed. [`None`] until the delay is first polled, and for a duration so long
	/// that the deadline can't be represented: such a delay never resumes.
	pub fn deadline(&self) -> Option<time::Instant> {
		self.deadline
	}
}

impl Unpin for Delay {}

impl Future for Delay {
	type Output = ();

	fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
		let this = &mut *self;

		// suspended, only the timer may complete us
		if let Some(slot) = this.slot.as_ref() {
			let mut waker = lock(&slot.waker);

			if slot.fired.load(atomic::Ordering::Acquire) {
				return task::Poll::Ready(());
			}

			if !waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
				*waker = Some(cx.waker().clone());
			}

			return task::Poll::Pending;
		}

		let slot = sync::Arc::new(Slot::new(cx.waker().clone()));
		this.slot = Some(slot.clone());

		// past the end of representable time, nothing will ever be due
		let Some(due) = time::Instant::now().checked_add(this.duration) else {
			trace!("suspending forever, {:?} overflows the clock", this.duration);
			return task::Poll::Pending;
		};

		let mode = this.mode.unwrap_or_else(rt::current_timer_mode);
		this.deadline = Some(due);

		trace!("suspending for {:?} ({:?} timer)", this.duration, mode);
		arm(mode, due, slot);

		task::Poll::Pending
	}
}
