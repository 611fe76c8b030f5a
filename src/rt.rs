use super::*;
use std::{cell, future::Future, pin, sync, task, thread};

thread_local! {
	/// Runtime whose task is being polled on this thread, if any
	static CURRENT: cell::Cell<Option<Runtime>> = const { cell::Cell::new(None) };
}

/// What happens when a task body panics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
	/// The panic is caught and delivered as [`TaskError::Panicked`](crate::error::TaskError::Panicked)
	#[default]
	Capture,
	/// The panic is reported on stderr and the whole process is aborted
	Abort,
}

/// Spawns [`Task`](tasks::Task)s with a given configuration.
///
/// There is no scheduler behind a `Runtime`: a task runs on the thread that spawns it until its first suspension,
/// and on the thread its timer hands the resumption to afterwards. The runtime only carries the settings those polls run under.
#[derive(Debug, Clone, Copy, Default)]
pub struct Runtime {
	failure_policy: FailurePolicy,
	timer_mode: timers::TimerMode,
}

impl Runtime {
	/// Instantiate a Runtime with the default configuration
	pub fn new() -> Self {
		Self::default()
	}

	/// Configure a Runtime
	pub fn builder() -> Builder {
		Builder::new()
	}

	/// Policy applied to panicking task bodies
	pub fn failure_policy(&self) -> FailurePolicy {
		self.failure_policy
	}

	/// Timer used by [`Delay`](timers::Delay)s that don't pick one explicitly
	pub fn timer_mode(&self) -> timers::TimerMode {
		self.timer_mode
	}

	/// Spawns `fut` as a [`Task`](tasks::Task), running it on the current thread up to its first suspension point
	pub fn spawn<T, F>(&self, fut: F) -> tasks::Task<T>
	where
		T: Send + 'static,
		F: Future<Output = T> + Send + 'static,
	{
		tasks::Task::spawn(*self, fut)
	}

	/// Blocks the current thread until `fut` completes, parking it between wake-ups
	pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
		let mut fut = pin::pin!(fut);

		let waker = thread_waker();
		let mut context = task::Context::from_waker(&waker);

		loop {
			if let task::Poll::Ready(out) = self.enter(|| fut.as_mut().poll(&mut context)) {
				return out;
			}

			// wait for external events to wake up thread
			thread::park();
		}
	}

	/// Runs `f` with this runtime installed as the current one, restoring the previous one afterwards
	pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
		struct Restore(Option<Runtime>);

		impl Drop for Restore {
			fn drop(&mut self) {
				CURRENT.set(self.0);
			}
		}

		let _restore = Restore(CURRENT.replace(Some(*self)));
		f()
	}
}

/// Timer mode of the runtime polling on this thread, or the default outside of one
pub(crate) fn current_timer_mode() -> timers::TimerMode {
	CURRENT.get().map(|rt| rt.timer_mode).unwrap_or_default()
}

/// Waker unparking the current thread, for blocking until a future makes progress
pub(crate) fn thread_waker() -> task::Waker {
	task::Waker::from(sync::Arc::new(ThreadWaker(thread::current())))
}

/// Unparks the thread blocked in [`Runtime::block_on`] or [`Task::join`](tasks::Task::join)
struct ThreadWaker(thread::Thread);

impl task::Wake for ThreadWaker {
	fn wake(self: sync::Arc<Self>) {
		self.0.unpark();
	}

	fn wake_by_ref(self: &sync::Arc<Self>) {
		self.0.unpark();
	}
}

/// Builds a [`Runtime`]
#[derive(Debug, Default)]
pub struct Builder {
	runtime: Runtime,
}

impl Builder {
	/// A builder starting from the default configuration
	pub fn new() -> Self {
		Self::default()
	}

	/// Set what happens when a task body panics
	pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
		self.runtime.failure_policy = policy;
		self
	}

	/// Set the timer used to resume delays
	pub fn timer_mode(mut self, mode: timers::TimerMode) -> Self {
		self.runtime.timer_mode = mode;
		self
	}

	/// Finish building
	pub fn build(self) -> Runtime {
		self.runtime
	}
}
