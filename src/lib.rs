#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

use std::{future::Future, sync, time};

/// Prints a lifecycle message on stderr when the `trace` feature is enabled
macro_rules! trace {
	($($arg:tt)*) => {
		if cfg!(feature = "trace") {
			eprintln!("[resumable:{}] {}", ::std::thread::current().name().unwrap_or("unnamed"), format_args!($($arg)*));
		}
	};
}

#[cfg(test)]
mod tests;

/// [`TaskError`](error::TaskError) returned when a task can't deliver its output
pub mod error;
/// [`Runtime`](rt::Runtime) configuration, [`FailurePolicy`](rt::FailurePolicy) and `block_on`
pub mod rt;
/// [`Tasks`](tasks::Task) and the continuation machinery resuming them
pub mod tasks;
/// [`Delay`](timers::Delay) awaitable and the timers resuming it
pub mod timers;

pub use error::TaskError;
pub use rt::{Builder, FailurePolicy, Runtime};
pub use tasks::{Task, TaskId, TaskState};
pub use timers::{Delay, TimerMode, delay};

/// Spawns `fut` on a default [`Runtime`], see [`Runtime::spawn`]
pub fn spawn<T, F>(fut: F) -> Task<T>
where
	T: Send + 'static,
	F: Future<Output = T> + Send + 'static,
{
	Runtime::new().spawn(fut)
}

/// Shorthand for `delay(Duration::from_millis(ms))`
pub fn delay_ms(ms: u64) -> Delay {
	delay(time::Duration::from_millis(ms))
}

/// Locks `mutex`, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &sync::Mutex<T>) -> sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(sync::PoisonError::into_inner)
}
