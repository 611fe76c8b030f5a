use crate::{error::TaskError, lock, rt, timers};
use std::{
	any::Any,
	fmt,
	future::Future,
	panic,
	pin::Pin,
	process,
	sync::{self, atomic},
	task, thread, time,
};

static NEXT_ID: atomic::AtomicU64 = atomic::AtomicU64::new(1);

// Core::state values
const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const COMPLETED: u8 = 3;

type Body = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Process-unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
	fn next() -> Self {
		Self(NEXT_ID.fetch_add(1, atomic::Ordering::Relaxed))
	}
}

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Observable lifecycle of a [`Task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
	/// The body is being polled, either eagerly by the spawner or by the timer that resumed it
	Running,
	/// The body is parked at a suspension point, waiting to be resumed
	Suspended,
	/// The body ran to its end and its state was released
	Completed,
}

/// The continuation of a task, shared by its [`Task`] handle and every waker pointing at it.
///
/// Whoever moves `state` to `RUNNING` is the only thread allowed to poll `body`. A wake that lands while another
/// thread is polling flips the state to `NOTIFIED`, and that thread polls again instead of the waker.
pub(crate) struct Core {
	id: TaskId,
	runtime: rt::Runtime,
	state: atomic::AtomicU8,
	body: sync::Mutex<Option<Body>>,
	polls: atomic::AtomicUsize,
}

impl Core {
	/// Claims the task and polls it, or leaves a notification for the thread already polling it
	fn resume(self: &sync::Arc<Self>) {
		let mut current = self.state.load(atomic::Ordering::Acquire);

		loop {
			let next = match current {
				IDLE => RUNNING,
				RUNNING => NOTIFIED,
				// already notified, or nothing left to resume
				_ => return,
			};

			match self.state.compare_exchange(current, next, atomic::Ordering::AcqRel, atomic::Ordering::Acquire) {
				Ok(IDLE) => break,
				Ok(_) => return,
				Err(actual) => current = actual,
			}
		}

		self.run(false);
	}

	/// Polls the body until it suspends or completes. The caller must have moved `state` to `RUNNING`.
	///
	/// During the `eager` first poll a notification is not serviced here: it's handed to a resume thread, so the
	/// rest of the body never runs inline on the spawning thread.
	fn run(self: &sync::Arc<Self>, eager: bool) {
		loop {
			if self.polls.fetch_add(1, atomic::Ordering::AcqRel) > 0 {
				trace!("task {} resumed", self.id);
			}

			let waker = task::Waker::from(self.clone());
			let mut context = task::Context::from_waker(&waker);

			let completed = {
				let mut body = lock(&self.body);

				match body.as_mut() {
					Some(fut) => {
						let ready = self.runtime.enter(|| fut.as_mut().poll(&mut context)).is_ready();
						if ready {
							// final suspend = never, release the body right away
							*body = None;
						}

						ready
					}
					None => true,
				}
			};

			if completed {
				self.state.store(COMPLETED, atomic::Ordering::Release);
				trace!("task {} completed", self.id);
				return;
			}

			match self.state.compare_exchange(RUNNING, IDLE, atomic::Ordering::AcqRel, atomic::Ordering::Acquire) {
				Ok(_) => {
					trace!("task {} suspended", self.id);
					return;
				}
				// woken while polling
				Err(_) if eager => {
					self.state.store(IDLE, atomic::Ordering::Release);
					timers::defer(waker);
					return;
				}
				Err(_) => self.state.store(RUNNING, atomic::Ordering::Release),
			}
		}
	}

	fn state(&self) -> TaskState {
		match self.state.load(atomic::Ordering::Acquire) {
			IDLE => TaskState::Suspended,
			COMPLETED => TaskState::Completed,
			_ => TaskState::Running,
		}
	}
}

impl task::Wake for Core {
	fn wake(self: sync::Arc<Self>) {
		self.resume();
	}

	fn wake_by_ref(self: &sync::Arc<Self>) {
		self.resume();
	}
}

/// Polls a future, turning a panic into an `Err` carrying the panic payload
struct CatchPanic<F>(Pin<Box<F>>);

impl<F: Future> Future for CatchPanic<F> {
	type Output = Result<F::Output, Box<dyn Any + Send>>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
		let fut = self.0.as_mut();

		match panic::catch_unwind(panic::AssertUnwindSafe(|| fut.poll(cx))) {
			Ok(task::Poll::Ready(out)) => task::Poll::Ready(Ok(out)),
			Ok(task::Poll::Pending) => task::Poll::Pending,
			Err(payload) => task::Poll::Ready(Err(payload)),
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(msg) = payload.downcast_ref::<&str>() {
		msg.to_string()
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg.clone()
	} else {
		"non-string panic payload".to_string()
	}
}

/// Handle to a running asynchronous computation, resolves to the body's output.
///
/// The task starts as soon as it is spawned. Dropping the handle does not cancel it: a pending resumption keeps the
/// continuation alive, the body still runs to its end and its output is discarded.
pub struct Task<T> {
	core: sync::Arc<Core>,
	result_rx: Option<oneshot::Receiver<Result<T, TaskError>>>,
}

impl<T: Send + 'static> Task<T> {
	pub(crate) fn spawn<F>(runtime: rt::Runtime, fut: F) -> Self
	where
		F: Future<Output = T> + Send + 'static,
	{
		let id = TaskId::next();
		let (result_tx, result_rx) = oneshot::channel();

		let body: Body = Box::pin(async move {
			let res = match CatchPanic(Box::pin(fut)).await {
				Ok(out) => Ok(out),
				Err(payload) => {
					let message = panic_message(payload.as_ref());

					match runtime.failure_policy() {
						rt::FailurePolicy::Capture => Err(TaskError::Panicked { id, message }),
						rt::FailurePolicy::Abort => {
							eprintln!("task {} panicked: {}, aborting", id, message);
							process::abort();
						}
					}
				}
			};

			// the handle may be gone, in which case nobody wants the output
			let _ = result_tx.send(res);
		});

		let core = sync::Arc::new(Core {
			id,
			runtime,
			state: atomic::AtomicU8::new(RUNNING),
			body: sync::Mutex::new(Some(body)),
			polls: atomic::AtomicUsize::new(0),
		});

		// initial suspend = never
		trace!("task {} spawned", id);
		core.run(true);

		Self { core, result_rx: Some(result_rx) }
	}
}

impl<T> Task<T> {
	/// Identifier of this task
	pub fn id(&self) -> TaskId {
		self.core.id
	}

	/// Current lifecycle state
	pub fn state(&self) -> TaskState {
		self.core.state()
	}

	/// Whether the body ran to its end
	pub fn is_finished(&self) -> bool {
		self.state() == TaskState::Completed
	}

	/// How many times the body was resumed after a suspension. The eager first poll is not counted.
	pub fn resumes(&self) -> usize {
		self.core.polls.load(atomic::Ordering::Acquire).saturating_sub(1)
	}

	/// Blocks the current thread until the task completes
	pub fn join(mut self) -> Result<T, TaskError> {
		self.wait(None)
	}

	/// Blocks the current thread until the task completes or `timeout` elapses, whichever comes first
	pub fn join_timeout(&mut self, timeout: time::Duration) -> Result<T, TaskError> {
		self.wait(time::Instant::now().checked_add(timeout))
	}

	// polls the receiver instead of using its blocking recv, which refuses a receiver already awaited
	fn wait(&mut self, deadline: Option<time::Instant>) -> Result<T, TaskError> {
		let id = self.id();
		let rx = self.result_rx.as_mut().ok_or(TaskError::Joined { id })?;

		let waker = rt::thread_waker();
		let mut context = task::Context::from_waker(&waker);

		let res = loop {
			if let task::Poll::Ready(res) = Pin::new(&mut *rx).poll(&mut context) {
				break res;
			}

			match deadline {
				None => thread::park(),
				Some(deadline) => {
					let now = time::Instant::now();
					if now >= deadline {
						return Err(TaskError::TimedOut { id });
					}

					thread::park_timeout(deadline - now);
				}
			}
		};

		self.result_rx = None;
		res.unwrap_or(Err(TaskError::Abandoned { id }))
	}
}

impl<T> fmt::Debug for Task<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Task").field("id", &self.core.id).field("state", &self.state()).finish()
	}
}

impl<T> Unpin for Task<T> {}

impl<T> Future for Task<T> {
	type Output = Result<T, TaskError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
		let id = self.id();
		let Some(rx) = self.result_rx.as_mut() else {
			return task::Poll::Ready(Err(TaskError::Joined { id }));
		};

		let res = match Pin::new(rx).poll(cx) {
			task::Poll::Ready(Ok(res)) => res,
			task::Poll::Ready(Err(_)) => Err(TaskError::Abandoned { id }),
			task::Poll::Pending => return task::Poll::Pending,
		};

		self.result_rx = None;
		task::Poll::Ready(res)
	}
}
