use std::{
	future::Future,
	pin::Pin,
	sync::{self, atomic, mpsc},
	task, thread,
	time::{Duration, Instant},
};

use super::*;
use futures::task::noop_waker;

/// Counts how many times it was woken
#[derive(Default)]
struct CountingWaker(atomic::AtomicUsize);

impl task::Wake for CountingWaker {
	fn wake(self: sync::Arc<Self>) {
		self.0.fetch_add(1, atomic::Ordering::SeqCst);
	}
}

fn explode(message: &str) {
	panic!("{}", message)
}

#[test]
fn simple_chain() {
	let fut_1 = async { 42 };
	let fut_2 = async move { fut_1.await + 1 };
	let fut_3 = async move { fut_2.await + 1 };

	let rt = Runtime::new();
	let result = rt.block_on(fut_3);

	assert_eq!(result, 44);
}

#[test]
fn delay_is_never_ready() {
	let waker = noop_waker();
	let mut cx = task::Context::from_waker(&waker);

	for ms in [0, 1, 1000] {
		let mut delay = delay_ms(ms);
		assert!(!delay.is_ready());
		assert!(delay.deadline().is_none());

		assert!(Pin::new(&mut delay).poll(&mut cx).is_pending(), "a {} ms delay resolved on its first poll", ms);
		assert!(!delay.is_ready());
		assert!(delay.deadline().is_some());
	}
}

#[test]
fn delay_wakes_exactly_once() {
	let counter = sync::Arc::new(CountingWaker::default());
	let waker = task::Waker::from(counter.clone());
	let mut cx = task::Context::from_waker(&waker);

	let mut delay = delay_ms(10);
	assert!(Pin::new(&mut delay).poll(&mut cx).is_pending());

	thread::sleep(Duration::from_millis(100));
	assert_eq!(counter.0.load(atomic::Ordering::SeqCst), 1);
	assert!(Pin::new(&mut delay).poll(&mut cx).is_ready());

	thread::sleep(Duration::from_millis(50));
	assert_eq!(counter.0.load(atomic::Ordering::SeqCst), 1);
}

#[test]
fn resumes_no_earlier_than_requested() {
	for mode in [TimerMode::Shared, TimerMode::Detached] {
		for ms in [0, 5, 20, 60] {
			let requested = Duration::from_millis(ms);

			let task = spawn(async move {
				let suspended_at = Instant::now();
				Delay::with_mode(requested, mode).await;
				suspended_at.elapsed()
			});

			let elapsed = task.join().unwrap();
			assert!(elapsed >= requested, "{:?} timer resumed after {:?}, {:?} requested", mode, elapsed, requested);
		}
	}
}

#[test]
fn body_starts_eagerly() {
	let log = sync::Arc::new(sync::Mutex::new(Vec::new()));

	let task_log = log.clone();
	let task = spawn(async move {
		task_log.lock().unwrap().push("started");
		delay_ms(100).await;
		task_log.lock().unwrap().push("resumed");
	});

	log.lock().unwrap().push("returned");

	task.join().unwrap();
	assert_eq!(*log.lock().unwrap(), ["started", "returned", "resumed"]);
}

#[test]
fn zero_delay_never_resumes_inline() {
	let creator = thread::current().id();

	for _ in 0..50 {
		let task = spawn(async {
			let started_on = thread::current().id();
			delay(Duration::ZERO).await;
			(started_on, thread::current().id())
		});

		let (started_on, resumed_on) = task.join().unwrap();
		assert_eq!(started_on, creator);
		assert_ne!(resumed_on, creator);
	}
}

#[test]
fn one_resume_per_suspension() {
	let mut task = spawn(async {
		delay_ms(20).await;
	});

	assert_eq!(task.resumes(), 0);
	task.join_timeout(Duration::from_secs(2)).unwrap();
	assert_eq!(task.resumes(), 1);

	thread::sleep(Duration::from_millis(50));
	assert_eq!(task.resumes(), 1);
}

#[test]
fn sequential_suspension_points() {
	let mut task = spawn(async {
		let mut left = 3;

		while left > 0 {
			delay_ms(5).await;
			left -= 1;
		}

		left
	});

	assert_eq!(task.join_timeout(Duration::from_secs(2)), Ok(0));
	assert_eq!(task.resumes(), 3);
}

#[test]
fn end_to_end_200ms() {
	let wait = Duration::from_millis(1000);
	let (events_tx, events_rx) = mpsc::channel();

	let mut task = spawn(async move {
		events_tx.send(("started", Instant::now())).unwrap();
		delay_ms(200).await;
		events_tx.send(("resumed", Instant::now())).unwrap();
	});

	let (name, started_at) = events_rx.try_recv().expect("started message was not printed synchronously");
	assert_eq!(name, "started");
	assert_eq!(task.state(), TaskState::Suspended);

	task.join_timeout(wait).expect("task did not finish within the driver's wait");

	let (name, resumed_at) = events_rx.try_recv().unwrap();
	assert_eq!(name, "resumed");
	assert!(resumed_at - started_at >= Duration::from_millis(200));
}

#[test]
fn dropped_handle_still_completes() {
	let (done_tx, done_rx) = mpsc::channel();

	let task = spawn(async move {
		delay_ms(30).await;
		done_tx.send(thread::current().id()).unwrap();
	});

	drop(task);

	let resumed_on = done_rx.recv_timeout(Duration::from_secs(2)).expect("continuation was lost with its handle");
	assert_ne!(resumed_on, thread::current().id());
}

#[test]
fn panics_are_captured() {
	let before = spawn(async {
		explode("before suspending");
	});

	match before.join() {
		Err(TaskError::Panicked { message, .. }) => assert_eq!(message, "before suspending"),
		other => panic!("unexpected result: {:?}", other),
	}

	let after = spawn(async {
		delay_ms(1).await;
		explode("after resuming");
	});

	let id = after.id();
	assert_eq!(after.join(), Err(TaskError::Panicked { id, message: "after resuming".into() }));
}

#[test]
fn join_timeout_leaves_task_running() {
	let mut task = spawn(async {
		delay_ms(300).await;
		"done"
	});

	let id = task.id();
	assert_eq!(task.join_timeout(Duration::from_millis(10)), Err(TaskError::TimedOut { id }));
	assert_eq!(task.join_timeout(Duration::from_secs(2)), Ok("done"));
	assert_eq!(task.join_timeout(Duration::from_secs(2)), Err(TaskError::Joined { id }));
}

#[test]
fn await_task_from_block_on() {
	let rt = Runtime::new();
	let task = rt.spawn(async {
		delay_ms(10).await;
		7
	});

	assert_eq!(rt.block_on(task), Ok(7));
}

#[test]
fn independent_tasks() {
	let rt = Runtime::new();
	let start = Instant::now();

	let tasks = (0..5u64).map(|id| {
		rt.spawn(async move {
			delay_ms(50 - id * 10).await;
			id
		})
	});

	let results: Vec<_> = rt.block_on(futures::future::join_all(tasks));
	assert_eq!(results, (0..5).map(Ok::<u64, TaskError>).collect::<Vec<_>>());

	// delays overlap instead of adding up
	assert!(start.elapsed() < Duration::from_millis(150));
}

#[test]
fn timer_mode_follows_runtime() {
	fn resumed_on(rt: Runtime, fut_delay: fn() -> Delay) -> Option<String> {
		let task = rt.spawn(async move {
			fut_delay().await;
			thread::current().name().map(String::from)
		});

		task.join().unwrap()
	}

	let shared = Runtime::new();
	let detached = Runtime::builder().timer_mode(TimerMode::Detached).build();

	assert_eq!(detached.timer_mode(), TimerMode::Detached);
	assert_eq!(detached.failure_policy(), FailurePolicy::Capture);

	assert_eq!(resumed_on(shared, || delay_ms(20)).as_deref(), Some("resumable-resume"));
	assert_eq!(resumed_on(detached, || delay_ms(20)).as_deref(), Some("resumable-delay"));

	// an explicit mode wins over the runtime's
	let explicit = || Delay::with_mode(Duration::from_millis(20), TimerMode::Shared);
	assert_eq!(resumed_on(detached, explicit).as_deref(), Some("resumable-resume"));
}

#[test]
fn task_ids_are_unique() {
	let a = spawn(async {});
	let b = spawn(async {});

	assert_ne!(a.id(), b.id());
	assert!(a.is_finished());
	assert_eq!(a.resumes(), 0);
	assert_eq!(format!("{}", a.id()).chars().next(), Some('#'));
}

#[test]
fn abort_policy_kills_the_process() {
	const CHILD: &str = "RESUMABLE_ABORT_CHILD";

	if std::env::var_os(CHILD).is_some() {
		let rt = Runtime::builder().failure_policy(FailurePolicy::Abort).build();
		let task = rt.spawn(async {
			delay_ms(1).await;
			explode("fatal");
		});

		let _ = task.join();
		return;
	}

	let output = std::process::Command::new(std::env::current_exe().unwrap())
		.args(["--exact", "tests::abort_policy_kills_the_process", "--nocapture"])
		.env(CHILD, "1")
		.output()
		.unwrap();

	assert!(!output.status.success());
	assert!(String::from_utf8_lossy(&output.stderr).contains("panicked: fatal, aborting"));
}

#[test]
fn unrepresentable_delay_stays_suspended() {
	let waker = noop_waker();
	let mut cx = task::Context::from_waker(&waker);

	let mut forever = delay(Duration::MAX);
	assert!(Pin::new(&mut forever).poll(&mut cx).is_pending());
	assert!(forever.deadline().is_none());
	assert!(Pin::new(&mut forever).poll(&mut cx).is_pending());

	let mut task = spawn(async {
		delay(Duration::MAX).await;
	});

	let id = task.id();
	assert_eq!(task.join_timeout(Duration::from_millis(50)), Err(TaskError::TimedOut { id }));
	assert_eq!(task.state(), TaskState::Suspended);
}

#[test]
fn blocking_after_resume_does_not_stall_timers() {
	let (report_tx, report_rx) = mpsc::channel();

	let outer = spawn(async move {
		delay_ms(10).await;

		// joins while running on whatever thread resumed us
		let inner = spawn(async {
			delay_ms(10).await;
			"inner"
		});

		report_tx.send(inner.join()).unwrap();
	});

	let report = report_rx.recv_timeout(Duration::from_secs(2)).expect("timers stalled behind a blocked body");
	assert_eq!(report, Ok("inner"));
	assert_eq!(outer.join(), Ok(()));

	let mut outer = spawn(async {
		delay_ms(10).await;
		Runtime::new().block_on(async {
			delay_ms(10).await;
			3
		})
	});

	assert_eq!(outer.join_timeout(Duration::from_secs(2)), Ok(3));
}

#[test]
fn join_after_await_attempt() {
	let waker = noop_waker();
	let mut cx = task::Context::from_waker(&waker);

	let mut task = spawn(async {
		delay_ms(30).await;
		"late"
	});

	// as a select with a lost race would leave it
	assert!(Pin::new(&mut task).poll(&mut cx).is_pending());

	let id = task.id();
	assert_eq!(task.join_timeout(Duration::from_millis(1)), Err(TaskError::TimedOut { id }));
	assert_eq!(task.join_timeout(Duration::from_secs(2)), Ok("late"));
	assert_eq!(Pin::new(&mut task).poll(&mut cx), task::Poll::Ready(Err(TaskError::Joined { id })));
}

#[test]
fn timer_fallbacks() {
	fn no_shared() -> bool {
		false
	}

	fn no_detached(_: Instant, slot: sync::Arc<timers::Slot>) -> Result<(), sync::Arc<timers::Slot>> {
		Err(slot)
	}

	fn armed(mode: TimerMode, shared: fn() -> bool, detached: fn(Instant, sync::Arc<timers::Slot>) -> Result<(), sync::Arc<timers::Slot>>) -> usize {
		let counter = sync::Arc::new(CountingWaker::default());
		let slot = sync::Arc::new(timers::Slot::new(task::Waker::from(counter.clone())));

		timers::arm_with(mode, Instant::now() + Duration::from_millis(5), slot, shared, detached);

		thread::sleep(Duration::from_millis(100));
		counter.0.load(atomic::Ordering::SeqCst)
	}

	// shared timer unavailable, a detached thread takes over
	assert_eq!(armed(TimerMode::Shared, no_shared, timers::spawn_detached), 1);
	// detached thread unavailable, the shared timer takes over
	assert_eq!(armed(TimerMode::Detached, timers::timer_thread_running, no_detached), 1);

	// neither, the delay can't be resumed and says so
	for mode in [TimerMode::Shared, TimerMode::Detached] {
		let unresumable = std::panic::catch_unwind(|| armed(mode, no_shared, no_detached));
		assert!(unresumable.is_err());
	}
}

#[cfg(feature = "trace")]
#[test]
fn traced_lifecycle() {
	let rt = Runtime::builder().timer_mode(TimerMode::Detached).build();

	let traced = rt.spawn(async {
		delay_ms(5).await;
		delay_ms(0).await;
		"traced"
	});

	assert_eq!(traced.join(), Ok("traced"));
	let mut forever = spawn(async { delay(Duration::MAX).await });
	assert!(forever.join_timeout(Duration::from_millis(5)).is_err());
}
