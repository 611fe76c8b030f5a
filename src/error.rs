use crate::tasks::TaskId;
use thiserror::Error;

/// Why a [`Task`](crate::tasks::Task) did not hand back its output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
	/// The body panicked while running under [`FailurePolicy::Capture`](crate::rt::FailurePolicy::Capture)
	#[error("task {id} panicked: {message}")]
	Panicked {
		/// Task that failed
		id: TaskId,
		/// The panic payload, if it was a string
		message: String,
	},

	/// The continuation was dropped without sending a result
	#[error("task {id} was dropped before it completed")]
	Abandoned {
		/// Task that was dropped
		id: TaskId,
	},

	/// [`Task::join_timeout`](crate::tasks::Task::join_timeout) gave up, the task itself keeps running
	#[error("timed out waiting for task {id}")]
	TimedOut {
		/// Task that is still running
		id: TaskId,
	},

	/// The output was already taken by an earlier join or await
	#[error("the output of task {id} was already taken")]
	Joined {
		/// Task whose output is gone
		id: TaskId,
	},
}
