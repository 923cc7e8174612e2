//! Units of work and their outcomes.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

/// Future produced by a task body.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Opaque callable executed by a worker with the task's arguments.
pub type TaskBody = Box<dyn FnOnce(Vec<Value>) -> TaskFuture + Send>;

/// Box a closure returning a future into a [`TaskBody`].
pub fn task_body<F, Fut>(body: F) -> TaskBody
where
    F: FnOnce(Vec<Value>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Box::new(move |args| body(args).boxed())
}

/// A unit of work owned by the queue until a worker dequeues it.
pub struct Task {
    pub(crate) body: TaskBody,
    pub(crate) args: Vec<Value>,
    pub(crate) result_tx: oneshot::Sender<TaskResult>,
}

impl Task {
    /// Wrap a body and its arguments, returning the task and the receiving
    /// end of its one-shot result channel.
    pub(crate) fn new(body: TaskBody, args: Vec<Value>) -> (Self, oneshot::Receiver<TaskResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        (
            Self {
                body,
                args,
                result_tx,
            },
            result_rx,
        )
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Immutable outcome of a task: either a value or the error the body raised.
///
/// [`TaskResult::get`] hands the original error back, so callers can
/// `downcast_ref` to the body's own error type.
#[derive(Debug)]
pub struct TaskResult<T = Value> {
    outcome: Result<T, anyhow::Error>,
}

impl<T> TaskResult<T> {
    pub const fn success(value: T) -> Self {
        Self { outcome: Ok(value) }
    }

    pub const fn failure(error: anyhow::Error) -> Self {
        Self {
            outcome: Err(error),
        }
    }

    pub const fn failed(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.outcome.as_ref().err()
    }

    /// Return the value, or rethrow the wrapped error.
    pub fn get(self) -> anyhow::Result<T> {
        self.outcome
    }
}

impl<T> From<anyhow::Result<T>> for TaskResult<T> {
    fn from(outcome: anyhow::Result<T>) -> Self {
        Self { outcome }
    }
}

/// Drive `future` inside a recovery boundary: a panic becomes a failed
/// result instead of unwinding into the caller.
pub async fn capture<T, F>(future: F) -> TaskResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => TaskResult::from(outcome),
        Err(payload) => TaskResult::failure(anyhow::anyhow!(
            "task panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
