// Task units — one schedulable piece of async work with a single completion signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{oneshot, watch};
use tracing::debug;

pub use tokio_util::sync::CancellationToken;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The body of a unit. It receives its own cancellation token and the
/// completion signal it must eventually fire.
pub type TaskAction = Box<dyn FnOnce(CancellationToken, Completion) -> TaskFuture + Send + 'static>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    /// Cancelled before its body started.
    Cancelled,
    Finished,
}

impl TaskState {
    /// `Pending -> Running -> Finished` or `Pending -> Cancelled -> Finished`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Running, TaskState::Finished)
                | (TaskState::Cancelled, TaskState::Finished)
        )
    }

    pub fn is_finished(self) -> bool {
        self == TaskState::Finished
    }
}

/// Single-use completion signal handed to a running unit.
///
/// Dropping it without calling [`Completion::signal`] still counts as
/// signaled, so a panicking body cannot stall its batch.
pub struct Completion {
    tx: Option<oneshot::Sender<()>>,
    task_id: u64,
}

impl Completion {
    pub(crate) fn new(task_id: u64) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                task_id,
            },
            rx,
        )
    }

    pub fn signal(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!("task {} completion dropped without signal", self.task_id);
            let _ = tx.send(());
        }
    }
}

/// Shared state of a unit: its cancellation token and observable lifecycle.
pub(crate) struct TaskStatus {
    pub(crate) id: u64,
    pub(crate) token: CancellationToken,
    state: watch::Sender<TaskState>,
}

impl TaskStatus {
    /// Apply a transition if it is legal. Returns whether the state changed.
    pub(crate) fn transition(&self, next: TaskState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Skip the body: `Pending -> Cancelled -> Finished`.
    pub(crate) fn finish_cancelled(&self) {
        self.token.cancel();
        self.transition(TaskState::Cancelled);
        self.transition(TaskState::Finished);
    }
}

pub struct TaskUnit {
    pub(crate) action: TaskAction,
    pub(crate) status: TaskStatus,
}

impl TaskUnit {
    /// Build a unit from an async body.
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce(CancellationToken, Completion) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_token(CancellationToken::new(), action)
    }

    /// Build a unit whose cancellation is driven by an existing token.
    pub fn with_token<F, Fut>(token: CancellationToken, action: F) -> Self
    where
        F: FnOnce(CancellationToken, Completion) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (state, _) = watch::channel(TaskState::Pending);
        let action: TaskAction =
            Box::new(move |token: CancellationToken, completion: Completion| -> TaskFuture {
                Box::pin(action(token, completion))
            });
        Self {
            action,
            status: TaskStatus {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                token,
                state,
            },
        }
    }

    /// Build a unit from a callback-style body that hands the completion
    /// signal on to whatever finishes the work.
    pub fn from_callback<F>(action: F) -> Self
    where
        F: FnOnce(CancellationToken, Completion) + Send + 'static,
    {
        Self::new(move |token, completion| async move { action(token, completion) })
    }

    pub fn id(&self) -> u64 {
        self.status.id
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.status.id,
            token: self.status.token.clone(),
            state: self.status.state.subscribe(),
        }
    }
}

/// Issuer-side view of a unit.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    token: CancellationToken,
    state: watch::Receiver<TaskState>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Idempotent. A unit that has not started will skip its body.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Receive every state change of the unit.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    /// Wait until the unit reaches `Finished`.
    pub async fn finished(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| s.is_finished()).await;
    }
}
