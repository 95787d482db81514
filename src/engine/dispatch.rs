// Callback dispatch — delivers results on the execution context the caller expects.

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub enum Dispatcher {
    /// Run callbacks on the worker that produced the result.
    Inline,
    /// Hand callbacks to a single consumer that runs them in order.
    Queue(mpsc::UnboundedSender<Callback>),
}

impl Dispatcher {
    pub fn inline() -> Self {
        Dispatcher::Inline
    }

    /// A dedicated tokio task that runs callbacks one at a time.
    pub fn dedicated() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("dedicated dispatcher requires a tokio runtime: {}", e))?;
        let (dispatcher, mut queue) = Self::channel();
        runtime.spawn(async move {
            while queue.run_next().await {}
            debug!("callback dispatcher stopped");
        });
        Ok(dispatcher)
    }

    /// A dispatcher whose callbacks are drained by the host, e.g. on its UI thread.
    pub fn channel() -> (Self, CallbackQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::Queue(tx), CallbackQueue { rx })
    }

    pub fn dispatch(&self, callback: Callback) {
        match self {
            Dispatcher::Inline => run_guarded(callback),
            Dispatcher::Queue(tx) => {
                if tx.send(callback).is_err() {
                    warn!("callback queue closed, dropping result");
                }
            }
        }
    }
}

/// Receiving end of [`Dispatcher::channel`].
pub struct CallbackQueue {
    rx: mpsc::UnboundedReceiver<Callback>,
}

impl CallbackQueue {
    /// Run every callback queued so far without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(callback) = self.rx.try_recv() {
            run_guarded(callback);
            ran += 1;
        }
        ran
    }

    /// Wait for and run the next callback. `false` once every dispatcher is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(callback) => {
                run_guarded(callback);
                true
            }
            None => false,
        }
    }
}

fn run_guarded(callback: Callback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("result callback panicked");
    }
}
