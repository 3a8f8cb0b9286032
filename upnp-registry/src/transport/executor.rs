//! Bounded, FIFO task execution on a tokio runtime.
//!
//! Tasks start in submission order and at most `concurrency` run at once.
//! A single dispatcher task pulls submissions off a queue, waits for a
//! permit, then spawns the task holding that permit.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedTask {
    task: BoxedTask,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    done: oneshot::Sender<()>,
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    done: oneshot::Receiver<()>,
}

impl TaskHandle {
    /// Stop the task at its next suspension point, or before it starts.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the task ran to completion or was dropped after cancellation.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait until the task finished or was cancelled.
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    handle: Handle,
    queue: mpsc::UnboundedSender<QueuedTask>,
}

impl TaskExecutor {
    /// Start an executor on `handle`.
    pub fn new(handle: Handle, concurrency: usize) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        handle.spawn(Self::dispatch(handle.clone(), receiver, permits));
        Self { handle, queue }
    }

    /// Start an executor on the runtime of the calling task.
    pub fn current(concurrency: usize) -> Result<Self, RegistryError> {
        let handle = Handle::try_current().map_err(|e| RegistryError::NoRuntime(e.to_string()))?;
        Ok(Self::new(handle, concurrency))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Queue `task` for execution.
    pub fn submit<F>(&self, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let (done, done_rx) = oneshot::channel();
        let queued = QueuedTask {
            task: Box::pin(task),
            token: token.clone(),
            finished: finished.clone(),
            done,
        };
        if self.queue.send(queued).is_err() {
            tracing::warn!("Task executor stopped, dropping task");
        }
        TaskHandle {
            token,
            finished,
            done: done_rx,
        }
    }

    async fn dispatch(
        handle: Handle,
        mut receiver: mpsc::UnboundedReceiver<QueuedTask>,
        permits: Arc<Semaphore>,
    ) {
        while let Some(queued) = receiver.recv().await {
            if queued.token.is_cancelled() {
                queued.finished.store(true, Ordering::Release);
                let _ = queued.done.send(());
                continue;
            }
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let QueuedTask {
                task,
                token,
                finished,
                done,
            } = queued;
            handle.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = task => {}
                }
                finished.store(true, Ordering::Release);
                let _ = done.send(());
            });
        }
    }
}
