// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Off-task execution of blocking device calls.
//!
//! A [`Dispatcher`] runs each [`Task`] on tokio's blocking pool, bounded by
//! a semaphore, and reports back on a single channel owned by the engine:
//! first exactly one [`Dispatched::Outcome`], then one
//! [`Dispatched::Finished`]. In-flight tasks cannot be cancelled; a consumer
//! that loses interest simply ignores late results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::device::response::{DeviceError, DeviceErrorKind, DeviceResult};
use crate::device::DeviceKind;

/// Identity of one bound device instance.
///
/// The generation changes on every bind, so results from a device that has
/// since been replaced can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(u64);

/// Classified result of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Success(T),
    TransportFailure(String),
    Unsupported(String),
    Unexpected(String),
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskOutcome<U> {
        match self {
            TaskOutcome::Success(v) => TaskOutcome::Success(f(v)),
            TaskOutcome::TransportFailure(e) => TaskOutcome::TransportFailure(e),
            TaskOutcome::Unsupported(e) => TaskOutcome::Unsupported(e),
            TaskOutcome::Unexpected(e) => TaskOutcome::Unexpected(e),
        }
    }

    /// Turn the outcome back into a device result.
    pub fn into_result(self) -> DeviceResult<T> {
        match self {
            TaskOutcome::Success(v) => Ok(v),
            TaskOutcome::TransportFailure(e) => Err(DeviceError::transport(e)),
            TaskOutcome::Unsupported(e) => Err(DeviceError {
                kind: DeviceErrorKind::Unsupported,
                message: e,
            }),
            TaskOutcome::Unexpected(e) => Err(DeviceError::unexpected(e)),
        }
    }
}

impl<T> From<DeviceResult<T>> for TaskOutcome<T> {
    fn from(result: DeviceResult<T>) -> Self {
        match result {
            Ok(v) => TaskOutcome::Success(v),
            Err(e) => match e.kind {
                DeviceErrorKind::Transport => TaskOutcome::TransportFailure(e.message),
                DeviceErrorKind::Unsupported => TaskOutcome::Unsupported(e.message),
                DeviceErrorKind::Unexpected => TaskOutcome::Unexpected(e.message),
            },
        }
    }
}

type Operation<T> = Box<dyn FnOnce() -> DeviceResult<T> + Send + 'static>;

/// One blocking device call, executed once.
pub struct Task<T> {
    pub device: DeviceId,
    pub label: &'static str,
    op: Operation<T>,
}

impl<T> Task<T> {
    pub fn new(
        device: DeviceId,
        label: &'static str,
        op: impl FnOnce() -> DeviceResult<T> + Send + 'static,
    ) -> Self {
        Self {
            device,
            label,
            op: Box::new(op),
        }
    }
}

/// Messages delivered to the dispatcher's consumer.
#[derive(Debug)]
pub enum Dispatched<M> {
    Outcome {
        task: TaskId,
        device: DeviceId,
        message: M,
    },
    Finished {
        task: TaskId,
        device: DeviceId,
    },
}

/// Handle to a submitted task. Dropping it does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait until both messages of this task have been sent.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

pub struct Dispatcher<M> {
    tx: mpsc::UnboundedSender<Dispatched<M>>,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl<M: Send + 'static> Dispatcher<M> {
    /// Create a dispatcher running at most `pool_size` device calls at once.
    pub fn new(pool_size: usize) -> (Self, mpsc::UnboundedReceiver<Dispatched<M>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            next_id: AtomicU64::new(0),
        };
        (dispatcher, rx)
    }

    /// Queue a task. `classify` turns its outcome into the consumer's
    /// message type and runs on the worker, not on the consumer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<T, C>(&self, task: Task<T>, classify: C) -> TaskHandle
    where
        T: Send + 'static,
        C: FnOnce(TaskOutcome<T>) -> M + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let Task { device, label, op } = task;
        let tx = self.tx.clone();
        let permits = Arc::clone(&self.permits);

        let join = tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(permit) => {
                    let joined = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        op()
                    })
                    .await;
                    match joined {
                        Ok(result) => TaskOutcome::from(result),
                        Err(e) if e.is_panic() => {
                            TaskOutcome::Unexpected(format!("{} panicked", label))
                        }
                        Err(e) => TaskOutcome::Unexpected(format!("{} aborted: {}", label, e)),
                    }
                }
                Err(_) => TaskOutcome::Unexpected("worker pool is closed".to_string()),
            };
            if !outcome.is_success() {
                debug!("{} on {} {:?}", label, device.kind, outcome_class(&outcome));
            }
            let _ = tx.send(Dispatched::Outcome {
                task: id,
                device,
                message: classify(outcome),
            });
            let _ = tx.send(Dispatched::Finished { task: id, device });
        });

        TaskHandle { id, join }
    }
}

fn outcome_class<T>(outcome: &TaskOutcome<T>) -> &'static str {
    match outcome {
        TaskOutcome::Success(_) => "succeeded",
        TaskOutcome::TransportFailure(_) => "failed (transport)",
        TaskOutcome::Unsupported(_) => "failed (unsupported)",
        TaskOutcome::Unexpected(_) => "failed (unexpected)",
    }
}
