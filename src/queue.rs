use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, oneshot};

use crate::report::ExecutionResult;
use crate::rules::{ResourceEnvelope, Rule};
use crate::scheduler::SubmitError;

pub type Responder = oneshot::Sender<Result<ExecutionResult, SubmitError>>;

/// An admitted submission waiting for a worker
pub struct QueuedJob {
    pub ticket_id: u64,
    pub rule: Arc<Rule>,
    pub source: String,
    pub envelope: ResourceEnvelope,
    pub responder: Responder,
    /// Admission slot, released when the job is dropped
    pub permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Inner {
    jobs: VecDeque<QueuedJob>,
    closed: bool,
}

/// FIFO backlog shared between the scheduler and its workers
pub struct JobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Hands the job back if the queue is already closed
    pub fn push(&self, job: QueuedJob) -> Result<(), QueuedJob> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(job);
            }
            inner.jobs.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the oldest job; `None` once the queue is closed
    pub async fn pop(&self) -> Option<QueuedJob> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // registered before checking, so a `close` in between is not missed
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(job) = inner.jobs.pop_front() {
                    return Some(job);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn cancel(&self, ticket_id: u64) -> Option<QueuedJob> {
        let mut inner = self.inner.lock();
        let idx = inner.jobs.iter().position(|j| j.ticket_id == ticket_id)?;
        inner.jobs.remove(idx)
    }

    /// Refuses further pushes and drains everything still waiting
    pub fn close(&self) -> Vec<QueuedJob> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.jobs.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
