use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::executor::Executor;
use crate::queue::{JobQueue, QueuedJob};
use crate::report::ExecutionResult;
use crate::rules::{LimitError, LimitOverrides, RuleRegistry};

/// Why a submission never produced a result
#[derive(Error, Debug, PartialEq)]
pub enum SubmitError {
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
    #[error("source is {size} bytes, the limit is {limit}")]
    SourceTooLarge { size: u64, limit: u64 },
    #[error("invalid limits: {0}")]
    InvalidLimits(#[from] LimitError),
    #[error("too many pending submissions")]
    QueueFull,
    #[error("the service is shutting down")]
    ShuttingDown,
    #[error("the submission was canceled")]
    Canceled,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Submission {
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub limits: LimitOverrides,
}

/// Receipt of an admitted submission
///
/// Dropping a ticket whose job is still queued withdraws the job, so an
/// abandoned submission never occupies a worker or an admission slot.
pub struct Ticket {
    id: u64,
    rx: oneshot::Receiver<Result<ExecutionResult, SubmitError>>,
    queue: Arc<JobQueue>,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(mut self) -> Result<ExecutionResult, SubmitError> {
        // a dropped responder only happens when the scheduler goes away
        (&mut self.rx).await.unwrap_or(Err(SubmitError::ShuttingDown))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.queue.cancel(self.id).is_some() {
            log::debug!("Ticket {} abandoned while queued, withdrawn", self.id);
        }
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Bounded worker pool with a FIFO backlog and admission control
///
/// At most `workers` jobs run at once and at most `backlog` more wait; any
/// submission beyond that is refused immediately instead of queuing.
pub struct Scheduler {
    registry: Arc<RuleRegistry>,
    queue: Arc<JobQueue>,
    admission: Arc<Semaphore>,
    source_limit: u64,
    next_ticket: AtomicU64,
    token: CancellationToken,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl Scheduler {
    /// Spawns the workers on the current tokio runtime
    pub fn start(
        config: &SchedulerConfig,
        source_limit: u64,
        registry: Arc<RuleRegistry>,
        executor: Arc<Executor>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new());
        let token = CancellationToken::new();

        let mut workers = JoinSet::new();
        for id in 1..=config.workers {
            workers.spawn(worker(id, queue.clone(), executor.clone(), token.clone()));
        }
        log::info!(
            "Scheduler started with {} workers and a backlog of {}",
            config.workers,
            config.backlog
        );

        Self {
            registry,
            queue,
            admission: Arc::new(Semaphore::new(config.workers + config.backlog)),
            source_limit,
            next_ticket: AtomicU64::new(1),
            token,
            workers: Mutex::new(Some(workers)),
        }
    }

    /// Validates and admits a submission without waiting for its result
    pub fn enqueue(&self, submission: Submission) -> Result<Ticket, SubmitError> {
        if self.token.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let Submission {
            language,
            source,
            limits,
        } = submission;
        let rule = self
            .registry
            .resolve(&language)
            .map_err(|_| SubmitError::UnknownLanguage(language))?;
        let size = source.len() as u64;
        if size > self.source_limit {
            return Err(SubmitError::SourceTooLarge {
                size,
                limit: self.source_limit,
            });
        }
        let envelope = rule.envelope(&limits)?;

        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => SubmitError::ShuttingDown,
                TryAcquireError::NoPermits => SubmitError::QueueFull,
            })
            .inspect_err(|e| log::debug!("Submission for {} refused: {e}", rule.name))?;

        let ticket_id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (responder, rx) = oneshot::channel();
        let job = QueuedJob {
            ticket_id,
            rule,
            source,
            envelope,
            responder,
            permit,
        };
        if self.queue.push(job).is_err() {
            return Err(SubmitError::ShuttingDown);
        }

        log::debug!("Ticket {ticket_id} queued");
        Ok(Ticket {
            id: ticket_id,
            rx,
            queue: self.queue.clone(),
        })
    }

    /// Admits a submission and waits for its result
    pub async fn submit(&self, submission: Submission) -> Result<ExecutionResult, SubmitError> {
        self.enqueue(submission)?.wait().await
    }

    /// Withdraws a ticket that no worker picked up yet
    pub fn cancel(&self, ticket_id: u64) -> bool {
        match self.queue.cancel(ticket_id) {
            Some(job) => {
                let _ = job.responder.send(Err(SubmitError::Canceled));
                log::debug!("Ticket {ticket_id} canceled");
                true
            }
            None => false,
        }
    }

    /// Refuses new work and fails everything queued; running jobs finish
    pub fn shutdown(&self) {
        self.admission.close();
        let drained = self.queue.close();
        let count = drained.len();
        for job in drained {
            let _ = job.responder.send(Err(SubmitError::ShuttingDown));
        }
        self.token.cancel();
        log::info!("Scheduler shutting down, {count} queued submissions failed");
    }

    /// Waits until every worker has stopped; call after `shutdown`
    pub async fn join(&self) {
        let Some(mut workers) = self.workers.lock().take() else {
            return;
        };
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    log::error!("Worker panicked: {e:?}");
                } else {
                    log::error!("Worker finished with error: {e:?}");
                }
            }
        }
        log::info!("All workers stopped");
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }
}

async fn worker(
    id: usize,
    queue: Arc<JobQueue>,
    executor: Arc<Executor>,
    token: CancellationToken,
) {
    log::info!("Worker {id} initialized");

    loop {
        let job = tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }
            job = queue.pop() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let QueuedJob {
            ticket_id,
            rule,
            source,
            envelope,
            responder,
            permit,
        } = job;
        log::debug!("Worker {id} got ticket {ticket_id}");

        let executor = executor.clone();
        let result = tokio::task::spawn_blocking(move || {
            executor.execute(&rule, source.as_bytes(), envelope)
        })
        .await
        .unwrap_or_else(|e| {
            log::error!("Ticket {ticket_id} failed on worker {id}: {e:?}");
            ExecutionResult::internal_error("job execution aborted", None)
        });

        if responder.send(Ok(result)).is_err() {
            log::warn!("Submitter of ticket {ticket_id} is gone, result dropped");
        }
        drop(permit);
    }

    log::info!("Worker {id} has shut down gracefully");
}
