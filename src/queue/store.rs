//! Job queue: multi-state job list with lifecycle events.
//!
//! All transitions happen under one mutex. Events fan out on a broadcast
//! channel; the optional journal receives snapshots through an ordered
//! writer task so the lock is never held across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use super::events::{QueueEvent, QueueStats};
use super::job::{Job, JobId, JobOutcome, JobPayload, JobState};
use crate::error::{DatabaseError, JobError};

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Terminal jobs are pruned once more than this many are held...
const MAX_FINISHED: usize = 200;
/// ...down to this many.
const KEEP_FINISHED: usize = 100;

/// Durable backing for queue state.
#[async_trait]
pub trait JobJournal: Send + Sync {
    /// Insert or replace a job snapshot.
    async fn save_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Forget a job.
    async fn delete_job(&self, id: JobId) -> Result<(), DatabaseError>;

    /// Load every journaled job.
    async fn load_jobs(&self) -> Result<Vec<Job>, DatabaseError>;
}

enum JournalOp {
    Save(Box<Job>),
    Delete(JobId),
    Flush(oneshot::Sender<()>),
}

struct QueueInner {
    jobs: HashMap<JobId, Job>,
    next_seq: u64,
}

impl QueueInner {
    fn sorted(&self, state: JobState) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| j.state == state).collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    /// Position and queue length for a waiting job.
    fn waiting_event(&self, job_id: JobId) -> QueueEvent {
        let waiting = self.sorted(JobState::Waiting);
        let position = waiting
            .iter()
            .position(|j| j.id == job_id)
            .map_or(0, |idx| idx + 1);
        let client_id = waiting
            .iter()
            .find(|j| j.id == job_id)
            .and_then(|j| j.payload.client_id.clone());
        QueueEvent::Waiting {
            job_id,
            client_id,
            position,
            length: self.stats().length,
        }
    }

    fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|j| j.state == state).count()
    }

    fn stats(&self) -> QueueStats {
        QueueStats::new(
            self.count(JobState::Waiting),
            self.count(JobState::Delayed),
            self.count(JobState::Active),
        )
    }

    fn next_delay_due(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Delayed)
            .filter_map(|j| j.delay_until)
            .min()
    }
}

/// In-process job queue shared by the HTTP layer, worker, broadcaster and reaper.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
    journal: Option<Journal>,
}

struct Journal {
    store: Arc<dyn JobJournal>,
    tx: mpsc::UnboundedSender<JournalOp>,
}

impl JobQueue {
    /// Create a memory-only queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Create a queue that journals every change. Call [`JobQueue::restore`]
    /// once subscribers are attached to reload prior state.
    pub fn with_journal(store: Arc<dyn JobJournal>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_journal_writer(Arc::clone(&store), rx));
        Arc::new(Self::build(Some(Journal { store, tx })))
    }

    fn build(journal: Option<Journal>) -> Self {
        let (events, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                next_seq: 1,
            }),
            notify: Notify::new(),
            events,
            journal,
        }
    }

    /// Reload journaled jobs. Jobs that were active when the previous
    /// process died are failed as stalled. Returns the number of jobs
    /// restored to waiting or delayed.
    pub async fn restore(&self) -> Result<usize, DatabaseError> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let restored = journal.store.load_jobs().await?;

        let mut inner = self.inner.lock().await;
        let mut stalled = Vec::new();

        for mut job in restored {
            inner.next_seq = inner.next_seq.max(job.seq + 1);
            if job.state == JobState::Active {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
                job.failure_reason = Some("stalled".to_string());
                self.journal_save(&job);
                stalled.push((job.id, job.payload.client_id.clone()));
            }
            inner.jobs.insert(job.id, job);
        }

        let waiting = inner.count(JobState::Waiting);
        let delayed = inner.count(JobState::Delayed);
        drop(inner);

        for (job_id, client_id) in stalled {
            warn!(job_id = %job_id, "Job stalled across restart, marking failed");
            self.emit(QueueEvent::Stalled { job_id });
            self.emit(QueueEvent::Failed {
                job_id,
                client_id,
                reason: "stalled".to_string(),
            });
        }

        if waiting + delayed > 0 {
            info!(waiting, delayed, "Recovered queued jobs from journal");
            self.notify.notify_one();
        }
        Ok(waiting + delayed)
    }

    /// Subscribe to lifecycle events as a stream.
    pub fn subscribe(&self) -> BroadcastStream<QueueEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Enqueue a job for immediate processing.
    pub async fn enqueue(&self, payload: JobPayload) -> JobId {
        self.insert(payload, None).await
    }

    /// Enqueue a job that becomes eligible after `delay`.
    pub async fn enqueue_delayed(&self, payload: JobPayload, delay: Duration) -> JobId {
        if delay.is_zero() {
            return self.enqueue(payload).await;
        }
        let delay =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650));
        let due = Utc::now() + delay;
        self.insert(payload, Some(due)).await
    }

    async fn insert(&self, payload: JobPayload, delay_until: Option<DateTime<Utc>>) -> JobId {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let job = Job::new(seq, payload, delay_until);
        let job_id = job.id;

        info!(
            job_id = %job_id,
            user_id = %job.payload.user_id,
            client_id = ?job.payload.client_id,
            action = job.payload.action,
            state = %job.state,
            "Job enqueued"
        );

        self.journal_save(&job);
        let delayed = delay_until.map(|due| QueueEvent::Delayed {
            job_id,
            delay: (due - job.created_at).to_std().unwrap_or_default(),
        });
        inner.jobs.insert(job_id, job);
        let event = match delayed {
            Some(event) => event,
            None => inner.waiting_event(job_id),
        };
        // Emitted under the lock so subscribers see transitions in order.
        self.emit(event);
        drop(inner);

        self.notify.notify_one();
        job_id
    }

    /// Snapshot of one job.
    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        self.inner.lock().await.jobs.get(&job_id).cloned()
    }

    /// Jobs in any of `states`, ordered by enqueue sequence.
    pub async fn list_by_state(&self, states: &[JobState]) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| states.contains(&j.state))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    pub async fn count_by_state(&self, state: JobState) -> usize {
        self.inner.lock().await.count(state)
    }

    pub async fn stats(&self) -> QueueStats {
        self.inner.lock().await.stats()
    }

    /// 1-based position among waiting jobs, or `None` if not waiting.
    pub async fn position(&self, job_id: JobId) -> Option<usize> {
        let inner = self.inner.lock().await;
        inner
            .sorted(JobState::Waiting)
            .iter()
            .position(|j| j.id == job_id)
            .map(|idx| idx + 1)
    }

    /// Remove a job. For waiting, delayed or active jobs this is a
    /// cancellation: the job never transitions or delivers afterwards.
    pub async fn remove(&self, job_id: JobId) -> Result<Job, JobError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .remove(&job_id)
            .ok_or(JobError::NotFound { id: job_id })?;
        self.journal_delete(job_id);
        drop(inner);

        info!(job_id = %job_id, state = %job.state, "Job removed");
        Ok(job)
    }

    /// Wait for the next eligible job and mark it active.
    ///
    /// Cancel-safe: the job is only activated in the same critical section
    /// that returns it.
    pub async fn next_ready(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut inner = self.inner.lock().await;
                self.promote_due(&mut inner, Utc::now());

                let next_id = inner.sorted(JobState::Waiting).first().map(|j| j.id);
                let activated = next_id.and_then(|id| {
                    let job = inner.jobs.get_mut(&id)?;
                    job.transition_to(JobState::Active).ok()?;
                    Some(job.clone())
                });
                if let Some(job) = activated {
                    self.journal_save(&job);
                    self.emit(QueueEvent::Active { job_id: job.id });
                    drop(inner);
                    debug!(job_id = %job.id, seq = job.seq, "Job activated");
                    return job;
                }
                inner.next_delay_due()
            };

            match wake_at {
                Some(at) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Move due delayed jobs to waiting and publish their positions.
    fn promote_due(&self, inner: &mut QueueInner, now: DateTime<Utc>) {
        let mut promoted = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Delayed && job.delay_until.is_none_or(|at| at <= now) {
                if job.transition_to(JobState::Waiting).is_ok() {
                    self.journal_save(job);
                    promoted.push(job.id);
                }
            }
        }
        for job_id in promoted {
            self.emit(inner.waiting_event(job_id));
        }
    }

    /// Mark an active job completed. Returns false if it was cancelled.
    pub async fn complete(&self, job_id: JobId, outcome: JobOutcome) -> bool {
        self.finish(job_id, |job| {
            job.transition_to(JobState::Completed)?;
            job.result = Some(outcome);
            Ok(QueueEvent::Completed { job_id: job.id })
        })
        .await
    }

    /// Mark an active job failed. Returns false if it was cancelled.
    pub async fn fail(&self, job_id: JobId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.finish(job_id, |job| {
            job.transition_to(JobState::Failed)?;
            job.failure_reason = Some(reason.clone());
            Ok(QueueEvent::Failed {
                job_id: job.id,
                client_id: job.payload.client_id.clone(),
                reason,
            })
        })
        .await
    }

    async fn finish<F>(&self, job_id: JobId, apply: F) -> bool
    where
        F: FnOnce(&mut Job) -> Result<QueueEvent, String>,
    {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            debug!(job_id = %job_id, "Finished job no longer queued (cancelled)");
            return false;
        };
        let event = match apply(job) {
            Ok(event) => event,
            Err(reason) => {
                warn!(job_id = %job_id, reason = %reason, "Rejected job transition");
                return false;
            }
        };
        let snapshot = job.clone();
        self.journal_save(&snapshot);
        self.prune_finished(&mut inner);
        let drained = inner.count(JobState::Waiting) == 0;
        drop(inner);

        self.emit(event);
        if drained {
            self.emit(QueueEvent::Drained);
        }
        true
    }

    /// Keep the most recent terminal jobs once too many accumulate.
    fn prune_finished(&self, inner: &mut QueueInner) {
        let mut finished: Vec<(JobId, DateTime<Utc>)> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal())
            .map(|j| (j.id, j.finished_at.unwrap_or(j.created_at)))
            .collect();
        if finished.len() <= MAX_FINISHED {
            return;
        }
        finished.sort_by_key(|(_, at)| *at);
        let excess = finished.len() - KEEP_FINISHED;
        for (id, _) in finished.into_iter().take(excess) {
            inner.jobs.remove(&id);
            self.journal_delete(id);
        }
        debug!(pruned = excess, "Pruned finished jobs");
    }

    /// Wait until every journal write issued so far has been applied.
    pub async fn flush_journal(&self) {
        if let Some(journal) = &self.journal {
            let (done_tx, done_rx) = oneshot::channel();
            if journal.tx.send(JournalOp::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    fn emit(&self, event: QueueEvent) {
        debug!(event = event.name(), "Queue event");
        // ok if nobody is subscribed
        let _ = self.events.send(event);
    }

    fn journal_save(&self, job: &Job) {
        if let Some(journal) = &self.journal {
            let _ = journal.tx.send(JournalOp::Save(Box::new(job.clone())));
        }
    }

    fn journal_delete(&self, job_id: JobId) {
        if let Some(journal) = &self.journal {
            let _ = journal.tx.send(JournalOp::Delete(job_id));
        }
    }
}

/// Apply journal operations in issue order.
async fn run_journal_writer(
    journal: Arc<dyn JobJournal>,
    mut rx: mpsc::UnboundedReceiver<JournalOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            JournalOp::Save(job) => {
                if let Err(e) = journal.save_job(&job).await {
                    warn!(job_id = %job.id, error = %e, "Failed to journal job");
                }
            }
            JournalOp::Delete(job_id) => {
                if let Err(e) = journal.delete_job(job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to delete journaled job");
                }
            }
            JournalOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
