//! Orphan reaper: removes queued work nobody is waiting for.
//!
//! Two entry points: immediate cancellation when a client disconnects, and
//! a periodic sweep for expired or abandoned jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ReaperConfig;
use crate::delivery::{ClientRouter, EventBroadcaster};
use crate::queue::{JobQueue, JobState};

pub struct OrphanReaper {
    queue: Arc<JobQueue>,
    router: Arc<ClientRouter>,
    broadcaster: Arc<EventBroadcaster>,
    config: ReaperConfig,
}

impl OrphanReaper {
    pub fn new(
        queue: Arc<JobQueue>,
        router: Arc<ClientRouter>,
        broadcaster: Arc<EventBroadcaster>,
        config: ReaperConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            router,
            broadcaster,
            config,
        })
    }

    /// Remove every waiting, delayed or active job owned by `client_id`.
    /// Broadcasts stats once afterwards.
    pub async fn cancel_client_jobs(&self, client_id: &str) -> usize {
        let pending = self
            .queue
            .list_by_state(&[JobState::Waiting, JobState::Delayed, JobState::Active])
            .await;

        let mut removed = 0;
        for job in pending.iter().filter(|j| j.client_id() == Some(client_id)) {
            // NotFound means the job finished meanwhile.
            if self.queue.remove(job.id).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(client_id, removed, "Cancelled jobs of disconnected client");
        }
        self.broadcaster.broadcast_stats().await;
        removed
    }

    /// One sweep over waiting and delayed jobs. Returns the number removed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.config.orphan_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let candidates = self
            .queue
            .list_by_state(&[JobState::Waiting, JobState::Delayed])
            .await;

        let mut removed = 0;
        for job in candidates {
            let expired = job.payload.is_expired(now);
            let orphaned = match job.client_id() {
                Some(client_id) => {
                    job.age(now) > ttl && !self.router.is_reachable(client_id).await
                }
                None => false,
            };
            if !(expired || orphaned) {
                continue;
            }
            if self.queue.remove(job.id).await.is_ok() {
                debug!(
                    job_id = %job.id,
                    client_id = ?job.payload.client_id,
                    expired,
                    orphaned,
                    "Reaped job"
                );
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Orphan sweep removed jobs");
            self.broadcaster.broadcast_stats().await;
        }
        removed
    }

    /// Run `sweep_once` every `sweep_interval` until `stop` flips to true.
    pub fn spawn(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = this.config.sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            info!(
                interval_secs = period.as_secs(),
                ttl_secs = this.config.orphan_ttl.as_secs(),
                "Orphan reaper started"
            );
            let mut tick = tokio::time::interval(period);
            // The first tick completes immediately.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        this.sweep_once(Utc::now()).await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Orphan reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::delivery::ServerEvent;
    use crate::queue::{JobPayload, QueueStats};

    struct Fixture {
        queue: Arc<JobQueue>,
        router: Arc<ClientRouter>,
        reaper: Arc<OrphanReaper>,
    }

    fn fixture(orphan_ttl: Duration) -> Fixture {
        let queue = JobQueue::new();
        let router = Arc::new(ClientRouter::new());
        let broadcaster = EventBroadcaster::new(queue.clone(), router.clone());
        let reaper = OrphanReaper::new(
            queue.clone(),
            router.clone(),
            broadcaster,
            ReaperConfig {
                orphan_ttl,
                sweep_interval: Duration::from_millis(50),
            },
        );
        Fixture {
            queue,
            router,
            reaper,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn cancel_removes_all_pending_jobs_of_client() {
        let f = fixture(Duration::from_secs(120));
        let mut watcher = f.router.register("watcher").await;

        f.queue.enqueue(JobPayload::chat("u1", "a").with_client("c1")).await;
        f.queue
            .enqueue_delayed(
                JobPayload::chat("u1", "b").with_client("c1"),
                Duration::from_secs(60),
            )
            .await;
        let keep = f.queue.enqueue(JobPayload::chat("u2", "c").with_client("c2")).await;
        // c1's first job becomes active.
        f.queue.next_ready().await;

        assert_eq!(f.reaper.cancel_client_jobs("c1").await, 2);
        assert_eq!(f.queue.stats().await, QueueStats::new(1, 0, 0));
        assert!(f.queue.get(keep).await.is_some());

        // Exactly one stats broadcast.
        assert_eq!(
            drain(&mut watcher),
            vec![ServerEvent::Stats(QueueStats::new(1, 0, 0))]
        );
    }

    #[tokio::test]
    async fn sweep_removes_only_old_unreachable_jobs() {
        let f = fixture(Duration::from_secs(120));
        let _live = f.router.register("live").await;

        let orphan = f.queue.enqueue(JobPayload::chat("u1", "a").with_client("gone")).await;
        let live = f.queue.enqueue(JobPayload::chat("u1", "b").with_client("live")).await;
        let anonymous = f.queue.enqueue(JobPayload::chat("u1", "c")).await;

        // Too young to reap.
        assert_eq!(f.reaper.sweep_once(Utc::now()).await, 0);

        let later = Utc::now() + chrono::Duration::seconds(121);
        assert_eq!(f.reaper.sweep_once(later).await, 1);
        assert!(f.queue.get(orphan).await.is_none());
        assert!(f.queue.get(live).await.is_some());
        assert!(f.queue.get(anonymous).await.is_some());
    }

    #[tokio::test]
    async fn sweep_removes_expired_jobs() {
        let f = fixture(Duration::from_secs(120));
        let _live = f.router.register("live").await;
        let now = Utc::now();

        let expired = f
            .queue
            .enqueue(
                JobPayload::chat("u1", "a")
                    .with_client("live")
                    .with_expiry(now - chrono::Duration::seconds(1)),
            )
            .await;
        assert_eq!(f.reaper.sweep_once(now).await, 1);
        assert!(f.queue.get(expired).await.is_none());
    }

    #[tokio::test]
    async fn sweep_leaves_active_jobs() {
        let f = fixture(Duration::ZERO);
        let id = f.queue.enqueue(JobPayload::chat("u1", "a").with_client("gone")).await;
        f.queue.next_ready().await;

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(f.reaper.sweep_once(later).await, 0);
        assert!(f.queue.get(id).await.is_some());
    }

    #[tokio::test]
    async fn ticker_sweeps_until_stopped() {
        let f = fixture(Duration::ZERO);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = f.reaper.spawn(stop_rx);

        let id = f.queue.enqueue(JobPayload::chat("u1", "a").with_client("gone")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.queue.get(id).await.is_none());

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
