//! Event broadcaster: turns queue lifecycle events into client frames.
//!
//! Runs as its own task so nothing in the queue's critical path waits on
//! client delivery.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use super::events::{ChatFailure, ServerEvent, WaitingNotice};
use super::router::ClientRouter;
use crate::queue::{JobQueue, QueueEvent};

pub struct EventBroadcaster {
    queue: Arc<JobQueue>,
    router: Arc<ClientRouter>,
}

impl EventBroadcaster {
    pub fn new(queue: Arc<JobQueue>, router: Arc<ClientRouter>) -> Arc<Self> {
        Arc::new(Self { queue, router })
    }

    /// Broadcast current queue counts to every client.
    pub async fn broadcast_stats(&self) -> usize {
        let stats = self.queue.stats().await;
        self.router.broadcast(ServerEvent::Stats(stats)).await
    }

    /// React to one lifecycle event.
    pub async fn handle(&self, event: QueueEvent) {
        match event {
            QueueEvent::Waiting {
                job_id,
                client_id: Some(client_id),
                position,
                length,
            } => {
                let notice = WaitingNotice {
                    job_id,
                    position,
                    length,
                };
                let delivered = self
                    .router
                    .deliver_to(&client_id, ServerEvent::Waiting(notice))
                    .await;
                debug!(job_id = %job_id, client_id = %client_id, position, delivered, "chat:waiting routed");
            }
            QueueEvent::Failed {
                job_id,
                client_id: Some(client_id),
                reason,
            } => {
                let delivered = self
                    .router
                    .deliver_to(
                        &client_id,
                        ServerEvent::Error(ChatFailure {
                            job_id,
                            error: reason,
                        }),
                    )
                    .await;
                debug!(job_id = %job_id, client_id = %client_id, delivered, "chat:error routed");
            }
            _ => {}
        }
        self.broadcast_stats().await;
    }

    /// Subscribe now and consume events on a background task until `stop`
    /// flips to true.
    pub fn spawn(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.queue.subscribe();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            info!("Event broadcaster started");
            loop {
                tokio::select! {
                    next = events.next() => match next {
                        Some(Ok(event)) => this.handle(event).await,
                        Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                            warn!(missed, "Broadcaster lagged behind queue events");
                            this.broadcast_stats().await;
                        }
                        None => break,
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Event broadcaster stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::queue::{JobPayload, QueueStats};

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn waiting_event_sends_position_then_stats() {
        let queue = JobQueue::new();
        let router = Arc::new(ClientRouter::new());
        let broadcaster = EventBroadcaster::new(queue.clone(), router.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _task = broadcaster.spawn(stop_rx);

        let mut owner = router.register("c1").await;
        let mut other = router.register("c2").await;

        let job_id = queue
            .enqueue(JobPayload::chat("u1", "hi").with_client("c1"))
            .await;

        assert_eq!(
            next_frame(&mut owner).await,
            ServerEvent::Waiting(WaitingNotice {
                job_id,
                position: 1,
                length: 1
            })
        );
        assert_eq!(
            next_frame(&mut owner).await,
            ServerEvent::Stats(QueueStats::new(1, 0, 0))
        );
        // Bystanders only see stats.
        assert_eq!(
            next_frame(&mut other).await,
            ServerEvent::Stats(QueueStats::new(1, 0, 0))
        );
    }

    #[tokio::test]
    async fn failed_event_is_addressed_to_owner() {
        let queue = JobQueue::new();
        let router = Arc::new(ClientRouter::new());
        let broadcaster = EventBroadcaster::new(queue.clone(), router.clone());
        let mut owner = router.register("c1").await;

        let job_id = queue
            .enqueue(JobPayload::chat("u1", "hi").with_client("c1"))
            .await;
        let job = queue.next_ready().await;
        assert!(queue.fail(job.id, "upstream down").await);

        broadcaster
            .handle(QueueEvent::Failed {
                job_id,
                client_id: Some("c1".into()),
                reason: "upstream down".into(),
            })
            .await;

        assert_eq!(
            next_frame(&mut owner).await,
            ServerEvent::Error(ChatFailure {
                job_id,
                error: "upstream down".into()
            })
        );
        assert!(matches!(next_frame(&mut owner).await, ServerEvent::Stats(_)));
    }

    #[tokio::test]
    async fn waiting_notice_survives_immediate_pickup() {
        let queue = JobQueue::new();
        let router = Arc::new(ClientRouter::new());
        let broadcaster = EventBroadcaster::new(queue.clone(), router.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _task = broadcaster.spawn(stop_rx);
        let mut owner = router.register("c1").await;

        // The job is active before the broadcaster task gets to run.
        let job_id = queue
            .enqueue(JobPayload::chat("u1", "hi").with_client("c1"))
            .await;
        assert_eq!(queue.next_ready().await.id, job_id);

        assert_eq!(
            next_frame(&mut owner).await,
            ServerEvent::Waiting(WaitingNotice {
                job_id,
                position: 1,
                length: 1
            })
        );
    }

    #[tokio::test]
    async fn promoted_delayed_job_reports_position() {
        let queue = JobQueue::new();
        let mut events = queue.subscribe();
        let first = queue.enqueue(JobPayload::chat("u1", "a")).await;
        let delayed = queue
            .enqueue_delayed(
                JobPayload::chat("u1", "b").with_client("c1"),
                Duration::from_millis(30),
            )
            .await;
        assert_eq!(queue.next_ready().await.id, first);

        let job = timeout(Duration::from_secs(2), queue.next_ready())
            .await
            .expect("delayed job never became ready");
        assert_eq!(job.id, delayed);

        let mut promoted = None;
        while let Ok(Some(Ok(event))) = timeout(Duration::from_millis(50), events.next()).await {
            if let QueueEvent::Waiting {
                job_id,
                position,
                length,
                ..
            } = event
            {
                if job_id == delayed {
                    promoted = Some((position, length));
                }
            }
        }
        // One active job ahead of it, none waiting.
        assert_eq!(promoted, Some((1, 2)));
    }

    #[tokio::test]
    async fn stops_on_signal() {
        let queue = JobQueue::new();
        let router = Arc::new(ClientRouter::new());
        let broadcaster = EventBroadcaster::new(queue, router);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = broadcaster.spawn(stop_rx);

        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("broadcaster did not stop")
            .unwrap();
    }
}
