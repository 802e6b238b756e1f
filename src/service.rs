//! Service wiring: construction, startup order and shutdown of the
//! pipeline.
//!
//! Startup order matters: the broadcaster subscribes before the journal is
//! restored (so stalled jobs are reported), and the worker starts last.

use std::sync::Arc;

use axum::Router;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::config::{QueueBacking, RelayConfig};
use crate::delivery::{ClientRouter, EventBroadcaster};
use crate::error::Error;
use crate::queue::{JobJournal, JobQueue};
use crate::reaper::OrphanReaper;
use crate::server::{self, AppState};
use crate::store::{ChatStore, LibSqlStore};
use crate::upstream::{Assist, AssistClient};
use crate::worker::{ChatWorker, WorkerDeps};

/// Collaborators the pipeline is built around.
pub struct ServiceDeps {
    pub store: Arc<dyn ChatStore>,
    /// `None` keeps the queue in memory only.
    pub journal: Option<Arc<dyn JobJournal>>,
    pub assist: Arc<dyn Assist>,
    pub auth: Arc<dyn Authenticator>,
}

impl ServiceDeps {
    /// Open the libSQL store(s), the HTTP assist client and the static token
    /// table described by `config`.
    pub async fn from_config(config: &RelayConfig) -> Result<Self, Error> {
        let chat_store = Arc::new(LibSqlStore::new_local(&config.db_path).await?);

        let journal: Option<Arc<dyn JobJournal>> = match &config.queue {
            QueueBacking::Memory => None,
            QueueBacking::LibSql(path) if *path == config.db_path => {
                Some(chat_store.clone() as Arc<dyn JobJournal>)
            }
            QueueBacking::LibSql(path) => {
                Some(Arc::new(LibSqlStore::new_local(path).await?) as Arc<dyn JobJournal>)
            }
        };

        if config.api_tokens.is_empty() {
            warn!("RELAY_API_TOKENS is empty, every /api request will be rejected");
        }

        Ok(Self {
            store: chat_store,
            journal,
            assist: Arc::new(AssistClient::new(&config.upstream)),
            auth: Arc::new(StaticTokenAuthenticator::new(config.api_tokens.clone())),
        })
    }
}

/// A running relay: queue, broadcaster, worker and reaper.
pub struct RelayService {
    state: AppState,
    cors_origin: String,
    stop: watch::Sender<bool>,
    worker: JoinHandle<()>,
    reaper: JoinHandle<()>,
    broadcaster: JoinHandle<()>,
}

impl RelayService {
    pub async fn start(config: &RelayConfig, deps: ServiceDeps) -> Result<Self, Error> {
        let queue = match deps.journal {
            Some(journal) => JobQueue::with_journal(journal),
            None => JobQueue::new(),
        };
        let router = Arc::new(ClientRouter::new());
        let (stop, stop_rx) = watch::channel(false);

        let broadcaster = EventBroadcaster::new(queue.clone(), router.clone());
        let broadcaster_task = broadcaster.spawn(stop_rx.clone());

        let restored = queue.restore().await?;
        if restored > 0 {
            info!(restored, "Restored queued jobs");
        }

        let reaper = OrphanReaper::new(
            queue.clone(),
            router.clone(),
            broadcaster.clone(),
            config.reaper.clone(),
        );
        let reaper_task = reaper.spawn(stop_rx.clone());

        let worker = ChatWorker::new(WorkerDeps {
            queue: queue.clone(),
            store: deps.store.clone(),
            assist: deps.assist,
            router: router.clone(),
            config: config.worker.clone(),
        });
        let worker_task = worker.spawn(stop_rx);

        Ok(Self {
            state: AppState {
                queue,
                store: deps.store,
                router,
                broadcaster,
                reaper,
                auth: deps.auth,
            },
            cors_origin: config.cors_origin.clone(),
            stop,
            worker: worker_task,
            reaper: reaper_task,
            broadcaster: broadcaster_task,
        })
    }

    /// HTTP + WebSocket routes bound to this service.
    pub fn app(&self) -> Router {
        server::routes(self.state.clone(), &self.cors_origin)
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.state.queue
    }

    pub fn router(&self) -> &Arc<ClientRouter> {
        &self.state.router
    }

    /// Stop the reaper and broadcaster, let the worker finish its in-flight
    /// job, then flush the journal.
    pub async fn shutdown(self) {
        info!("Shutting down relay");
        let _ = self.stop.send(true);

        let names = ["worker", "reaper", "broadcaster"];
        let results = join_all([self.worker, self.reaper, self.broadcaster]).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!(task = *name, error = %e, "Background task ended abnormally");
            }
        }
        self.state.queue.flush_journal().await;
        info!("Relay stopped");
    }
}
