//! Chat worker: executes one job at a time, end to end.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::history::{build_history, derive_title};
use crate::config::WorkerConfig;
use crate::delivery::{ClientRouter, ServerEvent};
use crate::error::{Error, JobError};
use crate::queue::{AbortReason, ChatResult, Job, JobOutcome, JobQueue};
use crate::store::{ChatStore, NewMessage, Role};
use crate::upstream::{Assist, AssistRequest, UserTurn};

/// Shared dependencies for job execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<JobQueue>,
    pub store: Arc<dyn ChatStore>,
    pub assist: Arc<dyn Assist>,
    pub router: Arc<ClientRouter>,
    pub config: WorkerConfig,
}

/// Single-concurrency consumer of the job queue.
pub struct ChatWorker {
    deps: WorkerDeps,
}

impl ChatWorker {
    pub fn new(deps: WorkerDeps) -> Arc<Self> {
        Arc::new(Self { deps })
    }

    /// Pull jobs until `stop` flips to true. A job already taken is always
    /// finished before the task ends.
    pub fn spawn(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!("Chat worker started");
            loop {
                if *stop.borrow() {
                    break;
                }
                let job = tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    job = this.deps.queue.next_ready() => job,
                };
                this.process(job).await;
            }
            info!("Chat worker stopped");
        })
    }

    /// Execute an already-active job and record its terminal state.
    pub async fn process(&self, job: Job) {
        let job_id = job.id;
        info!(
            job_id = %job_id,
            user_id = %job.payload.user_id,
            client_id = ?job.payload.client_id,
            action = job.payload.action,
            "Processing job"
        );

        match self.run_job(&job).await {
            Ok(outcome) => {
                let delivery = match &outcome {
                    JobOutcome::Delivered(result) => Some(result.clone()),
                    JobOutcome::Aborted(aborted) => {
                        info!(job_id = %job_id, reason = ?aborted.reason, "Job aborted");
                        None
                    }
                };
                if !self.deps.queue.complete(job_id, outcome).await {
                    info!(job_id = %job_id, "Job was cancelled while running, result discarded");
                    return;
                }
                info!(job_id = %job_id, "Job completed");
                if let (Some(result), Some(client_id)) = (delivery, job.client_id()) {
                    self.deliver_response(client_id, result).await;
                }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Job failed");
                self.deps.queue.fail(job_id, e.to_string()).await;
            }
        }
    }

    async fn deliver_response(&self, client_id: &str, result: ChatResult) {
        let router = &self.deps.router;
        if !router.is_reachable(client_id).await {
            debug!(client_id, job_id = %result.job_id, "Client gone before response delivery");
            return;
        }
        let job_id = result.job_id;
        let delivered = router
            .deliver_to(client_id, ServerEvent::Response(result))
            .await;
        info!(job_id = %job_id, client_id, delivered, "chat:response routed");
    }

    /// Steps of one job up to (not including) its terminal transition.
    pub async fn run_job(&self, job: &Job) -> Result<JobOutcome, Error> {
        let store = &self.deps.store;
        let payload = &job.payload;
        let user_id = payload.user_id.as_str();
        let action = payload.chat_action()?;

        let conversation = store
            .create_or_get_conversation(user_id, payload.conversation_id.as_deref())
            .await?;

        let user_content = action.user_content();
        let meta = (action.code() != 1).then(|| serde_json::json!({ "action": action.code() }));
        let user_message = store
            .save_message(NewMessage {
                conversation_id: conversation.id.clone(),
                user_id: user_id.to_string(),
                role: Role::User,
                content: user_content.clone(),
                meta,
            })
            .await?;

        if conversation.title.is_none() {
            let title = derive_title(&user_content);
            if let Err(e) = store.set_conversation_title(&conversation.id, &title).await {
                warn!(conversation_id = %conversation.id, error = %e, "Failed to set conversation title");
            }
        }

        let messages = store
            .list_conversation_messages(user_id, &conversation.id)
            .await?;
        let history = build_history(&messages, &user_message.id);
        debug!(
            job_id = %job.id,
            conversation_id = %conversation.id,
            history = history.len(),
            "History loaded"
        );

        if payload.is_expired(Utc::now()) {
            return Ok(JobOutcome::aborted(AbortReason::Expired));
        }
        if let Some(client_id) = job.client_id() {
            if !self.deps.router.is_reachable(client_id).await {
                return Ok(JobOutcome::aborted(AbortReason::ClientGone));
            }
        }

        let derived = action.derive();
        let request = AssistRequest {
            action: action.code(),
            history,
            user: UserTurn::new(derived.content),
            fdoc: derived.fdoc,
            sdoc: derived.sdoc,
            query: derived.query,
        };

        let reply = match self.deps.config.job_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.deps.assist.assist(request))
                .await
                .map_err(|_| JobError::DeadlineExceeded {
                    id: job.id,
                    deadline,
                })??,
            None => self.deps.assist.assist(request).await?,
        };
        info!(
            job_id = %job.id,
            reply_chars = reply.response.chars().count(),
            docs = reply.docs.len(),
            "Upstream reply received"
        );

        let assistant_message = store
            .save_assistant_message(
                &conversation.id,
                user_id,
                &reply.response,
                Some(serde_json::json!({ "docs": reply.docs.clone() })),
            )
            .await?;

        Ok(JobOutcome::Delivered(ChatResult {
            job_id: job.id,
            conversation_id: conversation.id,
            reply: reply.response,
            docs: reply.docs,
            user_message_id: user_message.id,
            assistant_message_id: assistant_message.id,
        }))
    }
}
