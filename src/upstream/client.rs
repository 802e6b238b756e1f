//! HTTP client for the assist service.
//!
//! Each call walks an ordered list of request variants: the full request
//! first, then the same request without history. Every attempt is timed and
//! logged; the last failure is surfaced.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::{Assist, AssistReply, AssistRequest};
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;

/// Maximum characters of an error body kept for logs and errors.
const SNIPPET_LIMIT: usize = 500;

/// Pure rewrite applied to a request before an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestVariant {
    /// The request as given.
    Full,
    /// Same request with the conversation history dropped.
    WithoutHistory,
}

impl RequestVariant {
    /// Attempt order.
    pub const ORDER: [RequestVariant; 2] = [Self::Full, Self::WithoutHistory];

    pub fn apply(&self, request: &AssistRequest) -> AssistRequest {
        match self {
            Self::Full => request.clone(),
            Self::WithoutHistory => AssistRequest {
                history: Vec::new(),
                ..request.clone()
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::WithoutHistory => "without_history",
        }
    }
}

/// reqwest-backed [`Assist`] implementation.
pub struct AssistClient {
    client: reqwest::Client,
    endpoint: String,
    attempt_timeout: Option<Duration>,
    backoff: Duration,
    api_key: Option<SecretString>,
}

impl AssistClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint(),
            attempt_timeout: config.attempt_timeout,
            backoff: config.backoff,
            api_key: config.api_key.clone(),
        }
    }

    async fn attempt(&self, body: &AssistRequest) -> Result<AssistReply, UpstreamError> {
        let send = async {
            let mut request = self.client.post(&self.endpoint).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key.expose_secret());
            }

            let resp = request.send().await.map_err(|e| UpstreamError::Transport {
                reason: e.to_string(),
            })?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(UpstreamError::Status {
                    status: status.as_u16(),
                    snippet: snippet(&text),
                });
            }

            let text = resp.text().await.map_err(|e| UpstreamError::Transport {
                reason: e.to_string(),
            })?;
            serde_json::from_str::<AssistReply>(&text).map_err(|e| {
                UpstreamError::InvalidResponse {
                    reason: format!("{e}: {}", snippet(&text)),
                }
            })
        };

        match self.attempt_timeout {
            Some(after) => tokio::time::timeout(after, send)
                .await
                .map_err(|_| UpstreamError::Timeout { after })?,
            None => send.await,
        }
    }
}

#[async_trait]
impl Assist for AssistClient {
    async fn assist(&self, request: AssistRequest) -> Result<AssistReply, UpstreamError> {
        let mut last_error = None;

        for (idx, variant) in RequestVariant::ORDER.iter().enumerate() {
            if idx > 0 {
                tokio::time::sleep(self.backoff).await;
            }

            let body = variant.apply(&request);
            let started = Instant::now();
            debug!(
                attempt = idx + 1,
                variant = variant.name(),
                action = body.action,
                history = body.history.len(),
                "Calling assist service"
            );

            match self.attempt(&body).await {
                Ok(reply) => {
                    info!(
                        attempt = idx + 1,
                        variant = variant.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        reply_chars = reply.response.chars().count(),
                        docs = reply.docs.len(),
                        "Assist call succeeded"
                    );
                    return Ok(reply);
                }
                Err(e) => {
                    warn!(
                        attempt = idx + 1,
                        variant = variant.name(),
                        status = e.status(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "Assist call failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| UpstreamError::Transport {
            reason: "no request variants configured".to_string(),
        }))
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_LIMIT).collect()
}
