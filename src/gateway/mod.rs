//! C3: opaque channel to an external agent chat session.
//!
//! The CLI-subprocess client the teacher used to drive Claude Code
//! (`claude_code::cli_client`) does not fit this contract — the gateway here
//! is reached over HTTP, not spawned as a child process — so this module is
//! new, but it reuses the teacher's resilience idiom: HTTP calls go through
//! `reqwest` wrapped in the circuit breaker lifted from
//! `claude_code::circuit_breaker` (closed/open/half-open, failure/success
//! thresholds), so a misbehaving gateway degrades one component instead of
//! cascading into every monitor's poll tick.

pub mod circuit_breaker;

use crate::error::{Result, SpiralError};
use async_trait::async_trait;
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A single content block in a heterogeneous assistant reply (§4.3, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    pub text: Option<String>,
    pub content: Option<String>,
}

/// `Message.content` as a tagged union: either a plain string or an array of
/// blocks. Untagged so it deserializes whichever shape the gateway sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Reduces heterogeneous message content to plain text per the rule in §4.3:
/// a string is taken as-is; an array of blocks concatenates each block's
/// `.text` when it is a string, falls back to `.content` when that is a
/// string, and otherwise JSON-stringifies the block as a last resort. Shared
/// by the Completion Gate, the Planning Controller, and the Monitor (§9).
pub fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| {
                if let Some(text) = &block.text {
                    text.clone()
                } else if let Some(content) = &block.content {
                    content.clone()
                } else {
                    serde_json::to_string(block).unwrap_or_default()
                }
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl Message {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    pub fn text(&self) -> String {
        extract_text(&self.content)
    }
}

/// A lifecycle frame from the gateway's event stream (§4.3's `onEvent`
/// payload shape, modeled as an owned value rather than a callback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    pub session_key: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
    pub phase: Option<String>,
    pub stage: Option<String>,
}

impl GatewayEvent {
    /// Whether this event qualifies as a first-activity signal for
    /// `session_key` per §4.7's event-based ack rule.
    pub fn qualifies_as_first_activity(&self, session_key: &str) -> bool {
        if self.session_key.as_deref() != Some(session_key) {
            return false;
        }
        if self.role.as_deref() == Some("assistant") {
            return true;
        }
        const MARKERS: &[&str] = &[
            "lifecycle",
            "run.start",
            "run.progress",
            "chat.run.start",
            "chat.run.progress",
            "started",
            "progress",
            "running",
        ];
        let haystacks = [
            Some(self.event.as_str()),
            self.phase.as_deref(),
            self.stage.as_deref(),
        ];
        haystacks
            .into_iter()
            .flatten()
            .any(|h| MARKERS.iter().any(|m| h.contains(m)))
    }
}

#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    /// Idempotent; must succeed before any call below.
    async fn connect(&self) -> Result<()>;

    async fn send_message(&self, session_key: &str, text: &str) -> Result<()>;

    /// Optional model override; failures are logged, not fatal (§4.3).
    async fn patch_session(&self, session_key: &str, patch: serde_json::Value) -> Result<()>;

    async fn get_chat_history(&self, session_key: &str) -> Result<Vec<Message>>;

    fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent>;

    async fn list_sessions(&self) -> Result<Vec<String>>;
    async fn list_cron_jobs(&self) -> Result<Vec<serde_json::Value>>;
    async fn cron_status(&self) -> Result<serde_json::Value>;

    /// Circuit breaker snapshot for `GET /system/health` (§4.13). `None` for
    /// adapters that don't have one (e.g. test stubs).
    async fn circuit_breaker_metrics(&self) -> Option<circuit_breaker::CircuitBreakerMetrics> {
        None
    }
}

/// Reference HTTP-backed adapter. The event stream is a best-effort SSE
/// subscription; disconnects are logged and do not bring down the monitor —
/// polling `get_chat_history` is the fallback path the spec relies on.
pub struct HttpGatewayAdapter {
    base_url: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    events: broadcast::Sender<GatewayEvent>,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

impl HttpGatewayAdapter {
    pub fn new(base_url: String) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            base_url,
            client: reqwest::Client::new(),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            events,
        }
    }

    pub async fn breaker_metrics(&self) -> circuit_breaker::CircuitBreakerMetrics {
        self.breaker.get_metrics().await
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        if !self.breaker.should_allow_request().await {
            return Err(SpiralError::GatewayError(
                "circuit breaker open: gateway calls suspended".to_string(),
            ));
        }
        match call.await {
            Ok(value) => {
                self.breaker.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure().await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl GatewayAdapter for HttpGatewayAdapter {
    async fn connect(&self) -> Result<()> {
        self.guarded(async {
            self.client
                .get(format!("{}/health", self.base_url))
                .send()
                .await?;
            Ok(())
        })
        .await
    }

    async fn send_message(&self, session_key: &str, text: &str) -> Result<()> {
        self.guarded(async {
            self.client
                .post(format!("{}/sessions/{session_key}/messages", self.base_url))
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))?
                .error_for_status()
                .map_err(|e| SpiralError::GatewayError(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn patch_session(&self, session_key: &str, patch: serde_json::Value) -> Result<()> {
        let result = self
            .guarded(async {
                self.client
                    .patch(format!("{}/sessions/{session_key}", self.base_url))
                    .json(&patch)
                    .send()
                    .await
                    .map_err(|e| SpiralError::GatewayError(e.to_string()))?;
                Ok(())
            })
            .await;
        if let Err(ref e) = result {
            tracing::warn!(session_key, error = %e, "patch_session failed, continuing");
        }
        Ok(())
    }

    async fn get_chat_history(&self, session_key: &str) -> Result<Vec<Message>> {
        self.guarded(async {
            let response = self
                .client
                .get(format!("{}/sessions/{session_key}/history", self.base_url))
                .send()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))?;
            let messages: Vec<Message> = response
                .json()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))?;
            Ok(messages)
        })
        .await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        self.guarded(async {
            let response = self
                .client
                .get(format!("{}/sessions", self.base_url))
                .send()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))?;
            response
                .json()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))
        })
        .await
    }

    async fn list_cron_jobs(&self) -> Result<Vec<serde_json::Value>> {
        self.guarded(async {
            let response = self
                .client
                .get(format!("{}/cron-jobs", self.base_url))
                .send()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))?;
            response
                .json()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))
        })
        .await
    }

    async fn cron_status(&self) -> Result<serde_json::Value> {
        self.guarded(async {
            let response = self
                .client
                .get(format!("{}/cron-jobs/status", self.base_url))
                .send()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))?;
            response
                .json()
                .await
                .map_err(|e| SpiralError::GatewayError(e.to_string()))
        })
        .await
    }

    async fn circuit_breaker_metrics(&self) -> Option<circuit_breaker::CircuitBreakerMetrics> {
        Some(self.breaker_metrics().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_handles_plain_string() {
        let content = MessageContent::Text("hello".into());
        assert_eq!(extract_text(&content), "hello");
    }

    #[test]
    fn extract_text_concatenates_block_text() {
        let content = MessageContent::Blocks(vec![
            ContentBlock {
                text: Some("a".into()),
                content: None,
            },
            ContentBlock {
                text: Some("b".into()),
                content: None,
            },
        ]);
        assert_eq!(extract_text(&content), "ab");
    }

    #[test]
    fn extract_text_falls_back_to_content_field() {
        let content = MessageContent::Blocks(vec![ContentBlock {
            text: None,
            content: Some("fallback".into()),
        }]);
        assert_eq!(extract_text(&content), "fallback");
    }

    #[test]
    fn event_qualifies_on_assistant_role() {
        let event = GatewayEvent {
            event: "frame".into(),
            session_key: Some("s1".into()),
            role: Some("assistant".into()),
            status: None,
            phase: None,
            stage: None,
        };
        assert!(event.qualifies_as_first_activity("s1"));
    }

    #[test]
    fn event_qualifies_on_lifecycle_phase_markers() {
        let event = GatewayEvent {
            event: "chat.run.progress".into(),
            session_key: Some("s1".into()),
            role: None,
            status: None,
            phase: Some("run.start".into()),
            stage: None,
        };
        assert!(event.qualifies_as_first_activity("s1"));
    }

    #[test]
    fn event_does_not_qualify_for_other_session() {
        let event = GatewayEvent {
            event: "run.start".into(),
            session_key: Some("other".into()),
            role: Some("assistant".into()),
            status: None,
            phase: None,
            stage: None,
        };
        assert!(!event.qualifies_as_first_activity("s1"));
    }

    #[tokio::test]
    async fn send_message_success_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sessions/s1/messages")
            .with_status(200)
            .create_async()
            .await;

        let adapter = HttpGatewayAdapter::new(server.url());
        adapter.send_message("s1", "hello").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_chat_history_deserializes_mixed_content() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!([
            { "role": "assistant", "content": "plain text", "timestamp": null },
            { "role": "assistant", "content": [{ "text": "block text" }], "timestamp": null }
        ]);
        let _mock = server
            .mock("GET", "/sessions/s1/history")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let adapter = HttpGatewayAdapter::new(server.url());
        let history = adapter.get_chat_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "plain text");
        assert_eq!(history[1].text(), "block text");
    }

    #[tokio::test]
    async fn send_message_failure_surfaces_gateway_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/sessions/s1/messages")
            .with_status(500)
            .create_async()
            .await;

        let adapter = HttpGatewayAdapter::new(server.url());
        let result = adapter.send_message("s1", "hello").await;
        assert!(matches!(result, Err(SpiralError::GatewayError(_))));
    }
}
