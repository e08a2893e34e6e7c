//! Completion client for the chat service. Synchronous: `begin` performs the
//! whole HTTP call and the first `poll` returns the outcome.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use warble_core::{CompletionClient, CompletionError};

use crate::config::Config;
use crate::token::TokenStore;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ChatClient {
    http: reqwest::blocking::Client,
    url: String,
    default_token: String,
    user: String,
    web_search: bool,
    store: TokenStore,
    pending: Option<Result<String, CompletionError>>,
}

impl ChatClient {
    pub fn new(cfg: &Config, store: TokenStore) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            url: format!("http://{}:{}{}", cfg.chat_host, cfg.chat_port, cfg.chat_path),
            default_token: cfg.chat_token.clone(),
            user: cfg.chat_user.clone(),
            web_search: cfg.web_search,
            store,
            pending: None,
        })
    }

    /// Conversation id: `bzsz_<unix-seconds>_<6-digit-random>`.
    fn conversation_id() -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        format!("bzsz_{secs}_{suffix:06}")
    }

    fn request_body(&self, message: &str) -> serde_json::Value {
        serde_json::json!({
            "model": "glm",
            "store": true,
            "stream": false,
            "user": self.user,
            "reasoning": false,
            "thinking": false,
            "scene": "chat",
            "messages": [{ "content": message, "role": "user", "name": "string" }],
            "response_format": { "type": "text" },
            "web_search": { "enable": self.web_search },
        })
    }

    /// One blocking completion call. Also used directly for operator
    /// `test <text>` requests.
    pub fn send(&mut self, message: &str) -> Result<String, CompletionError> {
        let token = self
            .store
            .load()
            .unwrap_or_else(|| self.default_token.clone());
        let mut req = self
            .http
            .post(&self.url)
            .json(&self.request_body(message))
            .header("X-Conversation-Id", Self::conversation_id());
        if !token.is_empty() {
            req = req.bearer_auth(&token);
        }

        tracing::info!(url = %self.url, "sending completion request");
        let resp = req
            .send()
            .map_err(|e| CompletionError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        if status.as_u16() == 401 {
            tracing::warn!("completion token rejected, clearing stored token");
            if let Err(err) = self.store.clear() {
                tracing::warn!("failed to clear stored token: {err}");
            }
        }
        if !status.is_success() {
            return Err(CompletionError::Status(status.as_u16()));
        }
        Ok(extract_content(&body))
    }
}

/// Pull the reply text out of a completion response:
/// `choices[0].message.content`, else a top-level `content`, else the raw
/// body.
fn extract_content(body: &str) -> String {
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    doc.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| {
            doc.get("content")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

impl CompletionClient for ChatClient {
    fn begin(&mut self, prompt: &str) {
        self.pending = Some(self.send(prompt));
    }

    fn poll(&mut self) -> Option<Result<String, CompletionError>> {
        self.pending.take()
    }

    fn cancel(&mut self) {
        self.pending = None;
    }
}
