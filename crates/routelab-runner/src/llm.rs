use crate::config::{BackendKind, ReasoningConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// One text-generation call. `agent` and `stage` only label the call for logs
/// and for scripted backends; the service sees model, temperature and prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub agent: String,
    pub stage: String,
    pub model: String,
    pub temperature: f32,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(agent: &str, stage: &str, model: &str, temperature: f32, prompt: String) -> Self {
        Self {
            agent: agent.to_string(),
            stage: stage.to_string(),
            model: model.to_string(),
            temperature,
            prompt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited by reasoning backend")]
    RateLimited,
    #[error("reasoning backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("reasoning backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Connection(_) | BackendError::Timeout(_) | BackendError::RateLimited => {
                true
            }
            BackendError::Status { status, .. } => *status >= 500,
            BackendError::Malformed(_) | BackendError::Unavailable(_) => false,
        }
    }
}

pub trait ReasoningBackend: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError>;
}

pub struct OllamaBackend {
    client: reqwest::blocking::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ReasoningBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": { "temperature": request.temperature },
        });
        let resp = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(e.to_string())
            } else {
                BackendError::Connection(e.to_string())
            }
        })?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(BackendError::RateLimited);
        }
        let text = resp
            .text()
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        if !status.is_success() {
            let mut body = text;
            body.truncate(512);
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let reply: GenerateReply =
            serde_json::from_str(&text).map_err(|e| BackendError::Malformed(e.to_string()))?;
        if let Some(err) = reply.error {
            return Err(BackendError::Malformed(err));
        }
        match reply.response {
            Some(r) if !r.trim().is_empty() => Ok(r),
            _ => Err(BackendError::Malformed("empty response".to_string())),
        }
    }
}

/// Backend that never answers; every agent takes its fallback path.
pub struct OfflineBackend;

impl ReasoningBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    fn complete(&self, _request: &CompletionRequest) -> Result<String, BackendError> {
        Err(BackendError::Unavailable("offline mode".to_string()))
    }
}

pub fn backend_from_config(cfg: &ReasoningConfig) -> Result<Arc<dyn ReasoningBackend>> {
    match cfg.backend {
        BackendKind::Ollama => Ok(Arc::new(OllamaBackend::new(
            &cfg.base_url,
            Duration::from_secs(cfg.request_timeout_secs),
        )?)),
        BackendKind::Offline => Ok(Arc::new(OfflineBackend)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ReasoningConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.backoff_base_ms),
            max_delay: Duration::from_millis(cfg.backoff_base_ms.saturating_mul(10)),
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct ReasoningClient {
    backend: Arc<dyn ReasoningBackend>,
    policy: RetryPolicy,
}

impl ReasoningClient {
    pub fn new(backend: Arc<dyn ReasoningBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn complete(&self, request: &CompletionRequest) -> Result<String, BackendError> {
        let mut attempt = 1;
        loop {
            match self.backend.complete(request) {
                Ok(text) => {
                    debug!(
                        agent = %request.agent,
                        stage = %request.stage,
                        attempt,
                        chars = text.len(),
                        "reasoning reply received"
                    );
                    return Ok(text);
                }
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        agent = %request.agent,
                        stage = %request.stage,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "reasoning call failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    struct Flaky {
        failures: AtomicU32,
        error: BackendError,
        calls: AtomicU32,
    }

    impl ReasoningBackend for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn complete(&self, _request: &CompletionRequest) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok("done".to_string())
        }
    }

    fn instant_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("coder", "generation", "m", 0.05, "p".to_string())
    }

    #[test]
    fn transient_errors_are_retried_up_to_the_limit() {
        let backend = Arc::new(Flaky {
            failures: AtomicU32::new(2),
            error: BackendError::RateLimited,
            calls: AtomicU32::new(0),
        });
        let client = ReasoningClient::new(backend.clone(), instant_policy());
        assert_eq!(client.complete(&request()).expect("third try"), "done");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        let backend = Arc::new(Flaky {
            failures: AtomicU32::new(5),
            error: BackendError::Connection("refused".to_string()),
            calls: AtomicU32::new(0),
        });
        let client = ReasoningClient::new(backend.clone(), instant_policy());
        assert!(client.complete(&request()).is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let backend = Arc::new(Flaky {
            failures: AtomicU32::new(1),
            error: BackendError::Malformed("bad".to_string()),
            calls: AtomicU32::new(0),
        });
        let client = ReasoningClient::new(backend.clone(), instant_policy());
        assert!(client.complete(&request()).is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn offline_backend_is_unavailable_and_not_transient() {
        let err = OfflineBackend.complete(&request()).expect_err("offline");
        assert!(!err.is_transient());
    }

    fn serve(responses: Vec<(u16, &'static str)>) -> (String, mpsc::Receiver<String>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server
            .server_addr()
            .to_ip()
            .expect("ip listener");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok(mut req) = server.recv() else { return };
                let mut received = String::new();
                let _ = req.as_reader().read_to_string(&mut received);
                let _ = tx.send(received);
                let _ = req.respond(tiny_http::Response::from_string(body).with_status_code(status));
            }
        });
        (format!("http://{}", addr), rx)
    }

    #[test]
    fn ollama_backend_posts_generate_request() {
        let (url, rx) = serve(vec![(200, r#"{"model":"m","response":"hello there","done":true}"#)]);
        let backend = OllamaBackend::new(&url, Duration::from_secs(5)).expect("client");
        let reply = backend.complete(&request()).expect("reply");
        assert_eq!(reply, "hello there");
        let sent: serde_json::Value =
            serde_json::from_str(&rx.recv().expect("request body")).expect("json body");
        assert_eq!(sent["model"], "m");
        assert_eq!(sent["prompt"], "p");
        assert_eq!(sent["stream"], false);
        assert!(sent["options"]["temperature"].as_f64().is_some());
    }

    #[test]
    fn ollama_status_codes_map_to_error_classes() {
        let (url, _rx) = serve(vec![(429, "slow down"), (503, "busy"), (404, "no model")]);
        let backend = OllamaBackend::new(&url, Duration::from_secs(5)).expect("client");
        assert_eq!(
            backend.complete(&request()).expect_err("429"),
            BackendError::RateLimited
        );
        let busy = backend.complete(&request()).expect_err("503");
        assert!(busy.is_transient());
        let missing = backend.complete(&request()).expect_err("404");
        assert!(matches!(missing, BackendError::Status { status: 404, .. }));
        assert!(!missing.is_transient());
    }

    #[test]
    fn client_retries_server_errors_against_http_backend() {
        let (url, _rx) = serve(vec![(500, "oops"), (200, r#"{"response":"recovered"}"#)]);
        let backend = Arc::new(OllamaBackend::new(&url, Duration::from_secs(5)).expect("client"));
        let client = ReasoningClient::new(backend, instant_policy());
        assert_eq!(client.complete(&request()).expect("retry"), "recovered");
    }
}
