use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// A message in an LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

/// Request to an LLM.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
}

impl LlmRequest {
    /// `len(system + user) / 4`, the same rough token estimate the original
    /// rate limiter uses in place of a real tokenizer.
    fn estimated_tokens(&self) -> u64 {
        let user_len: usize = self.messages.iter().map(|m| m.content.len()).sum();
        ((self.system_prompt.len() + user_len) / 4) as u64
    }
}

/// Response from an LLM.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    /// Set when the call fell back to a non-primary model after repeated
    /// cooldowns on the preferred one.
    pub is_fallback: bool,
    /// Which model actually produced this response, for prompt-log
    /// attribution. Empty for transports (e.g. the test stub) that don't
    /// track a model identity.
    pub model: String,
}

/// Facade trait for LLM providers.
pub trait LlmClient: Send + Sync {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>>;
}

/// Static per-model capacity the rate limiter admits requests against.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub context_window: u64,
    pub max_output: u64,
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
}

/// Returns the built-in spec table. Unknown models fall back to a
/// conservative default rather than panicking, since new models appear
/// more often than this table is updated.
pub fn model_spec(model: &str) -> ModelSpec {
    match model {
        "llama-3.3-70b-versatile" => ModelSpec {
            context_window: 128_000,
            max_output: 32_768,
            requests_per_minute: 30,
            tokens_per_minute: 6_000,
        },
        "llama-3.1-8b-instant" => ModelSpec {
            context_window: 128_000,
            max_output: 8_192,
            requests_per_minute: 30,
            tokens_per_minute: 20_000,
        },
        _ => ModelSpec {
            context_window: 32_000,
            max_output: 4_096,
            requests_per_minute: 20,
            tokens_per_minute: 10_000,
        },
    }
}

struct ModelState {
    /// Timestamps (and token counts) of requests in the trailing 60s window.
    history: Vec<(Instant, u64)>,
    cooldown_until: Option<Instant>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            history: Vec::new(),
            cooldown_until: None,
        }
    }
}

/// Process-wide, thread-safe request admission gate.
///
/// Guarded by a plain `std::sync::Mutex` rather than an async one: every
/// admission check is synchronous and short, and must never be held across
/// an `.await` point.
pub struct RateLimiter {
    state: Mutex<HashMap<String, ModelState>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Drops history entries older than 60s and reports whether a request
    /// of `estimated_tokens` may be admitted right now.
    pub fn can_request(&self, model: &str, estimated_tokens: u64) -> bool {
        let spec = model_spec(model);
        if estimated_tokens as f64 > 0.9 * spec.context_window as f64 {
            return false;
        }
        let mut guard = self.state.lock().expect("rate limiter mutex poisoned");
        let entry = guard.entry(model.to_string()).or_default();
        let now = Instant::now();
        if let Some(until) = entry.cooldown_until {
            if now < until {
                return false;
            }
        }
        entry.history.retain(|(ts, _)| now.duration_since(*ts) < Duration::from_secs(60));
        let request_count = entry.history.len() as u64;
        let token_sum: u64 = entry.history.iter().map(|(_, t)| t).sum();
        request_count < (spec.requests_per_minute as f64 * 0.8) as u64
            && (token_sum + estimated_tokens) < (spec.tokens_per_minute as f64 * 0.8) as u64
    }

    pub fn record(&self, model: &str, tokens: u64) {
        let mut guard = self.state.lock().expect("rate limiter mutex poisoned");
        let entry = guard.entry(model.to_string()).or_default();
        entry.history.push((Instant::now(), tokens));
    }

    /// Sets a cooldown window during which `can_request` refuses this model.
    pub fn set_cooldown(&self, model: &str, duration: Duration) {
        let mut guard = self.state.lock().expect("rate limiter mutex poisoned");
        let entry = guard.entry(model.to_string()).or_default();
        entry.cooldown_until = Some(Instant::now() + duration);
    }
}

/// Outcome hints an `LlmClient` transport can report so the caller can pick
/// the right cooldown tier, mirroring the three exception classes the
/// original rate limiter distinguishes.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Ok(LlmResponse, u64),
    RateLimited { retry_after: Option<Duration> },
    PayloadTooLarge,
    OtherError(String),
}

/// Wraps a raw transport with the admission/backoff/retry policy: up to 20
/// rounds trying candidate models in order, skipping any currently cooled
/// down, applying the appropriate cooldown tier on failure.
pub struct RateLimitedClient<T> {
    transport: T,
    limiter: RateLimiter,
    models: Vec<String>,
}

impl<T> RateLimitedClient<T>
where
    T: Send + Sync,
{
    pub fn new(transport: T, models: Vec<String>) -> Self {
        Self {
            transport,
            limiter: RateLimiter::new(),
            models,
        }
    }

    pub async fn call<F, Fut>(&self, request: &LlmRequest, send: F) -> Result<LlmResponse, PipelineError>
    where
        F: Fn(&T, &str, &LlmRequest) -> Fut,
        Fut: Future<Output = CallOutcome>,
    {
        let estimated = request.estimated_tokens();
        for _round in 0..20 {
            let mut admitted_any = false;
            for (idx, model) in self.models.iter().enumerate() {
                if !self.limiter.can_request(model, estimated) {
                    continue;
                }
                admitted_any = true;
                match send(&self.transport, model, request).await {
                    CallOutcome::Ok(mut response, tokens) => {
                        self.limiter.record(model, tokens);
                        response.is_fallback = idx > 0;
                        response.model = model.clone();
                        return Ok(response);
                    }
                    CallOutcome::RateLimited { retry_after } => {
                        let cooldown = retry_after.unwrap_or(Duration::from_secs(120)).min(Duration::from_secs(120));
                        self.limiter.set_cooldown(model, cooldown);
                    }
                    CallOutcome::PayloadTooLarge => {
                        self.limiter.set_cooldown(model, Duration::from_secs(300));
                    }
                    CallOutcome::OtherError(_) => {
                        self.limiter.set_cooldown(model, Duration::from_secs(30));
                    }
                }
            }
            if !admitted_any {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Err(PipelineError::LlmExhausted(format!(
            "no candidate model admitted a request after 20 rounds: {:?}",
            self.models
        )))
    }
}

/// Real transport speaking an OpenAI-chat-compatible HTTP API. Used against
/// Groq and any other OpenAI-compatible inference endpoint.
#[cfg(feature = "http")]
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_keys: Vec<String>,
    next_key: std::sync::atomic::AtomicUsize,
    inner: RateLimitedClient<()>,
}

#[cfg(feature = "http")]
impl HttpLlmClient {
    pub fn new(base_url: String, models: Vec<String>, api_keys: Vec<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_keys,
            next_key: std::sync::atomic::AtomicUsize::new(0),
            inner: RateLimitedClient::new((), models),
        }
    }

    fn next_api_key(&self) -> Option<&str> {
        if self.api_keys.is_empty() {
            return None;
        }
        let idx = self.next_key.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.api_keys.len();
        Some(&self.api_keys[idx])
    }

    async fn send_once(&self, model: &str, request: &LlmRequest) -> CallOutcome {
        let mut messages = vec![serde_json::json!({"role": "system", "content": request.system_prompt})];
        for m in &request.messages {
            messages.push(serde_json::json!({"role": m.role, "content": m.content}));
        }
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });
        let mut req = self.http.post(format!("{}/chat/completions", self.base_url)).json(&body);
        if let Some(key) = self.next_api_key() {
            req = req.bearer_auth(key);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return CallOutcome::OtherError(e.to_string()),
        };
        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return CallOutcome::RateLimited { retry_after };
        }
        if status.as_u16() == 413 {
            return CallOutcome::PayloadTooLarge;
        }
        if !status.is_success() {
            return CallOutcome::OtherError(format!("http status {status}"));
        }
        match resp.json::<serde_json::Value>().await {
            Ok(json) => {
                let content = json["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let tokens = json["usage"]["total_tokens"].as_u64().unwrap_or(0);
                CallOutcome::Ok(
                    LlmResponse {
                        content,
                        is_fallback: false,
                        model: model.to_string(),
                    },
                    tokens,
                )
            }
            Err(e) => CallOutcome::OtherError(e.to_string()),
        }
    }
}

#[cfg(feature = "http")]
impl LlmClient for HttpLlmClient {
    fn chat<'a>(
        &'a self,
        request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.inner
                .call(request, |_, model, req| self.send_once(model, req))
                .await
        })
    }
}

/// Stub LLM client that returns deterministic responses for testing.
pub struct StubLlmClient {
    responses: Vec<String>,
    call_count: std::sync::atomic::AtomicUsize,
}

impl StubLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            call_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Create a stub that always returns the given response.
    pub fn constant(response: &str) -> Self {
        Self::new(vec![response.to_string()])
    }
}

impl LlmClient for StubLlmClient {
    fn chat<'a>(
        &'a self,
        _request: &'a LlmRequest,
    ) -> Pin<Box<dyn Future<Output = Result<LlmResponse, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let idx = self
                .call_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let response = if self.responses.is_empty() {
                "stub response".to_string()
            } else {
                self.responses[idx % self.responses.len()].clone()
            };
            Ok(LlmResponse {
                content: response,
                is_fallback: false,
                model: "stub".to_string(),
            })
        })
    }
}
