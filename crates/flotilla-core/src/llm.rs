//! Multi-endpoint LLM client with weighted routing and health tracking.
//!
//! Speaks the OpenAI-compatible chat-completions API over one or more named
//! endpoints. Each endpoint carries a static weight, a rolling latency EMA,
//! and a consecutive-failure counter; selection is weighted random without
//! replacement over the healthy set, with latency shifting share inside a
//! 0.5x-2x band. Endpoints with three consecutive failures are parked and
//! probed again after an interval.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Smoothing factor for the latency EMA.
const LATENCY_EMA_ALPHA: f64 = 0.3;
/// Consecutive failures before an endpoint is marked unhealthy.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;
/// Latency can shift an endpoint's share by at most this band.
const WEIGHT_FACTOR_MIN: f64 = 0.5;
const WEIGHT_FACTOR_MAX: f64 = 2.0;

/// Errors from the LLM client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no LLM endpoints configured")]
    NoEndpoints,

    #[error("all {count} endpoint(s) failed: {details}")]
    AllEndpointsFailed { count: usize, details: String },

    #[error("malformed completion response from {endpoint}: {reason}")]
    MalformedResponse { endpoint: String, reason: String },

    #[error("no endpoint became ready within {0:?}")]
    ProbeTimeout(Duration),
}

/// One configured endpoint, as parsed from `LLM_ENDPOINTS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub name: String,
    /// Base URL, e.g. `http://localhost:8000` (paths are appended).
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Request parameters shared by every call.
#[derive(Debug, Clone)]
pub struct LlmParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_tokens: 8192,
            temperature: 0.2,
            request_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// A chat message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Token accounting from a completion. Absent fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// A successful completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: LlmUsage,
    pub finish_reason: String,
    /// Name of the endpoint that served the request.
    pub endpoint: String,
    pub latency_ms: u64,
}

/// Per-call parameter overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionOverrides {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// LLM connection details forwarded to a sandbox in its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxLlmConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire types (OpenAI chat completions)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Endpoint state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct EndpointState {
    healthy: bool,
    consecutive_failures: u32,
    latency_ema_ms: Option<f64>,
    unhealthy_since: Option<Instant>,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            latency_ema_ms: None,
            unhealthy_since: None,
        }
    }
}

struct EndpointSlot {
    config: EndpointConfig,
    state: Mutex<EndpointState>,
}

/// Latency factor applied to an endpoint's static weight.
///
/// `min_ema` is the fastest EMA among candidates; endpoints without a
/// sample yet get factor 1.0.
fn latency_factor(ema_ms: Option<f64>, min_ema: Option<f64>) -> f64 {
    match (ema_ms, min_ema) {
        (Some(ema), Some(min)) if ema > 0.0 => {
            (min / ema).clamp(WEIGHT_FACTOR_MIN, WEIGHT_FACTOR_MAX)
        }
        _ => 1.0,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// The shared LLM client. Cheap to share via `Arc`.
pub struct LlmClient {
    slots: Vec<EndpointSlot>,
    params: LlmParams,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(endpoints: Vec<EndpointConfig>, params: LlmParams) -> Result<Self, LlmError> {
        if endpoints.is_empty() {
            return Err(LlmError::NoEndpoints);
        }
        let http = reqwest::Client::builder()
            .timeout(params.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let slots = endpoints
            .into_iter()
            .map(|config| EndpointSlot {
                config,
                state: Mutex::new(EndpointState::default()),
            })
            .collect();
        Ok(Self {
            slots,
            params,
            http,
        })
    }

    pub fn params(&self) -> &LlmParams {
        &self.params
    }

    /// Connection details a sandbox should use: the first currently
    /// healthy endpoint (or the first configured one if none are).
    pub fn sandbox_config(&self) -> SandboxLlmConfig {
        let slot = self
            .slots
            .iter()
            .find(|s| s.state.lock().unwrap_or_else(|e| e.into_inner()).healthy)
            .unwrap_or(&self.slots[0]);
        SandboxLlmConfig {
            endpoint: slot.config.endpoint.clone(),
            model: self.params.model.clone(),
            max_tokens: self.params.max_tokens,
            temperature: self.params.temperature,
            api_key: slot.config.api_key.clone(),
        }
    }

    /// Decide the order endpoints are tried in for one request.
    ///
    /// Healthy endpoints first, drawn by weighted random without
    /// replacement over `weight x latency_factor`; unhealthy endpoints
    /// follow in configured order. An endpoint past its probe interval is
    /// re-marked healthy for one trial before ordering.
    fn selection_order(&self) -> Vec<usize> {
        // Probe pass: wake parked endpoints whose interval has elapsed.
        for slot in &self.slots {
            let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.healthy {
                let elapsed = state
                    .unhealthy_since
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.params.probe_interval {
                    debug!(endpoint = %slot.config.name, "probing unhealthy endpoint");
                    state.healthy = true;
                    state.unhealthy_since = None;
                }
            }
        }

        let mut healthy: Vec<usize> = Vec::new();
        let mut unhealthy: Vec<usize> = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            let state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.healthy {
                healthy.push(i);
            } else {
                unhealthy.push(i);
            }
        }

        let min_ema = healthy
            .iter()
            .filter_map(|&i| {
                self.slots[i]
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .latency_ema_ms
            })
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.min(v)))
            });

        let mut order = Vec::with_capacity(self.slots.len());
        let mut remaining = healthy;
        let mut rng = rand::rng();
        while !remaining.is_empty() {
            let weights: Vec<f64> = remaining
                .iter()
                .map(|&i| {
                    let ema = self.slots[i]
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .latency_ema_ms;
                    (self.slots[i].config.weight * latency_factor(ema, min_ema)).max(0.0)
                })
                .collect();
            let total: f64 = weights.iter().sum();
            let picked = if total <= 0.0 {
                0
            } else {
                use rand::Rng;
                let mut roll = rng.random_range(0.0..total);
                let mut picked = remaining.len() - 1;
                for (pos, w) in weights.iter().enumerate() {
                    if roll < *w {
                        picked = pos;
                        break;
                    }
                    roll -= w;
                }
                picked
            };
            order.push(remaining.swap_remove(picked));
        }
        order.extend(unhealthy);
        order
    }

    fn record_success(&self, index: usize, latency: Duration) {
        let mut state = self.slots[index]
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let sample = latency.as_millis() as f64;
        state.latency_ema_ms = Some(match state.latency_ema_ms {
            Some(ema) => LATENCY_EMA_ALPHA * sample + (1.0 - LATENCY_EMA_ALPHA) * ema,
            None => sample,
        });
        state.consecutive_failures = 0;
        state.healthy = true;
        state.unhealthy_since = None;
    }

    fn record_failure(&self, index: usize) {
        let mut state = self.slots[index]
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.consecutive_failures += 1;
        if state.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
            if state.healthy {
                warn!(
                    endpoint = %self.slots[index].config.name,
                    failures = state.consecutive_failures,
                    "marking endpoint unhealthy"
                );
            }
            state.healthy = false;
            state.unhealthy_since = Some(Instant::now());
        }
    }

    /// Run one chat completion, failing over across endpoints.
    ///
    /// Endpoints are tried in selection order; the first success wins. If
    /// every endpoint fails the aggregated error lists each attempt.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        overrides: CompletionOverrides,
    ) -> Result<Completion, LlmError> {
        let order = self.selection_order();
        let mut attempts: Vec<String> = Vec::new();

        for index in order {
            let slot = &self.slots[index];
            let started = Instant::now();
            match self.request_one(slot, messages, overrides).await {
                Ok(mut completion) => {
                    let latency = started.elapsed();
                    self.record_success(index, latency);
                    completion.endpoint = slot.config.name.clone();
                    completion.latency_ms = latency.as_millis() as u64;
                    return Ok(completion);
                }
                Err(reason) => {
                    self.record_failure(index);
                    debug!(endpoint = %slot.config.name, %reason, "endpoint attempt failed");
                    attempts.push(format!("{}: {reason}", slot.config.name));
                }
            }
        }

        Err(LlmError::AllEndpointsFailed {
            count: self.slots.len(),
            details: attempts.join("; "),
        })
    }

    async fn request_one(
        &self,
        slot: &EndpointSlot,
        messages: &[ChatMessage],
        overrides: CompletionOverrides,
    ) -> Result<Completion, String> {
        let url = format!(
            "{}/v1/chat/completions",
            slot.config.endpoint.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.params.model,
            messages,
            temperature: overrides.temperature.unwrap_or(self.params.temperature),
            max_tokens: overrides.max_tokens.unwrap_or(self.params.max_tokens),
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &slot.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| e.to_string())?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| "response had no choices".to_string())?;

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_default(),
            endpoint: String::new(),
            latency_ms: 0,
        })
    }

    /// Startup readiness probe: poll `GET /v1/models` until any endpoint
    /// responds, or the deadline expires.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<String, LlmError> {
        let started = Instant::now();
        loop {
            for slot in &self.slots {
                let url = format!("{}/v1/models", slot.config.endpoint.trim_end_matches('/'));
                let mut request = self.http.get(&url).timeout(Duration::from_secs(5));
                if let Some(key) = &slot.config.api_key {
                    request = request.bearer_auth(key);
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(endpoint = %slot.config.name, "endpoint ready");
                        return Ok(slot.config.name.clone());
                    }
                    _ => {}
                }
            }
            if started.elapsed() >= deadline {
                return Err(LlmError::ProbeTimeout(deadline));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Health snapshot for diagnostics: `(name, healthy, ema_ms)`.
    pub fn endpoint_health(&self) -> Vec<(String, bool, Option<f64>)> {
        self.slots
            .iter()
            .map(|slot| {
                let state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
                (
                    slot.config.name.clone(),
                    state.healthy,
                    state.latency_ema_ms,
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, weight: f64) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            endpoint: format!("http://{name}.invalid"),
            api_key: None,
            weight,
        }
    }

    fn client(endpoints: Vec<EndpointConfig>) -> LlmClient {
        LlmClient::new(endpoints, LlmParams::default()).unwrap()
    }

    #[test]
    fn rejects_empty_endpoint_list() {
        assert!(matches!(
            LlmClient::new(vec![], LlmParams::default()),
            Err(LlmError::NoEndpoints)
        ));
    }

    #[test]
    fn latency_factor_clamps_to_band() {
        // Fastest endpoint: ratio 1.0.
        assert_eq!(latency_factor(Some(100.0), Some(100.0)), 1.0);
        // Twice as slow: half the share.
        assert_eq!(latency_factor(Some(200.0), Some(100.0)), 0.5);
        // Ten times slower: floored at 0.5.
        assert_eq!(latency_factor(Some(1000.0), Some(100.0)), 0.5);
        // No sample yet: neutral.
        assert_eq!(latency_factor(None, Some(100.0)), 1.0);
        assert_eq!(latency_factor(Some(100.0), None), 1.0);
    }

    #[test]
    fn ema_follows_smoothing_constant() {
        let c = client(vec![endpoint("a", 1.0)]);
        c.record_success(0, Duration::from_millis(100));
        c.record_success(0, Duration::from_millis(200));
        let (_, _, ema) = c.endpoint_health().into_iter().next().unwrap();
        // 0.3 * 200 + 0.7 * 100 = 130
        assert!((ema.unwrap() - 130.0).abs() < 1e-9);
    }

    #[test]
    fn three_failures_mark_unhealthy() {
        let c = client(vec![endpoint("a", 1.0), endpoint("b", 1.0)]);
        c.record_failure(0);
        c.record_failure(0);
        assert!(c.endpoint_health()[0].1);
        c.record_failure(0);
        assert!(!c.endpoint_health()[0].1);
        // A success resets.
        c.record_success(0, Duration::from_millis(50));
        assert!(c.endpoint_health()[0].1);
    }

    #[test]
    fn unhealthy_endpoints_ordered_last() {
        let c = client(vec![endpoint("a", 100.0), endpoint("b", 1.0)]);
        for _ in 0..3 {
            c.record_failure(0);
        }
        for _ in 0..20 {
            let order = c.selection_order();
            assert_eq!(order.len(), 2);
            assert_eq!(order[0], 1, "healthy endpoint must come first");
            assert_eq!(order[1], 0);
            // Undo the probe wake-up the selection pass may apply.
            let mut state = c.slots[0].state.lock().unwrap();
            state.healthy = false;
            state.unhealthy_since = Some(Instant::now());
        }
    }

    #[test]
    fn probe_interval_revives_endpoint() {
        let params = LlmParams {
            probe_interval: Duration::ZERO,
            ..LlmParams::default()
        };
        let c = LlmClient::new(vec![endpoint("a", 1.0)], params).unwrap();
        for _ in 0..3 {
            c.record_failure(0);
        }
        assert!(!c.endpoint_health()[0].1);
        // With a zero probe interval the next selection revives it.
        let order = c.selection_order();
        assert_eq!(order, vec![0]);
        assert!(c.endpoint_health()[0].1);
    }

    #[test]
    fn selection_covers_every_endpoint_once() {
        let c = client(vec![
            endpoint("a", 10.0),
            endpoint("b", 5.0),
            endpoint("c", 1.0),
        ]);
        for _ in 0..50 {
            let mut order = c.selection_order();
            order.sort_unstable();
            assert_eq!(order, vec![0, 1, 2]);
        }
    }

    #[test]
    fn usage_defaults_to_zero_when_absent() {
        let raw = r#"{"choices":[{"message":{"content":"hi"},"finish_reason":"stop"}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.usage.is_none());
        let usage = parsed.usage.unwrap_or_default();
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.total_tokens, 0);
    }

    #[test]
    fn endpoint_config_parses_camel_case() {
        let raw = r#"[{"name":"primary","endpoint":"http://localhost:8000","apiKey":"sk-x","weight":80},
                      {"name":"backup","endpoint":"http://localhost:8001","weight":20}]"#;
        let configs: Vec<EndpointConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].api_key.as_deref(), Some("sk-x"));
        assert_eq!(configs[1].weight, 20.0);
        assert!(configs[1].api_key.is_none());
    }
}
