//! Challenge-aware HTTP fetching
//!
//! Outbound requests for content sources go through [`ChallengeAwareFetcher`],
//! which retries transient failures with backoff but stops at the first
//! anti-bot verification page. Retrying a challenge only digs the hole deeper,
//! so it surfaces as [`RuntimeError::ChallengeDetected`] instead of being
//! folded into retry exhaustion.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::RetryConfig;
use crate::core::error::{Result, RuntimeError};
use crate::core::retry::{Failure, ResilientExecutor, RetryPolicy};

/// Browser User-Agents rotated across attempts
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Body markers of an interstitial verification page
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "Checking your browser",
    "Just a moment",
];

/// Marker that only counts as a challenge on a 403
const FORBIDDEN_ONLY_MARKER: &str = "cloudflare";

const BROWSER_HEADERS: &[(&str, &str)] = &[
    (
        "accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    ),
    ("accept-language", "en-US,en;q=0.9"),
    ("dnt", "1"),
    ("connection", "keep-alive"),
    ("upgrade-insecure-requests", "1"),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "none"),
    ("sec-fetch-user", "?1"),
    ("cache-control", "max-age=0"),
];

/// User-Agent used for the given 0-based attempt
pub fn user_agent_for_attempt(attempt: u32) -> &'static str {
    USER_AGENTS[attempt as usize % USER_AGENTS.len()]
}

/// Outbound request description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    /// Caller headers; these override the browser defaults
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Form-encoded POST
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers,
            body: Some(body.into()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response of one completed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
    pub cookies: Vec<String>,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
            cookies: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs a single request attempt
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request`; `attempt` is the 0-based retry index
    async fn send(&self, request: &FetchRequest, attempt: u32) -> Result<FetchResponse>;
}

/// [`HttpTransport`] over a shared `reqwest` client
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RuntimeError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn headers_for(request: &FetchRequest, attempt: u32) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(user_agent_for_attempt(attempt)),
        );
        for (name, value) in BROWSER_HEADERS {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                RuntimeError::ValidationError(format!("Invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                RuntimeError::ValidationError(format!("Invalid header value for '{}': {}", name, e))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest, attempt: u32) -> Result<FetchResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| {
                RuntimeError::ValidationError(format!("Invalid method '{}': {}", request.method, e))
            })?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .headers(Self::headers_for(request, attempt)?);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();

        let cookies = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();

        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .and_modify(|existing| {
                        existing.push_str(", ");
                        existing.push_str(value);
                    })
                    .or_insert_with(|| value.to_string());
            }
        }

        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(FetchResponse {
            status,
            body,
            headers,
            cookies,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> RuntimeError {
    if e.is_timeout() {
        RuntimeError::Timeout(e.to_string())
    } else if e.is_builder() {
        RuntimeError::ValidationError(e.to_string())
    } else {
        RuntimeError::Network(e.to_string())
    }
}

/// Recognize a bot verification page
///
/// Returns the marker that matched. Only 403 and 503 responses can be
/// challenges; the bare `cloudflare` marker is accepted on 403 alone.
pub fn detect_challenge(status: u16, body: &str) -> Option<&'static str> {
    if status != 403 && status != 503 {
        return None;
    }
    if let Some(marker) = CHALLENGE_MARKERS.iter().find(|m| body.contains(**m)) {
        return Some(marker);
    }
    if status == 403 && body.contains(FORBIDDEN_ONLY_MARKER) {
        return Some(FORBIDDEN_ONLY_MARKER);
    }
    None
}

/// Classification of one response
#[derive(Debug)]
pub enum ResponseClass {
    /// Request completed; the response is handed back to the caller
    Completed,
    /// Transient failure worth another attempt
    Retryable(RuntimeError),
    /// Anti-bot challenge; never retried
    Challenge { status: u16, marker: &'static str },
}

/// Classify a response
///
/// 2xx and ordinary error statuses complete. A 403 without a marker is
/// retried only when `retry_on_403` is set.
pub fn classify_response(response: &FetchResponse, retry_on_403: bool) -> ResponseClass {
    if let Some(marker) = detect_challenge(response.status, &response.body) {
        return ResponseClass::Challenge {
            status: response.status,
            marker,
        };
    }

    match response.status {
        403 if retry_on_403 => ResponseClass::Retryable(RuntimeError::HttpStatus {
            status: 403,
            message: "Forbidden".to_string(),
        }),
        429 | 503 => ResponseClass::Retryable(RuntimeError::HttpStatus {
            status: response.status,
            message: "Service temporarily unavailable".to_string(),
        }),
        _ => ResponseClass::Completed,
    }
}

/// External challenge solving service
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch `request` through the solver after a challenge answered with `status`
    async fn solve(&self, request: &FetchRequest, status: u16) -> Result<FetchResponse>;
}

/// Retrying fetcher that short-circuits on bot challenges
pub struct ChallengeAwareFetcher {
    transport: Arc<dyn HttpTransport>,
    executor: ResilientExecutor,
    retry_on_403: bool,
    solver: Option<Arc<dyn ChallengeSolver>>,
}

impl ChallengeAwareFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &RetryConfig) -> Self {
        Self {
            transport,
            executor: ResilientExecutor::new(RetryPolicy::from(config)),
            retry_on_403: config.retry_on_403,
            solver: None,
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Fetch `request`
    ///
    /// Transport faults, 429/503 and (optionally) bare 403 responses are
    /// retried with backoff. A challenge stops immediately; the configured
    /// solver gets exactly one try before `ChallengeDetected` is returned.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let retry_on_403 = self.retry_on_403;

        let result = self
            .executor
            .with_retry(|attempt| {
                let transport = self.transport.clone();
                async move {
                    let response = match transport.send(request, attempt).await {
                        Ok(response) => response,
                        Err(e) if e.is_retryable() => return Err(Failure::Fault(e)),
                        Err(e) => return Err(Failure::Abort(e)),
                    };

                    match classify_response(&response, retry_on_403) {
                        ResponseClass::Completed => Ok(response),
                        ResponseClass::Retryable(e) => {
                            debug!(url = %request.url, status = response.status, attempt, "Retryable response");
                            Err(Failure::Fault(e))
                        }
                        ResponseClass::Challenge { status, marker } => {
                            Err(Failure::Abort(RuntimeError::ChallengeDetected {
                                status,
                                marker: marker.to_string(),
                            }))
                        }
                    }
                }
            })
            .await;

        match result {
            Err(RuntimeError::ChallengeDetected { status, marker }) => {
                warn!(url = %request.url, status, marker = %marker, "Bot challenge detected");
                self.try_solver(request, status, marker).await
            }
            other => other,
        }
    }

    async fn try_solver(
        &self,
        request: &FetchRequest,
        status: u16,
        marker: String,
    ) -> Result<FetchResponse> {
        if let Some(solver) = &self.solver {
            info!(url = %request.url, solver = solver.name(), "Attempting challenge solver");
            match solver.solve(request, status).await {
                Ok(response) if response.is_success() => {
                    info!(url = %request.url, solver = solver.name(), "Challenge solved");
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(url = %request.url, status = response.status, "Challenge solver returned failure status");
                }
                Err(e) => {
                    warn!(url = %request.url, error = %e, "Challenge solver failed");
                }
            }
        }

        Err(RuntimeError::ChallengeDetected { status, marker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted results; repeats the last one when exhausted
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<FetchResponse>>>,
        calls: AtomicU32,
        user_agents: Mutex<Vec<&'static str>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<FetchResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                user_agents: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn clone_result(result: &Result<FetchResponse>) -> Result<FetchResponse> {
        match result {
            Ok(response) => Ok(response.clone()),
            Err(e) => Err(RuntimeError::Network(e.to_string())),
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, _request: &FetchRequest, attempt: u32) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.user_agents
                .lock()
                .unwrap()
                .push(user_agent_for_attempt(attempt));

            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                clone_result(script.front().unwrap())
            }
        }
    }

    struct StaticSolver(u16);

    #[async_trait]
    impl ChallengeSolver for StaticSolver {
        fn name(&self) -> &str {
            "static"
        }

        async fn solve(&self, _request: &FetchRequest, _status: u16) -> Result<FetchResponse> {
            Ok(FetchResponse::new(self.0, "solved"))
        }
    }

    fn config(retry_on_403: bool) -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            retry_on_403,
            request_timeout_secs: 20,
        }
    }

    #[test]
    fn test_detect_challenge() {
        assert_eq!(
            detect_challenge(403, "<div id=\"cf-browser-verification\">"),
            Some("cf-browser-verification")
        );
        assert_eq!(detect_challenge(503, "Just a moment..."), Some("Just a moment"));
        assert_eq!(detect_challenge(403, "served by cloudflare"), Some("cloudflare"));
        assert_eq!(detect_challenge(503, "served by cloudflare"), None);
        assert_eq!(detect_challenge(200, "Just a moment"), None);
        assert_eq!(detect_challenge(403, "access denied"), None);
    }

    #[test]
    fn test_classify_response() {
        assert!(matches!(
            classify_response(&FetchResponse::new(200, "ok"), true),
            ResponseClass::Completed
        ));
        assert!(matches!(
            classify_response(&FetchResponse::new(404, "missing"), true),
            ResponseClass::Completed
        ));
        assert!(matches!(
            classify_response(&FetchResponse::new(429, ""), true),
            ResponseClass::Retryable(_)
        ));
        assert!(matches!(
            classify_response(&FetchResponse::new(403, "denied"), true),
            ResponseClass::Retryable(_)
        ));
        assert!(matches!(
            classify_response(&FetchResponse::new(403, "denied"), false),
            ResponseClass::Completed
        ));
        assert!(matches!(
            classify_response(&FetchResponse::new(503, "Checking your browser"), true),
            ResponseClass::Challenge { status: 503, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_short_circuits() {
        let transport = ScriptedTransport::new(vec![Ok(FetchResponse::new(
            403,
            "<title>Just a moment...</title>",
        ))]);
        let fetcher = ChallengeAwareFetcher::new(transport.clone(), &config(true));

        let result = fetcher.fetch(&FetchRequest::get("https://example.org/book")).await;

        assert_eq!(transport.calls(), 1);
        match result {
            Err(RuntimeError::ChallengeDetected { status, marker }) => {
                assert_eq!(status, 403);
                assert_eq!(marker, "Just a moment");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Err(RuntimeError::Network("connection reset".to_string())),
            Ok(FetchResponse::new(503, "maintenance")),
            Ok(FetchResponse::new(200, "chapter text")),
        ]);
        let fetcher = ChallengeAwareFetcher::new(transport.clone(), &config(true));

        let response = fetcher
            .fetch(&FetchRequest::get("https://example.org/chapter/1"))
            .await
            .unwrap();

        assert_eq!(response.body, "chapter text");
        assert_eq!(transport.calls(), 3);

        let agents = transport.user_agents.lock().unwrap();
        assert_eq!(agents[0], USER_AGENTS[0]);
        assert_eq!(agents[1], USER_AGENTS[1]);
        assert_eq!(agents[2], USER_AGENTS[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_distinct_from_challenge() {
        let transport = ScriptedTransport::new(vec![Ok(FetchResponse::new(503, "overloaded"))]);
        let fetcher = ChallengeAwareFetcher::new(transport.clone(), &config(true));

        let result = fetcher.fetch(&FetchRequest::get("https://example.org")).await;

        assert_eq!(transport.calls(), 4);
        assert!(matches!(
            result,
            Err(RuntimeError::OperationExhausted { attempts: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_without_retry_completes() {
        let transport = ScriptedTransport::new(vec![Ok(FetchResponse::new(403, "denied"))]);
        let fetcher = ChallengeAwareFetcher::new(transport.clone(), &config(false));

        let response = fetcher
            .fetch(&FetchRequest::get("https://example.org"))
            .await
            .unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(response.status, 403);
        assert!(!response.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_solver_gets_one_try() {
        let transport = ScriptedTransport::new(vec![Ok(FetchResponse::new(
            503,
            "cf-browser-verification",
        ))]);

        let solved = ChallengeAwareFetcher::new(transport.clone(), &config(true))
            .with_solver(Arc::new(StaticSolver(200)));
        let response = solved
            .fetch(&FetchRequest::get("https://example.org"))
            .await
            .unwrap();
        assert_eq!(response.body, "solved");
        assert_eq!(transport.calls(), 1);

        let unsolved = ChallengeAwareFetcher::new(transport.clone(), &config(true))
            .with_solver(Arc::new(StaticSolver(403)));
        let result = unsolved.fetch(&FetchRequest::get("https://example.org")).await;
        assert!(matches!(
            result,
            Err(RuntimeError::ChallengeDetected { status: 503, .. })
        ));
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn test_request_headers_override_defaults() {
        let request = FetchRequest::get("https://example.org").with_header("Accept", "application/json");
        let headers = ReqwestTransport::headers_for(&request, 4).unwrap();

        assert_eq!(headers.get("accept").unwrap(), "application/json");
        assert_eq!(headers.get("user-agent").unwrap(), USER_AGENTS[1]);
        assert_eq!(headers.get("dnt").unwrap(), "1");
    }
}
