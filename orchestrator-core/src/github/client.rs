use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::event::{Event, EventType, Level};

use super::error::GitHubApiError;

/// Supplies the bearer token used on every request. Token minting/refresh
/// (OAuth app flow, GitHub App installation tokens) is an external
/// collaborator — the client only ever calls `token()`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, GitHubApiError>;
}

/// A `TokenProvider` backed by a single static token, for CLI use and tests.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, GitHubApiError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    pub rest_base_url: String,
    pub graphql_url: String,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub min_secondary_backoff: Duration,
    pub max_secondary_backoff: Duration,
}

impl Default for GitHubClientConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.github.com".to_string(),
            graphql_url: "https://api.github.com/graphql".to_string(),
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            min_secondary_backoff: Duration::from_secs(60),
            max_secondary_backoff: Duration::from_secs(30 * 60),
        }
    }
}

/// One REST call. `path` is relative to [`GitHubClientConfig::rest_base_url`]
/// (e.g. `/repos/o/r/issues`).
pub struct GitHubRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: Option<Value>,
    pub allow_not_found: bool,
    pub source: Option<&'a str>,
}

impl<'a> GitHubRequest<'a> {
    pub fn get(path: &'a str) -> Self {
        Self { method: Method::GET, path, body: None, allow_not_found: false, source: None }
    }

    pub fn with_source(mut self, source: &'a str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn allow_404(mut self) -> Self {
        self.allow_not_found = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GitHubResponse {
    pub data: Value,
    pub status: u16,
    pub etag: Option<String>,
    pub link: Option<String>,
}

pub struct GitHubClient {
    http: reqwest::Client,
    config: GitHubClientConfig,
    token: Arc<dyn TokenProvider>,
    bus: Option<Arc<EventBus>>,
}

impl GitHubClient {
    pub fn new(token: Arc<dyn TokenProvider>, config: GitHubClientConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent("orchestrator-core")
                .build()
                .expect("reqwest client builds with static config"),
            config,
            token,
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Execute one REST call, retrying transient failures with backoff.
    pub async fn request(&self, req: GitHubRequest<'_>) -> Result<GitHubResponse, GitHubApiError> {
        let url = format!("{}{}", self.config.rest_base_url, req.path);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = std::time::Instant::now();
            let outcome = self.send_once(&req, &url).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match &outcome {
                Ok(resp) => {
                    self.emit_telemetry(&req, &url, resp.status, true, duration_ms, attempt);
                    return Ok(resp.clone());
                }
                Err(err) => {
                    let ok = err.status == 404 && req.allow_not_found;
                    self.emit_telemetry(&req, &url, err.status, ok, duration_ms, attempt);
                    if ok {
                        return Ok(GitHubResponse { data: Value::Null, status: 404, etag: None, link: None });
                    }
                    if !err.is_transient() || attempt >= self.config.max_attempts {
                        return Err(err.clone());
                    }
                    let backoff = self.backoff_for(err, attempt);
                    warn!(attempt, status = err.status, ?backoff, path = req.path, "retrying github request");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn backoff_for(&self, err: &GitHubApiError, attempt: u32) -> Duration {
        if err.status == 429 || err.response_text.to_lowercase().contains("secondary rate limit") {
            let doubled = self.config.min_secondary_backoff * 2u32.pow(attempt.saturating_sub(1));
            return doubled.min(self.config.max_secondary_backoff);
        }
        self.config.base_backoff * 2u32.pow(attempt.saturating_sub(1))
    }

    async fn send_once(&self, req: &GitHubRequest<'_>, url: &str) -> Result<GitHubResponse, GitHubApiError> {
        let token = self.token.token().await?;
        let mut builder = self
            .http
            .request(req.method.clone(), url)
            .bearer_auth(token)
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", "2022-11-28");
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            GitHubApiError::new(0, format!("network error: {e}"))
        })?;

        let status = response.status();
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let link = response
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let reset_epoch = response
            .headers()
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        if let (Some(remaining), Some(reset)) = (&remaining, reset_epoch) {
            debug!(remaining, reset, "github rate limit signal");
        }
        let reset_at = reset_epoch.and_then(|e| DateTime::<Utc>::from_timestamp(e, 0));

        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            let data: Value = if text.is_empty() { Value::Null } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            Ok(GitHubResponse { data, status: status.as_u16(), etag, link })
        } else if status == StatusCode::NOT_FOUND {
            Err(GitHubApiError::new(404, text).with_rate_limit_reset(reset_at))
        } else {
            Err(GitHubApiError::new(status.as_u16(), text).with_rate_limit_reset(reset_at))
        }
    }

    /// Execute a single GraphQL query.
    pub async fn graphql(&self, query: &str, variables: Value, source: Option<&str>) -> Result<Value, GitHubApiError> {
        let token = self.token.token().await?;
        let started = std::time::Instant::now();
        let response = self
            .http
            .post(&self.config.graphql_url)
            .bearer_auth(token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| GitHubApiError::new(0, format!("network error: {e}")))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(bus) = &self.bus {
            bus.publish(Event {
                ts: chrono::Utc::now(),
                event_type: EventType::GithubRequest,
                level: if status.is_success() { Level::Debug } else { Level::Warn },
                run_id: None,
                worker_id: None,
                repo: None,
                task_id: None,
                session_id: None,
                data: json!({
                    "method": "POST",
                    "path": "/graphql",
                    "status": status.as_u16(),
                    "ok": status.is_success(),
                    "write": false,
                    "durationMs": duration_ms,
                    "attempt": 1,
                    "source": source,
                }),
            });
        }

        if !status.is_success() {
            return Err(GitHubApiError::new(status.as_u16(), text));
        }
        let body: Value = serde_json::from_str(&text).map_err(|e| GitHubApiError::new(0, e.to_string()))?;
        if let Some(errors) = body.get("errors") {
            if errors.as_array().is_some_and(|a| !a.is_empty()) {
                return Err(GitHubApiError::new(200, errors.to_string()));
            }
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    fn emit_telemetry(&self, req: &GitHubRequest<'_>, url: &str, status: u16, ok: bool, duration_ms: u64, attempt: u32) {
        let Some(bus) = &self.bus else { return };
        bus.publish(Event {
            ts: chrono::Utc::now(),
            event_type: EventType::GithubRequest,
            level: if ok { Level::Debug } else { Level::Warn },
            run_id: None,
            worker_id: None,
            repo: None,
            task_id: None,
            session_id: None,
            data: json!({
                "method": req.method.as_str(),
                "path": req.path,
                "status": status,
                "ok": ok,
                "write": req.method != Method::GET,
                "durationMs": duration_ms,
                "attempt": attempt,
                "source": req.source,
                "url": url,
            }),
        });
    }
}

/// Parse the `Link` response header into `rel -> url` pairs
/// (`<url>; rel="next", <url>; rel="last"`).
pub fn parse_link_header(header: &str) -> Vec<(String, String)> {
    header
        .split(',')
        .filter_map(|part| {
            let mut url = None;
            let mut rel = None;
            for segment in part.split(';') {
                let segment = segment.trim();
                if let Some(u) = segment.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
                    url = Some(u.to_string());
                } else if let Some(r) = segment.strip_prefix("rel=") {
                    rel = Some(r.trim_matches('"').to_string());
                }
            }
            match (url, rel) {
                (Some(url), Some(rel)) => Some((rel, url)),
                _ => None,
            }
        })
        .collect()
}

const ALLOWED_ISSUES_CURSOR_PARAMS: [&str; 5] = ["state", "sort", "direction", "per_page", "page"];

/// Validate a pagination cursor URL before following it: must be
/// `https://api.github.com/repos/<owner>/<name>/issues` with only
/// allowlisted query parameters (`since` is accepted in addition to the
/// cursor-navigation set, matching the issues-list endpoint's own filter).
pub fn validate_issues_cursor_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else { return false };
    if parsed.scheme() != "https" || parsed.host_str() != Some("api.github.com") {
        return false;
    }
    let path = parsed.path();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.len() != 4 || segments[0] != "repos" || segments[3] != "issues" {
        return false;
    }
    let mut allowed: HashSet<&str> = ALLOWED_ISSUES_CURSOR_PARAMS.into_iter().collect();
    allowed.insert("since");
    parsed.query_pairs().all(|(k, _)| allowed.contains(k.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_multi_rel_link_header() {
        let header = r#"<https://api.github.com/repos/o/r/issues?page=2>; rel="next", <https://api.github.com/repos/o/r/issues?page=9>; rel="last""#;
        let links = parse_link_header(header);
        assert!(links.contains(&("next".to_string(), "https://api.github.com/repos/o/r/issues?page=2".to_string())));
        assert!(links.contains(&("last".to_string(), "https://api.github.com/repos/o/r/issues?page=9".to_string())));
    }

    #[test]
    fn validates_well_formed_issues_cursor() {
        assert!(validate_issues_cursor_url(
            "https://api.github.com/repos/owner/name/issues?state=open&per_page=50&page=2"
        ));
    }

    #[test]
    fn rejects_cursor_with_disallowed_query_param() {
        assert!(!validate_issues_cursor_url(
            "https://api.github.com/repos/owner/name/issues?page=2&evil=1"
        ));
    }

    #[test]
    fn rejects_cursor_pointing_at_a_different_path_or_host() {
        assert!(!validate_issues_cursor_url("https://evil.example.com/repos/owner/name/issues"));
        assert!(!validate_issues_cursor_url("https://api.github.com/repos/owner/name/pulls"));
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = GitHubClient::new(
            Arc::new(StaticToken("t".into())),
            GitHubClientConfig {
                rest_base_url: server.uri(),
                base_backoff: Duration::from_millis(1),
                ..GitHubClientConfig::default()
            },
        );
        let resp = client.request(GitHubRequest::get("/repos/o/r/issues")).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn allow_not_found_suppresses_404_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues/999"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = GitHubClient::new(
            Arc::new(StaticToken("t".into())),
            GitHubClientConfig { rest_base_url: server.uri(), ..GitHubClientConfig::default() },
        );
        let resp = client
            .request(GitHubRequest::get("/repos/o/r/issues/999").allow_404())
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bad credentials"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GitHubClient::new(
            Arc::new(StaticToken("t".into())),
            GitHubClientConfig { rest_base_url: server.uri(), ..GitHubClientConfig::default() },
        );
        let err = client.request(GitHubRequest::get("/repos/o/r/issues")).await.unwrap_err();
        assert_eq!(err.status, 403);
    }
}
