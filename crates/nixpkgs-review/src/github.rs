//! GitHub client: PR metadata, check runs, CI artifacts, and the
//! comment/approve/merge write paths.
//!
//! The only component with retries: 5xx responses and rate-limit headers get
//! exponential backoff; everything else surfaces immediately with a
//! suggestion the user can act on.

use std::io::Read;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use review_core::PrSpec;

use crate::process::{Cmd, ProcessRunner};

const MAX_ATTEMPTS: u32 = 4;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Rate-limit windows further away than this are not worth waiting out.
const MAX_RATELIMIT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("GitHub returned {status} for {url}: {message}{suggestion}")]
    Remote {
        status: u16,
        url: String,
        message: String,
        suggestion: String,
    },
    #[error("rate limit exceeded, retry in {reset_in}s")]
    RateLimited { reset_in: u64 },
    #[error("GITHUB_TOKEN_CMD failed: {0}")]
    TokenCommand(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("cannot parse GitHub remote: {0}")]
    BadRemote(String),
    #[error("artifact is not a usable zip: {0}")]
    BadArtifact(String),
}

pub type Result<T> = std::result::Result<T, GithubError>;

/// One entry from the check-runs listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub details_url: Option<String>,
    #[serde(default)]
    pub output: Option<CheckOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckOutput {
    pub title: Option<String>,
    pub summary: Option<String>,
}

impl CheckRun {
    pub fn succeeded(&self) -> bool {
        self.status == "completed" && self.conclusion.as_deref() == Some("success")
    }
}

/// Contents of a CI evaluator artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangedPaths {
    #[serde(default)]
    pub rebuilds: Vec<String>,
    /// Systems this artifact covers; empty means all.
    #[serde(default)]
    pub systems: Vec<String>,
}

/// An issue comment, for the `comments` subcommand.
#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub user: CommentUser,
    pub body: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentUser {
    pub login: String,
}

/// Resolve the API token: explicit config value, then `GITHUB_TOKEN`, then
/// the output of `GITHUB_TOKEN_CMD`.
pub async fn resolve_token(
    runner: &ProcessRunner,
    configured: Option<&str>,
) -> Result<Option<String>> {
    if let Some(token) = configured {
        return Ok(Some(token.to_string()));
    }
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        if !token.trim().is_empty() {
            return Ok(Some(token.trim().to_string()));
        }
    }
    if let Ok(cmd) = std::env::var("GITHUB_TOKEN_CMD") {
        let out = runner
            .run(Cmd::new("sh").arg("-c").arg(&cmd))
            .await
            .map_err(|e| GithubError::TokenCommand(e.to_string()))?;
        let token = out.stdout_trimmed().to_string();
        if token.is_empty() {
            return Err(GithubError::TokenCommand(
                "command produced no output".to_string(),
            ));
        }
        return Ok(Some(token));
    }
    Ok(None)
}

/// Extract `owner/repo` from a GitHub remote URL.
pub fn parse_remote_slug(remote: &str) -> Result<(String, String)> {
    let trimmed = remote
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .trim_end_matches('/');
    let rest = trimmed
        .split_once("github.com")
        .map(|(_, rest)| rest.trim_start_matches([':', '/']))
        .ok_or_else(|| GithubError::BadRemote(remote.to_string()))?;
    match rest.split('/').collect::<Vec<_>>()[..] {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(GithubError::BadRemote(remote.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(remote: &str, token: Option<String>) -> Result<Self> {
        let (owner, repo) = parse_remote_slug(remote)?;
        Ok(Self {
            http: reqwest::Client::new(),
            api: "https://api.github.com".to_string(),
            owner,
            repo,
            token,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("nixpkgs-review"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/{path}", self.api, self.owner, self.repo)
    }

    async fn request(&self, method: Method, url: &str, body: Option<serde_json::Value>) -> Result<Response> {
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            let mut builder: RequestBuilder =
                self.http.request(method.clone(), url).headers(self.headers());
            if let Some(body) = &body {
                builder = builder.json(body);
            }
            let response = builder.send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }
            if let Some(reset_in) = rate_limit_reset(&response) {
                if reset_in <= MAX_RATELIMIT_WAIT && attempt < MAX_ATTEMPTS {
                    warn!(url, reset_in = reset_in.as_secs(), "rate limited, waiting");
                    tokio::time::sleep(reset_in).await;
                    continue;
                }
                return Err(GithubError::RateLimited {
                    reset_in: reset_in.as_secs(),
                });
            }
            if status.is_server_error() && attempt < MAX_ATTEMPTS {
                warn!(url, status = status.as_u16(), attempt, "server error, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }

            let message = response.text().await.unwrap_or_default();
            return Err(GithubError::Remote {
                status: status.as_u16(),
                url: url.to_string(),
                message: truncate(&message, 200),
                suggestion: suggestion_for(status, self.token.is_some()),
            });
        }
        unreachable!("request loop always returns")
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.request(Method::GET, url, None).await?;
        response
            .json()
            .await
            .map_err(|e| GithubError::InvalidResponse(e.to_string()))
    }

    /// `GET /repos/{owner}/{repo}/pulls/{number}`
    pub async fn pull_request(&self, number: u64) -> Result<PrSpec> {
        #[derive(Deserialize)]
        struct Pull {
            title: String,
            #[serde(default)]
            body: Option<String>,
            base: Base,
            head: Head,
        }
        #[derive(Deserialize)]
        struct Base {
            #[serde(rename = "ref")]
            base_ref: String,
        }
        #[derive(Deserialize)]
        struct Head {
            sha: String,
        }

        let pull: Pull = self.get_json(&self.url(&format!("pulls/{number}"))).await?;
        info!(number, title = %pull.title, "fetched pull request");
        Ok(PrSpec {
            number,
            base_ref: pull.base.base_ref,
            head_sha: pull.head.sha,
            title: pull.title,
            body: pull.body.unwrap_or_default(),
        })
    }

    /// `GET /repos/{owner}/{repo}/commits/{sha}/check-runs`
    pub async fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>> {
        #[derive(Deserialize)]
        struct CheckRuns {
            check_runs: Vec<CheckRun>,
        }
        let runs: CheckRuns = self
            .get_json(&self.url(&format!("commits/{sha}/check-runs")))
            .await?;
        debug!(sha, count = runs.check_runs.len(), "fetched check runs");
        Ok(runs.check_runs)
    }

    /// Download an artifact (zip) from an absolute URL, following redirects.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.request(Method::GET, url, None).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// `POST /repos/{owner}/{repo}/issues/{number}/comments`
    pub async fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        self.request(
            Method::POST,
            &self.url(&format!("issues/{number}/comments")),
            Some(serde_json::json!({ "body": body })),
        )
        .await?;
        info!(number, "posted review comment");
        Ok(())
    }

    /// `GET /repos/{owner}/{repo}/issues/{number}/comments`
    pub async fn comments(&self, number: u64) -> Result<Vec<Comment>> {
        self.get_json(&self.url(&format!("issues/{number}/comments")))
            .await
    }

    /// `POST /repos/{owner}/{repo}/pulls/{number}/reviews` with APPROVE.
    pub async fn approve(&self, number: u64, body: &str) -> Result<()> {
        self.request(
            Method::POST,
            &self.url(&format!("pulls/{number}/reviews")),
            Some(serde_json::json!({ "event": "APPROVE", "body": body })),
        )
        .await?;
        info!(number, "approved pull request");
        Ok(())
    }

    /// `PUT /repos/{owner}/{repo}/pulls/{number}/merge`
    pub async fn merge(&self, number: u64) -> Result<()> {
        self.request(
            Method::PUT,
            &self.url(&format!("pulls/{number}/merge")),
            Some(serde_json::json!({})),
        )
        .await?;
        info!(number, "merged pull request");
        Ok(())
    }
}

/// Unpack `changed-paths.json` from a CI artifact zip.
pub fn changed_paths_from_zip(bytes: &[u8]) -> Result<ChangedPaths> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|e| GithubError::BadArtifact(e.to_string()))?;
    let mut file = archive
        .by_name("changed-paths.json")
        .map_err(|e| GithubError::BadArtifact(format!("changed-paths.json: {e}")))?;
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| GithubError::BadArtifact(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| GithubError::BadArtifact(e.to_string()))
}

fn rate_limit_reset(response: &Response) -> Option<Duration> {
    let headers = response.headers();
    if response.status() != StatusCode::FORBIDDEN
        && response.status() != StatusCode::TOO_MANY_REQUESTS
    {
        return None;
    }
    if let Some(retry_after) = headers.get("retry-after") {
        let seconds: u64 = retry_after.to_str().ok()?.parse().ok()?;
        return Some(Duration::from_secs(seconds));
    }
    let remaining: u64 = headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .parse()
        .ok()?;
    if remaining > 0 {
        return None;
    }
    let reset: u64 = headers.get("x-ratelimit-reset")?.to_str().ok()?.parse().ok()?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs();
    Some(Duration::from_secs(reset.saturating_sub(now).max(1)))
}

fn suggestion_for(status: StatusCode, has_token: bool) -> String {
    match status {
        StatusCode::UNAUTHORIZED => "\n  → set GITHUB_TOKEN or GITHUB_TOKEN_CMD".to_string(),
        StatusCode::FORBIDDEN if !has_token => {
            "\n  → unauthenticated requests are heavily rate limited; set GITHUB_TOKEN".to_string()
        }
        StatusCode::NOT_FOUND => "\n  → check the PR number and remote".to_string(),
        _ => String::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max).collect::<String>())
    }
}
