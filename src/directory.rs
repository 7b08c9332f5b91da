//! HTTP implementation of the source directory port.
//!
//! Talks to a JSON membership API: one endpoint checks source existence, one
//! opens a listing, one follows a continuation token. Transport faults are
//! mapped onto the engine's fault classes here, so the retry layer never has
//! to inspect reqwest errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use groupsync_common::{
    ContinuationToken, MembershipPage, SourceDirectory, SourceRef, SyncError,
};

#[derive(Debug, Clone)]
pub struct HttpDirectoryConfig {
    /// Base URL of the membership API, without a trailing slash.
    pub base_url: String,
    /// Bearer token, when the API requires one.
    pub token: Option<String>,
}

pub struct HttpSourceDirectory {
    client: reqwest::Client,
    config: HttpDirectoryConfig,
}

#[derive(Serialize)]
struct SourceBody<'a> {
    source: &'a SourceRef,
}

#[derive(Serialize)]
struct TokenBody<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

impl HttpSourceDirectory {
    pub fn new(config: HttpDirectoryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/membership/{}", self.config.base_url, path)
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SyncError> {
        let url = self.endpoint(path);
        debug!(%url, "directory call");

        let mut request = self.client.post(&url).json(body);
        if let Some(ref token) = self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::UpstreamHttp {
                status: status.as_u16(),
                message: truncate(&message, 200),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| anyhow::anyhow!("directory response did not parse: {}", e).into())
    }
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout {
            what: "directory".into(),
            millis: 0,
        }
    } else if err.is_connect() {
        SyncError::Connection(err.to_string())
    } else {
        SyncError::Unclassified(anyhow::anyhow!(err))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[async_trait]
impl SourceDirectory for HttpSourceDirectory {
    async fn exists(&self, source: &SourceRef) -> Result<bool, SyncError> {
        let response: ExistsResponse = self.post("exists", &SourceBody { source }).await?;
        Ok(response.exists)
    }

    async fn first_page(&self, source: &SourceRef) -> Result<MembershipPage, SyncError> {
        self.post("query", &SourceBody { source }).await
    }

    async fn next_page(&self, token: &ContinuationToken) -> Result<MembershipPage, SyncError> {
        let result: Result<MembershipPage, SyncError> = self
            .post(
                "continue",
                &TokenBody {
                    token: token.as_str(),
                },
            )
            .await;
        // A rejected token is a semantic fault of its own kind, not a
        // generic 4xx.
        match result {
            Err(SyncError::UpstreamHttp { status: 400, message }) => {
                Err(SyncError::MalformedToken(message))
            }
            other => other,
        }
    }
}
