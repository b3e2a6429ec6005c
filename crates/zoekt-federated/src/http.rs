// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! JSON over HTTP implementations of the index client and archive searcher.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::{
    ArchiveFileMatch, ArchiveSearchRequest, ArchiveSearchResult, ArchiveSearcher, IndexCatalog,
    IndexClient, IndexSearchOptions, IndexSearchResult, OnMatches, RepoListEntry,
};
use crate::context::SearchContext;
use crate::error::BackendError;
use crate::query::Q;

/// Map a non-success HTTP status to a backend error.
pub fn status_error(status: StatusCode, body: &str) -> BackendError {
    let msg = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout(msg),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE => BackendError::Temporary(msg),
        _ => BackendError::Other(msg),
    }
}

async fn check(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Pick the endpoint serving `key`. The choice only depends on the key and
/// the endpoint list, so a repository at a commit keeps hitting the same
/// searcher and its archive cache.
pub fn endpoint_for<'a>(endpoints: &'a [String], key: &str) -> Option<&'a str> {
    if endpoints.is_empty() {
        return None;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let idx = (u64::from_be_bytes(head) % endpoints.len() as u64) as usize;
    Some(endpoints[idx].as_str())
}

#[derive(Serialize)]
struct IndexSearchBody<'a> {
    query: &'a Q,
    opts: &'a IndexSearchOptions,
}

#[derive(Serialize)]
struct IndexListBody<'a> {
    query: &'a Q,
}

/// Index engine reached over HTTP.
#[derive(Clone, Debug)]
pub struct HttpIndexClient {
    client: Client,
    base: String,
}

impl HttpIndexClient {
    pub fn new(client: Client, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { client, base }
    }
}

#[async_trait]
impl IndexClient for HttpIndexClient {
    async fn list_indexed(&self, ctx: &SearchContext) -> Result<IndexCatalog, BackendError> {
        let url = format!("{}/api/indexed", self.base);
        ctx.run(async {
            let resp = check(self.client.get(&url).send().await?).await?;
            Ok::<_, BackendError>(resp.json::<IndexCatalog>().await?)
        })
        .await?
    }

    async fn search(
        &self,
        ctx: &SearchContext,
        q: &Q,
        opts: &IndexSearchOptions,
    ) -> Result<IndexSearchResult, BackendError> {
        let url = format!("{}/api/search", self.base);
        tracing::debug!(query = %q, max_wall_time_ms = opts.max_wall_time.as_millis() as u64, "index search");
        ctx.run(async {
            let resp = self
                .client
                .post(&url)
                .json(&IndexSearchBody { query: q, opts })
                .send()
                .await?;
            Ok::<_, BackendError>(check(resp).await?.json::<IndexSearchResult>().await?)
        })
        .await?
    }

    async fn list(&self, ctx: &SearchContext, q: &Q) -> Result<Vec<RepoListEntry>, BackendError> {
        let url = format!("{}/api/list", self.base);
        ctx.run(async {
            let resp = self
                .client
                .post(&url)
                .json(&IndexListBody { query: q })
                .send()
                .await?;
            Ok::<_, BackendError>(check(resp).await?.json::<Vec<RepoListEntry>>().await?)
        })
        .await?
    }
}

#[derive(Serialize)]
struct ArchiveSearchBody<'a> {
    #[serde(flatten)]
    req: &'a ArchiveSearchRequest,
    fetch_timeout_ms: u64,
    stream: bool,
}

/// One line of a streamed archive search response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StreamLine {
    Matches(Vec<ArchiveFileMatch>),
    Done { limit_hit: bool },
    Error(String),
}

/// Archive searcher reached over HTTP. Requests for a repository are routed
/// to one of the live endpoints by [`endpoint_for`].
#[derive(Clone, Debug, Default)]
pub struct HttpArchiveSearcher {
    client: Client,
}

impl HttpArchiveSearcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn search_streaming(
        &self,
        resp: Response,
        on_matches: OnMatches<'_>,
    ) -> Result<ArchiveSearchResult, BackendError> {
        let mut resp = resp;
        let mut buf: Vec<u8> = Vec::new();
        let mut limit_hit = false;
        let mut handle = |line: &[u8]| -> Result<(), BackendError> {
            if line.iter().all(u8::is_ascii_whitespace) {
                return Ok(());
            }
            let parsed: StreamLine = serde_json::from_slice(line)
                .map_err(|e| BackendError::Other(format!("bad stream line: {}", e)))?;
            match parsed {
                StreamLine::Matches(m) => on_matches(m),
                StreamLine::Done { limit_hit: l } => limit_hit = l,
                StreamLine::Error(e) => return Err(BackendError::Other(e)),
            }
            Ok(())
        };
        while let Some(chunk) = resp.chunk().await? {
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                handle(&line)?;
            }
        }
        handle(&buf)?;
        Ok(ArchiveSearchResult {
            matches: Vec::new(),
            limit_hit,
        })
    }
}

#[async_trait]
impl ArchiveSearcher for HttpArchiveSearcher {
    async fn search(
        &self,
        ctx: &SearchContext,
        req: &ArchiveSearchRequest,
        on_matches: Option<OnMatches<'_>>,
    ) -> Result<ArchiveSearchResult, BackendError> {
        let key = format!("{}@{}", req.repo.name, req.commit);
        let endpoint = endpoint_for(&req.endpoints, &key)
            .ok_or_else(|| BackendError::Temporary("no searcher endpoints".into()))?;
        let url = format!("{}/search", endpoint.trim_end_matches('/'));
        let body = ArchiveSearchBody {
            req,
            fetch_timeout_ms: req.fetch_timeout.as_millis() as u64,
            stream: on_matches.is_some(),
        };

        ctx.run(async {
            let resp = check(self.client.post(&url).json(&body).send().await?).await?;
            match on_matches {
                Some(cb) => self.search_streaming(resp, cb).await,
                None => Ok(resp.json::<ArchiveSearchResult>().await?),
            }
        })
        .await?
    }
}
