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

//! Collaborator boundary: the index engine, the per-archive searcher, the
//! revision resolver and the searcher endpoint map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::SearchContext;
use crate::error::BackendError;
use crate::query::Q;
use crate::types::{LineMatch, PatternInfo, RepoId, RepoName, RepositoryRevisions};

/// A branch as recorded in the index, with the commit it was indexed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedBranch {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedRepository {
    pub id: RepoId,
    pub name: String,
    /// By convention the first branch is the default branch.
    pub branches: Vec<IndexedBranch>,
}

/// The set of repositories currently served by the index engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCatalog {
    pub repos: Vec<IndexedRepository>,
}

impl IndexCatalog {
    pub fn by_name(&self) -> HashMap<&str, &IndexedRepository> {
        self.repos.iter().map(|r| (r.name.as_str(), r)).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.repos.iter().any(|r| r.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSearchOptions {
    pub shard_max_match_count: usize,
    pub total_max_match_count: usize,
    pub shard_max_important_match: usize,
    pub total_max_important_match: usize,
    pub max_doc_display_count: usize,
    pub max_wall_time: Duration,
}

/// Byte range of a match within [`IndexLineMatch::line`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineFragment {
    pub line_offset: usize,
    pub match_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLineMatch {
    pub line: String,
    /// 1-based.
    pub line_number: i32,
    /// True when this "line" is the file name matching.
    #[serde(default)]
    pub file_name: bool,
    pub line_fragments: Vec<LineFragment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexFileMatch {
    pub repository: String,
    pub repository_id: RepoId,
    pub file_name: String,
    /// Commit the file was indexed at.
    pub version: String,
    pub branches: Vec<String>,
    pub line_matches: Vec<IndexLineMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSearchResult {
    pub files: Vec<IndexFileMatch>,
    pub file_count: usize,
    pub match_count: usize,
    pub files_skipped: usize,
    pub shards_skipped: usize,
}

impl IndexSearchResult {
    /// The engine gave up on part of the corpus.
    pub fn limit_hit(&self) -> bool {
        self.files_skipped + self.shards_skipped > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoListEntry {
    pub id: RepoId,
    pub name: String,
}

/// Trigram index engine.
#[async_trait]
pub trait IndexClient: Send + Sync {
    async fn list_indexed(&self, ctx: &SearchContext) -> Result<IndexCatalog, BackendError>;

    async fn search(
        &self,
        ctx: &SearchContext,
        q: &Q,
        opts: &IndexSearchOptions,
    ) -> Result<IndexSearchResult, BackendError>;

    /// Repositories containing at least one match of `q`.
    async fn list(&self, ctx: &SearchContext, q: &Q) -> Result<Vec<RepoListEntry>, BackendError>;

    /// Streaming search. Engines without native streaming deliver one event.
    async fn stream_search(
        &self,
        ctx: &SearchContext,
        q: &Q,
        opts: &IndexSearchOptions,
        on_event: &(dyn Fn(IndexSearchResult) + Send + Sync),
    ) -> Result<(), BackendError> {
        let res = self.search(ctx, q, opts).await?;
        on_event(res);
        Ok(())
    }
}

/// One content search against one repository archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSearchRequest {
    pub endpoints: Vec<String>,
    pub repo: RepoName,
    pub rev: String,
    pub commit: String,
    /// Whether the repository is also served by the index; lets the
    /// searcher reuse indexer state.
    pub indexed: bool,
    pub pattern: PatternInfo,
    pub fetch_timeout: Duration,
    pub indexer_endpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFileMatch {
    pub path: String,
    /// Offsets are already rune based.
    pub line_matches: Vec<LineMatch>,
    #[serde(default)]
    pub limit_hit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSearchResult {
    pub matches: Vec<ArchiveFileMatch>,
    pub limit_hit: bool,
}

pub type OnMatches<'a> = &'a (dyn Fn(Vec<ArchiveFileMatch>) + Send + Sync);

/// Fetch-and-grep backend for repositories the index does not serve.
#[async_trait]
pub trait ArchiveSearcher: Send + Sync {
    /// When `on_matches` is set, matches are delivered through it as they are
    /// found and the returned result carries only the limit flag.
    async fn search(
        &self,
        ctx: &SearchContext,
        req: &ArchiveSearchRequest,
        on_matches: Option<OnMatches<'_>>,
    ) -> Result<ArchiveSearchResult, BackendError>;
}

#[async_trait]
pub trait RevisionResolver: Send + Sync {
    /// Pin `rev` (empty for the default branch) to a commit id.
    async fn resolve_revision(
        &self,
        ctx: &SearchContext,
        repo: &RepoName,
        rev: &str,
    ) -> Result<String, BackendError>;

    /// Concrete revisions to search, ref globs expanded. Resolvers that
    /// cannot list refs keep the explicit revisions only.
    async fn expand_ref_globs(
        &self,
        _ctx: &SearchContext,
        repo_revs: &RepositoryRevisions,
    ) -> Result<Vec<String>, BackendError> {
        Ok(repo_revs.rev_specs())
    }
}

/// Resolver that leaves pinning to the archive searcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

#[async_trait]
impl RevisionResolver for PassthroughResolver {
    async fn resolve_revision(
        &self,
        _ctx: &SearchContext,
        _repo: &RepoName,
        rev: &str,
    ) -> Result<String, BackendError> {
        if rev.is_empty() {
            Ok("HEAD".to_string())
        } else {
            Ok(rev.to_string())
        }
    }
}

/// Live archive searcher endpoints.
pub trait EndpointMap: Send + Sync {
    fn endpoints(&self) -> Result<Vec<String>, BackendError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints(pub Vec<String>);

impl EndpointMap for StaticEndpoints {
    fn endpoints(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.0.clone())
    }
}

/// Everything a search needs to reach its collaborators.
#[derive(Clone)]
pub struct Backends {
    /// `None` when indexed search is disabled.
    pub index: Option<Arc<dyn IndexClient>>,
    pub searcher: Arc<dyn ArchiveSearcher>,
    pub resolver: Arc<dyn RevisionResolver>,
    pub endpoints: Arc<dyn EndpointMap>,
    pub indexer_endpoints: Vec<String>,
}

impl Backends {
    pub fn new(searcher: Arc<dyn ArchiveSearcher>, endpoints: Arc<dyn EndpointMap>) -> Self {
        Self {
            index: None,
            searcher,
            resolver: Arc::new(PassthroughResolver),
            endpoints,
            indexer_endpoints: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: Arc<dyn IndexClient>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn RevisionResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}
