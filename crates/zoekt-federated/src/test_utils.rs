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

//! Test utilities: environment guards, test logging and in-memory fakes of
//! the index engine, archive searcher and revision resolver.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tracing_subscriber::EnvFilter;

use crate::backend::{
    ArchiveFileMatch, ArchiveSearchRequest, ArchiveSearchResult, ArchiveSearcher, Backends,
    IndexCatalog, IndexClient, IndexFileMatch, IndexLineMatch, IndexSearchOptions,
    IndexSearchResult, IndexedBranch, IndexedRepository, LineFragment, OnMatches, RepoListEntry,
    RevisionResolver, StaticEndpoints,
};
use crate::context::SearchContext;
use crate::error::BackendError;
use crate::query::Q;
use crate::types::{LineMatch, RepoId, RepoName, RepositoryRevisions, RevisionSpecifier};

/// Test helper to manage environment variables and ensure proper cleanup
pub struct EnvGuard {
    original_values: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            original_values: HashMap::new(),
        }
    }

    pub fn save_and_clear(&mut self, vars: &[&str]) {
        for &var in vars {
            let original = std::env::var(var).ok();
            self.original_values.insert(var.to_string(), original);
            std::env::remove_var(var);
        }
    }

    pub fn set(&self, var: &str, value: &str) {
        std::env::set_var(var, value);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (var, original_value) in &self.original_values {
            match original_value {
                Some(value) => std::env::set_var(var, value),
                None => std::env::remove_var(var),
            }
        }
    }
}

impl Default for EnvGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize tracing only once for tests so logs are visible when running
/// `cargo test -- --nocapture`. Respects RUST_LOG when set.
pub fn init_test_logging() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

pub fn repo(id: RepoId, name: &str) -> RepoName {
    RepoName::new(id, name)
}

/// `name` at the given revisions; no revisions means the default branch.
pub fn repo_revs(id: RepoId, name: &str, revs: &[&str]) -> RepositoryRevisions {
    RepositoryRevisions::new(
        repo(id, name),
        revs.iter().map(|r| RevisionSpecifier::rev(*r)).collect(),
    )
}

/// Catalog entry; `branches` are `(name, commit)` pairs.
pub fn indexed_repo(id: RepoId, name: &str, branches: &[(&str, &str)]) -> IndexedRepository {
    IndexedRepository {
        id,
        name: name.to_string(),
        branches: branches
            .iter()
            .map(|(b, v)| IndexedBranch {
                name: b.to_string(),
                version: v.to_string(),
            })
            .collect(),
    }
}

/// Catalog of repositories indexed at `HEAD` only.
pub fn head_catalog(repos: &[(RepoId, &str)]) -> IndexCatalog {
    IndexCatalog {
        repos: repos
            .iter()
            .map(|(id, name)| indexed_repo(*id, name, &[("HEAD", "c0ffee")]))
            .collect(),
    }
}

/// Index file match with one fragment per `(line_number, line, offset, len)`.
pub fn index_file(
    repo: &str,
    id: RepoId,
    path: &str,
    lines: &[(i32, &str, usize, usize)],
) -> IndexFileMatch {
    IndexFileMatch {
        repository: repo.to_string(),
        repository_id: id,
        file_name: path.to_string(),
        version: "c0ffee".to_string(),
        branches: vec!["HEAD".to_string()],
        line_matches: lines
            .iter()
            .map(|(n, line, off, len)| IndexLineMatch {
                line: line.to_string(),
                line_number: *n,
                file_name: false,
                line_fragments: vec![LineFragment {
                    line_offset: *off,
                    match_length: *len,
                }],
            })
            .collect(),
    }
}

/// Archive match with `lines` single-line matches.
pub fn archive_file(path: &str, lines: usize) -> ArchiveFileMatch {
    ArchiveFileMatch {
        path: path.to_string(),
        line_matches: (0..lines)
            .map(|i| LineMatch {
                preview: format!("line {}", i),
                line_number: i as i32,
                offset_and_lengths: vec![[0, 4]],
            })
            .collect(),
        limit_hit: false,
    }
}

/// In-memory index engine. Searches answer from a queue of canned results
/// (an empty result once the queue is drained).
#[derive(Default)]
pub struct FakeIndexClient {
    catalog: IndexCatalog,
    responses: Mutex<VecDeque<IndexSearchResult>>,
    listed: Vec<RepoListEntry>,
    delay: Option<Duration>,
    pub queries: Mutex<Vec<String>>,
    pub options: Mutex<Vec<IndexSearchOptions>>,
}

impl FakeIndexClient {
    pub fn new(catalog: IndexCatalog) -> Self {
        Self {
            catalog,
            ..Default::default()
        }
    }

    pub fn with_response(self, res: IndexSearchResult) -> Self {
        self.responses.lock().push_back(res);
        self
    }

    /// Repositories reported by `list`.
    pub fn with_listed(mut self, repos: &[(RepoId, &str)]) -> Self {
        self.listed = repos
            .iter()
            .map(|(id, name)| RepoListEntry {
                id: *id,
                name: name.to_string(),
            })
            .collect();
        self
    }

    /// Every search takes this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn query_log(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl IndexClient for FakeIndexClient {
    async fn list_indexed(&self, _ctx: &SearchContext) -> Result<IndexCatalog, BackendError> {
        Ok(self.catalog.clone())
    }

    async fn search(
        &self,
        ctx: &SearchContext,
        q: &Q,
        opts: &IndexSearchOptions,
    ) -> Result<IndexSearchResult, BackendError> {
        self.queries.lock().push(q.to_string());
        self.options.lock().push(opts.clone());
        if let Some(delay) = self.delay {
            ctx.run(tokio::time::sleep(delay)).await?;
        }
        Ok(self.responses.lock().pop_front().unwrap_or_default())
    }

    async fn list(&self, _ctx: &SearchContext, q: &Q) -> Result<Vec<RepoListEntry>, BackendError> {
        self.queries.lock().push(q.to_string());
        Ok(self.listed.clone())
    }
}

/// What the fake archive searcher does for one repository.
#[derive(Debug, Clone, Default)]
pub struct RepoBehavior {
    pub delay: Option<Duration>,
    pub error: Option<BackendError>,
    pub matches: Vec<ArchiveFileMatch>,
    /// Streamed before the delay and before any error.
    pub early_matches: Vec<ArchiveFileMatch>,
    pub limit_hit: bool,
    /// Paths answering "repository contains a file matching" probes.
    pub files: Vec<String>,
}

/// In-memory archive searcher keyed by repository name. Unknown
/// repositories have no matches.
#[derive(Default)]
pub struct FakeArchiveSearcher {
    repos: HashMap<String, RepoBehavior>,
    calls: Mutex<Vec<ArchiveSearchRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeArchiveSearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(mut self, name: &str, behavior: RepoBehavior) -> Self {
        self.repos.insert(name.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> Vec<ArchiveSearchRequest> {
        self.calls.lock().clone()
    }

    /// Highest number of searches observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn is_probe(req: &ArchiveSearchRequest) -> bool {
        req.pattern.pattern.is_empty()
            && req.pattern.file_match_limit == 1
            && !req.pattern.include_patterns.is_empty()
    }
}

#[async_trait]
impl ArchiveSearcher for FakeArchiveSearcher {
    async fn search(
        &self,
        ctx: &SearchContext,
        req: &ArchiveSearchRequest,
        on_matches: Option<OnMatches<'_>>,
    ) -> Result<ArchiveSearchResult, BackendError> {
        self.calls.lock().push(req.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let behavior = self.repos.get(&req.repo.name).cloned().unwrap_or_default();

        if Self::is_probe(req) {
            let re = Regex::new(&req.pattern.include_patterns[0])
                .map_err(|e| BackendError::Other(e.to_string()))?;
            let matches = behavior
                .files
                .iter()
                .filter(|f| re.is_match(f))
                .take(1)
                .map(|f| archive_file(f, 0))
                .collect();
            return Ok(ArchiveSearchResult {
                matches,
                limit_hit: false,
            });
        }

        if let (Some(cb), false) = (on_matches, behavior.early_matches.is_empty()) {
            cb(behavior.early_matches.clone());
        }
        if let Some(delay) = behavior.delay {
            ctx.run(tokio::time::sleep(delay)).await?;
        }
        if let Some(err) = behavior.error {
            return Err(err);
        }
        match on_matches {
            Some(cb) => {
                if !behavior.matches.is_empty() {
                    cb(behavior.matches);
                }
                Ok(ArchiveSearchResult {
                    matches: Vec::new(),
                    limit_hit: behavior.limit_hit,
                })
            }
            None => Ok(ArchiveSearchResult {
                matches: behavior.matches,
                limit_hit: behavior.limit_hit,
            }),
        }
    }
}

/// Resolver pinning every revision to a fixed commit, with optional
/// per-repository failures and ref glob expansions.
#[derive(Default)]
pub struct FakeResolver {
    errors: HashMap<String, BackendError>,
    globs: HashMap<String, Vec<String>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, repo: &str, err: BackendError) -> Self {
        self.errors.insert(repo.to_string(), err);
        self
    }

    /// Revisions a ref glob of `repo` expands to.
    pub fn with_glob_expansion(mut self, repo: &str, revs: &[&str]) -> Self {
        self.globs
            .insert(repo.to_string(), revs.iter().map(|r| r.to_string()).collect());
        self
    }
}

#[async_trait]
impl RevisionResolver for FakeResolver {
    async fn resolve_revision(
        &self,
        _ctx: &SearchContext,
        repo: &RepoName,
        rev: &str,
    ) -> Result<String, BackendError> {
        if let Some(err) = self.errors.get(&repo.name) {
            return Err(err.clone());
        }
        Ok(if rev.is_empty() {
            "c0ffee".to_string()
        } else {
            format!("{}-commit", rev)
        })
    }

    async fn expand_ref_globs(
        &self,
        _ctx: &SearchContext,
        repo_revs: &RepositoryRevisions,
    ) -> Result<Vec<String>, BackendError> {
        let mut revs = repo_revs.rev_specs();
        if repo_revs.has_ref_globs() {
            if let Some(expanded) = self.globs.get(&repo_revs.repo.name) {
                revs.extend(expanded.iter().cloned());
            }
        }
        Ok(revs)
    }
}

/// Backends over the given fakes with `endpoints` live searcher endpoints.
pub fn fake_backends(
    index: Option<Arc<FakeIndexClient>>,
    searcher: Arc<FakeArchiveSearcher>,
    endpoints: usize,
) -> Backends {
    let eps = (0..endpoints).map(|i| format!("http://searcher-{}", i)).collect();
    let backends = Backends::new(searcher, Arc::new(StaticEndpoints(eps)))
        .with_resolver(Arc::new(FakeResolver::new()));
    match index {
        Some(index) => backends.with_index(index),
        None => backends,
    }
}
