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

//! Fan-out of content searches over repositories the index does not serve.
//!
//! Every repository revision becomes one task on a [`JoinSet`], admitted by
//! the process-wide [`TEXT_SEARCH_LIMITER`]. A task's failure is turned into
//! a per-repository status when it is transient; the first other failure
//! becomes the error of the whole fan-out and cancels the remaining tasks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::backend::{ArchiveFileMatch, ArchiveSearchRequest, Backends};
use crate::config::FederationConfig;
use crate::context::SearchContext;
use crate::error::{BackendError, SearchError};
use crate::limiter::TEXT_SEARCH_LIMITER;
use crate::stream::{RepoStatus, SearchEvent, Sender, Stats};
use crate::types::{
    File, FileMatch, Match, PatternInfo, RepoId, RepoName, RepositoryRevisions, RevisionSpecifier,
};

#[derive(Debug, Clone)]
pub struct SearcherParameters {
    pub pattern: Arc<PatternInfo>,
    /// Give every archive fetch the whole remaining deadline.
    pub use_full_deadline: bool,
    /// Use the searcher's streaming interface. Streamed matches are still
    /// released per repository, once that repository succeeded.
    pub stream_matches: bool,
}

impl SearcherParameters {
    pub fn new(pattern: PatternInfo) -> Self {
        Self {
            pattern: Arc::new(pattern),
            use_full_deadline: false,
            stream_matches: true,
        }
    }
}

/// Per-archive fetch timeout. A single repository (or a caller that asked
/// for the full deadline) gets whatever time is left; otherwise each fetch is
/// capped so one slow repository cannot eat the others' share.
pub fn fetch_timeout(
    ctx: &SearchContext,
    num_repos: usize,
    use_full_deadline: bool,
    cfg: &FederationConfig,
) -> Duration {
    if num_repos == 1 || use_full_deadline {
        ctx.remaining().unwrap_or(cfg.no_deadline_fetch_timeout)
    } else {
        cfg.many_repos_fetch_timeout
    }
}

/// Classify the outcome of searching one repository.
///
/// Returns the stats to report and, for errors that should fail the query,
/// the error itself.
pub fn handle_repo_search_result(
    repo_id: RepoId,
    revs: &[String],
    limit_hit: bool,
    timed_out: bool,
    err: Option<BackendError>,
) -> (Stats, Option<BackendError>) {
    let mut status = RepoStatus::empty();
    if limit_hit {
        status |= RepoStatus::LIMIT_HIT;
    }

    let mut fatal = None;
    match err {
        Some(BackendError::CloneInProgress(_)) => status |= RepoStatus::CLONING,
        Some(BackendError::RepoNotFound(_)) | Some(BackendError::NotFound(_)) => {
            status |= RepoStatus::MISSING
        }
        Some(e @ BackendError::RevisionNotFound { .. }) => {
            // No explicit revision: the repository is empty.
            let default_rev = revs.is_empty() || (revs.len() == 1 && revs[0].is_empty());
            if !default_rev {
                fatal = Some(e);
            }
        }
        Some(BackendError::Timeout(_)) | Some(BackendError::Temporary(_)) => {
            status |= RepoStatus::TIMEDOUT
        }
        Some(e) => fatal = Some(e),
        None if timed_out => status |= RepoStatus::TIMEDOUT,
        None => status |= RepoStatus::SEARCHED,
    }

    let mut stats = Stats {
        is_limit_hit: limit_hit,
        ..Default::default()
    };
    if !status.is_empty() {
        stats.status.update(repo_id, status);
    }
    (stats, fatal)
}

pub(crate) fn to_matches(
    repo: &RepoName,
    commit: &str,
    rev: &str,
    archive_matches: Vec<ArchiveFileMatch>,
) -> Vec<Match> {
    archive_matches
        .into_iter()
        .map(|fm| {
            Match::File(FileMatch {
                file: File {
                    repo: repo.clone(),
                    commit_id: commit.to_string(),
                    input_rev: Some(rev.to_string()),
                    path: fm.path,
                },
                line_matches: fm.line_matches,
                limit_hit: fm.limit_hit,
            })
        })
        .collect()
}

/// Whether `repo` satisfies the query's "repository must (not) contain a file
/// matching" constraints. Each pattern costs one single-result probe.
async fn repo_should_be_searched(
    ctx: &SearchContext,
    backends: &Backends,
    info: &PatternInfo,
    repo: &RepoName,
    commit: &str,
    fetch_timeout: Duration,
) -> Result<bool, BackendError> {
    for (patterns, include) in [
        (&info.file_patterns_repos_must_include, true),
        (&info.file_patterns_repos_must_exclude, false),
    ] {
        for pattern in patterns {
            let probe = PatternInfo {
                pattern: String::new(),
                is_regexp: true,
                file_match_limit: 1,
                include_patterns: vec![pattern.clone()],
                path_patterns_are_case_sensitive: false,
                pattern_matches_content: true,
                pattern_matches_path: true,
                ..Default::default()
            };
            let req = ArchiveSearchRequest {
                endpoints: backends.endpoints.endpoints()?,
                repo: repo.clone(),
                rev: String::new(),
                commit: commit.to_string(),
                indexed: false,
                pattern: probe,
                fetch_timeout,
                indexer_endpoints: Vec::new(),
            };
            let res = backends.searcher.search(ctx, &req, None).await?;
            let has_file = !res.matches.is_empty();
            if has_file != include {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Search one revision of one repository archive.
///
/// When `stream` is set matches are forwarded through it as they arrive and
/// the returned list only holds what the searcher returned at the end.
#[allow(clippy::too_many_arguments)]
pub async fn search_files_in_repo(
    ctx: &SearchContext,
    backends: &Backends,
    repo: &RepoName,
    rev: &str,
    indexed: bool,
    info: &PatternInfo,
    fetch_timeout: Duration,
    stream: Option<&dyn Sender>,
) -> Result<(Vec<Match>, bool), BackendError> {
    let commit = backends.resolver.resolve_revision(ctx, repo, rev).await?;

    if info.has_repo_file_constraints()
        && !repo_should_be_searched(ctx, backends, info, repo, &commit, fetch_timeout).await?
    {
        tracing::debug!(repo = %repo.name, "repository excluded by file constraints");
        return Ok((Vec::new(), false));
    }

    let indexer_endpoints = if info.is_structural_pat {
        backends.indexer_endpoints.clone()
    } else {
        Vec::new()
    };

    let req = ArchiveSearchRequest {
        endpoints: backends.endpoints.endpoints()?,
        repo: repo.clone(),
        rev: rev.to_string(),
        commit: commit.clone(),
        indexed,
        pattern: info.clone(),
        fetch_timeout,
        indexer_endpoints,
    };

    let on_matches = |found: Vec<ArchiveFileMatch>| {
        if let Some(stream) = stream {
            stream.send(SearchEvent {
                results: to_matches(repo, &commit, rev, found),
                stats: Stats::default(),
            });
        }
    };
    let res = backends
        .searcher
        .search(
            ctx,
            &req,
            stream.map(|_| &on_matches as &(dyn Fn(Vec<ArchiveFileMatch>) + Send + Sync)),
        )
        .await?;
    Ok((to_matches(repo, &commit, rev, res.matches), res.limit_hit))
}

/// Holds the matches one repository streamed until its search is known to
/// have succeeded.
#[derive(Default)]
struct RepoBuffer {
    matches: Mutex<Vec<Match>>,
}

impl Sender for RepoBuffer {
    fn send(&self, event: SearchEvent) {
        self.matches.lock().extend(event.results);
    }
}

/// Search every revision of `repos` with the archive searcher, streaming
/// results and per-repository status to `sender`.
pub async fn call_searcher_over_repos(
    ctx: &SearchContext,
    backends: &Backends,
    cfg: &FederationConfig,
    args: &SearcherParameters,
    repos: &[RepositoryRevisions],
    sender: Arc<dyn Sender>,
    indexed: bool,
) -> Result<(), SearchError> {
    let fetch_timeout = fetch_timeout(ctx, repos.len(), args.use_full_deadline, cfg);
    tracing::debug!(
        fetch_timeout_ms = fetch_timeout.as_millis() as u64,
        repos = repos.len(),
        "calling searcher over repos"
    );
    if repos.is_empty() {
        return Ok(());
    }

    // The number of searcher endpoints changes over time.
    let endpoints = backends.endpoints.endpoints()?;
    if endpoints.is_empty() {
        return Err(SearchError::NoEndpoints);
    }
    TEXT_SEARCH_LIMITER.set_limit(endpoints.len() * cfg.limiter_slots_per_endpoint);

    let group = ctx.child();
    let first_err: Arc<Mutex<Option<SearchError>>> = Arc::new(Mutex::new(None));
    let mut tasks = JoinSet::new();

    'dispatch: for rr in repos {
        let revs = match backends.resolver.expand_ref_globs(&group, rr).await {
            Ok(revs) => revs,
            Err(e) if e.is_canceled() => break 'dispatch,
            Err(e) => {
                record_first_error(&first_err, &group, rr.to_string(), e);
                break 'dispatch;
            }
        };
        if revs.is_empty() {
            // Only ref globs, none of which the resolver could expand.
            tracing::debug!(repo = %rr.repo.name, "no revisions to search");
            send_if_live(
                &first_err,
                &group,
                sender.as_ref(),
                SearchEvent {
                    results: Vec::new(),
                    stats: Stats::with_status([rr.repo.id], RepoStatus::MISSING),
                },
            );
            continue;
        }

        for rev in revs {
            // Only fails once the group is cancelled.
            let Ok(permit) = TEXT_SEARCH_LIMITER.acquire(&group).await else {
                break 'dispatch;
            };

            let group = group.clone();
            let backends = backends.clone();
            let pattern = Arc::clone(&args.pattern);
            let sender = Arc::clone(&sender);
            let first_err = Arc::clone(&first_err);
            let repo = rr.repo.clone();
            let stream_matches = args.stream_matches;
            let span = tracing::debug_span!(parent: ctx.span(), "search_repo", repo = %repo.name, rev = %rev);

            tasks.spawn(
                async move {
                    let _permit = permit;
                    let buffer = RepoBuffer::default();
                    let stream = stream_matches.then_some(&buffer as &dyn Sender);
                    let res = search_files_in_repo(
                        &group,
                        &backends,
                        &repo,
                        &rev,
                        indexed,
                        &pattern,
                        fetch_timeout,
                        stream,
                    )
                    .await;

                    let (matches, limit_hit, err) = match res {
                        Ok((m, l)) => (m, l, None),
                        Err(e) => {
                            tracing::warn!(
                                repo = %repo.name,
                                error = %e,
                                timeout = e.is_timeout(),
                                temporary = e.is_temporary(),
                                "archive search failed"
                            );
                            (Vec::new(), false, Some(e))
                        }
                    };
                    if group.is_canceled() {
                        return;
                    }

                    let (stats, fatal) =
                        handle_repo_search_result(repo.id, &[rev.clone()], limit_hit, false, err);
                    match fatal {
                        Some(e) if e.is_canceled() => {}
                        Some(e) => {
                            let repo_rev =
                                RepositoryRevisions::new(repo, vec![RevisionSpecifier::rev(rev)]);
                            record_first_error(&first_err, &group, repo_rev.to_string(), e);
                        }
                        None => {
                            let mut results = std::mem::take(&mut *buffer.matches.lock());
                            results.extend(matches);
                            send_if_live(
                                &first_err,
                                &group,
                                sender.as_ref(),
                                SearchEvent { results, stats },
                            );
                        }
                    }
                }
                .instrument(span),
            );
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::warn!(error = %e, "repository search task panicked");
            }
        }
    }

    let err = first_err.lock().take();
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Send `event` unless the fan-out already failed. The error slot stays
/// locked while sending so no event lands after the first error.
fn send_if_live(
    slot: &Mutex<Option<SearchError>>,
    group: &SearchContext,
    sender: &dyn Sender,
    event: SearchEvent,
) {
    let slot = slot.lock();
    if slot.is_none() && !group.is_canceled() {
        sender.send(event);
    }
}

fn record_first_error(
    slot: &Mutex<Option<SearchError>>,
    group: &SearchContext,
    repo_rev: String,
    source: BackendError,
) {
    let mut slot = slot.lock();
    if slot.is_none() {
        tracing::debug!(repo_rev = %repo_rev, error = %source, "first fatal error, cancelling sibling searches");
        *slot = Some(SearchError::Repo { repo_rev, source });
        group.cancel();
    }
}
