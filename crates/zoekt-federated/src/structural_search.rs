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

//! Structural search.
//!
//! The index cannot evaluate structural patterns, only an approximate regex
//! of them. Indexed repositories are probed with that regex and only the
//! repositories it matches are handed to the structural matcher behind the
//! archive searcher. With `index:only` the approximate index results are
//! returned directly.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::time::Instant;

use crate::aggregate::{Aggregator, SearchResultsCommon};
use crate::backend::{Backends, IndexClient, IndexFileMatch};
use crate::config::FederationConfig;
use crate::context::SearchContext;
use crate::error::SearchError;
use crate::indexed::{decouple_deadline, index_line_matches, index_search_options, result_count_factor};
use crate::partition::{partition, IndexedRepoRevs};
use crate::query::{build_repos_only_query, build_structural_query, handle_file_path_patterns};
use crate::stream::{RepoStatus, SearchEvent, Sender, Stats};
use crate::types::{
    File, FileMatch, GlobalSearchMode, Match, PatternInfo, RepoName, RepositoryRevisions,
    TextParameters,
};
use crate::unindexed::{call_searcher_over_repos, SearcherParameters};

/// Files found by [`search_head_only_files`].
#[derive(Debug, Clone, Default)]
pub struct HeadOnlyResult {
    pub files: Vec<FileMatch>,
    pub limit_hit: bool,
    /// Repositories with files or lines that were cut off.
    pub repos_limit_hit: BTreeSet<String>,
}

/// Indexed repositories containing at least one match of the approximate
/// structural regex.
pub async fn success_repos(
    ctx: &SearchContext,
    client: &dyn IndexClient,
    info: &PatternInfo,
    indexed: &IndexedRepoRevs,
) -> Result<Vec<RepoName>, SearchError> {
    if indexed.is_empty() {
        return Ok(Vec::new());
    }
    let q = build_repos_only_query(
        info,
        &indexed.repo_branches,
        handle_file_path_patterns(info)?,
        true,
    )?;
    let listed = client.list(ctx, &q).await?;
    let repos: Vec<RepoName> = listed
        .iter()
        .filter_map(|r| indexed.get_by_name(&r.name))
        .cloned()
        .collect();
    tracing::debug!(probed = indexed.len(), matched = repos.len(), "structural probe");
    Ok(repos)
}

fn head_file_match(file: &IndexFileMatch, repo: RepoName) -> FileMatch {
    FileMatch {
        file: File {
            repo,
            commit_id: file.version.clone(),
            input_rev: None,
            path: file.file_name.clone(),
        },
        line_matches: index_line_matches(file),
        limit_hit: false,
    }
}

/// Index-only structural search at the default branch.
///
/// A cheap short-circuit query runs first. Its results are approximate and
/// reported as limit hit; the exhaustive query only runs when the first one
/// found few files or the caller asked for a specific result count.
pub async fn search_head_only_files(
    ctx: &SearchContext,
    client: &dyn IndexClient,
    cfg: &FederationConfig,
    info: &PatternInfo,
    indexed: &IndexedRepoRevs,
    use_full_deadline: bool,
) -> Result<HeadOnlyResult, SearchError> {
    if indexed.is_empty() {
        return Ok(HeadOnlyResult::default());
    }

    let k = result_count_factor(
        indexed.len(),
        info.file_match_limit,
        false,
        cfg.default_max_search_results,
    );
    let mut opts = index_search_options(k, info.file_match_limit, cfg);
    let (ctx, _guard) = if use_full_deadline {
        decouple_deadline(ctx, &mut opts)?
    } else {
        (ctx.clone(), None)
    };

    let paths = handle_file_path_patterns(info)?;
    let t0 = Instant::now();
    let q = build_structural_query(info, &indexed.repo_branches, paths.clone(), true)?;
    let mut resp = client.search(&ctx, &q, &opts).await?;
    if resp.files.is_empty() && t0.elapsed() >= opts.max_wall_time {
        return Err(SearchError::NoResultsInTimeout);
    }

    // Short-circuit results are approximate.
    let mut limit_hit = true;
    if resp.file_count < cfg.short_circuit_file_threshold
        || info.file_match_limit != cfg.default_max_search_results
    {
        let q = build_structural_query(info, &indexed.repo_branches, paths, false)?;
        resp = client.search(&ctx, &q, &opts).await?;
        if resp.files.is_empty() && t0.elapsed() >= opts.max_wall_time {
            return Err(SearchError::NoResultsInTimeout);
        }
        limit_hit = resp.limit_hit();
    }

    if resp.files.is_empty() {
        return Ok(HeadOnlyResult::default());
    }

    let mut repos_limit_hit = BTreeSet::new();
    if limit_hit {
        repos_limit_hit.extend(resp.files.iter().map(|f| f.repository.clone()));
    }
    let mut files = resp.files;
    if files.len() > info.file_match_limit {
        limit_hit = true;
        for f in files.drain(info.file_match_limit..) {
            repos_limit_hit.insert(f.repository);
        }
    }

    let max_line_matches = cfg.max_line_matches_base + k;
    let files = files
        .iter()
        .map(|f| {
            let repo = indexed
                .get_by_name(&f.repository)
                .cloned()
                .unwrap_or_else(|| RepoName::new(f.repository_id, f.repository.clone()));
            let mut fm = head_file_match(f, repo);
            if fm.truncate_lines(max_line_matches) {
                limit_hit = true;
                repos_limit_hit.insert(f.repository.clone());
            }
            fm
        })
        .collect();

    Ok(HeadOnlyResult {
        files,
        limit_hit,
        repos_limit_hit,
    })
}

/// Structural search over `args.repos`.
pub async fn search_files_in_repos_structural(
    ctx: &SearchContext,
    backends: &Backends,
    cfg: &FederationConfig,
    args: &TextParameters,
) -> Result<(Vec<FileMatch>, SearchResultsCommon), SearchError> {
    let info = &args.pattern;
    let index = backends
        .index
        .as_ref()
        .filter(|_| args.mode != GlobalSearchMode::SearcherOnly);
    let catalog = match index {
        Some(client) => Some(client.list_indexed(ctx).await?),
        None => None,
    };
    let part = partition(
        &args.repos,
        info,
        catalog.as_ref(),
        cfg.max_unindexed_repo_rev_searches,
    )?;

    let k = result_count_factor(
        args.repos.len(),
        info.file_match_limit,
        false,
        cfg.default_max_search_results,
    );
    let search_ctx = ctx.child();
    let agg = Arc::new(Aggregator::new(
        search_ctx.clone(),
        info.file_match_limit,
        cfg.max_line_matches_base + k,
    ));
    agg.add_missing(&part.missing);

    let indexed_ids: Vec<_> = part.indexed.repos().map(|r| r.id).collect();

    if part.disable_unindexed() {
        if let Some(client) = index {
            let res = search_head_only_files(
                &search_ctx,
                client.as_ref(),
                cfg,
                info,
                &part.indexed,
                args.use_full_deadline,
            )
            .await?;
            agg.add_stats(&Stats {
                is_limit_hit: res.limit_hit,
                status: Stats::with_status(indexed_ids, RepoStatus::SEARCHED | RepoStatus::INDEXED)
                    .status,
            });
            if !res.repos_limit_hit.is_empty() {
                agg.add_partial(res.repos_limit_hit);
            }
            agg.add_matches(res.files.into_iter().map(Match::File).collect());
        }
        return Ok(collect_files(&agg));
    }

    let probed = match index {
        Some(client) if !part.indexed.is_empty() => {
            success_repos(&search_ctx, client.as_ref(), info, &part.indexed).await?
        }
        _ => Vec::new(),
    };
    // Every indexed repository was searched by the probe.
    agg.add_stats(&Stats::with_status(
        indexed_ids,
        RepoStatus::SEARCHED | RepoStatus::INDEXED,
    ));
    // Probed repositories are searched at the revisions the caller asked for.
    let probed: Vec<RepositoryRevisions> = probed
        .iter()
        .filter_map(|r| part.indexed.repo_revs.get(&r.name).cloned())
        .collect();
    agg.add_repos(part.unindexed.iter().chain(&probed).map(|rr| &rr.repo));

    let searcher_args = SearcherParameters {
        use_full_deadline: args.use_full_deadline,
        ..SearcherParameters::new(info.clone())
    };
    let sender: Arc<dyn Sender> = agg.clone();
    let unindexed = call_searcher_over_repos(
        &search_ctx,
        backends,
        cfg,
        &searcher_args,
        &part.unindexed,
        sender.clone(),
        false,
    );
    let indexed = call_searcher_over_repos(
        &search_ctx,
        backends,
        cfg,
        &searcher_args,
        &probed,
        sender,
        true,
    );

    let res = tokio::try_join!(unindexed, indexed);
    search_ctx.cancel();
    match res {
        Ok(_) => {}
        Err(e) if e.is_canceled() && agg.limit_hit() => {}
        Err(e) => return Err(e),
    }
    Ok(collect_files(&agg))
}

fn collect_files(agg: &Aggregator) -> (Vec<FileMatch>, SearchResultsCommon) {
    let (matches, common) = agg.finish();
    let files = matches
        .into_iter()
        .filter_map(|m| match m {
            Match::File(fm) => Some(fm),
            Match::Repo(_) => None,
        })
        .collect();
    (files, common)
}

/// Stream a structural search: results arrive in one event once the search
/// completes.
pub async fn stream_structural_search(
    ctx: &SearchContext,
    backends: &Backends,
    cfg: &FederationConfig,
    args: &TextParameters,
    sender: &dyn Sender,
) -> Result<(), SearchError> {
    let (files, common) = search_files_in_repos_structural(ctx, backends, cfg, args).await?;
    sender.send(SearchEvent {
        results: files.into_iter().map(Match::File).collect(),
        stats: Stats {
            is_limit_hit: common.limit_hit,
            status: common.status,
        },
    });
    Ok(())
}
