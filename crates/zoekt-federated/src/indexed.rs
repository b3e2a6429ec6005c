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

//! Requests against the index engine: tuning, deadline handling and the
//! translation of index matches into [`Match`]es.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::Instant;
use tokio_util::sync::DropGuard;

use crate::backend::{Backends, IndexClient, IndexFileMatch, IndexSearchOptions, IndexSearchResult};
use crate::config::FederationConfig;
use crate::context::SearchContext;
use crate::error::{ContextError, SearchError};
use crate::partition::{partition, IndexedRepoRevs, Partition};
use crate::query::{global_query, query_to_index_query, RepoOptions, Q};
use crate::stream::{RepoStatus, SearchEvent, Sender, Stats};
use crate::types::{
    File, FileMatch, GlobalSearchMode, LineMatch, Match, RepoMatch, RepoName, RepositoryRevisions,
    SelectKind, TextParameters,
};

/// How many more matches than usual to ask the index for. Searches over few
/// repositories get more exhaustive results.
pub fn result_count_factor(num_repos: usize, file_match_limit: usize, global: bool, default_limit: usize) -> usize {
    let mut k = if global {
        1
    } else {
        match num_repos {
            0..=5 => 100,
            6..=10 => 10,
            11..=25 => 8,
            26..=50 => 5,
            51..=100 => 3,
            101..=500 => 2,
            _ => 1,
        }
    };
    if file_match_limit > default_limit {
        k = k * 3 * file_match_limit / default_limit;
    }
    k
}

pub fn index_search_options(k: usize, file_match_limit: usize, cfg: &FederationConfig) -> IndexSearchOptions {
    let default_limit = cfg.default_max_search_results;
    let mut opts = IndexSearchOptions {
        shard_max_match_count: 100 * k,
        total_max_match_count: 100 * k,
        shard_max_important_match: 15 * k,
        total_max_important_match: 25 * k,
        // Extra documents let us populate per-repository limit status.
        max_doc_display_count: file_match_limit + 2000,
        max_wall_time: cfg.index_max_wall_time,
    };
    if file_match_limit > default_limit {
        opts.max_doc_display_count = file_match_limit;
        let factor = (3 * file_match_limit / default_limit) as u32;
        opts.max_wall_time = cfg.index_max_wall_time * factor;
    }
    opts.max_doc_display_count = opts.max_doc_display_count.max(2000);
    opts
}

/// Let the index engine use the whole remaining deadline as its own wall
/// time, and detach the request from the deadline so partial results found
/// just before it are still delivered.
pub(crate) fn decouple_deadline(
    ctx: &SearchContext,
    opts: &mut IndexSearchOptions,
) -> Result<(SearchContext, Option<DropGuard>), SearchError> {
    let Some(deadline) = ctx.deadline() else {
        return Ok((ctx.clone(), None));
    };
    let now = Instant::now();
    if now >= deadline {
        return Err(ContextError::DeadlineExceeded.into());
    }
    opts.max_wall_time = deadline - now;
    let (detached, guard) = ctx.without_deadline();
    Ok((detached, Some(guard)))
}

/// Convert index line matches: file-name pseudo lines are dropped, byte
/// offsets become rune offsets and line numbers become 0-based.
pub fn index_line_matches(file: &IndexFileMatch) -> Vec<LineMatch> {
    file.line_matches
        .iter()
        .filter(|l| !l.file_name)
        .map(|l| {
            // Offsets past the line or inside a character snap back to the
            // previous character boundary.
            let runes = |end: usize| {
                let mut end = end.min(l.line.len());
                while !l.line.is_char_boundary(end) {
                    end -= 1;
                }
                l.line[..end].chars().count()
            };
            let offset_and_lengths = l
                .line_fragments
                .iter()
                .map(|m| {
                    let start = runes(m.line_offset);
                    let end = runes(m.line_offset + m.match_length);
                    [start as i32, end.saturating_sub(start) as i32]
                })
                .collect();
            LineMatch {
                preview: l.line.clone(),
                line_number: l.line_number - 1,
                offset_and_lengths,
            }
        })
        .collect()
}

/// Translate one index event and send it. `repo_input_revs` names the
/// repository of a file and the caller revisions it was found at.
pub fn send_matches(
    event: IndexSearchResult,
    sender: &dyn Sender,
    repo_input_revs: impl Fn(&IndexFileMatch) -> (RepoName, Vec<String>),
) {
    let limit_hit = event.limit_hit();
    let stats = Stats {
        is_limit_hit: limit_hit,
        ..Default::default()
    };
    if event.files.is_empty() {
        sender.send(SearchEvent::stats_only(stats));
        return;
    }

    let mut matches = Vec::with_capacity(event.files.len());
    for file in &event.files {
        let (repo, input_revs) = repo_input_revs(file);
        let lines = index_line_matches(file);
        for rev in input_revs {
            matches.push(Match::File(FileMatch {
                file: File {
                    repo: repo.clone(),
                    commit_id: file.version.clone(),
                    input_rev: Some(rev),
                    path: file.file_name.clone(),
                },
                line_matches: lines.clone(),
                limit_hit: false,
            }));
        }
    }
    sender.send(SearchEvent {
        results: matches,
        stats,
    });
}

/// Report every repository in `repos` as missing.
pub fn missing_repo_rev_status(sender: &dyn Sender, repos: &[RepoName]) {
    if repos.is_empty() {
        return;
    }
    sender.send(SearchEvent::stats_only(Stats::with_status(
        repos.iter().map(|r| r.id),
        RepoStatus::MISSING,
    )));
}

/// Search over every indexed repository; no partitioning involved.
#[derive(Debug, Clone)]
pub struct UniverseRequest {
    pub query: Q,
    pub repo_options: RepoOptions,
    pub user_private_repos: Vec<RepoName>,
    pub file_match_limit: usize,
    pub select: SelectKind,
}

/// Search over an explicit set of repositories, of which the index serves a
/// subset.
#[derive(Debug, Clone)]
pub struct SubsetRequest {
    pub partition: Partition,
    /// `None` when nothing is left for the index to search.
    pub query: Option<Q>,
    pub file_match_limit: usize,
    pub select: SelectKind,
}

#[derive(Debug, Clone)]
pub enum IndexedSearchRequest {
    Universe(UniverseRequest),
    Subset(SubsetRequest),
}

impl IndexedSearchRequest {
    pub async fn new(
        ctx: &SearchContext,
        backends: &Backends,
        cfg: &FederationConfig,
        args: &TextParameters,
    ) -> Result<Self, SearchError> {
        let info = &args.pattern;
        if args.mode == GlobalSearchMode::IndexedUniverse && backends.index.is_some() {
            return Ok(IndexedSearchRequest::Universe(UniverseRequest {
                query: query_to_index_query(info)?,
                repo_options: args.repo_options.clone(),
                user_private_repos: args.user_private_repos.clone(),
                file_match_limit: info.file_match_limit,
                select: info.select,
            }));
        }

        let catalog = match (&backends.index, args.mode) {
            (Some(client), m) if m != GlobalSearchMode::SearcherOnly => {
                Some(client.list_indexed(ctx).await?)
            }
            _ => None,
        };
        let partition = partition(
            &args.repos,
            info,
            catalog.as_ref(),
            cfg.max_unindexed_repo_rev_searches,
        )?;
        let query = if partition.indexed.is_empty() {
            None
        } else {
            Some(query_to_index_query(info)?)
        };
        Ok(IndexedSearchRequest::Subset(SubsetRequest {
            partition,
            query,
            file_match_limit: info.file_match_limit,
            select: info.select,
        }))
    }

    pub fn unindexed_repos(&self) -> &[RepositoryRevisions] {
        match self {
            IndexedSearchRequest::Universe(_) => &[],
            IndexedSearchRequest::Subset(s) => &s.partition.unindexed,
        }
    }

    pub fn missing(&self) -> &[RepoName] {
        match self {
            IndexedSearchRequest::Universe(_) => &[],
            IndexedSearchRequest::Subset(s) => &s.partition.missing,
        }
    }

    pub fn indexed_repos(&self) -> Option<&IndexedRepoRevs> {
        match self {
            IndexedSearchRequest::Universe(_) => None,
            IndexedSearchRequest::Subset(s) => Some(&s.partition.indexed),
        }
    }

    pub async fn search(
        &self,
        ctx: &SearchContext,
        client: &dyn IndexClient,
        cfg: &FederationConfig,
        sender: &dyn Sender,
    ) -> Result<(), SearchError> {
        match self {
            IndexedSearchRequest::Universe(u) => universe_search(ctx, client, cfg, u, sender).await,
            IndexedSearchRequest::Subset(s) => subset_search(ctx, client, cfg, s, sender).await,
        }
    }
}

async fn universe_search(
    ctx: &SearchContext,
    client: &dyn IndexClient,
    cfg: &FederationConfig,
    req: &UniverseRequest,
    sender: &dyn Sender,
) -> Result<(), SearchError> {
    let q = global_query(req.query.clone(), &req.repo_options, &req.user_private_repos);
    let k = result_count_factor(0, req.file_match_limit, true, cfg.default_max_search_results);
    let mut opts = index_search_options(k, req.file_match_limit, cfg);
    let (ctx, _guard) = decouple_deadline(ctx, &mut opts)?;

    if req.select == SelectKind::Repo {
        let repos = client.list(&ctx, &q).await?;
        let results = repos
            .into_iter()
            .map(|r| {
                Match::Repo(RepoMatch {
                    name: r.name,
                    id: r.id,
                    rev: None,
                })
            })
            .collect();
        sender.send(SearchEvent {
            results,
            stats: Stats::default(),
        });
        return Ok(());
    }

    client
        .stream_search(&ctx, &q, &opts, &|event| {
            send_matches(event, sender, |file| {
                (
                    RepoName::new(file.repository_id, file.repository.clone()),
                    vec![String::new()],
                )
            })
        })
        .await?;
    Ok(())
}

async fn subset_search(
    ctx: &SearchContext,
    client: &dyn IndexClient,
    cfg: &FederationConfig,
    req: &SubsetRequest,
    sender: &dyn Sender,
) -> Result<(), SearchError> {
    let indexed = &req.partition.indexed;
    let Some(query) = req.query.as_ref().filter(|_| !indexed.is_empty()) else {
        return Ok(());
    };

    let final_q = Q::and(vec![Q::repo_branches(indexed.repo_branches.clone()), query.clone()]);
    let k = result_count_factor(indexed.len(), req.file_match_limit, false, cfg.default_max_search_results);
    let mut opts = index_search_options(k, req.file_match_limit, cfg);
    let t0 = Instant::now();
    let (ctx, _guard) = decouple_deadline(ctx, &mut opts)?;

    if req.select == SelectKind::Repo {
        let listed = client.list(&ctx, &final_q).await?;
        let results = listed
            .into_iter()
            .filter_map(|r| indexed.get_by_id(r.id))
            .map(|r| {
                Match::Repo(RepoMatch {
                    name: r.name.clone(),
                    id: r.id,
                    rev: None,
                })
            })
            .collect();
        sender.send(SearchEvent {
            results,
            stats: Stats::default(),
        });
        return Ok(());
    }

    let found_results = AtomicBool::new(false);
    client
        .stream_search(&ctx, &final_q, &opts, &|event| {
            if event.file_count != 0 || event.match_count != 0 || !event.files.is_empty() {
                found_results.store(true, Ordering::SeqCst);
            }
            send_matches(event, sender, |file| {
                let mut input_revs = indexed.input_revs(&file.repository, &file.branches);
                if input_revs.is_empty() {
                    // Unexpected, but the indexed commit still yields correct links.
                    input_revs.push(file.version.clone());
                }
                let repo = indexed
                    .get_by_name(&file.repository)
                    .cloned()
                    .unwrap_or_else(|| RepoName::new(file.repository_id, file.repository.clone()));
                (repo, input_revs)
            })
        })
        .await?;

    if !found_results.load(Ordering::SeqCst) && t0.elapsed() >= opts.max_wall_time {
        tracing::debug!(repos = indexed.len(), "index search timed out without results");
        sender.send(SearchEvent::stats_only(Stats::with_status(
            indexed.repos().map(|r| r.id),
            RepoStatus::TIMEDOUT,
        )));
    }
    Ok(())
}
