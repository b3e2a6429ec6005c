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

//! Plain text search over a set of repositories: the index serves what it
//! can, the archive searcher fans out over the rest.

use std::cmp::Reverse;
use std::sync::Arc;

use crate::backend::Backends;
use crate::config::FederationConfig;
use crate::context::SearchContext;
use crate::error::SearchError;
use crate::indexed::{missing_repo_rev_status, result_count_factor, IndexedSearchRequest};
use crate::stream::{with_limit, AggregatingStream, SearchEvent, Sender, Stats};
use crate::types::{FileMatch, GlobalSearchMode, Match, TextParameters};
use crate::unindexed::{call_searcher_over_repos, SearcherParameters};

/// Sorts every batch by descending URI and caps the line matches per file
/// before handing it on.
struct OrderedBatches {
    inner: Arc<dyn Sender>,
    max_line_matches: usize,
}

impl Sender for OrderedBatches {
    fn send(&self, mut event: SearchEvent) {
        for m in event.results.iter_mut() {
            if let Match::File(fm) = m {
                event.stats.is_limit_hit |= fm.truncate_lines(self.max_line_matches);
            }
        }
        event.results.sort_by_key(|m| Reverse(m.uri()));
        self.inner.send(event);
    }
}

/// Search `args.repos` for `args.pattern`, streaming results to `stream`.
///
/// Indexed and unindexed searches run concurrently under one result limit;
/// the first error of either cancels the other.
pub async fn search_files_in_repos(
    ctx: &SearchContext,
    backends: &Backends,
    cfg: &FederationConfig,
    args: &TextParameters,
    stream: Arc<dyn Sender>,
) -> Result<(), SearchError> {
    let request = IndexedSearchRequest::new(ctx, backends, cfg, args).await?;

    let (ctx, stream) = with_limit(ctx, stream, args.pattern.file_match_limit);
    missing_repo_rev_status(stream.as_ref(), request.missing());

    let k = result_count_factor(
        args.repos.len(),
        args.pattern.file_match_limit,
        matches!(request, IndexedSearchRequest::Universe(_)),
        cfg.default_max_search_results,
    );
    let ordered: Arc<dyn Sender> = Arc::new(OrderedBatches {
        inner: stream.clone(),
        max_line_matches: cfg.max_line_matches_base + k,
    });

    let indexed = async {
        match &backends.index {
            Some(client) if args.mode != GlobalSearchMode::SearcherOnly => {
                request.search(&ctx, client.as_ref(), cfg, ordered.as_ref()).await
            }
            _ => Ok(()),
        }
    };

    let searcher_args = SearcherParameters {
        use_full_deadline: args.use_full_deadline,
        ..SearcherParameters::new(args.pattern.clone())
    };
    let unindexed = call_searcher_over_repos(
        &ctx,
        backends,
        cfg,
        &searcher_args,
        request.unindexed_repos(),
        ordered.clone(),
        false,
    );

    let res = tokio::try_join!(indexed, unindexed);
    ctx.cancel();
    match res {
        Ok(_) => Ok(()),
        // Hitting the result limit cancels whatever is still running.
        Err(e) if e.is_canceled() && stream.limit_hit() => Ok(()),
        Err(e) => Err(e),
    }
}

/// [`search_files_in_repos`], collected.
pub async fn search_files_in_repos_batch(
    ctx: &SearchContext,
    backends: &Backends,
    cfg: &FederationConfig,
    args: &TextParameters,
) -> Result<(Vec<FileMatch>, Stats), SearchError> {
    let agg = Arc::new(AggregatingStream::new());
    search_files_in_repos(ctx, backends, cfg, args, agg.clone()).await?;

    let files = agg
        .results()
        .into_iter()
        .filter_map(|m| m.as_file().cloned())
        .collect();
    Ok((files, agg.stats()))
}
