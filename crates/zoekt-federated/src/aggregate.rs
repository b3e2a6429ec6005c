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

//! Merges match batches from the index and the archive searcher into one
//! ordered, size-capped result.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use crate::context::SearchContext;
use crate::stream::{RepoStatus, RepoStatusMap, ResultBudget, SearchEvent, Sender, Stats};
use crate::types::{Match, RepoId, RepoName};

/// Metadata returned next to the matches of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchResultsCommon {
    pub limit_hit: bool,
    /// Repositories whose results were truncated.
    pub partial: BTreeSet<String>,
    /// Repositories that were not searched at all.
    pub missing: Vec<RepoName>,
    pub status: RepoStatusMap,
    pub result_count: usize,
}

impl SearchResultsCommon {
    pub fn searched(&self) -> Vec<RepoId> {
        self.status.filter(RepoStatus::SEARCHED)
    }

    pub fn timedout(&self) -> Vec<RepoId> {
        self.status.filter(RepoStatus::TIMEDOUT)
    }

    pub fn update(&mut self, other: &SearchResultsCommon) {
        self.limit_hit |= other.limit_hit;
        self.partial.extend(other.partial.iter().cloned());
        self.missing.extend(other.missing.iter().cloned());
        self.status.merge(&other.status);
        self.result_count += other.result_count;
    }
}

#[derive(Debug)]
struct State {
    matches: Vec<Match>,
    budget: ResultBudget,
    common: SearchResultsCommon,
    names: HashMap<RepoId, String>,
}

/// Thread-safe result accumulator.
///
/// Each batch is sorted by descending URI. Files with more than
/// `max_line_matches` line matches are truncated. Once more than `limit`
/// matches were offered the context is cancelled and later batches are
/// dropped.
#[derive(Debug)]
pub struct Aggregator {
    ctx: SearchContext,
    max_line_matches: usize,
    state: Mutex<State>,
}

impl Aggregator {
    pub fn new(ctx: SearchContext, limit: usize, max_line_matches: usize) -> Self {
        Self {
            ctx,
            max_line_matches,
            state: Mutex::new(State {
                matches: Vec::new(),
                budget: ResultBudget::new(limit),
                common: SearchResultsCommon::default(),
                names: HashMap::new(),
            }),
        }
    }

    /// Add one batch. Returns false if the batch was rejected because the
    /// limit had already been reached.
    pub fn add_matches(&self, mut batch: Vec<Match>) -> bool {
        if batch.is_empty() {
            return !self.state.lock().budget.is_exhausted();
        }

        let mut truncated = Vec::new();
        for m in batch.iter_mut() {
            if let Match::File(fm) = m {
                if fm.truncate_lines(self.max_line_matches) {
                    truncated.push(fm.file.repo.name.clone());
                }
            }
        }
        batch.sort_by_key(|m| std::cmp::Reverse(m.uri()));

        let mut st = self.state.lock();
        for m in &batch {
            st.names
                .entry(m.repo_id())
                .or_insert_with(|| m.repo_name().to_string());
        }
        if st.budget.is_exhausted() {
            return false;
        }
        if !truncated.is_empty() {
            st.common.limit_hit = true;
            st.common.partial.extend(truncated);
        }

        let admission = st.budget.offer(batch.len());
        if admission.crossed {
            let dropped = batch.split_off(admission.take);
            st.common
                .partial
                .extend(dropped.iter().map(|m| m.repo_name().to_string()));
            st.common.limit_hit = true;
            tracing::debug!(
                limit = st.budget.accepted(),
                "cancel due to result size"
            );
            self.ctx.cancel();
        }
        st.common.result_count += batch.len();
        st.matches.extend(batch);
        true
    }

    pub fn add_stats(&self, stats: &Stats) {
        let mut st = self.state.lock();
        st.common.limit_hit |= stats.is_limit_hit;
        st.common.status.merge(&stats.status);
    }

    /// Remember repository names so a limit hit reported only through stats
    /// can be listed as partial.
    pub fn add_repos<'a>(&self, repos: impl IntoIterator<Item = &'a RepoName>) {
        let mut st = self.state.lock();
        for r in repos {
            st.names.entry(r.id).or_insert_with(|| r.name.clone());
        }
    }

    /// Mark repositories as searched but truncated.
    pub fn add_partial(&self, repos: impl IntoIterator<Item = String>) {
        let mut st = self.state.lock();
        st.common.partial.extend(repos);
        st.common.limit_hit = true;
    }

    pub fn add_missing(&self, repos: &[RepoName]) {
        if repos.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        for r in repos {
            st.common.status.update(r.id, RepoStatus::MISSING);
        }
        st.common.missing.extend(repos.iter().cloned());
    }

    pub fn limit_hit(&self) -> bool {
        self.state.lock().common.limit_hit
    }

    /// Take everything accumulated so far. Senders still holding a
    /// reference only see an empty aggregator afterwards.
    pub fn finish(&self) -> (Vec<Match>, SearchResultsCommon) {
        let mut st = self.state.lock();
        let names = std::mem::take(&mut st.names);
        let mut common = std::mem::take(&mut st.common);
        for id in common.status.filter(RepoStatus::LIMIT_HIT) {
            if let Some(name) = names.get(&id) {
                common.partial.insert(name.clone());
            }
        }
        (std::mem::take(&mut st.matches), common)
    }
}

impl Sender for Aggregator {
    fn send(&self, event: SearchEvent) {
        self.add_stats(&event.stats);
        self.add_matches(event.results);
    }
}
