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

//! Streamed search output: per-repository status, stats, and the sinks that
//! consume [`SearchEvent`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context::SearchContext;
use crate::types::{Match, RepoId};

/// Bit set of outcomes for one repository.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoStatus(u8);

impl RepoStatus {
    pub const SEARCHED: RepoStatus = RepoStatus(1);
    pub const INDEXED: RepoStatus = RepoStatus(1 << 1);
    pub const CLONING: RepoStatus = RepoStatus(1 << 2);
    pub const MISSING: RepoStatus = RepoStatus(1 << 3);
    pub const LIMIT_HIT: RepoStatus = RepoStatus(1 << 4);
    pub const TIMEDOUT: RepoStatus = RepoStatus(1 << 5);

    const NAMES: [(RepoStatus, &'static str); 6] = [
        (RepoStatus::SEARCHED, "searched"),
        (RepoStatus::INDEXED, "indexed"),
        (RepoStatus::CLONING, "cloning"),
        (RepoStatus::MISSING, "missing"),
        (RepoStatus::LIMIT_HIT, "limitHit"),
        (RepoStatus::TIMEDOUT, "timedout"),
    ];

    pub fn empty() -> Self {
        RepoStatus(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: RepoStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: RepoStatus) -> bool {
        self.0 & other.0 != 0
    }

    /// A repository that timed out or is missing is never reported as
    /// searched as well.
    fn normalize(self) -> Self {
        if self.intersects(RepoStatus::MISSING | RepoStatus::TIMEDOUT) {
            RepoStatus(self.0 & !RepoStatus::SEARCHED.0)
        } else {
            self
        }
    }
}

impl BitOr for RepoStatus {
    type Output = RepoStatus;

    fn bitor(self, rhs: RepoStatus) -> RepoStatus {
        RepoStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for RepoStatus {
    fn bitor_assign(&mut self, rhs: RepoStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = RepoStatus::NAMES
            .iter()
            .filter(|(s, _)| self.contains(*s))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

impl fmt::Debug for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoStatus({})", self)
    }
}

/// Accumulated status per repository. Updates only ever add bits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatusMap {
    m: BTreeMap<RepoId, RepoStatus>,
}

impl RepoStatusMap {
    pub fn update(&mut self, id: RepoId, status: RepoStatus) {
        let entry = self.m.entry(id).or_default();
        *entry = (*entry | status).normalize();
    }

    pub fn get(&self, id: RepoId) -> RepoStatus {
        self.m.get(&id).copied().unwrap_or_default()
    }

    pub fn merge(&mut self, other: &RepoStatusMap) {
        for (id, status) in &other.m {
            self.update(*id, *status);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RepoId, RepoStatus)> + '_ {
        self.m.iter().map(|(id, s)| (*id, *s))
    }

    /// Ids of repositories carrying every bit of `mask`.
    pub fn filter(&self, mask: RepoStatus) -> Vec<RepoId> {
        self.iter()
            .filter(|(_, s)| s.contains(mask))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn count(&self, mask: RepoStatus) -> usize {
        self.m.values().filter(|s| s.contains(mask)).count()
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub is_limit_hit: bool,
    pub status: RepoStatusMap,
}

impl Stats {
    /// Stats marking every repository in `ids` with `status`.
    pub fn with_status(ids: impl IntoIterator<Item = RepoId>, status: RepoStatus) -> Self {
        let mut stats = Stats::default();
        for id in ids {
            stats.status.update(id, status);
        }
        stats
    }

    pub fn update(&mut self, other: &Stats) {
        self.is_limit_hit |= other.is_limit_hit;
        self.status.merge(&other.status);
    }

    pub fn is_zero(&self) -> bool {
        !self.is_limit_hit && self.status.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEvent {
    pub results: Vec<Match>,
    pub stats: Stats,
}

impl SearchEvent {
    pub fn stats_only(stats: Stats) -> Self {
        Self {
            results: Vec::new(),
            stats,
        }
    }
}

/// Push side of a result stream. Called concurrently from many tasks.
pub trait Sender: Send + Sync {
    fn send(&self, event: SearchEvent);
}

impl<T: Sender + ?Sized> Sender for Arc<T> {
    fn send(&self, event: SearchEvent) {
        (**self).send(event)
    }
}

/// Adapts a closure into a [`Sender`].
pub struct StreamFunc<F>(pub F);

impl<F> Sender for StreamFunc<F>
where
    F: Fn(SearchEvent) + Send + Sync,
{
    fn send(&self, event: SearchEvent) {
        (self.0)(event)
    }
}

/// Collects everything it is sent.
#[derive(Debug, Default)]
pub struct AggregatingStream {
    inner: Mutex<SearchEvent>,
}

impl AggregatingStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<Match> {
        self.inner.lock().results.clone()
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().stats.clone()
    }

    pub fn into_event(self) -> SearchEvent {
        self.inner.into_inner()
    }
}

impl Sender for AggregatingStream {
    fn send(&self, event: SearchEvent) {
        let mut inner = self.inner.lock();
        inner.results.extend(event.results);
        inner.stats.update(&event.stats);
    }
}

/// Outcome of offering `n` results to a [`ResultBudget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// How many of the offered results may be kept.
    pub take: usize,
    /// True the first time the running total goes past the limit.
    pub crossed: bool,
}

/// Running total of accepted results against a limit. Once the total goes
/// past the limit nothing further is admitted.
#[derive(Debug, Clone)]
pub struct ResultBudget {
    limit: usize,
    accepted: usize,
    exhausted: bool,
}

impl ResultBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            accepted: 0,
            exhausted: false,
        }
    }

    pub fn offer(&mut self, n: usize) -> Admission {
        if self.exhausted {
            return Admission {
                take: 0,
                crossed: false,
            };
        }
        let total = self.accepted + n;
        if total > self.limit {
            let take = self.limit - self.accepted;
            self.accepted = self.limit;
            self.exhausted = true;
            return Admission { take, crossed: true };
        }
        self.accepted = total;
        Admission {
            take: n,
            crossed: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }
}

/// Forwards to a parent sender until more than `limit` results went through,
/// then cancels its context. Later events keep their stats but lose their
/// results.
pub struct LimitStream {
    parent: Arc<dyn Sender>,
    ctx: SearchContext,
    budget: Mutex<ResultBudget>,
}

impl LimitStream {
    pub fn limit_hit(&self) -> bool {
        self.budget.lock().is_exhausted()
    }
}

impl Sender for LimitStream {
    fn send(&self, mut event: SearchEvent) {
        let admission = {
            let mut budget = self.budget.lock();
            if budget.is_exhausted() {
                event.results.clear();
                event.stats.is_limit_hit = true;
                None
            } else {
                Some(budget.offer(event.results.len()))
            }
        };
        if let Some(adm) = admission {
            if adm.crossed {
                event.results.truncate(adm.take);
                event.stats.is_limit_hit = true;
                tracing::debug!(accepted = adm.take, "result limit reached, cancelling search");
                self.ctx.cancel();
            }
        }
        if event.results.is_empty() && event.stats.is_zero() {
            return;
        }
        self.parent.send(event);
    }
}

/// Wrap `parent` so the derived context is cancelled once more than `limit`
/// results have been sent.
pub fn with_limit(
    ctx: &SearchContext,
    parent: Arc<dyn Sender>,
    limit: usize,
) -> (SearchContext, Arc<LimitStream>) {
    let child = ctx.child();
    let stream = Arc::new(LimitStream {
        parent,
        ctx: child.clone(),
        budget: Mutex::new(ResultBudget::new(limit)),
    });
    (child, stream)
}
