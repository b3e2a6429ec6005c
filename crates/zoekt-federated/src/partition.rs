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

//! Splits the requested repository revisions into the part the index engine
//! serves and the part that must be searched archive by archive.

use std::collections::BTreeMap;

use crate::backend::{IndexCatalog, IndexedRepository};
use crate::error::SearchError;
use crate::query::RepoBranches;
use crate::types::{
    IndexDirective, PatternInfo, RepoId, RepoName, RepositoryRevisions, RevisionSpecifier,
};

/// Repository revisions served by the index, keyed by repository name.
///
/// `repo_revs[name].revs[i]` is the caller's revision for
/// `repo_branches[name][i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedRepoRevs {
    pub repo_revs: BTreeMap<String, RepositoryRevisions>,
    pub repo_branches: RepoBranches,
}

impl IndexedRepoRevs {
    pub fn len(&self) -> usize {
        self.repo_revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repo_revs.is_empty()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&RepoName> {
        self.repo_revs.get(name).map(|rr| &rr.repo)
    }

    pub fn get_by_id(&self, id: RepoId) -> Option<&RepoName> {
        self.repo_revs
            .values()
            .map(|rr| &rr.repo)
            .find(|r| r.id == id)
    }

    pub fn repos(&self) -> impl Iterator<Item = &RepoName> {
        self.repo_revs.values().map(|rr| &rr.repo)
    }

    /// The caller's revisions for the branches a file was found on.
    pub fn input_revs(&self, repo: &str, branches: &[String]) -> Vec<String> {
        let (Some(rr), Some(indexed)) = (self.repo_revs.get(repo), self.repo_branches.get(repo))
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for branch in branches {
            for (i, b) in indexed.iter().enumerate() {
                if b == branch {
                    if let Some(rev) = rr.revs.get(i).and_then(RevisionSpecifier::rev_spec) {
                        out.push(rev.to_string());
                    }
                }
            }
        }
        out
    }

    /// Track the revisions of `rr` that `repo` has indexed; returns the rest.
    fn add(&mut self, rr: &RepositoryRevisions, repo: &IndexedRepository) -> Vec<RevisionSpecifier> {
        // A repository should appear once. Later duplicates are searched
        // unindexed.
        if self.repo_branches.contains_key(&rr.repo.name) {
            return rr.revs.clone();
        }
        if rr.has_ref_globs() {
            return rr.revs.clone();
        }

        let revs = if rr.revs.is_empty() {
            vec![RevisionSpecifier::default_branch()]
        } else {
            rr.revs.clone()
        };

        let mut branches = Vec::new();
        let mut indexed_revs = Vec::new();
        let mut unindexed = Vec::new();
        for rev in revs {
            let spec = rev.rev_spec().unwrap_or_default();
            match indexed_branch(repo, spec) {
                Some(branch) => {
                    branches.push(branch.to_string());
                    indexed_revs.push(rev);
                }
                None => unindexed.push(rev),
            }
        }

        if !indexed_revs.is_empty() {
            self.repo_revs
                .insert(rr.repo.name.clone(), rr.with_revs(indexed_revs));
            self.repo_branches.insert(rr.repo.name.clone(), branches);
        }
        unindexed
    }
}

/// Indexed branch serving `rev`: the default branch for `""`/`HEAD`, a branch
/// of that name, or a branch whose commit starts with an abbreviated sha.
fn indexed_branch<'a>(repo: &'a IndexedRepository, rev: &str) -> Option<&'a str> {
    if rev.is_empty() || rev == "HEAD" {
        return repo.branches.first().map(|b| b.name.as_str());
    }
    repo.branches
        .iter()
        .find(|b| b.name == rev || (rev.len() >= 4 && b.version.starts_with(rev)))
        .map(|b| b.name.as_str())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub indexed: IndexedRepoRevs,
    /// Revisions to fan out to the archive searcher, already capped.
    pub unindexed: Vec<RepositoryRevisions>,
    /// Repositories dropped by the unindexed cap.
    pub missing: Vec<RepoName>,
    /// Budget of unindexed repository revisions for this query.
    pub max_unindexed: usize,
}

impl Partition {
    fn all_unindexed(repo_revs: &[RepositoryRevisions], max_unindexed: usize) -> Self {
        let (unindexed, missing) = limit_searcher_repos(repo_revs.to_vec(), max_unindexed);
        Partition {
            indexed: IndexedRepoRevs::default(),
            unindexed,
            missing,
            max_unindexed,
        }
    }

    pub fn disable_unindexed(&self) -> bool {
        self.max_unindexed == 0
    }
}

/// Split `repo_revs` between the index (described by `catalog`, `None` when
/// indexed search is disabled) and the archive searcher.
///
/// Pure: the result depends only on the arguments.
pub fn partition(
    repo_revs: &[RepositoryRevisions],
    info: &PatternInfo,
    catalog: Option<&IndexCatalog>,
    max_unindexed: usize,
) -> Result<Partition, SearchError> {
    let only = info.index == IndexDirective::Only;

    let Some(catalog) = catalog else {
        if only {
            return Err(SearchError::InvalidIndexDirective {
                directive: info.index,
                reason: "indexed search is not enabled",
            });
        }
        return Ok(Partition::all_unindexed(repo_revs, max_unindexed));
    };

    if repo_revs.iter().any(RepositoryRevisions::has_ref_globs) {
        if only {
            return Err(SearchError::InvalidIndexDirective {
                directive: info.index,
                reason: "revisions with glob pattern cannot be resolved for indexed searches",
            });
        }
        return Ok(Partition::all_unindexed(repo_revs, max_unindexed));
    }

    if info.index == IndexDirective::No {
        return Ok(Partition::all_unindexed(repo_revs, max_unindexed));
    }

    let by_name = catalog.by_name();
    let mut indexed = IndexedRepoRevs::default();
    let mut unindexed = Vec::new();
    for rr in repo_revs {
        let Some(repo) = by_name.get(rr.repo.name.as_str()) else {
            unindexed.push(rr.clone());
            continue;
        };
        let rest = indexed.add(rr, repo);
        if !rest.is_empty() {
            unindexed.push(rr.with_revs(rest));
        }
    }

    if only {
        if !unindexed.is_empty() {
            return Err(SearchError::IndexNotReady);
        }
        return Ok(Partition {
            indexed,
            unindexed: Vec::new(),
            missing: Vec::new(),
            max_unindexed: 0,
        });
    }

    let (unindexed, missing) = limit_searcher_repos(unindexed, max_unindexed);
    tracing::debug!(
        indexed = indexed.len(),
        unindexed = unindexed.len(),
        missing = missing.len(),
        "partitioned repositories"
    );
    Ok(Partition {
        indexed,
        unindexed,
        missing,
        max_unindexed,
    })
}

/// Keep unindexed repositories while their revision count stays within
/// `limit`; the repositories after the cut are returned as missing.
pub fn limit_searcher_repos(
    unindexed: Vec<RepositoryRevisions>,
    limit: usize,
) -> (Vec<RepositoryRevisions>, Vec<RepoName>) {
    let mut total = 0usize;
    let mut cut = unindexed.len();
    for (i, rr) in unindexed.iter().enumerate() {
        total += rr.revs.len().max(1);
        if total > limit {
            cut = i;
            break;
        }
    }
    let mut searched = unindexed;
    let dropped = searched.split_off(cut);
    if !dropped.is_empty() {
        tracing::debug!(limit, dropped = dropped.len(), "limiting unindexed repositories searched");
    }
    (searched, dropped.into_iter().map(|rr| rr.repo).collect())
}
