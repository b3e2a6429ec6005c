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

//! Core data model: repositories and their revisions, the compiled search
//! intent, and the match types streamed back to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::query::RepoOptions;

pub type RepoId = i32;

/// A repository as known to the caller: a stable id plus its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoName {
    pub name: String,
    pub id: RepoId,
}

impl RepoName {
    pub fn new(id: RepoId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// One revision requested for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevisionSpecifier {
    /// A branch, tag or commit. The empty string means the default branch.
    RevSpec(String),
    /// A glob over refs (`refs/heads/release-*`). Only resolvable at query time.
    RefGlob(String),
    /// A glob of refs to exclude from the expansion of the other globs.
    ExcludeRefGlob(String),
}

impl RevisionSpecifier {
    pub fn default_branch() -> Self {
        RevisionSpecifier::RevSpec(String::new())
    }

    pub fn rev(rev: impl Into<String>) -> Self {
        RevisionSpecifier::RevSpec(rev.into())
    }

    pub fn is_glob(&self) -> bool {
        !matches!(self, RevisionSpecifier::RevSpec(_))
    }

    /// The explicit revision, if this is not a glob.
    pub fn rev_spec(&self) -> Option<&str> {
        match self {
            RevisionSpecifier::RevSpec(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for RevisionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionSpecifier::RevSpec(r) => write!(f, "{}", r),
            RevisionSpecifier::RefGlob(g) => write!(f, "*{}", g),
            RevisionSpecifier::ExcludeRefGlob(g) => write!(f, "*!{}", g),
        }
    }
}

/// A repository plus the revisions to search in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRevisions {
    pub repo: RepoName,
    pub revs: Vec<RevisionSpecifier>,
}

impl RepositoryRevisions {
    pub fn new(repo: RepoName, revs: Vec<RevisionSpecifier>) -> Self {
        Self { repo, revs }
    }

    /// A repository searched at its default branch only.
    pub fn head(repo: RepoName) -> Self {
        Self::new(repo, vec![RevisionSpecifier::default_branch()])
    }

    pub fn has_ref_globs(&self) -> bool {
        self.revs.iter().any(RevisionSpecifier::is_glob)
    }

    /// Explicit (non-glob) revisions. An empty revision list means the default
    /// branch.
    pub fn rev_specs(&self) -> Vec<String> {
        if self.revs.is_empty() {
            return vec![String::new()];
        }
        self.revs
            .iter()
            .filter_map(|r| r.rev_spec().map(str::to_string))
            .collect()
    }

    pub fn with_revs(&self, revs: Vec<RevisionSpecifier>) -> Self {
        Self {
            repo: self.repo.clone(),
            revs,
        }
    }
}

impl fmt::Display for RepositoryRevisions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repo.name)?;
        let revs: Vec<String> = self.revs.iter().map(|r| r.to_string()).collect();
        if revs.iter().any(|r| !r.is_empty()) {
            write!(f, "@{}", revs.join(":"))?;
        }
        Ok(())
    }
}

/// The user's `index:` directive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexDirective {
    /// Use the index where possible and fall back to unindexed search.
    #[default]
    Yes,
    /// Never use the index.
    No,
    /// Only use the index; never fan out to the archive searcher.
    Only,
}

impl fmt::Display for IndexDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexDirective::Yes => "yes",
            IndexDirective::No => "no",
            IndexDirective::Only => "only",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for IndexDirective {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yes" | "y" | "true" => Ok(IndexDirective::Yes),
            "no" | "n" | "false" => Ok(IndexDirective::No),
            "only" => Ok(IndexDirective::Only),
            _ => Err(format!("unknown index directive: {}", s)),
        }
    }
}

/// Result projection requested by `select:`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectKind {
    #[default]
    File,
    Content,
    Repo,
}

/// How a search over many repositories is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GlobalSearchMode {
    /// Partition into indexed/unindexed subsets.
    #[default]
    Default,
    /// No explicit repo filter: ask the index engine for the whole universe.
    IndexedUniverse,
    /// Skip the index engine entirely.
    SearcherOnly,
}

/// Compiled search intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternInfo {
    pub pattern: String,
    pub is_regexp: bool,
    pub is_structural_pat: bool,
    pub is_case_sensitive: bool,
    pub is_word_match: bool,
    /// Match-count budget for the whole query.
    pub file_match_limit: usize,
    pub include_patterns: Vec<String>,
    pub exclude_pattern: Option<String>,
    pub file_patterns_repos_must_include: Vec<String>,
    pub file_patterns_repos_must_exclude: Vec<String>,
    pub path_patterns_are_case_sensitive: bool,
    pub pattern_matches_content: bool,
    pub pattern_matches_path: bool,
    pub languages: Vec<String>,
    pub index: IndexDirective,
    pub select: SelectKind,
}

pub const DEFAULT_MAX_SEARCH_RESULTS: usize = 30;

impl Default for PatternInfo {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            is_regexp: false,
            is_structural_pat: false,
            is_case_sensitive: false,
            is_word_match: false,
            file_match_limit: DEFAULT_MAX_SEARCH_RESULTS,
            include_patterns: Vec::new(),
            exclude_pattern: None,
            file_patterns_repos_must_include: Vec::new(),
            file_patterns_repos_must_exclude: Vec::new(),
            path_patterns_are_case_sensitive: false,
            pattern_matches_content: true,
            pattern_matches_path: true,
            languages: Vec::new(),
            index: IndexDirective::Yes,
            select: SelectKind::File,
        }
    }
}

impl PatternInfo {
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    pub fn structural(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            is_structural_pat: true,
            ..Default::default()
        }
    }

    pub fn has_repo_file_constraints(&self) -> bool {
        !self.file_patterns_repos_must_include.is_empty()
            || !self.file_patterns_repos_must_exclude.is_empty()
    }
}

/// Inputs of a text or structural search over a set of repositories.
#[derive(Debug, Clone, Default)]
pub struct TextParameters {
    pub pattern: PatternInfo,
    pub repos: Vec<RepositoryRevisions>,
    pub mode: GlobalSearchMode,
    /// Repository filters for [`GlobalSearchMode::IndexedUniverse`].
    pub repo_options: RepoOptions,
    /// Private repositories the actor may see, for universe searches.
    pub user_private_repos: Vec<RepoName>,
    /// The caller set an explicit timeout: let backends use all of it.
    pub use_full_deadline: bool,
}

/// One line of a file containing matches. `offset_and_lengths` are rune
/// offsets into `preview`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    pub preview: String,
    /// 0-based line number.
    pub line_number: i32,
    pub offset_and_lengths: Vec<[i32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub repo: RepoName,
    pub commit_id: String,
    /// The revision the user asked for, when known.
    pub input_rev: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatch {
    pub file: File,
    pub line_matches: Vec<LineMatch>,
    /// Set when the line matches of this file were truncated.
    pub limit_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMatch {
    pub name: String,
    pub id: RepoId,
    pub rev: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Match {
    File(FileMatch),
    Repo(RepoMatch),
}

/// `git://repo?rev#path`, the location used to order matches.
pub fn file_match_uri(repo: &str, rev: Option<&str>, path: &str) -> String {
    let mut uri = format!("git://{}", repo);
    if let Some(rev) = rev.filter(|r| !r.is_empty()) {
        uri.push('?');
        uri.push_str(rev);
    }
    uri.push('#');
    uri.push_str(path);
    uri
}

impl FileMatch {
    pub fn uri(&self) -> String {
        file_match_uri(
            &self.file.repo.name,
            self.file.input_rev.as_deref(),
            &self.file.path,
        )
    }

    /// Truncate the line matches to at most `max`; returns whether anything
    /// was dropped.
    pub fn truncate_lines(&mut self, max: usize) -> bool {
        if self.line_matches.len() > max {
            self.line_matches.truncate(max);
            self.limit_hit = true;
            return true;
        }
        false
    }
}

impl Match {
    pub fn uri(&self) -> String {
        match self {
            Match::File(fm) => fm.uri(),
            Match::Repo(rm) => file_match_uri(&rm.name, rm.rev.as_deref(), ""),
        }
    }

    pub fn repo_name(&self) -> &str {
        match self {
            Match::File(fm) => &fm.file.repo.name,
            Match::Repo(rm) => &rm.name,
        }
    }

    pub fn repo_id(&self) -> RepoId {
        match self {
            Match::File(fm) => fm.file.repo.id,
            Match::Repo(rm) => rm.id,
        }
    }

    pub fn as_file(&self) -> Option<&FileMatch> {
        match self {
            Match::File(fm) => Some(fm),
            Match::Repo(_) => None,
        }
    }

    /// Identity used to de-duplicate and intersect results across jobs.
    pub fn key(&self) -> (String, Option<String>, String) {
        match self {
            Match::File(fm) => (
                fm.file.repo.name.clone(),
                fm.file.input_rev.clone(),
                fm.file.path.clone(),
            ),
            Match::Repo(rm) => (rm.name.clone(), rm.rev.clone(), String::new()),
        }
    }
}
