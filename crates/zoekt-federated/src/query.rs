// Copyright 2025 HyperZoekt Project
// Derived from sourcegraph/zoekt (https://github.com/sourcegraph/zoekt)
// Copyright 2016 Google Inc. All rights reserved.
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

//! Query tree understood by the index engine, and the builders that turn a
//! [`PatternInfo`] into one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::structural::{compile_structural_pattern, validate_regexp};
use crate::types::{PatternInfo, RepoName};

/// Repository metadata flags the index stores per shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawConfig(u8);

impl RawConfig {
    pub const ONLY_PUBLIC: RawConfig = RawConfig(1);
    pub const ONLY_PRIVATE: RawConfig = RawConfig(2);
    pub const ONLY_FORKS: RawConfig = RawConfig(4);
    pub const NO_FORKS: RawConfig = RawConfig(8);
    pub const ONLY_ARCHIVED: RawConfig = RawConfig(16);
    pub const NO_ARCHIVED: RawConfig = RawConfig(32);

    const NAMES: [(RawConfig, &'static str); 6] = [
        (RawConfig::ONLY_PUBLIC, "RcOnlyPublic"),
        (RawConfig::ONLY_PRIVATE, "RcOnlyPrivate"),
        (RawConfig::ONLY_FORKS, "RcOnlyForks"),
        (RawConfig::NO_FORKS, "RcNoForks"),
        (RawConfig::ONLY_ARCHIVED, "RcOnlyArchived"),
        (RawConfig::NO_ARCHIVED, "RcNoArchived"),
    ];

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: RawConfig) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, flag: RawConfig, on: bool) {
        if on {
            self.0 |= flag.0;
        }
    }
}

impl fmt::Display for RawConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = RawConfig::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "rawConfig:{}", names.join("|"))
    }
}

/// What a `Type` node reports instead of its child's matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    FileMatch,
    FileName,
    Repo,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeKind::FileMatch => "filematch",
            TypeKind::FileName => "filename",
            TypeKind::Repo => "repo",
        };
        write!(f, "{}", s)
    }
}

/// Repository name to the branches to search in it.
pub type RepoBranches = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Q {
    Const {
        value: bool,
    },
    Substring {
        pattern: String,
        case_sensitive: bool,
        file_name: bool,
        content: bool,
    },
    Regexp {
        regexp: String,
        case_sensitive: bool,
        file_name: bool,
        content: bool,
    },
    RepoBranches {
        set: RepoBranches,
    },
    Branch {
        pattern: String,
        exact: bool,
    },
    RawConfig {
        flags: RawConfig,
    },
    Type {
        kind: TypeKind,
        child: Box<Q>,
    },
    Language {
        language: String,
    },
    And {
        children: Vec<Q>,
    },
    Or {
        children: Vec<Q>,
    },
    Not {
        child: Box<Q>,
    },
}

impl Q {
    pub fn and(children: Vec<Q>) -> Q {
        let mut flat = Vec::with_capacity(children.len());
        for c in children {
            match c {
                Q::And { children } => flat.extend(children),
                other => flat.push(other),
            }
        }
        Q::And { children: flat }
    }

    pub fn or(children: Vec<Q>) -> Q {
        let mut flat = Vec::with_capacity(children.len());
        for c in children {
            match c {
                Q::Or { children } => flat.extend(children),
                other => flat.push(other),
            }
        }
        Q::Or { children: flat }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: Q) -> Q {
        Q::Not {
            child: Box::new(child),
        }
    }

    pub fn type_repo(child: Q) -> Q {
        Q::Type {
            kind: TypeKind::Repo,
            child: Box::new(child),
        }
    }

    pub fn repo_branches(set: RepoBranches) -> Q {
        Q::RepoBranches { set }
    }

    /// Fold constants and collapse trivial `And`/`Or` nodes.
    pub fn simplify(self) -> Q {
        match self {
            Q::And { children } => {
                let mut kept = Vec::new();
                for c in children.into_iter().map(Q::simplify) {
                    match c {
                        Q::Const { value: true } => {}
                        Q::Const { value: false } => return Q::Const { value: false },
                        Q::And { children } => kept.extend(children),
                        other => kept.push(other),
                    }
                }
                match kept.len() {
                    0 => Q::Const { value: true },
                    1 => kept.remove(0),
                    _ => Q::And { children: kept },
                }
            }
            Q::Or { children } => {
                let mut kept = Vec::new();
                for c in children.into_iter().map(Q::simplify) {
                    match c {
                        Q::Const { value: false } => {}
                        Q::Const { value: true } => return Q::Const { value: true },
                        Q::Or { children } => kept.extend(children),
                        other => kept.push(other),
                    }
                }
                match kept.len() {
                    0 => Q::Const { value: false },
                    1 => kept.remove(0),
                    _ => Q::Or { children: kept },
                }
            }
            Q::Not { child } => match child.simplify() {
                Q::Const { value } => Q::Const { value: !value },
                other => Q::not(other),
            },
            Q::Type { kind, child } => Q::Type {
                kind,
                child: Box::new(child.simplify()),
            },
            other => other,
        }
    }
}

fn write_children(f: &mut fmt::Formatter<'_>, op: &str, children: &[Q]) -> fmt::Result {
    write!(f, "({}", op)?;
    for c in children {
        write!(f, " {}", c)?;
    }
    write!(f, ")")
}

fn scope(file_name: bool, content: bool) -> &'static str {
    match (file_name, content) {
        (true, false) => "file:",
        (false, true) => "content:",
        _ => "",
    }
}

impl fmt::Display for Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Q::Const { value } => write!(f, "{}", if *value { "TRUE" } else { "FALSE" }),
            Q::Substring {
                pattern,
                case_sensitive,
                file_name,
                content,
            } => {
                let case = if *case_sensitive { "case:" } else { "" };
                write!(f, "{}{}L({})", scope(*file_name, *content), case, pattern)
            }
            Q::Regexp {
                regexp,
                case_sensitive,
                file_name,
                content,
            } => {
                let case = if *case_sensitive { "case:" } else { "" };
                write!(f, "{}{}R({})", scope(*file_name, *content), case, regexp)
            }
            Q::RepoBranches { set } => {
                write!(f, "(REPOBRANCHES")?;
                for (repo, branches) in set {
                    write!(f, " {}@{}", repo, branches.join(","))?;
                }
                write!(f, ")")
            }
            Q::Branch { pattern, exact } => {
                if *exact {
                    write!(f, "branch=\"{}\"", pattern)
                } else {
                    write!(f, "branch:\"{}\"", pattern)
                }
            }
            Q::RawConfig { flags } => write!(f, "{}", flags),
            Q::Type { kind, child } => write!(f, "(TYPE {} {})", kind, child),
            Q::Language { language } => write!(f, "lang:{}", language),
            Q::And { children } => write_children(f, "AND", children),
            Q::Or { children } => write_children(f, "OR", children),
            Q::Not { child } => write!(f, "(NOT {})", child),
        }
    }
}

/// Regular expression over file paths.
pub fn file_re(pattern: &str, case_sensitive: bool) -> Result<Q, SearchError> {
    validate_regexp(pattern)?;
    Ok(Q::Regexp {
        regexp: pattern.to_string(),
        case_sensitive,
        file_name: true,
        content: false,
    })
}

/// Path include/exclude filters plus the per-repository "must contain a file
/// matching" constraints, as one conjunction.
pub fn handle_file_path_patterns(info: &PatternInfo) -> Result<Q, SearchError> {
    let case = info.is_case_sensitive || info.path_patterns_are_case_sensitive;
    let mut and = Vec::new();
    for p in &info.include_patterns {
        and.push(file_re(p, case)?);
    }
    if let Some(p) = info.exclude_pattern.as_deref().filter(|p| !p.is_empty()) {
        and.push(Q::not(file_re(p, case)?));
    }
    // (type:repo file:a) (type:repo file:b) matches repos having a file
    // matching a and a file matching b, not one file matching both.
    for p in &info.file_patterns_repos_must_include {
        and.push(Q::type_repo(file_re(p, case)?));
    }
    for p in &info.file_patterns_repos_must_exclude {
        and.push(Q::not(Q::type_repo(file_re(p, case)?)));
    }
    Ok(Q::and(and))
}

/// Content query for a plain (non structural) search.
pub fn query_to_index_query(info: &PatternInfo) -> Result<Q, SearchError> {
    let file_name = info.pattern_matches_path && !info.pattern_matches_content;
    let content = info.pattern_matches_content && !info.pattern_matches_path;

    let pattern_q = if info.is_regexp || info.is_word_match {
        let mut re = if info.is_regexp {
            info.pattern.clone()
        } else {
            regex::escape(&info.pattern)
        };
        if info.is_word_match {
            re = format!(r"\b(?:{})\b", re);
        }
        validate_regexp(&re)?;
        Q::Regexp {
            regexp: re,
            case_sensitive: info.is_case_sensitive,
            file_name,
            content,
        }
    } else {
        Q::Substring {
            pattern: info.pattern.clone(),
            case_sensitive: info.is_case_sensitive,
            file_name,
            content,
        }
    };

    let mut and = vec![pattern_q, handle_file_path_patterns(info)?];
    if !info.languages.is_empty() {
        and.push(Q::or(
            info.languages
                .iter()
                .map(|l| Q::Language {
                    language: l.clone(),
                })
                .collect(),
        ));
    }
    Ok(Q::and(and).simplify())
}

fn structural_content(info: &PatternInfo, short_circuit: bool) -> Result<Q, SearchError> {
    let regexp = compile_structural_pattern(&info.pattern, short_circuit)?;
    Ok(Q::Regexp {
        regexp,
        case_sensitive: true,
        file_name: false,
        content: true,
    })
}

/// `AND(repo branches, path filters, approximate content regex)`.
pub fn build_structural_query(
    info: &PatternInfo,
    repo_branches: &RepoBranches,
    file_path_patterns: Q,
    short_circuit: bool,
) -> Result<Q, SearchError> {
    Ok(Q::and(vec![
        Q::repo_branches(repo_branches.clone()),
        file_path_patterns,
        structural_content(info, short_circuit)?,
    ]))
}

/// Like [`build_structural_query`], but only reports which repositories
/// contain a match.
pub fn build_repos_only_query(
    info: &PatternInfo,
    repo_branches: &RepoBranches,
    file_path_patterns: Q,
    short_circuit: bool,
) -> Result<Q, SearchError> {
    Ok(Q::and(vec![
        Q::repo_branches(repo_branches.clone()),
        file_path_patterns,
        Q::type_repo(structural_content(info, short_circuit)?),
    ]))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Any,
    Public,
    Private,
}

/// Repository filters of a global search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOptions {
    pub visibility: Visibility,
    pub only_archived: bool,
    pub no_archived: bool,
    pub only_forks: bool,
    pub no_forks: bool,
}

/// Query over every indexed repository: public repositories at HEAD, unioned
/// with the private repositories the actor can see.
///
/// The index has no notion of who is asking, so private repositories are
/// only ever reached through an explicit repository set.
pub fn global_query(q: Q, opts: &RepoOptions, private_repos: &[RepoName]) -> Q {
    let mut qs = Vec::new();

    if matches!(opts.visibility, Visibility::Public | Visibility::Any) {
        let mut rc = RawConfig::ONLY_PUBLIC;
        rc.set(RawConfig::ONLY_ARCHIVED, opts.only_archived);
        rc.set(RawConfig::NO_ARCHIVED, opts.no_archived);
        rc.set(RawConfig::ONLY_FORKS, opts.only_forks);
        rc.set(RawConfig::NO_FORKS, opts.no_forks);
        qs.push(Q::and(vec![
            Q::Branch {
                pattern: "HEAD".into(),
                exact: true,
            },
            Q::RawConfig { flags: rc },
            q.clone(),
        ]));
    }

    if matches!(opts.visibility, Visibility::Private | Visibility::Any) && !private_repos.is_empty()
    {
        let set: RepoBranches = private_repos
            .iter()
            .map(|r| (r.name.clone(), vec!["HEAD".to_string()]))
            .collect();
        qs.push(Q::and(vec![Q::repo_branches(set), q]));
    }

    Q::or(qs).simplify()
}
