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

//! Typed errors for the federated search engine.
//!
//! Three layers: `ContextError` is what a cancelled or expired
//! [`SearchContext`](crate::context::SearchContext) reports, `BackendError` is
//! what a collaborator (index engine, archive searcher, revision resolver)
//! reports for one call, and `SearchError` is what a query returns to its
//! caller.

use thiserror::Error;

use crate::types::IndexDirective;

pub type Result<T, E = SearchError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("repository clone in progress: {0}")]
    CloneInProgress(String),
    #[error("revision not found: {repo}@{rev}")]
    RevisionNotFound { repo: String, rev: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("temporarily unavailable: {0}")]
    Temporary(String),
    #[error("canceled")]
    Canceled,
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, BackendError::Temporary(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, BackendError::Canceled)
    }
}

impl From<ContextError> for BackendError {
    fn from(e: ContextError) -> Self {
        match e {
            ContextError::Canceled => BackendError::Canceled,
            ContextError::DeadlineExceeded => BackendError::Timeout(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if e.is_connect() {
            BackendError::Temporary(e.to_string())
        } else {
            BackendError::Other(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    /// `index:only` (or another directive) cannot be honoured with the
    /// current index configuration.
    #[error("invalid index:{directive} ({reason})")]
    InvalidIndexDirective {
        directive: IndexDirective,
        reason: &'static str,
    },

    #[error("index:only failed since indexed search is not available yet")]
    IndexNotReady,

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<regex_syntax::Error>,
    },

    /// The index engine used its whole wall-time budget without producing a
    /// single result. Distinct from an empty result set.
    #[error("no results found before the index search timed out")]
    NoResultsInTimeout,

    #[error("failed to search {repo_rev}: {source}")]
    Repo {
        repo_rev: String,
        #[source]
        source: BackendError,
    },

    #[error("no searcher endpoints available")]
    NoEndpoints,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl SearchError {
    pub fn invalid_pattern(pattern: impl Into<String>, source: regex_syntax::Error) -> Self {
        SearchError::InvalidPattern {
            pattern: pattern.into(),
            source: Box::new(source),
        }
    }

    /// Configuration errors fail fast and are shown to the user verbatim.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SearchError::InvalidIndexDirective { .. } | SearchError::IndexNotReady
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            SearchError::Context(ContextError::Canceled)
                | SearchError::Backend(BackendError::Canceled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_render_directive() {
        let err = SearchError::InvalidIndexDirective {
            directive: IndexDirective::Only,
            reason: "indexed search is not enabled",
        };
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "invalid index:only (indexed search is not enabled)"
        );
        assert!(SearchError::IndexNotReady.is_configuration());
        assert!(!SearchError::NoResultsInTimeout.is_configuration());
    }

    #[test]
    fn context_errors_map_onto_backend_kinds() {
        assert!(BackendError::from(ContextError::Canceled).is_canceled());
        assert!(BackendError::from(ContextError::DeadlineExceeded).is_timeout());
    }

    #[test]
    fn repo_error_wraps_source() {
        let err = SearchError::Repo {
            repo_rev: "github.com/a/b@main".into(),
            source: BackendError::Other("boom".into()),
        };
        assert_eq!(err.to_string(), "failed to search github.com/a/b@main: boom");
        assert!(std::error::Error::source(&err).is_some());
    }
}
