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

//! Federated search over a trigram index engine and on-demand archive
//! searchers.
//!
//! A query's repositories are partitioned between the index and the archive
//! searcher fan-out; both stream into one result sink that enforces the
//! caller's result budget and cancels outstanding work once it is spent.

pub mod aggregate;
pub mod backend;
mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod indexed;
pub mod job;
pub mod limiter;
pub mod partition;
pub mod query;
pub mod stream;
pub mod structural;
pub mod structural_search;
pub mod text_search;
pub mod types;
pub mod unindexed;
// Test utilities exposed for integration tests.
pub mod test_utils;

pub use config::{load_federation_config, FederationConfig, MergeOpts};
pub use context::SearchContext;
pub use error::{BackendError, SearchError};
pub use job::{Job, JobEnv, SearchJob};
pub use stream::{SearchEvent, Sender, Stats};
pub use types::{FileMatch, Match, PatternInfo, RepositoryRevisions, TextParameters};
