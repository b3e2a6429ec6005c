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

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::Client;
use tracing_subscriber::EnvFilter;
use zoekt_federated::backend::{Backends, StaticEndpoints};
use zoekt_federated::http::{HttpArchiveSearcher, HttpIndexClient};
use zoekt_federated::stream::StreamFunc;
use zoekt_federated::types::{IndexDirective, RepoName, RevisionSpecifier};
use zoekt_federated::{
    load_federation_config, FederationConfig, Job, JobEnv, MergeOpts, PatternInfo,
    RepositoryRevisions, SearchContext, SearchEvent, SearchJob, TextParameters,
};

#[derive(Parser)]
#[command(about = "Search repositories across a trigram index and archive searchers")]
struct Opts {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Base URL of the index engine (env: ZOEKTF_INDEX_ENDPOINT)
    #[arg(long)]
    index_url: Option<String>,
    /// Archive searcher endpoint, repeatable (env: ZOEKTF_SEARCHER_ENDPOINTS)
    #[arg(long = "searcher")]
    searchers: Vec<String>,
    /// Repository to search as `name[@rev[:rev...]]`; `*glob` selects refs
    #[arg(long = "repo", required = true)]
    repos: Vec<String>,
    #[arg(long)]
    pattern: String,
    #[arg(long)]
    structural: bool,
    #[arg(long)]
    regexp: bool,
    #[arg(long)]
    case_sensitive: bool,
    /// yes, no or only
    #[arg(long, default_value = "yes")]
    index: IndexDirective,
    /// Maximum number of results
    #[arg(long)]
    count: Option<usize>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Give every archive fetch the whole remaining deadline
    #[arg(long)]
    full_deadline: bool,
}

fn parse_rev(rev: &str) -> RevisionSpecifier {
    if let Some(glob) = rev.strip_prefix("*!") {
        RevisionSpecifier::ExcludeRefGlob(glob.to_string())
    } else if let Some(glob) = rev.strip_prefix('*') {
        RevisionSpecifier::RefGlob(glob.to_string())
    } else {
        RevisionSpecifier::rev(rev)
    }
}

fn parse_repo_arg(id: i32, arg: &str) -> Result<RepositoryRevisions> {
    let (name, revs) = match arg.split_once('@') {
        Some((name, revs)) => (name, revs.split(':').map(parse_rev).collect()),
        None => (arg, Vec::new()),
    };
    if name.is_empty() {
        bail!("empty repository name in {:?}", arg);
    }
    Ok(RepositoryRevisions::new(RepoName::new(id, name), revs))
}

fn build_backends(cfg: &FederationConfig) -> Backends {
    let client = Client::new();
    let backends = Backends::new(
        Arc::new(HttpArchiveSearcher::new(client.clone())),
        Arc::new(StaticEndpoints(cfg.searcher_endpoints.clone())),
    );
    match &cfg.index_endpoint {
        Some(url) => backends.with_index(Arc::new(HttpIndexClient::new(client, url.clone()))),
        None => backends,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper_util=warn,hyper=warn,h2=warn,reqwest=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();

    let cfg = load_federation_config(
        FederationConfig::default(),
        MergeOpts {
            config_path: opts.config.clone(),
            cli_index_endpoint: opts.index_url.clone(),
            cli_searcher_endpoints: opts.searchers.clone(),
            ..Default::default()
        },
    )?;

    let repos = opts
        .repos
        .iter()
        .enumerate()
        .map(|(i, arg)| parse_repo_arg(i as i32 + 1, arg))
        .collect::<Result<Vec<_>>>()
        .context("parsing --repo")?;

    let pattern = PatternInfo {
        pattern: opts.pattern.clone(),
        is_regexp: opts.regexp,
        is_structural_pat: opts.structural,
        is_case_sensitive: opts.case_sensitive,
        file_match_limit: opts.count.unwrap_or(cfg.default_max_search_results),
        index: opts.index,
        ..Default::default()
    };
    let args = TextParameters {
        pattern,
        repos,
        use_full_deadline: opts.full_deadline,
        ..Default::default()
    };
    let limit = args.pattern.file_match_limit;
    let leaf = if opts.structural {
        SearchJob::Structural(args)
    } else {
        SearchJob::Text(args)
    };
    let mut job = Job::limit(limit, Job::Search(leaf));
    if let Some(secs) = opts.timeout_secs {
        job = Job::timeout(Duration::from_secs(secs), job);
    }
    tracing::info!(job = %job, "running search");

    let env = JobEnv {
        backends: build_backends(&cfg),
        cfg,
    };
    let span = tracing::info_span!("zf_search", pattern = %opts.pattern);
    let ctx = SearchContext::background().with_span(span);
    let sender = Arc::new(StreamFunc(|event: SearchEvent| {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "failed to encode search event"),
        }
    }));

    let started = std::time::Instant::now();
    job.run(&ctx, &env, sender).await?;
    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "search finished");
    Ok(())
}
