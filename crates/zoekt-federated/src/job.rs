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

//! Search execution plans.
//!
//! A [`Job`] is a tree of operators over leaf searches. Trees are rewritten
//! with a [`Mapper`], printed as s-expressions and executed with
//! [`Job::run`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::Backends;
use crate::config::FederationConfig;
use crate::context::SearchContext;
use crate::error::SearchError;
use crate::stream::{with_limit, AggregatingStream, SearchEvent, Sender, Stats};
use crate::structural_search::stream_structural_search;
use crate::text_search::search_files_in_repos;
use crate::types::{Match, TextParameters};

/// Leaf searches.
#[derive(Debug, Clone)]
pub enum SearchJob {
    Text(TextParameters),
    Structural(TextParameters),
    Noop,
}

impl SearchJob {
    pub fn name(&self) -> &'static str {
        match self {
            SearchJob::Text(_) => "TextSearchJob",
            SearchJob::Structural(_) => "StructuralSearchJob",
            SearchJob::Noop => "NoopJob",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Job {
    /// Files found by every child.
    And(Vec<Job>),
    /// Files found by any child, de-duplicated.
    Or(Vec<Job>),
    /// Run both; `optional` gets a grace period once `required` is done.
    Priority { required: Box<Job>, optional: Box<Job> },
    Parallel(Vec<Job>),
    Limit { limit: usize, child: Box<Job> },
    Timeout { timeout: Duration, child: Box<Job> },
    Search(SearchJob),
}

/// What jobs need to run.
#[derive(Clone)]
pub struct JobEnv {
    pub backends: Backends,
    pub cfg: FederationConfig,
}

type MapFn<'a, A> = Box<dyn Fn(A) -> Job + 'a>;

/// Bottom-up rewrite of a job tree. Children are mapped before their
/// parent; a variant without a callback is rebuilt unchanged.
#[derive(Default)]
pub struct Mapper<'a> {
    pub map_and: Option<MapFn<'a, Vec<Job>>>,
    pub map_or: Option<MapFn<'a, Vec<Job>>>,
    pub map_priority: Option<MapFn<'a, (Job, Job)>>,
    pub map_parallel: Option<MapFn<'a, Vec<Job>>>,
    pub map_limit: Option<MapFn<'a, (usize, Job)>>,
    pub map_timeout: Option<MapFn<'a, (Duration, Job)>>,
    pub map_search: Option<MapFn<'a, SearchJob>>,
}

impl Mapper<'_> {
    pub fn map(&self, job: Job) -> Job {
        let all = |children: Vec<Job>| children.into_iter().map(|c| self.map(c)).collect::<Vec<_>>();
        match job {
            Job::And(children) => {
                let children = all(children);
                match &self.map_and {
                    Some(f) => f(children),
                    None => Job::And(children),
                }
            }
            Job::Or(children) => {
                let children = all(children);
                match &self.map_or {
                    Some(f) => f(children),
                    None => Job::Or(children),
                }
            }
            Job::Parallel(children) => {
                let children = all(children);
                match &self.map_parallel {
                    Some(f) => f(children),
                    None => Job::Parallel(children),
                }
            }
            Job::Priority { required, optional } => {
                let required = self.map(*required);
                let optional = self.map(*optional);
                match &self.map_priority {
                    Some(f) => f((required, optional)),
                    None => Job::Priority {
                        required: Box::new(required),
                        optional: Box::new(optional),
                    },
                }
            }
            Job::Limit { limit, child } => {
                let child = self.map(*child);
                match &self.map_limit {
                    Some(f) => f((limit, child)),
                    None => Job::Limit {
                        limit,
                        child: Box::new(child),
                    },
                }
            }
            Job::Timeout { timeout, child } => {
                let child = self.map(*child);
                match &self.map_timeout {
                    Some(f) => f((timeout, child)),
                    None => Job::Timeout {
                        timeout,
                        child: Box::new(child),
                    },
                }
            }
            Job::Search(leaf) => match &self.map_search {
                Some(f) => f(leaf),
                None => Job::Search(leaf),
            },
        }
    }
}

/// Keep only the first operand of every `And`: the index evaluates the
/// conjunction itself.
pub fn optimize_and(job: Job) -> Job {
    let mapper = Mapper {
        map_and: Some(Box::new(|children: Vec<Job>| {
            Job::And(children.into_iter().take(1).collect())
        })),
        ..Default::default()
    };
    mapper.map(job)
}

enum Sexp {
    Atom(String),
    List(&'static str, Vec<Sexp>),
}

impl Sexp {
    fn write_flat(&self, out: &mut String) {
        match self {
            Sexp::Atom(a) => out.push_str(a),
            Sexp::List(tag, items) => {
                out.push('(');
                out.push_str(tag);
                for item in items {
                    out.push(' ');
                    item.write_flat(out);
                }
                out.push(')');
            }
        }
    }

    fn write_pretty(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        match self {
            Sexp::Atom(a) => {
                out.push_str(&indent);
                out.push_str(a);
            }
            Sexp::List(tag, items) => {
                out.push_str(&indent);
                out.push('(');
                out.push_str(tag);
                for item in items {
                    out.push('\n');
                    item.write_pretty(out, depth + 1);
                }
                out.push(')');
            }
        }
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 && d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else if d.as_nanos() % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:?}", d)
    }
}

impl Job {
    pub fn noop() -> Job {
        Job::Search(SearchJob::Noop)
    }

    pub fn priority(required: Job, optional: Job) -> Job {
        Job::Priority {
            required: Box::new(required),
            optional: Box::new(optional),
        }
    }

    pub fn limit(limit: usize, child: Job) -> Job {
        Job::Limit {
            limit,
            child: Box::new(child),
        }
    }

    pub fn timeout(timeout: Duration, child: Job) -> Job {
        Job::Timeout {
            timeout,
            child: Box::new(child),
        }
    }

    fn to_sexp(&self) -> Sexp {
        let list = |tag, children: &[Job]| Sexp::List(tag, children.iter().map(Job::to_sexp).collect());
        match self {
            Job::And(children) => list("AND", children),
            Job::Or(children) => list("OR", children),
            Job::Parallel(children) => list("PARALLEL", children),
            Job::Priority { required, optional } => Sexp::List(
                "PRIORITY",
                vec![
                    Sexp::List("REQUIRED", vec![required.to_sexp()]),
                    Sexp::List("OPTIONAL", vec![optional.to_sexp()]),
                ],
            ),
            Job::Limit { limit, child } => {
                Sexp::List("LIMIT", vec![Sexp::Atom(limit.to_string()), child.to_sexp()])
            }
            Job::Timeout { timeout, child } => Sexp::List(
                "TIMEOUT",
                vec![Sexp::Atom(format_duration(*timeout)), child.to_sexp()],
            ),
            Job::Search(leaf) => Sexp::Atom(leaf.name().to_string()),
        }
    }

    /// One-line s-expression.
    pub fn sexp(&self) -> String {
        let mut out = String::new();
        self.to_sexp().write_flat(&mut out);
        out
    }

    /// Indented s-expression, one node per line.
    pub fn pretty_sexp(&self) -> String {
        let mut out = String::new();
        self.to_sexp().write_pretty(&mut out, 0);
        out
    }

    /// Execute the tree, streaming results to `sender`.
    pub fn run<'a>(
        &'a self,
        ctx: &'a SearchContext,
        env: &'a JobEnv,
        sender: Arc<dyn Sender>,
    ) -> BoxFuture<'a, Result<(), SearchError>> {
        async move {
            match self {
                Job::Search(SearchJob::Text(args)) => {
                    search_files_in_repos(ctx, &env.backends, &env.cfg, args, sender).await
                }
                Job::Search(SearchJob::Structural(args)) => {
                    stream_structural_search(ctx, &env.backends, &env.cfg, args, sender.as_ref())
                        .await
                }
                Job::Search(SearchJob::Noop) => Ok(()),
                Job::Parallel(children) => {
                    let results =
                        join_all(children.iter().map(|c| c.run(ctx, env, sender.clone()))).await;
                    first_error(results)
                }
                Job::Or(children) => {
                    let dedup: Arc<dyn Sender> = Arc::new(DedupSender {
                        seen: Mutex::new(HashSet::new()),
                        parent: sender,
                    });
                    let results =
                        join_all(children.iter().map(|c| c.run(ctx, env, dedup.clone()))).await;
                    first_error(results)
                }
                Job::And(children) => run_and(children, ctx, env, sender).await,
                Job::Priority { required, optional } => {
                    run_priority(required, optional, ctx, env, sender).await
                }
                Job::Limit { limit, child } => {
                    let (ctx, stream) = with_limit(ctx, sender, *limit);
                    match child.run(&ctx, env, stream.clone()).await {
                        Err(e) if e.is_canceled() && stream.limit_hit() => Ok(()),
                        res => res,
                    }
                }
                Job::Timeout { timeout, child } => {
                    let ctx = ctx.with_timeout(*timeout);
                    child.run(&ctx, env, sender).await
                }
            }
        }
        .boxed()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sexp())
    }
}

fn first_error(results: Vec<Result<(), SearchError>>) -> Result<(), SearchError> {
    let mut errs = results.into_iter().filter_map(Result::err);
    match errs.next() {
        Some(first) => {
            for other in errs {
                tracing::debug!(error = %other, "additional job error");
            }
            Err(first)
        }
        None => Ok(()),
    }
}

struct DedupSender {
    seen: Mutex<HashSet<(String, Option<String>, String)>>,
    parent: Arc<dyn Sender>,
}

impl Sender for DedupSender {
    fn send(&self, mut event: SearchEvent) {
        {
            let mut seen = self.seen.lock();
            event.results.retain(|m| seen.insert(m.key()));
        }
        if event.results.is_empty() && event.stats.is_zero() {
            return;
        }
        self.parent.send(event);
    }
}

async fn run_and(
    children: &[Job],
    ctx: &SearchContext,
    env: &JobEnv,
    sender: Arc<dyn Sender>,
) -> Result<(), SearchError> {
    if children.is_empty() {
        return Ok(());
    }
    let streams: Vec<Arc<AggregatingStream>> =
        children.iter().map(|_| Arc::new(AggregatingStream::new())).collect();
    let results = join_all(
        children
            .iter()
            .zip(&streams)
            .map(|(c, s)| c.run(ctx, env, s.clone())),
    )
    .await;
    first_error(results)?;

    let mut stats = Stats::default();
    let mut counts: HashMap<_, usize> = HashMap::new();
    let mut first: Vec<Match> = Vec::new();
    for (i, s) in streams.iter().enumerate() {
        stats.update(&s.stats());
        let mut keys = HashSet::new();
        for m in s.results() {
            let key = m.key();
            if keys.insert(key.clone()) {
                *counts.entry(key).or_default() += 1;
                if i == 0 {
                    first.push(m);
                }
            }
        }
    }
    let results = first
        .into_iter()
        .filter(|m| counts.get(&m.key()) == Some(&children.len()))
        .collect();
    sender.send(SearchEvent { results, stats });
    Ok(())
}

async fn run_priority(
    required: &Job,
    optional: &Job,
    ctx: &SearchContext,
    env: &JobEnv,
    sender: Arc<dyn Sender>,
) -> Result<(), SearchError> {
    let optional_ctx = ctx.child();
    let optional_done = CancellationToken::new();

    let required_run = async {
        let res = required.run(ctx, env, sender.clone()).await;
        if res.is_err() {
            optional_ctx.cancel();
            return res;
        }
        tokio::select! {
            _ = tokio::time::sleep(env.cfg.priority_grace) => {
                tracing::debug!("optional job exceeded its grace period");
                optional_ctx.cancel();
            }
            _ = optional_done.cancelled() => {}
        }
        res
    };
    let optional_run = async {
        let res = optional.run(&optional_ctx, env, sender.clone()).await;
        optional_done.cancel();
        res
    };

    let (required_res, optional_res) = tokio::join!(required_run, optional_run);
    required_res?;
    match optional_res {
        Err(e) if e.is_canceled() => Ok(()),
        res => res,
    }
}
