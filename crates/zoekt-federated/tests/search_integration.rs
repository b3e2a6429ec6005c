use std::sync::Arc;
use std::time::Duration;

use zoekt_federated::backend::{IndexCatalog, IndexSearchResult};
use zoekt_federated::stream::{AggregatingStream, RepoStatus};
use zoekt_federated::structural_search::search_files_in_repos_structural;
use zoekt_federated::test_utils::{
    archive_file, fake_backends, head_catalog, index_file, indexed_repo, init_test_logging,
    repo_revs, FakeArchiveSearcher, FakeIndexClient, RepoBehavior,
};
use zoekt_federated::text_search::{search_files_in_repos, search_files_in_repos_batch};
use zoekt_federated::types::{GlobalSearchMode, IndexDirective};
use zoekt_federated::{
    BackendError, FederationConfig, Job, JobEnv, PatternInfo, RepositoryRevisions, SearchContext,
    SearchError, SearchJob, TextParameters,
};

fn five_repos() -> Vec<RepositoryRevisions> {
    (1..=5).map(|i| repo_revs(i, &format!("r{}", i), &[])).collect()
}

fn matching(path: &str, lines: usize) -> RepoBehavior {
    RepoBehavior {
        matches: vec![archive_file(path, lines)],
        ..Default::default()
    }
}

fn text_args(info: PatternInfo, repos: Vec<RepositoryRevisions>) -> TextParameters {
    TextParameters {
        pattern: info,
        repos,
        ..Default::default()
    }
}

#[tokio::test]
async fn indexed_and_unindexed_results_are_merged() {
    init_test_logging();
    tracing::info!("TEST START: indexed_and_unindexed_results_are_merged");

    let index = Arc::new(
        FakeIndexClient::new(head_catalog(&[(1, "r1"), (2, "r2"), (3, "r3")])).with_response(
            IndexSearchResult {
                files: vec![index_file("r1", 1, "a.go", &[(3, "héllo foo", 7, 3)])],
                file_count: 1,
                match_count: 1,
                ..Default::default()
            },
        ),
    );
    let searcher = Arc::new(FakeArchiveSearcher::new().with_repo("r4", matching("b.go", 1)));
    let backends = fake_backends(Some(index.clone()), searcher.clone(), 1);

    let (files, stats) = search_files_in_repos_batch(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(PatternInfo::literal("foo"), five_repos()),
    )
    .await
    .unwrap();

    let mut uris: Vec<String> = files.iter().map(|f| f.uri()).collect();
    uris.sort();
    assert_eq!(uris, vec!["git://r1#a.go", "git://r4#b.go"]);

    let indexed = files.iter().find(|f| f.file.repo.name == "r1").unwrap();
    assert_eq!(indexed.line_matches[0].line_number, 2);
    assert_eq!(indexed.line_matches[0].offset_and_lengths, vec![[6, 3]]);

    // Only the unindexed repositories reach the archive searcher.
    let mut searched: Vec<String> = searcher.calls().iter().map(|c| c.repo.name.clone()).collect();
    searched.sort();
    assert_eq!(searched, vec!["r4", "r5"]);
    assert_eq!(stats.status.get(4), RepoStatus::SEARCHED);
    assert_eq!(stats.status.get(5), RepoStatus::SEARCHED);

    let queries = index.query_log();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("REPOBRANCHES"), "{}", queries[0]);
    assert!(queries[0].contains("r1@HEAD"), "{}", queries[0]);
}

#[tokio::test]
async fn index_only_with_unindexed_repos_fails_fast() {
    init_test_logging();
    let index = Arc::new(FakeIndexClient::new(head_catalog(&[(1, "r1"), (2, "r2"), (3, "r3")])));
    let searcher = Arc::new(FakeArchiveSearcher::new());
    let backends = fake_backends(Some(index.clone()), searcher.clone(), 1);
    let info = PatternInfo {
        index: IndexDirective::Only,
        ..PatternInfo::literal("foo")
    };

    let err = search_files_in_repos(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(info, five_repos()),
        Arc::new(AggregatingStream::new()),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SearchError::IndexNotReady));
    assert!(err.is_configuration());
    assert!(index.query_log().is_empty());
    assert!(searcher.calls().is_empty());
}

#[tokio::test]
async fn result_limit_truncates_and_flags() {
    init_test_logging();
    tracing::info!("TEST START: result_limit_truncates_and_flags");

    let mut searcher = FakeArchiveSearcher::new();
    for i in 1..=5 {
        searcher = searcher.with_repo(&format!("r{}", i), matching("x.go", 1));
    }
    let backends = fake_backends(None, Arc::new(searcher), 1);
    let info = PatternInfo {
        file_match_limit: 2,
        ..PatternInfo::literal("foo")
    };

    let (files, stats) = search_files_in_repos_batch(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(info, five_repos()),
    )
    .await
    .unwrap();

    assert_eq!(files.len(), 2);
    assert!(stats.is_limit_hit);
}

#[tokio::test]
async fn text_batches_are_ordered_and_long_files_truncated() {
    init_test_logging();
    let searcher = FakeArchiveSearcher::new().with_repo(
        "a",
        RepoBehavior {
            matches: vec![archive_file("a.go", 1), archive_file("z.go", 200)],
            ..Default::default()
        },
    );
    let backends = fake_backends(None, Arc::new(searcher), 1);

    let (files, stats) = search_files_in_repos_batch(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(PatternInfo::literal("foo"), vec![repo_revs(1, "a", &[])]),
    )
    .await
    .unwrap();

    let paths: Vec<&str> = files.iter().map(|f| f.file.path.as_str()).collect();
    assert_eq!(paths, vec!["z.go", "a.go"]);
    // One repository: 25 + 100 line matches per file.
    assert_eq!(files[0].line_matches.len(), 125);
    assert!(files[0].limit_hit);
    assert!(!files[1].limit_hit);
    assert!(stats.is_limit_hit);
}

#[tokio::test(start_paused = true)]
async fn index_timeout_without_results_marks_repos_timed_out() {
    init_test_logging();
    let index = Arc::new(
        FakeIndexClient::new(head_catalog(&[(1, "r1"), (2, "r2")]))
            .with_delay(Duration::from_secs(2)),
    );
    let backends = fake_backends(Some(index), Arc::new(FakeArchiveSearcher::new()), 1);
    let cfg = FederationConfig {
        index_max_wall_time: Duration::from_secs(1),
        ..Default::default()
    };
    let repos = vec![repo_revs(1, "r1", &[]), repo_revs(2, "r2", &[])];

    let (files, stats) = search_files_in_repos_batch(
        &SearchContext::background(),
        &backends,
        &cfg,
        &text_args(PatternInfo::literal("foo"), repos),
    )
    .await
    .unwrap();

    assert!(files.is_empty());
    assert_eq!(stats.status.filter(RepoStatus::TIMEDOUT), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn index_results_survive_the_outer_deadline() {
    init_test_logging();
    let index = Arc::new(
        FakeIndexClient::new(head_catalog(&[(1, "r1")]))
            .with_delay(Duration::from_millis(1500))
            .with_response(IndexSearchResult {
                files: vec![index_file("r1", 1, "late.go", &[(1, "foo", 0, 3)])],
                file_count: 1,
                match_count: 1,
                ..Default::default()
            }),
    );
    let backends = fake_backends(Some(index.clone()), Arc::new(FakeArchiveSearcher::new()), 1);
    let ctx = SearchContext::background().with_timeout(Duration::from_secs(1));

    let (files, _) = search_files_in_repos_batch(
        &ctx,
        &backends,
        &FederationConfig::default(),
        &text_args(PatternInfo::literal("foo"), vec![repo_revs(1, "r1", &[])]),
    )
    .await
    .unwrap();

    assert_eq!(files.len(), 1);
    // The engine was given the remaining deadline as its wall time.
    assert_eq!(index.options.lock()[0].max_wall_time, Duration::from_secs(1));
}

#[tokio::test]
async fn universe_search_uses_public_and_private_branches() {
    init_test_logging();
    let index = Arc::new(FakeIndexClient::new(Default::default()).with_response(
        IndexSearchResult {
            files: vec![index_file("pub", 9, "a.go", &[(1, "foo", 0, 3)])],
            file_count: 1,
            match_count: 1,
            ..Default::default()
        },
    ));
    let backends = fake_backends(Some(index.clone()), Arc::new(FakeArchiveSearcher::new()), 1);
    let args = TextParameters {
        pattern: PatternInfo::literal("foo"),
        mode: GlobalSearchMode::IndexedUniverse,
        user_private_repos: vec![zoekt_federated::test_utils::repo(7, "secret")],
        ..Default::default()
    };

    let (files, _) = search_files_in_repos_batch(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &args,
    )
    .await
    .unwrap();

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file.repo.id, 9);
    let q = &index.query_log()[0];
    assert!(q.contains("RcOnlyPublic"), "{}", q);
    assert!(q.contains("secret@HEAD"), "{}", q);
}

#[tokio::test]
async fn structural_search_probes_indexed_repos() {
    init_test_logging();
    tracing::info!("TEST START: structural_search_probes_indexed_repos");

    let index = Arc::new(
        FakeIndexClient::new(head_catalog(&[(1, "a"), (2, "b")])).with_listed(&[(1, "a")]),
    );
    let searcher = Arc::new(
        FakeArchiveSearcher::new()
            .with_repo("a", matching("a.go", 1))
            .with_repo("b", matching("b.go", 1))
            .with_repo("c", matching("c.go", 1)),
    );
    let backends = fake_backends(Some(index.clone()), searcher.clone(), 1);
    let repos = vec![
        repo_revs(1, "a", &[]),
        repo_revs(2, "b", &[]),
        repo_revs(3, "c", &[]),
    ];

    let (files, common) = search_files_in_repos_structural(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(PatternInfo::structural("foo(:[args])"), repos),
    )
    .await
    .unwrap();

    let mut uris: Vec<String> = files.iter().map(|f| f.uri()).collect();
    uris.sort();
    assert_eq!(uris, vec!["git://a#a.go", "git://c#c.go"]);

    let calls = searcher.calls();
    assert!(calls.iter().all(|c| c.repo.name != "b"));
    assert!(calls.iter().any(|c| c.repo.name == "a" && c.indexed));
    assert!(calls.iter().any(|c| c.repo.name == "c" && !c.indexed));
    assert!(common.status.get(2).contains(RepoStatus::INDEXED));
    assert!(!common.limit_hit);

    let probe = &index.query_log()[0];
    assert!(probe.contains("TYPE repo"), "{}", probe);
}

#[tokio::test]
async fn structural_search_keeps_requested_revisions_of_probed_repos() {
    init_test_logging();
    let catalog = IndexCatalog {
        repos: vec![indexed_repo(1, "a", &[("HEAD", "c0ffee"), ("release", "beef")])],
    };
    let index = Arc::new(FakeIndexClient::new(catalog).with_listed(&[(1, "a")]));
    let searcher = Arc::new(FakeArchiveSearcher::new().with_repo("a", matching("a.go", 1)));
    let backends = fake_backends(Some(index), searcher.clone(), 1);

    search_files_in_repos_structural(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(
            PatternInfo::structural("foo(:[args])"),
            vec![repo_revs(1, "a", &["release"])],
        ),
    )
    .await
    .unwrap();

    let revs: Vec<String> = searcher.calls().iter().map(|c| c.rev.clone()).collect();
    assert_eq!(revs, vec!["release".to_string()]);
}

#[tokio::test]
async fn structural_repos_limited_by_the_searcher_are_partial() {
    init_test_logging();
    let searcher = Arc::new(FakeArchiveSearcher::new().with_repo(
        "busy",
        RepoBehavior {
            matches: vec![archive_file("a.go", 1)],
            limit_hit: true,
            ..Default::default()
        },
    ));
    let backends = fake_backends(None, searcher, 1);

    let (_, common) = search_files_in_repos_structural(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(
            PatternInfo::structural("foo(:[args])"),
            vec![repo_revs(1, "busy", &[]), repo_revs(2, "calm", &[])],
        ),
    )
    .await
    .unwrap();

    assert!(common.limit_hit);
    assert_eq!(common.partial.iter().collect::<Vec<_>>(), vec!["busy"]);
    assert!(common.status.get(1).contains(RepoStatus::LIMIT_HIT));
}

#[tokio::test]
async fn index_only_structural_runs_exhaustive_query_for_few_files() {
    init_test_logging();
    let index = Arc::new(
        FakeIndexClient::new(head_catalog(&[(1, "a")]))
            .with_response(IndexSearchResult {
                files: vec![index_file("a", 1, "x.go", &[(1, "foo(1)", 0, 6)])],
                file_count: 1,
                ..Default::default()
            })
            .with_response(IndexSearchResult {
                files: vec![
                    index_file("a", 1, "x.go", &[(1, "foo(1)", 0, 6)]),
                    index_file("a", 1, "y.go", &[(4, "foo(\n2)", 0, 7)]),
                ],
                file_count: 2,
                ..Default::default()
            }),
    );
    let backends = fake_backends(Some(index.clone()), Arc::new(FakeArchiveSearcher::new()), 1);
    let info = PatternInfo {
        index: IndexDirective::Only,
        ..PatternInfo::structural("foo(:[x])")
    };

    let (files, common) = search_files_in_repos_structural(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(info, vec![repo_revs(1, "a", &[])]),
    )
    .await
    .unwrap();

    assert_eq!(files.len(), 2);
    assert!(!common.limit_hit);
    let queries = index.query_log();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].contains(r"(foo\().*?(\))"), "{}", queries[0]);
    assert!(queries[1].contains(r"(foo\()(.|\s)*?(\))"), "{}", queries[1]);
}

#[tokio::test]
async fn index_only_structural_keeps_approximate_results_when_plenty() {
    init_test_logging();
    let files: Vec<_> = (0..12)
        .map(|i| index_file("a", 1, &format!("f{:02}.go", i), &[(1, "foo()", 0, 5)]))
        .collect();
    let index = Arc::new(FakeIndexClient::new(head_catalog(&[(1, "a")])).with_response(
        IndexSearchResult {
            files,
            file_count: 12,
            ..Default::default()
        },
    ));
    let backends = fake_backends(Some(index.clone()), Arc::new(FakeArchiveSearcher::new()), 1);
    let info = PatternInfo {
        index: IndexDirective::Only,
        ..PatternInfo::structural("foo(:[x])")
    };

    let (files, common) = search_files_in_repos_structural(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &text_args(info, vec![repo_revs(1, "a", &[])]),
    )
    .await
    .unwrap();

    assert_eq!(files.len(), 12);
    assert_eq!(index.query_log().len(), 1);
    assert!(common.limit_hit);
    assert!(common.partial.contains("a"));
}

#[tokio::test(start_paused = true)]
async fn index_only_structural_reports_budget_exhaustion() {
    init_test_logging();
    let index = Arc::new(
        FakeIndexClient::new(head_catalog(&[(1, "a")])).with_delay(Duration::from_secs(3)),
    );
    let backends = fake_backends(Some(index), Arc::new(FakeArchiveSearcher::new()), 1);
    let cfg = FederationConfig {
        index_max_wall_time: Duration::from_secs(2),
        ..Default::default()
    };
    let info = PatternInfo {
        index: IndexDirective::Only,
        ..PatternInfo::structural("foo(:[x])")
    };

    let err = search_files_in_repos_structural(
        &SearchContext::background(),
        &backends,
        &cfg,
        &text_args(info, vec![repo_revs(1, "a", &[])]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SearchError::NoResultsInTimeout));
}

fn searcher_env(repos: &[&str]) -> JobEnv {
    let mut searcher = FakeArchiveSearcher::new();
    for r in repos {
        searcher = searcher.with_repo(r, matching("f.go", 1));
    }
    JobEnv {
        backends: fake_backends(None, Arc::new(searcher), 1),
        cfg: FederationConfig::default(),
    }
}

fn text_job(repos: &[(i32, &str)]) -> Job {
    Job::Search(SearchJob::Text(text_args(
        PatternInfo::literal("foo"),
        repos.iter().map(|(id, n)| repo_revs(*id, n, &[])).collect(),
    )))
}

#[tokio::test]
async fn or_job_deduplicates_files() {
    init_test_logging();
    let env = searcher_env(&["a", "b", "c"]);
    let job = Job::Or(vec![
        text_job(&[(1, "a"), (2, "b")]),
        text_job(&[(2, "b"), (3, "c")]),
    ]);
    let agg = Arc::new(AggregatingStream::new());
    job.run(&SearchContext::background(), &env, agg.clone())
        .await
        .unwrap();

    let mut uris: Vec<String> = agg.results().iter().map(|m| m.uri()).collect();
    uris.sort();
    assert_eq!(uris, vec!["git://a#f.go", "git://b#f.go", "git://c#f.go"]);
}

#[tokio::test]
async fn and_job_intersects_files() {
    init_test_logging();
    let env = searcher_env(&["a", "b", "c"]);
    let job = Job::And(vec![
        text_job(&[(1, "a"), (2, "b")]),
        text_job(&[(2, "b"), (3, "c")]),
    ]);
    let agg = Arc::new(AggregatingStream::new());
    job.run(&SearchContext::background(), &env, agg.clone())
        .await
        .unwrap();

    let uris: Vec<String> = agg.results().iter().map(|m| m.uri()).collect();
    assert_eq!(uris, vec!["git://b#f.go"]);
}

#[tokio::test(start_paused = true)]
async fn priority_job_cancels_slow_optional_child() {
    init_test_logging();
    let searcher = FakeArchiveSearcher::new().with_repo(
        "slow",
        RepoBehavior {
            delay: Some(Duration::from_secs(10)),
            matches: vec![archive_file("late.go", 1)],
            ..Default::default()
        },
    );
    let env = JobEnv {
        backends: fake_backends(None, Arc::new(searcher), 1),
        cfg: FederationConfig::default(),
    };
    let job = Job::priority(Job::noop(), text_job(&[(1, "slow")]));
    let agg = Arc::new(AggregatingStream::new());

    let started = tokio::time::Instant::now();
    job.run(&SearchContext::background(), &env, agg.clone())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(agg.results().is_empty());
}

#[tokio::test(start_paused = true)]
async fn priority_job_fails_without_waiting_for_grace() {
    init_test_logging();
    let searcher = FakeArchiveSearcher::new()
        .with_repo(
            "broken",
            RepoBehavior {
                error: Some(BackendError::Other("boom".into())),
                ..Default::default()
            },
        )
        .with_repo(
            "slow",
            RepoBehavior {
                delay: Some(Duration::from_secs(10)),
                matches: vec![archive_file("late.go", 1)],
                ..Default::default()
            },
        );
    let env = JobEnv {
        backends: fake_backends(None, Arc::new(searcher), 1),
        cfg: FederationConfig {
            priority_grace: Duration::from_secs(60),
            ..Default::default()
        },
    };
    let job = Job::priority(text_job(&[(1, "broken")]), text_job(&[(2, "slow")]));

    let started = tokio::time::Instant::now();
    let err = job
        .run(
            &SearchContext::background(),
            &env,
            Arc::new(AggregatingStream::new()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SearchError::Repo { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn limit_job_caps_results() {
    init_test_logging();
    let env = searcher_env(&["a", "b", "c"]);
    let job = Job::limit(1, text_job(&[(1, "a"), (2, "b"), (3, "c")]));
    let agg = Arc::new(AggregatingStream::new());
    job.run(&SearchContext::background(), &env, agg.clone())
        .await
        .unwrap();

    assert_eq!(agg.results().len(), 1);
    assert!(agg.stats().is_limit_hit);
}
