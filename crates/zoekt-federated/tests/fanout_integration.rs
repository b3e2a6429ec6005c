use std::sync::Arc;
use std::time::Duration;

use zoekt_federated::stream::{AggregatingStream, RepoStatus};
use zoekt_federated::test_utils::{
    archive_file, fake_backends, init_test_logging, repo_revs, FakeArchiveSearcher, RepoBehavior,
};
use zoekt_federated::types::{RepoName, RevisionSpecifier};
use zoekt_federated::unindexed::{call_searcher_over_repos, SearcherParameters};
use zoekt_federated::{
    BackendError, FederationConfig, PatternInfo, RepositoryRevisions, SearchContext, SearchError,
};

fn slow_match(path: &str) -> RepoBehavior {
    RepoBehavior {
        delay: Some(Duration::from_secs(1)),
        matches: vec![archive_file(path, 1)],
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn first_error_cancels_siblings_and_drops_their_results() {
    init_test_logging();
    tracing::info!("TEST START: first_error_cancels_siblings_and_drops_their_results");

    let searcher = Arc::new(
        FakeArchiveSearcher::new()
            .with_repo("a", slow_match("a.go"))
            .with_repo(
                "b",
                RepoBehavior {
                    error: Some(BackendError::Other("boom".into())),
                    ..Default::default()
                },
            )
            .with_repo("c", slow_match("c.go")),
    );
    let backends = fake_backends(None, searcher.clone(), 1);
    let cfg = FederationConfig::default();
    let ctx = SearchContext::background();
    let agg = Arc::new(AggregatingStream::new());
    let repos = vec![
        repo_revs(1, "a", &[]),
        repo_revs(2, "b", &[]),
        repo_revs(3, "c", &[]),
    ];

    let err = call_searcher_over_repos(
        &ctx,
        &backends,
        &cfg,
        &SearcherParameters::new(PatternInfo::literal("foo")),
        &repos,
        agg.clone(),
        false,
    )
    .await
    .unwrap_err();

    match err {
        SearchError::Repo { repo_rev, source } => {
            assert_eq!(repo_rev, "b");
            assert_eq!(source, BackendError::Other("boom".into()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(agg.results().is_empty(), "cancelled repos must not contribute");
    assert_eq!(searcher.calls().len(), 3);
    // Cancellation of the fan-out does not reach the caller's context.
    assert!(!ctx.is_canceled());
}

#[tokio::test(start_paused = true)]
async fn matches_streamed_before_the_first_error_are_dropped() {
    init_test_logging();
    tracing::info!("TEST START: matches_streamed_before_the_first_error_are_dropped");

    let searcher = Arc::new(
        FakeArchiveSearcher::new()
            .with_repo(
                "a",
                RepoBehavior {
                    early_matches: vec![archive_file("partial.go", 1)],
                    delay: Some(Duration::from_secs(1)),
                    ..Default::default()
                },
            )
            .with_repo(
                "b",
                RepoBehavior {
                    early_matches: vec![archive_file("before_error.go", 1)],
                    delay: Some(Duration::from_millis(10)),
                    error: Some(BackendError::Other("boom".into())),
                    ..Default::default()
                },
            ),
    );
    let backends = fake_backends(None, searcher, 1);
    let agg = Arc::new(AggregatingStream::new());

    let err = call_searcher_over_repos(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &SearcherParameters::new(PatternInfo::literal("foo")),
        &[repo_revs(1, "a", &[]), repo_revs(2, "b", &[])],
        agg.clone(),
        false,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SearchError::Repo { ref repo_rev, .. } if repo_rev == "b"));
    let uris: Vec<String> = agg.results().iter().map(|m| m.uri()).collect();
    assert!(uris.is_empty(), "unexpected results: {uris:?}");
}

#[tokio::test]
async fn streamed_matches_arrive_once_the_repository_succeeds() {
    init_test_logging();
    let searcher = Arc::new(FakeArchiveSearcher::new().with_repo(
        "a",
        RepoBehavior {
            early_matches: vec![archive_file("early.go", 1)],
            matches: vec![archive_file("late.go", 1)],
            ..Default::default()
        },
    ));
    let backends = fake_backends(None, searcher, 1);
    let agg = Arc::new(AggregatingStream::new());

    call_searcher_over_repos(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &SearcherParameters::new(PatternInfo::literal("foo")),
        &[repo_revs(1, "a", &[])],
        agg.clone(),
        false,
    )
    .await
    .unwrap();

    let mut uris: Vec<String> = agg.results().iter().map(|m| m.uri()).collect();
    uris.sort();
    assert_eq!(uris, vec!["git://a#early.go", "git://a#late.go"]);
    assert_eq!(agg.stats().status.get(1), RepoStatus::SEARCHED);
}

#[tokio::test]
async fn unexpanded_ref_globs_report_missing() {
    init_test_logging();
    let searcher = Arc::new(FakeArchiveSearcher::new());
    let backends = fake_backends(None, searcher.clone(), 1);
    let agg = Arc::new(AggregatingStream::new());
    let globbed = RepositoryRevisions::new(
        RepoName::new(7, "globbed"),
        vec![RevisionSpecifier::RefGlob("refs/heads/*".into())],
    );

    call_searcher_over_repos(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &SearcherParameters::new(PatternInfo::literal("foo")),
        &[globbed, repo_revs(1, "plain", &[])],
        agg.clone(),
        false,
    )
    .await
    .unwrap();

    let stats = agg.stats();
    assert_eq!(stats.status.get(7), RepoStatus::MISSING);
    assert_eq!(stats.status.get(1), RepoStatus::SEARCHED);
    assert_eq!(searcher.calls().len(), 1);
}

#[tokio::test]
async fn transient_errors_become_statuses() {
    init_test_logging();
    tracing::info!("TEST START: transient_errors_become_statuses");

    let searcher = Arc::new(
        FakeArchiveSearcher::new()
            .with_repo(
                "slow",
                RepoBehavior {
                    error: Some(BackendError::Timeout("fetch".into())),
                    ..Default::default()
                },
            )
            .with_repo(
                "gone",
                RepoBehavior {
                    error: Some(BackendError::RepoNotFound("gone".into())),
                    ..Default::default()
                },
            )
            .with_repo(
                "cloning",
                RepoBehavior {
                    error: Some(BackendError::CloneInProgress("cloning".into())),
                    ..Default::default()
                },
            )
            .with_repo(
                "ok",
                RepoBehavior {
                    matches: vec![archive_file("main.go", 2)],
                    limit_hit: true,
                    ..Default::default()
                },
            ),
    );
    let backends = fake_backends(None, searcher, 2);
    let agg = Arc::new(AggregatingStream::new());
    let repos = vec![
        repo_revs(1, "slow", &[]),
        repo_revs(2, "gone", &[]),
        repo_revs(3, "cloning", &[]),
        repo_revs(4, "ok", &[]),
    ];

    call_searcher_over_repos(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &SearcherParameters::new(PatternInfo::literal("foo")),
        &repos,
        agg.clone(),
        false,
    )
    .await
    .unwrap();

    let stats = agg.stats();
    assert_eq!(stats.status.get(1), RepoStatus::TIMEDOUT);
    assert_eq!(stats.status.get(2), RepoStatus::MISSING);
    assert_eq!(stats.status.get(3), RepoStatus::CLONING);
    assert_eq!(stats.status.get(4), RepoStatus::SEARCHED | RepoStatus::LIMIT_HIT);
    assert!(stats.is_limit_hit);

    let results = agg.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].uri(), "git://ok#main.go");
}

#[tokio::test]
async fn file_constraints_skip_repositories() {
    init_test_logging();
    tracing::info!("TEST START: file_constraints_skip_repositories");

    let searcher = Arc::new(
        FakeArchiveSearcher::new()
            .with_repo(
                "has",
                RepoBehavior {
                    matches: vec![archive_file("x.go", 1)],
                    files: vec!["go.mod".into()],
                    ..Default::default()
                },
            )
            .with_repo(
                "lacks",
                RepoBehavior {
                    matches: vec![archive_file("y.go", 1)],
                    files: vec!["Cargo.toml".into()],
                    ..Default::default()
                },
            ),
    );
    let backends = fake_backends(None, searcher, 1);
    let agg = Arc::new(AggregatingStream::new());
    let info = PatternInfo {
        file_patterns_repos_must_include: vec![r"^go\.mod$".into()],
        ..PatternInfo::literal("func")
    };

    call_searcher_over_repos(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &SearcherParameters::new(info),
        &[repo_revs(1, "has", &[]), repo_revs(2, "lacks", &[])],
        agg.clone(),
        false,
    )
    .await
    .unwrap();

    let uris: Vec<String> = agg.results().iter().map(|m| m.uri()).collect();
    assert_eq!(uris, vec!["git://has#x.go".to_string()]);
    // The skipped repository still counts as searched.
    assert_eq!(agg.stats().status.get(2), RepoStatus::SEARCHED);
}

#[tokio::test]
async fn no_endpoints_is_an_error() {
    init_test_logging();
    let backends = fake_backends(None, Arc::new(FakeArchiveSearcher::new()), 0);
    let err = call_searcher_over_repos(
        &SearchContext::background(),
        &backends,
        &FederationConfig::default(),
        &SearcherParameters::new(PatternInfo::literal("x")),
        &[repo_revs(1, "a", &[])],
        Arc::new(AggregatingStream::new()),
        false,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SearchError::NoEndpoints));
}
