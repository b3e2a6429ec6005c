use std::sync::Arc;
use std::time::Duration;

use zoekt_federated::limiter::TEXT_SEARCH_LIMITER;
use zoekt_federated::stream::AggregatingStream;
use zoekt_federated::test_utils::{
    archive_file, fake_backends, init_test_logging, repo_revs, FakeArchiveSearcher, RepoBehavior,
};
use zoekt_federated::unindexed::{call_searcher_over_repos, SearcherParameters};
use zoekt_federated::{FederationConfig, PatternInfo, SearchContext};

// The only test in this binary: it owns the process-wide limiter.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_respects_limiter_capacity() {
    init_test_logging();
    tracing::info!("TEST START: fan_out_respects_limiter_capacity");

    let mut searcher = FakeArchiveSearcher::new();
    let mut repos = Vec::new();
    for i in 0..24 {
        let name = format!("repo-{}", i);
        searcher = searcher.with_repo(
            &name,
            RepoBehavior {
                delay: Some(Duration::from_millis(20)),
                matches: vec![archive_file("f.go", 1)],
                ..Default::default()
            },
        );
        repos.push(repo_revs(i, &name, &[]));
    }
    let searcher = Arc::new(searcher);
    let backends = fake_backends(None, searcher.clone(), 2);
    let cfg = FederationConfig {
        limiter_slots_per_endpoint: 2,
        ..Default::default()
    };
    let agg = Arc::new(AggregatingStream::new());

    call_searcher_over_repos(
        &SearchContext::background(),
        &backends,
        &cfg,
        &SearcherParameters::new(PatternInfo::literal("x")),
        &repos,
        agg.clone(),
        false,
    )
    .await
    .unwrap();

    assert_eq!(agg.results().len(), 24);
    assert!(searcher.max_in_flight() <= 4, "max in flight {}", searcher.max_in_flight());
    assert_eq!(TEXT_SEARCH_LIMITER.get_limit(), (4, 0));
}
