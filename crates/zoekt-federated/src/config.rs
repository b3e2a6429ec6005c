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

use anyhow::{bail, Result};
use std::fs;
use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs of the federated search engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FederationConfig {
    /// Cap on repository revisions fanned out to the archive searcher per query.
    pub max_unindexed_repo_rev_searches: usize,
    /// Admission slots per live searcher endpoint.
    pub limiter_slots_per_endpoint: usize,
    /// Per-archive fetch timeout when a query spans many repositories.
    pub many_repos_fetch_timeout: Duration,
    /// Fetch timeout used when the caller set no deadline at all.
    pub no_deadline_fetch_timeout: Duration,
    pub default_max_search_results: usize,
    pub index_max_wall_time: Duration,
    /// Below this many candidate files the structural probe is followed by
    /// an exhaustive index query.
    pub short_circuit_file_threshold: usize,
    pub max_line_matches_base: usize,
    /// How long optional work may keep running after required work finished.
    pub priority_grace: Duration,
    pub searcher_endpoints: Vec<String>,
    pub index_endpoint: Option<String>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_unindexed_repo_rev_searches: 200,
            limiter_slots_per_endpoint: 32,
            many_repos_fetch_timeout: Duration::from_millis(500),
            no_deadline_fetch_timeout: Duration::from_secs(60),
            default_max_search_results: 30,
            index_max_wall_time: Duration::from_secs(20),
            short_circuit_file_threshold: 10,
            max_line_matches_base: 25,
            priority_grace: Duration::from_millis(100),
            searcher_endpoints: Vec::new(),
            index_endpoint: None,
        }
    }
}

/// CLI-level options that binaries pass to `load_federation_config`.
#[derive(Clone, Debug, Default)]
pub struct MergeOpts {
    pub config_path: Option<std::path::PathBuf>,
    pub cli_index_endpoint: Option<String>,
    pub cli_searcher_endpoints: Vec<String>,
    pub cli_max_unindexed: Option<usize>,
    pub cli_short_circuit_file_threshold: Option<usize>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid environment value");
            None
        }
    }
}

fn split_endpoints(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

fn toml_usize(v: &toml::Value, key: &str) -> Option<usize> {
    v.get(key)
        .and_then(|x| x.as_integer())
        .and_then(|x| usize::try_from(x).ok())
}

fn toml_u64(v: &toml::Value, key: &str) -> Option<u64> {
    v.get(key)
        .and_then(|x| x.as_integer())
        .and_then(|x| u64::try_from(x).ok())
}

/// Load and merge FederationConfig from: defaults <- config file <- env vars <- CLI
pub fn load_federation_config(mut base: FederationConfig, opts: MergeOpts) -> Result<FederationConfig> {
    if let Some(path) = opts.config_path.as_ref() {
        if path.exists() {
            let s = fs::read_to_string(path)?;
            let v: toml::Value = toml::from_str(&s)?;
            if let Some(n) = toml_usize(&v, "max_unindexed_repo_rev_searches") {
                base.max_unindexed_repo_rev_searches = n;
            }
            if let Some(n) = toml_usize(&v, "limiter_slots_per_endpoint") {
                base.limiter_slots_per_endpoint = n;
            }
            if let Some(ms) = toml_u64(&v, "many_repos_fetch_timeout_ms") {
                base.many_repos_fetch_timeout = Duration::from_millis(ms);
            }
            if let Some(secs) = toml_u64(&v, "no_deadline_fetch_timeout_seconds") {
                base.no_deadline_fetch_timeout = Duration::from_secs(secs);
            }
            if let Some(n) = toml_usize(&v, "default_max_search_results") {
                base.default_max_search_results = n;
            }
            if let Some(secs) = toml_u64(&v, "index_max_wall_time_seconds") {
                base.index_max_wall_time = Duration::from_secs(secs);
            }
            if let Some(n) = toml_usize(&v, "short_circuit_file_threshold") {
                base.short_circuit_file_threshold = n;
            }
            if let Some(n) = toml_usize(&v, "max_line_matches_base") {
                base.max_line_matches_base = n;
            }
            if let Some(ms) = toml_u64(&v, "priority_grace_ms") {
                base.priority_grace = Duration::from_millis(ms);
            }
            if let Some(eps) = v.get("searcher_endpoints").and_then(|x| x.as_array()) {
                base.searcher_endpoints = eps
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect();
            }
            if let Some(e) = v.get("index_endpoint").and_then(|x| x.as_str()) {
                base.index_endpoint = Some(e.to_string());
            }
        }
    }

    // env vars override file
    if let Some(n) = env_parse::<usize>("ZOEKTF_MAX_UNINDEXED") {
        base.max_unindexed_repo_rev_searches = n;
    }
    if let Some(n) = env_parse::<usize>("ZOEKTF_LIMITER_SLOTS_PER_ENDPOINT") {
        base.limiter_slots_per_endpoint = n;
    }
    if let Some(ms) = env_parse::<u64>("ZOEKTF_MANY_REPOS_FETCH_TIMEOUT_MS") {
        base.many_repos_fetch_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = env_parse::<u64>("ZOEKTF_INDEX_MAX_WALL_TIME_SECONDS") {
        base.index_max_wall_time = Duration::from_secs(secs);
    }
    if let Some(n) = env_parse::<usize>("ZOEKTF_SHORT_CIRCUIT_FILE_THRESHOLD") {
        base.short_circuit_file_threshold = n;
    }
    if let Ok(eps) = std::env::var("ZOEKTF_SEARCHER_ENDPOINTS") {
        base.searcher_endpoints = split_endpoints(&eps);
    }
    if let Ok(e) = std::env::var("ZOEKTF_INDEX_ENDPOINT") {
        base.index_endpoint = Some(e);
    }

    // CLI overrides everything
    if let Some(e) = opts.cli_index_endpoint {
        base.index_endpoint = Some(e);
    }
    if !opts.cli_searcher_endpoints.is_empty() {
        base.searcher_endpoints = opts.cli_searcher_endpoints;
    }
    if let Some(n) = opts.cli_max_unindexed {
        base.max_unindexed_repo_rev_searches = n;
    }
    if let Some(n) = opts.cli_short_circuit_file_threshold {
        base.short_circuit_file_threshold = n;
    }

    if base.default_max_search_results == 0 {
        bail!("default_max_search_results must be at least 1");
    }
    if base.limiter_slots_per_endpoint == 0 {
        bail!("limiter_slots_per_endpoint must be at least 1");
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, EnvGuard};

    const KEYS: [&str; 7] = [
        "ZOEKTF_MAX_UNINDEXED",
        "ZOEKTF_LIMITER_SLOTS_PER_ENDPOINT",
        "ZOEKTF_MANY_REPOS_FETCH_TIMEOUT_MS",
        "ZOEKTF_INDEX_MAX_WALL_TIME_SECONDS",
        "ZOEKTF_SHORT_CIRCUIT_FILE_THRESHOLD",
        "ZOEKTF_SEARCHER_ENDPOINTS",
        "ZOEKTF_INDEX_ENDPOINT",
    ];

    #[test]
    #[serial_test::serial]
    fn test_defaults_without_sources() {
        init_test_logging();
        let mut env = EnvGuard::new();
        env.save_and_clear(&KEYS);
        let got = load_federation_config(FederationConfig::default(), MergeOpts::default())
            .expect("load");
        assert_eq!(got, FederationConfig::default());
        assert_eq!(got.max_unindexed_repo_rev_searches, 200);
        assert_eq!(got.many_repos_fetch_timeout, Duration::from_millis(500));
    }

    #[test]
    #[serial_test::serial]
    fn test_merge_file_env_cli_precedence() {
        init_test_logging();
        tracing::info!("TEST START: config::tests::test_merge_file_env_cli_precedence");
        let mut env = EnvGuard::new();
        env.save_and_clear(&KEYS);

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let toml = r#"
max_unindexed_repo_rev_searches = 50
limiter_slots_per_endpoint = 8
many_repos_fetch_timeout_ms = 250
short_circuit_file_threshold = 4
searcher_endpoints = ["http://s1", "http://s2"]
index_endpoint = "http://index-file"
"#;
        fs::write(tmp.path(), toml).unwrap();

        env.set("ZOEKTF_MAX_UNINDEXED", "75");
        env.set("ZOEKTF_LIMITER_SLOTS_PER_ENDPOINT", "16");
        env.set("ZOEKTF_INDEX_ENDPOINT", "http://index-env");

        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            cli_max_unindexed: Some(100),
            ..Default::default()
        };

        let got = load_federation_config(FederationConfig::default(), opts).expect("load");
        assert_eq!(got.max_unindexed_repo_rev_searches, 100);
        assert_eq!(got.limiter_slots_per_endpoint, 16);
        assert_eq!(got.many_repos_fetch_timeout, Duration::from_millis(250));
        assert_eq!(got.short_circuit_file_threshold, 4);
        assert_eq!(got.searcher_endpoints, vec!["http://s1", "http://s2"]);
        assert_eq!(got.index_endpoint.as_deref(), Some("http://index-env"));
        tracing::info!("TEST END: config::tests::test_merge_file_env_cli_precedence");
    }

    #[test]
    #[serial_test::serial]
    fn test_env_endpoints_are_split() {
        init_test_logging();
        let mut env = EnvGuard::new();
        env.save_and_clear(&KEYS);
        env.set("ZOEKTF_SEARCHER_ENDPOINTS", "http://a, http://b,,");
        let got = load_federation_config(FederationConfig::default(), MergeOpts::default())
            .expect("load");
        assert_eq!(got.searcher_endpoints, vec!["http://a", "http://b"]);

        let opts = MergeOpts {
            cli_searcher_endpoints: vec!["http://cli".into()],
            ..Default::default()
        };
        let got = load_federation_config(FederationConfig::default(), opts).expect("load");
        assert_eq!(got.searcher_endpoints, vec!["http://cli"]);
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_env_is_ignored() {
        init_test_logging();
        let mut env = EnvGuard::new();
        env.save_and_clear(&KEYS);

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        fs::write(tmp.path(), "max_unindexed_repo_rev_searches = 12\n").unwrap();
        env.set("ZOEKTF_MAX_UNINDEXED", "not-a-number");
        env.set("ZOEKTF_MANY_REPOS_FETCH_TIMEOUT_MS", "-3");

        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let got = load_federation_config(FederationConfig::default(), opts).expect("load");
        assert_eq!(got.max_unindexed_repo_rev_searches, 12);
        assert_eq!(got.many_repos_fetch_timeout, Duration::from_millis(500));
    }

    #[test]
    #[serial_test::serial]
    fn test_missing_file_keeps_defaults_and_bad_toml_errors() {
        init_test_logging();
        let mut env = EnvGuard::new();
        env.save_and_clear(&KEYS);
        let opts = MergeOpts {
            config_path: Some("/nonexistent/zoektf.toml".into()),
            ..Default::default()
        };
        let got = load_federation_config(FederationConfig::default(), opts).expect("load");
        assert_eq!(got, FederationConfig::default());

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        fs::write(tmp.path(), "max_unindexed_repo_rev_searches = [").unwrap();
        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        assert!(load_federation_config(FederationConfig::default(), opts).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_zero_limits_are_rejected() {
        init_test_logging();
        let mut env = EnvGuard::new();
        env.save_and_clear(&KEYS);

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        fs::write(tmp.path(), "default_max_search_results = 0\n").unwrap();
        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let err = load_federation_config(FederationConfig::default(), opts).unwrap_err();
        assert!(err.to_string().contains("default_max_search_results"));

        env.set("ZOEKTF_LIMITER_SLOTS_PER_ENDPOINT", "0");
        let err = load_federation_config(FederationConfig::default(), MergeOpts::default())
            .unwrap_err();
        assert!(err.to_string().contains("limiter_slots_per_endpoint"));
    }
}
