// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
//! Resolution of GitHub references into concrete, fetchable locations.
//!
//! A reference (`github:owner/repo@ref/path`, a github.com URL or a bare
//! `owner/repo`) is parsed, its ref resolved to the repository's default
//! branch when missing, and the recursive file tree for that ref listed.

mod reference;
mod transport;

use std::{collections::HashMap, sync::Arc};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, span, warn, Instrument, Level, Span};

use crate::banks::{normalize_bank_prefix, SamplePaths};
use crate::bridge::PendingImport;
use crate::config::GithubSettings;
use crate::scan;

pub use reference::{parse_reference, GithubReference};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};

#[derive(Clone, Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid GitHub reference {input:?}: {reason}")]
    InvalidReference { input: String, reason: String },
    #[error("GitHub API rate limit exceeded while fetching {url}; wait a while before trying again")]
    RateLimited { url: String },
    #[error("GitHub request to {url} failed with status {status}")]
    Http { status: u16, url: String },
    #[error("unexpected response from {url}: {reason}")]
    Protocol { url: String, reason: String },
    #[error("GitHub request failed: {0}")]
    Transport(#[from] TransportError),
}

impl ResolveError {
    /// True when the caller should wait instead of retrying right away.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ResolveError::RateLimited { .. })
    }
}

/// A reference with its ref pinned down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSource {
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
    pub path: String,
}

/// One entry of a recursive tree listing.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl TreeEntry {
    pub fn is_file(&self) -> bool {
        self.kind == "blob"
    }
}

#[derive(Deserialize)]
struct RepoResponse {
    default_branch: Option<String>,
}

/// A default branch lookup, shared by everyone resolving the same repository.
type BranchLookup = Shared<BoxFuture<'static, Result<String, ResolveError>>>;

/// Resolves references and lists trees. Default branches are cached for the
/// lifetime of the resolver.
pub struct GithubResolver {
    transport: Arc<dyn HttpTransport>,
    api_base: String,
    raw_base: String,
    default_branches: Mutex<HashMap<(String, String), BranchLookup>>,
    span: Span,
}

impl GithubResolver {
    /// Creates a resolver talking to the given API and raw-content hosts.
    pub fn new(transport: Arc<dyn HttpTransport>, settings: &GithubSettings) -> GithubResolver {
        GithubResolver {
            transport,
            api_base: settings.api_base().trim_end_matches('/').to_string(),
            raw_base: settings.raw_base().trim_end_matches('/').to_string(),
            default_branches: Mutex::new(HashMap::new()),
            span: span!(Level::INFO, "resolver"),
        }
    }

    /// Creates a resolver using the reqwest transport.
    pub fn from_settings(settings: &GithubSettings) -> Result<GithubResolver, ResolveError> {
        let transport = ReqwestTransport::new(settings.user_agent(), settings.token())?;
        Ok(GithubResolver::new(Arc::new(transport), settings))
    }

    /// Parses the input and fills in the default branch when no ref was given.
    pub async fn resolve(&self, input: &str) -> Result<ResolvedSource, ResolveError> {
        let reference = parse_reference(input)?;
        let git_ref = match reference.git_ref {
            Some(git_ref) => git_ref,
            None => {
                self.default_branch(&reference.owner, &reference.repo)
                    .await?
            }
        };
        Ok(ResolvedSource {
            owner: reference.owner,
            repo: reference.repo,
            git_ref,
            path: reference.path,
        })
    }

    /// Looks up the default branch of a repository, consulting the cache first.
    /// Concurrent lookups of one repository share a single request; a failed
    /// lookup is forgotten so it can be retried.
    pub async fn default_branch(&self, owner: &str, repo: &str) -> Result<String, ResolveError> {
        let key = (owner.to_ascii_lowercase(), repo.to_ascii_lowercase());
        let (lookup, fresh) = {
            let mut branches = self.default_branches.lock();
            match branches.get(&key) {
                Some(lookup) => {
                    debug!(parent: &self.span, owner, repo, done = lookup.peek().is_some(), "Using cached default branch.");
                    (lookup.clone(), false)
                }
                None => {
                    let url = format!("{}/repos/{}/{}", self.api_base, owner, repo);
                    let lookup = lookup_default_branch(self.transport.clone(), url)
                        .instrument(self.span.clone())
                        .boxed()
                        .shared();
                    branches.insert(key.clone(), lookup.clone());
                    (lookup, true)
                }
            }
        };

        let result = lookup.clone().await;
        match &result {
            Ok(branch) if fresh => {
                info!(parent: &self.span, owner, repo, branch = %branch, "Resolved default branch.");
            }
            Ok(_) => {}
            Err(_) => {
                let mut branches = self.default_branches.lock();
                if branches
                    .get(&key)
                    .is_some_and(|current| current.ptr_eq(&lookup))
                {
                    branches.remove(&key);
                }
            }
        }
        result
    }

    /// Lists every entry of the repository tree at the resolved ref.
    pub async fn list_tree(&self, source: &ResolvedSource) -> Result<Vec<TreeEntry>, ResolveError> {
        let url = format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.api_base, source.owner, source.repo, source.git_ref
        );
        let body = self.fetch(&url).instrument(self.span.clone()).await?;

        let protocol = |reason: String| ResolveError::Protocol {
            url: url.clone(),
            reason,
        };
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| protocol(e.to_string()))?;
        let entries = value
            .get("tree")
            .filter(|tree| tree.is_array())
            .cloned()
            .ok_or_else(|| protocol("missing tree array".into()))?;
        let entries: Vec<TreeEntry> =
            serde_json::from_value(entries).map_err(|e| protocol(e.to_string()))?;

        if value.get("truncated").and_then(|t| t.as_bool()) == Some(true) {
            warn!(parent: &self.span, url, "GitHub truncated the tree listing.");
        }
        Ok(entries)
    }

    /// Returns the raw-content URL of a file in the resolved source.
    pub fn raw_url(&self, source: &ResolvedSource, path: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.raw_base,
            source.owner,
            source.repo,
            source.git_ref,
            path.trim_start_matches('/')
        )
    }

    /// Builds a pending import for every audio file below the resolved path,
    /// grouped into one sound per first-level directory.
    pub fn build_import(
        &self,
        source: &ResolvedSource,
        tree: &[TreeEntry],
        label: Option<&str>,
    ) -> PendingImport {
        let prefix = if source.path.is_empty() {
            String::new()
        } else {
            format!("{}/", source.path)
        };

        let relative = tree
            .iter()
            .filter(|entry| entry.is_file() && scan::is_audio_path(&entry.path))
            .filter_map(|entry| entry.path.strip_prefix(&prefix))
            .map(str::to_string);
        let map = scan::group_by_category(relative)
            .into_iter()
            .map(|(category, files)| (category, SamplePaths::Many(files)))
            .collect();

        let default_label = source
            .path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&source.repo);
        let label = normalize_bank_prefix(label.unwrap_or(default_label));

        PendingImport {
            label: if label.is_empty() {
                source.repo.clone()
            } else {
                label
            },
            base_url: Some(format!("{}/", self.raw_url(source, &source.path).trim_end_matches('/'))),
            map,
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, ResolveError> {
        fetch(self.transport.as_ref(), url).await
    }
}

async fn fetch(transport: &dyn HttpTransport, url: &str) -> Result<String, ResolveError> {
    debug!(url, "Fetching.");
    let response = transport.get(url).await?;
    match response.status {
        _ if response.is_success() => Ok(response.body),
        403 => Err(ResolveError::RateLimited {
            url: url.to_string(),
        }),
        status => Err(ResolveError::Http {
            status,
            url: url.to_string(),
        }),
    }
}

async fn lookup_default_branch(
    transport: Arc<dyn HttpTransport>,
    url: String,
) -> Result<String, ResolveError> {
    let body = fetch(transport.as_ref(), &url).await?;
    let response: RepoResponse =
        serde_json::from_str(&body).map_err(|e| ResolveError::Protocol {
            url: url.clone(),
            reason: e.to_string(),
        })?;
    response
        .default_branch
        .filter(|branch| !branch.is_empty())
        .ok_or_else(|| ResolveError::Protocol {
            url,
            reason: "missing default_branch".into(),
        })
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;

    /// Replays canned responses and records requested URLs.
    #[derive(Default)]
    struct CannedTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<String>>,
    }

    impl CannedTransport {
        fn with(responses: Vec<(u16, &str)>) -> Arc<CannedTransport> {
            Arc::new(CannedTransport {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|(status, body)| HttpResponse {
                            status,
                            body: body.to_string(),
                        })
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
            self.requests.lock().push(url.to_string());
            tokio::task::yield_now().await;
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| TransportError("no canned response".into()))
        }
    }

    fn resolver(transport: Arc<CannedTransport>) -> GithubResolver {
        GithubResolver::new(transport, &GithubSettings::default())
    }

    #[tokio::test]
    async fn test_default_branch_is_cached() {
        let transport = CannedTransport::with(vec![(200, r#"{"default_branch": "master"}"#)]);
        let resolver = resolver(transport.clone());

        let first = resolver
            .resolve("github:tidalcycles/dirt-samples")
            .await
            .expect("resolves");
        let second = resolver
            .resolve("https://github.com/tidalcycles/dirt-samples")
            .await
            .expect("resolves from cache");

        assert_eq!("master", first.git_ref);
        assert_eq!(first, second);
        assert_eq!(
            vec!["https://api.github.com/repos/tidalcycles/dirt-samples"],
            transport.requests()
        );
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_request() {
        let transport = CannedTransport::with(vec![(200, r#"{"default_branch": "main"}"#)]);
        let resolver = resolver(transport.clone());

        let (first, second) = tokio::join!(resolver.resolve("a/b"), resolver.resolve("github:a/b"));
        assert_eq!("main", first.expect("resolves").git_ref);
        assert_eq!("main", second.expect("resolves").git_ref);
        assert_eq!(1, transport.requests().len());
    }

    #[tokio::test]
    async fn test_failed_lookup_is_retried() {
        let transport = CannedTransport::with(vec![
            (500, ""),
            (200, r#"{"default_branch": "master"}"#),
        ]);
        let resolver = resolver(transport.clone());

        assert!(resolver.resolve("github:a/b").await.is_err());
        let resolved = resolver.resolve("github:a/b").await.expect("resolves");
        assert_eq!("master", resolved.git_ref);
        assert_eq!(2, transport.requests().len());
    }

    #[tokio::test]
    async fn test_explicit_ref_skips_lookup() {
        let transport = CannedTransport::with(vec![]);
        let resolver = resolver(transport.clone());

        let resolved = resolver.resolve("github:a/b@dev/kits").await.expect("resolves");
        assert_eq!("dev", resolved.git_ref);
        assert_eq!("kits", resolved.path);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_is_distinct() {
        let transport = CannedTransport::with(vec![(403, "{}"), (500, "{}")]);
        let resolver = resolver(transport);
        let source = ResolvedSource {
            owner: "a".into(),
            repo: "b".into(),
            git_ref: "main".into(),
            path: String::new(),
        };

        let limited = resolver.list_tree(&source).await.unwrap_err();
        let failed = resolver.list_tree(&source).await.unwrap_err();

        assert!(limited.is_rate_limited());
        assert!(limited.to_string().contains("rate limit"));
        assert!(!failed.is_rate_limited());
        assert!(matches!(failed, ResolveError::Http { status: 500, .. }));
        assert!(failed.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_tree_protocol_errors() {
        let transport =
            CannedTransport::with(vec![(200, r#"{"tree": {}}"#), (200, "not json"), (200, "{}")]);
        let resolver = resolver(transport);
        let source = ResolvedSource {
            owner: "a".into(),
            repo: "b".into(),
            git_ref: "main".into(),
            path: String::new(),
        };

        for _ in 0..3 {
            assert!(matches!(
                resolver.list_tree(&source).await,
                Err(ResolveError::Protocol { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_list_tree_and_build_import() {
        let transport = CannedTransport::with(vec![(
            200,
            r#"{"sha": "x", "truncated": false, "tree": [
                {"path": "kits", "type": "tree"},
                {"path": "kits/bd/1.wav", "type": "blob", "size": 10},
                {"path": "kits/bd/2.WAV", "type": "blob", "size": 10},
                {"path": "kits/sd/a.flac", "type": "blob"},
                {"path": "kits/readme.md", "type": "blob"},
                {"path": "other/hh.wav", "type": "blob"}
            ]}"#,
        )]);
        let resolver = resolver(transport.clone());
        let source = resolver.resolve("github:a/b@main/kits").await.expect("resolves");
        let tree = resolver.list_tree(&source).await.expect("lists");

        assert_eq!(
            vec!["https://api.github.com/repos/a/b/git/trees/main?recursive=1"],
            transport.requests()
        );
        assert_eq!(6, tree.len());

        let import = resolver.build_import(&source, &tree, None);
        assert_eq!("Kits", import.label);
        assert_eq!(
            Some("https://raw.githubusercontent.com/a/b/main/kits/"),
            import.base_url.as_deref()
        );
        assert_eq!(
            Some(&SamplePaths::Many(vec!["bd/1.wav".into(), "bd/2.WAV".into()])),
            import.map.get("bd")
        );
        assert_eq!(
            Some(&SamplePaths::Many(vec!["sd/a.flac".into()])),
            import.map.get("sd")
        );
        assert_eq!(2, import.map.len());
    }

    #[test]
    fn test_raw_url() {
        let resolver = resolver(CannedTransport::with(vec![]));
        let source = ResolvedSource {
            owner: "o".into(),
            repo: "r".into(),
            git_ref: "main".into(),
            path: String::new(),
        };
        assert_eq!(
            "https://raw.githubusercontent.com/o/r/main/a/b.wav",
            resolver.raw_url(&source, "/a/b.wav")
        );
    }
}
