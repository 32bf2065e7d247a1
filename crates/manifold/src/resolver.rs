//! Revision resolution: ambiguous references to immutable identifiers.
//!
//! Branch and tag names resolve through the repository client's remote-ref
//! lookup, chart constraints through semver maximum-satisfying selection,
//! and OCI references through the registry's digest conversion. Repository
//! resolutions are memoized briefly through the cache layer.

use std::sync::Arc;

use semver::{Version, VersionReq};

use crate::cache::ManifestCache;
use crate::client::ClientProvider;
use crate::error::GenerateError;
use crate::types::{ResolvedRevision, SourceKind, SourceRef, is_commit_sha};

pub struct Resolver {
    cache: Arc<ManifestCache>,
    provider: Arc<dyn ClientProvider>,
}

impl Resolver {
    pub fn new(cache: Arc<ManifestCache>, provider: Arc<dyn ClientProvider>) -> Self {
        Self { cache, provider }
    }

    /// Resolve `ambiguous` (or the source's target revision when empty) to
    /// an immutable identifier for the source's backend.
    pub async fn resolve(
        &self,
        source: &SourceRef,
        ambiguous: &str,
        no_revision_cache: bool,
    ) -> Result<ResolvedRevision, GenerateError> {
        let ambiguous = if ambiguous.is_empty() {
            source.target_revision.as_str()
        } else {
            ambiguous
        };
        match source.kind {
            SourceKind::Repo => {
                self.resolve_repo(&source.url, ambiguous, no_revision_cache)
                    .await
            }
            SourceKind::Chart => {
                let chart = source.chart.as_deref().unwrap_or_default();
                self.resolve_chart(&source.url, chart, ambiguous, no_revision_cache)
                    .await
            }
            SourceKind::Oci => {
                self.resolve_oci(&source.url, ambiguous, no_revision_cache)
                    .await
            }
        }
    }

    async fn resolve_repo(
        &self,
        url: &str,
        ambiguous: &str,
        no_revision_cache: bool,
    ) -> Result<ResolvedRevision, GenerateError> {
        let ambiguous = if ambiguous.is_empty() { "HEAD" } else { ambiguous };
        if is_commit_sha(ambiguous) {
            return Ok(ResolvedRevision(ambiguous.to_string()));
        }
        if !no_revision_cache {
            if let Some(cached) = self.cache.get_resolved_revision(url, ambiguous).await {
                return Ok(cached);
            }
        }

        let client = self
            .provider
            .repo_client(url)
            .map_err(|e| resolve_failure(url, ambiguous, &e))?;
        let hash = client
            .ls_remote(ambiguous)
            .await
            .map_err(|e| resolve_failure(url, ambiguous, &e))?;
        let resolved = ResolvedRevision(hash);
        self.cache
            .set_resolved_revision(url, ambiguous, &resolved)
            .await;
        Ok(resolved)
    }

    async fn resolve_chart(
        &self,
        url: &str,
        chart: &str,
        ambiguous: &str,
        no_revision_cache: bool,
    ) -> Result<ResolvedRevision, GenerateError> {
        let constraint = if ambiguous.is_empty() { "*" } else { ambiguous };
        // A fully qualified version is taken verbatim.
        if Version::parse(constraint).is_ok() {
            return Ok(ResolvedRevision(constraint.to_string()));
        }

        let req = VersionReq::parse(constraint)
            .map_err(|e| resolve_failure(url, constraint, &anyhow::anyhow!(e)))?;
        let client = self
            .provider
            .chart_client(url)
            .map_err(|e| resolve_failure(url, constraint, &e))?;
        let versions = client
            .versions(chart, no_revision_cache)
            .await
            .map_err(|e| resolve_failure(url, constraint, &e))?;

        let best = versions
            .iter()
            .filter_map(|v| Version::parse(v.trim_start_matches('v')).ok().map(|p| (p, v)))
            .filter(|(parsed, _)| req.matches(parsed))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, raw)| raw.clone());

        match best {
            Some(version) => Ok(ResolvedRevision(version)),
            None => Err(GenerateError::ResolveFailure {
                url: url.to_string(),
                revision: constraint.to_string(),
                detail: format!(
                    "no version of chart `{chart}` satisfies `{constraint}` ({} available)",
                    versions.len()
                ),
            }),
        }
    }

    async fn resolve_oci(
        &self,
        url: &str,
        ambiguous: &str,
        no_revision_cache: bool,
    ) -> Result<ResolvedRevision, GenerateError> {
        let client = self
            .provider
            .oci_client(url)
            .map_err(|e| resolve_failure(url, ambiguous, &e))?;
        let digest = client
            .resolve_revision(ambiguous, no_revision_cache)
            .await
            .map_err(|e| resolve_failure(url, ambiguous, &e))?;
        Ok(ResolvedRevision(digest))
    }
}

fn resolve_failure(url: &str, revision: &str, err: &anyhow::Error) -> GenerateError {
    GenerateError::ResolveFailure {
        url: url.to_string(),
        revision: revision.to_string(),
        detail: format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::{MockChartClient, MockRepoClient, StaticProvider};
    use manifold_backoff::PauseConfig;
    use std::time::Duration;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    fn cache() -> Arc<ManifestCache> {
        Arc::new(ManifestCache::new(
            Arc::new(MemoryStore::new()),
            PauseConfig::default(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        ))
    }

    fn repo_source(url: &str, rev: &str) -> SourceRef {
        SourceRef {
            url: url.to_string(),
            target_revision: rev.to_string(),
            ..SourceRef::default()
        }
    }

    #[tokio::test]
    async fn commit_sha_short_circuits_without_network() {
        let provider = Arc::new(StaticProvider::default());
        // No client registered: resolution must not need one.
        let resolver = Resolver::new(cache(), provider);
        let resolved = resolver
            .resolve(&repo_source("https://example.com/r", SHA), "", false)
            .await
            .expect("resolve");
        assert_eq!(resolved.as_str(), SHA);
    }

    #[tokio::test]
    async fn branch_resolves_through_ls_remote_and_caches() {
        let repo = MockRepoClient::new("https://example.com/r", "/unused");
        repo.add_ref("main", SHA);
        let provider = Arc::new(StaticProvider::default().with_repo(repo.clone()));
        let resolver = Resolver::new(cache(), provider);

        let source = repo_source("https://example.com/r", "main");
        let resolved = resolver.resolve(&source, "", false).await.expect("resolve");
        assert_eq!(resolved.as_str(), SHA);
        assert_eq!(repo.ls_remote_calls(), 1);

        // Second resolution is served from the cache.
        let resolved = resolver.resolve(&source, "", false).await.expect("resolve");
        assert_eq!(resolved.as_str(), SHA);
        assert_eq!(repo.ls_remote_calls(), 1);
    }

    #[tokio::test]
    async fn no_revision_cache_bypasses_memoization() {
        let repo = MockRepoClient::new("https://example.com/r", "/unused");
        repo.add_ref("main", SHA);
        let provider = Arc::new(StaticProvider::default().with_repo(repo.clone()));
        let resolver = Resolver::new(cache(), provider);

        let source = repo_source("https://example.com/r", "main");
        resolver.resolve(&source, "", true).await.expect("resolve");
        resolver.resolve(&source, "", true).await.expect("resolve");
        assert_eq!(repo.ls_remote_calls(), 2);
    }

    #[tokio::test]
    async fn unknown_ref_is_a_resolve_failure() {
        let repo = MockRepoClient::new("https://example.com/r", "/unused");
        let provider = Arc::new(StaticProvider::default().with_repo(repo));
        let resolver = Resolver::new(cache(), provider);

        let err = resolver
            .resolve(&repo_source("https://example.com/r", "missing"), "", false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, GenerateError::ResolveFailure { .. }));
    }

    #[tokio::test]
    async fn explicit_revision_argument_overrides_target() {
        let repo = MockRepoClient::new("https://example.com/r", "/unused");
        repo.add_ref("release", SHA);
        let provider = Arc::new(StaticProvider::default().with_repo(repo));
        let resolver = Resolver::new(cache(), provider);

        let resolved = resolver
            .resolve(&repo_source("https://example.com/r", "main"), "release", false)
            .await
            .expect("resolve");
        assert_eq!(resolved.as_str(), SHA);
    }

    fn chart_source(url: &str, chart: &str, constraint: &str) -> SourceRef {
        SourceRef {
            kind: SourceKind::Chart,
            url: url.to_string(),
            chart: Some(chart.to_string()),
            target_revision: constraint.to_string(),
            ..SourceRef::default()
        }
    }

    #[tokio::test]
    async fn exact_chart_version_is_accepted_verbatim() {
        let provider = Arc::new(StaticProvider::default());
        let resolver = Resolver::new(cache(), provider);
        let resolved = resolver
            .resolve(&chart_source("https://charts.example.com", "app", "1.2.3"), "", false)
            .await
            .expect("resolve");
        assert_eq!(resolved.as_str(), "1.2.3");
    }

    #[tokio::test]
    async fn chart_constraint_selects_maximum_matching() {
        let charts = MockChartClient::new(
            "https://charts.example.com",
            &["0.9.0", "1.0.0", "1.4.2", "1.9.9", "2.0.0"],
        );
        let provider = Arc::new(StaticProvider::default().with_chart(charts));
        let resolver = Resolver::new(cache(), provider);

        let resolved = resolver
            .resolve(&chart_source("https://charts.example.com", "app", "^1.0"), "", false)
            .await
            .expect("resolve");
        assert_eq!(resolved.as_str(), "1.9.9");
    }

    #[tokio::test]
    async fn chart_constraint_with_no_match_fails() {
        let charts = MockChartClient::new("https://charts.example.com", &["0.1.0"]);
        let provider = Arc::new(StaticProvider::default().with_chart(charts));
        let resolver = Resolver::new(cache(), provider);

        let err = resolver
            .resolve(&chart_source("https://charts.example.com", "app", ">=3.0"), "", false)
            .await
            .expect_err("should fail");
        assert!(matches!(err, GenerateError::ResolveFailure { .. }));
    }
}
