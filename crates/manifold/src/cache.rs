//! Typed cache layer over the pluggable store.
//!
//! Two tiers: resolved revisions (brief TTL, saves a network round-trip)
//! and rendered manifests (long TTL, saves a render). Manifest entries are
//! either a success or a memoized failure; the two forms share a key and
//! writing one overwrites the other.
//!
//! Error policy follows the store contract: read failures degrade to a miss
//! with a warning, write failures warn, and only failure-counter updates
//! that cannot be persisted surface as hard errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use manifold_backoff::{FailureWindow, PauseConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::crossref::CrossRefMap;
use crate::error::GenerateError;
use crate::store::{CacheStore, StoreError};
use crate::types::{
    AppIdentity, ChartDetail, ManifestResponse, RenderOptions, ResolvedRevision, RevisionMetadata,
    TrackingMode,
};

/// Everything that can influence rendered output, fingerprinted into the
/// manifest cache key. Equal inputs must yield byte-identical keys.
#[derive(Debug, Serialize)]
pub struct CacheKeyInputs<'a> {
    pub revision: &'a ResolvedRevision,
    pub crossref: &'a CrossRefMap,
    pub path: &'a str,
    pub options: &'a RenderOptions,
    pub app_name: &'a str,
    pub app_namespace: &'a str,
    pub tracking_mode: TrackingMode,
}

impl<'a> CacheKeyInputs<'a> {
    pub fn new(
        revision: &'a ResolvedRevision,
        crossref: &'a CrossRefMap,
        path: &'a str,
        options: &'a RenderOptions,
        app: &'a AppIdentity,
        tracking_mode: TrackingMode,
    ) -> Self {
        Self {
            revision,
            crossref,
            path,
            options,
            app_name: &app.name,
            app_namespace: &app.namespace,
            tracking_mode,
        }
    }

    /// The deterministic fingerprint. serde_json maps are sorted, so the
    /// JSON rendering is canonical for equal inputs.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).expect("cache key inputs serialize");
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())
    }
}

/// One manifest cache record. Success and failure share a key.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CachedManifestEntry {
    Success { response: ManifestResponse },
    Failure {
        #[serde(flatten)]
        window: FailureWindow,
        most_recent_error: String,
    },
}

/// Outcome of a manifest cache probe after the negative-entry rules ran.
#[derive(Debug)]
pub enum CacheProbe {
    /// Nothing usable cached; the caller renders.
    Miss,
    /// A cached success.
    Hit(ManifestResponse),
    /// The key is paused; serve this without rendering.
    Paused(GenerateError),
}

/// Typed operations over the store.
pub struct ManifestCache {
    store: Arc<dyn CacheStore>,
    pause: PauseConfig,
    manifest_ttl: Duration,
    revision_ttl: Duration,
}

impl ManifestCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        pause: PauseConfig,
        manifest_ttl: Duration,
        revision_ttl: Duration,
    ) -> Self {
        Self {
            store,
            pause,
            manifest_ttl,
            revision_ttl,
        }
    }

    fn key(namespace: &str, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{}|{}", namespace, hex::encode(hasher.finalize()))
    }

    async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Err(StoreError::Miss) => None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn set_typed<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(key, error = %e, "failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.store.set(key, bytes, Some(ttl)).await {
            warn!(key, error = %e, "cache write failed");
        }
    }

    // ---- rendered manifests ----

    fn manifests_key(fingerprint: &str) -> String {
        format!("mfst|{fingerprint}")
    }

    /// Probe the manifest cache, applying the negative-entry contract.
    pub async fn probe_manifests(&self, fingerprint: &str) -> Result<CacheProbe, GenerateError> {
        let key = Self::manifests_key(fingerprint);
        let Some(entry) = self.get_typed::<CachedManifestEntry>(&key).await else {
            return Ok(CacheProbe::Miss);
        };
        match entry {
            CachedManifestEntry::Success { response } => Ok(CacheProbe::Hit(response)),
            CachedManifestEntry::Failure {
                mut window,
                most_recent_error,
            } => {
                if !self.pause.should_pause(&window) {
                    return Ok(CacheProbe::Miss);
                }
                if self.pause.pause_expired(&window, Utc::now()) {
                    // Let the next caller attempt a real render.
                    if let Err(e) = self.store.delete(&key).await {
                        warn!(key, error = %e, "failed to drop expired failure record");
                    }
                    return Ok(CacheProbe::Miss);
                }
                window.register_served();
                self.write_failure_record(&key, window, most_recent_error.clone())
                    .await?;
                Ok(CacheProbe::Paused(GenerateError::Memoized {
                    message: most_recent_error,
                }))
            }
        }
    }

    /// Store a successful render, clearing any failure record at the key.
    pub async fn set_manifests(&self, fingerprint: &str, response: &ManifestResponse) {
        let key = Self::manifests_key(fingerprint);
        let entry = CachedManifestEntry::Success {
            response: response.clone(),
        };
        self.set_typed(&key, &entry, self.manifest_ttl).await;
    }

    pub async fn delete_manifests(&self, fingerprint: &str) {
        let key = Self::manifests_key(fingerprint);
        if let Err(e) = self.store.delete(&key).await {
            warn!(key, error = %e, "failed to delete manifest entry");
        }
    }

    /// Record a failed generation attempt. Failure-counter updates are the
    /// one place a store failure is a hard error: losing them would defeat
    /// the backoff.
    pub async fn record_failure(
        &self,
        fingerprint: &str,
        error_message: &str,
    ) -> Result<(), GenerateError> {
        if !self.pause.memoization_enabled() {
            return Ok(());
        }
        let key = Self::manifests_key(fingerprint);
        let mut window = match self.get_typed::<CachedManifestEntry>(&key).await {
            Some(CachedManifestEntry::Failure { window, .. }) => window,
            _ => FailureWindow::default(),
        };
        window.register_failure(Utc::now());
        self.write_failure_record(&key, window, error_message.to_string())
            .await
    }

    async fn write_failure_record(
        &self,
        key: &str,
        window: FailureWindow,
        most_recent_error: String,
    ) -> Result<(), GenerateError> {
        let entry = CachedManifestEntry::Failure {
            window,
            most_recent_error,
        };
        let bytes = serde_json::to_vec(&entry).expect("failure record serializes");
        self.store
            .set(key, bytes, Some(self.manifest_ttl))
            .await
            .map_err(|e| GenerateError::CacheStoreFailure {
                detail: e.to_string(),
            })
    }

    /// Relabel a cached success from one fingerprint to another without
    /// re-rendering. Returns whether an entry was moved. Failure records
    /// are not carried across revisions.
    pub async fn move_manifests(&self, old_fingerprint: &str, new_fingerprint: &str) -> bool {
        let Some(CachedManifestEntry::Success { response }) = self
            .get_typed::<CachedManifestEntry>(&Self::manifests_key(old_fingerprint))
            .await
        else {
            return false;
        };
        self.set_manifests(new_fingerprint, &response).await;
        self.delete_manifests(old_fingerprint).await;
        true
    }

    // ---- resolved revisions ----

    pub async fn get_resolved_revision(
        &self,
        repo_url: &str,
        ambiguous: &str,
    ) -> Option<ResolvedRevision> {
        self.get_typed(&Self::key("rev", &[repo_url, ambiguous])).await
    }

    pub async fn set_resolved_revision(
        &self,
        repo_url: &str,
        ambiguous: &str,
        resolved: &ResolvedRevision,
    ) {
        self.set_typed(
            &Self::key("rev", &[repo_url, ambiguous]),
            resolved,
            self.revision_ttl,
        )
        .await;
    }

    // ---- per-commit metadata ----

    pub async fn get_revision_metadata(
        &self,
        repo_url: &str,
        revision: &str,
    ) -> Option<RevisionMetadata> {
        self.get_typed(&Self::key("meta", &[repo_url, revision])).await
    }

    pub async fn set_revision_metadata(
        &self,
        repo_url: &str,
        revision: &str,
        metadata: &RevisionMetadata,
    ) {
        self.set_typed(
            &Self::key("meta", &[repo_url, revision]),
            metadata,
            self.manifest_ttl,
        )
        .await;
    }

    // ---- per-path directory listings ----

    pub async fn get_directory_listing(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Option<Vec<String>> {
        self.get_typed(&Self::key("ls", &[repo_url, revision, path]))
            .await
    }

    pub async fn set_directory_listing(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
        listing: &[String],
    ) {
        self.set_typed(
            &Self::key("ls", &[repo_url, revision, path]),
            &listing,
            self.manifest_ttl,
        )
        .await;
    }

    // ---- app lists ----

    pub async fn get_app_list(
        &self,
        repo_url: &str,
        revision: &str,
    ) -> Option<std::collections::BTreeMap<String, String>> {
        self.get_typed(&Self::key("apps", &[repo_url, revision])).await
    }

    pub async fn set_app_list(
        &self,
        repo_url: &str,
        revision: &str,
        apps: &std::collections::BTreeMap<String, String>,
    ) {
        self.set_typed(
            &Self::key("apps", &[repo_url, revision]),
            apps,
            self.manifest_ttl,
        )
        .await;
    }

    // ---- file bundles ----

    pub async fn get_file_bundle(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
    ) -> Option<Vec<u8>> {
        self.get_typed(&Self::key("bundle", &[repo_url, revision, pattern]))
            .await
    }

    pub async fn set_file_bundle(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
        bundle: &[u8],
    ) {
        self.set_typed(
            &Self::key("bundle", &[repo_url, revision, pattern]),
            &bundle,
            self.manifest_ttl,
        )
        .await;
    }

    // ---- chart detail ----

    pub async fn get_chart_detail(
        &self,
        repo_url: &str,
        chart: &str,
        version: &str,
    ) -> Option<ChartDetail> {
        self.get_typed(&Self::key("chart", &[repo_url, chart, version]))
            .await
    }

    pub async fn set_chart_detail(
        &self,
        repo_url: &str,
        chart: &str,
        version: &str,
        detail: &ChartDetail,
    ) {
        self.set_typed(
            &Self::key("chart", &[repo_url, chart, version]),
            detail,
            self.manifest_ttl,
        )
        .await;
    }
}
