//! Manifest generation orchestrator.
//!
//! The top-level entry point composing resolution, cross-resolution, the
//! cache probe (with failure memoization), admission throttling, source
//! acquisition under the tree lock, the double-checked probe, signature
//! verification, render dispatch, and the plugin streaming path whose
//! `tar_done` signal releases the tree lock before the reply arrives.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use globset::{Glob, GlobSetBuilder};
use manifold_sanitizer::Sanitizer;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

use crate::acquire::{
    Closer, ScratchRoot, checkout_repo, ensure_no_escaping_symlinks, extract_archive,
};
use crate::cache::{CacheKeyInputs, CacheProbe, ManifestCache};
use crate::client::{ClientProvider, RepoClient};
use crate::config::CoreConfig;
use crate::crossref::{CrossRefMap, build_crossref_map};
use crate::error::{GenerateError, PluginPhase};
use crate::plugin::{archive_root, spawn_plugin_render, split_manifests};
use crate::render::{
    RenderBackends, RenderContext, RenderOutput, allows_concurrent_hint, detect_strategy,
    normalize_manifests, render_env, substitute_env,
};
use crate::resolver::Resolver;
use crate::source_patch::apply_source_overrides;
use crate::store::CacheStore;
use crate::template::KeyedLocks;
use crate::treelock::TreeLocks;
use crate::types::{
    ChartDetail, EnvEntry, GenerateRequest, ManifestResponse, RenderOptions, RenderStrategy,
    ResolvedRevision, RevisionMetadata, SourceKind,
};

/// The manifest generation core. One per process.
pub struct GenerationEngine {
    config: CoreConfig,
    cache: Arc<ManifestCache>,
    locks: Arc<TreeLocks>,
    scratch: Arc<ScratchRoot>,
    resolver: Resolver,
    provider: Arc<dyn ClientProvider>,
    backends: RenderBackends,
    dep_locks: KeyedLocks,
    semaphore: Option<Arc<Semaphore>>,
    sanitizer: Sanitizer,
    /// Single-flight table: concurrent requests with the same fingerprint
    /// join the render already in progress and share its result.
    inflight: Mutex<HashMap<String, InflightSlot>>,
}

type InflightSlot = Arc<OnceCell<Result<ManifestResponse, GenerateError>>>;

impl GenerationEngine {
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn CacheStore>,
        provider: Arc<dyn ClientProvider>,
        backends: RenderBackends,
    ) -> anyhow::Result<Self> {
        let scratch = Arc::new(ScratchRoot::open(&config.tree.scratch_root)?);
        let cache = Arc::new(ManifestCache::new(
            store,
            config.cache.pause.clone(),
            config.cache.manifest_ttl,
            config.cache.revision_ttl,
        ));
        let resolver = Resolver::new(cache.clone(), provider.clone());
        let semaphore = (config.limits.parallelism_limit > 0)
            .then(|| Arc::new(Semaphore::new(config.limits.parallelism_limit)));
        let sanitizer = Sanitizer::new(config.tree.scratch_root.to_string_lossy().to_string());

        Ok(Self {
            config,
            cache,
            locks: Arc::new(TreeLocks::new()),
            scratch,
            resolver,
            provider,
            backends,
            dep_locks: KeyedLocks::new(),
            semaphore,
            sanitizer,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// The manifest cache; exposed so callers can seed or inspect entries.
    pub fn cache(&self) -> &Arc<ManifestCache> {
        &self.cache
    }

    /// The lock manager; exposed for observability.
    pub fn locks(&self) -> &Arc<TreeLocks> {
        &self.locks
    }

    /// The deterministic manifest-cache fingerprint for a request at a
    /// resolved revision.
    pub fn fingerprint(
        &self,
        request: &GenerateRequest,
        options: &RenderOptions,
        revision: &ResolvedRevision,
        crossref: &CrossRefMap,
    ) -> String {
        CacheKeyInputs::new(
            revision,
            crossref,
            &request.source.path,
            options,
            &request.app,
            request.tracking_mode,
        )
        .fingerprint()
    }

    /// Generate manifests for one request (spec steps 1–12).
    pub async fn generate_manifests(
        &self,
        request: &GenerateRequest,
    ) -> Result<ManifestResponse, GenerateError> {
        self.generate_inner(request)
            .await
            .map_err(|e| e.sanitized(&self.sanitizer))
    }

    async fn generate_inner(
        &self,
        request: &GenerateRequest,
    ) -> Result<ManifestResponse, GenerateError> {
        // Ref-only sources resolve and return empty output.
        if request.source.is_ref_only() {
            let revision = self
                .resolver
                .resolve(&request.source, "", request.no_revision_cache)
                .await?;
            return Ok(ManifestResponse {
                manifests: Vec::new(),
                source_type: String::new(),
                revision: revision.0,
                commands: Vec::new(),
                verify_result: None,
            });
        }

        let revision = self
            .resolver
            .resolve(&request.source, "", request.no_revision_cache)
            .await?;
        // Cross-resolution runs before the probe so the map is part of the
        // key.
        let crossref = build_crossref_map(request, &revision, &self.resolver).await?;

        let mut fingerprint =
            self.fingerprint(request, &request.source.render_options, &revision, &crossref);
        if !request.no_cache {
            match self.cache.probe_manifests(&fingerprint).await? {
                CacheProbe::Hit(mut response) => {
                    debug!(revision = %revision, "manifest cache hit");
                    // Relabeled entries may carry the revision they were
                    // rendered at; the caller gets the one it asked for.
                    response.revision = revision.as_str().to_string();
                    return Ok(response);
                }
                CacheProbe::Paused(err) => return Err(err),
                CacheProbe::Miss => {}
            }
        }

        if request.no_cache {
            return self
                .generate_and_record(request, &revision, &crossref, fingerprint)
                .await;
        }

        // Single-flight: identical requests already rendering are joined
        // instead of rendered again; all of them receive the one result.
        let slot = {
            let mut inflight = self.inflight.lock().expect("inflight table poisoned");
            inflight
                .entry(fingerprint.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let result = slot
            .get_or_init(|| self.generate_and_record(request, &revision, &crossref, fingerprint.clone()))
            .await
            .clone();
        {
            let mut inflight = self.inflight.lock().expect("inflight table poisoned");
            if let Some(current) = inflight.get(&fingerprint) {
                if Arc::ptr_eq(current, &slot) {
                    inflight.remove(&fingerprint);
                }
            }
        }
        result
    }

    async fn generate_and_record(
        &self,
        request: &GenerateRequest,
        revision: &ResolvedRevision,
        crossref: &CrossRefMap,
        fingerprint: String,
    ) -> Result<ManifestResponse, GenerateError> {
        let mut fingerprint = fingerprint;
        match self
            .generate_uncached(request, revision, crossref, &mut fingerprint)
            .await
        {
            Ok(response) => {
                if !request.no_cache {
                    self.cache.set_manifests(&fingerprint, &response).await;
                }
                Ok(response)
            }
            Err(err) => {
                if !request.no_cache && err.counts_toward_pause() {
                    // Losing the counter would defeat the backoff, so a
                    // store failure here replaces the render error.
                    self.cache
                        .record_failure(&fingerprint, &err.to_string())
                        .await?;
                }
                Err(err)
            }
        }
    }

    async fn generate_uncached(
        &self,
        request: &GenerateRequest,
        revision: &ResolvedRevision,
        crossref: &CrossRefMap,
        fingerprint: &mut String,
    ) -> Result<ManifestResponse, GenerateError> {
        // Admission: one slot of the global render budget.
        let _permit = match &self.semaphore {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| GenerateError::Cancelled)?,
            ),
            None => None,
        };

        let source = &request.source;
        let allow_concurrent = allows_concurrent_hint(&source.render_options);

        let (tree_root, app_dir, mut closer, repo_client) = match source.kind {
            SourceKind::Repo => {
                let client = self
                    .provider
                    .repo_client(&source.url)
                    .map_err(acquisition_failure)?;
                let guard = checkout_repo(
                    &self.locks,
                    client.clone(),
                    revision,
                    allow_concurrent,
                    self.config.tree.submodules,
                )
                .await?;
                let tree_root = client.root().to_path_buf();
                let app_dir = app_path(&tree_root, &source.path)?;
                (tree_root, app_dir, Closer::for_tree(guard), Some(client))
            }
            SourceKind::Chart => {
                let client = self
                    .provider
                    .chart_client(&source.url)
                    .map_err(acquisition_failure)?;
                let chart = source.chart.clone().unwrap_or_default();
                let archive = client
                    .fetch_chart(&chart, revision.as_str())
                    .await
                    .map_err(acquisition_failure)?;
                let (path, closer) = extract_archive(
                    archive,
                    &self.scratch,
                    self.config.limits.chart_max_extracted_bytes,
                )
                .await?;
                let app_dir = path.join(&chart);
                (path, app_dir, closer, None)
            }
            SourceKind::Oci => {
                let client = self
                    .provider
                    .oci_client(&source.url)
                    .map_err(acquisition_failure)?;
                let archive = client
                    .fetch_archive(revision.as_str())
                    .await
                    .map_err(acquisition_failure)?;
                let (path, closer) = extract_archive(
                    archive,
                    &self.scratch,
                    self.config.limits.oci_max_extracted_bytes,
                )
                .await?;
                let app_dir = app_path(&path, &source.path)?;
                (path, app_dir, closer, None)
            }
        };

        // Referenced repositories acquire shared before rendering begins;
        // their closers drop when this function returns, so the locks are
        // held for the duration of the render.
        let mut ref_paths = BTreeMap::new();
        let mut ref_closers = Vec::new();
        for (token, entry) in crossref.iter() {
            let client = self
                .provider
                .repo_client(&entry.repo_url)
                .map_err(acquisition_failure)?;
            let guard = checkout_repo(
                &self.locks,
                client.clone(),
                &entry.revision,
                true,
                self.config.tree.submodules,
            )
            .await?;
            ref_paths.insert(token.clone(), client.root().to_path_buf());
            ref_closers.push(Closer::for_tree(guard));
        }
        let _ref_locks_held = ref_closers;

        if !self.config.tree.allow_out_of_bounds_symlinks {
            ensure_no_escaping_symlinks(&tree_root)?;
        }

        // In-tree overrides may adjust tool options; the key is recomputed
        // so the double-check and the write see the patched inputs.
        let patched = apply_source_overrides(&app_dir, &request.app.name, source)
            .map_err(acquisition_failure)?;
        let options = patched.render_options;
        *fingerprint = self.fingerprint(request, &options, revision, crossref);

        // Double-check: another request may have rendered during the wait.
        if !request.no_cache {
            match self.cache.probe_manifests(fingerprint).await? {
                CacheProbe::Hit(mut response) => {
                    debug!("manifest cache populated while waiting for the tree lock");
                    response.revision = revision.as_str().to_string();
                    return Ok(response);
                }
                CacheProbe::Paused(err) => return Err(err),
                CacheProbe::Miss => {}
            }
        }

        let verify_result = match (&repo_client, request.verify_signature) {
            (Some(client), true) => Some(self.verify_signature(client, source, revision).await?),
            _ => None,
        };

        let env = render_env(&request.app, revision, source);
        let strategy = detect_strategy(
            &tree_root,
            &app_dir,
            &options,
            &self.config.render,
            &self.backends.plugins,
        )
        .await;
        info!(
            app = %request.app.name,
            strategy = %strategy,
            revision = %revision.short(),
            "rendering manifests"
        );

        let output = match &strategy {
            RenderStrategy::Plugin(name) => {
                self.render_plugin(name, request, &options, &tree_root, &app_dir, &env, &mut closer)
                    .await?
            }
            other => {
                let ctx = RenderContext {
                    tree_root: &tree_root,
                    app_dir: &app_dir,
                    options: &options,
                    app: &request.app,
                    env: &env,
                    refs: &ref_paths,
                    limits: &self.config.limits,
                };
                crate::render::render(&ctx, other, &self.backends, &self.dep_locks).await?
            }
        };

        let manifests = normalize_manifests(output.values, &request.app, request.tracking_mode);
        Ok(ManifestResponse {
            manifests,
            source_type: strategy.to_string(),
            revision: revision.as_str().to_string(),
            commands: output.commands,
            verify_result,
        })
    }

    /// Verify the signature of what the request targets: the tag object for
    /// annotated tags, the resolved commit otherwise.
    async fn verify_signature(
        &self,
        client: &Arc<dyn RepoClient>,
        source: &crate::types::SourceRef,
        revision: &ResolvedRevision,
    ) -> Result<String, GenerateError> {
        let target = &source.target_revision;
        let to_verify = if !target.is_empty() && client.is_annotated_tag(target).await {
            target.clone()
        } else {
            revision.as_str().to_string()
        };
        client
            .verify_commit_signature(&to_verify)
            .await
            .map_err(|e| GenerateError::AcquisitionFailure {
                reason: format!("signature verification failed: {e:#}"),
            })
    }

    /// The plugin path: stream the archive from a background task and
    /// release the working-tree lock the moment `tar_done` fires; only then
    /// await the rendered reply.
    #[allow(clippy::too_many_arguments)]
    async fn render_plugin(
        &self,
        name: &str,
        request: &GenerateRequest,
        options: &RenderOptions,
        tree_root: &Path,
        app_dir: &Path,
        env: &[(String, String)],
        closer: &mut Closer,
    ) -> Result<RenderOutput, GenerateError> {
        let connection = self.backends.plugins.connect(name)?;
        let configuration =
            connection
                .check_configuration()
                .await
                .map_err(|e| GenerateError::PluginFailure {
                    phase: PluginPhase::Configuration,
                    message: format!("{e:#}"),
                })?;

        let mut plugin_env: Vec<EnvEntry> = env
            .iter()
            .map(|(name, value)| EnvEntry {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        plugin_env.extend(self.backends.plugins.credential_env(&configuration)?);
        if let Some(plugin_options) = &options.plugin {
            for entry in &plugin_options.env {
                plugin_env.push(EnvEntry {
                    name: entry.name.clone(),
                    value: substitute_env(&entry.value, env),
                });
            }
        }

        let root = archive_root(
            tree_root,
            app_dir,
            &request.app.annotations,
            request.use_manifest_generate_paths,
        );
        let channels = spawn_plugin_render(
            connection,
            root,
            self.config.plugin.tar_exclusions.clone(),
            plugin_env,
        );

        match channels.tar_done.await {
            Ok(()) => {
                // The archive is on the wire; the tree may move on.
                if let Some(mut guard) = closer.take_guard() {
                    guard.release();
                }
            }
            Err(_) => {
                return Err(channels.error.await.unwrap_or(GenerateError::PluginFailure {
                    phase: PluginPhase::Stream,
                    message: "plugin stream ended unexpectedly".to_string(),
                }));
            }
        }

        match channels.response.await {
            Ok(response) => {
                let values = split_manifests(&response.manifests)?;
                Ok(RenderOutput {
                    values,
                    commands: vec![format!("generate {name}")],
                    images: Vec::new(),
                })
            }
            Err(_) => Err(channels.error.await.unwrap_or(GenerateError::PluginFailure {
                phase: PluginPhase::Response,
                message: "plugin exchange ended without a response".to_string(),
            })),
        }
    }

    /// Commit metadata for the detail endpoint, cached per commit.
    pub async fn get_revision_metadata(
        &self,
        url: &str,
        revision: &str,
        no_cache: bool,
    ) -> Result<RevisionMetadata, GenerateError> {
        if !no_cache {
            if let Some(metadata) = self.cache.get_revision_metadata(url, revision).await {
                return Ok(metadata);
            }
        }
        let client = self.provider.repo_client(url).map_err(acquisition_failure)?;
        let metadata = client
            .revision_metadata(revision)
            .await
            .map_err(acquisition_failure)?;
        self.cache
            .set_revision_metadata(url, revision, &metadata)
            .await;
        Ok(metadata)
    }

    /// Chart descriptor fields for the detail endpoint, cached per version.
    pub async fn get_chart_detail(
        &self,
        url: &str,
        chart: &str,
        version: &str,
        no_cache: bool,
    ) -> Result<ChartDetail, GenerateError> {
        if !no_cache {
            if let Some(detail) = self.cache.get_chart_detail(url, chart, version).await {
                return Ok(detail);
            }
        }
        let client = self
            .provider
            .chart_client(url)
            .map_err(acquisition_failure)?;
        let detail = client
            .chart_detail(chart, version)
            .await
            .map_err(acquisition_failure)?;
        self.cache.set_chart_detail(url, chart, version, &detail).await;
        Ok(detail)
    }

    /// Relabel a cached entry from one revision to another when none of the
    /// watched paths changed between them. Returns whether an entry moved.
    pub async fn update_revision_for_paths(
        &self,
        request: &GenerateRequest,
        old_revision: &ResolvedRevision,
        new_revision: &ResolvedRevision,
        paths: &[String],
    ) -> Result<bool, GenerateError> {
        if paths.is_empty() || old_revision == new_revision {
            return Ok(false);
        }
        let client = self
            .provider
            .repo_client(&request.source.url)
            .map_err(acquisition_failure)?;
        let changed = client
            .changed_files(old_revision.as_str(), new_revision.as_str())
            .await
            .map_err(acquisition_failure)?;

        let mut builder = GlobSetBuilder::new();
        for path in paths {
            let glob = Glob::new(path).map_err(|e| GenerateError::AcquisitionFailure {
                reason: format!("invalid watched path `{path}`: {e}"),
            })?;
            builder.add(glob);
        }
        let watched = builder
            .build()
            .map_err(|e| acquisition_failure(anyhow::anyhow!(e)))?;
        if changed.iter().any(|file| watched.is_match(file)) {
            debug!("watched paths changed; a fresh render is required");
            return Ok(false);
        }

        let crossref = CrossRefMap::default();
        let old_key = self.fingerprint(
            request,
            &request.source.render_options,
            old_revision,
            &crossref,
        );
        let new_key = self.fingerprint(
            request,
            &request.source.render_options,
            new_revision,
            &crossref,
        );
        let moved = self.cache.move_manifests(&old_key, &new_key).await;
        if !moved {
            warn!("no cached entry to relabel for unchanged paths");
        }
        Ok(moved)
    }
}

fn acquisition_failure(e: anyhow::Error) -> GenerateError {
    GenerateError::AcquisitionFailure {
        reason: format!("{e:#}"),
    }
}

/// Join the application path under the tree root, refusing escapes.
fn app_path(tree_root: &Path, path: &str) -> Result<PathBuf, GenerateError> {
    crate::script::normalize_under_root(tree_root, Path::new(path)).ok_or_else(|| {
        GenerateError::AcquisitionFailure {
            reason: format!("application path `{path}` escapes the repository"),
        }
    })
}
