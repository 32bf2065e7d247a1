//! Template-family rendering.
//!
//! The template engine is a collaborator; the core owns everything around
//! it: value-file resolution (including `$token` files under referenced
//! repositories), inline values, parameter collection, release-name
//! coercion, and the once-per-tree dependency build guarded by a keyed
//! mutex and an on-disk marker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::crossref::reference_token;
use crate::error::GenerateError;
use crate::render::{RenderContext, RenderOutput, substitute_env};
use crate::script::normalize_under_root;
use crate::types::{RenderStrategy, TemplateParameter};

/// Marker proving the dependency build already ran in this tree for this
/// revision; removed on revision change.
pub const DEP_BUILD_MARKER: &str = ".argocd-helm-dep-up";

/// Longest release name the engine accepts.
pub const RELEASE_NAME_MAX: usize = 53;

/// One template invocation.
#[derive(Debug, Clone)]
pub struct TemplateRequest {
    /// The chart directory.
    pub path: PathBuf,
    pub release_name: String,
    pub namespace: Option<String>,
    pub value_files: Vec<PathBuf>,
    pub inline_values_file: Option<PathBuf>,
    pub parameters: Vec<TemplateParameter>,
    /// name → resolved file path.
    pub file_parameters: Vec<(String, PathBuf)>,
    pub kube_version: Option<String>,
    pub api_versions: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Engine-reported failure classes the core reacts to.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The chart has unfetched dependencies; a dependency build may fix it.
    #[error("missing chart dependency")]
    MissingDependency,
    #[error("{0}")]
    Failed(String),
}

/// Black-box template engine.
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    async fn template(&self, request: &TemplateRequest) -> Result<Vec<Value>, TemplateError>;

    /// Fetch chart dependencies into the chart directory.
    async fn dependency_build(&self, chart_dir: &Path) -> Result<(), TemplateError>;
}

/// Map of path → mutex, serializing the dependency build per tree.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut inner = self.inner.lock().expect("keyed locks poisoned");
            inner
                .entry(key.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

/// Coerce an application name into a valid release name: no underscores,
/// at most [`RELEASE_NAME_MAX`] bytes, cut on a character boundary.
pub fn coerce_release_name(name: &str) -> String {
    let mut coerced = name.replace('_', "-");
    if coerced.len() > RELEASE_NAME_MAX {
        let mut end = RELEASE_NAME_MAX;
        while !coerced.is_char_boundary(end) {
            end -= 1;
        }
        coerced.truncate(end);
    }
    coerced
}

/// Run the template strategy.
pub async fn render_template(
    ctx: &RenderContext<'_>,
    engine: &dyn TemplateEngine,
    dep_locks: &KeyedLocks,
) -> Result<RenderOutput, GenerateError> {
    let options = ctx.options.template.clone().unwrap_or_default();
    let release_name = options
        .release_name
        .clone()
        .unwrap_or_else(|| coerce_release_name(&ctx.app.name));

    let mut value_files = Vec::new();
    for raw in &options.value_files {
        if let Some(path) = resolve_value_file(raw, ctx, options.ignore_missing_value_files)? {
            value_files.push(path);
        }
    }

    // Inline values go through a private temp file the engine can read.
    let inline_file = match &options.inline_values {
        Some(values) if !values.is_empty() => {
            let file = tempfile::NamedTempFile::new().map_err(|e| template_failure(e))?;
            std::fs::write(file.path(), values).map_err(|e| template_failure(e))?;
            Some(file)
        }
        _ => None,
    };

    let mut file_parameters = Vec::new();
    for parameter in &options.file_parameters {
        let resolved = resolve_tree_path(ctx, &parameter.path)?;
        file_parameters.push((parameter.name.clone(), resolved));
    }

    let request = TemplateRequest {
        path: ctx.app_dir.to_path_buf(),
        release_name: release_name.clone(),
        namespace: (!ctx.app.namespace.is_empty()).then(|| ctx.app.namespace.clone()),
        value_files,
        inline_values_file: inline_file.as_ref().map(|f| f.path().to_path_buf()),
        parameters: options.parameters.clone(),
        file_parameters,
        kube_version: options.kube_version.clone(),
        api_versions: options.api_versions.clone(),
        env: ctx.env.to_vec(),
    };

    let values = match engine.template(&request).await {
        Ok(values) => values,
        Err(TemplateError::MissingDependency) => {
            build_dependencies_once(ctx, engine, dep_locks).await?;
            engine.template(&request).await.map_err(|e| {
                GenerateError::RenderFailure {
                    strategy: RenderStrategy::Template,
                    detail: e.to_string(),
                }
            })?
        }
        Err(e) => {
            return Err(GenerateError::RenderFailure {
                strategy: RenderStrategy::Template,
                detail: e.to_string(),
            });
        }
    };

    Ok(RenderOutput {
        values,
        commands: vec![format!("template {release_name} .")],
        images: Vec::new(),
    })
}

fn template_failure(e: impl std::fmt::Display) -> GenerateError {
    GenerateError::RenderFailure {
        strategy: RenderStrategy::Template,
        detail: e.to_string(),
    }
}

/// Run the dependency build at most once per tree: the keyed mutex
/// serializes racing requests in-process, the marker file carries the fact
/// across them (and across restarts) until the next revision change.
async fn build_dependencies_once(
    ctx: &RenderContext<'_>,
    engine: &dyn TemplateEngine,
    dep_locks: &KeyedLocks,
) -> Result<(), GenerateError> {
    let _guard = dep_locks.lock(ctx.tree_root).await;
    let marker = ctx.tree_root.join(DEP_BUILD_MARKER);
    if marker.exists() {
        return Ok(());
    }
    debug!(chart = %ctx.app_dir.display(), "building chart dependencies");
    engine
        .dependency_build(ctx.app_dir)
        .await
        .map_err(|e| template_failure(e))?;
    std::fs::write(&marker, b"").map_err(|e| template_failure(e))?;
    Ok(())
}

/// Resolve one declared value file. `$token/...` paths resolve under the
/// referenced repository's acquired tree; `/abs` paths resolve under the
/// repository root; everything else resolves relative to the chart
/// directory. All of them must stay inside their base tree.
fn resolve_value_file(
    raw: &str,
    ctx: &RenderContext<'_>,
    ignore_missing: bool,
) -> Result<Option<PathBuf>, GenerateError> {
    let substituted = substitute_env(raw, ctx.env);

    let path = if let Some(token) = reference_token(&substituted) {
        let Some(base) = ctx.refs.get(token) else {
            return Err(GenerateError::UnresolvedReference {
                token: token.to_string(),
            });
        };
        let rel = substituted[token.len()..].trim_start_matches('/');
        normalize_under_root(base, Path::new(rel)).ok_or_else(|| {
            template_failure(format!("value file `{raw}` escapes the referenced repository"))
        })?
    } else {
        resolve_tree_path(ctx, &substituted)?
    };

    if !path.exists() {
        if ignore_missing {
            return Ok(None);
        }
        return Err(template_failure(format!("value file `{raw}` not found")));
    }
    Ok(Some(path))
}

/// Resolve a path against the chart directory (or the repository root for
/// absolute paths), refusing escapes from the repository.
fn resolve_tree_path(ctx: &RenderContext<'_>, raw: &str) -> Result<PathBuf, GenerateError> {
    let (base, rel) = match raw.strip_prefix('/') {
        Some(rooted) => (ctx.tree_root, rooted),
        None => (ctx.app_dir, raw),
    };
    // Interior `..` may climb toward the repository root but never past it.
    let app_rel = base.strip_prefix(ctx.tree_root).unwrap_or(Path::new(""));
    let combined = app_rel.join(rel);
    normalize_under_root(ctx.tree_root, &combined)
        .ok_or_else(|| template_failure(format!("path `{raw}` escapes the repository root")))
}
