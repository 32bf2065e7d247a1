//! Render dispatch: strategy selection, environment seeding, the
//! raw-directory walk, and output normalization shared by every strategy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::{LimitsConfig, RenderConfig};
use crate::error::GenerateError;
use crate::overlay::{OVERLAY_FILES, OverlayEngine, OverlayRequest};
use crate::plugin::PluginRegistry;
use crate::script::{SCRIPT_EXTENSION, ScriptEngine, flatten_result, vm_spec};
use crate::template::TemplateEngine;
use crate::types::{
    AppIdentity, RenderOptions, RenderStrategy, ResolvedRevision, SourceRef, TrackingMode,
};

/// Files containing this marker anywhere are skipped by the raw walk.
pub const SKIP_MARKER: &str = "+argocd:skip-file-rendering";

/// Chart descriptor file that triggers template autodetection.
pub const CHART_DESCRIPTOR: &str = "Chart.yaml";

/// Label stamped with the application name.
pub const TRACKING_LABEL: &str = "app.kubernetes.io/instance";

/// Annotation stamped with the full tracking id.
pub const TRACKING_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";

/// File extensions the raw walk treats as manifest-shaped.
pub const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json", SCRIPT_EXTENSION];

/// The render engines behind the dispatcher.
pub struct RenderBackends {
    pub template: Arc<dyn TemplateEngine>,
    pub overlay: Arc<dyn OverlayEngine>,
    pub script: Arc<dyn ScriptEngine>,
    pub plugins: Arc<PluginRegistry>,
}

/// Everything a strategy needs to run.
pub struct RenderContext<'a> {
    pub tree_root: &'a Path,
    pub app_dir: &'a Path,
    pub options: &'a RenderOptions,
    pub app: &'a AppIdentity,
    pub env: &'a [(String, String)],
    /// `$token` → acquired tree root of the referenced repository.
    pub refs: &'a BTreeMap<String, PathBuf>,
    pub limits: &'a LimitsConfig,
}

/// What a strategy produced, before normalization.
#[derive(Debug, Default)]
pub struct RenderOutput {
    pub values: Vec<Value>,
    pub commands: Vec<String>,
    /// Overlay image list; detail endpoint only.
    pub images: Vec<String>,
}

/// Environment seeded into every renderer from application identity.
pub fn render_env(
    app: &AppIdentity,
    revision: &ResolvedRevision,
    source: &SourceRef,
) -> Vec<(String, String)> {
    vec![
        ("APP_NAME".to_string(), app.name.clone()),
        ("APP_NAMESPACE".to_string(), app.namespace.clone()),
        ("REVISION".to_string(), revision.as_str().to_string()),
        ("REVISION_SHORT".to_string(), revision.short().to_string()),
        ("REVISION_SHORT_8".to_string(), revision.short8().to_string()),
        ("SOURCE_REPO_URL".to_string(), source.url.clone()),
        ("SOURCE_PATH".to_string(), source.path.clone()),
        (
            "SOURCE_TARGET_REVISION".to_string(),
            source.target_revision.clone(),
        ),
    ]
}

/// Substitute `$NAME` and `${NAME}` occurrences from the environment.
/// Unknown variables are left verbatim.
pub fn substitute_env(input: &str, env: &[(String, String)]) -> String {
    fn lookup<'e>(env: &'e [(String, String)], name: &str) -> Option<&'e str> {
        env.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                let rest = &input[idx + 2..];
                match rest.find('}') {
                    Some(end) => {
                        let name = &rest[..end];
                        match lookup(env, name) {
                            Some(value) => out.push_str(value),
                            None => {
                                out.push_str(&input[idx..idx + 2 + end + 1]);
                            }
                        }
                        // Skip `{name}`.
                        for _ in 0..name.chars().count() + 2 {
                            chars.next();
                        }
                    }
                    None => out.push(c),
                }
            }
            _ => {
                let rest = &input[idx + 1..];
                let end = rest
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(rest.len());
                if end == 0 {
                    out.push(c);
                    continue;
                }
                let name = &rest[..end];
                match lookup(env, name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push(c);
                        out.push_str(name);
                    }
                }
                for _ in 0..name.len() {
                    chars.next();
                }
            }
        }
    }
    out
}

/// Whether a strategy tolerates other requests sharing its working tree.
/// Overlay builds write temp marker files into the tree and need the tree
/// to themselves.
pub fn allows_concurrent(strategy: &RenderStrategy) -> bool {
    !matches!(strategy, RenderStrategy::Overlay)
}

/// Pre-acquisition concurrency hint from the declared options alone (the
/// tree is not on disk yet when the lock is taken).
pub fn allows_concurrent_hint(options: &RenderOptions) -> bool {
    if let Some(strategy) = &options.strategy {
        return allows_concurrent(strategy);
    }
    options.overlay.is_none()
}

/// Select the strategy for an acquired tree.
pub async fn detect_strategy(
    tree_root: &Path,
    app_dir: &Path,
    options: &RenderOptions,
    render_config: &RenderConfig,
    plugins: &PluginRegistry,
) -> RenderStrategy {
    let demote = |strategy: RenderStrategy| {
        if render_config.is_disabled(&strategy) {
            RenderStrategy::RawDirectory
        } else {
            strategy
        }
    };

    if let Some(explicit) = &options.strategy {
        return demote(explicit.clone());
    }
    if let Some(plugin) = &options.plugin {
        if !plugin.name.is_empty() {
            return demote(RenderStrategy::Plugin(plugin.name.clone()));
        }
    }

    if app_dir.join(CHART_DESCRIPTOR).exists() {
        return demote(RenderStrategy::Template);
    }
    if OVERLAY_FILES.iter().any(|f| app_dir.join(f).exists()) {
        return demote(RenderStrategy::Overlay);
    }
    if let Some(name) = plugins.find_matching(tree_root).await {
        return demote(RenderStrategy::Plugin(name));
    }
    RenderStrategy::RawDirectory
}

/// Run a non-plugin strategy. The plugin path is dispatched by the
/// orchestrator because its lock-release ordering is different.
pub async fn render(
    ctx: &RenderContext<'_>,
    strategy: &RenderStrategy,
    backends: &RenderBackends,
    dep_locks: &crate::template::KeyedLocks,
) -> Result<RenderOutput, GenerateError> {
    match strategy {
        RenderStrategy::Template => {
            crate::template::render_template(ctx, backends.template.as_ref(), dep_locks).await
        }
        RenderStrategy::Overlay => render_overlay(ctx, backends.overlay.as_ref()).await,
        RenderStrategy::Script => render_script(ctx, backends.script.as_ref()).await,
        RenderStrategy::RawDirectory => raw_directory(ctx, backends.script.as_ref()).await,
        RenderStrategy::Plugin(name) => Err(GenerateError::RenderFailure {
            strategy: RenderStrategy::Plugin(name.clone()),
            detail: "plugin strategy must go through the streaming path".to_string(),
        }),
    }
}

async fn render_overlay(
    ctx: &RenderContext<'_>,
    engine: &dyn OverlayEngine,
) -> Result<RenderOutput, GenerateError> {
    let options = ctx.options.overlay.clone().unwrap_or_default();
    let request = OverlayRequest {
        path: ctx.app_dir.to_path_buf(),
        kube_version: options.kube_version,
        api_versions: options.api_versions,
        env: ctx.env.to_vec(),
    };
    let output = engine
        .build(&request)
        .await
        .map_err(|e| GenerateError::RenderFailure {
            strategy: RenderStrategy::Overlay,
            detail: format!("{e:#}"),
        })?;
    Ok(RenderOutput {
        values: output.manifests,
        commands: vec![format!("build {}", ctx.app_dir.display())],
        images: output.images,
    })
}

async fn render_script(
    ctx: &RenderContext<'_>,
    engine: &dyn ScriptEngine,
) -> Result<RenderOutput, GenerateError> {
    let vm = vm_spec(ctx.tree_root, ctx.options.script.as_ref(), ctx.env)?;
    let mut output = RenderOutput::default();
    for file in script_files(ctx.app_dir)? {
        let value = engine
            .evaluate(&file, &vm)
            .await
            .map_err(|e| GenerateError::RenderFailure {
                strategy: RenderStrategy::Script,
                detail: format!("{}: {e:#}", file_label(ctx.app_dir, &file)),
            })?;
        output.values.extend(flatten_result(value));
    }
    Ok(output)
}

fn script_files(app_dir: &Path) -> Result<Vec<PathBuf>, GenerateError> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(app_dir).map_err(|e| GenerateError::RenderFailure {
        strategy: RenderStrategy::Script,
        detail: format!("failed to read {}: {e}", app_dir.display()),
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION)
            && path.is_file()
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_label(base: &Path, file: &Path) -> String {
    file.strip_prefix(base)
        .unwrap_or(file)
        .to_string_lossy()
        .to_string()
}

fn glob_set(pattern: &str) -> Result<Option<GlobSet>, GenerateError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for part in pattern.split(';').filter(|p| !p.is_empty()) {
        let glob = Glob::new(part).map_err(|e| GenerateError::RenderFailure {
            strategy: RenderStrategy::RawDirectory,
            detail: format!("invalid glob `{part}`: {e}"),
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| GenerateError::RenderFailure {
            strategy: RenderStrategy::RawDirectory,
            detail: format!("invalid glob pattern: {e}"),
        })
}

/// The fallback strategy: walk the directory and accumulate manifest-shaped
/// files, evaluating script files through the interpreter and charging
/// everything else against the combined-size budget.
async fn raw_directory(
    ctx: &RenderContext<'_>,
    script: &dyn ScriptEngine,
) -> Result<RenderOutput, GenerateError> {
    let options = ctx.options.directory.clone().unwrap_or_default();
    let include = glob_set(&options.include)?;
    let exclude = glob_set(&options.exclude)?;
    let budget = ctx.limits.max_combined_manifest_bytes;
    let canonical_root = ctx
        .tree_root
        .canonicalize()
        .unwrap_or_else(|_| ctx.tree_root.to_path_buf());

    let mut output = RenderOutput::default();
    let mut total_bytes: u64 = 0;

    let max_depth = if options.recurse { usize::MAX } else { 1 };
    let walker = WalkDir::new(ctx.app_dir)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| GenerateError::RenderFailure {
            strategy: RenderStrategy::RawDirectory,
            detail: format!("directory walk failed: {e}"),
        })?;
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !MANIFEST_EXTENSIONS.contains(&ext) {
            continue;
        }

        // Regular files and symlinks to in-tree regular files only.
        if entry.path_is_symlink() {
            match path.canonicalize() {
                Ok(target) if target.starts_with(&canonical_root) && target.is_file() => {}
                _ => {
                    warn!(file = %path.display(), "skipping symlink outside the tree");
                    continue;
                }
            }
        } else if !entry.file_type().is_file() {
            continue;
        }

        let rel = path.strip_prefix(ctx.app_dir).unwrap_or(path);
        if let Some(include) = &include {
            if !include.is_match(rel) {
                continue;
            }
        }
        if let Some(exclude) = &exclude {
            if exclude.is_match(rel) {
                continue;
            }
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| GenerateError::RenderFailure {
                strategy: RenderStrategy::RawDirectory,
                detail: format!("failed to read {}: {e}", file_label(ctx.app_dir, path)),
            })?;
        if content.contains(SKIP_MARKER) {
            continue;
        }

        if ext == SCRIPT_EXTENSION {
            let vm = vm_spec(ctx.tree_root, ctx.options.script.as_ref(), ctx.env)?;
            let value =
                script
                    .evaluate(path, &vm)
                    .await
                    .map_err(|e| GenerateError::RenderFailure {
                        strategy: RenderStrategy::RawDirectory,
                        detail: format!("{}: {e:#}", file_label(ctx.app_dir, path)),
                    })?;
            output.values.extend(flatten_result(value));
            continue;
        }

        total_bytes = total_bytes.saturating_add(content.len() as u64);
        if budget > 0 && total_bytes > budget {
            return Err(GenerateError::CombinedSizeExceeded { limit: budget });
        }
        output
            .values
            .extend(parse_manifest_content(&content, ext).map_err(|detail| {
                GenerateError::RenderFailure {
                    strategy: RenderStrategy::RawDirectory,
                    detail: format!("{}: {detail}", file_label(ctx.app_dir, path)),
                }
            })?);
    }
    Ok(output)
}

/// Parse a manifest file into resource documents. YAML files may hold
/// multiple documents; empty documents are dropped.
pub fn parse_manifest_content(content: &str, ext: &str) -> Result<Vec<Value>, String> {
    if ext == "json" {
        let value: Value =
            serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}"))?;
        return Ok(flatten_result(value)
            .into_iter()
            .filter(|v| v.is_object())
            .collect());
    }
    let mut values = Vec::new();
    for document in serde_yml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(|e| format!("invalid YAML: {e}"))?;
        if value.is_object() {
            values.push(value);
        }
    }
    Ok(values)
}

/// Flatten list-typed resources, stamp tracking identity onto non-CRD
/// resources, and serialize deterministically.
pub fn normalize_manifests(
    values: Vec<Value>,
    app: &AppIdentity,
    tracking_mode: TrackingMode,
) -> Vec<String> {
    let mut expanded = Vec::new();
    for value in values {
        let is_list = value
            .get("kind")
            .and_then(Value::as_str)
            .is_some_and(|k| k.ends_with("List"))
            && value.get("items").is_some_and(Value::is_array);
        if is_list {
            if let Some(Value::Array(items)) = value.get("items").cloned() {
                expanded.extend(items.into_iter().filter(|v| v.is_object()));
            }
        } else {
            expanded.push(value);
        }
    }

    expanded
        .into_iter()
        .map(|mut value| {
            stamp_tracking(&mut value, app, tracking_mode);
            serde_json::to_string(&value).expect("manifest serializes")
        })
        .collect()
}

fn stamp_tracking(value: &mut Value, app: &AppIdentity, mode: TrackingMode) {
    let Some(kind) = value.get("kind").and_then(Value::as_str).map(String::from) else {
        return;
    };
    if kind == "CustomResourceDefinition" {
        return;
    }

    let group = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .and_then(|v| v.split_once('/').map(|(g, _)| g))
        .unwrap_or("")
        .to_string();
    let name = value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or(&app.namespace)
        .to_string();

    let metadata = value
        .as_object_mut()
        .expect("resource is an object")
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };

    if matches!(mode, TrackingMode::Label | TrackingMode::AnnotationAndLabel) {
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(labels) = labels.as_object_mut() {
            let mut label = app.name.clone();
            label.truncate(63);
            labels.insert(TRACKING_LABEL.to_string(), Value::String(label));
        }
    }
    if matches!(
        mode,
        TrackingMode::Annotation | TrackingMode::AnnotationAndLabel
    ) {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(
                TRACKING_ANNOTATION.to_string(),
                Value::String(format!("{}:{group}/{kind}:{namespace}/{name}", app.name)),
            );
        }
    }
}
