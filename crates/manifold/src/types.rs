use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Which backend a source is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A git repository checked out into a shared working tree.
    #[default]
    Repo,
    /// A chart pulled from a chart registry and extracted per request.
    Chart,
    /// An OCI artifact resolved to a digest and extracted per request.
    Oci,
}

/// The logical input of one generation request. Immutable once the request
/// begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(default)]
    pub kind: SourceKind,
    /// Repository or registry URL.
    pub url: String,
    /// Path inside the tree that rendering starts from.
    #[serde(default)]
    pub path: String,
    /// Chart name, for `SourceKind::Chart` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    /// Possibly ambiguous revision: branch, tag, semver range, or digest.
    #[serde(default)]
    pub target_revision: String,
    /// Per-tool rendering options.
    #[serde(default)]
    pub render_options: RenderOptions,
    /// Symbolic name other sources use to point at this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl SourceRef {
    /// A ref-only source declares a symbolic name but nothing to render.
    pub fn is_ref_only(&self) -> bool {
        self.reference.is_some() && self.path.is_empty() && self.chart.is_none()
    }
}

/// An opaque immutable identifier: commit hash for repositories, content
/// digest for OCI artifacts, exact version for charts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedRevision(pub String);

impl ResolvedRevision {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Seven-character abbreviation, or the whole identifier when shorter.
    pub fn short(&self) -> &str {
        self.prefix(7)
    }

    /// Eight-character abbreviation, or the whole identifier when shorter.
    pub fn short8(&self) -> &str {
        self.prefix(8)
    }

    fn prefix(&self, n: usize) -> &str {
        match self.0.char_indices().nth(n) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for ResolvedRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns true when the input is already a full commit hash and resolution
/// can short-circuit.
pub fn is_commit_sha(rev: &str) -> bool {
    rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

/// How rendered resources are stamped with application identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Stamp the tracking label only.
    #[default]
    Label,
    /// Stamp the tracking annotation only.
    Annotation,
    /// Stamp both.
    AnnotationAndLabel,
}

/// Identity of the application a request renders for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Application annotations; consulted for manifest-generate-paths.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// The rendering pipeline selected for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStrategy {
    /// Chart template engine.
    Template,
    /// Overlay build engine.
    Overlay,
    /// Embedded scripting language.
    Script,
    /// Out-of-process sidecar plugin, by name.
    Plugin(String),
    /// Flat directory of manifest files.
    RawDirectory,
}

impl fmt::Display for RenderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderStrategy::Template => f.write_str("Template"),
            RenderStrategy::Overlay => f.write_str("Overlay"),
            RenderStrategy::Script => f.write_str("Script"),
            RenderStrategy::Plugin(_) => f.write_str("Plugin"),
            RenderStrategy::RawDirectory => f.write_str("RawDirectory"),
        }
    }
}

/// A name=value template parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// Force the engine to treat the value as a string scalar.
    #[serde(default)]
    pub force_string: bool,
}

/// A parameter whose value is read from a file in the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateFileParameter {
    pub name: String,
    pub path: String,
}

/// A script variable binding, either a literal value or code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub code: bool,
}

/// A name=value environment entry forwarded to a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Options for the template strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateOptions {
    /// Declared value files; entries starting with `$` reference other
    /// sources.
    #[serde(default)]
    pub value_files: Vec<String>,
    /// Inline values document, written to a temp file before templating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_values: Option<String>,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default)]
    pub file_parameters: Vec<TemplateFileParameter>,
    /// Release name override; defaults to the coerced application name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Missing declared value files are skipped instead of failing.
    #[serde(default)]
    pub ignore_missing_value_files: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_version: Option<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
}

/// Options for the overlay strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_version: Option<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
}

/// Options for the script strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptOptions {
    /// Library directories, relative to the repository root.
    #[serde(default)]
    pub libs: Vec<String>,
    /// Top-level-argument bindings.
    #[serde(default)]
    pub tlas: Vec<ScriptVar>,
    /// External-variable bindings.
    #[serde(default)]
    pub ext_vars: Vec<ScriptVar>,
}

/// Options for the plugin strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginOptions {
    /// Plugin name; empty means autodetect.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub env: Vec<EnvEntry>,
}

/// Options for the raw-directory strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryOptions {
    #[serde(default)]
    pub recurse: bool,
    /// Include glob, relative to the application path. Empty includes all.
    #[serde(default)]
    pub include: String,
    /// Exclude glob, relative to the application path.
    #[serde(default)]
    pub exclude: String,
}

/// Per-tool rendering options carried by a source.
///
/// Only the section matching the selected strategy is consulted; the others
/// ride along so in-tree overrides can patch any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Explicit strategy override. `None` autodetects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RenderStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryOptions>,
}

/// A source declared elsewhere in the request that `$token` paths resolve
/// through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefSource {
    pub repo_url: String,
    pub target_revision: String,
    /// Chart sources may not be referenced.
    #[serde(default)]
    pub is_chart: bool,
}

/// One generation request as handed to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub source: SourceRef,
    pub app: AppIdentity,
    /// Symbolic name → declared source, for `$token` resolution.
    #[serde(default)]
    pub ref_sources: BTreeMap<String, RefSource>,
    /// Whether the application declares more than one source.
    #[serde(default)]
    pub has_multiple_sources: bool,
    /// Skip the manifest cache entirely.
    #[serde(default)]
    pub no_cache: bool,
    /// Bypass the resolved-revision cache.
    #[serde(default)]
    pub no_revision_cache: bool,
    /// Verify the commit signature of the resolved revision.
    #[serde(default)]
    pub verify_signature: bool,
    #[serde(default)]
    pub tracking_mode: TrackingMode,
    /// Restrict the plugin archive to the manifest-generate-paths roots.
    #[serde(default)]
    pub use_manifest_generate_paths: bool,
}

impl Default for SourceRef {
    fn default() -> Self {
        Self {
            kind: SourceKind::Repo,
            url: String::new(),
            path: String::new(),
            chart: None,
            target_revision: String::new(),
            render_options: RenderOptions::default(),
            reference: None,
        }
    }
}

/// The rendered result of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestResponse {
    /// Serialized resource documents in discovery order.
    pub manifests: Vec<String>,
    /// Display name of the strategy that produced them.
    pub source_type: String,
    /// The immutable revision the manifests were rendered from.
    pub revision: String,
    /// Commands the render executed, for the detail endpoint.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Signature verification output, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_result: Option<String>,
}

/// Commit metadata for the detail endpoint, cached per commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionMetadata {
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub message: String,
}

/// Chart descriptor fields for the detail endpoint, cached per version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartDetail {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub home: String,
    #[serde(default)]
    pub maintainers: Vec<String>,
}

/// Remote refs advertised by a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteRefs {
    /// Branch name → commit hash.
    pub branches: BTreeMap<String, String>,
    /// Tag name → commit hash.
    pub tags: BTreeMap<String, String>,
}
