//! Sidecar plugin streaming protocol.
//!
//! Plugins are co-located processes reached over local sockets. The core
//! streams them a filtered, compressed archive of the working tree and
//! awaits rendered manifests. The defining constraint is lock lifetime:
//! the moment the final archive byte is accepted, the `tar_done` channel
//! fires and the orchestrator releases the working-tree lock while the
//! plugin keeps rendering against its private copy.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{GenerateError, PluginPhase};
use crate::types::EnvEntry;

/// Annotation restricting what the plugin archive contains.
pub const MANIFEST_GENERATE_PATHS_ANNOTATION: &str =
    "argocd.argoproj.io/manifest-generate-paths";

/// Suffix a plugin socket carries; the basename minus the suffix is the
/// plugin name.
pub const SOCKET_SUFFIX: &str = ".sock";

/// A discovered plugin endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginEndpoint {
    pub name: String,
    pub socket: PathBuf,
}

/// What `check_configuration` reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginConfiguration {
    /// The plugin wants a repository-credential environment forwarded.
    pub requires_repo_credentials: bool,
}

/// The archive side of one `generate_manifests` exchange.
pub struct PluginStream {
    pub env: Vec<EnvEntry>,
    /// Gzip'd tar bytes, in order. Closed once the archive is complete.
    pub chunks: mpsc::Receiver<Vec<u8>>,
}

/// The plugin's reply; each string may hold several documents.
#[derive(Debug, Clone, Default)]
pub struct PluginResponse {
    pub manifests: Vec<String>,
}

/// One live connection to a plugin sidecar.
#[async_trait]
pub trait PluginConnection: Send + Sync {
    async fn check_configuration(&self) -> Result<PluginConfiguration>;

    /// Whether this plugin accepts the given tree.
    async fn match_repository(&self, root: &Path) -> Result<bool>;

    /// Consume the streamed archive and render.
    async fn generate_manifests(&self, stream: PluginStream) -> Result<PluginResponse>;
}

/// Opens connections to discovered endpoints. The transport is a
/// collaborator concern.
pub trait PluginDialer: Send + Sync {
    fn connect(&self, endpoint: &PluginEndpoint) -> Result<Arc<dyn PluginConnection>>;
}

/// Short-lived repository-credential environment for plugins that ask.
pub trait CredentialSource: Send + Sync {
    fn environment(&self) -> Result<Vec<EnvEntry>>;
}

/// Dialer that refuses every connection. Useful where no plugins exist.
pub struct NullDialer;

impl PluginDialer for NullDialer {
    fn connect(&self, endpoint: &PluginEndpoint) -> Result<Arc<dyn PluginConnection>> {
        anyhow::bail!("no dialer configured for plugin `{}`", endpoint.name)
    }
}

/// Enumerate plugin sockets in a directory.
pub fn discover_sockets(dir: &Path) -> Vec<PluginEndpoint> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut endpoints = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(SOCKET_SUFFIX))
        else {
            continue;
        };
        endpoints.push(PluginEndpoint {
            name: name.to_string(),
            socket: path,
        });
    }
    endpoints.sort_by(|a, b| a.name.cmp(&b.name));
    endpoints
}

/// Discovery plus connection management for the configured socket
/// directory.
pub struct PluginRegistry {
    sock_dir: PathBuf,
    dialer: Arc<dyn PluginDialer>,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl PluginRegistry {
    pub fn new(
        sock_dir: PathBuf,
        dialer: Arc<dyn PluginDialer>,
        credentials: Option<Arc<dyn CredentialSource>>,
    ) -> Self {
        Self {
            sock_dir,
            dialer,
            credentials,
        }
    }

    pub fn discover(&self) -> Vec<PluginEndpoint> {
        discover_sockets(&self.sock_dir)
    }

    /// Connect to a plugin by name.
    pub fn connect(&self, name: &str) -> Result<Arc<dyn PluginConnection>, GenerateError> {
        let endpoint = self
            .discover()
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| GenerateError::PluginFailure {
                phase: PluginPhase::Connect,
                message: format!("no plugin socket named `{name}`"),
            })?;
        self.dialer
            .connect(&endpoint)
            .map_err(|e| GenerateError::PluginFailure {
                phase: PluginPhase::Connect,
                message: format!("{e:#}"),
            })
    }

    /// First discovered plugin that accepts the tree.
    pub async fn find_matching(&self, root: &Path) -> Option<String> {
        for endpoint in self.discover() {
            let connection = match self.dialer.connect(&endpoint) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(plugin = %endpoint.name, error = %e, "skipping undialable plugin");
                    continue;
                }
            };
            match connection.match_repository(root).await {
                Ok(true) => return Some(endpoint.name),
                Ok(false) => {}
                Err(e) => {
                    warn!(plugin = %endpoint.name, error = %e, "plugin match failed");
                }
            }
        }
        None
    }

    /// The credential environment to forward, when the plugin asks for one
    /// and a source is wired.
    pub fn credential_env(
        &self,
        configuration: &PluginConfiguration,
    ) -> Result<Vec<EnvEntry>, GenerateError> {
        if !configuration.requires_repo_credentials {
            return Ok(Vec::new());
        }
        let Some(source) = &self.credentials else {
            return Ok(Vec::new());
        };
        source
            .environment()
            .map_err(|e| GenerateError::PluginFailure {
                phase: PluginPhase::Configuration,
                message: format!("{e:#}"),
            })
    }
}

/// Compute the archive root: the narrowest common ancestor of the
/// manifest-generate-paths entries (absolute entries resolve against the
/// repository root, relative ones against the application path), or the
/// application path when the annotation is absent or unused.
pub fn archive_root(
    tree_root: &Path,
    app_dir: &Path,
    annotations: &BTreeMap<String, String>,
    use_manifest_generate_paths: bool,
) -> PathBuf {
    if !use_manifest_generate_paths {
        return app_dir.to_path_buf();
    }
    let Some(annotation) = annotations.get(MANIFEST_GENERATE_PATHS_ANNOTATION) else {
        return app_dir.to_path_buf();
    };

    let mut roots = Vec::new();
    for raw in annotation.split(';').filter(|p| !p.is_empty()) {
        let joined = match raw.strip_prefix('/') {
            Some(rooted) => tree_root.join(rooted),
            None => app_dir.join(raw),
        };
        let normalized = crate::script::normalize_under_root(
            tree_root,
            joined.strip_prefix(tree_root).unwrap_or(Path::new("")),
        )
        .unwrap_or_else(|| tree_root.to_path_buf());
        roots.push(normalized);
    }
    if roots.is_empty() {
        return app_dir.to_path_buf();
    }
    common_ancestor(&roots)
}

fn common_ancestor(paths: &[PathBuf]) -> PathBuf {
    let mut ancestor = paths[0].clone();
    for path in &paths[1..] {
        while !path.starts_with(&ancestor) {
            if !ancestor.pop() {
                return PathBuf::from("/");
            }
        }
    }
    ancestor
}

/// The three channels of one in-flight plugin render.
pub struct PluginChannels {
    pub response: oneshot::Receiver<PluginResponse>,
    /// Fires when the final archive byte has been accepted. The
    /// orchestrator releases the working-tree lock on this signal, before
    /// awaiting the response.
    pub tar_done: oneshot::Receiver<()>,
    pub error: oneshot::Receiver<GenerateError>,
}

/// Start the background render: stream the archive, signal `tar_done`,
/// then relay the plugin's reply.
pub fn spawn_plugin_render(
    connection: Arc<dyn PluginConnection>,
    root: PathBuf,
    exclusions: Vec<String>,
    env: Vec<EnvEntry>,
) -> PluginChannels {
    let (response_tx, response) = oneshot::channel();
    let (tar_done_tx, tar_done) = oneshot::channel();
    let (error_tx, error) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(16);

    tokio::spawn(async move {
        let exclude = match build_exclusion_set(&exclusions) {
            Ok(set) => set,
            Err(e) => {
                let _ = error_tx.send(GenerateError::PluginFailure {
                    phase: PluginPhase::Stream,
                    message: e,
                });
                return;
            }
        };

        let generate = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .generate_manifests(PluginStream {
                        env,
                        chunks: chunk_rx,
                    })
                    .await
            }
        });

        let stream_result =
            tokio::task::spawn_blocking(move || stream_tree(&root, &exclude, chunk_tx))
                .await
                .unwrap_or_else(|join| Err(format!("archive task failed: {join}")));

        if let Err(message) = stream_result {
            // The plugin may have failed first and closed the stream; its
            // error is the one worth reporting.
            let plugin_error = if generate.is_finished() {
                match generate.await {
                    Ok(Err(e)) => Some(format!("{e:#}")),
                    _ => None,
                }
            } else {
                generate.abort();
                None
            };
            let _ = error_tx.send(match plugin_error {
                Some(message) => GenerateError::PluginFailure {
                    phase: PluginPhase::Response,
                    message,
                },
                None => GenerateError::PluginFailure {
                    phase: PluginPhase::Stream,
                    message,
                },
            });
            return;
        }

        let _ = tar_done_tx.send(());

        match generate.await {
            Ok(Ok(response)) => {
                let _ = response_tx.send(response);
            }
            Ok(Err(e)) => {
                let _ = error_tx.send(GenerateError::PluginFailure {
                    phase: PluginPhase::Response,
                    message: format!("{e:#}"),
                });
            }
            Err(join) => {
                let _ = error_tx.send(GenerateError::PluginFailure {
                    phase: PluginPhase::Response,
                    message: format!("render task failed: {join}"),
                });
            }
        }
    });

    PluginChannels {
        response,
        tar_done,
        error,
    }
}

fn build_exclusion_set(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| format!("invalid exclusion `{pattern}`: {e}"))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| format!("invalid exclusions: {e}"))
}

/// Writer that hands 32 KiB chunks to the stream channel.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
    buf: Vec<u8>,
}

const CHUNK_SIZE: usize = 32 * 1024;

impl ChannelWriter {
    fn send_buf(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buf);
        self.tx
            .blocking_send(chunk)
            .map_err(|_| std::io::Error::other("archive stream closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buf()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_buf()
    }
}

/// Build the filtered gzip'd tar and push it through the channel. Blocking.
fn stream_tree(root: &Path, exclude: &GlobSet, tx: mpsc::Sender<Vec<u8>>) -> Result<(), String> {
    let writer = ChannelWriter {
        tx,
        buf: Vec::new(),
    };
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| !exclude.is_match(rel))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|e| format!("archive walk failed: {e}"))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| format!("archive walk produced a foreign path: {e}"))?;
        builder
            .append_path_with_name(entry.path(), rel)
            .map_err(|e| format!("failed to archive {}: {e}", rel.display()))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| format!("failed to finish archive: {e}"))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| format!("failed to finish compression: {e}"))?;
    writer.flush().map_err(|e| format!("failed to flush archive: {e}"))?;
    Ok(())
}

/// Split reply strings into individual resource documents.
pub fn split_manifests(raw: &[String]) -> Result<Vec<Value>, GenerateError> {
    let mut values = Vec::new();
    for chunk in raw {
        for document in serde_yml::Deserializer::from_str(chunk) {
            let value =
                Value::deserialize(document).map_err(|e| GenerateError::PluginFailure {
                    phase: PluginPhase::Response,
                    message: format!("plugin returned an invalid manifest: {e}"),
                })?;
            if value.is_object() {
                values.push(value);
            }
        }
    }
    Ok(values)
}
