//! Collaborator interfaces the core consumes.
//!
//! The low-level repository client, the chart registry client, and the OCI
//! registry client are provided by the outer server; this module defines the
//! seams. Implementations own their transports and credentials; everything
//! here is `async` and object-safe so providers can be swapped per request.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ChartDetail, RemoteRefs, RevisionMetadata};

/// Repository operations against a single working tree.
///
/// A client is bound to one repository URL and one on-disk root; the lock
/// manager keys on [`root`](Self::root), so providers must hand out the same
/// root for the same canonical URL.
#[async_trait]
pub trait RepoClient: Send + Sync {
    /// The repository URL this client serves.
    fn url(&self) -> &str;

    /// The working-tree root this client checks out into.
    fn root(&self) -> &Path;

    /// Initialize the tree if it is not a repository yet.
    async fn init(&self) -> Result<()>;

    /// Fetch from the remote; `refspec` narrows the fetch to one ref.
    async fn fetch(&self, refspec: Option<&str>) -> Result<()>;

    /// Check out the given revision; returns the resulting commit hash.
    async fn checkout(&self, rev: &str, submodules: bool) -> Result<String>;

    /// Whether the object is already present locally.
    async fn is_revision_present(&self, rev: &str) -> bool;

    /// Resolve a remote ref name to a commit hash without fetching.
    async fn ls_remote(&self, rev: &str) -> Result<String>;

    /// Enumerate remote branches and tags.
    async fn ls_refs(&self) -> Result<RemoteRefs>;

    /// List tracked files matching a pattern.
    async fn ls_files(&self, pattern: &str) -> Result<Vec<String>>;

    /// Commit metadata for the detail endpoint.
    async fn revision_metadata(&self, rev: &str) -> Result<RevisionMetadata>;

    /// Verify the signature on a commit or tag; returns the verifier output.
    async fn verify_commit_signature(&self, rev: &str) -> Result<String>;

    /// Paths that differ between two revisions.
    async fn changed_files(&self, old: &str, new: &str) -> Result<Vec<String>>;

    /// Whether the ref names an annotated tag.
    async fn is_annotated_tag(&self, rev: &str) -> bool;

    /// The commit currently checked out.
    async fn commit_sha(&self) -> Result<String>;
}

/// Chart registry operations.
#[async_trait]
pub trait ChartClient: Send + Sync {
    fn repo_url(&self) -> &str;

    /// Published versions of a chart, newest ordering not guaranteed.
    async fn versions(&self, chart: &str, bypass_cache: bool) -> Result<Vec<String>>;

    /// Fetch the packaged chart (a gzip'd tar) at an exact version.
    async fn fetch_chart(&self, chart: &str, version: &str) -> Result<Vec<u8>>;

    /// Descriptor fields for the detail endpoint.
    async fn chart_detail(&self, chart: &str, version: &str) -> Result<ChartDetail>;
}

/// OCI registry operations.
#[async_trait]
pub trait OciClient: Send + Sync {
    fn repo_url(&self) -> &str;

    /// Convert a tag or digest reference to its canonical digest.
    async fn resolve_revision(&self, reference: &str, bypass_cache: bool) -> Result<String>;

    /// Tags advertised by the repository.
    async fn tags(&self, bypass_cache: bool) -> Result<Vec<String>>;

    /// Fetch the artifact layer (a gzip'd tar) for a digest.
    async fn fetch_archive(&self, digest: &str) -> Result<Vec<u8>>;

    /// Drop any locally cached copy of the digest.
    async fn clean_cache(&self, digest: &str) -> Result<()>;

    /// Manifest annotations for a digest.
    async fn digest_metadata(&self, digest: &str) -> Result<BTreeMap<String, String>>;
}

/// Hands out clients per repository URL.
pub trait ClientProvider: Send + Sync {
    fn repo_client(&self, url: &str) -> Result<Arc<dyn RepoClient>>;
    fn chart_client(&self, url: &str) -> Result<Arc<dyn ChartClient>>;
    fn oci_client(&self, url: &str) -> Result<Arc<dyn OciClient>>;
}

/// Normalize a repository URL for identity comparison: scheme and host are
/// case-insensitive, a `.git` suffix and trailing slashes are not
/// significant.
pub fn canonical_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = match rest.split_once('/') {
                Some((host, path)) => (host.to_ascii_lowercase(), format!("/{path}")),
                None => (rest.to_ascii_lowercase(), String::new()),
            };
            format!("{}://{}{}", scheme.to_ascii_lowercase(), host, path)
        }
        None => trimmed.to_string(),
    }
}
