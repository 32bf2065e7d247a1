//! Source acquisition: producing the on-disk directory renderers read.
//!
//! Repositories check out into shared per-repository working trees under
//! the lock manager; charts and OCI artifacts extract into per-request
//! subdirectories with byte caps. Every acquisition path ends with the
//! out-of-bounds-symlink walk unless configuration explicitly allows
//! escapes.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{error, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::client::{RepoClient, canonical_repo_url};
use crate::error::GenerateError;
use crate::treelock::{TreeGuard, TreeLocks};
use crate::types::ResolvedRevision;

/// Marker file recording which repository a working tree belongs to; the
/// startup scan re-adopts directories whose marker parses.
pub const REPO_MARKER: &str = ".manifold-repo";

/// The scratch directory all working trees and extractions live under.
///
/// Idle permissions are `0o300` (write+execute, no read) so per-request
/// paths cannot be enumerated out-of-band; the startup scan briefly widens
/// to `0o700` and restores the idle mode afterwards.
pub struct ScratchRoot {
    root: PathBuf,
    trees: Mutex<HashMap<String, PathBuf>>,
}

impl ScratchRoot {
    /// Create (or re-open) the scratch root and adopt surviving trees.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create scratch root {}", root.display()))?;

        set_mode(root, 0o700)?;
        let mut trees = HashMap::new();
        for entry in std::fs::read_dir(root)
            .with_context(|| format!("failed to scan scratch root {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let marker = entry.path().join(REPO_MARKER);
            match std::fs::read_to_string(&marker) {
                Ok(url) if !url.trim().is_empty() => {
                    trees.insert(canonical_repo_url(url.trim()), entry.path());
                }
                _ => {
                    // Unadoptable leftovers (half-finished extractions) are
                    // reclaimed here.
                    warn!(path = %entry.path().display(), "removing unadoptable scratch entry");
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
        }
        set_mode(root, 0o300)?;

        Ok(Self {
            root: root.to_path_buf(),
            trees: Mutex::new(trees),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The working-tree root for a repository, created on first use.
    pub fn tree_root(&self, url: &str) -> Result<PathBuf> {
        let canonical = canonical_repo_url(url);
        let mut trees = self.trees.lock().expect("scratch table poisoned");
        if let Some(path) = trees.get(&canonical) {
            return Ok(path.clone());
        }
        let path = self.root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create working tree {}", path.display()))?;
        std::fs::write(path.join(REPO_MARKER), format!("{canonical}\n"))
            .context("failed to write repository marker")?;
        trees.insert(canonical, path.clone());
        Ok(path)
    }

    /// A fresh per-request directory for an extraction. The caller owns it
    /// exclusively and the closer deletes it.
    pub fn request_dir(&self) -> PathBuf {
        self.root.join(Uuid::new_v4().to_string())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Releases everything an acquisition holds: the tree lock and, for
/// per-request extractions, the extracted subtree. Runs on all exit paths.
#[derive(Debug)]
pub struct Closer {
    guard: Option<TreeGuard>,
    scratch: Option<PathBuf>,
}

impl Closer {
    pub fn for_tree(guard: TreeGuard) -> Self {
        Self {
            guard: Some(guard),
            scratch: None,
        }
    }

    pub fn for_extraction(dir: PathBuf) -> Self {
        Self {
            guard: None,
            scratch: Some(dir),
        }
    }

    /// Take the tree guard out of the closer so it can be released early
    /// (the plugin path releases on tar completion, before the render
    /// finishes). Deletion duties stay behind.
    pub fn take_guard(&mut self) -> Option<TreeGuard> {
        self.guard.take()
    }

    /// Release the lock and delete any per-request directory. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.release();
        }
        if let Some(dir) = self.scratch.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dir.display(), error = %e, "failed to remove request directory");
                }
            }
        }
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Check out `revision` into the client's working tree under the lock
/// manager. Fetches only when the target commit is not already present; a
/// checkout that fails because the ref is unknown retries with an explicit
/// fetch of that ref and a checkout of `FETCH_HEAD`.
pub async fn checkout_repo(
    locks: &TreeLocks,
    client: Arc<dyn RepoClient>,
    revision: &ResolvedRevision,
    allow_concurrent: bool,
    submodules: bool,
) -> Result<TreeGuard, GenerateError> {
    let root = client.root().to_path_buf();
    let rev = revision.as_str().to_string();
    let checkout_client = client.clone();
    locks
        .lock(&root, revision.as_str(), allow_concurrent, move || async move {
            init_fetch_checkout(checkout_client, &rev, submodules).await
        })
        .await
        .map_err(|e| GenerateError::AcquisitionFailure {
            reason: format!("{e:#}"),
        })
}

async fn init_fetch_checkout(
    client: Arc<dyn RepoClient>,
    revision: &str,
    submodules: bool,
) -> Result<()> {
    client.init().await.context("repository init failed")?;
    if !client.is_revision_present(revision).await {
        client.fetch(None).await.context("fetch failed")?;
    }
    match client.checkout(revision, submodules).await {
        Ok(_) => {}
        Err(e) if format!("{e:#}").contains("not found") => {
            client
                .fetch(Some(revision))
                .await
                .with_context(|| format!("explicit fetch of `{revision}` failed"))?;
            client
                .checkout("FETCH_HEAD", submodules)
                .await
                .context("checkout of FETCH_HEAD failed")?;
        }
        Err(e) => return Err(e).context("checkout failed"),
    }
    // The dependency-build marker only vouches for the revision it was
    // written at.
    let _ = std::fs::remove_file(client.root().join(crate::template::DEP_BUILD_MARKER));
    Ok(())
}

/// Extract a gzip'd tar into a fresh per-request directory, enforcing the
/// byte cap (`0` disables it). Partial extractions are removed on failure.
pub async fn extract_archive(
    archive: Vec<u8>,
    scratch: &ScratchRoot,
    cap: u64,
) -> Result<(PathBuf, Closer), GenerateError> {
    let dst = scratch.request_dir();
    let unpack_dst = dst.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&unpack_dst)
            .with_context(|| format!("failed to create {}", unpack_dst.display()))?;
        unpack_capped(&archive, &unpack_dst, cap)
    })
    .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(join_err) => Err(anyhow::anyhow!("extraction task failed: {join_err}")),
    };
    if let Err(e) = outcome {
        let _ = std::fs::remove_dir_all(&dst);
        return Err(GenerateError::AcquisitionFailure {
            reason: format!("{e:#}"),
        });
    }
    Ok((dst.clone(), Closer::for_extraction(dst)))
}

fn unpack_capped(archive: &[u8], dst: &Path, cap: u64) -> Result<()> {
    let mut tar = Archive::new(GzDecoder::new(Cursor::new(archive)));
    let mut total: u64 = 0;
    for entry in tar.entries().context("failed to read archive")? {
        let mut entry = entry.context("failed to read archive entry")?;
        total = total.saturating_add(entry.size());
        if cap > 0 && total > cap {
            bail!("extracted content exceeds the {cap} byte cap");
        }
        entry
            .unpack_in(dst)
            .context("failed to unpack archive entry")?;
    }
    Ok(())
}

/// Walk the tree and fail on the first symlink whose resolved target
/// escapes the tree root.
pub fn ensure_no_escaping_symlinks(root: &Path) -> Result<(), GenerateError> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| GenerateError::AcquisitionFailure {
            reason: format!("failed to canonicalize {}: {e}", root.display()),
        })?;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| GenerateError::AcquisitionFailure {
            reason: format!("tree walk failed: {e}"),
        })?;
        if !entry.path_is_symlink() {
            continue;
        }
        let resolved = resolve_symlink(entry.path());
        if !resolved.starts_with(&canonical_root) {
            let file = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf();
            error!(security = true, file = %file.display(), "symlink escapes working tree");
            return Err(GenerateError::OutOfBoundsSymlink { file });
        }
    }
    Ok(())
}

/// Resolve a symlink to an absolute target. Existing targets canonicalize
/// (covering chains); dangling ones resolve lexically against the
/// canonicalized parent so `../..` escapes are still caught.
fn resolve_symlink(link: &Path) -> PathBuf {
    let Ok(target) = std::fs::read_link(link) else {
        return link.to_path_buf();
    };
    let parent = link.parent().unwrap_or_else(|| Path::new("/"));
    let canonical_parent = parent
        .canonicalize()
        .unwrap_or_else(|_| parent.to_path_buf());
    let joined = if target.is_absolute() {
        target
    } else {
        canonical_parent.join(target)
    };
    joined
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexically(&joined))
}

/// Lexical `..`/`.` resolution without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
