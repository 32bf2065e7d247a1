//! Error taxonomy for manifest generation.
//!
//! Every public operation returns [`GenerateError`]. Internal helpers use
//! `anyhow` and are converted at the component boundary, so callers can
//! match on the failure class without parsing message text.

use std::fmt;
use std::path::PathBuf;

use manifold_sanitizer::Sanitizer;
use thiserror::Error;

use crate::types::RenderStrategy;

/// Prefix stamped onto memoized failure responses served from the cache.
pub const MEMOIZED_ERROR_PREFIX: &str = "Manifest generation error (cached): ";

/// Phase of the plugin exchange in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginPhase {
    /// Locating or connecting to the sidecar socket.
    Connect,
    /// The `check_configuration` round-trip.
    Configuration,
    /// Streaming the working-tree archive.
    Stream,
    /// Awaiting the rendered reply.
    Response,
}

impl fmt::Display for PluginPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginPhase::Connect => "connect",
            PluginPhase::Configuration => "configuration",
            PluginPhase::Stream => "stream",
            PluginPhase::Response => "response",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the manifest generation core.
///
/// Clone so coalesced requests can all receive the failure of the one
/// render that ran on their behalf.
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    /// An ambiguous revision could not be resolved to an immutable identifier.
    #[error("failed to resolve revision `{revision}` for {url}: {detail}")]
    ResolveFailure {
        url: String,
        revision: String,
        detail: String,
    },

    /// Network, quota, or extraction error while producing the working tree.
    #[error("source acquisition failed: {reason}")]
    AcquisitionFailure { reason: String },

    /// A symlink inside the acquired tree resolves outside the tree root.
    #[error("symlink `{file}` resolves outside the working tree")]
    OutOfBoundsSymlink { file: PathBuf },

    /// The combined size of candidate manifest files exceeds the budget.
    #[error("combined manifest file size exceeds the {limit} byte budget")]
    CombinedSizeExceeded { limit: u64 },

    /// A render strategy failed.
    #[error("{strategy} rendering failed: {detail}")]
    RenderFailure {
        strategy: RenderStrategy,
        detail: String,
    },

    /// The plugin exchange failed.
    #[error("plugin {phase} failed: {message}")]
    PluginFailure { phase: PluginPhase, message: String },

    /// Two references to one canonical URL disagree on the target revision.
    #[error("references to {url} resolve to conflicting target revisions")]
    InconsistentReferenceRevisions { url: String },

    /// A reference to the primary repository resolved to a different commit.
    #[error("reference to the primary source resolves to a different commit")]
    InconsistentPrimaryReference,

    /// A `$token` value-file path names a source the request does not declare.
    #[error("value file references unknown source `{token}`")]
    UnresolvedReference { token: String },

    /// A `$token` points at a chart source; charts may not be referenced.
    #[error("source `{token}` is a chart and may not be referenced")]
    ReferenceNotAllowed { token: String },

    /// The cache store failed in a way that cannot be treated as a miss.
    #[error("cache store failure: {detail}")]
    CacheStoreFailure { detail: String },

    /// A memoized failure served without re-rendering. The display form is
    /// [`MEMOIZED_ERROR_PREFIX`] followed by the stored message.
    #[error("Manifest generation error (cached): {message}")]
    Memoized { message: String },

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

impl GenerateError {
    /// Whether this failure feeds the negative-entry counter. Request-shape
    /// errors and memoized responses do not: retrying them is free and the
    /// caller has to fix the request anyway.
    pub fn counts_toward_pause(&self) -> bool {
        !matches!(
            self,
            GenerateError::Memoized { .. }
                | GenerateError::Cancelled
                | GenerateError::UnresolvedReference { .. }
                | GenerateError::ReferenceNotAllowed { .. }
                | GenerateError::InconsistentReferenceRevisions { .. }
                | GenerateError::InconsistentPrimaryReference
        )
    }

    /// Rewrite scratch-root path segments in every user-visible field.
    pub fn sanitized(self, sanitizer: &Sanitizer) -> Self {
        match self {
            GenerateError::ResolveFailure {
                url,
                revision,
                detail,
            } => GenerateError::ResolveFailure {
                url,
                revision,
                detail: sanitizer.sanitize(&detail),
            },
            GenerateError::AcquisitionFailure { reason } => GenerateError::AcquisitionFailure {
                reason: sanitizer.sanitize(&reason),
            },
            GenerateError::OutOfBoundsSymlink { file } => GenerateError::OutOfBoundsSymlink {
                file: PathBuf::from(sanitizer.sanitize(&file.to_string_lossy())),
            },
            GenerateError::RenderFailure { strategy, detail } => GenerateError::RenderFailure {
                strategy,
                detail: sanitizer.sanitize(&detail),
            },
            GenerateError::PluginFailure { phase, message } => GenerateError::PluginFailure {
                phase,
                message: sanitizer.sanitize(&message),
            },
            GenerateError::CacheStoreFailure { detail } => GenerateError::CacheStoreFailure {
                detail: sanitizer.sanitize(&detail),
            },
            GenerateError::Memoized { message } => GenerateError::Memoized {
                message: sanitizer.sanitize(&message),
            },
            other => other,
        }
    }
}
