//! # Manifold
//!
//! The manifest generation core of a GitOps repository server.
//!
//! Manifold turns an application's *source reference* (a remote repository
//! at some revision, plus a path and per-tool options) into a deterministic
//! list of rendered resource manifests, while preventing redundant work
//! across concurrent requests, caching results keyed by a fingerprint of
//! every input that can influence the output, and capping resource
//! consumption under adversarial inputs.
//!
//! ## Features
//!
//! - **Deterministic caching** — Rendered manifests are keyed by a sha256
//!   fingerprint over the resolved revision, the cross-reference map, the
//!   path, the normalized render options, and application identity; equal
//!   inputs always produce equal keys.
//! - **Failure memoization** — Keys that keep failing pause generation and
//!   serve the memoized error for a bounded window (see
//!   [`manifold_backoff`]), so broken sources cannot burn render capacity.
//! - **Working-tree sharing** — Requests at the same revision share one
//!   checkout; conflicting revisions wait their turn in FIFO order under
//!   the per-tree lock manager.
//! - **Bounded extraction** — Chart and OCI archives extract into
//!   per-request directories under byte caps, with out-of-bounds-symlink
//!   validation on every acquired tree.
//! - **Pluggable rendering** — Template, overlay, script, plugin, and
//!   raw-directory strategies behind uniform engine traits, selected per
//!   request by explicit override or tree inspection.
//! - **Streaming plugin protocol** — Plugin renders stream a filtered
//!   archive to a sidecar process and release the working-tree lock as soon
//!   as the bytes are on the wire, before the reply arrives.
//!
//! ## Pipeline
//!
//! The flow of one request through [`engine::GenerationEngine`]:
//!
//! 1. Resolve the ambiguous revision ([`resolver`]).
//! 2. Cross-resolve `$token` references ([`crossref`]) so the map is part
//!    of the cache key.
//! 3. Probe the manifest cache ([`cache`]), honoring memoized failures.
//! 4. Admit under the parallelism budget, acquire the source
//!    ([`treelock`], [`acquire`]), and double-check the cache.
//! 5. Render ([`render`], [`template`], [`overlay`], [`script`],
//!    [`plugin`]), normalize, stamp, cache, and return.
//!
//! ## Modules
//!
//! - [`engine`] — Orchestrator composing everything below
//! - [`resolver`] — Ambiguous references to immutable identifiers
//! - [`treelock`] — Per-working-tree reference-counted lock manager
//! - [`acquire`] — Checkout, capped extraction, symlink validation
//! - [`crossref`] — `$token` resolution and consistency rules
//! - [`cache`] — Typed two-tier cache with negative entries
//! - [`store`] — Pluggable key-value store behind the cache
//! - [`render`] — Strategy selection, raw-directory walk, normalization
//! - [`template`] — Template-family rendering and dependency builds
//! - [`overlay`] — Overlay-family rendering seam
//! - [`script`] — Script-family rendering seam
//! - [`plugin`] — Sidecar discovery and the streaming protocol
//! - [`source_patch`] — In-tree source override patching
//! - [`client`] — Collaborator interfaces (repositories, registries)
//! - [`config`] — `.manifold.toml` loading
//! - [`types`] — Domain types: sources, revisions, options, responses
//! - [`error`] — The [`error::GenerateError`] taxonomy

/// Source acquisition: checkout, capped extraction, symlink validation.
pub mod acquire;

/// Typed two-tier cache with negative entries.
pub mod cache;

/// Collaborator interfaces the core consumes.
pub mod client;

/// Configuration file (`.manifold.toml`) loading.
pub mod config;

/// Cross-source reference resolution.
pub mod crossref;

/// Manifest generation orchestrator.
pub mod engine;

/// Error taxonomy.
pub mod error;

/// Overlay-family rendering seam.
pub mod overlay;

/// Sidecar plugin discovery and streaming protocol.
pub mod plugin;

/// Render dispatch and normalization.
pub mod render;

/// Revision resolution.
pub mod resolver;

/// Script-family rendering seam.
pub mod script;

/// In-tree source override patching.
pub mod source_patch;

/// Pluggable key-value store behind the cache.
pub mod store;

/// Template-family rendering and dependency builds.
pub mod template;

/// Per-working-tree lock manager.
pub mod treelock;

/// Domain types.
pub mod types;

/// Failure-memoization pause policy.
/// Re-exported from the manifold-backoff microcrate.
pub use manifold_backoff as backoff;

/// Scratch-path sanitization for user-visible errors.
/// Re-exported from the manifold-sanitizer microcrate.
pub use manifold_sanitizer as sanitizer;

/// Shared test doubles.
#[cfg(test)]
pub(crate) mod testutil;
