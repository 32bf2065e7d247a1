//! Overlay-family rendering seam.
//!
//! The overlay engine itself is a collaborator; the core passes build
//! options through and keeps the returned image list for the detail
//! endpoint.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// One overlay build invocation.
#[derive(Debug, Clone)]
pub struct OverlayRequest {
    /// Directory holding the overlay file.
    pub path: PathBuf,
    pub kube_version: Option<String>,
    pub api_versions: Vec<String>,
    /// Environment seeded from application identity.
    pub env: Vec<(String, String)>,
}

/// What an overlay build produced.
#[derive(Debug, Clone, Default)]
pub struct OverlayOutput {
    pub manifests: Vec<Value>,
    /// Container images referenced by the build; detail endpoint only.
    pub images: Vec<String>,
}

/// Black-box overlay build engine.
#[async_trait]
pub trait OverlayEngine: Send + Sync {
    async fn build(&self, request: &OverlayRequest) -> Result<OverlayOutput>;
}

/// Overlay descriptor files that trigger autodetection.
pub const OVERLAY_FILES: &[&str] = &["kustomization.yaml", "kustomization.yml", "Kustomization"];
