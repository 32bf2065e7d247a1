//! In-tree source overrides.
//!
//! A tree may carry `.argocd-source.yaml` and `.argocd-source-<app>.yaml`
//! patches next to the application path. They are JSON-merge-patched onto a
//! JSON rendering of the incoming source, generic file first, and the
//! identity fields are reset from the request afterwards so an override can
//! tune tool options but never redirect to a different source.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::types::SourceRef;

/// Override applying to every application rendering from this path.
pub const SOURCE_OVERRIDE_FILE: &str = ".argocd-source.yaml";

/// Override applying to one application only.
pub fn app_override_file(app_name: &str) -> String {
    format!(".argocd-source-{app_name}.yaml")
}

/// Apply any override files under `app_dir` to `source`.
pub fn apply_source_overrides(app_dir: &Path, app_name: &str, source: &SourceRef) -> Result<SourceRef> {
    let mut merged = serde_json::to_value(source).context("source serializes")?;
    let mut patched_any = false;

    for name in [SOURCE_OVERRIDE_FILE.to_string(), app_override_file(app_name)] {
        let path = app_dir.join(&name);
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read override {name}"))?;
        let patch: Value = serde_yml::from_str(&content)
            .with_context(|| format!("failed to parse override {name}"))?;
        json_patch::merge(&mut merged, &patch);
        patched_any = true;
    }

    if !patched_any {
        return Ok(source.clone());
    }

    let mut patched: SourceRef =
        serde_json::from_value(merged).context("merged source does not deserialize")?;
    // Identity fields always come from the request.
    patched.kind = source.kind;
    patched.url = source.url.clone();
    patched.path = source.path.clone();
    patched.chart = source.chart.clone();
    patched.target_revision = source.target_revision.clone();
    patched.reference = source.reference.clone();
    Ok(patched)
}
