//! Cross-source reference resolution.
//!
//! Template-family sources may declare value files under other repositories
//! through `$token/...` paths. Before the cache probe the orchestrator
//! resolves every referenced repository to a concrete revision and records
//! it here; the map participates in the cache key and the consistency rules
//! below make a conflicting request fail before anything is acquired.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::client::canonical_repo_url;
use crate::error::GenerateError;
use crate::resolver::Resolver;
use crate::types::{GenerateRequest, ResolvedRevision, SourceKind, SourceRef};

/// Where one `$token` reference landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossRefEntry {
    pub repo_url: String,
    pub revision: ResolvedRevision,
}

/// Per-request mapping from reference token to resolved repository.
///
/// Each canonical URL maps to exactly one revision per request; inserting a
/// conflicting resolution fails the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossRefMap {
    entries: BTreeMap<String, CrossRefEntry>,
}

impl CrossRefMap {
    pub fn insert(
        &mut self,
        token: &str,
        repo_url: &str,
        revision: ResolvedRevision,
    ) -> Result<(), GenerateError> {
        let canonical = canonical_repo_url(repo_url);
        for entry in self.entries.values() {
            if entry.repo_url == canonical && entry.revision != revision {
                return Err(GenerateError::InconsistentReferenceRevisions { url: canonical });
            }
        }
        self.entries.insert(
            token.to_string(),
            CrossRefEntry {
                repo_url: canonical,
                revision,
            },
        );
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<&CrossRefEntry> {
        self.entries.get(token)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CrossRefEntry)> {
        self.entries.iter()
    }
}

/// Extract the `$token` of a value-file path, if it has one.
pub fn reference_token(path: &str) -> Option<&str> {
    if !path.starts_with('$') {
        return None;
    }
    Some(path.split('/').next().unwrap_or(path))
}

/// Resolve every `$token` the active source references.
///
/// Only template-family sources of multi-source requests participate;
/// everything else yields an empty map.
pub async fn build_crossref_map(
    request: &GenerateRequest,
    primary_revision: &ResolvedRevision,
    resolver: &Resolver,
) -> Result<CrossRefMap, GenerateError> {
    let mut map = CrossRefMap::default();
    if !request.has_multiple_sources {
        return Ok(map);
    }
    let Some(template) = &request.source.render_options.template else {
        return Ok(map);
    };

    let primary_url = canonical_repo_url(&request.source.url);
    for value_file in &template.value_files {
        let Some(token) = reference_token(value_file) else {
            continue;
        };
        if map.get(token).is_some() {
            continue;
        }

        let Some(ref_source) = request.ref_sources.get(token) else {
            return Err(GenerateError::UnresolvedReference {
                token: token.to_string(),
            });
        };
        if ref_source.is_chart {
            return Err(GenerateError::ReferenceNotAllowed {
                token: token.to_string(),
            });
        }

        let referenced = SourceRef {
            kind: SourceKind::Repo,
            url: ref_source.repo_url.clone(),
            target_revision: ref_source.target_revision.clone(),
            ..SourceRef::default()
        };
        let revision = resolver
            .resolve(&referenced, "", request.no_revision_cache)
            .await?;

        if canonical_repo_url(&ref_source.repo_url) == primary_url && revision != *primary_revision
        {
            return Err(GenerateError::InconsistentPrimaryReference);
        }
        map.insert(token, &ref_source.repo_url, revision)?;
    }
    Ok(map)
}
