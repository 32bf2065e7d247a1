//! Script-family rendering seam.
//!
//! The interpreter is a collaborator; the core owns search-path assembly
//! (repository-root-relative, escape-checked), variable binding, and the
//! object-or-array output contract.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::GenerateError;
use crate::types::{RenderStrategy, ScriptOptions, ScriptVar};

/// Interpreter construction parameters for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct ScriptVmSpec {
    /// Import search paths: the tree root plus any declared libraries.
    pub search_paths: Vec<PathBuf>,
    pub tlas: Vec<ScriptVar>,
    pub ext_vars: Vec<ScriptVar>,
}

/// Black-box script interpreter.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Evaluate one file; the result is a single object or an array of
    /// objects.
    async fn evaluate(&self, file: &Path, vm: &ScriptVmSpec) -> Result<Value>;
}

/// Extension evaluated by the script strategy.
pub const SCRIPT_EXTENSION: &str = "jsonnet";

/// Build the VM spec for a tree: the root goes on the search path, followed
/// by each declared library directory resolved against the root. A library
/// path that escapes the root fails the render.
pub fn vm_spec(
    tree_root: &Path,
    options: Option<&ScriptOptions>,
    env: &[(String, String)],
) -> Result<ScriptVmSpec, GenerateError> {
    let mut spec = ScriptVmSpec {
        search_paths: vec![tree_root.to_path_buf()],
        ..ScriptVmSpec::default()
    };
    let Some(options) = options else {
        return Ok(spec);
    };

    for lib in &options.libs {
        let joined = normalize_under_root(tree_root, Path::new(lib));
        match joined {
            Some(path) => spec.search_paths.push(path),
            None => {
                return Err(GenerateError::RenderFailure {
                    strategy: RenderStrategy::Script,
                    detail: format!("library path `{lib}` escapes the repository root"),
                });
            }
        }
    }

    spec.tlas = substitute_vars(&options.tlas, env);
    spec.ext_vars = substitute_vars(&options.ext_vars, env);
    Ok(spec)
}

fn substitute_vars(vars: &[ScriptVar], env: &[(String, String)]) -> Vec<ScriptVar> {
    vars.iter()
        .map(|v| ScriptVar {
            name: v.name.clone(),
            value: crate::render::substitute_env(&v.value, env),
            code: v.code,
        })
        .collect()
}

/// Join a relative path under a root, resolving `..` lexically; `None` when
/// the result escapes the root.
pub fn normalize_under_root(root: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    let mut depth: usize = 0;
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::Normal(part) => {
                depth += 1;
                out.push(part);
            }
        }
    }
    Some(out)
}

/// Flatten an engine result into individual resource objects: a single
/// object stays one resource, an array contributes each element.
pub fn flatten_result(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
