//! Path sanitization for user-visible manifold errors.
//!
//! Working trees and per-request extraction directories live under a scratch
//! root in randomly named subdirectories. Error messages produced while
//! operating on those trees frequently embed absolute paths; returning them
//! to callers would leak the randomized segment and defeat the scratch
//! root's no-enumeration permission scheme. This crate rewrites any
//! occurrence of the scratch root plus its immediate child segment into a
//! stable placeholder.
//!
//! # Example
//!
//! ```
//! use manifold_sanitizer::Sanitizer;
//!
//! let s = Sanitizer::new("/tmp/_manifold");
//! let msg = s.sanitize("open /tmp/_manifold/7f3c2a/app/values.yaml: not found");
//! assert_eq!(msg, "open <path>/app/values.yaml: not found");
//! ```

/// Replacement for the scratch root and its randomized child segment.
pub const PLACEHOLDER: &str = "<path>";

/// Rewrites scratch-root path segments in arbitrary text.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    root: String,
}

impl Sanitizer {
    /// Create a sanitizer for the given scratch root.
    ///
    /// A trailing slash on the root is ignored so that both spellings
    /// sanitize identically.
    pub fn new(scratch_root: impl Into<String>) -> Self {
        let mut root = scratch_root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    /// Replace every occurrence of `<root>/<segment>` (and bare `<root>`)
    /// with [`PLACEHOLDER`], preserving the remainder of the path.
    pub fn sanitize(&self, message: &str) -> String {
        if self.root.is_empty() || !message.contains(&self.root) {
            return message.to_string();
        }

        let mut out = String::with_capacity(message.len());
        let mut rest = message;
        while let Some(idx) = rest.find(&self.root) {
            out.push_str(&rest[..idx]);
            let tail = &rest[idx + self.root.len()..];
            out.push_str(PLACEHOLDER);
            rest = strip_random_segment(tail);
        }
        out.push_str(rest);
        out
    }

    /// The configured scratch root.
    pub fn root(&self) -> &str {
        &self.root
    }
}

/// Drop the first `/segment` following the root, keeping everything after
/// it. Without a separator (the message ended at the root) nothing is
/// stripped.
fn strip_random_segment(tail: &str) -> &str {
    let Some(after_slash) = tail.strip_prefix('/') else {
        return tail;
    };
    match after_slash.find(|c: char| c == '/' || c.is_whitespace() || c == ':' || c == '"' || c == '\'') {
        Some(end) => &after_slash[end..],
        None => "",
    }
}
