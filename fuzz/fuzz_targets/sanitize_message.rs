#![no_main]

use libfuzzer_sys::fuzz_target;
use manifold_sanitizer::Sanitizer;

fuzz_target!(|data: (&str, &str)| {
    let (root, message) = data;
    if root.is_empty() || root.contains('\0') {
        return;
    }

    let sanitizer = Sanitizer::new(format!("/{}", root.trim_start_matches('/')));
    let sanitized = sanitizer.sanitize(message);

    // Invariants:
    // 1. Sanitization never panics and never grows the message unboundedly.
    assert!(sanitized.len() <= message.len() + message.len().max(1) * 8);

    // 2. A second pass is a no-op once the root is gone.
    if !sanitized.contains(sanitizer.root()) {
        assert_eq!(sanitizer.sanitize(&sanitized), sanitized);
    }
});
