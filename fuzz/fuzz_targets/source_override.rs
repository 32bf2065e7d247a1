#![no_main]

use libfuzzer_sys::fuzz_target;
use manifold::source_patch::{SOURCE_OVERRIDE_FILE, apply_source_overrides};
use manifold::types::SourceRef;

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempfile::tempdir() else {
        return;
    };
    if std::fs::write(td.path().join(SOURCE_OVERRIDE_FILE), data).is_err() {
        return;
    }

    let source = SourceRef {
        url: "https://example.com/repo".to_string(),
        path: "apps/demo".to_string(),
        target_revision: "main".to_string(),
        ..SourceRef::default()
    };

    // Arbitrary override content either errors cleanly or yields a source
    // whose identity fields are untouched.
    if let Ok(patched) = apply_source_overrides(td.path(), "demo", &source) {
        assert_eq!(patched.url, source.url);
        assert_eq!(patched.path, source.path);
        assert_eq!(patched.target_revision, source.target_revision);
    }
});
