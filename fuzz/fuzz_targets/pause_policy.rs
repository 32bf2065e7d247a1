#![no_main]

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use libfuzzer_sys::fuzz_target;
use manifold_backoff::{FailureWindow, PauseConfig};

fuzz_target!(|data: (u8, u16, u8, u8, u8, u32)| {
    let (threshold, window_minutes, requests, failures, served, elapsed_secs) = data;

    let policy = PauseConfig {
        pause_after_failures: threshold as u32,
        pause_window: Duration::from_secs(window_minutes as u64 * 60),
        pause_requests: requests as u32,
    };

    let first = Utc::now();
    let mut window = FailureWindow::default();
    for _ in 0..failures {
        window.register_failure(first);
    }
    for _ in 0..served {
        window.register_served();
    }

    let now = first + TimeDelta::seconds(elapsed_secs as i64);
    let paused = policy.should_pause(&window);
    let expired = policy.pause_expired(&window, now);

    // Invariants:
    // 1. A disabled policy never pauses.
    if threshold == 0 {
        assert!(!paused);
    }

    // 2. Pausing requires at least the threshold of failures.
    if paused {
        assert!(failures as u32 >= threshold as u32);
    }

    // 3. With both exit bounds disabled the pause never expires.
    if window_minutes == 0 && requests == 0 {
        assert!(!expired);
    }

    // 4. Reset clears everything.
    window.reset();
    assert!(!policy.should_pause(&window));
});
