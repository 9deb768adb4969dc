//! Fuzz target for gap tracking.
//!
//! Feeds arbitrary id sequences through `GapTracker::check` and verifies
//! it never panics and never tracks more gaps than its limit.

#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use replication_cursor::{GapConfig, GapTracker};

fuzz_target!(|data: (i64, Vec<i64>, u8)| {
    let (start, ids, limit) = data;
    let config = GapConfig {
        max_tracked_gaps: usize::from(limit).max(1),
        ..GapConfig::default()
    };

    let mut tracker = GapTracker::new(&config);
    tracker.set_previous_id(start);
    let now = Utc::now();
    for id in ids {
        tracker.check(id, now);
        assert!(tracker.outstanding() <= config.max_tracked_gaps);
    }
});
