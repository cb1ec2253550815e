// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared helpers for the integration tests.

use std::sync::Once;
use std::thread;
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output through the test harness. First call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_ids(true)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Demo delays scaled down from seconds.
pub fn ticks(n: u64) -> Duration {
    Duration::from_millis(50 * n)
}

/// Poll `cond` until it holds; the primitives under test expose no event
/// for "a thread is now parked".
#[allow(dead_code)]
pub fn eventually(mut cond: impl FnMut() -> bool) {
    while !cond() {
        thread::sleep(Duration::from_millis(1));
    }
}
