//! Wall clock access for the mailbox runtimes.
//!
//! State machines take `now_ms` as a parameter so tests can drive time;
//! only the runtimes read the real clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
