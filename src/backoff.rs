//! Maps consecutive-error counts to wait intervals for both the update
//! cycle and the per-prefix full-hash subflow.

use rand::Rng;
use std::time::Duration;

/// Wait interval for the next update attempt given `consecutive_errors`
/// *after* the current failure has been counted.
pub fn update_backoff_wait(consecutive_errors: u32) -> Duration {
    let minutes_uniform = |lo: u64, hi: u64| -> Duration {
        let mins = if lo == hi { lo } else { rand::thread_rng().gen_range(lo..=hi) };
        Duration::from_secs(mins * 60)
    };
    match consecutive_errors {
        0 => Duration::from_secs(0),
        1 => Duration::from_secs(60),
        2 => minutes_uniform(30, 60),
        3 => minutes_uniform(60, 120),
        4 => minutes_uniform(120, 240),
        5 => minutes_uniform(240, 480),
        _ => Duration::from_secs(480 * 60),
    }
}

/// How long a full-hash request for a prefix with this many consecutive
/// errors should be throttled. `None` means the prefix is not throttled
/// (either no errors, or exactly the tolerated 2nd error).
pub fn full_hash_throttle_duration(errors: u32) -> Option<Duration> {
    match errors {
        0 => None,
        1 => Some(Duration::from_secs(5 * 60)),
        2 => None,
        3 => Some(Duration::from_secs(30 * 60)),
        4 => Some(Duration::from_secs(60 * 60)),
        _ => Some(Duration::from_secs(120 * 60)),
    }
}

/// Whether a prefix's full-hash errors currently throttle new requests.
pub fn is_full_hash_throttled(errors: u32, error_timestamp: u64, now: u64) -> bool {
    match full_hash_throttle_duration(errors) {
        Some(wait) => now.saturating_sub(error_timestamp) < wait.as_secs(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_backoff_waits_are_within_spec_intervals() {
        for _ in 0..200 {
            assert_eq!(update_backoff_wait(1), Duration::from_secs(60));

            let w = update_backoff_wait(2).as_secs();
            assert!((30 * 60..=60 * 60).contains(&w));

            let w = update_backoff_wait(3).as_secs();
            assert!((60 * 60..=120 * 60).contains(&w));

            let w = update_backoff_wait(4).as_secs();
            assert!((120 * 60..=240 * 60).contains(&w));

            let w = update_backoff_wait(5).as_secs();
            assert!((240 * 60..=480 * 60).contains(&w));

            assert_eq!(update_backoff_wait(6), Duration::from_secs(480 * 60));
            assert_eq!(update_backoff_wait(99), Duration::from_secs(480 * 60));
        }
    }

    #[test]
    fn four_consecutive_errors_lands_in_two_to_four_hours() {
        let wait = update_backoff_wait(4).as_secs();
        assert!((7200..=14400).contains(&wait));
    }

    #[test]
    fn full_hash_second_error_is_tolerated() {
        assert_eq!(full_hash_throttle_duration(2), None);
        assert!(!is_full_hash_throttled(2, 0, 1000));
    }

    #[test]
    fn full_hash_first_error_throttles_for_five_minutes() {
        assert!(is_full_hash_throttled(1, 1000, 1000 + 60));
        assert!(!is_full_hash_throttled(1, 1000, 1000 + 5 * 60 + 1));
    }
}
