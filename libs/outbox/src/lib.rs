//! Outbound subscriber notifications through a transactional outbox.
//!
//! Enqueue writes one `WebhookDelivery` row per matching webhook and kicks
//! an immediate attempt; a poller claims due and stale rows with
//! `FOR UPDATE SKIP LOCKED` and walks the exponential retry schedule until
//! delivery or terminal failure.

pub mod dispatch;
pub mod processor;

pub use dispatch::*;
pub use processor::*;

use time::Duration;

/// Retry backoff, indexed by the number of failed attempts so far.
pub const RETRY_SCHEDULE: [Duration; 6] = [
    Duration::minutes(1),
    Duration::minutes(5),
    Duration::minutes(15),
    Duration::hours(1),
    Duration::hours(6),
    Duration::hours(24),
];

pub const MAX_ATTEMPTS: i32 = RETRY_SCHEDULE.len() as i32;

/// Delay before the attempt numbered `attempt` (1-based).
pub fn retry_delay(attempt: i32) -> Duration {
    if attempt <= 0 {
        return RETRY_SCHEDULE[0];
    }
    let idx = (attempt as usize - 1).min(RETRY_SCHEDULE.len() - 1);
    RETRY_SCHEDULE[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_matches_contract() {
        assert_eq!(retry_delay(1), Duration::minutes(1));
        assert_eq!(retry_delay(2), Duration::minutes(5));
        assert_eq!(retry_delay(3), Duration::minutes(15));
        assert_eq!(retry_delay(4), Duration::hours(1));
        assert_eq!(retry_delay(5), Duration::hours(6));
        assert_eq!(retry_delay(6), Duration::hours(24));
        // past the end the last rung repeats
        assert_eq!(retry_delay(9), Duration::hours(24));
        assert_eq!(retry_delay(0), Duration::minutes(1));
    }
}
