use std::time::Duration;

use rand::Rng;

pub fn now_sec() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Interval with a random initial delay in `0..max_shift`.
///
/// Spreads periodic tasks of many nodes started at the same time.
pub fn shifted_interval(period: Duration, max_shift: Duration) -> tokio::time::Interval {
    let shift = random_shift(max_shift);
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + shift + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

fn random_shift(max_shift: Duration) -> Duration {
    if max_shift.is_zero() {
        Duration::ZERO
    } else {
        rand::rng().random_range(Duration::ZERO..max_shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shifted_interval_skips_first_period() {
        let started_at = tokio::time::Instant::now();
        let mut interval = shifted_interval(Duration::from_secs(10), Duration::from_secs(1));
        interval.tick().await;

        let elapsed = started_at.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }
}
