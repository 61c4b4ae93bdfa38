// src/limits/window.rs
// Rolling-window consumption counter for rate limiting

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window counter. Entries age out after `window`; negative
/// entries (post-hoc corrections) cancel against earlier consumption.
#[derive(Debug)]
pub struct RollingWindow {
    window: Duration,
    entries: VecDeque<(Instant, i64)>,
}

impl RollingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    pub fn minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub fn hour() -> Self {
        Self::new(Duration::from_secs(3_600))
    }

    pub fn day() -> Self {
        Self::new(Duration::from_secs(86_400))
    }

    fn prune(&mut self, now: Instant) {
        while let Some((ts, _)) = self.entries.front() {
            if now.duration_since(*ts) >= self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn total(&mut self, now: Instant) -> i64 {
        self.prune(now);
        self.entries.iter().map(|(_, amount)| amount).sum::<i64>().max(0)
    }

    /// Record consumption (or a correction when `amount` is negative).
    pub fn consume(&mut self, amount: i64, now: Instant) {
        self.prune(now);
        if amount != 0 {
            self.entries.push_back((now, amount));
        }
    }

    /// When could `amount` more units be admitted under `limit`?
    /// `Ok(())` means right now; `Err(instant)` is the earliest time a
    /// retry can succeed (far future when `amount` alone exceeds the
    /// limit and waiting cannot help).
    pub fn admit_at(&mut self, amount: i64, limit: u64, now: Instant) -> Result<(), Instant> {
        let total = self.total(now);
        if total + amount <= limit as i64 {
            return Ok(());
        }

        if amount > limit as i64 {
            // Waiting never helps; effectively unreachable capacity
            return Err(now + self.window * 1_000);
        }

        let mut remaining = total;
        for (ts, entry_amount) in self.entries.iter() {
            remaining -= entry_amount;
            if remaining.max(0) + amount <= limit as i64 {
                return Err(*ts + self.window);
            }
        }
        Err(now + self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_limit() {
        let mut window = RollingWindow::minute();
        let now = Instant::now();
        assert!(window.admit_at(1, 3, now).is_ok());
        window.consume(1, now);
        window.consume(1, now);
        window.consume(1, now);
        assert!(window.admit_at(1, 3, now).is_err());
    }

    #[test]
    fn negative_correction_credits_back() {
        let mut window = RollingWindow::minute();
        let now = Instant::now();
        window.consume(1_000, now);
        assert!(window.admit_at(500, 1_200, now).is_err());
        // Actual usage came in lower than the estimate
        window.consume(-800, now);
        assert!(window.admit_at(500, 1_200, now).is_ok());
    }

    #[test]
    fn oversized_request_reports_far_future() {
        let mut window = RollingWindow::minute();
        let now = Instant::now();
        let Err(at) = window.admit_at(100, 10, now) else {
            panic!("must not admit an amount above the limit");
        };
        assert!(at.duration_since(now) > Duration::from_secs(3_600));
    }

    #[test]
    fn entries_age_out() {
        let mut window = RollingWindow::new(Duration::from_millis(10));
        let start = Instant::now();
        window.consume(5, start);
        assert_eq!(window.total(start), 5);
        assert_eq!(window.total(start + Duration::from_millis(11)), 0);
    }
}
