//! Sliding-window rate limiter.
//!
//! Counts unprompted inbound messages in the current one-second window
//! and keeps a ring of past window counts. Two ways to trip it:
//!
//! - more than `max_per_second` messages in the current window
//! - more than `history_alert_limit` remembered windows above
//!   `alert_threshold`
//!
//! The limiter itself has no clock; the owner calls [`RateLimiter::tick`]
//! once per second.

use std::collections::VecDeque;

use crate::config::RateLimitConfig;

/// Result of recording a message or closing a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    Allowed,
    /// The current window went over the hard cap.
    ExceededMax { count: u32, max: u32 },
    /// Too many recent windows went over the alert threshold.
    SustainedAlert { windows: usize, limit: usize },
}

impl RateVerdict {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    current: u32,
    history: VecDeque<u32>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            current: 0,
            history: VecDeque::with_capacity(config.history_size),
        }
    }

    /// Counts one message against the current window.
    pub fn record(&mut self) -> RateVerdict {
        self.current = self.current.saturating_add(1);
        if self.current > self.config.max_per_second {
            RateVerdict::ExceededMax {
                count: self.current,
                max: self.config.max_per_second,
            }
        } else {
            RateVerdict::Allowed
        }
    }

    /// Closes the current window into history and starts a new one.
    pub fn tick(&mut self) -> RateVerdict {
        self.history.push_back(self.current);
        while self.history.len() > self.config.history_size {
            self.history.pop_front();
        }
        self.current = 0;

        let windows = self.alert_windows();
        if windows > self.config.history_alert_limit {
            RateVerdict::SustainedAlert {
                windows,
                limit: self.config.history_alert_limit,
            }
        } else {
            RateVerdict::Allowed
        }
    }

    /// Remembered windows above the alert threshold.
    pub fn alert_windows(&self) -> usize {
        self.history
            .iter()
            .filter(|&&count| count > self.config.alert_threshold)
            .count()
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            max_per_second: 5,
            alert_threshold: 2,
            history_size: 4,
            history_alert_limit: 2,
        }
    }

    fn fill(limiter: &mut RateLimiter, n: u32) {
        for _ in 0..n {
            assert!(limiter.record().is_allowed());
        }
    }

    #[test]
    fn test_hard_cap_trips_on_the_next_message() {
        let mut limiter = RateLimiter::new(limits());
        fill(&mut limiter, 5);
        assert_eq!(
            limiter.record(),
            RateVerdict::ExceededMax { count: 6, max: 5 }
        );
    }

    #[test]
    fn test_tick_resets_current_window() {
        let mut limiter = RateLimiter::new(limits());
        fill(&mut limiter, 5);
        assert!(limiter.tick().is_allowed());
        assert_eq!(limiter.current(), 0);
        fill(&mut limiter, 5);
    }

    #[test]
    fn test_sustained_alert_without_hitting_cap() {
        let mut limiter = RateLimiter::new(limits());

        // Two alert windows are tolerated.
        for _ in 0..2 {
            fill(&mut limiter, 3);
            assert!(limiter.tick().is_allowed());
        }

        // The third crosses the history limit.
        fill(&mut limiter, 3);
        assert_eq!(
            limiter.tick(),
            RateVerdict::SustainedAlert { windows: 3, limit: 2 }
        );
    }

    #[test]
    fn test_old_windows_fall_out_of_history() {
        let mut limiter = RateLimiter::new(limits());

        for _ in 0..2 {
            fill(&mut limiter, 3);
            assert!(limiter.tick().is_allowed());
        }
        // Quiet windows push the busy ones out of the ring.
        for _ in 0..4 {
            assert!(limiter.tick().is_allowed());
        }
        assert_eq!(limiter.alert_windows(), 0);

        fill(&mut limiter, 3);
        assert!(limiter.tick().is_allowed());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut limiter = RateLimiter::new(limits());
        for _ in 0..4 {
            fill(&mut limiter, 2);
            assert!(limiter.tick().is_allowed());
        }
        assert_eq!(limiter.alert_windows(), 0);
    }
}
