//! Maximum drawdown tracking and knock-out detection.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

/// Tracks peak equity and flags a breach of the allowed drawdown.
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    /// Maximum allowed drawdown in percent of peak (e.g. 21 for 21%)
    max_drawdown_pct: Decimal,
    /// Peak equity value observed
    peak_equity: Decimal,
    /// Current drawdown from peak, in percent
    current_drawdown: Decimal,
    /// Worst drawdown observed this episode, in percent
    episode_mdd: Decimal,
    /// Equity at the latest update
    last_equity: Decimal,
}

impl DrawdownTracker {
    /// Create a new drawdown tracker.
    pub fn new(max_drawdown_pct: Decimal, initial_equity: Decimal) -> Self {
        Self {
            max_drawdown_pct,
            peak_equity: initial_equity,
            current_drawdown: Decimal::ZERO,
            episode_mdd: Decimal::ZERO,
            last_equity: initial_equity,
        }
    }

    /// Update with new equity value.
    ///
    /// Returns true once equity falls below `peak * (100 - max_drawdown_pct) / 100`.
    pub fn update(&mut self, equity: Decimal) -> bool {
        self.last_equity = equity;

        if equity > self.peak_equity {
            self.peak_equity = equity;
            self.current_drawdown = Decimal::ZERO;
            return false;
        }

        if self.peak_equity > Decimal::ZERO {
            self.current_drawdown = (self.peak_equity - equity) / self.peak_equity * dec!(100);
        }

        if self.current_drawdown > self.episode_mdd {
            self.episode_mdd = self.current_drawdown;
            debug!(
                mdd = %self.episode_mdd.round_dp(3),
                peak = %self.peak_equity,
                current = %equity,
                "New maximum drawdown recorded"
            );
        }

        let floor = self.peak_equity * (dec!(100) - self.max_drawdown_pct) / dec!(100);
        let breached = equity < floor;
        if breached {
            warn!(
                peak = %self.peak_equity,
                current = %equity,
                floor = %floor,
                "Maximum drawdown breached"
            );
        }
        breached
    }

    /// Current drawdown in percent of peak.
    pub fn current_drawdown(&self) -> Decimal {
        self.current_drawdown
    }

    /// Worst drawdown of the episode in percent of peak.
    pub fn episode_mdd(&self) -> Decimal {
        self.episode_mdd
    }

    /// Get peak equity value.
    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    /// Termination reason for a breach at the latest update.
    pub fn breach_reason(&self) -> String {
        format!(
            "max drawdown {}% breached: equity {} vs peak {} (limit {}%)",
            self.current_drawdown.round_dp(2),
            self.last_equity.round_dp(2),
            self.peak_equity.round_dp(2),
            self.max_drawdown_pct
        )
    }

    /// Reset the tracker for a new episode.
    pub fn reset(&mut self, initial_equity: Decimal) {
        self.peak_equity = initial_equity;
        self.current_drawdown = Decimal::ZERO;
        self.episode_mdd = Decimal::ZERO;
        self.last_equity = initial_equity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drawdown_tracking() {
        let mut tracker = DrawdownTracker::new(dec!(5), dec!(10000));

        // Equity goes up
        assert!(!tracker.update(dec!(10500)));
        assert_eq!(tracker.peak_equity(), dec!(10500));
        assert_eq!(tracker.current_drawdown(), Decimal::ZERO);

        // Equity drops: (10500 - 10000) / 10500 ~ 4.76%
        assert!(!tracker.update(dec!(10000)));
        assert!(tracker.current_drawdown() > dec!(4.7));
        assert!(tracker.current_drawdown() < dec!(5));

        // Further drop exceeds max drawdown
        assert!(tracker.update(dec!(9900)));
    }

    #[test]
    fn test_knock_out_at_twenty_two_percent() {
        let mut tracker = DrawdownTracker::new(dec!(21), dec!(100000));
        assert!(!tracker.update(dec!(80000)));
        assert!(tracker.update(dec!(78000)));
        assert_eq!(tracker.current_drawdown(), dec!(22));
        assert!(tracker.breach_reason().contains("22"));
    }

    #[test]
    fn test_recovery_keeps_episode_mdd() {
        let mut tracker = DrawdownTracker::new(dec!(50), dec!(1000));
        tracker.update(dec!(900));
        tracker.update(dec!(1100));
        assert_eq!(tracker.current_drawdown(), Decimal::ZERO);
        assert_eq!(tracker.episode_mdd(), dec!(10));

        tracker.reset(dec!(1000));
        assert_eq!(tracker.episode_mdd(), Decimal::ZERO);
        assert_eq!(tracker.peak_equity(), dec!(1000));
    }
}
