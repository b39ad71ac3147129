//! Greedy fill-price maximization policy.
//!
//! While a window is active the tracker keeps waiting as long as price keeps
//! moving favorably (lower when acquiring, higher when disposing), and bails
//! out at the current price once it rebounds more than a configured
//! threshold from the best price seen. The window is bounded by an iteration
//! budget; on exhaustion the last observed price is the fallback fill.

use rust_decimal::Decimal;

/// What a maximization window is trying to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Waiting position near its entry target.
    Entry,
    /// Closing position looking for the best exit.
    Exit,
}

/// Verdict for one observed price inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStep {
    /// Price still moving favorably (or within the rebound tolerance).
    Continue,
    /// Price reversed past the threshold: fill at the current price.
    Execute,
}

/// Ride-the-trend / bail-on-reversal tracker for one window.
#[derive(Debug, Clone)]
pub struct MaximizationPolicy {
    /// Whether a falling price is the favorable direction.
    favors_lower: bool,
    /// Rebound from the best seen (in percent) that ends the window.
    rebound_threshold_pct: Decimal,
    best: Option<Decimal>,
}

impl MaximizationPolicy {
    pub fn new(favors_lower: bool, rebound_threshold_pct: Decimal) -> Self {
        Self {
            favors_lower,
            rebound_threshold_pct,
            best: None,
        }
    }

    /// Best price observed so far, if any.
    pub fn best(&self) -> Option<Decimal> {
        self.best
    }

    /// Feed one observed price and decide whether to keep waiting.
    pub fn observe(&mut self, price: Decimal) -> WindowStep {
        let best = match self.best {
            None => {
                self.best = Some(price);
                return WindowStep::Continue;
            }
            Some(best) => best,
        };

        let improved = if self.favors_lower {
            price <= best
        } else {
            price >= best
        };

        if improved {
            self.best = Some(price);
            return WindowStep::Continue;
        }

        if best == Decimal::ZERO {
            return WindowStep::Continue;
        }

        let rebound_pct = ((price - best).abs() / best) * Decimal::new(100, 0);
        if rebound_pct > self.rebound_threshold_pct {
            WindowStep::Execute
        } else {
            WindowStep::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn disposing_policy() -> MaximizationPolicy {
        // Selling side: higher is better, 0.2% rebound tolerance
        MaximizationPolicy::new(false, dec!(0.2))
    }

    #[test]
    fn test_favorable_moves_extend_the_window() {
        let mut policy = disposing_policy();
        assert_eq!(policy.observe(dec!(100)), WindowStep::Continue);
        assert_eq!(policy.observe(dec!(103)), WindowStep::Continue);
        assert_eq!(policy.observe(dec!(105)), WindowStep::Continue);
        assert_eq!(policy.best(), Some(dec!(105)));
    }

    #[test]
    fn test_rebound_below_threshold_keeps_waiting() {
        let mut policy = disposing_policy();
        policy.observe(dec!(105));

        // 0.2/105 ≈ 0.19% < 0.2%: not a reversal yet
        assert_eq!(policy.observe(dec!(104.8)), WindowStep::Continue);
        // The best seen does not move on an unfavorable tick
        assert_eq!(policy.best(), Some(dec!(105)));
    }

    #[test]
    fn test_rebound_past_threshold_executes() {
        let mut policy = disposing_policy();
        policy.observe(dec!(105));

        // 0.4/105 ≈ 0.38% > 0.2%: bail and fill at the current price
        assert_eq!(policy.observe(dec!(104.6)), WindowStep::Execute);
    }

    #[test]
    fn test_acquiring_side_inverts_direction() {
        let mut policy = MaximizationPolicy::new(true, dec!(0.2));
        policy.observe(dec!(100));
        assert_eq!(policy.observe(dec!(99)), WindowStep::Continue);
        assert_eq!(policy.best(), Some(dec!(99)));

        // 0.5/99 ≈ 0.5% rebound upward ends an acquiring window
        assert_eq!(policy.observe(dec!(99.5)), WindowStep::Execute);
    }

    #[test]
    fn test_equal_price_counts_as_favorable() {
        let mut policy = disposing_policy();
        policy.observe(dec!(105));
        assert_eq!(policy.observe(dec!(105)), WindowStep::Continue);
    }
}
