//! Admission-time risk gating.
//!
//! Every new position passes through the gate before it is admitted. The
//! gate is a pure function over the caller's equity and a consistent
//! snapshot of that user's active positions; it performs no I/O and its
//! decision is final for the admission attempt.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::config::RiskConfig;
use crate::position::Position;

/// Ephemeral view of a user's risk exposure, computed per gate call.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub current_equity: Decimal,
    pub unrealized_pnl_total: Decimal,
    pub invested_total: Decimal,
}

impl RiskSnapshot {
    /// Derive the snapshot from the live set of non-terminal positions.
    /// Uses each position's last known price; nothing is re-fetched.
    pub fn capture(current_equity: Decimal, active_positions: &[Position]) -> Self {
        let mut unrealized_pnl_total = Decimal::ZERO;
        let mut invested_total = Decimal::ZERO;

        for position in active_positions {
            if position.status.is_terminal() {
                continue;
            }
            unrealized_pnl_total += position.unrealized_pnl();
            // Waiting positions reserve their full notional; live ones
            // count what is still committed.
            invested_total += if position.status.is_waiting() {
                position.amount
            } else {
                position.remaining_amount
            };
        }

        Self {
            current_equity,
            unrealized_pnl_total,
            invested_total,
        }
    }

    /// Unrealized drawdown as a fraction of equity.
    pub fn drawdown(&self) -> Decimal {
        if self.current_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let loss = (-self.unrealized_pnl_total).max(Decimal::ZERO);
        loss / self.current_equity
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDecision {
    Approved,
    Rejected { reason: String },
}

impl RiskDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, RiskDecision::Approved)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            RiskDecision::Approved => None,
            RiskDecision::Rejected { reason } => Some(reason),
        }
    }
}

/// Gate preventing new positions when drawdown or exposure limits are
/// breached.
pub struct RiskGate {
    config: RiskConfig,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Decide whether a new position may open for this user.
    pub fn can_open(&self, user_equity: Decimal, active_positions: &[Position]) -> RiskDecision {
        if user_equity <= Decimal::ZERO {
            return RiskDecision::Rejected {
                reason: "insufficient balance".to_string(),
            };
        }

        let snapshot = RiskSnapshot::capture(user_equity, active_positions);
        let drawdown = snapshot.drawdown();

        debug!(
            equity = %snapshot.current_equity,
            unrealized = %snapshot.unrealized_pnl_total,
            invested = %snapshot.invested_total,
            %drawdown,
            "Risk gate check"
        );

        if drawdown > self.config.max_drawdown_ratio {
            return RiskDecision::Rejected {
                reason: format!(
                    "drawdown {:.4} exceeds limit {}",
                    drawdown, self.config.max_drawdown_ratio
                ),
            };
        }

        if snapshot.invested_total >= self.config.max_exposure {
            return RiskDecision::Rejected {
                reason: format!(
                    "exposure {} at or above limit {}",
                    snapshot.invested_total, self.config.max_exposure
                ),
            };
        }

        RiskDecision::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{Market, PositionSpec, PositionStatus, Side};
    use rust_decimal_macros::dec;

    fn gate() -> RiskGate {
        RiskGate::new(RiskConfig::default())
    }

    fn open_position(amount: Decimal, entry: Decimal, current: Decimal) -> Position {
        let mut position = Position::new(PositionSpec {
            user_id: "user-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            market: Market::Futures,
            side: Side::Buy,
            entry_price: entry,
            amount,
            quote_asset: "USDT".to_string(),
            stop_loss: None,
            take_profits: Vec::new(),
            leverage: 1,
        });
        position.status = PositionStatus::Open;
        position.current_price = current;
        position
    }

    #[test]
    fn test_rejects_on_non_positive_equity() {
        let decision = gate().can_open(dec!(0), &[]);
        assert_eq!(decision.reason(), Some("insufficient balance"));
    }

    #[test]
    fn test_rejects_when_drawdown_exceeds_limit() {
        // 1000 notional at entry 100, price 85: unrealized -150 on 1000
        // equity, drawdown 0.15 > 0.10
        let positions = vec![open_position(dec!(1000), dec!(100), dec!(85))];
        let decision = gate().can_open(dec!(1000), &positions);

        assert!(!decision.allowed());
        assert!(decision.reason().unwrap().contains("drawdown"));
    }

    #[test]
    fn test_allows_drawdown_at_the_limit() {
        // Exactly 10% drawdown is allowed; the rule is strictly-greater.
        // Invested 500 stays below the exposure cap.
        let positions = vec![open_position(dec!(500), dec!(100), dec!(80))];
        let decision = gate().can_open(dec!(1000), &positions);
        assert!(decision.allowed());
    }

    #[test]
    fn test_rejects_when_exposure_reached() {
        let positions = vec![
            open_position(dec!(600), dec!(100), dec!(100)),
            open_position(dec!(400), dec!(100), dec!(100)),
        ];
        let decision = gate().can_open(dec!(5000), &positions);

        assert!(!decision.allowed());
        assert!(decision.reason().unwrap().contains("exposure"));
    }

    #[test]
    fn test_waiting_positions_reserve_exposure() {
        let mut waiting = open_position(dec!(990), dec!(100), dec!(100));
        waiting.status = PositionStatus::Monitoring;

        let decision = gate().can_open(dec!(5000), &[waiting]);
        assert!(decision.allowed());

        let mut at_cap = open_position(dec!(1000), dec!(100), dec!(100));
        at_cap.status = PositionStatus::Monitoring;
        assert!(!gate().can_open(dec!(5000), &[at_cap]).allowed());
    }

    #[test]
    fn test_approves_clean_book() {
        assert!(gate().can_open(dec!(1000), &[]).allowed());
    }
}
