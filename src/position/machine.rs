//! Transition rules and settlement arithmetic for the position lifecycle.
//!
//! `evaluate_tick` is a pure decision function over (position, observed
//! price, config); the monitor applies the decision it returns. Ledger
//! movements are computed here as `Settlement` values so that the ledger
//! write can happen (and be retried) before any position state is mutated.

use rust_decimal::Decimal;
use tracing::trace;

use super::{Position, Side};

/// Outcome of evaluating one position against one observed price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// No transition this tick.
    Hold,
    /// Entry condition crossed: open at the observed price.
    Enter,
    /// Price entered the proximity band of the entry target; hand the
    /// position to a high-frequency entry window.
    StartEntryWindow,
    /// Stop-loss breached: proceed to closing immediately.
    StopLoss,
    /// Take-profit at `index` reached. `is_final` when it is the last
    /// target in priority order.
    TakeProfit { index: usize, is_final: bool },
}

/// Evaluate the transition rules for one tick.
///
/// Tie-break: when both a stop-loss and a take-profit would trigger on the
/// same observed price, the stop-loss wins (protect capital over profit).
pub fn evaluate_tick(
    position: &Position,
    price: Decimal,
    proximity_band_pct: Decimal,
) -> TickDecision {
    if position.status.is_waiting() {
        // No explicit entry target: nothing to cross and no band to enter.
        if position.entry_price <= Decimal::ZERO {
            return TickDecision::Hold;
        }
        if position.entry_crossed(price) {
            return TickDecision::Enter;
        }
        if position.entry_distance_pct(price) <= proximity_band_pct {
            return TickDecision::StartEntryWindow;
        }
        return TickDecision::Hold;
    }

    if position.status == super::PositionStatus::Open {
        if position.stop_breached(price) {
            return TickDecision::StopLoss;
        }

        if let Some((index, tp)) = position.next_take_profit() {
            if position.take_profit_reached(tp, price) {
                let is_final = index + 1 == position.take_profits.len();
                return TickDecision::TakeProfit { index, is_final };
            }
        }
        return TickDecision::Hold;
    }

    trace!(id = %position.id, status = %position.status, "No rules for status");
    TickDecision::Hold
}

/// One ledger movement derived from a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    /// Relative delta on the position's (user, market, quote asset) key.
    pub delta: Decimal,
    /// Realized PnL component of the delta.
    pub realized_pnl: Decimal,
    /// Notional consumed from the live position by this movement.
    pub notional: Decimal,
}

/// Ledger movement committing the entry: buys debit the quote asset by the
/// full notional, sells credit it.
pub fn entry_settlement(position: &Position) -> Settlement {
    Settlement {
        delta: position.entry_delta(),
        realized_pnl: Decimal::ZERO,
        notional: position.amount,
    }
}

/// Ledger movement for a partial take-profit fill.
///
/// The slice is `remaining × percent/100`; it realizes PnL at the observed
/// fill price and returns its share of the entry principal.
pub fn tp_settlement(position: &Position, index: usize, fill_price: Decimal) -> Settlement {
    let tp = &position.take_profits[index];
    let slice = position.remaining_amount * tp.percent / Decimal::new(100, 0);
    settle_notional(position, slice, fill_price)
}

/// Ledger movement closing the remaining notional at `exit_price`.
pub fn terminal_settlement(position: &Position, exit_price: Decimal) -> Settlement {
    settle_notional(position, position.remaining_amount, exit_price)
}

/// Ledger movement reverting the outstanding entry commitment of a failed
/// position. Slices already settled by partial take-profits stay settled.
pub fn revert_settlement(position: &Position) -> Settlement {
    let delta = match position.side {
        Side::Buy => position.remaining_amount,
        Side::Sell => -position.remaining_amount,
    };
    Settlement {
        delta,
        realized_pnl: Decimal::ZERO,
        notional: position.remaining_amount,
    }
}

fn settle_notional(position: &Position, notional: Decimal, fill_price: Decimal) -> Settlement {
    let realized = position.signed_pnl(fill_price, notional);
    // A buy gets its principal back plus pnl; a sell pays the buyback cost,
    // which is principal minus pnl.
    let delta = match position.side {
        Side::Buy => notional + realized,
        Side::Sell => realized - notional,
    };
    Settlement {
        delta,
        realized_pnl: realized,
        notional,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{Market, PositionSpec, PositionStatus, TakeProfit};
    use rust_decimal_macros::dec;

    fn buy_position() -> Position {
        Position::new(PositionSpec {
            user_id: "user-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            market: Market::Futures,
            side: Side::Buy,
            entry_price: dec!(100),
            amount: dec!(500),
            quote_asset: "USDT".to_string(),
            stop_loss: Some(dec!(90)),
            take_profits: vec![
                TakeProfit::new(dec!(120), dec!(50)),
                TakeProfit::new(dec!(140), dec!(100)),
            ],
            leverage: 1,
        })
    }

    #[test]
    fn test_waiting_enters_on_cross() {
        let pos = buy_position();
        assert_eq!(evaluate_tick(&pos, dec!(99), dec!(2)), TickDecision::Enter);
        assert_eq!(evaluate_tick(&pos, dec!(100), dec!(2)), TickDecision::Enter);
    }

    #[test]
    fn test_pending_without_target_holds() {
        // entry_price 0 means no explicit target: the position must not
        // enter, and must not spawn entry windows on every tick.
        let mut pos = buy_position();
        pos.entry_price = Decimal::ZERO;
        pos.status = PositionStatus::Pending;
        assert_eq!(evaluate_tick(&pos, dec!(100), dec!(2)), TickDecision::Hold);

        pos.side = Side::Sell;
        assert_eq!(evaluate_tick(&pos, dec!(100), dec!(2)), TickDecision::Hold);
    }

    #[test]
    fn test_waiting_starts_window_inside_band() {
        let pos = buy_position();
        // 1.5% above the target: inside the 2% band, not yet crossed
        assert_eq!(
            evaluate_tick(&pos, dec!(101.5), dec!(2)),
            TickDecision::StartEntryWindow
        );
        // 3% above: outside the band
        assert_eq!(evaluate_tick(&pos, dec!(103), dec!(2)), TickDecision::Hold);
    }

    #[test]
    fn test_open_take_profit_order_and_finality() {
        let mut pos = buy_position();
        pos.status = PositionStatus::Open;

        assert_eq!(
            evaluate_tick(&pos, dec!(125), dec!(2)),
            TickDecision::TakeProfit {
                index: 0,
                is_final: false
            }
        );

        pos.take_profits[0].executed = true;
        assert_eq!(evaluate_tick(&pos, dec!(125), dec!(2)), TickDecision::Hold);
        assert_eq!(
            evaluate_tick(&pos, dec!(140), dec!(2)),
            TickDecision::TakeProfit {
                index: 1,
                is_final: true
            }
        );
    }

    #[test]
    fn test_stop_loss_beats_take_profit_on_wide_tick() {
        // A misconfigured (or gapped) position where one price satisfies
        // both conditions: stop above the first take-profit.
        let mut pos = buy_position();
        pos.status = PositionStatus::Open;
        pos.stop_loss = Some(dec!(130));
        pos.take_profits[0].price = dec!(120);

        // 125 breaches the 130 stop (buy: price <= stop) and reaches the
        // 120 take-profit (price >= tp). The stop must win.
        assert_eq!(evaluate_tick(&pos, dec!(125), dec!(2)), TickDecision::StopLoss);
    }

    #[test]
    fn test_entry_settlement_by_side() {
        let buy = buy_position();
        let s = entry_settlement(&buy);
        assert_eq!(s.delta, dec!(-500));
        assert_eq!(s.realized_pnl, dec!(0));

        let mut sell = buy_position();
        sell.side = Side::Sell;
        assert_eq!(entry_settlement(&sell).delta, dec!(500));
    }

    #[test]
    fn test_tp_settlement_reduces_by_slice() {
        let mut pos = buy_position();
        pos.status = PositionStatus::Open;

        // 50% of 500 at +25%: slice 250, pnl 62.5, principal + pnl returned
        let s = tp_settlement(&pos, 0, dec!(125));
        assert_eq!(s.notional, dec!(250));
        assert_eq!(s.realized_pnl, dec!(62.5));
        assert_eq!(s.delta, dec!(312.5));
    }

    #[test]
    fn test_terminal_settlement_sell_side() {
        let mut pos = buy_position();
        pos.side = Side::Sell;
        pos.status = PositionStatus::Closing;

        // Short 500 at 100, closed at 90: pnl +50, buyback costs 450
        let s = terminal_settlement(&pos, dec!(90));
        assert_eq!(s.realized_pnl, dec!(50));
        assert_eq!(s.delta, dec!(-450));
    }

    #[test]
    fn test_settlements_conserve_value() {
        // Entry + partial + terminal must net to the realized pnl.
        let mut pos = buy_position();
        pos.status = PositionStatus::Open;

        let entry = entry_settlement(&pos);

        let tp = tp_settlement(&pos, 0, dec!(120));
        pos.take_profits[0].executed = true;
        pos.remaining_amount -= tp.notional;
        pos.pnl += tp.realized_pnl;

        let terminal = terminal_settlement(&pos, dec!(140));
        let total_realized = tp.realized_pnl + terminal.realized_pnl;

        assert_eq!(entry.delta + tp.delta + terminal.delta, total_realized);
    }

    #[test]
    fn test_revert_covers_only_outstanding_notional() {
        let mut pos = buy_position();
        pos.status = PositionStatus::Open;
        pos.entry_settled = true;

        let tp = tp_settlement(&pos, 0, dec!(120));
        pos.take_profits[0].executed = true;
        pos.remaining_amount -= tp.notional;

        let revert = revert_settlement(&pos);
        assert_eq!(revert.delta, dec!(250));
    }
}
