//! Position entity and lifecycle state.
//!
//! A position is one tracked simulated trade: an entry target, an optional
//! stop-loss, and an ordered list of take-profit targets. Positions are
//! created by the signal-activation path after the risk gate approves, are
//! mutated only by the monitoring loops, and become immutable once they reach
//! a terminal state.

mod machine;

pub use machine::{
    entry_settlement, evaluate_tick, revert_settlement, terminal_settlement, tp_settlement,
    Settlement, TickDecision,
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Market a position trades on. Selects the price oracle variant at
/// admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Futures,
    Dex,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Market::Spot => write!(f, "spot"),
            Market::Futures => write!(f, "futures"),
            Market::Dex => write!(f, "dex"),
        }
    }
}

impl Market {
    /// Parse from the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spot" => Some(Market::Spot),
            "futures" => Some(Market::Futures),
            "dex" => Some(Market::Dex),
            _ => None,
        }
    }
}

/// Direction of the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Lifecycle state of a position.
///
/// `Pending` and `Monitoring` are equivalent waiting states; `Monitoring`
/// means an explicit entry target exists. Transitions are monotonic:
/// waiting → Open → Closing → Closed, with Failed reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Monitoring,
    Open,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Monitoring => "monitoring",
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
            PositionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl PositionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PositionStatus::Pending),
            "monitoring" => Some(PositionStatus::Monitoring),
            "open" => Some(PositionStatus::Open),
            "closing" => Some(PositionStatus::Closing),
            "closed" => Some(PositionStatus::Closed),
            "failed" => Some(PositionStatus::Failed),
        _ => None,
        }
    }

    /// Waiting for the entry condition.
    pub fn is_waiting(&self) -> bool {
        matches!(self, PositionStatus::Pending | PositionStatus::Monitoring)
    }

    /// Still tracked by the base monitoring loop.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            PositionStatus::Pending | PositionStatus::Monitoring | PositionStatus::Open
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Failed)
    }

    /// Whether `next` is a legal forward edge from this state.
    pub fn can_advance_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match (self, next) {
            (Pending | Monitoring, Open) => true,
            (Open, Closing) => true,
            (Closing, Closed) => true,
            (Pending | Monitoring | Open | Closing, Failed) => true,
            _ => false,
        }
    }
}

/// Why a position reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Cancelled,
    OracleFailure,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Cancelled => "cancelled",
            CloseReason::OracleFailure => "oracle_failure",
        };
        write!(f, "{}", s)
    }
}

impl CloseReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop_loss" => Some(CloseReason::StopLoss),
            "take_profit" => Some(CloseReason::TakeProfit),
            "cancelled" => Some(CloseReason::Cancelled),
            "oracle_failure" => Some(CloseReason::OracleFailure),
            _ => None,
        }
    }
}

/// One take-profit target. Insertion order is execution priority.
/// Once `executed` is set the entry is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfit {
    pub price: Decimal,
    /// Share of the live position to close at this target, in percent (0-100].
    pub percent: Decimal,
    #[serde(default)]
    pub executed: bool,
}

impl TakeProfit {
    pub fn new(price: Decimal, percent: Decimal) -> Self {
        Self {
            price,
            percent,
            executed: false,
        }
    }
}

/// Parameters for admitting a new position.
#[derive(Debug, Clone)]
pub struct PositionSpec {
    pub user_id: String,
    pub symbol: String,
    pub market: Market,
    pub side: Side,
    pub entry_price: Decimal,
    pub amount: Decimal,
    pub quote_asset: String,
    pub stop_loss: Option<Decimal>,
    pub take_profits: Vec<TakeProfit>,
    pub leverage: u32,
}

/// One tracked simulated trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: String,
    pub symbol: String,
    pub market: Market,
    pub side: Side,

    pub entry_price: Decimal,
    /// Last observed price. Advisory only; transitions are decided by the
    /// explicit comparison rules in the state machine.
    pub current_price: Decimal,

    /// Notional committed at entry. Immutable once the position leaves the
    /// waiting states.
    pub amount: Decimal,
    /// Live notional still open. Reduced by partial take-profit settlements.
    pub remaining_amount: Decimal,
    /// Asset debited/credited on the virtual ledger for this position.
    pub quote_asset: String,

    pub stop_loss: Option<Decimal>,
    pub take_profits: Vec<TakeProfit>,
    pub leverage: u32,

    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<Decimal>,
    /// Realized PnL. Accumulates partial take-profit slices while open,
    /// final on terminal states.
    pub pnl: Decimal,

    /// Whether the entry ledger movement has been applied. Guards the
    /// exactly-once entry commitment and failure reverts.
    pub entry_settled: bool,
    /// Consecutive unrecoverable oracle failures for this position.
    pub oracle_failures: u32,

    pub created_at: DateTime<Utc>,
    pub last_monitored_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Create a new waiting position from an admitted spec.
    pub fn new(spec: PositionSpec) -> Self {
        let status = if spec.entry_price > Decimal::ZERO {
            PositionStatus::Monitoring
        } else {
            PositionStatus::Pending
        };

        Self {
            id: Uuid::new_v4(),
            user_id: spec.user_id,
            symbol: spec.symbol,
            market: spec.market,
            side: spec.side,
            entry_price: spec.entry_price,
            current_price: spec.entry_price,
            amount: spec.amount,
            remaining_amount: spec.amount,
            quote_asset: spec.quote_asset,
            stop_loss: spec.stop_loss,
            take_profits: spec.take_profits,
            leverage: spec.leverage.max(1),
            status,
            close_reason: None,
            exit_price: None,
            pnl: Decimal::ZERO,
            entry_settled: false,
            oracle_failures: 0,
            created_at: Utc::now(),
            last_monitored_at: None,
            executed_at: None,
            closed_at: None,
        }
    }

    /// Whether `price` satisfies the entry condition.
    pub fn entry_crossed(&self, price: Decimal) -> bool {
        match self.side {
            Side::Buy => price <= self.entry_price,
            Side::Sell => price >= self.entry_price,
        }
    }

    /// Whether `price` breaches the stop-loss, if one is set.
    pub fn stop_breached(&self, price: Decimal) -> bool {
        match (self.stop_loss, self.side) {
            (Some(stop), Side::Buy) => price <= stop,
            (Some(stop), Side::Sell) => price >= stop,
            (None, _) => false,
        }
    }

    /// Next un-executed take-profit in priority order.
    pub fn next_take_profit(&self) -> Option<(usize, &TakeProfit)> {
        self.take_profits
            .iter()
            .enumerate()
            .find(|(_, tp)| !tp.executed)
    }

    /// Whether `price` reaches the given take-profit target.
    pub fn take_profit_reached(&self, tp: &TakeProfit, price: Decimal) -> bool {
        match self.side {
            Side::Buy => price >= tp.price,
            Side::Sell => price <= tp.price,
        }
    }

    /// Relative distance of `price` from the entry target.
    pub fn entry_distance_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((price - self.entry_price) / self.entry_price * Decimal::new(100, 0)).abs()
    }

    /// Signed PnL of closing `notional` at `exit` against the entry price.
    pub fn signed_pnl(&self, exit: Decimal, notional: Decimal) -> Decimal {
        if self.entry_price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let raw = (exit - self.entry_price) / self.entry_price * notional;
        match self.side {
            Side::Buy => raw,
            Side::Sell => -raw,
        }
    }

    /// Unrealized PnL of the live notional at the last observed price.
    pub fn unrealized_pnl(&self) -> Decimal {
        if self.status != PositionStatus::Open && self.status != PositionStatus::Closing {
            return Decimal::ZERO;
        }
        self.signed_pnl(self.current_price, self.remaining_amount)
    }

    /// Ledger delta applied when the entry executes: buys debit the quote
    /// asset, sells credit it.
    pub fn entry_delta(&self) -> Decimal {
        match self.side {
            Side::Buy => -self.amount,
            Side::Sell => self.amount,
        }
    }

    /// Whether the maximization window for this position favors a falling
    /// price. Acquiring (buy entry, sell exit-by-buyback) wants low;
    /// disposing (sell entry, buy exit) wants high.
    pub fn window_favors_lower(&self) -> bool {
        match (self.status.is_waiting(), self.side) {
            (true, Side::Buy) => true,   // entering a buy: acquire low
            (true, Side::Sell) => false, // entering a sell: dispose high
            (false, Side::Buy) => false, // exiting a buy: dispose high
            (false, Side::Sell) => true, // exiting a sell: buy back low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec(side: Side) -> PositionSpec {
        PositionSpec {
            user_id: "user-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            market: Market::Futures,
            side,
            entry_price: dec!(100),
            amount: dec!(500),
            quote_asset: "USDT".to_string(),
            stop_loss: Some(dec!(90)),
            take_profits: vec![
                TakeProfit::new(dec!(120), dec!(50)),
                TakeProfit::new(dec!(140), dec!(50)),
            ],
            leverage: 1,
        }
    }

    #[test]
    fn test_entry_condition_by_side() {
        let buy = Position::new(spec(Side::Buy));
        assert!(buy.entry_crossed(dec!(100)));
        assert!(buy.entry_crossed(dec!(99)));
        assert!(!buy.entry_crossed(dec!(101)));

        let sell = Position::new(spec(Side::Sell));
        assert!(sell.entry_crossed(dec!(100)));
        assert!(sell.entry_crossed(dec!(101)));
        assert!(!sell.entry_crossed(dec!(99)));
    }

    #[test]
    fn test_stop_breach_by_side() {
        let buy = Position::new(spec(Side::Buy));
        assert!(buy.stop_breached(dec!(90)));
        assert!(!buy.stop_breached(dec!(91)));

        let mut sell = Position::new(spec(Side::Sell));
        sell.stop_loss = Some(dec!(110));
        assert!(sell.stop_breached(dec!(110)));
        assert!(!sell.stop_breached(dec!(109)));
    }

    #[test]
    fn test_signed_pnl() {
        let buy = Position::new(spec(Side::Buy));
        // +10% on 500 notional
        assert_eq!(buy.signed_pnl(dec!(110), dec!(500)), dec!(50));
        assert_eq!(buy.signed_pnl(dec!(90), dec!(500)), dec!(-50));

        let sell = Position::new(spec(Side::Sell));
        assert_eq!(sell.signed_pnl(dec!(90), dec!(500)), dec!(50));
        assert_eq!(sell.signed_pnl(dec!(110), dec!(500)), dec!(-50));
    }

    #[test]
    fn test_status_edges_are_monotonic() {
        use PositionStatus::*;

        assert!(Pending.can_advance_to(Open));
        assert!(Monitoring.can_advance_to(Open));
        assert!(Open.can_advance_to(Closing));
        assert!(Closing.can_advance_to(Closed));
        assert!(Open.can_advance_to(Failed));
        assert!(Closing.can_advance_to(Failed));

        // No regressions
        assert!(!Closed.can_advance_to(Open));
        assert!(!Open.can_advance_to(Monitoring));
        assert!(!Closing.can_advance_to(Open));
        assert!(!Failed.can_advance_to(Pending));
        assert!(!Closed.can_advance_to(Failed));
    }

    #[test]
    fn test_next_take_profit_respects_order() {
        let mut pos = Position::new(spec(Side::Buy));
        assert_eq!(pos.next_take_profit().map(|(i, _)| i), Some(0));

        pos.take_profits[0].executed = true;
        assert_eq!(pos.next_take_profit().map(|(i, _)| i), Some(1));

        pos.take_profits[1].executed = true;
        assert!(pos.next_take_profit().is_none());
    }

    #[test]
    fn test_entry_delta_by_side() {
        let buy = Position::new(spec(Side::Buy));
        assert_eq!(buy.entry_delta(), dec!(-500));

        let sell = Position::new(spec(Side::Sell));
        assert_eq!(sell.entry_delta(), dec!(500));
    }

    #[test]
    fn test_window_direction() {
        let waiting_buy = Position::new(spec(Side::Buy));
        assert!(waiting_buy.window_favors_lower());

        let mut closing_buy = Position::new(spec(Side::Buy));
        closing_buy.status = PositionStatus::Open;
        assert!(!closing_buy.window_favors_lower());

        let waiting_sell = Position::new(spec(Side::Sell));
        assert!(!waiting_sell.window_favors_lower());
    }
}
