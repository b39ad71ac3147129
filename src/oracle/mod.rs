//! Market-agnostic price oracle contracts.
//!
//! The tracker never subscribes to price feeds; it polls an oracle selected
//! per market (CEX spot, CEX futures, DEX) once at position admission and
//! cached for the position's lifetime. Connector internals live behind this
//! trait; the core only needs the contract.

mod mock;

pub use mock::{MockPriceOracle, MockTick};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::position::Market;

/// Errors an oracle query can produce.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    /// Transient: the query failed or returned a non-positive price.
    /// Skip the tick and retry on the next one.
    #[error("price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },
    /// Permanent: delisted symbol, revoked credentials. Counts against the
    /// position's retry budget.
    #[error("unrecoverable oracle error for {symbol}: {reason}")]
    Unrecoverable { symbol: String, reason: String },
}

impl OracleError {
    /// Transient errors are skipped; unrecoverable ones consume the
    /// position's retry budget.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OracleError::PriceUnavailable { .. })
    }
}

/// Contract for the external price source backing one market.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Market this oracle serves.
    fn market(&self) -> Market;

    /// Latest tradable price for `symbol`, on behalf of `user_id`.
    async fn get_price(&self, symbol: &str, user_id: &str) -> Result<Decimal, OracleError>;
}

/// Picks the oracle backend for a market, once per position at admission.
pub struct OracleSelector {
    backends: HashMap<Market, Arc<dyn PriceOracle>>,
}

impl OracleSelector {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register an oracle under the market it reports.
    pub fn register(&mut self, oracle: Arc<dyn PriceOracle>) {
        self.backends.insert(oracle.market(), oracle);
    }

    /// Resolve the backend for `market`.
    pub fn select(&self, market: Market) -> Option<Arc<dyn PriceOracle>> {
        self.backends.get(&market).cloned()
    }
}

impl Default for OracleSelector {
    fn default() -> Self {
        Self::new()
    }
}

/// Query `oracle` and validate the result. Non-positive prices are reported
/// as `PriceUnavailable`.
pub async fn fetch_price(
    oracle: &dyn PriceOracle,
    symbol: &str,
    user_id: &str,
) -> Result<Decimal, OracleError> {
    let price = oracle.get_price(symbol, user_id).await?;
    if price <= Decimal::ZERO {
        return Err(OracleError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: format!("non-positive price {}", price),
        });
    }
    Ok(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_selector_resolves_registered_market() {
        let mut selector = OracleSelector::new();
        let oracle = Arc::new(MockPriceOracle::new(Market::Futures));
        oracle.set_price("BTCUSDT", dec!(50000)).await;
        selector.register(oracle);

        assert!(selector.select(Market::Futures).is_some());
        assert!(selector.select(Market::Dex).is_none());
    }

    #[tokio::test]
    async fn test_fetch_price_rejects_non_positive() {
        let oracle = MockPriceOracle::new(Market::Spot);
        oracle.set_price("BTCUSDT", dec!(0)).await;

        let err = fetch_price(&oracle, "BTCUSDT", "user-1").await.unwrap_err();
        assert!(matches!(err, OracleError::PriceUnavailable { .. }));
        assert!(err.is_recoverable());
    }
}
