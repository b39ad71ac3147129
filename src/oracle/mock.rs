//! Scripted price oracle for paper trading and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use super::{OracleError, PriceOracle};
use crate::position::Market;

/// One scripted oracle response.
#[derive(Debug, Clone)]
pub enum MockTick {
    Price(Decimal),
    /// Transient failure for this query.
    Unavailable,
    /// Permanent failure for this query.
    Fatal,
}

/// Oracle that replays scripted price sequences per symbol.
///
/// Each `get_price` call consumes the next scripted tick for the symbol;
/// when a script runs dry the last observed price is repeated, so tests can
/// script only the interesting part of a sequence.
pub struct MockPriceOracle {
    market: Market,
    scripts: Mutex<HashMap<String, VecDeque<MockTick>>>,
    last_price: Mutex<HashMap<String, Decimal>>,
    call_count: AtomicU64,
}

impl MockPriceOracle {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            scripts: Mutex::new(HashMap::new()),
            last_price: Mutex::new(HashMap::new()),
            call_count: AtomicU64::new(0),
        }
    }

    /// Set a static price for `symbol` (used when no script is queued).
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.last_price
            .lock()
            .await
            .insert(symbol.to_string(), price);
    }

    /// Append scripted ticks for `symbol`, consumed in order.
    pub async fn push_script<I>(&self, symbol: &str, ticks: I)
    where
        I: IntoIterator<Item = MockTick>,
    {
        self.scripts
            .lock()
            .await
            .entry(symbol.to_string())
            .or_default()
            .extend(ticks);
    }

    /// Append scripted prices for `symbol`.
    pub async fn push_prices<I>(&self, symbol: &str, prices: I)
    where
        I: IntoIterator<Item = Decimal>,
    {
        self.push_script(symbol, prices.into_iter().map(MockTick::Price))
            .await;
    }

    /// Total queries served, across all symbols.
    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for MockPriceOracle {
    fn market(&self) -> Market {
        self.market
    }

    async fn get_price(&self, symbol: &str, _user_id: &str) -> Result<Decimal, OracleError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        let next = {
            let mut scripts = self.scripts.lock().await;
            scripts.get_mut(symbol).and_then(|q| q.pop_front())
        };

        match next {
            Some(MockTick::Price(price)) => {
                self.last_price
                    .lock()
                    .await
                    .insert(symbol.to_string(), price);
                debug!(%symbol, %price, "Mock oracle tick");
                Ok(price)
            }
            Some(MockTick::Unavailable) => Err(OracleError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: "scripted outage".to_string(),
            }),
            Some(MockTick::Fatal) => Err(OracleError::Unrecoverable {
                symbol: symbol.to_string(),
                reason: "scripted permanent failure".to_string(),
            }),
            None => self
                .last_price
                .lock()
                .await
                .get(symbol)
                .copied()
                .ok_or_else(|| OracleError::PriceUnavailable {
                    symbol: symbol.to_string(),
                    reason: "no price scripted".to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_script_consumed_in_order_then_repeats_last() {
        let oracle = MockPriceOracle::new(Market::Spot);
        oracle
            .push_prices("ETHUSDT", [dec!(3000), dec!(3010)])
            .await;

        assert_eq!(oracle.get_price("ETHUSDT", "u").await.unwrap(), dec!(3000));
        assert_eq!(oracle.get_price("ETHUSDT", "u").await.unwrap(), dec!(3010));
        // Script dry: last price repeats
        assert_eq!(oracle.get_price("ETHUSDT", "u").await.unwrap(), dec!(3010));
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let oracle = MockPriceOracle::new(Market::Spot);
        oracle
            .push_script("ETHUSDT", [MockTick::Unavailable, MockTick::Fatal])
            .await;

        assert!(oracle
            .get_price("ETHUSDT", "u")
            .await
            .unwrap_err()
            .is_recoverable());
        assert!(!oracle
            .get_price("ETHUSDT", "u")
            .await
            .unwrap_err()
            .is_recoverable());
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_unavailable() {
        let oracle = MockPriceOracle::new(Market::Dex);
        assert!(matches!(
            oracle.get_price("SOLUSDC", "u").await,
            Err(OracleError::PriceUnavailable { .. })
        ));
    }
}
