//! Per-user virtual balance ledger.
//!
//! The single point of truth for demo-mode accounting. Balances are keyed by
//! (user, market, asset) and mutated only through `adjust`; concurrent
//! position tasks serialize on a per-key mutex, never on a ledger-wide lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::position::Market;

/// Identity of one virtual balance bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceKey {
    pub user_id: String,
    pub market: Market,
    pub asset: String,
}

impl BalanceKey {
    pub fn new(user_id: &str, market: Market, asset: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            market,
            asset: asset.to_string(),
        }
    }
}

impl std::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.market, self.asset)
    }
}

/// One balance bucket with its last-write timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualBalance {
    pub amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Ledger failures.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The write did not commit; the caller must retry with the same delta
    /// before considering its transition complete.
    #[error("ledger write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },
}

/// Contract for the virtual balance store.
///
/// A single `adjust` call is atomic; exactly-once semantics per economic
/// event are the caller's responsibility.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Apply `delta` to the bucket. `relative` applies a signed delta;
    /// otherwise the amount is set absolutely.
    async fn adjust(
        &self,
        user_id: &str,
        market: Market,
        asset: &str,
        delta: Decimal,
        relative: bool,
    ) -> Result<(), LedgerError>;

    /// Current amount in the bucket (zero when never touched).
    async fn balance(&self, user_id: &str, market: Market, asset: &str) -> Decimal;
}

/// In-memory ledger with per-key serialization.
pub struct InMemoryLedger {
    entries: RwLock<HashMap<BalanceKey, Arc<Mutex<VirtualBalance>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch or create the per-key cell. The map lock is held only long
    /// enough to clone the Arc; mutation happens under the key's own mutex.
    async fn cell(&self, key: BalanceKey) -> Arc<Mutex<VirtualBalance>> {
        if let Some(cell) = self.entries.read().await.get(&key) {
            return cell.clone();
        }

        let mut entries = self.entries.write().await;
        entries
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(VirtualBalance {
                    amount: Decimal::ZERO,
                    updated_at: Utc::now(),
                }))
            })
            .clone()
    }

    /// Seed a bucket with an absolute starting amount.
    pub async fn seed(&self, user_id: &str, market: Market, asset: &str, amount: Decimal) {
        let cell = self.cell(BalanceKey::new(user_id, market, asset)).await;
        let mut balance = cell.lock().await;
        balance.amount = amount;
        balance.updated_at = Utc::now();
    }

    /// Snapshot of every bucket, for persistence and status reporting.
    pub async fn snapshot(&self) -> HashMap<BalanceKey, VirtualBalance> {
        let entries = self.entries.read().await;
        let mut out = HashMap::with_capacity(entries.len());
        for (key, cell) in entries.iter() {
            out.insert(key.clone(), cell.lock().await.clone());
        }
        out
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceLedger for InMemoryLedger {
    async fn adjust(
        &self,
        user_id: &str,
        market: Market,
        asset: &str,
        delta: Decimal,
        relative: bool,
    ) -> Result<(), LedgerError> {
        let key = BalanceKey::new(user_id, market, asset);
        let cell = self.cell(key.clone()).await;

        let mut balance = cell.lock().await;
        if relative {
            balance.amount += delta;
        } else {
            balance.amount = delta;
        }
        balance.updated_at = Utc::now();

        debug!(
            key = %key,
            %delta,
            relative,
            amount = %balance.amount,
            "Ledger adjusted"
        );
        Ok(())
    }

    async fn balance(&self, user_id: &str, market: Market, asset: &str) -> Decimal {
        let key = BalanceKey::new(user_id, market, asset);
        match self.entries.read().await.get(&key) {
            Some(cell) => cell.lock().await.amount,
            None => Decimal::ZERO,
        }
    }
}
