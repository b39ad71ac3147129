//! Position lifecycle monitoring loops.
//!
//! One base loop re-evaluates every live position at a fixed cadence. When a
//! position nears an entry target or starts closing, it is handed to a
//! short-lived high-frequency maximization window; the base loop skips
//! positions owned by a window. Ledger movements commit before any state
//! mutation, so a failed write leaves the position in its pre-transition
//! state to be retried on a later tick.

mod maximizer;

pub use maximizer::{MaximizationPolicy, WindowKind, WindowStep};

use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, LedgerConfig, OracleConfig, TrackerConfig};
use crate::ledger::{BalanceLedger, LedgerError};
use crate::notifier::Notifier;
use crate::oracle::{fetch_price, OracleSelector, PriceOracle};
use crate::persistence::PositionStore;
use crate::position::{
    entry_settlement, evaluate_tick, revert_settlement, terminal_settlement, tp_settlement,
    CloseReason, Market, Position, PositionSpec, PositionStatus, Settlement, TickDecision,
};
use crate::risk::{RiskDecision, RiskGate};

/// Why a new position was not admitted.
#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("risk gate rejected: {0}")]
    RiskRejected(String),
    #[error("no oracle registered for market {0}")]
    UnsupportedMarket(Market),
}

/// One registered position with its cached oracle and cancellation token.
struct Tracked {
    position: Position,
    oracle: Arc<dyn PriceOracle>,
    cancel: CancellationToken,
    /// Monotonic instant of the last base-loop check, for cadence fairness.
    /// The position's own `last_monitored_at` is the audit timestamp.
    last_checked: Option<tokio::time::Instant>,
}

/// Follow-up work decided under the position lock, executed after it drops.
enum FollowUp {
    None,
    EntryWindow,
    ExitWindow,
}

/// Counters for loop health monitoring.
#[derive(Debug, Default)]
pub struct TrackerMetrics {
    pub ticks: AtomicU64,
    pub transitions: AtomicU64,
    pub oracle_errors: AtomicU64,
    pub windows_run: AtomicU64,
}

impl TrackerMetrics {
    /// Log a periodic health summary.
    pub fn log_summary(&self, live_positions: usize) {
        info!(
            ticks = self.ticks.load(Ordering::Relaxed),
            transitions = self.transitions.load(Ordering::Relaxed),
            oracle_errors = self.oracle_errors.load(Ordering::Relaxed),
            windows_run = self.windows_run.load(Ordering::Relaxed),
            live_positions,
            "Tracker summary"
        );
    }
}

/// Owns the canonical set of tracked positions and drives their lifecycle.
pub struct PositionMonitor {
    tracker_config: TrackerConfig,
    oracle_config: OracleConfig,
    ledger_config: LedgerConfig,
    gate: RiskGate,
    ledger: Arc<dyn BalanceLedger>,
    notifier: Arc<dyn Notifier>,
    selector: OracleSelector,
    store: Option<Arc<Mutex<PositionStore>>>,
    registry: RwLock<HashMap<Uuid, Arc<Mutex<Tracked>>>>,
    /// Positions currently owned by a maximization window; the base loop
    /// must not touch them.
    maximizing: Mutex<HashSet<Uuid>>,
    window_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    pub metrics: TrackerMetrics,
}

impl PositionMonitor {
    pub fn new(
        config: &Config,
        ledger: Arc<dyn BalanceLedger>,
        notifier: Arc<dyn Notifier>,
        selector: OracleSelector,
        store: Option<Arc<Mutex<PositionStore>>>,
    ) -> Self {
        Self {
            tracker_config: config.tracker.clone(),
            oracle_config: config.oracle.clone(),
            ledger_config: config.ledger.clone(),
            gate: RiskGate::new(config.risk.clone()),
            ledger,
            notifier,
            selector,
            store,
            registry: RwLock::new(HashMap::new()),
            maximizing: Mutex::new(HashSet::new()),
            window_tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            metrics: TrackerMetrics::default(),
        }
    }

    /// Admit a new position after the risk gate approves.
    ///
    /// The oracle backend for the position's market is selected here, once,
    /// and cached for the position's lifetime.
    pub async fn admit(&self, spec: PositionSpec) -> Result<Uuid, AdmitError> {
        let oracle = self
            .selector
            .select(spec.market)
            .ok_or(AdmitError::UnsupportedMarket(spec.market))?;

        let equity = self
            .ledger
            .balance(&spec.user_id, spec.market, &spec.quote_asset)
            .await;
        let active = self.active_positions(&spec.user_id).await;

        if let RiskDecision::Rejected { reason } = self.gate.can_open(equity, &active) {
            info!(user = %spec.user_id, symbol = %spec.symbol, %reason, "Position rejected");
            self.notifier
                .publish(
                    &spec.user_id,
                    "position_rejected",
                    json!({ "symbol": spec.symbol, "reason": reason }),
                )
                .await;
            return Err(AdmitError::RiskRejected(reason));
        }

        let position = Position::new(spec);
        let id = position.id;

        info!(
            %id,
            user = %position.user_id,
            symbol = %position.symbol,
            side = %position.side,
            entry = %position.entry_price,
            amount = %position.amount,
            "Position admitted"
        );

        self.persist(&position).await;
        self.notifier
            .publish(
                &position.user_id,
                "position_admitted",
                json!({
                    "position_id": id,
                    "symbol": position.symbol,
                    "status": position.status,
                }),
            )
            .await;

        self.registry.write().await.insert(
            id,
            Arc::new(Mutex::new(Tracked {
                position,
                oracle,
                cancel: CancellationToken::new(),
                last_checked: None,
            })),
        );
        Ok(id)
    }

    /// Re-register a persisted non-terminal position after a restart.
    pub async fn resume(&self, position: Position) -> bool {
        if position.status.is_terminal() {
            return false;
        }
        let Some(oracle) = self.selector.select(position.market) else {
            warn!(id = %position.id, market = %position.market, "No oracle for resumed position");
            return false;
        };

        info!(id = %position.id, symbol = %position.symbol, status = %position.status, "Position resumed");
        self.registry.write().await.insert(
            position.id,
            Arc::new(Mutex::new(Tracked {
                position,
                oracle,
                cancel: CancellationToken::new(),
                last_checked: None,
            })),
        );
        true
    }

    /// Clone of a tracked position, for inspection.
    pub async fn position(&self, id: Uuid) -> Option<Position> {
        let entry = self.registry.read().await.get(&id).cloned()?;
        let tracked = entry.lock().await;
        Some(tracked.position.clone())
    }

    /// Consistent snapshot of a user's non-terminal positions.
    pub async fn active_positions(&self, user_id: &str) -> Vec<Position> {
        let registry = self.registry.read().await;
        let mut positions = Vec::new();
        for entry in registry.values() {
            let tracked = entry.lock().await;
            if tracked.position.user_id == user_id && !tracked.position.status.is_terminal() {
                positions.push(tracked.position.clone());
            }
        }
        positions
    }

    /// Cancel a position. Window-owned positions are failed by their window
    /// at the next iteration boundary; idle ones are failed immediately.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let Some(entry) = self.registry.read().await.get(&id).cloned() else {
            return false;
        };

        let window_owned = {
            let tracked = entry.lock().await;
            tracked.cancel.cancel();
            drop(tracked);
            self.maximizing.lock().await.contains(&id)
        };

        if !window_owned {
            let mut tracked = entry.lock().await;
            if !tracked.position.status.is_terminal() {
                self.apply_failure(&mut tracked.position, CloseReason::Cancelled)
                    .await;
            }
        }
        true
    }

    /// Request a graceful stop of the base loop and all windows.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run the base monitoring loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.tracker_config.base_interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_s = self.tracker_config.base_interval_seconds,
            "Base monitoring loop started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_once().await;
                }
            }
        }

        self.drain_windows().await;
        info!("Base monitoring loop stopped");
    }

    /// One pass over every position not owned by a window. Positions are
    /// processed as independent futures; one failure never aborts the batch.
    pub async fn tick_once(self: &Arc<Self>) {
        let tick = self.metrics.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let entries: Vec<(Uuid, Arc<Mutex<Tracked>>)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(id, entry)| (*id, entry.clone()))
                .collect()
        };
        let owned: HashSet<Uuid> = self.maximizing.lock().await.clone();

        let mut tasks = Vec::new();
        for (id, entry) in entries {
            if owned.contains(&id) {
                continue;
            }
            let monitor = self.clone();
            tasks.push(async move { monitor.tick_position(id, entry).await });
        }
        let batch = tasks.len();
        join_all(tasks).await;

        debug!(tick, batch, "Tick complete");
        if tick % 10 == 0 {
            self.metrics.log_summary(batch);
        }
    }

    /// Await all outstanding maximization windows.
    pub async fn drain_windows(&self) {
        let handles: Vec<JoinHandle<()>> = self.window_tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Window task panicked");
            }
        }
    }

    /// Evaluate one position against one freshly observed price.
    async fn tick_position(self: Arc<Self>, id: Uuid, entry: Arc<Mutex<Tracked>>) {
        let follow_up = {
            let mut tracked = entry.lock().await;
            let Tracked {
                position,
                oracle,
                cancel,
                last_checked,
            } = &mut *tracked;

            if position.status.is_terminal() {
                return;
            }

            if cancel.is_cancelled() {
                self.apply_failure(position, CloseReason::Cancelled).await;
                return;
            }

            // A closing position without a window (ledger failure on the
            // final fill, or resumed from the store) gets a fresh one.
            if position.status == PositionStatus::Closing {
                FollowUp::ExitWindow
            } else {
                // Fairness: never re-check a position twice within cadence.
                if let Some(last) = last_checked {
                    if last.elapsed()
                        < Duration::from_secs(self.tracker_config.base_interval_seconds)
                    {
                        return;
                    }
                }

                let price = match fetch_price(oracle.as_ref(), &position.symbol, &position.user_id)
                    .await
                {
                    Ok(price) => {
                        position.oracle_failures = 0;
                        *last_checked = Some(tokio::time::Instant::now());
                        price
                    }
                    Err(e) if e.is_recoverable() => {
                        self.metrics.oracle_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(%id, error = %e, "Price unavailable, skipping tick");
                        return;
                    }
                    Err(e) => {
                        self.metrics.oracle_errors.fetch_add(1, Ordering::Relaxed);
                        position.oracle_failures += 1;
                        warn!(
                            %id,
                            failures = position.oracle_failures,
                            budget = self.oracle_config.retry_budget,
                            error = %e,
                            "Unrecoverable oracle error"
                        );
                        if position.oracle_failures >= self.oracle_config.retry_budget {
                            self.apply_failure(position, CloseReason::OracleFailure).await;
                        }
                        return;
                    }
                };

                position.current_price = price;
                position.last_monitored_at = Some(Utc::now());

                self.apply_decision(position, price).await
            }
        };

        match follow_up {
            FollowUp::None => {}
            FollowUp::EntryWindow => self.spawn_window(id, entry, WindowKind::Entry).await,
            FollowUp::ExitWindow => self.spawn_window(id, entry, WindowKind::Exit).await,
        }
    }

    /// Apply the state machine's decision for this tick. Returns the window
    /// to spawn once the position lock is released.
    async fn apply_decision(&self, position: &mut Position, price: Decimal) -> FollowUp {
        match evaluate_tick(position, price, self.tracker_config.proximity_band_pct) {
            TickDecision::Hold => {
                self.persist(position).await;
                self.publish_update(position).await;
                FollowUp::None
            }
            TickDecision::Enter => {
                self.execute_entry(position, price).await;
                FollowUp::None
            }
            TickDecision::StartEntryWindow => {
                debug!(
                    id = %position.id,
                    %price,
                    target = %position.entry_price,
                    "Price in proximity band, starting entry window"
                );
                self.persist(position).await;
                FollowUp::EntryWindow
            }
            TickDecision::StopLoss => {
                if !self.set_status(position, PositionStatus::Closing) {
                    return FollowUp::None;
                }
                position.close_reason = Some(CloseReason::StopLoss);
                info!(id = %position.id, %price, "Stop-loss breached, closing");
                self.persist(position).await;
                self.notifier
                    .publish(
                        &position.user_id,
                        "position_closing",
                        json!({
                            "position_id": position.id,
                            "reason": CloseReason::StopLoss,
                            "price": price,
                        }),
                    )
                    .await;
                FollowUp::ExitWindow
            }
            TickDecision::TakeProfit { index, is_final } => {
                if is_final {
                    // The last target closes the remainder; the exit window
                    // settles it at the maximized price.
                    position.take_profits[index].executed = true;
                    if !self.set_status(position, PositionStatus::Closing) {
                        return FollowUp::None;
                    }
                    position.close_reason = Some(CloseReason::TakeProfit);
                    info!(id = %position.id, tp = index, %price, "Final take-profit reached, closing");
                    self.persist(position).await;
                    self.notifier
                        .publish(
                            &position.user_id,
                            "position_closing",
                            json!({
                                "position_id": position.id,
                                "reason": CloseReason::TakeProfit,
                                "price": price,
                            }),
                        )
                        .await;
                    FollowUp::ExitWindow
                } else {
                    self.execute_partial_take_profit(position, index, price).await;
                    FollowUp::None
                }
            }
        }
    }

    /// Commit the entry: ledger movement first, state second.
    async fn execute_entry(&self, position: &mut Position, fill: Decimal) {
        let settlement = entry_settlement(position);
        if let Err(e) = self.ledger_apply(position, &settlement).await {
            warn!(id = %position.id, error = %e, "Entry ledger write failed, staying in waiting state");
            return;
        }

        position.entry_price = fill;
        position.current_price = fill;
        position.entry_settled = true;
        position.executed_at = Some(Utc::now());
        if !self.set_status(position, PositionStatus::Open) {
            return;
        }
        self.metrics.transitions.fetch_add(1, Ordering::Relaxed);

        info!(id = %position.id, %fill, amount = %position.amount, "Position opened");
        self.persist(position).await;
        self.notifier
            .publish(
                &position.user_id,
                "position_opened",
                json!({
                    "position_id": position.id,
                    "symbol": position.symbol,
                    "fill_price": fill,
                    "amount": position.amount,
                }),
            )
            .await;
    }

    /// Settle a non-final take-profit slice at the observed fill price.
    async fn execute_partial_take_profit(
        &self,
        position: &mut Position,
        index: usize,
        fill: Decimal,
    ) {
        let settlement = tp_settlement(position, index, fill);
        if let Err(e) = self.ledger_apply(position, &settlement).await {
            warn!(id = %position.id, tp = index, error = %e, "Take-profit ledger write failed, will retry next tick");
            return;
        }

        position.take_profits[index].executed = true;
        position.remaining_amount -= settlement.notional;
        position.pnl += settlement.realized_pnl;
        self.metrics.transitions.fetch_add(1, Ordering::Relaxed);

        info!(
            id = %position.id,
            tp = index,
            %fill,
            slice = %settlement.notional,
            realized = %settlement.realized_pnl,
            "Take-profit slice executed"
        );
        self.persist(position).await;
        self.notifier
            .publish(
                &position.user_id,
                "take_profit_executed",
                json!({
                    "position_id": position.id,
                    "index": index,
                    "fill_price": fill,
                    "realized_pnl": settlement.realized_pnl,
                }),
            )
            .await;
    }

    /// Close the remaining notional at `fill`.
    async fn execute_close(&self, position: &mut Position, fill: Decimal) {
        let settlement = terminal_settlement(position, fill);
        if let Err(e) = self.ledger_apply(position, &settlement).await {
            warn!(id = %position.id, error = %e, "Close ledger write failed, position stays closing");
            return;
        }

        position.pnl += settlement.realized_pnl;
        position.remaining_amount = Decimal::ZERO;
        position.exit_price = Some(fill);
        position.current_price = fill;
        if position.close_reason.is_none() {
            position.close_reason = Some(CloseReason::TakeProfit);
        }
        position.closed_at = Some(Utc::now());
        if !self.set_status(position, PositionStatus::Closed) {
            return;
        }
        self.metrics.transitions.fetch_add(1, Ordering::Relaxed);

        info!(
            id = %position.id,
            %fill,
            pnl = %position.pnl,
            reason = ?position.close_reason,
            "Position closed"
        );
        self.persist(position).await;
        self.notifier
            .publish(
                &position.user_id,
                "position_closed",
                json!({
                    "position_id": position.id,
                    "exit_price": fill,
                    "pnl": position.pnl,
                    "reason": position.close_reason,
                }),
            )
            .await;
    }

    /// Fail a position, reverting any outstanding entry commitment.
    async fn apply_failure(&self, position: &mut Position, reason: CloseReason) {
        if position.entry_settled && position.remaining_amount > Decimal::ZERO {
            let settlement = revert_settlement(position);
            if let Err(e) = self.ledger_apply(position, &settlement).await {
                warn!(id = %position.id, error = %e, "Entry revert failed, will retry next tick");
                return;
            }
            position.entry_settled = false;
            position.remaining_amount = Decimal::ZERO;
        }

        position.close_reason = Some(reason);
        position.closed_at = Some(Utc::now());
        if !self.set_status(position, PositionStatus::Failed) {
            return;
        }
        self.metrics.transitions.fetch_add(1, Ordering::Relaxed);

        warn!(id = %position.id, %reason, "Position failed");
        self.persist(position).await;
        self.notifier
            .publish(
                &position.user_id,
                "position_failed",
                json!({ "position_id": position.id, "reason": reason }),
            )
            .await;
    }

    /// Spawn a maximization window for the position, unless one is active.
    async fn spawn_window(self: &Arc<Self>, id: Uuid, entry: Arc<Mutex<Tracked>>, kind: WindowKind) {
        {
            let mut maximizing = self.maximizing.lock().await;
            if !maximizing.insert(id) {
                return;
            }
        }
        self.metrics.windows_run.fetch_add(1, Ordering::Relaxed);

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            monitor.run_window(id, entry, kind).await;
        });

        let mut tasks = self.window_tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// High-frequency polling phase for one position.
    ///
    /// Runs for at most `maximization_max_iterations` iterations at the
    /// maximization interval; suspends only between iterations.
    async fn run_window(self: Arc<Self>, id: Uuid, entry: Arc<Mutex<Tracked>>, kind: WindowKind) {
        let interval = Duration::from_secs(self.tracker_config.maximization_interval_seconds);
        let budget = self.tracker_config.maximization_max_iterations;

        let favors_lower = {
            let tracked = entry.lock().await;
            tracked.position.window_favors_lower()
        };
        let mut policy =
            MaximizationPolicy::new(favors_lower, self.tracker_config.rebound_threshold_pct);

        debug!(%id, ?kind, favors_lower, budget, "Maximization window opened");

        let mut last_observed: Option<Decimal> = None;
        let mut entry_crossed = false;
        let mut settled = false;

        'window: for iteration in 0..budget {
            if self.shutdown.is_cancelled() {
                // State is persisted; the position resumes after restart.
                settled = true;
                break 'window;
            }

            {
                let mut tracked = entry.lock().await;
                let Tracked {
                    position,
                    oracle,
                    cancel,
                    last_checked: _,
                } = &mut *tracked;

                if cancel.is_cancelled() {
                    self.apply_failure(position, CloseReason::Cancelled).await;
                    settled = true;
                    break 'window;
                }

                match fetch_price(oracle.as_ref(), &position.symbol, &position.user_id).await {
                    Ok(price) => {
                        position.oracle_failures = 0;
                        position.current_price = price;
                        position.last_monitored_at = Some(Utc::now());
                        last_observed = Some(price);

                        if kind == WindowKind::Entry && position.entry_crossed(price) {
                            entry_crossed = true;
                        }

                        if policy.observe(price) == WindowStep::Execute {
                            debug!(%id, %price, best = ?policy.best(), iteration, "Window reversal");
                            match kind {
                                WindowKind::Exit => {
                                    self.execute_close(position, price).await;
                                }
                                WindowKind::Entry if entry_crossed => {
                                    self.execute_entry(position, price).await;
                                }
                                WindowKind::Entry => {
                                    debug!(%id, "Reversal before entry condition, back to base loop");
                                }
                            }
                            settled = true;
                            break 'window;
                        }
                    }
                    Err(e) if e.is_recoverable() => {
                        self.metrics.oracle_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(%id, iteration, error = %e, "Window tick skipped");
                    }
                    Err(e) => {
                        self.metrics.oracle_errors.fetch_add(1, Ordering::Relaxed);
                        position.oracle_failures += 1;
                        warn!(%id, iteration, error = %e, "Unrecoverable oracle error in window");
                        if position.oracle_failures >= self.oracle_config.retry_budget {
                            self.apply_failure(position, CloseReason::OracleFailure).await;
                            settled = true;
                            break 'window;
                        }
                    }
                }
            }

            tokio::time::sleep(interval).await;
        }

        if !settled {
            // Budget exhausted: fall back to the last observed price.
            let mut tracked = entry.lock().await;
            let position = &mut tracked.position;
            match (kind, last_observed) {
                (WindowKind::Exit, Some(price)) => {
                    debug!(%id, %price, "Window budget exhausted, closing at last observed");
                    self.execute_close(position, price).await;
                }
                (WindowKind::Entry, Some(price)) if entry_crossed => {
                    debug!(%id, %price, "Window budget exhausted, entering at last observed");
                    self.execute_entry(position, price).await;
                }
                _ => {
                    debug!(%id, "Window budget exhausted without fill, back to base loop");
                }
            }
        }

        self.maximizing.lock().await.remove(&id);
        debug!(%id, "Maximization window closed");
    }

    /// Advance the status along a legal edge; log and refuse otherwise.
    fn set_status(&self, position: &mut Position, next: PositionStatus) -> bool {
        if position.status.can_advance_to(next) {
            position.status = next;
            true
        } else {
            error!(
                id = %position.id,
                from = %position.status,
                to = %next,
                "Illegal status transition refused"
            );
            false
        }
    }

    /// Apply one settlement to the ledger, retrying with the same delta.
    /// The transition is not committed until this succeeds.
    async fn ledger_apply(
        &self,
        position: &Position,
        settlement: &Settlement,
    ) -> Result<(), LedgerError> {
        let mut last_error = None;

        for attempt in 1..=self.ledger_config.retry_attempts {
            match self
                .ledger
                .adjust(
                    &position.user_id,
                    position.market,
                    &position.quote_asset,
                    settlement.delta,
                    true,
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        id = %position.id,
                        attempt,
                        max = self.ledger_config.retry_attempts,
                        error = %e,
                        "Ledger write failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(LedgerError::WriteFailed {
            key: position.user_id.clone(),
            reason: "unknown".to_string(),
        }))
    }

    async fn publish_update(&self, position: &Position) {
        self.notifier
            .publish(
                &position.user_id,
                "position_update",
                json!({
                    "position_id": position.id,
                    "symbol": position.symbol,
                    "price": position.current_price,
                    "status": position.status,
                    "unrealized_pnl": position.unrealized_pnl(),
                }),
            )
            .await;
    }

    async fn persist(&self, position: &Position) {
        if let Some(store) = &self.store {
            if let Err(e) = store.lock().await.upsert_position(position) {
                warn!(id = %position.id, error = %e, "Failed to persist position");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::notifier::LogNotifier;
    use crate::oracle::{MockPriceOracle, MockTick};
    use crate::position::TakeProfit;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    /// Ledger wrapper that records committed deltas and can inject write
    /// failures for retry testing.
    struct RecordingLedger {
        inner: InMemoryLedger,
        commits: std::sync::Mutex<Vec<Decimal>>,
        attempts: AtomicU32,
        fail_remaining: AtomicU32,
    }

    impl RecordingLedger {
        fn new() -> Self {
            Self {
                inner: InMemoryLedger::new(),
                commits: std::sync::Mutex::new(Vec::new()),
                attempts: AtomicU32::new(0),
                fail_remaining: AtomicU32::new(0),
            }
        }

        fn fail_next(&self, n: u32) {
            self.fail_remaining.store(n, Ordering::SeqCst);
        }

        fn commits(&self) -> Vec<Decimal> {
            self.commits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BalanceLedger for RecordingLedger {
        async fn adjust(
            &self,
            user_id: &str,
            market: Market,
            asset: &str,
            delta: Decimal,
            relative: bool,
        ) -> Result<(), LedgerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(LedgerError::WriteFailed {
                    key: format!("{}/{}/{}", user_id, market, asset),
                    reason: "injected".to_string(),
                });
            }

            self.commits.lock().unwrap().push(delta);
            self.inner.adjust(user_id, market, asset, delta, relative).await
        }

        async fn balance(&self, user_id: &str, market: Market, asset: &str) -> Decimal {
            self.inner.balance(user_id, market, asset).await
        }
    }

    struct Harness {
        monitor: Arc<PositionMonitor>,
        ledger: Arc<RecordingLedger>,
        oracle: Arc<MockPriceOracle>,
    }

    async fn harness() -> Harness {
        let oracle = Arc::new(MockPriceOracle::new(Market::Futures));
        let mut selector = OracleSelector::new();
        selector.register(oracle.clone());

        let ledger = Arc::new(RecordingLedger::new());
        ledger
            .inner
            .seed("user-1", Market::Futures, "USDT", dec!(10000))
            .await;

        let monitor = Arc::new(PositionMonitor::new(
            &Config::default(),
            ledger.clone(),
            Arc::new(LogNotifier),
            selector,
            None,
        ));

        Harness {
            monitor,
            ledger,
            oracle,
        }
    }

    fn buy_spec() -> PositionSpec {
        PositionSpec {
            user_id: "user-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            market: Market::Futures,
            side: crate::position::Side::Buy,
            entry_price: dec!(100),
            amount: dec!(500),
            quote_asset: "USDT".to_string(),
            stop_loss: Some(dec!(90)),
            take_profits: vec![
                TakeProfit::new(dec!(120), dec!(50)),
                TakeProfit::new(dec!(140), dec!(100)),
            ],
            leverage: 1,
        }
    }

    async fn advance_and_tick(h: &Harness) {
        tokio::time::advance(Duration::from_secs(31)).await;
        h.monitor.tick_once().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_commits_ledger_exactly_once_under_oracle_retries() {
        let h = harness().await;
        h.oracle
            .push_script(
                "BTCUSDT",
                [
                    MockTick::Unavailable,
                    MockTick::Unavailable,
                    MockTick::Price(dec!(100)),
                ],
            )
            .await;

        let id = h.monitor.admit(buy_spec()).await.unwrap();

        for _ in 0..4 {
            advance_and_tick(&h).await;
        }

        let position = h.monitor.position(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.entry_settled);

        // Two failed oracle ticks and one post-entry Hold tick never
        // produced a second entry movement.
        assert_eq!(h.ledger.commits(), vec![dec!(-500)]);
        assert_eq!(
            h.ledger.balance("user-1", Market::Futures, "USDT").await,
            dec!(9500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_profit_scenario_flag_sticks_and_no_stop() {
        let h = harness().await;
        h.oracle
            .push_prices("BTCUSDT", [dec!(100), dec!(110), dec!(125), dec!(118)])
            .await;

        let id = h.monitor.admit(buy_spec()).await.unwrap();

        for _ in 0..4 {
            advance_and_tick(&h).await;
        }

        let position = h.monitor.position(id).await.unwrap();
        // First TP executed at the 125 tick; the later drop to 118 neither
        // un-executes it nor touches the stop.
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.take_profits[0].executed);
        assert!(!position.take_profits[1].executed);
        assert_eq!(position.remaining_amount, dec!(250));
        // Slice of 250 filled at 125: +25% = 62.5 realized
        assert_eq!(position.pnl, dec!(62.5));
        assert_eq!(h.ledger.commits(), vec![dec!(-500), dec!(312.5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_window_reversal_settles_terminal_credit_once() {
        let h = harness().await;

        // Short entry at 100, single (final) take-profit at 95.
        let mut spec = buy_spec();
        spec.side = crate::position::Side::Sell;
        spec.stop_loss = Some(dec!(110));
        spec.take_profits = vec![TakeProfit::new(dec!(95), dec!(100))];

        // Base ticks: enter at 100, reach the final TP at 95.
        h.oracle.push_prices("BTCUSDT", [dec!(100), dec!(95)]).await;
        // Window ticks: ride the down-trend (buy back low), then a 0.75%
        // rebound from the best (93.5) ends the window at 94.2.
        h.oracle
            .push_prices("BTCUSDT", [dec!(94), dec!(93.5), dec!(94.2)])
            .await;

        let id = h.monitor.admit(spec).await.unwrap();
        advance_and_tick(&h).await; // enter
        advance_and_tick(&h).await; // final TP → closing + window
        h.monitor.drain_windows().await;

        let position = h.monitor.position(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.exit_price, Some(dec!(94.2)));
        assert_eq!(position.close_reason, Some(CloseReason::TakeProfit));
        // Short 500 from 100 closed at 94.2: +29 realized
        assert_eq!(position.pnl, dec!(29));

        // Entry credit and exactly one terminal settlement.
        assert_eq!(h.ledger.commits(), vec![dec!(500), dec!(-471)]);
        assert_eq!(
            h.ledger.balance("user-1", Market::Futures, "USDT").await,
            dec!(10029)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_window_budget_is_bounded() {
        let h = harness().await;

        // First base tick sees 101 (inside the 2% band, not crossed) and
        // opens an entry window.
        h.oracle.push_prices("BTCUSDT", [dec!(101)]).await;
        // Window prices fall monotonically but never cross the 100 target,
        // so the window can only end by budget exhaustion.
        let drift: Vec<Decimal> = (0..70i64)
            .map(|i| dec!(100.9) - Decimal::new(i, 3))
            .collect();
        h.oracle.push_prices("BTCUSDT", drift).await;

        let id = h.monitor.admit(buy_spec()).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let started = tokio::time::Instant::now();
        h.monitor.tick_once().await;
        h.monitor.drain_windows().await;
        let elapsed = started.elapsed();

        // 60 iterations at 5s: the window never outlives its budget.
        assert!(elapsed <= Duration::from_secs(301), "window ran {:?}", elapsed);

        // No fill: the position is back with the base loop, unentered.
        let position = h.monitor.position(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Monitoring);
        assert!(h.ledger.commits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reverts_committed_entry() {
        let h = harness().await;
        h.oracle.push_prices("BTCUSDT", [dec!(100)]).await;

        let id = h.monitor.admit(buy_spec()).await.unwrap();
        advance_and_tick(&h).await;
        assert_eq!(
            h.monitor.position(id).await.unwrap().status,
            PositionStatus::Open
        );

        assert!(h.monitor.cancel(id).await);

        let position = h.monitor.position(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Failed);
        assert_eq!(position.close_reason, Some(CloseReason::Cancelled));
        assert!(!position.entry_settled);

        // Debit then revert: the user is made whole.
        assert_eq!(h.ledger.commits(), vec![dec!(-500), dec!(500)]);
        assert_eq!(
            h.ledger.balance("user-1", Market::Futures, "USDT").await,
            dec!(10000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_failure_leaves_position_in_pre_transition_state() {
        let h = harness().await;
        h.oracle.push_prices("BTCUSDT", [dec!(100), dec!(100)]).await;

        let id = h.monitor.admit(buy_spec()).await.unwrap();

        // All three attempts of the first entry commit fail.
        h.ledger.fail_next(3);
        advance_and_tick(&h).await;

        let position = h.monitor.position(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Monitoring);
        assert!(!position.entry_settled);
        assert!(h.ledger.commits().is_empty());

        // Next tick retries the same economic event and commits once.
        advance_and_tick(&h).await;
        let position = h.monitor.position(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(h.ledger.commits(), vec![dec!(-500)]);
        assert_eq!(h.ledger.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_admit_rejects_unknown_user_for_insufficient_balance() {
        let h = harness().await;

        let mut spec = buy_spec();
        spec.user_id = "user-2".to_string();

        let err = h.monitor.admit(spec).await.unwrap_err();
        match err {
            AdmitError::RiskRejected(reason) => assert!(reason.contains("insufficient")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admit_rejects_unsupported_market() {
        let h = harness().await;

        let mut spec = buy_spec();
        spec.market = Market::Dex;

        assert!(matches!(
            h.monitor.admit(spec).await,
            Err(AdmitError::UnsupportedMarket(Market::Dex))
        ));
    }
}
