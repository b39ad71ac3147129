//! SQLite persistence for tracked positions and virtual balances.
//!
//! Positions survive restarts: non-terminal rows are reloaded at startup and
//! re-enter the monitoring loop. Every position field round-trips losslessly;
//! take-profit targets are stored as a JSON array so their execution order
//! is preserved exactly.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger::{BalanceKey, VirtualBalance};
use crate::position::{CloseReason, Market, Position, PositionStatus, Side, TakeProfit};

/// SQLite-backed store for positions and balances.
pub struct PositionStore {
    conn: Connection,
}

impl PositionStore {
    /// Open the store, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Position store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Tracked positions
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                market TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                amount TEXT NOT NULL,
                remaining_amount TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                stop_loss TEXT,
                take_profits TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                status TEXT NOT NULL,
                close_reason TEXT,
                exit_price TEXT,
                pnl TEXT NOT NULL,
                entry_settled INTEGER NOT NULL,
                oracle_failures INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_monitored_at TEXT,
                executed_at TEXT,
                closed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id);
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

            -- Virtual balances
            CREATE TABLE IF NOT EXISTS balances (
                user_id TEXT NOT NULL,
                market TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, market, asset)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Insert or update one position.
    pub fn upsert_position(&self, position: &Position) -> Result<()> {
        let take_profits = serde_json::to_string(&position.take_profits)
            .context("Failed to serialize take-profits")?;

        self.conn.execute(
            r#"
            INSERT INTO positions (id, user_id, symbol, market, side, entry_price, current_price,
                                   amount, remaining_amount, quote_asset, stop_loss, take_profits,
                                   leverage, status, close_reason, exit_price, pnl, entry_settled,
                                   oracle_failures, created_at, last_monitored_at, executed_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, ?21, ?22, ?23)
            ON CONFLICT(id) DO UPDATE SET
                current_price = ?7,
                remaining_amount = ?9,
                stop_loss = ?11,
                take_profits = ?12,
                status = ?14,
                close_reason = ?15,
                exit_price = ?16,
                pnl = ?17,
                entry_settled = ?18,
                oracle_failures = ?19,
                last_monitored_at = ?21,
                executed_at = ?22,
                closed_at = ?23,
                entry_price = ?6
            "#,
            params![
                position.id.to_string(),
                position.user_id,
                position.symbol,
                position.market.to_string(),
                position.side.to_string(),
                position.entry_price.to_string(),
                position.current_price.to_string(),
                position.amount.to_string(),
                position.remaining_amount.to_string(),
                position.quote_asset,
                position.stop_loss.map(|v| v.to_string()),
                take_profits,
                position.leverage,
                position.status.to_string(),
                position.close_reason.map(|r| r.to_string()),
                position.exit_price.map(|v| v.to_string()),
                position.pnl.to_string(),
                position.entry_settled as i32,
                position.oracle_failures,
                position.created_at.to_rfc3339(),
                position.last_monitored_at.map(|t| t.to_rfc3339()),
                position.executed_at.map(|t| t.to_rfc3339()),
                position.closed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Load one position by id.
    pub fn load_position(&self, id: Uuid) -> Result<Option<Position>> {
        let position = self
            .conn
            .query_row(
                &format!("SELECT {} FROM positions WHERE id = ?1", COLUMNS),
                params![id.to_string()],
                row_to_position,
            )
            .optional()?;
        Ok(position)
    }

    /// Load every non-terminal position, for resume after restart.
    pub fn load_open_positions(&self) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM positions WHERE status NOT IN ('closed', 'failed') ORDER BY created_at",
            COLUMNS
        ))?;

        let positions: Vec<Position> = stmt
            .query_map([], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();

        info!(count = positions.len(), "Loaded open positions from store");
        Ok(positions)
    }

    /// Load every position, newest first (status reporting).
    pub fn load_all_positions(&self) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM positions ORDER BY created_at DESC",
            COLUMNS
        ))?;

        let positions: Vec<Position> = stmt
            .query_map([], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    /// Persist a snapshot of every balance bucket.
    pub fn save_balances<'a, I>(&self, balances: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a BalanceKey, &'a VirtualBalance)>,
    {
        let tx = self.conn.unchecked_transaction()?;

        for (key, balance) in balances {
            tx.execute(
                r#"
                INSERT INTO balances (user_id, market, asset, amount, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(user_id, market, asset) DO UPDATE SET
                    amount = ?4,
                    updated_at = ?5
                "#,
                params![
                    key.user_id,
                    key.market.to_string(),
                    key.asset,
                    balance.amount.to_string(),
                    balance.updated_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Load every persisted balance bucket.
    pub fn load_balances(&self) -> Result<Vec<(BalanceKey, VirtualBalance)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, market, asset, amount, updated_at FROM balances")?;

        let balances: Vec<(BalanceKey, VirtualBalance)> = stmt
            .query_map([], |row| {
                let user_id: String = row.get(0)?;
                let market: String = row.get(1)?;
                let asset: String = row.get(2)?;
                let amount: String = row.get(3)?;
                let updated_at: String = row.get(4)?;
                Ok((
                    BalanceKey {
                        user_id,
                        market: Market::parse(&market).unwrap_or(Market::Spot),
                        asset,
                    },
                    VirtualBalance {
                        amount: Decimal::from_str(&amount).unwrap_or_default(),
                        updated_at: parse_timestamp(&updated_at),
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(balances)
    }

    /// Check whether any positions were ever persisted.
    pub fn has_positions(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM positions", [], |row| row.get(0))?;
        Ok(count > 0)
    }
}

const COLUMNS: &str = "id, user_id, symbol, market, side, entry_price, current_price, amount, \
                       remaining_amount, quote_asset, stop_loss, take_profits, leverage, status, \
                       close_reason, exit_price, pnl, entry_settled, oracle_failures, created_at, \
                       last_monitored_at, executed_at, closed_at";

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let take_profits: Vec<TakeProfit> =
        serde_json::from_str(&row.get::<_, String>(11)?).unwrap_or_default();

    Ok(Position {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_else(|_| Uuid::nil()),
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        market: Market::parse(&row.get::<_, String>(3)?).unwrap_or(Market::Spot),
        side: Side::parse(&row.get::<_, String>(4)?).unwrap_or(Side::Buy),
        entry_price: Decimal::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        current_price: Decimal::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        amount: Decimal::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
        remaining_amount: Decimal::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
        quote_asset: row.get(9)?,
        stop_loss: row
            .get::<_, Option<String>>(10)?
            .and_then(|s| Decimal::from_str(&s).ok()),
        take_profits,
        leverage: row.get(12)?,
        status: PositionStatus::parse(&row.get::<_, String>(13)?)
            .unwrap_or(PositionStatus::Failed),
        close_reason: row
            .get::<_, Option<String>>(14)?
            .and_then(|s| CloseReason::parse(&s)),
        exit_price: row
            .get::<_, Option<String>>(15)?
            .and_then(|s| Decimal::from_str(&s).ok()),
        pnl: Decimal::from_str(&row.get::<_, String>(16)?).unwrap_or_default(),
        entry_settled: row.get::<_, i32>(17)? != 0,
        oracle_failures: row.get(18)?,
        created_at: parse_timestamp(&row.get::<_, String>(19)?),
        last_monitored_at: row
            .get::<_, Option<String>>(20)?
            .map(|s| parse_timestamp(&s)),
        executed_at: row.get::<_, Option<String>>(21)?.map(|s| parse_timestamp(&s)),
        closed_at: row.get::<_, Option<String>>(22)?.map(|s| parse_timestamp(&s)),
    })
}
