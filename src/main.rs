//! Position Sentinel - Main Entry Point
//!
//! Runs the lifecycle tracker as a service, replays a scripted simulation,
//! or reports persisted state.

use anyhow::Result;
use clap::{Parser, Subcommand};
use position_sentinel::config::Config;
use position_sentinel::ledger::{BalanceLedger, InMemoryLedger};
use position_sentinel::monitor::PositionMonitor;
use position_sentinel::notifier::{ChannelNotifier, LogNotifier, Notifier};
use position_sentinel::oracle::{MockPriceOracle, OracleSelector};
use position_sentinel::persistence::PositionStore;
use position_sentinel::position::{Market, PositionSpec, Side, TakeProfit};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Position Sentinel CLI
#[derive(Parser)]
#[command(name = "position-sentinel")]
#[command(version, about = "Lifecycle tracking for signal-driven trading positions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scripted price path through the tracker (paper trading demo)
    Simulate {
        /// Symbol to trade
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,

        /// Position side: buy or sell
        #[arg(long, default_value = "buy")]
        side: String,

        /// Entry target price
        #[arg(short, long, default_value = "100")]
        entry: Decimal,

        /// Notional amount to commit
        #[arg(short, long, default_value = "500")]
        amount: Decimal,

        /// Stop-loss price
        #[arg(long)]
        stop_loss: Option<Decimal>,

        /// Take-profit targets as price:percent (repeatable, in priority order)
        #[arg(long = "take-profit", value_name = "PRICE:PERCENT")]
        take_profits: Vec<String>,
    },

    /// Show persisted positions and balances
    Status {
        /// Path to SQLite database (default: data/positions.db)
        #[arg(short, long, default_value = "data/positions.db")]
        db: String,

        /// Show closed and failed positions too
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Simulate {
            symbol,
            side,
            entry,
            amount,
            stop_loss,
            take_profits,
        }) => {
            return run_simulation(&symbol, &side, entry, amount, stop_loss, &take_profits).await;
        }
        Some(Commands::Status { db, verbose }) => {
            return show_status(&db, verbose);
        }
        None => {
            // Default: run service mode
        }
    }

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║        Position Sentinel v{} - Lifecycle Tracker         ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    // Persistence
    if let Some(parent) = std::path::Path::new(&config.storage.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = PositionStore::new(&config.storage.db_path)?;

    // Virtual ledger, restored from the last snapshot
    let ledger = Arc::new(InMemoryLedger::new());
    let balances = store.load_balances()?;
    if balances.is_empty() {
        info!("📂 [PERSISTENCE] No previous balances found, starting fresh");
    } else {
        info!("📂 [PERSISTENCE] Restoring {} balance buckets", balances.len());
        for (key, balance) in balances {
            ledger
                .adjust(&key.user_id, key.market, &key.asset, balance.amount, false)
                .await
                .ok();
        }
    }

    // Oracles. Without exchange connectors configured this registers the
    // scripted mock for every market, matching paper-trading mode; the
    // signal-activation path feeds prices into it.
    warn!("⚠️  No exchange connectors configured - registering mock oracles (paper mode)");
    let mut selector = OracleSelector::new();
    for market in [Market::Spot, Market::Futures, Market::Dex] {
        selector.register(Arc::new(MockPriceOracle::new(market)));
    }

    let store = Arc::new(Mutex::new(store));
    let monitor = Arc::new(PositionMonitor::new(
        &config,
        ledger.clone(),
        Arc::new(LogNotifier),
        selector,
        Some(store.clone()),
    ));

    // Resume non-terminal positions
    let open_positions = store.lock().await.load_open_positions()?;
    let mut resumed = 0;
    for position in open_positions {
        if monitor.resume(position).await {
            resumed += 1;
        }
    }
    info!(resumed, "Startup restore complete");

    // Periodic balance snapshots
    let snapshot_ledger = ledger.clone();
    let snapshot_store = store.clone();
    let snapshot_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let snapshot = snapshot_ledger.snapshot().await;
            if let Err(e) = snapshot_store.lock().await.save_balances(snapshot.iter()) {
                warn!(error = %e, "Balance snapshot failed");
            }
        }
    });

    info!("🚀 Starting base monitoring loop...");
    let runner = tokio::spawn(monitor.clone().run());

    tokio::signal::ctrl_c().await.ok();
    info!("🛑 Shutdown signal received");
    monitor.shutdown();
    runner.await.ok();
    snapshot_task.abort();

    // Final state flush
    let snapshot = ledger.snapshot().await;
    store.lock().await.save_balances(snapshot.iter())?;
    info!("💾 Final state saved, goodbye");

    Ok(())
}

/// Replay a deterministic price path through a fresh tracker.
async fn run_simulation(
    symbol: &str,
    side: &str,
    entry: Decimal,
    amount: Decimal,
    stop_loss: Option<Decimal>,
    take_profit_args: &[String],
) -> Result<()> {
    let side = Side::parse(side)
        .ok_or_else(|| anyhow::anyhow!("side must be 'buy' or 'sell', got '{}'", side))?;

    let mut take_profits = Vec::new();
    for arg in take_profit_args {
        take_profits.push(parse_take_profit(arg)?);
    }
    if take_profits.is_empty() {
        // Default targets at ±5% and ±10% from entry
        let (tp1, tp2) = match side {
            Side::Buy => (entry * dec("1.05"), entry * dec("1.10")),
            Side::Sell => (entry * dec("0.95"), entry * dec("0.90")),
        };
        take_profits.push(TakeProfit::new(tp1, dec("50")));
        take_profits.push(TakeProfit::new(tp2, dec("100")));
    }

    let mut config = Config::default();
    config.tracker.base_interval_seconds = 1;
    config.tracker.maximization_interval_seconds = 1;
    config.tracker.maximization_max_iterations = 20;
    config.validate()?;

    let oracle = Arc::new(MockPriceOracle::new(Market::Futures));
    oracle.push_prices(symbol, price_path(side, entry, &take_profits)).await;
    let mut selector = OracleSelector::new();
    selector.register(oracle.clone());

    let ledger = Arc::new(InMemoryLedger::new());
    ledger
        .seed("demo", Market::Futures, "USDT", config.ledger.initial_balance)
        .await;

    let (notifier, mut events) = ChannelNotifier::new();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("  ▸ {} {}", event.event, event.payload);
        }
    });

    let monitor = Arc::new(PositionMonitor::new(
        &config,
        ledger.clone(),
        Arc::new(notifier) as Arc<dyn Notifier>,
        selector,
        None,
    ));

    println!("📝 Simulating {} {} @ {} (amount {})", side, symbol, entry, amount);

    let id = match monitor
        .admit(PositionSpec {
            user_id: "demo".to_string(),
            symbol: symbol.to_string(),
            market: Market::Futures,
            side,
            entry_price: entry,
            amount,
            quote_asset: "USDT".to_string(),
            stop_loss,
            take_profits,
            leverage: 1,
        })
        .await
    {
        Ok(id) => id,
        Err(e) => {
            println!("❌ Position not admitted: {}", e);
            return Ok(());
        }
    };

    let runner = tokio::spawn(monitor.clone().run());

    // Wait for the lifecycle to finish (bounded)
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let done = monitor
            .position(id)
            .await
            .map(|p| p.status.is_terminal())
            .unwrap_or(true);
        if done || tokio::time::Instant::now() >= deadline {
            break;
        }
    }

    monitor.shutdown();
    runner.await.ok();
    printer.abort();

    if let Some(position) = monitor.position(id).await {
        println!("──────────────────────────────────────────");
        println!("  Status:      {}", position.status);
        if let Some(reason) = position.close_reason {
            println!("  Close:       {}", reason);
        }
        if let Some(exit) = position.exit_price {
            println!("  Exit price:  {}", exit);
        }
        println!("  Realized PnL: {}", position.pnl);
        println!(
            "  Balance:     {} (started at {})",
            ledger.balance("demo", Market::Futures, "USDT").await,
            Config::default().ledger.initial_balance
        );
    }

    Ok(())
}

/// Deterministic demo path: approach the entry, cross it, climb through the
/// take-profit targets, then reverse enough to end the exit window.
fn price_path(side: Side, entry: Decimal, take_profits: &[TakeProfit]) -> Vec<Decimal> {
    let hundred = Decimal::new(100, 0);
    let sign = |pct: i64| match side {
        // Percent offsets flip for sells: their profit side is down.
        Side::Buy => Decimal::new(pct, 0),
        Side::Sell => Decimal::new(-pct, 0),
    };
    let at = |pct: i64| entry * (hundred + sign(pct)) / hundred;

    let mut path = Vec::new();

    // Approach from the unfavorable side and cross the entry
    for pct in [3, 2, 1, 0, -1] {
        path.push(at(pct));
    }

    // Sweep through every target with a little headroom
    let top = take_profits
        .iter()
        .map(|tp| tp.price)
        .fold(entry, |acc, p| match side {
            Side::Buy => acc.max(p),
            Side::Sell => acc.min(p),
        });
    let span = ((top - entry) / entry * hundred).abs();
    let steps = 12i64;
    for i in 1..=steps {
        let pct = span * Decimal::new(i, 0) / Decimal::new(steps, 0) + Decimal::ONE;
        path.push(entry * (hundred + match side { Side::Buy => pct, Side::Sell => -pct }) / hundred);
    }

    // Reversal past the rebound threshold so the exit window fills
    let last = *path.last().unwrap_or(&entry);
    path.push(last * dec("0.99"));
    path.push(last * dec("0.985"));
    path
}

fn parse_take_profit(arg: &str) -> Result<TakeProfit> {
    let (price, percent) = arg
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("take-profit must be PRICE:PERCENT, got '{}'", arg))?;
    Ok(TakeProfit::new(
        Decimal::from_str(price.trim())?,
        Decimal::from_str(percent.trim())?,
    ))
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "position-sentinel.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("position_sentinel=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Base interval: {}s | Window: {}s × {} iterations",
        config.tracker.base_interval_seconds,
        config.tracker.maximization_interval_seconds,
        config.tracker.maximization_max_iterations
    );
    info!(
        "   Rebound threshold: {}% | Proximity band: {}%",
        config.tracker.rebound_threshold_pct, config.tracker.proximity_band_pct
    );
    info!(
        "   Max drawdown: {} | Max exposure: {}",
        config.risk.max_drawdown_ratio, config.risk.max_exposure
    );
    info!(
        "   Oracle retry budget: {} | Ledger retries: {}",
        config.oracle.retry_budget, config.ledger.retry_attempts
    );
    info!("   Database: {}", config.storage.db_path);
}

/// Print persisted positions and balances.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              POSITION SENTINEL STATUS                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The tracker has not been started yet, or the path is incorrect.");
        return Ok(());
    }

    let store = PositionStore::new(db_path)?;

    let positions = store.load_all_positions()?;
    if positions.is_empty() {
        println!("\nNo positions recorded yet.");
    } else {
        println!("\n📊 Positions:");
        for position in &positions {
            if !verbose && position.status.is_terminal() {
                continue;
            }
            let targets: Vec<String> = position
                .take_profits
                .iter()
                .map(|tp| {
                    format!(
                        "{}:{}%{}",
                        tp.price,
                        tp.percent,
                        if tp.executed { "✓" } else { "" }
                    )
                })
                .collect();
            println!(
                "   {} {} {} {} | entry {} now {} | {} | pnl {} | tp [{}]",
                position.id,
                position.user_id,
                position.side,
                position.symbol,
                position.entry_price,
                position.current_price,
                position.status,
                position.pnl,
                targets.join(", ")
            );
        }
    }

    let balances = store.load_balances()?;
    if !balances.is_empty() {
        println!("\n💰 Balances:");
        for (key, balance) in &balances {
            println!(
                "   {} = {} (updated {})",
                key,
                balance.amount,
                balance.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}
