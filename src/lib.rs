//! # Position Sentinel
//!
//! Automated lifecycle tracking for signal-driven simulated trading
//! positions: open on entry conditions, watch with adaptive polling, close
//! on stop-loss or take-profit targets, all gated by a per-user risk check.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `position`: Position entity, state machine, and settlement arithmetic
//! - `monitor`: Base monitoring loop and maximization windows
//! - `risk`: Admission-time risk gating
//! - `ledger`: Per-user virtual balance ledger
//! - `oracle`: Price oracle contracts and the scripted mock
//! - `notifier`: Fire-and-forget lifecycle event publishing
//! - `persistence`: SQLite-based state persistence

pub mod config;
pub mod ledger;
pub mod monitor;
pub mod notifier;
pub mod oracle;
pub mod persistence;
pub mod position;
pub mod risk;

pub use config::Config;
