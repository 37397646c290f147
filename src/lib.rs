//! # Market Replay
//!
//! Deterministic event-driven backtesting core: replays historical ticks and
//! bars through an order-matching simulator and an account ledger, one
//! episode at a time, and reports daily P&L and episode performance.
//!
//! ## Architecture
//!
//! - `market`: Market events, bar aggregation and the latest-price snapshot
//! - `matching`: Orders, trades and the bar/tick crossing engine
//! - `ledger`: Cash, positions, T+1 availability, fees and daily settlement
//! - `risk`: Drawdown tracking for knock-out termination
//! - `backtest`: Historical sources, the episode controller, metrics and sweeps
//! - `strategy`: Order intent sources driving an episode
//! - `persistence`: Record sinks (memory, SQLite)
//! - `config`: Configuration management and validation
//! - `utils`: Decimal helpers and id generation

pub mod backtest;
pub mod config;
pub mod error;
pub mod ledger;
pub mod market;
pub mod matching;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{ReplayError, ReplayResult};
