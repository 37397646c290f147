//! Episode replay over historical market data.
//!
//! This module provides:
//! - Rewindable historical sources (CSV import into an in-memory cache)
//! - The episode controller driving matching and the ledger event by event
//! - Performance analysis of settled days
//! - Parameter sweeps running one controller per combination
//!
//! # Example
//!
//! ```rust,ignore
//! use market_replay::backtest::{CsvEventLoader, EpisodeController, EventCache};
//! use market_replay::market::Timeframe;
//! use market_replay::persistence::NullRecorder;
//! use market_replay::strategy::SmaCrossTrader;
//!
//! let loader = CsvEventLoader::new("600000", Timeframe::MINUTE);
//! let cache = EventCache::from_events(loader.load_bars("data/600000.csv")?);
//! let mut controller = EpisodeController::new(config.clone(), Box::new(cache), Box::new(NullRecorder));
//! let mut trader = SmaCrossTrader::from_config(&config.strategy, config.account.lot_size);
//!
//! let summaries = controller.run(&mut trader)?;
//! println!("{}", summaries[0].report());
//! ```

mod controller;
mod data;
mod metrics;
mod runner;

pub use controller::{EpisodeController, EpisodeState, StepOutcome, StepView};
pub use data::{CsvEventLoader, EventCache, HistoricalSource};
pub use metrics::{DailyStat, EpisodeSummary, PerformanceAnalyzer, ANNUAL_TRADING_DAYS};
pub use runner::{
    IntentFactory, OptimizeTarget, ParameterSetting, ParameterSpace, SweepResults, SweepRun,
    SweepRunner,
};
