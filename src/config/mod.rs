//! Configuration management for the replay engine.
//!
//! Loads settings from an optional config file and `REPLAY__*` environment
//! variables, e.g. `REPLAY__ACCOUNT__START_BALANCE=200000`.

use crate::market::Timeframe;
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Starting cash and trading costs
    #[serde(default)]
    pub account: AccountConfig,
    /// Replay window, warm-up and knock-out settings
    #[serde(default)]
    pub episode: EpisodeConfig,
    /// Exchange rules
    #[serde(default)]
    pub market: MarketConfig,
    /// Parameters of the built-in moving-average trader
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Row recording
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// Which fee schedule to apply to fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeModelKind {
    #[default]
    AShare,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default = "default_start_balance")]
    pub start_balance: Decimal,
    /// Commission as a fraction of turnover (0.0003 = 3 per 10k)
    #[serde(default = "default_commission_rate")]
    pub commission_rate: Decimal,
    /// Floor applied to every commission charge
    #[serde(default = "default_minimum_commission")]
    pub minimum_commission: Decimal,
    /// Sell-side stamp tax as a fraction of turnover
    #[serde(default = "default_stamp_tax_rate")]
    pub stamp_tax_rate: Decimal,
    #[serde(default = "default_transfer_fee")]
    pub transfer_fee_per_thousand: Decimal,
    /// Symbol prefixes charged the transfer fee (Shanghai codes start with 6)
    #[serde(default = "default_transfer_fee_prefixes")]
    pub transfer_fee_prefixes: Vec<String>,
    /// Price slippage assumed per traded unit
    #[serde(default)]
    pub slippage_per_unit: Decimal,
    #[serde(default = "default_contract_size")]
    pub contract_size: Decimal,
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,
    /// Board lot; buy volumes are rounded down to it
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    #[serde(default)]
    pub fee_model: FeeModelKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeConfig {
    /// Knock-out threshold in percent of peak equity
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    /// Settled days before orders are accepted
    #[serde(default = "default_warmup_days")]
    pub warmup_days: u32,
    #[serde(default = "default_episode_count")]
    pub episode_count: u32,
    /// First date replayed (inclusive)
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Last date replayed (inclusive)
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Timeframe orders are matched on; finer data is aggregated up to it
    #[serde(default = "default_trading_timeframe")]
    pub trading_timeframe: Timeframe,
    /// Match ticks directly instead of aggregating them
    #[serde(default)]
    pub match_raw_ticks: bool,
    #[serde(default = "default_annual_trading_days")]
    pub annual_trading_days: u32,
    /// Cap fills per observation by its volume
    #[serde(default)]
    pub cap_fills_to_volume: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Daily price limit in percent (None for markets without one)
    #[serde(default = "default_price_limit_pct")]
    pub price_limit_pct: Option<Decimal>,
    /// Orders submitted at or after this time are rejected
    #[serde(default = "default_order_cutoff")]
    pub order_cutoff: Option<NaiveTime>,
    /// Keep resting orders across the day rollover
    #[serde(default)]
    pub carry_orders_overnight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_fast_period")]
    pub fast_period: u32,
    #[serde(default = "default_slow_period")]
    pub slow_period: u32,
    /// Maximum lots per entry
    #[serde(default = "default_order_lots")]
    pub order_lots: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// SQLite file receiving every recorded row
    #[serde(default)]
    pub db_path: Option<String>,
}

// Default value functions
fn default_start_balance() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_commission_rate() -> Decimal {
    Decimal::new(3, 4) // 0.0003
}

fn default_minimum_commission() -> Decimal {
    Decimal::new(5, 0)
}

fn default_stamp_tax_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_transfer_fee() -> Decimal {
    Decimal::ONE
}

fn default_transfer_fee_prefixes() -> Vec<String> {
    vec!["6".to_string()]
}

fn default_contract_size() -> Decimal {
    Decimal::ONE
}

fn default_price_tick() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_lot_size() -> Decimal {
    Decimal::ONE_HUNDRED
}

fn default_max_drawdown_pct() -> Decimal {
    Decimal::new(21, 0)
}

fn default_warmup_days() -> u32 {
    5
}

fn default_episode_count() -> u32 {
    1
}

fn default_trading_timeframe() -> Timeframe {
    Timeframe::MINUTE
}

fn default_annual_trading_days() -> u32 {
    240
}

fn default_price_limit_pct() -> Option<Decimal> {
    Some(Decimal::TEN)
}

fn default_order_cutoff() -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(14, 58, 0)
}

fn default_fast_period() -> u32 {
    5
}

fn default_slow_period() -> u32 {
    20
}

fn default_order_lots() -> u32 {
    10
}

impl Config {
    /// Load configuration from environment variables and a config file.
    ///
    /// Reads `path` when given, otherwise an optional `config.*` in the
    /// working directory.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(p) => config::File::with_name(p).required(true),
            None => config::File::with_name("config").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::default().separator("__").prefix("REPLAY"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.account.start_balance > Decimal::ZERO,
            "start_balance must be positive"
        );

        anyhow::ensure!(
            self.account.commission_rate >= Decimal::ZERO
                && self.account.commission_rate < Decimal::ONE,
            "commission_rate must be between 0 and 1"
        );

        anyhow::ensure!(
            self.account.minimum_commission >= Decimal::ZERO
                && self.account.slippage_per_unit >= Decimal::ZERO,
            "minimum_commission and slippage_per_unit must not be negative"
        );

        anyhow::ensure!(
            self.account.contract_size > Decimal::ZERO && self.account.lot_size > Decimal::ZERO,
            "contract_size and lot_size must be positive"
        );

        anyhow::ensure!(
            self.episode.max_drawdown_pct > Decimal::ZERO
                && self.episode.max_drawdown_pct <= Decimal::ONE_HUNDRED,
            "max_drawdown_pct must be between 0 and 100"
        );

        anyhow::ensure!(self.episode.episode_count >= 1, "episode_count must be at least 1");

        anyhow::ensure!(
            self.episode.annual_trading_days >= 1,
            "annual_trading_days must be at least 1"
        );

        if let (Some(start), Some(end)) = (self.episode.start_date, self.episode.end_date) {
            anyhow::ensure!(start <= end, "start_date {} is after end_date {}", start, end);
        }

        anyhow::ensure!(
            self.strategy.fast_period >= 1 && self.strategy.fast_period < self.strategy.slow_period,
            "fast_period must be >= 1 and < slow_period"
        );

        Ok(())
    }

    /// Override one numeric setting by dotted or bare name.
    ///
    /// Used by parameter sweeps; integer settings truncate the value.
    pub fn apply_setting(&mut self, name: &str, value: Decimal) -> Result<()> {
        let key = name.rsplit('.').next().unwrap_or(name);
        let as_u32 = || -> Result<u32> {
            value
                .trunc()
                .to_u32()
                .with_context(|| format!("{} must be a non-negative integer, got {}", name, value))
        };

        match key {
            "start_balance" => self.account.start_balance = value,
            "commission_rate" => self.account.commission_rate = value,
            "minimum_commission" => self.account.minimum_commission = value,
            "stamp_tax_rate" => self.account.stamp_tax_rate = value,
            "slippage_per_unit" => self.account.slippage_per_unit = value,
            "contract_size" => self.account.contract_size = value,
            "price_tick" => self.account.price_tick = value,
            "lot_size" => self.account.lot_size = value,
            "max_drawdown_pct" => self.episode.max_drawdown_pct = value,
            "warmup_days" => self.episode.warmup_days = as_u32()?,
            "episode_count" => self.episode.episode_count = as_u32()?,
            "price_limit_pct" => self.market.price_limit_pct = Some(value),
            "fast_period" => self.strategy.fast_period = as_u32()?,
            "slow_period" => self.strategy.slow_period = as_u32()?,
            "order_lots" => self.strategy.order_lots = as_u32()?,
            other => anyhow::bail!("Unknown setting '{}'", other),
        }
        Ok(())
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            start_balance: default_start_balance(),
            commission_rate: default_commission_rate(),
            minimum_commission: default_minimum_commission(),
            stamp_tax_rate: default_stamp_tax_rate(),
            transfer_fee_per_thousand: default_transfer_fee(),
            transfer_fee_prefixes: default_transfer_fee_prefixes(),
            slippage_per_unit: Decimal::ZERO,
            contract_size: default_contract_size(),
            price_tick: default_price_tick(),
            lot_size: default_lot_size(),
            fee_model: FeeModelKind::AShare,
        }
    }
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: default_max_drawdown_pct(),
            warmup_days: default_warmup_days(),
            episode_count: default_episode_count(),
            start_date: None,
            end_date: None,
            trading_timeframe: default_trading_timeframe(),
            match_raw_ticks: false,
            annual_trading_days: default_annual_trading_days(),
            cap_fills_to_volume: false,
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            price_limit_pct: default_price_limit_pct(),
            order_cutoff: default_order_cutoff(),
            carry_orders_overnight: false,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast_period(),
            slow_period: default_slow_period(),
            order_lots: default_order_lots(),
        }
    }
}
