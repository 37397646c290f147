//! Market data model: bars, ticks and the replayed event stream.
//!
//! - `aggregator`: folds ticks and small bars into larger bars
//! - `state`: latest-price snapshot per symbol

pub mod aggregator;
pub mod state;

pub use aggregator::{AggregatorSet, BarAggregator};
pub use state::MarketState;

use crate::error::{ReplayError, ReplayResult};
use chrono::{NaiveDateTime, Timelike};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of quote levels carried by a tick.
pub const BOOK_DEPTH: usize = 5;

/// Minutes in one calendar day, the span of a daily bar.
pub const MINUTES_PER_DAY: u32 = 1440;

/// Bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    Minutes(u32),
    Daily,
}

impl Timeframe {
    pub const MINUTE: Timeframe = Timeframe::Minutes(1);

    /// Interval length in minutes.
    pub fn minutes(&self) -> u32 {
        match self {
            Timeframe::Minutes(m) => *m,
            Timeframe::Daily => MINUTES_PER_DAY,
        }
    }

    pub fn is_finer_than(&self, other: &Timeframe) -> bool {
        self.minutes() < other.minutes()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Minutes(m) => write!(f, "{}m", m),
            Timeframe::Daily => write!(f, "1d"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "1d" || s == "d" || s == "day" || s == "daily" {
            return Ok(Timeframe::Daily);
        }
        let digits = s.strip_suffix("min").or_else(|| s.strip_suffix('m')).unwrap_or(s.as_str());
        match digits.parse::<u32>() {
            Ok(0) => Err("timeframe must be at least one minute".to_string()),
            Ok(m) if m >= MINUTES_PER_DAY => Ok(Timeframe::Daily),
            Ok(m) => Ok(Timeframe::Minutes(m)),
            Err(_) => Err(format!("unrecognized timeframe '{}'", s)),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

/// Fixed-interval OHLCV summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub exchange: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub open_interest: Decimal,
    /// Close time of the interval.
    pub timestamp: NaiveDateTime,
}

impl Bar {
    /// Check `low <= min(open, close) <= max(open, close) <= high` and `volume >= 0`.
    pub fn validate(&self) -> ReplayResult<()> {
        let reason = if self.low > self.high {
            Some(format!("low {} above high {}", self.low, self.high))
        } else if self.open < self.low || self.open > self.high {
            Some(format!("open {} outside [{}, {}]", self.open, self.low, self.high))
        } else if self.close < self.low || self.close > self.high {
            Some(format!("close {} outside [{}, {}]", self.close, self.low, self.high))
        } else if self.volume < Decimal::ZERO {
            Some(format!("negative volume {}", self.volume))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ReplayError::InvalidBar {
                symbol: self.symbol.clone(),
                timestamp: self.timestamp,
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// One side of one quote level.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Raw quote observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub exchange: String,
    /// Last traded price.
    pub price: Decimal,
    /// Cumulative session volume.
    pub volume: Decimal,
    pub open_interest: Decimal,
    pub bids: [BookLevel; BOOK_DEPTH],
    pub asks: [BookLevel; BOOK_DEPTH],
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub prev_close: Decimal,
    pub timestamp: NaiveDateTime,
}

impl Tick {
    /// Tick with a single quote level, the rest of the book empty.
    pub fn with_quote(
        symbol: &str,
        timestamp: NaiveDateTime,
        price: Decimal,
        volume: Decimal,
        bid: BookLevel,
        ask: BookLevel,
    ) -> Self {
        let mut bids = [BookLevel::default(); BOOK_DEPTH];
        let mut asks = [BookLevel::default(); BOOK_DEPTH];
        bids[0] = bid;
        asks[0] = ask;
        Self {
            symbol: symbol.to_string(),
            exchange: String::new(),
            price,
            volume,
            open_interest: Decimal::ZERO,
            bids,
            asks,
            open: price,
            high: price,
            low: price,
            prev_close: Decimal::ZERO,
            timestamp,
        }
    }

    pub fn best_bid(&self) -> BookLevel {
        self.bids[0]
    }

    pub fn best_ask(&self) -> BookLevel {
        self.asks[0]
    }
}

/// Kind tag of a market event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Tick,
    Bar(Timeframe),
}

/// One replayed observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketEvent {
    Tick(Tick),
    Bar { timeframe: Timeframe, bar: Bar },
}

impl MarketEvent {
    pub fn bar(timeframe: Timeframe, bar: Bar) -> Self {
        MarketEvent::Bar { timeframe, bar }
    }

    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Tick(t) => &t.symbol,
            MarketEvent::Bar { bar, .. } => &bar.symbol,
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            MarketEvent::Tick(t) => &t.exchange,
            MarketEvent::Bar { bar, .. } => &bar.exchange,
        }
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        match self {
            MarketEvent::Tick(t) => t.timestamp,
            MarketEvent::Bar { bar, .. } => bar.timestamp,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            MarketEvent::Tick(_) => EventKind::Tick,
            MarketEvent::Bar { timeframe, .. } => EventKind::Bar(*timeframe),
        }
    }

    /// Last price carried by the event (tick price or bar close).
    pub fn price(&self) -> Decimal {
        match self {
            MarketEvent::Tick(t) => t.price,
            MarketEvent::Bar { bar, .. } => bar.close,
        }
    }

    /// First price carried by the event (tick price or bar open).
    pub fn open_price(&self) -> Decimal {
        match self {
            MarketEvent::Tick(t) => t.price,
            MarketEvent::Bar { bar, .. } => bar.open,
        }
    }

    /// Seconds since midnight, for cutoff checks.
    pub fn seconds_of_day(&self) -> u32 {
        self.timestamp().num_seconds_from_midnight()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::NaiveDate;

    pub fn ts(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .unwrap()
    }

    pub fn bar(
        symbol: &str,
        timestamp: NaiveDateTime,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            exchange: "SSE".to_string(),
            open,
            high,
            low,
            close,
            volume,
            open_interest: Decimal::ZERO,
            timestamp,
        }
    }

    /// Flat bar with every price equal to `price`.
    pub fn flat_bar(symbol: &str, timestamp: NaiveDateTime, price: Decimal) -> Bar {
        bar(symbol, timestamp, price, price, price, price, Decimal::ONE_HUNDRED * Decimal::ONE_HUNDRED)
    }

    pub fn minute_event(bar: Bar) -> MarketEvent {
        MarketEvent::bar(Timeframe::MINUTE, bar)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timeframe_parsing() {
        assert_eq!("5m".parse::<Timeframe>().unwrap(), Timeframe::Minutes(5));
        assert_eq!("15min".parse::<Timeframe>().unwrap(), Timeframe::Minutes(15));
        assert_eq!("1d".parse::<Timeframe>().unwrap(), Timeframe::Daily);
        assert_eq!("1440".parse::<Timeframe>().unwrap(), Timeframe::Daily);
        assert!("0m".parse::<Timeframe>().is_err());
        assert!("weekly".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::Minutes(30).to_string(), "30m");
        assert!(Timeframe::MINUTE.is_finer_than(&Timeframe::Daily));
    }

    #[test]
    fn test_bar_validation() {
        let good = bar("600000", ts(1, 9, 31), dec!(10), dec!(10.5), dec!(9.8), dec!(10.2), dec!(100));
        assert!(good.validate().is_ok());

        let inverted = bar("600000", ts(1, 9, 31), dec!(10), dec!(9.5), dec!(9.8), dec!(10.2), dec!(100));
        assert!(matches!(inverted.validate(), Err(ReplayError::InvalidBar { .. })));

        let close_outside = bar("600000", ts(1, 9, 31), dec!(10), dec!(10.5), dec!(9.8), dec!(10.6), dec!(100));
        assert!(close_outside.validate().is_err());
    }

    #[test]
    fn test_event_accessors() {
        let event = minute_event(bar("000001", ts(4, 10, 0), dec!(10), dec!(11), dec!(9), dec!(10.5), dec!(1)));
        assert_eq!(event.symbol(), "000001");
        assert_eq!(event.kind(), EventKind::Bar(Timeframe::MINUTE));
        assert_eq!(event.price(), dec!(10.5));
        assert_eq!(event.open_price(), dec!(10));
        assert_eq!(event.seconds_of_day(), 36_000);
    }
}
