//! Latest-price snapshot, updated by every replayed event.

use super::MarketEvent;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Per-symbol view of the current trading day.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSnapshot {
    pub last_price: Decimal,
    pub day_open: Decimal,
    pub day_high: Decimal,
    pub day_low: Decimal,
    /// Last price of the previous trading day seen for this symbol.
    pub prev_close: Option<Decimal>,
    pub as_of: NaiveDateTime,
}

/// Market-state snapshot shared by the matching step and the ledger marks.
#[derive(Debug, Default)]
pub struct MarketState {
    symbols: HashMap<String, SymbolSnapshot>,
    first_open: Option<Decimal>,
    last_close: Option<Decimal>,
    as_of: Option<NaiveDateTime>,
}

impl MarketState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, event: &MarketEvent) {
        let timestamp = event.timestamp();
        let price = event.price();
        let (high, low) = match event {
            MarketEvent::Bar { bar, .. } => (bar.high, bar.low),
            MarketEvent::Tick(t) => (t.price, t.price),
        };

        if self.first_open.is_none() {
            self.first_open = Some(event.open_price());
        }
        self.last_close = Some(price);
        self.as_of = Some(timestamp);

        match self.symbols.get_mut(event.symbol()) {
            Some(snap) if snap.as_of.date() == timestamp.date() => {
                snap.last_price = price;
                snap.day_high = snap.day_high.max(high);
                snap.day_low = snap.day_low.min(low);
                snap.as_of = timestamp;
            }
            Some(snap) => {
                snap.prev_close = Some(snap.last_price);
                snap.day_open = event.open_price();
                snap.day_high = high;
                snap.day_low = low;
                snap.last_price = price;
                snap.as_of = timestamp;
            }
            None => {
                self.symbols.insert(
                    event.symbol().to_string(),
                    SymbolSnapshot {
                        last_price: price,
                        day_open: event.open_price(),
                        day_high: high,
                        day_low: low,
                        prev_close: None,
                        as_of: timestamp,
                    },
                );
            }
        }
    }

    pub fn latest_price(&self, symbol: &str) -> Option<Decimal> {
        self.symbols.get(symbol).map(|s| s.last_price)
    }

    pub fn snapshot(&self, symbol: &str) -> Option<&SymbolSnapshot> {
        self.symbols.get(symbol)
    }

    /// Timestamp of the latest event, any symbol.
    pub fn as_of(&self) -> Option<NaiveDateTime> {
        self.as_of
    }

    pub fn trading_date(&self) -> Option<NaiveDate> {
        self.as_of.map(|t| t.date())
    }

    /// First observed open and last observed close of the episode.
    pub fn origin(&self) -> Option<(Decimal, Decimal)> {
        Some((self.first_open?, self.last_close?))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::test_support::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_tracks_day_extremes_and_prev_close() {
        let mut state = MarketState::new();
        state.update(&minute_event(bar("600000", ts(1, 9, 31), dec!(10), dec!(10.3), dec!(9.9), dec!(10.2), dec!(1))));
        state.update(&minute_event(bar("600000", ts(1, 15, 0), dec!(10.2), dec!(10.5), dec!(10.1), dec!(10.4), dec!(1))));

        let snap = state.snapshot("600000").unwrap();
        assert_eq!(snap.day_open, dec!(10));
        assert_eq!(snap.day_high, dec!(10.5));
        assert_eq!(snap.day_low, dec!(9.9));
        assert_eq!(snap.prev_close, None);

        state.update(&minute_event(flat_bar("600000", ts(4, 9, 31), dec!(10.6))));
        let snap = state.snapshot("600000").unwrap();
        assert_eq!(snap.prev_close, Some(dec!(10.4)));
        assert_eq!(snap.day_open, dec!(10.6));
        assert_eq!(state.latest_price("600000"), Some(dec!(10.6)));
        assert_eq!(state.origin(), Some((dec!(10), dec!(10.6))));
    }

    #[test]
    fn test_reset_clears_snapshot() {
        let mut state = MarketState::new();
        state.update(&minute_event(flat_bar("600000", ts(1, 9, 31), dec!(10))));
        state.reset();
        assert!(state.latest_price("600000").is_none());
        assert!(state.origin().is_none());
        assert!(state.as_of().is_none());
    }
}
