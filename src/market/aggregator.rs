//! Bar synthesis from ticks and finer bars.
//!
//! An aggregator owns one working bar for one symbol at one target timeframe.
//! The working bar closes at the first interval boundary at or after its
//! first sample; a later sample past that boundary completes it and starts
//! the next one.

use super::{Bar, MarketEvent, Timeframe};
use crate::error::{ReplayError, ReplayResult};
use chrono::{DateTime, NaiveDateTime, Timelike};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, warn};

struct WorkingBar {
    bar: Bar,
    /// Timestamp after which samples belong to the next bar.
    boundary: NaiveDateTime,
    samples: u32,
}

/// Folds samples of one symbol into bars of one timeframe.
pub struct BarAggregator {
    symbol: String,
    timeframe: Timeframe,
    working: Option<WorkingBar>,
    last_sample: Option<NaiveDateTime>,
    /// Previous cumulative tick volume, for per-bar deltas.
    last_cumulative_volume: Option<Decimal>,
    dropped: u64,
}

impl BarAggregator {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            working: None,
            last_sample: None,
            last_cumulative_volume: None,
            dropped: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Number of samples rejected as invalid or out of order.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of samples folded into the bar currently being built.
    pub fn working_samples(&self) -> u32 {
        self.working.as_ref().map(|w| w.samples).unwrap_or(0)
    }

    /// Feed one sample, returning a completed bar when a boundary is crossed.
    ///
    /// Invalid samples are logged, counted and dropped.
    pub fn push(&mut self, event: &MarketEvent) -> Option<Bar> {
        match self.try_push(event) {
            Ok(completed) => completed,
            Err(e) => {
                self.dropped += 1;
                warn!(symbol = %self.symbol, timeframe = %self.timeframe, "Dropping sample: {}", e);
                None
            }
        }
    }

    /// Like [`push`](Self::push) but surfaces rejected samples as `InvalidBar`.
    pub fn try_push(&mut self, event: &MarketEvent) -> ReplayResult<Option<Bar>> {
        let timestamp = event.timestamp();

        if event.symbol() != self.symbol {
            return Err(ReplayError::InvalidBar {
                symbol: event.symbol().to_string(),
                timestamp,
                reason: format!("routed to aggregator for {}", self.symbol),
            });
        }

        if let Some(last) = self.last_sample {
            if timestamp < last {
                return Err(ReplayError::InvalidBar {
                    symbol: self.symbol.clone(),
                    timestamp,
                    reason: format!("out of order, previous sample at {}", last),
                });
            }
        }

        let sample = self.sample_from(event)?;
        self.last_sample = Some(timestamp);

        let crosses = self
            .working
            .as_ref()
            .map(|w| self.past_boundary(w, timestamp))
            .unwrap_or(false);
        let completed = if crosses { self.take_completed() } else { None };
        let boundary = self.boundary_for(timestamp);

        match self.working.as_mut() {
            Some(w) => {
                w.bar.high = w.bar.high.max(sample.high);
                w.bar.low = w.bar.low.min(sample.low);
                w.bar.close = sample.close;
                w.bar.volume += sample.volume;
                w.bar.open_interest = sample.open_interest;
                w.samples += 1;
                if self.timeframe == Timeframe::Daily {
                    w.bar.timestamp = timestamp;
                }
            }
            None => {
                let mut bar = sample;
                bar.timestamp = match self.timeframe {
                    Timeframe::Daily => timestamp,
                    Timeframe::Minutes(_) => boundary,
                };
                self.working = Some(WorkingBar {
                    bar,
                    boundary,
                    samples: 1,
                });
            }
        }

        Ok(completed)
    }

    /// Close and return the in-progress bar without waiting for a new sample.
    pub fn flush(&mut self) -> Option<Bar> {
        self.take_completed()
    }

    /// Drop all state, as at construction.
    pub fn reset(&mut self) {
        self.working = None;
        self.last_sample = None;
        self.last_cumulative_volume = None;
        self.dropped = 0;
    }

    fn take_completed(&mut self) -> Option<Bar> {
        let working = self.working.take()?;
        debug!(
            symbol = %self.symbol,
            timeframe = %self.timeframe,
            samples = working.samples,
            "Bar completed at {}",
            working.bar.timestamp
        );
        Some(working.bar)
    }

    fn past_boundary(&self, working: &WorkingBar, timestamp: NaiveDateTime) -> bool {
        match self.timeframe {
            Timeframe::Daily => timestamp.date() > working.boundary.date(),
            Timeframe::Minutes(_) => timestamp > working.boundary,
        }
    }

    fn boundary_for(&self, timestamp: NaiveDateTime) -> NaiveDateTime {
        match self.timeframe {
            Timeframe::Daily => timestamp,
            Timeframe::Minutes(minutes) => ceil_to_interval(timestamp, minutes),
        }
    }

    /// Normalize an event into a one-sample bar.
    fn sample_from(&mut self, event: &MarketEvent) -> ReplayResult<Bar> {
        match event {
            MarketEvent::Bar { bar, .. } => {
                bar.validate()?;
                Ok(bar.clone())
            }
            MarketEvent::Tick(tick) => {
                if tick.price <= Decimal::ZERO {
                    return Err(ReplayError::InvalidBar {
                        symbol: tick.symbol.clone(),
                        timestamp: tick.timestamp,
                        reason: format!("non-positive tick price {}", tick.price),
                    });
                }
                // Cumulative volume can restart at session open; clamp the delta.
                let volume = match self.last_cumulative_volume {
                    Some(previous) => (tick.volume - previous).max(Decimal::ZERO),
                    None => Decimal::ZERO,
                };
                self.last_cumulative_volume = Some(tick.volume);

                Ok(Bar {
                    symbol: tick.symbol.clone(),
                    exchange: tick.exchange.clone(),
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                    volume,
                    open_interest: tick.open_interest,
                    timestamp: tick.timestamp,
                })
            }
        }
    }
}

/// First multiple of `minutes` at or after `timestamp`.
fn ceil_to_interval(timestamp: NaiveDateTime, minutes: u32) -> NaiveDateTime {
    let span = i64::from(minutes.max(1)) * 60;
    let secs = timestamp.and_utc().timestamp();
    let rem = secs.rem_euclid(span);
    let aligned = rem == 0 && timestamp.nanosecond() == 0;
    let boundary = if aligned { secs } else { secs - rem + span };
    DateTime::from_timestamp(boundary, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or(timestamp)
}

/// Aggregators for every (symbol, timeframe) pair seen by an episode.
#[derive(Default)]
pub struct AggregatorSet {
    aggregators: BTreeMap<(String, u32), BarAggregator>,
}

impl AggregatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a sample to the aggregator for its symbol at `timeframe`.
    pub fn push(&mut self, event: &MarketEvent, timeframe: Timeframe) -> Option<Bar> {
        let key = (event.symbol().to_string(), timeframe.minutes());
        self.aggregators
            .entry(key)
            .or_insert_with(|| BarAggregator::new(event.symbol(), timeframe))
            .push(event)
    }

    /// Flush every working bar, in symbol order.
    pub fn flush_all(&mut self) -> Vec<(Timeframe, Bar)> {
        self.aggregators
            .values_mut()
            .filter_map(|agg| {
                let timeframe = agg.timeframe();
                agg.flush().map(|bar| (timeframe, bar))
            })
            .collect()
    }

    pub fn dropped(&self) -> u64 {
        self.aggregators.values().map(|a| a.dropped()).sum()
    }

    pub fn reset(&mut self) {
        self.aggregators.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::test_support::*;
    use crate::market::{BookLevel, Tick};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    /// 30 end-stamped minute bars 09:31..10:00 with a zig-zag price path.
    fn half_hour_of_minutes() -> Vec<MarketEvent> {
        (1..=30)
            .map(|i| {
                let base = dec!(10) + Decimal::from(i % 7) * dec!(0.01);
                let b = bar(
                    "600000",
                    ts(1, 9, 30) + Duration::minutes(i),
                    base,
                    base + dec!(0.05),
                    base - dec!(0.03),
                    base + dec!(0.02),
                    Decimal::from(100 * i),
                );
                minute_event(b)
            })
            .collect()
    }

    fn tick(second_offset: i64, price: Decimal, cumulative: Decimal) -> MarketEvent {
        let at = ts(1, 9, 30) + Duration::seconds(second_offset);
        MarketEvent::Tick(Tick::with_quote(
            "600000",
            at,
            price,
            cumulative,
            BookLevel { price: price - dec!(0.01), size: dec!(100) },
            BookLevel { price: price + dec!(0.01), size: dec!(100) },
        ))
    }

    // =========================================================================
    // Minute Bar Aggregation Tests
    // =========================================================================

    #[test]
    fn test_five_minute_aggregation_yields_six_bars() {
        let events = half_hour_of_minutes();
        let mut agg = BarAggregator::new("600000", Timeframe::Minutes(5));

        let mut bars: Vec<Bar> = events.iter().filter_map(|e| agg.push(e)).collect();
        assert_eq!(bars.len(), 5);
        assert_eq!(agg.working_samples(), 5);
        bars.extend(agg.flush());
        assert_eq!(bars.len(), 6);

        for (k, out) in bars.iter().enumerate() {
            let group: Vec<&Bar> = events[k * 5..(k + 1) * 5]
                .iter()
                .map(|e| match e {
                    MarketEvent::Bar { bar, .. } => bar,
                    MarketEvent::Tick(_) => unreachable!(),
                })
                .collect();

            let high = group.iter().map(|b| b.high).max().unwrap();
            let low = group.iter().map(|b| b.low).min().unwrap();
            let volume: Decimal = group.iter().map(|b| b.volume).sum();

            assert_eq!(out.high, high);
            assert_eq!(out.low, low);
            assert_eq!(out.volume, volume);
            assert_eq!(out.open, group[0].open);
            assert_eq!(out.close, group[4].close);
            assert_eq!(out.timestamp, ts(1, 9, 35) + Duration::minutes(5 * k as i64));
        }
    }

    #[test]
    fn test_aligned_open_sample_forms_its_own_bar() {
        // Bars cover (boundary - 5m, boundary]; a sample stamped exactly 09:30
        // closes the 09:30 bar on its own, then 09:31..10:00 yield six more.
        let open = minute_event(flat_bar("600000", ts(1, 9, 30), dec!(9.98)));
        let mut events = vec![open];
        events.extend(half_hour_of_minutes());
        let mut agg = BarAggregator::new("600000", Timeframe::Minutes(5));

        let mut bars: Vec<Bar> = events.iter().filter_map(|e| agg.push(e)).collect();
        bars.extend(agg.flush());

        assert_eq!(bars.len(), 7);
        assert_eq!(bars[0].timestamp, ts(1, 9, 30));
        assert_eq!(bars[0].open, dec!(9.98));
        assert_eq!(bars[0].close, dec!(9.98));
        assert_eq!(bars[1].timestamp, ts(1, 9, 35));
        assert_eq!(bars[6].timestamp, ts(1, 10, 0));
    }

    #[test]
    fn test_sample_past_boundary_starts_next_bar() {
        let mut agg = BarAggregator::new("600000", Timeframe::Minutes(5));
        let first = minute_event(flat_bar("600000", ts(1, 9, 33), dec!(10)));
        let second = minute_event(flat_bar("600000", ts(1, 9, 36), dec!(11)));

        assert!(agg.push(&first).is_none());
        let done = agg.push(&second).unwrap();
        assert_eq!(done.close, dec!(10));
        assert_eq!(done.timestamp, ts(1, 9, 35));

        // The sample that crossed the boundary opens the next bar
        let next = agg.flush().unwrap();
        assert_eq!(next.open, dec!(11));
        assert_eq!(next.timestamp, ts(1, 9, 40));
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_daily_aggregation_closes_on_date_change() {
        let mut agg = BarAggregator::new("600000", Timeframe::Daily);
        let day_one = [
            bar("600000", ts(1, 9, 31), dec!(10), dec!(10.4), dec!(9.9), dec!(10.1), dec!(10)),
            bar("600000", ts(1, 15, 0), dec!(10.1), dec!(10.2), dec!(9.7), dec!(9.8), dec!(20)),
        ];
        for b in day_one {
            assert!(agg.push(&minute_event(b)).is_none());
        }

        let daily = agg
            .push(&minute_event(flat_bar("600000", ts(4, 9, 31), dec!(9.9))))
            .unwrap();
        assert_eq!(daily.open, dec!(10));
        assert_eq!(daily.high, dec!(10.4));
        assert_eq!(daily.low, dec!(9.7));
        assert_eq!(daily.close, dec!(9.8));
        assert_eq!(daily.volume, dec!(30));
        assert_eq!(daily.timestamp, ts(1, 15, 0));
    }

    // =========================================================================
    // Tick Aggregation Tests
    // =========================================================================

    #[test]
    fn test_tick_volume_uses_clamped_deltas() {
        let mut agg = BarAggregator::new("600000", Timeframe::MINUTE);

        assert!(agg.push(&tick(5, dec!(10.00), dec!(1000))).is_none());
        assert!(agg.push(&tick(30, dec!(10.08), dec!(1150))).is_none());
        assert!(agg.push(&tick(45, dec!(9.95), dec!(1200))).is_none());

        let minute = agg.push(&tick(70, dec!(10.02), dec!(900))).unwrap();
        assert_eq!(minute.timestamp, ts(1, 9, 31));
        assert_eq!(minute.open, dec!(10.00));
        assert_eq!(minute.high, dec!(10.08));
        assert_eq!(minute.low, dec!(9.95));
        assert_eq!(minute.close, dec!(9.95));
        // First tick contributes nothing; 150 + 50 afterwards
        assert_eq!(minute.volume, dec!(200));

        // Cumulative volume went backwards: clamped to zero
        let next = agg.flush().unwrap();
        assert_eq!(next.volume, dec!(0));
        assert_eq!(next.timestamp, ts(1, 9, 32));
    }

    // =========================================================================
    // Invalid Sample Tests
    // =========================================================================

    #[test]
    fn test_invalid_and_out_of_order_samples_are_dropped() {
        let mut agg = BarAggregator::new("600000", Timeframe::Minutes(5));
        assert!(agg.push(&minute_event(flat_bar("600000", ts(1, 9, 32), dec!(10)))).is_none());

        let inverted = bar("600000", ts(1, 9, 33), dec!(10), dec!(9), dec!(11), dec!(10), dec!(1));
        assert!(agg.push(&minute_event(inverted)).is_none());

        let stale = flat_bar("600000", ts(1, 9, 31), dec!(50));
        assert!(matches!(
            agg.try_push(&minute_event(stale)),
            Err(ReplayError::InvalidBar { .. })
        ));
        assert!(agg.push(&minute_event(flat_bar("600000", ts(1, 9, 30), dec!(50)))).is_none());

        assert_eq!(agg.dropped(), 2);
        let out = agg.flush().unwrap();
        assert_eq!(out.high, dec!(10));
        assert_eq!(out.low, dec!(10));
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut agg = BarAggregator::new("600000", Timeframe::Minutes(5));
        agg.push(&minute_event(flat_bar("600000", ts(1, 9, 40), dec!(10))));
        agg.reset();
        assert!(agg.flush().is_none());
        // Earlier timestamps are accepted again after reset
        assert!(agg.push(&minute_event(flat_bar("600000", ts(1, 9, 31), dec!(10)))).is_none());
        assert_eq!(agg.dropped(), 0);
    }

    #[test]
    fn test_aggregator_set_keeps_symbols_apart() {
        let mut set = AggregatorSet::new();
        let tf = Timeframe::Minutes(5);
        set.push(&minute_event(flat_bar("600000", ts(1, 9, 31), dec!(10))), tf);
        set.push(&minute_event(flat_bar("000001", ts(1, 9, 31), dec!(20))), tf);
        set.push(&minute_event(flat_bar("600000", ts(1, 9, 32), dec!(11))), tf);

        let flushed = set.flush_all();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].1.symbol, "000001");
        assert_eq!(flushed[1].1.high, dec!(11));
        assert!(set.flush_all().is_empty());
    }
}
