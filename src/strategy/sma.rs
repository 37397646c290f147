//! Moving-average cross trader.

use super::OrderIntentSource;
use crate::backtest::StepView;
use crate::config::StrategyConfig;
use crate::matching::{OrderCommand, OrderSide, PlaceOrder};
use crate::utils::round_down_to_lot;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct SymbolWindow {
    closes: VecDeque<Decimal>,
    /// fast minus slow at the previous step
    last_spread: Option<Decimal>,
}

/// Buys when the fast average crosses above the slow one, sells on the
/// opposite cross.
///
/// Entries are sized by available buying power, capped at `order_lots`
/// lots, and placed as limits at the latest close.
#[derive(Debug, Clone)]
pub struct SmaCrossTrader {
    fast_period: usize,
    slow_period: usize,
    max_volume: Decimal,
    lot_size: Decimal,
    windows: HashMap<String, SymbolWindow>,
}

impl SmaCrossTrader {
    pub fn new(fast_period: u32, slow_period: u32, order_lots: u32, lot_size: Decimal) -> Self {
        let fast_period = fast_period.max(1) as usize;
        Self {
            fast_period,
            slow_period: (slow_period as usize).max(fast_period + 1),
            max_volume: Decimal::from(order_lots) * lot_size,
            lot_size,
            windows: HashMap::new(),
        }
    }

    pub fn from_config(config: &StrategyConfig, lot_size: Decimal) -> Self {
        Self::new(config.fast_period, config.slow_period, config.order_lots, lot_size)
    }

    fn average(closes: &VecDeque<Decimal>, period: usize) -> Decimal {
        let sum: Decimal = closes.iter().rev().take(period).sum();
        sum / Decimal::from(period)
    }
}

impl OrderIntentSource for SmaCrossTrader {
    fn on_step(&mut self, view: &StepView<'_>) -> Vec<OrderCommand> {
        let symbol = view.event.symbol();
        let close = view.event.price();
        if close <= Decimal::ZERO {
            return Vec::new();
        }

        let window = self.windows.entry(symbol.to_string()).or_default();
        window.closes.push_back(close);
        while window.closes.len() > self.slow_period {
            window.closes.pop_front();
        }
        if window.closes.len() < self.slow_period {
            return Vec::new();
        }

        let spread = Self::average(&window.closes, self.fast_period)
            - Self::average(&window.closes, self.slow_period);
        let previous = window.last_spread.replace(spread);
        let Some(previous) = previous else {
            return Vec::new();
        };
        if view.in_warmup || view.book.orders_for(symbol).next().is_some() {
            return Vec::new();
        }

        let held = view
            .ledger
            .position(symbol)
            .map(|p| p.available_quantity)
            .unwrap_or(Decimal::ZERO);

        if previous <= Decimal::ZERO && spread > Decimal::ZERO && held == Decimal::ZERO {
            let affordable = view.ledger.max_buy_volume(symbol, close);
            let volume = round_down_to_lot(affordable.min(self.max_volume), self.lot_size);
            if volume > Decimal::ZERO {
                debug!(%symbol, %close, %volume, "Golden cross, buying");
                return vec![OrderCommand::Place(PlaceOrder::limit(
                    symbol,
                    OrderSide::Buy,
                    close,
                    volume,
                ))];
            }
        } else if previous >= Decimal::ZERO && spread < Decimal::ZERO && held > Decimal::ZERO {
            debug!(%symbol, %close, volume = %held, "Death cross, selling");
            return vec![OrderCommand::Place(PlaceOrder::limit(
                symbol,
                OrderSide::Sell,
                close,
                held,
            ))];
        }
        Vec::new()
    }

    fn reset(&mut self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;
    use crate::ledger::{fee_model_from_config, InstrumentLedger};
    use crate::market::test_support::*;
    use crate::market::MarketState;
    use crate::matching::OrderBook;
    use rust_decimal_macros::dec;

    fn feed(trader: &mut SmaCrossTrader, ledger: &InstrumentLedger, prices: &[Decimal]) -> Vec<OrderCommand> {
        let market = MarketState::new();
        let book = OrderBook::new();
        let mut commands = Vec::new();
        for (i, price) in prices.iter().enumerate() {
            let event = minute_event(flat_bar("000001", ts(1, 10, i as u32), *price));
            let view = StepView {
                event: &event,
                market: &market,
                ledger,
                book: &book,
                in_warmup: false,
            };
            commands.extend(trader.on_step(&view));
        }
        commands
    }

    #[test]
    fn test_golden_cross_buys_capped_lots() {
        let ledger = InstrumentLedger::new(
            fee_model_from_config(&AccountConfig::default()),
            dec!(100000),
            dec!(100),
        );
        let mut trader = SmaCrossTrader::new(2, 3, 10, dec!(100));
        let commands = feed(&mut trader, &ledger, &[dec!(10), dec!(10), dec!(10), dec!(11)]);

        assert_eq!(commands.len(), 1);
        match &commands[0] {
            OrderCommand::Place(order) => {
                assert_eq!(order.side, OrderSide::Buy);
                assert_eq!(order.price, dec!(11));
                assert_eq!(order.volume, dec!(1000));
            }
            OrderCommand::Cancel(_) => panic!("expected a placement"),
        }
    }

    #[test]
    fn test_no_signal_without_position_on_death_cross() {
        let ledger = InstrumentLedger::new(
            fee_model_from_config(&AccountConfig::default()),
            dec!(100000),
            dec!(100),
        );
        let mut trader = SmaCrossTrader::new(2, 3, 10, dec!(100));
        let commands = feed(&mut trader, &ledger, &[dec!(10), dec!(10), dec!(10), dec!(9)]);
        assert!(commands.is_empty());

        trader.reset();
        assert!(trader.windows.is_empty());
    }
}
