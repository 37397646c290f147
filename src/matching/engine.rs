//! Order matching against replayed prices.
//!
//! Each observation is reduced to [`CrossPrices`]; resting orders of the
//! observed symbol are then walked in arrival order. A buy crosses when its
//! limit reaches the buy-side cross price and fills at the better of its
//! limit and the observation's best price; sells mirror this.

use super::{MarketRules, Order, OrderKind, OrderSide, PlaceOrder, StopState, Trade};
use crate::error::ReplayResult;
use crate::ledger::FeeModel;
use crate::market::MarketEvent;
use crate::utils::{round_price, IdGenerator, OrderId};
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::debug;

/// Crossable prices derived from one observation. Zero disables a side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossPrices {
    pub buy_cross: Decimal,
    pub sell_cross: Decimal,
    pub buy_best: Decimal,
    pub sell_best: Decimal,
    /// Highest and lowest traded price, for stop triggers.
    pub high: Decimal,
    pub low: Decimal,
    /// Volume available to each side when fills are capped.
    pub buy_liquidity: Decimal,
    pub sell_liquidity: Decimal,
}

impl CrossPrices {
    pub fn from_event(event: &MarketEvent, rules: &MarketRules) -> Self {
        match event {
            MarketEvent::Tick(tick) => {
                let ask = tick.best_ask();
                let bid = tick.best_bid();
                Self {
                    buy_cross: ask.price,
                    sell_cross: bid.price,
                    buy_best: ask.price,
                    sell_best: bid.price,
                    high: tick.price,
                    low: tick.price,
                    buy_liquidity: ask.size,
                    sell_liquidity: bid.size,
                }
            }
            MarketEvent::Bar { bar, .. } => {
                let best = round_price(((bar.open + bar.close) * dec!(4) + bar.high + bar.low) / dec!(10), 2);
                let mut cross = Self {
                    buy_cross: bar.low,
                    sell_cross: bar.high,
                    buy_best: best,
                    sell_best: best,
                    high: bar.high,
                    low: bar.low,
                    buy_liquidity: bar.volume,
                    sell_liquidity: bar.volume,
                };

                if let Some(limit_pct) = rules.price_limit_pct {
                    let band = limit_pct / dec!(100);
                    // Locked at limit-up nobody sells; locked at limit-down nobody buys.
                    if bar.close >= bar.open * (Decimal::ONE + band) {
                        cross.buy_cross = Decimal::ZERO;
                    }
                    if bar.close <= bar.open * (Decimal::ONE - band) {
                        cross.sell_cross = Decimal::ZERO;
                    }
                }
                cross
            }
        }
    }

    /// Execution price for `order` if it crosses, `None` otherwise.
    fn fill_price(&self, order: &Order) -> Option<Decimal> {
        match (order.side, order.kind) {
            (OrderSide::Buy, OrderKind::Limit) => {
                (self.buy_cross > Decimal::ZERO && order.price >= self.buy_cross)
                    .then(|| order.price.min(self.buy_best))
            }
            (OrderSide::Sell, OrderKind::Limit) => {
                (self.sell_cross > Decimal::ZERO && order.price <= self.sell_cross)
                    .then(|| order.price.max(self.sell_best))
            }
            // Triggered stops trade as market orders, never better than the trigger.
            (OrderSide::Buy, OrderKind::Stop) => {
                (self.buy_cross > Decimal::ZERO).then(|| order.price.max(self.buy_best))
            }
            (OrderSide::Sell, OrderKind::Stop) => {
                (self.sell_cross > Decimal::ZERO).then(|| order.price.min(self.sell_best))
            }
        }
    }

    fn stop_triggered(&self, order: &Order) -> bool {
        match order.side {
            OrderSide::Buy => self.high > Decimal::ZERO && self.high >= order.price,
            OrderSide::Sell => self.low > Decimal::ZERO && self.low <= order.price,
        }
    }
}

/// Holds order state only; cash and positions belong to the ledger.
#[derive(Debug)]
pub struct MatchingEngine {
    book: super::OrderBook,
    fees: Arc<dyn FeeModel>,
    rules: MarketRules,
    cap_fills_to_volume: bool,
}

impl MatchingEngine {
    pub fn new(fees: Arc<dyn FeeModel>, rules: MarketRules) -> Self {
        Self {
            book: super::OrderBook::new(),
            fees,
            rules,
            cap_fills_to_volume: false,
        }
    }

    /// Cap the volume filled per observation by its traded or quoted size.
    pub fn with_volume_cap(mut self, enabled: bool) -> Self {
        self.cap_fills_to_volume = enabled;
        self
    }

    pub fn rules(&self) -> &MarketRules {
        &self.rules
    }

    pub fn book(&self) -> &super::OrderBook {
        &self.book
    }

    /// Accept a new resting order.
    pub fn submit(&mut self, id: OrderId, request: &PlaceOrder, at: NaiveDateTime) -> Order {
        let order = Order::new(id, request, at);
        debug!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = %order.side,
            price = %order.price,
            volume = %order.total_volume,
            "Order accepted"
        );
        self.book.add(order.clone());
        order
    }

    /// Record an order that was refused before reaching the book.
    pub fn reject(&mut self, id: OrderId, request: &PlaceOrder, at: NaiveDateTime, reason: &str) -> Order {
        let mut order = Order::new(id, request, at);
        order.reject(reason, at);
        self.book.add_finished(order.clone());
        order
    }

    pub fn cancel(&mut self, id: OrderId, at: NaiveDateTime) -> ReplayResult<Order> {
        self.book.cancel(id, at)
    }

    pub fn cancel_all(&mut self, at: NaiveDateTime) -> Vec<Order> {
        self.book.cancel_all(at)
    }

    /// Orders that reached a terminal state since the last call.
    pub fn drain_finished(&mut self) -> Vec<Order> {
        self.book.drain_finished()
    }

    /// Match without a fill gate.
    pub fn on_price_observation(&mut self, event: &MarketEvent, ids: &mut IdGenerator) -> Vec<Trade> {
        self.match_with(event, ids, |_| Ok(())).unwrap_or_default()
    }

    /// Match resting orders of the event's symbol, passing each fill through `gate`.
    ///
    /// The gate books the fill elsewhere (the ledger). An order-rejection error
    /// from the gate rejects that order and matching continues; any other
    /// error stops matching and is returned.
    pub fn match_with<F>(
        &mut self,
        event: &MarketEvent,
        ids: &mut IdGenerator,
        mut gate: F,
    ) -> ReplayResult<Vec<Trade>>
    where
        F: FnMut(&Trade) -> ReplayResult<()>,
    {
        let symbol = event.symbol().to_string();
        let at = event.timestamp();
        let cross = CrossPrices::from_event(event, &self.rules);
        let mut buy_pool = cross.buy_liquidity;
        let mut sell_pool = cross.sell_liquidity;
        let mut trades = Vec::new();
        let mut failure = None;

        let fees = &self.fees;
        let capped = self.cap_fills_to_volume;
        let Some(queue) = self.book.queue_mut(&symbol) else {
            return Ok(trades);
        };

        for order in queue.iter_mut() {
            if order.stop_state == Some(StopState::Waiting) {
                if !cross.stop_triggered(order) {
                    continue;
                }
                order.stop_state = Some(StopState::Triggered);
                order.updated_time = at;
                debug!(order_id = %order.id, trigger = %order.price, "Stop triggered");
            }

            let Some(price) = cross.fill_price(order) else {
                continue;
            };

            let mut volume = order.remaining();
            if capped {
                let pool = match order.side {
                    OrderSide::Buy => &mut buy_pool,
                    OrderSide::Sell => &mut sell_pool,
                };
                volume = volume.min(*pool);
                if volume <= Decimal::ZERO {
                    continue;
                }
                *pool -= volume;
            }

            let cost = fees.assess(&symbol, order.side, price, volume);
            let trade = Trade {
                id: ids.next_trade_id(),
                order_id: Some(order.id),
                symbol: symbol.clone(),
                exchange: event.exchange().to_string(),
                side: order.side,
                price,
                volume,
                timestamp: at,
                commission: cost.commission,
                slippage: cost.slippage,
            };

            match gate(&trade) {
                Ok(()) => {
                    order.record_fill(volume, at);
                    debug!(
                        trade_id = %trade.id,
                        order_id = %order.id,
                        side = %trade.side,
                        price = %trade.price,
                        volume = %trade.volume,
                        "Order filled"
                    );
                    trades.push(trade);
                }
                Err(e) if e.is_order_rejection() => {
                    order.reject(e.to_string(), at);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.book.sweep_terminal(&symbol);
        match failure {
            Some(e) => Err(e),
            None => Ok(trades),
        }
    }

    /// Drop every order, as at construction.
    pub fn reset(&mut self) {
        self.book.clear();
    }
}
