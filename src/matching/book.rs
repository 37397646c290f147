//! Resting orders, kept in arrival order per symbol.

use super::{Order, OrderSide, OrderStatus};
use crate::error::{ReplayError, ReplayResult};
use crate::utils::OrderId;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};

/// Per-symbol FIFO of active orders plus the terminal orders not yet reported.
#[derive(Debug, Default)]
pub struct OrderBook {
    resting: BTreeMap<String, VecDeque<Order>>,
    finished: Vec<Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an active order to the back of its symbol's queue.
    pub fn add(&mut self, order: Order) {
        self.resting
            .entry(order.symbol.clone())
            .or_default()
            .push_back(order);
    }

    /// Park a terminal order (rejected at submission) for notification.
    pub fn add_finished(&mut self, order: Order) {
        self.finished.push(order);
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.resting.values().flat_map(|q| q.iter()).find(|o| o.id == id)
    }

    pub fn orders_for(&self, symbol: &str) -> impl Iterator<Item = &Order> {
        self.resting.get(symbol).into_iter().flat_map(|q| q.iter())
    }

    pub(crate) fn queue_mut(&mut self, symbol: &str) -> Option<&mut VecDeque<Order>> {
        self.resting.get_mut(symbol)
    }

    /// Cancel one active order.
    pub fn cancel(&mut self, id: OrderId, at: NaiveDateTime) -> ReplayResult<Order> {
        for queue in self.resting.values_mut() {
            if let Some(pos) = queue.iter().position(|o| o.id == id) {
                if let Some(mut order) = queue.remove(pos) {
                    order.status = OrderStatus::Cancelled;
                    order.updated_time = at;
                    self.finished.push(order.clone());
                    return Ok(order);
                }
            }
        }
        Err(ReplayError::OrderNotFound(id.to_string()))
    }

    /// Cancel every active order, in symbol then arrival order.
    pub fn cancel_all(&mut self, at: NaiveDateTime) -> Vec<Order> {
        let mut cancelled = Vec::new();
        for (_, queue) in std::mem::take(&mut self.resting) {
            for mut order in queue {
                order.status = OrderStatus::Cancelled;
                order.updated_time = at;
                cancelled.push(order);
            }
        }
        self.finished.extend(cancelled.iter().cloned());
        cancelled
    }

    /// Move terminal orders of `symbol` out of its queue, keeping FIFO order of the rest.
    pub(crate) fn sweep_terminal(&mut self, symbol: &str) {
        if let Some(queue) = self.resting.get_mut(symbol) {
            let (done, active): (VecDeque<Order>, VecDeque<Order>) =
                queue.drain(..).partition(|o| o.status.is_terminal());
            *queue = active;
            self.finished.extend(done);
            if queue.is_empty() {
                self.resting.remove(symbol);
            }
        }
    }

    /// Terminal orders since the last drain, in the order they finished.
    pub fn drain_finished(&mut self) -> Vec<Order> {
        std::mem::take(&mut self.finished)
    }

    /// Unfilled volume of active orders on one side of a symbol.
    pub fn committed_volume(&self, symbol: &str, side: OrderSide) -> Decimal {
        self.orders_for(symbol)
            .filter(|o| o.side == side)
            .map(|o| o.remaining())
            .sum()
    }

    /// Unfilled buy notional across all symbols, at each order's price.
    pub fn committed_buy_notional(&self) -> Decimal {
        self.resting
            .values()
            .flat_map(|q| q.iter())
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.remaining() * o.price)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.resting.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.resting.clear();
        self.finished.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::test_support::ts;
    use crate::matching::PlaceOrder;
    use rust_decimal_macros::dec;

    fn order(id: u64, symbol: &str, side: OrderSide, price: Decimal, volume: Decimal) -> Order {
        Order::new(OrderId(id), &PlaceOrder::limit(symbol, side, price, volume), ts(1, 9, 31))
    }

    #[test]
    fn test_fifo_and_commitments() {
        let mut book = OrderBook::new();
        book.add(order(1, "600000", OrderSide::Buy, dec!(10), dec!(100)));
        book.add(order(2, "600000", OrderSide::Sell, dec!(11), dec!(200)));
        book.add(order(3, "600000", OrderSide::Buy, dec!(9.9), dec!(300)));
        book.add(order(4, "000001", OrderSide::Buy, dec!(20), dec!(100)));

        let ids: Vec<u64> = book.orders_for("600000").map(|o| o.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(book.committed_volume("600000", OrderSide::Buy), dec!(400));
        assert_eq!(book.committed_volume("600000", OrderSide::Sell), dec!(200));
        assert_eq!(book.committed_buy_notional(), dec!(1000) + dec!(2970) + dec!(2000));
        assert_eq!(book.len(), 4);
    }

    #[test]
    fn test_cancel_moves_order_to_finished() {
        let mut book = OrderBook::new();
        book.add(order(1, "600000", OrderSide::Buy, dec!(10), dec!(100)));

        let cancelled = book.cancel(OrderId(1), ts(1, 10, 0)).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(book.is_empty());
        assert!(matches!(
            book.cancel(OrderId(1), ts(1, 10, 0)),
            Err(ReplayError::OrderNotFound(_))
        ));

        let finished = book.drain_finished();
        assert_eq!(finished.len(), 1);
        assert!(book.drain_finished().is_empty());
    }

    #[test]
    fn test_cancel_all_and_sweep() {
        let mut book = OrderBook::new();
        book.add(order(1, "600000", OrderSide::Buy, dec!(10), dec!(100)));
        book.add(order(2, "600000", OrderSide::Buy, dec!(10), dec!(100)));

        if let Some(queue) = book.queue_mut("600000") {
            queue[0].record_fill(dec!(100), ts(1, 9, 32));
        }
        book.sweep_terminal("600000");
        assert_eq!(book.len(), 1);
        assert_eq!(book.drain_finished()[0].status, OrderStatus::Filled);

        let cancelled = book.cancel_all(ts(1, 15, 0));
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, OrderId(2));
        assert!(book.is_empty());
    }
}
