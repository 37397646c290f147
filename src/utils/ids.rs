//! Episode-scoped identifiers for orders and trades.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an order, unique within one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

/// Identifier of a trade, unique within one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{:06}", self.0)
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:06}", self.0)
    }
}

/// Monotonic id source owned by the episode controller.
///
/// Restarting an episode resets both counters, so two replays of the same
/// window hand out identical ids.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    next_order: u64,
    next_trade: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_order_id(&mut self) -> OrderId {
        self.next_order += 1;
        OrderId(self.next_order)
    }

    pub fn next_trade_id(&mut self) -> TradeId {
        self.next_trade += 1;
        TradeId(self.next_trade)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_resettable() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next_order_id(), OrderId(1));
        assert_eq!(ids.next_order_id(), OrderId(2));
        assert_eq!(ids.next_trade_id(), TradeId(1));

        ids.reset();
        assert_eq!(ids.next_order_id(), OrderId(1));
        assert_eq!(ids.next_trade_id().to_string(), "T000001");
    }
}
