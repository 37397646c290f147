//! Orders, fills and market rules for the simulated exchange.
//!
//! - `book`: per-symbol FIFO of resting orders
//! - `engine`: crosses resting orders against each price observation

pub mod book;
pub mod engine;

pub use book::OrderBook;
pub use engine::{CrossPrices, MatchingEngine};

use crate::config::MarketConfig;
use crate::utils::{OrderId, TradeId};
use chrono::{NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

/// Trigger state of a stop order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopState {
    Waiting,
    Triggered,
}

/// An order as tracked by the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Limit price for limit orders, trigger level for stops.
    pub price: Decimal,
    pub total_volume: Decimal,
    pub traded_volume: Decimal,
    pub status: OrderStatus,
    /// `Some` only for stop orders.
    pub stop_state: Option<StopState>,
    pub submit_time: NaiveDateTime,
    pub updated_time: NaiveDateTime,
    pub reject_reason: Option<String>,
}

impl Order {
    pub fn new(id: OrderId, request: &PlaceOrder, submit_time: NaiveDateTime) -> Self {
        Self {
            id,
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            price: request.price,
            total_volume: request.volume,
            traded_volume: Decimal::ZERO,
            status: OrderStatus::Submitted,
            stop_state: match request.kind {
                OrderKind::Stop => Some(StopState::Waiting),
                OrderKind::Limit => None,
            },
            submit_time,
            updated_time: submit_time,
            reject_reason: None,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.total_volume - self.traded_volume
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Mark the order terminally rejected.
    pub fn reject(&mut self, reason: impl Into<String>, at: NaiveDateTime) {
        self.status = OrderStatus::Rejected;
        self.reject_reason = Some(reason.into());
        self.updated_time = at;
    }

    /// Book a fill of `volume` and advance the status.
    pub(crate) fn record_fill(&mut self, volume: Decimal, at: NaiveDateTime) {
        self.traded_volume += volume;
        self.status = if self.traded_volume >= self.total_volume {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_time = at;
    }
}

/// An executed fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    /// `None` for liquidation fills synthesized at episode end.
    pub order_id: Option<OrderId>,
    pub symbol: String,
    pub exchange: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: NaiveDateTime,
    /// All fees: commission plus any taxes and transfer fees.
    pub commission: Decimal,
    pub slippage: Decimal,
}

/// Request to place a new order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Decimal,
    pub volume: Decimal,
}

impl PlaceOrder {
    pub fn limit(symbol: &str, side: OrderSide, price: Decimal, volume: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Limit,
            price,
            volume,
        }
    }

    pub fn stop(symbol: &str, side: OrderSide, trigger: Decimal, volume: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Stop,
            price: trigger,
            volume,
        }
    }
}

/// Request to cancel a resting order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
}

/// Commands an order intent source may issue between steps.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderCommand {
    Place(PlaceOrder),
    Cancel(CancelOrder),
}

/// Exchange rules that shape matching and order acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketRules {
    /// Daily price limit in percent; a bar closing at the limit locks that side.
    pub price_limit_pct: Option<Decimal>,
    /// New orders at or after this time of day are rejected.
    pub order_cutoff: Option<NaiveTime>,
    /// Whether resting orders survive the day rollover.
    pub carry_orders_overnight: bool,
}

impl MarketRules {
    /// Shanghai/Shenzhen main board.
    pub fn a_share() -> Self {
        Self {
            price_limit_pct: Some(Decimal::TEN),
            order_cutoff: NaiveTime::from_hms_opt(14, 58, 0),
            carry_orders_overnight: false,
        }
    }

    /// Market without price limits that keeps orders overnight.
    pub fn generic() -> Self {
        Self {
            price_limit_pct: None,
            order_cutoff: NaiveTime::from_hms_opt(23, 58, 0),
            carry_orders_overnight: true,
        }
    }

    pub fn from_config(market: &MarketConfig) -> Self {
        Self {
            price_limit_pct: market.price_limit_pct,
            order_cutoff: market.order_cutoff,
            carry_orders_overnight: market.carry_orders_overnight,
        }
    }

    /// Whether an order submitted at `at` misses the cutoff.
    pub fn past_cutoff(&self, at: NaiveDateTime) -> bool {
        self.order_cutoff.map(|cutoff| at.time() >= cutoff).unwrap_or(false)
    }
}

impl Default for MarketRules {
    fn default() -> Self {
        Self::a_share()
    }
}
