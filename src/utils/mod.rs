//! Shared helpers: decimal rounding and episode-scoped identifiers.

pub mod decimal;
pub mod ids;

pub use decimal::*;
pub use ids::{IdGenerator, OrderId, TradeId};
