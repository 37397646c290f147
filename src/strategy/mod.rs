//! Order intent sources driving an episode.
//!
//! The controller hands each trading-timeframe event to the source, which
//! answers with place/cancel commands. Fills and terminal order states are
//! reported back through the notification hooks.

mod scripted;
mod sma;

pub use scripted::ScriptedIntents;
pub use sma::SmaCrossTrader;

use crate::backtest::StepView;
use crate::matching::{Order, OrderCommand, Trade};

/// Anything that decides what to trade: a rule set, a script, an agent.
pub trait OrderIntentSource: Send {
    /// Commands to apply after this step.
    fn on_step(&mut self, view: &StepView<'_>) -> Vec<OrderCommand>;

    /// A fill of one of our orders (or a forced liquidation).
    fn on_trade(&mut self, _trade: &Trade) {}

    /// An order reached a terminal status.
    fn on_order(&mut self, _order: &Order) {}

    /// Forget everything learned in the previous episode.
    fn reset(&mut self) {}
}
