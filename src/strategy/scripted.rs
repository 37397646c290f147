//! Prepared commands fired at fixed replay times.

use super::OrderIntentSource;
use crate::backtest::StepView;
use crate::matching::{Order, OrderCommand, Trade};
use chrono::NaiveDateTime;

/// Fires each command at the first step whose event time reaches its schedule.
#[derive(Debug, Clone, Default)]
pub struct ScriptedIntents {
    script: Vec<(NaiveDateTime, OrderCommand)>,
    cursor: usize,
    trades: Vec<Trade>,
    finished: Vec<Order>,
}

impl ScriptedIntents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `command` for the first step at or after `at`.
    pub fn at(mut self, at: NaiveDateTime, command: OrderCommand) -> Self {
        let index = self.script.partition_point(|(t, _)| *t <= at);
        self.script.insert(index, (at, command));
        self
    }

    /// Fills reported back this episode.
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Terminal orders reported back this episode.
    pub fn finished_orders(&self) -> &[Order] {
        &self.finished
    }
}

impl OrderIntentSource for ScriptedIntents {
    fn on_step(&mut self, view: &StepView<'_>) -> Vec<OrderCommand> {
        let now = view.event.timestamp();
        let due = self.script[self.cursor..]
            .iter()
            .take_while(|(at, _)| *at <= now)
            .count();
        let commands = self.script[self.cursor..self.cursor + due]
            .iter()
            .map(|(_, command)| command.clone())
            .collect();
        self.cursor += due;
        commands
    }

    fn on_trade(&mut self, trade: &Trade) {
        self.trades.push(trade.clone());
    }

    fn on_order(&mut self, order: &Order) {
        self.finished.push(order.clone());
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.trades.clear();
        self.finished.clear();
    }
}
