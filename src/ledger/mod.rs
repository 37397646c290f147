//! Cash and position accounting across trading days.
//!
//! The ledger books fills exactly as stamped by the matching engine, enforces
//! T+1 availability (shares bought today become sellable at the next day
//! open) and closes each day into a [`DailyResult`] plus one
//! [`DailyPosition`] row per symbol.

pub mod fees;

pub use fees::{fee_model_from_config, AShareFees, FeeModel, FlatFees, TradeCost};

use crate::error::{ReplayError, ReplayResult};
use crate::matching::{OrderSide, PlaceOrder, Trade};
use crate::utils::{round_down_to_lot, safe_div, weighted_average, IdGenerator};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Holding in one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub total_quantity: Decimal,
    /// Quantity sellable today; never above `total_quantity`.
    pub available_quantity: Decimal,
    pub last_price: Decimal,
    /// Weighted average buy price; untouched by sells.
    pub average_cost: Decimal,
}

impl Position {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            total_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            last_price: Decimal::ZERO,
            average_cost: Decimal::ZERO,
        }
    }

    pub fn market_value(&self, contract_size: Decimal) -> Decimal {
        self.total_quantity * self.last_price * contract_size
    }
}

/// The cash pseudo-position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CashBalance {
    pub total: Decimal,
    pub available: Decimal,
}

/// Per-symbol row written at each day close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPosition {
    pub date: NaiveDate,
    pub symbol: String,
    pub close_price: Decimal,
    pub average_cost: Decimal,
    pub quantity: Decimal,
    pub available_quantity: Decimal,
    pub prev_close: Decimal,
    pub prev_quantity: Decimal,
    pub turnover: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
    pub trading_pnl: Decimal,
    pub position_pnl: Decimal,
    pub net_pnl: Decimal,
    pub buy_count: u32,
    pub sell_count: u32,
    /// Fills of the day, e.g. `+1000x10.00;-500x10.40`.
    pub transactions: String,
}

/// Account-level result of one trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyResult {
    pub date: NaiveDate,
    /// Total quantity held at day open, all symbols.
    pub open_position: Decimal,
    pub close_position: Decimal,
    pub trading_pnl: Decimal,
    pub position_pnl: Decimal,
    pub commission: Decimal,
    pub slippage: Decimal,
    pub turnover: Decimal,
    pub buy_count: u32,
    pub sell_count: u32,
    /// `trading_pnl + position_pnl - commission - slippage`
    pub net_pnl: Decimal,
    pub cash: Decimal,
    pub market_value: Decimal,
    pub end_balance: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct OpenMark {
    quantity: Decimal,
    price: Decimal,
}

/// Account ledger: one cash balance plus one position per symbol.
#[derive(Debug)]
pub struct InstrumentLedger {
    fees: Arc<dyn FeeModel>,
    start_balance: Decimal,
    lot_size: Decimal,
    cash: CashBalance,
    positions: BTreeMap<String, Position>,
    current_date: Option<NaiveDate>,
    day_open: bool,
    open_marks: BTreeMap<String, OpenMark>,
    day_trades: Vec<Trade>,
    daily_results: Vec<DailyResult>,
    pending_rows: Vec<DailyPosition>,
}

impl InstrumentLedger {
    pub fn new(fees: Arc<dyn FeeModel>, start_balance: Decimal, lot_size: Decimal) -> Self {
        Self {
            fees,
            start_balance,
            lot_size,
            cash: CashBalance {
                total: start_balance,
                available: start_balance,
            },
            positions: BTreeMap::new(),
            current_date: None,
            day_open: false,
            open_marks: BTreeMap::new(),
            day_trades: Vec::new(),
            daily_results: Vec::new(),
            pending_rows: Vec::new(),
        }
    }

    pub fn start_balance(&self) -> Decimal {
        self.start_balance
    }

    pub fn cash(&self) -> CashBalance {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn current_date(&self) -> Option<NaiveDate> {
        self.current_date
    }

    pub fn is_day_open(&self) -> bool {
        self.day_open
    }

    pub fn day_trades(&self) -> &[Trade] {
        &self.day_trades
    }

    /// Every day closed so far, oldest first.
    pub fn daily_results(&self) -> &[DailyResult] {
        &self.daily_results
    }

    /// Per-symbol rows produced by day closes since the last call.
    pub fn take_daily_positions(&mut self) -> Vec<DailyPosition> {
        std::mem::take(&mut self.pending_rows)
    }

    pub fn market_value(&self) -> Decimal {
        let size = self.fees.contract_size();
        self.positions.values().map(|p| p.market_value(size)).sum()
    }

    /// Cash plus positions marked at their last price.
    pub fn equity(&self) -> Decimal {
        self.cash.total + self.market_value()
    }

    /// Update the mark of a held symbol.
    pub fn mark(&mut self, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        if let Some(position) = self.positions.get_mut(symbol) {
            position.last_price = price;
        }
    }

    /// Pre-placement check, net of what resting orders already commit.
    ///
    /// `committed_cash` is the buy notional of resting orders;
    /// `committed_volume` the unfilled volume of resting orders on the same
    /// side and symbol.
    pub fn check_order(
        &self,
        request: &PlaceOrder,
        committed_cash: Decimal,
        committed_volume: Decimal,
    ) -> ReplayResult<()> {
        match request.side {
            OrderSide::Buy => {
                let cost = self
                    .fees
                    .assess(&request.symbol, OrderSide::Buy, request.price, request.volume);
                let required = cost.turnover + cost.fees() + committed_cash;
                if required > self.cash.available {
                    return Err(ReplayError::InsufficientCash {
                        required,
                        available: self.cash.available,
                    });
                }
            }
            OrderSide::Sell => {
                let available = self
                    .positions
                    .get(&request.symbol)
                    .map(|p| p.available_quantity)
                    .unwrap_or(Decimal::ZERO);
                let requested = request.volume + committed_volume;
                if requested > available {
                    return Err(ReplayError::InsufficientPosition {
                        symbol: request.symbol.clone(),
                        requested,
                        available,
                    });
                }
            }
        }
        Ok(())
    }

    /// Largest lot-rounded volume whose cost including fees fits available cash.
    pub fn max_buy_volume(&self, symbol: &str, price: Decimal) -> Decimal {
        let unit = price * self.fees.contract_size();
        if unit <= Decimal::ZERO || self.lot_size <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let mut volume = round_down_to_lot(safe_div(self.cash.available, unit), self.lot_size);
        while volume > Decimal::ZERO {
            let cost = self.fees.assess(symbol, OrderSide::Buy, price, volume);
            if cost.turnover + cost.fees() <= self.cash.available {
                return volume;
            }
            volume -= self.lot_size;
        }
        Decimal::ZERO
    }

    /// Book one fill.
    ///
    /// The stamped costs must match this ledger's fee model. Fills never
    /// move an existing mark; only a position opened from flat takes the
    /// fill price until the next observation.
    pub fn apply_fill(&mut self, trade: &Trade) -> ReplayResult<()> {
        if trade.volume <= Decimal::ZERO || trade.price <= Decimal::ZERO {
            return Err(ReplayError::LedgerInvariantViolation(format!(
                "malformed trade {}: {} @ {}",
                trade.id, trade.volume, trade.price
            )));
        }

        let cost = self.fees.assess(&trade.symbol, trade.side, trade.price, trade.volume);
        if cost.commission != trade.commission || cost.slippage != trade.slippage {
            return Err(ReplayError::LedgerInvariantViolation(format!(
                "trade {} stamped costs {}/{} differ from fee model {}/{}",
                trade.id, trade.commission, trade.slippage, cost.commission, cost.slippage
            )));
        }
        let expected_cash_delta = cost.cash_delta(trade.side);
        let equity_before = self.equity();

        match trade.side {
            OrderSide::Buy => {
                if -expected_cash_delta > self.cash.available {
                    return Err(ReplayError::InsufficientCash {
                        required: -expected_cash_delta,
                        available: self.cash.available,
                    });
                }
                let position = self
                    .positions
                    .entry(trade.symbol.clone())
                    .or_insert_with(|| Position::new(&trade.symbol));
                if position.total_quantity == Decimal::ZERO {
                    position.last_price = trade.price;
                }
                position.average_cost = weighted_average(&[
                    (position.average_cost, position.total_quantity),
                    (trade.price, trade.volume),
                ]);
                // Bought shares settle at the next day open
                position.total_quantity += trade.volume;
            }
            OrderSide::Sell => {
                let available = self
                    .positions
                    .get(&trade.symbol)
                    .map(|p| p.available_quantity)
                    .unwrap_or(Decimal::ZERO);
                if trade.volume > available {
                    return Err(ReplayError::InsufficientPosition {
                        symbol: trade.symbol.clone(),
                        requested: trade.volume,
                        available,
                    });
                }
                if let Some(position) = self.positions.get_mut(&trade.symbol) {
                    position.total_quantity -= trade.volume;
                    position.available_quantity -= trade.volume;
                }
            }
        }

        self.cash.total += expected_cash_delta;
        self.cash.available += expected_cash_delta;
        self.day_trades.push(trade.clone());

        self.verify_fill(trade, equity_before, expected_cash_delta)?;

        debug!(
            trade_id = %trade.id,
            symbol = %trade.symbol,
            side = %trade.side,
            cash = %self.cash.total,
            "Fill booked"
        );
        Ok(())
    }

    /// Equity may only move by the cash effect plus the traded volume at its mark.
    fn verify_fill(&self, trade: &Trade, equity_before: Decimal, expected_cash_delta: Decimal) -> ReplayResult<()> {
        let position = self.positions.get(&trade.symbol).ok_or_else(|| {
            ReplayError::LedgerInvariantViolation(format!("no position for {}", trade.symbol))
        })?;

        let marked_volume = trade.side.sign() * trade.volume * self.fees.contract_size() * position.last_price;
        let expected_equity_delta = expected_cash_delta + marked_volume;
        let equity_delta = self.equity() - equity_before;
        if equity_delta != expected_equity_delta {
            return Err(ReplayError::LedgerInvariantViolation(format!(
                "equity moved by {} on {}, expected {}",
                equity_delta, trade.id, expected_equity_delta
            )));
        }

        if self.cash.available < Decimal::ZERO || self.cash.available > self.cash.total {
            return Err(ReplayError::LedgerInvariantViolation(format!(
                "cash available {} outside [0, {}]",
                self.cash.available, self.cash.total
            )));
        }

        if position.available_quantity < Decimal::ZERO
            || position.available_quantity > position.total_quantity
        {
            return Err(ReplayError::LedgerInvariantViolation(format!(
                "{} available {} outside [0, {}]",
                trade.symbol, position.available_quantity, position.total_quantity
            )));
        }

        Ok(())
    }

    /// Start trading `date`.
    ///
    /// A no-op when `date` is already the current date. Otherwise an open
    /// day is closed first, then every position becomes fully available.
    pub fn on_day_open(&mut self, date: NaiveDate) {
        if self.current_date == Some(date) {
            return;
        }
        if self.day_open {
            self.on_day_close();
        }

        self.positions.retain(|_, p| p.total_quantity != Decimal::ZERO);
        self.open_marks.clear();
        for position in self.positions.values_mut() {
            position.available_quantity = position.total_quantity;
            self.open_marks.insert(
                position.symbol.clone(),
                OpenMark {
                    quantity: position.total_quantity,
                    price: position.last_price,
                },
            );
        }

        self.day_trades.clear();
        self.current_date = Some(date);
        self.day_open = true;
        debug!(%date, positions = self.positions.len(), "Day opened");
    }

    /// Close the current day into a [`DailyResult`]; `None` if no day is open.
    pub fn on_day_close(&mut self) -> Option<DailyResult> {
        if !self.day_open {
            return None;
        }
        let date = self.current_date?;
        let size = self.fees.contract_size();

        let mut result = DailyResult {
            date,
            open_position: Decimal::ZERO,
            close_position: Decimal::ZERO,
            trading_pnl: Decimal::ZERO,
            position_pnl: Decimal::ZERO,
            commission: Decimal::ZERO,
            slippage: Decimal::ZERO,
            turnover: Decimal::ZERO,
            buy_count: 0,
            sell_count: 0,
            net_pnl: Decimal::ZERO,
            cash: self.cash.total,
            market_value: self.market_value(),
            end_balance: self.equity(),
        };

        for position in self.positions.values() {
            let open = self.open_marks.get(&position.symbol).copied().unwrap_or(OpenMark {
                quantity: Decimal::ZERO,
                price: Decimal::ZERO,
            });
            let close = position.last_price;

            let mut row = DailyPosition {
                date,
                symbol: position.symbol.clone(),
                close_price: close,
                average_cost: position.average_cost,
                quantity: position.total_quantity,
                available_quantity: position.available_quantity,
                prev_close: open.price,
                prev_quantity: open.quantity,
                turnover: Decimal::ZERO,
                commission: Decimal::ZERO,
                slippage: Decimal::ZERO,
                trading_pnl: Decimal::ZERO,
                position_pnl: open.quantity * (close - open.price) * size,
                net_pnl: Decimal::ZERO,
                buy_count: 0,
                sell_count: 0,
                transactions: String::new(),
            };

            let mut history = Vec::new();
            for trade in self.day_trades.iter().filter(|t| t.symbol == position.symbol) {
                let signed = trade.side.sign() * trade.volume;
                row.trading_pnl += signed * (close - trade.price) * size;
                row.turnover += trade.price * trade.volume * size;
                row.commission += trade.commission;
                row.slippage += trade.slippage;
                let sign = match trade.side {
                    OrderSide::Buy => {
                        row.buy_count += 1;
                        '+'
                    }
                    OrderSide::Sell => {
                        row.sell_count += 1;
                        '-'
                    }
                };
                history.push(format!("{}{}x{}", sign, trade.volume, trade.price));
            }
            row.transactions = history.join(";");
            row.net_pnl = row.trading_pnl + row.position_pnl - row.commission - row.slippage;

            result.open_position += open.quantity;
            result.close_position += position.total_quantity;
            result.trading_pnl += row.trading_pnl;
            result.position_pnl += row.position_pnl;
            result.commission += row.commission;
            result.slippage += row.slippage;
            result.turnover += row.turnover;
            result.buy_count += row.buy_count;
            result.sell_count += row.sell_count;
            self.pending_rows.push(row);
        }

        result.net_pnl = result.trading_pnl + result.position_pnl - result.commission - result.slippage;
        self.daily_results.push(result.clone());
        self.day_open = false;

        info!(
            %date,
            net_pnl = %result.net_pnl,
            balance = %result.end_balance,
            trades = result.buy_count + result.sell_count,
            "Day settled"
        );
        Some(result)
    }

    /// Sell every holding at its last mark, overriding T+1 availability.
    ///
    /// Used when an episode ends; the resulting trades belong to the open day.
    pub fn force_liquidate(
        &mut self,
        at: NaiveDateTime,
        ids: &mut IdGenerator,
    ) -> ReplayResult<Vec<Trade>> {
        let holdings: Vec<(String, Decimal, Decimal)> = self
            .positions
            .values()
            .filter(|p| p.total_quantity > Decimal::ZERO && p.last_price > Decimal::ZERO)
            .map(|p| (p.symbol.clone(), p.total_quantity, p.last_price))
            .collect();

        let mut trades = Vec::with_capacity(holdings.len());
        for (symbol, quantity, price) in holdings {
            let cost = self.fees.assess(&symbol, OrderSide::Sell, price, quantity);
            let trade = Trade {
                id: ids.next_trade_id(),
                order_id: None,
                symbol: symbol.clone(),
                exchange: String::new(),
                side: OrderSide::Sell,
                price,
                volume: quantity,
                timestamp: at,
                commission: cost.commission,
                slippage: cost.slippage,
            };

            if let Some(position) = self.positions.get_mut(&symbol) {
                position.available_quantity = position.total_quantity;
            }
            self.apply_fill(&trade)?;
            info!(%symbol, %quantity, %price, "Position liquidated");
            trades.push(trade);
        }
        Ok(trades)
    }

    /// Restore the freshly constructed state.
    pub fn reset(&mut self) {
        self.cash = CashBalance {
            total: self.start_balance,
            available: self.start_balance,
        };
        self.positions.clear();
        self.current_date = None;
        self.day_open = false;
        self.open_marks.clear();
        self.day_trades.clear();
        self.daily_results.clear();
        self.pending_rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;
    use crate::market::test_support::ts;
    use crate::utils::{OrderId, TradeId};
    use rust_decimal_macros::dec;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn ledger() -> InstrumentLedger {
        InstrumentLedger::new(
            Arc::new(AShareFees::from_config(&AccountConfig::default())),
            dec!(100000),
            dec!(100),
        )
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn fill(ledger: &InstrumentLedger, id: u64, symbol: &str, side: OrderSide, price: Decimal, volume: Decimal) -> Trade {
        let cost = ledger.fees.assess(symbol, side, price, volume);
        Trade {
            id: TradeId(id),
            order_id: Some(OrderId(id)),
            symbol: symbol.to_string(),
            exchange: "SZSE".to_string(),
            side,
            price,
            volume,
            timestamp: ts(1, 10, 0),
            commission: cost.commission,
            slippage: cost.slippage,
        }
    }

    // =========================================================================
    // Conservation Tests
    // =========================================================================

    #[test]
    fn test_cash_conservation_across_fills() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));

        let buy = fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000));
        let before = ledger.cash().total;
        ledger.apply_fill(&buy).unwrap();
        assert_eq!(ledger.cash().total - before, -(dec!(10000) + dec!(5)));

        ledger.on_day_open(day(4));
        let sell = fill(&ledger, 2, "000001", OrderSide::Sell, dec!(11), dec!(400));
        let before = ledger.cash().total;
        ledger.apply_fill(&sell).unwrap();
        // turnover 4400, commission 5, stamp tax 4.40
        assert_eq!(ledger.cash().total - before, dec!(4400) - dec!(9.40));
        assert_eq!(ledger.cash().available, ledger.cash().total);
    }

    #[test]
    fn test_average_cost_moves_on_buys_only() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();
        ledger.apply_fill(&fill(&ledger, 2, "000001", OrderSide::Buy, dec!(12), dec!(1000))).unwrap();
        assert_eq!(ledger.position("000001").unwrap().average_cost, dec!(11));

        ledger.on_day_open(day(4));
        ledger.apply_fill(&fill(&ledger, 3, "000001", OrderSide::Sell, dec!(15), dec!(500))).unwrap();
        let position = ledger.position("000001").unwrap();
        assert_eq!(position.average_cost, dec!(11));
        assert_eq!(position.total_quantity, dec!(1500));
        // Only the opening buy set the mark
        assert_eq!(position.last_price, dec!(10));
    }

    #[test]
    fn test_buy_beyond_cash_is_refused() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        let trade = fill(&ledger, 1, "000001", OrderSide::Buy, dec!(100), dec!(1000));
        assert!(matches!(
            ledger.apply_fill(&trade),
            Err(ReplayError::InsufficientCash { .. })
        ));
        assert_eq!(ledger.cash().total, dec!(100000));
        assert!(ledger.day_trades().is_empty());
    }

    #[test]
    fn test_malformed_trade_is_an_invariant_violation() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        let mut trade = fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(100));
        trade.volume = dec!(0);
        assert!(matches!(
            ledger.apply_fill(&trade),
            Err(ReplayError::LedgerInvariantViolation(_))
        ));
    }

    #[test]
    fn test_tampered_costs_are_an_invariant_violation() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        let mut trade = fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000));
        trade.commission -= dec!(1);

        assert!(matches!(
            ledger.apply_fill(&trade),
            Err(ReplayError::LedgerInvariantViolation(_))
        ));
        assert_eq!(ledger.cash().total, dec!(100000));
        assert!(ledger.position("000001").is_none());
    }

    #[test]
    fn test_fills_keep_the_observed_mark() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();
        assert_eq!(ledger.position("000001").unwrap().last_price, dec!(10));

        ledger.mark("000001", dec!(10.30));
        ledger.apply_fill(&fill(&ledger, 2, "000001", OrderSide::Buy, dec!(10.10), dec!(100))).unwrap();
        assert_eq!(ledger.position("000001").unwrap().last_price, dec!(10.30));

        ledger.on_day_open(day(4));
        ledger.apply_fill(&fill(&ledger, 3, "000001", OrderSide::Sell, dec!(10.20), dec!(500))).unwrap();
        let position = ledger.position("000001").unwrap();
        assert_eq!(position.last_price, dec!(10.30));
        assert_eq!(ledger.market_value(), dec!(600) * dec!(10.30));
    }

    // =========================================================================
    // T+1 Availability Tests
    // =========================================================================

    #[test]
    fn test_bought_shares_sellable_next_day() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();

        let position = ledger.position("000001").unwrap();
        assert_eq!(position.total_quantity, dec!(1000));
        assert_eq!(position.available_quantity, dec!(0));

        let sell = fill(&ledger, 2, "000001", OrderSide::Sell, dec!(10), dec!(1000));
        assert!(matches!(
            ledger.apply_fill(&sell),
            Err(ReplayError::InsufficientPosition { .. })
        ));

        ledger.on_day_open(day(4));
        let position = ledger.position("000001").unwrap();
        assert!(position.available_quantity <= position.total_quantity);
        assert_eq!(position.available_quantity, dec!(1000));
        ledger.apply_fill(&sell).unwrap();
        assert_eq!(ledger.position("000001").unwrap().available_quantity, dec!(0));
    }

    // =========================================================================
    // Day Rollover Tests
    // =========================================================================

    #[test]
    fn test_day_open_is_idempotent() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();

        ledger.on_day_open(day(1));
        ledger.on_day_open(day(1));
        assert!(ledger.daily_results().is_empty());
        // No second reset: today's purchase stays unavailable
        assert_eq!(ledger.position("000001").unwrap().available_quantity, dec!(0));
        assert_eq!(ledger.day_trades().len(), 1);
    }

    #[test]
    fn test_new_date_closes_previous_day() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        ledger.on_day_open(day(4));
        ledger.on_day_open(day(4));
        assert_eq!(ledger.daily_results().len(), 1);
        assert_eq!(ledger.daily_results()[0].date, day(1));
        assert!(ledger.on_day_close().is_some());
        assert!(ledger.on_day_close().is_none());
        assert_eq!(ledger.daily_results().len(), 2);
    }

    #[test]
    fn test_daily_pnl_reconciles_with_equity() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();
        ledger.mark("000001", dec!(10.20));
        let day_one = ledger.on_day_close().unwrap();
        // trading pnl 1000 * 0.20 = 200, commission 5
        assert_eq!(day_one.trading_pnl, dec!(200));
        assert_eq!(day_one.net_pnl, dec!(195));
        assert_eq!(day_one.end_balance, dec!(100195));

        let equity_before = ledger.equity();
        ledger.on_day_open(day(4));
        ledger.mark("000001", dec!(10.50));
        ledger.apply_fill(&fill(&ledger, 2, "000001", OrderSide::Sell, dec!(10.60), dec!(600))).unwrap();
        ledger.mark("000001", dec!(10.40));
        let day_two = ledger.on_day_close().unwrap();

        assert_eq!(day_two.position_pnl, dec!(1000) * dec!(0.20));
        assert_eq!(day_two.trading_pnl, dec!(-600) * (dec!(10.40) - dec!(10.60)));
        assert_eq!(ledger.equity() - equity_before, day_two.net_pnl);
        assert_eq!(day_two.sell_count, 1);

        let rows = ledger.take_daily_positions();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].transactions, "-600x10.60");
        assert_eq!(rows[1].prev_quantity, dec!(1000));
        assert_eq!(rows[1].quantity, dec!(400));
        assert!(ledger.take_daily_positions().is_empty());
    }

    // =========================================================================
    // Order Checks And Sizing Tests
    // =========================================================================

    #[test]
    fn test_check_order_accounts_for_commitments() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));

        let buy = PlaceOrder::limit("000001", OrderSide::Buy, dec!(10), dec!(5000));
        assert!(ledger.check_order(&buy, dec!(0), dec!(0)).is_ok());
        assert!(matches!(
            ledger.check_order(&buy, dec!(60000), dec!(0)),
            Err(ReplayError::InsufficientCash { .. })
        ));

        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();
        ledger.on_day_open(day(4));
        let sell = PlaceOrder::limit("000001", OrderSide::Sell, dec!(10), dec!(600));
        assert!(ledger.check_order(&sell, dec!(0), dec!(400)).is_ok());
        assert!(matches!(
            ledger.check_order(&sell, dec!(0), dec!(500)),
            Err(ReplayError::InsufficientPosition { .. })
        ));
    }

    #[test]
    fn test_max_buy_volume_respects_lots_and_fees() {
        let ledger = ledger();
        // 100000 / 10 = 10000 shares but fees push it one lot down
        assert_eq!(ledger.max_buy_volume("000001", dec!(10)), dec!(9900));
        assert_eq!(ledger.max_buy_volume("000001", dec!(3)), dec!(33300));
        assert_eq!(ledger.max_buy_volume("000001", dec!(0)), dec!(0));
    }

    // =========================================================================
    // Liquidation And Reset Tests
    // =========================================================================

    #[test]
    fn test_force_liquidate_ignores_t_plus_one() {
        let mut ledger = ledger();
        let mut ids = IdGenerator::new();
        ledger.on_day_open(day(1));
        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();
        ledger.mark("000001", dec!(9.50));

        let trades = ledger.force_liquidate(ts(1, 15, 0), &mut ids).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, dec!(9.50));
        assert_eq!(trades[0].order_id, None);
        assert_eq!(ledger.market_value(), dec!(0));
        // 100000 - 10005 + 9500 - 5 - 9.50
        assert_eq!(ledger.cash().total, dec!(99480.50));
    }

    #[test]
    fn test_reset_restores_start_state() {
        let mut ledger = ledger();
        ledger.on_day_open(day(1));
        ledger.apply_fill(&fill(&ledger, 1, "000001", OrderSide::Buy, dec!(10), dec!(1000))).unwrap();
        ledger.on_day_close();

        ledger.reset();
        assert_eq!(ledger.cash().total, dec!(100000));
        assert_eq!(ledger.positions().count(), 0);
        assert!(ledger.daily_results().is_empty());
        assert!(ledger.current_date().is_none());
    }
}
