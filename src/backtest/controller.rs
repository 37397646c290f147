//! Episode controller: replays history through matching and the ledger.
//!
//! One controller owns one private ledger, matching engine and id
//! generator. It advances strictly one event at a time:
//!
//! ```text
//! Initializing -> Replaying -> SettlingDay -> Replaying ... -> Finalizing -> Done
//! ```
//!
//! Every episode ends through [`EpisodeController::finalize`]: resting orders
//! are cancelled, holdings are liquidated at their last mark and the day is
//! settled, so the summary is always measured against an all-cash account.

use super::data::HistoricalSource;
use super::metrics::{EpisodeSummary, PerformanceAnalyzer};
use crate::config::Config;
use crate::error::{ReplayError, ReplayResult};
use crate::ledger::{fee_model_from_config, InstrumentLedger};
use crate::market::{AggregatorSet, EventKind, MarketEvent, MarketState};
use crate::matching::{
    CancelOrder, MarketRules, MatchingEngine, Order, OrderBook, OrderCommand, PlaceOrder, Trade,
};
use crate::persistence::{RecordRow, Recorder};
use crate::risk::DrawdownTracker;
use crate::strategy::OrderIntentSource;
use crate::utils::{percentage_change, round_price, round_to_tick, IdGenerator, OrderId};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Termination reason when the stop flag is raised.
const STOPPED_REASON: &str = "stopped by request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    Initializing,
    Replaying,
    SettlingDay,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// A new trading day was opened by this step.
    DayRolled,
    EpisodeEnded,
}

/// What an order intent source sees at one step.
pub struct StepView<'a> {
    /// Event at the trading timeframe (a completed bar or a raw tick)
    pub event: &'a MarketEvent,
    pub market: &'a MarketState,
    pub ledger: &'a InstrumentLedger,
    pub book: &'a OrderBook,
    /// Orders placed now would be rejected
    pub in_warmup: bool,
}

pub struct EpisodeController {
    config: Config,
    source: Box<dyn HistoricalSource>,
    recorder: Box<dyn Recorder>,
    ledger: InstrumentLedger,
    engine: MatchingEngine,
    aggregators: AggregatorSet,
    market: MarketState,
    ids: IdGenerator,
    drawdown: DrawdownTracker,
    analyzer: PerformanceAnalyzer,
    state: EpisodeState,
    episode_no: u32,
    steps: u64,
    days_opened: u32,
    current_date: Option<NaiveDate>,
    last_timestamp: Option<NaiveDateTime>,
    end_reason: Option<String>,
    strategy_events: Vec<MarketEvent>,
    unreported_trades: Vec<Trade>,
    unreported_orders: Vec<Order>,
    stop: Arc<AtomicBool>,
    started_at: Option<Instant>,
    summaries: Vec<EpisodeSummary>,
}

impl EpisodeController {
    pub fn new(config: Config, source: Box<dyn HistoricalSource>, recorder: Box<dyn Recorder>) -> Self {
        let fees = fee_model_from_config(&config.account);
        let start_balance = config.account.start_balance;
        let engine = MatchingEngine::new(fees.clone(), MarketRules::from_config(&config.market))
            .with_volume_cap(config.episode.cap_fills_to_volume);

        Self {
            ledger: InstrumentLedger::new(fees, start_balance, config.account.lot_size),
            engine,
            aggregators: AggregatorSet::new(),
            market: MarketState::new(),
            ids: IdGenerator::new(),
            drawdown: DrawdownTracker::new(config.episode.max_drawdown_pct, start_balance),
            analyzer: PerformanceAnalyzer::new(start_balance, config.episode.annual_trading_days),
            state: EpisodeState::Initializing,
            episode_no: 1,
            steps: 0,
            days_opened: 0,
            current_date: None,
            last_timestamp: None,
            end_reason: None,
            strategy_events: Vec::new(),
            unreported_trades: Vec::new(),
            unreported_orders: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            started_at: None,
            summaries: Vec::new(),
            config,
            source,
            recorder,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn episode_no(&self) -> u32 {
        self.episode_no
    }

    pub fn ledger(&self) -> &InstrumentLedger {
        &self.ledger
    }

    pub fn book(&self) -> &OrderBook {
        self.engine.book()
    }

    pub fn market(&self) -> &MarketState {
        &self.market
    }

    /// Summaries of every finished episode, in order.
    pub fn summaries(&self) -> &[EpisodeSummary] {
        &self.summaries
    }

    /// Handle for cooperative cancellation; checked between events.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Whether orders are refused because the warm-up days are not over.
    pub fn in_warmup(&self) -> bool {
        self.days_opened <= self.config.episode.warmup_days
    }

    // =========================================================================
    // Stepping
    // =========================================================================

    /// Process the next event of history.
    pub fn advance(&mut self) -> ReplayResult<StepOutcome> {
        match self.state {
            EpisodeState::Finalizing | EpisodeState::Done => return Ok(StepOutcome::EpisodeEnded),
            EpisodeState::Initializing => {
                self.state = EpisodeState::Replaying;
                self.started_at = Some(Instant::now());
                info!(episode = self.episode_no, "Episode started");
            }
            EpisodeState::Replaying | EpisodeState::SettlingDay => {}
        }

        if self.stop.load(Ordering::Relaxed) {
            self.end_reason = Some(STOPPED_REASON.to_string());
            return Ok(StepOutcome::EpisodeEnded);
        }

        let Some(event) = self.source.next_event() else {
            self.end_reason = Some(ReplayError::DataExhausted.to_string());
            return Ok(StepOutcome::EpisodeEnded);
        };

        let at = event.timestamp();
        let date = at.date();
        if self.config.episode.start_date.is_some_and(|start| date < start) {
            return Ok(StepOutcome::Continue);
        }
        if self.config.episode.end_date.is_some_and(|end| date > end) {
            self.end_reason = Some(format!("replay window ended at {}", date));
            return Ok(StepOutcome::EpisodeEnded);
        }

        self.steps += 1;
        let mut outcome = StepOutcome::Continue;
        if self.current_date != Some(date) {
            self.roll_day(date)?;
            outcome = StepOutcome::DayRolled;
        }
        self.state = EpisodeState::Replaying;
        self.last_timestamp = Some(at);

        if let MarketEvent::Bar { bar, .. } = &event {
            if let Err(e) = bar.validate() {
                warn!(error = %e, "Dropping invalid bar");
                return Ok(outcome);
            }
        }

        self.market.update(&event);
        let symbol = event.symbol().to_string();
        let price = event.price();

        for tradable in self.to_trading_timeframe(event) {
            self.match_event(&tradable)?;
            self.strategy_events.push(tradable);
        }
        self.collect_finished();
        // After matching, so a fill on a completed bar cannot leave an older price
        self.ledger.mark(&symbol, price);

        let equity = self.ledger.equity();
        if self.drawdown.update(equity) {
            let reason = ReplayError::KnockOut(self.drawdown.breach_reason()).to_string();
            warn!(episode = self.episode_no, %equity, %reason, "Episode knocked out");
            self.end_reason = Some(reason);
            return Ok(StepOutcome::EpisodeEnded);
        }

        Ok(outcome)
    }

    /// Events to match and show the intent source for one raw event.
    fn to_trading_timeframe(&mut self, event: MarketEvent) -> Vec<MarketEvent> {
        let timeframe = self.config.episode.trading_timeframe;
        let aggregate = match event.kind() {
            EventKind::Tick => !self.config.episode.match_raw_ticks,
            EventKind::Bar(tf) => tf.is_finer_than(&timeframe),
        };
        if !aggregate {
            return vec![event];
        }
        self.aggregators
            .push(&event, timeframe)
            .map(|bar| MarketEvent::bar(timeframe, bar))
            .into_iter()
            .collect()
    }

    /// Close the current day (if any) and open `date`.
    fn roll_day(&mut self, date: NaiveDate) -> ReplayResult<()> {
        if self.current_date.is_some() {
            self.state = EpisodeState::SettlingDay;
            self.flush_aggregators()?;
            self.settle_day();
            if !self.engine.rules().carry_orders_overnight {
                let at = self.last_timestamp.unwrap_or_default();
                let cancelled = self.engine.cancel_all(at);
                if !cancelled.is_empty() {
                    debug!(count = cancelled.len(), "Cancelled orders at day end");
                }
                self.collect_finished();
            }
        }

        self.ledger.on_day_open(date);
        self.current_date = Some(date);
        self.days_opened += 1;
        Ok(())
    }

    /// Complete partial bars and match them.
    fn flush_aggregators(&mut self) -> ReplayResult<()> {
        for (timeframe, bar) in self.aggregators.flush_all() {
            let event = MarketEvent::bar(timeframe, bar);
            self.match_event(&event)?;
            self.strategy_events.push(event);
        }
        Ok(())
    }

    fn match_event(&mut self, event: &MarketEvent) -> ReplayResult<()> {
        let ledger = &mut self.ledger;
        let trades = self
            .engine
            .match_with(event, &mut self.ids, |trade| ledger.apply_fill(trade))?;
        for trade in trades {
            self.record(RecordRow::Trade(trade.clone()));
            self.unreported_trades.push(trade);
        }
        Ok(())
    }

    fn settle_day(&mut self) {
        if let Some(result) = self.ledger.on_day_close() {
            for row in self.ledger.take_daily_positions() {
                self.record(RecordRow::DailyPosition(row));
            }
            self.record(RecordRow::DailyResult(result));
        }
    }

    fn collect_finished(&mut self) {
        for order in self.engine.drain_finished() {
            self.record(RecordRow::Order(order.clone()));
            self.unreported_orders.push(order);
        }
    }

    fn record(&mut self, row: RecordRow) {
        if let Err(e) = self.recorder.push(self.episode_no, &row) {
            warn!(category = %row.category(), error = %e, "Failed to record row");
        }
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Place an order at the current replay time.
    ///
    /// The price is snapped to the configured tick. Refused orders come back
    /// with `Rejected` status and a reason; they never reach the book.
    pub fn place_order(&mut self, mut request: PlaceOrder) -> Order {
        request.price = round_to_tick(request.price, self.config.account.price_tick);
        let at = self.last_timestamp.unwrap_or_default();
        let id = self.ids.next_order_id();

        let order = match self.pre_check(&request, at) {
            Some(reason) => {
                warn!(order_id = %id, symbol = %request.symbol, %reason, "Order rejected");
                self.engine.reject(id, &request, at, &reason)
            }
            None => {
                let order = self.engine.submit(id, &request, at);
                self.record(RecordRow::Order(order.clone()));
                order
            }
        };
        self.collect_finished();
        order
    }

    fn pre_check(&self, request: &PlaceOrder, at: NaiveDateTime) -> Option<String> {
        if !matches!(self.state, EpisodeState::Replaying | EpisodeState::SettlingDay) {
            return Some("episode is not replaying".to_string());
        }
        if self.in_warmup() {
            return Some("warm-up period".to_string());
        }
        if self.engine.rules().past_cutoff(at) {
            return Some(format!("submitted after order cutoff at {}", at.time()));
        }
        if request.volume <= Decimal::ZERO || request.price <= Decimal::ZERO {
            return Some("volume and price must be positive".to_string());
        }

        let book = self.engine.book();
        self.ledger
            .check_order(
                request,
                book.committed_buy_notional(),
                book.committed_volume(&request.symbol, request.side),
            )
            .err()
            .map(|e| e.to_string())
    }

    pub fn cancel_order(&mut self, order_id: OrderId) -> ReplayResult<Order> {
        let at = self.last_timestamp.unwrap_or_default();
        let order = self.engine.cancel(order_id, at)?;
        self.collect_finished();
        Ok(order)
    }

    fn execute(&mut self, command: OrderCommand) {
        match command {
            OrderCommand::Place(request) => {
                self.place_order(request);
            }
            OrderCommand::Cancel(CancelOrder { order_id }) => {
                if let Err(e) = self.cancel_order(order_id) {
                    warn!(%order_id, error = %e, "Cancel ignored");
                }
            }
        }
    }

    /// Hand pending events to the intent source, apply its commands, then
    /// report fills and terminal orders back to it.
    pub fn dispatch(&mut self, intents: &mut dyn OrderIntentSource) {
        for event in std::mem::take(&mut self.strategy_events) {
            let commands = {
                let view = StepView {
                    event: &event,
                    market: &self.market,
                    ledger: &self.ledger,
                    book: self.engine.book(),
                    in_warmup: self.in_warmup(),
                };
                intents.on_step(&view)
            };
            for command in commands {
                self.execute(command);
            }
        }

        for trade in std::mem::take(&mut self.unreported_trades) {
            intents.on_trade(&trade);
        }
        for order in std::mem::take(&mut self.unreported_orders) {
            intents.on_order(&order);
        }
    }

    // =========================================================================
    // Episode Lifecycle
    // =========================================================================

    /// Replay one full episode.
    ///
    /// A fatal error still records a best-effort summary (see
    /// [`summaries`](Self::summaries)) before the error is returned.
    pub fn run_episode(&mut self, intents: &mut dyn OrderIntentSource) -> ReplayResult<EpisodeSummary> {
        loop {
            match self.advance() {
                Ok(StepOutcome::EpisodeEnded) => break,
                Ok(_) => self.dispatch(intents),
                Err(e) if e.is_fatal() => return Err(self.abort(e)),
                Err(e) => warn!(error = %e, "Step failed, continuing"),
            }
        }

        let reason = self
            .end_reason
            .clone()
            .unwrap_or_else(|| ReplayError::DataExhausted.to_string());
        let summary = self.finalize(&reason);
        self.dispatch(intents);
        summary
    }

    /// Replay `episode_count` episodes over the same history.
    pub fn run(&mut self, intents: &mut dyn OrderIntentSource) -> ReplayResult<Vec<EpisodeSummary>> {
        let count = self.config.episode.episode_count.max(1);
        let mut summaries = Vec::with_capacity(count as usize);
        for n in 0..count {
            if n > 0 {
                self.reset();
                self.episode_no += 1;
            }
            intents.reset();
            summaries.push(self.run_episode(intents)?);
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
        }
        Ok(summaries)
    }

    /// Liquidate, settle and summarize the episode.
    pub fn finalize(&mut self, reason: &str) -> ReplayResult<EpisodeSummary> {
        self.state = EpisodeState::Finalizing;
        if let Err(e) = self.close_out() {
            return Err(self.abort(e));
        }

        let summary = self.build_summary(reason);
        self.record(RecordRow::EpisodeSummary(summary.clone()));
        for line in summary.report().lines() {
            info!("{}", line);
        }
        self.summaries.push(summary.clone());
        self.state = EpisodeState::Done;
        Ok(summary)
    }

    fn close_out(&mut self) -> ReplayResult<()> {
        let at = self.last_timestamp.unwrap_or_default();
        if self.end_reason.as_deref() != Some(STOPPED_REASON) {
            self.flush_aggregators()?;
        }
        self.engine.cancel_all(at);
        self.collect_finished();

        for trade in self.ledger.force_liquidate(at, &mut self.ids)? {
            self.record(RecordRow::Trade(trade.clone()));
            self.unreported_trades.push(trade);
        }
        self.settle_day();
        Ok(())
    }

    /// Record a best-effort summary for an episode that cannot continue.
    fn abort(&mut self, cause: ReplayError) -> ReplayError {
        error!(episode = self.episode_no, error = %cause, "Episode aborted");
        self.state = EpisodeState::Finalizing;
        let summary = self.build_summary(&format!("aborted: {}", cause));
        self.record(RecordRow::EpisodeSummary(summary.clone()));
        self.summaries.push(summary);
        self.state = EpisodeState::Done;
        cause
    }

    fn build_summary(&self, reason: &str) -> EpisodeSummary {
        let results = self.ledger.daily_results();
        let warmup = (self.config.episode.warmup_days as usize).min(results.len());
        let mut summary = self.analyzer.summarize(&results[warmup..]);

        summary.episode_no = self.episode_no;
        summary.open_days = results.len() as u32;
        summary.steps_in_episode = self.steps;
        summary.episode_duration_ms = self
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        summary.origin_gain = self
            .market
            .origin()
            .map(|(open, close)| round_price(percentage_change(open, close), 3))
            .unwrap_or(Decimal::ZERO);
        summary.reason = reason.to_string();
        summary
    }

    /// Rewind history and restore every component to its constructed state.
    pub fn reset(&mut self) {
        self.source.reset();
        self.ledger.reset();
        self.engine.reset();
        self.aggregators.reset();
        self.market.reset();
        self.ids.reset();
        self.drawdown.reset(self.config.account.start_balance);
        self.state = EpisodeState::Initializing;
        self.steps = 0;
        self.days_opened = 0;
        self.current_date = None;
        self.last_timestamp = None;
        self.end_reason = None;
        self.strategy_events.clear();
        self.unreported_trades.clear();
        self.unreported_orders.clear();
        self.started_at = None;
    }
}
