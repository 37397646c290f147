//! Episode performance analysis.
//!
//! Works on the settled [`DailyResult`] sequence only, so the summary of an
//! episode can always be recomputed from its recorded daily rows.

use crate::ledger::DailyResult;
use crate::utils::{round_price, safe_div, stat_to_decimal, to_f64};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Trading days per year used to annualize returns.
pub const ANNUAL_TRADING_DAYS: u32 = 240;

/// Net P&L beyond which a day counts as a profit (or loss) day.
const PNL_DAY_THRESHOLD: Decimal = dec!(0.01);

/// Reported figures are rounded to this many places.
const REPORT_DECIMALS: u32 = 3;

/// One analyzed day of the balance curve.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub balance: Decimal,
    /// Log return against the previous day, 0 on the first day
    pub log_return: f64,
    pub high_level: Decimal,
    /// Balance minus running high, never positive
    pub drawdown: Decimal,
    pub dd_percent: Decimal,
}

/// Performance summary of one episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_no: u32,
    pub start_balance: Decimal,
    pub end_balance: Decimal,
    /// Days settled by the ledger, warm-up included
    pub open_days: u32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Days analyzed, warm-up excluded
    pub total_days: u32,
    pub first_trade_day: Option<NaiveDate>,
    pub last_trade_day: Option<NaiveDate>,
    pub days_have_trade: u32,
    /// Analyzed days after the last day with a trade
    pub end_lazy_days: u32,
    pub profit_days: u32,
    pub loss_days: u32,
    pub max_drawdown: Decimal,
    pub max_dd_percent: Decimal,
    pub total_net_pnl: Decimal,
    pub daily_net_pnl: Decimal,
    pub total_commission: Decimal,
    pub daily_commission: Decimal,
    pub total_slippage: Decimal,
    pub daily_slippage: Decimal,
    pub total_turnover: Decimal,
    pub daily_turnover: Decimal,
    pub total_trade_count: u32,
    pub daily_trade_count: Decimal,
    pub total_return: Decimal,
    pub annualized_return: Decimal,
    pub daily_return: Decimal,
    pub return_std: Decimal,
    pub sharpe_ratio: Decimal,
    /// Price move of the replayed data itself, first open to last close, in percent
    pub origin_gain: Decimal,
    pub steps_in_episode: u64,
    /// Wall-clock time of the replay. Reported but never serialized, so
    /// recorded rows of identical replays stay identical.
    #[serde(skip)]
    pub episode_duration_ms: u64,
    pub reason: String,
}

impl EpisodeSummary {
    /// Summary of an episode that settled no day at all.
    pub fn empty(episode_no: u32, start_balance: Decimal) -> Self {
        Self {
            episode_no,
            start_balance,
            end_balance: start_balance,
            ..Default::default()
        }
    }

    fn format_day(day: Option<NaiveDate>) -> String {
        day.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
    }

    /// Text report of the summary.
    pub fn report(&self) -> String {
        format!(
            r#"═══════════════════════════════════════════════
EPISODE {} ({})
═══════════════════════════════════════════════
WINDOW
  Replayed:          {} ~ {} ({} days, {} settled)
  Market Move:       {}%
  Trading Days:      {} ({} profit, {} loss) {} ~ {} +{} idle

BALANCE
  Start Balance:     {:.2}
  End Balance:       {:.2}
  Max Drawdown:      {:.2} ({:.3}%)

P&L
  Total Net P&L:     {:.2} ({:.2}/day)
  Commission:        {:.2} ({:.2}/day)
  Slippage:          {:.2} ({:.2}/day)
  Turnover:          {:.2} ({:.2}/day)
  Trades:            {} ({:.3}/day)

RETURNS
  Total Return:      {:.3}%
  Annualized:        {:.3}%
  Daily Mean:        {:.3}%
  Daily Std:         {:.3}%
  Sharpe Ratio:      {:.3}

RUN
  Steps:             {}
  Duration:          {}ms
═══════════════════════════════════════════════"#,
            self.episode_no,
            self.reason,
            Self::format_day(self.start_date),
            Self::format_day(self.end_date),
            self.total_days,
            self.open_days,
            self.origin_gain,
            self.days_have_trade,
            self.profit_days,
            self.loss_days,
            Self::format_day(self.first_trade_day),
            Self::format_day(self.last_trade_day),
            self.end_lazy_days,
            self.start_balance,
            self.end_balance,
            self.max_drawdown,
            self.max_dd_percent,
            self.total_net_pnl,
            self.daily_net_pnl,
            self.total_commission,
            self.daily_commission,
            self.total_slippage,
            self.daily_slippage,
            self.total_turnover,
            self.daily_turnover,
            self.total_trade_count,
            self.daily_trade_count,
            self.total_return,
            self.annualized_return,
            self.daily_return,
            self.return_std,
            self.sharpe_ratio,
            self.steps_in_episode,
            self.episode_duration_ms,
        )
    }
}

/// Turns a daily result sequence into an [`EpisodeSummary`].
#[derive(Debug, Clone)]
pub struct PerformanceAnalyzer {
    start_balance: Decimal,
    annual_trading_days: u32,
}

impl PerformanceAnalyzer {
    pub fn new(start_balance: Decimal, annual_trading_days: u32) -> Self {
        Self {
            start_balance,
            annual_trading_days: annual_trading_days.max(1),
        }
    }

    /// Balance curve with log returns and drawdowns.
    ///
    /// Balances are rebuilt as `start_balance + cumulative net P&L`.
    pub fn daily_series(&self, results: &[DailyResult]) -> Vec<DailyStat> {
        let mut balance = self.start_balance;
        let mut high_level: Option<Decimal> = None;
        let mut previous: Option<Decimal> = None;

        results
            .iter()
            .map(|result| {
                balance += result.net_pnl;
                let high = high_level.map_or(balance, |h| h.max(balance));
                high_level = Some(high);

                let log_return = match previous {
                    Some(prev) if prev > Decimal::ZERO && balance > Decimal::ZERO => {
                        to_f64(balance).ln() - to_f64(prev).ln()
                    }
                    _ => 0.0,
                };
                previous = Some(balance);

                let drawdown = balance - high;
                DailyStat {
                    date: result.date,
                    balance,
                    log_return,
                    high_level: high,
                    drawdown,
                    dd_percent: safe_div(drawdown, high) * dec!(100),
                }
            })
            .collect()
    }

    /// Summarize the analyzed days. Episode bookkeeping fields (number,
    /// steps, duration, reason, origin gain, open days) are left for the
    /// caller to fill.
    pub fn summarize(&self, results: &[DailyResult]) -> EpisodeSummary {
        let series = self.daily_series(results);
        let (Some(first), Some(last)) = (series.first(), series.last()) else {
            return EpisodeSummary::empty(0, self.start_balance);
        };

        let total_days = results.len() as u32;
        let days = Decimal::from(total_days);
        let end_balance = last.balance;

        let trade_days: Vec<(usize, NaiveDate)> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.buy_count + r.sell_count > 0)
            .map(|(i, r)| (i, r.date))
            .collect();
        let end_lazy_days = match trade_days.last() {
            Some((index, _)) => total_days - *index as u32 - 1,
            None => total_days,
        };

        let total_net_pnl: Decimal = results.iter().map(|r| r.net_pnl).sum();
        let total_commission: Decimal = results.iter().map(|r| r.commission).sum();
        let total_slippage: Decimal = results.iter().map(|r| r.slippage).sum();
        let total_turnover: Decimal = results.iter().map(|r| r.turnover).sum();
        let total_trade_count: u32 = results.iter().map(|r| r.buy_count + r.sell_count).sum();

        let max_drawdown = series.iter().map(|s| s.drawdown).min().unwrap_or(Decimal::ZERO);
        let max_dd_percent = series.iter().map(|s| s.dd_percent).min().unwrap_or(Decimal::ZERO);

        let growth = to_f64(safe_div(end_balance, self.start_balance));
        let annualized_return = if growth > 0.0 {
            let years = f64::from(total_days) / f64::from(self.annual_trading_days);
            ((growth.ln() / years).exp() - 1.0) * 100.0
        } else {
            -100.0
        };

        let returns: Vec<f64> = series.iter().map(|s| s.log_return).collect();
        let daily_return = mean(&returns) * 100.0;
        let return_std = sample_std(&returns) * 100.0;
        let sharpe_ratio = if return_std > 0.0 {
            daily_return / return_std * f64::from(self.annual_trading_days).sqrt()
        } else {
            0.0
        };

        let round = |value: Decimal| round_price(value, REPORT_DECIMALS);
        EpisodeSummary {
            start_balance: self.start_balance,
            end_balance: round(end_balance),
            start_date: Some(first.date),
            end_date: Some(last.date),
            total_days,
            open_days: total_days,
            first_trade_day: trade_days.first().map(|(_, d)| *d),
            last_trade_day: trade_days.last().map(|(_, d)| *d),
            days_have_trade: trade_days.len() as u32,
            end_lazy_days,
            profit_days: results.iter().filter(|r| r.net_pnl > PNL_DAY_THRESHOLD).count() as u32,
            loss_days: results.iter().filter(|r| r.net_pnl < -PNL_DAY_THRESHOLD).count() as u32,
            max_drawdown: round(max_drawdown),
            max_dd_percent: round(max_dd_percent),
            total_net_pnl: round(total_net_pnl),
            daily_net_pnl: round(total_net_pnl / days),
            total_commission: round(total_commission),
            daily_commission: round(total_commission / days),
            total_slippage: round(total_slippage),
            daily_slippage: round(total_slippage / days),
            total_turnover: round(total_turnover),
            daily_turnover: round(total_turnover / days),
            total_trade_count,
            daily_trade_count: round(Decimal::from(total_trade_count) / days),
            total_return: round((safe_div(end_balance, self.start_balance) - Decimal::ONE) * dec!(100)),
            annualized_return: stat_to_decimal(annualized_return, REPORT_DECIMALS),
            daily_return: stat_to_decimal(daily_return, REPORT_DECIMALS),
            return_std: stat_to_decimal(return_std, REPORT_DECIMALS),
            sharpe_ratio: stat_to_decimal(sharpe_ratio, REPORT_DECIMALS),
            ..Default::default()
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with one degree of freedom removed; 0 below two samples.
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn day(d: u32, net_pnl: Decimal, buys: u32, sells: u32) -> DailyResult {
        DailyResult {
            date: NaiveDate::from_ymd_opt(2024, 3, d).unwrap(),
            open_position: Decimal::ZERO,
            close_position: Decimal::ZERO,
            trading_pnl: net_pnl,
            position_pnl: Decimal::ZERO,
            commission: Decimal::from(buys + sells) * dec!(5),
            slippage: Decimal::ZERO,
            turnover: Decimal::from(buys + sells) * dec!(10000),
            buy_count: buys,
            sell_count: sells,
            net_pnl,
            cash: Decimal::ZERO,
            market_value: Decimal::ZERO,
            end_balance: Decimal::ZERO,
        }
    }

    fn sample_days() -> Vec<DailyResult> {
        vec![
            day(1, dec!(1000), 1, 0),
            day(4, dec!(-2000), 0, 1),
            day(5, dec!(500), 0, 0),
        ]
    }

    // =========================================================================
    // Series Tests
    // =========================================================================

    #[test]
    fn test_daily_series_drawdown() {
        let analyzer = PerformanceAnalyzer::new(dec!(100000), ANNUAL_TRADING_DAYS);
        let series = analyzer.daily_series(&sample_days());

        let balances: Vec<Decimal> = series.iter().map(|s| s.balance).collect();
        assert_eq!(balances, vec![dec!(101000), dec!(99000), dec!(99500)]);
        assert!(series.iter().all(|s| s.high_level == dec!(101000)));
        assert_eq!(series[1].drawdown, dec!(-2000));
        assert_eq!(series[2].drawdown, dec!(-1500));
        assert_eq!(series[0].log_return, 0.0);
        assert_relative_eq!(series[1].log_return, (99000f64 / 101000f64).ln(), epsilon = 1e-12);
    }

    // =========================================================================
    // Summary Tests
    // =========================================================================

    #[test]
    fn test_summary_counts_and_totals() {
        let analyzer = PerformanceAnalyzer::new(dec!(100000), ANNUAL_TRADING_DAYS);
        let summary = analyzer.summarize(&sample_days());

        assert_eq!(summary.end_balance, dec!(99500));
        assert_eq!(summary.total_days, 3);
        assert_eq!(summary.profit_days, 2);
        assert_eq!(summary.loss_days, 1);
        assert_eq!(summary.days_have_trade, 2);
        assert_eq!(summary.first_trade_day, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(summary.last_trade_day, NaiveDate::from_ymd_opt(2024, 3, 4));
        assert_eq!(summary.end_lazy_days, 1);
        assert_eq!(summary.total_trade_count, 2);
        assert_eq!(summary.total_commission, dec!(10));
        assert_eq!(summary.total_net_pnl, dec!(-500));
        assert_eq!(summary.daily_net_pnl, dec!(-166.667));
        assert_eq!(summary.max_drawdown, dec!(-2000));
        assert_eq!(summary.max_dd_percent, dec!(-1.980));
        assert_eq!(summary.total_return, dec!(-0.5));
    }

    #[test]
    fn test_summary_statistics() {
        let analyzer = PerformanceAnalyzer::new(dec!(100000), ANNUAL_TRADING_DAYS);
        let summary = analyzer.summarize(&sample_days());

        let returns = [0.0, (99000f64 / 101000f64).ln(), (99500f64 / 99000f64).ln()];
        let m = returns.iter().sum::<f64>() / 3.0;
        let std = (returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / 2.0).sqrt();
        let annualized = (0.995f64.powf(80.0) - 1.0) * 100.0;

        assert_relative_eq!(to_f64(summary.daily_return), m * 100.0, epsilon = 1e-3);
        assert_relative_eq!(to_f64(summary.return_std), std * 100.0, epsilon = 1e-3);
        assert_relative_eq!(
            to_f64(summary.sharpe_ratio),
            m / std * 240f64.sqrt(),
            epsilon = 1e-2
        );
        assert_relative_eq!(to_f64(summary.annualized_return), annualized, epsilon = 1e-3);
    }

    #[test]
    fn test_flat_days_have_zero_sharpe() {
        let analyzer = PerformanceAnalyzer::new(dec!(100000), ANNUAL_TRADING_DAYS);
        let summary = analyzer.summarize(&[day(1, dec!(0), 0, 0), day(4, dec!(0), 0, 0)]);

        assert_eq!(summary.sharpe_ratio, Decimal::ZERO);
        assert_eq!(summary.return_std, Decimal::ZERO);
        assert_eq!(summary.end_lazy_days, 2);
        assert_eq!(summary.first_trade_day, None);
        assert_eq!(summary.annualized_return, Decimal::ZERO);
    }

    #[test]
    fn test_empty_summary_and_report() {
        let analyzer = PerformanceAnalyzer::new(dec!(100000), ANNUAL_TRADING_DAYS);
        let summary = analyzer.summarize(&[]);
        assert_eq!(summary.end_balance, dec!(100000));
        assert_eq!(summary.total_days, 0);

        let report = summary.report();
        assert!(report.contains("EPISODE 0"));
        assert!(report.contains("End Balance:       100000.00"));
    }
}
