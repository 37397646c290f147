//! Parameter sweep runner.
//!
//! Replays the same cached history once per parameter combination, one
//! private controller per combination, several at a time.

use crate::backtest::{EpisodeController, EpisodeSummary, EventCache};
use crate::config::Config;
use crate::persistence::NullRecorder;
use crate::strategy::{OrderIntentSource, SmaCrossTrader};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Builds the intent source for one sweep run.
pub type IntentFactory = Arc<dyn Fn(&Config) -> Box<dyn OrderIntentSource> + Send + Sync>;

/// Named value lists whose cartesian product is explored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSpace {
    parameters: Vec<(String, Vec<Decimal>)>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the inclusive range `start..=end` by `step`.
    ///
    /// A non-positive step or an end below the start yields `start` alone.
    pub fn add_parameter(&mut self, name: &str, start: Decimal, end: Decimal, step: Decimal) -> &mut Self {
        let mut values = vec![start];
        if step > Decimal::ZERO && end > start {
            let mut value = start + step;
            while value <= end {
                values.push(value);
                value += step;
            }
        }
        self.add_values(name, values)
    }

    /// Add an explicit value list; a repeated name replaces the earlier list.
    pub fn add_values(&mut self, name: &str, values: Vec<Decimal>) -> &mut Self {
        match self.parameters.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = values,
            None => self.parameters.push((name.to_string(), values)),
        }
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|(n, _)| n.as_str())
    }

    pub fn combination_count(&self) -> usize {
        if self.parameters.is_empty() {
            return 0;
        }
        self.parameters.iter().map(|(_, v)| v.len()).product()
    }

    /// Every combination, the first parameter varying slowest.
    pub fn generate_settings(&self) -> Vec<ParameterSetting> {
        if self.parameters.is_empty() {
            return Vec::new();
        }

        let mut settings = vec![ParameterSetting::default()];
        for (name, values) in &self.parameters {
            settings = settings
                .into_iter()
                .flat_map(|base| {
                    values.iter().map(move |value| {
                        let mut setting = base.clone();
                        setting.values.push((name.clone(), *value));
                        setting
                    })
                })
                .collect();
        }
        settings
    }
}

/// One combination of parameter values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSetting {
    pub values: Vec<(String, Decimal)>,
}

impl ParameterSetting {
    /// `base` with every value of this setting applied.
    pub fn apply(&self, base: &Config) -> Result<Config> {
        let mut config = base.clone();
        for (name, value) in &self.values {
            config.apply_setting(name, *value)?;
        }
        config
            .validate()
            .with_context(|| format!("Invalid combination {}", self))?;
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<Decimal> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

impl fmt::Display for ParameterSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// Figure a sweep maximizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeTarget {
    #[default]
    SharpeRatio,
    TotalReturn,
    EndBalance,
}

impl OptimizeTarget {
    pub fn value_of(&self, summary: &EpisodeSummary) -> Decimal {
        match self {
            Self::SharpeRatio => summary.sharpe_ratio,
            Self::TotalReturn => summary.total_return,
            Self::EndBalance => summary.end_balance,
        }
    }
}

impl FromStr for OptimizeTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sharpe" | "sharpe_ratio" | "sharperatio" => Ok(Self::SharpeRatio),
            "return" | "total_return" | "totalreturn" => Ok(Self::TotalReturn),
            "balance" | "end_balance" | "endbalance" => Ok(Self::EndBalance),
            other => anyhow::bail!("Unknown optimize target '{}'", other),
        }
    }
}

impl fmt::Display for OptimizeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SharpeRatio => "sharpe_ratio",
            Self::TotalReturn => "total_return",
            Self::EndBalance => "end_balance",
        };
        f.write_str(name)
    }
}

/// Outcome of one combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRun {
    pub setting: ParameterSetting,
    /// Summary of the last episode replayed for this setting
    pub summary: EpisodeSummary,
}

/// Results from a parameter sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResults {
    /// Successful runs, in combination order
    pub runs: Vec<SweepRun>,
    pub target: OptimizeTarget,
    /// Index into `runs` of the best run by `target`
    pub best_index: Option<usize>,
    pub total_combinations: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
}

impl SweepResults {
    pub fn best(&self) -> Option<&SweepRun> {
        self.best_index.and_then(|i| self.runs.get(i))
    }

    /// Export one row per run.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let parameter_names: Vec<String> = self
            .runs
            .first()
            .map(|run| run.setting.values.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default();

        let mut header = parameter_names.clone();
        header.extend(
            [
                "end_balance",
                "total_return",
                "annualized_return",
                "max_dd_percent",
                "sharpe_ratio",
                "total_trade_count",
                "reason",
            ]
            .map(String::from),
        );
        writer.write_record(&header)?;

        for run in &self.runs {
            let mut record: Vec<String> = run.setting.values.iter().map(|(_, v)| v.to_string()).collect();
            let s = &run.summary;
            record.extend([
                s.end_balance.to_string(),
                s.total_return.to_string(),
                s.annualized_return.to_string(),
                s.max_dd_percent.to_string(),
                s.sharpe_ratio.to_string(),
                s.total_trade_count.to_string(),
                s.reason.clone(),
            ]);
            writer.write_record(&record)?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Text comparison of the sweep.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str("PARAMETER SWEEP RESULTS\n");
        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str(&format!(
            "Total: {} | Successful: {} | Failed: {}\n\n",
            self.total_combinations, self.successful_runs, self.failed_runs
        ));

        if let Some(run) = self.best() {
            s.push_str(&format!("BEST BY {}:\n", self.target.to_string().to_uppercase()));
            s.push_str(&format!("  Setting: {}\n", run.setting));
            s.push_str(&format!(
                "  Sharpe: {:.3} | Return: {:.2}% | MaxDD: {:.2}% | Balance: {:.2}\n",
                run.summary.sharpe_ratio,
                run.summary.total_return,
                run.summary.max_dd_percent,
                run.summary.end_balance
            ));
        }

        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s
    }
}

/// Runs every combination of a [`ParameterSpace`] over one [`EventCache`].
pub struct SweepRunner {
    space: ParameterSpace,
    base_config: Config,
    parallelism: usize,
    target: OptimizeTarget,
    intents: IntentFactory,
}

impl SweepRunner {
    /// Sweep driving the built-in moving-average trader.
    pub fn new(space: ParameterSpace, base_config: Config, parallelism: usize) -> Self {
        Self {
            space,
            base_config,
            parallelism: parallelism.max(1),
            target: OptimizeTarget::default(),
            intents: Arc::new(|config: &Config| -> Box<dyn OrderIntentSource> {
                Box::new(SmaCrossTrader::from_config(&config.strategy, config.account.lot_size))
            }),
        }
    }

    pub fn with_target(mut self, target: OptimizeTarget) -> Self {
        self.target = target;
        self
    }

    /// Use another intent source per run.
    pub fn with_intents(mut self, factory: IntentFactory) -> Self {
        self.intents = factory;
        self
    }

    /// Run the sweep. Invalid combinations fail the whole sweep up front;
    /// a run that aborts counts as failed.
    pub async fn run(&self, cache: EventCache) -> Result<SweepResults> {
        let settings = self.space.generate_settings();
        let total_combinations = settings.len();
        let configs = settings
            .iter()
            .map(|setting| setting.apply(&self.base_config))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Starting parameter sweep with {} combinations, parallelism={}",
            total_combinations, self.parallelism
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::with_capacity(total_combinations);

        for (i, (setting, config)) in settings.into_iter().zip(configs).enumerate() {
            let sem = Arc::clone(&semaphore);
            let cache = cache.clone();
            let factory = Arc::clone(&self.intents);

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                info!("[{}/{}] Testing: {}", i + 1, total_combinations, setting);

                let replay = tokio::task::spawn_blocking(move || {
                    let mut intents = factory(&config);
                    let mut controller =
                        EpisodeController::new(config, Box::new(cache), Box::new(NullRecorder));
                    controller.run(intents.as_mut())
                })
                .await;

                match replay {
                    Ok(Ok(mut summaries)) => {
                        let summary = summaries.pop()?;
                        info!(
                            "[{}/{}] Complete: Sharpe={:.3} Return={:.2}%",
                            i + 1,
                            total_combinations,
                            summary.sharpe_ratio,
                            summary.total_return
                        );
                        Some(SweepRun { setting, summary })
                    }
                    Ok(Err(e)) => {
                        warn!("[{}/{}] Failed: {}", i + 1, total_combinations, e);
                        None
                    }
                    Err(e) => {
                        warn!("[{}/{}] Worker panicked: {}", i + 1, total_combinations, e);
                        None
                    }
                }
            });

            handles.push(handle);
        }

        let mut runs = Vec::new();
        let mut failed_runs = 0;
        for handle in handles {
            match handle.await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => failed_runs += 1,
                Err(e) => {
                    warn!("Task panicked: {}", e);
                    failed_runs += 1;
                }
            }
        }

        // First run wins ties
        let mut best_index: Option<usize> = None;
        for (i, run) in runs.iter().enumerate() {
            let value = self.target.value_of(&run.summary);
            if best_index.map_or(true, |b| value > self.target.value_of(&runs[b].summary)) {
                best_index = Some(i);
            }
        }

        Ok(SweepResults {
            successful_runs: runs.len(),
            runs,
            target: self.target,
            best_index,
            total_combinations,
            failed_runs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::test_support::*;
    use crate::matching::{OrderCommand, OrderSide, PlaceOrder};
    use crate::strategy::ScriptedIntents;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Test Helpers
    // =========================================================================

    fn rising_cache() -> EventCache {
        let events = [(1, dec!(10.00)), (4, dec!(10.50)), (5, dec!(11.00))]
            .iter()
            .flat_map(|(day, price)| {
                (31..36).map(move |m| minute_event(flat_bar("000001", ts(*day, 9, m), *price)))
            })
            .collect();
        EventCache::from_events(events)
    }

    fn base_config() -> Config {
        let mut config = Config::default();
        config.episode.warmup_days = 0;
        config
    }

    // =========================================================================
    // Parameter Space Tests
    // =========================================================================

    #[test]
    fn test_add_parameter_ranges() {
        let mut space = ParameterSpace::new();
        space
            .add_parameter("a", dec!(1), dec!(2), dec!(0.5))
            .add_parameter("b", dec!(5), dec!(9), dec!(0))
            .add_parameter("c", dec!(3), dec!(1), dec!(1));

        let settings = space.generate_settings();
        assert_eq!(space.combination_count(), 3);
        assert_eq!(settings.len(), 3);
        let a: Vec<Decimal> = settings.iter().filter_map(|s| s.get("a")).collect();
        assert_eq!(a, vec![dec!(1), dec!(1.5), dec!(2)]);
        assert!(settings.iter().all(|s| s.get("b") == Some(dec!(5))));
        assert!(settings.iter().all(|s| s.get("c") == Some(dec!(3))));
    }

    #[test]
    fn test_generate_settings_order() {
        let mut space = ParameterSpace::new();
        space
            .add_values("strategy.fast_period", vec![dec!(2), dec!(3)])
            .add_values("strategy.slow_period", vec![dec!(10), dec!(20)]);

        let described: Vec<String> = space.generate_settings().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            described,
            vec![
                "strategy.fast_period=2 strategy.slow_period=10",
                "strategy.fast_period=2 strategy.slow_period=20",
                "strategy.fast_period=3 strategy.slow_period=10",
                "strategy.fast_period=3 strategy.slow_period=20",
            ]
        );
        assert_eq!(space.names().collect::<Vec<_>>(), vec!["strategy.fast_period", "strategy.slow_period"]);
        assert!(ParameterSpace::new().generate_settings().is_empty());
    }

    #[test]
    fn test_setting_apply_validates() {
        let setting = ParameterSetting {
            values: vec![("fast_period".to_string(), dec!(30))],
        };
        // fast 30 >= slow 20
        assert!(setting.apply(&Config::default()).is_err());

        let ok = ParameterSetting {
            values: vec![("account.start_balance".to_string(), dec!(50000))],
        };
        assert_eq!(ok.apply(&Config::default()).unwrap().account.start_balance, dec!(50000));
    }

    #[test]
    fn test_optimize_target_parsing() {
        assert_eq!("sharpe".parse::<OptimizeTarget>().unwrap(), OptimizeTarget::SharpeRatio);
        assert_eq!("end_balance".parse::<OptimizeTarget>().unwrap(), OptimizeTarget::EndBalance);
        assert!("calmar".parse::<OptimizeTarget>().is_err());
    }

    // =========================================================================
    // Sweep Tests
    // =========================================================================

    #[tokio::test]
    async fn test_sweep_picks_best_balance() {
        let mut space = ParameterSpace::new();
        space.add_values("account.start_balance", vec![dec!(50000), dec!(100000)]);

        let factory: IntentFactory = Arc::new(|_: &Config| -> Box<dyn OrderIntentSource> {
            Box::new(ScriptedIntents::new().at(
                ts(1, 9, 31),
                OrderCommand::Place(PlaceOrder::limit("000001", OrderSide::Buy, dec!(10), dec!(1000))),
            ))
        });
        let runner = SweepRunner::new(space, base_config(), 2)
            .with_target(OptimizeTarget::EndBalance)
            .with_intents(factory);

        let results = runner.run(rising_cache()).await.unwrap();

        assert_eq!(results.total_combinations, 2);
        assert_eq!(results.successful_runs, 2);
        assert_eq!(results.failed_runs, 0);
        assert_eq!(results.runs[0].summary.end_balance, dec!(50979));
        assert_eq!(results.runs[1].summary.end_balance, dec!(100979));
        assert_eq!(results.best().unwrap().setting.get("account.start_balance"), Some(dec!(100000)));
        assert!(results.summary().contains("BEST BY END_BALANCE"));
    }

    #[tokio::test]
    async fn test_sweep_with_default_trader_and_csv_export() {
        let mut space = ParameterSpace::new();
        space.add_parameter("strategy.fast_period", dec!(2), dec!(3), dec!(1));

        let results = SweepRunner::new(space, base_config(), 1)
            .run(rising_cache())
            .await
            .unwrap();
        assert_eq!(results.successful_runs, 2);
        assert!(results.best().is_some());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        results.to_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("strategy.fast_period,end_balance,total_return,annualized_return,max_dd_percent,sharpe_ratio,total_trade_count,reason")
        );
        assert_eq!(lines.count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_combination_fails_sweep() {
        let mut space = ParameterSpace::new();
        space.add_values("no_such_setting", vec![dec!(1)]);
        let runner = SweepRunner::new(space, base_config(), 1);
        assert!(runner.run(rising_cache()).await.is_err());
    }
}
