//! Market Replay - command line entry point.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use market_replay::backtest::{
    CsvEventLoader, EpisodeController, EventCache, OptimizeTarget, ParameterSpace, SweepRunner,
};
use market_replay::config::Config;
use market_replay::persistence::{NullRecorder, Recorder, SqliteRecorder};
use market_replay::strategy::SmaCrossTrader;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Market Replay CLI
#[derive(Parser)]
#[command(name = "market-replay")]
#[command(version, about = "Deterministic market replay and backtesting")]
struct Cli {
    /// Config file (defaults to an optional ./config.*)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DataArgs {
    /// CSV data files (bars by default)
    #[arg(short, long, required = true, num_args = 1..)]
    data: Vec<String>,

    /// Symbol for rows without a symbol column (defaults to the file name)
    #[arg(short, long)]
    symbol: Option<String>,

    /// Exchange code stamped on loaded events
    #[arg(long, default_value = "")]
    exchange: String,

    /// Files hold ticks instead of one-minute bars
    #[arg(long)]
    ticks: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay episodes with the moving-average trader
    Run {
        #[command(flatten)]
        data: DataArgs,

        /// Number of episodes to replay
        #[arg(short = 'n', long)]
        episodes: Option<u32>,

        /// First replayed date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Last replayed date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// SQLite file receiving every recorded row
        #[arg(long)]
        db: Option<String>,
    },

    /// Run a parameter sweep
    Sweep {
        #[command(flatten)]
        data: DataArgs,

        /// Parameter ranges: `name=start:end:step` or `name=v1,v2,...`
        #[arg(short, long = "param", required = true)]
        params: Vec<String>,

        /// Figure to maximize: sharpe, return or balance
        #[arg(short, long, default_value = "sharpe")]
        target: String,

        /// Number of parallel replays
        #[arg(short, long, default_value = "4")]
        parallelism: usize,

        /// Output directory for results
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Print episode summaries stored in a SQLite file
    Report {
        /// Path to SQLite database
        #[arg(long, default_value = "data/replay.db")]
        db: String,

        /// Only summaries of this run label
        #[arg(long)]
        run: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    match cli.command {
        Commands::Run {
            data,
            episodes,
            start,
            end,
            db,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(n) = episodes {
                config.episode.episode_count = n;
            }
            if let Some(s) = start {
                config.episode.start_date = Some(parse_date(&s)?);
            }
            if let Some(e) = end {
                config.episode.end_date = Some(parse_date(&e)?);
            }
            if db.is_some() {
                config.recorder.db_path = db;
            }
            config.validate()?;
            run_replay(config, &data).await
        }
        Commands::Sweep {
            data,
            params,
            target,
            parallelism,
            output,
        } => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            run_sweep(config, &data, &params, &target, parallelism, output.as_deref()).await
        }
        Commands::Report { db, run } => show_report(&db, run.as_deref()),
    }
}

/// Initialize logging to stdout and a daily rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "market-replay.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the whole process
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("market_replay=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let config = Config::load_from(path)?;
    info!("📋 Configuration:");
    info!("   Start Balance: {}", config.account.start_balance);
    info!(
        "   Commission: {} (min {}), Stamp Tax: {}",
        config.account.commission_rate, config.account.minimum_commission, config.account.stamp_tax_rate
    );
    info!("   Max Drawdown: {}%", config.episode.max_drawdown_pct);
    info!(
        "   Warm-up Days: {}, Episodes: {}",
        config.episode.warmup_days, config.episode.episode_count
    );
    info!("   Trading Timeframe: {}", config.episode.trading_timeframe);
    Ok(config)
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid date '{}'", s))
}

/// Load every data file into one cache.
fn load_cache(args: &DataArgs, config: &Config) -> Result<EventCache> {
    let mut events = Vec::new();
    for path in &args.data {
        let symbol = match &args.symbol {
            Some(s) => s.clone(),
            None => Path::new(path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .with_context(|| format!("Cannot derive a symbol from '{}'", path))?,
        };
        let loader = CsvEventLoader::new(&symbol, market_replay::market::Timeframe::MINUTE)
            .with_exchange(&args.exchange);
        if args.ticks {
            events.extend(loader.load_ticks(path)?);
        } else {
            events.extend(loader.load_bars(path)?);
        }
    }

    let cache = EventCache::from_events(events);
    if let Some((first, last)) = cache.available_range() {
        info!("   Data range: {} to {}", first, last);
    }
    info!("   Symbols: {:?}", cache.symbols());
    info!("   Events: {}", cache.len());
    if args.ticks && !config.episode.match_raw_ticks {
        info!("   Ticks aggregate into {} bars", config.episode.trading_timeframe);
    }
    Ok(cache)
}

/// Replay the configured number of episodes.
async fn run_replay(config: Config, data: &DataArgs) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              REPLAY MODE                                   ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let cache = load_cache(data, &config)?;

    let recorder: Box<dyn Recorder> = match &config.recorder.db_path {
        Some(path) => {
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let label = Local::now().format("%Y%m%d-%H%M%S").to_string();
            Box::new(SqliteRecorder::open(path, &label)?)
        }
        None => Box::new(NullRecorder),
    };

    let mut trader = SmaCrossTrader::from_config(&config.strategy, config.account.lot_size);
    let mut controller = EpisodeController::new(config, Box::new(cache), recorder);

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current episode");
            stop.store(true, Ordering::Relaxed);
        }
    });

    let summaries = tokio::task::spawn_blocking(move || controller.run(&mut trader))
        .await
        .context("Replay worker panicked")??;

    for summary in &summaries {
        println!("\n{}", summary.report());
    }
    Ok(())
}

/// Parse `name=start:end:step` or `name=v1,v2,...` into the space.
fn add_parameter_arg(space: &mut ParameterSpace, arg: &str) -> Result<()> {
    let (name, values) = arg
        .split_once('=')
        .with_context(|| format!("Parameter '{}' must look like name=values", arg))?;
    let parse = |s: &str| {
        Decimal::from_str(s.trim()).with_context(|| format!("Invalid number '{}' in '{}'", s, arg))
    };

    let range: Vec<&str> = values.split(':').collect();
    match range.as_slice() {
        [start, end, step] => {
            space.add_parameter(name.trim(), parse(start)?, parse(end)?, parse(step)?);
        }
        [_] => {
            let list = values.split(',').map(parse).collect::<Result<Vec<_>>>()?;
            space.add_values(name.trim(), list);
        }
        _ => anyhow::bail!("Range '{}' must be start:end:step", values),
    }
    Ok(())
}

/// Run a parameter sweep.
async fn run_sweep(
    config: Config,
    data: &DataArgs,
    params: &[String],
    target: &str,
    parallelism: usize,
    output_dir: Option<&str>,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║           PARAMETER SWEEP MODE                             ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    let cache = load_cache(data, &config)?;

    let mut space = ParameterSpace::new();
    for arg in params {
        add_parameter_arg(&mut space, arg)?;
    }
    let target = OptimizeTarget::from_str(target)?;

    info!("   Combinations to test: {}", space.combination_count());
    info!("⚡ Parallelism: {}", parallelism);

    let runner = SweepRunner::new(space, config, parallelism).with_target(target);
    let results = runner.run(cache).await?;

    println!("\n{}", results.summary());

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)?;

        let results_path = format!("{}/sweep_results.csv", dir);
        results.to_csv(&results_path)?;
        info!("📁 Sweep results saved to: {}", results_path);
    }

    Ok(())
}

/// Print stored episode summaries.
fn show_report(db_path: &str, run: Option<&str>) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        return Ok(());
    }

    let store = SqliteRecorder::open(db_path, "report")?;
    let stored = store.summaries(run)?;
    if stored.is_empty() {
        println!("\n❌ No episode summaries found.");
        return Ok(());
    }

    for entry in &stored {
        println!("\nRun {}", entry.run_label);
        println!("{}", entry.summary.report());
    }
    Ok(())
}
