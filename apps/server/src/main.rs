//! Sentinel - Alert Processing Engine
//!
//! Evaluates stored alert rules against market data on a fixed cadence and
//! delivers notifications for the ones that fire.

mod config;
mod state;

use clap::Parser;
use config::{AppConfig, SimulatedSymbol};
use sentinel_alerts::{
    CycleRunner, Database, Dispatcher, EmailChannel, EmailConfig, EngineConfig, EngineError, InAppChannel,
    RateLimiter,
};
use sentinel_core::{LookbackPeriod, NewsArticle, Quote, Sentiment};
use sentinel_feeds::{MarketDataProvider, RestMarketData, StaticMarketData};
use state::{create_state, SharedState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Sentinel CLI
#[derive(Parser, Debug)]
#[command(name = "sentinel")]
#[command(about = "Market alert processing engine", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seconds between cycles
    #[arg(short, long, default_value_t = 60)]
    interval_secs: u64,

    /// Run a single cycle, print its report and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Use a simulated market instead of the REST API
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Database URL (overrides config and DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

fn init_logging(level: &str) {
    let level = parse_level(level);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Seed the simulated market with quotes, history, baselines and news.
fn seed_market(market: &StaticMarketData, symbols: &[SimulatedSymbol]) {
    let now = chrono::Utc::now();
    for s in symbols {
        market.set_quote(
            &s.symbol,
            Quote {
                price: s.price,
                change_pct: 0.0,
                volume: s.volume,
                avg_volume: Some(s.volume),
            },
        );
        market.set_historical_price(&s.symbol, LookbackPeriod::OneDay, s.price * 0.99);
        market.set_historical_price(&s.symbol, LookbackPeriod::OneWeek, s.price * 0.96);
        market.set_historical_price(&s.symbol, LookbackPeriod::OneMonth, s.price * 0.92);
        market.set_average_volume(&s.symbol, 90, s.volume * 0.9);
        market.set_news(
            &s.symbol,
            vec![NewsArticle {
                headline: format!("{} reports quarterly earnings ahead of estimates", s.symbol),
                summary: format!("{} beat analyst expectations on revenue.", s.symbol),
                sentiment: Some(Sentiment::Positive),
                published_at: now - chrono::Duration::hours(1),
            }],
        );
    }
}

async fn run_market_simulator(state: SharedState, market: Arc<StaticMarketData>, symbols: Vec<SimulatedSymbol>) {
    info!("Starting market simulator (demo mode)");

    let mut counter = 0u64;
    while state.is_running() {
        for (i, s) in symbols.iter().enumerate() {
            let phase = counter as f64 * 0.05 + i as f64;
            let price = s.price * (1.0 + phase.sin() * 0.03);
            let volume = s.volume * (1.0 + (phase * 0.7).cos().abs() * 2.0);
            market.set_quote(
                &s.symbol,
                Quote {
                    price,
                    change_pct: (price - s.price * 0.99) / (s.price * 0.99) * 100.0,
                    volume,
                    avg_volume: Some(s.volume),
                },
            );
        }
        counter += 1;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    info!("Market simulator stopped");
}

async fn run_cycle(runner: &CycleRunner, state: &SharedState) {
    match runner.run_cycle().await {
        Ok(report) => state.stats.record_cycle(&report),
        Err(EngineError::CycleInProgress) => {
            warn!("Previous cycle still running, skipping tick");
        }
        Err(e) => {
            state.stats.record_failure();
            error!(error = %e, "Cycle aborted");
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load(&args.config)?;
    config.apply_env();
    if let Some(url) = args.database_url.clone() {
        config.database_url = url;
    }

    info!("🚀 Sentinel starting...");
    info!("  Config: {}", args.config);
    info!("  Interval: {}s", args.interval_secs);
    info!("  Simulated market: {}", args.simulate);
    info!("  Email delivery: {}", config.email.enabled);

    let state = create_state();
    state.start();

    let db = Database::connect(&config.database_url).await?;
    info!(url = %config.database_url, "Database ready");

    let mut simulator = None;
    let provider: Arc<dyn MarketDataProvider> = if args.simulate {
        let market = Arc::new(StaticMarketData::new());
        seed_market(&market, &config.simulated_symbols);
        info!("🎮 Using SIMULATED market data");
        let sim_state = state.clone();
        let sim_market = market.clone();
        let symbols = config.simulated_symbols.clone();
        simulator = Some(tokio::spawn(async move {
            run_market_simulator(sim_state, sim_market, symbols).await;
        }));
        market
    } else {
        if config.market_data.api_key.is_none() {
            warn!("MARKET_DATA_API_KEY not set, requests may be rejected");
        }
        info!(base_url = %config.market_data.base_url, "📡 Using REST market data");
        Arc::new(RestMarketData::new((&config.market_data).into())?)
    };

    let engine_config: EngineConfig = (&config.engine).into();
    let mut dispatcher = Dispatcher::new(db.clone(), &engine_config)
        .with_channel(Arc::new(InAppChannel::new(db.clone())));
    if config.email.enabled {
        let email = EmailConfig::from(&config.email).bounded_by(engine_config.delivery_timeout);
        dispatcher.register(Arc::new(EmailChannel::new(email)?));
    }

    let rate_limiter = RateLimiter::new(Arc::new(db.clone()), engine_config.tier_limits);
    let runner = CycleRunner::new(
        db.clone(),
        provider,
        Arc::new(dispatcher),
        rate_limiter,
        engine_config,
    );

    if args.once {
        let report = runner.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        state.stop();
        db.close().await;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cleanup = tokio::time::interval(Duration::from_secs(
        config.engine.cleanup_interval_secs.max(60),
    ));
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Press Ctrl+C to stop...");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_cycle(&runner, &state).await,
            _ = cleanup.tick() => {
                if let Err(e) = runner.cleanup().await {
                    warn!(error = %e, "History cleanup failed");
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
                break;
            }
        }
    }

    warn!("Shutdown signal received");
    state.stop();

    if let Some(handle) = simulator {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
    db.close().await;

    // Final stats
    let summary = state.stats.summary();
    info!("📈 Final Stats:");
    info!("  Total uptime: {} seconds", summary.uptime_secs);
    info!("  Cycles: {} ({} aborted)", summary.cycles_run, summary.cycles_failed);
    info!("  Triggers: {}", summary.triggers);
    info!("  Rate limited: {}", summary.rate_limited);
    info!(
        "  Deliveries: {} sent, {} failed",
        summary.deliveries_sent, summary.deliveries_failed
    );

    info!("👋 Sentinel stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env before reading secrets
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_level);

    if let Err(e) = run(args).await {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{AlertRule, Frequency, RuleCondition};
    use sentinel_feeds::MarketDataProvider;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["sentinel"]);
        assert_eq!(args.interval_secs, 60);
        assert!(!args.once);
        assert!(!args.simulate);
        assert!(args.database_url.is_none());
    }

    #[tokio::test]
    async fn test_simulated_cycle_integration() {
        let market = Arc::new(StaticMarketData::new());
        seed_market(&market, &SimulatedSymbol::defaults());
        assert!(market.get_quote("AAPL").await.is_ok());

        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.create_rule(&AlertRule::new(
            "demo",
            "AAPL",
            RuleCondition::PriceAbove { threshold: 100.0 },
            Frequency::Once,
        ))
        .await
        .unwrap();

        let engine_config = EngineConfig::default();
        let dispatcher = Dispatcher::new(db.clone(), &engine_config)
            .with_channel(Arc::new(InAppChannel::new(db.clone())));
        let runner = CycleRunner::new(
            db.clone(),
            market,
            Arc::new(dispatcher),
            RateLimiter::new(Arc::new(db.clone()), engine_config.tier_limits),
            engine_config,
        );

        let state = create_state();
        run_cycle(&runner, &state).await;
        assert_eq!(state.stats.summary().triggers, 1);
        assert_eq!(db.unread_notifications("demo").await.unwrap().len(), 1);
    }
}
