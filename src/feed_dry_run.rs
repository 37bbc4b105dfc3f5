use log::{error, info, warn};
use std::sync::Arc;
use trade_guard::{
    audit::{FanoutSink, LogSink, RecordingSink},
    init_logging, AuditEventKind, CoreConfig, HistoricalQuery, KillSwitch, MarketDataFeed,
    MarketDataStore, ProviderRegistry, StreamCallbacks, StreamOptions,
};

const DEFAULT_CYCLES: u64 = 3;

/// Usage: feed_dry_run [config.json] [SYMBOL ...]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1).peekable();
    let has_config = args.peek().map_or(false, |arg| arg.ends_with(".json"));
    let mut config = match args.next_if(|_| has_config) {
        Some(path) => CoreConfig::from_file(&path)?,
        None => CoreConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    init_logging(&config.logging)?;

    let symbols: Vec<String> = {
        let given: Vec<String> = args.collect();
        if given.is_empty() {
            vec!["BTC-USD".to_string()]
        } else {
            given
        }
    };

    let kill_switch = Arc::new(KillSwitch::open(&config.store.db_path)?);
    if let Err(e) = kill_switch.check_and_raise() {
        error!("Refusing to start: {}", e);
        return Err(e.into());
    }

    let store = Arc::new(MarketDataStore::open(&config.store)?);
    let registry = ProviderRegistry::with_defaults();
    let recorder = Arc::new(RecordingSink::new(256));
    let sink = Arc::new(
        FanoutSink::new()
            .with(Arc::new(LogSink))
            .with(recorder.clone()),
    );
    let feed = MarketDataFeed::from_config(&config.feed, &registry, Some(store.clone()))?
        .with_sink(sink)
        .with_kill_switch(kill_switch);
    info!("Provider chain: {}", feed.chain().names().join(" -> "));

    for symbol in &symbols {
        let query = HistoricalQuery::period(symbol.clone(), "5d", "1h");
        match feed.fetch_historical(&query).await {
            Ok(bars) => {
                info!("{}: {} hourly bars over the last 5 days", symbol, bars.len());
                if let Some(last) = bars.last() {
                    println!("latest cached {}", last);
                }
            }
            Err(e) => warn!("{}: historical fetch failed: {}", symbol, e),
        }
    }

    let mut options = StreamOptions::from(&config.stream);
    options.max_cycles = Some(DEFAULT_CYCLES);
    let mut callbacks = StreamCallbacks::new(|bar| println!("bar {}", bar))
        .on_heartbeat(|event| println!("{} {}", event.kind, event.payload))
        .on_error(|event| eprintln!("{} {}", event.kind, event.payload));

    match feed.stream(&symbols, &mut callbacks, &options).await {
        Ok(summary) => info!(
            "Stream finished: {} cycle(s), {} bar(s), {} failed cycle(s)",
            summary.cycles, summary.bars, summary.failed_cycles
        ),
        Err(e) => {
            error!("Stream stopped: {}", e);
            return Err(e.into());
        }
    }

    info!(
        "Fallbacks: {}, symbol errors: {}",
        recorder.count(AuditEventKind::ProviderFallback),
        recorder.count(AuditEventKind::SymbolError)
    );
    Ok(())
}
