//! blockrelay CLI: run the ingestor and inspect or manage its store.
//!
//! Usage:
//! ```bash
//! RPC_URL=http://localhost:8545 CHAIN_ID=8453 STORE_PATH=./relay.db blockrelay run
//! blockrelay status
//! blockrelay reset
//! blockrelay track add 0xabc...
//! ```
//!
//! Configuration is read from the environment (see `EngineConfig::from_env`).

mod logging;

use std::env;
use std::process::{self, ExitCode};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};

use blockrelay_core::config::{ContractConfig, EngineConfig, EventConfig};
use blockrelay_core::decode::StandardDecoder;
use blockrelay_core::handler::{ForwardingHandler, LogHandler};
use blockrelay_core::progress::{ProgressStore, ProgressTracker};
use blockrelay_core::registry::HandlerRegistry;
use blockrelay_core::report::{ErrorReporter, TracingReporter};
use blockrelay_core::sink::LogSink;
use blockrelay_core::tracked::{CachedTrackedAddresses, TrackedAddressSource, TrackedAddressStore};
use blockrelay_core::types::Track;
use blockrelay_evm::{HttpRpcClient, IngestorBuilder, ResumeState};
use blockrelay_storage::{InMemoryStorage, SqliteStorage};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => {
            logging::init_tracing();
            cmd_run().await
        }
        "status" => cmd_status().await,
        "reset" => cmd_reset().await,
        "track" => cmd_track(&args[2..]).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("blockrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("blockrelay {}", env!("CARGO_PKG_VERSION"));
    println!("Restart-safe block ingestion with background gap backfill\n");
    println!("USAGE:");
    println!("    blockrelay <COMMAND>\n");
    println!("COMMANDS:");
    println!("    run                   Follow chain heads and dispatch logs");
    println!("    status                Show stored progress for CHAIN_ID");
    println!("    reset                 Delete stored progress for CHAIN_ID");
    println!("    track add <ADDRESS>   Track a collection's transfers");
    println!("    track remove <ADDR>   Stop tracking a collection");
    println!("    track list            List tracked collections");
    println!("    info                  Show default configuration");
    println!("    version               Print version");
    println!("    help                  Print this help\n");
    println!("ENVIRONMENT:");
    println!("    CHAIN_ID, RPC_URL, STORE_PATH, REGISTRY_ADDRESS, ASSET_LINKED_TOPIC,");
    println!("    ASSET_UNLINKED_TOPIC, TRANSFER_TOPIC, MAX_BACKFILL_BLOCKS, INLINE_FILL_MAX_GAP,");
    println!("    BATCH_SIZE, LIVE_DELAY_MS, HISTORICAL_DELAY_MS, RUST_LOG, LOG_JSON");
}

fn load_config() -> anyhow::Result<EngineConfig> {
    EngineConfig::from_env().context("invalid configuration")
}

async fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<SqliteStorage>> {
    let Some(path) = config.store_path.as_deref() else {
        bail!("STORE_PATH is not set");
    };
    let store = SqliteStorage::open(path)
        .await
        .with_context(|| format!("opening store at {path}"))?;
    Ok(Arc::new(store))
}

// ─── run ─────────────────────────────────────────────────────────────────────

async fn cmd_run() -> anyhow::Result<()> {
    let config = load_config()?;
    let reporter: Arc<dyn ErrorReporter> = Arc::new(TracingReporter::new());

    // A store that cannot be opened is not fatal: progress is kept in memory
    // so gaps are still detected, but a restart starts from scratch.
    let store = match config.store_path.as_deref() {
        Some(path) => match SqliteStorage::open(path).await {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                tracing::warn!(path, error = %e, "progress store unavailable, running degraded");
                None
            }
        },
        None => None,
    };
    let volatile = Arc::new(InMemoryStorage::new());

    let tracked_store: Arc<dyn TrackedAddressStore> = match &store {
        Some(s) => s.clone(),
        None => volatile.clone(),
    };
    let tracked: Arc<dyn TrackedAddressSource> = Arc::new(CachedTrackedAddresses::new(
        tracked_store,
        Duration::from_secs(config.tracked_cache_ttl_secs),
    ));
    let registry = build_registry(&config, tracked, reporter.clone());
    tracing::info!(
        chain_id = config.chain_id,
        handlers = registry.len(),
        rpc = %config.rpc_url,
        "handler registry ready"
    );

    let client = HttpRpcClient::new(config.rpc_url.clone(), RPC_TIMEOUT)?;
    let mut builder = IngestorBuilder::new(config)
        .client(Arc::new(client))
        .registry(registry)
        .reporter(reporter);
    builder = match &store {
        Some(s) => builder.store(s.clone()),
        None => builder.volatile_store(volatile),
    };
    let ingestor = builder.build()?;

    let outcome = tokio::select! {
        res = ingestor.run() => res.map_err(anyhow::Error::from),
        sig = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            sig.context("waiting for ctrl-c")
        }
    };

    if let Some(s) = &store {
        s.close().await;
    }
    outcome
}

/// Asset registry link/unlink events plus the tracked-collection transfer
/// fallback, all forwarded to the log sink.
fn build_registry(
    config: &EngineConfig,
    tracked: Arc<dyn TrackedAddressSource>,
    reporter: Arc<dyn ErrorReporter>,
) -> HandlerRegistry {
    let handler: Arc<dyn LogHandler> = Arc::new(ForwardingHandler::new(
        "log-sink",
        Arc::new(StandardDecoder),
        Arc::new(LogSink),
        reporter,
    ));

    let registry_contract = ContractConfig::new("AssetRegistry", config.registry_address.clone())
        .event(EventConfig::new(
            config.asset_linked_topic.clone(),
            "AssetLinked",
            handler.clone(),
        ))
        .event(EventConfig::new(
            config.asset_unlinked_topic.clone(),
            "AssetUnlinked",
            handler.clone(),
        ));

    HandlerRegistry::from_config(config.chain_id, &[registry_contract]).with_transfer_fallback(
        config.transfer_topic.clone(),
        handler,
        tracked,
    )
}

// ─── status / reset ──────────────────────────────────────────────────────────

async fn cmd_status() -> anyhow::Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let progress: Arc<dyn ProgressStore> = store.clone();
    let tracker = ProgressTracker::with_reporter(
        Some(progress),
        config.chain_id,
        Arc::new(TracingReporter::new()),
    );

    let state = ResumeState::load(&tracker).await?;
    let tracked = store.list_tracked(config.chain_id).await?;

    let mut status = serde_json::to_value(&state)?;
    status["chainId"] = config.chain_id.into();
    status["trackedCollections"] = tracked.len().into();
    println!("{}", serde_json::to_string_pretty(&status)?);

    store.close().await;
    Ok(())
}

async fn cmd_reset() -> anyhow::Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;

    store.delete_marker(config.chain_id, Track::RealTime).await?;
    store.delete_marker(config.chain_id, Track::Historical).await?;
    store.delete_range(config.chain_id).await?;
    println!("Progress for chain {} cleared", config.chain_id);

    store.close().await;
    Ok(())
}

// ─── track ───────────────────────────────────────────────────────────────────

async fn cmd_track(args: &[String]) -> anyhow::Result<()> {
    let config = load_config()?;
    let chain_id = config.chain_id;

    let (action, address) = match args {
        [action] if action == "list" => ("list", None),
        [action, address] if action == "add" || action == "remove" => {
            (action.as_str(), Some(address.as_str()))
        }
        _ => bail!("usage: blockrelay track add <ADDRESS> | remove <ADDRESS> | list"),
    };
    if let Some(addr) = address {
        if !is_address(addr) {
            bail!("not a 20-byte hex address: {addr}");
        }
    }

    let store = open_store(&config).await?;
    match (action, address) {
        ("add", Some(addr)) => {
            let added = store.add_tracked(chain_id, addr).await?;
            println!("{}", if added { "added" } else { "already tracked" });
        }
        ("remove", Some(addr)) => {
            let removed = store.remove_tracked(chain_id, addr).await?;
            println!("{}", if removed { "removed" } else { "not tracked" });
        }
        _ => {
            for addr in store.list_tracked(chain_id).await? {
                println!("{addr}");
            }
        }
    }

    store.close().await;
    Ok(())
}

fn is_address(s: &str) -> bool {
    s.strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

fn cmd_info() {
    let defaults = EngineConfig::default();
    println!("blockrelay v{}", env!("CARGO_PKG_VERSION"));
    println!("  Max backfill range: {} blocks", defaults.max_backfill_blocks);
    println!("  Inline gap fill: disabled (INLINE_FILL_MAX_GAP)");
    println!("  Log chunk size: {}", defaults.log_chunk_size);
    println!("  Chain presets (batch / live ms / historical ms):");
    for id in [1u32, 137, 8453, 25] {
        let c = blockrelay_core::config::ChainSettings::for_chain(id);
        println!(
            "    {id:>5}: {} / {} / {}",
            c.batch_size, c.live_delay_ms, c.historical_delay_ms
        );
    }
    println!("  Storage backends: memory, SQLite");
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockrelay_core::tracked::StaticTrackedAddresses;

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::for_chain(8453);
        cfg.registry_address = Some("0x00000000000000000000000000000000000000aa".into());
        cfg.asset_linked_topic = Some("0x1111".into());
        cfg.asset_unlinked_topic = Some("0x2222".into());
        cfg
    }

    #[test]
    fn registry_wires_asset_events_and_transfer_fallback() {
        let registry = build_registry(
            &config(),
            Arc::new(StaticTrackedAddresses::new(Vec::<String>::new())),
            Arc::new(TracingReporter::new()),
        );
        assert_eq!(registry.chain_id(), 8453);
        assert_eq!(registry.len(), 2);
        let filter = registry.log_filter();
        assert!(filter.topic0_values.iter().any(|t| t == "0x1111"));
        assert!(filter
            .topic0_values
            .iter()
            .any(|t| t.eq_ignore_ascii_case(blockrelay_core::decode::TRANSFER_TOPIC)));
    }

    #[test]
    fn unresolved_registry_address_skips_asset_events() {
        let mut cfg = config();
        cfg.registry_address = None;
        let registry = build_registry(
            &cfg,
            Arc::new(StaticTrackedAddresses::new(Vec::<String>::new())),
            Arc::new(TracingReporter::new()),
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn address_validation() {
        assert!(is_address("0x00000000000000000000000000000000000000aA"));
        assert!(!is_address("00000000000000000000000000000000000000aa"));
        assert!(!is_address("0x1234"));
    }
}
