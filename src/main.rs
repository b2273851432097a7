/// Validator node entry point
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tabledger_api::ApiServer;
use tabledger_core::config::{ChainConfig, ValidatorConfig};
use tabledger_core::feed::RawEventSink;
use tabledger_core::parser::SqlParser;
use tabledger_ethereum::{parse_address, EvmEventFeed, EvmProvider, EvmProviderConfig};
use tabledger_parser::{ParserConfig, StatementParser, RESERVED_PREFIXES};
use tabledger_pipeline::{EventProcessor, ProcessorHandle};
use tabledger_storage::events::RawEventStore;
use tabledger_storage::{registry, Executor, GatewayStore, SqliteConfig, SqliteDb};

#[derive(Parser)]
#[command(name = "tabledger")]
#[command(author, version, about = "Validator node materializing on-chain table mutations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the validator node
    Run {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "tabledger.toml")]
        config: String,
    },

    /// Write a default configuration file and exit
    InitConfig {
        /// Where to write the configuration
        #[arg(long, default_value = "tabledger.toml")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Run { config } => run(&config).await,
        Commands::InitConfig { path } => init_config(&path),
    }
}

async fn run(config_path: &str) -> Result<()> {
    let config = ValidatorConfig::from_file(config_path)
        .with_context(|| format!("loading {config_path}"))?;

    let db = SqliteDb::open(SqliteConfig {
        path: config.db.path.clone(),
        max_read_connections: config.db.max_read_connections,
    })
    .await
    .context("opening database")?;

    let parser: Arc<dyn SqlParser> = Arc::new(StatementParser::new(ParserConfig {
        max_read_query_size: config.query_constraints.max_read_query_size,
        max_write_query_size: config.query_constraints.max_write_query_size,
        reserved_prefixes: RESERVED_PREFIXES.iter().map(|p| p.to_string()).collect(),
    }));

    let cancel = CancellationToken::new();

    let mut processors = Vec::with_capacity(config.chains.len());
    for chain in &config.chains {
        processors.push(
            start_chain(chain, &db, parser.clone(), cancel.child_token())
                .await
                .with_context(|| format!("starting chain {}", chain.chain_id))?,
        );
    }

    let api = ApiServer::new(
        config.gateway.clone(),
        GatewayStore::new(db.reader().clone(), parser.clone()),
    );
    let api_cancel = cancel.child_token();
    let api_task = tokio::spawn(async move { api.start(api_cancel).await });

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    cancel.cancel();

    // Each chain finishes committing or rolling back its current block.
    for handle in processors {
        let chain_id = handle.chain_id();
        match tokio::time::timeout(Duration::from_secs(15), handle.join()).await {
            Ok(Ok(())) => info!(chain_id, "processor stopped"),
            Ok(Err(e)) => error!(chain_id, error = %e, "processor stopped with error"),
            Err(_) => warn!(chain_id, "processor did not stop within 15s"),
        }
    }

    match tokio::time::timeout(Duration::from_secs(10), api_task).await {
        Ok(Ok(Ok(()))) => info!("gateway stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "gateway stopped with error"),
        Ok(Err(e)) => error!(error = %e, "gateway task panicked"),
        Err(_) => warn!("gateway did not stop within 10s"),
    }

    Ok(())
}

/// Build the feed, executor and processor for one chain
async fn start_chain(
    chain: &ChainConfig,
    db: &SqliteDb,
    parser: Arc<dyn SqlParser>,
    cancel: CancellationToken,
) -> Result<ProcessorHandle> {
    let provider = EvmProvider::new(EvmProviderConfig {
        rpc_url: chain.registry.eth_endpoint.clone(),
    })
    .await?;
    let contract = parse_address(&chain.registry.contract_address)?;

    let cursor = registry::cursor(db.reader(), chain.chain_id).await?;
    let from_height = cursor.map(|c| c + 1).unwrap_or(chain.start_block);
    info!(chain_id = chain.chain_id, from_height, "starting chain pipeline");

    let sink: Option<Arc<dyn RawEventSink>> = chain
        .event_feed
        .persist_events
        .then(|| Arc::new(RawEventStore::new(db.writer().clone())) as Arc<dyn RawEventSink>);

    let feed = EvmEventFeed::new(
        provider,
        chain.chain_id,
        contract,
        chain.event_feed.clone(),
        from_height,
        sink,
    );

    let executor = Arc::new(Executor::new(
        db.clone(),
        parser,
        chain.table_constraints.max_row_count,
    ));

    Ok(EventProcessor::spawn(
        chain.chain_id,
        Box::new(feed),
        executor,
        db.clone(),
        chain.event_processor.clone(),
        cancel,
    ))
}

fn init_config(path: &str) -> Result<()> {
    if std::path::Path::new(path).exists() {
        anyhow::bail!("{path} already exists, refusing to overwrite");
    }
    std::fs::write(path, DEFAULT_CONFIG).with_context(|| format!("writing {path}"))?;
    info!("wrote default configuration to {path}");
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# tabledger validator configuration

[db]
path = "database.db"
max_read_connections = 8

[gateway]
host = "0.0.0.0"
port = 8080
external_url_prefix = "http://localhost:8080"
# metadata_renderer_uri = "https://render.example/tables"
# animation_renderer_uri = "https://render.example/animations"

[query_constraints]
max_read_query_size = 35000
max_write_query_size = 35000

[[chains]]
chain_id = 1337
start_block = 0

[chains.registry]
eth_endpoint = "http://localhost:8545"
contract_address = "0x0000000000000000000000000000000000000000"

[chains.event_feed]
chain_api_backoff_ms = 15000
min_block_depth = 5
new_block_poll_freq_ms = 10000
persist_events = true

[chains.event_processor]
block_failed_execution_backoff_ms = 10000
dedup_executed_txns = false
hash_calculation_step = 100

[chains.table_constraints]
max_row_count = 500000
"#;
