//! Agora Node - Validator and Full Node Entry Point

use agora_consensus::{
    genesis_block, BlockStorage, ChainParams, ConsensusDriver, FileBlockStorage, Ledger, QuorumSet,
};
use agora_core::{KeyPair, Seed};
use agora_network::{BanConfig, BanManager, ClientConfig, SystemClock};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "agora-node")]
#[command(about = "Agora Node - Run a validator or full node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a node data directory
    Init {
        /// Node data directory
        #[arg(long, default_value = ".agora")]
        data_dir: PathBuf,

        /// Existing seed to reuse ('S…'); a fresh one is generated otherwise
        #[arg(long)]
        seed: Option<String>,
    },

    /// Start the node daemon
    Start {
        /// Node data directory
        #[arg(long, default_value = ".agora")]
        data_dir: PathBuf,
    },

    /// Show node status
    Status {
        #[arg(long, default_value = ".agora")]
        data_dir: PathBuf,
    },
}

/// On-disk node configuration.
#[derive(Debug, Serialize, Deserialize)]
struct NodeConfig {
    /// This node's seed ('S…')
    seed: String,

    /// Address peers reach this node at
    listen_address: String,

    /// Expected quorum size; checked against the genesis seeds
    validators: u32,

    /// Seeds of all genesis validators ('S…'), deterministic test-network
    /// style genesis construction
    genesis_seeds: Vec<String>,

    /// Agreement threshold; defaults to the full quorum when absent
    quorum_threshold: Option<u32>,

    /// Chain parameters fixed at genesis
    chain: ChainParams,

    /// Network retry and ban policy
    network: NetworkSettings,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkSettings {
    retry_delay_ms: u64,
    max_retries: u32,
    timeout_ms: u64,
    max_failed_requests: u32,
    ban_duration_secs: i64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 500,
            max_retries: 5,
            timeout_ms: 10_000,
            max_failed_requests: 32,
            ban_duration_secs: 60 * 60 * 24,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir, seed } => init_node(data_dir, seed).await,
        Commands::Start { data_dir } => {
            if let Err(e) = start_node(data_dir).await {
                // A node that cannot uphold its own chain must halt.
                error!(error = %e, "fatal: node cannot continue");
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Status { data_dir } => show_status(data_dir).await,
    }
}

async fn init_node(data_dir: PathBuf, seed: Option<String>) -> anyhow::Result<()> {
    info!("Initializing Agora node at {:?}", data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let key_pair = match seed {
        Some(s) => KeyPair::from_seed(&s.parse::<Seed>().context("parsing --seed")?),
        None => KeyPair::random(),
    };

    let config = NodeConfig {
        seed: key_pair.seed().to_string(),
        listen_address: "agora://127.0.0.1:2826".to_string(),
        validators: 1,
        genesis_seeds: vec![key_pair.seed().to_string()],
        quorum_threshold: None,
        chain: ChainParams::default(),
        network: NetworkSettings::default(),
    };

    let config_path = data_dir.join("config.toml");
    if config_path.exists() {
        bail!("{:?} already exists", config_path);
    }
    std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;

    info!("Node initialized");
    info!("Data directory: {:?}", data_dir);
    info!("Public key: {}", key_pair.address);
    info!(
        "Add the other validators' seeds to genesis_seeds in {:?} before starting",
        config_path
    );
    Ok(())
}

async fn start_node(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&data_dir)?;
    info!("Starting Agora node from {:?}", data_dir);

    let key_pair = KeyPair::from_seed(&config.seed.parse::<Seed>().context("parsing node seed")?);
    info!("Public key: {}", key_pair.address);

    if config.genesis_seeds.len() != config.validators as usize {
        bail!(
            "config expects {} validators but lists {} genesis seeds",
            config.validators,
            config.genesis_seeds.len()
        );
    }
    let genesis_seeds: Vec<Seed> = config
        .genesis_seeds
        .iter()
        .map(|s| s.parse::<Seed>())
        .collect::<Result<_, _>>()
        .context("parsing genesis seeds")?;

    // Deterministic genesis, explicit storage: a restart replays the
    // archive and must land on the same state.
    let genesis = genesis_block(&genesis_seeds, &config.chain);
    let storage = FileBlockStorage::open(&data_dir.join("blocks.dat"))?;
    let ledger = Ledger::new(genesis, config.chain.clone(), Box::new(storage))?;
    info!("Chain height: {}", ledger.block_height());
    info!("Active validators: {}", ledger.validator_count());

    let validator_keys = genesis_seeds
        .iter()
        .map(|s| KeyPair::from_seed(s).address)
        .collect::<Vec<_>>();
    let quorum = match config.quorum_threshold {
        Some(threshold) => QuorumSet::with_threshold(validator_keys, threshold)?,
        None => QuorumSet::new(validator_keys),
    };
    let is_validator = quorum.contains(&key_pair.address);
    let driver = ConsensusDriver::new(key_pair, quorum, ledger.block_height() + 1);
    info!(
        "Consensus slot {} ({} mode)",
        driver.slot_height(),
        if is_validator { "validator" } else { "full node" }
    );

    // The request transport is deployment-provided; it drives peers through
    // PeerClient with this ban manager and retry policy.
    let _ban_manager = Arc::new(BanManager::new(
        BanConfig {
            max_failed_requests: config.network.max_failed_requests,
            ban_duration: chrono::Duration::seconds(config.network.ban_duration_secs),
        },
        Arc::new(SystemClock),
    ));
    let _client_config = ClientConfig {
        retry_delay: Duration::from_millis(config.network.retry_delay_ms),
        max_retries: config.network.max_retries,
        timeout: Duration::from_millis(config.network.timeout_ms),
    };
    info!("Listening on {}", config.listen_address);

    info!("Node started, press Ctrl+C to stop");
    signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

async fn show_status(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&data_dir)?;
    let key_pair = KeyPair::from_seed(&config.seed.parse::<Seed>().context("parsing node seed")?);
    println!("Public key: {}", key_pair.address);

    let archive = data_dir.join("blocks.dat");
    if archive.exists() {
        let storage = FileBlockStorage::open(&archive)?;
        match storage.len() {
            0 => println!("Chain: empty archive"),
            n => println!("Chain height: {}", n - 1),
        }
    } else {
        println!("Chain: not started");
    }
    Ok(())
}

fn load_config(data_dir: &PathBuf) -> anyhow::Result<NodeConfig> {
    let path = data_dir.join("config.toml");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {:?}; run `agora-node init` first", path))?;
    Ok(toml::from_str(&content)?)
}
