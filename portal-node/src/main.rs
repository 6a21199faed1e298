use anyhow::{Context, Result};
use clap::Parser;
use portal_consensus::{ConsensusService, ServiceConfig};
use portal_execution::VerifierRegistry;
use portal_genesis::{create_genesis_state, GenesisConfig};
use portal_storage::{snapshot_diff, StateStore};
use portal_types::action::PortalAction;
use portal_types::params::PortalParams;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,
    /// Genesis TOML with `[params]` and `[initial_rates]`.
    #[arg(short, long)]
    genesis: Option<PathBuf>,
    /// Params TOML replacing the genesis params.
    #[arg(short, long)]
    params: Option<PathBuf>,
    /// JSON array of shard actions to feed in at startup.
    #[arg(short, long)]
    actions: Option<PathBuf>,
    #[arg(long, default_value_t = 40)]
    block_interval_secs: u64,
    /// Native beacon reward per epoch.
    #[arg(long, default_value_t = 0)]
    epoch_reward: u64,
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[cfg(feature = "rocksdb")]
fn open_store(data_dir: &std::path::Path) -> Result<Arc<dyn StateStore>> {
    let store = portal_storage::RocksStore::open(data_dir).context("Failed to initialize storage")?;
    info!("Storage initialized at {}", data_dir.display());
    Ok(Arc::new(store))
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(data_dir: &std::path::Path) -> Result<Arc<dyn StateStore>> {
    warn!(
        "Built without rocksdb; keeping state in memory instead of {}",
        data_dir.display()
    );
    Ok(Arc::new(portal_storage::MemoryStore::new()))
}

fn load_actions(path: &std::path::Path) -> Result<Vec<PortalAction>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read actions file {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse actions file")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Setup Logging
    let subscriber = FmtSubscriber::builder().with_max_level(args.log_level).finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;
    info!("Starting Portal Node...");

    // 2. Config
    let mut genesis = match &args.genesis {
        Some(path) => GenesisConfig::load(path)?,
        None => GenesisConfig::default(),
    };
    if let Some(path) = &args.params {
        genesis.params = PortalParams::load(path)?;
    }

    // 3. Storage and state
    let store = open_store(&args.data_dir)?;
    let state = match store.tip()? {
        Some(height) => {
            info!("Loaded existing state at height {}", height);
            store.load_state(height)?
        }
        None => {
            info!("Store is empty, writing Genesis state...");
            let state = create_genesis_state(&genesis)?;
            store
                .commit_diff(0, &snapshot_diff(&state))
                .context("Failed to save genesis state")?;
            state
        }
    };
    let shared_state = Arc::new(RwLock::new(state));

    // 4. Channels
    let (action_tx, action_rx) = mpsc::channel(1000);
    let (_block_tx, block_rx) = mpsc::channel(256);
    let (committed_tx, mut committed_rx) = mpsc::channel::<portal_types::block::Block>(256);

    tokio::spawn(async move {
        while let Some(block) = committed_rx.recv().await {
            info!(
                "Block {} state_root {}",
                block.header.height,
                hex::encode(block.header.state_root)
            );
        }
    });

    if let Some(path) = &args.actions {
        let actions = load_actions(path)?;
        info!("Queueing {} actions from {}", actions.len(), path.display());
        for action in actions {
            action_tx.send(action).await.context("Consensus channel closed")?;
        }
    }

    // 5. Consensus
    let mut beacon_reward = BTreeMap::new();
    if args.epoch_reward > 0 {
        beacon_reward.insert(genesis.params.native_collateral.clone(), args.epoch_reward);
    }
    let config = ServiceConfig {
        block_interval: Duration::from_secs(args.block_interval_secs.max(1)),
        beacon_reward,
    };
    let service = ConsensusService::new(
        shared_state.clone(),
        store.clone(),
        Arc::new(genesis.params),
        Arc::new(VerifierRegistry::with_receipts()),
        action_rx,
        block_rx,
        config,
    )
    .with_commit_sink(committed_tx);
    tokio::spawn(service.run());

    info!("Node running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    drop(action_tx);
    Ok(())
}
