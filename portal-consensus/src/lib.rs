use anyhow::{bail, Context, Result};
use portal_execution::{
    epoch_reward_for, BlockProcessor, BlockProducer, EpochReward, ExecutionContext, VerifierRegistry,
};
use portal_storage::StateStore;
use portal_types::action::PortalAction;
use portal_types::block::{Block, BlockHeader};
use portal_types::error::PortalError;
use portal_types::params::PortalParams;
use portal_types::scratch::StateDiff;
use portal_types::state::PortalState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

/// A block built on its parent state, with the changes it makes.
pub struct BuiltBlock {
    pub block: Block,
    pub diff: StateDiff,
    /// Actions left out because building them hit a fatal error.
    pub failures: Vec<(String, PortalError)>,
}

pub fn build_block_from_parent(
    parent: &PortalState,
    ctx: &ExecutionContext,
    verifiers: &VerifierRegistry,
    actions: &[PortalAction],
    prev_hash: [u8; 32],
    epoch: Option<&EpochReward>,
) -> Result<BuiltBlock> {
    let output = BlockProducer::new(verifiers)
        .produce(parent, ctx, actions, epoch)
        .with_context(|| format!("Failed to produce block {}", ctx.height))?;
    let diff = BlockProcessor::diff(parent, ctx, &output.instructions)
        .with_context(|| format!("Produced block {} does not replay", ctx.height))?;

    let mut next = parent.clone();
    next.apply_diff(diff.clone());
    let block = Block {
        header: BlockHeader {
            height: ctx.height,
            prev_hash,
            instructions_root: Block::instructions_root(&output.instructions),
            state_root: next.root_hash(),
            timestamp: ctx.timestamp,
            proposer: [0u8; 32],
        },
        instructions: output.instructions,
    };
    Ok(BuiltBlock {
        block,
        diff,
        failures: output.failures,
    })
}

/// Replays `block` on `parent` and checks both header roots.
pub fn verify_block(parent: &PortalState, params: &PortalParams, block: &Block) -> Result<StateDiff> {
    let expected_root = Block::instructions_root(&block.instructions);
    if block.header.instructions_root != expected_root {
        bail!("Invalid instructions_root at height {}", block.header.height);
    }

    let ctx = ExecutionContext::new(params, block.header.height, block.header.timestamp);
    let diff = BlockProcessor::diff(parent, &ctx, &block.instructions)
        .with_context(|| format!("Block {} failed to replay", block.header.height))?;

    let mut next = parent.clone();
    next.apply_diff(diff.clone());
    let state_root = next.root_hash();
    if block.header.state_root != state_root {
        bail!(
            "Invalid state_root at height {}: block has {}, replay gives {}",
            block.header.height,
            hex::encode(block.header.state_root),
            hex::encode(state_root)
        );
    }
    Ok(diff)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub hash: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub block_interval: Duration,
    /// Beacon reward per epoch; the custodian share is carved out of it.
    pub beacon_reward: BTreeMap<String, u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(40),
            beacon_reward: BTreeMap::new(),
        }
    }
}

pub struct ConsensusService {
    state: Arc<RwLock<PortalState>>,
    store: Arc<dyn StateStore>,
    params: Arc<PortalParams>,
    verifiers: Arc<VerifierRegistry>,
    action_rx: mpsc::Receiver<PortalAction>,
    block_rx: mpsc::Receiver<Block>,
    committed_tx: Option<mpsc::Sender<Block>>,
    pending: Vec<PortalAction>,
    config: ServiceConfig,
    tip: ChainTip,
}

impl ConsensusService {
    pub fn new(
        state: Arc<RwLock<PortalState>>,
        store: Arc<dyn StateStore>,
        params: Arc<PortalParams>,
        verifiers: Arc<VerifierRegistry>,
        action_rx: mpsc::Receiver<PortalAction>,
        block_rx: mpsc::Receiver<Block>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            state,
            store,
            params,
            verifiers,
            action_rx,
            block_rx,
            committed_tx: None,
            pending: Vec::new(),
            config,
            tip: ChainTip::default(),
        }
    }

    /// Every committed block, local or imported, is also sent here.
    pub fn with_commit_sink(mut self, tx: mpsc::Sender<Block>) -> Self {
        self.committed_tx = Some(tx);
        self
    }

    pub fn tip(&self) -> ChainTip {
        self.tip
    }

    /// Picks up the committed tip from storage.
    pub fn recover_tip(&mut self) -> Result<ChainTip> {
        let height = self.store.tip()?.unwrap_or(0);
        let hash = match self.store.load_block_by_height(height)? {
            Some(block) => block.hash(),
            None => [0u8; 32],
        };
        self.tip = ChainTip { height, hash };
        Ok(self.tip)
    }

    pub async fn run(mut self) {
        info!("Starting Portal consensus service...");
        match self.recover_tip() {
            Ok(tip) => info!("Recovered chain tip. Starting at height {}", tip.height),
            Err(e) => {
                error!("Failed to recover chain tip: {}", e);
                return;
            }
        }

        let mut interval = tokio::time::interval(self.config.block_interval);
        loop {
            tokio::select! {
                Some(action) = self.action_rx.recv() => {
                    self.pending.push(action);
                }
                Some(block) = self.block_rx.recv() => {
                    let height = block.header.height;
                    if let Err(e) = self.import_block(&block).await {
                        error!("Block import failed at height {}: {:#}", height, e);
                    }
                }
                _ = interval.tick() => {
                    let height = self.tip.height + 1;
                    if let Err(e) = self.propose().await {
                        error!("Failed to build block {}: {:#}", height, e);
                    }
                }
            }
        }
    }

    fn epoch_reward(&self, parent: &PortalState, height: u64) -> Result<Option<EpochReward>> {
        if self.config.beacon_reward.is_empty() || height % self.params.epoch_length.max(1) != 0 {
            return Ok(None);
        }
        let reward = epoch_reward_for(
            &self.config.beacon_reward,
            &parent.locked_collateral_for_rewards,
            &self.params,
        )?;
        Ok(Some(reward))
    }

    /// Builds and commits the next block from the pending actions. Blocks
    /// are produced even when empty so timeouts and liquidations advance.
    pub async fn propose(&mut self) -> Result<Block> {
        let actions: Vec<PortalAction> = self.pending.drain(..).collect();
        let height = self.tip.height + 1;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let built = {
            let parent = self.state.read().await;
            let ctx = ExecutionContext::new(&self.params, height, timestamp);
            let epoch = self.epoch_reward(&parent, height)?;
            build_block_from_parent(&parent, &ctx, &self.verifiers, &actions, self.tip.hash, epoch.as_ref())?
        };
        for (tx_req_id, e) in &built.failures {
            warn!("Action {} left out of block {}: {}", tx_req_id, height, e);
        }

        self.commit(&built.block, &built.diff).await?;
        info!(
            "Consensus: Committed block {} with {} instructions from {} actions",
            height,
            built.block.instructions.len(),
            actions.len()
        );
        Ok(built.block)
    }

    /// Verifies a block extending the tip and commits it.
    pub async fn import_block(&mut self, block: &Block) -> Result<()> {
        if block.header.height != self.tip.height + 1 {
            bail!(
                "Block {} does not extend tip {}",
                block.header.height,
                self.tip.height
            );
        }
        if block.header.prev_hash != self.tip.hash {
            bail!("Unknown parent block {}", hex::encode(block.header.prev_hash));
        }
        let diff = {
            let parent = self.state.read().await;
            verify_block(&parent, &self.params, block)?
        };
        self.commit(block, &diff).await?;
        info!("Consensus: Imported block {}", block.header.height);
        Ok(())
    }

    /// Reverts state and storage to `height`.
    pub async fn revert_to(&mut self, height: u64) -> Result<()> {
        if height > self.tip.height {
            bail!("Cannot revert forward to {} from {}", height, self.tip.height);
        }
        self.store.rollback_to(height)?;
        let state = self.store.load_state(height)?;
        *self.state.write().await = state;
        self.recover_tip()?;
        warn!("Reverted Portal state to height {}", height);
        Ok(())
    }

    async fn commit(&mut self, block: &Block, diff: &StateDiff) -> Result<()> {
        self.store
            .commit_diff(block.header.height, diff)
            .context("Failed to persist state diff")?;
        self.store.save_block(block).context("Failed to persist block")?;
        self.state.write().await.apply_diff(diff.clone());
        self.tip = ChainTip {
            height: block.header.height,
            hash: block.hash(),
        };
        if let Some(tx) = &self.committed_tx {
            let _ = tx.send(block.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
