//! Height-versioned persistence for the Portal state.
//!
//! Each entity version is written under `entity/<kind>/<hex id>/<height>`,
//! so the state at any committed height can be rebuilt and everything above
//! a height dropped again when a block is reverted.

#[cfg(feature = "rocksdb")]
pub mod db;

use anyhow::{anyhow, bail, Context, Result};
use portal_types::block::Block;
use portal_types::scratch::StateDiff;
use portal_types::state::PortalState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use tracing::{debug, info};

#[cfg(feature = "rocksdb")]
pub use db::RocksStore;

/// Key and value; a `None` value deletes the key.
pub type BatchOp = (Vec<u8>, Option<Vec<u8>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Custodian,
    WaitingPorting,
    WaitingRedeem,
    MatchedRedeem,
    LiquidationPool,
    RequestStatus,
    PendingRates,
    UsedProof,
    FinalRates,
    RewardSnapshot,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Custodian => "custodian",
            EntityKind::WaitingPorting => "waiting_porting",
            EntityKind::WaitingRedeem => "waiting_redeem",
            EntityKind::MatchedRedeem => "matched_redeem",
            EntityKind::LiquidationPool => "liquidation_pool",
            EntityKind::RequestStatus => "request_status",
            EntityKind::PendingRates => "pending_rates",
            EntityKind::UsedProof => "used_proof",
            EntityKind::FinalRates => "final_rates",
            EntityKind::RewardSnapshot => "reward_snapshot",
        }
    }
}

const TIP_KEY: &[u8] = b"meta/tip";
const SINGLETON: &str = "_";

fn entity_prefix(kind: EntityKind, id: Option<&str>) -> Vec<u8> {
    match id {
        Some(id) => format!("entity/{}/{}/", kind.as_str(), hex::encode(id)),
        None => format!("entity/{}/", kind.as_str()),
    }
    .into_bytes()
}

fn entity_key(height: u64, kind: EntityKind, id: &str) -> Vec<u8> {
    let mut key = entity_prefix(kind, Some(id));
    key.extend_from_slice(format!("{height:020}").as_bytes());
    key
}

/// `(id, height)` of an entity key.
fn parse_entity_key(key: &[u8]) -> Option<(String, u64)> {
    let key = std::str::from_utf8(key).ok()?;
    let mut parts = key.rsplitn(3, '/');
    let height = parts.next()?.parse().ok()?;
    let id = hex::decode(parts.next()?).ok()?;
    Some((String::from_utf8(id).ok()?, height))
}

fn block_height_key(height: u64) -> Vec<u8> {
    format!("block/height/{height:020}").into_bytes()
}

fn block_hash_key(hash: &[u8; 32]) -> Vec<u8> {
    format!("block/hash/{}", hex::encode(hash)).into_bytes()
}

// Stored versions are tagged: empty is a deletion, `1 ++ bytes` a live value.
fn tag_value(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        Some(bytes) => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(1);
            out.extend_from_slice(bytes);
            out
        }
        None => Vec::new(),
    }
}

fn untag_value(stored: &[u8]) -> Option<Vec<u8>> {
    match stored.split_first() {
        Some((1, bytes)) => Some(bytes.to_vec()),
        _ => None,
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Serialization error: {}", e))
}

fn push_table<V: Serialize>(
    ops: &mut Vec<BatchOp>,
    height: u64,
    kind: EntityKind,
    table: &BTreeMap<String, Option<V>>,
) -> Result<()> {
    for (id, value) in table {
        let bytes = value.as_ref().map(encode).transpose()?;
        ops.push((entity_key(height, kind, id), Some(tag_value(bytes.as_deref()))));
    }
    Ok(())
}

fn diff_ops(height: u64, diff: &StateDiff) -> Result<Vec<BatchOp>> {
    let mut ops = Vec::new();
    push_table(&mut ops, height, EntityKind::Custodian, &diff.custodians)?;
    push_table(&mut ops, height, EntityKind::WaitingPorting, &diff.waiting_portings)?;
    push_table(&mut ops, height, EntityKind::WaitingRedeem, &diff.waiting_redeems)?;
    push_table(&mut ops, height, EntityKind::MatchedRedeem, &diff.matched_redeems)?;
    push_table(&mut ops, height, EntityKind::LiquidationPool, &diff.liquidation_pool)?;
    push_table(&mut ops, height, EntityKind::RequestStatus, &diff.request_history)?;
    push_table(&mut ops, height, EntityKind::PendingRates, &diff.pending_exchange_rates)?;
    for hash in &diff.used_proofs {
        ops.push((
            entity_key(height, EntityKind::UsedProof, &hex::encode(hash)),
            Some(tag_value(Some(&[]))),
        ));
    }
    if let Some(rates) = &diff.final_exchange_rates {
        let bytes = rates.as_ref().map(encode).transpose()?;
        ops.push((
            entity_key(height, EntityKind::FinalRates, SINGLETON),
            Some(tag_value(bytes.as_deref())),
        ));
    }
    if let Some(snapshot) = &diff.locked_collateral_for_rewards {
        ops.push((
            entity_key(height, EntityKind::RewardSnapshot, SINGLETON),
            Some(tag_value(Some(&encode(snapshot)?))),
        ));
    }
    ops.push((TIP_KEY.to_vec(), Some(encode(&height)?)));
    Ok(ops)
}

/// Everything in `state`, as a diff against the empty state.
pub fn snapshot_diff(state: &PortalState) -> StateDiff {
    fn all<V: Clone>(table: &BTreeMap<String, V>) -> BTreeMap<String, Option<V>> {
        table.iter().map(|(k, v)| (k.clone(), Some(v.clone()))).collect()
    }
    StateDiff {
        custodians: all(&state.custodians),
        waiting_portings: all(&state.waiting_portings),
        waiting_redeems: all(&state.waiting_redeems),
        matched_redeems: all(&state.matched_redeems),
        liquidation_pool: all(&state.liquidation_pool),
        request_history: all(&state.request_history),
        pending_exchange_rates: all(&state.pending_exchange_rates),
        used_proofs: state.used_proofs.clone(),
        final_exchange_rates: Some(state.final_exchange_rates.clone()),
        locked_collateral_for_rewards: Some(state.locked_collateral_for_rewards.clone()),
    }
}

/// Live value bytes of every `kind` entity as of `height`.
fn live_entities<S: StateStore + ?Sized>(
    store: &S,
    height: u64,
    kind: EntityKind,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut latest: BTreeMap<String, (u64, Vec<u8>)> = BTreeMap::new();
    for (key, stored) in store.scan_prefix(&entity_prefix(kind, None))? {
        let Some((id, version)) = parse_entity_key(&key) else {
            bail!("Malformed entity key {}", String::from_utf8_lossy(&key));
        };
        if version > height {
            continue;
        }
        if latest.get(&id).map_or(true, |(seen, _)| *seen < version) {
            latest.insert(id, (version, stored));
        }
    }
    Ok(latest
        .into_iter()
        .filter_map(|(id, (_, stored))| untag_value(&stored).map(|bytes| (id, bytes)))
        .collect())
}

fn load_table<S: StateStore + ?Sized, V: DeserializeOwned>(
    store: &S,
    height: u64,
    kind: EntityKind,
) -> Result<BTreeMap<String, V>> {
    live_entities(store, height, kind)?
        .into_iter()
        .map(|(id, bytes)| {
            let value = bincode::deserialize(&bytes)
                .with_context(|| format!("Failed to decode {} {}", kind.as_str(), id))?;
            Ok((id, value))
        })
        .collect()
}

fn load_singleton<S: StateStore + ?Sized, V: DeserializeOwned>(
    store: &S,
    height: u64,
    kind: EntityKind,
) -> Result<Option<V>> {
    let mut table: BTreeMap<String, V> = load_table(store, height, kind)?;
    Ok(table.remove(SINGLETON))
}

/// Raw ordered key-value access plus the Portal persistence built on it.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every key starting with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies all operations atomically.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Writes one entity version. `None` records a deletion at `height`.
    fn put_entity(&self, height: u64, kind: EntityKind, id: &str, value: Option<&[u8]>) -> Result<()> {
        self.write_batch(vec![(entity_key(height, kind, id), Some(tag_value(value)))])
    }

    /// Latest version at or below `height`; `None` if never written or deleted.
    fn get_entity(&self, height: u64, kind: EntityKind, id: &str) -> Result<Option<Vec<u8>>> {
        let latest = self
            .scan_prefix(&entity_prefix(kind, Some(id)))?
            .into_iter()
            .filter_map(|(key, stored)| parse_entity_key(&key).map(|(_, version)| (version, stored)))
            .filter(|(version, _)| *version <= height)
            .max_by_key(|(version, _)| *version);
        Ok(latest.and_then(|(_, stored)| untag_value(&stored)))
    }

    /// Highest committed height.
    fn tip(&self) -> Result<Option<u64>> {
        match self.get(TIP_KEY)? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| anyhow!("Deserialization error: {}", e))?,
            )),
            None => Ok(None),
        }
    }

    fn commit_diff(&self, height: u64, diff: &StateDiff) -> Result<()> {
        if let Some(tip) = self.tip()? {
            if height < tip {
                bail!("Cannot commit height {} below tip {}", height, tip);
            }
        }
        let ops = diff_ops(height, diff)?;
        debug!("Committing {} entity writes at height {}", ops.len() - 1, height);
        self.write_batch(ops)
    }

    fn load_state(&self, height: u64) -> Result<PortalState> {
        Ok(PortalState {
            custodians: load_table(self, height, EntityKind::Custodian)?,
            waiting_portings: load_table(self, height, EntityKind::WaitingPorting)?,
            waiting_redeems: load_table(self, height, EntityKind::WaitingRedeem)?,
            matched_redeems: load_table(self, height, EntityKind::MatchedRedeem)?,
            liquidation_pool: load_table(self, height, EntityKind::LiquidationPool)?,
            final_exchange_rates: load_singleton(self, height, EntityKind::FinalRates)?,
            locked_collateral_for_rewards: load_singleton(self, height, EntityKind::RewardSnapshot)?
                .unwrap_or_default(),
            request_history: load_table(self, height, EntityKind::RequestStatus)?,
            used_proofs: live_entities(self, height, EntityKind::UsedProof)?
                .into_keys()
                .map(|id| {
                    let bytes = hex::decode(&id).with_context(|| format!("Bad proof hash {id}"))?;
                    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| anyhow!("Bad proof hash {}", id))
                })
                .collect::<Result<_>>()?,
            pending_exchange_rates: load_table(self, height, EntityKind::PendingRates)?,
        })
    }

    /// Drops every entity version and block above `height`.
    fn rollback_to(&self, height: u64) -> Result<()> {
        let mut ops: Vec<BatchOp> = Vec::new();
        for (key, _) in self.scan_prefix(b"entity/")? {
            if parse_entity_key(&key).map_or(false, |(_, version)| version > height) {
                ops.push((key, None));
            }
        }
        for (key, bytes) in self.scan_prefix(b"block/height/")? {
            let block: Block = bincode::deserialize(&bytes).map_err(|e| anyhow!("Deserialization error: {}", e))?;
            if block.header.height > height {
                ops.push((block_hash_key(&block.hash()), None));
                ops.push((key, None));
            }
        }
        let dropped = ops.len();
        ops.push((TIP_KEY.to_vec(), Some(encode(&height)?)));
        self.write_batch(ops)?;
        info!("Rolled storage back to height {} ({} keys dropped)", height, dropped);
        Ok(())
    }

    fn save_block(&self, block: &Block) -> Result<()> {
        let encoded = encode(block)?;
        self.write_batch(vec![
            (block_height_key(block.header.height), Some(encoded.clone())),
            (block_hash_key(&block.hash()), Some(encoded)),
        ])
    }

    fn load_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.get(&block_height_key(height))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    fn load_block_by_hash(&self, hash: &[u8; 32]) -> Result<Option<Block>> {
        match self.get(&block_hash_key(hash))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }
}

/// In-process store for tests and the simulator.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let data = self.data.read().map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut data = self.data.write().map_err(|_| anyhow!("memory store lock poisoned"))?;
        for (key, value) in ops {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
