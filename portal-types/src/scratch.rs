//! Copy-on-write view over a `PortalState`.
//!
//! Entities are copied out of the base snapshot only when first mutated, so a
//! block touching three custodians clones three records, not the pool. The
//! accumulated changes turn into a `StateDiff` that the caller commits.

use crate::custodian::CustodianRecord;
use crate::request::{RedeemRequest, WaitingPortingRequest};
use crate::state::{
    ExchangeRatesSubmission, FinalExchangeRates, LiquidationPoolEntry, LockedCollateralForRewards,
    PortalState, RequestStatus,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::iter::Peekable;

/// One table of the overlay. `None` in `changes` marks a deletion.
///
/// While a checkpoint is open, the first prior `changes` entry of every key
/// touched is kept in `undo`, so rolling back costs what the instruction
/// touched rather than the whole change set.
#[derive(Debug, Clone)]
pub struct Overlay<'a, K, V> {
    base: &'a BTreeMap<K, V>,
    changes: BTreeMap<K, Option<V>>,
    len: usize,
    undo: Option<BTreeMap<K, Option<Option<V>>>>,
    len_at_checkpoint: usize,
}

impl<'a, K: Ord + Clone, V: Clone> Overlay<'a, K, V> {
    pub fn new(base: &'a BTreeMap<K, V>) -> Self {
        Self {
            base,
            changes: BTreeMap::new(),
            len: base.len(),
            undo: None,
            len_at_checkpoint: base.len(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self.changes.get(key) {
            Some(change) => change.as_ref(),
            None => self.base.get(key),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn remember(&mut self, key: &K) {
        if let Some(undo) = self.undo.as_mut() {
            if !undo.contains_key(key) {
                undo.insert(key.clone(), self.changes.get(key).cloned());
            }
        }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.changes.contains_key(key) {
            let current = self.base.get(key)?.clone();
            self.remember(key);
            self.changes.insert(key.clone(), Some(current));
        } else {
            self.remember(key);
        }
        self.changes.get_mut(key).and_then(Option::as_mut)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if !self.contains_key(&key) {
            self.len += 1;
        }
        self.remember(&key);
        self.changes.insert(key, Some(value));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.get(key).cloned();
        if previous.is_some() {
            self.remember(key);
            self.changes.insert(key.clone(), None);
            self.len -= 1;
        }
        previous
    }

    /// Live entries in ascending key order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            base: self.base.iter().peekable(),
            changes: self.changes.iter().peekable(),
        }
    }

    /// Live keys in ascending order, detached from the overlay so the caller
    /// may mutate while walking them.
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> Iter<'_, K, V> {
        self.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn open_undo(&mut self) {
        self.undo = Some(BTreeMap::new());
        self.len_at_checkpoint = self.len;
    }

    fn close_undo(&mut self) {
        self.undo = None;
    }

    fn roll_back(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        for (key, previous) in undo {
            match previous {
                Some(change) => {
                    self.changes.insert(key, change);
                }
                None => {
                    self.changes.remove(&key);
                }
            }
        }
        self.len = self.len_at_checkpoint;
    }

    pub fn into_changes(self) -> BTreeMap<K, Option<V>> {
        self.changes
    }
}

/// Checkpoint hooks, so the scratch can drive every table alike.
trait UndoTable {
    fn open_undo(&mut self);
    fn close_undo(&mut self);
    fn roll_back(&mut self);
}

impl<K: Ord + Clone, V: Clone> UndoTable for Overlay<'_, K, V> {
    fn open_undo(&mut self) {
        Overlay::open_undo(self)
    }

    fn close_undo(&mut self) {
        Overlay::close_undo(self)
    }

    fn roll_back(&mut self) {
        Overlay::roll_back(self)
    }
}

/// Merges the base table with the overlay's changes in key order.
pub struct Iter<'o, K, V> {
    base: Peekable<btree_map::Iter<'o, K, V>>,
    changes: Peekable<btree_map::Iter<'o, K, Option<V>>>,
}

impl<'o, K: Ord, V> Iterator for Iter<'o, K, V> {
    type Item = (&'o K, &'o V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let order = match (self.base.peek(), self.changes.peek()) {
                (None, None) => return None,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((b, _)), Some((c, _))) => b.cmp(c),
            };
            match order {
                Ordering::Less => return self.base.next(),
                // Shadowed by a change.
                Ordering::Equal => {
                    self.base.next();
                }
                Ordering::Greater => {}
            }
            if let Some((k, Some(v))) = self.changes.next() {
                return Some((k, v));
            }
        }
    }
}

/// Everything a block changed, ready to commit or persist.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub custodians: BTreeMap<String, Option<CustodianRecord>>,
    pub waiting_portings: BTreeMap<String, Option<WaitingPortingRequest>>,
    pub waiting_redeems: BTreeMap<String, Option<RedeemRequest>>,
    pub matched_redeems: BTreeMap<String, Option<RedeemRequest>>,
    pub liquidation_pool: BTreeMap<String, Option<LiquidationPoolEntry>>,
    pub request_history: BTreeMap<String, Option<RequestStatus>>,
    pub pending_exchange_rates: BTreeMap<String, Option<ExchangeRatesSubmission>>,
    pub used_proofs: BTreeSet<[u8; 32]>,
    pub final_exchange_rates: Option<Option<FinalExchangeRates>>,
    pub locked_collateral_for_rewards: Option<LockedCollateralForRewards>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.custodians.is_empty()
            && self.waiting_portings.is_empty()
            && self.waiting_redeems.is_empty()
            && self.matched_redeems.is_empty()
            && self.liquidation_pool.is_empty()
            && self.request_history.is_empty()
            && self.pending_exchange_rates.is_empty()
            && self.used_proofs.is_empty()
            && self.final_exchange_rates.is_none()
            && self.locked_collateral_for_rewards.is_none()
    }
}

/// Rollback point taken before an instruction is applied. Only the most
/// recent checkpoint of the current instruction can be restored.
pub struct Checkpoint<'a> {
    generation: u64,
    id: u64,
    final_exchange_rates: Cow<'a, Option<FinalExchangeRates>>,
    locked_collateral_for_rewards: Cow<'a, LockedCollateralForRewards>,
}

#[derive(Debug, Clone)]
pub struct ScratchState<'a> {
    pub custodians: Overlay<'a, String, CustodianRecord>,
    pub waiting_portings: Overlay<'a, String, WaitingPortingRequest>,
    pub waiting_redeems: Overlay<'a, String, RedeemRequest>,
    pub matched_redeems: Overlay<'a, String, RedeemRequest>,
    pub liquidation_pool: Overlay<'a, String, LiquidationPoolEntry>,
    pub request_history: Overlay<'a, String, RequestStatus>,
    pub pending_exchange_rates: Overlay<'a, String, ExchangeRatesSubmission>,
    pub final_exchange_rates: Cow<'a, Option<FinalExchangeRates>>,
    pub locked_collateral_for_rewards: Cow<'a, LockedCollateralForRewards>,
    base_proofs: &'a BTreeSet<[u8; 32]>,
    new_proofs: BTreeSet<[u8; 32]>,
    proofs_since_checkpoint: Option<Vec<[u8; 32]>>,
    generation: u64,
    checkpoints: u64,
    open_checkpoint: Option<u64>,
}

impl<'a> ScratchState<'a> {
    pub fn new(base: &'a PortalState) -> Self {
        Self {
            custodians: Overlay::new(&base.custodians),
            waiting_portings: Overlay::new(&base.waiting_portings),
            waiting_redeems: Overlay::new(&base.waiting_redeems),
            matched_redeems: Overlay::new(&base.matched_redeems),
            liquidation_pool: Overlay::new(&base.liquidation_pool),
            request_history: Overlay::new(&base.request_history),
            pending_exchange_rates: Overlay::new(&base.pending_exchange_rates),
            final_exchange_rates: Cow::Borrowed(&base.final_exchange_rates),
            locked_collateral_for_rewards: Cow::Borrowed(&base.locked_collateral_for_rewards),
            base_proofs: &base.used_proofs,
            new_proofs: BTreeSet::new(),
            proofs_since_checkpoint: None,
            generation: 0,
            checkpoints: 0,
            open_checkpoint: None,
        }
    }

    pub fn rates(&self) -> Option<&FinalExchangeRates> {
        (*self.final_exchange_rates).as_ref()
    }

    pub fn is_proof_used(&self, hash: &[u8; 32]) -> bool {
        self.base_proofs.contains(hash) || self.new_proofs.contains(hash)
    }

    pub fn mark_proof_used(&mut self, hash: [u8; 32]) {
        if self.new_proofs.insert(hash) {
            if let Some(added) = self.proofs_since_checkpoint.as_mut() {
                added.push(hash);
            }
        }
    }

    /// Number of instructions sealed into this scratch so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn for_each_table(&mut self, mut f: impl FnMut(&mut dyn UndoTable)) {
        f(&mut self.custodians);
        f(&mut self.waiting_portings);
        f(&mut self.waiting_redeems);
        f(&mut self.matched_redeems);
        f(&mut self.liquidation_pool);
        f(&mut self.request_history);
        f(&mut self.pending_exchange_rates);
    }

    /// Starts recording what the next instruction changes. Replaces any
    /// checkpoint still open.
    pub fn checkpoint(&mut self) -> Checkpoint<'a> {
        self.for_each_table(|t| t.open_undo());
        self.proofs_since_checkpoint = Some(Vec::new());
        self.checkpoints += 1;
        self.open_checkpoint = Some(self.checkpoints);
        Checkpoint {
            generation: self.generation,
            id: self.checkpoints,
            final_exchange_rates: self.final_exchange_rates.clone(),
            locked_collateral_for_rewards: self.locked_collateral_for_rewards.clone(),
        }
    }

    /// Restores the scratch to `checkpoint`. Returns false when the checkpoint
    /// predates a sealed instruction or a newer checkpoint, and was therefore
    /// not restored.
    pub fn rollback(&mut self, checkpoint: Checkpoint<'a>) -> bool {
        if checkpoint.generation != self.generation || self.open_checkpoint != Some(checkpoint.id) {
            return false;
        }
        self.for_each_table(|t| t.roll_back());
        for hash in self.proofs_since_checkpoint.take().unwrap_or_default() {
            self.new_proofs.remove(&hash);
        }
        self.final_exchange_rates = checkpoint.final_exchange_rates;
        self.locked_collateral_for_rewards = checkpoint.locked_collateral_for_rewards;
        self.open_checkpoint = None;
        true
    }

    /// Marks the current instruction as applied.
    pub fn seal(&mut self) {
        self.generation += 1;
        self.for_each_table(|t| t.close_undo());
        self.proofs_since_checkpoint = None;
        self.open_checkpoint = None;
    }

    pub fn into_diff(self) -> StateDiff {
        StateDiff {
            custodians: self.custodians.into_changes(),
            waiting_portings: self.waiting_portings.into_changes(),
            waiting_redeems: self.waiting_redeems.into_changes(),
            matched_redeems: self.matched_redeems.into_changes(),
            liquidation_pool: self.liquidation_pool.into_changes(),
            request_history: self.request_history.into_changes(),
            pending_exchange_rates: self.pending_exchange_rates.into_changes(),
            used_proofs: self.new_proofs,
            final_exchange_rates: match self.final_exchange_rates {
                Cow::Owned(rates) => Some(rates),
                Cow::Borrowed(_) => None,
            },
            locked_collateral_for_rewards: match self.locked_collateral_for_rewards {
                Cow::Owned(snapshot) => Some(snapshot),
                Cow::Borrowed(_) => None,
            },
        }
    }
}
