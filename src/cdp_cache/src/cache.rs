use crate::index::{scan_records, RatioIndex};
use crate::layer::{LayerId, LayerTree};
use crate::logs::{DEBUG, INFO};
use crate::numeric::{Price, Ratio};
use crate::record::{CdpIdentity, CdpRecord, RegId};
use crate::store::{cdp_db_key, KeyValueStore, CDP_PREFIX};
use crate::undo::UndoLog;
use crate::CdpError;
use ic_canister_log::log;
use std::collections::BTreeMap;

/// Identity-keyed writes cached in one layer. `None` marks an erased key.
#[derive(Clone, Debug, Default)]
pub struct RecordLayer {
    entries: BTreeMap<Vec<u8>, Option<CdpRecord>>,
}

impl RecordLayer {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persisted CDP state: identity-keyed layers over a durable store, each
/// paired with a layer of the ratio index under the same [`LayerId`].
///
/// One layer pair exists per in-flight block, chained under the chain-tip
/// pair. A committed block is flushed into its parent; a rejected one is
/// discarded whole.
pub struct CdpCache<S: KeyValueStore> {
    store: S,
    records: LayerTree<RecordLayer>,
    index: RatioIndex,
    next_layer: u32,
}

impl<S: KeyValueStore> CdpCache<S> {
    /// A cache with an empty root; call [`CdpCache::load_all`] to index the store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            records: LayerTree::new(RecordLayer::default()),
            index: RatioIndex::new(),
            next_layer: 0,
        }
    }

    pub fn open(store: S) -> Result<Self, CdpError> {
        let mut cache = Self::new(store);
        cache.load_all()?;
        Ok(cache)
    }

    /// Rebuilds the root index from the durable store with the root layer's
    /// unflushed writes applied on top, so it matches what [`CdpCache::get`]
    /// sees from the root.
    pub fn load_all(&mut self) -> Result<usize, CdpError> {
        let mut rows = scan_records(&self.store)?;
        for (key, value) in &self.records.get(LayerId::ROOT)?.entries {
            let identity = CdpIdentity::from_key_bytes(key)?;
            match value {
                Some(cdp) => rows.insert(identity, cdp.clone()),
                None => rows.remove(&identity),
            };
        }
        self.index.replace_root(rows.into_values())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn index(&self) -> &RatioIndex {
        &self.index
    }

    pub fn begin_layer(&mut self, parent: LayerId) -> Result<LayerId, CdpError> {
        self.records.check(parent)?;
        let id = LayerId(self.next_layer + 1);
        self.records.insert(id, parent, RecordLayer::default())?;
        self.index.add_layer(id, parent)?;
        self.next_layer += 1;
        log!(DEBUG, "[begin_layer] opened layer {} over {}", id, parent);
        Ok(id)
    }

    /// Drops a layer pair without flushing it. Children go first.
    pub fn discard_layer(&mut self, layer: LayerId) -> Result<(), CdpError> {
        let dropped = self.records.remove(layer)?;
        self.index.discard_layer(layer)?;
        log!(
            INFO,
            "[discard_layer] dropped layer {} with {} cached writes",
            layer,
            dropped.len()
        );
        Ok(())
    }

    /// Rebinds both halves of `layer` under `parent`.
    pub fn set_base_view(&mut self, layer: LayerId, parent: LayerId) -> Result<(), CdpError> {
        self.records.set_parent(layer, parent)?;
        self.index.set_base(layer, parent)?;
        log!(DEBUG, "[set_base_view] layer {} now sits over {}", layer, parent);
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.records.len()
    }

    /// Identity entries cached in `layer` and not yet flushed.
    pub fn cache_size(&self, layer: LayerId) -> Result<usize, CdpError> {
        Ok(self.records.get(layer)?.len())
    }

    fn read(&self, layer: LayerId, key: &[u8]) -> Result<Option<CdpRecord>, CdpError> {
        for current in self.records.chain(layer)? {
            if let Some(value) = current.entries.get(key) {
                return Ok(value.clone());
            }
        }
        match self.store.get(&cdp_db_key(key))? {
            Some(bytes) => Ok(Some(CdpRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// What `layer` would see for `key` if it held no entry of its own.
    fn read_below(&self, layer: LayerId, key: &[u8]) -> Result<Option<CdpRecord>, CdpError> {
        match self.records.parent(layer)? {
            Some(parent) => self.read(parent, key),
            None => match self.store.get(&cdp_db_key(key))? {
                Some(bytes) => Ok(Some(CdpRecord::decode(&bytes)?)),
                None => Ok(None),
            },
        }
    }

    fn write(
        &mut self,
        layer: LayerId,
        key: Vec<u8>,
        value: Option<CdpRecord>,
        undo: Option<&mut UndoLog>,
    ) -> Result<(), CdpError> {
        if let Some(undo) = undo {
            let previous = self.read(layer, &key)?;
            undo.push(key.clone(), previous.map(|cdp| cdp.encode()));
        }
        self.records.get_mut(layer)?.entries.insert(key, value);
        Ok(())
    }

    pub fn get(
        &self,
        layer: LayerId,
        identity: &CdpIdentity,
    ) -> Result<Option<CdpRecord>, CdpError> {
        self.read(layer, &identity.key_bytes())
    }

    /// Every CDP of `owner` visible from `layer`, ordered by cdp id.
    pub fn get_by_owner(&self, layer: LayerId, owner: RegId) -> Result<Vec<CdpRecord>, CdpError> {
        let mut prefix = vec![];
        owner.encode_into(&mut prefix);

        let mut merged: BTreeMap<Vec<u8>, Option<CdpRecord>> = BTreeMap::new();
        for (db_key, bytes) in self.store.scan_prefix(&cdp_db_key(&prefix))? {
            merged.insert(
                db_key[CDP_PREFIX.len()..].to_vec(),
                Some(CdpRecord::decode(&bytes)?),
            );
        }
        for current in self.records.chain(layer)?.into_iter().rev() {
            let owned = current
                .entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix));
            for (key, value) in owned {
                merged.insert(key.clone(), value.clone());
            }
        }
        Ok(merged.into_values().flatten().collect())
    }

    /// Stakes `stake_amount` base coins into `cdp` and mints `mint_amount`
    /// stable coins against it at `height`.
    ///
    /// A CDP not yet visible from `layer` is created with exactly these
    /// amounts; otherwise the amounts add to the stored totals and the index
    /// entry moves to the new ratio. Overflowing totals fail before anything
    /// is written.
    pub fn stake(
        &mut self,
        layer: LayerId,
        height: u32,
        stake_amount: u64,
        mint_amount: u64,
        cdp: &CdpRecord,
        undo: &mut UndoLog,
    ) -> Result<CdpRecord, CdpError> {
        if cdp.is_empty() {
            return Err(CdpError::EmptyCdpId);
        }
        let identity = cdp.identity();
        let key = identity.key_bytes();
        let existing = self.read(layer, &key)?;
        let (staked, owed) = existing
            .as_ref()
            .map(|current| (current.total_staked, current.total_owed))
            .unwrap_or((0, 0));
        let (Some(total_staked), Some(total_owed)) = (
            staked.checked_add(stake_amount),
            owed.checked_add(mint_amount),
        ) else {
            log!(
                DEBUG,
                "[stake] rejected {}: staking {} and minting {} overflows totals {}/{}",
                identity,
                stake_amount,
                mint_amount,
                staked,
                owed
            );
            return Err(CdpError::AmountOverflow(identity.to_string()));
        };

        let updated = CdpRecord {
            owner: cdp.owner,
            cdp_id: cdp.cdp_id,
            last_op_height: height,
            total_staked,
            total_owed,
        };
        // By identity: the index can still hold an entry an undo dropped.
        self.index.erase(layer, &updated)?;
        self.index.save(layer, &updated)?;
        self.records
            .get_mut(layer)?
            .entries
            .insert(key.clone(), Some(updated.clone()));
        undo.push(key, existing.map(|prior| prior.encode()));
        log!(
            INFO,
            "[stake] {} at height {}: staked +{} minted +{} -> {}/{} ratio {}",
            identity,
            height,
            stake_amount,
            mint_amount,
            total_staked,
            total_owed,
            updated.ratio()
        );
        Ok(updated)
    }

    /// Writes `cdp` as is, replacing whatever is visible for its identity.
    pub fn save(
        &mut self,
        layer: LayerId,
        cdp: &CdpRecord,
        undo: Option<&mut UndoLog>,
    ) -> Result<(), CdpError> {
        if cdp.is_empty() {
            return Err(CdpError::EmptyCdpId);
        }
        self.write(layer, cdp.identity().key_bytes(), Some(cdp.clone()), undo)?;
        self.index.erase(layer, cdp)?;
        self.index.save(layer, cdp)
    }

    /// Removes `cdp` after full redemption or liquidation.
    pub fn erase(
        &mut self,
        layer: LayerId,
        cdp: &CdpRecord,
        undo: Option<&mut UndoLog>,
    ) -> Result<(), CdpError> {
        if cdp.is_empty() {
            return Err(CdpError::EmptyCdpId);
        }
        self.write(layer, cdp.identity().key_bytes(), None, undo)?;
        self.index.erase(layer, cdp)?;
        Ok(())
    }

    /// Restores the identity entries recorded in `undo`, newest first.
    ///
    /// Only the identity store is rolled back. The paired index layer is
    /// expected to be discarded, or for the root, rebuilt with
    /// [`CdpCache::load_all`]. A key that was absent and that nothing below
    /// `layer` holds is dropped from the layer rather than marked erased.
    pub fn undo(&mut self, layer: LayerId, undo: &UndoLog) -> Result<(), CdpError> {
        let restored = undo
            .entries()
            .iter()
            .rev()
            .map(|entry| {
                let previous = entry
                    .previous
                    .as_deref()
                    .map(CdpRecord::decode)
                    .transpose()?;
                let shadows =
                    previous.is_some() || self.read_below(layer, &entry.key)?.is_some();
                Ok((entry.key.clone(), previous, shadows))
            })
            .collect::<Result<Vec<_>, CdpError>>()?;

        let current = self.records.get_mut(layer)?;
        for (key, previous, shadows) in restored {
            if shadows {
                current.entries.insert(key, previous);
            } else {
                current.entries.remove(&key);
            }
        }
        log!(INFO, "[undo] replayed {} entries on layer {}", undo.len(), layer);
        Ok(())
    }

    /// Merges `layer` into its parent pair. On the root this persists the
    /// cached identity writes to the durable store; the root index already is
    /// the canonical view and stays as it is.
    pub fn flush(&mut self, layer: LayerId) -> Result<(), CdpError> {
        let Some(parent) = self.records.parent(layer)? else {
            let entries = std::mem::take(&mut self.records.get_mut(layer)?.entries);
            return self.persist(entries);
        };
        self.index.flush(layer)?;
        let entries = std::mem::take(&mut self.records.get_mut(layer)?.entries);
        let flushed = entries.len();
        self.records.get_mut(parent)?.entries.extend(entries);
        log!(
            INFO,
            "[flush] merged {} identity writes from layer {} into {}",
            flushed,
            layer,
            parent
        );
        Ok(())
    }

    fn persist(&mut self, entries: BTreeMap<Vec<u8>, Option<CdpRecord>>) -> Result<(), CdpError> {
        let total = entries.len();
        let mut pending = entries.into_iter();
        while let Some((key, value)) = pending.next() {
            let db_key = cdp_db_key(&key);
            let written = match &value {
                Some(cdp) => self.store.set(&db_key, &cdp.encode()),
                None => self.store.erase(&db_key),
            };
            if let Err(e) = written {
                let root = self.records.get_mut(LayerId::ROOT)?;
                root.entries.insert(key, value);
                root.entries.extend(pending);
                log!(INFO, "[flush] durable write failed, {} writes kept cached: {}", root.len(), e);
                return Err(e);
            }
        }
        log!(INFO, "[flush] persisted {} identity writes", total);
        Ok(())
    }

    pub fn candidates_below_ratio(
        &self,
        layer: LayerId,
        threshold: Ratio,
        price: Price,
    ) -> Result<Vec<CdpRecord>, CdpError> {
        self.index.range_by_ratio_upper_bound(layer, threshold, price)
    }

    pub fn global_ratio(&self, layer: LayerId, price: Price) -> Result<Ratio, CdpError> {
        self.index.global_ratio(layer, price)
    }

    pub fn global_staked(&self, layer: LayerId) -> Result<u128, CdpError> {
        self.index.global_staked(layer)
    }

    pub fn global_owed(&self, layer: LayerId) -> Result<u128, CdpError> {
        self.index.global_owed(layer)
    }

    /// Whether the system-wide collateral ratio at `price` has fallen below `floor`.
    pub fn global_ratio_floor_breached(
        &self,
        layer: LayerId,
        price: Price,
        floor: Ratio,
    ) -> Result<bool, CdpError> {
        Ok(self.global_ratio(layer, price)? < floor)
    }

    /// Whether staking `new_stake` more would push total collateral past `ceiling`.
    pub fn global_collateral_ceiling_breached(
        &self,
        layer: LayerId,
        new_stake: u64,
        ceiling: u64,
    ) -> Result<bool, CdpError> {
        let staked = self.global_staked(layer)?;
        Ok(match staked.checked_add(u128::from(new_stake)) {
            Some(total) => total > u128::from(ceiling),
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CdpId;
    use crate::store::StableKvStore;
    use assert_matches::assert_matches;
    use ic_stable_structures::memory_manager::{MemoryId, MemoryManager};
    use ic_stable_structures::DefaultMemoryImpl;

    fn new_cache() -> CdpCache<StableKvStore> {
        let mm = MemoryManager::init(DefaultMemoryImpl::default());
        CdpCache::new(StableKvStore::init(mm.get(MemoryId::new(0))))
    }

    #[test]
    fn failed_index_flush_keeps_identity_writes() {
        let mut cache = new_cache();
        let block = cache.begin_layer(LayerId::ROOT).unwrap();
        let cdp = CdpRecord::new(RegId::new(4, 0), CdpId([4; 32]));
        cache
            .stake(block, 3, 50, 10, &cdp, &mut UndoLog::new())
            .unwrap();

        cache.index.discard_layer(block).unwrap();
        assert_matches!(cache.flush(block), Err(CdpError::UnknownLayer(_)));
        assert_eq!(cache.cache_size(block).unwrap(), 1);
        assert_eq!(cache.cache_size(LayerId::ROOT).unwrap(), 0);
        assert!(cache.get(block, &cdp.identity()).unwrap().is_some());
    }

    #[test]
    fn undoing_a_fresh_cdp_leaves_no_entry() {
        let mut cache = new_cache();
        let block = cache.begin_layer(LayerId::ROOT).unwrap();
        let cdp = CdpRecord::new(RegId::new(4, 0), CdpId([4; 32]));
        let mut undo = UndoLog::new();
        cache.stake(block, 3, 50, 10, &cdp, &mut undo).unwrap();
        cache.stake(block, 4, 1, 1, &cdp, &mut undo).unwrap();

        cache.undo(block, &undo).unwrap();
        assert_eq!(cache.cache_size(block).unwrap(), 0);
        assert_eq!(cache.get(block, &cdp.identity()).unwrap(), None);
    }

    #[test]
    fn undo_keeps_erase_marker_over_an_ancestor_value() {
        let mut cache = new_cache();
        let cdp = CdpRecord::new(RegId::new(4, 0), CdpId([4; 32]));
        cache
            .stake(LayerId::ROOT, 1, 50, 10, &cdp, &mut UndoLog::new())
            .unwrap();
        let block = cache.begin_layer(LayerId::ROOT).unwrap();

        let mut undo = UndoLog::new();
        cache.erase(block, &cdp, Some(&mut undo)).unwrap();
        cache.save(block, &cdp, Some(&mut undo)).unwrap();
        cache.undo(block, &undo).unwrap();
        // The oldest entry recorded the ancestor's value.
        assert_eq!(cache.cache_size(block).unwrap(), 1);
        assert_eq!(cache.get(block, &cdp.identity()).unwrap().map(|c| c.total_staked), Some(50));
    }
}
