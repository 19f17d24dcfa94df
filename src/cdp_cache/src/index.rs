//! Ratio-ordered, copy-on-write view of CDPs for liquidation scans and
//! global collateral checks.
//!
//! Every layer records its own decisions per identity (present with a record,
//! or deleted) and the signed change it makes to the global totals. Reads walk
//! the chain from the layer towards the root and the nearest decision for an
//! identity wins. Ancestors are never written except through [`RatioIndex::flush`].

use crate::layer::{LayerId, LayerTree};
use crate::logs::{DEBUG, INFO};
use crate::numeric::{Price, Ratio};
use crate::record::{CdpId, CdpIdentity, CdpRecord, RegId};
use crate::store::{cdp_db_key, KeyValueStore, CDP_PREFIX};
use crate::CdpError;
use ic_canister_log::log;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexEntry {
    Present(CdpRecord),
    Deleted,
}

/// Sort key of an index entry. The ratio is taken when the entry is inserted
/// and never changes afterwards; an update is always delete-then-insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    pub ratio: Ratio,
    pub owner: RegId,
    pub cdp_id: CdpId,
}

impl OrderKey {
    pub fn of(record: &CdpRecord) -> Self {
        Self {
            ratio: record.ratio(),
            owner: record.owner,
            cdp_id: record.cdp_id,
        }
    }

    /// Greatest key with the given ratio.
    fn upper_bound(ratio: Ratio) -> Self {
        Self {
            ratio,
            owner: RegId::MAX,
            cdp_id: CdpId::MAX,
        }
    }

    pub fn identity(&self) -> CdpIdentity {
        CdpIdentity::new(self.owner, self.cdp_id)
    }
}

/// One layer of the index.
#[derive(Clone, Debug, Default)]
pub struct IndexLayer {
    entries: BTreeMap<CdpIdentity, (OrderKey, IndexEntry)>,
    by_ratio: BTreeSet<OrderKey>,
    staked: i128,
    owed: i128,
}

impl IndexLayer {
    pub fn decision(&self, identity: &CdpIdentity) -> Option<&IndexEntry> {
        self.entries.get(identity).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// This layer's own contribution to total staked collateral.
    pub fn staked_delta(&self) -> i128 {
        self.staked
    }

    pub fn owed_delta(&self) -> i128 {
        self.owed
    }

    fn put_present(&mut self, record: CdpRecord) {
        let key = OrderKey::of(&record);
        self.staked += i128::from(record.total_staked);
        self.owed += i128::from(record.total_owed);
        self.by_ratio.insert(key);
        self.entries
            .insert(record.identity(), (key, IndexEntry::Present(record)));
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Decodes every CDP under the store namespace, keyed by identity. Fails on
/// the first row that does not decode or sits under a foreign key.
pub fn scan_records<S: KeyValueStore>(
    store: &S,
) -> Result<BTreeMap<CdpIdentity, CdpRecord>, CdpError> {
    let mut records = BTreeMap::new();
    for (key, value) in store.scan_prefix(CDP_PREFIX)? {
        let record = CdpRecord::decode(&value)?;
        if cdp_db_key(&record.identity().key_bytes()) != key {
            return Err(CdpError::Decode(format!(
                "record {} stored under a foreign key",
                record.identity()
            )));
        }
        records.insert(record.identity(), record);
    }
    Ok(records)
}

pub struct RatioIndex {
    layers: LayerTree<IndexLayer>,
}

impl Default for RatioIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl RatioIndex {
    pub fn new() -> Self {
        Self {
            layers: LayerTree::new(IndexLayer::default()),
        }
    }

    pub fn add_layer(&mut self, id: LayerId, parent: LayerId) -> Result<(), CdpError> {
        self.layers.insert(id, parent, IndexLayer::default())
    }

    /// Drops a layer and everything it holds without touching its parent.
    pub fn discard_layer(&mut self, id: LayerId) -> Result<(), CdpError> {
        self.layers.remove(id).map(|_| ())
    }

    pub fn set_base(&mut self, id: LayerId, parent: LayerId) -> Result<(), CdpError> {
        self.layers.set_parent(id, parent)
    }

    pub fn parent(&self, id: LayerId) -> Result<Option<LayerId>, CdpError> {
        self.layers.parent(id)
    }

    pub fn layer(&self, id: LayerId) -> Result<&IndexLayer, CdpError> {
        self.layers.get(id)
    }

    pub fn contains_layer(&self, id: LayerId) -> bool {
        self.layers.contains(id)
    }

    /// Rebuilds the root layer from every CDP in `store`. The root is only
    /// replaced once the whole scan decoded cleanly.
    pub fn load_all<S: KeyValueStore>(&mut self, store: &S) -> Result<usize, CdpError> {
        let rows = scan_records(store)?;
        self.replace_root(rows.into_values())
    }

    /// Swaps in a root layer holding exactly `records`.
    pub fn replace_root(
        &mut self,
        records: impl IntoIterator<Item = CdpRecord>,
    ) -> Result<usize, CdpError> {
        let mut root = IndexLayer::default();
        for record in records {
            root.put_present(record);
        }
        let loaded = root.len();
        log!(
            INFO,
            "[load_all] loaded {} cdps, staked={} owed={}",
            loaded,
            root.staked,
            root.owed
        );
        *self.layers.get_mut(LayerId::ROOT)? = root;
        Ok(loaded)
    }

    /// The record visible for `identity` from `layer`, if any.
    pub fn lookup(
        &self,
        layer: LayerId,
        identity: &CdpIdentity,
    ) -> Result<Option<&CdpRecord>, CdpError> {
        for current in self.layers.chain(layer)? {
            match current.decision(identity) {
                Some(IndexEntry::Present(record)) => return Ok(Some(record)),
                Some(IndexEntry::Deleted) => return Ok(None),
                None => continue,
            }
        }
        Ok(None)
    }

    /// Inserts `record` under its current ratio.
    ///
    /// The identity must not be visible from `layer`: an existing entry has to
    /// be erased first, otherwise its stale ratio key would stay reachable by
    /// range scans.
    pub fn save(&mut self, layer: LayerId, record: &CdpRecord) -> Result<(), CdpError> {
        if record.is_empty() {
            return Err(CdpError::EmptyCdpId);
        }
        let identity = record.identity();
        if self.lookup(layer, &identity)?.is_some() {
            log!(DEBUG, "[index_save] {} is already indexed in layer {}", identity, layer);
            return Err(CdpError::StaleIndexEntry(identity.to_string()));
        }
        self.layers.get_mut(layer)?.put_present(record.clone());
        Ok(())
    }

    /// Masks `record`'s identity in `layer`. Returns whether a visible entry
    /// was removed; erasing twice is a no-op.
    pub fn erase(&mut self, layer: LayerId, record: &CdpRecord) -> Result<bool, CdpError> {
        self.erase_identity(layer, &record.identity(), OrderKey::of(record))
    }

    fn erase_identity(
        &mut self,
        layer: LayerId,
        identity: &CdpIdentity,
        key_hint: OrderKey,
    ) -> Result<bool, CdpError> {
        let visible = self.lookup(layer, identity)?.cloned();
        let current = self.layers.get_mut(layer)?;
        if let Some(IndexEntry::Deleted) = current.decision(identity) {
            return Ok(false);
        }
        let key = match &visible {
            Some(record) => {
                let key = OrderKey::of(record);
                current.by_ratio.remove(&key);
                current.staked -= i128::from(record.total_staked);
                current.owed -= i128::from(record.total_owed);
                key
            }
            None => key_hint,
        };
        if layer.is_root() {
            // Nothing below the root to mask.
            current.entries.remove(identity);
        } else {
            current.entries.insert(*identity, (key, IndexEntry::Deleted));
        }
        Ok(visible.is_some())
    }

    /// Records visible from `layer` whose collateral ratio at `price` is at or
    /// below `threshold`, riskiest first. Positions without debt never qualify.
    pub fn range_by_ratio_upper_bound(
        &self,
        layer: LayerId,
        threshold: Ratio,
        price: Price,
    ) -> Result<Vec<CdpRecord>, CdpError> {
        let upper = OrderKey::upper_bound(threshold.at_price(price)?);
        let chain = self.layers.chain(layer)?;
        let mut hits = BTreeMap::new();
        for (depth, current) in chain.iter().enumerate() {
            let keys = current
                .by_ratio
                .range(..=upper)
                .take_while(|key| !key.ratio.is_infinite());
            for key in keys {
                let identity = key.identity();
                if chain[..depth]
                    .iter()
                    .any(|nearer| nearer.decision(&identity).is_some())
                {
                    continue;
                }
                if let Some(IndexEntry::Present(record)) = current.decision(&identity) {
                    hits.insert(*key, record.clone());
                }
            }
        }
        Ok(hits.into_values().collect())
    }

    fn totals(&self, layer: LayerId) -> Result<(u128, u128), CdpError> {
        let (staked, owed) = self
            .layers
            .chain(layer)?
            .iter()
            .fold((0i128, 0i128), |(staked, owed), current| {
                (staked + current.staked, owed + current.owed)
            });
        let staked = u128::try_from(staked)
            .map_err(|_| CdpError::InconsistentAggregates(format!("staked={}", staked)))?;
        let owed = u128::try_from(owed)
            .map_err(|_| CdpError::InconsistentAggregates(format!("owed={}", owed)))?;
        Ok((staked, owed))
    }

    /// Total staked collateral over owed debt at `price`, infinite without debt.
    pub fn global_ratio(&self, layer: LayerId, price: Price) -> Result<Ratio, CdpError> {
        let (staked, owed) = self.totals(layer)?;
        Ratio::of_priced(staked, owed, price)
    }

    /// Sum over every position, which may exceed `u64::MAX`.
    pub fn global_staked(&self, layer: LayerId) -> Result<u128, CdpError> {
        Ok(self.totals(layer)?.0)
    }

    pub fn global_owed(&self, layer: LayerId) -> Result<u128, CdpError> {
        Ok(self.totals(layer)?.1)
    }

    /// Merges every decision of `layer` into its parent and empties `layer`.
    pub fn flush(&mut self, layer: LayerId) -> Result<usize, CdpError> {
        let parent = self
            .layers
            .parent(layer)?
            .ok_or(CdpError::NoParentLayer(layer.0))?;
        let current = self.layers.get_mut(layer)?;
        let entries = std::mem::take(&mut current.entries);
        current.clear();

        let flushed = entries.len();
        for (identity, (key, entry)) in entries {
            self.erase_identity(parent, &identity, key)?;
            if let IndexEntry::Present(record) = entry {
                self.save(parent, &record)?;
            }
        }
        log!(
            INFO,
            "[index_flush] merged {} entries from layer {} into {}",
            flushed,
            layer,
            parent
        );
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    const TIP: LayerId = LayerId(1);
    const BLOCK: LayerId = LayerId(2);

    fn cdp(owner: u32, id: u8, staked: u64, owed: u64) -> CdpRecord {
        CdpRecord {
            owner: RegId::new(owner, 0),
            cdp_id: CdpId([id; 32]),
            last_op_height: 1,
            total_staked: staked,
            total_owed: owed,
        }
    }

    fn chained() -> RatioIndex {
        let mut index = RatioIndex::new();
        index.add_layer(TIP, LayerId::ROOT).unwrap();
        index.add_layer(BLOCK, TIP).unwrap();
        index
    }

    fn ids(records: &[CdpRecord]) -> Vec<u8> {
        records.iter().map(|r| r.cdp_id.0[0]).collect()
    }

    fn below(index: &RatioIndex, layer: LayerId, threshold: rust_decimal::Decimal) -> Vec<u8> {
        ids(&index
            .range_by_ratio_upper_bound(layer, Ratio::new(threshold), Price::ONE)
            .unwrap())
    }

    #[test]
    fn ties_break_by_owner_then_id_and_unbacked_sorts_last() {
        let mut index = RatioIndex::new();
        index.save(LayerId::ROOT, &cdp(2, 1, 100, 100)).unwrap();
        index.save(LayerId::ROOT, &cdp(1, 3, 100, 100)).unwrap();
        index.save(LayerId::ROOT, &cdp(1, 2, 100, 100)).unwrap();
        index.save(LayerId::ROOT, &cdp(1, 9, 50, 100)).unwrap();
        index.save(LayerId::ROOT, &cdp(1, 8, 50, 0)).unwrap();
        assert_eq!(below(&index, LayerId::ROOT, dec!(1)), vec![9, 2, 3, 1]);
        let everything = index
            .range_by_ratio_upper_bound(LayerId::ROOT, Ratio::INFINITE, Price::ONE)
            .unwrap();
        assert_eq!(ids(&everything), vec![9, 2, 3, 1]);
    }

    #[test]
    fn erase_in_child_masks_ancestor_entry() {
        let mut index = chained();
        let a = cdp(1, 1, 100, 100);
        index.save(LayerId::ROOT, &a).unwrap();
        assert!(index.erase(BLOCK, &a).unwrap());

        assert!(below(&index, BLOCK, dec!(5)).is_empty());
        assert_eq!(below(&index, TIP, dec!(5)), vec![1]);
        assert_eq!(index.global_staked(BLOCK).unwrap(), 0);
        assert_eq!(index.global_staked(TIP).unwrap(), 100);
        assert_eq!(index.lookup(BLOCK, &a.identity()).unwrap(), None);
    }

    #[test]
    fn erase_is_idempotent_on_aggregates() {
        let mut index = chained();
        let a = cdp(1, 1, 100, 40);
        index.save(TIP, &a).unwrap();
        assert!(index.erase(BLOCK, &a).unwrap());
        assert!(!index.erase(BLOCK, &a).unwrap());
        assert_eq!(index.layer(BLOCK).unwrap().staked_delta(), -100);
        assert_eq!(index.global_owed(BLOCK).unwrap(), 0);
    }

    #[test]
    fn update_moves_between_buckets() {
        let mut index = chained();
        let old = cdp(1, 1, 100, 100);
        index.save(TIP, &old).unwrap();
        let new = CdpRecord {
            total_staked: 300,
            ..old.clone()
        };
        index.erase(BLOCK, &old).unwrap();
        index.save(BLOCK, &new).unwrap();

        assert!(below(&index, BLOCK, dec!(1)).is_empty());
        assert_eq!(below(&index, BLOCK, dec!(3)), vec![1]);
        assert_eq!(index.global_staked(BLOCK).unwrap(), 300);
        assert_eq!(index.lookup(BLOCK, &old.identity()).unwrap(), Some(&new));
    }

    #[test]
    fn saving_a_visible_identity_is_rejected() {
        let mut index = chained();
        let a = cdp(1, 1, 100, 100);
        index.save(LayerId::ROOT, &a).unwrap();
        assert_matches!(index.save(BLOCK, &a), Err(CdpError::StaleIndexEntry(_)));
        assert_matches!(index.save(BLOCK, &CdpRecord::empty()), Err(CdpError::EmptyCdpId));
        assert_eq!(index.layer(BLOCK).unwrap().len(), 0);
    }

    #[test]
    fn flush_matches_direct_application() {
        let a = cdp(1, 1, 100, 100);
        let b = cdp(2, 2, 500, 100);
        let b2 = CdpRecord {
            total_owed: 400,
            ..b.clone()
        };
        let c = cdp(3, 3, 10, 20);

        let mut layered = chained();
        layered.save(TIP, &a).unwrap();
        layered.save(TIP, &b).unwrap();
        layered.erase(BLOCK, &a).unwrap();
        layered.erase(BLOCK, &b).unwrap();
        layered.save(BLOCK, &b2).unwrap();
        layered.save(BLOCK, &c).unwrap();
        assert_eq!(layered.flush(BLOCK).unwrap(), 3);
        assert!(layered.layer(BLOCK).unwrap().is_empty());
        layered.discard_layer(BLOCK).unwrap();

        let mut direct = chained();
        direct.save(TIP, &a).unwrap();
        direct.save(TIP, &b).unwrap();
        direct.erase(TIP, &a).unwrap();
        direct.erase(TIP, &b).unwrap();
        direct.save(TIP, &b2).unwrap();
        direct.save(TIP, &c).unwrap();

        assert_eq!(below(&layered, TIP, dec!(10)), below(&direct, TIP, dec!(10)));
        assert_eq!(below(&layered, TIP, dec!(10)), vec![c.cdp_id.0[0], b2.cdp_id.0[0]]);
        assert_eq!(layered.global_staked(TIP).unwrap(), direct.global_staked(TIP).unwrap());
        assert_eq!(layered.global_owed(TIP).unwrap(), 420);
    }

    #[test]
    fn totals_past_u64_stay_readable() {
        let mut index = RatioIndex::new();
        let half = u64::MAX / 2 + 1;
        index.save(LayerId::ROOT, &cdp(1, 1, half, 1)).unwrap();
        index.save(LayerId::ROOT, &cdp(2, 2, half, 1)).unwrap();
        assert_eq!(
            index.global_staked(LayerId::ROOT).unwrap(),
            u128::from(u64::MAX) + 1
        );
        assert_eq!(index.global_owed(LayerId::ROOT).unwrap(), 2);
        assert!(!index
            .global_ratio(LayerId::ROOT, Price::ONE)
            .unwrap()
            .is_infinite());
    }

    #[test]
    fn root_cannot_be_flushed() {
        let mut index = RatioIndex::new();
        assert_matches!(index.flush(LayerId::ROOT), Err(CdpError::NoParentLayer(0)));
    }

    #[test]
    fn global_ratio_uses_price() {
        let mut index = chained();
        assert!(index.global_ratio(BLOCK, Price::ONE).unwrap().is_infinite());
        index.save(TIP, &cdp(1, 1, 1_000, 500)).unwrap();
        index.save(BLOCK, &cdp(2, 2, 500, 500)).unwrap();
        assert_eq!(
            index.global_ratio(BLOCK, Price::new(dec!(0.5))).unwrap(),
            Ratio::new(dec!(0.75))
        );
        assert_eq!(index.global_ratio(TIP, Price::ONE).unwrap(), Ratio::new(dec!(2)));
    }

    #[test]
    fn price_scales_candidate_threshold() {
        let mut index = RatioIndex::new();
        index.save(LayerId::ROOT, &cdp(1, 1, 200, 100)).unwrap();
        let at_par = index
            .range_by_ratio_upper_bound(LayerId::ROOT, Ratio::new(dec!(1.5)), Price::ONE)
            .unwrap();
        assert!(at_par.is_empty());
        let halved = index
            .range_by_ratio_upper_bound(LayerId::ROOT, Ratio::new(dec!(1.5)), Price::new(dec!(0.5)))
            .unwrap();
        assert_eq!(ids(&halved), vec![1]);
    }
}
