use crate::CdpError;
use ic_stable_structures::memory_manager::{MemoryId, MemoryManager, VirtualMemory};
use ic_stable_structures::{DefaultMemoryImpl, StableBTreeMap};
use std::cell::RefCell;

pub type Memory = VirtualMemory<DefaultMemoryImpl>;

/// Namespace prefix for CDP records in the durable store.
pub const CDP_PREFIX: &[u8] = b"cdp";

thread_local! {
    static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> =
        RefCell::new(MemoryManager::init(DefaultMemoryImpl::default()));
}

/// Durable key-value engine underneath the root cache layer.
///
/// Implementations own their durability and I/O semantics; failures surface as
/// [`CdpError::Store`] and are not classified further here. A missing key is
/// `Ok(None)`.
pub trait KeyValueStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CdpError>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), CdpError>;
    fn erase(&mut self, key: &[u8]) -> Result<(), CdpError>;
    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CdpError>;
}

/// Full durable key for a composite CDP key.
pub fn cdp_db_key(key: &[u8]) -> Vec<u8> {
    let mut db_key = Vec::with_capacity(CDP_PREFIX.len() + key.len());
    db_key.extend_from_slice(CDP_PREFIX);
    db_key.extend_from_slice(key);
    db_key
}

/// [`KeyValueStore`] over a stable-memory B-tree.
pub struct StableKvStore {
    map: StableBTreeMap<Vec<u8>, Vec<u8>, Memory>,
}

impl StableKvStore {
    pub fn init(memory: Memory) -> Self {
        Self {
            map: StableBTreeMap::init(memory),
        }
    }

    /// Opens the store in the region `memory_id` of the thread's memory manager.
    /// Reopening a region sees everything written to it before.
    pub fn open(memory_id: u8) -> Self {
        MEMORY_MANAGER.with(|mm| Self::init(mm.borrow().get(MemoryId::new(memory_id))))
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KeyValueStore for StableKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CdpError> {
        Ok(self.map.get(&key.to_vec()))
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), CdpError> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn erase(&mut self, key: &[u8]) -> Result<(), CdpError> {
        self.map.remove(&key.to_vec());
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CdpError> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_store() -> StableKvStore {
        let mm = MemoryManager::init(DefaultMemoryImpl::default());
        StableKvStore::init(mm.get(MemoryId::new(0)))
    }

    #[test]
    fn set_get_erase() {
        let mut store = fresh_store();
        assert_eq!(store.get(b"cdpa").unwrap(), None);
        store.set(b"cdpa", b"1").unwrap();
        assert_eq!(store.get(b"cdpa").unwrap(), Some(b"1".to_vec()));
        store.erase(b"cdpa").unwrap();
        assert_eq!(store.get(b"cdpa").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn scan_stops_at_prefix_boundary() {
        let mut store = fresh_store();
        for key in [&b"cdo"[..], b"cdp", b"cdp\x01", b"cdp\x02", b"cdq"] {
            store.set(key, b"v").unwrap();
        }
        let keys: Vec<Vec<u8>> = store
            .scan_prefix(CDP_PREFIX)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"cdp".to_vec(), b"cdp\x01".to_vec(), b"cdp\x02".to_vec()]);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn reopened_region_keeps_data() {
        StableKvStore::open(9).set(b"cdpx", b"y").unwrap();
        assert_eq!(StableKvStore::open(9).get(b"cdpx").unwrap(), Some(b"y".to_vec()));
    }
}
