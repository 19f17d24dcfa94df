use crate::cache::CdpCache;
use crate::layer::LayerId;
use crate::logs::INFO;
use crate::store::StableKvStore;
use crate::CdpError;
use candid::{CandidType, Deserialize};
use ic_canister_log::log;
use serde::Serialize;
use std::cell::RefCell;

/// Stable-memory region holding CDP records unless configured otherwise.
pub const DEFAULT_CDP_MEMORY_ID: u8 = 0;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitArg {
    pub memory_id: u8,
}

impl Default for InitArg {
    fn default() -> Self {
        Self {
            memory_id: DEFAULT_CDP_MEMORY_ID,
        }
    }
}

thread_local! {
    static __STATE: RefCell<Option<CdpCache<StableKvStore>>> = RefCell::default();
}

/// Opens the canonical cache over stable memory and indexes every stored CDP.
/// Returns the number of CDPs loaded. The previous state, if any, is replaced
/// only when the load succeeds.
pub fn init_state(arg: InitArg) -> Result<usize, CdpError> {
    let cache = CdpCache::open(StableKvStore::open(arg.memory_id))?;
    let loaded = cache.index().layer(LayerId::ROOT)?.len();
    __STATE.with(|s| *s.borrow_mut() = Some(cache));
    log!(
        INFO,
        "[init_state] cdp cache ready on memory {} with {} cdps",
        arg.memory_id,
        loaded
    );
    Ok(loaded)
}

pub fn mutate_state<F, R>(f: F) -> Result<R, CdpError>
where
    F: FnOnce(&mut CdpCache<StableKvStore>) -> R,
{
    __STATE.with(|s| s.borrow_mut().as_mut().map(f).ok_or(CdpError::NotInitialized))
}

/// Read (part of) the canonical cache using `f`.
pub fn read_state<F, R>(f: F) -> Result<R, CdpError>
where
    F: FnOnce(&CdpCache<StableKvStore>) -> R,
{
    __STATE.with(|s| s.borrow().as_ref().map(f).ok_or(CdpError::NotInitialized))
}
