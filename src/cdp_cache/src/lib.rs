use candid::{CandidType, Deserialize};
use std::fmt;

pub mod cache;
pub mod codec;
pub mod index;
pub mod layer;
pub mod logs;
pub mod metrics;
pub mod numeric;
pub mod record;
pub mod state;
pub mod store;
pub mod undo;


pub use cache::CdpCache;
pub use index::RatioIndex;
pub use layer::LayerId;
pub use numeric::Price;
pub use record::{CandidCdp, CdpId, CdpIdentity, CdpRecord, RegId};
pub use store::{KeyValueStore, StableKvStore};
pub use undo::UndoLog;

#[derive(CandidType, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum CdpError {
    Store(String),
    Decode(String),
    Encode(String),
    EmptyCdpId,
    AmountOverflow(String),
    StaleIndexEntry(String),
    InvalidPrice(String),
    InconsistentAggregates(String),
    UnknownLayer(u32),
    LayerExists(u32),
    LayerHasChildren(u32),
    NoParentLayer(u32),
    LayerCycle { layer: u32, parent: u32 },
    RootLayer,
    NotInitialized,
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(msg) => write!(f, "store failure: {}", msg),
            Self::Decode(msg) => write!(f, "malformed bytes: {}", msg),
            Self::Encode(msg) => write!(f, "cannot encode: {}", msg),
            Self::EmptyCdpId => write!(f, "cdp id is empty"),
            Self::AmountOverflow(cdp) => write!(f, "totals of {} would overflow", cdp),
            Self::StaleIndexEntry(cdp) => {
                write!(f, "{} is still indexed, erase it before saving", cdp)
            }
            Self::InvalidPrice(price) => write!(f, "price must be positive, got {}", price),
            Self::InconsistentAggregates(msg) => write!(f, "global totals out of range: {}", msg),
            Self::UnknownLayer(id) => write!(f, "no layer #{}", id),
            Self::LayerExists(id) => write!(f, "layer #{} already exists", id),
            Self::LayerHasChildren(id) => write!(f, "layer #{} still has children", id),
            Self::NoParentLayer(id) => write!(f, "layer #{} has no parent to flush into", id),
            Self::LayerCycle { layer, parent } => {
                write!(f, "layer #{} cannot sit over its descendant #{}", layer, parent)
            }
            Self::RootLayer => write!(f, "the root layer cannot be rebound or removed"),
            Self::NotInitialized => write!(f, "cdp cache is not initialized"),
        }
    }
}

impl std::error::Error for CdpError {}
