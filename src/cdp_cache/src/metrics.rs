use crate::cache::CdpCache;
use crate::layer::LayerId;
use crate::numeric::Price;
use crate::store::KeyValueStore;
use crate::CdpError;
use ic_metrics_encoder::MetricsEncoder;
use std::io;

fn to_io(e: CdpError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Exports the CDP totals visible from `layer` as Prometheus gauges.
pub fn encode_metrics<S: KeyValueStore, W: io::Write>(
    w: &mut MetricsEncoder<W>,
    cache: &CdpCache<S>,
    layer: LayerId,
    price: Price,
) -> io::Result<()> {
    w.encode_gauge(
        "cdp_total_staked",
        cache.global_staked(layer).map_err(to_io)? as f64,
        "Base coins staked across all CDPs.",
    )?;

    w.encode_gauge(
        "cdp_total_owed",
        cache.global_owed(layer).map_err(to_io)? as f64,
        "Stable coins owed across all CDPs.",
    )?;

    w.encode_gauge(
        "cdp_global_collateral_ratio",
        cache.global_ratio(layer, price).map_err(to_io)?.to_f64(),
        "Total staked value over total owed at the given price.",
    )?;

    w.encode_gauge(
        "cdp_indexed_count",
        cache.index().layer(LayerId::ROOT).map_err(to_io)?.len() as f64,
        "CDPs held by the canonical index layer.",
    )?;

    w.encode_gauge(
        "cdp_cache_layers",
        cache.layer_count() as f64,
        "Open cache layers, root included.",
    )?;

    w.encode_gauge(
        "cdp_cached_writes",
        cache.cache_size(layer).map_err(to_io)? as f64,
        "Identity writes cached in the layer and not yet flushed.",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CdpId, CdpRecord, RegId};
    use crate::store::StableKvStore;
    use crate::undo::UndoLog;
    use ic_stable_structures::memory_manager::{MemoryId, MemoryManager};
    use ic_stable_structures::DefaultMemoryImpl;

    #[test]
    fn exports_totals() {
        let mm = MemoryManager::init(DefaultMemoryImpl::default());
        let mut cache = CdpCache::new(StableKvStore::init(mm.get(MemoryId::new(0))));
        let cdp = CdpRecord::new(RegId::new(1, 0), CdpId([1; 32]));
        cache
            .stake(LayerId::ROOT, 5, 2_000, 1_000, &cdp, &mut UndoLog::new())
            .unwrap();

        let mut w = MetricsEncoder::new(vec![], 0);
        encode_metrics(&mut w, &cache, LayerId::ROOT, Price::ONE).unwrap();
        let body = String::from_utf8(w.into_inner()).unwrap();
        assert!(body.contains("cdp_total_staked 2000"));
        assert!(body.contains("cdp_total_owed 1000"));
        assert!(body.contains("cdp_global_collateral_ratio 2"));
        assert!(body.contains("cdp_cached_writes 1"));
    }
}
