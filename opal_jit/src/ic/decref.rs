//! The decref-info registry.
//!
//! For every call site inside a committed slot that may throw, the
//! rewriter publishes the locations of owned references an unwinder must
//! release if an exception transits the slot. Entries are keyed by the
//! call's return address, which is what the unwinder has in hand.
//!
//! The registry is process-global because the unwinder walks frames that
//! belong to arbitrary ICs. Entries for a slot are removed as a range
//! when the slot is invalidated or its IC is dropped.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::rewrite::Location;

static DECREF_INFOS: RwLock<BTreeMap<u64, Vec<Location>>> = RwLock::new(BTreeMap::new());

/// Publish the owned-reference locations live at `return_addr`.
pub fn register_decref_info(return_addr: u64, locations: Vec<Location>) {
    let mut infos = DECREF_INFOS.write();
    infos.insert(return_addr, locations);
}

/// The unwinder's read interface: the locations to release when passing
/// through `return_addr`.
pub fn lookup_decref_info(return_addr: u64) -> Option<Vec<Location>> {
    DECREF_INFOS.read().get(&return_addr).cloned()
}

/// Drop every entry whose return address falls in `[start, end)`.
/// Called when the covering slot is invalidated or torn down.
pub fn deregister_decref_range(start: u64, end: u64) {
    let mut infos = DECREF_INFOS.write();
    let stale: Vec<u64> = infos.range(start..end).map(|(&ip, _)| ip).collect();
    for ip in stale {
        infos.remove(&ip);
    }
}
