//! Cross-connection cache of discovered attribute catalogs.
//!
//! Re-running discovery after every reconnect costs several round trips.
//! The cache lets a reconnecting [`ConnectionStateMachine`] skip it, under
//! the assumption that a peer's attribute layout is stable. Callers that
//! talk to peers which change their layout at runtime can turn on
//! revalidation in [`ConnectionConfig`], which always rediscovers and diffs
//! the result against the cached entry.
//!
//! The cache is an explicitly owned service: create one per process (or per
//! test) and hand clones of it to every connection that should share it.
//!
//! [`ConnectionStateMachine`]: crate::ConnectionStateMachine
//! [`ConnectionConfig`]: crate::ConnectionConfig

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use gattlink_types::{AttributeCatalog, PeerId};

type Slot = Arc<RwLock<Option<Arc<AttributeCatalog>>>>;

/// Result of storing a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogUpdate {
    /// There was no entry for the peer.
    Inserted,
    /// The new catalog has the same layout as the cached one.
    Unchanged,
    /// The layout differs from the cached one; the old entry was replaced.
    Replaced,
}

/// Peer-keyed cache of attribute catalogs.
///
/// Each peer has its own slot: lookups and writes for different peers never
/// contend beyond a brief map lookup, and writes for the same peer are
/// serialized (the last discovery wins).
#[derive(Clone, Default)]
pub struct ServiceCatalogCache {
    slots: Arc<RwLock<HashMap<PeerId, Slot>>>,
}

impl std::fmt::Debug for ServiceCatalogCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCatalogCache")
            .field("peers", &self.len())
            .finish()
    }
}

impl ServiceCatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, peer: &PeerId) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    fn slot_or_insert(&self, peer: &PeerId) -> Slot {
        if let Some(slot) = self.slot(peer) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(peer.clone()).or_default())
    }

    /// Get the cached catalog for `peer`.
    pub fn get(&self, peer: &PeerId) -> Option<Arc<AttributeCatalog>> {
        let slot = self.slot(peer)?;
        let catalog = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
        catalog
    }

    /// Store the catalog discovered for its peer.
    ///
    /// Compares layout fingerprints with the existing entry and reports
    /// whether the layout changed.
    pub fn put(&self, catalog: Arc<AttributeCatalog>) -> CatalogUpdate {
        let peer = catalog.peer().clone();
        let slot = self.slot_or_insert(&peer);
        let mut entry = slot.write().unwrap_or_else(PoisonError::into_inner);

        let update = match entry.as_ref() {
            None => CatalogUpdate::Inserted,
            Some(existing) if existing.has_same_layout(&catalog) => CatalogUpdate::Unchanged,
            Some(_) => CatalogUpdate::Replaced,
        };

        match update {
            CatalogUpdate::Replaced => info!(
                peer = %peer,
                characteristics = catalog.characteristic_count(),
                "Attribute layout changed, replacing cached catalog"
            ),
            _ => debug!(peer = %peer, ?update, "Cached attribute catalog"),
        }

        *entry = Some(catalog);
        update
    }

    /// Drop the cached catalog for `peer`. Returns whether one existed.
    pub fn invalidate(&self, peer: &PeerId) -> bool {
        let Some(slot) = self.slot(peer) else {
            return false;
        };
        let removed = slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if removed {
            debug!(peer = %peer, "Invalidated cached attribute catalog");
        }
        removed
    }

    /// Drop every cached catalog.
    pub fn invalidate_all(&self) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.values() {
            slot.write().unwrap_or_else(PoisonError::into_inner).take();
        }
        slots.clear();
        debug!("Invalidated all cached attribute catalogs");
    }

    /// Number of peers with a cached catalog.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| {
                slot.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_types::uuids::{BATTERY_LEVEL, BATTERY_SERVICE, DEVICE_NAME, GAP_SERVICE};
    use gattlink_types::{CharacteristicProperties, GattCharacteristic, GattService};

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn catalog(peer: &PeerId, service: uuid::Uuid, characteristic: uuid::Uuid) -> Arc<AttributeCatalog> {
        Arc::new(AttributeCatalog::new(
            peer.clone(),
            vec![GattService::new(service).with_characteristic(GattCharacteristic::new(
                characteristic,
                CharacteristicProperties::from_bits(0x02),
            ))],
        ))
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = ServiceCatalogCache::new();
        let a = peer("AA:BB:CC:DD:EE:01");

        assert!(cache.get(&a).is_none());
        assert_eq!(cache.put(catalog(&a, BATTERY_SERVICE, BATTERY_LEVEL)), CatalogUpdate::Inserted);
        assert!(cache.get(&a).is_some());
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate(&a));
        assert!(!cache.invalidate(&a));
        assert!(cache.get(&a).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_reports_layout_change() {
        let cache = ServiceCatalogCache::new();
        let a = peer("AA:BB:CC:DD:EE:01");

        cache.put(catalog(&a, BATTERY_SERVICE, BATTERY_LEVEL));
        assert_eq!(
            cache.put(catalog(&a, BATTERY_SERVICE, BATTERY_LEVEL)),
            CatalogUpdate::Unchanged
        );
        assert_eq!(cache.put(catalog(&a, GAP_SERVICE, DEVICE_NAME)), CatalogUpdate::Replaced);

        let cached = cache.get(&a).unwrap();
        assert!(cached.service(&GAP_SERVICE).is_some());
    }

    #[test]
    fn test_peers_are_isolated() {
        let cache = ServiceCatalogCache::new();
        let a = peer("AA:BB:CC:DD:EE:01");
        let b = peer("AA:BB:CC:DD:EE:02");

        cache.put(catalog(&a, BATTERY_SERVICE, BATTERY_LEVEL));
        cache.put(catalog(&b, GAP_SERVICE, DEVICE_NAME));

        cache.invalidate(&a);
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = ServiceCatalogCache::new();
        let shared = cache.clone();
        let a = peer("AA:BB:CC:DD:EE:01");

        cache.put(catalog(&a, BATTERY_SERVICE, BATTERY_LEVEL));
        assert!(shared.get(&a).is_some());
    }

    #[test]
    fn test_concurrent_writers_last_wins() {
        let cache = ServiceCatalogCache::new();
        let a = peer("AA:BB:CC:DD:EE:01");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                let a = a.clone();
                std::thread::spawn(move || {
                    let service = gattlink_types::uuids::from_u16(0x1800 + i);
                    cache.put(catalog(&a, service, DEVICE_NAME))
                })
            })
            .collect();

        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|u| *u == CatalogUpdate::Inserted)
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(cache.len(), 1);
    }
}
