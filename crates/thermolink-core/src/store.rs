// ── Device snapshot store ──
//
// Last-known-good state per device, plus freshness metadata. Pure data
// holder: no I/O, no knowledge of the network layer. Single writer (the
// refresh cycle); concurrent readers see either the pre-cycle or the
// fully updated snapshot for each device, never a half-written one —
// every mutation replaces the whole `Arc<DeviceSnapshot>` for that entry.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thermolink_api::{DeviceId, ThermostatState};
use tokio::sync::watch;
use tracing::debug;

/// Last-known-good state for one physical device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    /// Last successfully fetched state. Carried over unchanged when a
    /// fetch fails.
    pub state: ThermostatState,
    pub last_success_at: DateTime<Utc>,
    /// Failed fetches since the last success.
    pub consecutive_failures: u32,
    /// True when `state` is a carried-over value because the most recent
    /// fetch failed.
    pub stale: bool,
}

/// Per-installation snapshot storage.
///
/// Mirrors the reactive-collection pattern: `DashMap` for concurrent
/// lookups, a `watch` channel broadcasting a rebuilt full snapshot on
/// every mutation.
pub struct SnapshotStore {
    by_id: DashMap<DeviceId, Arc<DeviceSnapshot>>,
    snapshot: watch::Sender<Arc<Vec<Arc<DeviceSnapshot>>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_id: DashMap::new(),
            snapshot,
        }
    }

    /// Look up one device's snapshot.
    pub fn get(&self, id: DeviceId) -> Option<Arc<DeviceSnapshot>> {
        self.by_id.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Record a successful fetch: replace the state wholesale and reset
    /// the freshness metadata.
    pub fn upsert(&self, id: DeviceId, state: ThermostatState) {
        self.by_id.insert(
            id,
            Arc::new(DeviceSnapshot {
                device_id: id,
                state,
                last_success_at: Utc::now(),
                consecutive_failures: 0,
                stale: false,
            }),
        );
        self.rebuild_snapshot();
    }

    /// Record a failed fetch: keep the cached state, bump the failure
    /// count, flag the snapshot stale. Returns `false` for unknown ids.
    pub fn mark_stale(&self, id: DeviceId) -> bool {
        let Some(existing) = self.by_id.get(&id).map(|r| Arc::clone(r.value())) else {
            return false;
        };
        let mut updated = (*existing).clone();
        updated.consecutive_failures = updated.consecutive_failures.saturating_add(1);
        updated.stale = true;
        self.by_id.insert(id, Arc::new(updated));
        self.rebuild_snapshot();
        true
    }

    /// Remove a device. Only called when discovery reports it gone.
    pub fn remove(&self, id: DeviceId) -> Option<Arc<DeviceSnapshot>> {
        let removed = self.by_id.remove(&id).map(|(_, v)| v);
        if removed.is_some() {
            self.rebuild_snapshot();
        }
        removed
    }

    /// All current snapshots, ordered by device id.
    pub fn all(&self) -> Vec<Arc<DeviceSnapshot>> {
        let mut entries: Vec<Arc<DeviceSnapshot>> =
            self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
        entries.sort_by_key(|s| s.device_id);
        entries
    }

    /// All known device ids.
    pub fn ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.by_id.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Get the current full snapshot (cheap `Arc` clone).
    pub fn snapshot(&self) -> Arc<Vec<Arc<DeviceSnapshot>>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to full-snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<DeviceSnapshot>>>> {
        self.snapshot.subscribe()
    }

    /// Apply a discovery result: upsert every reported device, then prune
    /// the ones discovery no longer reports. Upsert-then-prune avoids the
    /// brief empty state a clear-then-insert approach would cause.
    pub fn apply_discovery(&self, devices: Vec<(DeviceId, ThermostatState)>) {
        let incoming: HashSet<DeviceId> = devices.iter().map(|(id, _)| *id).collect();
        for (id, state) in devices {
            self.upsert(id, state);
        }
        let gone: Vec<DeviceId> = self
            .by_id
            .iter()
            .map(|r| *r.key())
            .filter(|id| !incoming.contains(id))
            .collect();
        for id in gone {
            debug!(device = %id, "device no longer discovered — removing");
            self.remove(id);
        }
    }

    /// Rebuild and broadcast the full snapshot.
    fn rebuild_snapshot(&self) {
        let values = self.all();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn state(temp: f64) -> ThermostatState {
        ThermostatState {
            indoor_temperature: Some(temp),
            ..ThermostatState::default()
        }
    }

    #[test]
    fn upsert_resets_freshness_metadata() {
        let store = SnapshotStore::new();
        store.upsert(DeviceId(1), state(70.0));
        store.mark_stale(DeviceId(1));
        store.mark_stale(DeviceId(1));

        let snap = store.get(DeviceId(1)).unwrap();
        assert_eq!(snap.consecutive_failures, 2);
        assert!(snap.stale);

        store.upsert(DeviceId(1), state(71.0));
        let snap = store.get(DeviceId(1)).unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert!(!snap.stale);
        assert_eq!(snap.state.indoor_temperature, Some(71.0));
    }

    #[test]
    fn mark_stale_preserves_state() {
        let store = SnapshotStore::new();
        store.upsert(DeviceId(1), state(70.0));
        let before = store.get(DeviceId(1)).unwrap();

        assert!(store.mark_stale(DeviceId(1)));
        let after = store.get(DeviceId(1)).unwrap();
        assert_eq!(after.state, before.state);
        assert_eq!(after.last_success_at, before.last_success_at);
        assert_eq!(after.consecutive_failures, 1);
        assert!(after.stale);
    }

    #[test]
    fn mark_stale_unknown_device_is_noop() {
        let store = SnapshotStore::new();
        assert!(!store.mark_stale(DeviceId(42)));
    }

    #[test]
    fn readers_observe_whole_snapshots() {
        // A reader holding a snapshot taken before a cycle keeps the
        // pre-cycle value; re-reading sees the fully updated one.
        let store = SnapshotStore::new();
        store.upsert(DeviceId(1), state(70.0));
        let held = store.get(DeviceId(1)).unwrap();

        store.upsert(DeviceId(1), state(75.0));
        assert_eq!(held.state.indoor_temperature, Some(70.0));
        assert_eq!(
            store.get(DeviceId(1)).unwrap().state.indoor_temperature,
            Some(75.0)
        );
    }

    #[test]
    fn apply_discovery_prunes_missing_devices() {
        let store = SnapshotStore::new();
        store.upsert(DeviceId(1), state(70.0));
        store.upsert(DeviceId(2), state(71.0));

        store.apply_discovery(vec![(DeviceId(2), state(72.0)), (DeviceId(3), state(73.0))]);

        assert!(store.get(DeviceId(1)).is_none());
        assert_eq!(
            store.get(DeviceId(2)).unwrap().state.indoor_temperature,
            Some(72.0)
        );
        assert!(store.get(DeviceId(3)).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn all_is_ordered_by_device_id() {
        let store = SnapshotStore::new();
        store.upsert(DeviceId(30), state(1.0));
        store.upsert(DeviceId(10), state(2.0));
        store.upsert(DeviceId(20), state(3.0));

        let ids: Vec<DeviceId> = store.all().iter().map(|s| s.device_id).collect();
        assert_eq!(ids, vec![DeviceId(10), DeviceId(20), DeviceId(30)]);
    }

    #[tokio::test]
    async fn snapshot_channel_tracks_mutations() {
        let store = SnapshotStore::new();
        let mut rx = store.subscribe();
        assert!(rx.borrow().is_empty());

        store.upsert(DeviceId(1), state(70.0));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().len(), 1);
    }
}
