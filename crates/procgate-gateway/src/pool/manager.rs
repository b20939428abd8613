//! Connection Pool Manager
//!
//! Hands out and recycles backend sessions for one location.
//!
//! - A `parking_lot::Mutex` guards the slot array; it is only held for state
//!   transitions, never across backend I/O or an `.await`
//! - A semaphore sized to the pool capacity bounds concurrent leases
//! - Counts are published to the shared registry after the slot mutex is
//!   released, so the two locks never nest
//!
//! Sessions are moved out of their slot while leased. Callers connect,
//! reconnect and disconnect sessions themselves; the pool only returns the
//! sessions that need closing.

use super::registry::{initial_counts, RecordIndex, SharedPoolRegistry};
use super::slot::{count_states, PoolSlot, SlotCounts, SlotIndex, SlotState};
use crate::metrics;
use parking_lot::Mutex;
use procgate_common::config::PoolSettings;
use procgate_common::{GatewayError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

struct PoolShared<S> {
    location: String,
    settings: PoolSettings,
    slots: Mutex<Vec<PoolSlot<S>>>,
    permits: Arc<Semaphore>,
    registry: Option<Arc<SharedPoolRegistry>>,
    record: Option<RecordIndex>,
    /// Sessions of leases dropped without release, awaiting disconnect
    orphans: Mutex<Vec<S>>,
}

impl<S> PoolShared<S> {
    /// Push counts to metrics and the registry; call without the slot mutex held
    fn publish(&self, counts: SlotCounts) {
        metrics::record_pool_counts(&self.location, &counts);
        if let (Some(registry), Some(record)) = (&self.registry, self.record) {
            if let Err(e) = registry.publish(record, counts) {
                warn!(location = %self.location, "Failed to publish pool counts: {}", e);
            }
        }
    }

    fn counts(&self) -> SlotCounts {
        count_states(&self.slots.lock())
    }
}

/// Session pool of one location
pub struct ConnectionPool<S> {
    inner: Arc<PoolShared<S>>,
}

impl<S> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Pool state summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub counts: SlotCounts,
    pub available_permits: usize,
}

impl<S: Send + 'static> ConnectionPool<S> {
    /// Create the slot array for `location` and register it in `registry`
    pub fn new(
        location: impl Into<String>,
        settings: PoolSettings,
        registry: Option<Arc<SharedPoolRegistry>>,
    ) -> Result<Self> {
        let location = location.into();
        let capacity = settings.capacity.max(1);
        let slots = (0..capacity).map(|_| PoolSlot::new()).collect();

        let record = match &registry {
            Some(registry) => Some(registry.register(&location, initial_counts(capacity))?),
            None => None,
        };

        info!(
            location = %location,
            capacity,
            affinity = settings.session_affinity,
            "Connection pool initialized"
        );
        metrics::record_pool_counts(&location, &initial_counts(capacity));

        Ok(Self {
            inner: Arc::new(PoolShared {
                location,
                settings,
                slots: Mutex::new(slots),
                permits: Arc::new(Semaphore::new(capacity)),
                registry,
                record,
                orphans: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn capacity(&self) -> usize {
        self.inner.settings.capacity.max(1)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Lease a slot, waiting up to the configured timeout for one to free up
    ///
    /// With a non-empty `session_key` the scan prefers a slot already
    /// affiliated with that key, then an unaffiliated slot, then any reusable
    /// slot. Without a key the first reusable slot wins.
    pub async fn acquire(&self, session_key: Option<&str>) -> Result<SlotLease<S>> {
        let settings = &self.inner.settings;
        let wait = Duration::from_millis(settings.acquire_timeout_ms);
        let started = Instant::now();

        let permit = match tokio::time::timeout(wait, Arc::clone(&self.inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => {
                return Err(GatewayError::Internal(format!(
                    "connection pool for '{}' is shut down",
                    self.inner.location
                )))
            }
            Err(_) => None,
        };

        let Some(permit) = permit else {
            return self.exhausted(started);
        };

        let key = session_key.filter(|k| !k.is_empty());
        let (lease, counts) = {
            let mut slots = self.inner.slots.lock();
            let picked = pick_slot(&slots, key);
            let lease = picked.map(|i| {
                let slot = &mut slots[i];
                let session = slot.session.take();
                slot.state = if session.is_some() {
                    SlotState::InUse
                } else {
                    SlotState::New
                };
                slot.last_active = Instant::now();

                let mut affinity_replaced = false;
                if let Some(key) = key {
                    if slot.affinity.as_deref() != Some(key) {
                        affinity_replaced = slot.affinity.is_some() && session.is_some();
                        slot.affinity = Some(key.to_string());
                    }
                }

                SlotLease {
                    pool: Arc::clone(&self.inner),
                    index: Some(SlotIndex(i)),
                    reused: session.is_some(),
                    session,
                    affinity_replaced,
                    affinity: slot.affinity.clone(),
                    permit: None,
                    released: false,
                }
            });
            (lease, count_states(&slots))
        };

        match lease {
            Some(mut lease) => {
                lease.permit = Some(permit);
                self.inner.publish(counts);
                debug!(
                    location = %self.inner.location,
                    slot = %lease.index.map(|i| i.to_string()).unwrap_or_default(),
                    reused = lease.reused,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired pool slot"
                );
                Ok(lease)
            }
            // Every slot is offline
            None => {
                drop(permit);
                self.exhausted(started)
            }
        }
    }

    fn exhausted(&self, started: Instant) -> Result<SlotLease<S>> {
        let waited_ms = started.elapsed().as_millis() as u64;
        metrics::record_pool_exhausted(&self.inner.location);
        if self.inner.settings.abort_on_exhaustion {
            warn!(location = %self.inner.location, waited_ms, "Connection pool exhausted");
            return Err(GatewayError::PoolExhausted {
                location: self.inner.location.clone(),
                waited_ms,
            });
        }
        warn!(
            location = %self.inner.location,
            waited_ms,
            "Connection pool exhausted, falling back to an unpooled session"
        );
        Ok(SlotLease {
            pool: Arc::clone(&self.inner),
            index: None,
            session: None,
            reused: false,
            affinity_replaced: false,
            affinity: None,
            permit: None,
            released: false,
        })
    }

    /// Return a lease to the pool
    ///
    /// On success the session goes back to its slot as `Available`. On
    /// failure the slot becomes `Unused` and forgets its affinity key. Any session the caller must
    /// disconnect (failed, offline slot, or unpooled) is handed back.
    pub fn release(&self, mut lease: SlotLease<S>, succeeded: bool) -> Option<S> {
        lease.released = true;
        let session = lease.session.take();
        let Some(index) = lease.index else {
            return session;
        };

        let (leftover, counts) = {
            let mut slots = self.inner.slots.lock();
            let slot = &mut slots[index.0];
            let leftover = if slot.state == SlotState::Offline {
                session
            } else if succeeded && session.is_some() {
                slot.session = session;
                slot.state = SlotState::Available;
                slot.affinity = lease.affinity.take();
                slot.last_active = Instant::now();
                None
            } else {
                slot.state = SlotState::Unused;
                slot.affinity = None;
                slot.last_active = Instant::now();
                session
            };
            (leftover, count_states(&slots))
        };
        drop(lease.permit.take());
        self.inner.publish(counts);

        debug!(
            location = %self.inner.location,
            slot = %index,
            succeeded,
            "Released pool slot"
        );
        leftover
    }

    /// Close sessions idle longer than `max_idle`
    ///
    /// Scans from the tail so the most recently used slots at the head stay
    /// warm. Without session affinity the scan stops at the first available
    /// slot still within the threshold; with affinity idle slots are not
    /// contiguous and the whole array is scanned.
    pub fn purge(&self, max_idle: Duration) -> Vec<S> {
        let now = Instant::now();
        let full_scan = self.inner.settings.session_affinity;

        let (evicted, counts) = {
            let mut slots = self.inner.slots.lock();
            let mut evicted = Vec::new();
            for slot in slots.iter_mut().rev() {
                if slot.state != SlotState::Available {
                    continue;
                }
                if slot.idle_beyond(now, max_idle) {
                    if let Some(session) = slot.session.take() {
                        evicted.push(session);
                    }
                    slot.state = SlotState::Unused;
                    slot.affinity = None;
                } else if !full_scan {
                    break;
                }
            }
            (evicted, count_states(&slots))
        };

        if !evicted.is_empty() {
            info!(
                location = %self.inner.location,
                evicted = evicted.len(),
                "Purged idle sessions"
            );
            metrics::record_sessions_purged(&self.inner.location, evicted.len());
            self.inner.publish(counts);
        }
        evicted
    }

    /// Take a slot out of service; returns its idle session for disconnect
    pub fn set_offline(&self, index: SlotIndex) -> Result<Option<S>> {
        let (session, counts) = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.get_mut(index.0).ok_or_else(|| {
                GatewayError::NotFound(format!("slot {} in location '{}'", index, self.inner.location))
            })?;
            // A held slot keeps its session until release sees the Offline state
            let session = if slot.state.is_held() { None } else { slot.session.take() };
            slot.state = SlotState::Offline;
            slot.affinity = None;
            (session, count_states(&slots))
        };
        self.inner.publish(counts);
        info!(location = %self.inner.location, slot = %index, "Slot taken offline");
        Ok(session)
    }

    /// Return an offline slot to service
    pub fn set_online(&self, index: SlotIndex) -> Result<()> {
        let counts = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.get_mut(index.0).ok_or_else(|| {
                GatewayError::NotFound(format!("slot {} in location '{}'", index, self.inner.location))
            })?;
            if slot.state == SlotState::Offline {
                slot.state = SlotState::Unused;
                slot.last_active = Instant::now();
            }
            count_states(&slots)
        };
        self.inner.publish(counts);
        Ok(())
    }

    /// Stop leasing and drain every idle session for disconnect
    pub fn shutdown(&self) -> Vec<S> {
        self.inner.permits.close();
        let sessions: Vec<S> = {
            let mut slots = self.inner.slots.lock();
            slots
                .iter_mut()
                .filter(|slot| !slot.state.is_held())
                .filter_map(|slot| {
                    slot.state = SlotState::Unused;
                    slot.affinity = None;
                    slot.session.take()
                })
                .collect()
        };
        if let (Some(registry), Some(record)) = (&self.inner.registry, self.inner.record) {
            if let Err(e) = registry.clear(record) {
                warn!(location = %self.inner.location, "Failed to clear registry record: {}", e);
            }
        }
        info!(
            location = %self.inner.location,
            sessions = sessions.len(),
            "Connection pool shut down"
        );
        sessions
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            counts: self.inner.counts(),
            available_permits: self.inner.permits.available_permits(),
        }
    }

    /// Sessions left behind by leases dropped without release
    pub fn take_orphans(&self) -> Vec<S> {
        std::mem::take(&mut *self.inner.orphans.lock())
    }

    /// State of one slot
    pub fn slot_state(&self, index: SlotIndex) -> Option<SlotState> {
        self.inner.slots.lock().get(index.0).map(|s| s.state)
    }
}

/// Choose the slot to lease; first match in array order wins
fn pick_slot<S>(slots: &[PoolSlot<S>], key: Option<&str>) -> Option<usize> {
    if let Some(key) = key {
        if let Some(i) = slots
            .iter()
            .position(|s| s.state.is_reusable() && s.affinity.as_deref() == Some(key))
        {
            return Some(i);
        }
        if let Some(i) = slots
            .iter()
            .position(|s| s.state.is_reusable() && s.affinity.is_none())
        {
            return Some(i);
        }
    }
    slots.iter().position(|s| s.state.is_reusable())
}

/// Exclusive use of a pool slot (or an unpooled session) for one request
///
/// Dropping a lease without [`ConnectionPool::release`] marks its slot
/// `Unused` and queues its session for [`ConnectionPool::take_orphans`], so
/// cancelled requests leak neither a slot nor a backend session.
pub struct SlotLease<S> {
    pool: Arc<PoolShared<S>>,
    index: Option<SlotIndex>,
    session: Option<S>,
    reused: bool,
    affinity_replaced: bool,
    affinity: Option<String>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl<S> std::fmt::Debug for SlotLease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("index", &self.index)
            .field("reused", &self.reused)
            .field("affinity_replaced", &self.affinity_replaced)
            .field("affinity", &self.affinity)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<S> SlotLease<S> {
    /// Slot index, `None` for an unpooled session
    pub fn index(&self) -> Option<SlotIndex> {
        self.index
    }

    pub fn is_pooled(&self) -> bool {
        self.index.is_some()
    }

    /// Session was taken from the pool rather than freshly connected
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// The slot's session belonged to a different affinity key
    pub fn affinity_replaced(&self) -> bool {
        self.affinity_replaced
    }

    pub fn affinity(&self) -> Option<&str> {
        self.affinity.as_deref()
    }

    /// Record a new affinity key, applied when the lease is released
    pub fn set_affinity(&mut self, key: Option<String>) {
        self.affinity = key;
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_mut(&mut self) -> Option<&mut S> {
        self.session.as_mut()
    }

    /// Remove the session, e.g. to disconnect it before reconnecting
    pub fn take_session(&mut self) -> Option<S> {
        self.reused = false;
        self.affinity_replaced = false;
        self.session.take()
    }

    /// Install a freshly connected session
    pub fn set_session(&mut self, session: S) {
        self.session = Some(session);
        self.reused = false;
        self.affinity_replaced = false;
        if let Some(index) = self.index {
            let counts = {
                let mut slots = self.pool.slots.lock();
                let slot = &mut slots[index.0];
                if slot.state == SlotState::New {
                    slot.state = SlotState::InUse;
                }
                count_states(&slots)
            };
            self.pool.publish(counts);
        }
    }
}

impl<S> Drop for SlotLease<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(session) = self.session.take() {
            self.pool.orphans.lock().push(session);
            warn!(location = %self.pool.location, "Session of dropped lease queued for disconnect");
        }
        let Some(index) = self.index else {
            return;
        };
        let counts = {
            let mut slots = self.pool.slots.lock();
            let slot = &mut slots[index.0];
            if slot.state != SlotState::Offline {
                slot.state = SlotState::Unused;
            }
            slot.session = None;
            count_states(&slots)
        };
        warn!(
            location = %self.pool.location,
            slot = %index,
            "Pool slot dropped without release, marked unused"
        );
        self.pool.publish(counts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(capacity: usize) -> PoolSettings {
        PoolSettings {
            capacity,
            acquire_timeout_ms: 20,
            ..PoolSettings::default()
        }
    }

    fn pool(capacity: usize) -> ConnectionPool<u32> {
        ConnectionPool::new("test", settings(capacity), None).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = pool(2);
        let mut lease = pool.acquire(None).await.unwrap();
        assert_eq!(lease.index(), Some(SlotIndex(0)));
        assert!(!lease.is_reused());
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::New));

        lease.set_session(7);
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::InUse));
        assert!(pool.release(lease, true).is_none());
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::Available));

        let mut again = pool.acquire(None).await.unwrap();
        assert!(again.is_reused());
        assert_eq!(again.session_mut().copied(), Some(7));
        // Failure hands the session back for disconnect and resets the slot
        assert_eq!(pool.release(again, false), Some(7));
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::Unused));
    }

    #[tokio::test]
    async fn test_exhaustion_aborts() {
        let pool = pool(1);
        let _held = pool.acquire(None).await.unwrap();
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_exhaustion_falls_back_to_unpooled() {
        let mut s = settings(1);
        s.abort_on_exhaustion = false;
        let pool: ConnectionPool<u32> = ConnectionPool::new("test", s, None).unwrap();
        let _held = pool.acquire(None).await.unwrap();
        let mut lease = pool.acquire(None).await.unwrap();
        assert!(!lease.is_pooled());
        lease.set_session(9);
        assert_eq!(pool.release(lease, true), Some(9));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let mut s = settings(1);
        s.acquire_timeout_ms = 2_000;
        let pool: ConnectionPool<u32> = ConnectionPool::new("test", s, None).unwrap();
        let mut first = pool.acquire(None).await.unwrap();
        first.set_session(1);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(None).await.map(|l| l.is_reused()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(first, true);
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let mut s = settings(3);
        s.acquire_timeout_ms = 5_000;
        let pool: ConnectionPool<u32> = ConnectionPool::new("test", s, None).unwrap();
        let peak = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut tasks = Vec::new();
        for n in 0..24u32 {
            let pool = pool.clone();
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let mut lease = pool.acquire(None).await.unwrap();
                if !lease.has_session() {
                    lease.set_session(n);
                }
                let held = pool.snapshot().counts.held();
                peak.fetch_max(held, std::sync::atomic::Ordering::SeqCst);
                tokio::task::yield_now().await;
                let index = lease.index();
                assert!(pool.release(lease, true).is_none());
                index
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
        assert_eq!(pool.snapshot().counts.held(), 0);
        assert_eq!(pool.snapshot().available_permits, 3);
    }

    #[tokio::test]
    async fn test_affinity_preference() {
        let mut s = settings(3);
        s.session_affinity = true;
        let pool: ConnectionPool<u32> = ConnectionPool::new("test", s, None).unwrap();

        let mut a = pool.acquire(Some("alice")).await.unwrap();
        a.set_session(1);
        let mut b = pool.acquire(Some("bob")).await.unwrap();
        b.set_session(2);
        pool.release(a, true);
        pool.release(b, true);

        // Same key returns the affiliated slot even though slot 0 comes first
        let bob = pool.acquire(Some("bob")).await.unwrap();
        assert_eq!(bob.index(), Some(SlotIndex(1)));
        assert!(!bob.affinity_replaced());
        pool.release(bob, true);

        // A new key prefers the unaffiliated slot
        let carol = pool.acquire(Some("carol")).await.unwrap();
        assert_eq!(carol.index(), Some(SlotIndex(2)));
        assert!(!carol.affinity_replaced());

        // With the unaffiliated slot busy, a new key takes over an affiliated one
        let dave = pool.acquire(Some("dave")).await.unwrap();
        assert_eq!(dave.index(), Some(SlotIndex(0)));
        assert!(dave.affinity_replaced());
        assert_eq!(dave.affinity(), Some("dave"));
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let pool = pool(3);
        let mut leases = Vec::new();
        for n in 0..3 {
            let mut lease = pool.acquire(None).await.unwrap();
            lease.set_session(n);
            leases.push(lease);
        }
        for lease in leases {
            pool.release(lease, true);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;

        let evicted = pool.purge(Duration::from_millis(5));
        assert_eq!(evicted.len(), 3);
        assert!(pool.purge(Duration::from_millis(5)).is_empty());
        assert_eq!(pool.snapshot().counts.get(SlotState::Unused), 3);
    }

    #[tokio::test]
    async fn test_purge_stops_at_fresh_slot_without_affinity() {
        let pool = pool(3);
        let mut leases = Vec::new();
        for n in 0..3 {
            let mut lease = pool.acquire(None).await.unwrap();
            lease.set_session(n);
            leases.push(lease);
        }
        let mut leases = leases.into_iter();
        let (first, second, third) = (leases.next().unwrap(), leases.next().unwrap(), leases.next().unwrap());
        pool.release(first, true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Tail slot is fresh, so the idle head slot survives the scan
        pool.release(second, true);
        pool.release(third, true);

        assert!(pool.purge(Duration::from_millis(20)).is_empty());
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::Available));
    }

    #[tokio::test]
    async fn test_purge_full_scan_with_affinity() {
        let mut s = settings(3);
        s.session_affinity = true;
        let pool: ConnectionPool<u32> = ConnectionPool::new("test", s, None).unwrap();
        let mut leases = Vec::new();
        for n in 0..3 {
            let mut lease = pool.acquire(None).await.unwrap();
            lease.set_session(n);
            leases.push(lease);
        }
        let mut leases = leases.into_iter();
        let (first, second, third) = (leases.next().unwrap(), leases.next().unwrap(), leases.next().unwrap());
        pool.release(first, true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.release(second, true);
        pool.release(third, true);

        assert_eq!(pool.purge(Duration::from_millis(20)), vec![0]);
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::Unused));
    }

    #[tokio::test]
    async fn test_offline_slot_never_leased() {
        let pool = pool(2);
        pool.set_offline(SlotIndex(0)).unwrap();
        let lease = pool.acquire(None).await.unwrap();
        assert_eq!(lease.index(), Some(SlotIndex(1)));
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { .. }));

        // Release leaves an offline slot untouched
        let mut lease = lease;
        lease.set_session(5);
        pool.set_offline(SlotIndex(1)).unwrap();
        assert_eq!(pool.release(lease, true), Some(5));
        assert_eq!(pool.slot_state(SlotIndex(1)), Some(SlotState::Offline));

        pool.set_online(SlotIndex(0)).unwrap();
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::Unused));
    }

    #[tokio::test]
    async fn test_dropped_lease_marks_slot_unused() {
        let pool = pool(1);
        {
            let mut lease = pool.acquire(None).await.unwrap();
            lease.set_session(3);
        }
        assert_eq!(pool.slot_state(SlotIndex(0)), Some(SlotState::Unused));
        assert_eq!(pool.snapshot().available_permits, 1);
        assert_eq!(pool.take_orphans(), vec![3]);
        assert!(pool.take_orphans().is_empty());
        assert!(pool.acquire(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_release_clears_affinity() {
        let mut s = settings(2);
        s.session_affinity = true;
        let pool: ConnectionPool<u32> = ConnectionPool::new("test", s, None).unwrap();

        let mut alice = pool.acquire(Some("alice")).await.unwrap();
        alice.set_session(1);
        assert_eq!(pool.release(alice, false), Some(1));

        // Slot 0 lost its key with its session, so a new key takes it as unaffiliated
        let bob = pool.acquire(Some("bob")).await.unwrap();
        assert_eq!(bob.index(), Some(SlotIndex(0)));
        assert!(!bob.affinity_replaced());
    }

    #[tokio::test]
    async fn test_registry_reflects_pool() {
        let registry = Arc::new(SharedPoolRegistry::in_memory(4096).unwrap());
        let pool: ConnectionPool<u32> =
            ConnectionPool::new("reg", settings(2), Some(Arc::clone(&registry))).unwrap();

        let mut lease = pool.acquire(None).await.unwrap();
        lease.set_session(1);
        let totals = registry.totals("reg").unwrap();
        assert_eq!(totals.get(SlotState::InUse), 1);
        assert_eq!(totals.get(SlotState::Unused), 1);

        pool.release(lease, true);
        assert_eq!(registry.totals("reg").unwrap().get(SlotState::Available), 1);

        let drained = pool.shutdown();
        assert_eq!(drained, vec![1]);
        assert!(registry.totals("reg").unwrap().is_zero());
        assert!(pool.acquire(None).await.is_err());
    }
}
