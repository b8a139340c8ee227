//! The rotating key ring.
//!
//! A fixed-size circular buffer of time-bounded secret keys, owned by a
//! single process. Exactly one slot is active at a time and is the only key
//! used to sign new tokens; older slots stay around so that in-flight tokens
//! signed just before a rotation keep verifying. Keys live for twice the
//! token ttl and rotation happens every ttl/2, so a key always outlives
//! every token it signed, with margin for clock skew between cluster
//! members.
//!
//! Every rotation persists the whole ring to disk and publishes the new key
//! to the shared cluster cache so that other servers can verify tokens this
//! process minted.

use crate::cache::{slot_cache_key, SharedKeyCache};
use crate::keys::ExpiringSecretKey;
use crate::snapshot::{RingSnapshot, SnapshotStore};
use crate::util::Clock;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Default number of ring slots.
pub const DEFAULT_RING_SIZE: usize = 5;

struct RingState {
    slots: Vec<Option<ExpiringSecretKey>>,
    active: usize,
    next_rotation_at: u64,
}

/// Per-process rotating buffer of signing/verification keys.
///
/// Rotation is serialized behind the write half of a lock; lookups take the
/// read half and never observe a slot mid-overwrite.
pub struct KeyRing {
    server_id: String,
    ttl_ms: u64,
    snapshot: SnapshotStore,
    cache: Arc<dyn SharedKeyCache>,
    clock: Arc<dyn Clock>,
    state: RwLock<RingState>,
}

impl KeyRing {
    /// Open the ring, restoring any snapshot found at `snapshot_path`.
    ///
    /// Keys recovered from the snapshot are re-published to the shared cache
    /// so cluster members can verify pre-restart tokens. A missing or
    /// unreadable snapshot degrades to an empty ring.
    pub fn open<P: AsRef<Path>>(
        server_id: &str,
        ttl_ms: u64,
        ring_size: usize,
        snapshot_path: P,
        cache: Arc<dyn SharedKeyCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let snapshot = SnapshotStore::new(snapshot_path);
        let now = clock.now_millis();

        let state = match snapshot.load_or_empty(ring_size) {
            Some(loaded) => {
                let mut published = 0usize;
                for (slot, key) in loaded.slots.iter().enumerate() {
                    let Some(key) = key else { continue };
                    let remaining = key.expires_at().saturating_sub(now);
                    if remaining == 0 {
                        continue;
                    }
                    let cache_key = slot_cache_key(key.server_id(), slot);
                    if let Err(e) = cache.put(&cache_key, &key.to_data(), remaining) {
                        warn!("failed to publish restored key {cache_key}: {e}");
                    } else {
                        published += 1;
                    }
                }
                info!(
                    "restored key ring from {} ({} keys published to the cluster cache)",
                    snapshot.path().display(),
                    published
                );
                RingState {
                    slots: loaded.slots,
                    active: loaded.active,
                    next_rotation_at: loaded.next_rotation_at,
                }
            }
            None => RingState {
                slots: vec![None; ring_size],
                active: 0,
                next_rotation_at: now,
            },
        };

        Self {
            server_id: server_id.to_string(),
            ttl_ms,
            snapshot,
            cache,
            clock,
            state: RwLock::new(state),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn ring_size(&self) -> usize {
        match self.state.read() {
            Ok(state) => state.slots.len(),
            Err(_) => 0,
        }
    }

    /// The key to sign new tokens with, rotating first if due.
    ///
    /// Rotation is due when the rotation deadline has passed or when the
    /// active slot holds no usable key: absent, expired, or owned by a
    /// different server id (a restart that reused ring storage, or an id
    /// reassignment). The rotation itself performs synchronous disk I/O and
    /// a best-effort cache publish; callers absorb that latency on the rare
    /// tick where it triggers.
    pub fn active_key(&self) -> (usize, ExpiringSecretKey) {
        let now = self.clock.now_millis();
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if now > state.next_rotation_at || self.active_slot_unusable(&state, now) {
            self.rotate(&mut state, now);
        }

        let key = state.slots[state.active]
            .clone()
            .unwrap_or_else(|| self.fresh_key(now));
        (state.active, key)
    }

    fn active_slot_unusable(&self, state: &RingState, now: u64) -> bool {
        match &state.slots[state.active] {
            None => true,
            Some(key) => key.is_expired(now) || key.server_id() != self.server_id,
        }
    }

    fn fresh_key(&self, now: u64) -> ExpiringSecretKey {
        // Keys outlive every token they sign, even refreshed ones.
        ExpiringSecretKey::generate(now + 2 * self.ttl_ms, &self.server_id)
    }

    fn rotate(&self, state: &mut RingState, now: u64) {
        let key = self.fresh_key(now);
        let next = (state.active + 1) % state.slots.len();
        state.slots[next] = Some(key.clone());
        state.active = next;
        state.next_rotation_at = now + self.ttl_ms / 2;
        debug!(slot = next, "rotated signing key");

        if let Err(e) = self.snapshot.save(&RingSnapshot {
            active: state.active,
            next_rotation_at: state.next_rotation_at,
            slots: state.slots.clone(),
        }) {
            error!(
                "failed to save key ring snapshot to {}: {e}; tokens will not survive a restart",
                self.snapshot.path().display()
            );
        }

        // Best-effort: a failed publish only delays foreign verification of
        // our tokens until the next rotation converges the cache.
        let cache_key = slot_cache_key(&self.server_id, next);
        if let Err(e) = self.cache.put(&cache_key, &key.to_data(), 2 * self.ttl_ms) {
            warn!("failed to publish key {cache_key} to the cluster cache: {e}");
        }
    }

    /// Find the verification key for `(server_id, slot)`.
    ///
    /// Local slots answer for this process's own server id; anything else
    /// goes to the shared cache. `None` is an ordinary outcome — the key may
    /// simply have been recycled already.
    pub fn lookup(&self, server_id: &str, slot: usize) -> Option<ExpiringSecretKey> {
        if server_id == self.server_id {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            return state
                .slots
                .get(slot)
                .and_then(|s| s.as_ref())
                .filter(|key| key.server_id() == server_id)
                .cloned();
        }

        let cache_key = slot_cache_key(server_id, slot);
        let data = match self.cache.get(&cache_key) {
            Ok(found) => found?,
            Err(e) => {
                warn!("cluster cache lookup for {cache_key} failed: {e}");
                return None;
            }
        };
        match data.to_key() {
            Ok(key) if !key.is_expired(self.clock.now_millis()) => Some(key),
            Ok(_) => {
                debug!("cached key {cache_key} has expired");
                None
            }
            Err(e) => {
                warn!("cached key {cache_key} is unusable: {e}");
                None
            }
        }
    }
}
