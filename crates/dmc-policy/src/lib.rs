#![forbid(unsafe_code)]
//! FIFO cache-block mapping policy with persistent hints.
//!
//! [`HintsPolicy`] decides which cache block holds which origin block for a
//! dm-cache style target. It composes:
//!
//! 1. **BlockAllocator** (`dmc-alloc`): which cache blocks are in use.
//! 2. **EntryPool**: pre-allocated mapping entries split into a free stack
//!    and a used list that doubles as the FIFO eviction queue.
//! 3. **HashIndex**: origin block → entry, over used entries only.
//! 4. **HintCodec** (`dmc-hint`): fixed-width hint blobs for walk/load.
//!
//! All state sits behind one `parking_lot::Mutex`. `map` with
//! `allow_block = true` is the only call that waits for it; every other
//! entry point uses `try_lock` and returns [`PolicyError::WouldBlock`] when
//! the lock is held, so I/O paths never stall behind a metadata commit.
//!
//! ## Invariants (checked under the lock)
//!
//! - `used list len == allocated bits == hashed entries == residency()`
//! - no two used entries share an origin block or a cache block
//! - a bit is set iff a used entry holds that cache block
//!
//! Breaking a caller contract (removing or remapping an unmapped origin
//! block) panics instead of returning an error.

mod config;
mod index;
mod pool;

pub use config::{
    ConfigValue, HINT_SIZE_KEY, POLICY_NAME, POLICY_VERSION, PolicyConfig, PolicyDescriptor,
};
pub use dmc_error::{PolicyError, Result};
pub use dmc_types::{CacheBlock, MapOutcome, OriginBlock, PolicyGeometry};

use dmc_alloc::BlockAllocator;
use dmc_hint::{HintCodec, HintLayout};
use index::HashIndex;
use parking_lot::{Mutex, MutexGuard};
use pool::{EntryId, EntryPool};
use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, trace, warn};

/// Operation counters, read with [`HintsPolicy::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PolicyStats {
    pub hits: u64,
    pub misses: u64,
    pub new_mappings: u64,
    pub replacements: u64,
    pub removals: u64,
    pub remaps: u64,
    pub loads: u64,
    pub hint_mismatches: u64,
    /// Calls turned away with `WouldBlock`, for either reason.
    pub would_block: u64,
}

#[derive(Debug)]
struct PolicyState {
    alloc: BlockAllocator,
    pool: EntryPool,
    index: HashIndex,
    codec: Option<HintCodec>,
    stats: PolicyStats,
}

impl PolicyState {
    fn new(cache_size: u32) -> Self {
        Self {
            alloc: BlockAllocator::new(cache_size),
            pool: EntryPool::new(cache_size),
            index: HashIndex::new(cache_size),
            codec: None,
            stats: PolicyStats::default(),
        }
    }

    fn lookup(&self, oblock: OriginBlock) -> Option<CacheBlock> {
        self.index
            .lookup(&self.pool, oblock)
            .and_then(|id| self.pool.get(id).cblock)
    }

    /// Attach a detached entry to `oblock`/`cblock` and make it newest.
    fn install(&mut self, id: EntryId, oblock: OriginBlock, cblock: CacheBlock) {
        let entry = self.pool.get_mut(id);
        entry.oblock = oblock;
        entry.cblock = Some(cblock);
        self.index.insert(&mut self.pool, id);
        self.pool.push_used(id);
    }

    fn map(&mut self, oblock: OriginBlock, allow_migrate: bool) -> Result<MapOutcome> {
        if let Some(cblock) = self.lookup(oblock) {
            self.stats.hits += 1;
            trace!(target: "dmc::policy", event = "hit", oblock = oblock.0, cblock = cblock.0);
            return Ok(MapOutcome::Hit(cblock));
        }

        self.stats.misses += 1;
        if !allow_migrate {
            self.stats.would_block += 1;
            trace!(target: "dmc::policy", event = "miss_no_migrate", oblock = oblock.0);
            return Err(PolicyError::WouldBlock);
        }

        if let Some(cblock) = self.alloc.find_free() {
            let Some(id) = self.pool.take_free() else {
                panic!(
                    "entry pool empty with {cblock} free (used={})",
                    self.pool.used_len()
                );
            };
            self.alloc.allocate(cblock);
            self.install(id, oblock, cblock);
            self.stats.new_mappings += 1;
            debug!(
                target: "dmc::policy",
                event = "new",
                oblock = oblock.0,
                cblock = cblock.0,
                free = self.alloc.free_count()
            );
            return Ok(MapOutcome::New(cblock));
        }

        // Full: hand the oldest entry's cache block straight to `oblock`.
        // Its bit stays set throughout.
        let Some(id) = self.pool.pop_oldest_used() else {
            panic!("allocator full but used list empty");
        };
        let old_oblock = self.pool.get(id).oblock;
        let Some(cblock) = self.pool.get(id).cblock else {
            panic!("used entry for {old_oblock} has no cache block");
        };
        let removed = self.index.remove(&mut self.pool, old_oblock);
        debug_assert_eq!(removed, id);
        self.install(id, oblock, cblock);
        self.stats.replacements += 1;
        debug!(
            target: "dmc::policy",
            event = "replace",
            old_oblock = old_oblock.0,
            oblock = oblock.0,
            cblock = cblock.0
        );
        Ok(MapOutcome::Replace { old_oblock, cblock })
    }

    fn remove_mapping(&mut self, oblock: OriginBlock) -> CacheBlock {
        let Some(id) = self.index.lookup(&self.pool, oblock) else {
            panic!("remove_mapping: {oblock} is not mapped");
        };
        let Some(cblock) = self.pool.get(id).cblock else {
            panic!("used entry for {oblock} has no cache block");
        };
        let removed = self.index.remove(&mut self.pool, oblock);
        debug_assert_eq!(removed, id);
        self.pool.remove_used(id);
        self.alloc.free(cblock);
        self.pool.return_free(id);
        self.stats.removals += 1;
        debug!(target: "dmc::policy", event = "remove", oblock = oblock.0, cblock = cblock.0);
        cblock
    }

    fn force_mapping(&mut self, current: OriginBlock, new: OriginBlock) -> CacheBlock {
        let Some(id) = self.index.lookup(&self.pool, current) else {
            panic!("force_mapping: {current} is not mapped");
        };
        if current != new {
            assert!(
                self.index.lookup(&self.pool, new).is_none(),
                "force_mapping: {new} is already mapped"
            );
        }
        let Some(cblock) = self.pool.get(id).cblock else {
            panic!("used entry for {current} has no cache block");
        };
        let removed = self.index.remove(&mut self.pool, current);
        debug_assert_eq!(removed, id);
        self.pool.remove_used(id);
        self.install(id, new, cblock);
        self.stats.remaps += 1;
        debug!(
            target: "dmc::policy",
            event = "force",
            old_oblock = current.0,
            oblock = new.0,
            cblock = cblock.0
        );
        cblock
    }

    fn load_mapping(
        &mut self,
        oblock: OriginBlock,
        cblock: CacheBlock,
        hint: &[u8],
        hint_valid: bool,
    ) -> Result<()> {
        if cblock.0 >= self.alloc.nr_blocks() {
            return Err(PolicyError::InvalidArgument(format!(
                "{cblock} beyond cache size {}",
                self.alloc.nr_blocks()
            )));
        }
        if self.lookup(oblock).is_some() {
            return Err(PolicyError::InvalidArgument(format!(
                "{oblock} loaded twice"
            )));
        }
        let verify_layout = match (&self.codec, hint_valid) {
            (Some(codec), true) => {
                if hint.len() != codec.width() {
                    return Err(PolicyError::InvalidArgument(format!(
                        "hint for {oblock} is {} bytes, configured width is {}",
                        hint.len(),
                        codec.width()
                    )));
                }
                Some(*codec.layout())
            }
            _ => None,
        };
        if self.alloc.is_allocated(cblock) {
            return Err(PolicyError::OutOfMemory(format!("{cblock} already allocated")));
        }
        let Some(id) = self.pool.take_free() else {
            return Err(PolicyError::OutOfMemory("entry pool exhausted".to_owned()));
        };

        self.alloc.allocate(cblock);
        self.install(id, oblock, cblock);
        self.stats.loads += 1;
        debug!(target: "dmc::policy", event = "load", oblock = oblock.0, cblock = cblock.0);

        if let Some(layout) = verify_layout {
            let mismatches = layout.mismatches(hint)?;
            if let Some(first) = mismatches.first() {
                self.stats.hint_mismatches += 1;
                warn!(
                    target: "dmc::policy",
                    event = "hint_mismatch",
                    oblock = oblock.0,
                    cblock = cblock.0,
                    fields = mismatches.len(),
                    detail = %first
                );
                return Err((*first).into());
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        use std::collections::HashSet;

        let used = self.pool.used_len();
        assert_eq!(used, self.alloc.allocated() as usize);
        assert_eq!(used, self.index.len());
        assert_eq!(used + self.pool.free_len(), self.alloc.nr_blocks() as usize);

        let mut oblocks = HashSet::new();
        let mut cblocks = HashSet::new();
        let bits: HashSet<CacheBlock> = self.alloc.iter_allocated().collect();
        for (id, entry) in self.pool.iter_used() {
            let cblock = entry.cblock.expect("used entry without cache block");
            assert!(bits.contains(&cblock), "{cblock} mapped but not allocated");
            assert!(oblocks.insert(entry.oblock), "duplicate {}", entry.oblock);
            assert!(cblocks.insert(cblock), "duplicate {cblock}");
            assert!(self.alloc.is_allocated(cblock));
            assert_eq!(self.index.lookup(&self.pool, entry.oblock), Some(id));
        }
        assert_eq!(cblocks.len(), used);
    }
}

/// The "hints" cache policy: FIFO replacement, one lock, persistent hints.
#[derive(Debug)]
pub struct HintsPolicy {
    geometry: PolicyGeometry,
    state: Mutex<PolicyState>,
    /// Snapshot of the used-list length, refreshed before each unlock.
    residency: AtomicUsize,
    /// Latched once; the codec in `state` is set under the same lock.
    hint_width: OnceLock<usize>,
    /// `WouldBlock`s from failed try-locks, which cannot touch `state`.
    contended: AtomicU64,
}

impl HintsPolicy {
    #[must_use]
    pub fn new(geometry: PolicyGeometry) -> Self {
        info!(
            target: "dmc::policy",
            event = "create",
            cache_size = geometry.cache_size(),
            origin_blocks = geometry.origin_blocks(),
            block_size = geometry.block_size()
        );
        Self {
            state: Mutex::new(PolicyState::new(geometry.cache_size())),
            geometry,
            residency: AtomicUsize::new(0),
            hint_width: OnceLock::new(),
            contended: AtomicU64::new(0),
        }
    }

    /// Validate the geometry and build a policy. Sizes are in sectors.
    pub fn create(cache_size: u32, origin_size: u64, block_size: u64) -> Result<Self> {
        let geometry = PolicyGeometry::new(cache_size, origin_size, block_size)
            .map_err(|e| PolicyError::InvalidArgument(e.to_string()))?;
        Ok(Self::new(geometry))
    }

    #[must_use]
    pub fn geometry(&self) -> &PolicyGeometry {
        &self.geometry
    }

    fn try_state(&self) -> Result<MutexGuard<'_, PolicyState>> {
        self.state.try_lock().ok_or_else(|| {
            self.contended.fetch_add(1, Ordering::Relaxed);
            trace!(target: "dmc::policy", event = "contended");
            PolicyError::WouldBlock
        })
    }

    fn publish(&self, state: &PolicyState) {
        self.residency
            .store(state.pool.used_len(), Ordering::Release);
    }

    /// Translate `oblock` to a cache block, allocating or evicting on a miss.
    ///
    /// `allow_block` chooses between waiting for the lock and failing with
    /// `WouldBlock`. With `allow_migrate = false` a miss fails with
    /// `WouldBlock` instead of touching the cache.
    pub fn map(
        &self,
        oblock: OriginBlock,
        allow_block: bool,
        allow_migrate: bool,
    ) -> Result<MapOutcome> {
        let mut state = if allow_block {
            self.state.lock()
        } else {
            self.try_state()?
        };
        let outcome = state.map(oblock, allow_migrate);
        self.publish(&state);
        outcome
    }

    /// Cache block for `oblock` without changing eviction order.
    pub fn lookup(&self, oblock: OriginBlock) -> Result<CacheBlock> {
        let state = self.try_state()?;
        state
            .lookup(oblock)
            .ok_or(PolicyError::NotFound(oblock.0))
    }

    /// Drop the mapping for `oblock` and free its cache block.
    ///
    /// # Panics
    /// Panics if `oblock` is not mapped.
    pub fn remove_mapping(&self, oblock: OriginBlock) -> Result<CacheBlock> {
        let mut state = self.try_state()?;
        let cblock = state.remove_mapping(oblock);
        self.publish(&state);
        Ok(cblock)
    }

    /// Re-key the mapping of `current` to `new`, keeping its cache block and
    /// moving it to the newest end of the eviction order.
    ///
    /// # Panics
    /// Panics if `current` is not mapped or `new` already is.
    pub fn force_mapping(&self, current: OriginBlock, new: OriginBlock) -> Result<CacheBlock> {
        let mut state = self.try_state()?;
        let cblock = state.force_mapping(current, new);
        self.publish(&state);
        Ok(cblock)
    }

    /// Install a persisted mapping at a caller-chosen cache block.
    ///
    /// With `hint_valid` and a configured hint width, `hint` is verified
    /// after the mapping is installed; a corrupt hint returns
    /// [`PolicyError::Mismatch`] but the mapping stays.
    pub fn load_mapping(
        &self,
        oblock: OriginBlock,
        cblock: CacheBlock,
        hint: &[u8],
        hint_valid: bool,
    ) -> Result<()> {
        let mut state = self.try_state()?;
        let result = state.load_mapping(oblock, cblock, hint, hint_valid);
        self.publish(&state);
        result
    }

    /// Visit every mapping oldest first as `(cblock, oblock, hint)`.
    ///
    /// The lock is held for the whole walk. `hint` is empty when no hint
    /// width is configured. The first error from `visit` stops the walk.
    pub fn walk_mappings<F, E>(&self, mut visit: F) -> std::result::Result<(), E>
    where
        F: FnMut(CacheBlock, OriginBlock, &[u8]) -> std::result::Result<(), E>,
        E: From<PolicyError>,
    {
        let mut guard = self.try_state()?;
        let PolicyState { pool, codec, .. } = &mut *guard;
        let mut visited = 0_usize;
        for (_, entry) in pool.iter_used() {
            let Some(cblock) = entry.cblock else {
                panic!("used entry for {} has no cache block", entry.oblock);
            };
            let hint: &[u8] = match codec.as_mut() {
                Some(codec) => codec.encode()?,
                None => &[],
            };
            visit(cblock, entry.oblock, hint)?;
            visited += 1;
        }
        debug!(target: "dmc::policy", event = "walk", visited);
        Ok(())
    }

    /// Number of mapped origin blocks. Lock-free; may be momentarily stale.
    #[must_use]
    pub fn residency(&self) -> usize {
        self.residency.load(Ordering::Acquire)
    }

    /// Allocated cache blocks, read under the lock.
    pub fn nr_allocated(&self) -> Result<u32> {
        Ok(self.try_state()?.alloc.allocated())
    }

    /// Configure the hint width. Allowed once per policy.
    pub fn set_hint_width(&self, width: usize) -> Result<()> {
        let mut state = self.try_state()?;
        if let Some(current) = self.hint_width.get() {
            return Err(PolicyError::PermissionDenied(format!(
                "hint width already set to {current}"
            )));
        }
        let layout = HintLayout::new(width)?;
        state.codec = Some(HintCodec::new(layout));
        // Writers of the latch are serialized by the state lock.
        assert!(
            self.hint_width.set(width).is_ok(),
            "hint width latched outside the state lock"
        );
        drop(state);
        info!(target: "dmc::policy", event = "hint_width", width);
        Ok(())
    }

    #[must_use]
    pub fn hint_width(&self) -> Option<usize> {
        self.hint_width.get().copied()
    }

    /// Apply one `<key> <value>` pair from the table line.
    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        match ConfigValue::parse(key, value)? {
            ConfigValue::HintSize(width) => self.set_hint_width(width),
        }
    }

    #[must_use]
    pub fn config(&self) -> PolicyConfig {
        PolicyConfig {
            hint_size: self.hint_width(),
        }
    }

    /// Configured `(key, value)` pairs for status reporting.
    #[must_use]
    pub fn emit_config_values(&self) -> Vec<(&'static str, String)> {
        self.config().to_pairs()
    }

    #[must_use]
    pub fn descriptor(&self) -> PolicyDescriptor {
        PolicyDescriptor {
            name: POLICY_NAME,
            version: POLICY_VERSION,
            hint_size: self.hint_width(),
        }
    }

    /// Periodic clock from the cache target. FIFO keeps no time state.
    pub fn tick(&self) {
        trace!(target: "dmc::policy", event = "tick");
    }

    pub fn stats(&self) -> Result<PolicyStats> {
        let mut stats = self.try_state()?.stats;
        stats.would_block += self.contended.load(Ordering::Relaxed);
        Ok(stats)
    }

    /// Tear the policy down. Must not race with in-flight calls, which the
    /// by-value receiver enforces.
    pub fn destroy(self) {
        let state = self.state.into_inner();
        debug_assert_eq!(
            state.alloc.iter_allocated().count(),
            state.pool.used_len(),
            "allocated bits and used entries diverged"
        );
        info!(
            target: "dmc::policy",
            event = "destroy",
            resident = state.pool.used_len(),
            hits = state.stats.hits,
            misses = state.stats.misses,
            replacements = state.stats.replacements
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn policy(cache_size: u32) -> HintsPolicy {
        HintsPolicy::create(cache_size, 1 << 30, 64).expect("policy")
    }

    fn map(p: &HintsPolicy, oblock: u64) -> MapOutcome {
        p.map(OriginBlock(oblock), true, true).expect("map")
    }

    fn walk(p: &HintsPolicy) -> Vec<(u32, u64)> {
        let mut out = Vec::new();
        p.walk_mappings::<_, PolicyError>(|cblock, oblock, _| {
            out.push((cblock.0, oblock.0));
            Ok(())
        })
        .expect("walk");
        out
    }

    #[test]
    fn create_rejects_bad_geometry() {
        assert!(matches!(
            HintsPolicy::create(0, 1024, 64),
            Err(PolicyError::InvalidArgument(_))
        ));
        assert!(matches!(
            HintsPolicy::create(16, 1 << 20, 0),
            Err(PolicyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn create_accepts_small_block_size() {
        let p = HintsPolicy::create(16, 1 << 20, 8).expect("policy");
        assert_eq!(p.geometry().block_size(), 8);
        assert_eq!(p.geometry().origin_blocks(), 1 << 17);
        assert_eq!(map(&p, 3), MapOutcome::New(CacheBlock(0)));
    }

    #[test]
    fn first_maps_are_new_then_hit() {
        let p = policy(4);
        assert_eq!(map(&p, 100), MapOutcome::New(CacheBlock(0)));
        assert_eq!(map(&p, 200), MapOutcome::New(CacheBlock(1)));
        assert_eq!(map(&p, 100), MapOutcome::Hit(CacheBlock(0)));
        assert_eq!(p.residency(), 2);
        let stats = p.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.new_mappings, 2);
    }

    #[test]
    fn miss_without_migration_would_block() {
        let p = policy(2);
        assert_eq!(
            p.map(OriginBlock(1), true, false),
            Err(PolicyError::WouldBlock)
        );
        assert_eq!(p.residency(), 0);
        map(&p, 1);
        assert_eq!(
            p.map(OriginBlock(1), false, false),
            Ok(MapOutcome::Hit(CacheBlock(0)))
        );
        assert_eq!(p.stats().unwrap().would_block, 1);
    }

    #[test]
    fn full_cache_evicts_oldest() {
        let p = policy(3);
        for o in [10, 11, 12] {
            map(&p, o);
        }
        assert_eq!(
            map(&p, 13),
            MapOutcome::Replace {
                old_oblock: OriginBlock(10),
                cblock: CacheBlock(0),
            }
        );
        // A hit does not refresh FIFO position.
        map(&p, 11);
        assert_eq!(
            map(&p, 14),
            MapOutcome::Replace {
                old_oblock: OriginBlock(11),
                cblock: CacheBlock(1),
            }
        );
        assert_eq!(p.lookup(OriginBlock(10)), Err(PolicyError::NotFound(10)));
        assert_eq!(walk(&p), vec![(2, 12), (0, 13), (1, 14)]);
        assert_eq!(p.nr_allocated().unwrap(), 3);
    }

    #[test]
    fn remove_frees_block_for_reuse() {
        let p = policy(2);
        map(&p, 1);
        map(&p, 2);
        assert_eq!(p.remove_mapping(OriginBlock(1)), Ok(CacheBlock(0)));
        assert_eq!(p.residency(), 1);
        assert_eq!(map(&p, 3), MapOutcome::New(CacheBlock(0)));
        p.state.lock().assert_consistent();
    }

    #[test]
    fn force_mapping_keeps_block_and_moves_to_tail() {
        let p = policy(3);
        map(&p, 5);
        map(&p, 6);
        map(&p, 7);
        assert_eq!(
            p.force_mapping(OriginBlock(5), OriginBlock(9)),
            Ok(CacheBlock(0))
        );
        assert_eq!(walk(&p), vec![(1, 6), (2, 7), (0, 9)]);
        assert_eq!(
            map(&p, 8),
            MapOutcome::Replace {
                old_oblock: OriginBlock(6),
                cblock: CacheBlock(1),
            }
        );
    }

    #[test]
    fn force_mapping_onto_itself_refreshes_position() {
        let p = policy(2);
        map(&p, 1);
        map(&p, 2);
        p.force_mapping(OriginBlock(1), OriginBlock(1)).unwrap();
        assert_eq!(walk(&p), vec![(1, 2), (0, 1)]);
    }

    #[test]
    #[should_panic(expected = "is already mapped")]
    fn force_mapping_onto_mapped_key_panics() {
        let p = policy(2);
        map(&p, 1);
        map(&p, 2);
        let _ = p.force_mapping(OriginBlock(1), OriginBlock(2));
    }

    #[test]
    #[should_panic(expected = "is not mapped")]
    fn force_mapping_of_unmapped_panics() {
        let p = policy(2);
        let _ = p.force_mapping(OriginBlock(1), OriginBlock(2));
    }

    #[test]
    fn hint_width_is_write_once() {
        let p = policy(2);
        assert_eq!(p.hint_width(), None);
        assert!(p.emit_config_values().is_empty());
        assert!(matches!(
            p.set_hint_width(0),
            Err(PolicyError::InvalidArgument(_))
        ));
        assert_eq!(p.hint_width(), None);
        p.set_config_value("hint_size", "40").unwrap();
        assert!(matches!(
            p.set_config_value("hint_size", "16"),
            Err(PolicyError::PermissionDenied(_))
        ));
        assert_eq!(p.hint_width(), Some(40));
        assert_eq!(p.emit_config_values(), vec![("hint_size", "40".to_owned())]);
        assert_eq!(p.descriptor().name, "hints");
        assert_eq!(p.descriptor().hint_size, Some(40));
    }

    #[test]
    fn walk_hands_out_encoded_hints() {
        let p = policy(4);
        p.set_hint_width(13).unwrap();
        map(&p, 1);
        map(&p, 2);
        let layout = HintLayout::new(13).unwrap();
        let mut seen = 0;
        p.walk_mappings::<_, PolicyError>(|_, _, hint| {
            assert_eq!(hint.len(), 13);
            layout.decode_and_verify(hint)?;
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn walk_without_hint_width_passes_empty_hint() {
        let p = policy(2);
        map(&p, 1);
        p.walk_mappings::<_, PolicyError>(|_, _, hint| {
            assert!(hint.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn walk_stops_on_visitor_error() {
        let p = policy(4);
        for o in 0..4 {
            map(&p, o);
        }
        let mut calls = 0;
        let err = p
            .walk_mappings(|_, oblock, _| {
                calls += 1;
                if oblock.0 == 1 {
                    Err(PolicyError::InvalidArgument("stop".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(calls, 2);
        assert_eq!(err, PolicyError::InvalidArgument("stop".into()));
    }

    #[test]
    fn walk_visitor_reentry_would_block() {
        let p = policy(2);
        map(&p, 1);
        p.walk_mappings::<_, PolicyError>(|_, oblock, _| {
            assert_eq!(p.lookup(oblock), Err(PolicyError::WouldBlock));
            Ok(())
        })
        .unwrap();
        assert_eq!(p.stats().unwrap().would_block, 1);
    }

    #[test]
    fn load_rejects_taken_block_and_duplicate_key() {
        let p = policy(2);
        p.load_mapping(OriginBlock(1), CacheBlock(0), &[], false)
            .unwrap();
        assert!(matches!(
            p.load_mapping(OriginBlock(2), CacheBlock(0), &[], false),
            Err(PolicyError::OutOfMemory(_))
        ));
        assert!(matches!(
            p.load_mapping(OriginBlock(1), CacheBlock(1), &[], false),
            Err(PolicyError::InvalidArgument(_))
        ));
        assert!(matches!(
            p.load_mapping(OriginBlock(3), CacheBlock(2), &[], false),
            Err(PolicyError::InvalidArgument(_))
        ));
        assert_eq!(p.residency(), 1);
        p.state.lock().assert_consistent();
    }

    #[test]
    fn load_with_wrong_hint_length_installs_nothing() {
        let p = policy(2);
        p.set_hint_width(8).unwrap();
        assert!(matches!(
            p.load_mapping(OriginBlock(1), CacheBlock(0), &[0; 4], true),
            Err(PolicyError::InvalidArgument(_))
        ));
        assert_eq!(p.residency(), 0);
    }

    #[test]
    fn load_ignores_hint_when_width_unset() {
        let p = policy(2);
        p.load_mapping(OriginBlock(1), CacheBlock(1), &[0xff; 3], true)
            .unwrap();
        assert_eq!(p.lookup(OriginBlock(1)), Ok(CacheBlock(1)));
    }

    #[test]
    fn loaded_mappings_evict_in_load_order() {
        let p = policy(2);
        p.load_mapping(OriginBlock(50), CacheBlock(1), &[], false)
            .unwrap();
        p.load_mapping(OriginBlock(60), CacheBlock(0), &[], false)
            .unwrap();
        assert_eq!(
            map(&p, 70),
            MapOutcome::Replace {
                old_oblock: OriginBlock(50),
                cblock: CacheBlock(1),
            }
        );
    }

    #[test]
    fn tick_and_destroy_are_quiet() {
        let p = policy(2);
        map(&p, 1);
        p.tick();
        p.destroy();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Map(u64),
        Remove(usize),
        Force(usize, u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => (0_u64..40).prop_map(Op::Map),
            2 => any::<usize>().prop_map(Op::Remove),
            1 => (any::<usize>(), 40_u64..80).prop_map(|(i, o)| Op::Force(i, o)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn operations_preserve_invariants_and_fifo_order(
            cache_size in 1_u32..12,
            ops in proptest::collection::vec(op_strategy(), 1..200),
        ) {
            let p = policy(cache_size);
            // Model: FIFO queue of (oblock, cblock), oldest first.
            let mut model: VecDeque<(u64, u32)> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Map(o) => {
                        let outcome = map(&p, o);
                        if let Some(&(_, c)) = model.iter().find(|(mo, _)| *mo == o) {
                            prop_assert_eq!(outcome, MapOutcome::Hit(CacheBlock(c)));
                        } else if model.len() < cache_size as usize {
                            let MapOutcome::New(c) = outcome else {
                                return Err(TestCaseError::fail(format!("expected New, got {outcome:?}")));
                            };
                            prop_assert!(model.iter().all(|(_, mc)| *mc != c.0));
                            model.push_back((o, c.0));
                        } else {
                            let (old_o, old_c) = model.pop_front().unwrap();
                            prop_assert_eq!(
                                outcome,
                                MapOutcome::Replace {
                                    old_oblock: OriginBlock(old_o),
                                    cblock: CacheBlock(old_c),
                                }
                            );
                            model.push_back((o, old_c));
                        }
                    }
                    Op::Remove(i) if !model.is_empty() => {
                        let (o, c) = model.remove(i % model.len()).unwrap();
                        prop_assert_eq!(p.remove_mapping(OriginBlock(o)), Ok(CacheBlock(c)));
                    }
                    Op::Force(i, new) if !model.is_empty() => {
                        if model.iter().any(|(mo, _)| *mo == new) {
                            continue;
                        }
                        let (o, c) = model.remove(i % model.len()).unwrap();
                        prop_assert_eq!(
                            p.force_mapping(OriginBlock(o), OriginBlock(new)),
                            Ok(CacheBlock(c))
                        );
                        model.push_back((new, c));
                    }
                    Op::Remove(_) | Op::Force(..) => {}
                }

                p.state.lock().assert_consistent();
                prop_assert_eq!(p.residency(), model.len());
                prop_assert!(p.residency() <= cache_size as usize);
                let walked = walk(&p);
                let expected: Vec<(u32, u64)> = model.iter().map(|&(o, c)| (c, o)).collect();
                prop_assert_eq!(walked, expected);
            }
        }
    }
}
