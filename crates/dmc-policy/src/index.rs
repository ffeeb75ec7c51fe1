//! Origin-block hash index over the used entries.
//!
//! Separate chaining: each bucket holds the head of a singly linked chain
//! threaded through [`Entry::hash_next`](crate::pool::Entry), so the index
//! itself allocates nothing after construction.

use crate::pool::{EntryId, EntryPool};
use dmc_types::OriginBlock;

/// 2^64 / phi, the multiplicative hashing constant.
const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

const MIN_BUCKETS: u32 = 16;

#[derive(Debug)]
pub(crate) struct HashIndex {
    buckets: Vec<Option<EntryId>>,
    hash_bits: u32,
    len: usize,
}

impl HashIndex {
    /// One bucket per four cache blocks, at least 16, rounded up to a power of two.
    pub(crate) fn new(cache_size: u32) -> Self {
        let nr_buckets = (cache_size / 4).max(MIN_BUCKETS).next_power_of_two();
        Self {
            buckets: vec![None; nr_buckets as usize],
            hash_bits: nr_buckets.trailing_zeros(),
            len: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn nr_buckets(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn bucket(&self, oblock: OriginBlock) -> usize {
        // Top `hash_bits` bits of the product; hash_bits >= 4.
        (oblock.0.wrapping_mul(GOLDEN_RATIO_64) >> (u64::BITS - self.hash_bits)) as usize
    }

    pub(crate) fn lookup(&self, pool: &EntryPool, oblock: OriginBlock) -> Option<EntryId> {
        let mut cursor = self.buckets[self.bucket(oblock)];
        while let Some(id) = cursor {
            let entry = pool.get(id);
            if entry.oblock == oblock {
                return Some(id);
            }
            cursor = entry.hash_next;
        }
        None
    }

    /// Index `id` under its current origin block, which must not be present.
    pub(crate) fn insert(&mut self, pool: &mut EntryPool, id: EntryId) {
        let oblock = pool.get(id).oblock;
        assert!(
            self.lookup(pool, oblock).is_none(),
            "{oblock} inserted into hash index twice"
        );
        let bucket = self.bucket(oblock);
        pool.get_mut(id).hash_next = self.buckets[bucket];
        self.buckets[bucket] = Some(id);
        self.len += 1;
    }

    /// Unlink the entry for `oblock`, which must be present.
    pub(crate) fn remove(&mut self, pool: &mut EntryPool, oblock: OriginBlock) -> EntryId {
        let bucket = self.bucket(oblock);
        let mut prev: Option<EntryId> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(id) = cursor {
            let next = pool.get(id).hash_next;
            if pool.get(id).oblock == oblock {
                match prev {
                    Some(prev) => pool.get_mut(prev).hash_next = next,
                    None => self.buckets[bucket] = next,
                }
                pool.get_mut(id).hash_next = None;
                self.len -= 1;
                return id;
            }
            prev = Some(id);
            cursor = next;
        }
        panic!("{oblock} is not in the hash index");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashed(pool: &mut EntryPool, index: &mut HashIndex, oblock: u64) -> EntryId {
        let id = pool.take_free().unwrap();
        pool.get_mut(id).oblock = OriginBlock(oblock);
        index.insert(pool, id);
        id
    }

    #[test]
    fn bucket_count_follows_cache_size() {
        assert_eq!(HashIndex::new(1).nr_buckets(), 16);
        assert_eq!(HashIndex::new(64).nr_buckets(), 16);
        assert_eq!(HashIndex::new(100).nr_buckets(), 32);
        assert_eq!(HashIndex::new(65536).nr_buckets(), 16384);
    }

    #[test]
    fn insert_lookup_remove() {
        let mut pool = EntryPool::new(8);
        let mut index = HashIndex::new(8);
        let a = hashed(&mut pool, &mut index, 10);
        let b = hashed(&mut pool, &mut index, 20);
        assert_eq!(index.lookup(&pool, OriginBlock(10)), Some(a));
        assert_eq!(index.lookup(&pool, OriginBlock(20)), Some(b));
        assert_eq!(index.lookup(&pool, OriginBlock(30)), None);
        assert_eq!(index.len(), 2);

        assert_eq!(index.remove(&mut pool, OriginBlock(10)), a);
        assert_eq!(index.lookup(&pool, OriginBlock(10)), None);
        assert_eq!(index.lookup(&pool, OriginBlock(20)), Some(b));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn colliding_chain_survives_middle_removal() {
        // 16 buckets, 64 keys: every bucket chains several entries.
        let mut pool = EntryPool::new(64);
        let mut index = HashIndex::new(64);
        let ids: Vec<_> = (0..64).map(|k| hashed(&mut pool, &mut index, k * 7)).collect();

        for k in (0..64).step_by(3) {
            assert_eq!(index.remove(&mut pool, OriginBlock(k * 7)), ids[k as usize]);
        }
        for k in 0..64_u64 {
            let found = index.lookup(&pool, OriginBlock(k * 7));
            if k % 3 == 0 {
                assert_eq!(found, None);
            } else {
                assert_eq!(found, Some(ids[k as usize]));
            }
        }
    }

    #[test]
    #[should_panic(expected = "inserted into hash index twice")]
    fn duplicate_insert_panics() {
        let mut pool = EntryPool::new(4);
        let mut index = HashIndex::new(4);
        hashed(&mut pool, &mut index, 1);
        hashed(&mut pool, &mut index, 1);
    }

    #[test]
    #[should_panic(expected = "is not in the hash index")]
    fn removing_absent_key_panics() {
        let mut pool = EntryPool::new(4);
        let mut index = HashIndex::new(4);
        let _ = index.remove(&mut pool, OriginBlock(5));
    }
}
