//! Pre-allocated mapping entries.
//!
//! Entries live in one arena addressed by [`EntryId`]. At any instant each
//! entry is either on the free stack or on the used list. The used list is
//! doubly linked through the arena, oldest at the head, so it is the FIFO
//! eviction queue and supports O(1) removal from the middle.

use dmc_types::{CacheBlock, OriginBlock};

/// Arena index of a mapping entry. Never valid outside the policy lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId(u32);

impl EntryId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) oblock: OriginBlock,
    pub(crate) cblock: Option<CacheBlock>,
    /// Next entry in the same hash bucket.
    pub(crate) hash_next: Option<EntryId>,
    prev: Option<EntryId>,
    next: Option<EntryId>,
    in_use: bool,
}

impl Entry {
    fn vacant() -> Self {
        Self {
            oblock: OriginBlock(0),
            cblock: None,
            hash_next: None,
            prev: None,
            next: None,
            in_use: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct EntryPool {
    entries: Vec<Entry>,
    free: Vec<EntryId>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    used_len: usize,
}

impl EntryPool {
    pub(crate) fn new(nr_entries: u32) -> Self {
        let entries = vec![Entry::vacant(); nr_entries as usize];
        // Reversed so the first `take_free` hands out entry 0.
        let free = (0..nr_entries).rev().map(EntryId).collect();
        Self {
            entries,
            free,
            head: None,
            tail: None,
            used_len: 0,
        }
    }

    pub(crate) fn get(&self, id: EntryId) -> &Entry {
        &self.entries[id.idx()]
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.idx()]
    }

    pub(crate) fn used_len(&self) -> usize {
        self.used_len
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn take_free(&mut self) -> Option<EntryId> {
        self.free.pop()
    }

    /// Push a fully detached entry back on the free stack.
    pub(crate) fn return_free(&mut self, id: EntryId) {
        let entry = self.get_mut(id);
        assert!(!entry.in_use, "entry {} returned while on the used list", id.0);
        assert!(
            entry.hash_next.is_none(),
            "entry {} returned while still hashed",
            id.0
        );
        entry.cblock = None;
        self.free.push(id);
    }

    /// Append to the tail (newest end) of the used list.
    pub(crate) fn push_used(&mut self, id: EntryId) {
        let old_tail = self.tail;
        {
            let entry = self.get_mut(id);
            assert!(!entry.in_use, "entry {} pushed twice", id.0);
            entry.in_use = true;
            entry.prev = old_tail;
            entry.next = None;
        }
        match old_tail {
            Some(tail) => self.get_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.used_len += 1;
    }

    /// Detach and return the oldest used entry.
    pub(crate) fn pop_oldest_used(&mut self) -> Option<EntryId> {
        let head = self.head?;
        self.remove_used(head);
        Some(head)
    }

    /// Unlink `id` from anywhere in the used list.
    pub(crate) fn remove_used(&mut self, id: EntryId) {
        let (prev, next) = {
            let entry = self.get_mut(id);
            assert!(entry.in_use, "entry {} is not on the used list", id.0);
            entry.in_use = false;
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(prev) => self.get_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.get_mut(next).prev = prev,
            None => self.tail = prev,
        }
        self.used_len -= 1;
    }

    /// Used entries, oldest first.
    pub(crate) fn iter_used(&self) -> UsedIter<'_> {
        UsedIter {
            pool: self,
            cursor: self.head,
        }
    }
}

pub(crate) struct UsedIter<'a> {
    pool: &'a EntryPool,
    cursor: Option<EntryId>,
}

impl<'a> Iterator for UsedIter<'a> {
    type Item = (EntryId, &'a Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let entry = self.pool.get(id);
        self.cursor = entry.next;
        Some((id, entry))
    }
}
