//! Fingerprint dictionary.
//!
//! Two bucket tables with incremental rehashing, modeled after the classic
//! redis-style dict. Only table 0 serves when `rehash_idx == -1`; while a
//! rehash runs, buckets `[0, rehash_idx)` of table 0 are already migrated,
//! the rest stay live, and table 1 takes migrated chains plus new inserts.
//! Chains are singly linked through a slab of entry slots, keyed by
//! `(hash, key bytes)` with full key comparison on lookup.

use std::path::PathBuf;

use crate::data::{DataId, DataRing};
use crate::memory::{Arena, Chunk};

const NONE: u32 = u32::MAX;

const LOAD_FACTOR_NUM: u64 = 3;
const LOAD_FACTOR_DEN: u64 = 4;
const GROWTH_FACTOR: usize = 2;
const MIN_BUCKETS: usize = 128;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryState {
    /// exactly one writer is streaming the response in
    Creating,
    Valid,
    Invalid,
    Expired,
}

pub struct Entry {
    pub state: EntryState,
    key: Chunk,
    key_len: u32,
    pub hash: u64,
    pub data: Option<DataId>,
    /// absolute unix seconds, 0 never expires
    pub expire: u64,
    pub ctime: u64,
    pub atime: u64,
    pub header_len: u32,
    pub host: Option<Vec<u8>>,
    pub path: Option<Vec<u8>>,
    /// owning rule uuid
    pub rule: u32,
    /// proxy uuid
    pub pid: i32,
    pub file: Option<PathBuf>,
    pub etag: Option<Vec<u8>>,
    pub last_modified: Option<Vec<u8>>,
    /// per-sub-interval read counters for auto-extend
    pub access: [u32; 4],
    pub persist_retries: u8,
    pub persist_failed: bool,
    next: u32,
}

impl Entry {

    pub fn expired(&self, now: u64) -> bool {
        self.expire != 0 && self.expire <= now
    }

    pub fn usable(&self, now: u64) -> bool {
        self.state == EntryState::Valid && !self.expired(now)
    }

    pub fn key_bytes<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        arena.bytes(self.key, self.key_len as usize)
    }
}

struct Table {
    buckets: Vec<u32>,
}

impl Table {

    fn with_buckets(count: usize) -> Table {
        Table {
            buckets: vec![NONE; count],
        }
    }

    fn size(&self) -> usize {
        self.buckets.len()
    }
}

pub struct Dict {
    tables: [Table; 2],
    /// >= 0 while rehashing, -1 otherwise
    rehash_idx: i64,
    used: u64,
    cleanup_idx: usize,
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
}

impl Dict {

    /// `dict_size` is the bytes reserved for buckets; it fixes the initial
    /// table size but not the growth.
    pub fn new(dict_size: u64) -> Dict {
        let buckets = ((dict_size as usize) / std::mem::size_of::<usize>()).max(MIN_BUCKETS);

        Dict {
            tables: [Table::with_buckets(buckets), Table::with_buckets(0)],
            rehash_idx: -1,
            used: 0,
            cleanup_idx: 0,
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn rehashing(&self) -> bool {
        self.rehash_idx >= 0
    }

    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, id: u32) -> Option<&Entry> {
        self.entries.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn entry_mut(&mut self, id: u32) -> Option<&mut Entry> {
        self.entries.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    /// Look up the slot holding `key_bytes`, if any, regardless of state.
    pub fn get(&self, arena: &Arena, key_bytes: &[u8], hash: u64) -> Option<u32> {
        let probe = |table: &Table, from: usize| -> Option<u32> {
            if table.size() == 0 {
                return None;
            }

            let bucket = (hash as usize) % table.size();
            if bucket < from {
                return None;
            }

            let mut cursor = table.buckets[bucket];
            while cursor != NONE {
                let entry = self.entries[cursor as usize].as_ref().unwrap();

                if entry.hash == hash && entry.key_bytes(arena) == key_bytes {
                    return Some(cursor);
                }

                cursor = entry.next;
            }

            None
        };

        if self.rehashing() {
            probe(&self.tables[0], self.rehash_idx as usize)
                .or_else(|| probe(&self.tables[1], 0))
        } else {
            probe(&self.tables[0], 0)
        }
    }

    fn insert_table(&self) -> usize {
        if self.rehashing() {
            1
        } else {
            0
        }
    }

    fn link(&mut self, table: usize, id: u32) {
        let hash = self.entries[id as usize].as_ref().unwrap().hash;
        let bucket = (hash as usize) % self.tables[table].size();

        let head = self.tables[table].buckets[bucket];
        self.entries[id as usize].as_mut().unwrap().next = head;
        self.tables[table].buckets[bucket] = id;
    }

    fn alloc_slot(&mut self, entry: Entry) -> u32 {
        match self.free.pop() {
            Some(id) => {
                self.entries[id as usize] = Some(entry);
                id
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        }
    }

    /// Insert a fresh CREATING entry. The key bytes are copied into the
    /// arena; `None` means the arena could not hold them.
    pub fn set(
        &mut self,
        arena: &Arena,
        key_bytes: &[u8],
        hash: u64,
        rule: u32,
        pid: i32,
        ttl: u32,
        now: u64,
    ) -> Option<u32> {

        let key = arena.alloc_bytes(key_bytes)?;

        let entry = Entry {
            state: EntryState::Creating,
            key,
            key_len: key_bytes.len() as u32,
            hash,
            data: None,
            expire: if ttl == 0 { 0 } else { now + ttl as u64 },
            ctime: now,
            atime: now,
            header_len: 0,
            host: None,
            path: None,
            rule,
            pid,
            file: None,
            etag: None,
            last_modified: None,
            access: [0; 4],
            persist_retries: 0,
            persist_failed: false,
            next: NONE,
        };

        let id = self.alloc_slot(entry);
        self.link(self.insert_table(), id);
        self.used += 1;

        self.maybe_grow();

        Some(id)
    }

    /// Insert a VALID entry recovered from a persistence file. The body
    /// stays on disk (`data == None`).
    #[allow(clippy::too_many_arguments)]
    pub fn set_from_disk(
        &mut self,
        arena: &Arena,
        key_bytes: &[u8],
        hash: u64,
        file: PathBuf,
        expire: u64,
        header_len: u32,
        host: Option<Vec<u8>>,
        path: Option<Vec<u8>>,
        etag: Option<Vec<u8>>,
        last_modified: Option<Vec<u8>>,
        now: u64,
    ) -> Option<u32> {

        let key = arena.alloc_bytes(key_bytes)?;

        let entry = Entry {
            state: EntryState::Valid,
            key,
            key_len: key_bytes.len() as u32,
            hash,
            data: None,
            expire,
            ctime: now,
            atime: now,
            header_len,
            host,
            path,
            rule: 0,
            pid: -1,
            file: Some(file),
            etag,
            last_modified,
            access: [0; 4],
            persist_retries: 0,
            persist_failed: false,
            next: NONE,
        };

        let id = self.alloc_slot(entry);
        self.link(self.insert_table(), id);
        self.used += 1;

        self.maybe_grow();

        Some(id)
    }

    fn maybe_grow(&mut self) {
        if self.rehashing() {
            return;
        }

        let size = self.tables[0].size() as u64;
        if self.used * LOAD_FACTOR_DEN > size * LOAD_FACTOR_NUM {
            self.tables[1] = Table::with_buckets(self.tables[0].size() * GROWTH_FACTOR);
            self.rehash_idx = 0;
        }
    }

    /// Migrate at most `quota` buckets from table 0 to table 1. Swaps the
    /// tables once the migration completes.
    pub fn rehash(&mut self, quota: usize) {
        if !self.rehashing() {
            return;
        }

        let size0 = self.tables[0].size();

        for _ in 0..quota {
            let idx = self.rehash_idx as usize;
            if idx >= size0 {
                break;
            }

            let mut cursor = self.tables[0].buckets[idx];
            self.tables[0].buckets[idx] = NONE;

            while cursor != NONE {
                let next = self.entries[cursor as usize].as_ref().unwrap().next;
                self.link(1, cursor);
                cursor = next;
            }

            self.rehash_idx += 1;
        }

        if self.rehash_idx as usize >= size0 {
            self.tables.swap(0, 1);
            self.tables[1] = Table::with_buckets(0);
            self.rehash_idx = -1;
        }
    }

    /// Scan at most `quota` buckets for entries that are invalid or expired
    /// and no longer read, unlink them and release their key bytes. Data
    /// bodies are only marked; the data cleaner frees them.
    pub fn cleanup(&mut self, arena: &Arena, data: &mut DataRing, quota: usize, now: u64) -> usize {
        // the cleaner never races a rehash tick
        if self.rehashing() {
            return 0;
        }

        let size = self.tables[0].size();
        if size == 0 {
            return 0;
        }

        let mut removed = 0;

        for _ in 0..quota {
            let bucket = self.cleanup_idx % size;
            self.cleanup_idx = (self.cleanup_idx + 1) % size;

            let mut cursor = self.tables[0].buckets[bucket];
            let mut prev = NONE;

            while cursor != NONE {
                let (next, droppable, data_id) = {
                    let entry = self.entries[cursor as usize].as_ref().unwrap();

                    let dead = match entry.state {
                        EntryState::Invalid | EntryState::Expired => true,
                        EntryState::Valid => entry.expired(now),
                        EntryState::Creating => false,
                    };

                    let clients = entry
                        .data
                        .and_then(|id| data.get(id))
                        .map(|d| d.clients)
                        .unwrap_or(0);

                    (entry.next, dead && clients == 0, entry.data)
                };

                if droppable {
                    if prev == NONE {
                        self.tables[0].buckets[bucket] = next;
                    } else {
                        self.entries[prev as usize].as_mut().unwrap().next = next;
                    }

                    if let Some(id) = data_id {
                        data.invalidate(id);
                    }

                    let entry = self.entries[cursor as usize].take().unwrap();
                    arena.free(entry.key);
                    self.free.push(cursor);
                    self.used -= 1;
                    removed += 1;
                } else {
                    prev = cursor;
                }

                cursor = next;
            }
        }

        removed
    }

    /// Mark the entry invalid and flag its body. Used by purge.
    pub fn invalidate(&mut self, id: u32, data: &mut DataRing) {
        if let Some(entry) = self.entry_mut(id) {
            entry.state = EntryState::Invalid;
            if let Some(data_id) = entry.data.take() {
                data.invalidate(data_id);
            }
        }
    }
}
