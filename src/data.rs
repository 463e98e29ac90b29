//! Cached response bodies.
//!
//! A [Data] is one complete response body: a chain of elements whose bytes
//! live in the arena, plus the response info block. Every Data sits on a
//! process-global ring that the cleaner walks in bounded steps, freeing
//! bodies nothing references anymore.

use std::collections::VecDeque;

use crate::error::EngineError;
use crate::memory::{Arena, Chunk};

pub type DataId = u32;

/// One contiguous byte run inside a Data.
pub struct Element {
    pub chunk: Chunk,
    pub len: u32,
}

/// Response metadata replayed on a hit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub content_type: Option<Vec<u8>>,
    pub transfer_encoding: Option<Vec<u8>>,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

pub struct Data {
    /// reader refcount; a Data with clients is never freed
    pub clients: u32,
    pub invalid: bool,
    pub elements: Vec<Element>,
    pub info: ResponseInfo,
}

pub struct DataRing {
    slots: Vec<Option<Data>>,
    free: Vec<u32>,
    /// cleaner scan order; rotating the deque stands in for chasing the
    /// tail of the original circular list
    ring: VecDeque<DataId>,
}

impl DataRing {

    pub fn new() -> DataRing {
        DataRing {
            slots: Vec::new(),
            free: Vec::new(),
            ring: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn insert(&mut self, info: ResponseInfo) -> DataId {
        let data = Data {
            clients: 0,
            invalid: false,
            elements: Vec::new(),
            info,
        };

        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = Some(data);
                id
            }
            None => {
                self.slots.push(Some(data));
                (self.slots.len() - 1) as DataId
            }
        };

        self.ring.push_back(id);
        id
    }

    pub fn get(&self, id: DataId) -> Option<&Data> {
        self.slots.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: DataId) -> Option<&mut Data> {
        self.slots.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    /// Append a payload piece, split at the arena's block size.
    pub fn append(&mut self, arena: &Arena, id: DataId, bytes: &[u8]) -> Result<(), EngineError> {
        let block_size = arena.block_size() as usize;

        let data = self.get_mut(id).ok_or(EngineError::UpstreamFailure)?;

        for piece in bytes.chunks(block_size) {
            let chunk = arena.alloc_bytes(piece).ok_or(EngineError::ArenaFull)?;
            data.elements.push(Element {
                chunk,
                len: piece.len() as u32,
            });
        }

        Ok(())
    }

    pub fn attach(&mut self, id: DataId) {
        if let Some(data) = self.get_mut(id) {
            data.clients += 1;
        }
    }

    pub fn detach(&mut self, id: DataId) {
        if let Some(data) = self.get_mut(id) {
            if data.clients > 0 {
                data.clients -= 1;
            }
        }
    }

    pub fn invalidate(&mut self, id: DataId) {
        if let Some(data) = self.get_mut(id) {
            data.invalid = true;
        }
    }

    pub fn total_len(&self, id: DataId) -> u64 {
        self.get(id)
            .map(|data| data.elements.iter().map(|e| e.len as u64).sum())
            .unwrap_or(0)
    }

    /// Copy one element out of the arena.
    pub fn element_bytes(&self, arena: &Arena, id: DataId, idx: usize) -> Option<Vec<u8>> {
        let data = self.get(id)?;
        let element = data.elements.get(idx)?;
        Some(arena.bytes(element.chunk, element.len as usize).to_vec())
    }

    /// Walk up to `quota` ring positions, freeing invalid bodies without
    /// readers. Returns the number freed.
    pub fn cleanup(&mut self, arena: &Arena, quota: usize) -> usize {
        let mut freed = 0;

        for _ in 0..quota.min(self.ring.len()) {
            let id = match self.ring.pop_front() {
                Some(id) => id,
                None => break,
            };

            let freeable = match self.get(id) {
                Some(data) => data.invalid && data.clients == 0,
                None => false,
            };

            if freeable {
                self.free_data(arena, id);
                freed += 1;
            } else {
                self.ring.push_back(id);
            }
        }

        freed
    }

    /// Free an invalid body right away when nothing reads it anymore.
    /// Returns false if a client still holds it (the cleaner retries).
    pub fn release(&mut self, arena: &Arena, id: DataId) -> bool {
        let freeable = match self.get(id) {
            Some(data) => data.invalid && data.clients == 0,
            None => return true,
        };

        if freeable {
            self.ring.retain(|&ring_id| ring_id != id);
            self.free_data(arena, id);
        }

        freeable
    }

    fn free_data(&mut self, arena: &Arena, id: DataId) {
        if let Some(data) = self.slots[id as usize].take() {
            for element in data.elements {
                arena.free(element.chunk);
            }
            self.free.push(id);
        }
    }
}
