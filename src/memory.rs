//! Slab memory arena.
//!
//! A fixed-capacity allocator over an anonymous shared mapping. The region
//! is split into equal power-of-two blocks; each in-use block is dedicated
//! to one chunk class (a power-of-two size between the minimum chunk
//! granularity and the block size) and hands out chunks from a bitmap.
//! Blocks move between three kinds of lists: a partial list per chunk
//! class, the `empty` list of fully released blocks, and the `full` list.
//! Fresh blocks are carved lazily from a high-water mark.
//!
//! Coarse classes whose block holds at most 32 chunks track occupancy in an
//! inline info word instead of the bitmap.
//!
//! All raw pointer arithmetic stays inside this module. External references
//! into arena memory are `Chunk` handles; the bytes behind a handle are
//! written only by its single owner before publication and freed only after
//! the last reader detaches.

use std::ptr::NonNull;

use anyhow::{bail, Error};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::shctx::ShCtx;

pub const BLOCK_MIN_SHIFT: u32 = 12; // 4 KiB
pub const BLOCK_MAX_SHIFT: u32 = 20; // 1 MiB
pub const CHUNK_MIN_SHIFT: u32 = 5; // 32 B

/// Chunk counts up to this fit in the inline info word.
const INFO_BITS: u32 = 32;

const NONE: u32 = u32::MAX;

/// Handle to one allocated chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Chunk {
    block: u32,
    idx: u32,
    class: u8,
}

struct Region {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

struct Block {
    class: u8,
    inited: bool,
    full: bool,
    used: u32,
    info: u32,
    prev: u32,
    next: u32,
}

struct Inner {
    blocks: Vec<Block>,
    bitmap: Vec<u64>,
    class_head: Vec<u32>,
    empty_head: u32,
    full_head: u32,
    /// next never-used block index
    free_idx: u32,
    used_bytes: u64,
}

pub struct Arena {
    name: String,
    region: Region,
    block_size: u32,
    block_shift: u32,
    chunk_shift: u32,
    classes: u32,
    /// bitmap words reserved per block
    bitmap_words: usize,
    blocks_total: u32,
    inner: ShCtx<Inner>,
}

fn list_push(blocks: &mut [Block], head: &mut u32, idx: u32) {
    blocks[idx as usize].prev = NONE;
    blocks[idx as usize].next = *head;

    if *head != NONE {
        blocks[*head as usize].prev = idx;
    }

    *head = idx;
}

fn list_unlink(blocks: &mut [Block], head: &mut u32, idx: u32) {
    let (prev, next) = {
        let block = &blocks[idx as usize];
        (block.prev, block.next)
    };

    if prev != NONE {
        blocks[prev as usize].next = next;
    } else {
        *head = next;
    }

    if next != NONE {
        blocks[next as usize].prev = prev;
    }

    blocks[idx as usize].prev = NONE;
    blocks[idx as usize].next = NONE;
}

impl Arena {

    /// Map a shared region of `size` bytes and set up the slab bookkeeping.
    ///
    /// `block_size` is clamped to `[4 KiB, 1 MiB]` and rounded up to a power
    /// of two; `chunk_size` is rounded up to a power of two of at least the
    /// minimum chunk granularity. `size` is rounded up to whole blocks.
    pub fn new(name: &str, size: u64, block_size: u32, chunk_size: u32) -> Result<Arena, Error> {

        if block_size > 1 << BLOCK_MAX_SHIFT {
            bail!("arena {}: block size {} exceeds the maximum {}",
                name, block_size, 1u32 << BLOCK_MAX_SHIFT);
        }

        let mut block_shift = BLOCK_MIN_SHIFT;
        while (1u32 << block_shift) < block_size {
            block_shift += 1;
        }
        let block_size = 1u32 << block_shift;

        let mut chunk_shift = CHUNK_MIN_SHIFT;
        while (1u32 << chunk_shift) < chunk_size {
            chunk_shift += 1;
        }

        if (1u32 << chunk_shift) > block_size {
            bail!("arena {}: chunk size cannot be greater than block size", name);
        }

        let size = (size + (block_size as u64) - 1) / (block_size as u64) * (block_size as u64);
        let blocks_total = (size / block_size as u64) as u32;

        if blocks_total == 0 {
            bail!("arena {}: region too small for a single block", name);
        }

        let len = size as usize;

        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        let base = match base {
            Ok(p) => NonNull::new(p as *mut u8)
                .ok_or_else(|| anyhow::format_err!("arena {}: mmap returned NULL", name))?,
            Err(err) => bail!("arena {}: mmap failed - {}", name, err),
        };

        let classes = block_shift - chunk_shift + 1;

        // worst case: every chunk is of the minimum class
        let max_bits = (block_size >> chunk_shift) as usize;
        let bitmap_words = (max_bits + 63) / 64;

        let mut blocks = Vec::with_capacity(blocks_total as usize);
        for _ in 0..blocks_total {
            blocks.push(Block {
                class: 0,
                inited: false,
                full: false,
                used: 0,
                info: 0,
                prev: NONE,
                next: NONE,
            });
        }

        Ok(Arena {
            name: name.to_string(),
            region: Region { base, len },
            block_size,
            block_shift,
            chunk_shift,
            classes,
            bitmap_words,
            blocks_total,
            inner: ShCtx::new(Inner {
                blocks,
                bitmap: vec![0u64; bitmap_words * blocks_total as usize],
                class_head: vec![NONE; classes as usize],
                empty_head: NONE,
                full_head: NONE,
                free_idx: 0,
                used_bytes: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total bytes the arena can hand out.
    pub fn capacity(&self) -> u64 {
        self.blocks_total as u64 * self.block_size as u64
    }

    /// Bytes currently allocated, counted at chunk-class granularity.
    pub fn used(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn class_for(&self, size: usize) -> u8 {
        let mut class = 0u8;
        while (1usize << (self.chunk_shift + class as u32)) < size {
            class += 1;
        }
        class
    }

    fn chunk_size(&self, class: u8) -> u32 {
        1u32 << (self.chunk_shift + class as u32)
    }

    fn bits_need(&self, class: u8) -> u32 {
        self.block_size >> (self.chunk_shift + class as u32)
    }

    /// Allocate a chunk of the smallest class that fits `size`.
    ///
    /// Returns `None` when the region is exhausted or `size` exceeds the
    /// block size.
    pub fn alloc(&self, size: usize) -> Option<Chunk> {

        if size == 0 || size > self.block_size as usize {
            return None;
        }

        let class = self.class_for(size);
        let chunk_size = self.chunk_size(class);
        let bits_need = self.bits_need(class);

        let mut inner = self.inner.lock();
        let Inner {
            ref mut blocks,
            ref mut bitmap,
            ref mut class_head,
            ref mut empty_head,
            ref mut full_head,
            ref mut free_idx,
            ref mut used_bytes,
        } = *inner;

        // pick a block: partial list, then empty list, then the high-water
        // mark
        let block_idx = if class_head[class as usize] != NONE {
            class_head[class as usize]
        } else if *empty_head != NONE {
            let idx = *empty_head;
            list_unlink(blocks, empty_head, idx);
            self.block_init(blocks, bitmap, class_head, idx, class);
            idx
        } else if *free_idx < self.blocks_total {
            let idx = *free_idx;
            *free_idx += 1;

            if blocks[idx as usize].inited {
                return None;
            }

            self.block_init(blocks, bitmap, class_head, idx, class);
            idx
        } else {
            return None;
        };

        let block = &mut blocks[block_idx as usize];

        let idx = if bits_need <= INFO_BITS {
            let info = block.info;
            block.info = info | info.wrapping_add(1);
            (!info).trailing_zeros()
        } else {
            let base = block_idx as usize * self.bitmap_words;
            let words = (bits_need / 64) as usize;
            let mut idx = 0u32;

            for wi in 0..words {
                let word = bitmap[base + wi];

                if word == !0u64 {
                    idx += 64;
                    continue;
                }

                idx += (!word).trailing_zeros();
                bitmap[base + wi] = word | word.wrapping_add(1);
                break;
            }

            idx
        };

        block.used += 1;

        if block.used == bits_need {
            block.full = true;
            list_unlink(blocks, &mut class_head[class as usize], block_idx);
            list_push(blocks, full_head, block_idx);
        }

        *used_bytes += chunk_size as u64;

        Some(Chunk { block: block_idx, idx, class })
    }

    /// Release a chunk back to its block.
    ///
    /// A handle whose bit is already clear is ignored (and logged), so a
    /// double free cannot corrupt the lists.
    pub fn free(&self, chunk: Chunk) {

        if chunk.block >= self.blocks_total {
            log::warn!("arena {}: free of out-of-range block {}", self.name, chunk.block);
            return;
        }

        let chunk_size = self.chunk_size(chunk.class);
        let bits_need = self.bits_need(chunk.class);

        if chunk.idx >= bits_need {
            log::warn!("arena {}: free of out-of-range chunk {}", self.name, chunk.idx);
            return;
        }

        let mut inner = self.inner.lock();
        let Inner {
            ref mut blocks,
            ref mut bitmap,
            ref mut class_head,
            ref mut empty_head,
            ref mut full_head,
            ref mut used_bytes,
            ..
        } = *inner;

        {
            let block = &mut blocks[chunk.block as usize];

            if !block.inited || block.class != chunk.class {
                log::warn!("arena {}: free with stale class on block {}", self.name, chunk.block);
                return;
            }

            let was_set = if bits_need <= INFO_BITS {
                let mask = 1u32 << chunk.idx;
                let set = block.info & mask != 0;
                block.info &= !mask;
                set
            } else {
                let word = &mut bitmap[chunk.block as usize * self.bitmap_words
                    + (chunk.idx / 64) as usize];
                let mask = 1u64 << (chunk.idx % 64);
                let set = *word & mask != 0;
                *word &= !mask;
                set
            };

            if !was_set {
                log::warn!("arena {}: double free on block {} chunk {}",
                    self.name, chunk.block, chunk.idx);
                return;
            }

            block.used -= 1;
        }

        let was_full = blocks[chunk.block as usize].full;
        let now_empty = blocks[chunk.block as usize].used == 0;
        blocks[chunk.block as usize].full = false;

        if was_full && now_empty {
            list_unlink(blocks, full_head, chunk.block);
            list_push(blocks, empty_head, chunk.block);
        } else if was_full {
            list_unlink(blocks, full_head, chunk.block);
            list_push(blocks, &mut class_head[chunk.class as usize], chunk.block);
        } else if now_empty {
            list_unlink(blocks, &mut class_head[chunk.class as usize], chunk.block);
            list_push(blocks, empty_head, chunk.block);
        }

        *used_bytes -= chunk_size as u64;
    }

    fn block_init(
        &self,
        blocks: &mut [Block],
        bitmap: &mut [u64],
        class_head: &mut [u32],
        idx: u32,
        class: u8,
    ) {
        let base = idx as usize * self.bitmap_words;
        for word in bitmap[base..base + self.bitmap_words].iter_mut() {
            *word = 0;
        }

        let block = &mut blocks[idx as usize];
        block.class = class;
        block.inited = true;
        block.full = false;
        block.used = 0;
        block.info = 0;
        block.prev = NONE;
        block.next = NONE;

        list_push(blocks, &mut class_head[class as usize], idx);
    }

    fn chunk_ptr(&self, chunk: Chunk) -> *mut u8 {
        let offset = (chunk.block as usize) << self.block_shift;
        let offset = offset + ((chunk.idx as usize) << (self.chunk_shift + chunk.class as u32));
        unsafe { self.region.base.as_ptr().add(offset) }
    }

    /// Usable bytes behind the handle.
    pub fn chunk_capacity(&self, chunk: Chunk) -> usize {
        self.chunk_size(chunk.class) as usize
    }

    /// Copy `data` into the chunk at `offset`.
    pub fn write(&self, chunk: Chunk, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.chunk_capacity(chunk));

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.chunk_ptr(chunk).add(offset),
                data.len(),
            );
        }
    }

    /// Borrow `len` bytes of the chunk.
    pub fn bytes(&self, chunk: Chunk, len: usize) -> &[u8] {
        assert!(len <= self.chunk_capacity(chunk));

        unsafe { std::slice::from_raw_parts(self.chunk_ptr(chunk), len) }
    }

    /// Allocate a chunk and fill it with `data`.
    pub fn alloc_bytes(&self, data: &[u8]) -> Option<Chunk> {
        let chunk = self.alloc(data.len())?;
        self.write(chunk, 0, data);
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn small_arena() -> Arena {
        Arena::new("test", 1024 * 1024, 4096, 64).unwrap()
    }

    #[test]
    fn rejects_oversized_block() {
        assert!(Arena::new("test", 1024 * 1024, 2 << BLOCK_MAX_SHIFT, 64).is_err());
    }

    #[test]
    fn alloc_free_restores_counters() {
        let arena = small_arena();
        assert_eq!(arena.used(), 0);

        let a = arena.alloc(10).unwrap();
        let b = arena.alloc(100).unwrap();
        assert_eq!(arena.used(), 64 + 128);

        arena.free(a);
        arena.free(b);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn rounds_to_chunk_class() {
        let arena = small_arena();

        let chunk = arena.alloc(65).unwrap();
        assert_eq!(arena.chunk_capacity(chunk), 128);
        arena.free(chunk);

        let chunk = arena.alloc(1).unwrap();
        assert_eq!(arena.chunk_capacity(chunk), 64);
        arena.free(chunk);
    }

    #[test]
    fn zero_and_oversize_fail() {
        let arena = small_arena();
        assert!(arena.alloc(0).is_none());
        assert!(arena.alloc(4097).is_none());
    }

    #[test]
    fn data_round_trip() {
        let arena = small_arena();

        let chunk = arena.alloc_bytes(b"hello world").unwrap();
        assert_eq!(arena.bytes(chunk, 11), b"hello world");

        arena.free(chunk);
    }

    #[test]
    fn exhaustion_returns_none() {
        // one block only
        let arena = Arena::new("tiny", 4096, 4096, 64).unwrap();
        let mut chunks = Vec::new();

        while let Some(chunk) = arena.alloc(64) {
            chunks.push(chunk);
        }

        assert_eq!(chunks.len(), 4096 / 64);
        assert!(arena.alloc(64).is_none());

        for chunk in chunks {
            arena.free(chunk);
        }
        assert_eq!(arena.used(), 0);

        // the block is recyclable for another class afterwards
        assert!(arena.alloc(4096).is_some());
    }

    #[test]
    fn whole_block_chunks() {
        // the last class: one chunk per block
        let arena = Arena::new("blocky", 16 * 4096, 4096, 64).unwrap();

        let a = arena.alloc(4096).unwrap();
        let b = arena.alloc(4096).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.used(), 2 * 4096);

        arena.free(a);
        arena.free(b);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn double_free_is_ignored() {
        let arena = small_arena();

        let chunk = arena.alloc(64).unwrap();
        arena.free(chunk);
        let used = arena.used();

        arena.free(chunk);
        assert_eq!(arena.used(), used);
    }

    #[test]
    fn distinct_chunks_do_not_alias() {
        let arena = small_arena();

        let a = arena.alloc_bytes(b"aaaa").unwrap();
        let b = arena.alloc_bytes(b"bbbb").unwrap();

        assert_eq!(arena.bytes(a, 4), b"aaaa");
        assert_eq!(arena.bytes(b, 4), b"bbbb");

        arena.free(a);
        arena.free(b);
    }

    #[test]
    fn bitmap_classes_fill_and_recycle() {
        // chunk class with 64 bits per block exercises the bitmap path
        let arena = Arena::new("bits", 8 * 4096, 4096, 32).unwrap();
        let mut chunks = Vec::new();

        for _ in 0..(4096 / 32) {
            chunks.push(arena.alloc(32).unwrap());
        }

        // block is full; next alloc carves a new block
        let extra = arena.alloc(32).unwrap();
        assert_ne!(extra.block, chunks[0].block);

        // freeing one chunk makes the first block partial again
        arena.free(chunks.pop().unwrap());
        let again = arena.alloc(32).unwrap();
        assert_eq!(again.block, chunks[0].block);

        arena.free(again);
        arena.free(extra);
        for chunk in chunks {
            arena.free(chunk);
        }
        assert_eq!(arena.used(), 0);
    }
}
