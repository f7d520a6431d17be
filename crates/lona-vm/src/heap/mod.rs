// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The heap arena: a single fixed byte region holding a doubly-linked
//! chain of blocks (free and allocated) with a secondary free list for
//! `malloc`/`free` with coalescing and first-fit placement.
//!
//! Every block begins with a 12-byte header (`kind`, `refcount`,
//! `prev_node`, `size`). Free blocks additionally carry `prev_free` /
//! `next_free` pointers; that extra 8 bytes sets the minimum block size.

// The arena is addressed by u32 offsets throughout; casting those to
// `usize` for byte-slice indexing, and `u16` block-kind tags that are
// already bounded by `BlockKind`'s own repr, never lose bits on the
// 32-bit-and-wider targets this VM runs on.
#![allow(clippy::cast_possible_truncation)]


pub mod object;

use crate::types::Vaddr;
use crate::value::NanBox;
use crate::vm::FaultReason;

/// Sentinel stored in place of an address to mean "none".
const NIL: u32 = u32::MAX;

const HEADER_SIZE: u32 = 12;
const FREE_LINKS_SIZE: u32 = 8;
/// Smallest size a block may be; anything requested smaller is rounded up
/// so a released block always has room for free-list links.
pub const MIN_BLOCK_SIZE: u32 = HEADER_SIZE + FREE_LINKS_SIZE;

/// The kind tag stored in a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BlockKind {
    Empty = 0,
    Environment = 1,
    Function = 2,
    Frame = 3,
    Free = 0xFF,
}

impl BlockKind {
    const fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Empty),
            1 => Some(Self::Environment),
            2 => Some(Self::Function),
            3 => Some(Self::Frame),
            0xFF => Some(Self::Free),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
struct RawHeader {
    kind: u16,
    refcount: u16,
    prev_node: u32,
    size: u32,
}

#[derive(Clone, Copy)]
struct RawFreeLinks {
    prev_free: u32,
    next_free: u32,
}

/// Arena-level summary of one block, for property tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: Vaddr,
    pub kind: BlockKind,
    pub refcount: u16,
    pub prev_node: Option<Vaddr>,
    pub size: u32,
}

/// The fixed-size byte arena plus the free-list head.
pub struct Heap {
    bytes: HeapBytes,
    first_free: Option<Vaddr>,
}

#[cfg(any(test, feature = "std"))]
type HeapBytes = std::vec::Vec<u8>;
#[cfg(not(any(test, feature = "std")))]
type HeapBytes = alloc::vec::Vec<u8>;

impl Heap {
    /// Build a fresh arena of `size` bytes, one single free block spanning
    /// the whole thing.
    #[must_use]
    pub fn new(size: u32) -> Self {
        let mut bytes = HeapBytes::new();
        bytes.resize(size as usize, 0);
        let mut heap = Self {
            bytes,
            first_free: None,
        };
        heap.set_header(Vaddr::null(), RawHeader {
            kind: BlockKind::Free as u16,
            refcount: 0,
            prev_node: NIL,
            size,
        });
        heap.set_free_links(Vaddr::null(), RawFreeLinks {
            prev_free: NIL,
            next_free: NIL,
        });
        heap.first_free = Some(Vaddr::null());
        heap
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn header(&self, addr: Vaddr) -> RawHeader {
        let offset = addr.as_usize();
        let kind = u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]]);
        let refcount = u16::from_le_bytes([self.bytes[offset + 2], self.bytes[offset + 3]]);
        let prev_node = u32::from_le_bytes([
            self.bytes[offset + 4],
            self.bytes[offset + 5],
            self.bytes[offset + 6],
            self.bytes[offset + 7],
        ]);
        let size = u32::from_le_bytes([
            self.bytes[offset + 8],
            self.bytes[offset + 9],
            self.bytes[offset + 10],
            self.bytes[offset + 11],
        ]);
        RawHeader {
            kind,
            refcount,
            prev_node,
            size,
        }
    }

    fn set_header(&mut self, addr: Vaddr, header: RawHeader) {
        let offset = addr.as_usize();
        self.bytes[offset..offset + 2].copy_from_slice(&header.kind.to_le_bytes());
        self.bytes[offset + 2..offset + 4].copy_from_slice(&header.refcount.to_le_bytes());
        self.bytes[offset + 4..offset + 8].copy_from_slice(&header.prev_node.to_le_bytes());
        self.bytes[offset + 8..offset + 12].copy_from_slice(&header.size.to_le_bytes());
    }

    fn free_links(&self, addr: Vaddr) -> RawFreeLinks {
        let offset = addr.as_usize() + HEADER_SIZE as usize;
        let prev_free = u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ]);
        let next_free = u32::from_le_bytes([
            self.bytes[offset + 4],
            self.bytes[offset + 5],
            self.bytes[offset + 6],
            self.bytes[offset + 7],
        ]);
        RawFreeLinks {
            prev_free,
            next_free,
        }
    }

    fn set_free_links(&mut self, addr: Vaddr, links: RawFreeLinks) {
        let offset = addr.as_usize() + HEADER_SIZE as usize;
        self.bytes[offset..offset + 4].copy_from_slice(&links.prev_free.to_le_bytes());
        self.bytes[offset + 4..offset + 8].copy_from_slice(&links.next_free.to_le_bytes());
    }

    /// Read a `u32` field at `offset` bytes into the block's payload (i.e.
    /// after its header).
    pub(crate) fn read_u32(&self, addr: Vaddr, offset: u32) -> u32 {
        let o = addr.as_usize() + HEADER_SIZE as usize + offset as usize;
        u32::from_le_bytes([
            self.bytes[o],
            self.bytes[o + 1],
            self.bytes[o + 2],
            self.bytes[o + 3],
        ])
    }

    pub(crate) fn write_u32(&mut self, addr: Vaddr, offset: u32, value: u32) {
        let o = addr.as_usize() + HEADER_SIZE as usize + offset as usize;
        self.bytes[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_box(&self, addr: Vaddr, offset: u32) -> NanBox {
        NanBox::from_bits(self.read_u32(addr, offset))
    }

    pub(crate) fn write_box(&mut self, addr: Vaddr, offset: u32, value: NanBox) {
        self.write_u32(addr, offset, value.to_bits());
    }

    fn next_block(&self, addr: Vaddr) -> Option<Vaddr> {
        let header = self.header(addr);
        let next = addr.add(header.size);
        if next.as_u32() < self.size() {
            Some(next)
        } else {
            None
        }
    }

    fn fix_next_prev_node(&mut self, addr: Vaddr) {
        if let Some(next) = self.next_block(addr) {
            let mut h = self.header(next);
            h.prev_node = addr.as_u32();
            self.set_header(next, h);
        }
    }

    fn free_remove(&mut self, addr: Vaddr) {
        let links = self.free_links(addr);
        if links.prev_free == NIL {
            debug_assert_eq!(self.first_free, Some(addr));
            self.first_free = if links.next_free == NIL {
                None
            } else {
                Some(Vaddr::new(links.next_free))
            };
        } else {
            let prev = Vaddr::new(links.prev_free);
            let mut pl = self.free_links(prev);
            pl.next_free = links.next_free;
            self.set_free_links(prev, pl);
        }
        if links.next_free != NIL {
            let next = Vaddr::new(links.next_free);
            let mut nl = self.free_links(next);
            nl.prev_free = links.prev_free;
            self.set_free_links(next, nl);
        }
    }

    /// Repair the neighbours of a free block whose own `prev_free` /
    /// `next_free` fields are already set, pointing them at `addr`.
    fn free_fix_neighbours(&mut self, addr: Vaddr) {
        let links = self.free_links(addr);
        if links.prev_free == NIL {
            self.first_free = Some(addr);
        } else {
            let prev = Vaddr::new(links.prev_free);
            let mut pl = self.free_links(prev);
            pl.next_free = addr.as_u32();
            self.set_free_links(prev, pl);
        }
        if links.next_free != NIL {
            let next = Vaddr::new(links.next_free);
            let mut nl = self.free_links(next);
            nl.prev_free = addr.as_u32();
            self.set_free_links(next, nl);
        }
    }

    fn free_insert_head(&mut self, addr: Vaddr) {
        let next = self.first_free.map_or(NIL, Vaddr::as_u32);
        self.set_free_links(addr, RawFreeLinks {
            prev_free: NIL,
            next_free: next,
        });
        if let Some(old_first) = self.first_free {
            let mut ol = self.free_links(old_first);
            ol.prev_free = addr.as_u32();
            self.set_free_links(old_first, ol);
        }
        self.first_free = Some(addr);
    }

    /// Allocate a block of at least `requested` bytes (including its
    /// header), tagged `kind`, with `refcount = 1`.
    pub fn allocate(&mut self, requested: u32, kind: BlockKind) -> Result<Vaddr, FaultReason> {
        let size = requested.max(MIN_BLOCK_SIZE);

        let mut cursor = self.first_free;
        let addr = loop {
            match cursor {
                None => return Err(FaultReason::OutOfMemory),
                Some(addr) => {
                    if self.header(addr).size >= size {
                        break addr;
                    }
                    let links = self.free_links(addr);
                    cursor = if links.next_free == NIL {
                        None
                    } else {
                        Some(Vaddr::new(links.next_free))
                    };
                }
            }
        };

        let header = self.header(addr);
        if size + MIN_BLOCK_SIZE <= header.size {
            let tail_addr = addr.add(size);
            let tail_links = self.free_links(addr);
            self.set_header(tail_addr, RawHeader {
                kind: BlockKind::Free as u16,
                refcount: 0,
                prev_node: addr.as_u32(),
                size: header.size - size,
            });
            self.set_free_links(tail_addr, tail_links);
            self.free_fix_neighbours(tail_addr);
            self.fix_next_prev_node(tail_addr);

            let mut resized = header;
            resized.size = size;
            self.set_header(addr, resized);
        } else {
            self.free_remove(addr);
        }

        let mut allocated = self.header(addr);
        allocated.refcount = 1;
        allocated.kind = kind as u16;
        self.set_header(addr, allocated);
        Ok(addr)
    }

    /// Increment a block's reference count.
    pub fn retain(&mut self, addr: Vaddr) -> Result<(), FaultReason> {
        let mut h = self.header(addr);
        h.refcount = h.refcount.checked_add(1).ok_or(FaultReason::InternalError)?;
        self.set_header(addr, h);
        Ok(())
    }

    /// `retain` a pointer box; a no-op for any other kind.
    pub fn retain_box(&mut self, v: NanBox) -> Result<(), FaultReason> {
        match v.as_pointer() {
            Some(addr) => self.retain(addr),
            None => Ok(()),
        }
    }

    /// Decrement a block's reference count, destroying and releasing it
    /// back to the free list once it reaches zero.
    pub fn release(&mut self, addr: Vaddr) -> Result<(), FaultReason> {
        let mut h = self.header(addr);
        h.refcount = h.refcount.checked_sub(1).ok_or(FaultReason::InternalError)?;
        self.set_header(addr, h);
        if h.refcount == 0 {
            self.destroy_and_free(addr)?;
        }
        Ok(())
    }

    /// `release` a pointer box; a no-op for any other kind.
    pub fn release_box(&mut self, v: NanBox) -> Result<(), FaultReason> {
        match v.as_pointer() {
            Some(addr) => self.release(addr),
            None => Ok(()),
        }
    }

    fn destroy_and_free(&mut self, addr: Vaddr) -> Result<(), FaultReason> {
        let header = self.header(addr);
        match BlockKind::from_u16(header.kind) {
            Some(BlockKind::Environment) => object::destroy_environment(self, addr)?,
            Some(BlockKind::Function) => object::destroy_function(self, addr)?,
            Some(BlockKind::Frame) => {}
            _ => return Err(FaultReason::InternalError),
        }
        self.mfree(addr);
        Ok(())
    }

    /// Mark a zero-refcount block free and coalesce with physically
    /// adjacent free neighbours.
    fn mfree(&mut self, addr: Vaddr) {
        let header = self.header(addr);
        debug_assert!(header.size >= MIN_BLOCK_SIZE);
        debug_assert_eq!(header.refcount, 0);

        let next = self.next_block(addr);
        let prev = if header.prev_node == NIL {
            None
        } else {
            Some(Vaddr::new(header.prev_node))
        };
        let prev_free = prev.filter(|&p| self.header(p).kind == BlockKind::Free as u16);
        let next_free = next.filter(|&n| self.header(n).kind == BlockKind::Free as u16);

        match (prev_free, next_free) {
            (Some(prev_addr), Some(next_addr)) => {
                let next_size = self.header(next_addr).size;
                let mut ph = self.header(prev_addr);
                ph.size += header.size + next_size;
                self.set_header(prev_addr, ph);
                self.fix_next_prev_node(prev_addr);
                self.free_remove(next_addr);
            }
            (None, Some(next_addr)) => {
                let next_links = self.free_links(next_addr);
                let next_size = self.header(next_addr).size;
                let mut h = header;
                h.size += next_size;
                h.kind = BlockKind::Free as u16;
                self.set_header(addr, h);
                self.set_free_links(addr, next_links);
                self.free_fix_neighbours(addr);
                self.fix_next_prev_node(addr);
            }
            (Some(prev_addr), None) => {
                let mut ph = self.header(prev_addr);
                ph.size += header.size;
                self.set_header(prev_addr, ph);
                self.fix_next_prev_node(prev_addr);
            }
            (None, None) => {
                let mut h = header;
                h.kind = BlockKind::Free as u16;
                self.set_header(addr, h);
                self.free_insert_head(addr);
            }
        }
    }

    // -- diagnostics / property-test support -------------------------------

    /// Walk the arena in physical order, yielding every block.
    #[must_use]
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut cursor = Some(Vaddr::null());
        core::iter::from_fn(move || {
            let addr = cursor?;
            let h = self.header(addr);
            cursor = self.next_block(addr);
            Some(BlockInfo {
                addr,
                kind: BlockKind::from_u16(h.kind).unwrap_or(BlockKind::Empty),
                refcount: h.refcount,
                prev_node: if h.prev_node == NIL {
                    None
                } else {
                    Some(Vaddr::new(h.prev_node))
                },
                size: h.size,
            })
        })
    }

    /// Walk the free list, yielding the address of every free block.
    #[must_use]
    pub fn free_blocks(&self) -> impl Iterator<Item = Vaddr> + '_ {
        let mut cursor = self.first_free;
        core::iter::from_fn(move || {
            let addr = cursor?;
            let links = self.free_links(addr);
            cursor = if links.next_free == NIL {
                None
            } else {
                Some(Vaddr::new(links.next_free))
            };
            Some(addr)
        })
    }

    #[must_use]
    pub fn block_kind(&self, addr: Vaddr) -> Option<BlockKind> {
        BlockKind::from_u16(self.header(addr).kind)
    }

    #[must_use]
    pub fn refcount(&self, addr: Vaddr) -> u16 {
        self.header(addr).refcount
    }
}
