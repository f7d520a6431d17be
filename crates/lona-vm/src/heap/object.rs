// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Typed heap objects: environments, functions (closures), and call
//! frames. Each is a thin layout over [`Heap`]'s raw payload accessors —
//! there is no separate object abstraction on top of the arena, matching
//! how the allocator itself dispatches destruction by block kind.

#[cfg(test)]
mod object_test;

use super::{BlockKind, Heap};
use crate::types::Vaddr;
use crate::value::NanBox;
use crate::vm::FaultReason;

const NIL: u32 = u32::MAX;

// -- Environment --------------------------------------------------------
//
// Payload (after the 12-byte block header):
//   [0..4)  parent: Vaddr or NIL
//   [4..8)  entry_count: u32
//   [8..)   entry_count NanBox slots

const ENV_PARENT_OFFSET: u32 = 0;
const ENV_COUNT_OFFSET: u32 = 4;
const ENV_SLOTS_OFFSET: u32 = 8;

/// Allocate an environment of `n` `empty` slots, retaining `parent`.
pub fn env_new(heap: &mut Heap, parent: Option<Vaddr>, n: u32) -> Result<Vaddr, FaultReason> {
    let size = ENV_SLOTS_OFFSET + n * 4;
    let addr = heap.allocate(size, BlockKind::Environment)?;
    if let Some(p) = parent {
        heap.retain(p)?;
    }
    heap.write_u32(addr, ENV_PARENT_OFFSET, parent.map_or(NIL, Vaddr::as_u32));
    heap.write_u32(addr, ENV_COUNT_OFFSET, n);
    for i in 0..n {
        heap.write_box(addr, ENV_SLOTS_OFFSET + i * 4, NanBox::empty());
    }
    Ok(addr)
}

#[must_use]
pub fn env_entry_count(heap: &Heap, addr: Vaddr) -> u32 {
    heap.read_u32(addr, ENV_COUNT_OFFSET)
}

#[must_use]
pub fn env_parent(heap: &Heap, addr: Vaddr) -> Option<Vaddr> {
    let p = heap.read_u32(addr, ENV_PARENT_OFFSET);
    if p == NIL { None } else { Some(Vaddr::new(p)) }
}

/// Walk `k` parents up from `env`, or `None` if the chain is shorter.
#[must_use]
pub fn env_parent_k(heap: &Heap, env: Vaddr, k: u32) -> Option<Vaddr> {
    let mut cur = env;
    for _ in 0..k {
        cur = env_parent(heap, cur)?;
    }
    Some(cur)
}

/// Read slot `index`. Bounds-checked only when `safety_checks` is set;
/// an out-of-range read with checks disabled still stays within the
/// arena buffer (never a Rust memory-safety violation) but may read
/// another object's bytes.
pub fn env_get(
    heap: &Heap,
    addr: Vaddr,
    index: u32,
    safety_checks: bool,
) -> Result<NanBox, FaultReason> {
    if safety_checks && index >= env_entry_count(heap, addr) {
        return Err(FaultReason::InvalidLoad);
    }
    Ok(heap.read_box(addr, ENV_SLOTS_OFFSET + index * 4))
}

/// Release the slot's old value and store `value`, consuming its
/// ownership.
pub fn env_put(
    heap: &mut Heap,
    addr: Vaddr,
    index: u32,
    value: NanBox,
    safety_checks: bool,
) -> Result<(), FaultReason> {
    if safety_checks && index >= env_entry_count(heap, addr) {
        return Err(FaultReason::InvalidLoad);
    }
    let offset = ENV_SLOTS_OFFSET + index * 4;
    let old = heap.read_box(addr, offset);
    heap.release_box(old)?;
    heap.write_box(addr, offset, value);
    Ok(())
}

pub(super) fn destroy_environment(heap: &mut Heap, addr: Vaddr) -> Result<(), FaultReason> {
    let n = env_entry_count(heap, addr);
    for i in 0..n {
        let v = heap.read_box(addr, ENV_SLOTS_OFFSET + i * 4);
        heap.release_box(v)?;
    }
    if let Some(parent) = env_parent(heap, addr) {
        heap.release(parent)?;
    }
    Ok(())
}

// -- Function (closure) ---------------------------------------------------
//
// Payload:
//   [0..4)   code: byte offset of the first instruction in the image
//   [4..8)   num_args: u32
//   [8..12)  env_size: u32
//   [12..16) stack_size: u32
//   [16..20) env: Vaddr or NIL, the captured environment (owning)

const FN_CODE_OFFSET: u32 = 0;
const FN_NUM_ARGS_OFFSET: u32 = 4;
const FN_ENV_SIZE_OFFSET: u32 = 8;
const FN_STACK_SIZE_OFFSET: u32 = 12;
const FN_ENV_OFFSET: u32 = 16;
const FUNCTION_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy)]
pub struct FunctionMeta {
    pub code: u32,
    pub num_args: u32,
    pub env_size: u32,
    pub stack_size: u32,
}

/// Create a closure pairing `meta.code` with `captured_env`.
pub fn function_new(
    heap: &mut Heap,
    meta: FunctionMeta,
    captured_env: Option<Vaddr>,
) -> Result<Vaddr, FaultReason> {
    let addr = heap.allocate(FUNCTION_SIZE, BlockKind::Function)?;
    if let Some(e) = captured_env {
        heap.retain(e)?;
    }
    heap.write_u32(addr, FN_CODE_OFFSET, meta.code);
    heap.write_u32(addr, FN_NUM_ARGS_OFFSET, meta.num_args);
    heap.write_u32(addr, FN_ENV_SIZE_OFFSET, meta.env_size);
    heap.write_u32(addr, FN_STACK_SIZE_OFFSET, meta.stack_size);
    heap.write_u32(addr, FN_ENV_OFFSET, captured_env.map_or(NIL, Vaddr::as_u32));
    Ok(addr)
}

#[must_use]
pub fn function_meta(heap: &Heap, addr: Vaddr) -> FunctionMeta {
    FunctionMeta {
        code: heap.read_u32(addr, FN_CODE_OFFSET),
        num_args: heap.read_u32(addr, FN_NUM_ARGS_OFFSET),
        env_size: heap.read_u32(addr, FN_ENV_SIZE_OFFSET),
        stack_size: heap.read_u32(addr, FN_STACK_SIZE_OFFSET),
    }
}

#[must_use]
pub fn function_env(heap: &Heap, addr: Vaddr) -> Option<Vaddr> {
    let e = heap.read_u32(addr, FN_ENV_OFFSET);
    if e == NIL { None } else { Some(Vaddr::new(e)) }
}

pub(super) fn destroy_function(heap: &mut Heap, addr: Vaddr) -> Result<(), FaultReason> {
    if let Some(env) = function_env(heap, addr) {
        heap.release(env)?;
    }
    Ok(())
}

// -- Frame ----------------------------------------------------------------
//
// Payload:
//   [0..4)   return_pc: byte offset, or NIL to mean "terminate"
//   [4..8)   saved_env: Vaddr or NIL (non-owning snapshot)
//   [8..12)  saved_bottom
//   [12..16) saved_top
//   [16..20) saved_limit

const FRAME_RETURN_PC_OFFSET: u32 = 0;
const FRAME_SAVED_ENV_OFFSET: u32 = 4;
const FRAME_SAVED_BOTTOM_OFFSET: u32 = 8;
const FRAME_SAVED_TOP_OFFSET: u32 = 12;
const FRAME_SAVED_LIMIT_OFFSET: u32 = 16;
const FRAME_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy)]
pub struct SavedFrame {
    pub return_pc: Option<u32>,
    pub saved_env: Option<Vaddr>,
    pub bottom: u32,
    pub top: u32,
    pub limit: u32,
}

/// Allocate a frame recording the caller's state. `saved_env` is stored
/// without retaining it — frames own nothing, per the acyclic ownership
/// rule that environments/closures are the only owning references.
pub fn frame_new(heap: &mut Heap, saved: SavedFrame) -> Result<Vaddr, FaultReason> {
    let addr = heap.allocate(FRAME_SIZE, BlockKind::Frame)?;
    heap.write_u32(addr, FRAME_RETURN_PC_OFFSET, saved.return_pc.unwrap_or(NIL));
    heap.write_u32(
        addr,
        FRAME_SAVED_ENV_OFFSET,
        saved.saved_env.map_or(NIL, Vaddr::as_u32),
    );
    heap.write_u32(addr, FRAME_SAVED_BOTTOM_OFFSET, saved.bottom);
    heap.write_u32(addr, FRAME_SAVED_TOP_OFFSET, saved.top);
    heap.write_u32(addr, FRAME_SAVED_LIMIT_OFFSET, saved.limit);
    Ok(addr)
}

#[must_use]
pub fn frame_read(heap: &Heap, addr: Vaddr) -> SavedFrame {
    let return_pc = heap.read_u32(addr, FRAME_RETURN_PC_OFFSET);
    let saved_env = heap.read_u32(addr, FRAME_SAVED_ENV_OFFSET);
    SavedFrame {
        return_pc: if return_pc == NIL {
            None
        } else {
            Some(return_pc)
        },
        saved_env: if saved_env == NIL {
            None
        } else {
            Some(Vaddr::new(saved_env))
        },
        bottom: heap.read_u32(addr, FRAME_SAVED_BOTTOM_OFFSET),
        top: heap.read_u32(addr, FRAME_SAVED_TOP_OFFSET),
        limit: heap.read_u32(addr, FRAME_SAVED_LIMIT_OFFSET),
    }
}
