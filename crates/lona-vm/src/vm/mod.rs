// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The dispatch loop: fetch-decode-execute over a loaded bytecode image,
//! driving the heap allocator and operand stack.

// Operand decoding reinterprets fixed-width image bytes (u32 -> i32) and
// narrows already-bounded counts (num_args fits u8, loop indices fit
// num_args); none of these lose information in practice.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]


#[cfg(any(test, feature = "std"))]
use std::vec::Vec;

#[cfg(not(any(test, feature = "std")))]
use alloc::vec::Vec;

use crate::bytecode::op;
use crate::heap::object::{self, FunctionMeta, SavedFrame};
use crate::heap::Heap;
use crate::loader::Image;
use crate::stack::{Stack, Window};
use crate::types::Vaddr;
use crate::value::NanBox;

/// Everything that can halt the interpreter loop other than a normal
/// `ret` out of the outermost frame. Division by zero is deliberately
/// absent: it is a numeric result (`inf`/`nan`), not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// The heap arena has no block large enough to satisfy an allocation.
    OutOfMemory,
    /// The operand stack's current window is full.
    StackOverflow,
    /// An instruction was applied to a value of the wrong kind.
    Type,
    /// A local or parent-environment load/store index was out of range.
    InvalidLoad,
    /// The bytecode image is malformed, truncated, the program counter
    /// left the code region, or a reserved/unknown opcode was reached.
    InvalidProgram,
    /// A heap refcount under/overflowed, or another internal invariant of
    /// the allocator broke. Never caused directly by program bytecode.
    InternalError,
    /// Reserved for hosts that want to fault on reading an `empty` slot;
    /// the default dispatch loop returns `empty` instead of raising this.
    UninitializedLoad,
}

impl core::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::OutOfMemory => "out of memory",
            Self::StackOverflow => "stack overflow",
            Self::Type => "type fault",
            Self::InvalidLoad => "invalid load",
            Self::InvalidProgram => "invalid program",
            Self::InternalError => "internal error",
            Self::UninitializedLoad => "uninitialized load",
        };
        f.write_str(s)
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for FaultReason {}

/// Knobs the host can tune before calling [`run_with_config`].
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Size in bytes of the heap arena.
    pub heap_size: u32,
    /// Number of operand-stack slots, shared across all active windows.
    pub stack_entries: u32,
    /// Whether `ldl`/`stl`/`ldp`/`stp` bounds-check their indices against
    /// the environment's recorded size. Disabling trades safety for speed
    /// on bytecode that is already known-good.
    pub safety_checks: bool,
    /// `0` disables tracing. Higher values emit progressively more detail
    /// via `eprintln!` (only available under the `std` feature).
    pub debug_level: u8,
}

impl VmConfig {
    /// Matches `sinter`'s reference defaults: a 64 KiB heap and 512
    /// operand-stack entries.
    pub const DEFAULT: Self = Self {
        heap_size: 64 * 1024,
        stack_entries: 512,
        safety_checks: true,
        debug_level: 0,
    };
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

macro_rules! trace {
    ($vm:expr, $lvl:expr, $($arg:tt)*) => {
        #[cfg(feature = "std")]
        if $vm.config.debug_level >= $lvl {
            std::eprintln!($($arg)*);
        }
    };
}

struct Vm<'a> {
    image: Image<'a>,
    heap: Heap,
    stack: Stack,
    env: Option<Vaddr>,
    pc: u32,
    /// Addresses of the `Frame` objects for every pending (non-tail) call,
    /// outermost first. A tail call reuses the top of this stack instead
    /// of pushing a new frame, which is what keeps tail recursion at O(1)
    /// frames: see `call` below.
    frames: Vec<Vaddr>,
    config: VmConfig,
}

/// Run `code`, a validated bytecode image, to completion with the default
/// configuration.
pub fn run(code: &[u8]) -> Result<NanBox, FaultReason> {
    run_with_config(code, VmConfig::DEFAULT)
}

/// Run `code` with a caller-supplied [`VmConfig`].
pub fn run_with_config(code: &[u8], config: VmConfig) -> Result<NanBox, FaultReason> {
    let image = Image::load(code)?;
    let entry = image.entry_offset();
    let mut vm = Vm {
        image,
        heap: Heap::new(config.heap_size),
        stack: Stack::new(config.stack_entries),
        env: None,
        pc: entry,
        frames: Vec::new(),
        config,
    };
    vm.dispatch()
}

impl Vm<'_> {
    fn fetch_u8(&mut self) -> Result<u8, FaultReason> {
        let b = self.image.byte(self.pc)?;
        self.pc = self.pc.checked_add(1).ok_or(FaultReason::InvalidProgram)?;
        Ok(b)
    }

    fn fetch_u16(&mut self) -> Result<u16, FaultReason> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn fetch_u32(&mut self) -> Result<u32, FaultReason> {
        let b0 = self.fetch_u8()?;
        let b1 = self.fetch_u8()?;
        let b2 = self.fetch_u8()?;
        let b3 = self.fetch_u8()?;
        Ok(u32::from_le_bytes([b0, b1, b2, b3]))
    }

    fn fetch_i32(&mut self) -> Result<i32, FaultReason> {
        self.fetch_u32().map(|v| v as i32)
    }

    fn fetch_f32(&mut self) -> Result<f32, FaultReason> {
        self.fetch_u32().map(f32::from_bits)
    }

    fn fetch_f64(&mut self) -> Result<f64, FaultReason> {
        let b0 = self.fetch_u8()?;
        let b1 = self.fetch_u8()?;
        let b2 = self.fetch_u8()?;
        let b3 = self.fetch_u8()?;
        let b4 = self.fetch_u8()?;
        let b5 = self.fetch_u8()?;
        let b6 = self.fetch_u8()?;
        let b7 = self.fetch_u8()?;
        Ok(f64::from_bits(u64::from_le_bytes([
            b0, b1, b2, b3, b4, b5, b6, b7,
        ])))
    }

    fn current_env(&self) -> Result<Vaddr, FaultReason> {
        self.env.ok_or(FaultReason::InternalError)
    }

    /// Resolve a `br`/`br_t`/`br_f` operand: a signed offset added to the
    /// address immediately after the instruction (`jmp` alone is absolute).
    fn branch_target(&self, offset: i32) -> Result<u32, FaultReason> {
        let target = i64::from(self.pc)
            .checked_add(i64::from(offset))
            .ok_or(FaultReason::InvalidProgram)?;
        u32::try_from(target).map_err(|_| FaultReason::InvalidProgram)
    }

    /// The interpreter loop. Returns the final popped value once the
    /// outermost frame performs a `ret`.
    fn dispatch(&mut self) -> Result<NanBox, FaultReason> {
        loop {
            let opcode = self.fetch_u8()?;
            trace!(self, 2, "pc={} op={}", self.pc - 1, op::name(opcode));

            if op::is_reserved(opcode) {
                return Err(FaultReason::InvalidProgram);
            }

            match opcode {
                op::NOP => {}

                op::LDC_INT => {
                    let v = self.fetch_i32()?;
                    self.stack.push(NanBox::int(v))?;
                }
                op::LDC_F32 => {
                    let v = self.fetch_f32()?;
                    self.stack.push(NanBox::float(v))?;
                }
                op::LDC_F64 => {
                    let v = self.fetch_f64()?;
                    self.stack.push(NanBox::float(v as f32))?;
                }
                op::LDC_BOOL_T => self.stack.push(NanBox::boolean(true))?,
                op::LDC_BOOL_F => self.stack.push(NanBox::boolean(false))?,
                op::LDC_NULL => self.stack.push(NanBox::null())?,
                op::LDC_UNDEF => self.stack.push(NanBox::undefined())?,

                op::POP => {
                    let v = self.stack.pop()?;
                    self.heap.release_box(v)?;
                }

                op::ADD => self.arith(|a, b| a + b, |a, b| a.checked_add(b))?,
                op::SUB => self.arith(|a, b| a - b, |a, b| a.checked_sub(b))?,
                op::MUL => self.arith(|a, b| a * b, |a, b| a.checked_mul(b))?,
                op::DIV => self.arith_float_only(|a, b| a / b)?,
                op::MOD => self.arith_float_only(|a, b| a % b)?,

                op::NOT => {
                    let v = self.stack.pop()?;
                    let b = v.as_bool().ok_or(FaultReason::Type)?;
                    self.stack.push(NanBox::boolean(!b))?;
                }

                op::LT => self.compare(|a, b| a < b)?,
                op::GT => self.compare(|a, b| a > b)?,
                op::LE => self.compare(|a, b| a <= b)?,
                op::GE => self.compare(|a, b| a >= b)?,
                op::EQ => self.equality()?,

                op::NEW_C => self.new_closure()?,

                op::LDL => {
                    let index = u32::from(self.fetch_u16()?);
                    let env = self.current_env()?;
                    let v = object::env_get(&self.heap, env, index, self.config.safety_checks)?;
                    self.heap.retain_box(v)?;
                    self.stack.push(v)?;
                }
                op::STL => {
                    let index = u32::from(self.fetch_u16()?);
                    let env = self.current_env()?;
                    let v = self.stack.pop()?;
                    object::env_put(&mut self.heap, env, index, v, self.config.safety_checks)?;
                }
                op::LDP => {
                    let depth = u32::from(self.fetch_u16()?);
                    let index = u32::from(self.fetch_u16()?);
                    let env = self.current_env()?;
                    let parent = object::env_parent_k(&self.heap, env, depth)
                        .ok_or(FaultReason::InvalidLoad)?;
                    let v =
                        object::env_get(&self.heap, parent, index, self.config.safety_checks)?;
                    self.heap.retain_box(v)?;
                    self.stack.push(v)?;
                }
                op::STP => {
                    let depth = u32::from(self.fetch_u16()?);
                    let index = u32::from(self.fetch_u16()?);
                    let env = self.current_env()?;
                    let parent = object::env_parent_k(&self.heap, env, depth)
                        .ok_or(FaultReason::InvalidLoad)?;
                    let v = self.stack.pop()?;
                    object::env_put(&mut self.heap, parent, index, v, self.config.safety_checks)?;
                }

                op::BR => {
                    let offset = self.fetch_i32()?;
                    self.pc = self.branch_target(offset)?;
                }
                op::BR_T => {
                    let offset = self.fetch_i32()?;
                    let cond = self.stack.pop()?;
                    let b = cond.as_bool().ok_or(FaultReason::Type)?;
                    if b {
                        self.pc = self.branch_target(offset)?;
                    }
                }
                op::BR_F => {
                    let offset = self.fetch_i32()?;
                    let cond = self.stack.pop()?;
                    let b = cond.as_bool().ok_or(FaultReason::Type)?;
                    if !b {
                        self.pc = self.branch_target(offset)?;
                    }
                }
                op::JMP => {
                    let target = self.fetch_u32()?;
                    self.pc = target;
                }

                op::CALL => self.call(false)?,
                op::CALL_T => self.call(true)?,

                op::RET => {
                    if let Some(v) = self.ret()? {
                        return Ok(v);
                    }
                }
                op::RET_U => {
                    self.stack.push(NanBox::undefined())?;
                    if let Some(v) = self.ret()? {
                        return Ok(v);
                    }
                }
                op::RET_N => {
                    self.stack.push(NanBox::null())?;
                    if let Some(v) = self.ret()? {
                        return Ok(v);
                    }
                }

                op::NEWENV => {
                    let n = u32::from(self.fetch_u16()?);
                    let parent = self.env;
                    let addr = object::env_new(&mut self.heap, parent, n)?;
                    self.env = Some(addr);
                }
                op::POPENV => {
                    let env = self.current_env()?;
                    let parent = object::env_parent(&self.heap, env);
                    self.heap.release(env)?;
                    self.env = parent;
                }

                _ => return Err(FaultReason::InvalidProgram),
            }
        }
    }

    /// Binary arithmetic with int/float widening: int-op-int stays integer
    /// unless it overflows 21 bits, in which case (and whenever either
    /// operand is already a float) the result widens to `f32`.
    fn arith(
        &mut self,
        float_op: impl Fn(f32, f32) -> f32,
        int_op: impl Fn(i32, i32) -> Option<i32>,
    ) -> Result<(), FaultReason> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        if !a.is_numeric() || !b.is_numeric() {
            return Err(FaultReason::Type);
        }
        let result = match (a.as_int(), b.as_int()) {
            (Some(ai), Some(bi)) => match int_op(ai, bi) {
                Some(r) if (crate::value::INTMIN..=crate::value::INTMAX).contains(&r) => {
                    NanBox::int(r)
                }
                _ => NanBox::float(float_op(
                    a.to_f32().ok_or(FaultReason::Type)?,
                    b.to_f32().ok_or(FaultReason::Type)?,
                )),
            },
            _ => NanBox::float(float_op(
                a.to_f32().ok_or(FaultReason::Type)?,
                b.to_f32().ok_or(FaultReason::Type)?,
            )),
        };
        self.stack.push(result)
    }

    /// `div`/`mod`: always widen to float, even for two integers, since the
    /// result is not generally an integer. Division by zero is not a
    /// fault; it yields `inf`/`nan` like any other float division.
    fn arith_float_only(&mut self, float_op: impl Fn(f32, f32) -> f32) -> Result<(), FaultReason> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        let af = a.to_f32().ok_or(FaultReason::Type)?;
        let bf = b.to_f32().ok_or(FaultReason::Type)?;
        self.stack.push(NanBox::float(float_op(af, bf)))
    }

    fn compare(&mut self, cmp: impl Fn(f32, f32) -> bool) -> Result<(), FaultReason> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        let af = a.to_f32().ok_or(FaultReason::Type)?;
        let bf = b.to_f32().ok_or(FaultReason::Type)?;
        self.stack.push(NanBox::boolean(cmp(af, bf)))
    }

    /// `=`: bitwise identity (with two canonical NaNs excepted — they are
    /// bit-identical but must still compare unequal), falling back to a
    /// widened numeric comparison for mixed int/float operands. Mixed
    /// non-numeric kinds are unequal.
    #[allow(
        clippy::float_cmp,
        reason = "int/float widening is exact for the VM's 21-bit integer range; this is an identity check, not an approximation"
    )]
    fn equality(&mut self) -> Result<(), FaultReason> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        let eq = if a.identical(b) && !a.is_canonical_nan() {
            true
        } else if a.is_numeric() && b.is_numeric() {
            let af = a.to_f32().ok_or(FaultReason::Type)?;
            let bf = b.to_f32().ok_or(FaultReason::Type)?;
            af == bf
        } else {
            false
        };
        self.heap.release_box(a)?;
        self.heap.release_box(b)?;
        self.stack.push(NanBox::boolean(eq))
    }

    /// `new_c`: build a closure over the function record at the operand's
    /// code offset, capturing the current environment.
    fn new_closure(&mut self) -> Result<(), FaultReason> {
        let code_offset = self.fetch_u32()?;
        let record = self.image.function_record(code_offset)?;
        let meta = FunctionMeta {
            code: record.code_start,
            num_args: u32::from(record.num_args),
            env_size: u32::from(record.env_size),
            stack_size: u32::from(record.stack_size),
        };
        let f = object::function_new(&mut self.heap, meta, self.env)?;
        self.stack.push(NanBox::pointer(f))?;
        Ok(())
    }

    /// Apply a closure. The call arity operand `n` counts the argument
    /// values on top of the stack; the closure itself sits `n` deep, below
    /// all of them. Peek it there, build the callee's fresh environment
    /// over its captured one, pop `min(n, declared_num_args)` arguments
    /// into that environment's leading slots (discarding any excess, and
    /// leaving any shortfall `empty`), carve the callee's operand-stack
    /// window, and either push a new frame (`call`) or reuse the current
    /// one in place (`call_t`), which is what keeps tail recursion at
    /// O(1) frames.
    fn call(&mut self, tail: bool) -> Result<(), FaultReason> {
        let n = u32::from(self.fetch_u8()?);
        let closure_box = self.stack.peek(n)?;
        let f = closure_box.as_pointer().ok_or(FaultReason::Type)?;
        let meta = object::function_meta(&self.heap, f);
        let captured_env = object::function_env(&self.heap, f);

        let used = n.min(meta.num_args);
        if n != meta.num_args {
            trace!(
                self,
                1,
                "call arity {} does not match declared {} (using {})",
                n,
                meta.num_args,
                used
            );
        }
        for _ in 0..(n - used) {
            let extra = self.stack.pop()?;
            self.heap.release_box(extra)?;
        }
        let mut args = Vec::with_capacity(used as usize);
        for _ in 0..used {
            args.push(self.stack.pop()?);
        }
        args.reverse();

        let closure = self.stack.pop()?;
        self.heap.release_box(closure)?;

        let callee_env = object::env_new(&mut self.heap, captured_env, meta.env_size)?;
        for (i, v) in args.into_iter().enumerate() {
            object::env_put(&mut self.heap, callee_env, i as u32, v, false)?;
        }

        if tail {
            // Reuse the existing frame's window: only the environment and
            // program counter change, so the caller's saved state (and
            // the pending frame stack) stays exactly as it was. Any
            // operands left over from evaluating the call itself are
            // dropped before the window is resized for the callee.
            for leftover in self.stack.drain_active() {
                self.heap.release_box(leftover)?;
            }
            self.stack.reset_window(meta.stack_size)?;
            let old_env = self.env.replace(callee_env);
            if let Some(env) = old_env {
                self.heap.release(env)?;
            }
        } else {
            let caller_window = self.stack.enter(meta.stack_size)?;
            let return_pc = self.pc;
            let caller_env = self.env.replace(callee_env);
            let saved = SavedFrame {
                return_pc: Some(return_pc),
                saved_env: caller_env,
                bottom: caller_window.bottom,
                top: caller_window.top,
                limit: caller_window.limit,
            };
            let frame = object::frame_new(&mut self.heap, saved)?;
            self.frames.push(frame);
        }
        self.pc = meta.code;
        Ok(())
    }

    /// `ret`/`ret_u`/`ret_n`: pop the result, tear down the callee's
    /// environment and operand window, and either resume the caller or
    /// (if this was the outermost frame) hand the result back to `run`.
    fn ret(&mut self) -> Result<Option<NanBox>, FaultReason> {
        let result = self.stack.pop()?;
        for leftover in self.stack.drain_active() {
            self.heap.release_box(leftover)?;
        }
        if let Some(env) = self.env.take() {
            self.heap.release(env)?;
        }

        match self.frames.pop() {
            None => Ok(Some(result)),
            Some(frame) => {
                let saved = object::frame_read(&self.heap, frame);
                self.heap.release(frame)?;
                self.stack.restore(Window {
                    bottom: saved.bottom,
                    top: saved.top,
                    limit: saved.limit,
                });
                self.env = saved.saved_env;
                self.pc = saved.return_pc.ok_or(FaultReason::InternalError)?;
                self.stack.push(result)?;
                Ok(None)
            }
        }
    }
}
