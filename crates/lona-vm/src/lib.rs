// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # nanvm
//!
//! Execution core for a small NaN-boxed bytecode virtual machine targeting
//! constrained microcontrollers: a tagged 32-bit value encoding, a
//! free-list heap arena with reference counting, the environment/closure/
//! frame objects that live on that arena, a movable-window operand stack,
//! and the instruction dispatch loop including tail-call frame reuse.
//!
//! Loading bytecode from disk, a CLI, and host integration are outside
//! this crate's scope; [`loader`] only validates and indexes an in-memory
//! image handed to it.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(not(any(test, feature = "std")))]
extern crate alloc;

pub mod bytecode;
pub mod heap;
pub mod loader;
pub mod stack;
pub mod types;
pub mod value;
pub mod vm;

pub use types::Vaddr;
pub use value::NanBox;
pub use vm::{FaultReason, VmConfig, run, run_with_config};

/// Crate version.
pub const VERSION: &str = match option_env!("CARGO_PKG_VERSION") {
    Some(v) => v,
    None => "unknown",
};
