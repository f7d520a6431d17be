// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Core type definitions for the VM.
//!
//! Using newtypes around a plain `u32` offset prevents mixing an arena
//! address with an unrelated integer at compile time.


mod address;

pub use address::Vaddr;
