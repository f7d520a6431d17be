// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Heap address type.
//!
//! An offset into the arena, as opposed to a host pointer. Using a newtype
//! prevents mixing a raw byte offset with an unrelated integer.

// Address arithmetic stays within a single u32 byte offset throughout;
// the one narrowing cast (`as usize` for slice indexing) never loses bits
// on the 32-bit-and-wider targets this VM runs on.
#![allow(clippy::cast_possible_truncation)]

use core::fmt;
use core::ops::{Add, Sub};

/// A byte offset into the heap arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Vaddr(u32);

impl Vaddr {
    /// Create a new arena address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// The address of the first byte of the arena.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Add an offset to this address.
    #[inline]
    #[must_use]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Subtract an offset from this address.
    #[inline]
    #[must_use]
    pub const fn sub(self, offset: u32) -> Self {
        Self(self.0.wrapping_sub(offset))
    }

    /// Calculate the difference between two addresses.
    #[inline]
    #[must_use]
    pub const fn diff(self, other: Self) -> u32 {
        self.0.wrapping_sub(other.0)
    }
}

impl fmt::Debug for Vaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vaddr({:#x})", self.0)
    }
}

impl fmt::Display for Vaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for Vaddr {
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

impl Add<u32> for Vaddr {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        self.add(rhs)
    }
}

impl Sub<u32> for Vaddr {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self::Output {
        self.sub(rhs)
    }
}
