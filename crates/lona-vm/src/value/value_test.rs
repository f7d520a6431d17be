// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the NaN-boxed value encoding.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{INTMAX, INTMIN, Kind, NanBox};
use crate::types::Vaddr;

#[test]
fn int_round_trip_bounds() {
    for v in [INTMIN, INTMIN + 1, -1, 0, 1, 42, INTMAX - 1, INTMAX] {
        let boxed = NanBox::int(v);
        assert!(boxed.is_integer());
        assert_eq!(boxed.as_int(), Some(v));
    }
}

#[test]
fn float_round_trip_finite() {
    for v in [0.0f32, -0.0, 1.5, -1.5, f32::MAX, f32::MIN, 1e-30] {
        let boxed = NanBox::float(v);
        assert!(boxed.is_float());
        assert_eq!(boxed.as_float_unchecked().to_bits(), v.to_bits());
    }
}

#[test]
fn float_round_trip_infinity() {
    let boxed = NanBox::float(f32::INFINITY);
    assert!(boxed.is_float());
    assert_eq!(boxed.as_float_unchecked(), f32::INFINITY);

    let boxed = NanBox::float(f32::NEG_INFINITY);
    assert!(boxed.is_float());
    assert_eq!(boxed.as_float_unchecked(), f32::NEG_INFINITY);
}

#[test]
fn nan_is_canonicalized_and_unequal_to_itself() {
    let a = NanBox::float(f32::NAN);
    let b = NanBox::float(-f32::NAN);
    assert!(a.is_float());
    assert!(a.is_canonical_nan());
    assert!(b.is_canonical_nan());
    assert!(a.identical(b));
    // The dispatcher's `=` treats two canonical NaNs as unequal even
    // though they are bit-identical; NanBox itself exposes the hook via
    // `is_canonical_nan` rather than a misleading `PartialEq` impl.
    assert!(!(a.identical(b) && !a.is_canonical_nan()));
}

#[test]
fn boolean_round_trip() {
    assert_eq!(NanBox::boolean(true).as_bool(), Some(true));
    assert_eq!(NanBox::boolean(false).as_bool(), Some(false));
}

#[test]
fn singletons_have_distinct_kinds() {
    assert_eq!(NanBox::null().kind(), Kind::Null);
    assert_eq!(NanBox::undefined().kind(), Kind::Undefined);
    assert_eq!(NanBox::empty().kind(), Kind::Empty);
    assert!(NanBox::null().is_null());
    assert!(NanBox::undefined().is_undefined());
    assert!(NanBox::empty().is_empty());
}

#[test]
fn pointer_round_trip() {
    let addr = Vaddr::new(0x1234);
    let boxed = NanBox::pointer(addr);
    assert!(boxed.is_pointer());
    assert_eq!(boxed.as_pointer(), Some(addr));
}

#[test]
fn type_predicates_partition_value_space() {
    let values = [
        NanBox::int(7),
        NanBox::float(3.5),
        NanBox::boolean(true),
        NanBox::null(),
        NanBox::undefined(),
        NanBox::empty(),
        NanBox::pointer(Vaddr::new(16)),
    ];
    for v in values {
        let predicates = [
            v.is_integer(),
            v.is_float(),
            v.is_boolean(),
            v.is_null(),
            v.is_undefined(),
            v.is_empty(),
            v.is_pointer(),
        ];
        assert_eq!(predicates.iter().filter(|p| **p).count(), 1);
    }
}

#[test]
fn widening_to_f32_works_for_int_and_float() {
    assert_eq!(NanBox::int(5).to_f32(), Some(5.0));
    assert_eq!(NanBox::float(5.5).to_f32(), Some(5.5));
    assert_eq!(NanBox::boolean(true).to_f32(), None);
}
