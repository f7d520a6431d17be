// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the operand stack's movable window.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

#[test]
fn push_pop_round_trips() {
    let mut s = Stack::new(8);
    s.push(NanBox::int(1)).unwrap();
    s.push(NanBox::int(2)).unwrap();
    assert_eq!(s.pop().unwrap().as_int(), Some(2));
    assert_eq!(s.pop().unwrap().as_int(), Some(1));
}

#[test]
fn pop_below_bottom_is_internal_error() {
    let mut s = Stack::new(4);
    assert_eq!(s.pop().unwrap_err(), FaultReason::InternalError);
}

#[test]
fn push_past_limit_overflows() {
    let mut s = Stack::new(2);
    s.push(NanBox::int(1)).unwrap();
    s.push(NanBox::int(2)).unwrap();
    assert_eq!(s.push(NanBox::int(3)).unwrap_err(), FaultReason::StackOverflow);
}

#[test]
fn peek_does_not_consume() {
    let mut s = Stack::new(4);
    s.push(NanBox::int(10)).unwrap();
    s.push(NanBox::int(20)).unwrap();
    assert_eq!(s.peek(0).unwrap().as_int(), Some(20));
    assert_eq!(s.peek(1).unwrap().as_int(), Some(10));
    assert_eq!(s.pop().unwrap().as_int(), Some(20));
}

#[test]
fn enter_carves_a_window_above_top_and_restore_gives_it_back() {
    let mut s = Stack::new(16);
    s.push(NanBox::int(1)).unwrap();
    let caller = s.enter(4).unwrap();
    assert_eq!(caller.bottom, 0);
    assert_eq!(caller.top, 1);
    assert_eq!(caller.limit, 16);

    s.push(NanBox::int(99)).unwrap();
    assert_eq!(s.pop().unwrap().as_int(), Some(99));

    s.restore(caller);
    assert_eq!(s.pop().unwrap().as_int(), Some(1));
}

#[test]
fn reset_window_reuses_bottom_for_tail_calls() {
    let mut s = Stack::new(16);
    let caller = s.enter(8).unwrap();
    s.push(NanBox::int(1)).unwrap();
    s.push(NanBox::int(2)).unwrap();
    s.reset_window(4).unwrap();
    assert_eq!(s.window().bottom, caller.top);
    assert_eq!(s.window().top, caller.top);
    assert_eq!(s.window().limit, caller.top + 4);
}

#[test]
fn drain_active_empties_the_current_window_only() {
    let mut s = Stack::new(16);
    s.push(NanBox::int(1)).unwrap();
    s.enter(4).unwrap();
    s.push(NanBox::int(2)).unwrap();
    s.push(NanBox::int(3)).unwrap();

    let drained: std::vec::Vec<_> = s.drain_active().map(|v| v.as_int()).collect();
    assert_eq!(drained, [Some(2), Some(3)]);
    assert_eq!(s.window().top, s.window().bottom);
}
