// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

use crate::values::{Time, Value, ValueRef};
use std::fmt::{Debug, Formatter};

/// A single transition, or the synthetic entry at the start of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change<'a> {
    pub time: Time,
    pub value: ValueRef<'a>,
}

/// Sparse, ordered list of value changes of one signal.
///
/// Invariants: times are strictly increasing and two consecutive entries never carry
/// the same value. Values are stored back to back, `width` bytes each.
#[derive(Clone, PartialEq, Eq)]
pub struct Timeline {
    width: u32,
    initial: Value,
    times: Vec<Time>,
    bits: Vec<u8>,
}

impl Debug for Timeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Timeline({} bits, {} changes)",
            self.width,
            self.times.len()
        )
    }
}

impl Timeline {
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Value in force before the first change.
    pub fn initial_value(&self) -> ValueRef<'_> {
        self.initial.as_value_ref()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[Time] {
        &self.times
    }

    #[inline]
    fn value_at_index(&self, index: usize) -> ValueRef<'_> {
        let width = self.width as usize;
        ValueRef::new(&self.bits[index * width..(index + 1) * width])
    }

    #[inline]
    fn change_at_index(&self, index: usize) -> Change<'_> {
        Change {
            time: self.times[index],
            value: self.value_at_index(index),
        }
    }

    /// Value of the latest change at or before `time`, or the initial value.
    pub fn value_at(&self, time: Time) -> ValueRef<'_> {
        match find_index_at_or_before(&self.times, time) {
            Some(index) => self.value_at_index(index),
            None => self.initial_value(),
        }
    }

    /// All changes in `[start, end)`, preceded by a synthetic entry that carries the value
    /// in force at `start`. A change exactly at `start` is represented by the synthetic entry.
    pub fn changes_in_range(&self, start: Time, end: Time) -> impl Iterator<Item = Change<'_>> + '_ {
        let synthetic = Change {
            time: start,
            value: self.value_at(start),
        };
        // first change strictly after start
        let first = match find_index_at_or_before(&self.times, start) {
            Some(index) => index + 1,
            None => 0,
        };
        std::iter::once(synthetic).chain(
            (first..self.times.len())
                .take_while(move |&ii| self.times[ii] < end)
                .map(move |ii| self.change_at_index(ii)),
        )
    }

    pub fn iter_changes(&self) -> impl Iterator<Item = Change<'_>> + '_ {
        (0..self.times.len()).map(move |ii| self.change_at_index(ii))
    }

    /// First change strictly after `time`.
    pub fn next_change_after(&self, time: Time) -> Option<Change<'_>> {
        let next = match find_index_at_or_before(&self.times, time) {
            Some(index) => index + 1,
            None => 0,
        };
        (next < self.times.len()).then(|| self.change_at_index(next))
    }

    /// Last change strictly before `time`.
    pub fn previous_change_before(&self, time: Time) -> Option<Change<'_>> {
        let time = time.checked_sub(1)?;
        find_index_at_or_before(&self.times, time).map(|index| self.change_at_index(index))
    }

    pub fn size_in_memory(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.times.len() * std::mem::size_of::<Time>()
            + self.bits.len()
            + self.initial.width() as usize
    }
}

/// Finds the index of the last entry that is the same or less than the needle.
/// Note that `times` needs to be sorted from smallest to largest.
#[inline]
fn find_index_at_or_before(times: &[Time], needle: Time) -> Option<usize> {
    match times.first() {
        None => None,
        Some(first) if *first > needle => None,
        _ => Some(binary_search(times, needle)),
    }
}

#[inline]
fn binary_search(times: &[Time], needle: Time) -> usize {
    debug_assert!(!times.is_empty(), "empty time table!");
    debug_assert!(times[0] <= needle);
    let mut lower_idx = 0usize;
    let mut upper_idx = times.len() - 1;
    while lower_idx <= upper_idx {
        let mid_idx = lower_idx + ((upper_idx - lower_idx) / 2);

        match times[mid_idx].cmp(&needle) {
            std::cmp::Ordering::Less => {
                lower_idx = mid_idx + 1;
            }
            std::cmp::Ordering::Equal => {
                return mid_idx;
            }
            std::cmp::Ordering::Greater => {
                // cannot underflow: times[0] <= needle
                upper_idx = mid_idx - 1;
            }
        }
    }
    lower_idx - 1
}

/// Drops the value that was just appended if it is the same as the one before it.
/// Returns true iff the value was kept.
#[inline]
fn check_if_changed_and_truncate(bytes_per_entry: usize, out: &mut Vec<u8>) -> bool {
    let changed = if out.len() < 2 * bytes_per_entry {
        true
    } else {
        let prev_start = out.len() - 2 * bytes_per_entry;
        let new_start = out.len() - bytes_per_entry;
        out[prev_start..new_start] != out[new_start..]
    };

    if !changed {
        // remove new value
        out.truncate(out.len() - bytes_per_entry);
    }

    changed
}

pub(crate) struct TimelineBuilder {
    width: u32,
    times: Vec<Time>,
    bits: Vec<u8>,
}

impl TimelineBuilder {
    pub(crate) fn new(width: u32) -> Self {
        Self {
            width,
            times: vec![],
            bits: vec![],
        }
    }

    /// Records a change. `value` must be normalized and exactly `width` bits long.
    /// Times must be non-decreasing; a second change at the same time replaces the first.
    pub(crate) fn add_change(&mut self, time: Time, value: &[u8]) {
        debug_assert_eq!(value.len(), self.width as usize);
        let width = self.width as usize;
        if let Some(&last) = self.times.last() {
            debug_assert!(last <= time);
            if last == time {
                self.times.pop();
                self.bits.truncate(self.bits.len() - width);
            }
        }
        self.bits.extend_from_slice(value);
        // see if there actually was a change and revert if there was not
        if check_if_changed_and_truncate(width, &mut self.bits) {
            self.times.push(time);
        }
    }

    pub(crate) fn finish(self) -> Timeline {
        debug_assert_eq!(self.bits.len(), self.times.len() * self.width as usize);
        Timeline {
            width: self.width,
            initial: Value::unknown(self.width),
            times: self.times,
            bits: self.bits,
        }
    }
}
