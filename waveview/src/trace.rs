// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

use crate::hierarchy::{Signal, SignalRef, SignalTable, Timescale};
use crate::timeline::{Change, Timeline};
use crate::values::{Time, ValueRef};
use crate::LoadWarning;

/// A fully indexed trace. Never modified after the loader hands it out.
#[derive(Debug)]
pub struct Trace {
    pub(crate) meta: TraceMeta,
    pub(crate) signals: SignalTable,
    pub(crate) timelines: Vec<Timeline>,
    pub(crate) end_time: Time,
    pub(crate) warnings: Vec<LoadWarning>,
    pub(crate) warning_count: usize,
    pub(crate) partial: bool,
}

/// Informational header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceMeta {
    pub timescale: Option<Timescale>,
    pub date: Option<String>,
    pub version: Option<String>,
    pub comments: Vec<String>,
}

impl Trace {
    pub fn timescale(&self) -> Option<Timescale> {
        self.meta.timescale
    }

    pub fn meta(&self) -> &TraceMeta {
        &self.meta
    }

    /// Last timestamp marker in the body, 0 if there was none.
    pub fn end_time(&self) -> Time {
        self.end_time
    }

    pub fn signal_table(&self) -> &SignalTable {
        &self.signals
    }

    /// All signals in declaration order.
    pub fn signals(&self) -> &[Signal] {
        self.signals.as_slice()
    }

    pub fn signal(&self, signal: SignalRef) -> Option<&Signal> {
        self.signals.get(signal)
    }

    pub fn signal_by_path(&self, path: &str) -> Option<SignalRef> {
        self.signals.lookup(path)
    }

    /// `None` iff the signal does not belong to this trace.
    pub fn timeline(&self, signal: SignalRef) -> Option<&Timeline> {
        let signal = self.signals.get(signal)?;
        self.timelines.get(signal.timeline_index())
    }

    /// Value of the signal at `time`. Times after the end of the trace return the last value.
    pub fn value_at(&self, signal: SignalRef, time: Time) -> Option<ValueRef<'_>> {
        self.timeline(signal).map(|t| t.value_at(time))
    }

    pub fn changes_in_range(
        &self,
        signal: SignalRef,
        start: Time,
        end: Time,
    ) -> Option<impl Iterator<Item = Change<'_>> + '_> {
        self.timeline(signal).map(|t| t.changes_in_range(start, end))
    }

    /// Warnings recorded during the load, up to the configured cap.
    pub fn warnings(&self) -> &[LoadWarning] {
        &self.warnings
    }

    /// Number of warnings including the ones that were not stored.
    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    /// `true` if the stream was interrupted and the trace only covers a prefix of it.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn size_in_memory(&self) -> usize {
        std::mem::size_of::<Self>() + self.timelines.iter().map(|t| t.size_in_memory()).sum::<usize>()
    }
}
