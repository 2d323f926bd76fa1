// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

//! Turns the visible part of a trace into drawable geometry.

use crate::config::RenderConfig;
use crate::hierarchy::SignalRef;
use crate::trace::Trace;
use crate::values::{BusFormat, Value};
use crate::viewport::Viewport;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// The signal holds `value` from `x0` to `x1`.
    Run {
        signal: SignalRef,
        value: Value,
        x0: f64,
        x1: f64,
    },
    /// Transition at `x`.
    Edge { signal: SignalRef, x: f64 },
    /// Formatted bus value that fits between `x0` and `x1`.
    BusLabel {
        signal: SignalRef,
        text: String,
        x0: f64,
        x1: f64,
    },
}

/// Geometry of one signal row.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSegments {
    pub signal: SignalRef,
    pub segments: Vec<Segment>,
}

impl SignalSegments {
    pub fn runs(&self) -> impl Iterator<Item = &Segment> {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Run { .. }))
    }

    pub fn edges(&self) -> impl Iterator<Item = f64> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Edge { x, .. } => Some(*x),
            _ => None,
        })
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::BusLabel { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Per signal bus format, signals without an entry use `default_format`.
    pub formats: FxHashMap<SignalRef, BusFormat>,
    pub default_format: BusFormat,
    pub min_label_px: f64,
    pub multi_thread: bool,
    pub parallel_threshold: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from_config(&RenderConfig::default())
    }
}

impl RenderOptions {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            formats: FxHashMap::default(),
            default_format: config.default_format,
            min_label_px: config.min_label_px,
            multi_thread: config.multi_thread,
            parallel_threshold: config.parallel_threshold,
        }
    }

    pub fn format_of(&self, signal: SignalRef) -> BusFormat {
        self.formats
            .get(&signal)
            .copied()
            .unwrap_or(self.default_format)
    }
}

/// Computes the segments of every requested signal inside the viewport.
/// The output has one entry per requested signal, in the same order. Signals that do not
/// belong to the trace come back without segments.
pub fn render(
    trace: &Trace,
    signals: &[SignalRef],
    viewport: &Viewport,
    options: &RenderOptions,
) -> Vec<SignalSegments> {
    if options.multi_thread && signals.len() > options.parallel_threshold {
        signals
            .par_iter()
            .map(|s| render_signal(trace, *s, viewport, options))
            .collect()
    } else {
        signals
            .iter()
            .map(|s| render_signal(trace, *s, viewport, options))
            .collect()
    }
}

fn render_signal(
    trace: &Trace,
    signal: SignalRef,
    viewport: &Viewport,
    options: &RenderOptions,
) -> SignalSegments {
    let mut segments = Vec::new();
    let (Some(info), Some(timeline)) = (trace.signal(signal), trace.timeline(signal)) else {
        return SignalSegments { signal, segments };
    };
    let is_bus = info.is_bus();
    let format = options.format_of(signal);

    let (t0, t1) = viewport.time_range();
    let mut changes = timeline.changes_in_range(t0, t1).peekable();
    let mut is_first = true;
    while let Some(change) = changes.next() {
        let start = (change.time as f64).max(viewport.start());
        let end = match changes.peek() {
            Some(next) => (next.time as f64).min(viewport.end()),
            None => viewport.end(),
        };
        let x0 = viewport.pixel_of(start);
        let x1 = viewport.pixel_of(end);

        // the first entry carries the value at the left border, it is not a transition
        if !is_first {
            segments.push(Segment::Edge { signal, x: x0 });
        }
        is_first = false;

        if x1 <= x0 {
            continue;
        }
        segments.push(Segment::Run {
            signal,
            value: change.value.to_value(),
            x0,
            x1,
        });
        if is_bus && x1 - x0 > options.min_label_px {
            segments.push(Segment::BusLabel {
                signal,
                text: change.value.format(format),
                x0,
                x1,
            });
        }
    }

    SignalSegments { signal, segments }
}
