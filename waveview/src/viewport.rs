// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

//! Visible time window and cursor.
//!
//! All inputs are clamped silently: the visible window always lies within
//! `[0, end time]` and the cursor always sits on a snapped time inside the trace.

use crate::config::ViewportConfig;
use crate::values::Time;

/// The visible window of a trace, in fractional time units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    start: f64,
    end: f64,
    pixel_width: f64,
}

impl Viewport {
    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn span(&self) -> f64 {
        self.end - self.start
    }

    pub fn pixel_width(&self) -> f64 {
        self.pixel_width
    }

    pub fn pixels_per_unit(&self) -> f64 {
        self.pixel_width / self.span()
    }

    /// Horizontal pixel position of a time. Values outside the window map outside
    /// `[0, pixel_width]`.
    #[inline]
    pub fn pixel_of(&self, time: f64) -> f64 {
        (time - self.start) * self.pixels_per_unit()
    }

    #[inline]
    pub fn time_at(&self, x: f64) -> f64 {
        self.start + x / self.pixels_per_unit()
    }

    /// Smallest integer time range `[start, end)` that covers the window.
    pub fn time_range(&self) -> (Time, Time) {
        let start = self.start.floor().max(0.0) as Time;
        let end = self.end.ceil().max(0.0) as Time;
        if end > start {
            (start, end)
        } else {
            (start, start + 1)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewportController {
    viewport: Viewport,
    cursor: Time,
    end_time: Time,
    snap: Time,
    max_pixels_per_unit: f64,
}

impl ViewportController {
    pub fn new(config: &ViewportConfig) -> Self {
        let defaults = ViewportConfig::default();
        let positive_or = |value: f64, default: f64| {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                default
            }
        };
        let pixel_width = positive_or(config.pixel_width, defaults.pixel_width);
        let max_pixels_per_unit =
            positive_or(config.max_pixels_per_unit, defaults.max_pixels_per_unit);
        let mut out = Self {
            viewport: Viewport {
                start: 0.0,
                end: 1.0,
                pixel_width,
            },
            cursor: 0,
            end_time: 0,
            snap: config.snap.max(1),
            max_pixels_per_unit,
        };
        out.fit_to_trace();
        out
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn cursor(&self) -> Time {
        self.cursor
    }

    pub fn end_time(&self) -> Time {
        self.end_time
    }

    /// Length of the time axis. A trace that ends at 0 still gets one time unit.
    fn trace_span(&self) -> f64 {
        self.end_time.max(1) as f64
    }

    /// Narrowest window we allow, bounded by the trace length.
    pub fn min_span(&self) -> f64 {
        (self.viewport.pixel_width / self.max_pixels_per_unit).min(self.trace_span())
    }

    /// Called whenever another trace is displayed.
    pub fn reset(&mut self, end_time: Time) {
        self.end_time = end_time;
        self.cursor = 0;
        self.fit_to_trace();
    }

    pub fn fit_to_trace(&mut self) {
        self.viewport.start = 0.0;
        self.viewport.end = self.trace_span();
    }

    /// Multiplies the zoom level by `factor` (> 1 zooms in) while `anchor` keeps its
    /// pixel position.
    pub fn zoom(&mut self, factor: f64, anchor: f64) {
        if !(factor.is_finite() && factor > 0.0) || !anchor.is_finite() {
            return;
        }
        let span = self.viewport.span();
        let relative = (anchor - self.viewport.start) / span;
        let new_span = (span / factor).min(self.trace_span()).max(self.min_span());
        let start = anchor - relative * new_span;
        self.set_window(start, new_span);
    }

    /// Moves the window by a number of pixels, positive values move towards later times.
    pub fn pan(&mut self, delta_pixels: f64) {
        if !delta_pixels.is_finite() {
            return;
        }
        let delta = delta_pixels / self.viewport.pixels_per_unit();
        let span = self.viewport.span();
        self.set_window(self.viewport.start + delta, span);
    }

    /// Re-centers the window on `time` without changing the zoom level.
    pub fn center_on(&mut self, time: f64) {
        if !time.is_finite() {
            return;
        }
        let span = self.viewport.span();
        self.set_window(time - span / 2.0, span);
    }

    /// Changes the width of the drawing area. Start and span stay the same.
    pub fn resize(&mut self, pixel_width: f64) {
        if pixel_width.is_finite() && pixel_width > 0.0 {
            self.viewport.pixel_width = pixel_width;
        }
    }

    /// Places the cursor on the snapped time closest to `time`. Never scrolls.
    pub fn set_cursor(&mut self, time: Time) {
        let time = time.min(self.end_time);
        let snapped = time.saturating_add(self.snap / 2) / self.snap * self.snap;
        self.cursor = if snapped > self.end_time {
            time / self.snap * self.snap
        } else {
            snapped
        };
    }

    /// Places the cursor at a pixel position of the current window.
    pub fn set_cursor_at_pixel(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        let time = self.viewport.time_at(x).round().max(0.0);
        self.set_cursor(time as Time);
    }

    fn set_window(&mut self, start: f64, span: f64) {
        let trace_span = self.trace_span();
        let start = if span >= trace_span {
            0.0
        } else {
            start.clamp(0.0, trace_span - span)
        };
        self.viewport.start = start;
        self.viewport.end = start + span.min(trace_span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller(end_time: Time) -> ViewportController {
        let mut c = ViewportController::new(&ViewportConfig::default());
        c.reset(end_time);
        c
    }

    #[test]
    fn test_fit_to_trace() {
        let c = controller(200);
        assert_eq!(c.viewport().start(), 0.0);
        assert_eq!(c.viewport().end(), 200.0);
        assert_eq!(c.viewport().pixels_per_unit(), 5.0);
        // empty trace still has a usable window
        let c = controller(0);
        assert_eq!(c.viewport().span(), 1.0);
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        for bad in [f64::INFINITY, f64::NAN, 0.0, -3.0] {
            let mut c = ViewportController::new(&ViewportConfig {
                pixel_width: bad,
                max_pixels_per_unit: bad,
                ..Default::default()
            });
            c.reset(1000);
            for _ in 0..100 {
                c.zoom(1e12, 500.0);
            }
            let defaults = ViewportConfig::default();
            assert_eq!(c.viewport().pixel_width(), defaults.pixel_width);
            assert!(c.viewport().span() > 0.0);
            assert!(c.viewport().pixel_of(500.0).is_finite());
        }
    }

    #[test]
    fn test_zoom_in_keeps_anchor() {
        let mut c = controller(1000);
        let before = c.viewport().pixel_of(250.0);
        c.zoom(4.0, 250.0);
        assert_eq!(c.viewport().span(), 250.0);
        assert!((c.viewport().pixel_of(250.0) - before).abs() < 1e-9);
    }

    #[test]
    fn test_zoom_out_is_clamped() {
        let mut c = controller(1000);
        c.zoom(10.0, 900.0);
        c.zoom(0.01, 900.0);
        assert_eq!(c.viewport().start(), 0.0);
        assert_eq!(c.viewport().end(), 1000.0);
    }

    #[test]
    fn test_zoom_in_is_bounded() {
        let mut c = controller(1_000_000);
        c.zoom(1e12, 10.0);
        // 1000 px at most 1000 px per unit
        assert!((c.viewport().span() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_zoom_is_ignored() {
        let mut c = controller(100);
        let before = *c.viewport();
        c.zoom(0.0, 10.0);
        c.zoom(-2.0, 10.0);
        c.zoom(f64::NAN, 10.0);
        c.zoom(f64::INFINITY, 10.0);
        assert_eq!(*c.viewport(), before);
    }

    #[test]
    fn test_pan_is_clamped() {
        let mut c = controller(1000);
        c.zoom(10.0, 0.0);
        assert_eq!(c.viewport().span(), 100.0);
        // 1000 px for 100 units: 10 px per unit
        c.pan(500.0);
        assert_eq!(c.viewport().start(), 50.0);
        c.pan(-10_000.0);
        assert_eq!(c.viewport().start(), 0.0);
        c.pan(1e9);
        assert_eq!(c.viewport().end(), 1000.0);
        assert_eq!(c.viewport().span(), 100.0);
    }

    #[test]
    fn test_pan_short_trace_pins_start() {
        let mut c = controller(10);
        c.pan(300.0);
        assert_eq!(c.viewport().start(), 0.0);
    }

    #[test]
    fn test_cursor() {
        let mut c = controller(100);
        c.set_cursor(500);
        assert_eq!(c.cursor(), 100);
        c.set_cursor(42);
        assert_eq!(c.cursor(), 42);

        let mut snapping = ViewportController::new(&ViewportConfig {
            snap: 10,
            ..Default::default()
        });
        snapping.reset(95);
        snapping.set_cursor(44);
        assert_eq!(snapping.cursor(), 40);
        snapping.set_cursor(45);
        assert_eq!(snapping.cursor(), 50);
        // rounding up would leave the trace
        snapping.set_cursor(95);
        assert_eq!(snapping.cursor(), 90);

        // the cursor never scrolls the window
        c.zoom(10.0, 0.0);
        c.set_cursor(90);
        assert_eq!(c.viewport().start(), 0.0);
        c.center_on(90.0);
        assert_eq!(c.viewport().start(), 85.0);
    }

    #[test]
    fn test_cursor_at_pixel() {
        let mut c = controller(200);
        c.set_cursor_at_pixel(502.0);
        assert_eq!(c.cursor(), 100);
    }

    #[test]
    fn test_reset_and_resize() {
        let mut c = controller(100);
        c.zoom(2.0, 20.0);
        c.set_cursor(30);
        c.resize(500.0);
        assert_eq!(c.viewport().span(), 50.0);
        assert_eq!(c.viewport().pixels_per_unit(), 10.0);
        c.reset(400);
        assert_eq!(c.cursor(), 0);
        assert_eq!(c.viewport().end(), 400.0);
    }

    #[test]
    fn test_time_range() {
        let mut c = controller(100);
        c.zoom(8.0, 13.3);
        let (start, end) = c.viewport().time_range();
        assert!(start as f64 <= c.viewport().start());
        assert!(end as f64 >= c.viewport().end());
    }

    proptest! {
        #[test]
        fn zoom_in_is_anchor_stable(
            end_time in 10u64..10_000_000,
            factor in 1.0f64..16.0,
            relative in 0.0f64..1.0,
            pre_zoom in 1.0f64..4.0,
        ) {
            let mut c = controller(end_time);
            c.zoom(pre_zoom, end_time as f64 * 0.3);
            let vp = *c.viewport();
            let anchor = vp.start() + relative * vp.span();
            let before = vp.pixel_of(anchor);
            c.zoom(factor, anchor);
            let after = c.viewport().pixel_of(anchor);
            prop_assert!((after - before).abs() <= 1.0);
        }

        #[test]
        fn pan_stays_inside_trace(
            end_time in 0u64..1_000_000,
            zoom in 1.0f64..100.0,
            pans in proptest::collection::vec(-5000.0f64..5000.0, 1..20),
        ) {
            let mut c = controller(end_time);
            c.zoom(zoom, 0.0);
            let span = c.viewport().span();
            let trace_span = end_time.max(1) as f64;
            for delta in pans {
                c.pan(delta);
                let vp = c.viewport();
                prop_assert!(vp.start() >= 0.0);
                prop_assert!(vp.end() <= trace_span + 1e-6);
                prop_assert!((vp.span() - span).abs() <= 1e-6 * span.max(1.0));
            }
        }
    }
}
