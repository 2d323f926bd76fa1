// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

//! The object a presentation layer talks to.
//!
//! Traces are loaded on a worker thread. The displayed [`Trace`] is an immutable snapshot
//! that is only swapped once a load has finished, so a reader never observes a mix of two
//! traces. Every load carries a generation number; results of superseded loads are dropped.

use crate::config::EngineConfig;
use crate::hierarchy::{Signal, SignalRef};
use crate::metadata::{
    CredentialSource, MetadataResolver, ProjectId, ProjectService, TraceFile, TraceMetadata,
};
use crate::render::{render, RenderOptions, SignalSegments};
use crate::trace::Trace;
use crate::values::{BusFormat, Time};
use crate::viewport::{Viewport, ViewportController};
use crate::{vcd, LoadWarning, ProgressCount, Result, WaveError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a load that was applied by [`Engine::poll`] or [`Engine::wait_for_load`].
#[derive(Debug)]
pub enum LoadEvent {
    /// The trace is now displayed.
    Loaded {
        name: String,
        generation: u64,
        partial: bool,
        warnings: usize,
    },
    /// The load failed, the previous trace (if any) is still displayed.
    Failed {
        name: String,
        generation: u64,
        error: WaveError,
    },
}

struct LoadResult {
    generation: u64,
    name: String,
    result: Result<Trace>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct InFlight {
    generation: u64,
    cancel: Arc<AtomicBool>,
    progress: ProgressCount,
}

#[derive(PartialEq)]
struct RenderKey {
    generation: u64,
    viewport: Viewport,
    signals: Vec<SignalRef>,
    options: RenderOptions,
}

struct RenderCache {
    key: RenderKey,
    segments: Vec<SignalSegments>,
}

pub struct Engine {
    config: EngineConfig,
    resolver: MetadataResolver,
    trace: Option<Arc<Trace>>,
    trace_name: Option<String>,
    /// generation of the most recent `select_trace`
    generation: u64,
    /// generation of the displayed trace
    displayed_generation: u64,
    in_flight: Option<InFlight>,
    results_tx: Sender<LoadResult>,
    results_rx: Receiver<LoadResult>,
    viewport: ViewportController,
    displayed: Vec<SignalRef>,
    render_options: RenderOptions,
    cache: Option<RenderCache>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        service: Arc<dyn ProjectService>,
        credentials: Arc<dyn CredentialSource>,
        project: ProjectId,
    ) -> Self {
        let resolver = MetadataResolver::new(service, credentials, project, config.load);
        let (results_tx, results_rx) = unbounded();
        Self {
            viewport: ViewportController::new(&config.viewport),
            render_options: RenderOptions::from_config(&config.render),
            config,
            resolver,
            trace: None,
            trace_name: None,
            generation: 0,
            displayed_generation: 0,
            in_flight: None,
            results_tx,
            results_rx,
            displayed: vec![],
            cache: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn list_traces(&self) -> Result<Vec<TraceFile>> {
        self.resolver.list_traces()
    }

    /// Header-only parse, runs on the calling thread.
    pub fn trace_metadata(&self, name: &str) -> Result<TraceMetadata> {
        self.resolver.load_trace_metadata(name)
    }

    /// Starts loading a trace in the background and returns the generation of the load.
    /// A load that is still running is cancelled.
    pub fn select_trace(&mut self, name: &str) -> Result<u64> {
        if let Some(previous) = self.in_flight.take() {
            log::debug!("cancelling load generation {}", previous.generation);
            previous.cancel.store(true, Ordering::Relaxed);
        }
        self.generation += 1;
        let generation = self.generation;
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = ProgressCount::default();

        let resolver = self.resolver.clone();
        let options = self.config.load;
        let tx = self.results_tx.clone();
        let worker_cancel = cancel.clone();
        let worker_progress = progress.clone();
        let worker_name = name.to_string();
        log::debug!("loading `{name}` (generation {generation})");
        std::thread::Builder::new()
            .name(format!("waveview-load-{generation}"))
            .spawn(move || {
                let load = || {
                    resolver.open_trace(&worker_name).and_then(|(_, stream)| {
                        vcd::load(stream, &options, Some(&worker_cancel), Some(worker_progress))
                    })
                };
                // a crashing load is reported like any other failure
                let result =
                    panic::catch_unwind(AssertUnwindSafe(load)).unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        log::error!("load of `{worker_name}` panicked: {message}");
                        Err(WaveError::LoaderCrashed(message))
                    });
                // the engine might be gone already
                let _ = tx.send(LoadResult {
                    generation,
                    name: worker_name,
                    result,
                });
            })?;

        self.in_flight = Some(InFlight {
            generation,
            cancel,
            progress,
        });
        Ok(generation)
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Bytes parsed so far by the running load.
    pub fn load_progress(&self) -> Option<u64> {
        self.in_flight
            .as_ref()
            .map(|l| l.progress.load(Ordering::Relaxed))
    }

    /// Applies finished loads without blocking. Returns the most recent event, if any.
    pub fn poll(&mut self) -> Option<LoadEvent> {
        let mut event = None;
        while let Ok(result) = self.results_rx.try_recv() {
            if let Some(e) = self.apply(result) {
                event = Some(e);
            }
        }
        event
    }

    /// Blocks until the running load has been applied or `timeout` has passed.
    pub fn wait_for_load(&mut self, timeout: Duration) -> Option<LoadEvent> {
        let deadline = Instant::now() + timeout;
        while self.in_flight.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results_rx.recv_timeout(remaining) {
                Ok(result) => {
                    if let Some(e) = self.apply(result) {
                        return Some(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                // we hold a sender ourselves
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        self.poll()
    }

    fn apply(&mut self, result: LoadResult) -> Option<LoadEvent> {
        let LoadResult {
            generation,
            name,
            result,
        } = result;
        if generation != self.generation {
            log::debug!("discarding stale result for `{name}` (generation {generation})");
            return None;
        }
        self.in_flight = None;
        match result {
            Ok(trace) => {
                let warnings = trace.warning_count();
                let partial = trace.is_partial();
                if warnings > 0 {
                    log::warn!("`{name}` loaded with {warnings} warnings");
                }
                log::info!(
                    "displaying `{name}`: {} signals, end time {}",
                    trace.signals().len(),
                    trace.end_time()
                );
                self.viewport.reset(trace.end_time());
                self.displayed = trace.signal_table().refs().collect();
                self.render_options.formats.clear();
                self.trace = Some(Arc::new(trace));
                self.trace_name = Some(name.clone());
                self.displayed_generation = generation;
                self.cache = None;
                Some(LoadEvent::Loaded {
                    name,
                    generation,
                    partial,
                    warnings,
                })
            }
            Err(error) => {
                log::warn!("failed to load `{name}`: {error}");
                Some(LoadEvent::Failed {
                    name,
                    generation,
                    error,
                })
            }
        }
    }

    /// The displayed trace.
    pub fn trace(&self) -> Option<&Arc<Trace>> {
        self.trace.as_ref()
    }

    pub fn trace_name(&self) -> Option<&str> {
        self.trace_name.as_deref()
    }

    pub fn signal_list(&self) -> &[Signal] {
        match &self.trace {
            Some(trace) => trace.signals(),
            None => &[],
        }
    }

    pub fn warnings(&self) -> &[LoadWarning] {
        match &self.trace {
            Some(trace) => trace.warnings(),
            None => &[],
        }
    }

    pub fn viewport(&self) -> &Viewport {
        self.viewport.viewport()
    }

    pub fn cursor(&self) -> Time {
        self.viewport.cursor()
    }

    pub fn zoom(&mut self, factor: f64, anchor: f64) {
        self.viewport.zoom(factor, anchor);
    }

    pub fn pan(&mut self, delta_pixels: f64) {
        self.viewport.pan(delta_pixels);
    }

    pub fn set_cursor(&mut self, time: Time) {
        self.viewport.set_cursor(time);
    }

    pub fn fit_to_trace(&mut self) {
        self.viewport.fit_to_trace();
    }

    pub fn resize(&mut self, pixel_width: f64) {
        self.viewport.resize(pixel_width);
    }

    pub fn center_on(&mut self, time: f64) {
        self.viewport.center_on(time);
    }

    /// Chooses the rows that [`Engine::visible_segments`] renders, in display order.
    pub fn set_displayed(&mut self, signals: Vec<SignalRef>) {
        self.displayed = signals;
    }

    pub fn displayed(&self) -> &[SignalRef] {
        &self.displayed
    }

    pub fn set_format(&mut self, signal: SignalRef, format: BusFormat) {
        self.render_options.formats.insert(signal, format);
    }

    /// Geometry of the displayed signals in the current viewport.
    pub fn visible_segments(&mut self) -> &[SignalSegments] {
        let Some(trace) = self.trace.clone() else {
            return &[];
        };
        let key = RenderKey {
            generation: self.displayed_generation,
            viewport: *self.viewport.viewport(),
            signals: self.displayed.clone(),
            options: self.render_options.clone(),
        };
        match &self.cache {
            Some(cache) if cache.key == key => {
                log::trace!("render cache hit");
            }
            _ => {
                let segments = render(&trace, &key.signals, &key.viewport, &key.options);
                self.cache = Some(RenderCache { key, segments });
            }
        }
        match &self.cache {
            Some(cache) => &cache.segments,
            None => &[],
        }
    }

    /// Formatted value of every displayed signal at the cursor.
    pub fn values_at_cursor(&self) -> Vec<(SignalRef, String)> {
        let Some(trace) = &self.trace else {
            return vec![];
        };
        let cursor = self.viewport.cursor();
        self.displayed
            .iter()
            .filter_map(|s| {
                let value = trace.value_at(*s, cursor)?;
                Some((*s, value.format(self.render_options.format_of(*s))))
            })
            .collect()
    }

    /// Moves the cursor to the next transition of `signal`. The window follows if the
    /// cursor would leave it.
    pub fn jump_to_next_transition(&mut self, signal: SignalRef) -> Option<Time> {
        let trace = self.trace.as_ref()?;
        let time = trace.timeline(signal)?.next_change_after(self.cursor())?.time;
        Some(self.move_cursor_into_view(time))
    }

    pub fn jump_to_previous_transition(&mut self, signal: SignalRef) -> Option<Time> {
        let trace = self.trace.as_ref()?;
        let time = trace
            .timeline(signal)?
            .previous_change_before(self.cursor())?
            .time;
        Some(self.move_cursor_into_view(time))
    }

    fn move_cursor_into_view(&mut self, time: Time) -> Time {
        self.viewport.set_cursor(time);
        let cursor = self.viewport.cursor() as f64;
        let vp = self.viewport.viewport();
        if cursor < vp.start() || cursor > vp.end() {
            self.viewport.center_on(cursor);
        }
        self.viewport.cursor()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(load) = self.in_flight.take() {
            load.cancel.store(true, Ordering::Relaxed);
        }
    }
}
