// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

mod config;
pub mod engine;
mod hierarchy;
pub mod metadata;
pub mod render;
mod timeline;
mod trace;
mod values;
pub mod vcd;
pub mod viewport;

/// Cargo.toml version of this library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Indicates that scopes with empty names should not be part of the signal paths.
    pub remove_scopes_with_empty_name: bool,
    /// Maximum number of warnings that are stored on a trace. Further warnings are only counted.
    /// The truncation warning of a partial trace is always stored.
    pub max_warnings: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            remove_scopes_with_empty_name: false,
            max_warnings: 1000,
        }
    }
}

/// Shared byte counter that the loader increments while it works through a trace body.
pub type ProgressCount = std::sync::Arc<std::sync::atomic::AtomicU64>;

#[derive(Debug, thiserror::Error)]
pub enum WaveError {
    #[error("malformed trace header (line {line}, byte {offset}): {message}")]
    MalformedHeader {
        line: u64,
        offset: u64,
        message: String,
    },
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("trace not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("load was cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("loader crashed: {0}")]
    LoaderCrashed(String),
    #[error("io error")]
    Io(#[from] std::io::Error),
}

impl WaveError {
    /// Network failures are transient, everything else will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WaveError::NetworkFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, WaveError>;

/// Problems that the loader recovers from. They are collected on the [`Trace`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadWarning {
    #[error("line {line}: value change for undeclared symbol `{id}` was skipped")]
    UnknownSymbolReference { line: u64, id: String },
    #[error("line {line}: `{path}` is {expected} bits wide, but the value has {actual} bits")]
    WidthMismatch {
        line: u64,
        path: String,
        expected: u32,
        actual: u32,
    },
    #[error("stream ended early ({reason}), last timestamp parsed is {last_time}")]
    TruncatedStream { last_time: Time, reason: String },
    #[error("line {line}: time goes backwards from {previous} to {time}, changes skipped")]
    BackwardsTime { line: u64, previous: Time, time: Time },
    #[error("line {line}: unsupported value change `{token}` was skipped")]
    UnsupportedValue { line: u64, token: String },
}

pub use config::{EngineConfig, RenderConfig, ViewportConfig};
pub use engine::{Engine, LoadEvent};
pub use hierarchy::{Signal, SignalRef, SignalTable, Timescale, TimescaleUnit, VarIndex, VarType};
pub use metadata::{
    Credential, CredentialSource, LocalProjectService, MetadataResolver, ProjectId,
    ProjectService, ServiceError, TraceFile, TraceMetadata, TraceStream,
};
pub use render::{render, RenderOptions, Segment, SignalSegments};
pub use timeline::{Change, Timeline};
pub use trace::{Trace, TraceMeta};
pub use values::{BusFormat, Time, Value, ValueRef};
pub use viewport::{Viewport, ViewportController};
