// Copyright 2023-2024 The Regents of the University of California
// Copyright 2024-2025 Cornell University
// released under BSD 3-Clause License
// author: Kevin Laeufer <laeufer@cornell.edu>

//! Finding traces in a project and peeking at their headers.
//!
//! Projects live behind a [`ProjectService`], which is given a bearer [`Credential`] with
//! every request. [`LocalProjectService`] serves projects from a directory tree laid out as
//! `<root>/<project>/**/*.vcd`.

use crate::hierarchy::{Signal, Timescale};
use crate::{vcd, LoadOptions, Result, WaveError};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub type ProjectId = u64;

/// A byte stream of a complete trace.
pub type TraceStream = Box<dyn BufRead + Send>;

/// A trace file inside a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFile {
    /// file name
    pub name: String,
    /// path relative to the project, always `/` separated
    pub path: String,
    /// in bytes
    pub size: u64,
}

/// What can be learned about a trace from its header alone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceMetadata {
    pub name: String,
    #[serde(rename = "filename")]
    pub path: String,
    pub size: u64,
    pub timescale: Option<Timescale>,
    pub signals: Vec<Signal>,
}

/// Bearer token issued by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<SystemTime>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

pub trait CredentialSource: Send + Sync {
    /// The current credential, `None` if the user is not logged in.
    fn credential(&self) -> Option<Credential>;
}

impl CredentialSource for Credential {
    fn credential(&self) -> Option<Credential> {
        Some(self.clone())
    }
}

impl CredentialSource for Option<Credential> {
    fn credential(&self) -> Option<Credential> {
        self.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("storage failure")]
    Io(#[from] std::io::Error),
}

impl From<ServiceError> for WaveError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::NotFound(msg) => WaveError::NotFound(msg),
            ServiceError::AccessDenied(msg) => WaveError::AccessDenied(msg),
            ServiceError::Unauthorized(msg) => WaveError::Unauthorized(msg),
            ServiceError::Network(msg) => WaveError::NetworkFailure(msg),
            ServiceError::Io(e) => WaveError::Io(e),
        }
    }
}

/// Storage of project files.
pub trait ProjectService: Send + Sync {
    fn list_trace_files(
        &self,
        project: ProjectId,
        credential: &Credential,
    ) -> std::result::Result<Vec<TraceFile>, ServiceError>;

    /// `path` is relative to the project.
    fn fetch_trace_stream(
        &self,
        project: ProjectId,
        path: &str,
        credential: &Credential,
    ) -> std::result::Result<TraceStream, ServiceError>;
}

/// Resolves trace names of one project and reads their headers.
#[derive(Clone)]
pub struct MetadataResolver {
    service: Arc<dyn ProjectService>,
    credentials: Arc<dyn CredentialSource>,
    project: ProjectId,
    options: LoadOptions,
}

impl MetadataResolver {
    pub fn new(
        service: Arc<dyn ProjectService>,
        credentials: Arc<dyn CredentialSource>,
        project: ProjectId,
        options: LoadOptions,
    ) -> Self {
        Self {
            service,
            credentials,
            project,
            options,
        }
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    fn credential(&self) -> Result<Credential> {
        match self.credentials.credential() {
            None => Err(WaveError::Unauthorized("no credential available".to_string())),
            Some(c) if c.is_expired(SystemTime::now()) => {
                Err(WaveError::Unauthorized("credential has expired".to_string()))
            }
            Some(c) => Ok(c),
        }
    }

    /// All trace files of the project, ordered by path.
    pub fn list_traces(&self) -> Result<Vec<TraceFile>> {
        let credential = self.credential()?;
        let mut files = self.service.list_trace_files(self.project, &credential)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Finds a trace by its relative path, or failing that by its file name.
    pub fn resolve(&self, name: &str) -> Result<TraceFile> {
        let files = self.list_traces()?;
        let found = files
            .iter()
            .position(|f| f.path == name)
            .or_else(|| files.iter().position(|f| f.name == name));
        match found {
            Some(index) => Ok(files[index].clone()),
            None => Err(WaveError::NotFound(format!(
                "no trace named `{name}` in project {}",
                self.project
            ))),
        }
    }

    /// Parses the header of a trace. No values are read.
    pub fn load_trace_metadata(&self, name: &str) -> Result<TraceMetadata> {
        let (file, stream) = self.open_trace(name)?;
        let header = vcd::read_header(stream, &self.options)?;
        Ok(TraceMetadata {
            name: file.name,
            path: file.path,
            size: file.size,
            timescale: header.meta.timescale,
            signals: header.signals.iter().cloned().collect(),
        })
    }

    /// Opens the byte stream of a trace for a full load.
    pub fn open_trace(&self, name: &str) -> Result<(TraceFile, TraceStream)> {
        let file = self.resolve(name)?;
        let credential = self.credential()?;
        log::debug!("opening `{}` of project {}", file.path, self.project);
        let stream = self
            .service
            .fetch_trace_stream(self.project, &file.path, &credential)?;
        Ok((file, stream))
    }
}

/// Serves projects from `<root>/<project>/`.
#[derive(Debug, Clone)]
pub struct LocalProjectService {
    root: PathBuf,
}

impl LocalProjectService {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, project: ProjectId) -> PathBuf {
        self.root.join(project.to_string())
    }

    /// Resolves `path` inside the project and makes sure it does not escape it.
    fn resolve_path(
        &self,
        project: ProjectId,
        path: &str,
    ) -> std::result::Result<PathBuf, ServiceError> {
        let not_found = || ServiceError::NotFound(path.to_string());
        let base = self
            .project_dir(project)
            .canonicalize()
            .map_err(|_| not_found())?;
        let full = base.join(path).canonicalize().map_err(|_| not_found())?;
        if !full.starts_with(&base) {
            return Err(ServiceError::AccessDenied(path.to_string()));
        }
        if !full.is_file() {
            return Err(not_found());
        }
        Ok(full)
    }
}

fn is_trace_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("vcd"))
        .unwrap_or(false)
}

fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}

impl ProjectService for LocalProjectService {
    fn list_trace_files(
        &self,
        project: ProjectId,
        _credential: &Credential,
    ) -> std::result::Result<Vec<TraceFile>, ServiceError> {
        let dir = self.project_dir(project);
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut files = vec![];
        for entry in jwalk::WalkDir::new(&dir).sort(true).skip_hidden(false) {
            let entry = entry.map_err(|e| ServiceError::Io(std::io::Error::other(e.to_string())))?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_trace_file(&path) {
                continue;
            }
            let Some(relative) = relative_path(&dir, &path) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(TraceFile {
                name: entry.file_name().to_string_lossy().to_string(),
                path: relative,
                size,
            });
        }
        Ok(files)
    }

    fn fetch_trace_stream(
        &self,
        project: ProjectId,
        path: &str,
        _credential: &Credential,
    ) -> std::result::Result<TraceStream, ServiceError> {
        let full = self.resolve_path(project, path)?;
        let file = std::fs::File::open(full)?;
        // empty files cannot be mapped on all platforms
        if file.metadata()?.len() == 0 {
            return Ok(Box::new(std::io::Cursor::new(Vec::new())));
        }
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Box::new(std::io::Cursor::new(mmap)))
    }
}
