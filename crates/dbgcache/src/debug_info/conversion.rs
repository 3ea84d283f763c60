//! Launching and polling external debug info conversions.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Instant, SystemTime};

use super::DebugInfoKey;
use super::rdi::{self, RdiHeader};

/// What a conversion process is asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionRequest {
    /// The native debug info file.
    pub source: PathBuf,
    /// Where to write the RDI container.
    pub output: PathBuf,
    /// The number of threads the converter may use.
    pub thread_count: usize,
    /// Whether to compress the payload.
    pub compress: bool,
}

/// A running conversion.
pub trait ConversionProcess: Send {
    /// Polls for completion without blocking.
    ///
    /// Returns `Some(success)` once the process has exited.
    fn try_wait(&mut self) -> io::Result<Option<bool>>;

    /// Terminates the process.
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts conversion processes.
pub trait ConversionLauncher: Send + Sync + fmt::Debug {
    fn launch(&self, request: &ConversionRequest) -> io::Result<Box<dyn ConversionProcess>>;
}

/// Runs the configured converter executable.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    converter: PathBuf,
}

impl ProcessLauncher {
    pub fn new(converter: impl Into<PathBuf>) -> Self {
        Self {
            converter: converter.into(),
        }
    }
}

impl ConversionLauncher for ProcessLauncher {
    fn launch(&self, request: &ConversionRequest) -> io::Result<Box<dyn ConversionProcess>> {
        let mut command = Command::new(&self.converter);
        command
            .arg("--out")
            .arg(&request.output)
            .arg("--threads")
            .arg(request.thread_count.to_string())
            .arg("--quiet");
        if request.compress {
            command.arg("--compress");
        }
        command
            .arg(&request.source)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        let child = command.spawn()?;
        Ok(Box::new(child))
    }
}

impl ConversionProcess for Child {
    fn try_wait(&mut self) -> io::Result<Option<bool>> {
        Ok(Child::try_wait(self)?.map(|status| status.success()))
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)?;
        // reap the process
        self.wait().map(drop)
    }
}

/// The number of threads a conversion of a `source_size` byte file gets.
pub fn thread_budget(source_size: u64, cores: usize) -> usize {
    const MB: u64 = 1024 * 1024;
    let threads = match source_size {
        size if size <= 4 * MB => 1,
        size if size <= 256 * MB => cores / 4,
        size if size <= 512 * MB => cores / 2,
        _ => cores,
    };
    threads.max(1)
}

/// Where the RDI container for `source` lives.
pub fn rdi_path_for(source: &Path) -> PathBuf {
    source.with_extension("rdi")
}

/// Whether the RDI container at `path` has to be (re)generated.
pub fn is_rdi_stale(path: &Path, min_timestamp: SystemTime) -> bool {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return true,
    };
    if modified < min_timestamp {
        return true;
    }
    RdiHeader::read(path).is_err()
}

/// The state of one debug info load.
pub(super) enum TaskStatus {
    /// Not analyzed yet, or waiting for thread budget.
    Null,
    /// A conversion process is running.
    Active {
        process: Box<dyn ConversionProcess>,
        started: Instant,
        threads: usize,
    },
    /// The RDI file at `rdi_path` is ready to be parsed.
    Done,
    /// Nothing can be loaded.
    Failed,
}

impl fmt::Debug for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Active { started, threads, .. } => f
                .debug_struct("Active")
                .field("started", started)
                .field("threads", threads)
                .finish_non_exhaustive(),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A debug info load in flight.
#[derive(Debug)]
pub(super) struct ConversionTask {
    pub key: DebugInfoKey,
    pub source: PathBuf,
    pub min_timestamp: SystemTime,
    pub rdi_path: PathBuf,
    pub status: TaskStatus,
    /// Launched ahead of regular tasks when waiting for thread budget.
    pub high_priority: bool,
}

impl ConversionTask {
    pub fn new(
        key: DebugInfoKey,
        source: PathBuf,
        min_timestamp: SystemTime,
        high_priority: bool,
    ) -> Self {
        let rdi_path = if rdi::is_rdi_file(&source) {
            source.clone()
        } else {
            rdi_path_for(&source)
        };
        Self {
            key,
            source,
            min_timestamp,
            rdi_path,
            status: TaskStatus::Null,
            high_priority,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Active { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Done | TaskStatus::Failed)
    }
}
