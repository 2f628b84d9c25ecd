//! Error types for archive filesystem operations.
//!
//! This module provides the [`Error`] enum which represents all failure modes
//! of the virtual archive filesystem, the [`FalsePositive`] signal used to
//! reroute operations when a path only *looked* like an archive, and the
//! [`UpdateReport`] that collects diagnostics across a bulk update.
//!
//! # Error Handling
//!
//! Single-entry operations return `Result<T, Error>` and fail immediately.
//! Bulk updates keep going after a failure and hand back every problem they
//! met, most severe first:
//!
//! ```rust,no_run
//! use archfs::{ArchiveFs, Error, Severity};
//!
//! fn flush(fs: &ArchiveFs) {
//!     match fs.umount() {
//!         Ok(report) => {
//!             for warning in report.diagnostics() {
//!                 eprintln!("warning: {}", warning);
//!             }
//!         }
//!         Err(Error::Update(report)) if !report.is_warning_only() => {
//!             let primary = report.primary().expect("non-empty report");
//!             assert_ne!(primary.severity(), Severity::Warning);
//!             eprintln!("update failed: {}", primary);
//!         }
//!         Err(e) => eprintln!("update failed: {}", e),
//!     }
//! }
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// What a presumed archive turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FalsePositiveKind {
    /// A plain file or directory in the native filesystem.
    Native,
    /// A plain file entry inside the enclosing archive.
    FileEntry,
    /// A plain directory entry inside the enclosing archive.
    DirectoryEntry,
}

impl fmt::Display for FalsePositiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native file or directory"),
            Self::FileEntry => write!(f, "file entry"),
            Self::DirectoryEntry => write!(f, "directory entry"),
        }
    }
}

/// A path was named like an archive but is not one.
///
/// This is a control-flow signal rather than a failure: the caller that
/// invoked the controller named by [`archive`](Self::archive) retries the
/// operation against the enclosing archive or the native filesystem. Any
/// other caller must pass the signal on unchanged.
#[derive(Debug)]
pub struct FalsePositive {
    kind: FalsePositiveKind,
    archive: PathBuf,
    cause: Option<Box<Error>>,
}

impl FalsePositive {
    pub(crate) fn new(kind: FalsePositiveKind, archive: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            archive: archive.into(),
            cause: None,
        }
    }

    pub(crate) fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns what the presumed archive actually is.
    pub fn kind(&self) -> FalsePositiveKind {
        self.kind
    }

    /// Returns the target path of the controller that raised the signal.
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Returns the error the driver reported while opening the archive.
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// Returns `true` if the archive could not be opened because something
    /// was missing or access was refused, rather than because its content is
    /// not an archive.
    ///
    /// Such archives are reported as absent by `is_file` and `delete` instead
    /// of being treated as plain files.
    pub fn is_access_failure(&self) -> bool {
        match self.cause.as_deref() {
            Some(Error::Io(e)) => matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

impl fmt::Display for FalsePositive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is a {}, not an archive",
            self.archive.display(),
            self.kind
        )?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

/// The main error type for archive filesystem operations.
///
/// # Error Categories
///
/// | Category | Variants | Typical Cause |
/// |----------|----------|---------------|
/// | I/O | [`Io`][Self::Io] | Native file system operations |
/// | Format | [`InvalidFormat`][Self::InvalidFormat], [`UnsupportedFeature`][Self::UnsupportedFeature] | Damaged or exotic archives |
/// | Routing | [`FalsePositive`][Self::FalsePositive] | Archive-looking plain files |
/// | Structure | [`IllegalOperation`][Self::IllegalOperation], [`ReadOnly`][Self::ReadOnly], [`NotADirectory`][Self::NotADirectory] | Rejected transactions |
/// | Lookup | [`ArchiveNotFound`][Self::ArchiveNotFound], [`EntryNotFound`][Self::EntryNotFound] | Missing archives or entries |
/// | Concurrency | [`Busy`][Self::Busy], [`EntryBusy`][Self::EntryBusy], [`StreamClosed`][Self::StreamClosed] | Open streams |
/// | Bulk update | [`Update`][Self::Update] | Collected diagnostics |
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred during native file operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The archive driver rejected the bytes it was given.
    #[error("Invalid {driver} archive: {reason}")]
    InvalidFormat {
        /// The name of the driver that rejected the data.
        driver: &'static str,
        /// A description of what was wrong.
        reason: String,
    },

    /// The archive uses a feature the driver does not implement.
    #[error("Unsupported feature: {feature}")]
    UnsupportedFeature {
        /// The name of the unsupported feature.
        feature: &'static str,
    },

    /// An entry name is not acceptable inside an archive.
    #[error("Invalid entry name: {0}")]
    InvalidEntryName(String),

    /// The presumed archive is a plain file or directory.
    ///
    /// See [`FalsePositive`] for how this signal is meant to be consumed.
    #[error("{0}")]
    FalsePositive(FalsePositive),

    /// The archive does not exist and auto-creation was not requested.
    #[error("Archive not found: {}", path.display())]
    ArchiveNotFound {
        /// The archive's target path.
        path: PathBuf,
    },

    /// The entry does not exist in the archive.
    #[error("Entry not found: {entry} in {}", archive.display())]
    EntryNotFound {
        /// The archive's target path.
        archive: PathBuf,
        /// The entry name.
        entry: String,
    },

    /// A filesystem transaction was rejected before anything changed.
    #[error("Illegal operation on '{entry}': {reason}")]
    IllegalOperation {
        /// The entry name the operation targeted.
        entry: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The archive is read-only.
    #[error("Archive is read-only: {}", archive.display())]
    ReadOnly {
        /// The archive's target path.
        archive: PathBuf,
    },

    /// A path component that must be a directory is a plain file.
    #[error("Not a directory: {}", path.display())]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// The path names a directory where a file was expected.
    #[error("Is a directory: {}", path.display())]
    IsADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// The archive cannot be updated while other threads hold entry streams.
    ///
    /// Nothing was lost; retry once the streams are closed or request forced
    /// closing in the [`UpdateOptions`](crate::UpdateOptions).
    #[error("Archive busy: {streams} open entry stream(s) in {}", archive.display())]
    Busy {
        /// The archive's target path.
        archive: PathBuf,
        /// The number of streams held by other threads.
        streams: usize,
    },

    /// An output stream for the same entry is still open.
    #[error("Entry busy: {entry} in {} is being written", archive.display())]
    EntryBusy {
        /// The archive's target path.
        archive: PathBuf,
        /// The entry name.
        entry: String,
    },

    /// The entry stream was disconnected by an update or reset.
    #[error("Stream closed")]
    StreamClosed,

    /// A bulk update met busy archives or fatal failures.
    #[error("{0}")]
    Update(UpdateReport),
}

impl Error {
    pub(crate) fn illegal(entry: impl Into<String>, reason: &'static str) -> Self {
        Error::IllegalOperation {
            entry: entry.into(),
            reason,
        }
    }

    pub(crate) fn invalid_format(driver: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidFormat {
            driver,
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying later (or differently) may succeed without
    /// any data having been lost.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Busy { .. } | Error::EntryBusy { .. } => true,
            Error::FalsePositive(_) => true,
            Error::ArchiveNotFound { .. } | Error::EntryNotFound { .. } => true,
            Error::Update(report) => report.is_recoverable(),
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` if this is a false positive signal.
    pub fn is_false_positive(&self) -> bool {
        matches!(self, Error::FalsePositive(_))
    }

    /// Returns `true` if this error or its I/O payload reports a stream that
    /// was disconnected by an update.
    pub fn is_stream_closed(&self) -> bool {
        match self {
            Error::StreamClosed => true,
            Error::Io(e) => is_stream_closed(e),
            _ => false,
        }
    }
}

/// Marker payload of the [`io::Error`] raised by disconnected entry streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

impl fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry stream has been forcibly closed")
    }
}

impl std::error::Error for StreamClosed {}

pub(crate) fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, StreamClosed)
}

/// Returns `true` if `err` was raised by an entry stream after an update or
/// reset disconnected it.
pub fn is_stream_closed(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.downcast_ref::<StreamClosed>().is_some())
}

/// How bad a problem met during an update was.
///
/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The update went through; something minor was skipped or reported.
    Warning,
    /// The archive was not updated because of open streams; nothing was lost.
    Busy,
    /// Pending changes to the archive are lost.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Busy => write!(f, "busy"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// One problem met while updating one archive.
#[derive(Debug)]
pub struct Diagnostic {
    severity: Severity,
    archive: PathBuf,
    message: String,
    cause: Option<Box<Error>>,
}

impl Diagnostic {
    /// Creates a diagnostic without an underlying error.
    pub fn new(severity: Severity, archive: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            severity,
            archive: archive.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches the error that caused this diagnostic.
    pub fn with_cause(mut self, cause: impl Into<Error>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }

    /// Returns the severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Returns the target path of the archive concerned.
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Returns the human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the underlying error, if any.
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({})",
            self.archive.display(),
            self.message,
            self.severity
        )?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Diagnostics collected across one or more archive updates.
///
/// Entries are recorded in order of occurrence. [`finish`](Self::finish)
/// sorts them by descending severity, keeping occurrence order among equals,
/// so the head of the list is the most important problem.
#[derive(Debug, Default)]
pub struct UpdateReport {
    diagnostics: Vec<Diagnostic>,
}

impl UpdateReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a diagnostic.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Warning => log::warn!("{}", diagnostic),
            Severity::Busy | Severity::Fatal => log::debug!("{}", diagnostic),
        }
        self.diagnostics.push(diagnostic);
    }

    /// Records a warning about `archive`.
    pub(crate) fn warn(&mut self, archive: &Path, message: impl Into<String>) {
        self.push(Diagnostic::new(Severity::Warning, archive, message));
    }

    /// Moves all diagnostics of `other` into this report.
    pub fn append(&mut self, other: &mut UpdateReport) {
        self.diagnostics.append(&mut other.diagnostics);
    }

    /// Returns the diagnostics, most severe first once finished.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Returns the number of diagnostics.
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// Returns `true` if nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Returns the highest severity recorded.
    pub fn max_severity(&self) -> Option<Severity> {
        self.diagnostics.iter().map(|d| d.severity).max()
    }

    /// Returns `true` if every diagnostic is a warning.
    pub fn is_warning_only(&self) -> bool {
        self.diagnostics
            .iter()
            .all(|d| d.severity == Severity::Warning)
    }

    /// Returns `true` if no diagnostic reports lost data.
    pub fn is_recoverable(&self) -> bool {
        self.diagnostics.iter().all(|d| d.severity != Severity::Fatal)
    }

    /// Returns the first fatal diagnostic, or the most severe one if nothing
    /// was fatal.
    pub fn primary(&self) -> Option<&Diagnostic> {
        self.diagnostics
            .iter()
            .find(|d| d.severity == Severity::Fatal)
            .or_else(|| self.diagnostics.iter().max_by_key(|d| d.severity))
    }

    /// Sorts the diagnostics and converts the report into a result.
    ///
    /// Warnings alone yield `Ok`; anything busy or fatal yields
    /// [`Error::Update`].
    pub fn finish(mut self) -> Result<UpdateReport> {
        // stable: equal severities keep their order of occurrence
        self.diagnostics.sort_by(|a, b| b.severity.cmp(&a.severity));
        if self.is_warning_only() {
            Ok(self)
        } else {
            Err(Error::Update(self))
        }
    }
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary() {
            None => write!(f, "archive update succeeded"),
            Some(primary) if self.diagnostics.len() == 1 => write!(f, "{}", primary),
            Some(primary) => write!(
                f,
                "{} (and {} more problem(s))",
                primary,
                self.diagnostics.len() - 1
            ),
        }
    }
}

/// A specialized Result type for archive filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_false_positive_display() {
        let err = Error::FalsePositive(FalsePositive::new(
            FalsePositiveKind::FileEntry,
            "/tmp/a.zip/b.zip",
        ));
        let msg = err.to_string();
        assert!(msg.contains("b.zip"));
        assert!(msg.contains("file entry"));
        assert!(err.is_false_positive());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_false_positive_access_failure() {
        let denied = FalsePositive::new(FalsePositiveKind::Native, "/tmp/a.zip").with_cause(
            Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "cancelled")),
        );
        assert!(denied.is_access_failure());

        let garbage = FalsePositive::new(FalsePositiveKind::Native, "/tmp/a.zip")
            .with_cause(Error::invalid_format("zip", "no end of central directory"));
        assert!(!garbage.is_access_failure());
    }

    #[test]
    fn test_stream_closed_roundtrip() {
        let io_err = stream_closed();
        assert!(is_stream_closed(&io_err));
        assert!(Error::Io(io_err).is_stream_closed());
        assert!(Error::StreamClosed.is_stream_closed());
        assert!(!is_stream_closed(&io::Error::other("boom")));
    }

    #[test]
    fn test_report_sorts_fatal_first() {
        let mut report = UpdateReport::new();
        report.push(Diagnostic::new(Severity::Warning, "/a.zip", "first warning"));
        report.push(Diagnostic::new(Severity::Fatal, "/b.zip", "lost"));
        report.push(Diagnostic::new(Severity::Warning, "/c.zip", "second warning"));
        report.push(Diagnostic::new(Severity::Busy, "/d.zip", "busy"));

        let Err(Error::Update(report)) = report.finish() else {
            panic!("fatal report must be an error");
        };
        let order: Vec<_> = report.diagnostics().iter().map(|d| d.message()).collect();
        assert_eq!(order, ["lost", "busy", "first warning", "second warning"]);
        assert_eq!(report.primary().map(|d| d.message()), Some("lost"));
        assert!(!report.is_recoverable());
    }

    #[test]
    fn test_report_warnings_only_is_ok() {
        let mut report = UpdateReport::new();
        report.warn(Path::new("/a.zip"), "couldn't remove archive entry");
        let report = report.finish().unwrap();
        assert!(report.is_warning_only());
        assert_eq!(report.max_severity(), Some(Severity::Warning));
    }

    #[test]
    fn test_busy_report_is_recoverable() {
        let mut report = UpdateReport::new();
        report.push(Diagnostic::new(Severity::Busy, "/a.zip", "busy"));
        let err = report.finish().unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_empty_report() {
        let report = UpdateReport::new().finish().unwrap();
        assert!(report.is_empty());
        assert!(report.primary().is_none());
        assert_eq!(report.to_string(), "archive update succeeded");
    }
}
