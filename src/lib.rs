//! # archfs
//!
//! Transparent read/write access to archives as if they were directories.
//!
//! A path such as `backup.zip/logs/2024.tar.gz/app.log` is split into the
//! archives it runs through and the entry name inside the innermost one.
//! Archives are mounted on first access, changes are collected in temp files,
//! and an update writes them back, inside out, into the enclosing archives
//! and finally the native file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archfs::{ArchiveFs, Result};
//!
//! fn main() -> Result<()> {
//!     let fs = ArchiveFs::new();
//!
//!     // Creates out.zip and its `dir/` entry on the fly.
//!     fs.write("out.zip/dir/file1.txt", b"hello")?;
//!     fs.update("out.zip")?;
//!
//!     assert_eq!(fs.list("out.zip/dir"), Some(vec!["file1.txt".to_string()]));
//!     assert_eq!(fs.read("out.zip/dir/file1.txt")?, b"hello");
//!
//!     // Archives nest to any depth.
//!     fs.write("out.zip/inner.tar/notes.txt", b"nested")?;
//!     fs.umount()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Layer | Type | Role |
//! |-------|------|------|
//! | Façade | [`ArchiveFs`] | Path operations, false positive rerouting |
//! | Resolution | [`ResolvedPath`], [`ArchiveDetector`] | Archive chain of a path |
//! | Registry | [`Registry`] | One controller per archive path |
//! | Control | [`ArchiveController`] | Mount, update and reset of one archive |
//! | Model | [`VirtualFileSystem`] | In-memory entry tree with transactions |
//! | Codecs | [`ArchiveDriver`] | ZIP and TAR reading and writing |
//!
//! ## False Positives
//!
//! Archive detection goes by file name, so `notes.zip` may turn out to be a
//! plain file, a native directory, or a plain entry of an enclosing archive.
//! Controllers report such a *false positive* and [`ArchiveFs`] repeats the
//! operation one level out; callers never see it.
//!
//! ## Committing Changes
//!
//! Nothing is written to an archive until it is updated:
//!
//! - [`ArchiveFs::update`] commits one archive and everything nested in it.
//! - [`ArchiveFs::umount`] commits everything, closes all streams and
//!   releases all temp files.
//! - [`ArchiveFs::reset`] discards pending changes.
//!
//! Updates never fail fast; they collect [`Diagnostic`]s into an
//! [`UpdateReport`], and return [`Error::Update`] only when an archive was
//! busy or changes were lost.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `deflate` | Yes | Deflate for ZIP entries and `.tar.gz` |
//! | `bzip2` | Yes | `.tar.bz2` support |
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade and installs no logger.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Buffer size for reading native files.
pub(crate) const READ_BUFFER_SIZE: usize = 8192;

pub mod archive_fs;
pub mod config;
pub mod controller;
pub mod copy;
pub mod detector;
pub mod driver;
pub mod entry_name;
pub mod error;
pub mod fs;
pub mod lock;
pub mod registry;
pub mod resolver;
pub mod stats;
pub mod stream;
pub mod timestamp;

pub use archive_fs::{ArchiveFs, FsReader, FsWriter};
pub use config::{CopyConfig, FsConfig, UpdateOptions};
pub use controller::ArchiveController;
pub use copy::{CatError, cat};
pub use detector::{ArchiveDetector, DefaultArchiveDetector};
pub use driver::{
    ArchiveDriver, ArchiveEntry, EntryKind, InputArchive, OutputArchive, RawEntry, RawMethod,
    TarCompression, TarDriver, ZipDriver,
};
pub use error::{
    Diagnostic, Error, FalsePositive, FalsePositiveKind, Result, Severity, StreamClosed,
    UpdateReport, is_stream_closed,
};
pub use fs::{Delta, VirtualFileSystem};
pub use registry::Registry;
pub use resolver::{ArchiveLevel, ResolvedPath};
pub use stats::RegistryStats;
pub use stream::{EntryReader, EntryWriter};
pub use timestamp::Timestamp;
