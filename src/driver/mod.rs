//! Archive codec drivers.
//!
//! A driver turns a native file into an [`InputArchive`] (entry list plus
//! per-entry readers) and creates [`OutputArchive`]s that write a new archive
//! entry by entry. The archive controller only talks to these traits, so
//! drivers for further formats can be plugged into an
//! [`ArchiveDetector`](crate::ArchiveDetector).
//!
//! # Direct data copying
//!
//! When an entry moves between two archives whose encodings are compatible
//! (for instance deflated ZIP entries), the encoded bytes are passed through
//! as a [`RawEntry`] instead of being decompressed and compressed again. An
//! input archive offers raw data with [`InputArchive::open_raw`]; an output
//! archive announces whether it can take it with
//! [`OutputArchive::accepts_raw`].

use std::fmt;
use std::io::Read;
use std::path::Path;

use crate::Result;
use crate::entry_name;
use crate::timestamp::Timestamp;

mod slice;
pub mod tar;
pub mod zip;

pub(crate) use slice::SharedFile;
pub use tar::{TarCompression, TarDriver};
pub use zip::ZipDriver;

/// Whether an entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// Metadata of one archive member.
///
/// Directory names always end in `/`. The size is unknown for directories and
/// for files whose content has not been written yet. A missing modification
/// time marks a ghost directory that exists only to complete the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    name: String,
    kind: EntryKind,
    size: Option<u64>,
    modified: Option<Timestamp>,
}

impl ArchiveEntry {
    /// Creates a file entry.
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: entry_name::file_key(&name.into()).to_string(),
            kind: EntryKind::File,
            size: None,
            modified: None,
        }
    }

    /// Creates a directory entry; a trailing `/` is appended if missing.
    pub fn directory(name: impl AsRef<str>) -> Self {
        Self {
            name: entry_name::dir_key(name.as_ref()),
            kind: EntryKind::Directory,
            size: None,
            modified: None,
        }
    }

    /// Creates an entry of the given kind.
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => Self::file(name),
            EntryKind::Directory => Self::directory(name.into()),
        }
    }

    /// Sets the uncompressed size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the modification time.
    pub fn with_modified(mut self, modified: Option<Timestamp>) -> Self {
        self.modified = modified;
        self
    }

    /// Returns the entry name (the map key, `/`-terminated for directories).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the last path segment of the name.
    pub fn base_name(&self) -> &str {
        entry_name::split(&self.name).map_or("", |(_, base)| base)
    }

    /// Returns the entry kind.
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Returns `true` for directories.
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Returns `true` for files.
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Returns the uncompressed size, if known.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Returns the modification time, if known.
    pub fn modified(&self) -> Option<Timestamp> {
        self.modified
    }

    pub(crate) fn set_size(&mut self, size: Option<u64>) {
        self.size = size;
    }

    pub(crate) fn set_modified(&mut self, modified: Option<Timestamp>) {
        self.modified = modified;
    }
}

/// Encoding of raw entry bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawMethod {
    /// Uncompressed bytes.
    Stored,
    /// Raw deflate stream (RFC 1951).
    Deflated,
}

/// Encoded bytes of an entry, for direct data copying.
pub struct RawEntry {
    /// How `data` is encoded.
    pub method: RawMethod,
    /// CRC-32 of the decoded content, if the source format records one.
    pub crc32: Option<u32>,
    /// Number of encoded bytes `data` yields.
    pub packed_size: u64,
    /// Number of decoded bytes.
    pub size: u64,
    /// The encoded bytes.
    pub data: Box<dyn Read + Send>,
}

impl fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawEntry")
            .field("method", &self.method)
            .field("crc32", &self.crc32)
            .field("packed_size", &self.packed_size)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A codec for one archive format.
pub trait ArchiveDriver: Send + Sync + fmt::Debug {
    /// Returns a short name of the format, used in error messages.
    fn name(&self) -> &'static str;

    /// Opens an existing archive for reading.
    ///
    /// Fails with [`Error::InvalidFormat`](crate::Error::InvalidFormat) if
    /// the file does not hold an archive of this format.
    fn open_input(&self, path: &Path) -> Result<Box<dyn InputArchive>>;

    /// Creates a new archive at `path`, truncating any existing file.
    ///
    /// `source` is the archive being replaced, if any, so format level
    /// properties such as a comment can be carried over.
    fn create_output(
        &self,
        path: &Path,
        source: Option<&dyn InputArchive>,
    ) -> Result<Box<dyn OutputArchive>>;
}

/// A readable archive.
///
/// Readers returned by [`open_entry`](Self::open_entry) are independent of
/// each other and of the archive handle, so several threads may read
/// different entries at the same time.
pub trait InputArchive: Send + Sync {
    /// Returns all entries in archive order.
    fn entries(&self) -> &[ArchiveEntry];

    /// Looks up an entry by name (`/`-terminated for directories).
    fn entry(&self, name: &str) -> Option<&ArchiveEntry>;

    /// Opens the decoded content of a file entry.
    fn open_entry(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Opens the encoded content of a file entry for direct data copying.
    ///
    /// Returns `Ok(None)` if the driver does not support it for this entry.
    fn open_raw(&self, name: &str) -> Result<Option<RawEntry>> {
        let _ = name;
        Ok(None)
    }

    /// Returns the archive comment, if the format has one.
    fn comment(&self) -> Option<&str> {
        None
    }
}

/// A writable archive.
///
/// Entries are appended one at a time. [`finish`](Self::finish) must be
/// called once after the last entry; the archive is incomplete otherwise.
pub trait OutputArchive: Send {
    /// Appends a file entry with the content read from `data`; returns the
    /// number of content bytes written.
    fn write_entry(&mut self, entry: &ArchiveEntry, data: &mut dyn Read) -> Result<u64>;

    /// Appends a directory entry.
    fn write_directory(&mut self, entry: &ArchiveEntry) -> Result<()>;

    /// Returns `true` if [`write_raw`](Self::write_raw) can take `raw`.
    fn accepts_raw(&self, raw: &RawEntry) -> bool {
        let _ = raw;
        false
    }

    /// Appends a file entry with already encoded content.
    fn write_raw(&mut self, entry: &ArchiveEntry, mut raw: RawEntry) -> Result<u64> {
        if raw.method != RawMethod::Stored {
            return Err(crate::Error::UnsupportedFeature {
                feature: "direct data copying",
            });
        }
        self.write_entry(entry, &mut raw.data)
    }

    /// Completes the archive.
    fn finish(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_names_are_normalized() {
        assert_eq!(ArchiveEntry::directory("a/b").name(), "a/b/");
        assert_eq!(ArchiveEntry::directory("a/b/").name(), "a/b/");
        assert_eq!(ArchiveEntry::file("a/b/").name(), "a/b");
        assert_eq!(ArchiveEntry::new("x", EntryKind::Directory).name(), "x/");
    }

    #[test]
    fn test_entry_base_name() {
        assert_eq!(ArchiveEntry::file("a/b/c.txt").base_name(), "c.txt");
        assert_eq!(ArchiveEntry::directory("a/b").base_name(), "b");
        assert_eq!(ArchiveEntry::file("top").base_name(), "top");
    }

    #[test]
    fn test_entry_builders() {
        let ts = Timestamp::from_unix_secs(100);
        let entry = ArchiveEntry::file("f").with_size(3).with_modified(Some(ts));
        assert_eq!(entry.size(), Some(3));
        assert_eq!(entry.modified(), Some(ts));
        assert!(entry.is_file());
        assert!(!entry.is_directory());
    }
}
