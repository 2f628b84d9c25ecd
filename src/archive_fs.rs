//! The path based façade.
//!
//! [`ArchiveFs`] offers file operations on paths that may run through any
//! number of archives. Each call resolves the path, picks the controller of
//! the innermost presumed archive and runs the operation there. When the
//! archive turns out to be something else (a false positive), the call is
//! repeated against the enclosing archive or the native filesystem.
//!
//! # Example
//!
//! ```rust,no_run
//! use archfs::{ArchiveFs, Result};
//!
//! fn main() -> Result<()> {
//!     let fs = ArchiveFs::new();
//!     fs.write("out.zip/dir/hello.txt", b"hello")?;
//!     fs.update("out.zip")?;
//!
//!     assert_eq!(fs.list("out.zip/dir"), Some(vec!["hello.txt".to_string()]));
//!     assert_eq!(fs.read("out.zip/dir/hello.txt")?, b"hello");
//!     fs.umount()?;
//!     Ok(())
//! }
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{FsConfig, UpdateOptions};
use crate::controller::{ArchiveController, AutoCreate};
use crate::copy;
use crate::detector::{ArchiveDetector, DefaultArchiveDetector};
use crate::driver::ArchiveEntry;
use crate::entry_name;
use crate::error::{FalsePositive, FalsePositiveKind, UpdateReport};
use crate::registry::Registry;
use crate::resolver::ResolvedPath;
use crate::stats::RegistryStats;
use crate::stream::{EntryReader, EntryWriter};
use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// File operations on paths through archives.
///
/// Cloning is cheap; clones share the registry and detector.
#[derive(Debug, Clone)]
pub struct ArchiveFs {
    registry: Arc<Registry>,
    detector: Arc<dyn ArchiveDetector>,
    config: FsConfig,
}

impl Default for ArchiveFs {
    fn default() -> Self {
        Self::new()
    }
}

/// A reader for a native file or an archive entry.
#[derive(Debug)]
pub enum FsReader {
    /// A native file.
    Native(File),
    /// An archive entry.
    Entry(EntryReader),
}

impl FsReader {
    /// Closes the reader. Closing twice has no further effect.
    pub fn close(&mut self) {
        if let FsReader::Entry(reader) = self {
            reader.close();
        }
    }
}

impl Read for FsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FsReader::Native(file) => file.read(buf),
            FsReader::Entry(reader) => reader.read(buf),
        }
    }
}

/// A writer for a native file or an archive entry.
#[derive(Debug)]
pub enum FsWriter {
    /// A native file.
    Native(BufWriter<File>),
    /// An archive entry.
    Entry(EntryWriter),
}

impl FsWriter {
    /// Closes the writer, committing the data. Closing twice has no further
    /// effect.
    pub fn close(&mut self) -> Result<()> {
        match self {
            FsWriter::Native(file) => Ok(file.flush()?),
            FsWriter::Entry(writer) => writer.close().map(drop),
        }
    }
}

impl Write for FsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FsWriter::Native(file) => file.write(buf),
            FsWriter::Entry(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FsWriter::Native(file) => file.flush(),
            FsWriter::Entry(writer) => writer.flush(),
        }
    }
}

/// Swallows query errors the way `Path::exists` does.
fn quietly<T: Default>(path: &Path, result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        log::trace!("{}: {}", path.display(), e);
        T::default()
    })
}

fn auto_create(lenient: bool, name: &str) -> AutoCreate {
    match (lenient, name.is_empty()) {
        (true, _) => AutoCreate::WithParents,
        (false, true) => AutoCreate::Archive,
        (false, false) => AutoCreate::Never,
    }
}

/// Makes `path` absolute and canonicalizes its longest existing prefix.
/// The rest is kept as is; entries inside archives never exist on disk.
fn canonical_prefix(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let components: Vec<_> = absolute.components().collect();
    for split in (1..=components.len()).rev() {
        let prefix: PathBuf = components[..split].iter().collect();
        if let Ok(mut canonical) = fs::canonicalize(&prefix) {
            canonical.extend(&components[split..]);
            return canonical;
        }
    }
    absolute
}

fn native_parents(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

impl ArchiveFs {
    /// Creates a filesystem on the global registry with the default detector.
    pub fn new() -> Self {
        Self::with_registry(Registry::global())
    }

    /// Creates a filesystem on `registry` with the default detector and the
    /// registry's configuration.
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        let config = registry.config().clone();
        Self {
            registry,
            detector: Arc::new(DefaultArchiveDetector::new()),
            config,
        }
    }

    /// Replaces the archive detector.
    pub fn detector(mut self, detector: Arc<dyn ArchiveDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Sets whether creating operations create missing parents.
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.config.lenient = lenient;
        self
    }

    /// Sets the configuration used by copies.
    pub fn copy_config(mut self, copy: crate::CopyConfig) -> Self {
        self.config.copy = copy;
        self
    }

    /// Returns the registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the configuration.
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Resolves `path` into its archive chain.
    ///
    /// Relative paths are made absolute first, and the longest prefix that
    /// exists on disk is canonicalized, so that one archive file gets one
    /// controller no matter which symlink it is reached through.
    pub fn resolve(&self, path: impl AsRef<Path>) -> ResolvedPath {
        ResolvedPath::resolve(canonical_prefix(path.as_ref()), &*self.detector)
    }

    /// Runs an operation on the innermost archive of `path`, rerouting false
    /// positives to enclosing archives or to the native filesystem.
    fn route<T>(
        &self,
        path: &Path,
        mut on_entry: impl FnMut(&ArchiveController, &str) -> Result<T>,
        mut on_native: impl FnMut(&Path, Option<&FalsePositive>) -> Result<T>,
    ) -> Result<T> {
        let resolved = self.resolve(path);
        let Some(index) = resolved.inner_index() else {
            return on_native(resolved.path(), None);
        };
        let mut controller =
            self.registry
                .controller(&resolved, index)
                .ok_or_else(|| Error::ArchiveNotFound {
                    path: resolved.path().to_path_buf(),
                })?;
        let mut name = resolved.inner_entry_name().unwrap_or_default().to_string();
        loop {
            let fp = match on_entry(&controller, &name) {
                Err(Error::FalsePositive(fp)) if fp.archive() == controller.target() => fp,
                other => return other,
            };
            log::trace!("{}", fp);
            match fp.kind() {
                FalsePositiveKind::Native => {
                    let native = if name.is_empty() {
                        controller.target().to_path_buf()
                    } else {
                        controller.target().join(&name)
                    };
                    return on_native(&native, Some(&fp));
                }
                FalsePositiveKind::FileEntry | FalsePositiveKind::DirectoryEntry => {
                    let Some((encl, entry)) = controller.enclosing() else {
                        return Err(Error::FalsePositive(fp));
                    };
                    name = entry_name::join(entry, &name);
                    let encl = Arc::clone(encl);
                    controller = encl;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Returns `true` if `path` exists.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        quietly(
            path,
            self.route(path, |c, name| c.exists(name), |p, _| Ok(p.exists())),
        )
    }

    /// Returns `true` if `path` is a plain file or a file entry.
    ///
    /// A valid archive is a directory, not a file. So is an archive that
    /// cannot be read for lack of access.
    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        quietly(
            path,
            self.route(
                path,
                |c, name| c.is_file(name),
                |p, fp| Ok(!fp.is_some_and(FalsePositive::is_access_failure) && p.is_file()),
            ),
        )
    }

    /// Returns `true` if `path` is a directory, a directory entry or an
    /// archive.
    pub fn is_directory(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        quietly(
            path,
            self.route(path, |c, name| c.is_directory(name), |p, _| Ok(p.is_dir())),
        )
    }

    /// Returns `true` if the detector recognizes `path` as an archive,
    /// whether or not it exists.
    pub fn is_archive(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).is_archive()
    }

    /// Returns `true` if `path` names something inside a presumed archive.
    pub fn is_entry(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).is_entry()
    }

    /// Returns the size of a file in bytes; 0 for directories and missing
    /// files.
    pub fn len(&self, path: impl AsRef<Path>) -> u64 {
        let path = path.as_ref();
        quietly(
            path,
            self.route(
                path,
                |c, name| c.length(name),
                |p, _| Ok(fs::metadata(p).map(|m| if m.is_file() { m.len() } else { 0 })?),
            ),
        )
    }

    /// Returns the modification time of `path`, if known.
    pub fn last_modified(&self, path: impl AsRef<Path>) -> Option<Timestamp> {
        let path = path.as_ref();
        quietly(
            path,
            self.route(
                path,
                |c, name| c.last_modified(name),
                |p, _| {
                    let modified = fs::metadata(p)?.modified()?;
                    Ok(Some(Timestamp::from_system_time(modified)))
                },
            ),
        )
    }

    /// Lists the names in directory `path`, sorted; `None` if it is not a
    /// directory.
    pub fn list(&self, path: impl AsRef<Path>) -> Option<Vec<String>> {
        let path = path.as_ref();
        quietly(
            path,
            self.route(
                path,
                |c, name| c.list(name),
                |p, _| {
                    let mut names = fs::read_dir(p)?
                        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
                        .collect::<io::Result<Vec<_>>>()?;
                    names.sort();
                    Ok(Some(names))
                },
            ),
        )
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Sets the modification time of `path`. Returns `false` if it does not
    /// exist or cannot be changed.
    pub fn set_last_modified(&self, path: impl AsRef<Path>, modified: Timestamp) -> Result<bool> {
        let path = path.as_ref();
        self.route(
            path,
            |c, name| c.set_last_modified(name, modified),
            |p, _| match filetime::set_file_mtime(p, modified.as_file_time()) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
        )
    }

    /// Creates directory `path`. Creating an archive path creates an empty
    /// archive.
    pub fn mkdir(&self, path: impl AsRef<Path>) -> Result<()> {
        self.mkdir_with(path, self.config.lenient)
    }

    /// Like [`mkdir`](Self::mkdir), with an explicit lenient policy.
    pub fn mkdir_with(&self, path: impl AsRef<Path>, lenient: bool) -> Result<()> {
        let path = path.as_ref();
        self.route(
            path,
            |c, name| c.mkdir(name, auto_create(lenient, name)),
            |p, _| {
                if lenient {
                    native_parents(p)?;
                }
                Ok(fs::create_dir(p)?)
            },
        )
    }

    /// Creates directory `path` and all missing parents, including
    /// enclosing archives. Succeeds if the directory exists already.
    pub fn mkdirs(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.is_directory(path) {
            return Ok(());
        }
        self.route(
            path,
            |c, name| c.mkdir(name, AutoCreate::WithParents),
            |p, _| Ok(fs::create_dir_all(p)?),
        )
    }

    /// Creates an empty file. Returns `false` if `path` exists already.
    /// Creating an archive path creates an empty archive.
    pub fn create_new_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.create_new_file_with(path, self.config.lenient)
    }

    /// Like [`create_new_file`](Self::create_new_file), with an explicit
    /// lenient policy.
    pub fn create_new_file_with(&self, path: impl AsRef<Path>, lenient: bool) -> Result<bool> {
        let path = path.as_ref();
        self.route(
            path,
            |c, name| {
                let create = auto_create(lenient, name);
                if !name.is_empty() {
                    return c.create_new_file(name, create);
                }
                match c.mkdir(name, create) {
                    Ok(()) => Ok(true),
                    Err(Error::IllegalOperation { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            },
            |p, _| {
                if lenient {
                    native_parents(p)?;
                }
                match OpenOptions::new().write(true).create_new(true).open(p) {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                    Err(e) => Err(e.into()),
                }
            },
        )
    }

    /// Deletes a file or an empty directory. Deleting an archive path
    /// deletes the archive, which must be empty.
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.route(
            path,
            |c, name| c.delete(name),
            |p, fp| {
                if fp.is_some_and(FalsePositive::is_access_failure) {
                    return Err(Error::illegal(p.display().to_string(), "archive is not accessible"));
                }
                if fs::symlink_metadata(p)?.is_dir() {
                    Ok(fs::remove_dir(p)?)
                } else {
                    Ok(fs::remove_file(p)?)
                }
            },
        )
    }

    /// Deletes `path` and, if it is a directory or an archive, everything in
    /// it.
    pub fn delete_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(children) = self.list(path) {
            for child in children {
                self.delete_all(path.join(child))?;
            }
        }
        self.delete(path)
    }

    // ---------------------------------------------------------------------
    // Streams
    // ---------------------------------------------------------------------

    /// Opens a file for reading.
    pub fn open_read(&self, path: impl AsRef<Path>) -> Result<FsReader> {
        let path = path.as_ref();
        self.route(
            path,
            |c, name| c.input_stream(name).map(FsReader::Entry),
            |p, _| {
                let file = File::open(p)?;
                if file.metadata()?.is_dir() {
                    return Err(Error::IsADirectory {
                        path: p.to_path_buf(),
                    });
                }
                Ok(FsReader::Native(file))
            },
        )
    }

    /// Opens a file for writing, creating or truncating it.
    ///
    /// An archive entry appears as soon as the writer is open and gets its
    /// content when the writer is closed.
    pub fn open_write(&self, path: impl AsRef<Path>) -> Result<FsWriter> {
        self.open_write_with(path, self.config.lenient)
    }

    /// Like [`open_write`](Self::open_write), with an explicit lenient policy.
    pub fn open_write_with(&self, path: impl AsRef<Path>, lenient: bool) -> Result<FsWriter> {
        self.open_write_at(path.as_ref(), lenient, None)
    }

    fn open_write_at(
        &self,
        path: &Path,
        lenient: bool,
        modified: Option<Timestamp>,
    ) -> Result<FsWriter> {
        self.route(
            path,
            |c, name| {
                let template = ArchiveEntry::file(name).with_modified(modified);
                c.output_stream(name, auto_create(lenient, name), Some(&template))
                    .map(FsWriter::Entry)
            },
            |p, _| {
                if lenient {
                    native_parents(p)?;
                }
                Ok(FsWriter::Native(BufWriter::new(File::create(p)?)))
            },
        )
    }

    /// Reads a whole file.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let mut reader = self.open_read(path)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        reader.close();
        Ok(data)
    }

    /// Writes a whole file, creating or replacing it.
    pub fn write(&self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Result<()> {
        self.write_with(path, data, self.config.lenient)
    }

    /// Like [`write`](Self::write), with an explicit lenient policy.
    pub fn write_with(
        &self,
        path: impl AsRef<Path>,
        data: impl AsRef<[u8]>,
        lenient: bool,
    ) -> Result<()> {
        let mut writer = self.open_write_with(path, lenient)?;
        writer.write_all(data.as_ref())?;
        writer.close()
    }

    // ---------------------------------------------------------------------
    // Copying
    // ---------------------------------------------------------------------

    /// Copies a file and returns the number of bytes copied.
    ///
    /// Between archives of matching formats the encoded entry data is copied
    /// without decoding it.
    pub fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<u64> {
        self.copy_with(src, dst, self.config.lenient, false)
    }

    /// Copies a file and keeps its modification time.
    pub fn copy_preserving(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<u64> {
        self.copy_with(src, dst, self.config.lenient, true)
    }

    /// Copies a file with an explicit lenient policy, keeping the
    /// modification time if `preserve` is set.
    pub fn copy_with(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        lenient: bool,
        preserve: bool,
    ) -> Result<u64> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        let from = self.resolve(src);
        let to = self.resolve(dst);
        if from.path() == to.path() {
            return Err(Error::illegal(
                from.path().display().to_string(),
                "cannot copy a file onto itself",
            ));
        }

        if from.is_entry() && to.is_entry() {
            if let Some(copied) = self.copy_entries(&from, &to, lenient, preserve)? {
                return Ok(copied);
            }
        }

        let modified = if preserve {
            self.last_modified(src)
        } else {
            None
        };
        let mut reader = self.open_read(src)?;
        let mut writer = self.open_write_at(dst, lenient, modified)?;
        let copied = copy::cat(&mut reader, &mut writer, &self.config.copy)?;
        writer.close()?;
        reader.close();
        if let (Some(modified), FsWriter::Native(_)) = (modified, &writer) {
            let native = to.path();
            if let Err(e) = filetime::set_file_mtime(native, modified.as_file_time()) {
                log::warn!("couldn't preserve time of {}: {}", native.display(), e);
            }
        }
        Ok(copied)
    }

    /// Copies between two archive entries. Returns `None` if either side
    /// turns out not to be an archive entry.
    fn copy_entries(
        &self,
        from: &ResolvedPath,
        to: &ResolvedPath,
        lenient: bool,
        preserve: bool,
    ) -> Result<Option<u64>> {
        let controllers = from.inner_index().zip(to.inner_index()).and_then(|(s, d)| {
            Some((
                self.registry.controller(from, s)?,
                self.registry.controller(to, d)?,
            ))
        });
        let (Some((src, dst)), Some(src_name), Some(dst_name)) =
            (controllers, from.inner_entry_name(), to.inner_entry_name())
        else {
            return Ok(None);
        };
        match copy::copy_entry(
            &src,
            src_name,
            &dst,
            dst_name,
            auto_create(lenient, dst_name),
            preserve,
            &self.config.copy,
        ) {
            Ok(copied) => Ok(Some(copied)),
            Err(e) if e.is_false_positive() => {
                log::trace!("copying through the generic path: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // ---------------------------------------------------------------------
    // Updates
    // ---------------------------------------------------------------------

    /// Commits pending changes of the archive at `path` and of all archives
    /// nested in it. Archives enclosing `path` are left touched.
    pub fn update(&self, path: impl AsRef<Path>) -> Result<UpdateReport> {
        self.update_with(path, &UpdateOptions::sync())
    }

    /// Like [`update`](Self::update), with explicit options.
    pub fn update_with(
        &self,
        path: impl AsRef<Path>,
        options: &UpdateOptions,
    ) -> Result<UpdateReport> {
        let root = self.resolve(path).path().to_path_buf();
        self.registry
            .update_all(|target| target.starts_with(&root), options)
    }

    /// Commits pending changes of every archive in the registry.
    pub fn sync(&self) -> Result<UpdateReport> {
        self.registry.update_all(|_| true, &UpdateOptions::sync())
    }

    /// Commits everything and unmounts all archives of the registry.
    ///
    /// Streams of other threads get [`FsConfig::stream_wait_timeout`] to
    /// close before they are closed forcibly.
    pub fn umount(&self) -> Result<UpdateReport> {
        let options = UpdateOptions::umount()
            .wait_input_streams(true)
            .wait_output_streams(true)
            .timeout(self.config.stream_wait_timeout);
        self.registry.update_all(|_| true, &options)
    }

    /// Discards pending changes of the archive at `path` and all archives
    /// nested in it.
    pub fn reset(&self, path: impl AsRef<Path>) {
        let root: PathBuf = self.resolve(path).path().to_path_buf();
        self.registry.reset_all(|target| target.starts_with(&root));
    }

    /// Returns a statistics snapshot of the registry.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }
}
