//! Archive controllers.
//!
//! An [`ArchiveController`] owns everything that belongs to one archive
//! path: the mounted [`VirtualFileSystem`], the input session reading the
//! current archive file, the output session collecting changes, and the
//! lock that serializes them. Controllers of nested archives refer to the
//! controller of their enclosing archive and the entry name they live under.
//!
//! # Life cycle
//!
//! A controller starts unmounted. The first access mounts the archive: the
//! target file (or, for a nested archive, the entry extracted into a temp
//! file) is opened with the archive driver and its entries populate the
//! virtual filesystem. The first mutation opens an output session. An
//! [update](ArchiveController::update) writes all entries into the output
//! archive, copies it over the target or into the enclosing archive, and
//! returns to the unmounted state; [reset](ArchiveController::reset)
//! discards everything instead.
//!
//! # Locking
//!
//! Queries hold the read lock, mutations and updates the write lock. The
//! state mutex is only held for short sections and never while calling into
//! another controller. Controllers only ever call into their enclosing
//! controller, so locks are always taken from the inside out.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tempfile::TempPath;

use crate::config::UpdateOptions;
use crate::driver::{ArchiveDriver, ArchiveEntry, EntryKind, InputArchive, RawEntry};
use crate::entry_name::{self, ROOT};
use crate::error::{Diagnostic, FalsePositive, FalsePositiveKind, Severity, UpdateReport};
use crate::fs::{TouchHook, VirtualFileSystem};
use crate::lock::{ReentrantRwLock, lock_or_recover};
use crate::registry::Registry;
use crate::stats::{CountingReader, CountingWriter, IoCounters};
use crate::stream::{EntryReader, EntryWriter, OutputSink, StreamTracker, WrittenEntry};
use crate::timestamp::Timestamp;
use crate::{Error, Result};

const TEMP_PREFIX: &str = "afs";
const TEMP_SUFFIX: &str = ".tmp";

/// Whether a missing archive may be created while mounting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AutoCreate {
    /// Fail with [`Error::ArchiveNotFound`].
    Never,
    /// Create the archive, but neither missing parent directories nor
    /// enclosing archives.
    Archive,
    /// Create the archive and everything it needs.
    WithParents,
}

impl AutoCreate {
    pub(crate) fn creates(self) -> bool {
        self != Self::Never
    }

    pub(crate) fn parents(self) -> bool {
        self == Self::WithParents
    }

    fn for_enclosing(self) -> Self {
        match self {
            Self::WithParents => Self::WithParents,
            _ => Self::Never,
        }
    }
}

/// A file backing an input or output session.
#[derive(Debug)]
enum BackingFile {
    /// The archive's own target file.
    Target(PathBuf),
    /// A temp file, deleted on drop.
    Temp(TempPath),
}

impl BackingFile {
    fn path(&self) -> &Path {
        match self {
            Self::Target(path) => path,
            Self::Temp(temp) => temp,
        }
    }
}

struct InputSession {
    file: BackingFile,
    archive: Arc<dyn InputArchive>,
}

struct OutputSession {
    file: BackingFile,
    sink: Arc<Mutex<OutputSink>>,
    tracker: Arc<StreamTracker>,
}

struct State {
    fs: Option<VirtualFileSystem>,
    input: Option<InputSession>,
    output: Option<OutputSession>,
    /// Readers of the current mount.
    readers: Arc<StreamTracker>,
    /// The most recent archive file, mounted instead of the target next time.
    warm: Option<BackingFile>,
    /// `warm` holds changes that are not in the target yet.
    needs_reassembly: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            fs: None,
            input: None,
            output: None,
            readers: Arc::new(StreamTracker::new()),
            warm: None,
            needs_reassembly: false,
        }
    }
}

/// Where an archive's bytes live.
enum Host {
    /// A file in the native filesystem.
    Native,
    /// An entry of an enclosing archive.
    Entry(Arc<ArchiveController>, String),
}

/// What mounting found.
enum Mounted {
    Existing(InputSession, VirtualFileSystem),
    Missing,
}

/// The coordinator of one archive path.
pub struct ArchiveController {
    target: PathBuf,
    enclosing: Option<(Arc<ArchiveController>, String)>,
    driver: Arc<dyn ArchiveDriver>,
    lock: ReentrantRwLock,
    state: Mutex<State>,
    registry: Weak<Registry>,
    this: Weak<ArchiveController>,
    temp_dir: Option<PathBuf>,
    counters: Arc<IoCounters>,
}

impl fmt::Debug for ArchiveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveController")
            .field("target", &self.target)
            .field("driver", &self.driver.name())
            .field(
                "enclosing",
                &self.enclosing.as_ref().map(|(c, e)| (c.target(), e)),
            )
            .finish_non_exhaustive()
    }
}

impl ArchiveController {
    pub(crate) fn new(
        target: PathBuf,
        enclosing: Option<(Arc<ArchiveController>, String)>,
        driver: Arc<dyn ArchiveDriver>,
        registry: &Arc<Registry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            target,
            enclosing,
            driver,
            lock: ReentrantRwLock::new(),
            state: Mutex::new(State::default()),
            registry: Arc::downgrade(registry),
            this: this.clone(),
            temp_dir: registry.config().temp_dir.clone(),
            counters: Arc::clone(registry.counters()),
        })
    }

    /// Returns the archive's path.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Returns the archive driver.
    pub fn driver(&self) -> &Arc<dyn ArchiveDriver> {
        &self.driver
    }

    /// Returns the enclosing controller and the entry name of this archive
    /// in it, or `None` for an archive in the native filesystem.
    pub fn enclosing(&self) -> Option<(&Arc<ArchiveController>, &str)> {
        self.enclosing.as_ref().map(|(c, e)| (c, e.as_str()))
    }

    /// Returns `true` if the archive is mounted.
    pub fn is_mounted(&self) -> bool {
        lock_or_recover(&self.state).fs.is_some()
    }

    /// Returns `true` if the archive has uncommitted changes.
    pub fn is_touched(&self) -> bool {
        let state = lock_or_recover(&self.state);
        state.needs_reassembly || state.fs.as_ref().is_some_and(VirtualFileSystem::is_touched)
    }

    fn temp_file(&self) -> Result<TempPath> {
        let dir = self.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(dir)?;
        Ok(file.into_temp_path())
    }

    fn false_positive(&self, kind: FalsePositiveKind, cause: Option<Error>) -> Error {
        let mut fp = FalsePositive::new(kind, &self.target);
        if let Some(cause) = cause {
            fp = fp.with_cause(cause);
        }
        Error::FalsePositive(fp)
    }

    fn pin(&self) {
        if let (Some(registry), Some(this)) = (self.registry.upgrade(), self.this.upgrade()) {
            registry.pin(this);
        }
    }

    fn release(&self, forget: bool) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.target, forget);
        }
    }

    // ---------------------------------------------------------------------
    // Mounting
    // ---------------------------------------------------------------------

    /// Returns `true` if the archive lives directly in the native filesystem.
    fn uses_native_target(&self) -> bool {
        match &self.enclosing {
            None => true,
            Some((encl, _)) => encl.target.is_dir(),
        }
    }

    /// Finds where the archive's bytes live, mounting enclosing archives on
    /// the way. Enclosing archives that turn out to be directory entries are
    /// skipped by prefixing the entry name.
    fn host(&self, create: AutoCreate) -> Result<Host> {
        let Some((encl, entry)) = &self.enclosing else {
            return Ok(Host::Native);
        };
        let (mut encl, mut entry) = (Arc::clone(encl), entry.clone());
        loop {
            match encl.ensure_mounted(create) {
                Ok(()) => return Ok(Host::Entry(encl, entry)),
                Err(Error::FalsePositive(fp)) if fp.archive() == encl.target() => match fp.kind() {
                    FalsePositiveKind::Native if encl.target.is_dir() => return Ok(Host::Native),
                    FalsePositiveKind::DirectoryEntry => {
                        let Some((outer, outer_entry)) = &encl.enclosing else {
                            return Err(Error::FalsePositive(fp));
                        };
                        entry = entry_name::join(outer_entry, &entry);
                        encl = Arc::clone(outer);
                    }
                    FalsePositiveKind::Native | FalsePositiveKind::FileEntry => {
                        return Err(Error::NotADirectory {
                            path: encl.target.clone(),
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Mounts the archive unless it is mounted already.
    pub(crate) fn ensure_mounted(&self, create: AutoCreate) -> Result<()> {
        if self.is_mounted() {
            return Ok(());
        }
        self.lock.run_write_locked(|| {
            if self.is_mounted() {
                return Ok(());
            }
            self.mount(create)
        })
    }

    fn mount(&self, create: AutoCreate) -> Result<()> {
        let warm = lock_or_recover(&self.state).warm.take();
        let mounted = match warm {
            Some(file) => self.open_input(file, false),
            None => match self.host(create.for_enclosing())? {
                Host::Native => self.mount_native(create),
                Host::Entry(encl, entry) => self.mount_nested(&encl, &entry, create),
            },
        }?;
        let mut state = lock_or_recover(&self.state);
        match mounted {
            Mounted::Existing(input, fs) => {
                log::debug!(
                    "mounted {} ({} entries)",
                    self.target.display(),
                    fs.len() - 1
                );
                state.input = Some(input);
                state.fs = Some(fs);
            }
            Mounted::Missing => {
                log::debug!("creating archive {}", self.target.display());
                let State { output, input, .. } = &mut *state;
                let fs = VirtualFileSystem::new_empty(&mut || {
                    self.ensure_output(output, input.as_ref())
                })?;
                state.fs = Some(fs);
            }
        }
        self.counters.record_mount();
        Ok(())
    }

    fn open_input(&self, file: BackingFile, read_only: bool) -> Result<Mounted> {
        let modified = fs::metadata(file.path())
            .and_then(|m| m.modified())
            .map(Timestamp::from_system_time)
            .ok();
        self.open_input_with(file, read_only, modified)
    }

    fn open_input_with(
        &self,
        file: BackingFile,
        read_only: bool,
        modified: Option<Timestamp>,
    ) -> Result<Mounted> {
        let archive: Arc<dyn InputArchive> = Arc::from(self.driver.open_input(file.path())?);
        let fs = VirtualFileSystem::from_entries(archive.entries(), modified, read_only);
        Ok(Mounted::Existing(InputSession { file, archive }, fs))
    }

    fn mount_native(&self, create: AutoCreate) -> Result<Mounted> {
        match fs::metadata(&self.target) {
            Ok(meta) if meta.is_file() => {
                let read_only = meta.permissions().readonly();
                let file = BackingFile::Target(self.target.clone());
                self.open_input(file, read_only)
                    .map_err(|e| self.false_positive(FalsePositiveKind::Native, Some(e)))
            }
            Ok(_) => Err(self.false_positive(FalsePositiveKind::Native, None)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !create.creates() {
                    return Err(Error::ArchiveNotFound {
                        path: self.target.clone(),
                    });
                }
                if create.parents() {
                    if let Some(parent) = self.target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                }
                Ok(Mounted::Missing)
            }
            Err(e) => Err(self.false_positive(FalsePositiveKind::Native, Some(e.into()))),
        }
    }

    fn mount_nested(
        &self,
        encl: &ArchiveController,
        entry: &str,
        create: AutoCreate,
    ) -> Result<Mounted> {
        match encl.entry(entry)? {
            Some(found) if found.is_directory() => {
                Err(self.false_positive(FalsePositiveKind::DirectoryEntry, None))
            }
            Some(found) => {
                let temp = encl.extract(entry)?;
                log::debug!(
                    "extracted {} to {}",
                    self.target.display(),
                    temp.display()
                );
                let read_only = encl.is_read_only()?;
                self.open_input_with(BackingFile::Temp(temp), read_only, found.modified())
                    .map_err(|e| self.false_positive(FalsePositiveKind::FileEntry, Some(e)))
            }
            None if create.creates() => {
                encl.link(entry, EntryKind::File, create)?;
                Ok(Mounted::Missing)
            }
            None => Err(Error::ArchiveNotFound {
                path: self.target.clone(),
            }),
        }
    }

    /// Opens the output session if there is none yet.
    ///
    /// The target is written directly if it is a new archive in the native
    /// filesystem; otherwise output goes to a temp file.
    fn ensure_output(
        &self,
        output: &mut Option<OutputSession>,
        input: Option<&InputSession>,
    ) -> Result<()> {
        if output.is_some() {
            return Ok(());
        }
        let file = if input.is_none() && self.uses_native_target() && !self.target.exists() {
            BackingFile::Target(self.target.clone())
        } else {
            BackingFile::Temp(self.temp_file()?)
        };
        let source = input.map(|i| &*i.archive);
        let archive = self.driver.create_output(file.path(), source)?;
        log::debug!(
            "opened output for {} at {}",
            self.target.display(),
            file.path().display()
        );
        *output = Some(OutputSession {
            file,
            sink: Arc::new(Mutex::new(OutputSink::new(archive))),
            tracker: Arc::new(StreamTracker::new()),
        });
        self.pin();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Locked access helpers
    // ---------------------------------------------------------------------

    fn read_fs<T>(
        &self,
        f: impl FnOnce(&VirtualFileSystem, Option<&OutputSession>) -> T,
    ) -> Result<T> {
        let _read = self.lock.read();
        self.ensure_mounted(AutoCreate::Never)?;
        let state = lock_or_recover(&self.state);
        let fs = state.fs.as_ref().ok_or_else(|| Error::ArchiveNotFound {
            path: self.target.clone(),
        })?;
        Ok(f(fs, state.output.as_ref()))
    }

    /// Runs a mutation of the filesystem under the write lock.
    fn mutate<T>(
        &self,
        create: AutoCreate,
        f: impl FnOnce(&mut VirtualFileSystem, TouchHook<'_>) -> Result<T>,
    ) -> Result<T> {
        self.lock.run_write_locked(|| {
            self.ensure_mounted(create)?;
            let mut state = lock_or_recover(&self.state);
            let State {
                fs, output, input, ..
            } = &mut *state;
            let fs = fs.as_mut().ok_or_else(|| Error::ArchiveNotFound {
                path: self.target.clone(),
            })?;
            if fs.is_read_only() {
                return Err(Error::ReadOnly {
                    archive: self.target.clone(),
                });
            }
            f(fs, &mut || self.ensure_output(output, input.as_ref()))
        })
    }

    fn written(&self, name: &str) -> Option<WrittenEntry> {
        let state = lock_or_recover(&self.state);
        let output = state.output.as_ref()?;
        let sink = lock_or_recover(&output.sink);
        sink.written.get(entry_name::file_key(name)).copied()
    }

    /// Commits the archive without touching the enclosing archive, so that
    /// entries with new data can be read or written again.
    fn update_local(&self) -> Result<()> {
        self.lock.run_write_locked(|| {
            let mut report = UpdateReport::new();
            self.update_locked(&UpdateOptions::local(), &mut report);
            report.finish().map(drop)
        })
    }

    /// Makes sure `name` has no committed data in the current output
    /// session, and no open writer.
    fn settle(&self, name: &str, create: AutoCreate) -> Result<()> {
        match self.written(name) {
            Some(WrittenEntry::Pending) => Err(Error::EntryBusy {
                archive: self.target.clone(),
                entry: name.to_string(),
            }),
            Some(WrittenEntry::Done(_)) => {
                self.update_local()?;
                self.ensure_mounted(create)
            }
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Returns `true` if `name` exists. The empty name is the archive root.
    pub fn exists(&self, name: &str) -> Result<bool> {
        self.read_fs(|fs, _| fs.exists(name))
    }

    /// Returns `true` if `name` is a file entry.
    pub fn is_file(&self, name: &str) -> Result<bool> {
        self.read_fs(|fs, _| fs.is_file(name))
    }

    /// Returns `true` if `name` is a directory entry or the root.
    pub fn is_directory(&self, name: &str) -> Result<bool> {
        self.read_fs(|fs, _| fs.is_directory(name))
    }

    /// Returns `true` if the archive cannot be modified.
    pub fn is_read_only(&self) -> Result<bool> {
        self.read_fs(|fs, _| fs.is_read_only())
    }

    /// Looks up `name`, as a file first.
    pub fn entry(&self, name: &str) -> Result<Option<ArchiveEntry>> {
        self.read_fs(|fs, _| fs.lookup(name).cloned())
    }

    /// Lists the children of directory `name`, sorted by name; `None` if it
    /// is not a directory.
    pub fn list(&self, name: &str) -> Result<Option<Vec<String>>> {
        self.read_fs(|fs, _| {
            fs.list(name).map(|mut children| {
                children.sort();
                children
            })
        })
    }

    /// Returns the size of file `name`; 0 if it is unknown or not a file.
    pub fn length(&self, name: &str) -> Result<u64> {
        self.read_fs(|fs, output| {
            let written = output
                .and_then(|o| lock_or_recover(&o.sink).size_of(entry_name::file_key(name)));
            written.unwrap_or_else(|| fs.length(name))
        })
    }

    /// Returns the modification time of `name`, if known.
    pub fn last_modified(&self, name: &str) -> Result<Option<Timestamp>> {
        self.read_fs(|fs, _| fs.last_modified(name))
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Sets the modification time of `name`. Returns `false` if it does not
    /// exist or the archive is read-only.
    ///
    /// An entry written in the current session is committed locally first,
    /// since its header is already in the output archive.
    pub fn set_last_modified(&self, name: &str, modified: Timestamp) -> Result<bool> {
        let result = self.lock.run_write_locked(|| {
            self.ensure_mounted(AutoCreate::Never)?;
            self.settle(name, AutoCreate::Never)?;
            self.mutate(AutoCreate::Never, |fs, hook| {
                fs.set_last_modified(name, modified, hook)
            })
        });
        match result {
            Err(Error::ReadOnly { .. }) => Ok(false),
            other => other,
        }
    }

    /// Creates directory `name`. The empty name creates the archive itself.
    pub(crate) fn mkdir(&self, name: &str, create: AutoCreate) -> Result<()> {
        if name.is_empty() {
            return self.lock.run_write_locked(|| match self.ensure_mounted(AutoCreate::Never) {
                Ok(()) => Err(Error::illegal(name, "archive exists already")),
                Err(Error::ArchiveNotFound { path }) if path == self.target => {
                    self.ensure_mounted(create)
                }
                Err(e) => Err(e),
            });
        }
        self.mutate(create, |fs, hook| fs.mkdir(name, create.parents(), hook))
    }

    /// Creates an empty file entry. Returns `false` if `name` exists.
    pub(crate) fn create_new_file(&self, name: &str, create: AutoCreate) -> Result<bool> {
        self.mutate(create, |fs, hook| {
            if fs.exists(name) {
                return Ok(false);
            }
            fs.begin_create_and_link(name, EntryKind::File, create.parents(), None)?
                .commit(fs, hook)?;
            Ok(true)
        })
    }

    /// Links a new entry without content.
    fn link(&self, name: &str, kind: EntryKind, create: AutoCreate) -> Result<ArchiveEntry> {
        self.mutate(create.for_enclosing(), |fs, hook| {
            fs.begin_create_and_link(name, kind, create.parents(), None)?
                .commit(fs, hook)
        })
    }

    /// Deletes file or empty directory `name`. The empty name deletes the
    /// archive itself, which must be empty.
    pub fn delete(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return self.delete_archive();
        }
        self.mutate(AutoCreate::Never, |fs, hook| fs.delete(name, hook))
    }

    fn delete_archive(&self) -> Result<()> {
        self.lock.run_write_locked(|| {
            self.ensure_mounted(AutoCreate::Never)?;
            let old = {
                let mut state = lock_or_recover(&self.state);
                let fs = state.fs.as_ref().ok_or_else(|| Error::ArchiveNotFound {
                    path: self.target.clone(),
                })?;
                if fs.is_read_only() {
                    return Err(Error::ReadOnly {
                        archive: self.target.clone(),
                    });
                }
                if !fs.is_empty() {
                    return Err(Error::illegal("", "archive is not empty"));
                }
                let streams = state.readers.open_count()
                    + state.output.as_ref().map_or(0, |o| o.tracker.open_count());
                if streams > 0 {
                    return Err(Error::Busy {
                        archive: self.target.clone(),
                        streams,
                    });
                }
                mem::take(&mut *state)
            };
            drop(old);
            match self.host(AutoCreate::Never)? {
                Host::Native => match fs::remove_file(&self.target) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                },
                Host::Entry(encl, entry) => encl.delete(&entry)?,
            }
            log::debug!("deleted archive {}", self.target.display());
            self.release(true);
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Entry streams
    // ---------------------------------------------------------------------

    /// Opens file entry `name` for reading.
    ///
    /// If the entry was written since the last update, the archive is
    /// updated first so the reader sees the new content.
    pub fn input_stream(&self, name: &str) -> Result<EntryReader> {
        let _read = self.lock.read();
        self.ensure_mounted(AutoCreate::Never)?;
        if self.written(name).is_some() {
            self.settle(name, AutoCreate::Never)?;
        }
        let state = lock_or_recover(&self.state);
        let fs = state.fs.as_ref().ok_or_else(|| Error::ArchiveNotFound {
            path: self.target.clone(),
        })?;
        match fs.lookup(name) {
            None => Err(Error::EntryNotFound {
                archive: self.target.clone(),
                entry: name.to_string(),
            }),
            Some(entry) if entry.is_directory() => Err(Error::IsADirectory {
                path: self.target.join(name),
            }),
            Some(entry) => {
                let data: Box<dyn Read + Send> = match &state.input {
                    Some(input) if input.archive.entry(entry.name()).is_some() => {
                        input.archive.open_entry(entry.name())?
                    }
                    _ => Box::new(io::empty()),
                };
                EntryReader::open(&state.readers, data)
            }
        }
    }

    /// Opens file entry `name` for writing, creating or replacing it.
    ///
    /// The entry appears in the archive once the writer is open; its content
    /// is committed when the writer is closed.
    pub(crate) fn output_stream(
        &self,
        name: &str,
        create: AutoCreate,
        template: Option<&ArchiveEntry>,
    ) -> Result<EntryWriter> {
        self.lock.run_write_locked(|| {
            if name.is_empty() {
                self.ensure_mounted(AutoCreate::Never)?;
                return Err(Error::IsADirectory {
                    path: self.target.clone(),
                });
            }
            self.ensure_mounted(create)?;
            self.settle(name, create)?;
            let temp_dir = self.temp_dir.clone();
            let mut state = lock_or_recover(&self.state);
            let State {
                fs, output, input, ..
            } = &mut *state;
            let fs = fs.as_mut().ok_or_else(|| Error::ArchiveNotFound {
                path: self.target.clone(),
            })?;
            if fs.is_read_only() {
                return Err(Error::ReadOnly {
                    archive: self.target.clone(),
                });
            }
            let delta = fs.begin_create_and_link(name, EntryKind::File, create.parents(), template)?;
            self.ensure_output(output, input.as_ref())?;
            let writer = {
                let out = output.as_ref().ok_or(Error::StreamClosed)?;
                let entry = delta.entry().clone();
                lock_or_recover(&out.sink)
                    .written
                    .insert(entry.name().to_string(), WrittenEntry::Pending);
                match EntryWriter::open(&out.tracker, &out.sink, entry, temp_dir.as_deref()) {
                    Ok(writer) => writer,
                    Err(e) => {
                        lock_or_recover(&out.sink).written.remove(entry_name::file_key(name));
                        return Err(e);
                    }
                }
            };
            match delta.commit(fs, &mut || self.ensure_output(output, input.as_ref())) {
                Ok(_) => Ok(writer),
                Err(e) => {
                    writer.abandon();
                    Err(e)
                }
            }
        })
    }

    /// Writes an entry with the content of `data` straight into the output
    /// archive.
    pub(crate) fn write_entry_from(
        &self,
        name: &str,
        template: &ArchiveEntry,
        create: AutoCreate,
        data: &mut dyn Read,
    ) -> Result<u64> {
        self.put_entry(name, template, create, |sink, entry| {
            sink.write(entry, data).map(Some)
        })?
        .ok_or(Error::StreamClosed)
    }

    /// Writes an entry with already encoded content. Returns `None` if the
    /// output archive cannot take it.
    pub(crate) fn write_raw(
        &self,
        name: &str,
        template: &ArchiveEntry,
        create: AutoCreate,
        raw: RawEntry,
    ) -> Result<Option<u64>> {
        self.put_entry(name, template, create, |sink, entry| {
            if !sink.archive.accepts_raw(&raw) {
                return Ok(None);
            }
            let entry = entry.clone().with_size(raw.size);
            sink.write_raw(&entry, raw).map(Some)
        })
    }

    fn put_entry(
        &self,
        name: &str,
        template: &ArchiveEntry,
        create: AutoCreate,
        write: impl FnOnce(&mut OutputSink, &ArchiveEntry) -> Result<Option<u64>>,
    ) -> Result<Option<u64>> {
        self.lock.run_write_locked(|| {
            self.ensure_mounted(create)?;
            if name.is_empty() {
                return Err(Error::IsADirectory {
                    path: self.target.clone(),
                });
            }
            self.settle(name, create)?;
            let mut state = lock_or_recover(&self.state);
            let State {
                fs, output, input, ..
            } = &mut *state;
            let fs = fs.as_mut().ok_or_else(|| Error::ArchiveNotFound {
                path: self.target.clone(),
            })?;
            if fs.is_read_only() {
                return Err(Error::ReadOnly {
                    archive: self.target.clone(),
                });
            }
            let delta =
                fs.begin_create_and_link(name, EntryKind::File, create.parents(), Some(template))?;
            self.ensure_output(output, input.as_ref())?;
            let entry = match template.size() {
                Some(size) => delta.entry().clone().with_size(size),
                None => delta.entry().clone(),
            };
            let written = {
                let out = output.as_ref().ok_or(Error::StreamClosed)?;
                let mut sink = lock_or_recover(&out.sink);
                write(&mut sink, &entry)?
            };
            let Some(size) = written else {
                return Ok(None);
            };
            delta.commit(fs, &mut || self.ensure_output(output, input.as_ref()))?;
            fs.set_length(entry.name(), size);
            Ok(Some(size))
        })
    }

    /// Opens the encoded content of file entry `name` for direct data
    /// copying. The data stream is tracked like any other reader.
    pub(crate) fn input_raw(&self, name: &str) -> Result<Option<(ArchiveEntry, RawEntry)>> {
        let _read = self.lock.read();
        self.ensure_mounted(AutoCreate::Never)?;
        if self.written(name).is_some() {
            self.settle(name, AutoCreate::Never)?;
        }
        let state = lock_or_recover(&self.state);
        let Some(entry) = state.fs.as_ref().and_then(|fs| fs.lookup(name)).cloned() else {
            return Ok(None);
        };
        if !entry.is_file() {
            return Ok(None);
        }
        let Some(input) = &state.input else {
            return Ok(None);
        };
        if input.archive.entry(entry.name()).is_none() {
            return Ok(None);
        }
        let Some(raw) = input.archive.open_raw(entry.name())? else {
            return Ok(None);
        };
        let data = EntryReader::open(&state.readers, raw.data)?;
        Ok(Some((
            entry,
            RawEntry {
                data: Box::new(data),
                ..raw
            },
        )))
    }

    /// Copies file entry `name` into a new temp file.
    fn extract(&self, name: &str) -> Result<TempPath> {
        let mut reader = self.input_stream(name)?;
        let temp = self.temp_file()?;
        let mut file = BufWriter::new(File::create(&temp)?);
        io::copy(&mut reader, &mut file)?;
        file.flush()?;
        reader.close();
        Ok(temp)
    }

    // ---------------------------------------------------------------------
    // Update and reset
    // ---------------------------------------------------------------------

    /// Commits pending changes of this archive.
    ///
    /// Changes of nested archives are not included; use
    /// [`Registry::update_all`](crate::Registry::update_all) to commit a whole
    /// tree of archives inside out.
    pub fn update(&self, options: &UpdateOptions) -> Result<UpdateReport> {
        let mut report = UpdateReport::new();
        self.lock
            .run_write_locked(|| self.update_locked(options, &mut report));
        report.finish()
    }

    pub(crate) fn update_into(&self, options: &UpdateOptions, report: &mut UpdateReport) {
        self.lock.run_write_locked(|| self.update_locked(options, report));
    }

    /// Checks the streams of one session. Returns `false` if the update must
    /// not proceed.
    fn check_busy(
        &self,
        tracker: &StreamTracker,
        wait: bool,
        close: bool,
        kind: &str,
        options: &UpdateOptions,
        report: &mut UpdateReport,
    ) -> bool {
        let mut busy = tracker.other_threads_count();
        if busy > 0 && wait {
            busy = tracker.wait_other_threads(options.timeout);
        }
        if busy > 0 && !close {
            report.push(
                Diagnostic::new(
                    Severity::Busy,
                    &self.target,
                    format!("{} {} stream(s) still open", busy, kind),
                )
                .with_cause(Error::Busy {
                    archive: self.target.clone(),
                    streams: busy,
                }),
            );
            return false;
        }
        true
    }

    fn update_locked(&self, options: &UpdateOptions, report: &mut UpdateReport) {
        let (touched, reassemble, readers, writers) = {
            let state = lock_or_recover(&self.state);
            let touched = state.fs.as_ref().is_some_and(VirtualFileSystem::is_touched);
            let reassemble = options.reassemble && (touched || state.needs_reassembly);
            let mounted = state.fs.is_some() || state.warm.is_some();
            if !mounted || (!touched && !reassemble && !options.umount) {
                return;
            }
            (
                touched,
                reassemble,
                Arc::clone(&state.readers),
                state.output.as_ref().map(|o| Arc::clone(&o.tracker)),
            )
        };

        // 1. streams, output first
        if let Some(writers) = &writers {
            if !self.check_busy(
                writers,
                options.wait_output_streams,
                options.close_output_streams,
                "output",
                options,
                report,
            ) {
                return;
            }
        }
        if !self.check_busy(
            &readers,
            options.wait_input_streams,
            options.close_input_streams,
            "input",
            options,
            report,
        ) {
            return;
        }
        let closed = readers.close_all();
        if closed.disconnected > 0 {
            report.warn(
                &self.target,
                format!("forcibly closed {} input stream(s)", closed.disconnected),
            );
        }
        if let Some(writers) = &writers {
            let closed = writers.close_all();
            if closed.disconnected > 0 {
                report.warn(
                    &self.target,
                    format!("forcibly closed {} output stream(s)", closed.disconnected),
                );
            }
            for e in closed.errors {
                report.push(
                    Diagnostic::new(
                        Severity::Warning,
                        &self.target,
                        "lost data of a forcibly closed output stream",
                    )
                    .with_cause(e),
                );
            }
        }

        let old = mem::take(&mut *lock_or_recover(&self.state));
        let was_pending = old.needs_reassembly;
        let started = Instant::now();

        // 2. write the new archive
        let (latest, modified) = if touched {
            let (Some(fs), Some(output)) = (old.fs, old.output) else {
                return;
            };
            let modified = fs.root().modified();
            let written = self.write_out(&fs, old.input.as_ref(), &output.sink, report);
            drop(old.input);
            if let Err(e) = written {
                drop(output.sink);
                if let BackingFile::Target(path) = &output.file {
                    if let Err(e) = fs::remove_file(path) {
                        log::warn!("couldn't delete {}: {}", path.display(), e);
                    }
                }
                report.push(
                    Diagnostic::new(
                        Severity::Fatal,
                        &self.target,
                        "couldn't write archive; all changes are lost",
                    )
                    .with_cause(e),
                );
                self.release(options.umount);
                return;
            }
            drop(output.sink);
            if let Some(modified) = modified {
                if let Err(e) = filetime::set_file_mtime(output.file.path(), modified.as_file_time()) {
                    report.warn(
                        &self.target,
                        format!("couldn't set modification time: {}", e),
                    );
                }
            }
            self.counters.record_update(started.elapsed());
            (Some(output.file), modified)
        } else {
            let file = old.input.map(|i| i.file).or(old.warm);
            let modified = file.as_ref().and_then(|f| {
                fs::metadata(f.path())
                    .and_then(|m| m.modified())
                    .map(Timestamp::from_system_time)
                    .ok()
            });
            (file, modified)
        };

        // 3. reassemble
        let mut keep = None;
        let mut needs_reassembly = false;
        if let Some(latest) = latest {
            let is_target = matches!(latest, BackingFile::Target(_));
            if reassemble {
                match self.reassemble(&latest, modified) {
                    Ok(Host::Native) => {}
                    Ok(Host::Entry(..)) => keep = Some(latest),
                    Err(e) => {
                        report.push(
                            Diagnostic::new(
                                Severity::Fatal,
                                &self.target,
                                "couldn't write archive back; changes are kept in a temp file",
                            )
                            .with_cause(e),
                        );
                        keep = Some(latest);
                        needs_reassembly = true;
                    }
                }
            } else if !is_target || was_pending {
                needs_reassembly = touched || was_pending;
                keep = Some(latest);
            }
        }

        // 4. release sessions
        let mut state = lock_or_recover(&self.state);
        state.needs_reassembly = needs_reassembly;
        state.warm = if options.umount && !needs_reassembly {
            None
        } else {
            keep
        };
        drop(state);
        log::debug!(
            "updated {}{}",
            self.target.display(),
            if options.umount { " and unmounted" } else { "" }
        );
        if !needs_reassembly {
            self.release(options.umount);
        }
    }

    fn write_out(
        &self,
        fs: &VirtualFileSystem,
        input: Option<&InputSession>,
        sink: &Mutex<OutputSink>,
        report: &mut UpdateReport,
    ) -> Result<()> {
        let mut sink = lock_or_recover(sink);
        let mut stale: Vec<_> = sink
            .written
            .keys()
            .filter(|name| !fs.is_file(name))
            .cloned()
            .collect();
        stale.sort();
        for name in stale {
            report.warn(&self.target, format!("couldn't remove archive entry {}", name));
        }
        for entry in fs.entries_children_first() {
            let name = entry.name();
            if name == ROOT || sink.written.contains_key(name) {
                continue;
            }
            if entry.is_directory() {
                if entry.modified().is_none() {
                    log::trace!("skipping ghost directory {}", name);
                } else {
                    log::trace!("writing directory {}", name);
                    sink.archive.write_directory(entry)?;
                }
                continue;
            }
            match input.filter(|i| i.archive.entry(name).is_some()) {
                Some(input) => self.copy_from_input(input, entry, &mut sink, report)?,
                None => {
                    log::trace!("writing empty entry {}", name);
                    sink.archive
                        .write_entry(&entry.clone().with_size(0), &mut io::empty())?;
                }
            }
        }
        sink.archive.finish()
    }

    fn copy_from_input(
        &self,
        input: &InputSession,
        entry: &ArchiveEntry,
        sink: &mut OutputSink,
        report: &mut UpdateReport,
    ) -> Result<()> {
        let name = entry.name();
        match input.archive.open_raw(name) {
            Ok(Some(raw)) if sink.archive.accepts_raw(&raw) => {
                log::trace!("copying raw data of {}", name);
                let counters = Arc::clone(&self.counters);
                let raw = RawEntry {
                    data: Box::new(CountingReader::new(raw.data, counters)),
                    ..raw
                };
                sink.archive.write_raw(entry, raw)?;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => log::trace!("no raw data for {}: {}", name, e),
        }
        match input.archive.open_entry(name) {
            Ok(data) => {
                log::trace!("copying {}", name);
                let mut data = CountingReader::new(data, Arc::clone(&self.counters));
                sink.archive.write_entry(entry, &mut data)?;
            }
            Err(e) => {
                report.push(
                    Diagnostic::new(
                        Severity::Warning,
                        &self.target,
                        format!("couldn't read entry {}; writing it empty", name),
                    )
                    .with_cause(e),
                );
                sink.archive
                    .write_entry(&entry.clone().with_size(0), &mut io::empty())?;
            }
        }
        Ok(())
    }

    /// Writes `latest` over the target or into the enclosing archive.
    fn reassemble(&self, latest: &BackingFile, modified: Option<Timestamp>) -> Result<Host> {
        let host = self.host(AutoCreate::Never)?;
        match &host {
            Host::Native => {
                if let BackingFile::Temp(temp) = latest {
                    log::debug!("copying {} to {}", temp.display(), self.target.display());
                    let mut src = File::open(temp)?;
                    let dst = File::create(&self.target)?;
                    let mut dst =
                        CountingWriter::new(BufWriter::new(dst), Arc::clone(&self.counters));
                    io::copy(&mut src, &mut dst)?;
                    dst.flush()?;
                    drop(dst);
                    if let Some(modified) = modified {
                        filetime::set_file_mtime(&self.target, modified.as_file_time())?;
                    }
                }
            }
            Host::Entry(encl, entry) => {
                log::debug!(
                    "writing {} into {}",
                    self.target.display(),
                    encl.target().display()
                );
                let file = File::open(latest.path())?;
                let size = file.metadata()?.len();
                let template = ArchiveEntry::file(entry.as_str())
                    .with_size(size)
                    .with_modified(modified);
                let mut data = CountingReader::new(file, Arc::clone(&self.counters));
                encl.write_entry_from(entry, &template, AutoCreate::Never, &mut data)?;
            }
        }
        Ok(host)
    }

    /// Discards the mounted filesystem and all sessions without writing
    /// anything. Open streams are disconnected.
    pub fn reset(&self) {
        self.lock.run_write_locked(|| {
            let old = mem::take(&mut *lock_or_recover(&self.state));
            old.readers.close_all();
            if let Some(output) = old.output {
                output.tracker.close_all();
                drop(output.sink);
                if let BackingFile::Target(path) = &output.file {
                    if let Err(e) = fs::remove_file(path) {
                        log::warn!("couldn't delete {}: {}", path.display(), e);
                    }
                }
            }
            log::debug!("reset {}", self.target.display());
            self.release(true);
        });
    }
}

impl Drop for ArchiveController {
    fn drop(&mut self) {
        let state = lock_or_recover(&self.state);
        if state.needs_reassembly || state.fs.as_ref().is_some_and(VirtualFileSystem::is_touched) {
            log::warn!(
                "archive controller for {} dropped with uncommitted changes",
                self.target.display()
            );
        }
    }
}
