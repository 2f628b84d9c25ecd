//! Shared test utilities for integration tests.
//!
//! Each test works in its own scratch directory with its own registry, so
//! tests never see each other's controllers or temp files.
//!
//! Note: `#![allow(dead_code)]` is required because each integration test file
//! compiles as a separate crate and may only use a subset of these helpers.

#![allow(dead_code)]

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use archfs::{
    ArchiveDriver, ArchiveEntry, ArchiveFs, DefaultArchiveDetector, FsConfig, InputArchive,
    OutputArchive, RawEntry, Registry, ZipDriver,
};

/// A scratch directory with an isolated filesystem.
///
/// Temp files of the registry go to `temp/` so tests can count them. The
/// filesystem is dropped first, so its final update still finds the
/// directory.
pub struct Scratch {
    pub fs: ArchiveFs,
    pub dir: tempfile::TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        Self::with_config(FsConfig::default())
    }

    pub fn with_config(config: FsConfig) -> Self {
        let dir = tempfile::tempdir().expect("scratch dir");
        let temp = dir.path().join("temp");
        std::fs::create_dir(&temp).expect("temp dir");
        let registry = Registry::new(config.temp_dir(temp));
        let fs = ArchiveFs::with_registry(registry);
        Self { fs, dir }
    }

    /// Returns a path inside the scratch directory.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Returns the number of temp files the registry currently holds.
    pub fn temp_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("temp"))
            .expect("temp dir")
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with("afs") && name.ends_with(".tmp")
            })
            .count()
    }
}

/// Writes a ZIP archive with the given entries; names ending in `/` become
/// directories.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut output = ZipDriver::new()
        .create_output(path, None)
        .expect("create zip");
    for (name, data) in entries {
        if name.ends_with('/') {
            output
                .write_directory(&ArchiveEntry::directory(name))
                .expect("write directory");
        } else {
            output
                .write_entry(&ArchiveEntry::file(*name), &mut Cursor::new(*data))
                .expect("write entry");
        }
    }
    output.finish().expect("finish zip");
}

/// Builds the bytes of a ZIP archive with the given entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("bytes.zip");
    write_zip(&path, entries);
    std::fs::read(path).expect("read zip")
}

/// Reads all entries of a ZIP archive directly through the driver, sorted
/// by name, with the content of file entries.
pub fn read_zip(path: &Path) -> Vec<(String, Vec<u8>)> {
    let input = ZipDriver::new().open_input(path).expect("open zip");
    let mut entries: Vec<_> = input
        .entries()
        .iter()
        .map(|e| {
            let mut data = Vec::new();
            if e.is_file() {
                input
                    .open_entry(e.name())
                    .expect("open entry")
                    .read_to_end(&mut data)
                    .expect("read entry");
            }
            (e.name().to_string(), data)
        })
        .collect();
    entries.sort();
    entries
}

/// A ZIP driver that records every entry written, in order.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    inner: ZipDriver,
    pub written: Arc<Mutex<Vec<String>>>,
    fail_finish: bool,
}

impl RecordingDriver {
    /// Returns a driver whose outputs fail when they are finished, leaving
    /// a broken archive behind.
    pub fn failing() -> Self {
        Self {
            fail_finish: true,
            ..Self::default()
        }
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

struct RecordingOutput {
    inner: Box<dyn OutputArchive>,
    written: Arc<Mutex<Vec<String>>>,
    fail_finish: bool,
}

impl ArchiveDriver for RecordingDriver {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn open_input(&self, path: &Path) -> archfs::Result<Box<dyn InputArchive>> {
        self.inner.open_input(path)
    }

    fn create_output(
        &self,
        path: &Path,
        source: Option<&dyn InputArchive>,
    ) -> archfs::Result<Box<dyn OutputArchive>> {
        Ok(Box::new(RecordingOutput {
            inner: self.inner.create_output(path, source)?,
            written: Arc::clone(&self.written),
            fail_finish: self.fail_finish,
        }))
    }
}

impl OutputArchive for RecordingOutput {
    fn write_entry(&mut self, entry: &ArchiveEntry, data: &mut dyn Read) -> archfs::Result<u64> {
        self.written.lock().unwrap().push(entry.name().to_string());
        self.inner.write_entry(entry, data)
    }

    fn write_directory(&mut self, entry: &ArchiveEntry) -> archfs::Result<()> {
        self.written.lock().unwrap().push(entry.name().to_string());
        self.inner.write_directory(entry)
    }

    fn accepts_raw(&self, raw: &RawEntry) -> bool {
        self.inner.accepts_raw(raw)
    }

    fn write_raw(&mut self, entry: &ArchiveEntry, raw: RawEntry) -> archfs::Result<u64> {
        self.written.lock().unwrap().push(entry.name().to_string());
        self.inner.write_raw(entry, raw)
    }

    fn finish(&mut self) -> archfs::Result<()> {
        if self.fail_finish {
            return Err(archfs::Error::Io(std::io::Error::other("disk full")));
        }
        self.inner.finish()
    }
}

/// Returns a filesystem in `scratch` that treats `*.rec` files as ZIP
/// archives written through `driver`.
pub fn recording_fs(scratch: &Scratch, driver: Arc<RecordingDriver>) -> ArchiveFs {
    let detector = DefaultArchiveDetector::new().with_suffix("rec", driver);
    scratch.fs.clone().detector(Arc::new(detector))
}
