//! ZIP archive driver.
//!
//! Supports stored (method 0) and deflated (method 8, `deflate` feature)
//! entries in single-disk archives without ZIP64 extensions. Entry names
//! are read as UTF-8; the general purpose flag bit 11 is set on output for
//! non-ASCII names.
//!
//! Output archives are written front to back and each local header is
//! patched with the final CRC and sizes once the entry data is complete, so
//! no data descriptors are emitted.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{
    ArchiveDriver, ArchiveEntry, EntryKind, InputArchive, OutputArchive, RawEntry, RawMethod,
    SharedFile,
};
use crate::entry_name;
use crate::timestamp::Timestamp;
use crate::{Error, READ_BUFFER_SIZE, Result};

const DRIVER_NAME: &str = "zip";

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;

const LOCAL_HEADER_LEN: u64 = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const END_OF_CENTRAL_DIR_LEN: usize = 22;
const MAX_COMMENT_LEN: usize = 0xffff;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_UTF8: u16 = 1 << 11;

/// Version 2.0: deflate and directories.
const VERSION_NEEDED: u16 = 20;
/// Made by UNIX, version 2.0.
const VERSION_MADE_BY: u16 = (3 << 8) | 20;

const ZIP64_LIMIT: u64 = 0xffff_ffff;

/// Default deflate compression level.
const DEFAULT_LEVEL: u32 = 6;

/// Driver for ZIP archives (also used for JAR files).
#[derive(Debug, Clone)]
pub struct ZipDriver {
    deflate: bool,
    level: u32,
}

impl Default for ZipDriver {
    fn default() -> Self {
        Self {
            deflate: cfg!(feature = "deflate"),
            level: DEFAULT_LEVEL,
        }
    }
}

impl ZipDriver {
    /// Creates a driver that deflates new entries when the `deflate` feature
    /// is enabled and stores them otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a driver that stores new entries uncompressed.
    pub fn stored() -> Self {
        Self {
            deflate: false,
            level: 0,
        }
    }

    /// Sets the deflate compression level (0-9).
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }
}

impl ArchiveDriver for ZipDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn open_input(&self, path: &Path) -> Result<Box<dyn InputArchive>> {
        Ok(Box::new(ZipInput::open(path)?))
    }

    fn create_output(
        &self,
        path: &Path,
        source: Option<&dyn InputArchive>,
    ) -> Result<Box<dyn OutputArchive>> {
        let file = File::create(path)?;
        let mut output = ZipOutput::new(file, self.deflate, self.level);
        output.comment = source.and_then(|s| s.comment()).map(str::to_string);
        Ok(Box::new(output))
    }
}

#[derive(Debug, Clone, Copy)]
struct ZipEntryInfo {
    flags: u16,
    method: u16,
    crc32: u32,
    packed_size: u64,
    size: u64,
    local_header_offset: u64,
}

/// A ZIP archive opened for reading.
#[derive(Debug)]
pub struct ZipInput {
    file: SharedFile,
    entries: Vec<ArchiveEntry>,
    index: HashMap<String, (usize, ZipEntryInfo)>,
    comment: Option<String>,
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::invalid_format(DRIVER_NAME, reason)
}

fn u16_at(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

fn u32_at(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

impl ZipInput {
    /// Opens and indexes the archive at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = SharedFile::open(path)?;
        let len = file.len();
        if len < END_OF_CENTRAL_DIR_LEN as u64 {
            return Err(invalid("file too short"));
        }

        let tail_len = len.min((END_OF_CENTRAL_DIR_LEN + MAX_COMMENT_LEN) as u64) as usize;
        let tail_start = len - tail_len as u64;
        let mut tail = vec![0u8; tail_len];
        file.read_exact_at(tail_start, &mut tail)?;

        let eocd = (0..=tail_len - END_OF_CENTRAL_DIR_LEN)
            .rev()
            .find(|&pos| {
                u32_at(&tail, pos) == END_OF_CENTRAL_DIR_SIG
                    && pos + END_OF_CENTRAL_DIR_LEN + usize::from(u16_at(&tail, pos + 20))
                        <= tail_len
            })
            .ok_or_else(|| invalid("end of central directory not found"))?;

        let disk = u16_at(&tail, eocd + 4);
        let cd_disk = u16_at(&tail, eocd + 6);
        if disk != 0 || cd_disk != 0 {
            return Err(Error::UnsupportedFeature {
                feature: "multi-disk zip",
            });
        }
        let total = u16_at(&tail, eocd + 10);
        let cd_size = u32_at(&tail, eocd + 12);
        let cd_offset = u32_at(&tail, eocd + 16);
        if total == 0xffff || u64::from(cd_size) == ZIP64_LIMIT || u64::from(cd_offset) == ZIP64_LIMIT
        {
            return Err(Error::UnsupportedFeature { feature: "zip64" });
        }
        let comment_len = usize::from(u16_at(&tail, eocd + 20));
        let comment_bytes = &tail[eocd + END_OF_CENTRAL_DIR_LEN..eocd + END_OF_CENTRAL_DIR_LEN + comment_len];
        let comment = (!comment_bytes.is_empty())
            .then(|| String::from_utf8_lossy(comment_bytes).into_owned());

        if u64::from(cd_offset) + u64::from(cd_size) > tail_start + eocd as u64 {
            return Err(invalid("central directory out of range"));
        }
        let mut cd = vec![0u8; cd_size as usize];
        file.read_exact_at(u64::from(cd_offset), &mut cd)?;

        let mut entries = Vec::with_capacity(usize::from(total));
        let mut index = HashMap::with_capacity(usize::from(total));
        let mut pos = 0usize;
        for _ in 0..total {
            if pos + CENTRAL_HEADER_LEN > cd.len() || u32_at(&cd, pos) != CENTRAL_HEADER_SIG {
                return Err(invalid("bad central directory header"));
            }
            let flags = u16_at(&cd, pos + 8);
            let method = u16_at(&cd, pos + 10);
            let time = u16_at(&cd, pos + 12);
            let date = u16_at(&cd, pos + 14);
            let crc32 = u32_at(&cd, pos + 16);
            let packed_size = u64::from(u32_at(&cd, pos + 20));
            let size = u64::from(u32_at(&cd, pos + 24));
            let name_len = usize::from(u16_at(&cd, pos + 28));
            let extra_len = usize::from(u16_at(&cd, pos + 30));
            let comment_len = usize::from(u16_at(&cd, pos + 32));
            let local_header_offset = u64::from(u32_at(&cd, pos + 42));

            let name_start = pos + CENTRAL_HEADER_LEN;
            let next = name_start + name_len + extra_len + comment_len;
            if next > cd.len() {
                return Err(invalid("central directory header exceeds directory"));
            }
            let raw_name = String::from_utf8_lossy(&cd[name_start..name_start + name_len]);
            pos = next;

            if let Err(e) = entry_name::validate(&raw_name) {
                log::warn!("skipping zip entry: {}", e);
                continue;
            }
            let kind = if entry_name::is_dir_key(&raw_name) {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            let mut entry = ArchiveEntry::new(raw_name.into_owned(), kind)
                .with_modified(Some(Timestamp::from_dos(date, time)));
            if kind == EntryKind::File {
                entry = entry.with_size(size);
            }
            let info = ZipEntryInfo {
                flags,
                method,
                crc32,
                packed_size,
                size,
                local_header_offset,
            };
            if index.contains_key(entry.name()) {
                log::warn!("skipping duplicate zip entry {}", entry.name());
                continue;
            }
            index.insert(entry.name().to_string(), (entries.len(), info));
            entries.push(entry);
        }

        log::debug!(
            "opened zip archive {} with {} entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            file,
            entries,
            index,
            comment,
        })
    }

    fn info(&self, name: &str) -> Result<ZipEntryInfo> {
        match self.index.get(name) {
            Some(&(i, info)) if self.entries[i].is_file() => Ok(info),
            _ => Err(Error::EntryNotFound {
                archive: Default::default(),
                entry: name.to_string(),
            }),
        }
    }

    fn data_offset(&self, info: &ZipEntryInfo) -> Result<u64> {
        let mut header = [0u8; LOCAL_HEADER_LEN as usize];
        self.file
            .read_exact_at(info.local_header_offset, &mut header)?;
        if u32_at(&header, 0) != LOCAL_HEADER_SIG {
            return Err(invalid("bad local header signature"));
        }
        let name_len = u64::from(u16_at(&header, 26));
        let extra_len = u64::from(u16_at(&header, 28));
        Ok(info.local_header_offset + LOCAL_HEADER_LEN + name_len + extra_len)
    }
}

impl InputArchive for ZipInput {
    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.index.get(name).map(|&(i, _)| &self.entries[i])
    }

    fn open_entry(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let info = self.info(name)?;
        if info.flags & FLAG_ENCRYPTED != 0 {
            return Err(Error::UnsupportedFeature {
                feature: "encrypted zip entries",
            });
        }
        let slice = self.file.slice(self.data_offset(&info)?, info.packed_size)?;
        let decoded: Box<dyn Read + Send> = match info.method {
            METHOD_STORED => Box::new(slice),
            #[cfg(feature = "deflate")]
            METHOD_DEFLATED => Box::new(flate2::bufread::DeflateDecoder::new(
                BufReader::with_capacity(READ_BUFFER_SIZE, slice),
            )),
            _ => {
                return Err(Error::UnsupportedFeature {
                    feature: "zip compression method",
                });
            }
        };
        Ok(Box::new(CrcCheckReader::new(decoded, info.crc32, info.size)))
    }

    fn open_raw(&self, name: &str) -> Result<Option<RawEntry>> {
        let info = self.info(name)?;
        let method = match info.method {
            _ if info.flags & FLAG_ENCRYPTED != 0 => return Ok(None),
            METHOD_STORED => RawMethod::Stored,
            METHOD_DEFLATED => RawMethod::Deflated,
            _ => return Ok(None),
        };
        let slice = self.file.slice(self.data_offset(&info)?, info.packed_size)?;
        Ok(Some(RawEntry {
            method,
            crc32: Some(info.crc32),
            packed_size: info.packed_size,
            size: info.size,
            data: Box::new(slice),
        }))
    }

    fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

/// Verifies size and CRC-32 of decoded entry data at end of stream.
struct CrcCheckReader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
    expected_crc: u32,
    expected_size: u64,
    count: u64,
}

impl<R: Read> CrcCheckReader<R> {
    fn new(inner: R, expected_crc: u32, expected_size: u64) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            expected_crc,
            expected_size,
            count: 0,
        }
    }
}

impl<R: Read> Read for CrcCheckReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.count += n as u64;
        } else if !buf.is_empty() {
            let actual = self.hasher.clone().finalize();
            if self.count != self.expected_size || actual != self.expected_crc {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "zip entry check failed: expected {} bytes with CRC {:#010x}, got {} bytes with CRC {:#010x}",
                        self.expected_size, self.expected_crc, self.count, actual
                    ),
                ));
            }
        }
        Ok(n)
    }
}

/// Counts bytes written through it.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug)]
struct CentralRecord {
    name: String,
    flags: u16,
    method: u16,
    time: u16,
    date: u16,
    crc32: u32,
    packed_size: u64,
    size: u64,
    offset: u64,
    directory: bool,
}

/// A ZIP archive being written.
pub struct ZipOutput {
    out: BufWriter<File>,
    offset: u64,
    records: Vec<CentralRecord>,
    deflate: bool,
    level: u32,
    comment: Option<String>,
    finished: bool,
}

impl std::fmt::Debug for ZipOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipOutput")
            .field("offset", &self.offset)
            .field("entries", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl ZipOutput {
    fn new(file: File, deflate: bool, level: u32) -> Self {
        Self {
            out: BufWriter::with_capacity(READ_BUFFER_SIZE, file),
            offset: 0,
            records: Vec::new(),
            deflate,
            level,
            comment: None,
            finished: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::Io(io::Error::other("zip output already finished")));
        }
        Ok(())
    }

    fn dos_time(entry: &ArchiveEntry) -> (u16, u16) {
        entry.modified().unwrap_or_else(Timestamp::now).to_dos()
    }

    fn flags_for(name: &str) -> u16 {
        if name.is_ascii() { 0 } else { FLAG_UTF8 }
    }

    /// Writes a local header and returns the offset of the record's CRC field.
    fn write_local_header(&mut self, record: &CentralRecord) -> Result<u64> {
        if record.name.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidEntryName(format!(
                "{} exceeds the zip name length limit",
                record.name
            )));
        }
        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN as usize + record.name.len());
        header.extend_from_slice(&LOCAL_HEADER_SIG.to_le_bytes());
        header.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
        header.extend_from_slice(&record.flags.to_le_bytes());
        header.extend_from_slice(&record.method.to_le_bytes());
        header.extend_from_slice(&record.time.to_le_bytes());
        header.extend_from_slice(&record.date.to_le_bytes());
        header.extend_from_slice(&record.crc32.to_le_bytes());
        header.extend_from_slice(&(record.packed_size as u32).to_le_bytes());
        header.extend_from_slice(&(record.size as u32).to_le_bytes());
        header.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(record.name.as_bytes());
        self.out.write_all(&header)?;
        let crc_field = self.offset + 14;
        self.offset += header.len() as u64;
        Ok(crc_field)
    }

    fn patch_sizes(&mut self, crc_field: u64, record: &CentralRecord) -> Result<()> {
        let mut patch = [0u8; 12];
        patch[..4].copy_from_slice(&record.crc32.to_le_bytes());
        patch[4..8].copy_from_slice(&(record.packed_size as u32).to_le_bytes());
        patch[8..].copy_from_slice(&(record.size as u32).to_le_bytes());
        self.out.seek(SeekFrom::Start(crc_field))?;
        self.out.write_all(&patch)?;
        self.out.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    fn record_for(&self, entry: &ArchiveEntry, method: u16) -> CentralRecord {
        let (date, time) = Self::dos_time(entry);
        CentralRecord {
            name: entry.name().to_string(),
            flags: Self::flags_for(entry.name()),
            method,
            time,
            date,
            crc32: 0,
            packed_size: 0,
            size: 0,
            offset: self.offset,
            directory: entry.is_directory(),
        }
    }

    fn copy_through<W: Write>(data: &mut dyn Read, out: &mut W) -> io::Result<(u64, u32)> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
        Ok((total, hasher.finalize()))
    }
}

impl OutputArchive for ZipOutput {
    fn write_entry(&mut self, entry: &ArchiveEntry, data: &mut dyn Read) -> Result<u64> {
        self.check_open()?;
        let method = if self.deflate {
            METHOD_DEFLATED
        } else {
            METHOD_STORED
        };
        let mut record = self.record_for(entry, method);
        let crc_field = self.write_local_header(&record)?;

        let (size, crc32, packed_size) = match method {
            #[cfg(feature = "deflate")]
            METHOD_DEFLATED => {
                let counter = CountingWriter {
                    inner: &mut self.out,
                    count: 0,
                };
                let mut encoder =
                    flate2::write::DeflateEncoder::new(counter, flate2::Compression::new(self.level));
                let (size, crc32) = Self::copy_through(data, &mut encoder)?;
                let counter = encoder.finish()?;
                (size, crc32, counter.count)
            }
            _ => {
                let (size, crc32) = Self::copy_through(data, &mut self.out)?;
                (size, crc32, size)
            }
        };
        if size >= ZIP64_LIMIT || packed_size >= ZIP64_LIMIT {
            return Err(Error::UnsupportedFeature { feature: "zip64" });
        }
        self.offset += packed_size;
        record.crc32 = crc32;
        record.size = size;
        record.packed_size = packed_size;
        self.patch_sizes(crc_field, &record)?;
        self.records.push(record);
        Ok(size)
    }

    fn write_directory(&mut self, entry: &ArchiveEntry) -> Result<()> {
        self.check_open()?;
        let record = self.record_for(entry, METHOD_STORED);
        self.write_local_header(&record)?;
        self.records.push(record);
        Ok(())
    }

    fn accepts_raw(&self, raw: &RawEntry) -> bool {
        raw.crc32.is_some()
            && raw.packed_size < ZIP64_LIMIT
            && raw.size < ZIP64_LIMIT
            && matches!(raw.method, RawMethod::Stored | RawMethod::Deflated)
    }

    fn write_raw(&mut self, entry: &ArchiveEntry, mut raw: RawEntry) -> Result<u64> {
        self.check_open()?;
        let Some(crc32) = raw.crc32 else {
            return Err(Error::UnsupportedFeature {
                feature: "direct data copying without CRC",
            });
        };
        let method = match raw.method {
            RawMethod::Stored => METHOD_STORED,
            RawMethod::Deflated => METHOD_DEFLATED,
        };
        let mut record = self.record_for(entry, method);
        record.crc32 = crc32;
        record.packed_size = raw.packed_size;
        record.size = raw.size;
        self.write_local_header(&record)?;
        let copied = io::copy(&mut raw.data, &mut self.out)?;
        if copied != raw.packed_size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "raw entry {} yielded {} of {} bytes",
                    entry.name(),
                    copied,
                    raw.packed_size
                ),
            )));
        }
        self.offset += copied;
        self.records.push(record);
        Ok(raw.size)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.records.len() >= 0xffff {
            return Err(Error::UnsupportedFeature { feature: "zip64" });
        }
        let cd_offset = self.offset;
        let mut cd = Vec::new();
        for record in &self.records {
            cd.extend_from_slice(&CENTRAL_HEADER_SIG.to_le_bytes());
            cd.extend_from_slice(&VERSION_MADE_BY.to_le_bytes());
            cd.extend_from_slice(&VERSION_NEEDED.to_le_bytes());
            cd.extend_from_slice(&record.flags.to_le_bytes());
            cd.extend_from_slice(&record.method.to_le_bytes());
            cd.extend_from_slice(&record.time.to_le_bytes());
            cd.extend_from_slice(&record.date.to_le_bytes());
            cd.extend_from_slice(&record.crc32.to_le_bytes());
            cd.extend_from_slice(&(record.packed_size as u32).to_le_bytes());
            cd.extend_from_slice(&(record.size as u32).to_le_bytes());
            cd.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes()); // extra
            cd.extend_from_slice(&0u16.to_le_bytes()); // comment
            cd.extend_from_slice(&0u16.to_le_bytes()); // disk
            cd.extend_from_slice(&0u16.to_le_bytes()); // internal attributes
            let external: u32 = if record.directory {
                (0o40755 << 16) | 0x10
            } else {
                0o100644 << 16
            };
            cd.extend_from_slice(&external.to_le_bytes());
            cd.extend_from_slice(&(record.offset as u32).to_le_bytes());
            cd.extend_from_slice(record.name.as_bytes());
        }
        if cd_offset + cd.len() as u64 >= ZIP64_LIMIT {
            return Err(Error::UnsupportedFeature { feature: "zip64" });
        }
        let comment = self.comment.as_deref().unwrap_or("").as_bytes();
        let comment = &comment[..comment.len().min(MAX_COMMENT_LEN)];
        let count = self.records.len() as u16;

        let mut eocd = Vec::with_capacity(END_OF_CENTRAL_DIR_LEN + comment.len());
        eocd.extend_from_slice(&END_OF_CENTRAL_DIR_SIG.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes());
        eocd.extend_from_slice(&count.to_le_bytes());
        eocd.extend_from_slice(&count.to_le_bytes());
        eocd.extend_from_slice(&(cd.len() as u32).to_le_bytes());
        eocd.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        eocd.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        eocd.extend_from_slice(comment);

        self.out.write_all(&cd)?;
        self.out.write_all(&eocd)?;
        self.out.flush()?;
        self.offset += (cd.len() + eocd.len()) as u64;
        self.finished = true;
        Ok(())
    }
}
