//! TAR archive driver.
//!
//! Reads and writes POSIX ustar archives. Long names are read from GNU
//! `L` records and PAX `path` records, and written as GNU `L` records when
//! they do not fit the ustar name/prefix split. Only regular files and
//! directories are kept; links and device nodes are skipped on input.
//!
//! Compressed variants (`.tar.gz` with the `deflate` feature, `.tar.bz2`
//! with the `bzip2` feature) are inflated into an anonymous temp file when
//! opened so that entries stay randomly accessible, and compressed as a
//! whole stream when written.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{
    ArchiveDriver, ArchiveEntry, EntryKind, InputArchive, OutputArchive, RawEntry, RawMethod,
    SharedFile,
};
use crate::entry_name;
use crate::timestamp::Timestamp;
use crate::{Error, READ_BUFFER_SIZE, Result};

const DRIVER_NAME: &str = "tar";

const BLOCK: u64 = 512;
const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
const GNU_LONG_NAME: &str = "././@LongLink";

/// Largest size expressible in the 11 octal digits of a size field.
const MAX_OCTAL_SIZE: u64 = 0o77_777_777_777;

/// Stream compression applied to the whole TAR archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TarCompression {
    /// Plain `.tar`.
    #[default]
    None,
    /// `.tar.gz` / `.tgz` (requires the `deflate` feature).
    Gzip,
    /// `.tar.bz2` / `.tbz2` (requires the `bzip2` feature).
    Bzip2,
}

/// Driver for TAR archives.
#[derive(Debug, Clone, Default)]
pub struct TarDriver {
    compression: TarCompression,
}

impl TarDriver {
    /// Creates a driver for plain TAR archives.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a driver for TAR archives with the given stream compression.
    pub fn with_compression(compression: TarCompression) -> Self {
        Self { compression }
    }

    /// Returns the stream compression.
    pub fn compression(&self) -> TarCompression {
        self.compression
    }

    fn inflate(&self, path: &Path) -> Result<SharedFile> {
        let file = File::open(path)?;
        let mut decoder: Box<dyn Read> = match self.compression {
            TarCompression::None => return Ok(SharedFile::from_file(file)?),
            #[cfg(feature = "deflate")]
            TarCompression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(
                io::BufReader::with_capacity(READ_BUFFER_SIZE, file),
            )),
            #[cfg(feature = "bzip2")]
            TarCompression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(
                io::BufReader::with_capacity(READ_BUFFER_SIZE, file),
            )),
            #[allow(unreachable_patterns)]
            _ => {
                return Err(Error::UnsupportedFeature {
                    feature: "tar stream compression",
                });
            }
        };
        let mut temp = tempfile::tempfile()?;
        io::copy(&mut decoder, &mut temp).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                invalid(format!("compressed stream is damaged: {}", e))
            }
            _ => Error::Io(e),
        })?;
        temp.seek(SeekFrom::Start(0))?;
        Ok(SharedFile::from_file(temp)?)
    }
}

impl ArchiveDriver for TarDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn open_input(&self, path: &Path) -> Result<Box<dyn InputArchive>> {
        let file = self.inflate(path)?;
        let input = TarInput::scan(file)?;
        log::debug!(
            "opened tar archive {} with {} entries",
            path.display(),
            input.entries.len()
        );
        Ok(Box::new(input))
    }

    fn create_output(
        &self,
        path: &Path,
        _source: Option<&dyn InputArchive>,
    ) -> Result<Box<dyn OutputArchive>> {
        let file = BufWriter::with_capacity(READ_BUFFER_SIZE, File::create(path)?);
        let sink = match self.compression {
            TarCompression::None => TarSink::Plain(file),
            #[cfg(feature = "deflate")]
            TarCompression::Gzip => TarSink::Gzip(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::default(),
            )),
            #[cfg(feature = "bzip2")]
            TarCompression::Bzip2 => TarSink::Bzip2(bzip2::write::BzEncoder::new(
                file,
                bzip2::Compression::default(),
            )),
            #[allow(unreachable_patterns)]
            _ => {
                return Err(Error::UnsupportedFeature {
                    feature: "tar stream compression",
                });
            }
        };
        Ok(Box::new(TarOutput {
            sink: Some(sink),
        }))
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::invalid_format(DRIVER_NAME, reason)
}

fn padded(len: u64) -> u64 {
    len.div_ceil(BLOCK) * BLOCK
}

fn parse_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn parse_number(field: &[u8]) -> Result<u64> {
    if field.first().is_some_and(|&b| b & 0x80 != 0) {
        // base-256, big endian, high bit of the first byte is the marker
        let mut value = u64::from(field[0] & 0x7f);
        for &b in &field[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(u64::from(b)))
                .ok_or_else(|| invalid("numeric field overflows"))?;
        }
        return Ok(value);
    }
    let text = parse_str(field);
    let digits = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 8).map_err(|_| invalid(format!("bad octal field {:?}", digits)))
}

fn checksum(header: &[u8; BLOCK as usize]) -> u64 {
    header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { u64::from(b' ') } else { u64::from(b) })
        .sum()
}

#[derive(Debug, Clone, Copy)]
struct TarEntryInfo {
    offset: u64,
    size: u64,
}

/// A TAR archive opened for reading.
#[derive(Debug)]
pub struct TarInput {
    file: SharedFile,
    entries: Vec<ArchiveEntry>,
    index: HashMap<String, (usize, TarEntryInfo)>,
}

impl TarInput {
    fn scan(file: SharedFile) -> Result<Self> {
        let mut entries = Vec::new();
        let mut index = HashMap::new();
        let mut pos = 0u64;
        let mut long_name: Option<String> = None;
        let len = file.len();
        if len > 0 && len < BLOCK {
            return Err(invalid("file too short"));
        }

        while pos + BLOCK <= len {
            let mut header = [0u8; BLOCK as usize];
            file.read_exact_at(pos, &mut header)?;
            if header.iter().all(|&b| b == 0) {
                break;
            }
            let stored = parse_number(&header[148..156])?;
            if stored != checksum(&header) {
                return Err(invalid(format!("header checksum mismatch at offset {}", pos)));
            }
            let size = parse_number(&header[124..136])?;
            let data = pos + BLOCK;
            if data.checked_add(size).is_none_or(|end| end > len) {
                return Err(invalid(format!("entry at offset {} is truncated", pos)));
            }
            pos = data
                .checked_add(padded(size))
                .ok_or_else(|| invalid(format!("entry at offset {} is truncated", pos)))?;

            let typeflag = header[156];
            match typeflag {
                b'L' => {
                    let mut buf = vec![0u8; usize::try_from(size).map_err(|_| invalid("long name too long"))?];
                    file.read_exact_at(data, &mut buf)?;
                    long_name = Some(parse_str(&buf));
                    continue;
                }
                b'x' => {
                    let mut buf = vec![0u8; usize::try_from(size).map_err(|_| invalid("pax header too long"))?];
                    file.read_exact_at(data, &mut buf)?;
                    if let Some(path) = pax_path(&buf) {
                        long_name = Some(path);
                    }
                    continue;
                }
                b'g' => continue,
                _ => {}
            }

            let name = long_name.take().unwrap_or_else(|| {
                let name = parse_str(&header[..NAME_LEN]);
                let prefix = if &header[257..262] == b"ustar" {
                    parse_str(&header[345..345 + PREFIX_LEN])
                } else {
                    String::new()
                };
                if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                }
            });
            let name = name.strip_prefix("./").unwrap_or(&name).to_string();
            let kind = match typeflag {
                b'0' | 0 | b'7' if !entry_name::is_dir_key(&name) => EntryKind::File,
                b'5' | b'0' | 0 | b'7' => EntryKind::Directory,
                other => {
                    log::debug!("skipping tar entry {} of type {:?}", name, other as char);
                    continue;
                }
            };
            if name.is_empty() {
                continue;
            }
            if let Err(e) = entry_name::validate(&name) {
                log::warn!("skipping tar entry: {}", e);
                continue;
            }
            let mtime = parse_number(&header[136..148])?;
            let mut entry = ArchiveEntry::new(name, kind)
                .with_modified(Some(Timestamp::from_unix_secs(i64::try_from(mtime).unwrap_or(i64::MAX))));
            if kind == EntryKind::File {
                entry = entry.with_size(size);
            }
            let info = TarEntryInfo { offset: data, size };
            match index.get_mut(entry.name()) {
                // later members replace earlier ones, as tar extraction does
                Some(slot) => {
                    let (i, _) = *slot;
                    *slot = (i, info);
                    entries[i] = entry;
                }
                None => {
                    index.insert(entry.name().to_string(), (entries.len(), info));
                    entries.push(entry);
                }
            }
        }

        Ok(Self {
            file,
            entries,
            index,
        })
    }

    fn info(&self, name: &str) -> Result<TarEntryInfo> {
        match self.index.get(name) {
            Some(&(i, info)) if self.entries[i].is_file() => Ok(info),
            _ => Err(Error::EntryNotFound {
                archive: Default::default(),
                entry: name.to_string(),
            }),
        }
    }
}

fn pax_path(records: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(records);
    let mut rest: &str = &text;
    while !rest.is_empty() {
        let (len, _) = rest.split_once(' ')?;
        let len: usize = len.parse().ok()?;
        let record = rest.get(..len)?;
        rest = &rest[len..];
        let (_, kv) = record.split_once(' ')?;
        if let Some(path) = kv.trim_end_matches('\n').strip_prefix("path=") {
            return Some(path.to_string());
        }
    }
    None
}

impl InputArchive for TarInput {
    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.index.get(name).map(|&(i, _)| &self.entries[i])
    }

    fn open_entry(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let info = self.info(name)?;
        Ok(Box::new(self.file.slice(info.offset, info.size)?))
    }

    fn open_raw(&self, name: &str) -> Result<Option<RawEntry>> {
        let info = self.info(name)?;
        Ok(Some(RawEntry {
            method: RawMethod::Stored,
            crc32: None,
            packed_size: info.size,
            size: info.size,
            data: Box::new(self.file.slice(info.offset, info.size)?),
        }))
    }
}

enum TarSink {
    Plain(BufWriter<File>),
    #[cfg(feature = "deflate")]
    Gzip(flate2::write::GzEncoder<BufWriter<File>>),
    #[cfg(feature = "bzip2")]
    Bzip2(bzip2::write::BzEncoder<BufWriter<File>>),
}

impl TarSink {
    fn finish(self) -> io::Result<()> {
        let mut file = match self {
            TarSink::Plain(file) => file,
            #[cfg(feature = "deflate")]
            TarSink::Gzip(encoder) => encoder.finish()?,
            #[cfg(feature = "bzip2")]
            TarSink::Bzip2(encoder) => encoder.finish()?,
        };
        file.flush()
    }
}

impl Write for TarSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarSink::Plain(w) => w.write(buf),
            #[cfg(feature = "deflate")]
            TarSink::Gzip(w) => w.write(buf),
            #[cfg(feature = "bzip2")]
            TarSink::Bzip2(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarSink::Plain(w) => w.flush(),
            #[cfg(feature = "deflate")]
            TarSink::Gzip(w) => w.flush(),
            #[cfg(feature = "bzip2")]
            TarSink::Bzip2(w) => w.flush(),
        }
    }
}

/// A TAR archive being written.
pub struct TarOutput {
    sink: Option<TarSink>,
}

impl std::fmt::Debug for TarOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarOutput")
            .field("finished", &self.sink.is_none())
            .finish()
    }
}

fn put_str(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

fn put_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{:0width$o}", value, width = digits);
    put_str(field, &text[text.len().saturating_sub(digits)..]);
    field[digits] = 0;
}

fn put_number(field: &mut [u8], value: u64) {
    if value <= MAX_OCTAL_SIZE {
        put_octal(field, value);
    } else {
        let bytes = value.to_be_bytes();
        field.fill(0);
        let start = field.len() - bytes.len();
        field[start..].copy_from_slice(&bytes);
        field[0] |= 0x80;
    }
}

/// Splits a long name into a ustar `(prefix, name)` pair, if possible.
fn split_ustar(name: &str) -> Option<(&str, &str)> {
    if name.len() <= NAME_LEN {
        return Some(("", name));
    }
    name.char_indices()
        .filter(|&(_, c)| c == '/')
        .map(|(i, _)| i)
        .find(|&i| i <= PREFIX_LEN && name.len() - i - 1 <= NAME_LEN && i + 1 < name.len())
        .map(|i| (&name[..i], &name[i + 1..]))
}

fn header(name: &str, prefix: &str, typeflag: u8, size: u64, mode: u32, mtime: i64) -> [u8; BLOCK as usize] {
    let mut h = [0u8; BLOCK as usize];
    put_str(&mut h[..NAME_LEN], name);
    put_octal(&mut h[100..108], u64::from(mode));
    put_octal(&mut h[108..116], 0);
    put_octal(&mut h[116..124], 0);
    put_number(&mut h[124..136], size);
    put_octal(&mut h[136..148], u64::try_from(mtime).unwrap_or(0));
    h[156] = typeflag;
    h[257..263].copy_from_slice(b"ustar\0");
    h[263..265].copy_from_slice(b"00");
    put_str(&mut h[345..345 + PREFIX_LEN], prefix);
    let sum = checksum(&h);
    let text = format!("{:06o}\0 ", sum);
    h[148..156].copy_from_slice(text.as_bytes());
    h
}

impl TarOutput {
    fn sink(&mut self) -> Result<&mut TarSink> {
        self.sink
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::other("tar output already finished")))
    }

    fn write_header(&mut self, entry: &ArchiveEntry, typeflag: u8, size: u64, mode: u32) -> Result<()> {
        let mtime = entry.modified().unwrap_or_else(Timestamp::now).as_unix_secs();
        let name = entry.name();
        let sink = self.sink()?;
        match split_ustar(name) {
            Some((prefix, short)) => {
                sink.write_all(&header(short, prefix, typeflag, size, mode, mtime))?;
            }
            None => {
                let mut long = name.as_bytes().to_vec();
                long.push(0);
                sink.write_all(&header(GNU_LONG_NAME, "", b'L', long.len() as u64, 0o644, 0))?;
                sink.write_all(&long)?;
                write_padding(sink, long.len() as u64)?;
                let truncated: String = name.chars().take(NAME_LEN).collect();
                sink.write_all(&header(&truncated, "", typeflag, size, mode, mtime))?;
            }
        }
        Ok(())
    }

    fn write_sized(&mut self, entry: &ArchiveEntry, size: u64, data: &mut dyn Read) -> Result<u64> {
        self.write_header(entry, b'0', size, 0o644)?;
        let sink = self.sink()?;
        let copied = io::copy(&mut data.take(size), sink)?;
        if copied != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} yielded {} of {} bytes", entry.name(), copied, size),
            )));
        }
        write_padding(sink, size)?;
        Ok(size)
    }
}

fn write_padding(sink: &mut TarSink, len: u64) -> io::Result<()> {
    let pad = (padded(len) - len) as usize;
    sink.write_all(&[0u8; BLOCK as usize][..pad])
}

impl OutputArchive for TarOutput {
    fn write_entry(&mut self, entry: &ArchiveEntry, data: &mut dyn Read) -> Result<u64> {
        match entry.size() {
            Some(size) => self.write_sized(entry, size, data),
            None => {
                let mut spool = tempfile::tempfile()?;
                let size = io::copy(data, &mut spool)?;
                spool.seek(SeekFrom::Start(0))?;
                self.write_sized(entry, size, &mut spool)
            }
        }
    }

    fn write_directory(&mut self, entry: &ArchiveEntry) -> Result<()> {
        self.write_header(entry, b'5', 0, 0o755)
    }

    fn accepts_raw(&self, raw: &RawEntry) -> bool {
        raw.method == RawMethod::Stored
    }

    fn write_raw(&mut self, entry: &ArchiveEntry, mut raw: RawEntry) -> Result<u64> {
        if raw.method != RawMethod::Stored {
            return Err(Error::UnsupportedFeature {
                feature: "direct data copying of compressed data into tar",
            });
        }
        self.write_sized(entry, raw.size, &mut raw.data)
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };
        sink.write_all(&[0u8; 2 * BLOCK as usize])?;
        sink.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(driver: &TarDriver, files: &[(&str, &[u8])]) -> Box<dyn InputArchive> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar");
        let mut out = driver.create_output(&path, None).unwrap();
        out.write_directory(&ArchiveEntry::directory("d")).unwrap();
        for (name, data) in files {
            let entry = ArchiveEntry::file(*name)
                .with_modified(Some(Timestamp::from_unix_secs(1_500_000_000)));
            out.write_entry(&entry, &mut &data[..]).unwrap();
        }
        out.finish().unwrap();
        driver.open_input(&path).unwrap()
    }

    fn read_entry(input: &dyn InputArchive, name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        input.open_entry(name).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_plain_roundtrip() {
        let input = roundtrip(&TarDriver::new(), &[("d/x.txt", b"hello"), ("empty", b"")]);
        let names: Vec<_> = input.entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, ["d/", "d/x.txt", "empty"]);
        assert_eq!(read_entry(input.as_ref(), "d/x.txt"), b"hello");
        assert_eq!(read_entry(input.as_ref(), "empty"), b"");
        let entry = input.entry("d/x.txt").unwrap();
        assert_eq!(entry.size(), Some(5));
        assert_eq!(entry.modified(), Some(Timestamp::from_unix_secs(1_500_000_000)));
    }

    #[test]
    fn test_long_names() {
        let ustar = format!("{}/{}", "p".repeat(120), "n".repeat(90));
        let gnu = "q".repeat(300);
        let input = roundtrip(&TarDriver::new(), &[(&ustar, b"u"), (&gnu, b"g")]);
        assert_eq!(read_entry(input.as_ref(), &ustar), b"u");
        assert_eq!(read_entry(input.as_ref(), &gnu), b"g");
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_gzip_roundtrip() {
        let data = b"compressible ".repeat(1000);
        let input = roundtrip(&TarDriver::with_compression(TarCompression::Gzip), &[("f", &data)]);
        assert_eq!(read_entry(input.as_ref(), "f"), data);
    }

    #[cfg(feature = "bzip2")]
    #[test]
    fn test_bzip2_roundtrip() {
        let input = roundtrip(&TarDriver::with_compression(TarCompression::Bzip2), &[("f", b"bz")]);
        assert_eq!(read_entry(input.as_ref(), "f"), b"bz");
    }

    #[test]
    fn test_unknown_size_is_spooled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar");
        let driver = TarDriver::new();
        let mut out = driver.create_output(&path, None).unwrap();
        let entry = ArchiveEntry::file("spooled");
        assert_eq!(out.write_entry(&entry, &mut &b"12345"[..]).unwrap(), 5);
        out.finish().unwrap();
        let input = driver.open_input(&path).unwrap();
        assert_eq!(read_entry(input.as_ref(), "spooled"), b"12345");
    }

    #[test]
    fn test_short_data_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar");
        let mut out = TarDriver::new().create_output(&path, None).unwrap();
        let entry = ArchiveEntry::file("short").with_size(10);
        assert!(out.write_entry(&entry, &mut &b"123"[..]).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.tar");
        std::fs::write(&path, vec![b'x'; 1024]).unwrap();
        let err = TarDriver::new().open_input(&path).err().unwrap();
        assert!(matches!(err, Error::InvalidFormat { driver: "tar", .. }));
    }

    #[test]
    fn test_rejects_huge_size_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.tar");
        let mut data = header("x.txt", "", b'0', u64::MAX - 100, 0o644, 0).to_vec();
        data.extend_from_slice(&[0u8; 1024]);
        std::fs::write(&path, data).unwrap();
        let err = TarDriver::new().open_input(&path).err().unwrap();
        assert!(matches!(err, Error::InvalidFormat { driver: "tar", .. }), "{err}");
    }

    #[test]
    fn test_number_fields() {
        let mut field = [0u8; 12];
        put_number(&mut field, 0o755);
        assert_eq!(parse_number(&field).unwrap(), 0o755);
        put_number(&mut field, MAX_OCTAL_SIZE + 1);
        assert_eq!(parse_number(&field).unwrap(), MAX_OCTAL_SIZE + 1);
    }

    #[test]
    fn test_pax_path() {
        let record = "27 path=some/long/name.txt\n";
        assert_eq!(pax_path(record.as_bytes()).as_deref(), Some("some/long/name.txt"));
        assert_eq!(pax_path(b"11 foo=bar\n"), None);
    }
}
