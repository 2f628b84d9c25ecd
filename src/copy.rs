//! Copying bytes between streams and archives.
//!
//! [`cat`] relays a reader into a writer. With [`CopyConfig::threaded`] set,
//! a background thread fills buffers while the calling thread drains them,
//! so reading and writing overlap. Buffers circulate between the two sides
//! through a pair of bounded channels and are consumed in the order they
//! were filled.
//!
//! Copies between archive entries first try direct data copying: the encoded
//! bytes of the source entry go into the destination archive unchanged when
//! both drivers agree on the encoding.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;

use crate::config::CopyConfig;
use crate::controller::{ArchiveController, AutoCreate};
use crate::driver::ArchiveEntry;
use crate::lock::lock_or_recover;
use crate::{Error, Result};

/// Serializes copies between archives.
///
/// Taken before any controller lock, so two threads copying in opposite
/// directions between the same archives cannot deadlock.
static COPY_LOCK: Mutex<()> = Mutex::new(());

/// A failed relay, telling which side failed.
#[derive(Debug, thiserror::Error)]
pub enum CatError {
    /// Reading from the source failed.
    #[error("read failed: {0}")]
    Input(#[source] io::Error),
    /// Writing to the destination failed.
    #[error("write failed: {0}")]
    Output(#[source] io::Error),
}

impl CatError {
    /// Returns the underlying I/O error.
    pub fn into_inner(self) -> io::Error {
        match self {
            CatError::Input(e) | CatError::Output(e) => e,
        }
    }
}

impl From<CatError> for Error {
    fn from(err: CatError) -> Self {
        Error::Io(err.into_inner())
    }
}

enum Chunk {
    Data(Vec<u8>, usize),
    End,
    Failed(io::Error),
}

fn read_full(input: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match input.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Copies everything from `input` to `output` and returns the number of
/// bytes copied. `output` is flushed but not closed.
pub fn cat<R, W>(input: &mut R, output: &mut W, config: &CopyConfig) -> std::result::Result<u64, CatError>
where
    R: Read + Send + ?Sized,
    W: Write + ?Sized,
{
    let total = if config.threaded {
        cat_threaded(input, output, config)?
    } else {
        cat_serial(input, output, config)?
    };
    output.flush().map_err(CatError::Output)?;
    Ok(total)
}

fn cat_serial<R, W>(input: &mut R, output: &mut W, config: &CopyConfig) -> std::result::Result<u64, CatError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; config.buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = read_full(input, &mut buf).map_err(CatError::Input)?;
        if n == 0 {
            return Ok(total);
        }
        output.write_all(&buf[..n]).map_err(CatError::Output)?;
        total += n as u64;
    }
}

fn cat_threaded<R, W>(input: &mut R, output: &mut W, config: &CopyConfig) -> std::result::Result<u64, CatError>
where
    R: Read + Send + ?Sized,
    W: Write + ?Sized,
{
    let count = config.buffer_count.max(2);
    let size = config.buffer_size.max(1);
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        let (full_tx, full_rx) = mpsc::sync_channel::<Chunk>(count);
        let (empty_tx, empty_rx) = mpsc::sync_channel::<Vec<u8>>(count);
        for _ in 0..count {
            // Capacity equals the buffer count, so this cannot block.
            let _ = empty_tx.send(vec![0u8; size]);
        }

        let stop = &stop;
        let reader = scope.spawn(move || {
            while let Ok(mut buf) = empty_rx.recv() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let chunk = match read_full(input, &mut buf) {
                    Ok(0) => Chunk::End,
                    Ok(n) => Chunk::Data(buf, n),
                    Err(e) => Chunk::Failed(e),
                };
                let last = !matches!(chunk, Chunk::Data(..));
                if full_tx.send(chunk).is_err() || last {
                    break;
                }
            }
        });

        let mut total = 0u64;
        let result = loop {
            match full_rx.recv() {
                Ok(Chunk::Data(buf, n)) => {
                    if let Err(e) = output.write_all(&buf[..n]) {
                        break Err(CatError::Output(e));
                    }
                    total += n as u64;
                    // The reader may have quit already; nothing to hand back then.
                    let _ = empty_tx.send(buf);
                }
                Ok(Chunk::End) => break Ok(total),
                Ok(Chunk::Failed(e)) => break Err(CatError::Input(e)),
                Err(_) => {
                    break Err(CatError::Input(io::Error::other("reader thread quit")));
                }
            }
        };
        if result.is_err() {
            stop.store(true, Ordering::Release);
        }
        drop(empty_tx);
        drop(full_rx);
        if reader.join().is_err() {
            log::warn!("copy reader thread panicked");
        }
        result
    })
}

/// Builds the template of a copied entry.
pub(crate) fn template(name: &str, source: Option<&ArchiveEntry>, preserve: bool) -> ArchiveEntry {
    let modified = if preserve {
        source.and_then(ArchiveEntry::modified)
    } else {
        None
    };
    ArchiveEntry::file(name).with_modified(modified)
}

/// Copies file entry `src_name` of `src` to `dst_name` of `dst`, with direct
/// data copying where possible.
pub(crate) fn copy_entry(
    src: &ArchiveController,
    src_name: &str,
    dst: &ArchiveController,
    dst_name: &str,
    create: AutoCreate,
    preserve: bool,
    config: &CopyConfig,
) -> Result<u64> {
    let _copying = lock_or_recover(&COPY_LOCK);

    if let Some((entry, raw)) = src.input_raw(src_name)? {
        let template = template(dst_name, Some(&entry), preserve);
        if let Some(size) = dst.write_raw(dst_name, &template, create, raw)? {
            log::trace!(
                "copied {} raw from {} to {}",
                src_name,
                src.target().display(),
                dst.target().display()
            );
            return Ok(size);
        }
    }

    let source = src.entry(src_name)?;
    let mut reader = src.input_stream(src_name)?;
    let template = template(dst_name, source.as_ref(), preserve);
    let mut writer = dst.output_stream(dst_name, create, Some(&template))?;
    let copied = cat(&mut reader, &mut writer, config)?;
    writer.close()?;
    reader.close();
    Ok(copied)
}
