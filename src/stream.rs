//! Entry streams and their bookkeeping.
//!
//! Every stream handed out by an archive controller is registered with the
//! [`StreamTracker`] of the session it reads from or writes to. An update
//! consults the tracker to find out whether other threads still use the
//! archive, waits for them if asked to, and finally disconnects whatever is
//! left so the backing files can be replaced.
//!
//! A disconnected stream fails every further read or write with an error
//! that [`is_stream_closed`](crate::is_stream_closed) recognizes. Closing a
//! stream is idempotent and never fails because of a disconnection.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::driver::{ArchiveEntry, OutputArchive, RawEntry};
use crate::error::stream_closed;
use crate::lock::lock_or_recover;
use crate::{Error, Result};

/// A stream that can be cut off by the tracker.
pub(crate) trait TrackedStream: Send + Sync {
    /// Releases the stream's resources. Returns `Ok(true)` if the stream was
    /// still open.
    fn disconnect(&self) -> Result<bool>;
}

struct Registration {
    thread: ThreadId,
    stream: Arc<dyn TrackedStream>,
}

#[derive(Default)]
struct TrackerState {
    next_id: u64,
    open: HashMap<u64, Registration>,
    stopped: bool,
}

/// What [`StreamTracker::close_all`] did.
#[derive(Debug, Default)]
pub(crate) struct CloseSummary {
    /// Streams that were still open.
    pub(crate) disconnected: usize,
    /// Failures while committing force-closed writers.
    pub(crate) errors: Vec<Error>,
}

/// Keeps track of the open streams of one input or output session.
#[derive(Default)]
pub(crate) struct StreamTracker {
    state: Mutex<TrackerState>,
    changed: Condvar,
}

impl fmt::Debug for StreamTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_or_recover(&self.state);
        f.debug_struct("StreamTracker")
            .field("open", &state.open.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl StreamTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, stream: Arc<dyn TrackedStream>) -> Result<u64> {
        let mut state = lock_or_recover(&self.state);
        if state.stopped {
            return Err(Error::StreamClosed);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.open.insert(
            id,
            Registration {
                thread: thread::current().id(),
                stream,
            },
        );
        Ok(id)
    }

    fn unregister(&self, id: u64) {
        let mut state = lock_or_recover(&self.state);
        if state.open.remove(&id).is_some() {
            self.changed.notify_all();
        }
    }

    /// Returns the number of open streams.
    pub(crate) fn open_count(&self) -> usize {
        lock_or_recover(&self.state).open.len()
    }

    /// Returns the number of open streams opened by other threads.
    pub(crate) fn other_threads_count(&self) -> usize {
        let me = thread::current().id();
        lock_or_recover(&self.state)
            .open
            .values()
            .filter(|r| r.thread != me)
            .count()
    }

    /// Waits up to `timeout` for all streams of other threads to be closed.
    ///
    /// Returns the number of such streams still open afterwards. A zero
    /// timeout checks once without blocking.
    pub(crate) fn wait_other_threads(&self, timeout: Duration) -> usize {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = lock_or_recover(&self.state);
        loop {
            let others = state.open.values().filter(|r| r.thread != me).count();
            let now = Instant::now();
            if others == 0 || now >= deadline {
                return others;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Disconnects every open stream and rejects streams opened later.
    pub(crate) fn close_all(&self) -> CloseSummary {
        // drained under the lock, disconnected outside of it: a writer's
        // disconnect waits for a commit in flight, and that writer
        // unregisters afterwards
        let streams: Vec<_> = {
            let mut state = lock_or_recover(&self.state);
            state.stopped = true;
            let streams = state.open.drain().map(|(_, r)| r.stream).collect();
            self.changed.notify_all();
            streams
        };
        let mut summary = CloseSummary::default();
        for stream in streams {
            match stream.disconnect() {
                Ok(true) => summary.disconnected += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.disconnected += 1;
                    summary.errors.push(e);
                }
            }
        }
        summary
    }
}

struct ReaderShared {
    inner: Mutex<Option<Box<dyn Read + Send>>>,
}

impl TrackedStream for ReaderShared {
    fn disconnect(&self) -> Result<bool> {
        Ok(lock_or_recover(&self.inner).take().is_some())
    }
}

/// Reads the content of one archive entry.
///
/// Dropping the reader closes it.
pub struct EntryReader {
    shared: Arc<ReaderShared>,
    tracker: Arc<StreamTracker>,
    id: Option<u64>,
}

impl fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryReader")
            .field("open", &self.id.is_some())
            .finish_non_exhaustive()
    }
}

impl EntryReader {
    pub(crate) fn open(tracker: &Arc<StreamTracker>, inner: Box<dyn Read + Send>) -> Result<Self> {
        let shared = Arc::new(ReaderShared {
            inner: Mutex::new(Some(inner)),
        });
        let id = tracker.register(Arc::clone(&shared) as Arc<dyn TrackedStream>)?;
        Ok(Self {
            shared,
            tracker: Arc::clone(tracker),
            id: Some(id),
        })
    }

    /// Closes the reader. Further calls do nothing.
    pub fn close(&mut self) {
        if let Some(id) = self.id.take() {
            lock_or_recover(&self.shared.inner).take();
            self.tracker.unregister(id);
        }
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.id.is_none() {
            return Err(stream_closed());
        }
        match lock_or_recover(&self.shared.inner).as_mut() {
            Some(inner) => inner.read(buf),
            None => Err(stream_closed()),
        }
    }
}

impl Drop for EntryReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Whether an entry of the current output session has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WrittenEntry {
    /// A writer is open for it.
    Pending,
    /// Its content is in the output archive.
    Done(u64),
}

/// The output archive of a session and what has gone into it so far.
pub(crate) struct OutputSink {
    pub(crate) archive: Box<dyn OutputArchive>,
    pub(crate) written: HashMap<String, WrittenEntry>,
}

impl OutputSink {
    pub(crate) fn new(archive: Box<dyn OutputArchive>) -> Self {
        Self {
            archive,
            written: HashMap::new(),
        }
    }

    /// Returns the committed size of `name`, if any.
    pub(crate) fn size_of(&self, name: &str) -> Option<u64> {
        match self.written.get(name) {
            Some(WrittenEntry::Done(size)) => Some(*size),
            _ => None,
        }
    }

    /// Writes `entry` with the content of `data` and records it.
    pub(crate) fn write(&mut self, entry: &ArchiveEntry, data: &mut dyn Read) -> Result<u64> {
        let size = self.archive.write_entry(entry, data)?;
        self.written
            .insert(entry.name().to_string(), WrittenEntry::Done(size));
        Ok(size)
    }

    /// Writes `entry` with already encoded content and records it.
    pub(crate) fn write_raw(&mut self, entry: &ArchiveEntry, raw: RawEntry) -> Result<u64> {
        let size = self.archive.write_raw(entry, raw)?;
        self.written
            .insert(entry.name().to_string(), WrittenEntry::Done(size));
        Ok(size)
    }
}

struct Staged {
    file: BufWriter<File>,
    len: u64,
}

struct WriterShared {
    entry: ArchiveEntry,
    sink: Arc<Mutex<OutputSink>>,
    staged: Mutex<Option<Staged>>,
}

impl WriterShared {
    /// Appends the staged bytes to the output archive.
    ///
    /// The staging lock is held until the entry is in the archive, so a
    /// disconnect racing with [`EntryWriter::close`] returns only after the
    /// commit in flight is done.
    fn commit(&self) -> Result<Option<u64>> {
        let mut slot = lock_or_recover(&self.staged);
        let Some(staged) = slot.take() else {
            return Ok(None);
        };
        let mut sink = lock_or_recover(&self.sink);
        let result = (|| -> Result<u64> {
            let mut file = staged.file.into_inner().map_err(|e| e.into_error())?;
            file.seek(SeekFrom::Start(0))?;
            let entry = self.entry.clone().with_size(staged.len);
            sink.write(&entry, &mut file)
        })();
        if result.is_err() {
            sink.written.remove(self.entry.name());
        }
        result.map(Some)
    }
}

impl TrackedStream for WriterShared {
    fn disconnect(&self) -> Result<bool> {
        let committed = self.commit()?;
        if committed.is_some() {
            log::warn!(
                "output stream for {} was forcibly closed; committed what was written",
                self.entry.name()
            );
        }
        Ok(committed.is_some())
    }
}

/// Writes the content of one archive entry.
///
/// Bytes are staged in an anonymous temp file and appended to the output
/// archive when the writer is closed. Dropping the writer closes it; use
/// [`close`](Self::close) to observe failures.
pub struct EntryWriter {
    shared: Arc<WriterShared>,
    tracker: Arc<StreamTracker>,
    id: Option<u64>,
}

impl fmt::Debug for EntryWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryWriter")
            .field("entry", &self.shared.entry.name())
            .field("open", &self.id.is_some())
            .finish_non_exhaustive()
    }
}

impl EntryWriter {
    /// Opens a writer for `entry`, which must already be registered as
    /// pending in `sink`.
    pub(crate) fn open(
        tracker: &Arc<StreamTracker>,
        sink: &Arc<Mutex<OutputSink>>,
        entry: ArchiveEntry,
        temp_dir: Option<&Path>,
    ) -> Result<Self> {
        let file = match temp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let shared = Arc::new(WriterShared {
            entry,
            sink: Arc::clone(sink),
            staged: Mutex::new(Some(Staged {
                file: BufWriter::new(file),
                len: 0,
            })),
        });
        let id = tracker.register(Arc::clone(&shared) as Arc<dyn TrackedStream>)?;
        Ok(Self {
            shared,
            tracker: Arc::clone(tracker),
            id: Some(id),
        })
    }

    /// Returns the name of the entry being written.
    pub fn entry_name(&self) -> &str {
        self.shared.entry.name()
    }

    /// Closes the writer without committing anything.
    pub(crate) fn abandon(mut self) {
        if let Some(id) = self.id.take() {
            lock_or_recover(&self.shared.staged).take();
            lock_or_recover(&self.shared.sink)
                .written
                .remove(self.shared.entry.name());
            self.tracker.unregister(id);
        }
    }

    /// Closes the writer and commits the entry. Returns the number of bytes
    /// written, or `None` if the writer was already closed or disconnected.
    pub fn close(&mut self) -> Result<Option<u64>> {
        let Some(id) = self.id.take() else {
            return Ok(None);
        };
        let result = self.shared.commit();
        self.tracker.unregister(id);
        result
    }
}

impl Write for EntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.id.is_none() {
            return Err(stream_closed());
        }
        match lock_or_recover(&self.shared.staged).as_mut() {
            Some(staged) => {
                let n = staged.file.write(buf)?;
                staged.len += n as u64;
                Ok(n)
            }
            None => Err(stream_closed()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock_or_recover(&self.shared.staged).as_mut() {
            Some(staged) => staged.file.flush(),
            None if self.id.is_some() => Err(stream_closed()),
            None => Ok(()),
        }
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to commit entry {}: {}", self.shared.entry.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::OutputArchive;
    use std::io::Cursor;

    #[derive(Default)]
    struct MemoryOutput {
        entries: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl OutputArchive for MemoryOutput {
        fn write_entry(&mut self, entry: &ArchiveEntry, data: &mut dyn Read) -> Result<u64> {
            let mut buf = Vec::new();
            data.read_to_end(&mut buf)?;
            let len = buf.len() as u64;
            self.entries
                .lock()
                .unwrap()
                .push((entry.name().to_string(), buf));
            Ok(len)
        }

        fn write_directory(&mut self, _entry: &ArchiveEntry) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn sink() -> (Arc<Mutex<OutputSink>>, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
        let output = MemoryOutput::default();
        let entries = Arc::clone(&output.entries);
        (
            Arc::new(Mutex::new(OutputSink::new(Box::new(output)))),
            entries,
        )
    }

    #[test]
    fn test_reader_close_is_idempotent() {
        let tracker = Arc::new(StreamTracker::new());
        let mut reader = EntryReader::open(&tracker, Box::new(Cursor::new(b"abc".to_vec()))).unwrap();
        assert_eq!(tracker.open_count(), 1);
        let mut buf = String::new();
        reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abc");
        reader.close();
        reader.close();
        drop(reader);
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_disconnected_reader_fails() {
        let tracker = Arc::new(StreamTracker::new());
        let mut reader = EntryReader::open(&tracker, Box::new(Cursor::new(vec![1u8; 10]))).unwrap();
        let summary = tracker.close_all();
        assert_eq!(summary.disconnected, 1);
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert!(crate::is_stream_closed(&err));
        reader.close();
        assert!(EntryReader::open(&tracker, Box::new(io::empty())).is_err());
    }

    #[test]
    fn test_writer_commits_on_close() {
        let tracker = Arc::new(StreamTracker::new());
        let (sink, entries) = sink();
        let mut writer =
            EntryWriter::open(&tracker, &sink, ArchiveEntry::file("a.txt"), None).unwrap();
        writer.write_all(b"hello").unwrap();
        assert_eq!(writer.close().unwrap(), Some(5));
        assert_eq!(writer.close().unwrap(), None);
        assert!(writer.write(b"x").is_err());
        assert_eq!(tracker.open_count(), 0);
        assert_eq!(lock_or_recover(&sink).size_of("a.txt"), Some(5));
        assert_eq!(entries.lock().unwrap()[0], ("a.txt".to_string(), b"hello".to_vec()));
    }

    #[test]
    fn test_force_closed_writer_commits_staged_bytes() {
        let tracker = Arc::new(StreamTracker::new());
        let (sink, entries) = sink();
        let mut writer =
            EntryWriter::open(&tracker, &sink, ArchiveEntry::file("partial"), None).unwrap();
        writer.write_all(b"abc").unwrap();
        let summary = tracker.close_all();
        assert_eq!(summary.disconnected, 1);
        assert!(summary.errors.is_empty());
        let err = writer.write(b"more").unwrap_err();
        assert!(crate::is_stream_closed(&err));
        assert_eq!(writer.close().unwrap(), None);
        assert_eq!(entries.lock().unwrap()[0].1, b"abc");
    }

    struct SlowOutput {
        started: std::sync::mpsc::Sender<()>,
        inner: MemoryOutput,
    }

    impl OutputArchive for SlowOutput {
        fn write_entry(&mut self, entry: &ArchiveEntry, data: &mut dyn Read) -> Result<u64> {
            self.started.send(()).ok();
            thread::sleep(Duration::from_millis(100));
            self.inner.write_entry(entry, data)
        }

        fn write_directory(&mut self, _entry: &ArchiveEntry) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_close_all_waits_for_commit_in_flight() {
        let (tx, rx) = std::sync::mpsc::channel();
        let inner = MemoryOutput::default();
        let entries = Arc::clone(&inner.entries);
        let output = SlowOutput { started: tx, inner };
        let sink = Arc::new(Mutex::new(OutputSink::new(Box::new(output))));
        let tracker = Arc::new(StreamTracker::new());
        let mut writer =
            EntryWriter::open(&tracker, &sink, ArchiveEntry::file("slow"), None).unwrap();
        writer.write_all(b"slow data").unwrap();

        let handle = thread::spawn(move || writer.close().unwrap());
        rx.recv().unwrap();
        let summary = tracker.close_all();
        assert_eq!(summary.disconnected, 0);
        assert!(summary.errors.is_empty());
        assert_eq!(entries.lock().unwrap().len(), 1);
        assert_eq!(lock_or_recover(&sink).size_of("slow"), Some(9));
        assert_eq!(handle.join().unwrap(), Some(9));
    }

    #[test]
    fn test_wait_other_threads() {
        let tracker = Arc::new(StreamTracker::new());
        let own = EntryReader::open(&tracker, Box::new(io::empty())).unwrap();
        assert_eq!(tracker.wait_other_threads(Duration::ZERO), 0);

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let reader = EntryReader::open(&tracker, Box::new(io::empty())).unwrap();
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                drop(reader);
            })
        };
        rx.recv().unwrap();
        assert_eq!(tracker.other_threads_count(), 1);
        assert_eq!(tracker.wait_other_threads(Duration::from_secs(5)), 0);
        handle.join().unwrap();
        drop(own);
    }
}
