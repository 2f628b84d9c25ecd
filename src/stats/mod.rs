//! Registry statistics.
//!
//! The registry counts mounts, updates and the bytes that updates move
//! between archives and their targets. The counters are fed by wrappers
//! around the readers and writers used while writing archives, and can be
//! inspected with [`Registry::stats`](crate::Registry::stats).

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A snapshot of registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Controllers currently alive.
    pub controllers: usize,
    /// Controllers with uncommitted changes.
    pub touched: usize,
    /// Controllers whose archive lives directly in the native filesystem.
    pub top_level: usize,
    /// Archives mounted since the registry was created.
    pub mounts: u64,
    /// Archive updates that wrote a new archive.
    pub updates: u64,
    /// Bytes read from input archives while writing updates.
    pub bytes_read: u64,
    /// Bytes written to output archives and targets while writing updates.
    pub bytes_written: u64,
    /// Total time spent writing updates (microseconds).
    pub update_time_us: u64,
}

impl RegistryStats {
    /// Returns the average time per update in microseconds.
    pub fn avg_update_time_us(&self) -> f64 {
        if self.updates == 0 {
            0.0
        } else {
            self.update_time_us as f64 / self.updates as f64
        }
    }

    /// Returns the throughput of updates in bytes per second.
    pub fn throughput_bytes_per_sec(&self) -> f64 {
        if self.update_time_us == 0 {
            0.0
        } else {
            (self.bytes_written as f64 * 1_000_000.0) / self.update_time_us as f64
        }
    }
}

/// Shared counters behind [`RegistryStats`].
#[derive(Debug, Default)]
pub(crate) struct IoCounters {
    mounts: AtomicU64,
    updates: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    update_time_us: AtomicU64,
}

impl IoCounters {
    pub(crate) fn record_mount(&self) {
        self.mounts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self, elapsed: Duration) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.update_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    /// Fills in the I/O part of a snapshot.
    pub(crate) fn fill(&self, stats: &mut RegistryStats) {
        stats.mounts = self.mounts.load(Ordering::Relaxed);
        stats.updates = self.updates.load(Ordering::Relaxed);
        stats.bytes_read = self.bytes_read.load(Ordering::Relaxed);
        stats.bytes_written = self.bytes_written.load(Ordering::Relaxed);
        stats.update_time_us = self.update_time_us.load(Ordering::Relaxed);
    }
}

/// A reader that adds every byte it yields to the read counter.
pub(crate) struct CountingReader<R> {
    inner: R,
    counters: Arc<IoCounters>,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R, counters: Arc<IoCounters>) -> Self {
        Self { inner, counters }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counters.add_read(n as u64);
        Ok(n)
    }
}

/// A writer that adds every byte it accepts to the write counter.
pub(crate) struct CountingWriter<W> {
    inner: W,
    counters: Arc<IoCounters>,
}

impl<W> CountingWriter<W> {
    pub(crate) fn new(inner: W, counters: Arc<IoCounters>) -> Self {
        Self { inner, counters }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.counters.add_written(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_counting_wrappers() {
        let counters = Arc::new(IoCounters::default());
        let mut reader = CountingReader::new(Cursor::new(vec![7u8; 100]), Arc::clone(&counters));
        let mut writer = CountingWriter::new(Vec::new(), Arc::clone(&counters));
        io::copy(&mut reader, &mut writer).unwrap();

        let mut stats = RegistryStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.bytes_read, 100);
        assert_eq!(stats.bytes_written, 100);
    }

    #[test]
    fn test_averages() {
        let counters = IoCounters::default();
        counters.record_update(Duration::from_micros(300));
        counters.record_update(Duration::from_micros(100));
        counters.add_written(2_000);
        let mut stats = RegistryStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.updates, 2);
        assert_eq!(stats.avg_update_time_us(), 200.0);
        assert_eq!(stats.throughput_bytes_per_sec(), 5_000_000.0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = RegistryStats::default();
        assert_eq!(stats.avg_update_time_us(), 0.0);
        assert_eq!(stats.throughput_bytes_per_sec(), 0.0);
    }
}
