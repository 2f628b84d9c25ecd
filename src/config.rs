//! Configuration for the archive filesystem.
//!
//! [`FsConfig`] holds the policy of an [`ArchiveFs`](crate::ArchiveFs)
//! instance, [`CopyConfig`] tunes the stream relay, and [`UpdateOptions`]
//! controls how an update treats open entry streams.

use std::path::PathBuf;
use std::time::Duration;

/// Default size of one relay buffer.
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of relay buffers.
pub const DEFAULT_COPY_BUFFER_COUNT: usize = 4;

/// Configuration of the copy engine.
///
/// # Example
///
/// ```rust
/// use archfs::CopyConfig;
///
/// let config = CopyConfig::new().buffer_size(16 * 1024).threaded(false);
/// assert_eq!(config.buffer_count, 4);
/// ```
#[derive(Debug, Clone)]
pub struct CopyConfig {
    /// Size of one relay buffer in bytes.
    ///
    /// Default: 64 KiB.
    pub buffer_size: usize,

    /// Number of buffers circulating between the reader thread and the
    /// writer. Values below 2 are raised to 2.
    ///
    /// Default: 4.
    pub buffer_count: usize,

    /// Fill buffers on a background thread while the caller drains them.
    ///
    /// Default: true.
    pub threaded: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            buffer_count: DEFAULT_COPY_BUFFER_COUNT,
            threaded: true,
        }
    }
}

impl CopyConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the relay buffer size (at least 1 byte).
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Sets the number of relay buffers.
    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    /// Enables or disables the background reader thread.
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }
}

/// Configuration of an [`ArchiveFs`](crate::ArchiveFs).
///
/// # Example
///
/// ```rust
/// use archfs::FsConfig;
///
/// let config = FsConfig::new().lenient(false).recent_capacity(8);
/// assert!(!config.lenient);
/// ```
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Create missing parent directories and enclosing archives when
    /// creating entries.
    ///
    /// Default: true.
    pub lenient: bool,

    /// Directory for temp files; the platform temp directory if `None`.
    ///
    /// Default: None.
    pub temp_dir: Option<PathBuf>,

    /// Number of recently used, unmodified archive controllers the registry
    /// keeps alive so that repeated access does not remount.
    ///
    /// Default: 32.
    pub recent_capacity: usize,

    /// How long an update waits for other threads' entry streams when
    /// waiting is requested.
    ///
    /// Default: 1 second.
    pub stream_wait_timeout: Duration,

    /// Copy engine configuration.
    pub copy: CopyConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            lenient: true,
            temp_dir: None,
            recent_capacity: 32,
            stream_wait_timeout: Duration::from_secs(1),
            copy: CopyConfig::default(),
        }
    }
}

impl FsConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the auto-create policy.
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    /// Sets the temp file directory.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Sets the number of cached unmodified controllers.
    pub fn recent_capacity(mut self, capacity: usize) -> Self {
        self.recent_capacity = capacity;
        self
    }

    /// Sets the stream wait timeout.
    pub fn stream_wait_timeout(mut self, timeout: Duration) -> Self {
        self.stream_wait_timeout = timeout;
        self
    }

    /// Sets the copy engine configuration.
    pub fn copy(mut self, copy: CopyConfig) -> Self {
        self.copy = copy;
        self
    }
}

/// How an update deals with entry streams held by other threads.
///
/// Waiting takes precedence over closing: with both set, the update waits up
/// to [`timeout`](Self::timeout) and then forcibly closes what is still open.
/// Streams of the calling thread are never waited for.
///
/// # Example
///
/// ```rust
/// use archfs::UpdateOptions;
/// use std::time::Duration;
///
/// let options = UpdateOptions::sync().wait_output_streams(true).timeout(Duration::from_millis(200));
/// assert!(!options.umount);
/// ```
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Wait for input streams of other threads.
    pub wait_input_streams: bool,
    /// Forcibly close input streams of other threads.
    pub close_input_streams: bool,
    /// Wait for output streams of other threads.
    pub wait_output_streams: bool,
    /// Forcibly close output streams of other threads.
    pub close_output_streams: bool,
    /// Release all resources afterwards instead of keeping the archive warm.
    pub umount: bool,
    /// Upper bound for waiting; zero checks once.
    pub timeout: Duration,
    /// Write nested archives back into their enclosing archives.
    pub(crate) reassemble: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self::sync()
    }
}

impl UpdateOptions {
    /// Commits pending changes and keeps archives mounted; fails with a busy
    /// diagnostic if other threads hold streams.
    pub fn sync() -> Self {
        Self {
            wait_input_streams: false,
            close_input_streams: false,
            wait_output_streams: false,
            close_output_streams: false,
            umount: false,
            timeout: Duration::ZERO,
            reassemble: true,
        }
    }

    /// Commits pending changes, forcibly closes all streams and unmounts.
    pub fn umount() -> Self {
        Self {
            close_input_streams: true,
            close_output_streams: true,
            umount: true,
            ..Self::sync()
        }
    }

    /// Commits without writing nested archives back into their enclosing
    /// archive; used before reading an entry that has pending data.
    pub(crate) fn local() -> Self {
        Self {
            reassemble: false,
            ..Self::sync()
        }
    }

    /// Sets whether to wait for input streams.
    pub fn wait_input_streams(mut self, wait: bool) -> Self {
        self.wait_input_streams = wait;
        self
    }

    /// Sets whether to force-close input streams.
    pub fn close_input_streams(mut self, close: bool) -> Self {
        self.close_input_streams = close;
        self
    }

    /// Sets whether to wait for output streams.
    pub fn wait_output_streams(mut self, wait: bool) -> Self {
        self.wait_output_streams = wait;
        self
    }

    /// Sets whether to force-close output streams.
    pub fn close_output_streams(mut self, close: bool) -> Self {
        self.close_output_streams = close;
        self
    }

    /// Sets whether to unmount.
    pub fn set_umount(mut self, umount: bool) -> Self {
        self.umount = umount;
        self
    }

    /// Sets the wait timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_config_defaults() {
        let config = FsConfig::default();
        assert!(config.lenient);
        assert!(config.temp_dir.is_none());
        assert_eq!(config.recent_capacity, 32);
        assert_eq!(config.copy.buffer_size, DEFAULT_COPY_BUFFER_SIZE);
    }

    #[test]
    fn test_copy_config_clamps_buffer_size() {
        assert_eq!(CopyConfig::new().buffer_size(0).buffer_size, 1);
    }

    #[test]
    fn test_update_presets() {
        let sync = UpdateOptions::sync();
        assert!(!sync.umount && !sync.close_input_streams && sync.reassemble);

        let umount = UpdateOptions::umount();
        assert!(umount.umount && umount.close_input_streams && umount.close_output_streams);
        assert!(umount.reassemble);

        assert!(!UpdateOptions::local().reassemble);
    }

    #[test]
    fn test_update_builders() {
        let options = UpdateOptions::sync()
            .wait_input_streams(true)
            .set_umount(true)
            .timeout(Duration::from_millis(5));
        assert!(options.wait_input_streams);
        assert!(options.umount);
        assert_eq!(options.timeout, Duration::from_millis(5));
    }
}
