//! Archive detection by file name suffix.
//!
//! An [`ArchiveDetector`] decides, from a path alone, whether the path is
//! presumed to be an archive and which [`ArchiveDriver`] handles it. The
//! guess is confirmed only when the archive is mounted; a wrong guess is a
//! [false positive](crate::FalsePositive) and the path is treated as a plain
//! file or directory instead.

use std::fmt;
use std::sync::Arc;

use crate::driver::{ArchiveDriver, TarDriver, ZipDriver};

/// Maps path names to archive drivers.
pub trait ArchiveDetector: Send + Sync + fmt::Debug {
    /// Returns the driver for `path` if it is presumed to be an archive.
    fn driver_for(&self, path: &str) -> Option<Arc<dyn ArchiveDriver>>;
}

/// A detector with a fixed table of case-insensitive suffixes.
///
/// The longest matching suffix wins, so `.tar.gz` takes precedence over a
/// hypothetical `.gz` registration. A suffix only matches after a `.` and
/// never the whole file name, so a file called `zip` is not an archive.
///
/// # Example
///
/// ```rust
/// use archfs::{ArchiveDetector, DefaultArchiveDetector};
///
/// let detector = DefaultArchiveDetector::new();
/// assert!(detector.driver_for("/tmp/a.ZIP").is_some());
/// assert!(detector.driver_for("/tmp/b.tar.gz").is_some());
/// assert!(detector.driver_for("/tmp/readme.txt").is_none());
/// ```
#[derive(Clone)]
pub struct DefaultArchiveDetector {
    suffixes: Vec<(String, Arc<dyn ArchiveDriver>)>,
}

impl fmt::Debug for DefaultArchiveDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.suffixes.iter().map(|(s, d)| (s, d.name())))
            .finish()
    }
}

impl Default for DefaultArchiveDetector {
    fn default() -> Self {
        let zip: Arc<dyn ArchiveDriver> = Arc::new(ZipDriver::new());
        let tar: Arc<dyn ArchiveDriver> = Arc::new(TarDriver::new());
        let detector = Self::empty()
            .with_suffix("zip", Arc::clone(&zip))
            .with_suffix("jar", zip)
            .with_suffix("tar", tar);
        #[cfg(feature = "deflate")]
        let detector = {
            let tgz: Arc<dyn ArchiveDriver> =
                Arc::new(TarDriver::with_compression(crate::TarCompression::Gzip));
            detector
                .with_suffix("tar.gz", Arc::clone(&tgz))
                .with_suffix("tgz", tgz)
        };
        #[cfg(feature = "bzip2")]
        let detector = {
            let tbz: Arc<dyn ArchiveDriver> =
                Arc::new(TarDriver::with_compression(crate::TarCompression::Bzip2));
            detector
                .with_suffix("tar.bz2", Arc::clone(&tbz))
                .with_suffix("tbz2", tbz)
        };
        detector
    }
}

impl DefaultArchiveDetector {
    /// Creates a detector for all built-in formats enabled at compile time:
    /// `zip`, `jar`, `tar`, and with the corresponding features `tar.gz`,
    /// `tgz`, `tar.bz2` and `tbz2`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a detector that recognizes nothing; every path is native.
    pub fn empty() -> Self {
        Self {
            suffixes: Vec::new(),
        }
    }

    /// Registers `driver` for `suffix` (without the leading dot), replacing
    /// any previous registration of the same suffix.
    pub fn with_suffix(mut self, suffix: &str, driver: Arc<dyn ArchiveDriver>) -> Self {
        let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
        self.suffixes.retain(|(s, _)| *s != suffix);
        self.suffixes.push((suffix, driver));
        // longest first, so the first match is the most specific one
        self.suffixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Returns the registered suffixes, longest first.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        self.suffixes.iter().map(|(s, _)| s.as_str())
    }
}

impl ArchiveDetector for DefaultArchiveDetector {
    fn driver_for(&self, path: &str) -> Option<Arc<dyn ArchiveDriver>> {
        let name = path
            .trim_end_matches(['/', std::path::MAIN_SEPARATOR])
            .rsplit(['/', std::path::MAIN_SEPARATOR])
            .next()?
            .to_ascii_lowercase();
        self.suffixes.iter().find_map(|(suffix, driver)| {
            let stem = name.strip_suffix(suffix.as_str())?;
            let stem = stem.strip_suffix('.')?;
            (!stem.is_empty()).then(|| Arc::clone(driver))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_suffixes() {
        let detector = DefaultArchiveDetector::new();
        assert_eq!(detector.driver_for("a.zip").unwrap().name(), "zip");
        assert_eq!(detector.driver_for("dir/lib.JAR").unwrap().name(), "zip");
        assert_eq!(detector.driver_for("x.tar").unwrap().name(), "tar");
        assert!(detector.driver_for("notes.txt").is_none());
    }

    #[test]
    fn test_requires_dot_and_stem() {
        let detector = DefaultArchiveDetector::new();
        assert!(detector.driver_for("zip").is_none());
        assert!(detector.driver_for(".zip").is_none());
        assert!(detector.driver_for("azip").is_none());
    }

    #[test]
    fn test_only_last_segment_counts() {
        let detector = DefaultArchiveDetector::new();
        assert!(detector.driver_for("a.zip/readme").is_none());
        assert!(detector.driver_for("a.zip/b.zip").is_some());
        assert!(detector.driver_for("a.zip/").is_some());
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn test_longest_suffix_wins() {
        let detector = DefaultArchiveDetector::new().with_suffix("gz", Arc::new(ZipDriver::new()));
        assert_eq!(detector.driver_for("a.tar.gz").unwrap().name(), "tar");
        assert_eq!(detector.driver_for("a.gz").unwrap().name(), "zip");
    }

    #[test]
    fn test_empty_detects_nothing() {
        assert!(DefaultArchiveDetector::empty().driver_for("a.zip").is_none());
    }

    #[test]
    fn test_reregistering_replaces() {
        let detector = DefaultArchiveDetector::empty()
            .with_suffix("zip", Arc::new(TarDriver::new()))
            .with_suffix(".ZIP", Arc::new(ZipDriver::new()));
        assert_eq!(detector.suffixes().count(), 1);
        assert_eq!(detector.driver_for("a.zip").unwrap().name(), "zip");
    }
}
