//! Path resolution.
//!
//! A [`ResolvedPath`] classifies a native path name as either a plain native
//! path or as an entry inside a chain of archives. Archives are recognized
//! by name only, through an [`ArchiveDetector`]; whether a presumed archive
//! really is one is decided when it is mounted.
//!
//! ```rust
//! use archfs::{DefaultArchiveDetector, ResolvedPath};
//!
//! let detector = DefaultArchiveDetector::new();
//! let path = ResolvedPath::resolve("/data/a.zip/docs/b.tar/readme.txt", &detector);
//! assert_eq!(path.depth(), 2);
//! assert_eq!(path.inner_entry_name(), Some("readme.txt"));
//! assert_eq!(path.encl_entry_name(), Some("readme.txt"));
//! assert_eq!(path.levels()[1].entry_name(), Some("docs/b.tar"));
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::detector::ArchiveDetector;
use crate::driver::ArchiveDriver;
use crate::entry_name::SEPARATOR;

/// One presumed archive in a resolved path.
#[derive(Clone)]
pub struct ArchiveLevel {
    path: PathBuf,
    driver: Arc<dyn ArchiveDriver>,
    entry: Option<String>,
}

impl ArchiveLevel {
    /// Returns the path of the archive, which identifies its controller.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the driver the detector chose.
    pub fn driver(&self) -> &Arc<dyn ArchiveDriver> {
        &self.driver
    }

    /// Returns the entry name of this archive inside the enclosing archive,
    /// or `None` for an archive in the native filesystem.
    pub fn entry_name(&self) -> Option<&str> {
        self.entry.as_deref()
    }
}

impl fmt::Debug for ArchiveLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveLevel")
            .field("path", &self.path)
            .field("driver", &self.driver.name())
            .field("entry", &self.entry)
            .finish()
    }
}

/// A path classified into its archive chain and innermost entry name.
///
/// Exactly one holds: the path is native (no archive levels), or it has an
/// innermost archive and innermost entry name. The innermost archive is the
/// path itself exactly when the innermost entry name is empty.
#[derive(Clone)]
pub struct ResolvedPath {
    path: PathBuf,
    root: PathBuf,
    segments: Vec<String>,
    /// Indices into `segments` of the archive boundaries, outermost first.
    boundaries: Vec<usize>,
    chain: Vec<ArchiveLevel>,
    entry: String,
}

impl fmt::Debug for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedPath")
            .field("path", &self.path)
            .field("chain", &self.chain)
            .field("entry", &self.entry)
            .finish()
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Splits a path into its root and normalized segments.
///
/// Segments are processed from the end backward: `..` increments a skip
/// count that the next real segment consumes, `.` and empty segments are
/// dropped. Unconsumed `..` segments of a relative path are kept in front.
fn normalize(path: &Path) -> (PathBuf, Vec<String>) {
    let mut root = PathBuf::new();
    let mut raw = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => root.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => raw.push(None),
            Component::Normal(s) => raw.push(Some(s.to_string_lossy().into_owned())),
        }
    }
    let mut skip = 0usize;
    let mut segments = Vec::with_capacity(raw.len());
    for segment in raw.into_iter().rev() {
        match segment {
            None => skip += 1,
            Some(s) if s.is_empty() => {}
            Some(_) if skip > 0 => skip -= 1,
            Some(s) => segments.push(s),
        }
    }
    if !root.has_root() {
        segments.extend(std::iter::repeat_n("..".to_string(), skip));
    }
    segments.reverse();
    (root, segments)
}

impl ResolvedPath {
    /// Resolves `path` with `detector`.
    pub fn resolve(path: impl AsRef<Path>, detector: &dyn ArchiveDetector) -> Self {
        let (root, segments) = normalize(path.as_ref());
        let mut resolved = Self {
            path: root.clone(),
            root,
            segments: Vec::new(),
            boundaries: Vec::new(),
            chain: Vec::new(),
            entry: String::new(),
        };
        resolved.extend(segments, detector);
        resolved
    }

    /// Resolves `rest` relative to an already resolved `ancestor`, reusing
    /// the ancestor's archive chain instead of scanning its segments again.
    ///
    /// The result is the same as resolving the joined path from scratch.
    pub fn resolve_from(
        ancestor: &ResolvedPath,
        rest: impl AsRef<Path>,
        detector: &dyn ArchiveDetector,
    ) -> Self {
        let rest = rest.as_ref();
        let (rest_root, segments) = normalize(rest);
        let climbs_out = segments.first().is_some_and(|s| s == "..");
        if rest_root.as_os_str().is_empty() && !climbs_out {
            let mut resolved = ancestor.clone();
            resolved.extend(segments, detector);
            resolved
        } else {
            Self::resolve(ancestor.path.join(rest), detector)
        }
    }

    fn extend(&mut self, segments: Vec<String>, detector: &dyn ArchiveDetector) {
        for segment in segments {
            self.path.push(&segment);
            self.segments.push(segment);
            let index = self.segments.len() - 1;
            if let Some(driver) = detector.driver_for(&self.path.to_string_lossy()) {
                let entry = self.boundaries.last().map(|_| self.entry.clone());
                self.boundaries.push(index);
                self.chain.push(ArchiveLevel {
                    path: self.path.clone(),
                    driver,
                    entry,
                });
                self.entry.clear();
            } else if self.boundaries.is_empty() {
                // still in the native filesystem
            } else {
                if !self.entry.is_empty() {
                    self.entry.push(SEPARATOR);
                }
                self.entry.push_str(&self.segments[index]);
            }
        }
    }

    /// Returns the normalized path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the root part of the path (empty for relative paths).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the presumed archives on the path, outermost first.
    pub fn levels(&self) -> &[ArchiveLevel] {
        &self.chain
    }

    /// Returns the number of presumed archives on the path.
    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    /// Returns `true` if no presumed archive is on the path.
    pub fn is_native(&self) -> bool {
        self.chain.is_empty()
    }

    /// Returns `true` if the path itself is a presumed archive.
    pub fn is_archive(&self) -> bool {
        !self.chain.is_empty() && self.entry.is_empty()
    }

    /// Returns `true` if the path names an entry inside a presumed archive.
    pub fn is_entry(&self) -> bool {
        !self.entry.is_empty()
    }

    /// Returns the innermost presumed archive, which is the path itself if
    /// [`is_archive`](Self::is_archive).
    pub fn inner_archive(&self) -> Option<&ArchiveLevel> {
        self.chain.last()
    }

    /// Returns the entry name inside the innermost archive; empty if the path
    /// is an archive itself.
    pub fn inner_entry_name(&self) -> Option<&str> {
        self.chain.last().map(|_| self.entry.as_str())
    }

    /// Returns the archive that holds this path as an entry.
    pub fn encl_archive(&self) -> Option<&ArchiveLevel> {
        if self.is_entry() {
            self.chain.last()
        } else {
            self.chain.len().checked_sub(2).map(|i| &self.chain[i])
        }
    }

    /// Returns this path's entry name inside [`encl_archive`](Self::encl_archive).
    pub fn encl_entry_name(&self) -> Option<&str> {
        if self.is_entry() {
            Some(&self.entry)
        } else {
            self.chain.last().and_then(ArchiveLevel::entry_name)
        }
    }

    /// Returns the index of the innermost archive in [`levels`](Self::levels).
    pub(crate) fn inner_index(&self) -> Option<usize> {
        self.chain.len().checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DefaultArchiveDetector;

    fn resolve(path: &str) -> ResolvedPath {
        ResolvedPath::resolve(path, &DefaultArchiveDetector::new())
    }

    fn check_contract(p: &ResolvedPath) {
        match p.inner_archive() {
            None => {
                assert!(p.is_native());
                assert!(p.inner_entry_name().is_none());
            }
            Some(inner) => {
                assert_eq!(inner.path() == p.path(), p.inner_entry_name() == Some(""));
            }
        }
        assert_eq!(p.encl_archive().is_some(), p.encl_entry_name().is_some());
    }

    #[test]
    fn test_native_path() {
        let p = resolve("/tmp/dir/file.txt");
        assert!(p.is_native());
        assert_eq!(p.path(), Path::new("/tmp/dir/file.txt"));
        assert!(p.encl_archive().is_none());
        check_contract(&p);
    }

    #[test]
    fn test_archive_itself() {
        let p = resolve("/tmp/a.zip");
        assert!(p.is_archive());
        assert!(!p.is_entry());
        assert_eq!(p.inner_entry_name(), Some(""));
        assert!(p.encl_archive().is_none());
        check_contract(&p);
    }

    #[test]
    fn test_entry_in_archive() {
        let p = resolve("/tmp/a.zip/dir/x.txt");
        assert!(p.is_entry());
        assert_eq!(p.inner_archive().unwrap().path(), Path::new("/tmp/a.zip"));
        assert_eq!(p.inner_entry_name(), Some("dir/x.txt"));
        assert_eq!(p.encl_archive().unwrap().path(), Path::new("/tmp/a.zip"));
        assert_eq!(p.encl_entry_name(), Some("dir/x.txt"));
        check_contract(&p);
    }

    #[test]
    fn test_nested_archive() {
        let p = resolve("/tmp/a.zip/sub/b.tar.gz");
        assert!(p.is_archive());
        assert_eq!(p.depth(), 2);
        assert_eq!(p.encl_archive().unwrap().path(), Path::new("/tmp/a.zip"));
        assert_eq!(p.encl_entry_name(), Some("sub/b.tar.gz"));
        assert_eq!(p.levels()[0].entry_name(), None);
        assert_eq!(p.levels()[1].entry_name(), Some("sub/b.tar.gz"));
        check_contract(&p);
    }

    #[test]
    fn test_dot_segments() {
        let p = resolve("/tmp/./x/../a.zip/d/./e/../f");
        assert_eq!(p.path(), Path::new("/tmp/a.zip/d/f"));
        assert_eq!(p.inner_entry_name(), Some("d/f"));

        let up = resolve("/tmp/a.zip/b.zip/..");
        assert!(up.is_archive());
        assert_eq!(up.path(), Path::new("/tmp/a.zip"));
    }

    #[test]
    fn test_relative_paths() {
        let p = resolve("../x/a.zip/e");
        assert_eq!(p.path(), Path::new("../x/a.zip/e"));
        assert_eq!(p.inner_entry_name(), Some("e"));
        assert!(resolve("/..").is_native());
    }

    #[test]
    fn test_resolve_from_matches_full_resolve() {
        let detector = DefaultArchiveDetector::new();
        let ancestor = ResolvedPath::resolve("/tmp/a.zip/d", &detector);
        for rest in ["b.zip/x", "e/f.tar", "", "../c.zip/y", "./z", "q/../r"] {
            let spliced = ResolvedPath::resolve_from(&ancestor, rest, &detector);
            let full = ResolvedPath::resolve(Path::new("/tmp/a.zip/d").join(rest), &detector);
            assert_eq!(spliced.path(), full.path(), "{}", rest);
            assert_eq!(spliced.inner_entry_name(), full.inner_entry_name(), "{}", rest);
            assert_eq!(spliced.encl_entry_name(), full.encl_entry_name(), "{}", rest);
            let paths = |p: &ResolvedPath| -> Vec<PathBuf> {
                p.levels().iter().map(|l| l.path().to_path_buf()).collect()
            };
            assert_eq!(paths(&spliced), paths(&full), "{}", rest);
            check_contract(&spliced);
        }
    }

    #[test]
    fn test_indices() {
        assert_eq!(resolve("/a.zip/b.zip").inner_index(), Some(1));
        assert_eq!(resolve("/a.zip/b.zip/c").inner_index(), Some(1));
        assert_eq!(resolve("/a/b").inner_index(), None);
    }
}
