//! The controller registry.
//!
//! A [`Registry`] maps archive paths to their [`ArchiveController`]s. It holds
//! controllers weakly, so an archive nobody refers to can be dropped, with
//! two exceptions:
//!
//! - Touched controllers are *pinned*: the registry keeps them alive until an
//!   update commits or a reset discards their changes.
//! - A small LRU cache keeps recently released controllers alive, so that
//!   repeated access to the same archive does not remount it every time.
//!
//! Dropping a registry unmounts everything it still knows about.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use lru::LruCache;

use crate::config::{FsConfig, UpdateOptions};
use crate::controller::ArchiveController;
use crate::error::UpdateReport;
use crate::lock::lock_or_recover;
use crate::resolver::ResolvedPath;
use crate::stats::{IoCounters, RegistryStats};
use crate::Result;

struct Inner {
    controllers: HashMap<PathBuf, Weak<ArchiveController>>,
    pinned: HashMap<PathBuf, Arc<ArchiveController>>,
    recent: Option<LruCache<PathBuf, Arc<ArchiveController>>>,
}

impl Inner {
    fn remember(&mut self, controller: &Arc<ArchiveController>) {
        if let Some(recent) = &mut self.recent {
            recent.put(controller.target().to_path_buf(), Arc::clone(controller));
        }
    }
}

/// A table of archive controllers keyed by archive path.
pub struct Registry {
    inner: Mutex<Inner>,
    config: FsConfig,
    counters: Arc<IoCounters>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock_or_recover(&self.inner);
        f.debug_struct("Registry")
            .field("controllers", &inner.controllers.len())
            .field("pinned", &inner.pinned.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates an isolated registry.
    pub fn new(config: FsConfig) -> Arc<Self> {
        let recent = NonZeroUsize::new(config.recent_capacity).map(LruCache::new);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                controllers: HashMap::new(),
                pinned: HashMap::new(),
                recent,
            }),
            config,
            counters: Arc::new(IoCounters::default()),
        })
    }

    /// Returns the process-wide registry, created with the default
    /// configuration on first use.
    ///
    /// The global registry is never dropped, so pending changes are only
    /// written by an explicit update or unmount.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Registry::new(FsConfig::default())))
    }

    /// Returns the configuration this registry was created with.
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub(crate) fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    /// Returns the controller of archive level `index` of `resolved`,
    /// creating it and the controllers of its enclosing archives as needed.
    pub fn controller(
        self: &Arc<Self>,
        resolved: &ResolvedPath,
        index: usize,
    ) -> Option<Arc<ArchiveController>> {
        let level = resolved.levels().get(index)?;
        if let Some(existing) = self.lookup(level.path()) {
            return Some(existing);
        }
        let enclosing = match level.entry_name() {
            Some(entry) if index > 0 => {
                Some((self.controller(resolved, index - 1)?, entry.to_string()))
            }
            _ => None,
        };

        let mut inner = lock_or_recover(&self.inner);
        let key = level.path().to_path_buf();
        if let Some(existing) = inner.controllers.get(&key).and_then(Weak::upgrade) {
            return Some(existing);
        }
        inner.controllers.retain(|_, c| c.strong_count() > 0);
        let controller =
            ArchiveController::new(key.clone(), enclosing, Arc::clone(level.driver()), self);
        log::trace!("new controller for {}", key.display());
        inner.controllers.insert(key, Arc::downgrade(&controller));
        inner.remember(&controller);
        Some(controller)
    }

    /// Returns the live controller for `target`, if any.
    pub fn lookup(&self, target: &Path) -> Option<Arc<ArchiveController>> {
        let mut inner = lock_or_recover(&self.inner);
        let controller = inner.controllers.get(target).and_then(Weak::upgrade)?;
        if let Some(recent) = &mut inner.recent {
            recent.promote(target);
        }
        Some(controller)
    }

    /// Keeps a touched controller alive until it is released.
    pub(crate) fn pin(&self, controller: Arc<ArchiveController>) {
        let mut inner = lock_or_recover(&self.inner);
        inner
            .pinned
            .entry(controller.target().to_path_buf())
            .or_insert(controller);
    }

    /// Releases a pinned controller. Unless `forget` is set, it stays in the
    /// recent cache.
    pub(crate) fn release(&self, target: &Path, forget: bool) {
        let mut inner = lock_or_recover(&self.inner);
        let pinned = inner.pinned.remove(target);
        if forget {
            if let Some(recent) = &mut inner.recent {
                recent.pop(target);
            }
        } else if let Some(controller) = pinned {
            inner.remember(&controller);
        }
    }

    /// Returns all live controllers whose target satisfies `filter`, innermost
    /// archives first.
    fn snapshot(&self, filter: impl Fn(&Path) -> bool) -> Vec<Arc<ArchiveController>> {
        let inner = lock_or_recover(&self.inner);
        let mut controllers: Vec<_> = inner
            .controllers
            .values()
            .filter_map(Weak::upgrade)
            .filter(|c| filter(c.target()))
            .collect();
        drop(inner);
        controllers.sort_by(|a, b| b.target().cmp(a.target()));
        controllers
    }

    /// Updates every controller whose target satisfies `filter`.
    ///
    /// Nested archives are updated before the archives that contain them,
    /// so that reassembled archives are written in the same pass. All
    /// diagnostics are collected; the result is an error as soon as any
    /// archive was busy or failed.
    pub fn update_all(
        &self,
        filter: impl Fn(&Path) -> bool,
        options: &UpdateOptions,
    ) -> Result<UpdateReport> {
        let mut report = UpdateReport::new();
        for controller in self.snapshot(filter) {
            controller.update_into(options, &mut report);
        }
        report.finish()
    }

    /// Discards the changes of every controller whose target satisfies
    /// `filter`.
    pub fn reset_all(&self, filter: impl Fn(&Path) -> bool) {
        for controller in self.snapshot(filter) {
            controller.reset();
        }
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for controller in self.snapshot(|_| true) {
            stats.controllers += 1;
            if controller.is_touched() {
                stats.touched += 1;
            }
            if controller.enclosing().is_none() {
                stats.top_level += 1;
            }
        }
        self.counters.fill(&mut stats);
        stats
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        match self.update_all(|_| true, &UpdateOptions::umount()) {
            Ok(report) => {
                for diagnostic in report.diagnostics() {
                    log::warn!("{}", diagnostic);
                }
            }
            Err(e) => log::warn!("couldn't unmount all archives: {}", e),
        }
    }
}
