//! The in-memory directory tree of one mounted archive.
//!
//! A [`VirtualFileSystem`] owns every [`ArchiveEntry`] of an archive in one
//! map keyed by entry name, where directory keys end in `/`. Directories
//! refer to their children by base name only, so the tree has no internal
//! references. Every entry except the root has its parent directory in the
//! map, and the parent lists the entry's base name among its children.
//! Parent directories missing from the underlying archive are synthesized
//! as *ghost* directories with an unknown modification time; they are never
//! written back.
//!
//! Mutations go through a two phase protocol: [`begin_create_and_link`]
//! validates the change against the current tree and returns a [`Delta`]
//! without touching anything, and [`Delta::commit`] applies it. The first
//! mutation of a tree marks it *touched* and invokes the touch hook the
//! caller passes in, which lets the archive controller start its output
//! session before anything changes.
//!
//! [`begin_create_and_link`]: VirtualFileSystem::begin_create_and_link

use std::collections::{HashMap, HashSet};

use crate::driver::{ArchiveEntry, EntryKind};
use crate::entry_name::{self, ROOT};
use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// Called once, before the first mutation of a filesystem is applied.
///
/// If the hook fails the mutation is abandoned and the filesystem stays
/// untouched.
pub type TouchHook<'a> = &'a mut dyn FnMut() -> Result<()>;

#[derive(Debug, Clone)]
struct Node {
    entry: ArchiveEntry,
    children: HashSet<String>,
}

impl Node {
    fn new(entry: ArchiveEntry) -> Self {
        Self {
            entry,
            children: HashSet::new(),
        }
    }
}

/// The entry tree of one archive.
#[derive(Debug, Clone)]
pub struct VirtualFileSystem {
    master: HashMap<String, Node>,
    read_only: bool,
    mod_count: u64,
}

impl VirtualFileSystem {
    /// Creates the tree of a new, empty archive.
    ///
    /// The new tree counts as touched, so `hook` runs immediately.
    pub fn new_empty(hook: TouchHook<'_>) -> Result<Self> {
        let mut fs = Self::with_root(Some(Timestamp::now()), false);
        fs.touch(hook)?;
        Ok(fs)
    }

    /// Builds the tree of an existing archive from its entries.
    ///
    /// Entries with illegal names are skipped. Missing parent directories
    /// are added as ghosts.
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = &'a ArchiveEntry>,
        root_modified: Option<Timestamp>,
        read_only: bool,
    ) -> Self {
        let mut fs = Self::with_root(root_modified, read_only);
        let mut names = Vec::new();
        for entry in entries {
            if let Err(e) = entry_name::validate(entry.name()) {
                log::warn!("skipping entry on mount: {}", e);
                continue;
            }
            names.push(entry.name().to_string());
            fs.master
                .insert(entry.name().to_string(), Node::new(entry.clone()));
        }
        for name in &names {
            fs.fix_parents(name);
        }
        fs
    }

    fn with_root(root_modified: Option<Timestamp>, read_only: bool) -> Self {
        let root = ArchiveEntry::directory(ROOT).with_modified(root_modified);
        let mut master = HashMap::new();
        master.insert(ROOT.to_string(), Node::new(root));
        Self {
            master,
            read_only,
            mod_count: 0,
        }
    }

    /// Links `name` into its parent, creating ghost parents as needed.
    fn fix_parents(&mut self, name: &str) {
        let Some((parent, base)) = entry_name::split(name) else {
            return;
        };
        if let Some(node) = self.master.get_mut(parent) {
            node.children.insert(base.to_string());
            return;
        }
        if self.master.contains_key(entry_name::file_key(parent)) {
            log::warn!(
                "archive has both a file and a directory named {}",
                entry_name::file_key(parent)
            );
        }
        let mut ghost = Node::new(ArchiveEntry::directory(parent));
        ghost.children.insert(base.to_string());
        let parent = parent.to_string();
        self.master.insert(parent.clone(), ghost);
        self.fix_parents(&parent);
    }

    fn touch(&mut self, hook: TouchHook<'_>) -> Result<()> {
        if self.mod_count == 0 {
            hook()?;
        }
        self.mod_count += 1;
        Ok(())
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::illegal(name, "archive is read-only"));
        }
        Ok(())
    }

    /// Returns `true` once the tree has been mutated.
    pub fn is_touched(&self) -> bool {
        self.mod_count > 0
    }

    /// Returns the number of mutations applied so far.
    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    /// Returns `true` if mutations are rejected.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the number of entries, the root included.
    pub fn len(&self) -> usize {
        self.master.len()
    }

    /// Returns `true` if the tree holds nothing but the root.
    pub fn is_empty(&self) -> bool {
        self.master.len() == 1
    }

    /// Returns the root directory.
    pub fn root(&self) -> &ArchiveEntry {
        &self.master[ROOT].entry
    }

    /// Looks up an entry by its exact key.
    pub fn get(&self, key: &str) -> Option<&ArchiveEntry> {
        self.master.get(key).map(|node| &node.entry)
    }

    /// Looks up `name` as a file first, then as a directory. The empty name
    /// and `/` denote the root. A trailing `/` restricts the lookup to
    /// directories.
    pub fn lookup(&self, name: &str) -> Option<&ArchiveEntry> {
        if name.is_empty() || name == ROOT {
            return Some(self.root());
        }
        if !entry_name::is_dir_key(name) {
            if let Some(entry) = self.get(name) {
                return Some(entry);
            }
        }
        self.get(&entry_name::dir_key(name))
    }

    /// Returns `true` if `name` exists as a file or directory.
    pub fn exists(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Returns `true` if `name` is a file.
    pub fn is_file(&self, name: &str) -> bool {
        !entry_name::is_dir_key(name) && self.get(name).is_some_and(ArchiveEntry::is_file)
    }

    /// Returns `true` if `name` is a directory.
    pub fn is_directory(&self, name: &str) -> bool {
        name.is_empty() || self.master.contains_key(&entry_name::dir_key(name))
    }

    /// Returns `true` if `name` exists and the archive is writable.
    pub fn can_write(&self, name: &str) -> bool {
        !self.read_only && self.exists(name)
    }

    /// Returns the size of file `name`, or 0 for directories, missing
    /// entries and files whose size is not known yet.
    pub fn length(&self, name: &str) -> u64 {
        match self.get(entry_name::file_key(name)) {
            Some(entry) if entry.is_file() => entry.size().unwrap_or(0),
            _ => 0,
        }
    }

    /// Returns the modification time of `name`, if it exists and is known.
    pub fn last_modified(&self, name: &str) -> Option<Timestamp> {
        self.lookup(name).and_then(ArchiveEntry::modified)
    }

    /// Lists the base names of the children of directory `name`, or `None`
    /// if it is not a directory. The order is unspecified.
    pub fn list(&self, name: &str) -> Option<Vec<String>> {
        self.master
            .get(&entry_name::dir_key(name))
            .map(|node| node.children.iter().cloned().collect())
    }

    /// Returns all entries, the root included, in unspecified order.
    pub fn entries(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.master.values().map(|node| &node.entry)
    }

    /// Returns all entries in reverse lexicographic name order, so that
    /// every directory comes after its children.
    pub fn entries_children_first(&self) -> Vec<&ArchiveEntry> {
        let mut entries: Vec<_> = self.entries().collect();
        entries.sort_unstable_by(|a, b| b.name().cmp(a.name()));
        entries
    }

    /// Sets the modification time of `name`.
    ///
    /// Returns `Ok(false)` if the archive is read-only or `name` does not
    /// exist.
    pub fn set_last_modified(
        &mut self,
        name: &str,
        modified: Timestamp,
        hook: TouchHook<'_>,
    ) -> Result<bool> {
        if self.read_only {
            return Ok(false);
        }
        let key = match self.lookup(name) {
            Some(entry) => entry.name().to_string(),
            None => return Ok(false),
        };
        self.touch(hook)?;
        if let Some(node) = self.master.get_mut(&key) {
            node.entry.set_modified(Some(modified));
        }
        Ok(true)
    }

    /// Records the final size of file `name` once its content is written.
    pub(crate) fn set_length(&mut self, name: &str, size: u64) {
        if let Some(node) = self.master.get_mut(entry_name::file_key(name)) {
            if node.entry.is_file() {
                node.entry.set_size(Some(size));
            }
        }
    }

    /// Validates the creation of entry `name` of the given kind and returns
    /// the change needed, including missing parent directories if
    /// `create_parents` is set.
    ///
    /// Nothing changes until the returned [`Delta`] is committed. The new
    /// entry takes its modification time from `template` if given.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IllegalOperation`] if the archive is read-only,
    /// a directory of that name exists already, an entry of the other kind
    /// exists under that name, a parent is a file, or a parent is missing
    /// and `create_parents` is false.
    pub fn begin_create_and_link(
        &self,
        name: &str,
        kind: EntryKind,
        create_parents: bool,
        template: Option<&ArchiveEntry>,
    ) -> Result<Delta> {
        let file_name = entry_name::file_key(name);
        entry_name::validate(file_name)?;
        self.check_writable(name)?;

        let dir_name = entry_name::dir_key(file_name);
        match kind {
            EntryKind::Directory if self.master.contains_key(&dir_name) => {
                return Err(Error::illegal(name, "directory exists already"));
            }
            EntryKind::Directory if self.master.contains_key(file_name) => {
                return Err(Error::illegal(name, "cannot replace file with directory"));
            }
            EntryKind::File if self.master.contains_key(&dir_name) => {
                return Err(Error::illegal(name, "cannot replace directory with file"));
            }
            _ => {}
        }

        let now = Timestamp::now();
        let modified = template.and_then(ArchiveEntry::modified).unwrap_or(now);
        let target = ArchiveEntry::new(file_name, kind).with_modified(Some(modified));

        let mut new_entries = vec![target];
        let mut current = file_name.to_string();
        let anchor = loop {
            let Some((parent, _)) = entry_name::split(&current) else {
                return Err(Error::illegal(name, "cannot create the root directory"));
            };
            if self.master.contains_key(parent) {
                break parent.to_string();
            }
            if self.master.contains_key(entry_name::file_key(parent)) {
                return Err(Error::illegal(name, "parent entry is a file"));
            }
            if !create_parents {
                return Err(Error::illegal(name, "missing parent directory"));
            }
            new_entries.push(ArchiveEntry::directory(parent).with_modified(Some(now)));
            current = parent.to_string();
        };
        new_entries.reverse();

        Ok(Delta {
            anchor,
            new_entries,
            base_mod_count: self.mod_count,
        })
    }

    /// Creates directory `name`.
    pub fn mkdir(&mut self, name: &str, create_parents: bool, hook: TouchHook<'_>) -> Result<()> {
        self.begin_create_and_link(name, EntryKind::Directory, create_parents, None)?
            .commit(self, hook)
            .map(drop)
    }

    /// Deletes file or empty directory `name`.
    ///
    /// A directory whose only children are ghost directories still counts as
    /// non-empty.
    pub fn delete(&mut self, name: &str, hook: TouchHook<'_>) -> Result<()> {
        let file_name = entry_name::file_key(name);
        if !entry_name::is_dir_key(name) && self.master.contains_key(file_name) {
            return self.unlink(file_name, hook);
        }
        let dir_name = entry_name::dir_key(file_name);
        if self.master.contains_key(&dir_name) {
            return self.unlink(&dir_name, hook);
        }
        Err(Error::illegal(name, "entry does not exist"))
    }

    /// Removes the entry with key `key` from the tree.
    fn unlink(&mut self, key: &str, hook: TouchHook<'_>) -> Result<()> {
        self.check_writable(key)?;
        let node = self
            .master
            .get(key)
            .ok_or_else(|| Error::illegal(key, "entry does not exist"))?;
        if key == ROOT {
            return Err(Error::illegal(key, "cannot delete the root directory"));
        }
        if node.entry.is_directory() && !node.children.is_empty() {
            return Err(Error::illegal(key, "directory is not empty"));
        }
        let Some((parent, base)) = entry_name::split(key) else {
            return Err(Error::illegal(key, "cannot delete the root directory"));
        };
        self.touch(hook)?;
        self.master.remove(key);
        if let Some(parent) = self.master.get_mut(parent) {
            parent.children.remove(base);
            parent.entry.set_modified(Some(Timestamp::now()));
        }
        Ok(())
    }

    /// Checks the tree invariant, returning a description of the first
    /// violation found.
    pub fn verify(&self) -> std::result::Result<(), String> {
        if !self.master.get(ROOT).is_some_and(|n| n.entry.is_directory()) {
            return Err("root directory is missing".into());
        }
        for (key, node) in &self.master {
            if key != node.entry.name() {
                return Err(format!("{} is stored under key {}", node.entry.name(), key));
            }
            if !node.entry.is_directory() && !node.children.is_empty() {
                return Err(format!("file {} has children", key));
            }
            if key == ROOT {
                continue;
            }
            let Some((parent, base)) = entry_name::split(key) else {
                return Err(format!("{} has no parent", key));
            };
            match self.master.get(parent) {
                None => return Err(format!("parent {} of {} is missing", parent, key)),
                Some(p) if !p.children.contains(base) => {
                    return Err(format!("parent {} does not list {}", parent, base));
                }
                _ => {}
            }
            for child in &node.children {
                let file = format!("{}{}", key, child);
                let dir = format!("{}/", file);
                if !self.master.contains_key(&file) && !self.master.contains_key(&dir) {
                    return Err(format!("{} lists missing child {}", key, child));
                }
            }
        }
        Ok(())
    }
}

/// A validated, not yet applied creation of an entry and its missing parent
/// directories.
///
/// A delta is computed against one state of the tree and must be committed
/// before the tree changes in any other way; the archive controller holds
/// its write lock across both steps.
#[derive(Debug, Clone)]
pub struct Delta {
    /// The existing directory the new entries hang from.
    anchor: String,
    /// New entries, outermost directory first, the target entry last.
    new_entries: Vec<ArchiveEntry>,
    base_mod_count: u64,
}

impl Delta {
    /// Returns the entry this delta creates.
    pub fn entry(&self) -> &ArchiveEntry {
        // never empty: the target is pushed first
        &self.new_entries[self.new_entries.len() - 1]
    }

    /// Returns the number of entries this delta creates, the target
    /// included.
    pub fn len(&self) -> usize {
        self.new_entries.len()
    }

    /// Always `false`: a delta creates at least its target.
    pub fn is_empty(&self) -> bool {
        self.new_entries.is_empty()
    }

    /// Applies the change to `fs` and returns the created entry.
    ///
    /// Parents whose set of children changes get the current time unless
    /// they are ghosts.
    ///
    /// # Errors
    ///
    /// Fails if the touch hook fails or `fs` was mutated since the delta was
    /// computed; `fs` is unchanged in both cases.
    pub fn commit(self, fs: &mut VirtualFileSystem, hook: TouchHook<'_>) -> Result<ArchiveEntry> {
        if fs.mod_count != self.base_mod_count || !fs.master.contains_key(&self.anchor) {
            return Err(Error::illegal(
                self.entry().name(),
                "archive changed while the entry was being created",
            ));
        }
        fs.touch(hook)?;
        let now = Timestamp::now();
        let mut parent = self.anchor;
        let mut created = None;
        for entry in self.new_entries {
            let base = entry.base_name().to_string();
            if let Some(node) = fs.master.get_mut(&parent) {
                if node.children.insert(base) && node.entry.modified().is_some() {
                    node.entry.set_modified(Some(now));
                }
            }
            let key = entry.name().to_string();
            fs.master.insert(key.clone(), Node::new(entry.clone()));
            created = Some(entry);
            parent = key;
        }
        created.ok_or_else(|| Error::illegal(parent, "empty delta"))
    }
}
