//! Property-based tests using proptest.
//!
//! These tests verify invariants of the entry tree and the path resolver
//! using randomly generated inputs.

use proptest::prelude::*;

use archfs::driver::EntryKind;
use archfs::entry_name;
use archfs::{DefaultArchiveDetector, ResolvedPath, Result, VirtualFileSystem};

#[derive(Debug, Clone)]
enum Op {
    Mkdir(String, bool),
    Create(String, bool),
    Delete(String),
}

/// Entry names over a tiny alphabet, so that operations collide often.
fn name_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec("[abc]", 1..4).prop_map(|parts| parts.join("/"))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (name_strategy(), any::<bool>()).prop_map(|(n, p)| Op::Mkdir(n, p)),
        (name_strategy(), any::<bool>()).prop_map(|(n, p)| Op::Create(n, p)),
        name_strategy().prop_map(Op::Delete),
    ]
}

fn no_hook() -> impl FnMut() -> Result<()> {
    || Ok(())
}

fn names(fs: &VirtualFileSystem) -> Vec<String> {
    let mut names: Vec<_> = fs.entries().map(|e| e.name().to_string()).collect();
    names.sort();
    names
}

fn apply(fs: &mut VirtualFileSystem, op: &Op) -> Result<()> {
    let mut hook = no_hook();
    match op {
        Op::Mkdir(name, parents) => fs.mkdir(name, *parents, &mut hook),
        Op::Create(name, parents) => fs
            .begin_create_and_link(name, EntryKind::File, *parents, None)?
            .commit(fs, &mut hook)
            .map(drop),
        Op::Delete(name) => fs.delete(name, &mut hook),
    }
}

/// Path segments where some look like archives.
fn path_strategy() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec(
        prop_oneof![
            "[a-z]{1,3}",
            "[a-z]{1,3}\\.zip",
            "[a-z]{1,3}\\.tar",
            Just("..".to_string()),
        ],
        0..6,
    )
}

proptest! {
    /// Every sequence of operations keeps the tree consistent, and a
    /// rejected operation leaves it unchanged.
    #[test]
    fn tree_stays_consistent(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let mut fs = VirtualFileSystem::new_empty(&mut no_hook()).unwrap();
        for op in &ops {
            let before = names(&fs);
            let count = fs.mod_count();
            match apply(&mut fs, op) {
                Ok(()) => {
                    prop_assert!(fs.mod_count() > count);
                    match op {
                        Op::Mkdir(name, _) => prop_assert!(fs.is_directory(name)),
                        Op::Create(name, _) => prop_assert!(fs.is_file(name)),
                        Op::Delete(name) => prop_assert!(!fs.exists(name)),
                    }
                }
                Err(_) => {
                    prop_assert_eq!(names(&fs), before);
                    prop_assert_eq!(fs.mod_count(), count);
                }
            }
            if let Err(violation) = fs.verify() {
                prop_assert!(false, "after {:?}: {}", op, violation);
            }
        }
    }

    /// Creating with parents always succeeds unless a file is in the way.
    #[test]
    fn create_with_parents(name in name_strategy()) {
        let mut fs = VirtualFileSystem::new_empty(&mut no_hook()).unwrap();
        apply(&mut fs, &Op::Create(name.clone(), true)).unwrap();
        let mut parent = entry_name::split(&name).map(|(p, _)| p.to_string());
        while let Some(p) = parent.filter(|p| p != entry_name::ROOT) {
            prop_assert!(fs.is_directory(&p));
            prop_assert!(fs.get(&p).unwrap().modified().is_some());
            parent = entry_name::split(&p).map(|(p, _)| p.to_string());
        }
    }

    /// Splitting a joined name gives back the parent directory and the child.
    #[test]
    fn join_then_split(parent in name_strategy(), child in "[a-z]{1,5}") {
        let joined = entry_name::join(&parent, &child);
        prop_assert!(entry_name::validate(&joined).is_ok());
        let dir = entry_name::dir_key(&parent);
        prop_assert_eq!(entry_name::split(&joined), Some((dir.as_str(), child.as_str())));
    }

    /// Resolving relative to an ancestor gives the same chain as resolving
    /// the joined path from scratch.
    #[test]
    fn resolve_from_matches_resolve(
        head in path_strategy(),
        tail in path_strategy(),
    ) {
        let detector = DefaultArchiveDetector::new();
        let head = format!("/{}", head.join("/"));
        let tail = tail.join("/");
        let ancestor = ResolvedPath::resolve(&head, &detector);
        let direct = ResolvedPath::resolve(format!("{}/{}", head, tail), &detector);
        let derived = ResolvedPath::resolve_from(&ancestor, &tail, &detector);

        prop_assert_eq!(derived.path(), direct.path());
        prop_assert_eq!(derived.inner_entry_name(), direct.inner_entry_name());
        let levels = |r: &ResolvedPath| {
            r.levels().iter().map(|l| l.path().to_path_buf()).collect::<Vec<_>>()
        };
        prop_assert_eq!(levels(&derived), levels(&direct));
    }
}
