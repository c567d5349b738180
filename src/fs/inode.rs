//! Inode ⇄ path table for the passthrough filesystem (spec §4.7).
//!
//! `fuser`'s low-level API identifies files by `u64` inode number, while the
//! underlying passthrough target is addressed by path. This table is the
//! only place that bridges the two: every other part of [`super::passthrough`]
//! resolves a `u64` to a path via [`InodeTable::path`] before touching the
//! filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The fixed inode number of the mount root, matching `fuser`'s convention
/// (the kernel always addresses the mount root as inode 1).
pub(crate) const ROOT_INO: u64 = 1;

struct Entry {
    path: PathBuf,
    /// Kernel lookup-count for this inode (incremented on `lookup`,
    /// decremented by `forget`); the entry is dropped once it reaches zero
    /// and no new lookup has re-added it in between forget and removal.
    nlookup: u64,
}

/// Bidirectional table from inode number to relative path (relative to the
/// passthrough source root) and back.
pub(crate) struct InodeTable {
    by_ino: HashMap<u64, Entry>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            Entry {
                path: PathBuf::new(),
                nlookup: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(PathBuf::new(), ROOT_INO);

        Self {
            by_ino,
            by_path,
            next_ino: ROOT_INO + 1,
        }
    }

    /// Path relative to the source root for `ino`, if known.
    pub(crate) fn path(&self, ino: u64) -> Option<&Path> {
        self.by_ino.get(&ino).map(|e| e.path.as_path())
    }

    /// Look up (or allocate) the inode number for `path`, incrementing its
    /// lookup count. Used on every successful `lookup`/`create`/`mkdir`/etc.
    /// that hands a new entry back to the kernel.
    pub(crate) fn lookup(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            self.by_ino.get_mut(&ino).expect("by_path/by_ino out of sync").nlookup += 1;
            return ino;
        }

        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(
            ino,
            Entry {
                path: path.to_path_buf(),
                nlookup: 1,
            },
        );
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Decrement `ino`'s lookup count by `n`, removing the entry once it
    /// reaches zero (spec: standard FUSE `forget` semantics).
    pub(crate) fn forget(&mut self, ino: u64, n: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(entry) = self.by_ino.get_mut(&ino) else {
            return;
        };
        entry.nlookup = entry.nlookup.saturating_sub(n);
        if entry.nlookup == 0 {
            if let Some(entry) = self.by_ino.remove(&ino) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Update the table after a rename: both the old and new path resolve to
    /// the same inode going forward.
    pub(crate) fn rename(&mut self, old: &Path, new: &Path) {
        if let Some(ino) = self.by_path.remove(old) {
            self.by_path.insert(new.to_path_buf(), ino);
            if let Some(entry) = self.by_ino.get_mut(&ino) {
                entry.path = new.to_path_buf();
            }
        }
    }
}
