//! Directory entry store.
//!
//! Every directory inode owns one `DirEntries` list. All methods assume
//! the caller holds the owning directory's lock; lookups are linear.

use crate::inode::FileKind;

/// One name binding inside a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    ino: u64,
    kind: FileKind,
    name: String,
}

impl DirEntry {
    /// Local inode number the name points at
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Object type recorded at insertion
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Entry name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, name: &str) -> bool {
        self.name.len() == name.len() && self.name == name
    }
}

/// Unordered name -> inode bindings of one directory
#[derive(Debug, Clone, Default)]
pub struct DirEntries {
    entries: Vec<DirEntry>,
}

impl DirEntries {
    /// Empty entry list
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the inode bound to `name`
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.entry(name).map(DirEntry::ino)
    }

    /// Find the whole entry bound to `name`
    pub fn entry(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.matches(name))
    }

    /// First entry pointing at `ino`
    pub fn find_by_ino(&self, ino: u64) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.ino == ino)
    }

    /// Bind `name` to `ino`. The caller guarantees `name` is not present.
    pub fn add(&mut self, ino: u64, kind: FileKind, name: &str) {
        debug_assert!(self.lookup(name).is_none(), "duplicate entry {name:?}");
        self.entries.push(DirEntry {
            ino,
            kind,
            name: name.to_owned(),
        });
    }

    /// Unlink `name`, keeping the order of the remaining entries.
    /// Does nothing when the name is absent.
    pub fn remove(&mut self, name: &str) -> Option<DirEntry> {
        let pos = self.entries.iter().position(|e| e.matches(name))?;
        Some(self.entries.remove(pos))
    }

    /// Rename the first entry pointing at `ino`.
    ///
    /// The existing name buffer is reused unless the new name is longer.
    pub fn rename_entry(&mut self, ino: u64, new_name: &str) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.ino == ino) else {
            return;
        };
        if new_name.len() > entry.name.len() {
            entry.name = new_name.to_owned();
        } else {
            entry.name.clear();
            entry.name.push_str(new_name);
        }
    }

    /// Duplicate every entry of `src` into `self`
    pub fn copy_all(&mut self, src: &DirEntries) {
        self.entries.reserve(src.entries.len());
        self.entries.extend(src.entries.iter().cloned());
    }

    /// Entries starting at list position `cursor`
    pub fn iter_from(&self, cursor: usize) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().skip(cursor)
    }

    /// All entries
    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter()
    }

    /// Number of names bound to `ino` in this directory
    pub fn count_links(&self, ino: u64) -> usize {
        self.entries.iter().filter(|e| e.ino == ino).count()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the directory has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DirEntries {
        let mut dir = DirEntries::new();
        dir.add(10, FileKind::RegularFile, "alpha");
        dir.add(11, FileKind::Directory, "beta");
        dir.add(12, FileKind::Symlink, "gamma");
        dir
    }

    #[test]
    fn test_add_then_lookup() {
        let mut dir = sample();
        assert_eq!(dir.lookup("beta"), Some(11));
        dir.add(13, FileKind::RegularFile, "delta");
        assert_eq!(dir.lookup("delta"), Some(13));
        assert_eq!(dir.entry("delta").unwrap().kind(), FileKind::RegularFile);
        assert_eq!(dir.lookup("delt"), None);
        assert_eq!(dir.lookup("deltas"), None);
    }

    #[test]
    fn test_remove_then_lookup() {
        let mut dir = sample();
        let removed = dir.remove("beta").unwrap();
        assert_eq!(removed.ino(), 11);
        assert_eq!(dir.lookup("beta"), None);

        let names: Vec<_> = dir.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut dir = sample();
        assert!(dir.remove("nope").is_none());
        assert_eq!(dir.len(), 3);
    }

    #[test]
    fn test_rename_shrink_reuses_buffer() {
        let mut dir = sample();
        let before = dir.entry("alpha").unwrap().name.as_ptr();
        dir.rename_entry(10, "alp");
        let entry = dir.entry("alp").unwrap();
        assert_eq!(entry.name.as_ptr(), before);
        assert_eq!(dir.lookup("alpha"), None);

        let before = dir.entry("gamma").unwrap().name.as_ptr();
        dir.rename_entry(12, "omega");
        assert_eq!(dir.entry("omega").unwrap().name.as_ptr(), before);
    }

    #[test]
    fn test_rename_grow_keeps_name() {
        let mut dir = sample();
        dir.rename_entry(11, "a-much-longer-name");
        assert_eq!(dir.lookup("a-much-longer-name"), Some(11));
        assert_eq!(dir.lookup("beta"), None);
        assert_eq!(dir.len(), 3);
    }

    #[test]
    fn test_copy_all() {
        let src = sample();
        let mut dst = DirEntries::new();
        dst.copy_all(&src);
        for entry in src.iter() {
            assert_eq!(dst.lookup(entry.name()), Some(entry.ino()));
        }
        assert_eq!(dst.len(), src.len());
    }

    #[test]
    fn test_iter_from_cursor() {
        let dir = sample();
        let names: Vec<_> = dir.iter_from(1).map(|e| e.name()).collect();
        assert_eq!(names, vec!["beta", "gamma"]);
        assert_eq!(dir.iter_from(5).count(), 0);
    }
}
