//! Bookkeeping of what an archive already contains.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// Device and inode number of a file on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug, Default)]
pub struct Catalog {
    // first archive name each regular file was stored under
    stored: HashMap<FileIdentity, String>,
    names: HashSet<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive name of the entry that already holds the content of
    /// `identity`, if any.
    pub fn link_target(&self, identity: FileIdentity) -> Option<&str> {
        self.stored.get(&identity).map(String::as_str)
    }

    /// Fail if a non-directory entry was already stored under `name`.
    pub fn check_name(&self, name: &str) -> Result<()> {
        if self.names.contains(name) {
            return Err(Error::DuplicateEntry(name.to_string()));
        }
        Ok(())
    }

    /// Record a committed non-directory entry.
    pub fn record_name(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }

    /// Record the content-bearing entry for `identity`.  Later entries with
    /// the same identity become hard links to `name`.
    pub fn record_identity(&mut self, identity: FileIdentity, name: &str) {
        self.stored
            .entry(identity)
            .or_insert_with(|| name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_identity_keeps_first_name() {
        let mut catalog = Catalog::new();
        let id = FileIdentity { dev: 1, ino: 42 };
        assert_eq!(catalog.link_target(id), None);

        catalog.record_identity(id, "a");
        catalog.record_identity(id, "b");
        assert_eq!(catalog.link_target(id), Some("a"));
        assert_eq!(catalog.link_target(FileIdentity { dev: 2, ino: 42 }), None);
    }

    #[test]
    fn test_duplicate_names() {
        let mut catalog = Catalog::new();
        catalog.check_name("x").unwrap();
        catalog.record_name("x");
        let err = catalog.check_name("x").unwrap_err();
        assert!(matches!(err, Error::DuplicateEntry(ref name) if name == "x"));
        catalog.check_name("y").unwrap();
    }
}
