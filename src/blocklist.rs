use std::fs;
use std::io;
use std::path::Path;

use dashmap::DashSet;
use rustc_hash::FxBuildHasher;
use tracing::debug;

/// Exact-match set of blocked domains, trailing-dot lowercase form.
/// Read-mostly; administrative inserts and removals are safe against
/// concurrent lookups.
pub struct Blocklist {
    set: DashSet<String, FxBuildHasher>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self {
            set: DashSet::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Lowercases and appends the trailing dot when missing, so lookups and
    /// inserts agree on one canonical spelling.
    fn normalize(name: &str) -> String {
        let mut name = name.trim().to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }
        name
    }

    pub fn contains(&self, name: &str) -> bool {
        self.set.contains(&Self::normalize(name))
    }

    pub fn insert(&self, name: &str) {
        self.set.insert(Self::normalize(name));
    }

    #[allow(dead_code)]
    pub fn remove(&self, name: &str) {
        self.set.remove(&Self::normalize(name));
    }

    pub fn bulk_load<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.insert(name.as_ref());
        }
    }

    /// Loads one domain per line; empty lines and `#`/`!` comments skipped.
    /// Returns how many entries were added.
    pub fn load_file(&self, path: &Path) -> io::Result<usize> {
        let content = fs::read_to_string(path)?;
        let before = self.set.len();
        self.bulk_load(content.lines().filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                return None;
            }
            Some(line)
        }));
        let added = self.set.len() - before;
        debug!(path = %path.display(), added, "blocklist file loaded");
        Ok(added)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}
