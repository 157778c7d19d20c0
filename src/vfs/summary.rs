use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Aggregate counters over a set of entries.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Aggregate {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub objects: u64,
    pub chunks: u64,
    pub size: u64,
    pub errors: u64,
    /// Sum of per-file Shannon entropy, in bits per byte; divide by
    /// `objects` for the average.
    pub entropy_sum: f64,
    /// Top-level MIME class (`text`, `image`, ...) to file count.
    pub mime: BTreeMap<String, u64>,
}

impl Aggregate {
    pub fn merge(&mut self, other: &Aggregate) {
        self.directories += other.directories;
        self.files += other.files;
        self.symlinks += other.symlinks;
        self.objects += other.objects;
        self.chunks += other.chunks;
        self.size += other.size;
        self.errors += other.errors;
        self.entropy_sum += other.entropy_sum;
        for (class, count) in &other.mime {
            *self.mime.entry(class.clone()).or_insert(0) += count;
        }
    }

    pub fn record_mime(&mut self, content_type: &str) {
        let class = content_type.split('/').next().unwrap_or("application");
        *self.mime.entry(class.to_string()).or_insert(0) += 1;
    }

    pub fn average_entropy(&self) -> f64 {
        if self.objects == 0 {
            0.0
        } else {
            self.entropy_sum / self.objects as f64
        }
    }
}

/// Per-directory summary: `directory` covers the direct children,
/// `below` everything deeper. The total is the sum of both.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Summary {
    pub directory: Aggregate,
    pub below: Aggregate,
}

impl Summary {
    /// Fold a child directory's summary into this one's `below`.
    pub fn merge_below(&mut self, child: &Summary) {
        self.below.merge(&child.directory);
        self.below.merge(&child.below);
    }

    pub fn total_size(&self) -> u64 {
        self.directory.size + self.below.size
    }

    pub fn total_errors(&self) -> u64 {
        self.directory.errors + self.below.errors
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_merge_below_accumulates() {
        let mut parent = Summary::default();
        parent.directory.files = 2;
        parent.directory.size = 100;

        let mut child = Summary::default();
        child.directory.files = 3;
        child.directory.size = 50;
        child.below.files = 1;
        child.below.size = 10;

        parent.merge_below(&child);
        assert_eq!(parent.below.files, 4);
        assert_eq!(parent.below.size, 60);
        assert_eq!(parent.total_size(), 160);
    }

    #[test]
    fn test_mime_classes() {
        let mut aggregate = Aggregate::default();
        aggregate.record_mime("text/plain");
        aggregate.record_mime("text/html");
        aggregate.record_mime("image/png");
        assert_eq!(aggregate.mime.get("text"), Some(&2));
        assert_eq!(aggregate.mime.get("image"), Some(&1));
    }
}
