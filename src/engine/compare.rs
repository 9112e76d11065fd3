//! Pairwise comparison.
//!
//! File `i` is compared with every later file `j` in canonical order. Pairs
//! whose capture times are further apart than the window are never
//! compared, and pairs that already have a stored distance are reused.
//! Distances are written into both files' neighbor lists; each list sits
//! behind its own lock and at most one lock is held at a time.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;

use crate::cache::{DirectoryCache, Neighbors};
use crate::core::similarity::{Algorithm, Descriptor};
use crate::tasks::TaskTrace;

/// Whether two capture times are close enough to compare. Unknown times
/// never prune.
pub fn within_window(a: Option<i64>, b: Option<i64>, window_secs: i64) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.abs_diff(b) <= window_secs.unsigned_abs(),
        _ => true,
    }
}

fn pair_known(cache: &DirectoryCache, a: &str, b: &str) -> bool {
    let has = |x: &str, y: &str| {
        cache
            .get(x)
            .and_then(|r| r.neighbors.as_ref())
            .is_some_and(|n| n.contains(y))
    };
    has(a, b) && has(b, a)
}

/// Files that take part in at least one pair that still has to be compared,
/// and so need a descriptor.
pub fn files_needing_descriptors(
    cache: &DirectoryCache,
    files: &[String],
    window_secs: i64,
) -> BTreeSet<String> {
    let time = |name: &str| cache.get(name).and_then(|r| r.capture_time);
    let mut needed = BTreeSet::new();
    for (i, a) in files.iter().enumerate() {
        for b in &files[i + 1..] {
            if within_window(time(a), time(b), window_secs) && !pair_known(cache, a, b) {
                needed.insert(a.clone());
                needed.insert(b.clone());
            }
        }
    }
    needed
}

struct Candidate<'a> {
    name: &'a str,
    capture_time: Option<i64>,
    descriptor: Option<&'a Descriptor>,
}

/// Shared state of one comparison batch.
pub struct Comparison<'a> {
    algorithm: Algorithm,
    window_secs: i64,
    candidates: Vec<Candidate<'a>>,
    neighbors: Vec<Mutex<Neighbors>>,
}

impl<'a> Comparison<'a> {
    /// Snapshot `files` (in canonical order) out of `cache`. Existing
    /// distances are carried over.
    pub fn new(
        cache: &'a DirectoryCache,
        files: &'a [String],
        algorithm: Algorithm,
        window_secs: i64,
    ) -> Self {
        let mut candidates = Vec::with_capacity(files.len());
        let mut neighbors = Vec::with_capacity(files.len());
        for name in files {
            let record = cache.get(name);
            candidates.push(Candidate {
                name,
                capture_time: record.and_then(|r| r.capture_time),
                descriptor: record.and_then(|r| r.descriptor.as_ref()),
            });
            let known = record.and_then(|r| r.neighbors.clone()).unwrap_or_default();
            neighbors.push(Mutex::new(known));
        }
        Self {
            algorithm,
            window_secs,
            candidates,
            neighbors,
        }
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Neighbors> {
        self.neighbors[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn knows(&self, i: usize, j: usize) -> bool {
        let forward = self.lock(i).contains(self.candidates[j].name);
        forward && self.lock(j).contains(self.candidates[i].name)
    }

    fn should_compare(&self, i: usize, j: usize) -> bool {
        within_window(
            self.candidates[i].capture_time,
            self.candidates[j].capture_time,
            self.window_secs,
        ) && !self.knows(i, j)
    }

    /// Indices of files with at least one outstanding pair. Only these get a
    /// task.
    pub fn pending(&self) -> Vec<usize> {
        let n = self.candidates.len();
        (0..n)
            .filter(|&i| (i + 1..n).any(|j| self.should_compare(i, j)))
            .collect()
    }

    /// Compare file `i` with every later file. Returns the number of new
    /// distances.
    pub fn compare_from(&self, i: usize, trace: &TaskTrace) -> anyhow::Result<usize> {
        let a = &self.candidates[i];
        let mut compared = 0;
        for j in i + 1..self.candidates.len() {
            if !self.should_compare(i, j) {
                continue;
            }
            let b = &self.candidates[j];
            let (Some(da), Some(db)) = (a.descriptor, b.descriptor) else {
                return Err(anyhow!("no descriptor to compare {} with {}", a.name, b.name));
            };
            let distance = self.algorithm.compare(da, db)?;
            self.lock(i).insert(b.name, distance);
            self.lock(j).insert(a.name, distance);
            compared += 1;
        }
        trace.debug(format!("{compared} new distance(s)"));
        Ok(compared)
    }

    /// Neighbor lists in canonical file order.
    pub fn into_neighbors(self) -> Vec<Neighbors> {
        self.neighbors
            .into_iter()
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner))
            .collect()
    }
}
