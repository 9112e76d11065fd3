use std::collections::{BTreeSet, HashSet};

use crate::cache::DirectoryCache;

/// Sort every neighbor list closest-first and drop the in-memory
/// descriptors.
pub fn finalize(cache: &mut DirectoryCache) {
    for (_, record) in cache.iter_mut() {
        if let Some(neighbors) = record.neighbors.as_mut() {
            neighbors.sort_ascending();
        }
        record.descriptor = None;
    }
}

/// Every file reachable from `file` over edges shorter than `threshold`,
/// excluding `file` itself. Unknown files have no cluster.
pub fn get_similar(cache: &DirectoryCache, file: &str, threshold: f64) -> BTreeSet<String> {
    let mut visited: HashSet<&str> = HashSet::from([file]);
    let mut stack = vec![file];

    while let Some(current) = stack.pop() {
        let Some(neighbors) = cache.get(current).and_then(|r| r.neighbors.as_ref()) else {
            continue;
        };
        for next in neighbors.within(threshold) {
            if visited.insert(next) {
                stack.push(next);
            }
        }
    }

    visited.remove(file);
    visited.into_iter().map(str::to_string).collect()
}

/// One representative per cluster: walking `files` in order, a file is kept
/// unless the cluster of an earlier representative already holds it.
pub fn groups(cache: &DirectoryCache, files: &[String], threshold: f64) -> Vec<String> {
    let mut covered: HashSet<String> = HashSet::new();
    let mut representatives = Vec::new();
    for file in files {
        if covered.contains(file) {
            continue;
        }
        covered.extend(get_similar(cache, file, threshold));
        covered.insert(file.clone());
        representatives.push(file.clone());
    }
    representatives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Neighbors;
    use crate::core::scanner::FileStat;
    use crate::core::similarity::Descriptor;

    fn graph(names: &[&str], edges: &[(&str, &str, f64)]) -> DirectoryCache {
        let mut cache = DirectoryCache::new();
        let stats: Vec<FileStat> = names
            .iter()
            .map(|n| FileStat {
                name: n.to_string(),
                modified_time: 1,
                byte_size: 1,
            })
            .collect();
        cache.reconcile(&stats);
        for (_, record) in cache.iter_mut() {
            record.neighbors = Some(Neighbors::new());
            record.descriptor = Some(Descriptor::Hash(vec![0]));
        }
        for (a, b, d) in edges {
            for (x, y) in [(a, b), (b, a)] {
                cache
                    .get_mut(x)
                    .unwrap()
                    .neighbors
                    .as_mut()
                    .unwrap()
                    .insert(y, *d);
            }
        }
        finalize(&mut cache);
        cache
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_finalize_sorts_and_drops_descriptors() {
        let cache = graph(&["a", "b", "c"], &[("a", "b", 5.0), ("a", "c", 1.0)]);
        let record = cache.get("a").unwrap();
        let order: Vec<_> = record.neighbors.as_ref().unwrap().iter().map(|(f, _)| f).collect();
        assert_eq!(order, vec!["c", "b"]);
        assert!(cache.iter().all(|(_, r)| r.descriptor.is_none()));
    }

    #[test]
    fn test_chain_is_one_cluster() {
        // a - b - c - a cycle plus an isolated d.
        let cache = graph(
            &["a", "b", "c", "d"],
            &[("a", "b", 1.0), ("b", "c", 1.0), ("c", "a", 1.0)],
        );
        assert_eq!(get_similar(&cache, "a", 2.0), set(&["b", "c"]));
        assert!(get_similar(&cache, "d", 2.0).is_empty());
        assert!(get_similar(&cache, "missing", 2.0).is_empty());
        assert!(get_similar(&DirectoryCache::new(), "a", 2.0).is_empty());
    }

    #[test]
    fn test_threshold_is_strict() {
        let cache = graph(&["a", "b"], &[("a", "b", 3.0)]);
        assert!(get_similar(&cache, "a", 3.0).is_empty());
        assert_eq!(get_similar(&cache, "a", 3.5), set(&["b"]));
    }

    #[test]
    fn test_loosening_never_shrinks() {
        let cache = graph(
            &["a", "b", "c", "d"],
            &[("a", "b", 1.0), ("b", "c", 4.0), ("c", "d", 7.0), ("a", "d", 9.0)],
        );
        let mut previous = BTreeSet::new();
        for t in 0..12 {
            let cluster = get_similar(&cache, "a", t as f64);
            assert!(previous.is_subset(&cluster));
            previous = cluster;
        }
        assert_eq!(previous, set(&["b", "c", "d"]));
    }

    #[test]
    fn test_groups_pick_first_of_each_cluster() {
        let cache = graph(
            &["a", "b", "c", "d", "e"],
            &[("a", "c", 1.0), ("b", "d", 1.0), ("d", "e", 1.0)],
        );
        let files: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(groups(&cache, &files, 2.0), vec!["a", "b"]);
        assert_eq!(groups(&cache, &files, 0.5), files);
    }
}
