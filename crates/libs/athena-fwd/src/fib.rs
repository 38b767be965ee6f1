use std::collections::HashMap;

use ccnx_codec::Name;

use crate::linkset::{LinkId, LinkVector};

/// Forwarding Information Base: name prefix to egress link set. Routes are
/// populated externally (control interests or daemon config); an entry whose
/// vector empties is dropped so every stored prefix always has at least one
/// link.
#[derive(Default)]
pub struct Fib {
    entries: HashMap<Name, LinkVector>,
}

impl Fib {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn add_route(&mut self, prefix: Name, links: &LinkVector) {
        if links.is_empty() {
            return;
        }
        let entry = self.entries.entry(prefix).or_default();
        entry.union(links);
    }

    /// Differences `links` out of the entry; removes the entry when it
    /// empties. Returns whether the prefix was present.
    pub fn delete_route(&mut self, prefix: &Name, links: &LinkVector) -> bool {
        match self.entries.get_mut(prefix) {
            Some(entry) => {
                entry.difference(links);
                if entry.is_empty() {
                    self.entries.remove(prefix);
                }
                true
            }
            None => false,
        }
    }

    /// Clears the given links from every entry. Called from the adapter's
    /// link-teardown path.
    pub fn remove_link(&mut self, links: &LinkVector) {
        self.entries.retain(|_, entry| {
            entry.difference(links);
            !entry.is_empty()
        });
    }

    /// Longest-prefix match: probes the name's prefixes longest first, so
    /// cost is bounded by the name's segment count rather than table size.
    pub fn lookup(&self, name: &Name) -> LinkVector {
        for length in (0..=name.segment_count()).rev() {
            if let Some(entry) = self.entries.get(&name.prefix(length)) {
                return entry.clone();
            }
        }
        LinkVector::new()
    }

    /// One record per (prefix, set bit); ordering unspecified.
    pub fn list_entries(&self) -> Vec<(Name, LinkId)> {
        let mut out = Vec::new();
        for (prefix, links) in &self.entries {
            for id in links.iter() {
                out.push((prefix.clone(), id));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(uri: &str) -> Name {
        Name::from_uri(uri).expect("uri")
    }

    #[test]
    fn lookup_prefers_longest_prefix() {
        let mut fib = Fib::new();
        fib.add_route(name("ccnx:/foo"), &LinkVector::single(1));
        fib.add_route(name("ccnx:/foo/bar"), &LinkVector::single(2));

        assert_eq!(fib.lookup(&name("ccnx:/foo/bar/x")), LinkVector::single(2));
        assert_eq!(fib.lookup(&name("ccnx:/foo/x")), LinkVector::single(1));
        assert!(fib.lookup(&name("ccnx:/other")).is_empty());
    }

    #[test]
    fn root_route_matches_everything() {
        let mut fib = Fib::new();
        fib.add_route(name("ccnx:/"), &LinkVector::single(4));
        assert_eq!(fib.lookup(&name("ccnx:/any/thing")), LinkVector::single(4));
    }

    #[test]
    fn add_route_unions_and_is_idempotent() {
        let mut fib = Fib::new();
        fib.add_route(name("ccnx:/a"), &LinkVector::single(1));
        fib.add_route(name("ccnx:/a"), &LinkVector::single(2));
        fib.add_route(name("ccnx:/a"), &LinkVector::single(2));
        let expected: LinkVector = [1, 2].into_iter().collect();
        assert_eq!(fib.lookup(&name("ccnx:/a")), expected);
        assert_eq!(fib.len(), 1);
    }

    #[test]
    fn delete_route_removes_empty_entries() {
        let mut fib = Fib::new();
        fib.add_route(name("ccnx:/a"), &[1, 2].into_iter().collect());

        assert!(fib.delete_route(&name("ccnx:/a"), &LinkVector::single(1)));
        assert_eq!(fib.lookup(&name("ccnx:/a")), LinkVector::single(2));

        assert!(fib.delete_route(&name("ccnx:/a"), &LinkVector::single(2)));
        assert!(fib.is_empty());
        assert!(!fib.delete_route(&name("ccnx:/a"), &LinkVector::single(2)));
    }

    #[test]
    fn remove_link_cascades_across_entries() {
        let mut fib = Fib::new();
        fib.add_route(name("ccnx:/a"), &[1, 2].into_iter().collect());
        fib.add_route(name("ccnx:/b"), &LinkVector::single(1));

        fib.remove_link(&LinkVector::single(1));
        assert_eq!(fib.lookup(&name("ccnx:/a")), LinkVector::single(2));
        assert!(fib.lookup(&name("ccnx:/b")).is_empty());
        assert_eq!(fib.len(), 1);

        fib.remove_link(&LinkVector::single(2));
        assert!(fib.is_empty());
    }

    #[test]
    fn list_entries_expands_bits() {
        let mut fib = Fib::new();
        fib.add_route(name("ccnx:/a"), &[1, 3].into_iter().collect());
        let mut entries = fib.list_entries();
        entries.sort_by_key(|(_, id)| *id);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, 1);
        assert_eq!(entries[1].1, 3);
    }
}
