use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::model::{Oracle, OracleId, OracleSummary, Page};

/// Append-only name -> oracle registry.
///
/// `create_or_get` takes the name's shard entry lock for the whole
/// check-and-insert, so concurrent registrations of one name always agree on
/// a single id.
#[derive(Debug)]
pub struct OracleRegistry {
    by_name: DashMap<String, Arc<Oracle>>,
    by_id: DashMap<OracleId, Arc<Oracle>>,
    next_id: AtomicU64,
}

impl Default for OracleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OracleRegistry {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Oracle>> {
        self.by_name.get(name).map(|o| Arc::clone(o.value()))
    }

    pub fn get(&self, id: OracleId) -> Result<Arc<Oracle>> {
        self.by_id
            .get(&id)
            .map(|o| Arc::clone(o.value()))
            .ok_or(Error::OracleNotFound(id))
    }

    /// Registers `code` under `name` unless the name is taken, in which case
    /// the stored oracle wins and `code` is ignored.
    pub fn create_or_get(&self, name: &str, code: &str) -> Result<OracleId> {
        self.insert_or_get(name, code).map(|(oracle, _)| oracle.id)
    }

    /// Like `create_or_get`, also reporting whether this call inserted.
    pub fn insert_or_get(&self, name: &str, code: &str) -> Result<(Arc<Oracle>, bool)> {
        if name.trim().is_empty() {
            return Err(Error::Validation("oracle name must not be empty".into()));
        }

        match self.by_name.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok((Arc::clone(existing.get()), false)),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let oracle = Arc::new(Oracle { id, name: name.to_string(), code: code.to_string() });
                // visible by id before it is visible by name
                self.by_id.insert(id, Arc::clone(&oracle));
                slot.insert(Arc::clone(&oracle));

                tracing::info!(id, name, "oracle registered");
                Ok((oracle, true))
            }
        }
    }

    pub fn list(&self, page: u64, per_page: u64) -> Page<OracleSummary> {
        let mut all: Vec<OracleSummary> = self.by_id.iter().map(|o| OracleSummary::from(o.value().as_ref())).collect();
        all.sort_unstable_by_key(|o| o.id);
        Page::slice(&all, page, per_page)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_find_unknown_name() {
        let registry = OracleRegistry::new();
        assert!(registry.find_by_name("nope").is_none());
        assert!(matches!(registry.get(1), Err(Error::OracleNotFound(1))));
    }

    #[test]
    fn test_write_once_per_name() {
        let registry = OracleRegistry::new();
        let id = registry.create_or_get("findSimilar", "(module)").unwrap();
        let again = registry.create_or_get("findSimilar", "(module (memory 1))").unwrap();
        assert_eq!(id, again);

        let stored = registry.find_by_name("findSimilar").unwrap();
        assert_eq!(stored.code, "(module)");
        assert_eq!(registry.get(id).unwrap().name, "findSimilar");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = OracleRegistry::new();
        assert!(matches!(registry.create_or_get("", "(module)"), Err(Error::Validation(_))));
        assert!(matches!(registry.create_or_get("  ", "(module)"), Err(Error::Validation(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_registration_of_same_name() {
        let registry = Arc::new(OracleRegistry::new());
        let n = 32;
        let barrier = Arc::new(Barrier::new(n));

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.insert_or_get("x", &format!(";; variant {}", i)).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ids: HashSet<_> = results.iter().map(|(o, _)| o.id).collect();
        let inserted = results.iter().filter(|(_, created)| *created).count();

        assert_eq!(ids.len(), 1);
        assert_eq!(inserted, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_is_ordered_by_id() {
        let registry = OracleRegistry::new();
        for name in ["c", "a", "b"] {
            registry.create_or_get(name, "(module)").unwrap();
        }
        let page = registry.list(1, 10);
        let names: Vec<_> = page.items.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(page.total, 3);
    }
}
