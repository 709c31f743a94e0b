//! Read-through query cache scoped to one unit of work.
//!
//! Results are keyed by the operation name and its arguments. There is no
//! automatic invalidation: every mutating operation of the owning repository
//! calls [`QueryCache::invalidate_all`] explicitly.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub operation: &'static str,
    pub arguments: Vec<String>,
}

impl QueryKey {
    pub fn new<I, S>(operation: &'static str, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operation,
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug)]
pub struct QueryCache<V> {
    enabled: bool,
    entries: Mutex<HashMap<QueryKey, V>>,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached result for `key`, or run `load` and cache what it
    /// returns. Errors are never cached.
    pub fn get_or_load<E>(
        &self,
        key: QueryKey,
        load: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if !self.enabled {
            return load();
        }
        if let Some(hit) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let value = load()?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate_all(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_loads_once_until_invalidated() {
        let cache = QueryCache::<u32>::new(true);
        let loads = Cell::new(0);
        let load = || -> Result<u32, ()> {
            loads.set(loads.get() + 1);
            Ok(7)
        };

        let key = QueryKey::new("find_by_id", ["r", "u1"]);
        assert_eq!(cache.get_or_load(key.clone(), load), Ok(7));
        assert_eq!(cache.get_or_load(key.clone(), load), Ok(7));
        assert_eq!(loads.get(), 1);

        // same operation, different arguments
        cache
            .get_or_load(QueryKey::new("find_by_id", ["r", "u2"]), load)
            .unwrap();
        assert_eq!(loads.get(), 2);

        cache.invalidate_all();
        assert!(cache.is_empty());
        cache.get_or_load(key, load).unwrap();
        assert_eq!(loads.get(), 3);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = QueryCache::<u32>::new(true);
        let key = QueryKey::new("count", ["r"]);
        assert_eq!(cache.get_or_load(key.clone(), || Err("down")), Err("down"));
        assert_eq!(cache.get_or_load(key, || Ok::<_, &str>(3)), Ok(3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache_always_loads() {
        let cache = QueryCache::<u32>::new(false);
        let loads = Cell::new(0);
        for _ in 0..3 {
            cache
                .get_or_load(QueryKey::new("count", ["r"]), || -> Result<u32, ()> {
                    loads.set(loads.get() + 1);
                    Ok(1)
                })
                .unwrap();
        }
        assert_eq!(loads.get(), 3);
        assert!(cache.is_empty());
    }
}
