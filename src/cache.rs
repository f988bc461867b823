use crate::error::{EngineError, Result};
use crate::grid::Grid;
use crate::structs::MonthKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

type Slot = Arc<OnceLock<std::result::Result<Arc<Grid>, String>>>;

/// Grids memoised per month for the lifetime of the cache.
///
/// Each key owns a `OnceLock`. The first caller runs the loader; callers
/// arriving while it runs block on the same lock instead of loading again.
/// Failures are remembered too, so a missing file is only tried once.
#[derive(Debug, Default)]
pub struct GridCache {
    slots: Mutex<HashMap<MonthKey, Slot>>,
    loads: AtomicUsize,
}

impl GridCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load<F>(&self, key: MonthKey, loader: F) -> Result<Arc<Grid>>
    where
        F: FnOnce() -> Result<Grid>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key).or_default())
        };
        let outcome = slot.get_or_init(|| {
            self.loads.fetch_add(1, Ordering::Relaxed);
            loader().map(Arc::new).map_err(|e| match e {
                EngineError::Data(reason) => reason,
                other => other.to_string(),
            })
        });
        outcome.clone().map_err(EngineError::Data)
    }

    /// Cached grid for `key`, if a load for it has succeeded.
    pub fn get(&self, key: MonthKey) -> Option<Arc<Grid>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&key)?.get()?.as_ref().ok().cloned()
    }

    /// Number of loader invocations so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::Observation;
    use rayon::prelude::*;
    use std::thread;
    use std::time::Duration;

    fn key(month: u32) -> MonthKey {
        MonthKey::new(2020, month).unwrap()
    }

    #[test]
    fn test_loads_once_per_key() {
        let cache = GridCache::new();
        let grid = |v| Ok(Grid::from_observations(&[Observation::new(0.0, 0.0, v)]));
        let first = cache.get_or_load(key(1), || grid(280.0)).unwrap();
        let second = cache.get_or_load(key(1), || grid(999.0)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get(0, 0), Some(280.0));
        cache.get_or_load(key(2), || grid(281.0)).unwrap();
        assert_eq!(cache.load_count(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_callers_share_one_load() {
        let cache = GridCache::new();
        let results: Vec<_> = (0..16)
            .into_par_iter()
            .map(|_| {
                cache.get_or_load(key(3), || {
                    thread::sleep(Duration::from_millis(20));
                    Ok(Grid::empty())
                })
            })
            .collect();
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(cache.load_count(), 1);
    }

    #[test]
    fn test_failures_are_remembered() {
        let cache = GridCache::new();
        let err = cache
            .get_or_load(key(4), || Err(EngineError::Data("No file listed for 2020-04".into())))
            .unwrap_err();
        assert_eq!(err.to_string(), "Data Error: No file listed for 2020-04");
        assert!(cache.get_or_load(key(4), || Ok(Grid::empty())).is_err());
        assert_eq!(cache.load_count(), 1);
        assert!(cache.get(key(4)).is_none());
    }

    #[test]
    fn test_other_errors_keep_their_message() {
        let cache = GridCache::new();
        let err = cache
            .get_or_load(key(5), || Err(EngineError::InvalidInput("bad header".into())))
            .unwrap_err();
        assert_eq!(err.to_string(), "Data Error: Invalid Input: bad header");
    }
}
