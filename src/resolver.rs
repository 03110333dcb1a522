//! Idempotent get-or-create protocol, applied uniformly to every
//! entity type.
//!
//! For a fixed cache key, at most one creation request is attempted per
//! resolver run, and the conflict-recovery path caps total network
//! requests per key at three: the cache-miss search, the create
//! attempt, and the single race-recovery search.

use crate::api::{ApiError, Backend};
use crate::cache::{CacheContext, EntityKind};
use serde_json::Value;

/// Outcome of a resolution attempt. `NotFound` is distinct from an
/// error: the caller decides whether a missing entity is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found(i64),
    NotFound,
}

impl Resolution {
    pub fn id(self) -> Option<i64> {
        match self {
            Resolution::Found(id) => Some(id),
            Resolution::NotFound => None,
        }
    }
}

pub struct EntityResolver<'a, B> {
    backend: &'a B,
    caches: &'a CacheContext,
    skip_lookup: bool,
}

impl<'a, B: Backend> EntityResolver<'a, B> {
    pub fn new(backend: &'a B, caches: &'a CacheContext, skip_lookup: bool) -> Self {
        Self {
            backend,
            caches,
            skip_lookup,
        }
    }

    /// Whether the pre-create GET lookup runs for this kind.
    ///
    /// The skip-lookup performance override never applies to
    /// participants: their keys are only known at row-processing time,
    /// so a rerun with skipped lookups would double-create them.
    fn lookup_enabled(&self, kind: EntityKind) -> bool {
        !self.skip_lookup || kind == EntityKind::Participant
    }

    /// Resolve an entity to its backend id, creating it when allowed.
    ///
    /// 1. Cache hit on `cache_key` returns immediately, no network.
    /// 2. Filtered search (equality filters, page size 1) unless
    ///    lookups are skipped for this kind.
    /// 3. No match and no `create_payload` → `NotFound`.
    /// 4. Otherwise create. A uniqueness conflict means a concurrent
    ///    creator won the race: re-issue the search exactly once and
    ///    take its result; if it still finds nothing, the original
    ///    conflict error propagates. Any other failure propagates
    ///    unchanged.
    pub async fn resolve(
        &self,
        kind: EntityKind,
        filters: &[(&str, &str)],
        create_payload: Option<Value>,
        cache_key: Option<&str>,
    ) -> Result<Resolution, ApiError> {
        let cache = self.caches.cache(kind);

        if let Some(key) = cache_key {
            if let Some(id) = cache.get(key) {
                return Ok(Resolution::Found(id));
            }
        }

        let collection = kind.collection();

        if self.lookup_enabled(kind) {
            if let Some(record) = self.backend.find_first(collection, filters).await? {
                if let Some(key) = cache_key {
                    cache.set(key, record.id);
                }
                return Ok(Resolution::Found(record.id));
            }
        }

        let Some(payload) = create_payload else {
            return Ok(Resolution::NotFound);
        };

        match self.backend.create(collection, payload).await {
            Ok(record) => {
                if let Some(key) = cache_key {
                    cache.set(key, record.id);
                }
                Ok(Resolution::Found(record.id))
            }
            Err(conflict) if conflict.is_conflict() => {
                log::debug!(
                    "resolve: create conflict on {}, recovering via re-search",
                    collection
                );
                match self.backend.find_first(collection, filters).await? {
                    Some(record) => {
                        if let Some(key) = cache_key {
                            cache.set(key, record.id);
                        }
                        Ok(Resolution::Found(record.id))
                    }
                    None => Err(conflict),
                }
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Record;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(id: i64) -> Record {
        Record {
            id,
            attributes: serde_json::Map::new(),
        }
    }

    fn conflict() -> ApiError {
        ApiError::Conflict {
            collection: "programs".to_string(),
            message: "unique constraint violated".to_string(),
        }
    }

    /// Backend with scripted responses and call counters.
    #[derive(Default)]
    struct ScriptedBackend {
        searches: Mutex<VecDeque<Option<Record>>>,
        creates: Mutex<VecDeque<Result<Record, ApiError>>>,
        search_calls: AtomicUsize,
        create_calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn on_search(self, result: Option<Record>) -> Self {
            self.searches.lock().push_back(result);
            self
        }

        fn on_create(self, result: Result<Record, ApiError>) -> Self {
            self.creates.lock().push_back(result);
            self
        }
    }

    impl Backend for ScriptedBackend {
        async fn find_first(
            &self,
            _collection: &str,
            _filters: &[(&str, &str)],
        ) -> Result<Option<Record>, ApiError> {
            self.search_calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.searches.lock().pop_front().flatten())
        }

        async fn find_page(
            &self,
            _collection: &str,
            _page: u32,
            _page_size: u32,
            _fields: &[&str],
        ) -> Result<Vec<Record>, ApiError> {
            Ok(Vec::new())
        }

        async fn create(
            &self,
            _collection: &str,
            _data: serde_json::Value,
        ) -> Result<Record, ApiError> {
            self.create_calls.fetch_add(1, Ordering::Relaxed);
            self.creates
                .lock()
                .pop_front()
                .expect("unexpected create call")
        }
    }

    #[tokio::test]
    async fn test_idempotent_resolution() {
        let backend = ScriptedBackend::default()
            .on_search(None)
            .on_create(Ok(record(7)));
        let caches = CacheContext::new();
        let resolver = EntityResolver::new(&backend, &caches, false);

        let first = resolver
            .resolve(
                EntityKind::Program,
                &[("name", "Robotics")],
                Some(json!({"name": "Robotics"})),
                Some("Robotics"),
            )
            .await
            .unwrap();
        assert_eq!(first, Resolution::Found(7));

        // Second call must be served from cache: no further network.
        let second = resolver
            .resolve(
                EntityKind::Program,
                &[("name", "Robotics")],
                Some(json!({"name": "Robotics"})),
                Some("Robotics"),
            )
            .await
            .unwrap();
        assert_eq!(second, Resolution::Found(7));
        assert_eq!(backend.create_calls.load(Ordering::Relaxed), 1);
        assert_eq!(backend.search_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_race_recovery_searches_exactly_once() {
        let backend = ScriptedBackend::default()
            .on_search(None)
            .on_create(Err(conflict()))
            .on_search(Some(record(5)));
        let caches = CacheContext::new();
        let resolver = EntityResolver::new(&backend, &caches, false);

        let resolved = resolver
            .resolve(
                EntityKind::Program,
                &[("name", "Robotics")],
                Some(json!({"name": "Robotics"})),
                Some("Robotics"),
            )
            .await
            .unwrap();
        assert_eq!(resolved, Resolution::Found(5));
        assert_eq!(backend.search_calls.load(Ordering::Relaxed), 2);
        assert_eq!(backend.create_calls.load(Ordering::Relaxed), 1);
        assert_eq!(caches.cache(EntityKind::Program).get("Robotics"), Some(5));
    }

    #[tokio::test]
    async fn test_unrecovered_conflict_propagates_original_error() {
        let backend = ScriptedBackend::default()
            .on_search(None)
            .on_create(Err(conflict()))
            .on_search(None);
        let caches = CacheContext::new();
        let resolver = EntityResolver::new(&backend, &caches, false);

        let err = resolver
            .resolve(
                EntityKind::Program,
                &[("name", "Robotics")],
                Some(json!({"name": "Robotics"})),
                Some("Robotics"),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        // One recovery search only, never an open-ended retry loop.
        assert_eq!(backend.search_calls.load(Ordering::Relaxed), 2);
        assert_eq!(backend.create_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_not_found_without_payload() {
        let backend = ScriptedBackend::default().on_search(None);
        let caches = CacheContext::new();
        let resolver = EntityResolver::new(&backend, &caches, false);

        let resolved = resolver
            .resolve(EntityKind::Module, &[("name", "intro")], None, Some("intro|1"))
            .await
            .unwrap();
        assert_eq!(resolved, Resolution::NotFound);
        assert_eq!(backend.create_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_skip_lookup_goes_straight_to_create() {
        let backend = ScriptedBackend::default().on_create(Ok(record(3)));
        let caches = CacheContext::new();
        let resolver = EntityResolver::new(&backend, &caches, true);

        let resolved = resolver
            .resolve(
                EntityKind::Program,
                &[("name", "Robotics")],
                Some(json!({"name": "Robotics"})),
                Some("Robotics"),
            )
            .await
            .unwrap();
        assert_eq!(resolved, Resolution::Found(3));
        assert_eq!(backend.search_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_participant_lookup_not_skippable() {
        // skip_lookup is set, but participants still get the GET
        // lookup: reruns must find existing participants, not
        // double-create them.
        let backend = ScriptedBackend::default().on_search(Some(record(9)));
        let caches = CacheContext::new();
        let resolver = EntityResolver::new(&backend, &caches, true);

        let resolved = resolver
            .resolve(
                EntityKind::Participant,
                &[("first_name", "Ana"), ("last_name", "Lopez")],
                Some(json!({"first_name": "Ana", "last_name": "Lopez"})),
                Some("ana|lopez|1"),
            )
            .await
            .unwrap();
        assert_eq!(resolved, Resolution::Found(9));
        assert_eq!(backend.search_calls.load(Ordering::Relaxed), 1);
        assert_eq!(backend.create_calls.load(Ordering::Relaxed), 0);
    }
}
