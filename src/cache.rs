//! Per-run entity id caches.
//!
//! Every resolver-managed entity type gets one [`KeyedCache`]: a map
//! from a natural composite key to the backend id the entity resolved
//! to during this run. Site codes are the exception; their adaptive
//! cache lives in [`crate::reference::ReferenceDataManager`]. Caches
//! are created fresh per run inside a [`CacheContext`] that is passed
//! by reference into every stage, and discarded at run end; nothing
//! here is persisted.
//!
//! DashMap backs each cache because parallel batch dispatch issues
//! concurrent reads and occasional writes from many tasks at once.

use crate::api::{ApiError, Backend};
use dashmap::DashMap;

/// Separator for natural-key parts.
pub const KEY_SEPARATOR: char = '|';

/// Build a natural key by joining ordered parts. Identical logical
/// entities always yield byte-identical keys.
pub fn natural_key(parts: &[&str]) -> String {
    parts.join(&KEY_SEPARATOR.to_string())
}

/// Closed set of entity types. Each maps to its backend collection;
/// all but `SiteCode` own a [`KeyedCache`] in the [`CacheContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Program,
    SiteCode,
    Participant,
    Implementation,
    Module,
    Survey,
    AttendanceSlot,
    Job,
}

impl EntityKind {
    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Program => "programs",
            EntityKind::SiteCode => "site-codes",
            EntityKind::Participant => "participants",
            EntityKind::Implementation => "implementations",
            EntityKind::Module => "modules",
            EntityKind::Survey => "surveys",
            EntityKind::AttendanceSlot => "attendance-slots",
            EntityKind::Job => "jobs",
        }
    }
}

/// Natural key → backend id, append-only within a run.
#[derive(Default)]
pub struct KeyedCache {
    entries: DashMap<String, i64>,
}

impl KeyedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.entries.get(key).map(|id| *id)
    }

    /// Record a resolution. Setting the same key with the same id again
    /// is a no-op; rebinding a key to a different id is a programming
    /// error and fails loudly in debug builds.
    pub fn set(&self, key: &str, id: i64) {
        if let Some(existing) = self.entries.get(key) {
            debug_assert_eq!(
                *existing, id,
                "cache key '{key}' rebound from {} to {id}",
                *existing
            );
            return;
        }
        self.entries.insert(key.to_string(), id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Page through a whole collection, caching `key_field` → id for
    /// every record until the backend returns an empty page. Only the
    /// id and the key field are requested. Errors propagate; whatever
    /// was inserted before the failure stays cached.
    pub async fn bulk_preload<B: Backend>(
        &self,
        backend: &B,
        collection: &str,
        key_field: &str,
        page_size: u32,
    ) -> Result<usize, ApiError> {
        let mut page = 1;
        let mut loaded = 0;
        loop {
            let records = backend
                .find_page(collection, page, page_size, &["id", key_field])
                .await?;
            if records.is_empty() {
                break;
            }
            for record in &records {
                match record.attr_str(key_field) {
                    Some(key) => {
                        self.set(key, record.id);
                        loaded += 1;
                    }
                    None => log::warn!(
                        "preload: {} record {} has no '{}' field, skipping",
                        collection,
                        record.id,
                        key_field
                    ),
                }
            }
            page += 1;
        }
        log::debug!("preload: cached {} {} records", loaded, collection);
        Ok(loaded)
    }
}

/// One cache per resolver-managed entity type, constructed once per
/// run. Site codes have no cache here; they are resolved through
/// [`crate::reference::ReferenceDataManager`].
#[derive(Default)]
pub struct CacheContext {
    programs: KeyedCache,
    participants: KeyedCache,
    implementations: KeyedCache,
    modules: KeyedCache,
    surveys: KeyedCache,
    attendance_slots: KeyedCache,
    jobs: KeyedCache,
}

impl CacheContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// `EntityKind::SiteCode` has no keyed cache; asking for one is a
    /// programming error.
    pub fn cache(&self, kind: EntityKind) -> &KeyedCache {
        match kind {
            EntityKind::Program => &self.programs,
            EntityKind::SiteCode => {
                panic!("site codes are resolved through ReferenceDataManager, not a keyed cache")
            }
            EntityKind::Participant => &self.participants,
            EntityKind::Implementation => &self.implementations,
            EntityKind::Module => &self.modules,
            EntityKind::Survey => &self.surveys,
            EntityKind::AttendanceSlot => &self.attendance_slots,
            EntityKind::Job => &self.jobs,
        }
    }
}
