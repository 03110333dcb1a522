//! Adaptive cache for the site-code reference table.
//!
//! The site-code table is large enough that loading all of it is not
//! always affordable. The manager picks between two interchangeable
//! strategies at initialization time and callers never need to know
//! which one is active:
//!
//! - **Preloaded**: a locally supplied reference extract is parsed
//!   fully into an in-memory `code → id` map. Lookups are pure map
//!   reads; a missing code is expected and returns `None` without any
//!   network I/O.
//! - **On-demand**: codes are resolved with individual remote searches,
//!   memoizing both hits and confirmed-absent results so a code is
//!   never fetched twice.
//!
//! Every initialization failure (no extract, malformed extract,
//! estimated memory above the configured ceiling) degrades to on-demand
//! with a logged warning. Initialization never raises.

use crate::api::{Backend, Record};
use crate::cache::EntityKind;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Estimated bytes per preloaded record: map entry + key + id.
/// Deliberately an overestimate so the ceiling errs toward on-demand.
pub const PER_RECORD_COST_BYTES: usize = 96;

/// Active strategy. Also used as a configuration override value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceMode {
    Preloaded,
    OnDemand,
}

impl FromStr for ReferenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preload" | "preloaded" => Ok(ReferenceMode::Preloaded),
            "on-demand" | "ondemand" | "on_demand" => Ok(ReferenceMode::OnDemand),
            other => Err(format!("unknown reference mode '{other}'")),
        }
    }
}

/// Performance counters, readable at any time.
#[derive(Debug, Clone)]
pub struct ReferenceStats {
    pub record_count: usize,
    pub estimated_bytes: usize,
    pub load_time_ms: u64,
    pub cache_hits: u64,
    pub lookups_avoided: u64,
}

enum State {
    Uninitialized,
    Preloaded(HashMap<String, i64>),
    OnDemand,
}

/// Outcome of strategy selection, built outside the state lock.
enum Prepared {
    Preloaded {
        map: HashMap<String, i64>,
        estimated_bytes: usize,
        load_time_ms: u64,
    },
    OnDemand,
}

pub struct ReferenceDataManager {
    state: RwLock<State>,
    /// On-demand memo. `None` is a confirmed-absent marker: the backend
    /// reported no match, so repeat lookups short-circuit.
    memo: DashMap<String, Option<i64>>,
    ceiling_bytes: usize,
    mode_override: Option<ReferenceMode>,
    record_count: AtomicUsize,
    estimated_bytes: AtomicUsize,
    load_time_ms: AtomicU64,
    cache_hits: AtomicU64,
    lookups_avoided: AtomicU64,
}

impl ReferenceDataManager {
    pub fn new(ceiling_bytes: usize, mode_override: Option<ReferenceMode>) -> Self {
        Self {
            state: RwLock::new(State::Uninitialized),
            memo: DashMap::new(),
            ceiling_bytes,
            mode_override,
            record_count: AtomicUsize::new(0),
            estimated_bytes: AtomicUsize::new(0),
            load_time_ms: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            lookups_avoided: AtomicU64::new(0),
        }
    }

    /// Choose and set up the strategy. Safe to call more than once;
    /// calls after the first are no-ops.
    ///
    /// The extract is parsed before the state lock is taken so lookups
    /// on other tasks never block behind the parse.
    pub fn initialize(&self, extract: Option<&Path>) {
        if !matches!(*self.state.read(), State::Uninitialized) {
            log::debug!("reference: already initialized, ignoring");
            return;
        }

        let prepared = self.prepare_state(extract);

        let mut state = self.state.write();
        if !matches!(*state, State::Uninitialized) {
            log::debug!("reference: initialized concurrently, discarding");
            return;
        }
        match prepared {
            Prepared::Preloaded {
                map,
                estimated_bytes,
                load_time_ms,
            } => {
                self.record_count.store(map.len(), Ordering::Relaxed);
                self.estimated_bytes.store(estimated_bytes, Ordering::Relaxed);
                self.load_time_ms.store(load_time_ms, Ordering::Relaxed);
                log::info!(
                    "reference: preloaded {} codes in {} ms (~{} KiB)",
                    map.len(),
                    load_time_ms,
                    estimated_bytes / 1024
                );
                *state = State::Preloaded(map);
            }
            Prepared::OnDemand => *state = State::OnDemand,
        }
    }

    /// Decide the strategy without touching the state lock.
    fn prepare_state(&self, extract: Option<&Path>) -> Prepared {
        if self.mode_override == Some(ReferenceMode::OnDemand) {
            log::info!("reference: on-demand mode forced by configuration");
            return Prepared::OnDemand;
        }

        let Some(path) = extract else {
            log::info!("reference: no extract supplied, using on-demand mode");
            return Prepared::OnDemand;
        };

        match self.try_preload(path) {
            Ok(prepared) => prepared,
            Err(reason) => {
                log::warn!("reference: {}, falling back to on-demand mode", reason);
                Prepared::OnDemand
            }
        }
    }

    /// Validate the extract, gate on the memory estimate, then parse it
    /// fully. Every failure is a fallback reason, never an error.
    fn try_preload(&self, path: &Path) -> Result<Prepared, String> {
        let started = Instant::now();

        let (id_col, code_col) = Self::locate_columns(path)?;

        // Count first so the memory gate runs before any map is built.
        let record_count = Self::count_records(path)?;
        let estimated = record_count * PER_RECORD_COST_BYTES;
        if estimated > self.ceiling_bytes && self.mode_override != Some(ReferenceMode::Preloaded) {
            return Err(format!(
                "extract of {} records (~{} bytes) exceeds ceiling of {} bytes",
                record_count, estimated, self.ceiling_bytes
            ));
        }

        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| format!("extract unreadable at {}: {}", path.display(), e))?;
        let mut map = HashMap::with_capacity(record_count);
        let mut skipped = 0usize;
        for record in reader.records() {
            let record = record.map_err(|e| format!("extract parse error: {}", e))?;
            let id = record.get(id_col).and_then(|v| v.trim().parse::<i64>().ok());
            let code = record.get(code_col).map(|v| v.trim()).filter(|v| !v.is_empty());
            match (id, code) {
                (Some(id), Some(code)) => {
                    map.insert(code.to_string(), id);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!("reference: skipped {} extract rows with bad id or code", skipped);
        }

        Ok(Prepared::Preloaded {
            map,
            estimated_bytes: estimated,
            load_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Find the identifier and code columns, case-insensitively.
    fn locate_columns(path: &Path) -> Result<(usize, usize), String> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| format!("extract unreadable at {}: {}", path.display(), e))?;
        let headers = reader
            .headers()
            .map_err(|e| format!("extract has no readable header: {}", e))?;

        let mut id_col = None;
        let mut code_col = None;
        for (idx, header) in headers.iter().enumerate() {
            let name = header.trim().to_ascii_lowercase();
            match name.as_str() {
                "id" => id_col = Some(idx),
                "code" | "site_code" => code_col = Some(idx),
                _ => {}
            }
        }
        match (id_col, code_col) {
            (Some(id), Some(code)) => Ok((id, code)),
            _ => Err("extract is missing an id or code column".to_string()),
        }
    }

    fn count_records(path: &Path) -> Result<usize, String> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| format!("extract unreadable at {}: {}", path.display(), e))?;
        let mut count = 0usize;
        for record in reader.records() {
            record.map_err(|e| format!("extract parse error: {}", e))?;
            count += 1;
        }
        Ok(count)
    }

    pub fn mode(&self) -> ReferenceMode {
        match *self.state.read() {
            State::Preloaded(_) => ReferenceMode::Preloaded,
            // Uninitialized behaves like on-demand with an empty memo.
            State::OnDemand | State::Uninitialized => ReferenceMode::OnDemand,
        }
    }

    /// Resolve a site code to its backend id.
    ///
    /// Idempotent: repeated calls for the same code never produce a
    /// second network request. A remote failure logs a warning and
    /// returns `None` so the work item still gets processed, just
    /// without this reference; failures are not memoized.
    pub async fn resolve_code<B: Backend>(&self, backend: &B, code: &str) -> Option<i64> {
        {
            let state = self.state.read();
            if let State::Preloaded(map) = &*state {
                let hit = map.get(code).copied();
                if hit.is_some() {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                }
                return hit;
            }
        }

        if let Some(memoized) = self.memo.get(code) {
            self.lookups_avoided.fetch_add(1, Ordering::Relaxed);
            return *memoized;
        }

        let found: Option<Record> = match backend
            .find_first(EntityKind::SiteCode.collection(), &[("code", code)])
            .await
        {
            Ok(found) => found,
            Err(e) => {
                log::warn!("reference: lookup for code '{}' failed: {}", code, e);
                return None;
            }
        };

        let id = found.map(|record| record.id);
        // First writer wins, so resolvers racing on the same code all
        // converge on one id.
        let resolved = *self.memo.entry(code.to_string()).or_insert(id);
        if resolved.is_none() {
            log::debug!("reference: code '{}' confirmed absent", code);
        }
        resolved
    }

    /// Clear all state back to uninitialized.
    pub fn reset(&self) {
        *self.state.write() = State::Uninitialized;
        self.memo.clear();
        self.record_count.store(0, Ordering::Relaxed);
        self.estimated_bytes.store(0, Ordering::Relaxed);
        self.load_time_ms.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.lookups_avoided.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ReferenceStats {
        ReferenceStats {
            record_count: self.record_count.load(Ordering::Relaxed),
            estimated_bytes: self.estimated_bytes.load(Ordering::Relaxed),
            load_time_ms: self.load_time_ms.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            lookups_avoided: self.lookups_avoided.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, Backend};
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use tempfile::NamedTempFile;

    /// Backend that serves one fixed code and counts searches.
    struct CountingBackend {
        known_code: &'static str,
        id: i64,
        searches: AtomicUsize,
    }

    impl CountingBackend {
        fn new(known_code: &'static str, id: i64) -> Self {
            Self {
                known_code,
                id,
                searches: AtomicUsize::new(0),
            }
        }
    }

    impl Backend for CountingBackend {
        async fn find_first(
            &self,
            _collection: &str,
            filters: &[(&str, &str)],
        ) -> Result<Option<Record>, ApiError> {
            self.searches.fetch_add(1, Ordering::Relaxed);
            let matched = filters
                .iter()
                .any(|(field, value)| *field == "code" && *value == self.known_code);
            Ok(matched.then(|| Record {
                id: self.id,
                attributes: serde_json::Map::new(),
            }))
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
            collection: &str,
            _data: serde_json::Value,
        ) -> Result<Record, ApiError> {
            panic!("reference manager must never create, got create on {collection}");
        }
    }

    fn extract_with(rows: &[(i64, &str)]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ID,Code").unwrap();
        for (id, code) in rows {
            writeln!(file, "{},{}", id, code).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_preload_when_extract_fits() {
        let extract = extract_with(&[(1, "X1"), (2, "X2")]);
        let manager = ReferenceDataManager::new(1024 * 1024, None);
        manager.initialize(Some(extract.path()));
        assert_eq!(manager.mode(), ReferenceMode::Preloaded);

        let backend = CountingBackend::new("X1", 1);
        assert_eq!(manager.resolve_code(&backend, "X1").await, Some(1));
        assert_eq!(manager.resolve_code(&backend, "X9").await, None);
        // Preloaded mode never touches the network.
        assert_eq!(backend.searches.load(Ordering::Relaxed), 0);
        assert_eq!(manager.stats().record_count, 2);
        assert_eq!(manager.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_fallback_when_over_ceiling() {
        let extract = extract_with(&[(1, "X1"), (2, "X2"), (3, "X3")]);
        // Ceiling below the 3 * PER_RECORD_COST_BYTES estimate.
        let manager = ReferenceDataManager::new(PER_RECORD_COST_BYTES * 2, None);
        manager.initialize(Some(extract.path()));
        assert_eq!(manager.mode(), ReferenceMode::OnDemand);

        let backend = CountingBackend::new("X1", 11);
        assert_eq!(manager.resolve_code(&backend, "X1").await, Some(11));
        assert_eq!(backend.searches.load(Ordering::Relaxed), 1);
        // Second call is served from the memo.
        assert_eq!(manager.resolve_code(&backend, "X1").await, Some(11));
        assert_eq!(backend.searches.load(Ordering::Relaxed), 1);
        assert_eq!(manager.stats().lookups_avoided, 1);
    }

    #[tokio::test]
    async fn test_negative_caching() {
        let manager = ReferenceDataManager::new(1024, None);
        manager.initialize(None);
        assert_eq!(manager.mode(), ReferenceMode::OnDemand);

        let backend = CountingBackend::new("KNOWN", 1);
        assert_eq!(manager.resolve_code(&backend, "MISSING").await, None);
        assert_eq!(manager.resolve_code(&backend, "MISSING").await, None);
        // Confirmed-absent marker short-circuits the second lookup.
        assert_eq!(backend.searches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_malformed_extract_falls_back() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "name,value").unwrap();
        writeln!(file, "a,1").unwrap();
        file.flush().unwrap();

        let manager = ReferenceDataManager::new(1024 * 1024, None);
        manager.initialize(Some(file.path()));
        assert_eq!(manager.mode(), ReferenceMode::OnDemand);
    }

    #[tokio::test]
    async fn test_override_forces_on_demand() {
        let extract = extract_with(&[(1, "X1")]);
        let manager =
            ReferenceDataManager::new(1024 * 1024, Some(ReferenceMode::OnDemand));
        manager.initialize(Some(extract.path()));
        assert_eq!(manager.mode(), ReferenceMode::OnDemand);
    }

    /// Holds every `find_first` at a barrier so two in-flight lookups
    /// for the same code both miss the memo before either answers.
    struct RacingBackend {
        barrier: tokio::sync::Barrier,
        next_id: std::sync::atomic::AtomicI64,
        searches: AtomicUsize,
    }

    impl RacingBackend {
        fn new(waiters: usize) -> Self {
            Self {
                barrier: tokio::sync::Barrier::new(waiters),
                next_id: std::sync::atomic::AtomicI64::new(10),
                searches: AtomicUsize::new(0),
            }
        }
    }

    impl Backend for RacingBackend {
        async fn find_first(
            &self,
            _collection: &str,
            _filters: &[(&str, &str)],
        ) -> Result<Option<Record>, ApiError> {
            self.searches.fetch_add(1, Ordering::Relaxed);
            self.barrier.wait().await;
            Ok(Some(Record {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                attributes: serde_json::Map::new(),
            }))
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
            collection: &str,
            _data: serde_json::Value,
        ) -> Result<Record, ApiError> {
            panic!("reference manager must never create, got create on {collection}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_converge_on_one_id() {
        let manager = ReferenceDataManager::new(1024, None);
        manager.initialize(None);

        let backend = RacingBackend::new(2);
        let (first, second) = futures::join!(
            manager.resolve_code(&backend, "X1"),
            manager.resolve_code(&backend, "X1")
        );

        // Both lookups went out, yet both callers see the same id and
        // the memo keeps serving it without another request.
        assert_eq!(backend.searches.load(Ordering::Relaxed), 2);
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(manager.resolve_code(&backend, "X1").await, first);
        assert_eq!(backend.searches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_has_one_winner() {
        let extract = extract_with(&[(1, "X1"), (2, "X2")]);
        let manager = std::sync::Arc::new(ReferenceDataManager::new(1024 * 1024, None));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let manager = std::sync::Arc::clone(&manager);
            let path = extract.path().to_path_buf();
            handles.push(tokio::task::spawn_blocking(move || {
                manager.initialize(Some(&path))
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(manager.mode(), ReferenceMode::Preloaded);
        assert_eq!(manager.stats().record_count, 2);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_reset_clears() {
        let extract = extract_with(&[(1, "X1")]);
        let manager = ReferenceDataManager::new(1024 * 1024, None);
        manager.initialize(Some(extract.path()));
        // Second initialize with no extract must not flip the mode.
        manager.initialize(None);
        assert_eq!(manager.mode(), ReferenceMode::Preloaded);

        manager.reset();
        assert_eq!(manager.mode(), ReferenceMode::OnDemand);
        assert_eq!(manager.stats().record_count, 0);
        manager.initialize(None);
        assert_eq!(manager.mode(), ReferenceMode::OnDemand);
    }
}
