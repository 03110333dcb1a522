//! Precreation stage: materialize every entity the rows depend on,
//! in dependency order, before any row is dispatched.
//!
//! Program and implementation creation is intentionally sequential.
//! These are the low-cardinality parents where a concurrent duplicate-
//! creation race against the remote store is actually plausible;
//! fanning them out would trade a few seconds for exactly the race the
//! resolver exists to avoid.

use crate::api::Backend;
use crate::cache::{CacheContext, EntityKind, natural_key};
use crate::config::SyncConfig;
use crate::pipeline::analysis::UniqueSets;
use crate::reference::ReferenceDataManager;
use crate::resolver::EntityResolver;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Fixed curriculum module set created for every implementation.
pub const CURRICULUM_MODULES: [&str; 4] = ["foundations", "exploration", "project", "showcase"];

/// Per-step counts plus the completeness issue list. Issues are logged,
/// never fatal: the run proceeds with best-effort data.
#[derive(Debug, Default)]
pub struct PrecreationSummary {
    pub programs: usize,
    pub implementations: usize,
    pub dependents: usize,
    pub issues: Vec<String>,
}

pub struct PrecreationStage<'a, B> {
    backend: &'a B,
    caches: &'a CacheContext,
    reference: Arc<ReferenceDataManager>,
    config: &'a SyncConfig,
}

impl<'a, B: Backend> PrecreationStage<'a, B> {
    pub fn new(
        backend: &'a B,
        caches: &'a CacheContext,
        reference: Arc<ReferenceDataManager>,
        config: &'a SyncConfig,
    ) -> Self {
        Self {
            backend,
            caches,
            reference,
            config,
        }
    }

    /// Run all precreation steps. Must complete before dispatch starts:
    /// dispatch only does readonly cache lookups for these entities.
    pub async fn run(&self, sets: &UniqueSets, extract: Option<&Path>) -> PrecreationSummary {
        let mut summary = PrecreationSummary::default();
        let resolver = EntityResolver::new(self.backend, self.caches, self.config.skip_lookup);

        // Step 1: reference cache and survey preload are independent of
        // each other and of everything below. Initialization parses the
        // extract synchronously, so it runs on the blocking pool to let
        // the preload make progress alongside it.
        let survey_cache = self.caches.cache(EntityKind::Survey);
        let init = {
            let reference = Arc::clone(&self.reference);
            let extract = extract.map(Path::to_path_buf);
            tokio::task::spawn_blocking(move || reference.initialize(extract.as_deref()))
        };
        let (init, preload) = tokio::join!(
            init,
            survey_cache.bulk_preload(
                self.backend,
                EntityKind::Survey.collection(),
                "name",
                self.config.chunk_size,
            )
        );
        if let Err(e) = init {
            log::warn!("precreate: reference initialization task failed: {}", e);
        }
        match preload {
            Ok(count) => log::info!("precreate: preloaded {} surveys", count),
            Err(e) => log::warn!("precreate: survey preload failed, continuing: {}", e),
        }

        // Step 2: programs.
        for name in &sets.program_names {
            match resolver
                .resolve(
                    EntityKind::Program,
                    &[("name", name)],
                    Some(json!({ "name": name })),
                    Some(name),
                )
                .await
            {
                Ok(_) => summary.programs += 1,
                Err(e) => {
                    log::warn!("precreate: program '{}' failed: {}", name, e);
                    summary
                        .issues
                        .push(format!("program '{}' unresolved: {}", name, e));
                }
            }
        }
        log::info!("precreate: {} programs resolved", summary.programs);

        // Step 3: implementations, looking parents up from step 2.
        let program_cache = self.caches.cache(EntityKind::Program);
        for (key, info) in &sets.implementations {
            let Some(program_id) = program_cache.get(&info.program_name) else {
                log::warn!(
                    "precreate: implementation '{}' skipped, program '{}' not resolved",
                    key,
                    info.program_name
                );
                summary.issues.push(format!(
                    "implementation '{}' skipped: missing program '{}'",
                    key, info.program_name
                ));
                continue;
            };

            let payload = json!({
                "name": info.name,
                "school_cycle": info.school_cycle,
                "period": info.period,
                "program": program_id,
            });
            match resolver
                .resolve(
                    EntityKind::Implementation,
                    &[
                        ("name", &info.name),
                        ("school_cycle", &info.school_cycle),
                        ("period", &info.period),
                    ],
                    Some(payload),
                    Some(key),
                )
                .await
            {
                Ok(_) => summary.implementations += 1,
                Err(e) => {
                    log::warn!("precreate: implementation '{}' failed: {}", key, e);
                    summary
                        .issues
                        .push(format!("implementation '{}' unresolved: {}", key, e));
                }
            }
        }
        log::info!(
            "precreate: {} implementations resolved",
            summary.implementations
        );

        // Step 4: per-implementation dependents.
        let implementation_cache = self.caches.cache(EntityKind::Implementation);
        for key in sets.implementations.keys() {
            let Some(implementation_id) = implementation_cache.get(key) else {
                continue;
            };
            summary.dependents += self
                .create_dependents(&resolver, implementation_id, sets, &mut summary.issues)
                .await;
        }
        log::info!("precreate: {} dependent entities resolved", summary.dependents);

        // Step 5: completeness check. Warn only.
        let already_reported = summary.issues.len();
        self.validate_completeness(sets, &mut summary.issues);
        for issue in &summary.issues[already_reported..] {
            log::warn!("precreate: {}", issue);
        }

        summary
    }

    /// Modules, attendance slots, and jobs for one implementation, all
    /// keyed by `(name, implementation_id)`.
    async fn create_dependents(
        &self,
        resolver: &EntityResolver<'a, B>,
        implementation_id: i64,
        sets: &UniqueSets,
        issues: &mut Vec<String>,
    ) -> usize {
        let implementation = implementation_id.to_string();
        let mut resolved = 0;

        for module in CURRICULUM_MODULES {
            let key = natural_key(&[module, &implementation]);
            let payload = json!({ "name": module, "implementation": implementation_id });
            match resolver
                .resolve(
                    EntityKind::Module,
                    &[("name", module), ("implementation", &implementation)],
                    Some(payload),
                    Some(&key),
                )
                .await
            {
                Ok(_) => resolved += 1,
                Err(e) => issues.push(format!("module '{}' unresolved: {}", key, e)),
            }
        }

        for (field, modality) in &sets.attendance_fields {
            let key = natural_key(&[field, &implementation]);
            let payload = json!({
                "name": field,
                "implementation": implementation_id,
                "modality": modality,
            });
            match resolver
                .resolve(
                    EntityKind::AttendanceSlot,
                    &[("name", field), ("implementation", &implementation)],
                    Some(payload),
                    Some(&key),
                )
                .await
            {
                Ok(_) => resolved += 1,
                Err(e) => issues.push(format!("attendance slot '{}' unresolved: {}", key, e)),
            }
        }

        for field in &sets.job_fields {
            let key = natural_key(&[field, &implementation]);
            let payload = json!({ "name": field, "implementation": implementation_id });
            match resolver
                .resolve(
                    EntityKind::Job,
                    &[("name", field), ("implementation", &implementation)],
                    Some(payload),
                    Some(&key),
                )
                .await
            {
                Ok(_) => resolved += 1,
                Err(e) => issues.push(format!("job '{}' unresolved: {}", key, e)),
            }
        }

        resolved
    }

    /// Report every implementation that is missing a required dependent
    /// in the caches after precreation.
    fn validate_completeness(&self, sets: &UniqueSets, issues: &mut Vec<String>) {
        let implementation_cache = self.caches.cache(EntityKind::Implementation);
        let module_cache = self.caches.cache(EntityKind::Module);
        let attendance_cache = self.caches.cache(EntityKind::AttendanceSlot);
        let job_cache = self.caches.cache(EntityKind::Job);

        for key in sets.implementations.keys() {
            let Some(id) = implementation_cache.get(key) else {
                continue;
            };
            let implementation = id.to_string();
            for module in CURRICULUM_MODULES {
                if !module_cache.has(&natural_key(&[module, &implementation])) {
                    issues.push(format!("implementation '{}' lacks module '{}'", key, module));
                }
            }
            for field in sets.attendance_fields.keys() {
                if !attendance_cache.has(&natural_key(&[field, &implementation])) {
                    issues.push(format!(
                        "implementation '{}' lacks attendance slot '{}'",
                        key, field
                    ));
                }
            }
            for field in &sets.job_fields {
                if !job_cache.has(&natural_key(&[field, &implementation])) {
                    issues.push(format!("implementation '{}' lacks job '{}'", key, field));
                }
            }
        }
    }
}
