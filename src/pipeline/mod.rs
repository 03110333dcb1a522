//! Sync pipeline orchestration.
//!
//! Data flow, one run:
//!
//! 1. **Analysis**: stream the rows once, collect the distinct entity
//!    keys ([`analysis::UniqueSets`]).
//! 2. **Precreation**: materialize programs, implementations, and
//!    their dependents in dependency order, populating the per-run
//!    caches ([`precreate::PrecreationStage`]).
//! 3. **Dispatch**: process rows in fixed-size batches against the
//!    populated caches ([`dispatch::BatchDispatchStage`]).
//!
//! The pipeline owns nothing persistent: caches and the reference
//! manager are constructed fresh for each run and dropped with it.

pub mod analysis;
pub mod dispatch;
pub mod precreate;

use crate::api::Backend;
use crate::cache::CacheContext;
use crate::config::SyncConfig;
use dispatch::BatchDispatchStage;
use precreate::PrecreationStage;
use crate::reference::ReferenceDataManager;
use crate::report::{ErrorSink, SyncOutcome};
use crate::source::SourceRow;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub use analysis::{UniqueSets, analyze};

pub struct SyncPipeline<'a, B> {
    backend: &'a B,
    config: &'a SyncConfig,
    errors: &'a dyn ErrorSink,
}

impl<'a, B: Backend> SyncPipeline<'a, B> {
    pub fn new(backend: &'a B, config: &'a SyncConfig, errors: &'a dyn ErrorSink) -> Self {
        Self {
            backend,
            config,
            errors,
        }
    }

    /// Run the full pipeline over the given rows.
    pub async fn run(
        &self,
        rows: &[SourceRow],
        reference_extract: Option<&Path>,
    ) -> SyncOutcome {
        let started = Instant::now();
        log::info!("pipeline: starting run over {} rows", rows.len());

        let caches = CacheContext::new();
        let reference = Arc::new(ReferenceDataManager::new(
            self.config.reference_memory_ceiling,
            self.config.reference_mode_override,
        ));

        let sets = analysis::analyze(rows);

        let precreation =
            PrecreationStage::new(self.backend, &caches, Arc::clone(&reference), self.config);
        let summary = precreation.run(&sets, reference_extract).await;
        if !summary.issues.is_empty() {
            log::warn!(
                "pipeline: precreation finished with {} issues, proceeding best-effort",
                summary.issues.len()
            );
        }

        let dispatch =
            BatchDispatchStage::new(self.backend, &caches, &reference, self.config, self.errors);
        let totals = dispatch.run(rows, &sets).await;

        let reference_stats = reference.stats();
        log::info!(
            "pipeline: reference cache - {} records, {} hits, {} lookups avoided",
            reference_stats.record_count,
            reference_stats.cache_hits,
            reference_stats.lookups_avoided
        );

        let outcome = SyncOutcome {
            total_records: rows.len(),
            success_count: totals.success,
            error_count: totals.errors,
            processing_time_ms: started.elapsed().as_millis() as u64,
            error_report_path: self.errors.flush(),
        };
        log::info!(
            "pipeline: done - {} total, {} ok, {} errors in {} ms",
            outcome.total_records,
            outcome.success_count,
            outcome.error_count,
            outcome.processing_time_ms
        );
        outcome
    }
}
