//! Batch dispatch stage: re-iterate the source rows in fixed-size
//! batches and write each row's dependent records.
//!
//! By this point every parent entity is cached; per-row processing only
//! does readonly cache lookups, except for the participant itself,
//! which is only fully known at row time and goes through the resolver.
//!
//! One row's failure never cancels or blocks its siblings. In parallel
//! mode the batch fans out per-row futures and settles all of them;
//! dependent-record writes inside a row are best-effort and settle as a
//! list of `Result`s whose failures are logged, never escalated.

use crate::api::{ApiError, Backend};
use crate::cache::{CacheContext, EntityKind, natural_key};
use crate::config::{ProcessingMode, SyncConfig};
use crate::pipeline::analysis::{
    FIELD_EMAIL, FIELD_FIRST_NAME, FIELD_LAST_NAME, FIELD_SITE_CODE, SURVEY_PREFIX, UniqueSets,
    implementation_key,
};
use crate::pipeline::precreate::CURRICULUM_MODULES;
use crate::reference::ReferenceDataManager;
use crate::report::{ErrorSink, RowError};
use crate::resolver::EntityResolver;
use crate::source::{SourceRow, is_not_applicable};
use futures::future::join_all;
use serde_json::{Value, json};

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchTotals {
    pub success: usize,
    pub errors: usize,
}

pub struct BatchDispatchStage<'a, B> {
    backend: &'a B,
    caches: &'a CacheContext,
    reference: &'a ReferenceDataManager,
    config: &'a SyncConfig,
    errors: &'a dyn ErrorSink,
}

impl<'a, B: Backend> BatchDispatchStage<'a, B> {
    pub fn new(
        backend: &'a B,
        caches: &'a CacheContext,
        reference: &'a ReferenceDataManager,
        config: &'a SyncConfig,
        errors: &'a dyn ErrorSink,
    ) -> Self {
        Self {
            backend,
            caches,
            reference,
            config,
            errors,
        }
    }

    pub async fn run(&self, rows: &[SourceRow], sets: &UniqueSets) -> DispatchTotals {
        let mut totals = DispatchTotals::default();
        let num_batches = rows.len().div_ceil(self.config.batch_size);

        for (batch_idx, batch) in rows.chunks(self.config.batch_size).enumerate() {
            log::debug!(
                "dispatch: batch {}/{} ({} rows, {:?})",
                batch_idx + 1,
                num_batches,
                batch.len(),
                self.config.mode
            );

            let outcomes = match self.config.mode {
                ProcessingMode::Parallel => {
                    join_all(batch.iter().map(|row| self.process_row(row, sets))).await
                }
                ProcessingMode::Sequential => {
                    let mut outcomes = Vec::with_capacity(batch.len());
                    for row in batch {
                        outcomes.push(self.process_row(row, sets).await);
                    }
                    outcomes
                }
            };

            for outcome in outcomes {
                match outcome {
                    Ok(_) => totals.success += 1,
                    Err(error) => {
                        totals.errors += 1;
                        self.errors.record(error);
                    }
                }
            }
        }

        log::info!(
            "dispatch: complete - {} ok, {} errors",
            totals.success,
            totals.errors
        );
        totals
    }

    /// Process one row. Returns the participant id on success; failures
    /// are row-local and reported, never thrown past the batch.
    async fn process_row(&self, row: &SourceRow, sets: &UniqueSets) -> Result<i64, RowError> {
        let participant_label = match (row.get(FIELD_FIRST_NAME), row.get(FIELD_LAST_NAME)) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            _ => format!("row {}", row.number),
        };
        let email = row
            .get(FIELD_EMAIL)
            .filter(|e| !is_not_applicable(e))
            .map(str::to_string);
        let row_error = |message: String| RowError {
            participant: participant_label.clone(),
            email: email.clone(),
            message,
            row_number: Some(row.number),
        };

        let implementation_id = implementation_key(row)
            .and_then(|key| self.caches.cache(EntityKind::Implementation).get(&key));

        let site_code_id = match row.get(FIELD_SITE_CODE) {
            Some(code) => self.reference.resolve_code(self.backend, code).await,
            None => None,
        };

        let participant_id = self
            .resolve_participant(row, implementation_id, site_code_id)
            .await
            .map_err(|e| row_error(format!("participant resolution failed: {e}")))?;

        let (Some(participant_id), Some(implementation_id)) = (participant_id, implementation_id)
        else {
            return Err(row_error(format!(
                "missing critical identifiers (participant: {:?}, implementation: {:?})",
                participant_id, implementation_id
            )));
        };

        self.write_dependents(row, sets, participant_id, implementation_id)
            .await;
        self.handle_email(row, participant_id, email.as_deref()).await;

        Ok(participant_id)
    }

    /// Resolve or create the participant. `Ok(None)` means the row
    /// lacked the name fields needed to even form its key.
    async fn resolve_participant(
        &self,
        row: &SourceRow,
        implementation_id: Option<i64>,
        site_code_id: Option<i64>,
    ) -> Result<Option<i64>, ApiError> {
        let (Some(first), Some(last), Some(implementation_id)) = (
            row.get(FIELD_FIRST_NAME),
            row.get(FIELD_LAST_NAME),
            implementation_id,
        ) else {
            return Ok(None);
        };

        let implementation = implementation_id.to_string();
        let key = natural_key(&[first, last, &implementation]);
        let mut payload = json!({
            "first_name": first,
            "last_name": last,
            "implementation": implementation_id,
        });
        if let Some(site_id) = site_code_id {
            payload["site_code"] = json!(site_id);
        }

        let resolver = EntityResolver::new(self.backend, self.caches, self.config.skip_lookup);
        let resolution = resolver
            .resolve(
                EntityKind::Participant,
                &[
                    ("first_name", first),
                    ("last_name", last),
                    ("implementation", &implementation),
                ],
                Some(payload),
                Some(&key),
            )
            .await?;
        Ok(resolution.id())
    }

    /// Best-effort creation of the row's dependent records. Failures
    /// are collected from the settled list and logged; none of them
    /// fail the row.
    async fn write_dependents(
        &self,
        row: &SourceRow,
        sets: &UniqueSets,
        participant_id: i64,
        implementation_id: i64,
    ) {
        let implementation = implementation_id.to_string();
        let modules = self.caches.cache(EntityKind::Module);
        let surveys = self.caches.cache(EntityKind::Survey);
        let attendance = self.caches.cache(EntityKind::AttendanceSlot);
        let jobs = self.caches.cache(EntityKind::Job);

        let mut writes: Vec<(&'static str, Value)> = Vec::new();

        for module in CURRICULUM_MODULES {
            let Some(score) = row.get(module).filter(|v| !is_not_applicable(v)) else {
                continue;
            };
            match modules.get(&natural_key(&[module, &implementation])) {
                Some(module_id) => writes.push((
                    "module-scores",
                    json!({
                        "participant": participant_id,
                        "module": module_id,
                        "score": score,
                    }),
                )),
                None => log::debug!(
                    "dispatch: row {} has score for uncached module '{}'",
                    row.number,
                    module
                ),
            }
        }

        for field in row.field_names() {
            let Some(name) = field.strip_prefix(SURVEY_PREFIX) else {
                continue;
            };
            let Some(value) = row.get(field).filter(|v| !is_not_applicable(v)) else {
                continue;
            };
            match surveys.get(name) {
                Some(survey_id) => writes.push((
                    "survey-completions",
                    json!({
                        "participant": participant_id,
                        "survey": survey_id,
                        "value": value,
                    }),
                )),
                None => log::debug!(
                    "dispatch: row {} references unknown survey '{}'",
                    row.number,
                    name
                ),
            }
        }

        for field in sets.attendance_fields.keys() {
            let Some(value) = row.get(field).filter(|v| !is_not_applicable(v)) else {
                continue;
            };
            if let Some(slot_id) = attendance.get(&natural_key(&[field, &implementation])) {
                writes.push((
                    "attendance-records",
                    json!({
                        "participant": participant_id,
                        "attendance_slot": slot_id,
                        "value": value,
                    }),
                ));
            }
        }

        for field in &sets.job_fields {
            let Some(value) = row.get(field).filter(|v| !is_not_applicable(v)) else {
                continue;
            };
            if let Some(job_id) = jobs.get(&natural_key(&[field, &implementation])) {
                writes.push((
                    "job-records",
                    json!({
                        "participant": participant_id,
                        "job": job_id,
                        "value": value,
                    }),
                ));
            }
        }

        if writes.is_empty() {
            return;
        }

        let results = join_all(
            writes
                .iter()
                .map(|(collection, payload)| self.backend.create(collection, payload.clone())),
        )
        .await;

        for (result, (collection, _)) in results.iter().zip(&writes) {
            if let Err(e) = result {
                log::warn!(
                    "dispatch: row {} {} write failed (non-fatal): {}",
                    row.number,
                    collection,
                    e
                );
            }
        }
    }

    /// Conditional email sub-step: skip blank/sentinel emails, skip
    /// exact duplicates, and mark the first email for a participant as
    /// primary. Failures here are logged, not row-fatal.
    async fn handle_email(&self, row: &SourceRow, participant_id: i64, email: Option<&str>) {
        let Some(email) = email else {
            return;
        };
        let participant = participant_id.to_string();

        let exact = self
            .backend
            .find_first(
                "participant-emails",
                &[("participant", &participant), ("email", email)],
            )
            .await;
        match exact {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                log::warn!("dispatch: row {} email check failed: {}", row.number, e);
                return;
            }
        }

        let any_existing = self
            .backend
            .find_first("participant-emails", &[("participant", &participant)])
            .await;
        let primary = match any_existing {
            Ok(existing) => existing.is_none(),
            Err(e) => {
                log::warn!("dispatch: row {} email check failed: {}", row.number, e);
                return;
            }
        };

        if let Err(e) = self
            .backend
            .create(
                "participant-emails",
                json!({
                    "participant": participant_id,
                    "email": email,
                    "primary": primary,
                }),
            )
            .await
        {
            log::warn!(
                "dispatch: row {} email create failed (non-fatal): {}",
                row.number,
                e
            );
        }
    }
}
