//! Analysis stage: one streaming pass over the source rows to collect
//! every distinct entity key that must exist before any row is
//! processed.
//!
//! Pure: deterministic for a given input, no resolver or network calls.

use crate::cache::natural_key;
use crate::source::{SourceRow, is_not_applicable};
use std::collections::{BTreeMap, BTreeSet};

/// Normalized field names the pipeline reads from every row.
pub const FIELD_SITE_CODE: &str = "site_code";
pub const FIELD_PROGRAM: &str = "program";
pub const FIELD_IMPLEMENTATION: &str = "implementation";
pub const FIELD_SCHOOL_CYCLE: &str = "school_cycle";
pub const FIELD_PERIOD: &str = "period";
pub const FIELD_FIRST_NAME: &str = "first_name";
pub const FIELD_LAST_NAME: &str = "last_name";
pub const FIELD_EMAIL: &str = "email";

/// Column-name prefixes recognized by the field scan.
pub const ATTENDANCE_PREFIX: &str = "attendance_";
pub const JOB_PREFIX: &str = "job_";
pub const SURVEY_PREFIX: &str = "survey_";
pub const MODALITY_PREFIX: &str = "modality_";

/// Descriptive fields of an implementation, captured from the first row
/// that mentions it. Later rows with the same key never overwrite them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplementationInfo {
    pub name: String,
    pub school_cycle: String,
    pub period: String,
    pub program_name: String,
}

impl ImplementationInfo {
    pub fn natural_key(&self) -> String {
        natural_key(&[&self.name, &self.school_cycle, &self.period])
    }
}

/// Everything precreation needs to materialize ahead of dispatch.
/// Ordered collections so precreation iterates deterministically.
#[derive(Debug, Default)]
pub struct UniqueSets {
    pub site_codes: BTreeSet<String>,
    pub program_names: BTreeSet<String>,
    /// Implementation natural key → descriptive fields.
    pub implementations: BTreeMap<String, ImplementationInfo>,
    /// Attendance field name → modality, when a non-sentinel value was
    /// seen in the parallel `modality_<field>` column.
    pub attendance_fields: BTreeMap<String, Option<String>>,
    pub job_fields: BTreeSet<String>,
}

/// Build the implementation key for a row, when the row carries all
/// three defining fields.
pub fn implementation_key(row: &SourceRow) -> Option<String> {
    let name = row.get(FIELD_IMPLEMENTATION)?;
    let cycle = row.get(FIELD_SCHOOL_CYCLE)?;
    let period = row.get(FIELD_PERIOD)?;
    Some(natural_key(&[name, cycle, period]))
}

pub fn analyze(rows: &[SourceRow]) -> UniqueSets {
    let mut sets = UniqueSets::default();

    for row in rows {
        if let Some(code) = row.get(FIELD_SITE_CODE) {
            sets.site_codes.insert(code.to_string());
        }
        if let Some(program) = row.get(FIELD_PROGRAM) {
            sets.program_names.insert(program.to_string());
        }

        if let (Some(name), Some(cycle), Some(period)) = (
            row.get(FIELD_IMPLEMENTATION),
            row.get(FIELD_SCHOOL_CYCLE),
            row.get(FIELD_PERIOD),
        ) {
            let info = ImplementationInfo {
                name: name.to_string(),
                school_cycle: cycle.to_string(),
                period: period.to_string(),
                program_name: row.get(FIELD_PROGRAM).unwrap_or_default().to_string(),
            };
            sets.implementations.entry(info.natural_key()).or_insert(info);
        }

        for field in row.field_names() {
            if field.starts_with(ATTENDANCE_PREFIX) {
                let modality_slot = sets
                    .attendance_fields
                    .entry(field.to_string())
                    .or_insert(None);
                if modality_slot.is_none() {
                    let modality_column = format!("{MODALITY_PREFIX}{field}");
                    if let Some(modality) = row.get(&modality_column) {
                        if !is_not_applicable(modality) {
                            *modality_slot = Some(modality.to_string());
                        }
                    }
                }
            } else if field.starts_with(JOB_PREFIX) {
                sets.job_fields.insert(field.to_string());
            }
        }
    }

    log::info!(
        "analysis: {} site codes, {} programs, {} implementations, {} attendance fields, {} job fields",
        sets.site_codes.len(),
        sets.program_names.len(),
        sets.implementations.len(),
        sets.attendance_fields.len(),
        sets.job_fields.len()
    );
    sets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceRow;

    fn row(number: usize, pairs: &[(&str, &str)]) -> SourceRow {
        SourceRow::from_pairs(number, pairs)
    }

    #[test]
    fn test_distinct_keys_deduped() {
        let rows = vec![
            row(2, &[("site_code", "X1"), ("program", "Robotics")]),
            row(3, &[("site_code", "X1"), ("program", "Robotics")]),
            row(4, &[("site_code", "X2"), ("program", "Coding")]),
        ];
        let sets = analyze(&rows);
        assert_eq!(sets.site_codes.len(), 2);
        assert_eq!(sets.program_names.len(), 2);
        assert!(sets.implementations.is_empty());
    }

    #[test]
    fn test_implementation_needs_all_three_fields() {
        let rows = vec![
            row(2, &[("implementation", "North"), ("school_cycle", "2024")]),
            row(
                3,
                &[
                    ("implementation", "North"),
                    ("school_cycle", "2024"),
                    ("period", "A"),
                    ("program", "Robotics"),
                ],
            ),
        ];
        let sets = analyze(&rows);
        assert_eq!(sets.implementations.len(), 1);
        let info = &sets.implementations["North|2024|A"];
        assert_eq!(info.program_name, "Robotics");
    }

    #[test]
    fn test_first_sighting_wins() {
        let rows = vec![
            row(
                2,
                &[
                    ("implementation", "North"),
                    ("school_cycle", "2024"),
                    ("period", "A"),
                    ("program", "Robotics"),
                ],
            ),
            row(
                3,
                &[
                    ("implementation", "North"),
                    ("school_cycle", "2024"),
                    ("period", "A"),
                    ("program", "Coding"),
                ],
            ),
        ];
        let sets = analyze(&rows);
        assert_eq!(sets.implementations["North|2024|A"].program_name, "Robotics");
    }

    #[test]
    fn test_attendance_and_job_field_scan() {
        let rows = vec![
            row(
                2,
                &[
                    ("attendance_w1", "present"),
                    ("modality_attendance_w1", "N/A"),
                    ("job_intern", "done"),
                ],
            ),
            row(
                3,
                &[
                    ("attendance_w1", "absent"),
                    ("modality_attendance_w1", "remote"),
                ],
            ),
        ];
        let sets = analyze(&rows);
        // Sentinel modality on first sighting, real value on second.
        assert_eq!(
            sets.attendance_fields["attendance_w1"],
            Some("remote".to_string())
        );
        assert!(sets.job_fields.contains("job_intern"));
        // Modality columns themselves are not attendance fields.
        assert!(!sets.attendance_fields.contains_key("modality_attendance_w1"));
    }

    #[test]
    fn test_deterministic() {
        let rows = vec![
            row(2, &[("program", "B")]),
            row(3, &[("program", "A")]),
        ];
        let sets = analyze(&rows);
        let names: Vec<_> = sets.program_names.iter().cloned().collect();
        assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
    }
}
