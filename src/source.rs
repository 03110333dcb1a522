//! Source-row input: CSV reading and header normalization.
//!
//! Source files arrive with human-edited headers (mixed case, accents,
//! stray punctuation). All downstream field-name matching assumes
//! normalized names, so headers are canonicalized exactly once at read
//! time: lowercased, diacritics folded to ASCII, runs of
//! non-alphanumerics collapsed to a single underscore, leading and
//! trailing underscores trimmed.
//!
//! Examples:
//! - `"Año Escolar"` → `"ano_escolar"`
//! - `"  E-mail (principal) "` → `"e_mail_principal"`
//!
//! Normalization is idempotent: applying it to an already-normalized
//! name is a no-op.
//!
//! How the file bytes get here (local path vs. object storage) is the
//! caller's concern; this module only consumes an `io::Read`.

use std::collections::HashMap;
use std::io::Read;
use thiserror::Error;

/// Errors reading the primary source stream. These are fatal: no rows
/// can be processed without a readable source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read source stream: {0}")]
    Csv(#[from] csv::Error),
    #[error("source stream has no usable header row")]
    MissingHeader,
    #[error("source stream has a header but no data rows")]
    Empty,
}

/// One data row with normalized field names.
///
/// `number` is the 1-based position in the original file counting the
/// header, so the first data row is row 2. Error reports use this
/// number so failures can be found in the source spreadsheet.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub number: usize,
    fields: HashMap<String, String>,
}

impl SourceRow {
    #[cfg(test)]
    pub fn from_pairs(number: usize, pairs: &[(&str, &str)]) -> Self {
        let fields = pairs
            .iter()
            .map(|(k, v)| (normalize_header(k), v.to_string()))
            .collect();
        Self { number, fields }
    }

    /// Returns the trimmed value for a normalized field name, or `None`
    /// when the field is missing or blank.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// All normalized field names present in this row.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }
}

/// Sentinel test shared by every consumer of row values: blank cells
/// and the "not applicable" spellings all mean "no value".
pub fn is_not_applicable(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    v.is_empty() || matches!(v.as_str(), "na" | "n/a" | "not applicable" | "not_applicable")
}

/// Canonicalize a header name. See the module docs for the rules.
pub fn normalize_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.chars().flat_map(|c| c.to_lowercase()) {
        let c = fold_diacritic(c);
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Fold common Latin diacritics to their ASCII base letter. Input is
/// already lowercased.
fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

/// Read every data row from a CSV stream, normalizing headers.
///
/// Columns whose header normalizes to the empty string are dropped.
/// An unreadable stream, a useless header row, or a file with no data
/// rows is a hard error; there is nothing to sync without rows.
pub fn read_rows<R: Read>(input: R) -> Result<Vec<SourceRow>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(SourceError::MissingHeader);
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let mut fields = HashMap::with_capacity(headers.len());
        for (header, value) in headers.iter().zip(record.iter()) {
            if !header.is_empty() {
                fields.insert(header.clone(), value.to_string());
            }
        }
        rows.push(SourceRow {
            number: idx + 2,
            fields,
        });
    }

    if rows.is_empty() {
        return Err(SourceError::Empty);
    }

    log::debug!("source: read {} rows, {} columns", rows.len(), headers.len());
    Ok(rows)
}
