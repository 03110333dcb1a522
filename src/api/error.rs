//! Backend error taxonomy.
//!
//! The backend signals a duplicate-key violation with an error payload
//! whose message contains a "unique" constraint phrase. That free text
//! is classified exactly once, at the HTTP boundary in
//! [`crate::api::client`]; everything above it matches on
//! [`ApiError::Conflict`] and never parses message strings.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// A concurrent creator won the race for the same logical entity.
    #[error("uniqueness conflict on {collection}: {message}")]
    Conflict { collection: String, message: String },
    #[error("backend HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }
}
