//! Remote backend contract.
//!
//! The backend is a collection-oriented REST API: one collection per
//! entity type, with bounded single-match search, bulk paginated reads,
//! and JSON creation. The [`Backend`] trait is the seam between the
//! pipeline and the wire: production uses [`HttpBackend`], tests use
//! in-memory fakes.

pub mod client;
pub mod error;

pub use client::HttpBackend;
pub use error::ApiError;

use serde::Deserialize;
use std::future::Future;

/// One record from the backend. Creation responses and search hits both
/// have the shape `{ "id": N, ...attributes }`.
#[derive(Debug, Clone, Deserialize)]
pub struct Record {
    pub id: i64,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn attr_str(&self, field: &str) -> Option<&str> {
        self.attributes.get(field).and_then(|v| v.as_str())
    }
}

/// Collection-oriented backend operations.
///
/// Futures are `Send` so parallel batch dispatch can fan them out.
pub trait Backend: Send + Sync {
    /// Bounded single-match search: equality filters, page size 1.
    /// `Ok(None)` means "no match", which is not an error.
    fn find_first(
        &self,
        collection: &str,
        filters: &[(&str, &str)],
    ) -> impl Future<Output = Result<Option<Record>, ApiError>> + Send;

    /// One page of a bulk read, requesting only the named fields.
    /// An empty page marks the end of the collection.
    fn find_page(
        &self,
        collection: &str,
        page: u32,
        page_size: u32,
        fields: &[&str],
    ) -> impl Future<Output = Result<Vec<Record>, ApiError>> + Send;

    /// Create a record. A duplicate-key violation surfaces as
    /// [`ApiError::Conflict`].
    fn create(
        &self,
        collection: &str,
        data: serde_json::Value,
    ) -> impl Future<Output = Result<Record, ApiError>> + Send;
}
