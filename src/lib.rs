//! Participant roster synchronization.
//!
//! This crate ingests tabular participant records and synchronizes them
//! into a remote relational backend reachable only through a
//! collection-oriented REST API. The hard part is idempotency without a
//! distributed lock: each logical entity (program, implementation,
//! module, attendance slot, job, site code, participant) is created at
//! most once per run, foreign-key parents are resolved before dependent
//! records are written, and creation races against concurrent writers
//! are recovered with a single re-search.
//!
//! # Architecture
//!
//! - **`source`**: CSV row ingestion with header normalization.
//! - **`api`**: the `Backend` trait and its reqwest implementation;
//!   conflict/not-found/network errors are classified once at this
//!   boundary.
//! - **`cache`**: per-run natural-key → id caches, one per entity type.
//! - **`resolver`**: the get-or-create protocol every entity type uses.
//! - **`reference`**: adaptive site-code cache, preloaded or on-demand
//!   depending on a memory budget.
//! - **`pipeline`**: analysis → precreation → batch dispatch.
//! - **`report`**: row outcomes and the error-collector seam.
//! - **`config`**: all tunables, resolved once at startup.
//!
//! # Data flow
//!
//! raw rows → analysis (unique key sets) → precreation (populate
//! caches) → batch dispatch (per-row outcomes) → aggregate result +
//! error list.

pub mod api;
pub mod cache;
pub mod config;
pub mod pipeline;
pub mod reference;
pub mod report;
pub mod resolver;
pub mod source;

pub use api::{ApiError, Backend, HttpBackend, Record};
pub use cache::{CacheContext, EntityKind, KeyedCache, natural_key};
pub use config::{Environment, ProcessingMode, SyncConfig};
pub use pipeline::SyncPipeline;
pub use reference::{ReferenceDataManager, ReferenceMode};
pub use report::{ErrorSink, MemoryErrorSink, RowError, SyncOutcome};
pub use resolver::{EntityResolver, Resolution};
pub use source::{SourceError, SourceRow, read_rows};
