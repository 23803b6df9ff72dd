//! Static DICOMweb Storage Engine
//!
//! Stores DICOM instances as a denormalized, compressed object layout that
//! can be served by a static file host or an object store, with no database.
//!
//! ## Features
//!
//! - Part 10 parsing with a typed attribute model and DICOM JSON rendering
//! - Bulk data and per-frame splitting into content-addressed objects
//! - Series and study aggregates maintained by compare-and-swap merges
//! - Local filesystem, S3 and in-memory object stores
//! - QIDO-style attribute matching over precomputed aggregates
//! - WADO-style metadata, frame, bulk data and thumbnail retrieval
//! - Offline aggregate rebuild and orphan collection
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Part 10     │────▶│ Attribute    │────▶│ Bulk / Frame │
//! │  upload      │     │ reader       │     │ splitter     │
//! └──────────────┘     └──────────────┘     └──────┬───────┘
//!                                                  │
//!                                                  ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │ Merge engine │◀────│ Projection   │
//!                      │ (CAS loop)   │     │ lattice      │
//!                      └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │ Object store │────▶│ Query / Read │
//!                      │ local/S3/mem │     │ HTTP API     │
//!                      └──────────────┘     └──────────────┘
//! ```

pub mod api;
pub mod attribute;
pub mod bulk;
pub mod codec;
pub mod config;
pub mod layout;
pub mod merge;
pub mod pipeline;
pub mod projection;
pub mod query;
pub mod repair;
pub mod retrieve;
pub mod store;
pub mod thumbnail;

#[cfg(test)]
mod test_support;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use merge::{MergeEngine, MergeError};
pub use pipeline::{IngestError, IngestPipeline, IngestReport, IngestState, StoreError};
pub use query::{QueryFilter, QueryLevel};
pub use repair::Repair;
pub use retrieve::{ReadService, RetrieveError};
pub use store::ObjectStore;
pub use thumbnail::{EncodedFramePassthrough, ThumbnailRenderer};
