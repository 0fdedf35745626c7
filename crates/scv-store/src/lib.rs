//! # scv-store
//!
//! Durable layer for the SCV server.
//!
//! This crate provides:
//! - `StreamRecord`, `StreamInfo` and `LeaseStats` (the persisted shapes)
//! - JSONL read/write (portable persistence)
//! - `RecordStore` with a JSONL-backed implementation
//! - `BlobStore` with a filesystem-backed implementation for seed files,
//!   frame buffers, and immutable frame/checkpoint slots
//!
//! Nothing here knows about leases or priorities; the scheduling state
//! lives in `scv-core`.
//!
//! ## Data model
//!
//! ```text
//! streams.jsonl (one line per stream)      stats.jsonl (one line per lease)
//!     ↕  open / rewrite                         ↑ append
//! JsonlRecordStore (in-memory projection)
//!
//! <data_dir>/blobs/<stream>/...  ← FsBlobStore
//! ```

pub mod blob;
pub mod error;
pub mod jsonl;
pub mod record;
pub mod records;

pub use blob::{BlobAddress, BlobStore, FsBlobStore, SeedKind, validate_name};
pub use error::StoreError;
pub use jsonl::{
    JsonlError, append_row, read_rows, read_rows_from_path, write_rows, write_rows_to_path,
};
pub use record::{LeaseOutcome, LeaseStats, StreamInfo, StreamRecord};
pub use records::{JsonlRecordStore, RECORDS_FILE, RecordStore, STATS_FILE};
