//! Write-side ingestion engines
//!
//! Everything between an incoming member and the stored index lives here:
//!
//! - [`engine::Ingester`]: batch orchestration, payload dedup, per-stream
//!   writer serialization and post-batch sweeping
//! - [`timestamp::TimeFragmenter`]: time-partitioned placement with k-way
//!   splits and pagination at the span floor
//! - [`bucket::BucketStrategy`]: materialization of externally decided
//!   bucket assignments and navigation edges
//! - [`sweeper::Sweeper`]: one-way sealing of elapsed fragments

pub mod bucket;
pub mod engine;
pub mod error;
pub mod sweeper;
pub mod timestamp;

pub use bucket::{BucketStrategy, BucketUpdate};
pub use engine::{IngestRecord, IngestSummary, Ingester};
pub use error::{IngestError, IngestResult};
pub use sweeper::Sweeper;
pub use timestamp::{InsertOutcome, RejectReason, TimeFragmenter};
