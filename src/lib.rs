//! # Fragtree
//!
//! A streaming fragmentation index for linked data event streams: members
//! arrive one by one and are placed into a self-balancing tree of
//! time-partitioned fragments connected by hypermedia navigation relations.
//!
//! ## Features
//!
//! - **Time-partitioned placement**: per-year roots, k-way splits, pagination
//!   once the window span reaches the configured floor
//! - **Hypermedia navigation**: greater-than-or-equal / less-than relations
//!   on every split, untyped continuations between pages
//! - **Immutability sweeping**: fragments whose range has fully elapsed are
//!   sealed so consumers can cache them forever
//! - **Pluggable storage**: a narrow async `Repository` contract with
//!   embedded in-memory and SQLite backends
//! - **Bucket fallback**: members with externally decided bucket assignments
//!   bypass the temporal engine
//!
//! ## Modules
//!
//! - [`model`]: member records, fragments, time windows, relations
//! - [`ingest`]: the write-side engines (batch orchestration, time
//!   partitioning, bucket materialization, sweeping)
//! - [`repository`]: the storage contract and the embedded backends
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fragtree::{FragmentationConfig, IngestRecord, Ingester};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repository = fragtree::repository::open("memory://")?;
//!     let ingester = Ingester::new(repository, FragmentationConfig::default()).await?;
//!
//!     // Streams with a registered timestamp property get temporal placement
//!     let path = "http://www.w3.org/ns/sosa/resultTime";
//!     ingester.register_stream("https://example.org/sensors", path).await?;
//!
//!     let summary = ingester
//!         .ingest(vec![IngestRecord::new(
//!             "https://example.org/sensors",
//!             "https://example.org/obs/1",
//!             "<serialized member>",
//!         )
//!         .timestamp(1_709_251_200_000)])
//!         .await?;
//!
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ingest;
pub mod model;
pub mod repository;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError, DatabaseConfig, FragmentationConfig, LoggingConfig};

pub use model::{Fragment, MemberRecord, Relation, RelationType, TimeWindow};

pub use ingest::{
    BucketStrategy, BucketUpdate, IngestError, IngestRecord, IngestResult, IngestSummary,
    Ingester, InsertOutcome, RejectReason, Sweeper, TimeFragmenter,
};

pub use repository::{
    FragmentPatch, IndexMutation, MemoryRepository, RepoResult, Repository, RepositoryError,
    SqliteRepository,
};

/// Initialize the global tracing subscriber from a [`LoggingConfig`].
///
/// `RUST_LOG` wins over the configured level when set. Call once at startup.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
