//! # Build pipeline
//!
//! `strata_core::ops::indexing` turns the files of every registered package
//! into symbols and references in the store. The pipeline has four parts:
//!
//! - [`discovery`] walks package roots, fingerprints files and enqueues the
//!   ones whose content or routing changed.
//! - [`routing`] maps a relative path to the envelope of steps that runs on it.
//! - [`pool`] supervises long-lived workers that execute envelopes.
//! - [`writer`] is the single path through which results reach the store,
//!   rejecting stale ones.
//!
//! ## Example
//! ```rust,no_run
//! use strata_core::Core;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (core, lock) = Core::open(None).await?;
//! let discovered = core.discover(false).await?;
//! let built = core.build().await?;
//! lock.release().await?;
//! println!("{} enqueued, {} committed", discovered.enqueued, built.committed);
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod envelope;
pub mod pool;
pub mod routing;
pub mod writer;

pub use discovery::{Discovery, DiscoveryError, DiscoveryReport};
pub use envelope::{EnvelopeExecutor, EnvelopeOutput, ScriptExecutor, StepError, WorkerJob};
pub use pool::{PoolConfig, PoolMode, PoolReport, WorkerKind, WorkerPool};
pub use routing::{EnvelopeKind, RoutingError, RoutingTable, Step};
pub use writer::{StoreWriter, WriterError};
