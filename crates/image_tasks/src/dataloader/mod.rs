//! Batching a stage's dataset for the model.
//!
//! ```text
//!   InputDataset (sized or stream)
//!        │ sampler order / stream order
//!        ↓
//!   DataLoader ←── DataLoaderConfig (batch_size, workers, seed, ...)
//!        │ batch tasks, round-robin
//!        ↓
//!   [Worker Threads] load samples, run the StagePipeline
//!        │
//!        ↓
//!   MiniBatch (reordered to sampler order)
//! ```
//!
//! ```text
//! src/dataloader/
//! ├── mod.rs         # Public API exports
//! ├── config.rs      # DataLoaderConfig and builder
//! ├── loader.rs      # DataLoader and its epoch iterator
//! ├── workers/
//! │   ├── mod.rs     # Worker tasks and batch processing
//! │   └── pool.rs    # WorkerPool with per-worker channels
//! └── common/
//!     └── thread.rs  # Thread-local worker ID and RNG
//! ```
//!
//! ```ignore
//! let config = DataLoaderConfig::builder()
//!     .batch_size(32)
//!     .num_workers(4)
//!     .seed(42)
//!     .build();
//! let loader = DataLoader::new(dataset, pipeline, config)?;
//! for batch in loader.iter()? {
//!     let batch = batch?;
//! }
//! ```
//!
//! Memory: single-threaded O(batch_size); with workers
//! O(num_workers x prefetch_factor x batch_size).

mod common;
mod config;
mod loader;
mod workers;

pub use common::thread::{current_worker_id, init_worker_rng, worker_gen_bool, WORKER_ID, WORKER_RNG};
pub use config::{DataLoaderConfig, DataLoaderConfigBuilder};
pub use loader::{DataLoader, DataLoaderIter};
