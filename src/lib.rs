// Library interface for the respool worker-pool supervisor
// This allows embedders and integration tests to access the core modules

pub mod backoff;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod master;
pub mod procline;
pub mod registry;
pub mod signals;
pub mod waker;
pub mod worker;

pub use config::{ConfigLoader, FileConfigLoader, MemoryConfigLoader, PoolOptions, QueueCounts};
pub use error::PoolError;
pub use master::Master;
pub use worker::{ExecWorker, QueueWorker, WorkerHandle};
