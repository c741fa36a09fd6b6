//! Persistence of readings and alerts
//!
//! ## Backends
//!
//! - **SQLite** (default, feature `storage-sqlite`): embedded database shared
//!   with the configuration layer
//! - **In-Memory**: no persistence, for tests and local runs
//!
//! ## Usage
//!
//! ```no_run
//! use sensor_pipeline::storage::{ReadingStore, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./sensors.db").await?;
//!     let stats = backend.get_stats().await?;
//!     println!("{} readings stored", stats.readings);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, ReadingStore, StoreStats};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
