//! Storage capability contract for stowage.
//!
//! Every backend implements the required operations of [`StorageBackend`]
//! (upload, download, open, read, exists, url, delete). Optional behaviour is
//! exposed through separate capability traits ([`StreamingBackend`],
//! [`MovingBackend`], [`BatchDeleteBackend`], [`ClearableBackend`]) that a
//! backend hands out from accessor methods, so callers ask for a
//! [`Capability`] instead of for a concrete type.
//!
//! Backends are registered under symbolic keys (`cache`, `store`, ...) in a
//! [`BackendRegistry`], which resolves their capabilities once at
//! registration time.
//!
//! The [`lint`] module drives any backend through a scripted run and reports
//! every contract violation it finds:
//!
//! ```rust,no_run
//! use blob_store::{lint::{LintAction, Linter}, MemoryBackend};
//!
//! # async fn example() -> Result<(), blob_store::lint::ConformanceViolation> {
//! let backend = MemoryBackend::new();
//! let report = Linter::new(&backend, LintAction::Error, None).run().await?;
//! assert!(report.is_conformant());
//! # Ok(())
//! # }
//! ```

mod backends;
mod config;
mod error;
pub mod lint;
mod registry;
mod source;
mod traits;

pub use backends::{
    file_system::FileSystemBackend,
    memory::MemoryBackend,
    object_storage::ObjectStoreBackend,
};
pub use config::{default_storage_path, StorageConfig};
pub use error::{BlobError, BlobResult};
pub use registry::BackendRegistry;
pub use source::{materialize, spool, Source};
pub use traits::{
    BatchDeleteBackend,
    Capability,
    Chunk,
    ChunkStream,
    ClearableBackend,
    MovingBackend,
    StorageBackend,
    StreamingBackend,
};
