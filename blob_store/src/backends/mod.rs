//! Backend implementations.

pub mod file_system;
pub mod memory;
pub mod object_storage;

/// Size of the chunks handed out by streaming reads.
pub(crate) const CHUNK_SIZE: usize = 16 * 1024;
