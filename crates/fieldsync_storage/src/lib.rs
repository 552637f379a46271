//! # FieldSync Storage
//!
//! Byte-store backends underneath the FieldSync offline journal.
//!
//! Backends are **opaque**: they append, read back and truncate bytes and
//! know nothing about records, queue items or journal framing. The
//! `fieldsync_store` crate owns every format decision.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and throwaway stores
//! - [`FileBackend`] - the on-device journal file
//!
//! ## Example
//!
//! ```rust
//! use fieldsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"entry").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"entry");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
