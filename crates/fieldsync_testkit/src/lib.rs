//! # FieldSync Testkit
//!
//! Test utilities for FieldSync.
//!
//! This crate provides:
//! - Store and engine fixtures with a manual clock
//! - Fault-injecting storage backends for crash and failure tests
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs_a_form() {
//!     let fx = TestEngine::new();
//!     fx.store().create_form(sample_form("tenant-a")).unwrap();
//!     assert_eq!(fx.engine.sync_all().await.unwrap().synced, 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
