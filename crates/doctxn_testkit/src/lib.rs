//! # doctxn Testkit
//!
//! Test utilities for doctxn.
//!
//! This crate provides:
//! - A fault-injecting store wrapper for crash and conflict scenarios
//! - Fixtures for stores, configs and snapshot files
//! - Property-based generators for staged operation sequences
//! - Concurrent stress helpers
//!
//! The cross-crate integration tests live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use doctxn_testkit::prelude::*;
//!
//! let store = seeded_store(&[("k2", json!({"b": 0}))]);
//! let txns = transactions(&store);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fault;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fault::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fault::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
