//! # weft-core
//!
//! Shared foundations for the weft workflow engine:
//!
//! - **Identifiers**: strongly-typed, ULID-backed IDs for runs and artifacts
//! - **Configuration**: layered engine configuration (defaults, `weft.toml`,
//!   `WEFT_*` environment overrides) with process-wide memoization
//! - **Fingerprinting**: stable content hashing used for cache keys
//!
//! This crate carries no engine logic; it exists so that the engine core and
//! its collaborators (CLI, connectors) agree on identity, configuration, and
//! hashing without depending on each other.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod id;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use id::{ArtifactId, RunId};
