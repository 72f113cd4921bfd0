//! Domain Layer - Core streaming types.
//!
//! Connection lifecycle states and the per-channel handler registry. Nothing
//! here performs I/O.

/// Connection lifecycle states.
pub mod streaming;

/// Handler registry and subscription set tracking.
pub mod subscription;
