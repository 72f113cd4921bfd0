//! Application Layer - Port definitions.
//!
//! This layer defines how the streaming core talks to the transport without
//! depending on any concrete WebSocket library.

/// Port interfaces for the framed transport.
pub mod ports;
