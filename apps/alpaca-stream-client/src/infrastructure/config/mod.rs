//! Configuration Module
//!
//! Configuration loading for the stream client.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_STREAM_URL, DataFeed, Environment, StreamConfig, parse_symbols,
    stream_endpoint,
};
