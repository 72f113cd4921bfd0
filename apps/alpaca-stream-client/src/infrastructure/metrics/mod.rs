//! Prometheus Metrics Module
//!
//! Exposes stream client metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Frames received per stream, decode failures
//! - **Dispatch**: Records delivered per channel, records with no handler
//! - **Connections**: Reconnects per stream
//! - **Subscriptions**: Active handler keys per channel
//!
//! # Integration
//!
//! Recording is a no-op until a recorder is installed. The binary installs
//! one with an HTTP listener serving `/metrics`.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::subscription::Channel;

// =============================================================================
// Exporter
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `addr`.
///
/// Calling this again after a successful install is a no-op.
///
/// # Errors
///
/// Returns an error if the recorder or listener cannot be installed.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    register_metrics();

    let _ = INSTALLED.set(addr);
    tracing::info!(addr = %addr, "Metrics listener started");
    Ok(())
}

/// Address of the installed listener, if any.
#[must_use]
pub fn metrics_addr() -> Option<SocketAddr> {
    INSTALLED.get().copied()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "alpaca_stream_frames_received_total",
        "Total frames received per stream"
    );
    describe_counter!(
        "alpaca_stream_records_dispatched_total",
        "Total records delivered to handlers"
    );
    describe_counter!(
        "alpaca_stream_decode_errors_total",
        "Total frames that failed to decode"
    );
    describe_counter!(
        "alpaca_stream_missing_handlers_total",
        "Total records dropped for lack of a handler"
    );
    describe_counter!(
        "alpaca_stream_reconnects_total",
        "Total reconnections after connection loss"
    );
    describe_gauge!(
        "alpaca_stream_active_subscriptions",
        "Handler keys registered per channel"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for stream types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `MessagePack` market data stream.
    MarketData,
    /// JSON trade updates stream.
    TradeUpdates,
}

impl StreamKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::TradeUpdates => "trade_updates",
        }
    }
}

/// Record one frame read from a stream.
pub fn record_frame_received(stream: StreamKind) {
    counter!(
        "alpaca_stream_frames_received_total",
        "stream" => stream.as_str()
    )
    .increment(1);
}

/// Record a record delivered to a handler.
pub fn record_dispatched(channel: Channel) {
    counter!(
        "alpaca_stream_records_dispatched_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a frame that failed to decode.
pub fn record_decode_error(stream: StreamKind) {
    counter!(
        "alpaca_stream_decode_errors_total",
        "stream" => stream.as_str()
    )
    .increment(1);
}

/// Record a record with no handler for its symbol.
pub fn record_missing_handler(channel: Channel) {
    counter!(
        "alpaca_stream_missing_handlers_total",
        "channel" => channel.as_str()
    )
    .increment(1);
}

/// Record a reconnection.
pub fn record_reconnect(stream: StreamKind) {
    counter!(
        "alpaca_stream_reconnects_total",
        "stream" => stream.as_str()
    )
    .increment(1);
}

/// Update the handler key count for a channel.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(channel: Channel, count: usize) {
    gauge!(
        "alpaca_stream_active_subscriptions",
        "channel" => channel.as_str()
    )
    .set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_kind_as_str() {
        assert_eq!(StreamKind::MarketData.as_str(), "market_data");
        assert_eq!(StreamKind::TradeUpdates.as_str(), "trade_updates");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received(StreamKind::MarketData);
        record_dispatched(Channel::Trades);
        record_decode_error(StreamKind::TradeUpdates);
        record_missing_handler(Channel::Bars);
        record_reconnect(StreamKind::MarketData);
        set_active_subscriptions(Channel::Quotes, 3);
        assert!(metrics_addr().is_none());
    }
}
