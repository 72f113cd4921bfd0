//! Stream Codec Module
//!
//! Encoding and decoding for Alpaca WebSocket streams.
//!
//! - **Market data**: `MessagePack` codec (`MsgPackCodec`)
//! - **Trade updates**: JSON codec (`JsonCodec`)
//!
//! # Market Data Frames
//!
//! Every binary frame is an array whose elements are maps carrying a `T`
//! discriminator:
//! ```json
//! [{"T":"t","S":"AAPL","p":126.55,...},{"T":"q","S":"MSFT",...}]
//! ```
//! The frame is first read as a dynamic [`rmpv::Value`], each element is
//! routed on its `T` field, and only then decoded into the concrete record
//! type. Elements with an unrecognized `T` are skipped so new server-side
//! message types never break a client.

use chrono::{DateTime, Utc};
use rmpv::Value;

use crate::infrastructure::alpaca::messages::{
    BarMessage, ErrorMessage, QuoteMessage, StreamMessage, SubscriptionMessage, SuccessMessage,
    TradeMessage, TradingMessage,
};

/// `MessagePack` extension type reserved for timestamps.
const TIMESTAMP_EXT: i8 = -1;

/// Codec errors. Each one is scoped to a single frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// `MessagePack` encoding failed.
    #[error("`MessagePack` encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// The frame is not valid `MessagePack`.
    #[error("`MessagePack` decode error: {0}")]
    MsgPackDecode(#[from] rmpv::decode::Error),

    /// An element did not match the shape its `T` promised.
    #[error("`MessagePack` record error: {0}")]
    Record(#[from] rmpv::ext::Error),

    /// Invalid frame layout.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

// =============================================================================
// MessagePack (market data)
// =============================================================================

/// `MessagePack` codec for the market data stream.
#[derive(Debug, Default, Clone)]
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Create a new `MessagePack` codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one binary frame into its records, preserving array order.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a `MessagePack` array of maps or
    /// if a recognized element fails to decode.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<StreamMessage>, CodecError> {
        let mut cursor = data;
        let frame = rmpv::decode::read_value(&mut cursor)?;

        let Value::Array(elements) = frame else {
            return Err(CodecError::InvalidFormat(format!(
                "expected array frame, got {}",
                value_kind(&frame)
            )));
        };

        let mut messages = Vec::with_capacity(elements.len());
        for element in elements {
            if let Some(message) = decode_element(element)? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Encode a value as `MessagePack` with named fields (map format).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }
}

fn decode_element(element: Value) -> Result<Option<StreamMessage>, CodecError> {
    let Value::Map(mut entries) = element else {
        return Err(CodecError::InvalidFormat(format!(
            "expected map element, got {}",
            value_kind(&element)
        )));
    };

    let Some(msg_type) = field(&entries, "T").and_then(Value::as_str).map(str::to_owned) else {
        tracing::trace!("Skipping element without type discriminator");
        return Ok(None);
    };

    normalize_timestamp(&mut entries)?;
    let element = Value::Map(entries);

    let message = match msg_type.as_str() {
        "t" => StreamMessage::Trade(rmpv::ext::from_value::<TradeMessage>(element)?),
        "q" => StreamMessage::Quote(rmpv::ext::from_value::<QuoteMessage>(element)?),
        "b" => StreamMessage::Bar(rmpv::ext::from_value::<BarMessage>(element)?),
        // rmpv rejects unit variants encoded as strings, so acks go through JSON.
        "success" => StreamMessage::Success(serde_json::from_value::<SuccessMessage>(
            serde_json::to_value(&element)?,
        )?),
        "error" => StreamMessage::Error(rmpv::ext::from_value::<ErrorMessage>(element)?),
        "subscription" => {
            StreamMessage::Subscription(rmpv::ext::from_value::<SubscriptionMessage>(element)?)
        }
        other => {
            tracing::trace!(msg_type = %other, "Skipping unknown message type");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

fn field<'a>(entries: &'a [(Value, Value)], name: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| k.as_str() == Some(name))
        .map(|(_, v)| v)
}

/// Rewrite a timestamp extension in `t` as an RFC-3339 string.
fn normalize_timestamp(entries: &mut [(Value, Value)]) -> Result<(), CodecError> {
    for (key, value) in entries.iter_mut() {
        if key.as_str() != Some("t") {
            continue;
        }
        if let Value::Ext(TIMESTAMP_EXT, bytes) = value {
            let timestamp = decode_timestamp_ext(bytes)?;
            *value = Value::from(timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
        }
    }
    Ok(())
}

/// Decode the three `MessagePack` timestamp layouts (32, 64 and 96 bit).
fn decode_timestamp_ext(bytes: &[u8]) -> Result<DateTime<Utc>, CodecError> {
    let (secs, nanos) = match bytes.len() {
        4 => {
            let raw = u32::from_be_bytes(fixed(bytes)?);
            (i64::from(raw), 0)
        }
        8 => {
            let raw = u64::from_be_bytes(fixed(bytes)?);
            let nanos = u32::try_from(raw >> 34).unwrap_or(u32::MAX);
            let secs = i64::try_from(raw & 0x0000_0003_ffff_ffff).unwrap_or(i64::MAX);
            (secs, nanos)
        }
        12 => {
            let nanos = u32::from_be_bytes(fixed(&bytes[..4])?);
            let secs = i64::from_be_bytes(fixed(&bytes[4..])?);
            (secs, nanos)
        }
        other => {
            return Err(CodecError::InvalidFormat(format!(
                "timestamp extension of {other} bytes"
            )));
        }
    };

    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| CodecError::InvalidFormat(format!("timestamp out of range: {secs}s")))
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CodecError> {
    bytes
        .try_into()
        .map_err(|_| CodecError::InvalidFormat(format!("expected {N} timestamp bytes")))
}

const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "extension",
    }
}

// =============================================================================
// JSON (trade updates)
// =============================================================================

/// JSON codec for the trade updates stream.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one trading stream frame.
    ///
    /// The server sends JSON in both text and binary frames. Returns
    /// `Ok(None)` for streams this client does not model.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object with a `stream`
    /// field, or if its `data` does not match the stream's schema.
    pub fn decode(&self, data: &[u8]) -> Result<Option<TradingMessage>, CodecError> {
        let mut value: serde_json::Value = serde_json::from_slice(data)?;

        let stream = value
            .get("stream")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| CodecError::InvalidFormat("missing stream field".to_string()))?;
        let payload = value
            .get_mut("data")
            .map(serde_json::Value::take)
            .unwrap_or_default();

        let message = match stream.as_str() {
            "authorization" => TradingMessage::Authorization(serde_json::from_value(payload)?),
            "listening" => TradingMessage::Listening(serde_json::from_value(payload)?),
            "trade_updates" => TradingMessage::TradeUpdate(Box::new(serde_json::from_value(payload)?)),
            other => {
                tracing::trace!(stream = %other, "Skipping unknown trading stream");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }

    /// Encode a value to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}
