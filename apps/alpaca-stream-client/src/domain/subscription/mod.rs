//! Handler Registry
//!
//! Per-channel mapping from symbol to application callback. The registry's
//! key sets *are* the desired subscription state of a stream session: there
//! is no second copy of "what we are subscribed to" that could drift.
//!
//! # Design
//!
//! The registry tracks:
//! - One independent map per channel (trades, quotes, bars)
//! - At most one handler per `(channel, symbol)`; re-registering overwrites
//! - An optional wildcard entry (`"*"`) per channel used as a dispatch
//!   fallback for symbols without a specific handler
//!
//! Each map sits behind its own reader/writer lock: dispatches on the read
//! loop take the read side and may run in parallel with each other, while
//! register/unregister from caller tasks take the write side. A callback runs
//! under the read side, so once `unregister` returns the removed handler is
//! neither running nor reachable.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

// =============================================================================
// Types
// =============================================================================

/// A symbol string (stock ticker).
pub type Symbol = String;

/// Application callback invoked with one decoded record.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Key that matches any symbol without a specific handler.
pub const WILDCARD: &str = "*";

/// Market data channel (message category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Trade prints.
    Trades,
    /// Top-of-book quotes.
    Quotes,
    /// Minute bars.
    Bars,
}

impl Channel {
    /// Get all channels.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Trades, Self::Quotes, Self::Bars]
    }

    /// Get the channel name as used in subscribe frames.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Quotes => "quotes",
            Self::Bars => "bars",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch failures. Always scoped to a single record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Neither the symbol nor the wildcard has a handler.
    #[error("no {channel} handler registered for {symbol}")]
    MissingHandler {
        /// Channel the record arrived on.
        channel: Channel,
        /// Record symbol.
        symbol: Symbol,
    },
}

// =============================================================================
// Subscription Set
// =============================================================================

/// Snapshot of the desired subscriptions, one sorted set per channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    /// Trade symbols.
    pub trades: BTreeSet<Symbol>,
    /// Quote symbols.
    pub quotes: BTreeSet<Symbol>,
    /// Bar symbols.
    pub bars: BTreeSet<Symbol>,
}

impl SubscriptionSet {
    /// Check if no channel has any key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty() && self.quotes.is_empty() && self.bars.is_empty()
    }

    /// Get the symbols for a channel.
    #[must_use]
    pub const fn get(&self, channel: Channel) -> &BTreeSet<Symbol> {
        match channel {
            Channel::Trades => &self.trades,
            Channel::Quotes => &self.quotes,
            Channel::Bars => &self.bars,
        }
    }

    /// Symbols for a channel that belong on the wire (wildcard excluded).
    #[must_use]
    pub fn wire_symbols(&self, channel: Channel) -> Vec<Symbol> {
        self.get(channel)
            .iter()
            .filter(|s| s.as_str() != WILDCARD)
            .cloned()
            .collect()
    }

    /// Check if any channel has a symbol that belongs on the wire.
    #[must_use]
    pub fn has_wire_symbols(&self) -> bool {
        Channel::all()
            .iter()
            .any(|c| self.get(*c).iter().any(|s| s != WILDCARD))
    }

    /// Total number of keys across channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trades.len() + self.quotes.len() + self.bars.len()
    }
}

// =============================================================================
// Handler Map (per channel)
// =============================================================================

/// Symbol to handler map for one channel.
pub struct HandlerMap<T> {
    channel: Channel,
    handlers: RwLock<HashMap<Symbol, Handler<T>>>,
}

impl<T> std::fmt::Debug for HandlerMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMap")
            .field("channel", &self.channel)
            .field("symbols", &self.symbols())
            .finish()
    }
}

impl<T> HandlerMap<T> {
    /// Create an empty map for a channel.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Channel this map serves.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Install `handler` for every symbol, replacing existing entries.
    pub fn register(&self, symbols: &[Symbol], handler: &Handler<T>) {
        let mut handlers = self.handlers.write();
        for symbol in symbols {
            handlers.insert(symbol.clone(), Arc::clone(handler));
        }
    }

    /// Remove the handlers for `symbols`.
    ///
    /// Returns the removed entries so a failed unsubscribe can put them back.
    pub fn unregister(&self, symbols: &[Symbol]) -> Vec<(Symbol, Handler<T>)> {
        let mut handlers = self.handlers.write();
        symbols
            .iter()
            .filter_map(|symbol| handlers.remove_entry(symbol))
            .collect()
    }

    /// Reinstall entries previously returned by [`Self::unregister`].
    ///
    /// Entries registered again in the meantime are left alone.
    pub fn restore(&self, entries: Vec<(Symbol, Handler<T>)>) {
        let mut handlers = self.handlers.write();
        for (symbol, handler) in entries {
            handlers.entry(symbol).or_insert(handler);
        }
    }

    /// Current keys, sorted.
    #[must_use]
    pub fn symbols(&self) -> BTreeSet<Symbol> {
        self.handlers.read_recursive().keys().cloned().collect()
    }

    /// Check if a handler is installed under exactly this key.
    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.handlers.read_recursive().contains_key(symbol)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read_recursive().len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read_recursive().is_empty()
    }

    /// Resolve the handler for a symbol: exact match first, then wildcard.
    #[must_use]
    pub fn lookup(&self, symbol: &str) -> Option<Handler<T>> {
        let handlers = self.handlers.read_recursive();
        resolve(&handlers, symbol).map(Arc::clone)
    }

    /// Deliver a record to its handler.
    ///
    /// The callback runs while the read side is held, so `register` and
    /// `unregister` on this channel wait for it to return. A callback may
    /// read this map, but must not change it synchronously; spawn a task to
    /// subscribe or unsubscribe from inside a handler.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::MissingHandler`] if neither the symbol nor
    /// the wildcard is registered.
    pub fn dispatch(&self, symbol: &str, record: T) -> Result<(), DispatchError> {
        let handlers = self.handlers.read_recursive();
        let handler = resolve(&handlers, symbol).ok_or_else(|| DispatchError::MissingHandler {
            channel: self.channel,
            symbol: symbol.to_string(),
        })?;
        handler(record);
        Ok(())
    }
}

fn resolve<'a, T>(handlers: &'a HashMap<Symbol, Handler<T>>, symbol: &str) -> Option<&'a Handler<T>> {
    handlers.get(symbol).or_else(|| handlers.get(WILDCARD))
}

// =============================================================================
// Handler Registry
// =============================================================================

/// Handlers for all three channels.
///
/// Generic over the record type of each channel so the domain layer stays
/// independent of the wire types.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use alpaca_stream_client::domain::subscription::{Channel, Handler, HandlerRegistry};
///
/// let registry: HandlerRegistry<u32, u32, u32> = HandlerRegistry::new();
/// let handler: Handler<u32> = Arc::new(|_| {});
///
/// registry.trades().register(&["AAPL".to_string()], &handler);
/// registry.trades().register(&["*".to_string()], &handler);
///
/// let desired = registry.desired_set();
/// assert!(desired.get(Channel::Trades).contains("AAPL"));
/// assert_eq!(desired.wire_symbols(Channel::Trades), vec!["AAPL".to_string()]);
/// ```
#[derive(Debug)]
pub struct HandlerRegistry<T, Q, B> {
    trades: HandlerMap<T>,
    quotes: HandlerMap<Q>,
    bars: HandlerMap<B>,
}

impl<T, Q, B> Default for HandlerRegistry<T, Q, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, Q, B> HandlerRegistry<T, Q, B> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trades: HandlerMap::new(Channel::Trades),
            quotes: HandlerMap::new(Channel::Quotes),
            bars: HandlerMap::new(Channel::Bars),
        }
    }

    /// Trade handlers.
    #[must_use]
    pub const fn trades(&self) -> &HandlerMap<T> {
        &self.trades
    }

    /// Quote handlers.
    #[must_use]
    pub const fn quotes(&self) -> &HandlerMap<Q> {
        &self.quotes
    }

    /// Bar handlers.
    #[must_use]
    pub const fn bars(&self) -> &HandlerMap<B> {
        &self.bars
    }

    /// Keys for one channel.
    #[must_use]
    pub fn symbols(&self, channel: Channel) -> BTreeSet<Symbol> {
        match channel {
            Channel::Trades => self.trades.symbols(),
            Channel::Quotes => self.quotes.symbols(),
            Channel::Bars => self.bars.symbols(),
        }
    }

    /// The desired subscription set: exactly the current key sets.
    #[must_use]
    pub fn desired_set(&self) -> SubscriptionSet {
        SubscriptionSet {
            trades: self.trades.symbols(),
            quotes: self.quotes.symbols(),
            bars: self.bars.symbols(),
        }
    }
}

/// Deduplicate symbols while keeping first-seen order.
#[must_use]
pub fn dedup_symbols<S: AsRef<str>>(symbols: &[S]) -> Vec<Symbol> {
    let mut seen = BTreeSet::new();
    symbols
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| seen.insert(*s))
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
