//! Subscription Manager
//!
//! Keeps the wire subscription in step with the handler registry. Every
//! operation writes to the connection and mutates the registry in an order
//! that leaves the registry equal to what the server was told:
//!
//! - subscribe: write first, register only after the write succeeded
//! - unsubscribe: unregister first, write, and restore on write failure
//! - resubscribe: one frame covering the whole registry

use std::sync::Arc;

use super::connection::{Connection, WriteError};
use super::messages::{BarMessage, QuoteMessage, SubscriptionRequest, TradeMessage};
use crate::domain::subscription::{
    Channel, Handler, HandlerMap, HandlerRegistry, Symbol, SubscriptionSet, WILDCARD,
};
use crate::infrastructure::metrics;

/// Registry keyed by the market data record types.
pub type MarketDataRegistry = HandlerRegistry<TradeMessage, QuoteMessage, BarMessage>;

/// Applies subscribe/unsubscribe requests to a connection and the registry.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    registry: Arc<MarketDataRegistry>,
}

impl SubscriptionManager {
    /// Create a manager over an existing registry.
    #[must_use]
    pub const fn new(registry: Arc<MarketDataRegistry>) -> Self {
        Self { registry }
    }

    /// The handler registry.
    #[must_use]
    pub fn registry(&self) -> &MarketDataRegistry {
        &self.registry
    }

    /// The registry's current key sets.
    #[must_use]
    pub fn desired_subscription_set(&self) -> SubscriptionSet {
        self.registry.desired_set()
    }

    /// Subscribe `symbols` on one channel and install `handler` for them.
    ///
    /// The wildcard is registered locally but never sent.
    ///
    /// # Errors
    ///
    /// Returns the write error; nothing is registered in that case.
    pub async fn subscribe<T>(
        &self,
        connection: &Connection,
        handlers: &HandlerMap<T>,
        symbols: &[Symbol],
        handler: Handler<T>,
    ) -> Result<(), WriteError> {
        let channel = handlers.channel();
        let wire = wire_symbols(symbols.iter());

        if !wire.is_empty() {
            connection
                .write_message(&request(SubscriptionRequest::subscribe(), channel, wire))
                .await?;
        }

        handlers.register(symbols, &handler);
        metrics::set_active_subscriptions(channel, handlers.len());
        tracing::debug!(channel = %channel, symbols = ?symbols, "Subscribed");
        Ok(())
    }

    /// Remove the handlers for `symbols` and unsubscribe those that existed.
    ///
    /// # Errors
    ///
    /// Returns the write error; the removed handlers are restored first.
    pub async fn unsubscribe<T>(
        &self,
        connection: &Connection,
        handlers: &HandlerMap<T>,
        symbols: &[Symbol],
    ) -> Result<(), WriteError> {
        let channel = handlers.channel();
        let removed = handlers.unregister(symbols);
        let wire = wire_symbols(removed.iter().map(|(symbol, _)| symbol));

        if !wire.is_empty()
            && let Err(e) = connection
                .write_message(&request(SubscriptionRequest::unsubscribe(), channel, wire))
                .await
        {
            handlers.restore(removed);
            return Err(e);
        }

        metrics::set_active_subscriptions(channel, handlers.len());
        tracing::debug!(channel = %channel, symbols = ?symbols, "Unsubscribed");
        Ok(())
    }

    /// Send one subscribe frame covering the whole registry.
    ///
    /// Skipped when the registry holds no wire symbols.
    ///
    /// # Errors
    ///
    /// Returns the write error.
    pub async fn resubscribe(&self, connection: &Connection) -> Result<(), WriteError> {
        let desired = self.desired_subscription_set();
        let request = SubscriptionRequest::resubscribe(&desired);
        if request.is_empty() {
            return Ok(());
        }

        connection.write_message(&request).await?;
        tracing::info!(
            trades = request.trades.len(),
            quotes = request.quotes.len(),
            bars = request.bars.len(),
            "Resubscribed"
        );
        Ok(())
    }
}

fn wire_symbols<'a>(symbols: impl Iterator<Item = &'a Symbol>) -> Vec<Symbol> {
    symbols.filter(|s| s.as_str() != WILDCARD).cloned().collect()
}

fn request(base: SubscriptionRequest, channel: Channel, symbols: Vec<Symbol>) -> SubscriptionRequest {
    match channel {
        Channel::Trades => base.with_trades(symbols),
        Channel::Quotes => base.with_quotes(symbols),
        Channel::Bars => base.with_bars(symbols),
    }
}
