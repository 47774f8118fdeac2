//! Change listener: turns database notifications into realtime broadcasts.

pub mod event;
pub mod feed;
pub mod supervisor;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time;

use crate::db::store::CatalogStore;
use crate::gateway::events::OutboundMessage;
use crate::gateway::registry::ConnectionRegistry;

use event::{tables, ChangeEvent, Operation};
use feed::{ChangeFeed, FeedConnector};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bound on the UNLISTEN round-trip during `stop()`, so a half-open
/// connection cannot hold up shutdown.
const UNLISTEN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to connect to the database: {0}")]
    Connection(#[source] BoxError),
    #[error("failed to subscribe to channel '{channel}': {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: BoxError,
    },
    #[error("notification channel failed: {0}")]
    Channel(#[source] BoxError),
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("listener is not connected")]
    NotConnected,
}

/// Connection and subscription status of the listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerState {
    pub connected: bool,
    pub subscribed: bool,
}

/// Why an event did not produce a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload was not a valid change event.
    Malformed,
    /// Table or operation has no broadcast.
    Ignored,
    /// Row image carried no usable `id`.
    MissingId,
    /// Re-fetch found no row (deleted, or not yet visible).
    NotFound,
    /// Re-fetch failed.
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Broadcast { recipients: usize },
    Dropped(DropReason),
}

pub struct ChangeListener {
    connector: Arc<dyn FeedConnector>,
    store: Arc<dyn CatalogStore>,
    connections: Arc<ConnectionRegistry>,
    feed: Option<Box<dyn ChangeFeed>>,
    channel: Option<String>,
    state: ListenerState,
}

impl ChangeListener {
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        store: Arc<dyn CatalogStore>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            connector,
            store,
            connections,
            feed: None,
            channel: None,
            state: ListenerState::default(),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Open the dedicated notification connection, replacing any previous one.
    pub async fn connect(&mut self) -> Result<(), ListenerError> {
        self.stop().await;

        let feed = self.connector.connect().await?;
        self.feed = Some(feed);
        self.state.connected = true;
        Ok(())
    }

    pub async fn subscribe(&mut self, channel: &str) -> Result<(), ListenerError> {
        let feed = self.feed.as_mut().ok_or(ListenerError::NotConnected)?;
        feed.listen(channel).await?;

        self.channel = Some(channel.to_string());
        self.state.subscribed = true;
        tracing::info!(%channel, "listening for change notifications");
        Ok(())
    }

    /// Consume notifications in arrival order until the feed fails.
    pub async fn run(&mut self) -> Result<Infallible, ListenerError> {
        loop {
            let feed = self.feed.as_mut().ok_or(ListenerError::NotConnected)?;
            match feed.next_payload().await {
                Some(Ok(payload)) => {
                    self.on_event(&payload).await;
                }
                Some(Err(e)) => return Err(e),
                None => return Err(ListenerError::ChannelClosed),
            }
        }
    }

    /// Unsubscribe and close the dedicated connection. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            if let Some(channel) = self.channel.take() {
                match time::timeout(UNLISTEN_TIMEOUT, feed.unlisten(&channel)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(error = %e, "unlisten failed"),
                    Err(_) => tracing::debug!("unlisten timed out"),
                }
            }
            tracing::info!("listener connection closed");
        }
        self.channel = None;
        self.state = ListenerState::default();
    }

    /// Handle one raw notification payload.
    ///
    /// Never fails: anything that cannot be turned into a broadcast is logged
    /// and dropped.
    pub async fn on_event(&self, payload: &str) -> EventOutcome {
        let event = match ChangeEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed change event");
                return EventOutcome::Dropped(DropReason::Malformed);
            }
        };

        let lag_ms = event
            .observed_at()
            .map(|at| (Utc::now() - at).num_milliseconds());
        tracing::debug!(
            table = %event.table,
            operation = event.operation.as_str(),
            id = ?event.entity_id(),
            ?lag_ms,
            "change event received"
        );

        match (event.table.as_str(), event.operation) {
            (_, Operation::Delete) => EventOutcome::Dropped(DropReason::Ignored),
            (tables::PRODUCT_VARIANTS, _) => self.relay_variant(&event).await,
            (tables::PRODUCTS, _) => {
                tracing::info!(id = ?event.entity_id(), "product changed, no broadcast for products");
                EventOutcome::Dropped(DropReason::Ignored)
            }
            _ => EventOutcome::Dropped(DropReason::Ignored),
        }
    }

    async fn relay_variant(&self, event: &ChangeEvent) -> EventOutcome {
        let Some(variant_id) = event.entity_id() else {
            tracing::warn!(table = %event.table, "change event without variant id");
            return EventOutcome::Dropped(DropReason::MissingId);
        };

        let detail = match self.store.variant_detail(variant_id).await {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                tracing::warn!(variant_id, "variant not found on re-fetch");
                return EventOutcome::Dropped(DropReason::NotFound);
            }
            Err(e) => {
                tracing::error!(variant_id, error = %e, "failed to re-fetch variant");
                return EventOutcome::Dropped(DropReason::Store);
            }
        };

        tracing::info!(
            variant_id,
            product = %detail.product.base_name,
            region = %detail.region.name_nominative,
            price = %detail.variant.price,
            listeners = self.connections.count(),
            "relaying variant update"
        );

        let message = OutboundMessage::entity_update(detail.into());
        let recipients = self.connections.broadcast(&message);
        EventOutcome::Broadcast { recipients }
    }
}
