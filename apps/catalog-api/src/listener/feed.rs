//! Sources of raw change notifications.
//!
//! [`PgFeedConnector`] opens a dedicated PostgreSQL connection and relays
//! `NOTIFY` payloads from it. That connection is never pooled or used for
//! queries. [`MemoryFeedConnector`] is the in-process stand-in used by tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_postgres::{AsyncMessage, Client, NoTls};

use super::ListenerError;

/// Opens notification feeds. One feed per listener attempt.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChangeFeed>, ListenerError>;
}

/// An open connection that delivers notification payloads in arrival order.
/// Dropping it closes the connection.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn listen(&mut self, channel: &str) -> Result<(), ListenerError>;

    async fn unlisten(&mut self, channel: &str) -> Result<(), ListenerError>;

    /// The next payload on any listened channel. `None` once the connection
    /// has ended.
    async fn next_payload(&mut self) -> Option<Result<String, ListenerError>>;
}

// ---------------------------------------------------------------------------
// PostgreSQL implementation
// ---------------------------------------------------------------------------

/// Notifications buffered between the connection driver and the listener.
/// When full the driver stops reading the socket until the listener catches
/// up; the server keeps queueing on its side meanwhile.
const NOTIFICATION_BUFFER: usize = 1024;

pub struct PgFeedConnector {
    database_url: String,
}

impl PgFeedConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl FeedConnector for PgFeedConnector {
    async fn connect(&self) -> Result<Box<dyn ChangeFeed>, ListenerError> {
        let (client, mut connection) = tokio_postgres::connect(&self.database_url, NoTls)
            .await
            .map_err(|e| ListenerError::Connection(e.into()))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);

        // The connection object performs all socket I/O, for queries issued on
        // `client` as well as for asynchronous notifications, so it has to be
        // polled for as long as the feed is alive.
        let messages = stream::poll_fn(move |cx| connection.poll_message(cx)).map(|message| {
            message.map(|message| match message {
                AsyncMessage::Notification(n) => Some(n.payload().to_string()),
                AsyncMessage::Notice(notice) => {
                    tracing::debug!(notice = %notice.message(), "listener connection notice");
                    None
                }
                _ => None,
            })
        });
        let driver = tokio::spawn(forward_notifications(Box::pin(messages), tx));

        let database: String = match client.query_one("SELECT current_database()", &[]).await {
            Ok(row) => row.get(0),
            Err(e) => {
                driver.abort();
                return Err(ListenerError::Connection(e.into()));
            }
        };
        tracing::info!(%database, "listener connection established");

        Ok(Box::new(PgChangeFeed {
            client,
            notifications: rx,
            driver,
        }))
    }
}

struct PgChangeFeed {
    client: Client,
    notifications: mpsc::Receiver<Result<String, tokio_postgres::Error>>,
    driver: JoinHandle<()>,
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn listen(&mut self, channel: &str) -> Result<(), ListenerError> {
        self.client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await
            .map_err(|e| ListenerError::Subscribe {
                channel: channel.to_string(),
                source: e.into(),
            })
    }

    async fn unlisten(&mut self, channel: &str) -> Result<(), ListenerError> {
        self.client
            .batch_execute(&format!("UNLISTEN {}", quote_ident(channel)))
            .await
            .map_err(|e| ListenerError::Channel(e.into()))
    }

    async fn next_payload(&mut self) -> Option<Result<String, ListenerError>> {
        self.notifications
            .recv()
            .await
            .map(|r| r.map_err(|e| ListenerError::Channel(e.into())))
    }
}

impl Drop for PgChangeFeed {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Move payloads from the connection into the bounded buffer, in order.
///
/// Ends after the first connection error (which is forwarded) or once the
/// feed has been dropped.
async fn forward_notifications<S, E>(mut messages: S, tx: mpsc::Sender<Result<String, E>>)
where
    S: Stream<Item = Result<Option<String>, E>> + Unpin,
{
    while let Some(message) = messages.next().await {
        match message {
            Ok(Some(payload)) => {
                if tx.capacity() == 0 {
                    tracing::warn!(
                        buffered = tx.max_capacity(),
                        "notification buffer full, pausing reads"
                    );
                }
                if tx.send(Ok(payload)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Quote a channel name as a PostgreSQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests)
// ---------------------------------------------------------------------------

const MEMORY_FEED_CAPACITY: usize = 256;

/// In-process notification bus with scriptable connect failures.
pub struct MemoryFeedConnector {
    bus: broadcast::Sender<(String, String)>,
    failures_remaining: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryFeedConnector {
    pub fn new() -> Self {
        Self::failing(0)
    }

    /// A connector whose first `failures` connect attempts are refused.
    pub fn failing(failures: usize) -> Self {
        let (bus, _) = broadcast::channel(MEMORY_FEED_CAPACITY);
        Self {
            bus,
            failures_remaining: AtomicUsize::new(failures),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Publish `payload` to every open feed listening on `channel`.
    pub fn notify(&self, channel: &str, payload: &str) {
        let _ = self.bus.send((channel.to_string(), payload.to_string()));
    }

    /// When each connect attempt happened, successful or not.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// Number of feeds currently open.
    pub fn open_feeds(&self) -> usize {
        self.bus.receiver_count()
    }
}

impl Default for MemoryFeedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedConnector for MemoryFeedConnector {
    async fn connect(&self) -> Result<Box<dyn ChangeFeed>, ListenerError> {
        self.attempts.lock().push(Instant::now());

        let refused = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ListenerError::Connection("connection refused".into()));
        }

        Ok(Box::new(MemoryFeed {
            rx: self.bus.subscribe(),
            channels: HashSet::new(),
        }))
    }
}

struct MemoryFeed {
    rx: broadcast::Receiver<(String, String)>,
    channels: HashSet<String>,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn listen(&mut self, channel: &str) -> Result<(), ListenerError> {
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> Result<(), ListenerError> {
        self.channels.remove(channel);
        Ok(())
    }

    async fn next_payload(&mut self) -> Option<Result<String, ListenerError>> {
        loop {
            match self.rx.recv().await {
                Ok((channel, payload)) if self.channels.contains(&channel) => {
                    return Some(Ok(payload));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
