//! Keeps a [`ChangeListener`] connected and subscribed for the life of the
//! process.

use std::time::Duration;

use catalog_common::id::{prefix, prefixed_ulid};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use utoipa::ToSchema;

use super::{ChangeListener, ListenerError};

/// Fixed pause between a failed attempt and the next one.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What the supervised listener is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ListenerPhase {
    Disconnected,
    Connecting,
    Subscribed,
}

pub struct Supervisor;

impl Supervisor {
    /// Start supervising `listener` on `channel` in a background task.
    pub fn spawn(listener: ChangeListener, channel: impl Into<String>) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(ListenerPhase::Disconnected);

        let task = tokio::spawn(supervise(listener, channel.into(), shutdown_rx, phase_tx));

        SupervisorHandle {
            shutdown: shutdown_tx,
            phase: phase_rx,
            task,
        }
    }
}

pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    phase: watch::Receiver<ListenerPhase>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// A receiver that observes every phase change.
    pub fn phase(&self) -> watch::Receiver<ListenerPhase> {
        self.phase.clone()
    }

    pub fn current_phase(&self) -> ListenerPhase {
        *self.phase.borrow()
    }

    /// Stop the listener (including any pending reconnect) and wait for it
    /// to release its connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "listener supervisor task failed");
        }
    }
}

async fn supervise(
    mut listener: ChangeListener,
    channel: String,
    mut shutdown: watch::Receiver<bool>,
    phase: watch::Sender<ListenerPhase>,
) {
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let session_id = prefixed_ulid(prefix::LISTENER);
        phase.send_replace(ListenerPhase::Connecting);
        tracing::info!(%session_id, attempt, %channel, "starting change listener");

        let err = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            err = run_session(&mut listener, &channel, &phase) => err,
        };

        tracing::error!(
            %session_id,
            attempt,
            error = %err,
            retry_in_secs = RECONNECT_DELAY.as_secs(),
            "change listener failed"
        );
        listener.stop().await;
        phase.send_replace(ListenerPhase::Disconnected);

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = time::sleep(RECONNECT_DELAY) => {}
        }
    }

    listener.stop().await;
    phase.send_replace(ListenerPhase::Disconnected);
    tracing::info!("change listener stopped");
}

/// One connect / subscribe / consume cycle. Only returns on failure.
async fn run_session(
    listener: &mut ChangeListener,
    channel: &str,
    phase: &watch::Sender<ListenerPhase>,
) -> ListenerError {
    if let Err(e) = listener.connect().await {
        return e;
    }
    if let Err(e) = listener.subscribe(channel).await {
        return e;
    }
    phase.send_replace(ListenerPhase::Subscribed);

    match listener.run().await {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped handle counts as a shutdown request.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::db::store::MemoryCatalog;
    use crate::gateway::registry::{Connection, ConnectionRegistry};
    use crate::listener::feed::MemoryFeedConnector;

    use super::*;

    fn listener_with(connector: Arc<MemoryFeedConnector>, registry: Arc<ConnectionRegistry>) -> ChangeListener {
        ChangeListener::new(connector, Arc::new(MemoryCatalog::new()), registry)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn supervised_future_can_be_spawned() {
        fn assert_sync<T: Sync>() {}
        assert_sync::<ChangeListener>();

        let listener = listener_with(
            Arc::new(MemoryFeedConnector::new()),
            Arc::new(ConnectionRegistry::new()),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (phase_tx, _phase_rx) = watch::channel(ListenerPhase::Disconnected);
        let future = supervise(listener, "data_updates".to_string(), shutdown_rx, phase_tx);
        assert_send(&future);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_fixed_delay_until_subscribed() {
        let connector = Arc::new(MemoryFeedConnector::failing(3));
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut client) = Connection::channel(8);
        registry.register(conn);

        let handle = Supervisor::spawn(listener_with(connector.clone(), registry), "data_updates");
        let mut phase = handle.phase();
        phase
            .wait_for(|p| *p == ListenerPhase::Subscribed)
            .await
            .unwrap();

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= RECONNECT_DELAY, "gap {gap:?} shorter than the reconnect delay");
            assert!(gap < RECONNECT_DELAY + Duration::from_millis(10));
        }

        assert_eq!(connector.open_feeds(), 1);
        assert!(client.try_recv().is_err(), "reconnecting must not broadcast");

        handle.shutdown().await;
        assert_eq!(connector.open_feeds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_reconnect() {
        let connector = Arc::new(MemoryFeedConnector::failing(10));
        let registry = Arc::new(ConnectionRegistry::new());

        let handle = Supervisor::spawn(listener_with(connector.clone(), registry), "data_updates");
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(handle.current_phase(), ListenerPhase::Disconnected);

        let phase = handle.phase();
        handle.shutdown().await;
        time::sleep(RECONNECT_DELAY * 4).await;

        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(*phase.borrow(), ListenerPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn relays_notifications_once_subscribed() {
        let connector = Arc::new(MemoryFeedConnector::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.upsert(crate::models::variant::fixtures::sample_detail(5, "12.00", "Alpha"));
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut client) = Connection::channel(8);
        registry.register(conn);

        let listener = ChangeListener::new(connector.clone(), catalog, registry);
        let handle = Supervisor::spawn(listener, "data_updates");
        handle
            .phase()
            .wait_for(|p| *p == ListenerPhase::Subscribed)
            .await
            .unwrap();

        connector.notify(
            "data_updates",
            r#"{"table":"product_variants","operation":"UPDATE","data":{"id":5},"timestamp":0}"#,
        );
        let frame = client.recv().await.unwrap();
        assert!(frame.contains("\"ENTITY_UPDATE\""));

        handle.shutdown().await;
    }
}
