//! Connection requests coming from outside the network layer.
//!
//! Two sources ask the node to dial: the list of peers given at startup
//! and `ConnectToPeerRequested` events raised on the hub (for example by
//! a UI). Both go through the same connector; failures are logged and
//! never retried here.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use partyline_types::{Event, EventKind, Result, UserInfo};

/// Listener id the node registers on its own hub.
pub const CONNECT_LISTENER_ID: &str = "node/connect-requests";

/// Dials each target in turn, logging the outcome.
///
/// Returns the peers that connected.
pub async fn connect_initial_peers<C, Fut>(targets: &[String], connect: C) -> Vec<UserInfo>
where
    C: Fn(String) -> Fut,
    Fut: Future<Output = Result<UserInfo>>,
{
    let mut connected = Vec::with_capacity(targets.len());
    for target in targets {
        match connect(target.clone()).await {
            Ok(peer) => {
                tracing::info!(%target, nickname = %peer.nickname, "connected to initial peer");
                connected.push(peer);
            }
            Err(error) => tracing::warn!(%target, %error, "could not connect to initial peer"),
        }
    }
    connected
}

/// Serves `ConnectToPeerRequested` events from `events` until the hub
/// stops delivering to it.
///
/// Each request runs on its own task so a slow dial never holds up the
/// next request. Other event kinds are ignored.
pub async fn serve_connect_requests<C, Fut>(mut events: mpsc::Receiver<Event>, connect: C)
where
    C: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UserInfo>> + Send + 'static,
{
    let connect = Arc::new(connect);
    while let Some(event) = events.recv().await {
        let EventKind::ConnectToPeerRequested(target) = event.kind else {
            continue;
        };
        tracing::info!(%target, "connect requested");
        let attempt = connect(target.clone());
        tokio::spawn(async move {
            match attempt.await {
                Ok(peer) => tracing::info!(%target, nickname = %peer.nickname, "requested connection established"),
                Err(error) => tracing::warn!(%target, %error, "requested connection failed"),
            }
        });
    }
    tracing::debug!("connect request listener stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use partyline_hub::Dispatcher;
    use partyline_types::config::HubConfig;
    use partyline_types::{Message, PartyLineError};

    use super::*;

    type Calls = Arc<Mutex<Vec<String>>>;

    /// Connector that records every target and fails those starting
    /// with `bad`.
    fn recording_connector(
        calls: Calls,
    ) -> impl Fn(String) -> std::future::Ready<Result<UserInfo>> + Send + Sync + 'static {
        move |target: String| {
            if let Ok(mut seen) = calls.lock() {
                seen.push(target.clone());
            }
            let outcome = if target.starts_with("bad") {
                Err(PartyLineError::PeerUnreachable { reason: target })
            } else {
                Ok(UserInfo::new(target, "peer"))
            };
            std::future::ready(outcome)
        }
    }

    fn seen(calls: &Calls) -> Vec<String> {
        calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn initial_peers_are_all_attempted() {
        let calls = Calls::default();
        let targets = vec!["peer-a".to_string(), "bad-b".to_string(), "peer-c".to_string()];

        let connected = connect_initial_peers(&targets, recording_connector(Arc::clone(&calls))).await;

        assert_eq!(seen(&calls), targets);
        let ids: Vec<_> = connected.into_iter().map(|u| u.peer_id).collect();
        assert_eq!(ids, vec!["peer-a".to_string(), "peer-c".to_string()]);
    }

    #[tokio::test]
    async fn connect_events_trigger_dials() -> std::result::Result<(), PartyLineError> {
        let (hub, worker, _publish) = Dispatcher::new(&HubConfig::default())?;
        tokio::spawn(worker.run());
        let events = hub.register_listener(CONNECT_LISTENER_ID);

        let calls = Calls::default();
        let server = tokio::spawn(serve_connect_requests(
            events,
            recording_connector(Arc::clone(&calls)),
        ));

        hub.notify_connect_requested("peer-x").await;
        // Unrelated events are ignored.
        hub.submit_incoming(Message::text(UserInfo::new("someone", "s"), "hello")).await?;
        hub.notify_connect_requested("bad-y").await;

        for _ in 0..100 {
            if seen(&calls).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen(&calls), vec!["peer-x".to_string(), "bad-y".to_string()]);

        // Unregistering ends the server.
        hub.unregister_listener(CONNECT_LISTENER_ID);
        let stopped = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        Ok(())
    }
}
