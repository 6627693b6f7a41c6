//! Best-effort fan-out over the session registry.
//!
//! Frames are enqueued with `try_send`; a full queue drops the frame for that
//! recipient and a closed queue is skipped. Neither case is reported back to
//! the sender.

use axum::extract::ws::Message;
use metrics::counter;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::protocol::{self, Envelope};
use crate::registry::SessionRegistry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
    pub bytes: usize,
}

/// Sends `envelope` to every registered connection that joined `group_id`,
/// skipping `exclude`.
pub fn broadcast_to_group(
    registry: &SessionRegistry,
    group_id: &str,
    envelope: &Envelope,
    exclude: Option<&str>,
) -> BroadcastMetrics {
    fan_out(registry, Some(group_id), envelope, exclude)
}

/// Sends `envelope` to every registered connection except `exclude`.
pub fn broadcast_to_all(
    registry: &SessionRegistry,
    envelope: &Envelope,
    exclude: Option<&str>,
) -> BroadcastMetrics {
    fan_out(registry, None, envelope, exclude)
}

fn fan_out(
    registry: &SessionRegistry,
    group_id: Option<&str>,
    envelope: &Envelope,
    exclude: Option<&str>,
) -> BroadcastMetrics {
    let mut metrics = BroadcastMetrics::default();
    let payload = protocol::encode(envelope);

    for (identity, connection) in registry.connections() {
        if exclude == Some(identity.as_str()) {
            continue;
        }
        if let Some(group_id) = group_id {
            if !connection.membership().has(group_id) {
                continue;
            }
        }
        if !connection.is_open() {
            metrics.closed += 1;
            continue;
        }

        match connection.try_deliver(Message::Text(payload.clone())) {
            Ok(()) => {
                metrics.delivered += 1;
                metrics.bytes += payload.len();
            }
            Err(TrySendError::Full(_)) => {
                metrics.dropped += 1;
                warn!(
                    identity = %identity,
                    connection_id = %connection.id(),
                    kind = %envelope.kind(),
                    "outbound queue full; dropping broadcast frame"
                );
            }
            Err(TrySendError::Closed(_)) => {
                metrics.closed += 1;
            }
        }
    }

    if metrics.delivered > 0 {
        counter!(
            "memo_relay_broadcast_delivered_total",
            metrics.delivered as u64,
            "type" => envelope.kind().as_str()
        );
    }
    if metrics.dropped > 0 {
        counter!(
            "memo_relay_broadcast_dropped_total",
            metrics.dropped as u64,
            "type" => envelope.kind().as_str()
        );
    }
    debug!(
        group_id = group_id.unwrap_or("*"),
        kind = %envelope.kind(),
        delivered = metrics.delivered,
        dropped = metrics.dropped,
        closed = metrics.closed,
        "broadcast complete"
    );

    metrics
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::{BroadcastText, Message as Wire};
    use crate::registry::ConnectionHandle;

    fn connect(
        registry: &SessionRegistry,
        identity: &str,
        depth: usize,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(depth);
        let conn = Arc::new(ConnectionHandle::new(identity, tx));
        registry.admit(Arc::clone(&conn));
        (conn, rx)
    }

    fn hello() -> Envelope {
        Envelope::new(Wire::Broadcast(BroadcastText {
            text: "hello".into(),
            extra: Default::default(),
        }))
    }

    fn received(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).expect("json frame"));
        }
        frames
    }

    #[test_timeout::timeout]
    fn group_broadcast_reaches_members_only() {
        let registry = SessionRegistry::new();
        let (alice, mut alice_rx) = connect(&registry, "alice", 4);
        let (bob, mut bob_rx) = connect(&registry, "bob", 4);
        let (_carol, mut carol_rx) = connect(&registry, "carol", 4);
        alice.membership().join("g1");
        bob.membership().join("g1");

        let metrics = broadcast_to_group(&registry, "g1", &hello(), Some("alice"));

        assert_eq!(metrics.delivered, 1);
        assert!(received(&mut alice_rx).is_empty());
        assert!(received(&mut carol_rx).is_empty());
        let frames = received(&mut bob_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["payload"]["text"], "hello");
    }

    #[test_timeout::timeout]
    fn broadcast_to_all_ignores_membership() {
        let registry = SessionRegistry::new();
        let (_alice, mut alice_rx) = connect(&registry, "alice", 4);
        let (_bob, mut bob_rx) = connect(&registry, "bob", 4);
        let (_carol, mut carol_rx) = connect(&registry, "carol", 4);

        let metrics = broadcast_to_all(&registry, &hello(), Some("alice"));

        assert_eq!(metrics.delivered, 2);
        assert!(received(&mut alice_rx).is_empty());
        assert_eq!(received(&mut bob_rx).len(), 1);
        assert_eq!(received(&mut carol_rx).len(), 1);
    }

    #[test_timeout::timeout]
    fn closed_and_full_queues_are_skipped() {
        let registry = SessionRegistry::new();
        let (gone, gone_rx) = connect(&registry, "gone", 4);
        let (slow, mut slow_rx) = connect(&registry, "slow", 1);
        gone.membership().join("g1");
        slow.membership().join("g1");
        drop(gone_rx);

        let first = broadcast_to_group(&registry, "g1", &hello(), None);
        assert_eq!(first.delivered, 1);
        assert_eq!(first.closed, 1);

        let second = broadcast_to_group(&registry, "g1", &hello(), None);
        assert_eq!(second.delivered, 0);
        assert_eq!(second.dropped, 1);
        assert_eq!(received(&mut slow_rx).len(), 1);
    }
}
