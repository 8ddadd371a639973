//! Per-workspace fan-out.
//!
//! Every workspace owns one tokio broadcast channel. Frames are encoded once
//! and shared as `Arc<Envelope>`; each subscriber filters on the envelope's
//! [`Audience`] before writing to its socket. A subscriber that falls more
//! than `capacity` frames behind sees `RecvError::Lagged` and skips ahead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use tandem_core::SessionId;

use crate::protocol::{ProtocolError, ServerMessage};

/// Who an envelope is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    AllExcept(SessionId),
    Only(Vec<SessionId>),
}

/// One encoded frame plus its addressing.
#[derive(Debug)]
pub struct Envelope {
    pub audience: Audience,
    pub frame: String,
}

impl Envelope {
    pub fn is_for(&self, session: SessionId) -> bool {
        match &self.audience {
            Audience::Everyone => true,
            Audience::AllExcept(origin) => *origin != session,
            Audience::Only(targets) => targets.contains(&session),
        }
    }

    /// Decode the frame back into a message.
    pub fn message(&self) -> Result<ServerMessage, ProtocolError> {
        ServerMessage::decode(&self.frame)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub subscribers: usize,
}

/// Broadcast channel for a single workspace.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a subscriber may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Encode `msg` once and fan it out. Returns the number of subscribers
    /// the envelope reached, before audience filtering.
    pub fn publish(&self, msg: &ServerMessage, audience: Audience) -> Result<usize, ProtocolError> {
        let envelope = Envelope {
            audience,
            frame: msg.encode()?,
        };
        Ok(self.publish_envelope(Arc::new(envelope)))
    }

    /// Send a pre-built envelope.
    pub fn publish_envelope(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging subscriber skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        let count = group
            .publish(&ServerMessage::UserLeft(SessionId(9)), Audience::Everyone)
            .unwrap();
        assert_eq!(count, 2);

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.message().unwrap(), ServerMessage::UserLeft(SessionId(9)));
    }

    #[test]
    fn test_audience_filtering() {
        let all_but_one = Envelope {
            audience: Audience::AllExcept(SessionId(1)),
            frame: String::new(),
        };
        assert!(!all_but_one.is_for(SessionId(1)));
        assert!(all_but_one.is_for(SessionId(2)));

        let only = Envelope {
            audience: Audience::Only(vec![SessionId(3), SessionId(4)]),
            frame: String::new(),
        };
        assert!(only.is_for(SessionId(4)));
        assert!(!only.is_for(SessionId(1)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let group = BroadcastGroup::new(4);
        let count = group.publish(&ServerMessage::Connected, Audience::Everyone).unwrap();
        assert_eq!(count, 0);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5 {
            group
                .publish(&ServerMessage::UserLeft(SessionId(i)), Audience::Everyone)
                .unwrap();
        }

        match rx.recv().await {
            Err(RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_lagged, 3);

        // Remaining frames are the newest ones, in order.
        let next = rx.recv().await.unwrap().message().unwrap();
        assert_eq!(next, ServerMessage::UserLeft(SessionId(3)));
        let last = rx.recv().await.unwrap().message().unwrap();
        assert_eq!(last, ServerMessage::UserLeft(SessionId(4)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_receiver_count_tracks_drops() {
        let group = BroadcastGroup::new(8);
        let rx = group.subscribe();
        assert_eq!(group.receiver_count(), 1);
        drop(rx);
        assert_eq!(group.receiver_count(), 0);
    }
}
