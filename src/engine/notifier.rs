//! Best-effort fan-out of channel updates to interested subscribers.
//!
//! Sends never block the engine loop: a subscriber whose buffer is full
//! misses the update, and closed subscribers are pruned on the next send.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::types::{Destination, U256};

const SUBSCRIBER_BUFFER: usize = 16;

/// One update about a channel a subscriber asked to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotification {
    LedgerUpdated {
        channel_id: Destination,
        turn_num: u64,
    },
    PaymentReceived {
        channel_id: Destination,
        paid: U256,
    },
    SwapExecuted {
        channel_id: Destination,
        swap_id: Destination,
    },
    ObjectiveCompleted {
        channel_id: Destination,
    },
}

impl ChannelNotification {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChannelNotification::LedgerUpdated { channel_id, .. }
            | ChannelNotification::PaymentReceived { channel_id, .. }
            | ChannelNotification::SwapExecuted { channel_id, .. }
            | ChannelNotification::ObjectiveCompleted { channel_id } => *channel_id,
        }
    }
}

#[derive(Default)]
pub struct Notifier {
    subscribers: HashMap<Destination, Vec<mpsc::Sender<ChannelNotification>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier::default()
    }

    /// Registers interest in one channel's updates.
    pub fn subscribe(&mut self, channel_id: Destination) -> mpsc::Receiver<ChannelNotification> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.entry(channel_id).or_default().push(tx);
        rx
    }

    pub fn notify(&mut self, notification: ChannelNotification) {
        let channel_id = notification.channel_id();
        let Some(subs) = self.subscribers.get_mut(&channel_id) else {
            return;
        };
        subs.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subs.is_empty() {
            self.subscribers.remove(&channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_matching_subscribers_only() {
        let mut n = Notifier::new();
        let watched = Destination([0x01; 32]);
        let other = Destination([0x02; 32]);
        let mut rx = n.subscribe(watched);

        n.notify(ChannelNotification::LedgerUpdated {
            channel_id: other,
            turn_num: 3,
        });
        assert!(rx.try_recv().is_err());

        n.notify(ChannelNotification::PaymentReceived {
            channel_id: watched,
            paid: U256::from(5u64),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelNotification::PaymentReceived {
                channel_id: watched,
                paid: U256::from(5u64),
            }
        );
    }

    #[test]
    fn full_buffers_drop_updates_without_blocking() {
        let mut n = Notifier::new();
        let cid = Destination([0x03; 32]);
        let mut rx = n.subscribe(cid);
        for turn in 0..(SUBSCRIBER_BUFFER as u64 + 4) {
            n.notify(ChannelNotification::LedgerUpdated {
                channel_id: cid,
                turn_num: turn,
            });
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let mut n = Notifier::new();
        let cid = Destination([0x04; 32]);
        let rx = n.subscribe(cid);
        drop(rx);
        n.notify(ChannelNotification::ObjectiveCompleted { channel_id: cid });
        assert!(n.subscribers.is_empty());
    }
}
