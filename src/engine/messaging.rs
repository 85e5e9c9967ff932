//! The abstract peer-to-peer message transport and an in-process test
//! backend wiring engines together over tokio channels.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::warn;

use crate::protocols::messages::Message;
use crate::types::Address;

/// Delivers outbound messages. Sends must not block the engine loop; a
/// backend talking to a real network buffers internally.
pub trait MessageService: Send {
    fn send(&mut self, msg: Message);
}

/// Routes messages to registered peer inboxes. Messages for unknown
/// recipients are dropped with a warning, like an unreachable peer.
#[derive(Default)]
pub struct TestMessageService {
    peers: HashMap<Address, mpsc::UnboundedSender<Message>>,
}

impl TestMessageService {
    pub fn new() -> Self {
        TestMessageService::default()
    }

    /// Registers a peer and returns its inbox.
    pub fn register(&mut self, peer: Address) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(peer, tx);
        rx
    }

    pub fn connect(&mut self, peer: Address, inbox: mpsc::UnboundedSender<Message>) {
        self.peers.insert(peer, inbox);
    }
}

impl MessageService for TestMessageService {
    fn send(&mut self, msg: Message) {
        match self.peers.get(&msg.to) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    // Receiver gone; drop like a disconnected peer.
                }
            }
            None => warn!(to = ?msg.to, "no route to peer, message dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_recipient() {
        let mut svc = TestMessageService::new();
        let alice = Address([0x01; 20]);
        let bob = Address([0x02; 20]);
        let mut bob_inbox = svc.register(bob);

        svc.send(Message {
            to: bob,
            from: alice,
            ..Message::default()
        });
        // Unknown recipient is dropped, not an error.
        svc.send(Message {
            to: Address([0x03; 20]),
            from: alice,
            ..Message::default()
        });

        let got = bob_inbox.try_recv().unwrap();
        assert_eq!(got.from, alice);
        assert!(bob_inbox.try_recv().is_err());
    }
}
