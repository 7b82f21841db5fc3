//! Outcomes returned by the protocol state machines
//!
//! Every `receive()` call (and every local action) returns an [`Outcome`]
//! describing what the embedder must do next: messages to send, fully
//! signed transactions to broadcast, and session events to surface. The
//! machines themselves never call back into the transport, which keeps the
//! embedder's locking trivially acyclic.

use bitcoin::{Transaction, Txid};

use crate::protocol::messages::ChannelMessage;

/// Why a session ended, surfaced to the embedder exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client asked for settlement
    ClientRequestedClose,
    /// The server asked for settlement
    ServerRequestedClose,
    /// The peer sent an `ERROR` message
    RemoteSentError,
    /// The peer sent a malformed or out-of-sequence message
    RemoteSentInvalidMessage,
    /// Version negotiation failed
    NoAcceptableVersion,
    /// The server proposed an unacceptably distant expiry
    TimeWindowTooLarge,
    /// The server demanded more value than this channel holds
    ServerRequestedTooMuchValue,
    /// The transport dropped, or a handshake step timed out
    ConnectionClosed,
}

/// One accepted payment increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentUpdate {
    /// Increase over the previous best paid amount
    pub delta: u64,
    /// New total paid amount
    pub total: u64,
}

/// What the embedder must do after feeding the state machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Messages to send to the peer, in order
    pub emit: Vec<ChannelMessage>,
    /// Transactions to hand to the broadcaster, in order
    pub broadcast: Vec<Transaction>,
    /// The channel identified by this contract hash is now open
    pub opened: Option<Txid>,
    /// A payment increment was accepted (server side only)
    pub payment: Option<PaymentUpdate>,
    /// The session ended for this reason
    pub closed: Option<CloseReason>,
}

impl Outcome {
    /// An outcome requiring no embedder action
    pub fn none() -> Self {
        Self::default()
    }

    /// An outcome that only sends messages
    pub fn send(messages: impl IntoIterator<Item = ChannelMessage>) -> Self {
        Self { emit: messages.into_iter().collect(), ..Self::default() }
    }

    /// Appends a message to send
    pub fn and_send(mut self, message: ChannelMessage) -> Self {
        self.emit.push(message);
        self
    }

    /// Appends a transaction to broadcast
    pub fn and_broadcast(mut self, tx: Transaction) -> Self {
        self.broadcast.push(tx);
        self
    }

    /// Records the open event
    pub fn and_opened(mut self, contract_hash: Txid) -> Self {
        self.opened = Some(contract_hash);
        self
    }

    /// Records an accepted payment
    pub fn and_payment(mut self, delta: u64, total: u64) -> Self {
        self.payment = Some(PaymentUpdate { delta, total });
        self
    }

    /// Records the close reason
    pub fn and_closed(mut self, reason: CloseReason) -> Self {
        self.closed = Some(reason);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ErrorCode;

    #[test]
    fn test_outcome_builders() {
        let outcome = Outcome::send([ChannelMessage::Close])
            .and_send(ChannelMessage::error(ErrorCode::Other))
            .and_payment(5, 15)
            .and_closed(CloseReason::ClientRequestedClose);

        assert_eq!(outcome.emit.len(), 2);
        assert!(outcome.broadcast.is_empty());
        assert_eq!(outcome.payment, Some(PaymentUpdate { delta: 5, total: 15 }));
        assert_eq!(outcome.closed, Some(CloseReason::ClientRequestedClose));
        assert_eq!(Outcome::none(), Outcome::default());
    }
}
