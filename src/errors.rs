//! Error types for the spillway library
//!
//! This module defines all error types used throughout the library,
//! providing detailed error information for debugging and handling.

use bitcoin::Txid;
use thiserror::Error;

/// The main error type for the spillway library
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Transaction building and signing errors
    #[error(transparent)]
    Tx(#[from] TxError),

    /// Channel state errors
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Protocol state machine errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Channel store errors
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Assertion failure on a state that should be unreachable
    ///
    /// Fatal to the session that hit it; other sessions and the stores are
    /// unaffected.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Errors from the transaction builder and signer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TxError {
    /// A counterparty signature failed ECDSA verification
    #[error("signature does not verify against the contract output")]
    BadSignature,

    /// The contract output script is not the expected 2-of-2 form
    #[error("script is not the expected 2-of-2 multisig: {0}")]
    BadScript(String),

    /// A transaction is structurally unusable for its role
    #[error("bad transaction: {0}")]
    BadTransaction(String),

    /// Transaction bytes could not be decoded
    #[error("undecodable transaction bytes")]
    Undecodable,

    /// A public key field could not be parsed
    #[error("invalid public key bytes")]
    InvalidKey,

    /// The requested expiry cannot be expressed as an absolute lock time
    #[error("expiry {0} is not representable as a lock-by-time value")]
    UnrepresentableLockTime(u64),

    /// Funding inputs do not cover the contract value plus fee
    #[error("funding inputs total {available} sat, need {required} sat")]
    InsufficientFunding {
        /// Sum of the selected funding inputs
        available: u64,
        /// Contract value plus funding fee
        required: u64,
    },
}

/// Errors from per-channel state objects
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelError {
    /// The peer asked for more value than this channel holds
    #[error("peer requires {required} sat but the channel only holds {available} sat")]
    ValueTooLarge {
        /// Minimum value the peer will accept
        required: u64,
        /// Value available on this side
        available: u64,
    },

    /// The proposed expiry lies beyond the acceptable window
    #[error("expiry {expiry} exceeds the acceptable window ending at {latest_acceptable}")]
    TimeWindowTooLarge {
        /// Peer-proposed absolute expiry
        expiry: u64,
        /// Latest expiry this side accepts
        latest_acceptable: u64,
    },

    /// An operation that requires an open channel was called in another state
    #[error("channel is not open (state: {0})")]
    ChannelNotOpen(&'static str),

    /// A settlement update did not strictly increase the paid amount
    #[error("new paid value {new} does not exceed current best {current}")]
    BadValue {
        /// Paid amount carried by the rejected update
        new: u64,
        /// Best paid amount accepted so far
        current: u64,
    },

    /// An increment would push the paid amount past the spendable ceiling
    #[error("increment of {delta} sat exceeds spendable ceiling {ceiling} (paid {paid})")]
    IncrementTooLarge {
        /// Requested increment
        delta: u64,
        /// Amount already paid
        paid: u64,
        /// Maximum total the channel can pay out
        ceiling: u64,
    },

    /// An operation was invoked out of lifecycle order
    #[error("operation {operation} is invalid in state {state}")]
    InvalidState {
        /// Name of the rejected operation
        operation: &'static str,
        /// Lifecycle state the channel was in
        state: &'static str,
    },
}

/// Errors from the protocol state machines
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A message arrived that the current state does not accept
    #[error("unexpected {message} in state {state}")]
    UnexpectedMessage {
        /// Message type name
        message: &'static str,
        /// State machine state name
        state: &'static str,
    },

    /// The peer runs an incompatible major protocol version
    #[error("no acceptable version (peer major {0})")]
    NoAcceptableVersion(u32),

    /// The session is already terminal and cannot process input
    #[error("session is closed")]
    SessionClosed,
}

/// Errors from the persistent channel stores
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// No channel is stored under the requested key
    #[error("channel {0} not found in store")]
    ChannelNotFound(Txid),

    /// A snapshot blob could not be decoded
    #[error("undecodable store snapshot: {0}")]
    BadSnapshot(String),

    /// The embedder's persist hook reported a failure
    #[error("persist hook failed: {0}")]
    PersistFailed(String),

    /// The embedder's broadcaster reported a failure
    #[error("broadcast failed: {0}")]
    BroadcastFailed(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
