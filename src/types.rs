//! Core type definitions and protocol constants
//!
//! This module defines fundamental types and the named parameters of the
//! channel protocol, providing a common location for shared definitions.

// ============================================================================
// Fundamental Types
// ============================================================================

/// Type alias for 32-byte arrays used across cryptographic operations
pub type Bytes32 = [u8; 32];

/// Opaque identifier of a payment server
///
/// Clients key their stored channels by `(ServerId, contract hash)` so that
/// several concurrent channels to the same server can coexist. How the id is
/// derived (host hash, static key, ...) is up to the embedder.
pub type ServerId = Bytes32;

// ============================================================================
// Protocol Version
// ============================================================================

/// Major protocol version; peers must agree on this exactly
pub const PROTOCOL_VERSION_MAJOR: u32 = 1;

/// Minor protocol version; advisory only, mismatches are tolerated
pub const PROTOCOL_VERSION_MINOR: u32 = 0;

// ============================================================================
// Monetary Parameters
// ============================================================================

/// One coin in base units (10^8 satoshis)
pub const COIN: u64 = 100_000_000;

/// One cent of a coin (10^6 satoshis)
pub const CENT: u64 = 1_000_000;

/// Fixed minimum fee in satoshis attached to settlement transactions
///
/// The protocol does not negotiate fees; both sides derive the settlement
/// split from this shared constant so the rebuilt transaction is
/// byte-identical on both ends.
pub const DEFAULT_SETTLEMENT_FEE: u64 = 10_000;

/// Dust threshold in satoshis
///
/// Settlement payer-change outputs below this value are suppressed and the
/// remainder is surrendered to fee.
pub const DUST_LIMIT: u64 = 546;

// ============================================================================
// Timing Parameters
// ============================================================================

/// Default maximum channel lifetime a client will accept, in seconds (24h)
pub const DEFAULT_MAX_TIME_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Clock-skew allowance when validating a server-proposed expiry, in seconds
pub const TIME_WINDOW_GRACE_SECS: u64 = 60;

/// Wall-clock cap on each handshake step, in seconds
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60;

/// How long before expiry the server settles its best state, in seconds
///
/// Must leave enough time for the settlement to confirm before the refund's
/// lock time makes the refund spendable.
pub const SERVER_SETTLE_MARGIN_SECS: u64 = 2;

/// How long after expiry the client waits before reclaiming, in seconds
pub const CLIENT_REFUND_SLACK_SECS: u64 = 5 * 60;
