#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spillway
//!
//! A Rust library for two-party micropayment channels over a Bitcoin-like
//! UTXO chain. A payer locks value into an on-chain 2-of-2 contract, then
//! streams off-chain, progressively re-signed settlements to the payee;
//! only the contract and the final settlement ever hit the chain. A
//! time-locked refund protects the payer if the payee disappears.
//!
//! # Structure
//!
//! - [`tx`]: pure builders and signing for contract, refund, settlements
//! - [`channel`]: per-side channel state objects and monetary invariants
//! - [`protocol`]: message-driven state machines for payer and payee
//! - [`store`]: persistent channel stores with expiry timers
//! - [`traits`]: capability interfaces the embedder supplies

pub mod channel;
pub mod errors;
pub mod protocol;
pub mod store;
pub mod traits;
pub mod tx;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use errors::{ChannelError, Error, ProtocolError, Result, StoreError, TxError};
pub use protocol::{
    ChannelMessage, CloseReason, ErrorCode, Outcome, PaymentChannelClient, PaymentChannelServer,
    PaymentUpdate,
};
pub use store::{ClientChannelStore, ExtensionRegistry, ServerChannelStore};
pub use traits::{Broadcast, ChannelWallet, Clock, FundingInput, Persist, SystemClock};
