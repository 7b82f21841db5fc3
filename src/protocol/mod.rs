//! Protocol state machines for payer and payee
//!
//! This module drives the channel protocol on both ends of a connection.
//! Each machine consumes typed messages and returns an [`Outcome`] telling
//! the embedder what to send, broadcast, and report; the machines never
//! call back into the transport.
//!
//! # Structure
//!
//! - `messages`: typed message records and wire error codes
//! - `outcome`: the value every machine input returns
//! - `client`: the payer machine (version, initiate, refund, contract,
//!   open, payments, close)
//! - `server`: the payee machine, its mirror

pub mod client;
pub mod messages;
pub mod outcome;
pub mod server;

pub use client::PaymentChannelClient;
pub use messages::{
    ChannelMessage, ClientVersion, ErrorCode, ErrorMessage, Initiate, ProvideContract,
    ProvideRefund, ReturnRefund, ServerVersion, UpdatePayment,
};
pub use outcome::{CloseReason, Outcome, PaymentUpdate};
pub use server::PaymentChannelServer;
