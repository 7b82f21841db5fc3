//! Per-side channel state objects
//!
//! This module owns each party's view of a single channel. The
//! [`client::ClientChannel`] tracks the payer's contract, refund, and
//! latest signed settlement; the [`server::ServerChannel`] tracks the
//! payee's best received settlement and drives the final close. Both
//! enforce the monetary invariants (monotonically growing paid amount,
//! spendable ceiling) and a strictly forward lifecycle.

pub mod client;
pub mod server;

pub use client::{ClientChannel, ClientLifecycle};
pub use server::{ServerChannel, ServerLifecycle};
