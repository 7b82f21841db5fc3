//! Persistent channel stores
//!
//! The stores are the single source of truth for channels that outlive a
//! connection. Each side has one: the payer's keyed by
//! `(server id, contract hash)`, the payee's by contract hash. Both keep a
//! min-heap of expiry timers and expose a deterministic `tick(now)` that
//! fires every due entry — refund reclamation on the payer side,
//! best-settlement broadcast on the payee side.
//!
//! Locking discipline: one exclusive lock per store guards its map and
//! heap; the broadcaster and persist hooks are only ever invoked after
//! that lock is released.

pub mod client;
pub mod registry;
pub mod server;

pub use client::{ClientChannelStore, StoredClientChannel, CLIENT_EXTENSION_ID};
pub use registry::ExtensionRegistry;
pub use server::{ServerChannelStore, StoredServerChannel, SERVER_EXTENSION_ID};
