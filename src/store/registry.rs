//! Store registry tied to the hosting wallet's lifecycle
//!
//! The hosting wallet owns the stores' persistence: it loads their
//! snapshots when it starts, flushes them when it saves, and cancels every
//! pending timer when it shuts down. The registry bundles both stores
//! behind those three explicit lifecycle operations so no global mutable
//! state is needed.

use std::sync::Arc;

use crate::errors::Result;
use crate::store::client::ClientChannelStore;
use crate::store::server::ServerChannelStore;
use crate::traits::Clock;

/// Both channel stores, bound to one wallet lifecycle
pub struct ExtensionRegistry {
    client: Arc<ClientChannelStore>,
    server: Arc<ServerChannelStore>,
    clock: Arc<dyn Clock>,
}

impl ExtensionRegistry {
    /// Bundles freshly constructed (or deserialized) stores
    pub fn new(
        client: Arc<ClientChannelStore>,
        server: Arc<ServerChannelStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { client, server, clock }
    }

    /// The payer-side store
    pub fn client(&self) -> Arc<ClientChannelStore> {
        Arc::clone(&self.client)
    }

    /// The payee-side store
    pub fn server(&self) -> Arc<ServerChannelStore> {
        Arc::clone(&self.server)
    }

    /// Snapshots both stores for the wallet's save path
    ///
    /// Returns `(client snapshot, server snapshot)`; the wallet stores them
    /// under [`crate::store::CLIENT_EXTENSION_ID`] and
    /// [`crate::store::SERVER_EXTENSION_ID`].
    pub fn flush(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((self.client.serialize()?, self.server.serialize()?))
    }

    /// Advances both stores' timer wheels to the clock's current time
    pub fn tick(&self) -> Result<()> {
        let now = self.clock.now();
        self.client.tick(now)?;
        self.server.tick(now)?;
        Ok(())
    }

    /// Cancels every pending timer; called on wallet teardown
    ///
    /// Stored channel records are untouched; a later load rebuilds the
    /// timers from their expiries.
    pub fn teardown(&self) {
        self.client.cancel_timers();
        self.server.cancel_timers();
    }
}
