//! Payer-side persistent channel store
//!
//! Holds every channel the payer has opened, keyed by
//! `(server id, contract hash)` so concurrent channels to one server
//! coexist. Records survive disconnects; at `T_exp + slack` the store
//! broadcasts the stored contract (if it never reached the chain) followed
//! by the fully signed refund, then drops the record.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::errors::{Result, StoreError};
use crate::traits::{Broadcast, Persist};
use crate::types::{ServerId, CLIENT_REFUND_SLACK_SECS};

/// Stable identifier under which the payer snapshot is stored by the
/// hosting wallet
pub const CLIENT_EXTENSION_ID: &str = "spillway.client_channels";

/// One stored payer-side channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredClientChannel {
    /// Identifier of the payee this channel points at
    pub server_id: ServerId,
    /// Contract hash, the channel identifier
    pub contract_hash: Txid,
    /// The payer's channel secret key
    pub payer_key: SecretKey,
    /// The payee's channel public key
    pub payee_pubkey: PublicKey,
    /// Total channel value V
    pub value: u64,
    /// Amount paid to the payee so far
    pub paid: u64,
    /// Fixed settlement fee the signatures commit to
    pub fee: u64,
    /// Absolute channel expiry T_exp
    pub expiry: u64,
    /// The contract transaction
    pub contract: Transaction,
    /// The fully signed refund
    pub refund: Transaction,
    /// Latest signed settlement, if any payment was made
    pub latest_settlement: Option<Transaction>,
    /// Whether the contract is known to have reached the network
    pub contract_broadcast: bool,
    /// Held by a live session right now; never persisted
    #[serde(skip)]
    pub active: bool,
}

#[derive(Default)]
struct ClientStoreInner {
    channels: BTreeMap<(ServerId, Txid), StoredClientChannel>,
    // Fire time, then key; lazily invalidated when records are removed.
    expiry_queue: BinaryHeap<Reverse<(u64, ServerId, Txid)>>,
}

/// The payer's persistent channel store
pub struct ClientChannelStore {
    inner: Mutex<ClientStoreInner>,
    broadcaster: Arc<dyn Broadcast>,
    persist: Arc<dyn Persist>,
    refund_slack: u64,
}

impl std::fmt::Debug for ClientChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannelStore")
            .field("refund_slack", &self.refund_slack)
            .finish_non_exhaustive()
    }
}

impl ClientChannelStore {
    /// Creates an empty store with the default post-expiry slack
    pub fn new(broadcaster: Arc<dyn Broadcast>, persist: Arc<dyn Persist>) -> Self {
        Self::with_slack(broadcaster, persist, CLIENT_REFUND_SLACK_SECS)
    }

    /// Creates an empty store with an explicit post-expiry slack
    pub fn with_slack(
        broadcaster: Arc<dyn Broadcast>,
        persist: Arc<dyn Persist>,
        refund_slack: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(ClientStoreInner::default()),
            broadcaster,
            persist,
            refund_slack,
        }
    }

    /// Restores a store from a serialized snapshot
    ///
    /// Every restored record is inactive; live sessions re-attach through
    /// [`Self::checkout_inactive`].
    ///
    /// # Errors
    /// * `StoreError::BadSnapshot` on undecodable bytes
    pub fn deserialize(
        broadcaster: Arc<dyn Broadcast>,
        persist: Arc<dyn Persist>,
        refund_slack: u64,
        snapshot: &[u8],
    ) -> Result<Self> {
        let records: Vec<StoredClientChannel> = serde_json::from_slice(snapshot)
            .map_err(|e| StoreError::BadSnapshot(e.to_string()))?;
        let store = Self::with_slack(broadcaster, persist, refund_slack);
        {
            let mut inner = store.lock();
            for record in records {
                let fire_at = record.expiry + store.refund_slack;
                inner
                    .expiry_queue
                    .push(Reverse((fire_at, record.server_id, record.contract_hash)));
                inner.channels.insert((record.server_id, record.contract_hash), record);
            }
        }
        Ok(store)
    }

    /// Serializes every stored channel into an opaque snapshot
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let inner = self.lock();
        self.snapshot_locked(&inner)
    }

    /// Inserts or replaces a channel record and persists the snapshot
    pub fn put(&self, record: StoredClientChannel) -> Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            let fire_at = record.expiry + self.refund_slack;
            inner
                .expiry_queue
                .push(Reverse((fire_at, record.server_id, record.contract_hash)));
            debug!(contract = %record.contract_hash, "storing client channel");
            inner.channels.insert((record.server_id, record.contract_hash), record);
            self.snapshot_locked(&inner)?
        };
        self.persist_snapshot(&snapshot)
    }

    /// Looks up one channel record
    pub fn get(&self, server_id: &ServerId, contract_hash: &Txid) -> Option<StoredClientChannel> {
        self.lock().channels.get(&(*server_id, *contract_hash)).cloned()
    }

    /// Number of stored channels
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// True when no channels are stored
    pub fn is_empty(&self) -> bool {
        self.channel_count() == 0
    }

    /// Claims an inactive, unexpired channel to `server_id` for a session
    ///
    /// Marks the record active so no second session can attach to it; the
    /// caller returns it via [`Self::mark_inactive`] when the session ends.
    pub fn checkout_inactive(
        &self,
        server_id: &ServerId,
        now: u64,
    ) -> Option<StoredClientChannel> {
        let mut inner = self.lock();
        let record = inner
            .channels
            .values_mut()
            .find(|r| r.server_id == *server_id && !r.active && r.expiry > now)?;
        record.active = true;
        Some(record.clone())
    }

    /// Records a new best settlement after an accepted payment
    ///
    /// # Errors
    /// * `StoreError::ChannelNotFound` for an unknown key
    pub fn update_best(
        &self,
        server_id: &ServerId,
        contract_hash: &Txid,
        paid: u64,
        settlement: Transaction,
    ) -> Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            let record = inner
                .channels
                .get_mut(&(*server_id, *contract_hash))
                .ok_or(StoreError::ChannelNotFound(*contract_hash))?;
            record.paid = paid;
            record.latest_settlement = Some(settlement);
            self.snapshot_locked(&inner)?
        };
        self.persist_snapshot(&snapshot)
    }

    /// Flips a channel inactive when its session ends; data is retained
    pub fn mark_inactive(&self, server_id: &ServerId, contract_hash: &Txid) {
        if let Some(record) = self.lock().channels.get_mut(&(*server_id, *contract_hash)) {
            record.active = false;
        }
    }

    /// Deletes a channel record, e.g. after an explicit settled close
    ///
    /// Any pending expiry entry for it becomes a no-op.
    pub fn remove(&self, server_id: &ServerId, contract_hash: &Txid) -> Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            inner
                .channels
                .remove(&(*server_id, *contract_hash))
                .ok_or(StoreError::ChannelNotFound(*contract_hash))?;
            self.snapshot_locked(&inner)?
        };
        self.persist_snapshot(&snapshot)
    }

    /// Fires every due expiry timer
    ///
    /// For each channel past `T_exp + slack`: broadcasts the contract
    /// (unless it already reached the chain), then the refund, and drops
    /// the record. The contract broadcast must resolve before the refund is
    /// submitted; a failed broadcast re-queues the record for the next
    /// tick.
    ///
    /// # Returns
    /// The transactions broadcast, in submission order
    pub fn tick(&self, now: u64) -> Result<Vec<Txid>> {
        // Collect due records under the lock; broadcast after dropping it.
        let due = {
            let mut inner = self.lock();
            let mut due = Vec::new();
            while let Some(Reverse((fire_at, server_id, contract_hash))) =
                inner.expiry_queue.peek().copied()
            {
                if fire_at > now {
                    break;
                }
                inner.expiry_queue.pop();
                // Stale entries for already-removed channels are no-ops.
                if let Some(record) = inner.channels.remove(&(server_id, contract_hash)) {
                    due.push(record);
                }
            }
            due
        };
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut broadcast = Vec::new();
        let mut retry = Vec::new();
        for mut record in due {
            let refund_signed =
                record.refund.input.first().is_some_and(|i| !i.script_sig.is_empty());
            if !refund_signed {
                // A record like this should never have been stored.
                error!(contract = %record.contract_hash,
                    "stored channel has an incomplete refund, dropping without broadcast");
                continue;
            }
            if let Err(e) = self.reclaim(&mut record, &mut broadcast) {
                // The record carries its partial progress: a contract leg
                // that went through flipped contract_broadcast, so the
                // retry only resubmits what is still missing.
                error!(contract = %record.contract_hash, error = %e,
                    "reclaim failed, re-queueing");
                retry.push(record);
            }
        }
        if !retry.is_empty() {
            let mut inner = self.lock();
            for record in retry {
                inner
                    .expiry_queue
                    .push(Reverse((now, record.server_id, record.contract_hash)));
                inner.channels.insert((record.server_id, record.contract_hash), record);
            }
        }

        let snapshot = self.serialize()?;
        self.persist_snapshot(&snapshot)?;
        Ok(broadcast)
    }

    /// Broadcasts contract-then-refund for one expired channel
    ///
    /// Appends each transaction to `broadcast` as its leg resolves and
    /// marks the contract broadcast on the record itself, so a later retry
    /// never resends a contract the network already accepted.
    fn reclaim(&self, record: &mut StoredClientChannel, broadcast: &mut Vec<Txid>) -> Result<()> {
        if !record.contract_broadcast {
            info!(contract = %record.contract_hash, "broadcasting contract before refund");
            self.broadcast_tx(&record.contract)?;
            record.contract_broadcast = true;
            broadcast.push(record.contract.compute_txid());
        }
        info!(contract = %record.contract_hash, "broadcasting refund");
        self.broadcast_tx(&record.refund)?;
        broadcast.push(record.refund.compute_txid());
        Ok(())
    }

    fn snapshot_locked(&self, inner: &ClientStoreInner) -> Result<Vec<u8>> {
        serde_json::to_vec(&inner.channels.values().collect::<Vec<_>>())
            .map_err(|e| StoreError::BadSnapshot(e.to_string()).into())
    }

    /// Hands one transaction to the broadcaster, classifying failures
    fn broadcast_tx(&self, tx: &Transaction) -> Result<()> {
        self.broadcaster
            .broadcast(tx)
            .map_err(|e| StoreError::BroadcastFailed(e.to_string()).into())
    }

    /// Hands a snapshot to the persist hook, classifying failures
    fn persist_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        self.persist
            .persist(snapshot)
            .map_err(|e| StoreError::PersistFailed(e.to_string()).into())
    }

    /// Drops every pending timer entry; used on registry teardown
    pub(crate) fn cancel_timers(&self) {
        self.lock().expiry_queue.clear();
    }

    fn lock(&self) -> MutexGuard<'_, ClientStoreInner> {
        self.inner.lock().expect("client store mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        stored_client_channel, test_expiry, RecordingBroadcaster, RecordingPersist,
        ScriptedBroadcaster,
    };
    use crate::types::COIN;

    fn store() -> (Arc<ClientChannelStore>, Arc<RecordingBroadcaster>, Arc<RecordingPersist>) {
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let persist = Arc::new(RecordingPersist::new());
        let store = Arc::new(ClientChannelStore::new(broadcaster.clone(), persist.clone()));
        (store, broadcaster, persist)
    }

    #[test]
    fn test_put_get_remove() {
        let (store, _, persist) = store();
        let record = stored_client_channel([7u8; 32], COIN, 0);

        store.put(record.clone()).expect("put should persist");

        assert_eq!(persist.calls(), 1);
        assert_eq!(
            store.get(&record.server_id, &record.contract_hash),
            Some(StoredClientChannel { active: false, ..record.clone() })
        );

        store.remove(&record.server_id, &record.contract_hash).expect("remove should persist");
        assert!(store.is_empty());
        assert_eq!(persist.calls(), 2);
    }

    #[test]
    fn test_checkout_inactive_excludes_active_and_expired() {
        let (store, _, _) = store();
        let record = stored_client_channel([7u8; 32], COIN, 0);
        store.put(record.clone()).expect("put should persist");
        let now = record.expiry - 100;

        let first = store
            .checkout_inactive(&record.server_id, now)
            .expect("an inactive record should check out");
        assert!(first.active);

        // A second session cannot claim the same channel.
        assert!(store.checkout_inactive(&record.server_id, now).is_none());

        store.mark_inactive(&record.server_id, &record.contract_hash);
        // An expired record does not check out either.
        assert!(store.checkout_inactive(&record.server_id, record.expiry).is_none());
    }

    #[test]
    fn test_tick_broadcasts_contract_then_refund() {
        let (store, broadcaster, _) = store();
        let record = stored_client_channel([7u8; 32], COIN, 0);
        store.put(record.clone()).expect("put should persist");

        // Before the slack elapses nothing fires.
        let none = store.tick(record.expiry).expect("tick should succeed");
        assert!(none.is_empty());

        let fired = store
            .tick(record.expiry + CLIENT_REFUND_SLACK_SECS)
            .expect("tick should succeed");

        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0], record.contract.compute_txid());
        assert_eq!(fired[1], record.refund.compute_txid());
        assert_eq!(broadcaster.sent(), vec![record.contract.clone(), record.refund.clone()]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_tick_retries_refund_without_resending_contract() {
        // Contract leg succeeds, refund leg is rejected once.
        let broadcaster = Arc::new(ScriptedBroadcaster::with_plan([true, false]));
        let persist = Arc::new(RecordingPersist::new());
        let store = ClientChannelStore::new(broadcaster.clone(), persist);
        let record = stored_client_channel([8u8; 32], COIN, 0);
        store.put(record.clone()).expect("put should persist");
        let fire_at = record.expiry + CLIENT_REFUND_SLACK_SECS;

        let first = store.tick(fire_at).expect("tick should succeed");

        // Only the contract made it out; the record is back in the store
        // with its partial progress remembered.
        assert_eq!(first, vec![record.contract.compute_txid()]);
        let requeued = store
            .get(&record.server_id, &record.contract_hash)
            .expect("failed record should be re-queued");
        assert!(requeued.contract_broadcast);

        let second = store.tick(fire_at).expect("tick should succeed");

        assert_eq!(second, vec![record.refund.compute_txid()]);
        assert!(store.is_empty());
        // The contract was never resent.
        assert_eq!(broadcaster.sent(), vec![record.contract, record.refund]);
    }

    #[test]
    fn test_tick_skips_removed_channels() {
        let (store, broadcaster, _) = store();
        let record = stored_client_channel([7u8; 32], COIN, 0);
        store.put(record.clone()).expect("put should persist");
        store.remove(&record.server_id, &record.contract_hash).expect("remove should persist");

        let fired = store
            .tick(record.expiry + CLIENT_REFUND_SLACK_SECS)
            .expect("tick should succeed");

        assert!(fired.is_empty());
        assert!(broadcaster.sent().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (store, broadcaster, persist) = store();
        for i in 0..3u8 {
            store
                .put(stored_client_channel([i; 32], COIN, u64::from(i)))
                .expect("put should persist");
        }
        let mut originals: Vec<_> = (0..3u8)
            .map(|i| stored_client_channel([i; 32], COIN, u64::from(i)))
            .collect();
        originals.iter_mut().for_each(|r| r.active = false);

        let snapshot = store.serialize().expect("snapshot should serialize");
        let restored = ClientChannelStore::deserialize(
            broadcaster,
            persist,
            CLIENT_REFUND_SLACK_SECS,
            &snapshot,
        )
        .expect("snapshot should deserialize");

        assert_eq!(restored.channel_count(), 3);
        for original in originals {
            let record = restored
                .get(&original.server_id, &original.contract_hash)
                .expect("restored store should hold the record");
            assert_eq!(record, original);
            assert!(!record.active);
        }
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        let (_, broadcaster, persist) = store();

        let err = ClientChannelStore::deserialize(
            broadcaster,
            persist,
            CLIENT_REFUND_SLACK_SECS,
            b"not json",
        )
        .expect_err("garbage should not deserialize");

        assert!(matches!(err, crate::Error::Store(StoreError::BadSnapshot(_))));
    }

    #[test]
    fn test_restored_store_still_fires_timers() {
        let (store, _, _) = store();
        let record = stored_client_channel([9u8; 32], COIN, 0);
        store.put(record.clone()).expect("put should persist");
        let snapshot = store.serialize().expect("snapshot should serialize");

        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let persist = Arc::new(RecordingPersist::new());
        let restored = ClientChannelStore::deserialize(
            broadcaster.clone(),
            persist,
            CLIENT_REFUND_SLACK_SECS,
            &snapshot,
        )
        .expect("snapshot should deserialize");

        let fired = restored
            .tick(test_expiry() + CLIENT_REFUND_SLACK_SECS)
            .expect("tick should succeed");

        assert_eq!(fired.len(), 2);
        assert!(restored.is_empty());
        assert_eq!(broadcaster.sent().len(), 2);
    }
}
