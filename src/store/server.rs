//! Payee-side persistent channel store
//!
//! Holds every channel the payee has accepted, keyed by contract hash.
//! Records survive disconnects; shortly before `T_exp` the store signs and
//! broadcasts the best settlement for any channel no session has settled,
//! then drops the record — the refund becomes spendable at expiry, so
//! waiting longer would forfeit the payment.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::channel::ServerChannel;
use crate::errors::{Result, StoreError};
use crate::traits::{Broadcast, Persist};
use crate::types::SERVER_SETTLE_MARGIN_SECS;

/// Stable identifier under which the payee snapshot is stored by the
/// hosting wallet
pub const SERVER_EXTENSION_ID: &str = "spillway.server_channels";

/// One stored payee-side channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredServerChannel {
    /// Contract hash, the channel identifier
    pub contract_hash: Txid,
    /// The payee's channel secret key
    pub payee_key: SecretKey,
    /// The payer's channel public key
    pub payer_pubkey: PublicKey,
    /// The accepted contract transaction
    pub contract: Transaction,
    /// Output index of the multisig within the contract
    pub contract_vout: u32,
    /// Total channel value V
    pub value: u64,
    /// Best paid amount accepted so far
    pub best_paid: u64,
    /// The payer's signature over the best settlement
    pub best_payer_signature: Option<Signature>,
    /// Fixed settlement fee the signatures commit to
    pub fee: u64,
    /// Absolute channel expiry T_exp
    pub expiry: u64,
    /// Held by a live session right now; never persisted
    #[serde(skip)]
    pub active: bool,
}

#[derive(Default)]
struct ServerStoreInner {
    channels: BTreeMap<Txid, StoredServerChannel>,
    // Fire time, then key; lazily invalidated when records are removed.
    expiry_queue: BinaryHeap<Reverse<(u64, Txid)>>,
}

/// The payee's persistent channel store
pub struct ServerChannelStore {
    inner: Mutex<ServerStoreInner>,
    broadcaster: Arc<dyn Broadcast>,
    persist: Arc<dyn Persist>,
    settle_margin: u64,
}

impl ServerChannelStore {
    /// Creates an empty store with the default settle margin
    pub fn new(broadcaster: Arc<dyn Broadcast>, persist: Arc<dyn Persist>) -> Self {
        Self::with_margin(broadcaster, persist, SERVER_SETTLE_MARGIN_SECS)
    }

    /// Creates an empty store with an explicit pre-expiry settle margin
    pub fn with_margin(
        broadcaster: Arc<dyn Broadcast>,
        persist: Arc<dyn Persist>,
        settle_margin: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(ServerStoreInner::default()),
            broadcaster,
            persist,
            settle_margin,
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
        settle_margin: u64,
        snapshot: &[u8],
    ) -> Result<Self> {
        let records: Vec<StoredServerChannel> = serde_json::from_slice(snapshot)
            .map_err(|e| StoreError::BadSnapshot(e.to_string()))?;
        let store = Self::with_margin(broadcaster, persist, settle_margin);
        {
            let mut inner = store.lock();
            for record in records {
                let fire_at = record.expiry.saturating_sub(store.settle_margin);
                inner.expiry_queue.push(Reverse((fire_at, record.contract_hash)));
                inner.channels.insert(record.contract_hash, record);
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
    pub fn put(&self, record: StoredServerChannel) -> Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            let fire_at = record.expiry.saturating_sub(self.settle_margin);
            inner.expiry_queue.push(Reverse((fire_at, record.contract_hash)));
            debug!(contract = %record.contract_hash, "storing server channel");
            inner.channels.insert(record.contract_hash, record);
            self.snapshot_locked(&inner)?
        };
        self.persist_snapshot(&snapshot)
    }

    /// Looks up one channel record
    pub fn get(&self, contract_hash: &Txid) -> Option<StoredServerChannel> {
        self.lock().channels.get(contract_hash).cloned()
    }

    /// Number of stored channels
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// True when no channels are stored
    pub fn is_empty(&self) -> bool {
        self.channel_count() == 0
    }

    /// Claims an inactive stored channel for a resuming session
    ///
    /// Channels within the settle margin of expiry are not handed out; the
    /// expiry timer owns them. Marks the record active so a second session
    /// presenting the same hash falls through to a fresh channel.
    pub fn checkout_inactive(&self, contract_hash: &Txid, now: u64) -> Option<StoredServerChannel> {
        let mut inner = self.lock();
        let record = inner.channels.get_mut(contract_hash)?;
        if record.active || record.expiry.saturating_sub(self.settle_margin) <= now {
            return None;
        }
        record.active = true;
        Some(record.clone())
    }

    /// Records a new best settlement after an accepted payment
    ///
    /// Committed (and persisted) before the accepting session acknowledges
    /// the update to its embedder.
    ///
    /// # Errors
    /// * `StoreError::ChannelNotFound` for an unknown key
    pub fn update_best(
        &self,
        contract_hash: &Txid,
        paid: u64,
        payer_signature: Signature,
    ) -> Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            let record = inner
                .channels
                .get_mut(contract_hash)
                .ok_or(StoreError::ChannelNotFound(*contract_hash))?;
            record.best_paid = paid;
            record.best_payer_signature = Some(payer_signature);
            self.snapshot_locked(&inner)?
        };
        self.persist_snapshot(&snapshot)
    }

    /// Flips a channel inactive when its session ends; data is retained
    pub fn mark_inactive(&self, contract_hash: &Txid) {
        if let Some(record) = self.lock().channels.get_mut(contract_hash) {
            record.active = false;
        }
    }

    /// Deletes a channel record after a protocol close
    ///
    /// Any pending expiry entry for it becomes a no-op.
    pub fn remove(&self, contract_hash: &Txid) -> Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            inner
                .channels
                .remove(contract_hash)
                .ok_or(StoreError::ChannelNotFound(*contract_hash))?;
            self.snapshot_locked(&inner)?
        };
        self.persist_snapshot(&snapshot)
    }

    /// Fires every due expiry timer
    ///
    /// For each channel within the settle margin of `T_exp`: completes the
    /// best settlement with the payee's signature, broadcasts it, and drops
    /// the record. Channels that never saw a payment are dropped without a
    /// broadcast; a channel whose broadcast fails is re-queued for the next
    /// tick rather than forfeited.
    ///
    /// # Returns
    /// The settlement transactions broadcast, in submission order
    pub fn tick(&self, now: u64) -> Result<Vec<Txid>> {
        // Collect due records under the lock; broadcast after dropping it.
        let due = {
            let mut inner = self.lock();
            let mut due = Vec::new();
            while let Some(Reverse((fire_at, contract_hash))) = inner.expiry_queue.peek().copied()
            {
                if fire_at > now {
                    break;
                }
                inner.expiry_queue.pop();
                // Stale entries for already-removed channels are no-ops.
                if let Some(record) = inner.channels.remove(&contract_hash) {
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
        for record in due {
            match self.settle_record(&record) {
                Ok(Some(settlement)) => {
                    let txid = settlement.compute_txid();
                    info!(contract = %record.contract_hash, paid = record.best_paid,
                        "broadcasting settlement at expiry");
                    match self.broadcast_tx(&settlement) {
                        Ok(()) => broadcast.push(txid),
                        Err(e) => {
                            error!(contract = %record.contract_hash, error = %e,
                                "settlement broadcast failed, re-queueing");
                            retry.push(record);
                        }
                    }
                }
                Ok(None) => {
                    debug!(contract = %record.contract_hash,
                        "channel expired without payments, nothing to settle");
                }
                Err(e) => {
                    error!(contract = %record.contract_hash, error = %e,
                        "failed to settle expiring channel");
                }
            }
        }
        if !retry.is_empty() {
            let mut inner = self.lock();
            for record in retry {
                inner.expiry_queue.push(Reverse((now, record.contract_hash)));
                inner.channels.insert(record.contract_hash, record);
            }
        }

        let snapshot = self.serialize()?;
        self.persist_snapshot(&snapshot)?;
        Ok(broadcast)
    }

    /// Completes the best settlement for one stored record
    fn settle_record(&self, record: &StoredServerChannel) -> Result<Option<Transaction>> {
        let mut channel = ServerChannel::resume(
            record.payee_key,
            record.payer_pubkey,
            record.contract.clone(),
            record.contract_vout,
            record.value,
            record.best_paid,
            record.best_payer_signature,
            record.expiry,
            record.fee,
        );
        channel.close()
    }

    fn snapshot_locked(&self, inner: &ServerStoreInner) -> Result<Vec<u8>> {
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

    fn lock(&self) -> MutexGuard<'_, ServerStoreInner> {
        self.inner.lock().expect("server store mutex poisoned")
    }
}
