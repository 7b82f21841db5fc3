//! Shared test utilities
//!
//! Deterministic keys, a funded mock wallet, and recording broadcaster /
//! persist hooks used across the module tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::channel::{ClientChannel, ServerChannel};
use crate::errors::{Result, TxError};
use crate::store::{StoredClientChannel, StoredServerChannel};
use crate::traits::{Broadcast, ChannelWallet, Clock, FundingInput, Persist};
use crate::tx::{multisig_script, payout_script};
use crate::types::{CENT, COIN, DEFAULT_MAX_TIME_WINDOW_SECS, DEFAULT_SETTLEMENT_FEE};

/// Deterministically derive a secret key from a single byte (tests only)
fn deterministic_secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).expect("32-byte array should always be a valid SecretKey")
}

/// Payer and payee secret keys used throughout the tests
pub fn test_secret_keys() -> (SecretKey, SecretKey) {
    (deterministic_secret(1), deterministic_secret(2))
}

/// Payer and payee public keys matching [`test_secret_keys`]
pub fn test_keys() -> (PublicKey, PublicKey) {
    let secp = Secp256k1::new();
    let (payer_sk, payee_sk) = test_secret_keys();
    (
        PublicKey::from_secret_key(&secp, &payer_sk),
        PublicKey::from_secret_key(&secp, &payee_sk),
    )
}

/// A fixed absolute expiry comfortably inside lock-by-time range
pub fn test_expiry() -> u64 {
    1_700_086_400
}

/// Wallet with a single UTXO of a fixed balance
pub struct MockWallet {
    balance: u64,
}

impl MockWallet {
    /// Creates a wallet holding one UTXO of `balance` satoshis
    pub fn with_balance(balance: u64) -> Self {
        Self { balance }
    }

    fn utxo_outpoint(&self) -> OutPoint {
        // Distinct wallets produce distinct funding outpoints.
        let digest = sha256::Hash::hash(&self.balance.to_le_bytes());
        OutPoint { txid: Txid::from_byte_array(digest.to_byte_array()), vout: 0 }
    }
}

impl ChannelWallet for MockWallet {
    fn select_funding(&self, target: Amount) -> Result<Vec<FundingInput>> {
        if self.balance < target.to_sat() {
            return Err(TxError::InsufficientFunding {
                available: self.balance,
                required: target.to_sat(),
            }
            .into());
        }
        Ok(vec![FundingInput { outpoint: self.utxo_outpoint(), value: self.balance }])
    }

    fn change_script(&self) -> ScriptBuf {
        let secp = Secp256k1::new();
        let change_key = PublicKey::from_secret_key(&secp, &deterministic_secret(3));
        payout_script(&change_key)
    }

    fn sign_funding_inputs(&self, mut tx: Transaction) -> Result<Transaction> {
        // Stand-in unlocking data; the channel core never validates
        // funding-input signatures.
        for input in &mut tx.input {
            input.script_sig = Builder::new().push_slice([0x51u8]).into_script();
        }
        Ok(tx)
    }
}

/// Broadcaster that records every transaction it accepts
#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: Mutex<Vec<Transaction>>,
}

impl RecordingBroadcaster {
    /// Creates an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transaction broadcast so far, in order
    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.lock().expect("broadcast recorder poisoned").clone()
    }
}

impl Broadcast for RecordingBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<()> {
        self.sent.lock().expect("broadcast recorder poisoned").push(tx.clone());
        Ok(())
    }
}

/// Broadcaster that follows a scripted accept/reject sequence
///
/// Each broadcast consumes the next entry of the plan: `true` records the
/// transaction, `false` rejects it. An exhausted plan accepts everything.
pub struct ScriptedBroadcaster {
    plan: Mutex<VecDeque<bool>>,
    sent: Mutex<Vec<Transaction>>,
}

impl ScriptedBroadcaster {
    /// Creates a broadcaster following `plan`
    pub fn with_plan(plan: impl IntoIterator<Item = bool>) -> Self {
        Self {
            plan: Mutex::new(plan.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every transaction accepted so far, in order
    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.lock().expect("broadcast script poisoned").clone()
    }
}

impl Broadcast for ScriptedBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<()> {
        let accept = self
            .plan
            .lock()
            .expect("broadcast script poisoned")
            .pop_front()
            .unwrap_or(true);
        if !accept {
            return Err(crate::Error::Internal("scripted broadcast rejection".to_string()));
        }
        self.sent.lock().expect("broadcast script poisoned").push(tx.clone());
        Ok(())
    }
}

/// Persist hook that counts invocations and keeps the last snapshot
#[derive(Default)]
pub struct RecordingPersist {
    snapshots: Mutex<Vec<Vec<u8>>>,
}

impl RecordingPersist {
    /// Creates an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persist calls so far
    pub fn calls(&self) -> usize {
        self.snapshots.lock().expect("persist recorder poisoned").len()
    }

    /// The most recent snapshot, if any
    pub fn last(&self) -> Option<Vec<u8>> {
        self.snapshots.lock().expect("persist recorder poisoned").last().cloned()
    }
}

impl Persist for RecordingPersist {
    fn persist(&self, snapshot: &[u8]) -> Result<()> {
        self.snapshots.lock().expect("persist recorder poisoned").push(snapshot.to_vec());
        Ok(())
    }
}

/// Settable clock for deterministic expiry tests
pub struct MockClock {
    now: Mutex<u64>,
}

impl MockClock {
    /// Creates a clock frozen at `now`
    pub fn at(now: u64) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Advances the clock by `secs`
    pub fn advance(&self, secs: u64) {
        *self.now.lock().expect("mock clock poisoned") += secs;
    }
}

impl Clock for MockClock {
    fn now(&self) -> u64 {
        *self.now.lock().expect("mock clock poisoned")
    }
}

/// Runs the full handshake between fresh client and server channel objects
pub fn open_channel_pair() -> (ClientChannel, ServerChannel) {
    use bitcoin::consensus::encode::serialize;

    let (payer_sk, payee_sk) = test_secret_keys();
    let wallet = MockWallet::with_balance(3 * COIN);
    let mut client = ClientChannel::new(
        payer_sk,
        COIN,
        DEFAULT_SETTLEMENT_FEE,
        DEFAULT_MAX_TIME_WINDOW_SECS,
    );
    let mut server = ServerChannel::new(payee_sk, CENT, DEFAULT_SETTLEMENT_FEE, test_expiry());

    client
        .provide_initiate(
            &wallet,
            server.payee_pubkey(),
            CENT,
            test_expiry(),
            test_expiry() - 1_000,
        )
        .expect("initiate should be accepted");
    let refund_bytes = serialize(client.refund_for_signing().expect("refund available"));
    let signature = server
        .sign_refund(&refund_bytes, &client.payer_pubkey().serialize())
        .expect("refund should be signed");
    client.provide_refund_signature(&signature).expect("signature should attach");
    let contract_bytes = serialize(client.contract().expect("contract released"));
    server.provide_contract(&contract_bytes).expect("contract should be accepted");
    client.set_open().expect("client should open");
    (client, server)
}

/// Builds a deterministic stored payer-side channel record
///
/// `salt` varies the funding outpoint so records get distinct contract
/// hashes.
pub fn stored_client_channel(server_id: [u8; 32], value: u64, salt: u64) -> StoredClientChannel {
    let (payer_sk, _) = test_secret_keys();
    let (payer_pk, payee_pk) = test_keys();
    let contract = synthetic_contract(value, salt, &payer_pk, &payee_pk);
    let contract_hash = contract.compute_txid();
    let refund = synthetic_signed_refund(&contract, value, &payer_pk);
    StoredClientChannel {
        server_id,
        contract_hash,
        payer_key: payer_sk,
        payee_pubkey: payee_pk,
        value,
        paid: 0,
        fee: DEFAULT_SETTLEMENT_FEE,
        expiry: test_expiry(),
        contract,
        refund,
        latest_settlement: None,
        contract_broadcast: false,
        active: false,
    }
}

/// Builds a deterministic stored payee-side channel record with no payments
pub fn stored_server_channel(value: u64, salt: u64) -> StoredServerChannel {
    let (_, payee_sk) = test_secret_keys();
    let (payer_pk, payee_pk) = test_keys();
    let contract = synthetic_contract(value, salt, &payer_pk, &payee_pk);
    StoredServerChannel {
        contract_hash: contract.compute_txid(),
        payee_key: payee_sk,
        payer_pubkey: payer_pk,
        contract,
        contract_vout: 0,
        value,
        best_paid: 0,
        best_payer_signature: None,
        fee: DEFAULT_SETTLEMENT_FEE,
        expiry: test_expiry(),
        active: false,
    }
}

fn synthetic_contract(
    value: u64,
    salt: u64,
    payer_pk: &PublicKey,
    payee_pk: &PublicKey,
) -> Transaction {
    let digest = sha256::Hash::hash(&salt.to_le_bytes());
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint { txid: Txid::from_byte_array(digest.to_byte_array()), vout: 0 },
            script_sig: Builder::new().push_slice([0x51u8]).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: multisig_script(payer_pk, payee_pk),
        }],
    }
}

fn synthetic_signed_refund(contract: &Transaction, value: u64, payer_pk: &PublicKey) -> Transaction {
    let lock_time = u32::try_from(test_expiry())
        .ok()
        .and_then(|secs| LockTime::from_time(secs).ok())
        .expect("test expiry is lock-by-time representable");
    Transaction {
        version: Version::ONE,
        lock_time,
        input: vec![TxIn {
            previous_output: OutPoint { txid: contract.compute_txid(), vout: 0 },
            // Stand-in for the completed 2-of-2 scriptSig.
            script_sig: Builder::new().push_slice([0x00u8, 0x01u8]).into_script(),
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: payout_script(payer_pk),
        }],
    }
}
