//! Capability interfaces supplied by the embedder
//!
//! The channel core never talks to the network, the wallet, or the system
//! clock directly. Embedders hand these narrow interfaces in at
//! construction time; the state machines themselves only ever return
//! outcomes, so no callback can re-enter the core while it holds a lock.

use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction};

use crate::errors::Result;

/// Pushes signed transactions to the peer-to-peer network
///
/// `broadcast` returns once the transaction has been accepted for relay.
/// Store timers submit their batches strictly in order, waiting for each
/// call to return before issuing the next, so implementations must not
/// reorder.
pub trait Broadcast: Send + Sync {
    /// Submits one transaction for relay
    fn broadcast(&self, tx: &Transaction) -> Result<()>;
}

/// Persists an opaque store snapshot
///
/// The stores call this after every mutation that must survive a restart
/// (insertions, accepted payment updates, deletions). The blob round-trips
/// through [`crate::store`] deserialization; its layout is private to this
/// crate.
pub trait Persist: Send + Sync {
    /// Writes the snapshot to durable storage
    fn persist(&self, snapshot: &[u8]) -> Result<()>;
}

/// Supplies the current wall-clock time
///
/// Expiry math runs entirely on this interface so tests can drive a mock
/// clock deterministically.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now(&self) -> u64;
}

/// The process wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A single spendable output offered for contract funding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingInput {
    /// Outpoint of the wallet UTXO
    pub outpoint: OutPoint,
    /// Value of the UTXO in satoshis
    pub value: u64,
}

/// Wallet operations the payer side needs to fund a contract
///
/// Key storage, coin selection policy, and input signing all remain the
/// wallet's business; the channel core only composes the outputs.
pub trait ChannelWallet: Send + Sync {
    /// Selects UTXOs whose combined value covers `target`
    ///
    /// # Errors
    /// * `TxError::InsufficientFunding` if the wallet cannot cover the target
    fn select_funding(&self, target: Amount) -> Result<Vec<FundingInput>>;

    /// Returns a fresh script to receive contract change
    fn change_script(&self) -> ScriptBuf;

    /// Signs every wallet-owned input of the contract transaction
    ///
    /// The 2-of-2 output needs no signature at this point; only the funding
    /// inputs belong to the wallet.
    fn sign_funding_inputs(&self, tx: Transaction) -> Result<Transaction>;
}
