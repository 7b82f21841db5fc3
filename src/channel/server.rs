//! Payee-side channel state
//!
//! Tracks one channel from the payee's point of view: the refund it
//! countersigned, the contract it accepted, and the best (highest-paying)
//! settlement signature received so far. On close it completes that
//! settlement with its own signature.
//!
//! # Invariants
//!
//! - Accepted settlements are strictly monotonic in the paid amount
//! - The refund is only ever signed before the contract is known
//! - The best settlement signature always verifies against the stored
//!   contract output

use bitcoin::consensus::encode::deserialize;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, Transaction, Txid};

use crate::errors::{ChannelError, Result, TxError};
use crate::tx::{
    build_settlement_transaction, complete_contract_spend, contract_spend_signature,
    find_contract_output, multisig_script, paid_from_change, validate_refund_for_signing,
    verify_contract_spend_signature,
};

/// Payee-side channel lifecycle
///
/// State transitions:
/// - WaitingForRefund → WaitingForContract (via `sign_refund`)
/// - WaitingForContract → Ready (via `provide_contract`)
/// - Ready → Open (via the first accepted `accept_payment`)
/// - Open → Closing → Closed (via `close`)
/// - any → Error (via `fail`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycle {
    /// Waiting for the payer's refund to countersign
    WaitingForRefund,
    /// Refund signed; waiting for the contract
    WaitingForContract,
    /// Contract accepted and broadcast; no payment yet
    Ready,
    /// At least one payment accepted
    Open,
    /// Close requested; settlement being finalized
    Closing,
    /// Channel settled; object is inert
    Closed,
    /// Terminal error state
    Error,
}

impl ServerLifecycle {
    fn name(self) -> &'static str {
        match self {
            ServerLifecycle::WaitingForRefund => "WaitingForRefund",
            ServerLifecycle::WaitingForContract => "WaitingForContract",
            ServerLifecycle::Ready => "Ready",
            ServerLifecycle::Open => "Open",
            ServerLifecycle::Closing => "Closing",
            ServerLifecycle::Closed => "Closed",
            ServerLifecycle::Error => "Error",
        }
    }
}

/// The payee's view of a single channel
#[derive(Debug, Clone)]
pub struct ServerChannel {
    payee_key: SecretKey,
    payee_pubkey: PublicKey,
    payer_pubkey: Option<PublicKey>,
    min_value: u64,
    fee: u64,
    expiry: u64,
    refund_outpoint: Option<OutPoint>,
    contract: Option<Transaction>,
    contract_outpoint: Option<OutPoint>,
    value: u64,
    best_paid: u64,
    best_payer_signature: Option<Signature>,
    lifecycle: ServerLifecycle,
}

impl ServerChannel {
    /// Creates a fresh payee-side channel
    ///
    /// # Arguments
    /// * `payee_key` - The payee's channel secret key
    /// * `min_value` - Smallest contract value this payee accepts
    /// * `fee` - Fixed settlement fee
    /// * `expiry` - Absolute expiry T_exp proposed in `INITIATE`
    pub fn new(payee_key: SecretKey, min_value: u64, fee: u64, expiry: u64) -> Self {
        let secp = Secp256k1::new();
        let payee_pubkey = PublicKey::from_secret_key(&secp, &payee_key);
        Self {
            payee_key,
            payee_pubkey,
            payer_pubkey: None,
            min_value,
            fee,
            expiry,
            refund_outpoint: None,
            contract: None,
            contract_outpoint: None,
            value: 0,
            best_paid: 0,
            best_payer_signature: None,
            lifecycle: ServerLifecycle::WaitingForRefund,
        }
    }

    /// Reconstructs an open channel from stored state, for session resume
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        payee_key: SecretKey,
        payer_pubkey: PublicKey,
        contract: Transaction,
        contract_vout: u32,
        value: u64,
        best_paid: u64,
        best_payer_signature: Option<Signature>,
        expiry: u64,
        fee: u64,
    ) -> Self {
        let secp = Secp256k1::new();
        let payee_pubkey = PublicKey::from_secret_key(&secp, &payee_key);
        let outpoint = OutPoint { txid: contract.compute_txid(), vout: contract_vout };
        Self {
            payee_key,
            payee_pubkey,
            payer_pubkey: Some(payer_pubkey),
            min_value: 0,
            fee,
            expiry,
            refund_outpoint: Some(outpoint),
            contract: Some(contract),
            contract_outpoint: Some(outpoint),
            value,
            best_paid,
            best_payer_signature,
            lifecycle: ServerLifecycle::Open,
        }
    }

    /// Validates and countersigns the payer's refund
    ///
    /// # Arguments
    /// * `refund_bytes` - Raw refund transaction from `PROVIDE_REFUND`
    /// * `payer_key_bytes` - The payer's 33-byte channel key from the same
    ///   message
    ///
    /// # Returns
    /// The payee's signature, to return in `RETURN_REFUND`
    ///
    /// # Errors
    /// * `TxError::InvalidKey` / `TxError::Undecodable` on malformed fields
    /// * `TxError::BadTransaction` on structural or lock-time mismatch
    pub fn sign_refund(
        &mut self,
        refund_bytes: &[u8],
        payer_key_bytes: &[u8],
    ) -> Result<Signature> {
        self.require_state(ServerLifecycle::WaitingForRefund, "sign_refund")?;
        let payer_pubkey =
            PublicKey::from_slice(payer_key_bytes).map_err(|_| TxError::InvalidKey)?;
        let refund: Transaction =
            deserialize(refund_bytes).map_err(|_| TxError::Undecodable)?;
        let refund_outpoint = validate_refund_for_signing(&refund, &payer_pubkey, self.expiry)?;

        let secp = Secp256k1::new();
        let script = multisig_script(&payer_pubkey, &self.payee_pubkey);
        let signature = contract_spend_signature(&secp, &refund, &script, &self.payee_key)?;

        self.payer_pubkey = Some(payer_pubkey);
        self.refund_outpoint = Some(refund_outpoint);
        self.lifecycle = ServerLifecycle::WaitingForContract;
        Ok(signature)
    }

    /// Validates and accepts the contract transaction
    ///
    /// The contract must carry a 2-of-2 output over the exchanged keys, of
    /// at least the advertised minimum value, at the exact outpoint the
    /// previously signed refund spends.
    ///
    /// # Returns
    /// The contract hash, which becomes the channel identifier
    ///
    /// # Errors
    /// * `TxError::BadTransaction` on any mismatch
    pub fn provide_contract(&mut self, contract_bytes: &[u8]) -> Result<Txid> {
        self.require_state(ServerLifecycle::WaitingForContract, "provide_contract")?;
        let contract: Transaction =
            deserialize(contract_bytes).map_err(|_| TxError::Undecodable)?;
        let payer_pubkey = self.payer_pubkey()?;
        let (vout, value) = find_contract_output(&contract, &payer_pubkey, &self.payee_pubkey)?;
        if value < self.min_value {
            return Err(TxError::BadTransaction(format!(
                "contract value {value} below accepted minimum {}",
                self.min_value
            ))
            .into());
        }
        let txid = contract.compute_txid();
        let outpoint = OutPoint { txid, vout };
        let refund_outpoint = self.refund_outpoint.ok_or_else(|| {
            crate::Error::Internal("contract offered before refund".to_string())
        })?;
        if refund_outpoint != outpoint {
            return Err(TxError::BadTransaction(
                "contract output does not match the signed refund's input".to_string(),
            )
            .into());
        }

        self.contract = Some(contract);
        self.contract_outpoint = Some(outpoint);
        self.value = value;
        self.lifecycle = ServerLifecycle::Ready;
        Ok(txid)
    }

    /// Verifies and accepts one `UPDATE_PAYMENT`
    ///
    /// Rebuilds the settlement from the wire change value, checks strict
    /// monotonicity of the paid amount, and verifies the payer's signature
    /// before replacing the best settlement.
    ///
    /// # Returns
    /// `(delta, new_total)` for the embedder's payment event
    ///
    /// # Errors
    /// * `ChannelError::BadValue` if the paid amount does not increase
    /// * `TxError::BadSignature` if the signature does not verify
    pub fn accept_payment(&mut self, client_change: u64, signature: &Signature) -> Result<(u64, u64)> {
        if !matches!(self.lifecycle, ServerLifecycle::Ready | ServerLifecycle::Open) {
            return Err(ChannelError::ChannelNotOpen(self.lifecycle.name()).into());
        }
        let paid = paid_from_change(self.value, client_change, self.fee)?;
        if paid <= self.best_paid {
            return Err(ChannelError::BadValue { new: paid, current: self.best_paid }.into());
        }

        let secp = Secp256k1::new();
        let payer_pubkey = self.payer_pubkey()?;
        let script = multisig_script(&payer_pubkey, &self.payee_pubkey);
        let settlement = build_settlement_transaction(
            self.contract_outpoint()?,
            self.value,
            paid,
            self.fee,
            &payer_pubkey,
            &self.payee_pubkey,
        )?;
        verify_contract_spend_signature(&secp, &settlement, &script, signature, &payer_pubkey)?;

        let delta = paid - self.best_paid;
        self.best_paid = paid;
        self.best_payer_signature = Some(*signature);
        self.lifecycle = ServerLifecycle::Open;
        Ok((delta, paid))
    }

    /// Completes the best settlement and closes the channel
    ///
    /// Safe to call repeatedly; only the first call returns a transaction.
    ///
    /// # Returns
    /// The fully signed settlement for broadcast, or `None` when no payment
    /// was ever accepted (nothing to settle)
    pub fn close(&mut self) -> Result<Option<Transaction>> {
        match self.lifecycle {
            ServerLifecycle::Closed | ServerLifecycle::Error => return Ok(None),
            ServerLifecycle::Closing => return Ok(None),
            _ => {}
        }
        let Some(payer_signature) = self.best_payer_signature else {
            self.lifecycle = ServerLifecycle::Closed;
            return Ok(None);
        };
        self.lifecycle = ServerLifecycle::Closing;

        let secp = Secp256k1::new();
        let payer_pubkey = self.payer_pubkey()?;
        let script = multisig_script(&payer_pubkey, &self.payee_pubkey);
        let settlement = build_settlement_transaction(
            self.contract_outpoint()?,
            self.value,
            self.best_paid,
            self.fee,
            &payer_pubkey,
            &self.payee_pubkey,
        )?;
        let payee_signature =
            contract_spend_signature(&secp, &settlement, &script, &self.payee_key)?;
        let complete =
            complete_contract_spend(settlement, &payer_signature, &payee_signature)?;

        self.lifecycle = ServerLifecycle::Closed;
        Ok(Some(complete))
    }

    /// Drives the channel into the terminal error state
    pub fn fail(&mut self) {
        self.lifecycle = ServerLifecycle::Error;
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> ServerLifecycle {
        self.lifecycle
    }

    /// Accepted contract value V (zero before the contract arrives)
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Best paid amount accepted so far
    pub fn best_paid(&self) -> u64 {
        self.best_paid
    }

    /// Fixed settlement fee this channel's signatures commit to
    pub fn fee(&self) -> u64 {
        self.fee
    }

    /// Absolute channel expiry T_exp
    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    /// The payee's channel public key, sent in `INITIATE`
    pub fn payee_pubkey(&self) -> PublicKey {
        self.payee_pubkey
    }

    /// The payee's channel secret key, for store snapshots
    pub fn payee_key(&self) -> SecretKey {
        self.payee_key
    }

    /// The payer's channel public key, once learned from `PROVIDE_REFUND`
    pub fn payer_pubkey(&self) -> Result<PublicKey> {
        self.payer_pubkey.ok_or_else(|| {
            crate::Error::Internal("payer key requested before PROVIDE_REFUND".to_string())
        })
    }

    /// The accepted contract transaction
    pub fn contract(&self) -> Result<&Transaction> {
        self.contract.as_ref().ok_or_else(|| {
            crate::Error::Internal("contract requested before PROVIDE_CONTRACT".to_string())
        })
    }

    /// The best payer signature, for store snapshots
    pub fn best_payer_signature(&self) -> Option<Signature> {
        self.best_payer_signature
    }

    /// Output index of the multisig within the accepted contract
    pub fn contract_vout(&self) -> Result<u32> {
        Ok(self.contract_outpoint()?.vout)
    }

    fn contract_outpoint(&self) -> Result<OutPoint> {
        self.contract_outpoint.ok_or_else(|| {
            crate::Error::Internal("contract outpoint requested before acceptance".to_string())
        })
    }

    fn require_state(&self, expected: ServerLifecycle, operation: &'static str) -> Result<()> {
        if self.lifecycle != expected {
            return Err(ChannelError::InvalidState { operation, state: self.lifecycle.name() }
                .into());
        }
        Ok(())
    }
}
