//! Payer-side channel state
//!
//! Tracks one channel from the payer's point of view: the negotiated
//! contract and refund, the amount paid so far, and the latest signed
//! settlement. Transitions are strictly forward; malformed peer input
//! drives the channel into the terminal `Error` state.
//!
//! # Invariants
//!
//! - A fully signed refund exists before the contract is released
//! - The paid amount never decreases and never exceeds
//!   `V - fee - dust`
//! - Only the `Open` state accepts payment increments

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, Transaction, Txid};

use crate::errors::{ChannelError, Result};
use crate::traits::ChannelWallet;
use crate::tx::{
    build_contract_transaction, build_refund_transaction, build_settlement_transaction,
    complete_contract_spend, contract_spend_signature, multisig_script,
    verify_contract_spend_signature, CONTRACT_OUTPUT_INDEX,
};
use crate::types::{DUST_LIMIT, TIME_WINDOW_GRACE_SECS};

/// Payer-side channel lifecycle
///
/// State transitions:
/// - New → WaitingForRefundSig (via `provide_initiate`)
/// - WaitingForRefundSig → Ready (via `provide_refund_signature`)
/// - Ready → Open (via `set_open`, once the peer confirms)
/// - Open → Closed (via `close`)
/// - any → Error (via `fail`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLifecycle {
    /// Channel object exists but no contract has been negotiated
    New,
    /// Refund sent to the payee, waiting for its signature
    WaitingForRefundSig,
    /// Refund complete; contract may be released
    Ready,
    /// Channel confirmed open; payments may flow
    Open,
    /// Channel closed; object is inert
    Closed,
    /// Terminal error state
    Error,
}

impl ClientLifecycle {
    fn name(self) -> &'static str {
        match self {
            ClientLifecycle::New => "New",
            ClientLifecycle::WaitingForRefundSig => "WaitingForRefundSig",
            ClientLifecycle::Ready => "Ready",
            ClientLifecycle::Open => "Open",
            ClientLifecycle::Closed => "Closed",
            ClientLifecycle::Error => "Error",
        }
    }
}

/// A signed settlement retained by the payer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedSettlement {
    /// The settlement transaction at the current paid amount
    pub transaction: Transaction,
    /// The payer's signature over it
    pub payer_signature: Signature,
    /// The wire `clientChangeValue` it was built from
    pub client_change: u64,
}

/// The payer's view of a single channel
#[derive(Debug, Clone)]
pub struct ClientChannel {
    payer_key: SecretKey,
    payer_pubkey: PublicKey,
    payee_pubkey: Option<PublicKey>,
    value: u64,
    fee: u64,
    max_time_window: u64,
    paid: u64,
    expiry: u64,
    contract: Option<Transaction>,
    refund: Option<Transaction>,
    refund_complete: bool,
    latest_settlement: Option<SignedSettlement>,
    lifecycle: ClientLifecycle,
}

impl ClientChannel {
    /// Creates a fresh payer-side channel
    ///
    /// # Arguments
    /// * `payer_key` - The payer's channel secret key
    /// * `value` - Total value V to lock into the contract
    /// * `fee` - Fixed settlement fee
    /// * `max_time_window` - Longest acceptable channel lifetime in seconds
    pub fn new(payer_key: SecretKey, value: u64, fee: u64, max_time_window: u64) -> Self {
        let secp = Secp256k1::new();
        let payer_pubkey = PublicKey::from_secret_key(&secp, &payer_key);
        Self {
            payer_key,
            payer_pubkey,
            payee_pubkey: None,
            value,
            fee,
            max_time_window,
            paid: 0,
            expiry: 0,
            contract: None,
            refund: None,
            refund_complete: false,
            latest_settlement: None,
            lifecycle: ClientLifecycle::New,
        }
    }

    /// Reconstructs an open channel from stored state, for session resume
    ///
    /// # Arguments
    /// * `payer_key` - The stored channel secret key
    /// * `payee_pubkey` - The payee's channel key
    /// * `value` / `paid` / `expiry` - Monetary and timing state at disconnect
    /// * `contract` / `refund` - The stored contract and fully signed refund
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        payer_key: SecretKey,
        payee_pubkey: PublicKey,
        value: u64,
        paid: u64,
        expiry: u64,
        contract: Transaction,
        refund: Transaction,
        fee: u64,
    ) -> Self {
        let secp = Secp256k1::new();
        let payer_pubkey = PublicKey::from_secret_key(&secp, &payer_key);
        Self {
            payer_key,
            payer_pubkey,
            payee_pubkey: Some(payee_pubkey),
            value,
            fee,
            max_time_window: 0,
            paid,
            expiry,
            contract: Some(contract),
            refund: Some(refund),
            refund_complete: true,
            latest_settlement: None,
            lifecycle: ClientLifecycle::Open,
        }
    }

    /// Handles the payee's `INITIATE` terms and builds contract and refund
    ///
    /// Validates the proposed minimum value and expiry, funds the contract
    /// through the wallet, and prepares the unsigned refund.
    ///
    /// # Arguments
    /// * `wallet` - Funding source for the contract
    /// * `payee_key` - The payee's channel public key from `INITIATE`
    /// * `min_value` - Smallest channel the payee will accept
    /// * `expiry` - Payee-proposed absolute expiry T_exp
    /// * `now` - Current wall-clock seconds
    ///
    /// # Errors
    /// * `ChannelError::ValueTooLarge` if `min_value` exceeds this channel's V
    /// * `ChannelError::TimeWindowTooLarge` if `expiry` is too far out
    pub fn provide_initiate(
        &mut self,
        wallet: &dyn ChannelWallet,
        payee_key: PublicKey,
        min_value: u64,
        expiry: u64,
        now: u64,
    ) -> Result<()> {
        self.require_state(ClientLifecycle::New, "provide_initiate")?;
        if min_value > self.value {
            return Err(
                ChannelError::ValueTooLarge { required: min_value, available: self.value }.into()
            );
        }
        let latest_acceptable = now + self.max_time_window + TIME_WINDOW_GRACE_SECS;
        if expiry > latest_acceptable {
            return Err(ChannelError::TimeWindowTooLarge { expiry, latest_acceptable }.into());
        }

        let contract = build_contract_transaction(
            wallet,
            &self.payer_pubkey,
            &payee_key,
            self.value,
            self.fee,
        )?;
        let outpoint =
            OutPoint { txid: contract.compute_txid(), vout: CONTRACT_OUTPUT_INDEX };
        let refund =
            build_refund_transaction(outpoint, self.value, &self.payer_pubkey, expiry)?;

        self.payee_pubkey = Some(payee_key);
        self.expiry = expiry;
        self.contract = Some(contract);
        self.refund = Some(refund);
        self.lifecycle = ClientLifecycle::WaitingForRefundSig;
        Ok(())
    }

    /// Returns the unsigned refund to send in `PROVIDE_REFUND`
    pub fn refund_for_signing(&self) -> Result<&Transaction> {
        self.require_state(ClientLifecycle::WaitingForRefundSig, "refund_for_signing")?;
        self.refund_ref()
    }

    /// Verifies and attaches the payee's refund signature
    ///
    /// On success the refund is fully signed (payer + payee) and the
    /// contract may be released.
    ///
    /// # Errors
    /// * `TxError::BadSignature` if the signature does not verify
    pub fn provide_refund_signature(&mut self, payee_signature: &Signature) -> Result<()> {
        self.require_state(ClientLifecycle::WaitingForRefundSig, "provide_refund_signature")?;
        let secp = Secp256k1::new();
        let payee_pubkey = self.payee_pubkey()?;
        let script = multisig_script(&self.payer_pubkey, &payee_pubkey);
        let refund = self.refund_ref()?.clone();

        verify_contract_spend_signature(&secp, &refund, &script, payee_signature, &payee_pubkey)?;
        let payer_signature = contract_spend_signature(&secp, &refund, &script, &self.payer_key)?;
        let complete = complete_contract_spend(refund, &payer_signature, payee_signature)?;

        self.refund = Some(complete);
        self.refund_complete = true;
        self.lifecycle = ClientLifecycle::Ready;
        Ok(())
    }

    /// Returns the contract for release to the payee
    ///
    /// Only available once the refund is fully signed.
    pub fn contract(&self) -> Result<&Transaction> {
        if !self.refund_complete {
            return Err(ChannelError::InvalidState {
                operation: "contract",
                state: self.lifecycle.name(),
            }
            .into());
        }
        self.contract
            .as_ref()
            .ok_or_else(|| crate::Error::Internal("refund complete without a contract".to_string()))
    }

    /// Marks the channel open after the peer's `CHANNEL_OPEN`
    pub fn set_open(&mut self) -> Result<()> {
        self.require_state(ClientLifecycle::Ready, "set_open")?;
        self.lifecycle = ClientLifecycle::Open;
        Ok(())
    }

    /// Signs a settlement paying `delta` more to the payee
    ///
    /// # Returns
    /// The retained settlement, carrying the wire change value and signature
    ///
    /// # Errors
    /// * `ChannelError::ChannelNotOpen` outside the `Open` state
    /// * `ChannelError::IncrementTooLarge` past the spendable ceiling
    pub fn increment_payment(&mut self, delta: u64) -> Result<&SignedSettlement> {
        if self.lifecycle != ClientLifecycle::Open {
            return Err(ChannelError::ChannelNotOpen(self.lifecycle.name()).into());
        }
        let ceiling = self.spendable_ceiling();
        let new_paid = self.paid.checked_add(delta).filter(|&p| p <= ceiling).ok_or(
            ChannelError::IncrementTooLarge { delta, paid: self.paid, ceiling },
        )?;

        let secp = Secp256k1::new();
        let payee_pubkey = self.payee_pubkey()?;
        let script = multisig_script(&self.payer_pubkey, &payee_pubkey);
        let transaction = build_settlement_transaction(
            self.contract_outpoint()?,
            self.value,
            new_paid,
            self.fee,
            &self.payer_pubkey,
            &payee_pubkey,
        )?;
        let payer_signature =
            contract_spend_signature(&secp, &transaction, &script, &self.payer_key)?;

        self.paid = new_paid;
        self.latest_settlement = Some(SignedSettlement {
            transaction,
            payer_signature,
            client_change: self.value - new_paid - self.fee,
        });
        self.latest_settlement
            .as_ref()
            .ok_or_else(|| crate::Error::Internal("settlement vanished after insert".to_string()))
    }

    /// Closes the channel; safe to call repeatedly
    ///
    /// # Returns
    /// The latest signed settlement, if any payment was ever made
    pub fn close(&mut self) -> Option<&SignedSettlement> {
        if self.lifecycle != ClientLifecycle::Error {
            self.lifecycle = ClientLifecycle::Closed;
        }
        self.latest_settlement.as_ref()
    }

    /// Drives the channel into the terminal error state
    pub fn fail(&mut self) {
        self.lifecycle = ClientLifecycle::Error;
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> ClientLifecycle {
        self.lifecycle
    }

    /// Total channel value V
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Amount paid to the payee so far
    pub fn paid(&self) -> u64 {
        self.paid
    }

    /// Fixed settlement fee this channel's signatures commit to
    pub fn fee(&self) -> u64 {
        self.fee
    }

    /// Absolute channel expiry T_exp
    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    /// The payer's channel public key
    pub fn payer_pubkey(&self) -> PublicKey {
        self.payer_pubkey
    }

    /// The payer's channel secret key, for store snapshots
    pub fn payer_key(&self) -> SecretKey {
        self.payer_key
    }

    /// The payee's channel public key, once learned from `INITIATE`
    pub fn payee_pubkey(&self) -> Result<PublicKey> {
        self.payee_pubkey
            .ok_or_else(|| crate::Error::Internal("payee key requested before INITIATE".to_string()))
    }

    /// Hash of the contract transaction
    pub fn contract_hash(&self) -> Result<Txid> {
        Ok(self.contract_outpoint()?.txid)
    }

    /// The fully signed refund, once the payee countersigned
    pub fn signed_refund(&self) -> Result<&Transaction> {
        if !self.refund_complete {
            return Err(ChannelError::InvalidState {
                operation: "signed_refund",
                state: self.lifecycle.name(),
            }
            .into());
        }
        self.refund_ref()
    }

    /// Highest total the channel can ever pay out
    pub fn spendable_ceiling(&self) -> u64 {
        self.value.saturating_sub(self.fee).saturating_sub(DUST_LIMIT)
    }

    fn contract_outpoint(&self) -> Result<OutPoint> {
        let contract = self
            .contract
            .as_ref()
            .ok_or_else(|| crate::Error::Internal("contract requested before build".to_string()))?;
        Ok(OutPoint { txid: contract.compute_txid(), vout: CONTRACT_OUTPUT_INDEX })
    }

    fn refund_ref(&self) -> Result<&Transaction> {
        self.refund
            .as_ref()
            .ok_or_else(|| crate::Error::Internal("refund requested before build".to_string()))
    }

    fn require_state(&self, expected: ClientLifecycle, operation: &'static str) -> Result<()> {
        if self.lifecycle != expected {
            return Err(ChannelError::InvalidState { operation, state: self.lifecycle.name() }
                .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Error, TxError};
    use crate::test_utils::{test_expiry, test_keys, test_secret_keys, MockWallet};
    use crate::types::{CENT, COIN, DEFAULT_MAX_TIME_WINDOW_SECS, DEFAULT_SETTLEMENT_FEE};

    fn opened_channel() -> ClientChannel {
        let (payer_sk, _) = test_secret_keys();
        let (_, payee_pk) = test_keys();
        let wallet = MockWallet::with_balance(3 * COIN);
        let mut channel = ClientChannel::new(
            payer_sk,
            COIN,
            DEFAULT_SETTLEMENT_FEE,
            DEFAULT_MAX_TIME_WINDOW_SECS,
        );
        channel
            .provide_initiate(&wallet, payee_pk, CENT, test_expiry(), test_expiry() - 1_000)
            .expect("initiate should be accepted");
        channel
    }

    fn countersign_refund(channel: &mut ClientChannel) {
        let secp = Secp256k1::new();
        let (_, payee_sk) = test_secret_keys();
        let (payer_pk, payee_pk) = test_keys();
        let script = multisig_script(&payer_pk, &payee_pk);
        let refund = channel.refund_for_signing().expect("refund should be available").clone();
        let sig = contract_spend_signature(&secp, &refund, &script, &payee_sk)
            .expect("payee signing should succeed");
        channel.provide_refund_signature(&sig).expect("valid signature should attach");
    }

    #[test]
    fn test_provide_initiate() {
        let channel = opened_channel();

        assert_eq!(channel.lifecycle(), ClientLifecycle::WaitingForRefundSig);
        assert_eq!(channel.value(), COIN);
        assert_eq!(channel.paid(), 0);
        assert_eq!(channel.expiry(), test_expiry());
    }

    #[test]
    fn test_provide_initiate_value_too_large() {
        let (payer_sk, _) = test_secret_keys();
        let (_, payee_pk) = test_keys();
        let wallet = MockWallet::with_balance(3 * COIN);
        let mut channel = ClientChannel::new(
            payer_sk,
            COIN,
            DEFAULT_SETTLEMENT_FEE,
            DEFAULT_MAX_TIME_WINDOW_SECS,
        );

        let err = channel
            .provide_initiate(&wallet, payee_pk, COIN + 1, test_expiry(), test_expiry() - 1_000)
            .expect_err("a minimum above V should be rejected");

        assert!(matches!(
            err,
            Error::Channel(ChannelError::ValueTooLarge { required, available })
                if required == COIN + 1 && available == COIN
        ));
        assert_eq!(channel.lifecycle(), ClientLifecycle::New);
    }

    #[test]
    fn test_provide_initiate_time_window_too_large() {
        let (payer_sk, _) = test_secret_keys();
        let (_, payee_pk) = test_keys();
        let wallet = MockWallet::with_balance(3 * COIN);
        let mut channel = ClientChannel::new(
            payer_sk,
            COIN,
            DEFAULT_SETTLEMENT_FEE,
            DEFAULT_MAX_TIME_WINDOW_SECS,
        );
        let now = test_expiry();
        let too_far = now + 48 * 60 * 60;

        let err = channel
            .provide_initiate(&wallet, payee_pk, CENT, too_far, now)
            .expect_err("a 48h window should exceed the 24h default");

        assert!(matches!(
            err,
            Error::Channel(ChannelError::TimeWindowTooLarge { expiry, .. }) if expiry == too_far
        ));
    }

    #[test]
    fn test_refund_signature_flow() {
        let mut channel = opened_channel();

        // Contract is withheld until the refund is complete.
        assert!(channel.contract().is_err());

        countersign_refund(&mut channel);

        assert_eq!(channel.lifecycle(), ClientLifecycle::Ready);
        let refund = channel.signed_refund().expect("refund should be complete");
        assert!(!refund.input[0].script_sig.is_empty());
        channel.contract().expect("contract should now be released");
    }

    #[test]
    fn test_provide_refund_signature_rejects_garbage() {
        let secp = Secp256k1::new();
        let mut channel = opened_channel();
        let (_, payee_sk) = test_secret_keys();
        let (payer_pk, payee_pk) = test_keys();
        // Signature over the wrong digest (key order swapped in the script).
        let script = multisig_script(&payee_pk, &payer_pk);
        let refund = channel.refund_for_signing().expect("refund available").clone();
        let bad_sig = contract_spend_signature(&secp, &refund, &script, &payee_sk)
            .expect("signing succeeds");

        let err = channel
            .provide_refund_signature(&bad_sig)
            .expect_err("a wrong-digest signature should be rejected");

        assert!(matches!(err, Error::Tx(TxError::BadSignature)));
    }

    #[test]
    fn test_increment_payment() {
        let mut channel = opened_channel();
        countersign_refund(&mut channel);
        channel.set_open().expect("ready channel should open");

        let change = channel
            .increment_payment(CENT)
            .expect("first cent should go through")
            .client_change;
        assert_eq!(change, COIN - CENT - DEFAULT_SETTLEMENT_FEE);
        assert_eq!(channel.paid(), CENT);

        channel.increment_payment(CENT).expect("second cent should go through");
        channel.increment_payment(CENT).expect("third cent should go through");
        assert_eq!(channel.paid(), 3 * CENT);
    }

    #[test]
    fn test_increment_payment_requires_open() {
        let mut channel = opened_channel();
        countersign_refund(&mut channel);

        let err = channel.increment_payment(CENT).expect_err("Ready is not Open");

        assert!(matches!(err, Error::Channel(ChannelError::ChannelNotOpen("Ready"))));
    }

    #[test]
    fn test_increment_payment_ceiling() {
        let mut channel = opened_channel();
        countersign_refund(&mut channel);
        channel.set_open().expect("ready channel should open");
        let ceiling = channel.spendable_ceiling();

        channel.increment_payment(ceiling).expect("paying up to the ceiling is fine");
        let err = channel.increment_payment(1).expect_err("one past the ceiling fails");

        assert!(matches!(err, Error::Channel(ChannelError::IncrementTooLarge { .. })));
        assert_eq!(channel.paid(), ceiling);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut channel = opened_channel();
        countersign_refund(&mut channel);
        channel.set_open().expect("ready channel should open");
        channel.increment_payment(CENT).expect("payment should go through");

        let first = channel.close().cloned();
        let second = channel.close().cloned();

        assert_eq!(channel.lifecycle(), ClientLifecycle::Closed);
        assert_eq!(first, second);
        assert_eq!(first.expect("a settlement exists").client_change,
            COIN - CENT - DEFAULT_SETTLEMENT_FEE);
    }
}
