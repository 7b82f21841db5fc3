//! Time-locked refund transaction builder and validation
//!
//! The refund returns the full channel value to the payer once the
//! channel's absolute expiry has passed. It is half-signed by the payer,
//! countersigned by the payee during the handshake, and must be complete
//! before the contract is released.

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::errors::{Result, TxError};
use crate::tx::script::payout_script;

/// Builds the unsigned refund spending the contract output
///
/// The single output pays the full contract value back to P2PKH over the
/// payer's channel key. The input sequence is set below `Sequence::MAX` so
/// the transaction-level lock time is consensus-enforced.
///
/// # Arguments
/// * `contract_outpoint` - The 2-of-2 output being refunded
/// * `value` - Full contract value V
/// * `payer_key` - The payer's channel public key (refund destination)
/// * `expiry` - Absolute expiry T_exp in seconds since the epoch
///
/// # Errors
/// * `TxError::UnrepresentableLockTime` if `expiry` is below the consensus
///   lock-by-time threshold
pub fn build_refund_transaction(
    contract_outpoint: OutPoint,
    value: u64,
    payer_key: &PublicKey,
    expiry: u64,
) -> Result<Transaction> {
    let lock_time = u32::try_from(expiry)
        .ok()
        .and_then(|secs| LockTime::from_time(secs).ok())
        .ok_or(TxError::UnrepresentableLockTime(expiry))?;

    Ok(Transaction {
        version: Version::ONE,
        lock_time,
        input: vec![TxIn {
            previous_output: contract_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: payout_script(payer_key),
        }],
    })
}

/// Validates a payer-provided refund before the payee signs it
///
/// Checked here: exactly one input whose sequence leaves the lock time
/// enforceable, a time-based lock at or beyond the agreed expiry, and a
/// single output paying the payer key the refund was announced with. The
/// input's outpoint cannot be checked yet — the contract is only revealed
/// afterwards — so the payee records it and verifies it against the
/// contract in the next step.
///
/// # Arguments
/// * `refund` - The decoded refund transaction
/// * `payer_key` - Channel key from the accompanying `PROVIDE_REFUND`
/// * `expiry` - The expiry the payee proposed in `INITIATE`
///
/// # Returns
/// The outpoint the refund spends
///
/// # Errors
/// * `TxError::BadTransaction` on any structural or lock-time mismatch
pub fn validate_refund_for_signing(
    refund: &Transaction,
    payer_key: &PublicKey,
    expiry: u64,
) -> Result<OutPoint> {
    if refund.input.len() != 1 {
        return Err(TxError::BadTransaction(format!(
            "refund must spend exactly the contract output, has {} inputs",
            refund.input.len()
        ))
        .into());
    }
    let input = &refund.input[0];
    if !input.sequence.enables_absolute_lock_time() {
        return Err(
            TxError::BadTransaction("refund sequence disables its lock time".to_string()).into()
        );
    }
    if !refund.lock_time.is_block_time() {
        return Err(TxError::BadTransaction("refund lock time is height-based".to_string()).into());
    }
    if u64::from(refund.lock_time.to_consensus_u32()) < expiry {
        return Err(TxError::BadTransaction(format!(
            "refund lock time {} precedes channel expiry {}",
            refund.lock_time.to_consensus_u32(),
            expiry
        ))
        .into());
    }
    if refund.output.len() != 1 {
        return Err(TxError::BadTransaction(format!(
            "refund must pay a single output, has {}",
            refund.output.len()
        ))
        .into());
    }
    if refund.output[0].script_pubkey != payout_script(payer_key) {
        return Err(
            TxError::BadTransaction("refund does not pay the payer's key".to_string()).into()
        );
    }
    Ok(input.previous_output)
}
