//! Settlement transaction builder
//!
//! A settlement spends the contract output with no lock time and splits the
//! channel value between the payee (the amount paid so far) and the payer
//! (the remaining change, less the fixed settlement fee). Each new payment
//! re-signs a fresh settlement with a larger payee output.

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::errors::{Result, TxError};
use crate::tx::script::payout_script;
use crate::types::DUST_LIMIT;

/// How a settlement divides the contract value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementSplit {
    /// Amount paid to the payee
    pub payee_value: u64,
    /// Payer change, `None` when it fell below dust and was surrendered
    pub payer_change: Option<u64>,
}

/// Computes the output split for a settlement at paid amount `paid`
///
/// The payer's change is `value - paid - fee`; when that falls below the
/// dust threshold the change output is suppressed entirely.
///
/// # Errors
/// * `TxError::BadTransaction` if `paid + fee` exceeds the channel value
pub fn settlement_split(value: u64, paid: u64, fee: u64) -> Result<SettlementSplit> {
    let change = paid
        .checked_add(fee)
        .and_then(|spent| value.checked_sub(spent))
        .ok_or_else(|| {
            TxError::BadTransaction(format!(
                "paid {paid} plus fee {fee} exceeds channel value {value}"
            ))
        })?;
    let payer_change = (change >= DUST_LIMIT).then_some(change);
    Ok(SettlementSplit { payee_value: paid, payer_change })
}

/// Derives the paid amount from the wire's `clientChangeValue`
///
/// The wire carries the payer's nominal change (`value - paid - fee`), so
/// both sides rebuild the identical settlement from the shared fee
/// constant.
///
/// # Errors
/// * `TxError::BadTransaction` if the change plus fee exceeds the value
pub fn paid_from_change(value: u64, client_change: u64, fee: u64) -> Result<u64> {
    client_change
        .checked_add(fee)
        .and_then(|kept| value.checked_sub(kept))
        .ok_or_else(|| {
            TxError::BadTransaction(format!(
                "change {client_change} plus fee {fee} exceeds channel value {value}"
            ))
            .into()
        })
}

/// Builds the unsigned settlement at paid amount `paid`
///
/// Output order is payee first, then the payer change (when above dust).
///
/// # Arguments
/// * `contract_outpoint` - The 2-of-2 output being settled
/// * `value` - Full contract value V
/// * `paid` - Amount owed to the payee
/// * `fee` - Fixed settlement fee
/// * `payer_key` / `payee_key` - Channel keys for the payout scripts
pub fn build_settlement_transaction(
    contract_outpoint: OutPoint,
    value: u64,
    paid: u64,
    fee: u64,
    payer_key: &PublicKey,
    payee_key: &PublicKey,
) -> Result<Transaction> {
    let split = settlement_split(value, paid, fee)?;
    let mut output = vec![TxOut {
        value: Amount::from_sat(split.payee_value),
        script_pubkey: payout_script(payee_key),
    }];
    if let Some(change) = split.payer_change {
        output.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: payout_script(payer_key),
        });
    }

    Ok(Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: contract_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    })
}
