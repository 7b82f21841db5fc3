//! Contract (funding) transaction builder
//!
//! The contract locks the channel value V into a bare 2-of-2 multisig
//! output at index 0. Funding inputs come from the embedding wallet; any
//! remainder above the funding fee returns to a wallet change script.

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::errors::{Result, TxError};
use crate::traits::{ChannelWallet, FundingInput};
use crate::tx::script::{multisig_script, require_multisig_script};
use crate::types::DUST_LIMIT;

/// Output index of the 2-of-2 multisig within the contract transaction
pub const CONTRACT_OUTPUT_INDEX: u32 = 0;

/// Builds the contract transaction and has the wallet sign its inputs
///
/// Output 0 carries the multisig of value `value`; a change output is
/// appended when the remainder after `funding_fee` clears dust (otherwise
/// the remainder is surrendered to fee).
///
/// # Arguments
/// * `wallet` - Funding source; selects and signs the inputs
/// * `payer_key` - The payer's channel public key
/// * `payee_key` - The payee's channel public key
/// * `value` - Channel value V locked into the multisig
/// * `funding_fee` - Fee reserved for the contract transaction itself
///
/// # Errors
/// * `TxError::InsufficientFunding` if the wallet cannot cover
///   `value + funding_fee`
pub fn build_contract_transaction(
    wallet: &dyn ChannelWallet,
    payer_key: &PublicKey,
    payee_key: &PublicKey,
    value: u64,
    funding_fee: u64,
) -> Result<Transaction> {
    let required = value
        .checked_add(funding_fee)
        .ok_or_else(|| TxError::BadTransaction("contract value overflows".to_string()))?;
    let inputs = wallet.select_funding(Amount::from_sat(required))?;
    let available: u64 = inputs.iter().map(|i| i.value).sum();
    if available < required {
        return Err(TxError::InsufficientFunding { available, required }.into());
    }

    let mut output = vec![TxOut {
        value: Amount::from_sat(value),
        script_pubkey: multisig_script(payer_key, payee_key),
    }];
    let change = available - required;
    if change >= DUST_LIMIT {
        output.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: wallet.change_script(),
        });
    }

    let tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: inputs.into_iter().map(funding_txin).collect(),
        output,
    };
    wallet.sign_funding_inputs(tx)
}

fn funding_txin(input: FundingInput) -> TxIn {
    TxIn {
        previous_output: input.outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// Locates the 2-of-2 output for the given keys within a contract
///
/// Used by the payee to validate a received `PROVIDE_CONTRACT` against the
/// keys exchanged earlier.
///
/// # Returns
/// The output index and value of the matching multisig output
///
/// # Errors
/// * `TxError::BadScript` if no output carries the expected multisig
pub fn find_contract_output(
    contract: &Transaction,
    payer_key: &PublicKey,
    payee_key: &PublicKey,
) -> Result<(u32, u64)> {
    for (index, out) in contract.output.iter().enumerate() {
        if require_multisig_script(&out.script_pubkey, payer_key, payee_key).is_ok() {
            return Ok((index as u32, out.value.to_sat()));
        }
    }
    Err(TxError::BadScript("contract has no 2-of-2 output for the channel keys".to_string()).into())
}
