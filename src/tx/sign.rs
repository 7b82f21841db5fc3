//! ECDSA signing and verification over the contract output
//!
//! All spends of the contract output (refund and settlements) are signed
//! with the legacy all-outputs `SIGHASH_ALL` digest, using the 2-of-2
//! multisig script as script code. Wire signatures are DER with the
//! sighash flag byte appended.

use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, Script, Transaction};

use crate::errors::{Result, TxError};

/// Computes the SIGHASH_ALL digest for spending the contract output
///
/// # Arguments
/// * `tx` - The spending transaction (refund or settlement)
/// * `contract_script` - The 2-of-2 multisig script being satisfied
/// * `input_index` - Index of the input that spends the contract output
///
/// # Errors
/// * `TxError::BadTransaction` if `input_index` is out of range
pub fn contract_spend_sighash(
    tx: &Transaction,
    contract_script: &Script,
    input_index: usize,
) -> Result<Message> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(input_index, contract_script, EcdsaSighashType::All.to_u32())
        .map_err(|_| TxError::BadTransaction(format!("no input at index {input_index}")))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Produces one party's signature over a contract spend
///
/// # Arguments
/// * `secp` - Signing context
/// * `tx` - The spending transaction
/// * `contract_script` - The 2-of-2 multisig script being satisfied
/// * `key` - The signing party's channel secret key
pub fn contract_spend_signature<C: Signing>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    contract_script: &Script,
    key: &SecretKey,
) -> Result<Signature> {
    let digest = contract_spend_sighash(tx, contract_script, 0)?;
    Ok(secp.sign_ecdsa(&digest, key))
}

/// Verifies a counterparty signature over a contract spend
///
/// # Errors
/// * `TxError::BadSignature` if the signature does not verify against the
///   given key and digest
pub fn verify_contract_spend_signature<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    contract_script: &Script,
    signature: &Signature,
    key: &bitcoin::secp256k1::PublicKey,
) -> Result<()> {
    let digest = contract_spend_sighash(tx, contract_script, 0)?;
    secp.verify_ecdsa(&digest, signature, key).map_err(|_| TxError::BadSignature)?;
    Ok(())
}

/// Encodes a signature for the wire: DER plus the SIGHASH_ALL flag byte
pub fn encode_wire_signature(signature: &Signature) -> Vec<u8> {
    bitcoin::ecdsa::Signature { signature: *signature, sighash_type: EcdsaSighashType::All }
        .to_vec()
}

/// Decodes a wire signature, requiring the SIGHASH_ALL flag
///
/// # Errors
/// * `TxError::BadSignature` on undecodable bytes or any other sighash flag
pub fn decode_wire_signature(bytes: &[u8]) -> Result<Signature> {
    let sig = bitcoin::ecdsa::Signature::from_slice(bytes).map_err(|_| TxError::BadSignature)?;
    if sig.sighash_type != EcdsaSighashType::All {
        return Err(TxError::BadSignature.into());
    }
    Ok(sig.signature)
}

/// Attaches both signatures to input 0, completing the contract spend
///
/// The scriptSig becomes `OP_0 <payer_sig> <payee_sig>` (the leading OP_0
/// absorbs the extra stack pop of `OP_CHECKMULTISIG`; signature order must
/// match key order in the multisig script).
///
/// # Arguments
/// * `tx` - The half-built spending transaction
/// * `payer_sig` / `payee_sig` - Signatures from each party
pub fn complete_contract_spend(
    mut tx: Transaction,
    payer_sig: &Signature,
    payee_sig: &Signature,
) -> Result<Transaction> {
    let payer_push = PushBytesBuf::try_from(encode_wire_signature(payer_sig))
        .map_err(|_| TxError::BadSignature)?;
    let payee_push = PushBytesBuf::try_from(encode_wire_signature(payee_sig))
        .map_err(|_| TxError::BadSignature)?;
    let script_sig = Builder::new()
        .push_int(0)
        .push_slice(payer_push)
        .push_slice(payee_push)
        .into_script();

    let input = tx
        .input
        .first_mut()
        .ok_or_else(|| TxError::BadTransaction("spend has no inputs".to_string()))?;
    input.script_sig = script_sig;
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, TxOut, Witness};

    use super::*;
    use crate::test_utils::{test_keys, test_secret_keys};
    use crate::tx::script::{multisig_script, payout_script};

    fn dummy_spend() -> Transaction {
        let (payer, _) = test_keys();
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: payout_script(&payer),
            }],
        }
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let secp = Secp256k1::new();
        let (payer_sk, payee_sk) = test_secret_keys();
        let (payer_pk, payee_pk) = test_keys();
        let script = multisig_script(&payer_pk, &payee_pk);
        let tx = dummy_spend();

        let sig = contract_spend_signature(&secp, &tx, &script, &payer_sk)
            .expect("signing a one-input spend should succeed");

        verify_contract_spend_signature(&secp, &tx, &script, &sig, &payer_pk)
            .expect("signature should verify against the signing key");

        let wrong_key = verify_contract_spend_signature(&secp, &tx, &script, &sig, &payee_pk)
            .expect_err("signature should not verify against the other key");
        assert!(matches!(wrong_key, crate::Error::Tx(TxError::BadSignature)));

        let other_sig = contract_spend_signature(&secp, &tx, &script, &payee_sk)
            .expect("payee signing should succeed");
        assert_ne!(sig, other_sig);
    }

    #[test]
    fn test_wire_signature_roundtrip() {
        let secp = Secp256k1::new();
        let (payer_sk, _) = test_secret_keys();
        let (payer_pk, payee_pk) = test_keys();
        let script = multisig_script(&payer_pk, &payee_pk);
        let tx = dummy_spend();
        let sig = contract_spend_signature(&secp, &tx, &script, &payer_sk)
            .expect("signing should succeed");

        let wire = encode_wire_signature(&sig);

        assert_eq!(*wire.last().expect("encoded signature is nonempty"), 0x01);
        assert_eq!(decode_wire_signature(&wire).expect("roundtrip should decode"), sig);
        assert!(decode_wire_signature(&[]).is_err());
        assert!(decode_wire_signature(&[0u8; 70]).is_err());
    }

    #[test]
    fn test_complete_contract_spend() {
        let secp = Secp256k1::new();
        let (payer_sk, payee_sk) = test_secret_keys();
        let (payer_pk, payee_pk) = test_keys();
        let script = multisig_script(&payer_pk, &payee_pk);
        let tx = dummy_spend();
        let payer_sig = contract_spend_signature(&secp, &tx, &script, &payer_sk)
            .expect("payer signing should succeed");
        let payee_sig = contract_spend_signature(&secp, &tx, &script, &payee_sk)
            .expect("payee signing should succeed");

        let completed = complete_contract_spend(tx, &payer_sig, &payee_sig)
            .expect("completing with both signatures should succeed");

        let script_sig = completed.input[0].script_sig.as_bytes();
        assert_eq!(script_sig[0], 0x00);
        // Two signature pushes follow the OP_0.
        assert!(script_sig.len() > 2 + 2 * 60);
    }
}
