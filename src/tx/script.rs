//! Contract output and payout script construction
//!
//! The contract locks its value in a bare 2-of-2 `OP_CHECKMULTISIG` output
//! (key order: payer first, payee second). Refund and settlement payouts
//! are plain P2PKH over the respective channel keys.

use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2};
use bitcoin::script::Builder;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Script, ScriptBuf};

use crate::errors::{Result, TxError};

/// Builds the bare 2-of-2 multisig script locking the contract output
///
/// The script form is `OP_2 <payer_pk> <payee_pk> OP_2 OP_CHECKMULTISIG`.
/// Spending signatures must appear in the same key order.
///
/// # Arguments
/// * `payer_key` - The payer's channel public key (first position)
/// * `payee_key` - The payee's channel public key (second position)
pub fn multisig_script(payer_key: &PublicKey, payee_key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_PUSHNUM_2)
        .push_key(&bitcoin::PublicKey::new(*payer_key))
        .push_key(&bitcoin::PublicKey::new(*payee_key))
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Builds the P2PKH payout script for a channel key
///
/// Refund and settlement outputs pay directly to the channel keys, which is
/// what lets the payee validate a refund's destination against the key it
/// was handed in `PROVIDE_REFUND`.
pub fn payout_script(key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(*key).pubkey_hash())
}

/// Checks that `script` is exactly the 2-of-2 multisig over the given keys
///
/// # Errors
/// * `TxError::BadScript` if the script differs from the expected form
pub fn require_multisig_script(
    script: &Script,
    payer_key: &PublicKey,
    payee_key: &PublicKey,
) -> Result<()> {
    let expected = multisig_script(payer_key, payee_key);
    if script != expected.as_script() {
        return Err(TxError::BadScript(format!(
            "got {} bytes, expected 2-of-2 over the channel keys",
            script.len()
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_keys;

    #[test]
    fn test_multisig_script_form() {
        let (payer, payee) = test_keys();
        let script = multisig_script(&payer, &payee);

        let bytes = script.as_bytes();
        // OP_2 <33-byte push> <33-byte push> OP_2 OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 1 + 34 + 34 + 1 + 1);
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[bytes.len() - 2], 0x52);
        assert_eq!(bytes[bytes.len() - 1], 0xae);
    }

    #[test]
    fn test_multisig_script_key_order() {
        let (payer, payee) = test_keys();

        assert_ne!(multisig_script(&payer, &payee), multisig_script(&payee, &payer));
    }

    #[test]
    fn test_payout_script_is_p2pkh() {
        let (payer, _) = test_keys();

        assert!(payout_script(&payer).is_p2pkh());
    }

    #[test]
    fn test_require_multisig_script() {
        let (payer, payee) = test_keys();
        let script = multisig_script(&payer, &payee);

        require_multisig_script(&script, &payer, &payee).expect("matching script should pass");

        let swapped = require_multisig_script(&script, &payee, &payer)
            .expect_err("swapped keys should fail");
        assert!(matches!(
            swapped,
            crate::Error::Tx(TxError::BadScript(_))
        ));

        let p2pkh = payout_script(&payer);
        assert!(require_multisig_script(&p2pkh, &payer, &payee).is_err());
    }
}
