//! Pure transaction builders and signing helpers
//!
//! This module assembles the three transaction shapes the channel protocol
//! uses — the funding contract, the time-locked refund, and successive
//! settlements — and produces and verifies the ECDSA signatures that spend
//! the contract's 2-of-2 output. Everything here is stateless; the channel
//! state objects own the artifacts.

pub mod contract;
pub mod refund;
pub mod script;
pub mod settlement;
pub mod sign;

pub use contract::{build_contract_transaction, find_contract_output, CONTRACT_OUTPUT_INDEX};
pub use refund::{build_refund_transaction, validate_refund_for_signing};
pub use script::{multisig_script, payout_script, require_multisig_script};
pub use settlement::{
    build_settlement_transaction, paid_from_change, settlement_split, SettlementSplit,
};
pub use sign::{
    complete_contract_spend, contract_spend_signature, decode_wire_signature,
    encode_wire_signature, verify_contract_spend_signature,
};
