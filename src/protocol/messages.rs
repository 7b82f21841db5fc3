//! Typed protocol messages
//!
//! The in-memory form of the channel protocol's tagged message union. The
//! byte-level encoding is owned by the embedding transport and must stay
//! bit-for-bit compatible with existing deployments; this module only
//! fixes the field structure the state machines consume and emit.

/// Error codes carried by [`ChannelMessage::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Message malformed or out of sequence
    SyntaxError,
    /// A transaction or signature failed validation
    BadTransaction,
    /// A handshake step exceeded its wall-clock cap
    Timeout,
    /// No common major protocol version
    NoAcceptableVersion,
    /// The peer demanded more channel value than acceptable
    ChannelValueTooLarge,
    /// The peer's minimum payment is unacceptably large
    MinPaymentTooLarge,
    /// The proposed channel lifetime is too long
    TimeWindowTooLarge,
    /// Anything else
    Other,
}

/// `CLIENT_VERSION` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersion {
    /// Major protocol version; must match the server's exactly
    pub major: u32,
    /// Minor protocol version; advisory
    pub minor: u32,
    /// Contract hash of a previous channel to resume, when present
    ///
    /// Must be exactly 32 bytes; servers treat any other length as unknown
    /// and fall through to a fresh `INITIATE`.
    pub previous_channel_contract_hash: Option<Vec<u8>>,
}

/// `SERVER_VERSION` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    /// Major protocol version
    pub major: u32,
    /// Minor protocol version
    pub minor: u32,
}

/// `INITIATE` payload: the payee's channel terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiate {
    /// The payee's 33-byte compressed channel public key
    pub multisig_key: Vec<u8>,
    /// Smallest contract value the payee will accept, in satoshis
    pub min_accepted_channel_size: u64,
    /// Absolute channel expiry T_exp, seconds since the epoch
    pub expire_time_secs: u64,
}

/// `PROVIDE_REFUND` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvideRefund {
    /// The payer's 33-byte compressed channel public key
    pub multisig_key: Vec<u8>,
    /// The unsigned refund transaction, consensus-encoded
    pub tx: Vec<u8>,
}

/// `RETURN_REFUND` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnRefund {
    /// The payee's refund signature (DER plus sighash flag)
    pub signature: Vec<u8>,
}

/// `PROVIDE_CONTRACT` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvideContract {
    /// The contract transaction, consensus-encoded
    pub tx: Vec<u8>,
}

/// `UPDATE_PAYMENT` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePayment {
    /// The payer's nominal change: `V - paid - fee`
    pub client_change_value: u64,
    /// The payer's settlement signature (DER plus sighash flag)
    pub signature: Vec<u8>,
}

/// `ERROR` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Machine-readable error code
    pub code: ErrorCode,
    /// Optional human-readable detail
    pub explanation: Option<String>,
}

/// The channel protocol's message union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Client announces its version and optional resume hash
    ClientVersion(ClientVersion),
    /// Server answers with its version
    ServerVersion(ServerVersion),
    /// Server proposes channel terms
    Initiate(Initiate),
    /// Client provides the refund for countersigning
    ProvideRefund(ProvideRefund),
    /// Server returns its refund signature
    ReturnRefund(ReturnRefund),
    /// Client releases the contract
    ProvideContract(ProvideContract),
    /// Server confirms the channel is open
    ChannelOpen,
    /// Client raises the paid amount
    UpdatePayment(UpdatePayment),
    /// Either side requests settlement
    Close,
    /// Either side reports a fatal error
    Error(ErrorMessage),
}

impl ChannelMessage {
    /// Message type name, for logs and out-of-sequence errors
    pub fn name(&self) -> &'static str {
        match self {
            ChannelMessage::ClientVersion(_) => "CLIENT_VERSION",
            ChannelMessage::ServerVersion(_) => "SERVER_VERSION",
            ChannelMessage::Initiate(_) => "INITIATE",
            ChannelMessage::ProvideRefund(_) => "PROVIDE_REFUND",
            ChannelMessage::ReturnRefund(_) => "RETURN_REFUND",
            ChannelMessage::ProvideContract(_) => "PROVIDE_CONTRACT",
            ChannelMessage::ChannelOpen => "CHANNEL_OPEN",
            ChannelMessage::UpdatePayment(_) => "UPDATE_PAYMENT",
            ChannelMessage::Close => "CLOSE",
            ChannelMessage::Error(_) => "ERROR",
        }
    }

    /// Builds an `ERROR` message with no explanation
    pub fn error(code: ErrorCode) -> Self {
        ChannelMessage::Error(ErrorMessage { code, explanation: None })
    }
}
