//! Payer-side protocol state machine
//!
//! Drives the payer through version negotiation, channel establishment,
//! incremental payments, and close. Wraps a [`ClientChannel`] and the
//! payer's persistent store; every input returns an [`Outcome`] the
//! embedder acts on.

use std::sync::Arc;

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::Txid;
use tracing::{debug, warn};

use crate::channel::ClientChannel;
use crate::errors::{ChannelError, Error, ProtocolError, Result};
use crate::protocol::messages::{
    ChannelMessage, ClientVersion, ErrorCode, ProvideContract, ProvideRefund, UpdatePayment,
};
use crate::protocol::outcome::{CloseReason, Outcome};
use crate::store::{ClientChannelStore, StoredClientChannel};
use crate::traits::ChannelWallet;
use crate::types::{
    ServerId, DEFAULT_MAX_TIME_WINDOW_SECS, DEFAULT_SETTLEMENT_FEE, DEFAULT_STEP_TIMEOUT_SECS,
    PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
};

/// Local protocol states on the payer side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// `connection_open` has not run yet
    Inactive,
    WaitingForServerVersion,
    WaitingForInitiate,
    WaitingForRefundReturn,
    WaitingForChannelOpen,
    Open,
    Closed,
    Error,
}

impl ClientState {
    fn name(self) -> &'static str {
        match self {
            ClientState::Inactive => "Inactive",
            ClientState::WaitingForServerVersion => "WaitingForServerVersion",
            ClientState::WaitingForInitiate => "WaitingForInitiate",
            ClientState::WaitingForRefundReturn => "WaitingForRefundReturn",
            ClientState::WaitingForChannelOpen => "WaitingForChannelOpen",
            ClientState::Open => "Open",
            ClientState::Closed => "Closed",
            ClientState::Error => "Error",
        }
    }
}

/// The payer-side protocol state machine
///
/// One instance per connection. On `connection_open` it either announces an
/// inactive stored channel for resume or negotiates a fresh one; afterwards
/// `receive` consumes peer messages and `increment_payment`/`close` drive
/// local actions.
pub struct PaymentChannelClient {
    server_id: ServerId,
    payer_key: SecretKey,
    value: u64,
    fee: u64,
    max_time_window: u64,
    step_timeout: u64,
    wallet: Arc<dyn ChannelWallet>,
    store: Arc<ClientChannelStore>,
    channel: Option<ClientChannel>,
    state: ClientState,
    announced_resume: Option<Txid>,
    step_deadline: Option<u64>,
    close_requested: bool,
    close_reported: bool,
}

impl PaymentChannelClient {
    /// Creates a client session with default protocol parameters
    ///
    /// # Arguments
    /// * `server_id` - Opaque identifier of the payee, keys the store
    /// * `payer_key` - The payer's channel secret key
    /// * `value` - Total value V to lock into a fresh contract
    /// * `wallet` - Funding source for the contract
    /// * `store` - The payer's persistent channel store
    pub fn new(
        server_id: ServerId,
        payer_key: SecretKey,
        value: u64,
        wallet: Arc<dyn ChannelWallet>,
        store: Arc<ClientChannelStore>,
    ) -> Self {
        Self::with_params(
            server_id,
            payer_key,
            value,
            DEFAULT_SETTLEMENT_FEE,
            DEFAULT_MAX_TIME_WINDOW_SECS,
            DEFAULT_STEP_TIMEOUT_SECS,
            wallet,
            store,
        )
    }

    /// Creates a client session with explicit protocol parameters
    #[allow(clippy::too_many_arguments)]
    pub fn with_params(
        server_id: ServerId,
        payer_key: SecretKey,
        value: u64,
        fee: u64,
        max_time_window: u64,
        step_timeout: u64,
        wallet: Arc<dyn ChannelWallet>,
        store: Arc<ClientChannelStore>,
    ) -> Self {
        Self {
            server_id,
            payer_key,
            value,
            fee,
            max_time_window,
            step_timeout,
            wallet,
            store,
            channel: None,
            state: ClientState::Inactive,
            announced_resume: None,
            step_deadline: None,
            close_requested: false,
            close_reported: false,
        }
    }

    /// Starts the session and emits `CLIENT_VERSION`
    ///
    /// If the store holds an inactive, unexpired channel for this server,
    /// the session attaches to it and announces its contract hash for
    /// resume; otherwise a fresh channel is negotiated.
    pub fn connection_open(&mut self, now: u64) -> Outcome {
        let mut previous_hash = None;
        if let Some(record) = self.store.checkout_inactive(&self.server_id, now) {
            debug!(contract = %record.contract_hash, "resuming stored channel");
            previous_hash = Some(record.contract_hash.to_byte_array().to_vec());
            self.announced_resume = Some(record.contract_hash);
            self.channel = Some(ClientChannel::resume(
                record.payer_key,
                record.payee_pubkey,
                record.value,
                record.paid,
                record.expiry,
                record.contract,
                record.refund,
                record.fee,
            ));
        } else {
            self.channel = Some(ClientChannel::new(
                self.payer_key,
                self.value,
                self.fee,
                self.max_time_window,
            ));
        }

        self.state = ClientState::WaitingForServerVersion;
        self.step_deadline = Some(now + self.step_timeout);
        Outcome::send([ChannelMessage::ClientVersion(ClientVersion {
            major: PROTOCOL_VERSION_MAJOR,
            minor: PROTOCOL_VERSION_MINOR,
            previous_channel_contract_hash: previous_hash,
        })])
    }

    /// Consumes one peer message
    ///
    /// Out-of-sequence or malformed input yields an `ERROR{SYNTAX_ERROR}`
    /// (or more specific code) in the outcome and leaves the session in the
    /// terminal error state.
    pub fn receive(&mut self, message: ChannelMessage, now: u64) -> Outcome {
        if matches!(
            self.state,
            ClientState::Error | ClientState::Closed | ClientState::Inactive
        ) {
            return Outcome::none();
        }
        match message {
            ChannelMessage::Error(err) => {
                warn!(code = ?err.code, "peer sent ERROR");
                self.fail_channel();
                self.release_channel();
                self.state = ClientState::Error;
                self.step_deadline = None;
                Outcome { closed: self.report(CloseReason::RemoteSentError), ..Outcome::none() }
            }
            ChannelMessage::Close => self.receive_close(),
            ChannelMessage::ServerVersion(v)
                if self.state == ClientState::WaitingForServerVersion =>
            {
                if v.major != PROTOCOL_VERSION_MAJOR {
                    let error = ProtocolError::NoAcceptableVersion(v.major);
                    warn!(%error, "rejecting peer version");
                    return self.failure(
                        ErrorCode::NoAcceptableVersion,
                        CloseReason::NoAcceptableVersion,
                    );
                }
                self.state = ClientState::WaitingForInitiate;
                self.step_deadline = Some(now + self.step_timeout);
                Outcome::none()
            }
            ChannelMessage::Initiate(init) if self.state == ClientState::WaitingForInitiate => {
                self.receive_initiate(init, now)
            }
            ChannelMessage::ChannelOpen if self.state == ClientState::WaitingForInitiate => {
                // Only valid when this session announced a channel to resume.
                if self.announced_resume.is_none() {
                    return self.failure(
                        ErrorCode::SyntaxError,
                        CloseReason::RemoteSentInvalidMessage,
                    );
                }
                self.open_resumed()
            }
            ChannelMessage::ReturnRefund(ret)
                if self.state == ClientState::WaitingForRefundReturn =>
            {
                self.receive_refund_signature(&ret.signature, now)
            }
            ChannelMessage::ChannelOpen if self.state == ClientState::WaitingForChannelOpen => {
                self.open_fresh()
            }
            other => {
                let error = ProtocolError::UnexpectedMessage {
                    message: other.name(),
                    state: self.state.name(),
                };
                warn!(%error, "tearing session down");
                self.failure(ErrorCode::SyntaxError, CloseReason::RemoteSentInvalidMessage)
            }
        }
    }

    /// Raises the paid amount by `delta` and emits `UPDATE_PAYMENT`
    ///
    /// Fails locally, without any protocol message, when the channel is not
    /// open or the increment passes the spendable ceiling.
    ///
    /// # Errors
    /// * `ChannelError::ChannelNotOpen` outside the open state
    /// * `ChannelError::IncrementTooLarge` past the ceiling
    pub fn increment_payment(&mut self, delta: u64) -> Result<Outcome> {
        if self.state != ClientState::Open {
            return Err(ChannelError::ChannelNotOpen(self.state.name()).into());
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Error::Internal("session has no channel".to_string()))?;
        let settlement = channel.increment_payment(delta)?.clone();
        let message = ChannelMessage::UpdatePayment(UpdatePayment {
            client_change_value: settlement.client_change,
            signature: crate::tx::encode_wire_signature(&settlement.payer_signature),
        });
        let paid = channel.paid();
        let hash = channel.contract_hash()?;
        self.store.update_best(&self.server_id, &hash, paid, settlement.transaction)?;
        debug!(contract = %hash, paid, "payment incremented");
        Ok(Outcome::send([message]))
    }

    /// Requests settlement; safe to call repeatedly
    ///
    /// Emits `CLOSE` on the first call from any live state; later calls are
    /// no-ops. The server answers with its own `CLOSE` once the settlement
    /// is on the wire.
    pub fn close(&mut self) -> Outcome {
        if self.close_requested
            || matches!(
                self.state,
                ClientState::Inactive | ClientState::Closed | ClientState::Error
            )
        {
            return Outcome::none();
        }
        self.close_requested = true;
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        Outcome::send([ChannelMessage::Close])
    }

    /// Tears the session down after the transport dropped
    ///
    /// Returns the stored channel to the store untouched except for its
    /// active flag; the channel itself survives for a later resume.
    pub fn connection_closed(&mut self) -> Outcome {
        self.release_channel();
        let was_live =
            !matches!(self.state, ClientState::Inactive | ClientState::Closed | ClientState::Error);
        self.state = ClientState::Closed;
        self.step_deadline = None;
        if was_live {
            Outcome { closed: self.report(CloseReason::ConnectionClosed), ..Outcome::none() }
        } else {
            Outcome::none()
        }
    }

    /// Fires the per-step timeout when its deadline has passed
    ///
    /// Returns `None` while the deadline is in the future or no handshake
    /// step is pending. A fired timeout emits `ERROR{TIMEOUT}` and tears
    /// the session down without touching persistent state.
    pub fn check_step_timeout(&mut self, now: u64) -> Option<Outcome> {
        let deadline = self.step_deadline?;
        if now < deadline {
            return None;
        }
        warn!(state = self.state.name(), "handshake step timed out");
        Some(self.failure(ErrorCode::Timeout, CloseReason::ConnectionClosed))
    }

    /// True once the channel is open for payments
    pub fn is_open(&self) -> bool {
        self.state == ClientState::Open
    }

    /// The open channel's contract hash
    pub fn contract_hash(&self) -> Result<Txid> {
        self.channel_ref()?.contract_hash()
    }

    /// Amount paid to the payee so far
    pub fn paid(&self) -> Result<u64> {
        Ok(self.channel_ref()?.paid())
    }

    // ------------------------------------------------------------------
    // message handlers
    // ------------------------------------------------------------------

    fn receive_initiate(&mut self, init: crate::protocol::messages::Initiate, now: u64) -> Outcome {
        // The server declined a resume by answering with fresh terms.
        if let Some(hash) = self.announced_resume.take() {
            debug!(contract = %hash, "server declined resume, negotiating fresh channel");
            self.store.mark_inactive(&self.server_id, &hash);
            self.channel = Some(ClientChannel::new(
                self.payer_key,
                self.value,
                self.fee,
                self.max_time_window,
            ));
        }

        let Ok(payee_key) = PublicKey::from_slice(&init.multisig_key) else {
            return self.failure(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage);
        };
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => {
                return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed);
            }
        };
        let provided = channel.provide_initiate(
            &*self.wallet,
            payee_key,
            init.min_accepted_channel_size,
            init.expire_time_secs,
            now,
        );
        match provided {
            Ok(()) => {}
            Err(Error::Channel(ChannelError::ValueTooLarge { .. })) => {
                return self.failure(
                    ErrorCode::ChannelValueTooLarge,
                    CloseReason::ServerRequestedTooMuchValue,
                );
            }
            Err(Error::Channel(ChannelError::TimeWindowTooLarge { .. })) => {
                return self
                    .failure(ErrorCode::TimeWindowTooLarge, CloseReason::TimeWindowTooLarge);
            }
            Err(error) => {
                warn!(%error, "channel initiation failed locally");
                return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed);
            }
        }

        let message = match self.channel.as_ref() {
            Some(channel) => match channel.refund_for_signing() {
                Ok(tx) => ChannelMessage::ProvideRefund(ProvideRefund {
                    multisig_key: channel.payer_pubkey().serialize().to_vec(),
                    tx: serialize(tx),
                }),
                Err(_) => return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed),
            },
            None => return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed),
        };
        self.state = ClientState::WaitingForRefundReturn;
        self.step_deadline = Some(now + self.step_timeout);
        Outcome::send([message])
    }

    fn receive_refund_signature(&mut self, signature: &[u8], now: u64) -> Outcome {
        let Ok(signature) = crate::tx::decode_wire_signature(signature) else {
            return self.failure(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage);
        };
        let attached = match self.channel.as_mut() {
            Some(channel) => channel.provide_refund_signature(&signature),
            None => Err(Error::Internal("session has no channel".to_string())),
        };
        if attached.is_err() {
            return self.failure(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage);
        }
        let contract = match self.channel.as_ref().and_then(|c| c.contract().ok()) {
            Some(tx) => serialize(tx),
            None => return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed),
        };
        self.state = ClientState::WaitingForChannelOpen;
        self.step_deadline = Some(now + self.step_timeout);
        Outcome::send([ChannelMessage::ProvideContract(ProvideContract { tx: contract })])
    }

    fn open_fresh(&mut self) -> Outcome {
        match self.store_fresh_record() {
            Ok(hash) => {
                self.state = ClientState::Open;
                self.step_deadline = None;
                Outcome::none().and_opened(hash)
            }
            Err(error) => {
                warn!(%error, "failed to open channel");
                self.failure(ErrorCode::Other, CloseReason::ConnectionClosed)
            }
        }
    }

    /// Commits the freshly opened channel to the store
    fn store_fresh_record(&mut self) -> Result<Txid> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Error::Internal("session has no channel".to_string()))?;
        channel.set_open()?;
        let hash = channel.contract_hash()?;
        let record = StoredClientChannel {
            server_id: self.server_id,
            contract_hash: hash,
            payer_key: channel.payer_key(),
            payee_pubkey: channel.payee_pubkey()?,
            value: channel.value(),
            paid: channel.paid(),
            fee: channel.fee(),
            expiry: channel.expiry(),
            contract: channel.contract()?.clone(),
            refund: channel.signed_refund()?.clone(),
            latest_settlement: None,
            contract_broadcast: false,
            active: true,
        };
        self.store.put(record)?;
        Ok(hash)
    }

    fn open_resumed(&mut self) -> Outcome {
        let Some(hash) = self.announced_resume else {
            return self.failure(ErrorCode::SyntaxError, CloseReason::RemoteSentInvalidMessage);
        };
        self.state = ClientState::Open;
        self.step_deadline = None;
        debug!(contract = %hash, "channel resumed");
        Outcome::none().and_opened(hash)
    }

    fn receive_close(&mut self) -> Outcome {
        let reason = if self.close_requested {
            CloseReason::ClientRequestedClose
        } else {
            CloseReason::ServerRequestedClose
        };
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.release_channel();
        self.state = ClientState::Closed;
        self.step_deadline = None;
        Outcome { closed: self.report(reason), ..Outcome::none() }
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    /// Emits an error message and moves to the terminal state
    fn failure(&mut self, code: ErrorCode, reason: CloseReason) -> Outcome {
        self.fail_channel();
        self.release_channel();
        self.state = ClientState::Error;
        self.step_deadline = None;
        Outcome { closed: self.report(reason), ..Outcome::send([ChannelMessage::error(code)]) }
    }

    fn fail_channel(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.fail();
        }
    }

    /// Returns a checked-out stored channel to the store
    fn release_channel(&mut self) {
        if let Some(channel) = self.channel.as_ref() {
            if let Ok(hash) = channel.contract_hash() {
                self.store.mark_inactive(&self.server_id, &hash);
            }
        }
    }

    /// Reports the close reason exactly once; later calls yield `None`
    fn report(&mut self, reason: CloseReason) -> Option<CloseReason> {
        if self.close_reported {
            return None;
        }
        self.close_reported = true;
        Some(reason)
    }

    fn channel_ref(&self) -> Result<&ClientChannel> {
        self.channel
            .as_ref()
            .ok_or_else(|| Error::Internal("session has no channel".to_string()))
    }
}
