//! Payee-side protocol state machine
//!
//! Mirror of the client machine. Answers version negotiation, hands out
//! channel terms, validates the refund and contract, accepts monotonic
//! payment updates, and settles on close or error. Wraps a
//! [`ServerChannel`] and the payee's persistent store.

use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::Txid;
use tracing::{debug, info, warn};

use crate::channel::ServerChannel;
use crate::errors::{Error, ProtocolError};
use crate::protocol::messages::{
    ChannelMessage, ErrorCode, Initiate, ProvideRefund, ReturnRefund, ServerVersion,
    UpdatePayment,
};
use crate::protocol::outcome::{CloseReason, Outcome};
use crate::store::{ServerChannelStore, StoredServerChannel};
use crate::types::{
    DEFAULT_MAX_TIME_WINDOW_SECS, DEFAULT_SETTLEMENT_FEE, DEFAULT_STEP_TIMEOUT_SECS,
    PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
};

/// Local protocol states on the payee side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    /// `connection_open` has not run yet
    Inactive,
    WaitingForClientVersion,
    WaitingForRefund,
    WaitingForContract,
    /// `CHANNEL_OPEN` sent, no payment accepted yet
    Ready,
    Open,
    Closed,
    Error,
}

impl ServerState {
    fn name(self) -> &'static str {
        match self {
            ServerState::Inactive => "Inactive",
            ServerState::WaitingForClientVersion => "WaitingForClientVersion",
            ServerState::WaitingForRefund => "WaitingForRefund",
            ServerState::WaitingForContract => "WaitingForContract",
            ServerState::Ready => "Ready",
            ServerState::Open => "Open",
            ServerState::Closed => "Closed",
            ServerState::Error => "Error",
        }
    }
}

/// The payee-side protocol state machine
///
/// One instance per connection. The payee speaks second: `connection_open`
/// only arms the handshake timeout, and everything else happens in
/// `receive`.
pub struct PaymentChannelServer {
    payee_key: SecretKey,
    min_value: u64,
    fee: u64,
    time_window: u64,
    step_timeout: u64,
    store: Arc<ServerChannelStore>,
    channel: Option<ServerChannel>,
    contract_hash: Option<Txid>,
    state: ServerState,
    step_deadline: Option<u64>,
    close_reported: bool,
}

impl PaymentChannelServer {
    /// Creates a server session with default protocol parameters
    ///
    /// # Arguments
    /// * `payee_key` - The payee's channel secret key for this session
    /// * `min_value` - Smallest contract value the payee accepts
    /// * `store` - The payee's persistent channel store
    pub fn new(payee_key: SecretKey, min_value: u64, store: Arc<ServerChannelStore>) -> Self {
        Self::with_params(
            payee_key,
            min_value,
            DEFAULT_SETTLEMENT_FEE,
            DEFAULT_MAX_TIME_WINDOW_SECS,
            DEFAULT_STEP_TIMEOUT_SECS,
            store,
        )
    }

    /// Creates a server session with explicit protocol parameters
    pub fn with_params(
        payee_key: SecretKey,
        min_value: u64,
        fee: u64,
        time_window: u64,
        step_timeout: u64,
        store: Arc<ServerChannelStore>,
    ) -> Self {
        Self {
            payee_key,
            min_value,
            fee,
            time_window,
            step_timeout,
            store,
            channel: None,
            contract_hash: None,
            state: ServerState::Inactive,
            step_deadline: None,
            close_reported: false,
        }
    }

    /// Starts the session; the payee waits for `CLIENT_VERSION`
    pub fn connection_open(&mut self, now: u64) -> Outcome {
        self.state = ServerState::WaitingForClientVersion;
        self.step_deadline = Some(now + self.step_timeout);
        Outcome::none()
    }

    /// Consumes one peer message
    pub fn receive(&mut self, message: ChannelMessage, now: u64) -> Outcome {
        if matches!(
            self.state,
            ServerState::Error | ServerState::Closed | ServerState::Inactive
        ) {
            return Outcome::none();
        }
        match message {
            ChannelMessage::Error(err) => {
                // Tear down without settling; the stored channel, if any,
                // keeps its expiry timer.
                warn!(code = ?err.code, "peer sent ERROR");
                self.fail_channel();
                self.release_channel();
                self.state = ServerState::Error;
                self.step_deadline = None;
                Outcome { closed: self.report(CloseReason::RemoteSentError), ..Outcome::none() }
            }
            ChannelMessage::Close => self.receive_close(),
            ChannelMessage::ClientVersion(v)
                if self.state == ServerState::WaitingForClientVersion =>
            {
                self.receive_client_version(v, now)
            }
            ChannelMessage::ProvideRefund(refund)
                if self.state == ServerState::WaitingForRefund =>
            {
                self.receive_refund(refund, now)
            }
            ChannelMessage::ProvideContract(contract)
                if self.state == ServerState::WaitingForContract =>
            {
                self.receive_contract(&contract.tx)
            }
            ChannelMessage::UpdatePayment(update)
                if matches!(self.state, ServerState::Ready | ServerState::Open) =>
            {
                self.receive_update(update)
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

    /// Settles and closes the session locally; safe to call repeatedly
    ///
    /// Used by embedders shutting a connection down from their side. The
    /// best settlement, if any, is signed and queued for broadcast and the
    /// stored channel is removed.
    pub fn close(&mut self) -> Outcome {
        if matches!(
            self.state,
            ServerState::Inactive | ServerState::Closed | ServerState::Error
        ) {
            return Outcome::none();
        }
        self.settle(CloseReason::ServerRequestedClose)
    }

    /// Tears the session down after the transport dropped
    ///
    /// The stored channel stays put (minus its active flag); its expiry
    /// timer will settle it if no session ever resumes it.
    pub fn connection_closed(&mut self) -> Outcome {
        self.release_channel();
        let was_live =
            !matches!(self.state, ServerState::Inactive | ServerState::Closed | ServerState::Error);
        self.state = ServerState::Closed;
        self.step_deadline = None;
        if was_live {
            Outcome { closed: self.report(CloseReason::ConnectionClosed), ..Outcome::none() }
        } else {
            Outcome::none()
        }
    }

    /// Fires the per-step timeout when its deadline has passed
    pub fn check_step_timeout(&mut self, now: u64) -> Option<Outcome> {
        let deadline = self.step_deadline?;
        if now < deadline {
            return None;
        }
        warn!(state = self.state.name(), "handshake step timed out");
        Some(self.failure(ErrorCode::Timeout, CloseReason::ConnectionClosed))
    }

    /// True once the channel is open (or resumed) on this session
    pub fn is_open(&self) -> bool {
        matches!(self.state, ServerState::Ready | ServerState::Open)
    }

    /// The session's contract hash, once a channel is attached
    pub fn contract_hash(&self) -> Option<Txid> {
        self.contract_hash
    }

    /// Best paid amount accepted on this session's channel
    pub fn best_paid(&self) -> u64 {
        self.channel.as_ref().map(ServerChannel::best_paid).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // message handlers
    // ------------------------------------------------------------------

    fn receive_client_version(
        &mut self,
        version: crate::protocol::messages::ClientVersion,
        now: u64,
    ) -> Outcome {
        if version.major != PROTOCOL_VERSION_MAJOR {
            let error = ProtocolError::NoAcceptableVersion(version.major);
            warn!(%error, "rejecting peer version");
            return self
                .failure(ErrorCode::NoAcceptableVersion, CloseReason::NoAcceptableVersion);
        }
        let mut outcome = Outcome::send([ChannelMessage::ServerVersion(ServerVersion {
            major: PROTOCOL_VERSION_MAJOR,
            minor: PROTOCOL_VERSION_MINOR,
        })]);

        // A resumable hash attaches to the stored channel and skips straight
        // to CHANNEL_OPEN. Malformed, unknown, active, or nearly expired
        // hashes all silently fall through to a fresh INITIATE.
        if let Some(record) = self.try_resume(version.previous_channel_contract_hash, now) {
            let hash = record.contract_hash;
            self.channel = Some(ServerChannel::resume(
                record.payee_key,
                record.payer_pubkey,
                record.contract,
                record.contract_vout,
                record.value,
                record.best_paid,
                record.best_payer_signature,
                record.expiry,
                record.fee,
            ));
            self.contract_hash = Some(hash);
            self.state = if record.best_paid > 0 { ServerState::Open } else { ServerState::Ready };
            self.step_deadline = None;
            info!(contract = %hash, "channel resumed");
            return outcome.and_send(ChannelMessage::ChannelOpen).and_opened(hash);
        }

        let expiry = now + self.time_window;
        let channel = ServerChannel::new(self.payee_key, self.min_value, self.fee, expiry);
        outcome = outcome.and_send(ChannelMessage::Initiate(Initiate {
            multisig_key: channel.payee_pubkey().serialize().to_vec(),
            min_accepted_channel_size: self.min_value,
            expire_time_secs: expiry,
        }));
        self.channel = Some(channel);
        self.state = ServerState::WaitingForRefund;
        self.step_deadline = Some(now + self.step_timeout);
        outcome
    }

    /// Checks a client-announced prior contract hash out of the store
    fn try_resume(&self, hash: Option<Vec<u8>>, now: u64) -> Option<StoredServerChannel> {
        let bytes: [u8; 32] = hash?.try_into().ok()?;
        let txid = Txid::from_byte_array(bytes);
        self.store.checkout_inactive(&txid, now)
    }

    fn receive_refund(&mut self, refund: ProvideRefund, now: u64) -> Outcome {
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed),
        };
        match channel.sign_refund(&refund.tx, &refund.multisig_key) {
            Ok(signature) => {
                self.state = ServerState::WaitingForContract;
                self.step_deadline = Some(now + self.step_timeout);
                Outcome::send([ChannelMessage::ReturnRefund(ReturnRefund {
                    signature: crate::tx::encode_wire_signature(&signature),
                })])
            }
            Err(error) => {
                debug!(%error, "refund rejected");
                self.failure(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage)
            }
        }
    }

    fn receive_contract(&mut self, contract_bytes: &[u8]) -> Outcome {
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed),
        };
        let hash = match channel.provide_contract(contract_bytes) {
            Ok(hash) => hash,
            Err(error) => {
                debug!(%error, "contract rejected");
                return self
                    .failure(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage);
            }
        };

        let record = match self.fresh_record(hash) {
            Ok(record) => record,
            Err(error) => {
                warn!(%error, "failed to store accepted channel");
                return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed);
            }
        };
        let contract = record.contract.clone();
        if let Err(error) = self.store.put(record) {
            warn!(%error, "failed to persist accepted channel");
            return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed);
        }

        self.contract_hash = Some(hash);
        self.state = ServerState::Ready;
        self.step_deadline = None;
        info!(contract = %hash, "channel open");
        Outcome::send([ChannelMessage::ChannelOpen])
            .and_broadcast(contract)
            .and_opened(hash)
    }

    fn receive_update(&mut self, update: UpdatePayment) -> Outcome {
        let Ok(signature) = crate::tx::decode_wire_signature(&update.signature) else {
            return self.failure(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage);
        };
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed),
        };
        let (delta, total) = match channel.accept_payment(update.client_change_value, &signature) {
            Ok(accepted) => accepted,
            Err(error) => {
                debug!(%error, "payment update rejected");
                return self
                    .failure(ErrorCode::BadTransaction, CloseReason::RemoteSentInvalidMessage);
            }
        };

        // Commit to the store before surfacing the payment to the embedder.
        let Some(hash) = self.contract_hash else {
            return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed);
        };
        if let Err(error) = self.store.update_best(&hash, total, signature) {
            warn!(%error, "failed to persist payment update");
            return self.failure(ErrorCode::Other, CloseReason::ConnectionClosed);
        }

        self.state = ServerState::Open;
        debug!(delta, total, "payment accepted");
        Outcome::none().and_payment(delta, total)
    }

    fn receive_close(&mut self) -> Outcome {
        self.settle(CloseReason::ClientRequestedClose)
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    /// Signs and queues the best settlement, removes the stored channel,
    /// emits `CLOSE`, and reports `reason`
    fn settle(&mut self, reason: CloseReason) -> Outcome {
        let mut outcome = Outcome::none();
        if let Some(channel) = self.channel.as_mut() {
            match channel.close() {
                Ok(Some(settlement)) => {
                    info!(paid = channel.best_paid(), "broadcasting settlement");
                    outcome = outcome.and_broadcast(settlement);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, "failed to complete settlement");
                }
            }
        }
        if let Some(hash) = self.contract_hash.take() {
            if let Err(error) = self.store.remove(&hash) {
                debug!(%error, "settled channel was not in the store");
            }
        }
        outcome = outcome.and_send(ChannelMessage::Close);
        self.state = ServerState::Closed;
        self.step_deadline = None;
        outcome.closed = self.report(reason);
        outcome
    }

    /// Emits an error message and moves to the terminal state
    fn failure(&mut self, code: ErrorCode, reason: CloseReason) -> Outcome {
        self.fail_channel();
        self.release_channel();
        self.state = ServerState::Error;
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
        if let Some(hash) = self.contract_hash {
            self.store.mark_inactive(&hash);
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

    /// Builds the store record for a freshly accepted channel
    fn fresh_record(&self, hash: Txid) -> crate::errors::Result<StoredServerChannel> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| Error::Internal("session has no channel".to_string()))?;
        Ok(StoredServerChannel {
            contract_hash: hash,
            payee_key: channel.payee_key(),
            payer_pubkey: channel.payer_pubkey()?,
            contract: channel.contract()?.clone(),
            contract_vout: channel.contract_vout()?,
            value: channel.value(),
            best_paid: channel.best_paid(),
            best_payer_signature: channel.best_payer_signature(),
            fee: channel.fee(),
            expiry: channel.expiry(),
            active: true,
        })
    }
}
