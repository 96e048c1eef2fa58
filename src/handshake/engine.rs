//! The client-side handshake state machine.
//!
//! Phases are linear; the server role is not implemented:
//!
//! ```text
//! send ClientHello
//!   -> AwaitServerHello     (derive handshake secrets on ServerHello)
//!   -> AwaitAuthRequest     (server picks one algorithm per direction)
//!   -> AwaitServerShare     (verify the server's attestation payload)
//!   -> AwaitServerVerify    (verify the server's signature)
//!   -> queue own share + verify, derive app secrets
//!   -> Established          (only KeyUpdate records remain legal)
//! ```
//!
//! The engine never touches the transport. The run loop pulls crypto
//! frames with [`HandshakeEngine::next_frames`], feeds incoming crypto
//! frames to [`HandshakeEngine::handle_crypto`], and polls
//! [`HandshakeEngine::poll_transmit`]/[`poll_receive`] before each write
//! and read opportunity. The polls surface the coroutine suspension
//! points as explicit states: `Pause` (nothing may be written yet),
//! `Install` (new key material must be swapped into the encryption
//! engine), `Ready`.
//!
//! [`poll_receive`]: HandshakeEngine::poll_receive

use std::collections::VecDeque;

use p384::ecdh::EphemeralSecret;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;

use super::auth::{AuthProvider, AuthVerifier};
use super::records::{
    AuthenticationRequest, AuthenticationShare, AuthenticationVerify, ClientHello, KeyUpdate,
    RawRecord, RecordAssembler, RecordType, ServerHello,
};
use crate::codec::varint;
use crate::codec::Frame;
use crate::core::{ProtocolError, SecurityLevel, HELLO_RANDOM_SIZE};
use crate::crypto::schedule::{KeySchedule, TrafficKey, TrafficSecret, TranscriptHash};

/// Handshake progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitServerHello,
    AwaitAuthRequest,
    AwaitServerShare,
    AwaitServerVerify,
    Established,
    Failed,
}

/// Result of polling for a direction's key state.
#[derive(Debug)]
pub enum KeyPoll {
    /// No valid key yet and nothing to send; writing must wait. Fatal if
    /// a close is pending.
    Pause,
    /// New key material: install it into the encryption engine before the
    /// next seal/open.
    Install(TrafficKey),
    /// Proceed with the current key (or in the clear, pre-handshake).
    Ready,
}

/// Action fired once an outbound record's final fragment is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterEmit {
    /// Switch the send direction to the application-phase key.
    InstallAppSendKey,
    /// Ratchet the send secret forward (key update).
    RatchetSend,
}

struct OutboundRecord {
    bytes: Vec<u8>,
    offset: usize,
    after: Option<AfterEmit>,
}

/// Configuration for the handshake engine.
pub struct HandshakeEngineConfig {
    /// Ways this endpoint can prove its own identity, in advertisement
    /// order.
    pub providers: Vec<Box<dyn AuthProvider>>,
    /// Ways this endpoint accepts the peer proving its identity, in
    /// advertisement order.
    pub verifiers: Vec<Box<dyn AuthVerifier>>,
}

/// Client-side handshake engine.
pub struct HandshakeEngine {
    phase: Phase,
    transcript: TranscriptHash,
    client_random: [u8; HELLO_RANDOM_SIZE],
    ephemeral: Option<EphemeralSecret>,
    providers: Vec<Box<dyn AuthProvider>>,
    verifiers: Vec<Box<dyn AuthVerifier>>,
    chosen_provider: Option<usize>,
    chosen_verifier: Option<usize>,
    schedule: Option<KeySchedule>,
    /// Current secret for the client->server direction.
    send_secret: Option<TrafficSecret>,
    /// Current secret for the server->client direction.
    recv_secret: Option<TrafficSecret>,
    assembler: RecordAssembler,
    outbound: VecDeque<OutboundRecord>,
    pending_send_key: Option<TrafficKey>,
    pending_recv_key: Option<TrafficKey>,
    send_level: SecurityLevel,
    recv_level: SecurityLevel,
    /// A locally requested key update awaiting the peer's reply.
    update_in_flight: bool,
}

impl HandshakeEngine {
    /// Create the engine and queue the ClientHello.
    pub fn new(config: HandshakeEngineConfig) -> Result<Self, ProtocolError> {
        if config.providers.is_empty() || config.verifiers.is_empty() {
            return Err(ProtocolError::InternalError);
        }

        let mut client_random = [0u8; HELLO_RANDOM_SIZE];
        OsRng.fill_bytes(&mut client_random);
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let key_share = ephemeral
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        let hello = ClientHello {
            random: client_random,
            key_share,
            client_algorithms: config.providers.iter().map(|p| p.algorithm()).collect(),
            server_algorithms: config.verifiers.iter().map(|v| v.algorithm()).collect(),
        };

        let mut engine = Self {
            phase: Phase::AwaitServerHello,
            transcript: TranscriptHash::new(),
            client_random,
            ephemeral: Some(ephemeral),
            providers: config.providers,
            verifiers: config.verifiers,
            chosen_provider: None,
            chosen_verifier: None,
            schedule: None,
            send_secret: None,
            recv_secret: None,
            assembler: RecordAssembler::new(),
            outbound: VecDeque::new(),
            pending_send_key: None,
            pending_recv_key: None,
            send_level: SecurityLevel::Insecure,
            recv_level: SecurityLevel::Insecure,
            update_in_flight: false,
        };
        engine.queue_record(hello.to_raw().encode(), true, None);
        Ok(engine)
    }

    /// Whether the handshake has completed.
    pub fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    /// Security level of the send direction.
    pub fn send_level(&self) -> SecurityLevel {
        self.send_level
    }

    /// Security level of the receive direction.
    pub fn recv_level(&self) -> SecurityLevel {
        self.recv_level
    }

    /// The client random chosen for this handshake.
    pub fn client_random(&self) -> &[u8; HELLO_RANDOM_SIZE] {
        &self.client_random
    }

    /// Poll the transmit-key state before assembling a packet.
    pub fn poll_transmit(&mut self) -> KeyPoll {
        if let Some(key) = self.pending_send_key.take() {
            return KeyPoll::Install(key);
        }
        if self.phase == Phase::Established || !self.outbound.is_empty() {
            KeyPoll::Ready
        } else {
            KeyPoll::Pause
        }
    }

    /// Poll the receive-key state before opening a packet.
    pub fn poll_receive(&mut self) -> KeyPoll {
        if let Some(key) = self.pending_recv_key.take() {
            return KeyPoll::Install(key);
        }
        KeyPoll::Ready
    }

    /// Whether crypto frames are waiting to be emitted.
    pub fn has_pending_frames(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Whether a new send key is waiting to be installed.
    pub fn transmit_key_pending(&self) -> bool {
        self.pending_send_key.is_some()
    }

    /// Request an in-session key update for the send direction.
    ///
    /// A no-op while a previous update is still in flight.
    pub fn request_key_update(&mut self) -> Result<(), ProtocolError> {
        if self.phase != Phase::Established {
            return Err(ProtocolError::UnexpectedMessage);
        }
        if self.update_in_flight {
            return Ok(());
        }
        self.update_in_flight = true;
        let record = KeyUpdate {
            update_requested: true,
        };
        self.queue_record(record.to_raw().encode(), false, Some(AfterEmit::RatchetSend));
        Ok(())
    }

    /// Pull crypto frames to append to the packet under assembly.
    ///
    /// Handshake data always has the highest priority; the caller passes
    /// the remaining packet budget and gets back frames that fit.
    pub fn next_frames(&mut self, budget: &mut usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(front) = self.outbound.front_mut() {
            // tag + flags + a worst-case length prefix
            let overhead = 2 + varint::encoded_len(front.bytes.len() as u64);
            let available = budget.saturating_sub(overhead);
            if available == 0 {
                break;
            }
            let remaining = front.bytes.len() - front.offset;
            let take = remaining.min(available);
            let end = front.offset + take == front.bytes.len();

            let frame = Frame::Crypto {
                end_of_record: end,
                data: front.bytes[front.offset..front.offset + take].to_vec(),
            };
            *budget = budget.saturating_sub(frame.encoded_len());
            frames.push(frame);
            front.offset += take;

            if end {
                let finished = self.outbound.pop_front().expect("front exists");
                if let Some(after) = finished.after {
                    self.fire_after_emit(after);
                }
            } else {
                break;
            }
        }
        frames
    }

    fn fire_after_emit(&mut self, after: AfterEmit) {
        match after {
            AfterEmit::InstallAppSendKey | AfterEmit::RatchetSend => {
                if after == AfterEmit::RatchetSend {
                    if let Some(secret) = self.send_secret.take() {
                        self.send_secret = secret.update().ok();
                    }
                }
                if let Some(secret) = &self.send_secret {
                    if let Ok(key) = secret.traffic_key() {
                        self.pending_send_key = Some(key);
                        self.send_level = SecurityLevel::App;
                    }
                }
            }
        }
    }

    fn queue_record(&mut self, bytes: Vec<u8>, in_transcript: bool, after: Option<AfterEmit>) {
        if in_transcript {
            self.transcript.update(&bytes);
        }
        self.outbound.push_back(OutboundRecord {
            bytes,
            offset: 0,
            after,
        });
    }

    /// Feed one incoming crypto frame.
    pub fn handle_crypto(
        &mut self,
        end_of_record: bool,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let Some(record_bytes) = self
            .assembler
            .push(end_of_record, data)
            .map_err(|_| ProtocolError::DecodeError)?
        else {
            return Ok(());
        };
        match self.process_record(&record_bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn process_record(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let raw = RawRecord::decode(bytes).map_err(|_| ProtocolError::DecodeError)?;
        let kind = RecordType::from_byte(raw.kind).ok_or(ProtocolError::DecodeError)?;

        match (self.phase, kind) {
            (Phase::AwaitServerHello, RecordType::ServerHello) => {
                self.on_server_hello(&raw, bytes)
            }
            (Phase::AwaitAuthRequest, RecordType::AuthenticationRequest) => {
                self.on_auth_request(&raw, bytes)
            }
            (Phase::AwaitServerShare, RecordType::AuthenticationShare) => {
                self.on_server_share(&raw, bytes)
            }
            (Phase::AwaitServerVerify, RecordType::AuthenticationVerify) => {
                self.on_server_verify(&raw, bytes)
            }
            (Phase::Established, RecordType::KeyUpdate) => self.on_key_update(&raw),
            _ => Err(ProtocolError::UnexpectedMessage),
        }
    }

    fn on_server_hello(&mut self, raw: &RawRecord, bytes: &[u8]) -> Result<(), ProtocolError> {
        let hello = ServerHello::from_raw(raw).map_err(|_| ProtocolError::DecodeError)?;
        self.transcript.update(bytes);
        let hello_hash = self.transcript.current();

        let server_key = PublicKey::from_sec1_bytes(&hello.key_share)
            .map_err(|_| ProtocolError::IllegalParameter)?;
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or(ProtocolError::InternalError)?;
        let shared = ephemeral.diffie_hellman(&server_key);

        let schedule = KeySchedule::new(shared.raw_secret_bytes().as_slice(), hello_hash)
            .map_err(|_| ProtocolError::InternalError)?;
        let (client_hs, server_hs) = schedule
            .handshake_secrets()
            .map_err(|_| ProtocolError::InternalError)?;

        self.pending_send_key = Some(
            client_hs
                .traffic_key()
                .map_err(|_| ProtocolError::InternalError)?,
        );
        self.pending_recv_key = Some(
            server_hs
                .traffic_key()
                .map_err(|_| ProtocolError::InternalError)?,
        );
        self.send_secret = Some(client_hs);
        self.recv_secret = Some(server_hs);
        self.send_level = SecurityLevel::Handshake;
        self.recv_level = SecurityLevel::Handshake;
        self.schedule = Some(schedule);
        self.phase = Phase::AwaitAuthRequest;

        tracing::debug!("handshake secrets derived");
        Ok(())
    }

    fn on_auth_request(&mut self, raw: &RawRecord, bytes: &[u8]) -> Result<(), ProtocolError> {
        let request =
            AuthenticationRequest::from_raw(raw).map_err(|_| ProtocolError::DecodeError)?;
        self.transcript.update(bytes);

        let provider_index = usize::from(request.client_index);
        let verifier_index = usize::from(request.server_index);
        if provider_index >= self.providers.len() || verifier_index >= self.verifiers.len() {
            return Err(ProtocolError::IllegalParameter);
        }
        self.chosen_provider = Some(provider_index);
        self.chosen_verifier = Some(verifier_index);
        self.phase = Phase::AwaitServerShare;
        Ok(())
    }

    fn on_server_share(&mut self, raw: &RawRecord, bytes: &[u8]) -> Result<(), ProtocolError> {
        let share = AuthenticationShare::from_raw(raw).map_err(|_| ProtocolError::DecodeError)?;

        // The server bound the transcript as it stood before this record.
        let challenge = self.transcript.current();
        let verifier_index = self.chosen_verifier.ok_or(ProtocolError::InternalError)?;
        self.verifiers[verifier_index]
            .verify_share(&share.payload, &challenge)
            .map_err(ProtocolError::from)?;

        self.transcript.update(bytes);
        self.phase = Phase::AwaitServerVerify;
        Ok(())
    }

    fn on_server_verify(&mut self, raw: &RawRecord, bytes: &[u8]) -> Result<(), ProtocolError> {
        let verify =
            AuthenticationVerify::from_raw(raw).map_err(|_| ProtocolError::DecodeError)?;

        let signed_hash = self.transcript.current();
        let verifier_index = self.chosen_verifier.ok_or(ProtocolError::InternalError)?;
        self.verifiers[verifier_index]
            .verify_signature(&verify.signature, &signed_hash)
            .map_err(ProtocolError::from)?;
        self.transcript.update(bytes);

        // Remote identity verified; attest the local one symmetrically.
        let provider_index = self.chosen_provider.ok_or(ProtocolError::InternalError)?;

        let share_challenge = self.transcript.current();
        let share_payload = self.providers[provider_index]
            .make_share_data(&share_challenge)
            .map_err(ProtocolError::from)?;
        let share = AuthenticationShare {
            payload: share_payload,
        };
        self.queue_record(share.to_raw().encode(), true, None);

        let verify_hash = self.transcript.current();
        let signature = self.providers[provider_index]
            .make_verify_signature(&verify_hash)
            .map_err(ProtocolError::from)?;
        let verify = AuthenticationVerify { signature };
        self.queue_record(
            verify.to_raw().encode(),
            true,
            Some(AfterEmit::InstallAppSendKey),
        );

        // Full transcript is now fixed: derive the application phase.
        let full_hash = self.transcript.current();
        let schedule = self.schedule.as_ref().ok_or(ProtocolError::InternalError)?;
        let (client_ap, server_ap) = schedule
            .app_secrets(&full_hash)
            .map_err(|_| ProtocolError::InternalError)?;

        // The server sends nothing further under handshake keys, so the
        // receive direction switches immediately; the send direction
        // switches once our verify record has been emitted.
        self.pending_recv_key = Some(
            server_ap
                .traffic_key()
                .map_err(|_| ProtocolError::InternalError)?,
        );
        self.recv_level = SecurityLevel::App;
        self.send_secret = Some(client_ap);
        self.recv_secret = Some(server_ap);
        self.phase = Phase::Established;

        tracing::debug!("handshake established");
        Ok(())
    }

    fn on_key_update(&mut self, raw: &RawRecord) -> Result<(), ProtocolError> {
        let update = KeyUpdate::from_raw(raw).map_err(|_| ProtocolError::DecodeError)?;

        // The sender has ratcheted (or is about to ratchet) its send
        // secret; ratchet our receive secret to match.
        let recv = self
            .recv_secret
            .take()
            .ok_or(ProtocolError::InternalError)?;
        let next = recv.update().map_err(|_| ProtocolError::InternalError)?;
        self.pending_recv_key = Some(
            next.traffic_key()
                .map_err(|_| ProtocolError::InternalError)?,
        );
        self.recv_secret = Some(next);

        if update.update_requested {
            let reply = KeyUpdate {
                update_requested: false,
            };
            self.queue_record(reply.to_raw().encode(), false, Some(AfterEmit::RatchetSend));
            tracing::debug!("key update requested by peer");
        } else {
            if !self.update_in_flight {
                return Err(ProtocolError::UnexpectedMessage);
            }
            self.update_in_flight = false;
            tracing::debug!("key update completed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Role, AEAD_TAG_SIZE};
    use crate::handshake::auth::{signing_context, PreTrustedKeyProvider, PreTrustedKeyVerifier};
    use p384::ecdsa::signature::{Signer, Verifier};
    use p384::ecdsa::{Signature, SigningKey, VerifyingKey};

    /// Mirror of the server side of the exchange, driven manually since
    /// the engine only implements the client role.
    struct TestServer {
        transcript: TranscriptHash,
        ephemeral: Option<EphemeralSecret>,
        key: SigningKey,
        client_key: VerifyingKey,
        schedule: Option<KeySchedule>,
        assembler: RecordAssembler,
        records: Vec<RawRecord>,
    }

    impl TestServer {
        fn new(key: SigningKey, client_key: VerifyingKey) -> Self {
            Self {
                transcript: TranscriptHash::new(),
                ephemeral: Some(EphemeralSecret::random(&mut OsRng)),
                key,
                client_key,
                schedule: None,
                assembler: RecordAssembler::new(),
                records: Vec::new(),
            }
        }

        fn feed_frames(&mut self, frames: Vec<Frame>) {
            for frame in frames {
                let Frame::Crypto { end_of_record, data } = frame else {
                    panic!("handshake emitted a non-crypto frame");
                };
                if let Some(bytes) = self.assembler.push(end_of_record, &data).unwrap() {
                    self.records.push(RawRecord::decode(&bytes).unwrap());
                    self.on_record(bytes);
                }
            }
        }

        fn on_record(&mut self, bytes: Vec<u8>) {
            // Shares and verifies are checked in the test body; the
            // transcript absorbs everything in arrival order except that
            // verification uses the pre-record snapshot.
            let raw = RawRecord::decode(&bytes).unwrap();
            match RecordType::from_byte(raw.kind).unwrap() {
                RecordType::ClientHello => self.transcript.update(&bytes),
                RecordType::KeyUpdate => {}
                RecordType::AuthenticationShare => {
                    let share = AuthenticationShare::from_raw(&raw).unwrap();
                    let presented = VerifyingKey::from_sec1_bytes(&share.payload).unwrap();
                    assert_eq!(presented, self.client_key);
                    self.transcript.update(&bytes);
                }
                RecordType::AuthenticationVerify => {
                    let verify = AuthenticationVerify::from_raw(&raw).unwrap();
                    let signed_hash = self.transcript.current();
                    let context = signing_context(Role::Client, &signed_hash);
                    let signature = Signature::from_slice(&verify.signature).unwrap();
                    self.client_key.verify(&context, &signature).unwrap();
                    self.transcript.update(&bytes);
                }
                other => panic!("unexpected record from client: {other:?}"),
            }
        }

        /// Emit ServerHello..AuthenticationVerify as full record blobs.
        fn handshake_flight(&mut self, client_hello: &ClientHello) -> Vec<Vec<u8>> {
            let ephemeral = self.ephemeral.take().unwrap();
            let hello = ServerHello {
                random: [0xB0; HELLO_RANDOM_SIZE],
                key_share: ephemeral
                    .public_key()
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec(),
            };
            let hello_bytes = hello.to_raw().encode();
            self.transcript.update(&hello_bytes);
            let hello_hash = self.transcript.current();

            let client_share = PublicKey::from_sec1_bytes(&client_hello.key_share).unwrap();
            let shared = ephemeral.diffie_hellman(&client_share);
            self.schedule =
                Some(KeySchedule::new(shared.raw_secret_bytes().as_slice(), hello_hash).unwrap());

            let request = AuthenticationRequest {
                client_index: 0,
                server_index: 0,
            };
            let request_bytes = request.to_raw().encode();
            self.transcript.update(&request_bytes);

            let share = AuthenticationShare {
                payload: self
                    .key
                    .verifying_key()
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec(),
            };
            let share_bytes = share.to_raw().encode();
            self.transcript.update(&share_bytes);

            let signed_hash = self.transcript.current();
            let context = signing_context(Role::Server, &signed_hash);
            let signature: Signature = self.key.sign(&context);
            let verify = AuthenticationVerify {
                signature: signature.to_vec(),
            };
            let verify_bytes = verify.to_raw().encode();
            self.transcript.update(&verify_bytes);

            vec![hello_bytes, request_bytes, share_bytes, verify_bytes]
        }

        fn app_keys(&self) -> (TrafficKey, TrafficKey) {
            let full_hash = self.transcript.current();
            let (client_ap, server_ap) = self
                .schedule
                .as_ref()
                .unwrap()
                .app_secrets(&full_hash)
                .unwrap();
            (
                client_ap.traffic_key().unwrap(),
                server_ap.traffic_key().unwrap(),
            )
        }
    }

    struct DrivenClient {
        engine: HandshakeEngine,
        send_keys: Vec<TrafficKey>,
        recv_keys: Vec<TrafficKey>,
    }

    impl DrivenClient {
        fn new() -> (Self, TestServer) {
            let client_key = SigningKey::random(&mut OsRng);
            let server_key = SigningKey::random(&mut OsRng);

            let engine = HandshakeEngine::new(HandshakeEngineConfig {
                providers: vec![Box::new(PreTrustedKeyProvider::new(
                    client_key.clone(),
                    Role::Client,
                ))],
                verifiers: vec![Box::new(PreTrustedKeyVerifier::new(
                    *server_key.verifying_key(),
                    Role::Server,
                ))],
            })
            .unwrap();

            let server = TestServer::new(server_key, *client_key.verifying_key());
            (
                Self {
                    engine,
                    send_keys: Vec::new(),
                    recv_keys: Vec::new(),
                },
                server,
            )
        }

        fn drain_polls(&mut self) {
            while let KeyPoll::Install(key) = self.engine.poll_transmit() {
                self.send_keys.push(key);
            }
            while let KeyPoll::Install(key) = self.engine.poll_receive() {
                self.recv_keys.push(key);
            }
        }

        fn drain_frames(&mut self) -> Vec<Frame> {
            let mut budget = usize::MAX;
            let frames = self.engine.next_frames(&mut budget);
            self.drain_polls();
            frames
        }

        fn feed_records(&mut self, records: Vec<Vec<u8>>) {
            for record in records {
                self.engine.handle_crypto(true, &record).unwrap();
                self.drain_polls();
            }
        }
    }

    fn complete_handshake() -> (DrivenClient, TestServer) {
        let (mut client, mut server) = DrivenClient::new();

        // Flight 1: ClientHello.
        let frames = client.drain_frames();
        assert!(!frames.is_empty());
        server.feed_frames(frames);
        let client_hello = ClientHello::from_raw(&server.records[0]).unwrap();

        // Flight 2: server hello through server verify.
        let records = server.handshake_flight(&client_hello);
        client.feed_records(records);
        assert!(client.engine.is_established());

        // Flight 3: client share + verify.
        let frames = client.drain_frames();
        server.feed_frames(frames);
        (client, server)
    }

    #[test]
    fn test_full_exchange_agrees_on_app_keys() {
        let (client, server) = complete_handshake();

        // Keys install in order: handshake send/recv, then app send/recv.
        assert_eq!(client.send_keys.len(), 2);
        assert_eq!(client.recv_keys.len(), 2);

        let (server_view_client_key, server_view_server_key) = server.app_keys();
        assert_eq!(client.send_keys[1], server_view_client_key);
        assert_eq!(client.recv_keys[1], server_view_server_key);
    }

    #[test]
    fn test_levels_progress() {
        let (mut client, mut server) = DrivenClient::new();
        assert_eq!(client.engine.send_level(), SecurityLevel::Insecure);

        let frames = client.drain_frames();
        server.feed_frames(frames);
        let client_hello = ClientHello::from_raw(&server.records[0]).unwrap();

        let records = server.handshake_flight(&client_hello);
        client.feed_records(records);

        // Recv flips to app as soon as the server flight is processed;
        // send flips once the client verify record is emitted.
        assert_eq!(client.engine.recv_level(), SecurityLevel::App);
        let _ = client.drain_frames();
        assert_eq!(client.engine.send_level(), SecurityLevel::App);
    }

    #[test]
    fn test_bad_server_signature_rejected() {
        let (mut client, mut server) = DrivenClient::new();
        let frames = client.drain_frames();
        server.feed_frames(frames);
        let client_hello = ClientHello::from_raw(&server.records[0]).unwrap();

        let mut records = server.handshake_flight(&client_hello);
        // Corrupt the verify signature.
        let verify_bytes = records.last_mut().unwrap();
        let len = verify_bytes.len();
        verify_bytes[len - 1] ^= 0xFF;

        for (index, record) in records.into_iter().enumerate() {
            let result = client.engine.handle_crypto(true, &record);
            client.drain_polls();
            if index == 3 {
                assert_eq!(result, Err(ProtocolError::AccessDenied));
            } else {
                result.unwrap();
            }
        }
        assert!(!client.engine.is_established());
    }

    #[test]
    fn test_unexpected_record_rejected() {
        let (mut client, _server) = DrivenClient::new();
        // An AuthenticationRequest before ServerHello is out of order.
        let record = AuthenticationRequest {
            client_index: 0,
            server_index: 0,
        }
        .to_raw()
        .encode();
        assert_eq!(
            client.engine.handle_crypto(true, &record),
            Err(ProtocolError::UnexpectedMessage)
        );
    }

    #[test]
    fn test_out_of_range_auth_index_rejected() {
        let (mut client, mut server) = DrivenClient::new();
        let frames = client.drain_frames();
        server.feed_frames(frames);
        let client_hello = ClientHello::from_raw(&server.records[0]).unwrap();

        let mut records = server.handshake_flight(&client_hello);
        records.truncate(1);
        client.feed_records(records);

        let bad_request = AuthenticationRequest {
            client_index: 5,
            server_index: 0,
        }
        .to_raw()
        .encode();
        assert_eq!(
            client.engine.handle_crypto(true, &bad_request),
            Err(ProtocolError::IllegalParameter)
        );
    }

    #[test]
    fn test_fragmented_hello_flight() {
        let (mut client, mut server) = DrivenClient::new();

        // Emit the ClientHello under a tiny budget: many crypto frames.
        let mut all_frames = Vec::new();
        loop {
            let mut budget = 16;
            let frames = client.engine.next_frames(&mut budget);
            if frames.is_empty() {
                break;
            }
            all_frames.extend(frames);
        }
        assert!(all_frames.len() > 1);
        server.feed_frames(all_frames);
        assert_eq!(server.records.len(), 1);
        assert!(ClientHello::from_raw(&server.records[0]).is_ok());
    }

    #[test]
    fn test_key_update_roundtrip() {
        let (mut client, server) = complete_handshake();

        client.engine.request_key_update().unwrap();
        // A second request while in flight is a no-op.
        client.engine.request_key_update().unwrap();

        let frames = client.drain_frames();
        let update_frames: Vec<_> = frames
            .iter()
            .filter(|frame| matches!(frame, Frame::Crypto { .. }))
            .collect();
        assert_eq!(update_frames.len(), 1);

        // Send secret ratcheted exactly once after emission.
        assert_eq!(client.send_keys.len(), 3);
        let (server_view_client_key, server_view_server_key) = server.app_keys();
        assert_ne!(client.send_keys[2], server_view_client_key);

        // Peer replies with update_requested = false; receive secret
        // ratchets to match the server's new send secret.
        let reply = KeyUpdate {
            update_requested: false,
        }
        .to_raw()
        .encode();
        client.engine.handle_crypto(true, &reply).unwrap();
        client.drain_polls();
        assert_eq!(client.recv_keys.len(), 3);
        assert_ne!(client.recv_keys[2], server_view_server_key);
    }

    #[test]
    fn test_unsolicited_key_update_reply_rejected() {
        let (mut client, _server) = complete_handshake();
        let reply = KeyUpdate {
            update_requested: false,
        }
        .to_raw()
        .encode();
        assert_eq!(
            client.engine.handle_crypto(true, &reply),
            Err(ProtocolError::UnexpectedMessage)
        );
    }

    #[test]
    fn test_peer_requested_key_update() {
        let (mut client, _server) = complete_handshake();

        let request = KeyUpdate {
            update_requested: true,
        }
        .to_raw()
        .encode();
        client.engine.handle_crypto(true, &request).unwrap();
        client.drain_polls();
        // Receive key ratcheted immediately.
        assert_eq!(client.recv_keys.len(), 3);

        // The reply emits and ratchets our send secret afterwards.
        let frames = client.drain_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(client.send_keys.len(), 3);
    }

    #[test]
    fn test_handshake_sizes_give_room_for_tag() {
        // The run loop budget math depends on crypto frames leaving room
        // for the AEAD tag; sanity-check the overhead estimate.
        let frame = Frame::Crypto {
            end_of_record: true,
            data: vec![0; 100],
        };
        assert!(frame.encoded_len() >= 100 + 2);
        assert!(frame.encoded_len() <= 100 + 2 + 8 + AEAD_TAG_SIZE);
    }
}
