//! The per-connection run loop.
//!
//! One tokio task owns every engine: handshake, encryption, flow control,
//! and streams. Nothing else touches them. The task sleeps on a single
//! `select!` over its wake-up sources — commands from handles, the write
//! signal, transport bytes, timers — and because it handles exactly one
//! wake-up at a time, packet assembly and frame dispatch are never
//! concurrent: a write signal that arrives while a read is being handled
//! simply waits its turn.
//!
//! Write opportunity (in order): query the handshake transmit-key state,
//! emit a pending close frame, compute the packet budget, append crypto
//! frames, then (at app security level) acks and stream frames, inject a
//! keep-alive ping if the packet would otherwise solicit nothing, seal,
//! transmit, and check the key-update alarm. Read opportunity: query the
//! receive-key state, open the packet, then dispatch frames one at a time
//! in encode order.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::signal::Signal;
use crate::codec::{encode_packet, Frame, PacketDeframer};
use crate::core::{
    CryptoError, FlowError, ProtocolError, Role, SecurityLevel, StreamError, CLOSE_TIMEOUT,
    KEEPALIVE_INTERVAL, MAX_PACKET_SIZE,
};
use crate::crypto::EncryptionEngine;
use crate::flow::FlowControlEngine;
use crate::handshake::{HandshakeEngine, HandshakeEngineConfig, KeyPoll};
use crate::stream::{DataUnit, StreamEngine, StreamEvent, StreamId};
use crate::transport::ByteTransport;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Active (includes the handshake period).
    Open,
    /// A local close was requested but its frame has not gone out yet.
    ClosePending,
    /// The close frame went out; waiting for the peer or the timeout.
    CloseSent,
    /// Fully closed. Terminal.
    Closed,
    /// Terminated without a graceful close. Terminal.
    Aborted,
}

impl ConnectionState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Aborted)
    }
}

/// Errors surfaced by the connection API and run loop.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Fatal protocol error (local validation or peer misbehavior).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Crypto layer failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Flow-control failure (ack timeout, accounting violation).
    #[error("flow control error: {0}")]
    Flow(#[from] FlowError),

    /// Stream-level failure reported through a handle.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Transport I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The run loop was torn down before a graceful close completed.
    #[error("connection cancelled before close completed")]
    Cancelled,

    /// The connection task is gone.
    #[error("connection is no longer running")]
    Disconnected,
}

/// Per-stream application callbacks.
pub struct StreamCallbacks {
    /// Invoked once per reassembled data unit.
    pub on_receive: Box<dyn FnMut(DataUnit) + Send>,
    /// Invoked once when the stream reaches full closure.
    pub on_close: Box<dyn FnMut(Option<u64>) + Send>,
}

impl StreamCallbacks {
    /// Bundle the two callbacks.
    pub fn new(
        on_receive: impl FnMut(DataUnit) + Send + 'static,
        on_close: impl FnMut(Option<u64>) + Send + 'static,
    ) -> Self {
        Self {
            on_receive: Box::new(on_receive),
            on_close: Box::new(on_close),
        }
    }
}

/// Invoked when the peer opens a stream; returns the callbacks to attach.
pub type PeerStreamCallback = Box<dyn FnMut(StreamId, StreamHandle) -> StreamCallbacks + Send>;

/// Connection configuration.
pub struct ConnectionConfig {
    /// Handshake providers/verifiers.
    pub handshake: HandshakeEngineConfig,
    /// Override for the flow-control transmit-size bootstrap; defaults to
    /// the transport's hint.
    pub estimated_transmit_size: Option<usize>,
    /// Callback for peer-opened streams; absent means peer streams are
    /// accepted but their data is dropped.
    pub on_peer_stream: Option<PeerStreamCallback>,
}

/// Builder for [`ConnectionConfig`].
#[derive(Default)]
pub struct ConnectionBuilder {
    providers: Vec<Box<dyn crate::handshake::AuthProvider>>,
    verifiers: Vec<Box<dyn crate::handshake::AuthVerifier>>,
    estimated_transmit_size: Option<usize>,
    on_peer_stream: Option<PeerStreamCallback>,
}

impl ConnectionBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a way to prove the local identity.
    pub fn provider(mut self, provider: impl crate::handshake::AuthProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Accept a way for the peer to prove its identity.
    pub fn verifier(mut self, verifier: impl crate::handshake::AuthVerifier + 'static) -> Self {
        self.verifiers.push(Box::new(verifier));
        self
    }

    /// Override the flow-control transmit-size bootstrap.
    pub fn estimated_transmit_size(mut self, size: usize) -> Self {
        self.estimated_transmit_size = Some(size);
        self
    }

    /// Install the peer-stream acceptance callback.
    pub fn on_peer_stream(
        mut self,
        callback: impl FnMut(StreamId, StreamHandle) -> StreamCallbacks + Send + 'static,
    ) -> Self {
        self.on_peer_stream = Some(Box::new(callback));
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig {
            handshake: HandshakeEngineConfig {
                providers: self.providers,
                verifiers: self.verifiers,
            },
            estimated_transmit_size: self.estimated_transmit_size,
            on_peer_stream: self.on_peer_stream,
        }
    }
}

enum Command {
    StartStream {
        unidirectional: bool,
        priority: u8,
        callbacks: StreamCallbacks,
        reply: oneshot::Sender<Result<StreamId, StreamError>>,
    },
    Send {
        id: StreamId,
        unit: DataUnit,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    CloseStream {
        id: StreamId,
        error_code: u64,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    ShutdownStream {
        id: StreamId,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Close {
        code: u64,
        reason: Vec<u8>,
    },
}

/// Handle for one application stream.
#[derive(Clone)]
pub struct StreamHandle {
    id: StreamId,
    commands: mpsc::Sender<Command>,
}

impl StreamHandle {
    /// The stream's identity.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Queue a data unit for sending.
    pub async fn send(&self, unit: DataUnit) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                id: self.id,
                unit,
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Disconnected)?;
        response
            .await
            .map_err(|_| ConnectionError::Disconnected)?
            .map_err(ConnectionError::Stream)
    }

    /// Close the stream, emitting the closing frames.
    pub async fn close(&self, error_code: u64) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::CloseStream {
                id: self.id,
                error_code,
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Disconnected)?;
        response
            .await
            .map_err(|_| ConnectionError::Disconnected)?
            .map_err(ConnectionError::Stream)
    }

    /// Forced local teardown without waiting for the peer.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::ShutdownStream { id: self.id, reply })
            .await
            .map_err(|_| ConnectionError::Disconnected)?;
        response
            .await
            .map_err(|_| ConnectionError::Disconnected)?
            .map_err(ConnectionError::Stream)
    }
}

/// A QLIC connection over one byte transport.
pub struct Connection {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    established_rx: watch::Receiver<bool>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Connection {
    /// Open a connection over `transport` and start its run loop.
    ///
    /// The handshake proceeds in the background; use
    /// [`Connection::wait_established`] before opening streams.
    pub fn connect<T: ByteTransport + 'static>(
        transport: T,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        let handshake = HandshakeEngine::new(config.handshake)?;
        let estimated = config
            .estimated_transmit_size
            .unwrap_or_else(|| transport.preferred_transmit_size());

        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let (established_tx, established_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let driver = Driver {
            transport,
            deframer: PacketDeframer::new(),
            encryption: EncryptionEngine::new(),
            handshake,
            flow: FlowControlEngine::new(estimated, Instant::now()),
            streams: StreamEngine::new(Role::Client),
            state: ConnectionState::Open,
            app_close: None,
            fatal: None,
            pending_error: None,
            close_deadline: None,
            callbacks: HashMap::new(),
            on_peer_stream: config.on_peer_stream,
            commands_rx,
            commands_tx: commands_tx.clone(),
            write_signal: Signal::new(),
            state_tx,
            established_tx,
        };

        tokio::spawn(async move {
            if let Err(error) = driver.run(shutdown_rx).await {
                tracing::warn!(%error, "connection terminated");
            }
        });

        Ok(Self {
            commands: commands_tx,
            state_rx,
            established_rx,
            shutdown: Some(shutdown_tx),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the handshake completes.
    pub async fn wait_established(&self) -> Result<(), ConnectionError> {
        let mut established = self.established_rx.clone();
        let mut state = self.state_rx.clone();
        loop {
            if *established.borrow() {
                return Ok(());
            }
            if state.borrow().is_terminal() {
                return Err(ConnectionError::Disconnected);
            }
            tokio::select! {
                changed = established.changed() => {
                    if changed.is_err() {
                        return Err(ConnectionError::Disconnected);
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(ConnectionError::Disconnected);
                    }
                }
            }
        }
    }

    /// Open a locally originated stream.
    pub async fn start_stream(
        &self,
        unidirectional: bool,
        priority: u8,
        callbacks: StreamCallbacks,
    ) -> Result<StreamHandle, ConnectionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::StartStream {
                unidirectional,
                priority,
                callbacks,
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Disconnected)?;
        let id = response
            .await
            .map_err(|_| ConnectionError::Disconnected)?
            .map_err(ConnectionError::Stream)?;
        Ok(StreamHandle {
            id,
            commands: self.commands.clone(),
        })
    }

    /// Request a graceful close with an application code and reason.
    pub async fn close(&self, code: u64, reason: Vec<u8>) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::Close { code, reason })
            .await
            .map_err(|_| ConnectionError::Disconnected)
    }

    /// Wait for the connection to reach a terminal state.
    pub async fn closed(&self) -> ConnectionState {
        let mut state = self.state_rx.clone();
        loop {
            let current = *state.borrow();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

enum Wake {
    Cancel,
    Command(Option<Command>),
    Write,
    Read(io::Result<usize>),
    Timer,
}

struct Driver<T: ByteTransport> {
    transport: T,
    deframer: PacketDeframer,
    encryption: EncryptionEngine,
    handshake: HandshakeEngine,
    flow: FlowControlEngine,
    streams: StreamEngine,
    state: ConnectionState,
    app_close: Option<(u64, Vec<u8>)>,
    fatal: Option<(ProtocolError, u64)>,
    pending_error: Option<ConnectionError>,
    close_deadline: Option<Instant>,
    callbacks: HashMap<u64, StreamCallbacks>,
    on_peer_stream: Option<PeerStreamCallback>,
    commands_rx: mpsc::Receiver<Command>,
    commands_tx: mpsc::Sender<Command>,
    write_signal: Signal,
    state_tx: watch::Sender<ConnectionState>,
    established_tx: watch::Sender<bool>,
}

impl<T: ByteTransport> Driver<T> {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), ConnectionError> {
        let result = self.run_inner(&mut shutdown).await;

        self.streams.shutdown_all();
        self.dispatch_stream_events();
        match &result {
            Ok(()) => self.set_state(ConnectionState::Closed),
            Err(_) => self.set_state(ConnectionState::Aborted),
        }
        result
    }

    async fn run_inner(
        &mut self,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let mut read_buf = vec![0u8; 16384];
        // The ClientHello is already queued.
        self.write_signal.raise();

        loop {
            let deadline = tokio::time::Instant::from_std(self.next_deadline(Instant::now()));
            let wake = tokio::select! {
                biased;
                _ = &mut *shutdown => Wake::Cancel,
                command = self.commands_rx.recv() => Wake::Command(command),
                _ = self.write_signal.wait() => Wake::Write,
                result = self.transport.read(&mut read_buf) => Wake::Read(result),
                _ = tokio::time::sleep_until(deadline) => Wake::Timer,
            };

            let finished = match wake {
                Wake::Cancel | Wake::Command(None) => {
                    // Forced teardown; an in-flight graceful close that
                    // has not completed escalates to abort.
                    return Err(ConnectionError::Cancelled);
                }
                Wake::Command(Some(command)) => {
                    self.handle_command(command);
                    false
                }
                Wake::Write => self.write_opportunity(Instant::now()).await?,
                Wake::Read(Err(error)) => return self.on_io_error(error).map(|_| ()),
                Wake::Read(Ok(0)) => {
                    // Orderly EOF from the peer.
                    if self.close_in_progress() {
                        return Ok(());
                    }
                    return Err(ConnectionError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "transport closed unexpectedly",
                    )));
                }
                Wake::Read(Ok(n)) => {
                    let bytes = read_buf[..n].to_vec();
                    self.on_bytes(&bytes, Instant::now())?
                }
                Wake::Timer => self.on_timer(Instant::now())?,
            };
            if finished {
                return Ok(());
            }
        }
    }

    fn close_in_progress(&self) -> bool {
        self.app_close.is_some()
            || matches!(
                self.state,
                ConnectionState::ClosePending | ConnectionState::CloseSent
            )
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        // Flow timers only run on a secured channel; before that the only
        // deadline that matters is the close budget.
        let mut deadline = if self.app_ready() {
            self.flow.next_timeout(now)
        } else {
            now + KEEPALIVE_INTERVAL
        };
        if let Some(close) = self.close_deadline {
            deadline = deadline.min(close);
        }
        deadline.max(now + Duration::from_millis(10))
    }

    /// Whether app-data frames may flow: both directions at app level and
    /// no key waiting to be swapped in.
    fn app_ready(&self) -> bool {
        self.handshake.is_established()
            && self.handshake.send_level() == SecurityLevel::App
            && self.handshake.recv_level() == SecurityLevel::App
            && !self.handshake.transmit_key_pending()
    }

    fn queue_fatal(&mut self, error: ProtocolError, trigger: u64) {
        if self.fatal.is_none() {
            self.fatal = Some((error, trigger));
            if self.pending_error.is_none() {
                self.pending_error = Some(ConnectionError::Protocol(error));
            }
        }
        self.write_signal.raise();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartStream {
                unidirectional,
                priority,
                callbacks,
                reply,
            } => {
                let result = self.streams.start_local_stream(unidirectional, priority);
                if let Ok(id) = &result {
                    self.callbacks.insert(id.encode(), callbacks);
                }
                let _ = reply.send(result);
            }
            Command::Send { id, unit, reply } => {
                let _ = reply.send(self.streams.send(id, unit));
                self.write_signal.raise();
            }
            Command::CloseStream {
                id,
                error_code,
                reply,
            } => {
                let _ = reply.send(self.streams.close(id, error_code));
                self.dispatch_stream_events();
                self.write_signal.raise();
            }
            Command::ShutdownStream { id, reply } => {
                let _ = reply.send(self.streams.shutdown(id));
                self.dispatch_stream_events();
            }
            Command::Close { code, reason } => {
                if self.state == ConnectionState::Open {
                    self.app_close = Some((code, reason));
                    self.set_state(ConnectionState::ClosePending);
                    self.write_signal.raise();
                }
            }
        }
    }

    /// One write opportunity. Returns true when the connection finished.
    async fn write_opportunity(&mut self, now: Instant) -> Result<bool, ConnectionError> {
        if self.state == ConnectionState::CloseSent || self.state.is_terminal() {
            return Ok(false);
        }

        // (1) Transmit-key state.
        loop {
            match self.handshake.poll_transmit() {
                KeyPoll::Install(key) => self.encryption.install_send_key(&key),
                KeyPoll::Pause => {
                    if self.fatal.is_some() || self.app_close.is_some() {
                        // A close cannot be delivered without a key.
                        return Err(self
                            .pending_error
                            .take()
                            .unwrap_or(ConnectionError::Protocol(ProtocolError::InternalError)));
                    }
                    return Ok(false);
                }
                KeyPoll::Ready => break,
            }
        }

        // (2) Pending closes preempt everything and stop further writes.
        if let Some((error, trigger)) = self.fatal.take() {
            let frame = Frame::ProtocolClose {
                code: error.code(),
                frame_type: trigger,
                reason: error.to_string().into_bytes(),
            };
            if let Err(error) = self.send_frames(&[frame]).await {
                tracing::warn!(%error, "failed to deliver protocol close");
            }
            return Err(self
                .pending_error
                .take()
                .unwrap_or(ConnectionError::Protocol(error)));
        }
        if let Some((code, reason)) = self.app_close.take() {
            let frame = Frame::AppClose { code, reason };
            match self.send_frames(&[frame]).await {
                Ok(_) => {
                    self.set_state(ConnectionState::CloseSent);
                    self.close_deadline = Some(now + CLOSE_TIMEOUT);
                    return Ok(false);
                }
                // I/O failure with a close pending settles as closed.
                Err(_) => return Ok(true),
            }
        }

        // (3) Packet budget.
        let packet_budget = self
            .flow
            .next_packet_size()
            .min(self.transport.preferred_transmit_size())
            .min(MAX_PACKET_SIZE);
        let mut budget = self.encryption.max_plaintext_len(packet_budget);

        // (4) Handshake frames first, always.
        let app_ready_before = self.app_ready();
        let mut frames = self.handshake.next_frames(&mut budget);

        // (5) Acks and stream frames only on a fully secured channel.
        let mut stream_acks = Vec::new();
        if app_ready_before {
            if let Some(ack) = self.flow.take_ack_frame(now) {
                if ack.encoded_len() <= budget {
                    budget -= ack.encoded_len();
                    frames.push(ack);
                }
            }
            let (stream_frames, acks) = self.streams.next_frames(&mut budget);
            frames.extend(stream_frames);
            stream_acks = acks;

            let soliciting = frames.iter().any(Frame::is_ack_soliciting);
            if !soliciting
                && budget > 0
                && (self.flow.needs_keepalive(now) || self.flow.should_solicit_ack())
            {
                frames.push(Frame::Ping);
            }
        }

        // (6) Nothing to say: skip this opportunity.
        if frames.is_empty() {
            return Ok(false);
        }

        let ack_soliciting = frames.iter().any(Frame::is_ack_soliciting);
        let sealed_len = match self.send_frames(&frames).await {
            Ok(len) => len,
            Err(error) => {
                return if self.close_in_progress() {
                    Ok(true)
                } else {
                    Err(error)
                }
            }
        };

        if app_ready_before {
            self.flow
                .on_packet_sent(sealed_len, ack_soliciting, stream_acks, now);
        }

        // Proactive key rotation before the nonce counter runs out.
        if self.encryption.should_update_key() {
            let _ = self.handshake.request_key_update();
        }

        if self.handshake.has_pending_frames()
            || self.handshake.transmit_key_pending()
            || (self.app_ready() && self.streams.has_pending_frames())
        {
            self.write_signal.raise();
        }
        Ok(false)
    }

    /// Encode, seal, and transmit one packet. Returns the sealed payload
    /// length.
    async fn send_frames(&mut self, frames: &[Frame]) -> Result<usize, ConnectionError> {
        let mut plaintext = Vec::new();
        for frame in frames {
            frame
                .encode(&mut plaintext)
                .map_err(|_| ConnectionError::Protocol(ProtocolError::InternalError))?;
        }
        let sealed = self.encryption.seal(&plaintext)?;
        let sealed_len = sealed.len();
        let packet = encode_packet(&sealed);
        self.transport.write_all(&packet).await?;
        Ok(sealed_len)
    }

    fn on_io_error(&mut self, error: io::Error) -> Result<bool, ConnectionError> {
        if self.close_in_progress() {
            // Failure after a close was already pending settles as
            // closed, not aborted.
            return Ok(true);
        }
        Err(ConnectionError::Io(error))
    }

    /// One read opportunity. Returns true when the connection finished.
    fn on_bytes(&mut self, bytes: &[u8], now: Instant) -> Result<bool, ConnectionError> {
        self.deframer.push(bytes);
        loop {
            let payload = match self.deframer.next_packet() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(_) => {
                    self.queue_fatal(ProtocolError::DecodeError, 0);
                    return Ok(false);
                }
            };

            // Receive-key state.
            loop {
                match self.handshake.poll_receive() {
                    KeyPoll::Install(key) => self.encryption.install_recv_key(&key),
                    KeyPoll::Ready | KeyPoll::Pause => break,
                }
            }

            let plaintext = match self.encryption.open(&payload) {
                Ok(plaintext) => plaintext,
                Err(error) => {
                    self.pending_error = Some(ConnectionError::Crypto(error));
                    self.queue_fatal(error.into(), 0);
                    return Ok(false);
                }
            };
            if self.app_ready() {
                self.flow.on_packet_received(payload.len());
            }

            let mut offset = 0;
            while offset < plaintext.len() {
                let (frame, used) = match Frame::decode(&plaintext[offset..]) {
                    Ok(decoded) => decoded,
                    Err(_) => {
                        self.queue_fatal(ProtocolError::DecodeError, 0);
                        return Ok(false);
                    }
                };
                offset += used;
                if self.dispatch_frame(frame, now)? {
                    return Ok(true);
                }
                if self.fatal.is_some() {
                    return Ok(false);
                }
            }

            self.dispatch_stream_events();
            self.publish_established();

            if self.handshake.has_pending_frames()
                || self.handshake.transmit_key_pending()
                || (self.app_ready() && self.streams.has_pending_frames())
            {
                self.write_signal.raise();
            }
        }
        Ok(false)
    }

    /// Dispatch one decoded frame. Returns true when a close frame ended
    /// the connection.
    fn dispatch_frame(&mut self, frame: Frame, now: Instant) -> Result<bool, ConnectionError> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack {
                bytes_since_last_ack,
            } => match self.flow.on_ack(bytes_since_last_ack, now) {
                Ok(released) => self.streams.on_frames_acked(&released),
                Err(error) => {
                    self.pending_error = Some(ConnectionError::Flow(error));
                    self.queue_fatal(ProtocolError::IllegalParameter, 0x02);
                }
            },
            Frame::Crypto {
                end_of_record,
                data,
            } => {
                if let Err(error) = self.handshake.handle_crypto(end_of_record, &data) {
                    self.queue_fatal(error, 0x05);
                }
            }
            Frame::Stream { .. } | Frame::ResetStream { .. } | Frame::StopSending { .. } => {
                // App-data frames are illegal before the channel is
                // secured end to end.
                if self.handshake.recv_level() != SecurityLevel::App {
                    self.queue_fatal(ProtocolError::UnexpectedMessage, frame.frame_type() as u64);
                } else {
                    self.streams.handle_frame(&frame);
                }
            }
            Frame::ProtocolClose { code, reason, .. } => {
                tracing::warn!(code, reason = %String::from_utf8_lossy(&reason), "peer sent protocol close");
                return Ok(true);
            }
            Frame::AppClose { code, reason } => {
                tracing::info!(code, reason = %String::from_utf8_lossy(&reason), "peer closed connection");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn on_timer(&mut self, now: Instant) -> Result<bool, ConnectionError> {
        if let Some(deadline) = self.close_deadline {
            if now >= deadline {
                // Close handshake budget exhausted; settle as closed.
                return Ok(true);
            }
        }
        if self.app_ready() {
            if let Err(error) = self.flow.check_timeout(now) {
                self.pending_error = Some(ConnectionError::Flow(error));
                self.queue_fatal(ProtocolError::InternalError, 0);
                return Ok(false);
            }
            if self.flow.needs_keepalive(now) {
                self.write_signal.raise();
            }
        }
        Ok(false)
    }

    fn publish_established(&mut self) {
        if self.handshake.is_established() && !*self.established_tx.borrow() {
            let _ = self.established_tx.send(true);
            tracing::info!("connection established");
        }
    }

    fn dispatch_stream_events(&mut self) {
        for event in self.streams.poll_events() {
            match event {
                StreamEvent::PeerStreamAccepted(id) => {
                    if let Some(on_peer_stream) = self.on_peer_stream.as_mut() {
                        let handle = StreamHandle {
                            id,
                            commands: self.commands_tx.clone(),
                        };
                        let callbacks = on_peer_stream(id, handle);
                        self.callbacks.insert(id.encode(), callbacks);
                    }
                }
                StreamEvent::Data { stream_id, unit } => {
                    if let Some(callbacks) = self.callbacks.get_mut(&stream_id.encode()) {
                        (callbacks.on_receive)(unit);
                    }
                }
                StreamEvent::Closed {
                    stream_id,
                    error_code,
                } => {
                    if let Some(mut callbacks) = self.callbacks.remove(&stream_id.encode()) {
                        (callbacks.on_close)(error_code);
                    }
                }
            }
        }
    }
}
