//! The stream-multiplexing engine.
//!
//! Each stream is an independent state machine with separate read and
//! write half-closes:
//!
//! ```text
//! open ──▶ read-closed ──┐
//!   │                    ├──▶ closed (pruned from the table)
//!   └──▶ write-closed ───┘
//! ```
//!
//! Application messages are data units `{priority, last, payload}`. A
//! unit larger than the packet budget is fragmented across stream frames;
//! the receiver buffers fragments until one ends on a unit boundary and
//! delivers the reassembled unit exactly once. The fin bit travels only
//! on the fragment carrying the end of a `last` unit.
//!
//! The engine never performs I/O and never calls back into the run loop:
//! mutations push typed [`StreamEvent`]s that the owner drains with
//! [`StreamEngine::poll_events`].

use std::collections::{BTreeMap, VecDeque};

use super::id::StreamId;
use crate::codec::varint;
use crate::codec::Frame;
use crate::core::{Role, StreamError, MAX_STREAM_PRIORITY, STREAM_SEND_WINDOW};
use crate::flow::StreamAck;

/// One application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUnit {
    /// Priority the unit was received with (derived from the stream id).
    pub priority: u8,
    /// Whether this is the stream's final unit.
    pub last: bool,
    /// Message payload.
    pub payload: Vec<u8>,
}

/// Events the engine reports to its owner.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The peer opened a stream we had not seen before.
    PeerStreamAccepted(StreamId),
    /// A complete data unit was reassembled.
    Data {
        /// The stream the unit arrived on.
        stream_id: StreamId,
        /// The reassembled unit.
        unit: DataUnit,
    },
    /// The stream reached full closure and left the table.
    Closed {
        /// The stream that closed.
        stream_id: StreamId,
        /// The application error code, if the closure was abrupt.
        error_code: Option<u64>,
    },
}

#[derive(Debug)]
struct PendingUnit {
    payload: Vec<u8>,
    offset: usize,
    last: bool,
}

#[derive(Debug)]
struct StreamState {
    id: StreamId,
    read_closed: bool,
    write_closed: bool,
    close_requested: bool,
    error_code: Option<u64>,
    recv_buf: Vec<u8>,
    pending: VecDeque<PendingUnit>,
    inflight_bytes: u64,
}

impl StreamState {
    fn new(id: StreamId, local_role: Role) -> Self {
        let unidirectional = id.is_unidirectional();
        let locally_originated = id.originator() == local_role;
        Self {
            id,
            // A unidirectional stream only ever flows away from its
            // originator; the missing half starts closed.
            read_closed: unidirectional && locally_originated,
            write_closed: unidirectional && !locally_originated,
            close_requested: false,
            error_code: None,
            recv_buf: Vec::new(),
            pending: VecDeque::new(),
            inflight_bytes: 0,
        }
    }

    fn is_fully_closed(&self) -> bool {
        self.read_closed && self.write_closed && self.pending.is_empty()
    }
}

/// Owns the stream table and all per-stream state machines.
pub struct StreamEngine {
    role: Role,
    streams: BTreeMap<u64, StreamState>,
    next_bidi_seq: u64,
    next_uni_seq: u64,
    control: VecDeque<Frame>,
    events: VecDeque<StreamEvent>,
}

impl StreamEngine {
    /// Create an engine for one endpoint role.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            streams: BTreeMap::new(),
            next_bidi_seq: 0,
            next_uni_seq: 0,
            control: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Streams currently tracked (fully closed streams are pruned).
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether any stream has data or control frames waiting.
    pub fn has_pending_frames(&self) -> bool {
        !self.control.is_empty()
            || self.streams.values().any(|stream| !stream.pending.is_empty())
    }

    /// Drain accumulated events.
    pub fn poll_events(&mut self) -> Vec<StreamEvent> {
        self.events.drain(..).collect()
    }

    /// Open a new locally originated stream.
    pub fn start_local_stream(
        &mut self,
        unidirectional: bool,
        priority: u8,
    ) -> Result<StreamId, StreamError> {
        if priority > MAX_STREAM_PRIORITY {
            return Err(StreamError::PriorityOutOfRange);
        }
        let seq = if unidirectional {
            let seq = self.next_uni_seq;
            self.next_uni_seq += 1;
            seq
        } else {
            let seq = self.next_bidi_seq;
            self.next_bidi_seq += 1;
            seq
        };
        let id = StreamId::new(seq, self.role, unidirectional, priority);
        self.streams.insert(id.encode(), StreamState::new(id, self.role));
        Ok(id)
    }

    /// Queue a data unit for sending.
    pub fn send(&mut self, id: StreamId, unit: DataUnit) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id.encode())
            .ok_or(StreamError::UnknownStream)?;
        if !id.writable_by(self.role) {
            return Err(StreamError::NotWritable);
        }
        if stream.write_closed || stream.close_requested {
            return Err(StreamError::WriteClosed);
        }
        let last = unit.last;
        stream.pending.push_back(PendingUnit {
            payload: unit.payload,
            offset: 0,
            last,
        });
        if last {
            // No further units may follow the stream's final unit; the
            // fin bit goes out with its last fragment.
            stream.write_closed = true;
        }
        Ok(())
    }

    /// Close a stream.
    ///
    /// Bidirectional streams emit both `reset_stream` and `stop_sending`;
    /// unidirectional streams emit only `stop_sending`. Full closure is
    /// reported once the peer's corresponding reset is observed, except
    /// when local intent already implies both halves are closed. A second
    /// close is a no-op and re-emits nothing.
    pub fn close(&mut self, id: StreamId, error_code: u64) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&id.encode())
            .ok_or(StreamError::UnknownStream)?;
        if stream.close_requested {
            return Ok(());
        }
        stream.close_requested = true;
        stream.error_code.get_or_insert(error_code);
        stream.pending.clear();

        if id.is_unidirectional() {
            self.control.push_back(Frame::StopSending {
                stream_id: id,
                app_error_code: error_code,
            });
            stream.read_closed = true;
            stream.write_closed = true;
        } else {
            self.control.push_back(Frame::ResetStream {
                stream_id: id,
                app_error_code: error_code,
            });
            self.control.push_back(Frame::StopSending {
                stream_id: id,
                app_error_code: error_code,
            });
            stream.write_closed = true;
        }

        self.finish_if_closed(id);
        Ok(())
    }

    /// Forced local teardown without waiting for the peer, used when the
    /// whole connection is closing. Emits no frames.
    pub fn shutdown(&mut self, id: StreamId) -> Result<(), StreamError> {
        let stream = self
            .streams
            .remove(&id.encode())
            .ok_or(StreamError::UnknownStream)?;
        self.events.push_back(StreamEvent::Closed {
            stream_id: id,
            error_code: stream.error_code,
        });
        Ok(())
    }

    /// Tear down every stream (connection close).
    pub fn shutdown_all(&mut self) {
        let ids: Vec<StreamId> = self.streams.values().map(|stream| stream.id).collect();
        for id in ids {
            let _ = self.shutdown(id);
        }
        self.control.clear();
    }

    /// Process one incoming app-data frame.
    ///
    /// Frames for streams whose id claims to be locally originated but is
    /// not in the table are spoofed and silently ignored.
    pub fn handle_frame(&mut self, frame: &Frame) {
        match frame {
            Frame::Stream {
                stream_id,
                fin,
                ends_on_boundary,
                data,
            } => self.on_stream_frame(*stream_id, *fin, *ends_on_boundary, data),
            Frame::ResetStream {
                stream_id,
                app_error_code,
            } => self.on_reset_stream(*stream_id, *app_error_code),
            Frame::StopSending {
                stream_id,
                app_error_code,
            } => self.on_stop_sending(*stream_id, *app_error_code),
            _ => {}
        }
    }

    fn lookup_or_accept(&mut self, id: StreamId) -> Option<&mut StreamState> {
        let key = id.encode();
        if self.streams.contains_key(&key) {
            return self.streams.get_mut(&key);
        }
        // Unknown stream: only the peer may implicitly create one, and
        // only with an id attributed to itself. Anything else is a
        // confused-deputy spoof and is dropped without creating state.
        if id.originator() == self.role {
            return None;
        }
        self.streams.insert(key, StreamState::new(id, self.role));
        self.events.push_back(StreamEvent::PeerStreamAccepted(id));
        self.streams.get_mut(&key)
    }

    fn on_stream_frame(&mut self, id: StreamId, fin: bool, ends_on_boundary: bool, data: &[u8]) {
        // Data flowing toward us must be on a stream the peer may write.
        if !id.writable_by(self.role.peer()) {
            return;
        }
        if self.lookup_or_accept(id).is_none() {
            return;
        }

        let mut completed = None;
        if let Some(stream) = self.streams.get_mut(&id.encode()) {
            if stream.read_closed {
                return;
            }
            stream.recv_buf.extend_from_slice(data);
            if ends_on_boundary || fin {
                completed = Some(std::mem::take(&mut stream.recv_buf));
            }
            if fin {
                stream.read_closed = true;
            }
        }

        if let Some(payload) = completed {
            self.events.push_back(StreamEvent::Data {
                stream_id: id,
                unit: DataUnit {
                    priority: id.priority(),
                    last: fin,
                    payload,
                },
            });
        }
        if fin {
            self.finish_if_closed(id);
        }
    }

    fn on_reset_stream(&mut self, id: StreamId, app_error_code: u64) {
        let Some(stream) = self.streams.get_mut(&id.encode()) else {
            return;
        };
        if stream.read_closed {
            return;
        }
        stream.read_closed = true;
        stream.recv_buf.clear();
        stream.error_code.get_or_insert(app_error_code);
        self.finish_if_closed(id);
    }

    fn on_stop_sending(&mut self, id: StreamId, app_error_code: u64) {
        let Some(stream) = self.streams.get_mut(&id.encode()) else {
            return;
        };
        if stream.write_closed && stream.pending.is_empty() {
            return;
        }
        // The peer no longer wants this stream's data: never send what is
        // still queued.
        stream.write_closed = true;
        stream.pending.clear();
        stream.error_code.get_or_insert(app_error_code);
        self.finish_if_closed(id);
    }

    fn finish_if_closed(&mut self, id: StreamId) {
        let key = id.encode();
        let fully_closed = self
            .streams
            .get(&key)
            .is_some_and(|stream| stream.is_fully_closed());
        if fully_closed {
            let stream = self.streams.remove(&key).expect("checked above");
            self.events.push_back(StreamEvent::Closed {
                stream_id: id,
                error_code: stream.error_code,
            });
        }
    }

    /// Pull stream frames up to the remaining packet budget.
    ///
    /// Control frames (resets, stop-sendings) go first, then data
    /// fragments in priority order. Returns the frames and the
    /// stream-level ack metadata the flow engine must attach to the
    /// packet record.
    pub fn next_frames(&mut self, budget: &mut usize) -> (Vec<Frame>, Vec<StreamAck>) {
        let mut frames = Vec::new();
        let mut acks = Vec::new();

        while let Some(frame) = self.control.front() {
            let len = frame.encoded_len();
            if len > *budget {
                break;
            }
            *budget -= len;
            frames.push(self.control.pop_front().expect("front exists"));
        }

        // Highest priority first; ties in table order.
        let mut ids: Vec<StreamId> = self
            .streams
            .values()
            .filter(|stream| !stream.pending.is_empty())
            .map(|stream| stream.id)
            .collect();
        ids.sort_by_key(|id| std::cmp::Reverse(id.priority()));

        for id in ids {
            loop {
                let Some(stream) = self.streams.get_mut(&id.encode()) else {
                    break;
                };
                let Some(unit) = stream.pending.front_mut() else {
                    break;
                };
                if stream.inflight_bytes >= STREAM_SEND_WINDOW {
                    break;
                }

                let overhead = 2
                    + varint::encoded_len(id.encode())
                    + varint::encoded_len(unit.payload.len() as u64);
                let window_room = (STREAM_SEND_WINDOW - stream.inflight_bytes) as usize;
                let available = budget.saturating_sub(overhead).min(window_room);
                if available == 0 {
                    break;
                }

                let remaining = unit.payload.len() - unit.offset;
                let take = remaining.min(available);
                let ends_on_boundary = unit.offset + take == unit.payload.len();
                let fin = ends_on_boundary && unit.last;
                let data = unit.payload[unit.offset..unit.offset + take].to_vec();
                unit.offset += take;

                let frame = Frame::Stream {
                    stream_id: id,
                    fin,
                    ends_on_boundary,
                    data,
                };
                *budget = budget.saturating_sub(frame.encoded_len());
                frames.push(frame);
                stream.inflight_bytes += take as u64;
                acks.push(StreamAck {
                    stream_id: id,
                    bytes: take as u64,
                    fin,
                });

                if ends_on_boundary {
                    stream.pending.pop_front();
                    if stream.pending.is_empty() && stream.write_closed {
                        self.finish_if_closed(id);
                    }
                } else {
                    break;
                }
            }
        }
        (frames, acks)
    }

    /// Forward stream-level ack metadata released by the flow engine.
    pub fn on_frames_acked(&mut self, acks: &[StreamAck]) {
        for ack in acks {
            if let Some(stream) = self.streams.get_mut(&ack.stream_id.encode()) {
                stream.inflight_bytes = stream.inflight_bytes.saturating_sub(ack.bytes);
            }
        }
    }
}
