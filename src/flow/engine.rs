//! The flow-control engine.
//!
//! Pacing is credit-based and deliberately simple: the engine keeps an
//! estimated transmit size per write interval (bootstrapped from the
//! transport's hint) and offers half of it as the payload budget per
//! write opportunity. Byte-level acks release in-flight packet records in
//! send order; an ack-soliciting packet left unacknowledged past the ack
//! timeout is a fatal flow error, and a keep-alive ping is injected when
//! the link would otherwise go silent.
//!
//! All timing is parameterised on `Instant` values passed by the caller,
//! so the engine itself never reads the clock.

use std::collections::VecDeque;
use std::time::Instant;

use crate::codec::Frame;
use crate::core::{FlowError, ACK_TIMEOUT, KEEPALIVE_INTERVAL};
use crate::stream::StreamId;

/// Stream-level metadata attached to an in-flight packet record. When the
/// packet is acknowledged the metadata is handed back so the run loop can
/// forward it to the stream engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAck {
    /// Stream the bytes belonged to.
    pub stream_id: StreamId,
    /// Stream payload bytes the packet carried.
    pub bytes: u64,
    /// Whether the packet carried the stream's final fragment.
    pub fin: bool,
}

#[derive(Debug)]
struct SentPacket {
    bytes: u64,
    ack_soliciting: bool,
    stream_acks: Vec<StreamAck>,
}

/// Credit-based pacing, ack accounting, and keep-alive scheduling.
#[derive(Debug)]
pub struct FlowControlEngine {
    /// Estimated bytes the link absorbs per transmit interval.
    estimated_transmit_size: usize,
    /// Bytes sent but not yet acknowledged.
    unacked_write_bytes: u64,
    /// Bytes received but not yet covered by an ack we sent.
    unacked_read_bytes: u64,
    /// Ack-eliding bytes sent since the last ack-soliciting packet.
    elided_sent_bytes: u64,
    /// In-flight packet records, send order.
    in_flight: VecDeque<SentPacket>,
    /// Ack-soliciting packets currently in flight.
    soliciting_in_flight: usize,
    /// Deadline for the oldest unacknowledged ack-soliciting packet.
    ack_deadline: Option<Instant>,
    /// When the last ack-soliciting packet was sent (engine start before
    /// any).
    last_soliciting_sent: Instant,
}

impl FlowControlEngine {
    /// Create an engine bootstrapped from the transport's transmit-size
    /// hint.
    pub fn new(estimated_transmit_size: usize, now: Instant) -> Self {
        Self {
            estimated_transmit_size: estimated_transmit_size.max(64),
            unacked_write_bytes: 0,
            unacked_read_bytes: 0,
            elided_sent_bytes: 0,
            in_flight: VecDeque::new(),
            soliciting_in_flight: 0,
            ack_deadline: None,
            last_soliciting_sent: now,
        }
    }

    /// Target packet payload budget per write opportunity: half the
    /// estimated transmit size.
    pub fn next_packet_size(&self) -> usize {
        self.estimated_transmit_size / 2
    }

    /// Bytes of received data that trigger an ack.
    fn ack_threshold(&self) -> u64 {
        (self.estimated_transmit_size / 2) as u64
    }

    /// Bytes sent but not yet acknowledged by the peer.
    pub fn unacked_write_bytes(&self) -> u64 {
        self.unacked_write_bytes
    }

    /// Bytes received but not yet covered by an ack we sent.
    pub fn unacked_read_bytes(&self) -> u64 {
        self.unacked_read_bytes
    }

    /// Record a transmitted packet.
    pub fn on_packet_sent(
        &mut self,
        bytes: usize,
        ack_soliciting: bool,
        stream_acks: Vec<StreamAck>,
        now: Instant,
    ) {
        self.unacked_write_bytes += bytes as u64;
        self.in_flight.push_back(SentPacket {
            bytes: bytes as u64,
            ack_soliciting,
            stream_acks,
        });
        if ack_soliciting {
            self.elided_sent_bytes = 0;
            self.last_soliciting_sent = now;
            self.soliciting_in_flight += 1;
            if self.ack_deadline.is_none() {
                self.ack_deadline = Some(now + ACK_TIMEOUT);
            }
        } else {
            self.elided_sent_bytes += bytes as u64;
        }
    }

    /// Record a received packet.
    pub fn on_packet_received(&mut self, bytes: usize) {
        self.unacked_read_bytes += bytes as u64;
    }

    /// Whether the next packet should carry a ping so the peer has
    /// something to acknowledge: true after at least half an estimated
    /// transmit size of ack-eliding bytes went out unacknowledged.
    pub fn should_solicit_ack(&self) -> bool {
        self.elided_sent_bytes >= self.ack_threshold()
    }

    /// Whether a keep-alive ping is due: the keep-alive interval elapsed
    /// with no ack-soliciting packet in flight.
    pub fn needs_keepalive(&self, now: Instant) -> bool {
        self.soliciting_in_flight == 0
            && now.duration_since(self.last_soliciting_sent) >= KEEPALIVE_INTERVAL
    }

    /// Take an ack frame for the peer if one is due.
    ///
    /// An ack is due once enough bytes accumulated since the last one, or
    /// on keep-alive cadence when any are outstanding at all.
    pub fn take_ack_frame(&mut self, now: Instant) -> Option<Frame> {
        if self.unacked_read_bytes == 0 {
            return None;
        }
        if self.unacked_read_bytes < self.ack_threshold() && !self.needs_keepalive(now) {
            return None;
        }
        let bytes_since_last_ack = self.unacked_read_bytes;
        self.unacked_read_bytes = 0;
        Some(Frame::Ack {
            bytes_since_last_ack,
        })
    }

    /// Process an ack from the peer.
    ///
    /// Releases the longest prefix of in-flight packet records whose
    /// cumulative size fits in the acknowledged byte count, in send
    /// order, and returns their stream metadata for forwarding to the
    /// stream engine.
    pub fn on_ack(&mut self, bytes_since_last_ack: u64, now: Instant) -> Result<Vec<StreamAck>, FlowError> {
        if bytes_since_last_ack > self.unacked_write_bytes {
            return Err(FlowError::AckOverflow {
                acked: bytes_since_last_ack,
                in_flight: self.unacked_write_bytes,
            });
        }
        self.unacked_write_bytes -= bytes_since_last_ack;

        let mut released = Vec::new();
        let mut budget = bytes_since_last_ack;
        while let Some(front) = self.in_flight.front() {
            if front.bytes > budget {
                break;
            }
            budget -= front.bytes;
            let packet = self.in_flight.pop_front().expect("front exists");
            if packet.ack_soliciting {
                self.soliciting_in_flight -= 1;
            }
            released.extend(packet.stream_acks);
        }

        self.ack_deadline = if self.soliciting_in_flight > 0 {
            Some(now + ACK_TIMEOUT)
        } else {
            None
        };
        Ok(released)
    }

    /// Check the ack timeout. An expired deadline means the peer went
    /// silent and the connection must close.
    pub fn check_timeout(&self, now: Instant) -> Result<(), FlowError> {
        match self.ack_deadline {
            Some(deadline) if now >= deadline => Err(FlowError::AckTimeout),
            _ => Ok(()),
        }
    }

    /// The next instant the run loop should wake to re-check timers.
    pub fn next_timeout(&self, now: Instant) -> Instant {
        let keepalive_at = self.last_soliciting_sent + KEEPALIVE_INTERVAL;
        match self.ack_deadline {
            Some(deadline) => deadline.min(keepalive_at),
            None => keepalive_at.max(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;
    use std::time::Duration;

    const ESTIMATE: usize = 4096;

    fn engine() -> (FlowControlEngine, Instant) {
        let now = Instant::now();
        (FlowControlEngine::new(ESTIMATE, now), now)
    }

    fn stream_ack(seq: u64, bytes: u64) -> StreamAck {
        StreamAck {
            stream_id: StreamId::new(seq, Role::Client, false, 0),
            bytes,
            fin: false,
        }
    }

    #[test]
    fn test_packet_budget_is_half_estimate() {
        let (engine, _) = engine();
        assert_eq!(engine.next_packet_size(), ESTIMATE / 2);
    }

    #[test]
    fn test_solicit_ack_after_half_estimate_of_elided_bytes() {
        let (mut engine, now) = engine();
        assert!(!engine.should_solicit_ack());

        engine.on_packet_sent(ESTIMATE / 4, false, Vec::new(), now);
        assert!(!engine.should_solicit_ack());

        engine.on_packet_sent(ESTIMATE / 4, false, Vec::new(), now);
        assert!(engine.should_solicit_ack());

        // An ack-soliciting packet resets the counter.
        engine.on_packet_sent(10, true, Vec::new(), now);
        assert!(!engine.should_solicit_ack());
    }

    #[test]
    fn test_ack_releases_exact_prefix_in_order() {
        let (mut engine, now) = engine();

        engine.on_packet_sent(100, true, vec![stream_ack(0, 80)], now);
        engine.on_packet_sent(200, true, vec![stream_ack(1, 150)], now);
        engine.on_packet_sent(300, true, vec![stream_ack(2, 250)], now);
        assert_eq!(engine.unacked_write_bytes(), 600);

        // 250 bytes covers packet 1 (100) and part of packet 2: only the
        // first record is released.
        let released = engine.on_ack(250, now).unwrap();
        assert_eq!(released, vec![stream_ack(0, 80)]);
        assert_eq!(engine.unacked_write_bytes(), 350);

        // The remaining 350 release the rest, in send order.
        let released = engine.on_ack(350, now).unwrap();
        assert_eq!(released, vec![stream_ack(1, 150), stream_ack(2, 250)]);
        assert_eq!(engine.unacked_write_bytes(), 0);
    }

    #[test]
    fn test_ack_overflow_rejected() {
        let (mut engine, now) = engine();
        engine.on_packet_sent(100, true, Vec::new(), now);
        assert!(matches!(
            engine.on_ack(101, now),
            Err(FlowError::AckOverflow { .. })
        ));
    }

    #[test]
    fn test_ack_frame_due_after_threshold() {
        let (mut engine, now) = engine();

        engine.on_packet_received(100);
        assert_eq!(engine.take_ack_frame(now), None);

        engine.on_packet_received(ESTIMATE / 2);
        let frame = engine.take_ack_frame(now).unwrap();
        assert_eq!(
            frame,
            Frame::Ack {
                bytes_since_last_ack: (100 + ESTIMATE / 2) as u64
            }
        );
        // Counter reset after the ack is taken.
        assert_eq!(engine.unacked_read_bytes(), 0);
        assert_eq!(engine.take_ack_frame(now), None);
    }

    #[test]
    fn test_ack_frame_on_keepalive_cadence() {
        let (mut engine, now) = engine();
        engine.on_packet_received(10);

        assert_eq!(engine.take_ack_frame(now), None);
        let later = now + KEEPALIVE_INTERVAL + Duration::from_millis(1);
        assert!(engine.take_ack_frame(later).is_some());
    }

    #[test]
    fn test_ack_timeout_fatal() {
        let (mut engine, now) = engine();
        engine.check_timeout(now).unwrap();

        engine.on_packet_sent(100, true, Vec::new(), now);
        engine.check_timeout(now + ACK_TIMEOUT - Duration::from_millis(1)).unwrap();
        assert_eq!(
            engine.check_timeout(now + ACK_TIMEOUT),
            Err(FlowError::AckTimeout)
        );
    }

    #[test]
    fn test_ack_clears_timeout() {
        let (mut engine, now) = engine();
        engine.on_packet_sent(100, true, Vec::new(), now);
        engine.on_ack(100, now).unwrap();
        engine
            .check_timeout(now + ACK_TIMEOUT + Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn test_partial_ack_rearms_timeout() {
        let (mut engine, now) = engine();
        engine.on_packet_sent(100, true, Vec::new(), now);
        engine.on_packet_sent(100, true, Vec::new(), now);

        let ack_at = now + Duration::from_secs(1);
        engine.on_ack(100, ack_at).unwrap();
        // One soliciting packet still in flight: deadline restarts from
        // the ack.
        engine.check_timeout(now + ACK_TIMEOUT).unwrap();
        assert_eq!(
            engine.check_timeout(ack_at + ACK_TIMEOUT),
            Err(FlowError::AckTimeout)
        );
    }

    #[test]
    fn test_keepalive_due_when_idle() {
        let (mut engine, now) = engine();
        assert!(!engine.needs_keepalive(now));
        assert!(engine.needs_keepalive(now + KEEPALIVE_INTERVAL));

        // An in-flight ack-soliciting packet suppresses keep-alive.
        engine.on_packet_sent(10, true, Vec::new(), now);
        assert!(!engine.needs_keepalive(now + KEEPALIVE_INTERVAL));

        // Acked and idle again: keep-alive resumes from the send time.
        engine.on_ack(10, now + Duration::from_secs(1)).unwrap();
        assert!(engine.needs_keepalive(now + Duration::from_secs(1) + KEEPALIVE_INTERVAL));
    }

    #[test]
    fn test_next_timeout_tracks_earliest_deadline() {
        let (mut engine, now) = engine();
        // Idle: next wake is the keep-alive point.
        assert_eq!(engine.next_timeout(now), now + KEEPALIVE_INTERVAL);

        engine.on_packet_sent(10, true, Vec::new(), now);
        assert_eq!(engine.next_timeout(now), now + ACK_TIMEOUT);
    }
}
