//! Outbound publish bookkeeping.
//!
//! Every publish handed to the client gets a local [`MessageId`] and a
//! [`PublishState`] record *before* the request is sent. The broker's packet
//! ids are bound to those records in send order as the event loop reports
//! `Outgoing::Publish`. Publishes issued while the connection is down, and
//! written records still unacknowledged when it drops, live in the retry
//! buffer in the order they were issued.
//!
//! All state sits behind a single mutex owned by the connection; nothing
//! here blocks or awaits.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use rumqttc::QoS;
use tracing::debug;

use crate::error::NetError;

/// Locally assigned, monotonically increasing publish id.
pub type MessageId = u64;

/// A message the bridge wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Acknowledgement state of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    /// Handed to the client, no acknowledgement yet.
    Pending,
    /// The broker acknowledged before the publishing call returned.
    AckedBeforeReturn,
    /// The broker acknowledged after the publishing call returned.
    AckedAfterReturn,
}

#[derive(Debug)]
struct PublishRecord {
    /// `None` for records created by an acknowledgement we had not seen yet.
    message: Option<OutboundMessage>,
    state: PublishState,
    returned: bool,
}

/// What [`PublishLedger::admit`] decided for a new publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Send it now; the record is registered under this id.
    Send(MessageId),
    /// Appended to the retry buffer. `start_timer` is set when no retry
    /// timer is running yet and the caller must start one.
    Buffered { start_timer: bool },
}

#[derive(Debug, Default)]
pub struct PublishLedger {
    connected: bool,
    next_id: MessageId,
    records: BTreeMap<MessageId, PublishRecord>,
    /// Registered ids waiting for their `Outgoing::Publish`, in send order.
    unbound: VecDeque<MessageId>,
    /// Broker packet id -> local id, for QoS >= 1 publishes in flight.
    inflight: HashMap<u16, MessageId>,
    /// Packet ids of requests sent after their record was already moved
    /// back into the buffer. Their acknowledgements are expected but carry
    /// no record.
    untracked: HashSet<u16>,
    buffer: VecDeque<OutboundMessage>,
    timer_running: bool,
}

impl PublishLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Decide whether `message` goes out now or into the retry buffer.
    ///
    /// While anything is buffered new publishes queue behind it, so a
    /// replay never overtakes older messages.
    pub fn admit(&mut self, message: OutboundMessage) -> Admission {
        if self.connected && self.buffer.is_empty() {
            Admission::Send(self.register(message))
        } else {
            self.buffer.push_back(message);
            Admission::Buffered {
                start_timer: self.claim_timer(),
            }
        }
    }

    fn register(&mut self, message: OutboundMessage) -> MessageId {
        self.next_id += 1;
        let id = self.next_id;
        self.records.insert(
            id,
            PublishRecord {
                message: Some(message),
                state: PublishState::Pending,
                returned: false,
            },
        );
        self.unbound.push_back(id);
        id
    }

    /// Pop the oldest buffered message and register it for sending.
    /// Returns `None` when disconnected or drained.
    pub fn next_buffered(&mut self) -> Option<(MessageId, OutboundMessage)> {
        if !self.connected {
            return None;
        }
        let message = self.buffer.pop_front()?;
        let id = self.register(message.clone());
        Some((id, message))
    }

    /// The publishing call for `id` has returned.
    ///
    /// Returns the state the record was in, or `None` if it had already been
    /// moved into the retry buffer.
    pub fn returned(&mut self, id: MessageId) -> Option<PublishState> {
        let record = self.records.get_mut(&id)?;
        match record.state {
            PublishState::Pending => {
                record.returned = true;
                Some(PublishState::Pending)
            }
            state => {
                self.records.remove(&id);
                Some(state)
            }
        }
    }

    /// Mark `id` acknowledged.
    ///
    /// An id with no record is remembered as acknowledged-before-return so
    /// the publishing call can settle it when it returns.
    pub fn acknowledge(&mut self, id: MessageId) -> PublishState {
        match self.records.get_mut(&id) {
            None => {
                self.records.insert(
                    id,
                    PublishRecord {
                        message: None,
                        state: PublishState::AckedBeforeReturn,
                        returned: false,
                    },
                );
                PublishState::AckedBeforeReturn
            }
            Some(record) if record.returned => {
                self.records.remove(&id);
                PublishState::AckedAfterReturn
            }
            Some(record) => {
                record.state = PublishState::AckedBeforeReturn;
                PublishState::AckedBeforeReturn
            }
        }
    }

    /// The event loop wrote a PUBLISH with broker packet id `pkid`.
    ///
    /// QoS 0 publishes are complete once written.
    pub fn on_outgoing(&mut self, pkid: u16) {
        let Some(id) = self.unbound.pop_front() else {
            if pkid != 0 {
                debug!(pkid, "outgoing publish without a record");
                self.untracked.insert(pkid);
            }
            return;
        };

        let qos = self
            .records
            .get(&id)
            .and_then(|r| r.message.as_ref())
            .map(|m| m.qos)
            .unwrap_or(QoS::AtMostOnce);

        if qos == QoS::AtMostOnce {
            self.acknowledge(id);
        } else {
            self.inflight.insert(pkid, id);
        }
    }

    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) for `pkid`.
    pub fn on_ack(&mut self, pkid: u16) -> Result<Option<PublishState>, NetError> {
        if let Some(id) = self.inflight.remove(&pkid) {
            return Ok(Some(self.acknowledge(id)));
        }
        if self.untracked.remove(&pkid) {
            return Ok(None);
        }
        Err(NetError::protocol(format!(
            "acknowledgement for unknown packet id {pkid}"
        )))
    }

    /// Sending `id` failed before reaching the event loop; put its message
    /// back at the head of the buffer. Returns `true` if the caller must
    /// start the retry timer.
    pub fn requeue(&mut self, id: MessageId) -> bool {
        if let Some(record) = self.records.remove(&id) {
            self.unbound.retain(|u| *u != id);
            if let Some(message) = record.message {
                self.buffer.push_front(message);
            }
        }
        !self.buffer.is_empty() && self.claim_timer()
    }

    pub fn on_connected(&mut self) {
        self.connected = true;
    }

    /// The connection dropped: every publish already written but not yet
    /// acknowledged moves to the front of the retry buffer, oldest first.
    ///
    /// Records still waiting for their `Outgoing::Publish` stay unbound:
    /// their requests are still queued in the client and go out first after
    /// the reconnect, ahead of anything replayed from the buffer.
    ///
    /// Returns `true` if the caller must start the retry timer.
    pub fn on_disconnected(&mut self) -> bool {
        self.connected = false;

        let unbound: HashSet<MessageId> = self.unbound.iter().copied().collect();
        let written: Vec<MessageId> = self
            .records
            .iter()
            .filter(|(id, r)| {
                r.state == PublishState::Pending && r.message.is_some() && !unbound.contains(id)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in written.into_iter().rev() {
            if let Some(message) = self.records.remove(&id).and_then(|r| r.message) {
                self.buffer.push_front(message);
            }
        }

        self.inflight.clear();
        self.untracked.clear();

        !self.buffer.is_empty() && self.claim_timer()
    }

    fn claim_timer(&mut self) -> bool {
        if self.timer_running {
            false
        } else {
            self.timer_running = true;
            true
        }
    }

    /// Called by the retry timer after each attempt. Returns `false` (and
    /// releases the timer slot) once the buffer is empty.
    pub fn retry_tick(&mut self) -> bool {
        if self.buffer.is_empty() {
            self.timer_running = false;
            false
        } else {
            true
        }
    }

    pub fn pending_len(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == PublishState::Pending)
            .count()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered(&self) -> Vec<OutboundMessage> {
        self.buffer.iter().cloned().collect()
    }

    pub fn state(&self, id: MessageId) -> Option<PublishState> {
        self.records.get(&id).map(|r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(topic: &str, qos: QoS) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"{}"),
            qos,
            retain: true,
        }
    }

    fn sent(admission: Admission) -> MessageId {
        match admission {
            Admission::Send(id) => id,
            other => panic!("expected send, got {other:?}"),
        }
    }

    fn drain_topics(ledger: &mut PublishLedger) -> Vec<String> {
        let mut topics = Vec::new();
        while let Some((_, m)) = ledger.next_buffered() {
            topics.push(m.topic);
        }
        topics
    }

    #[test]
    fn test_buffer_replays_in_order() {
        let mut ledger = PublishLedger::new();

        assert_eq!(
            ledger.admit(msg("m1", QoS::ExactlyOnce)),
            Admission::Buffered { start_timer: true }
        );
        assert_eq!(
            ledger.admit(msg("m2", QoS::ExactlyOnce)),
            Admission::Buffered { start_timer: false }
        );
        ledger.admit(msg("m3", QoS::ExactlyOnce));
        assert!(ledger.next_buffered().is_none());

        ledger.on_connected();
        assert_eq!(drain_topics(&mut ledger), ["m1", "m2", "m3"]);
        assert_eq!(ledger.buffered_len(), 0);
        assert!(!ledger.retry_tick());
    }

    #[test]
    fn test_pending_moves_ahead_of_buffered_on_disconnect() {
        let mut ledger = PublishLedger::new();
        ledger.on_connected();

        let a = sent(ledger.admit(msg("a", QoS::AtLeastOnce)));
        let b = sent(ledger.admit(msg("b", QoS::AtLeastOnce)));
        ledger.on_outgoing(1);
        ledger.on_outgoing(2);
        ledger.returned(a);
        ledger.returned(b);
        // `a` completes, `b` is lost with the connection.
        assert_eq!(ledger.on_ack(1).unwrap(), Some(PublishState::AckedAfterReturn));

        assert!(ledger.on_disconnected());
        ledger.admit(msg("c", QoS::AtLeastOnce));

        ledger.on_connected();
        assert_eq!(drain_topics(&mut ledger), ["b", "c"]);
    }

    #[test]
    fn test_new_publish_queues_behind_buffer() {
        let mut ledger = PublishLedger::new();
        ledger.admit(msg("old", QoS::ExactlyOnce));
        ledger.on_connected();

        assert!(matches!(
            ledger.admit(msg("new", QoS::ExactlyOnce)),
            Admission::Buffered { .. }
        ));
        assert_eq!(drain_topics(&mut ledger), ["old", "new"]);
    }

    #[test]
    fn test_ack_before_return() {
        let mut ledger = PublishLedger::new();
        ledger.on_connected();

        let id = sent(ledger.admit(msg("fast", QoS::AtMostOnce)));
        ledger.on_outgoing(0);
        assert_eq!(ledger.state(id), Some(PublishState::AckedBeforeReturn));

        assert_eq!(ledger.returned(id), Some(PublishState::AckedBeforeReturn));
        assert_eq!(ledger.state(id), None);
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn test_unseen_id_creates_record() {
        let mut ledger = PublishLedger::new();
        assert_eq!(ledger.acknowledge(42), PublishState::AckedBeforeReturn);
        assert_eq!(ledger.returned(42), Some(PublishState::AckedBeforeReturn));
        assert_eq!(ledger.state(42), None);
    }

    #[test]
    fn test_qos2_stays_pending_until_ack() {
        let mut ledger = PublishLedger::new();
        ledger.on_connected();

        let id = sent(ledger.admit(msg("slow", QoS::ExactlyOnce)));
        ledger.on_outgoing(7);
        assert_eq!(ledger.returned(id), Some(PublishState::Pending));
        assert_eq!(ledger.pending_len(), 1);

        assert_eq!(ledger.on_ack(7).unwrap(), Some(PublishState::AckedAfterReturn));
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn test_ack_for_unknown_packet_is_protocol_error() {
        let mut ledger = PublishLedger::new();
        ledger.on_connected();
        assert!(matches!(ledger.on_ack(9), Err(NetError::Protocol(_))));
    }

    #[test]
    fn test_stray_outgoing_is_tolerated() {
        let mut ledger = PublishLedger::new();
        ledger.on_connected();
        ledger.on_outgoing(3);
        assert_eq!(ledger.on_ack(3).unwrap(), None);
    }

    #[test]
    fn test_requeue_puts_message_first() {
        let mut ledger = PublishLedger::new();
        ledger.on_connected();
        let id = sent(ledger.admit(msg("x", QoS::AtLeastOnce)));
        assert!(ledger.requeue(id));
        assert_eq!(ledger.pending_len(), 0);
        assert_eq!(ledger.buffered()[0].topic, "x");
    }

    #[test]
    fn test_unwritten_records_stay_bound_across_reconnect() {
        let mut ledger = PublishLedger::new();
        ledger.on_connected();

        let m1 = sent(ledger.admit(msg("m1", QoS::AtLeastOnce)));
        let m2 = sent(ledger.admit(msg("m2", QoS::AtLeastOnce)));
        ledger.returned(m1);
        ledger.returned(m2);
        // Only m1 reached the wire before the drop.
        ledger.on_outgoing(1);

        ledger.on_disconnected();
        assert_eq!(
            ledger.buffered().iter().map(|m| m.topic.as_str()).collect::<Vec<_>>(),
            ["m1"]
        );
        assert_eq!(ledger.state(m2), Some(PublishState::Pending));

        ledger.on_connected();
        let (replayed, message) = ledger.next_buffered().unwrap();
        assert_eq!(message.topic, "m1");
        ledger.returned(replayed);

        // The queued m2 request is written first, then the replayed m1.
        ledger.on_outgoing(1);
        ledger.on_outgoing(2);
        assert_eq!(ledger.on_ack(1).unwrap(), Some(PublishState::AckedAfterReturn));
        assert_eq!(ledger.state(m2), None);
        assert_eq!(ledger.state(replayed), Some(PublishState::Pending));

        // A second drop before m1's ack puts m1 back in the buffer.
        ledger.on_disconnected();
        assert_eq!(
            ledger.buffered().iter().map(|m| m.topic.as_str()).collect::<Vec<_>>(),
            ["m1"]
        );
        assert_eq!(ledger.pending_len(), 0);
    }
}
