//! Subscription tracking.
//!
//! Keeps the list of patterns the bridge wants (re-issued on every connect)
//! and the SUBSCRIBE requests still waiting for their SUBACK.

use std::collections::{HashMap, VecDeque};

use rumqttc::{QoS, SubscribeReasonCode};
use tracing::debug;

use crate::error::NetError;

/// Locally assigned SUBSCRIBE request id.
pub type RequestId = u64;

#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    registered: Vec<(String, QoS)>,
    next_id: RequestId,
    /// Issued requests waiting for their `Outgoing::Subscribe`, in send order.
    unbound: VecDeque<(RequestId, String)>,
    /// Broker packet id -> issued request.
    inflight: HashMap<u16, (RequestId, String)>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `pattern` for every future connection. Returns `false` if it
    /// was already registered.
    pub fn register(&mut self, pattern: &str, qos: QoS) -> bool {
        if self.registered.iter().any(|(p, _)| p == pattern) {
            return false;
        }
        self.registered.push((pattern.to_string(), qos));
        true
    }

    pub fn registered(&self) -> Vec<(String, QoS)> {
        self.registered.clone()
    }

    /// Record a SUBSCRIBE about to be handed to the client.
    pub fn issue(&mut self, pattern: &str) -> RequestId {
        self.next_id += 1;
        self.unbound.push_back((self.next_id, pattern.to_string()));
        self.next_id
    }

    /// Undo [`issue`](Self::issue) when the request never reached the client.
    pub fn cancel(&mut self, id: RequestId) {
        self.unbound.retain(|(u, _)| *u != id);
    }

    pub fn on_outgoing(&mut self, pkid: u16) {
        match self.unbound.pop_front() {
            Some(request) => {
                self.inflight.insert(pkid, request);
            }
            None => debug!(pkid, "outgoing subscribe without a request"),
        }
    }

    /// Match a SUBACK to its request. Unknown packet ids and refused
    /// subscriptions are fatal to the connection.
    pub fn on_suback(
        &mut self,
        pkid: u16,
        return_codes: &[SubscribeReasonCode],
    ) -> Result<(RequestId, String), NetError> {
        let (id, pattern) = self
            .inflight
            .remove(&pkid)
            .ok_or_else(|| NetError::protocol(format!("SUBACK for unknown packet id {pkid}")))?;

        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(NetError::Rejected(format!("subscription to '{pattern}' refused")));
        }
        Ok((id, pattern))
    }

    /// Forget in-flight requests after the connection dropped.
    pub fn reset(&mut self) {
        self.unbound.clear();
        self.inflight.clear();
    }

    pub fn awaiting_ack(&self) -> usize {
        self.unbound.len() + self.inflight.len()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_dedupes() {
        let mut tracker = SubscriptionTracker::new();
        assert!(tracker.register("user/+/client/+/status", QoS::ExactlyOnce));
        assert!(!tracker.register("user/+/client/+/status", QoS::AtLeastOnce));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_suback_matches_request() {
        let mut tracker = SubscriptionTracker::new();
        let id = tracker.issue("message");
        tracker.on_outgoing(4);
        assert_eq!(tracker.awaiting_ack(), 1);

        let (acked, pattern) = tracker
            .on_suback(4, &[SubscribeReasonCode::Success(QoS::ExactlyOnce)])
            .unwrap();
        assert_eq!(acked, id);
        assert_eq!(pattern, "message");
        assert_eq!(tracker.awaiting_ack(), 0);
    }

    #[test]
    fn test_unknown_suback_is_protocol_error() {
        let mut tracker = SubscriptionTracker::new();
        assert!(matches!(
            tracker.on_suback(1, &[SubscribeReasonCode::Success(QoS::AtMostOnce)]),
            Err(NetError::Protocol(_))
        ));
    }

    #[test]
    fn test_refused_subscription_is_fatal() {
        let mut tracker = SubscriptionTracker::new();
        tracker.issue("ambulance/+/data");
        tracker.on_outgoing(2);
        assert!(matches!(
            tracker.on_suback(2, &[SubscribeReasonCode::Failure]),
            Err(NetError::Rejected(_))
        ));
    }
}
