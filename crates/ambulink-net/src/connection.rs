//! The bridge's connection to the MQTT broker.
//!
//! [`BrokerConnection`] is a cheap, cloneable handle used by the rest of the
//! application to publish and subscribe. The rumqttc event loop runs in a
//! dedicated tokio task ([`BrokerEventLoop::run`]) that owns reconnection,
//! binds broker packet ids to ledger records and forwards inbound PUBLISH
//! packets over an mpsc channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing,
    QoS, Request,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use ambulink_shared::constants::{
    CHANNEL_CAPACITY, DEFAULT_BROKER_PORT, DEFAULT_KEEP_ALIVE_SECS,
    DEFAULT_RECONNECT_MAX_BACKOFF_MS, DEFAULT_RETRY_INTERVAL_MS,
};

use crate::backoff::Backoff;
use crate::error::NetError;
use crate::ledger::{Admission, MessageId, OutboundMessage, PublishLedger};
use crate::subscriptions::{RequestId, SubscriptionTracker};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Message the broker publishes on our behalf if we vanish uncleanly.
#[derive(Debug, Clone)]
pub struct LastWillMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Upper bound of the reconnect backoff.
    pub max_backoff: Duration,
    /// Period of the retry timer that flushes buffered publishes.
    pub retry_interval: Duration,
    pub last_will: Option<LastWillMessage>,
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            max_backoff: Duration::from_millis(DEFAULT_RECONNECT_MAX_BACKOFF_MS),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            last_will: None,
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(5)));
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                will.qos,
                will.retain,
            ));
        }
        options
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_BROKER_PORT, "ambulink-bridge")
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// An inbound PUBLISH, as handed to the router.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Outcome of [`BrokerConnection::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    /// Handed to the client and tracked under this id until acknowledged.
    Sent(MessageId),
    /// Held in the retry buffer until the connection is back.
    Buffered,
}

/// Outcome of [`BrokerConnection::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReceipt {
    /// SUBSCRIBE sent; tracked until SUBACK.
    Issued(RequestId),
    /// Registered; sent on the next successful connect.
    Deferred,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BrokerStats {
    pub connected: bool,
    pub pending: usize,
    pub buffered: usize,
    pub subscriptions: usize,
    pub awaiting_suback: usize,
    pub reconnects: u64,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct Shared {
    client: AsyncClient,
    ledger: Mutex<PublishLedger>,
    subscriptions: Mutex<SubscriptionTracker>,
    /// Serializes "register then send" so packet ids bind in record order.
    send_lock: tokio::sync::Mutex<()>,
    retry_interval: Duration,
    shutting_down: AtomicBool,
    reconnects: AtomicU64,
}

#[derive(Clone)]
pub struct BrokerConnection {
    shared: Arc<Shared>,
}

impl BrokerConnection {
    /// Build an unconnected handle plus the event loop that will drive it.
    ///
    /// Until [`BrokerEventLoop::run`] is polled every publish is buffered.
    pub fn new(config: &BrokerConfig) -> (Self, BrokerEventLoop, mpsc::Receiver<InboundMessage>) {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let conn = Self {
            shared: Arc::new(Shared {
                client,
                ledger: Mutex::new(PublishLedger::new()),
                subscriptions: Mutex::new(SubscriptionTracker::new()),
                send_lock: tokio::sync::Mutex::new(()),
                retry_interval: config.retry_interval,
                shutting_down: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
            }),
        };

        let event_loop = BrokerEventLoop {
            eventloop,
            conn: conn.clone(),
            inbound_tx,
            backoff: Backoff::new(config.max_backoff),
        };

        (conn, event_loop, inbound_rx)
    }

    /// Connect with the configured credentials and last will, spawning the
    /// event loop task.
    pub fn connect(
        config: &BrokerConfig,
    ) -> (Self, mpsc::Receiver<InboundMessage>, JoinHandle<()>) {
        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "connecting to broker"
        );
        let (conn, event_loop, inbound_rx) = Self::new(config);
        let handle = tokio::spawn(event_loop.run());
        (conn, inbound_rx, handle)
    }

    fn ledger(&self) -> MutexGuard<'_, PublishLedger> {
        self.shared
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, SubscriptionTracker> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.ledger().is_connected()
    }

    /// Publish reliably: tracked until acknowledged, buffered while down.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> PublishReceipt {
        let message = OutboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };

        let _order = self.shared.send_lock.lock().await;
        let admission = self.ledger().admit(message.clone());
        match admission {
            Admission::Send(id) => self.send_registered(id, message).await,
            Admission::Buffered { start_timer } => {
                debug!(topic = %message.topic, "broker unavailable, publish buffered");
                if start_timer {
                    self.spawn_retry_timer();
                }
                PublishReceipt::Buffered
            }
        }
    }

    /// Hand a registered record to the client. Caller holds `send_lock`.
    async fn send_registered(&self, id: MessageId, message: OutboundMessage) -> PublishReceipt {
        let result = self
            .shared
            .client
            .publish_bytes(message.topic.clone(), message.qos, message.retain, message.payload)
            .await;

        match result {
            Ok(()) => {
                let state = self.ledger().returned(id);
                trace!(id, topic = %message.topic, state = ?state, "publish handed to client");
                PublishReceipt::Sent(id)
            }
            Err(e) => {
                warn!(id, topic = %message.topic, error = %e, "publish request failed, buffering");
                if self.ledger().requeue(id) {
                    self.spawn_retry_timer();
                }
                PublishReceipt::Buffered
            }
        }
    }

    /// Subscribe now if connected; the pattern is re-issued on every
    /// reconnect either way.
    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
        qos: QoS,
    ) -> Result<SubscribeReceipt, NetError> {
        let pattern = pattern.into();
        let _order = self.shared.send_lock.lock().await;

        self.subscriptions().register(&pattern, qos);
        if !self.is_connected() {
            debug!(pattern = %pattern, "subscription deferred until connected");
            return Ok(SubscribeReceipt::Deferred);
        }
        let id = self.issue_subscribe(&pattern, qos).await?;
        Ok(SubscribeReceipt::Issued(id))
    }

    /// Caller holds `send_lock`.
    async fn issue_subscribe(&self, pattern: &str, qos: QoS) -> Result<RequestId, NetError> {
        let id = self.subscriptions().issue(pattern);
        if let Err(e) = self.shared.client.subscribe(pattern, qos).await {
            self.subscriptions().cancel(id);
            return Err(e.into());
        }
        debug!(id, pattern = %pattern, "subscribe issued");
        Ok(id)
    }

    /// Re-issue every registered subscription, then replay the retry
    /// buffer. Runs once per successful connect.
    async fn resume(&self) {
        let _order = self.shared.send_lock.lock().await;

        let registered = self.subscriptions().registered();
        for (pattern, qos) in registered {
            if let Err(e) = self.issue_subscribe(&pattern, qos).await {
                warn!(pattern = %pattern, error = %e, "resubscribe failed");
                return;
            }
        }

        let replayed = self.flush_locked().await;
        if replayed > 0 {
            info!(replayed, "retry buffer replayed");
        }
    }

    /// Send buffered messages oldest first while connected. Caller holds
    /// `send_lock`.
    async fn flush_locked(&self) -> usize {
        let mut sent = 0;
        loop {
            let next = self.ledger().next_buffered();
            let Some((id, message)) = next else { break };
            match self.send_registered(id, message).await {
                PublishReceipt::Sent(_) => sent += 1,
                PublishReceipt::Buffered => break,
            }
        }
        sent
    }

    fn spawn_retry_timer(&self) {
        let conn = self.clone();
        let interval = self.shared.retry_interval;
        debug!(interval_ms = interval.as_millis() as u64, "retry timer started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if conn.is_connected() {
                    let _order = conn.shared.send_lock.lock().await;
                    conn.flush_locked().await;
                }
                if !conn.ledger().retry_tick() {
                    debug!("retry buffer drained, timer stopped");
                    break;
                }
                if conn.shared.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
            }
        });
    }

    /// Clean disconnect: the broker discards our last will.
    pub async fn disconnect(&self) -> Result<(), NetError> {
        self.shared.shutting_down.store(true, Ordering::Relaxed);
        self.shared.client.disconnect().await?;
        info!("broker disconnect requested");
        Ok(())
    }

    pub fn stats(&self) -> BrokerStats {
        let (connected, pending, buffered) = {
            let ledger = self.ledger();
            (ledger.is_connected(), ledger.pending_len(), ledger.buffered_len())
        };
        let (subscriptions, awaiting_suback) = {
            let subs = self.subscriptions();
            (subs.len(), subs.awaiting_ack())
        };
        BrokerStats {
            connected,
            pending,
            buffered,
            subscriptions,
            awaiting_suback,
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the retry buffer, oldest first.
    pub fn buffered(&self) -> Vec<OutboundMessage> {
        self.ledger().buffered()
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

pub struct BrokerEventLoop {
    eventloop: EventLoop,
    conn: BrokerConnection,
    inbound_tx: mpsc::Sender<InboundMessage>,
    backoff: Backoff,
}

enum Flow {
    Continue,
    Stop,
}

impl BrokerEventLoop {
    /// Drive the connection until a clean disconnect.
    pub async fn run(mut self) {
        loop {
            let flow = match self.eventloop.poll().await {
                Ok(event) => match self.handle_event(event).await {
                    Ok(flow) => flow,
                    Err(e) => {
                        error!(error = %e, "dropping broker connection");
                        self.eventloop.clean();
                        self.connection_lost().await;
                        Flow::Continue
                    }
                },
                Err(e) => {
                    if self.conn.shared.shutting_down.load(Ordering::Relaxed) {
                        Flow::Stop
                    } else {
                        warn!(error = %e, "broker connection error");
                        self.connection_lost().await;
                        Flow::Continue
                    }
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }

        self.conn.ledger().on_disconnected();
        info!("broker event loop terminated");
    }

    async fn handle_event(&mut self, event: Event) -> Result<Flow, NetError> {
        match event {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    return Err(NetError::Rejected(format!("connection refused: {:?}", ack.code)));
                }
                self.backoff.reset();
                self.conn.ledger().on_connected();
                info!(session_present = ack.session_present, "connected to broker");

                let conn = self.conn.clone();
                tokio::spawn(async move { conn.resume().await });
            }

            Event::Incoming(Incoming::Publish(publish)) => {
                trace!(topic = %publish.topic, len = publish.payload.len(), "inbound publish");
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if self.inbound_tx.send(message).await.is_err() {
                    debug!("inbound receiver dropped, message discarded");
                }
            }

            Event::Incoming(Incoming::PubAck(ack)) => {
                self.conn.ledger().on_ack(ack.pkid)?;
            }

            Event::Incoming(Incoming::PubComp(comp)) => {
                self.conn.ledger().on_ack(comp.pkid)?;
            }

            Event::Incoming(Incoming::SubAck(ack)) => {
                let (id, pattern) = self
                    .conn
                    .subscriptions()
                    .on_suback(ack.pkid, &ack.return_codes)?;
                debug!(id, pattern = %pattern, "subscription granted");
            }

            Event::Outgoing(Outgoing::Publish(pkid)) => {
                self.conn.ledger().on_outgoing(pkid);
            }

            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.conn.subscriptions().on_outgoing(pkid);
            }

            Event::Outgoing(Outgoing::Disconnect) => {
                if self.conn.shared.shutting_down.load(Ordering::Relaxed) {
                    return Ok(Flow::Stop);
                }
            }

            _ => {}
        }
        Ok(Flow::Continue)
    }

    /// Move unacknowledged publishes into the retry buffer, forget in-flight
    /// subscribes and wait out the backoff before the next poll reconnects.
    async fn connection_lost(&mut self) {
        let start_timer = self.conn.ledger().on_disconnected();
        self.conn.subscriptions().reset();
        retain_unsent(&mut self.eventloop.pending);
        self.conn.shared.reconnects.fetch_add(1, Ordering::Relaxed);

        if start_timer {
            self.conn.spawn_retry_timer();
        }

        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}

/// Trim what rumqttc kept for the next session down to publishes that were
/// never written (packet id 0). Written publishes are back in the retry
/// buffer and subscriptions are re-issued on connect.
fn retain_unsent(pending: &mut VecDeque<Request>) {
    pending.retain(|request| match request {
        Request::Publish(publish) => publish.pkid == 0,
        Request::Disconnect(_) => true,
        _ => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::SubscribeReasonCode;

    fn unconnected() -> BrokerConnection {
        let mut config = BrokerConfig::new("127.0.0.1", 1, "test-bridge");
        config.last_will = Some(LastWillMessage {
            topic: "user/bridge/client/test-bridge/status".into(),
            payload: "disconnected".into(),
            qos: QoS::ExactlyOnce,
            retain: false,
        });
        let (conn, _event_loop, _inbound) = BrokerConnection::new(&config);
        conn
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_buffered() {
        let conn = unconnected();

        for topic in ["m1", "m2", "m3"] {
            let receipt = conn
                .publish(topic, Bytes::from_static(b"{}"), QoS::ExactlyOnce, true)
                .await;
            assert_eq!(receipt, PublishReceipt::Buffered);
        }

        let topics: Vec<String> = conn.buffered().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, ["m1", "m2", "m3"]);

        let stats = conn.stats();
        assert!(!stats.connected);
        assert_eq!(stats.buffered, 3);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_subscribe_is_deferred_until_connected() {
        let conn = unconnected();
        let receipt = conn.subscribe("message", QoS::ExactlyOnce).await.unwrap();
        assert_eq!(receipt, SubscribeReceipt::Deferred);
        assert_eq!(conn.stats().subscriptions, 1);
        assert_eq!(conn.stats().awaiting_suback, 0);
    }

    fn pair() -> (BrokerConnection, BrokerEventLoop, mpsc::Receiver<InboundMessage>) {
        BrokerConnection::new(&BrokerConfig::new("127.0.0.1", 1, "test-bridge"))
    }

    fn connack(code: ConnectReturnCode) -> Event {
        Event::Incoming(Incoming::ConnAck(rumqttc::ConnAck::new(code, false)))
    }

    /// Yield to spawned tasks until `done` holds.
    async fn settle(conn: &BrokerConnection, done: impl Fn(&BrokerStats) -> bool) {
        for _ in 0..1_000 {
            if done(&conn.stats()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connection did not settle: {:?}", conn.stats());
    }

    fn queued(event_loop: &BrokerEventLoop) -> Vec<String> {
        event_loop
            .eventloop
            .pending
            .iter()
            .map(|request| match request {
                Request::Publish(publish) => publish.topic.clone(),
                Request::Subscribe(subscribe) => format!("sub:{}", subscribe.filters[0].path),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connack_resubscribes_then_replays_in_order() {
        let (conn, mut event_loop, _inbound) = pair();
        conn.subscribe("message", QoS::ExactlyOnce).await.unwrap();
        for topic in ["m1", "m2", "m3"] {
            conn.publish(topic, Bytes::from_static(b"{}"), QoS::ExactlyOnce, true)
                .await;
        }

        event_loop
            .handle_event(connack(ConnectReturnCode::Success))
            .await
            .unwrap();
        settle(&conn, |s| s.pending == 3).await;

        assert!(conn.buffered().is_empty());
        let stats = conn.stats();
        assert!(stats.connected);
        assert_eq!(stats.awaiting_suback, 1);

        // Requests reach the client in issue order.
        event_loop.eventloop.clean();
        assert_eq!(queued(&event_loop), ["sub:message", "m1", "m2", "m3"]);

        event_loop
            .handle_event(Event::Outgoing(Outgoing::Subscribe(1)))
            .await
            .unwrap();
        event_loop
            .handle_event(Event::Incoming(Incoming::SubAck(rumqttc::SubAck::new(
                1,
                vec![SubscribeReasonCode::Success(QoS::ExactlyOnce)],
            ))))
            .await
            .unwrap();

        for pkid in 1..=3 {
            event_loop
                .handle_event(Event::Outgoing(Outgoing::Publish(pkid)))
                .await
                .unwrap();
        }
        for pkid in 1..=3 {
            event_loop
                .handle_event(Event::Incoming(Incoming::PubComp(rumqttc::PubComp::new(pkid))))
                .await
                .unwrap();
        }

        let stats = conn.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.buffered, 0);
        assert_eq!(stats.awaiting_suback, 0);
    }

    #[tokio::test]
    async fn test_unknown_acks_drop_the_connection() {
        let (_conn, mut event_loop, _inbound) = pair();

        let suback = event_loop
            .handle_event(Event::Incoming(Incoming::SubAck(rumqttc::SubAck::new(
                9,
                vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
            ))))
            .await;
        assert!(matches!(suback, Err(NetError::Protocol(_))));

        let puback = event_loop
            .handle_event(Event::Incoming(Incoming::PubAck(rumqttc::PubAck::new(4))))
            .await;
        assert!(matches!(puback, Err(NetError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_refused_connack_is_rejected() {
        let (conn, mut event_loop, _inbound) = pair();
        let result = event_loop
            .handle_event(connack(ConnectReturnCode::NotAuthorized))
            .await;
        assert!(matches!(result, Err(NetError::Rejected(_))));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_connection_lost_keeps_unwritten_requests() {
        let (conn, mut event_loop, _inbound) = pair();
        event_loop
            .handle_event(connack(ConnectReturnCode::Success))
            .await
            .unwrap();
        settle(&conn, |s| s.connected).await;

        for topic in ["m1", "m2"] {
            let receipt = conn
                .publish(topic, Bytes::from_static(b"{}"), QoS::AtLeastOnce, true)
                .await;
            assert!(matches!(receipt, PublishReceipt::Sent(_)));
        }
        event_loop
            .handle_event(Event::Outgoing(Outgoing::Publish(1)))
            .await
            .unwrap();

        // What rumqttc keeps after the drop: m1 as written, m2 still queued,
        // plus session leftovers.
        event_loop.eventloop.clean();
        if let Some(Request::Publish(publish)) = event_loop.eventloop.pending.front_mut() {
            publish.pkid = 1;
        }
        event_loop
            .eventloop
            .pending
            .push_back(Request::Subscribe(rumqttc::Subscribe::new(
                "message",
                QoS::ExactlyOnce,
            )));
        event_loop
            .eventloop
            .pending
            .push_back(Request::PubRel(rumqttc::PubRel::new(1)));

        event_loop.connection_lost().await;

        assert_eq!(queued(&event_loop), ["m2"]);
        let topics: Vec<String> = conn.buffered().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, ["m1"]);
        let stats = conn.stats();
        assert!(!stats.connected);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.reconnects, 1);

        // After reconnecting, the queued m2 goes out ahead of the replayed m1.
        event_loop
            .handle_event(connack(ConnectReturnCode::Success))
            .await
            .unwrap();
        settle(&conn, |s| s.buffered == 0 && s.pending == 2).await;

        for pkid in 1..=2 {
            event_loop
                .handle_event(Event::Outgoing(Outgoing::Publish(pkid)))
                .await
                .unwrap();
        }
        for pkid in 1..=2 {
            event_loop
                .handle_event(Event::Incoming(Incoming::PubAck(rumqttc::PubAck::new(pkid))))
                .await
                .unwrap();
        }
        assert_eq!(conn.stats().pending, 0);
    }
}
