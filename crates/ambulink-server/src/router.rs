//! Inbound topic routing.
//!
//! The route table below is the single source of truth for which topics the
//! bridge consumes: it is compiled once into a segment trie used to parse
//! every inbound topic, and the same patterns are what the bridge
//! subscribes to.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ambulink_net::{InboundMessage, QoS};
use ambulink_shared::constants::{CACHE_CLEAR, CONTROL_TOPIC};
use ambulink_shared::protocol::ErrorReply;
use ambulink_shared::ParseError;

use crate::error::BridgeError;
use crate::handlers;
use crate::state::Bridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ClientStatus,
    AmbulanceData,
    HospitalData,
    EquipmentItemData,
    CallStatus,
    WaypointData,
    Control,
}

pub const ROUTES: &[(&str, Route)] = &[
    ("user/+/client/+/status", Route::ClientStatus),
    ("user/+/client/+/ambulance/+/data", Route::AmbulanceData),
    ("user/+/client/+/hospital/+/data", Route::HospitalData),
    ("user/+/client/+/equipment/+/item/+/data", Route::EquipmentItemData),
    ("user/+/client/+/ambulance/+/call/+/status", Route::CallStatus),
    ("user/+/client/+/ambulance/+/call/+/waypoint/+/data", Route::WaypointData),
    (CONTROL_TOPIC, Route::Control),
];

const PARAM: &str = "+";

#[derive(Debug, Default)]
struct Node {
    literals: HashMap<&'static str, Node>,
    param: Option<Box<Node>>,
    route: Option<Route>,
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.literals.is_empty() && self.param.is_none()
    }
}

/// Compiled route table.
#[derive(Debug)]
pub struct TopicTable {
    root: Node,
    patterns: Vec<&'static str>,
}

impl Default for TopicTable {
    fn default() -> Self {
        Self::compile(ROUTES)
    }
}

impl TopicTable {
    pub fn compile(routes: &[(&'static str, Route)]) -> Self {
        let mut root = Node::default();
        for &(pattern, route) in routes {
            let mut node = &mut root;
            for segment in pattern.split('/') {
                node = if segment == PARAM {
                    node.param.get_or_insert_with(Box::default).as_mut()
                } else {
                    node.literals.entry(segment).or_default()
                };
            }
            node.route = Some(route);
        }
        Self {
            root,
            patterns: routes.iter().map(|&(pattern, _)| pattern).collect(),
        }
    }

    /// Patterns to subscribe to, in table order.
    pub fn subscriptions(&self) -> &[&'static str] {
        &self.patterns
    }

    /// Match `topic` against the table, returning the route and the
    /// parameter segments in order.
    pub fn resolve<'t>(&self, topic: &'t str) -> Result<(Route, Vec<&'t str>), ParseError> {
        let mut node = &self.root;
        let mut params = Vec::new();

        for segment in topic.split('/') {
            if node.is_leaf() {
                return Err(ParseError::topic(topic, "too many segments"));
            }
            if let Some(next) = node.literals.get(segment) {
                node = next;
            } else if let Some(next) = &node.param {
                if segment.is_empty() {
                    return Err(ParseError::topic(topic, "empty parameter"));
                }
                params.push(segment);
                node = next;
            } else {
                return Err(ParseError::topic(
                    topic,
                    format!("unexpected segment '{segment}'"),
                ));
            }
        }

        node.route
            .map(|route| (route, params))
            .ok_or_else(|| ParseError::topic(topic, "incomplete topic"))
    }

    pub fn parse(&self, topic: &str) -> Result<Inbound, ParseError> {
        let (route, params) = self.resolve(topic)?;
        let sender = |p: &[&str]| Sender {
            username: p[0].to_string(),
            client_id: p[1].to_string(),
        };

        let inbound = match (route, params.as_slice()) {
            (Route::Control, []) => Inbound::Control,
            (Route::ClientStatus, p @ [_, _]) => Inbound::ClientStatus { sender: sender(p) },
            (Route::AmbulanceData, p @ [_, _, amb]) => Inbound::AmbulanceData {
                sender: sender(p),
                ambulance: id("ambulance", amb)?,
            },
            (Route::HospitalData, p @ [_, _, hosp]) => Inbound::HospitalData {
                sender: sender(p),
                hospital: id("hospital", hosp)?,
            },
            (Route::EquipmentItemData, p @ [_, _, holder, item]) => Inbound::EquipmentItemData {
                sender: sender(p),
                holder: id("equipment holder", holder)?,
                equipment: id("equipment", item)?,
            },
            (Route::CallStatus, p @ [_, _, amb, call]) => Inbound::CallStatus {
                sender: sender(p),
                ambulance: id("ambulance", amb)?,
                call: id("call", call)?,
            },
            (Route::WaypointData, p @ [_, _, amb, call, waypoint]) => Inbound::WaypointData {
                sender: sender(p),
                ambulance: id("ambulance", amb)?,
                call: id("call", call)?,
                waypoint: id("waypoint", waypoint)?,
            },
            _ => return Err(ParseError::topic(topic, "parameter count mismatch")),
        };
        Ok(inbound)
    }
}

fn id(kind: &'static str, segment: &str) -> Result<i64, ParseError> {
    match segment.parse::<i64>() {
        Ok(value) if value >= 0 => Ok(value),
        _ => Err(ParseError::InvalidId {
            kind,
            value: segment.to_string(),
        }),
    }
}

/// The device session a message was published from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub username: String,
    pub client_id: String,
}

/// A parsed inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ClientStatus {
        sender: Sender,
    },
    AmbulanceData {
        sender: Sender,
        ambulance: i64,
    },
    HospitalData {
        sender: Sender,
        hospital: i64,
    },
    EquipmentItemData {
        sender: Sender,
        holder: i64,
        equipment: i64,
    },
    CallStatus {
        sender: Sender,
        ambulance: i64,
        call: i64,
    },
    WaypointData {
        sender: Sender,
        ambulance: i64,
        call: i64,
        /// 0 creates a new waypoint.
        waypoint: i64,
    },
    Control,
}

impl Inbound {
    pub fn sender(&self) -> Option<&Sender> {
        match self {
            Self::ClientStatus { sender }
            | Self::AmbulanceData { sender, .. }
            | Self::HospitalData { sender, .. }
            | Self::EquipmentItemData { sender, .. }
            | Self::CallStatus { sender, .. }
            | Self::WaypointData { sender, .. } => Some(sender),
            Self::Control => None,
        }
    }
}

/// Consumes inbound broker messages, one task per message.
#[derive(Clone)]
pub struct TopicRouter {
    bridge: Bridge,
    table: Arc<TopicTable>,
}

impl TopicRouter {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            table: Arc::new(TopicTable::default()),
        }
    }

    pub fn subscriptions(&self) -> &[&'static str] {
        self.table.subscriptions()
    }

    /// Register every route pattern with the broker connection. Patterns
    /// registered before the first connect are sent once it comes up.
    pub async fn subscribe_all(&self) -> Result<usize, BridgeError> {
        let conn = self.bridge.gateway.connection();
        for pattern in self.subscriptions() {
            conn.subscribe(*pattern, QoS::ExactlyOnce).await?;
        }
        debug!(patterns = self.subscriptions().len(), "route subscriptions registered");
        Ok(self.subscriptions().len())
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            let router = self.clone();
            tokio::spawn(async move {
                router.handle(message).await;
            });
        }
        info!("inbound channel closed, router stopped");
    }

    /// Apply one message and publish the resulting state. Failures are
    /// replied to the sender when it can be identified.
    pub async fn handle(&self, message: InboundMessage) {
        let InboundMessage { topic, payload } = message;

        let inbound = match self.table.parse(&topic) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(topic = %topic, error = %e, "dropping message with unroutable topic");
                return;
            }
        };

        if inbound == Inbound::Control {
            self.control(&payload);
            return;
        }

        let result = {
            let db = self.bridge.db.lock().await;
            db.transaction(|db| handlers::apply(db, &self.bridge.cache, &inbound, &payload))
        };

        match result {
            Ok(notifications) => {
                debug!(topic = %topic, count = notifications.len(), "message applied");
                self.bridge.gateway.publish_all(&notifications).await;
            }
            Err(e) => self.reject(&inbound, &topic, &payload, e).await,
        }
    }

    fn control(&self, payload: &Bytes) {
        let text = String::from_utf8_lossy(payload);
        if text.trim() == CACHE_CLEAR {
            self.bridge.cache.invalidate();
            info!("permission cache cleared by control message");
        } else {
            debug!(payload = %text, "ignoring control message");
        }
    }

    async fn reject(&self, inbound: &Inbound, topic: &str, payload: &[u8], error: BridgeError) {
        let sender = inbound.sender().filter(|_| error.is_reportable());
        let Some(sender) = sender else {
            warn!(topic, error = %error, "message rejected");
            return;
        };

        info!(
            topic,
            user = %sender.username,
            client_id = %sender.client_id,
            error = %error,
            "message rejected, replying"
        );
        let reply = ErrorReply::new(topic, payload, error.to_string());
        if let Err(e) = self
            .bridge
            .gateway
            .publish_error(&sender.username, &sender.client_id, &reply)
            .await
        {
            warn!(topic, error = %e, "could not send error reply");
        }
    }
}
