// MQTT transport for the Ambulink bridge, built on rumqttc.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod subscriptions;

pub use connection::{
    BrokerConfig, BrokerConnection, BrokerEventLoop, BrokerStats, InboundMessage,
    LastWillMessage, PublishReceipt, SubscribeReceipt,
};
pub use error::NetError;
pub use ledger::{MessageId, OutboundMessage, PublishLedger, PublishState};
pub use rumqttc::QoS;
pub use subscriptions::{RequestId, SubscriptionTracker};
