use thiserror::Error;

/// Errors raised by the broker connection.
#[derive(Error, Debug)]
pub enum NetError {
    /// The broker acknowledged a packet id we never issued.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The broker refused a connection or subscription.
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    /// The request could not be handed to the event loop.
    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Transport-level failure while talking to the broker.
    #[error("Connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
}

impl NetError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
