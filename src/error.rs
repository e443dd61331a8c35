use crate::types::{Attribute, AttributeValue, ZoneId};
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while bridging an AmpBridge controller over MQTT
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Broker unreachable or the session dropped
    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    /// Broker rejected the CONNECT (bad credentials, not authorized, ...)
    #[error("Connection refused by broker: {0:?}")]
    ConnectionRefused(rumqttc::ConnectReturnCode),

    /// No CONNACK within the configured connect timeout
    #[error("Timed out connecting to broker")]
    ConnectTimeout,

    /// Subscription was rejected or could not be issued
    #[error("Subscription to {pattern} failed: {reason}")]
    Subscription {
        /// Topic filter that failed
        pattern: String,
        /// What went wrong
        reason: String,
    },

    /// Payload could not be decoded for its attribute
    #[error("Invalid {attribute} payload {payload:?}: {reason}")]
    PayloadParse {
        attribute: Attribute,
        payload: String,
        reason: String,
    },

    /// Command targeted a zone the store has never seen
    #[error("Unknown zone: {0}")]
    UnknownZone(ZoneId),

    /// Command targeted a zone that is disconnected or stale
    #[error("Zone unavailable: {0}")]
    ZoneUnavailable(ZoneId),

    /// Source name is neither advertised nor in amplifier form
    #[error("Unknown source {source_name:?} for zone {zone_id}")]
    UnknownSource { zone_id: ZoneId, source_name: String },

    /// No state echo confirmed a command before its deadline
    #[error(transparent)]
    CommandTimeout(#[from] CommandTimeout),

    /// The engine task is gone (bridge shut down)
    #[error("Bridge engine stopped")]
    EngineStopped,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// A command whose optimistic value was reverted because no echo arrived in time.
///
/// Delivered asynchronously through [`BridgeEvent::CommandTimedOut`](crate::BridgeEvent),
/// since the setter call has already returned by then.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Command {attribute}={intended} on zone {zone_id} timed out")]
pub struct CommandTimeout {
    pub zone_id: ZoneId,
    pub attribute: Attribute,
    pub intended: AttributeValue,
    /// Value the zone was restored to (`None` if it was never known)
    pub reverted_to: Option<AttributeValue>,
}
