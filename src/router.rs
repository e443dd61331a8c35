use crate::error::BridgeError;
use crate::protocol::{self, SourceMap, TopicKind, TopicSchema};
use crate::types::{Attribute, AttributeValue, VolumeLevel, ZoneId};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// A broker message as handed over by the connection manager
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Receive time, used to order updates per field
    pub received_at: Instant,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Instant::now(),
        }
    }
}

/// A decoded state update ready for the zone store
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedUpdate {
    pub zone_id: ZoneId,
    pub attribute: Attribute,
    pub value: AttributeValue,
    pub timestamp: Instant,
}

/// Outcome of routing one message
#[derive(Debug)]
pub enum Route {
    Update(RoutedUpdate),
    /// Topic outside the state schema (command echoes included)
    Dropped,
    /// Known topic, undecodable payload
    Rejected(BridgeError),
}

/// Counters kept by the router, readable from any task
#[derive(Debug, Default)]
pub struct RouterStats {
    routed: AtomicU64,
    dropped: AtomicU64,
    parse_failures: AtomicU64,
    clamped: AtomicU64,
}

impl RouterStats {
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn clamped(&self) -> u64 {
        self.clamped.load(Ordering::Relaxed)
    }
}

/// Parses state topics into `(zone_id, attribute)` and decodes payloads
pub struct TopicRouter {
    schema: TopicSchema,
    volume_range: RangeInclusive<VolumeLevel>,
    sources: SourceMap,
    stats: Arc<RouterStats>,
}

impl TopicRouter {
    pub fn new(
        schema: TopicSchema,
        volume_range: RangeInclusive<VolumeLevel>,
        sources: SourceMap,
    ) -> Self {
        Self {
            schema,
            volume_range,
            sources,
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        self.stats.clone()
    }

    /// Route one message. Never fails: bad input becomes `Dropped` or `Rejected`.
    pub fn route(&self, message: &InboundMessage) -> Route {
        let (zone_id, attribute) = match self.schema.parse(&message.topic) {
            Some(TopicKind::State { zone_id, attribute }) => (zone_id, attribute),
            Some(TopicKind::Command { .. }) | None => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping message on unrecognized topic {}", message.topic);
                return Route::Dropped;
            }
        };

        let payload = match std::str::from_utf8(&message.payload) {
            Ok(text) => text,
            Err(_) => {
                let lossy = String::from_utf8_lossy(&message.payload);
                return self.reject(attribute, &lossy, "not UTF-8");
            }
        };

        let decoded = match attribute {
            Attribute::Volume => protocol::decode_volume(payload, &self.volume_range).map(|v| {
                if v.clamped {
                    self.stats.clamped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Volume {:?} for zone {} outside {:?}, clamped to {}",
                        payload,
                        zone_id,
                        self.volume_range,
                        v.level
                    );
                }
                AttributeValue::Level(v.level)
            }),
            Attribute::Mute | Attribute::Connected => {
                protocol::decode_bool(payload).map(AttributeValue::Flag)
            }
            Attribute::Source => protocol::decode_text(payload)
                .map(|wire| AttributeValue::Text(self.sources.from_wire(&wire))),
            Attribute::Name => protocol::decode_text(payload).map(AttributeValue::Text),
        };

        match decoded {
            Ok(value) => {
                self.stats.routed.fetch_add(1, Ordering::Relaxed);
                Route::Update(RoutedUpdate {
                    zone_id,
                    attribute,
                    value,
                    timestamp: message.received_at,
                })
            }
            Err(failure) => self.reject(attribute, payload, &failure.0),
        }
    }

    fn reject(&self, attribute: Attribute, payload: &str, reason: &str) -> Route {
        self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
        Route::Rejected(BridgeError::PayloadParse {
            attribute,
            payload: payload.to_string(),
            reason: reason.to_string(),
        })
    }
}
