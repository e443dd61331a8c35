use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Zone identifier, taken verbatim from the topic path
pub type ZoneId = String;

/// Volume level, bounded by the configured range
pub type VolumeLevel = u8;

/// Read-only view of every known zone
pub type ZoneSnapshot = Arc<BTreeMap<ZoneId, Zone>>;

/// State attribute published under `ampbridge/zones/{zone_id}/{attribute}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attribute {
    Volume,
    Mute,
    Source,
    Connected,
    Name,
}

impl Attribute {
    pub const ALL: [Attribute; 5] = [
        Attribute::Volume,
        Attribute::Mute,
        Attribute::Source,
        Attribute::Connected,
        Attribute::Name,
    ];

    /// Topic segment for this attribute
    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Volume => "volume",
            Attribute::Mute => "mute",
            Attribute::Source => "source",
            Attribute::Connected => "connected",
            Attribute::Name => "name",
        }
    }

    /// Parse a topic segment
    pub fn parse(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == segment)
    }

    /// Whether a `/set` command topic exists for this attribute
    pub fn is_commandable(&self) -> bool {
        matches!(self, Attribute::Volume | Attribute::Mute | Attribute::Source)
    }

    fn index(&self) -> usize {
        match self {
            Attribute::Volume => 0,
            Attribute::Mute => 1,
            Attribute::Source => 2,
            Attribute::Connected => 3,
            Attribute::Name => 4,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Level(VolumeLevel),
    Flag(bool),
    Text(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Level(v) => write!(f, "{}", v),
            AttributeValue::Flag(b) => write!(f, "{}", b),
            AttributeValue::Text(s) => f.write_str(s),
        }
    }
}

/// Broker connection lifecycle, owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// One controllable amplifier output.
///
/// Fields are `None` until the first retained value for them arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub zone_id: ZoneId,
    pub name: Option<String>,
    pub volume: Option<VolumeLevel>,
    pub mute: Option<bool>,
    pub source: Option<String>,
    /// Amplifier-reported liveness, independent of the broker session
    pub connected: Option<bool>,
    /// Set when no update arrived within the liveness window
    pub stale: bool,
    /// Time of the last state message from the amplifier. Local writes
    /// (optimistic values, reverts, retirement) leave it alone.
    pub last_updated: Instant,
    field_updated: [Option<Instant>; 5],
}

impl Zone {
    pub(crate) fn new(zone_id: impl Into<ZoneId>, now: Instant) -> Self {
        Self {
            zone_id: zone_id.into(),
            name: None,
            volume: None,
            mute: None,
            source: None,
            connected: None,
            stale: false,
            last_updated: now,
            field_updated: [None; 5],
        }
    }

    /// Current value of an attribute
    pub fn get(&self, attribute: Attribute) -> Option<AttributeValue> {
        match attribute {
            Attribute::Volume => self.volume.map(AttributeValue::Level),
            Attribute::Mute => self.mute.map(AttributeValue::Flag),
            Attribute::Connected => self.connected.map(AttributeValue::Flag),
            Attribute::Source => self.source.clone().map(AttributeValue::Text),
            Attribute::Name => self.name.clone().map(AttributeValue::Text),
        }
    }

    /// Time the given field was last written
    pub fn field_updated(&self, attribute: Attribute) -> Option<Instant> {
        self.field_updated[attribute.index()]
    }

    /// A zone accepts commands unless the amplifier reported it disconnected
    /// or it went stale. Unknown connectivity counts as available.
    pub fn is_available(&self) -> bool {
        self.connected != Some(false) && !self.stale
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.zone_id)
    }

    /// Write a field. Returns false when the value type does not fit the attribute.
    pub(crate) fn set(
        &mut self,
        attribute: Attribute,
        value: Option<AttributeValue>,
        at: Instant,
    ) -> bool {
        match (attribute, value) {
            (Attribute::Volume, Some(AttributeValue::Level(v))) => self.volume = Some(v),
            (Attribute::Volume, None) => self.volume = None,
            (Attribute::Mute, Some(AttributeValue::Flag(b))) => self.mute = Some(b),
            (Attribute::Mute, None) => self.mute = None,
            (Attribute::Connected, Some(AttributeValue::Flag(b))) => self.connected = Some(b),
            (Attribute::Connected, None) => self.connected = None,
            (Attribute::Source, Some(AttributeValue::Text(s))) => self.source = Some(s),
            (Attribute::Source, None) => self.source = None,
            (Attribute::Name, Some(AttributeValue::Text(s))) => self.name = Some(s),
            (Attribute::Name, None) => self.name = None,
            _ => return false,
        }
        self.field_updated[attribute.index()] = Some(at);
        true
    }
}
