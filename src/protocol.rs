//! Topic schema and payload encodings of the AmpBridge MQTT contract.
//!
//! | Direction | Topic                                   | Payload          |
//! |-----------|-----------------------------------------|------------------|
//! | State     | `{base}/{zone_id}/{attribute}`          | attribute-typed  |
//! | Command   | `{base}/{zone_id}/{attribute}/set`      | attribute-typed  |
//!
//! State topics are retained by the amplifier; command topics never are.

use crate::types::{Attribute, AttributeValue, VolumeLevel, ZoneId};
use std::ops::RangeInclusive;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

const COMMAND_SUFFIX: &str = "set";
const SOURCE_PREFIX: &str = "Source ";
const SOURCE_OFF: &str = "Off";

/// Shape of a topic under the base prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    State { zone_id: ZoneId, attribute: Attribute },
    Command { zone_id: ZoneId, attribute: Attribute },
}

/// Topic builder/parser bound to a base prefix
#[derive(Debug, Clone)]
pub struct TopicSchema {
    base: String,
}

impl TopicSchema {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Wildcard matching every zone state topic
    pub fn state_wildcard(&self) -> String {
        format!("{}/+/+", self.base)
    }

    pub fn state_topic(&self, zone_id: &str, attribute: Attribute) -> String {
        format!("{}/{}/{}", self.base, zone_id, attribute)
    }

    pub fn command_topic(&self, zone_id: &str, attribute: Attribute) -> String {
        format!("{}/{}/{}/{}", self.base, zone_id, attribute, COMMAND_SUFFIX)
    }

    /// Classify a topic. `None` for anything outside the schema.
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let zone_id = parts.next().filter(|s| !s.is_empty())?;
        let attribute = Attribute::parse(parts.next()?)?;

        match (parts.next(), parts.next()) {
            (None, _) => Some(TopicKind::State {
                zone_id: zone_id.to_string(),
                attribute,
            }),
            (Some(COMMAND_SUFFIX), None) if attribute.is_commandable() => Some(TopicKind::Command {
                zone_id: zone_id.to_string(),
                attribute,
            }),
            _ => None,
        }
    }
}

/// Why a payload was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure(pub String);

/// Result of decoding a volume payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedVolume {
    pub level: VolumeLevel,
    /// The payload was outside the range and got clamped
    pub clamped: bool,
}

/// Parse a numeric volume, rounding fractions and clamping to `range`
pub fn decode_volume(
    payload: &str,
    range: &RangeInclusive<VolumeLevel>,
) -> Result<DecodedVolume, DecodeFailure> {
    let raw: f64 = payload
        .trim()
        .parse()
        .map_err(|_| DecodeFailure("not a number".to_string()))?;
    if !raw.is_finite() {
        return Err(DecodeFailure("not a finite number".to_string()));
    }

    let rounded = raw.round();
    let min = f64::from(*range.start());
    let max = f64::from(*range.end());
    let clamped = rounded < min || rounded > max;
    let level = rounded.clamp(min, max) as VolumeLevel;

    Ok(DecodedVolume { level, clamped })
}

/// Accepts `ON`/`OFF`, `true`/`false` and `1`/`0`, case-insensitively
pub fn decode_bool(payload: &str) -> Result<bool, DecodeFailure> {
    let trimmed = payload.trim();
    if ["on", "true", "1"].iter().any(|t| trimmed.eq_ignore_ascii_case(t)) {
        Ok(true)
    } else if ["off", "false", "0"].iter().any(|t| trimmed.eq_ignore_ascii_case(t)) {
        Ok(false)
    } else {
        Err(DecodeFailure("not a boolean encoding".to_string()))
    }
}

pub fn encode_bool(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

pub fn decode_text(payload: &str) -> Result<String, DecodeFailure> {
    if payload.is_empty() {
        Err(DecodeFailure("empty string".to_string()))
    } else {
        Ok(payload.to_string())
    }
}

/// Encode a commandable value for its `/set` topic
pub fn encode_command(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Level(v) => v.to_string(),
        AttributeValue::Flag(b) => encode_bool(*b).to_string(),
        AttributeValue::Text(s) => s.clone(),
    }
}

/// Translation between input display names and the amplifier's `Source N` names.
///
/// Index `i` of the list is `Source {i + 1}` on the wire. An empty map passes
/// every name through unchanged.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    names: Vec<String>,
}

impl SourceMap {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Display name to wire name. `None` when the name is neither advertised
    /// nor already in amplifier form.
    pub fn to_wire(&self, name: &str) -> Option<String> {
        if name == SOURCE_OFF {
            return Some(SOURCE_OFF.to_string());
        }
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return Some(format!("{}{}", SOURCE_PREFIX, index + 1));
        }
        if self.names.is_empty() || source_index(name).is_some() {
            return Some(name.to_string());
        }
        None
    }

    /// Wire name to display name, falling back to the wire name
    pub fn from_wire(&self, wire: &str) -> String {
        source_index(wire)
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| self.names.get(i))
            .cloned()
            .unwrap_or_else(|| wire.to_string())
    }
}

fn source_index(wire: &str) -> Option<usize> {
    let digits = wire.strip_prefix(SOURCE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TopicSchema {
        TopicSchema::new("ampbridge/zones")
    }

    #[test]
    fn parses_state_topics() {
        assert_eq!(
            schema().parse("ampbridge/zones/3/volume"),
            Some(TopicKind::State {
                zone_id: "3".to_string(),
                attribute: Attribute::Volume
            })
        );
        assert_eq!(
            schema().parse("ampbridge/zones/living-room/connected"),
            Some(TopicKind::State {
                zone_id: "living-room".to_string(),
                attribute: Attribute::Connected
            })
        );
    }

    #[test]
    fn parses_command_topics_only_for_commandable_attributes() {
        assert_eq!(
            schema().parse("ampbridge/zones/3/mute/set"),
            Some(TopicKind::Command {
                zone_id: "3".to_string(),
                attribute: Attribute::Mute
            })
        );
        assert_eq!(schema().parse("ampbridge/zones/3/connected/set"), None);
    }

    #[test]
    fn rejects_foreign_shapes() {
        let s = schema();
        assert_eq!(s.parse("ampbridge/zones/status"), None);
        assert_eq!(s.parse("ampbridge/zones//volume"), None);
        assert_eq!(s.parse("ampbridge/zones/3/bass"), None);
        assert_eq!(s.parse("ampbridge/zones/3/volume/set/extra"), None);
        assert_eq!(s.parse("ampbridge/groups/1/volume"), None);
        assert_eq!(s.parse("ampbridge/zonesX/1/volume"), None);
    }

    #[test]
    fn builds_topics() {
        let s = TopicSchema::new("ampbridge/zones/");
        assert_eq!(s.state_wildcard(), "ampbridge/zones/+/+");
        assert_eq!(s.state_topic("4", Attribute::Source), "ampbridge/zones/4/source");
        assert_eq!(s.command_topic("4", Attribute::Volume), "ampbridge/zones/4/volume/set");
    }

    #[test]
    fn volume_is_rounded_and_clamped() {
        let range = 0..=100;
        assert_eq!(
            decode_volume("40", &range).unwrap(),
            DecodedVolume { level: 40, clamped: false }
        );
        assert_eq!(decode_volume(" 40.6 ", &range).unwrap().level, 41);
        assert_eq!(
            decode_volume("150", &range).unwrap(),
            DecodedVolume { level: 100, clamped: true }
        );
        assert_eq!(decode_volume("-3", &range).unwrap(), DecodedVolume { level: 0, clamped: true });
        assert!(decode_volume("loud", &range).is_err());
        assert!(decode_volume("NaN", &range).is_err());
        assert!(decode_volume("", &range).is_err());
    }

    #[test]
    fn all_boolean_encodings_are_accepted() {
        for on in ["ON", "on", "true", "TRUE", "1"] {
            assert_eq!(decode_bool(on), Ok(true), "{on}");
        }
        for off in ["OFF", "off", "false", "False", "0"] {
            assert_eq!(decode_bool(off), Ok(false), "{off}");
        }
        assert!(decode_bool("yes").is_err());
        assert!(decode_bool("").is_err());
    }

    #[test]
    fn text_must_be_non_empty() {
        assert_eq!(decode_text("TV"), Ok("TV".to_string()));
        assert!(decode_text("").is_err());
    }

    #[test]
    fn commands_encode_booleans_as_on_off() {
        assert_eq!(encode_command(&AttributeValue::Flag(true)), "ON");
        assert_eq!(encode_command(&AttributeValue::Flag(false)), "OFF");
        assert_eq!(encode_command(&AttributeValue::Level(40)), "40");
    }

    #[test]
    fn source_map_translates_both_ways() {
        let map = SourceMap::new(vec!["Echo".into(), "Server".into(), "TV".into()]);
        assert_eq!(map.to_wire("Server").as_deref(), Some("Source 2"));
        assert_eq!(map.to_wire("Off").as_deref(), Some("Off"));
        assert_eq!(map.to_wire("Source 7").as_deref(), Some("Source 7"));
        assert_eq!(map.to_wire("Phono"), None);

        assert_eq!(map.from_wire("Source 3"), "TV");
        assert_eq!(map.from_wire("Source 9"), "Source 9");
        assert_eq!(map.from_wire("Source 0"), "Source 0");
        assert_eq!(map.from_wire("Off"), "Off");
    }

    #[test]
    fn empty_source_map_is_opaque() {
        let map = SourceMap::default();
        assert_eq!(map.to_wire("Phono").as_deref(), Some("Phono"));
        assert_eq!(map.from_wire("Source 1"), "Source 1");
    }
}
