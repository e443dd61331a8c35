use crate::types::{Attribute, AttributeValue, Zone, ZoneId, ZoneSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A field whose value actually changed
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneChange {
    pub zone_id: ZoneId,
    pub attribute: Attribute,
    pub old_value: Option<AttributeValue>,
    pub new_value: Option<AttributeValue>,
}

/// What `apply_update` did
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Older than the field's last write, ignored
    Discarded,
    Applied {
        /// The zone did not exist before this update
        created: bool,
        /// The zone was stale and is live again
        revived: bool,
        /// `None` when the value was already current
        change: Option<ZoneChange>,
    },
}

impl UpdateOutcome {
    pub fn change(&self) -> Option<&ZoneChange> {
        match self {
            UpdateOutcome::Applied { change, .. } => change.as_ref(),
            UpdateOutcome::Discarded => None,
        }
    }
}

/// Authoritative zone map. Only the engine task holds one.
#[derive(Debug, Default)]
pub struct ZoneStore {
    zones: BTreeMap<ZoneId, Zone>,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.get(zone_id)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        Arc::new(self.zones.clone())
    }

    /// Apply one state message from the amplifier, creating the zone if needed.
    ///
    /// Out-of-order updates (timestamp older than the field's last write) are
    /// discarded. Duplicates still refresh `last_updated`, so liveness tracks
    /// replays too.
    pub fn apply_update(
        &mut self,
        zone_id: &str,
        attribute: Attribute,
        value: AttributeValue,
        timestamp: Instant,
    ) -> UpdateOutcome {
        let created = !self.zones.contains_key(zone_id);
        let zone = self
            .zones
            .entry(zone_id.to_string())
            .or_insert_with(|| Zone::new(zone_id, timestamp));

        if zone.field_updated(attribute).is_some_and(|last| timestamp < last) {
            tracing::debug!("Discarding out-of-order {} update for zone {}", attribute, zone_id);
            return UpdateOutcome::Discarded;
        }

        let old_value = zone.get(attribute);
        if !zone.set(attribute, Some(value.clone()), timestamp) {
            tracing::warn!("Value {:?} does not fit attribute {}", value, attribute);
            if created {
                self.zones.remove(zone_id);
            }
            return UpdateOutcome::Discarded;
        }

        if timestamp > zone.last_updated {
            zone.last_updated = timestamp;
        }
        let revived = std::mem::replace(&mut zone.stale, false);
        let change = (old_value.as_ref() != Some(&value)).then(|| ZoneChange {
            zone_id: zone_id.to_string(),
            attribute,
            old_value,
            new_value: Some(value),
        });

        UpdateOutcome::Applied {
            created,
            revived,
            change,
        }
    }

    /// Local write: optimistic command value, revert or retirement.
    ///
    /// Bypasses the ordering check and does not count as a sign of life, so
    /// a silent zone still goes stale while commands are sent to it.
    pub fn apply_local(
        &mut self,
        zone_id: &str,
        attribute: Attribute,
        value: Option<AttributeValue>,
        timestamp: Instant,
    ) -> Option<ZoneChange> {
        let zone = self.zones.get_mut(zone_id)?;
        let old_value = zone.get(attribute);
        if old_value == value || !zone.set(attribute, value.clone(), timestamp) {
            return None;
        }
        Some(ZoneChange {
            zone_id: zone_id.to_string(),
            attribute,
            old_value,
            new_value: value,
        })
    }

    /// Mark a zone disconnected. The record is kept so the platform can show
    /// it as unavailable.
    pub fn remove_zone(&mut self, zone_id: &str, timestamp: Instant) -> Option<ZoneChange> {
        self.apply_local(
            zone_id,
            Attribute::Connected,
            Some(AttributeValue::Flag(false)),
            timestamp,
        )
    }

    /// Drop every zone (discovery reset). Returns the removed ids.
    pub fn reset(&mut self) -> Vec<ZoneId> {
        let ids = self.zones.keys().cloned().collect();
        self.zones.clear();
        ids
    }

    /// Flag zones with no update for longer than `window`. Each zone is
    /// reported once until it receives a fresh update.
    pub fn mark_stale(&mut self, window: Duration, now: Instant) -> Vec<ZoneId> {
        let mut newly_stale = Vec::new();
        for zone in self.zones.values_mut() {
            if !zone.stale && now.saturating_duration_since(zone.last_updated) > window {
                zone.stale = true;
                newly_stale.push(zone.zone_id.clone());
            }
        }
        newly_stale
    }
}
