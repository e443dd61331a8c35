use crate::error::{BridgeError, Result};
use crate::types::{Attribute, AttributeValue, VolumeLevel, ZoneId};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};

/// A command requested by the platform
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    SetVolume(VolumeLevel),
    SetMute(bool),
    ToggleMute,
    SetSource(String),
}

impl CommandKind {
    pub fn attribute(&self) -> Attribute {
        match self {
            CommandKind::SetVolume(_) => Attribute::Volume,
            CommandKind::SetMute(_) | CommandKind::ToggleMute => Attribute::Mute,
            CommandKind::SetSource(_) => Attribute::Source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandIntent {
    pub zone_id: ZoneId,
    pub kind: CommandKind,
}

/// Requests the engine accepts from outside its task
#[derive(Debug)]
pub(crate) enum Control {
    Command {
        intent: CommandIntent,
        reply: oneshot::Sender<Result<()>>,
    },
    RetireZone(ZoneId),
    ResetDiscovery,
}

/// Issues volume, mute and source commands to zones.
///
/// Each call is validated against the authoritative store before anything is
/// published: unknown or unavailable zones fail synchronously. A timeout of an
/// accepted command is reported later as
/// [`BridgeEvent::CommandTimedOut`](crate::BridgeEvent).
#[derive(Clone)]
pub struct CommandDispatcher {
    control_tx: mpsc::UnboundedSender<Control>,
}

impl CommandDispatcher {
    pub(crate) fn new(control_tx: mpsc::UnboundedSender<Control>) -> Self {
        Self { control_tx }
    }

    /// Set a zone's volume
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use ampbridge_mqtt::{AmpBridge, BridgeConfig};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let bridge = AmpBridge::start(BridgeConfig::new("192.168.1.233", 1883)).await?;
    /// bridge.dispatcher().set_volume("1", 40).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn set_volume(&self, zone_id: impl Into<ZoneId>, level: VolumeLevel) -> Result<()> {
        self.send(zone_id.into(), CommandKind::SetVolume(level)).await
    }

    pub async fn set_mute(&self, zone_id: impl Into<ZoneId>, mute: bool) -> Result<()> {
        self.send(zone_id.into(), CommandKind::SetMute(mute)).await
    }

    /// Invert the zone's current mute state (unknown counts as unmuted)
    pub async fn toggle_mute(&self, zone_id: impl Into<ZoneId>) -> Result<()> {
        self.send(zone_id.into(), CommandKind::ToggleMute).await
    }

    /// Select an input by display name, or by amplifier name (`Source 3`, `Off`)
    pub async fn set_source(
        &self,
        zone_id: impl Into<ZoneId>,
        source: impl Into<String>,
    ) -> Result<()> {
        self.send(zone_id.into(), CommandKind::SetSource(source.into())).await
    }

    async fn send(&self, zone_id: ZoneId, kind: CommandKind) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.control_tx
            .send(Control::Command {
                intent: CommandIntent { zone_id, kind },
                reply,
            })
            .map_err(|_| BridgeError::EngineStopped)?;
        rx.await.map_err(|_| BridgeError::EngineStopped)?
    }
}

/// Optimistic command awaiting its state echo
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub zone_id: ZoneId,
    pub attribute: Attribute,
    pub intended_value: AttributeValue,
    pub issued_at: Instant,
    /// Last value confirmed by the amplifier; restored on timeout
    pub confirmed: Option<AttributeValue>,
}

type PendingKey = (ZoneId, Attribute);

/// How an inbound state value relates to a pending command
#[derive(Debug, Clone, PartialEq)]
pub enum EchoOutcome {
    NoPending,
    Confirmed(PendingCommand),
    /// Different value; it becomes the new revert target
    Diverged,
}

/// Pending commands keyed by `(zone, attribute)`, each with a timeout.
///
/// A second command on the same field replaces the intent and restarts the
/// timer but keeps the originally confirmed value.
pub(crate) struct PendingCommands {
    timeout: Duration,
    entries: HashMap<PendingKey, (PendingCommand, delay_queue::Key)>,
    timers: DelayQueue<PendingKey>,
}

impl PendingCommands {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
            timers: DelayQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, zone_id: &str, attribute: Attribute) -> Option<&PendingCommand> {
        self.entries
            .get(&(zone_id.to_string(), attribute))
            .map(|(pending, _)| pending)
    }

    pub fn issue(
        &mut self,
        zone_id: &str,
        attribute: Attribute,
        intended_value: AttributeValue,
        current: Option<AttributeValue>,
        now: Instant,
    ) {
        let key = (zone_id.to_string(), attribute);
        let confirmed = match self.entries.remove(&key) {
            Some((previous, timer)) => {
                self.timers.remove(&timer);
                previous.confirmed
            }
            None => current,
        };
        let timer = self.timers.insert_at(key.clone(), now + self.timeout);
        let pending = PendingCommand {
            zone_id: zone_id.to_string(),
            attribute,
            intended_value,
            issued_at: now,
            confirmed,
        };
        self.entries.insert(key, (pending, timer));
    }

    /// Reconcile an authoritative value with the pending command, if any
    pub fn observe_echo(
        &mut self,
        zone_id: &str,
        attribute: Attribute,
        value: &AttributeValue,
    ) -> EchoOutcome {
        let key = (zone_id.to_string(), attribute);
        let Some((pending, _)) = self.entries.get_mut(&key) else {
            return EchoOutcome::NoPending;
        };
        if &pending.intended_value != value {
            pending.confirmed = Some(value.clone());
            return EchoOutcome::Diverged;
        }
        match self.entries.remove(&key) {
            Some((pending, timer)) => {
                self.timers.remove(&timer);
                EchoOutcome::Confirmed(pending)
            }
            None => EchoOutcome::NoPending,
        }
    }

    /// Wait for the next expired command. Pending forever while empty.
    pub async fn next_expired(&mut self) -> PendingCommand {
        loop {
            if self.timers.is_empty() {
                std::future::pending::<()>().await;
            }
            if let Some(expired) = self.timers.next().await {
                if let Some((pending, _)) = self.entries.remove(expired.get_ref()) {
                    return pending;
                }
            }
        }
    }

    /// Drop everything for one zone
    pub fn discard_zone(&mut self, zone_id: &str) {
        let keys: Vec<PendingKey> = self
            .entries
            .keys()
            .filter(|(z, _)| z == zone_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some((_, timer)) = self.entries.remove(&key) {
                self.timers.remove(&timer);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(v: u8) -> AttributeValue {
        AttributeValue::Level(v)
    }

    #[tokio::test(start_paused = true)]
    async fn matching_echo_confirms_and_cancels_timer() {
        let mut pending = PendingCommands::new(Duration::from_secs(5));
        pending.issue("1", Attribute::Volume, level(40), Some(level(10)), Instant::now());
        assert_eq!(pending.len(), 1);

        let outcome = pending.observe_echo("1", Attribute::Volume, &level(40));
        assert!(matches!(outcome, EchoOutcome::Confirmed(ref p) if p.intended_value == level(40)));
        assert!(pending.is_empty());

        let waited = tokio::time::timeout(Duration::from_secs(10), pending.next_expired()).await;
        assert!(waited.is_err(), "no timer should fire after confirmation");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_expires_after_timeout() {
        let mut pending = PendingCommands::new(Duration::from_secs(5));
        let start = Instant::now();
        pending.issue(
            "1",
            Attribute::Mute,
            AttributeValue::Flag(true),
            Some(AttributeValue::Flag(false)),
            start,
        );

        let expired = pending.next_expired().await;
        assert_eq!(expired.confirmed, Some(AttributeValue::Flag(false)));
        assert!(Instant::now() >= start + Duration::from_secs(5));
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn divergent_echo_becomes_revert_target() {
        let mut pending = PendingCommands::new(Duration::from_secs(5));
        pending.issue("1", Attribute::Volume, level(40), Some(level(10)), Instant::now());
        assert_eq!(pending.observe_echo("1", Attribute::Volume, &level(25)), EchoOutcome::Diverged);
        assert_eq!(pending.get("1", Attribute::Volume).unwrap().confirmed, Some(level(25)));
        assert_eq!(
            pending.observe_echo("2", Attribute::Volume, &level(25)),
            EchoOutcome::NoPending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reissue_keeps_original_confirmed_value() {
        let mut pending = PendingCommands::new(Duration::from_secs(5));
        let start = Instant::now();
        pending.issue("1", Attribute::Volume, level(40), Some(level(10)), start);
        let reissued = start + Duration::from_secs(3);
        pending.issue("1", Attribute::Volume, level(50), Some(level(40)), reissued);
        assert_eq!(pending.len(), 1);

        let expired = pending.next_expired().await;
        assert_eq!(expired.intended_value, level(50));
        assert_eq!(expired.confirmed, Some(level(10)));
        assert!(Instant::now() >= start + Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn discard_zone_only_touches_that_zone() {
        let mut pending = PendingCommands::new(Duration::from_secs(5));
        let now = Instant::now();
        pending.issue("1", Attribute::Volume, level(40), None, now);
        pending.issue("1", Attribute::Mute, AttributeValue::Flag(true), None, now);
        pending.issue("2", Attribute::Volume, level(40), None, now);
        pending.discard_zone("1");
        assert_eq!(pending.len(), 1);
        assert!(pending.get("2", Attribute::Volume).is_some());
    }

    #[test]
    fn command_kinds_map_to_attributes() {
        assert_eq!(CommandKind::ToggleMute.attribute(), Attribute::Mute);
        assert_eq!(CommandKind::SetSource("TV".into()).attribute(), Attribute::Source);
        assert_eq!(CommandKind::SetVolume(3).attribute(), Attribute::Volume);
    }
}
