use crate::error::{BridgeError, CommandTimeout, Result};
use crate::types::{Attribute, AttributeValue, ConnectionState, Zone, ZoneId};
use tokio::sync::broadcast;

/// Notification for the platform adapter
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Zones found during the post-connect debounce window, in one batch
    ZonesDiscovered(Vec<Zone>),

    /// A zone first seen after the debounce window
    ZoneDiscovered(Zone),

    /// A field changed value
    ZoneUpdated {
        zone_id: ZoneId,
        attribute: Attribute,
        old: Option<AttributeValue>,
        new: Option<AttributeValue>,
    },

    /// No update within the liveness window; the zone is kept
    ZoneUnavailable(ZoneId),

    /// A stale zone received a fresh update
    ZoneAvailable(ZoneId),

    /// Zone dropped by a discovery reset
    ZoneRemoved(ZoneId),

    /// Optimistic value reverted because no echo confirmed the command
    CommandTimedOut(CommandTimeout),

    /// Broker session state changed
    ConnectionChanged(ConnectionState),
}

/// Receiver for bridge events
pub struct EventReceiver {
    rx: broadcast::Receiver<BridgeEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<BridgeEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with `EngineStopped` once the bridge has shut down.
    pub async fn recv(&mut self) -> Result<BridgeEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => BridgeError::EngineStopped,
            broadcast::error::RecvError::Lagged(n) => {
                BridgeError::ChannelError(format!("Lagged by {} events", n))
            }
        })
    }

    /// Try to receive an event without waiting
    ///
    /// Returns `None` if no event is queued.
    pub fn try_recv(&mut self) -> Result<Option<BridgeEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(BridgeError::EngineStopped),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(BridgeError::ChannelError(format!("Lagged by {} events", n)))
            }
        }
    }

    /// Forward events to a listener until the bridge stops.
    ///
    /// Lagging is logged and skipped; the listener should re-read
    /// [`AmpBridge::zones`](crate::AmpBridge::zones) if it cares about the gap.
    pub async fn dispatch_to<L: ZoneListener>(mut self, listener: &mut L) {
        loop {
            match self.recv().await {
                Ok(event) => deliver(listener, event),
                Err(BridgeError::ChannelError(reason)) => {
                    tracing::warn!("Listener fell behind: {}", reason);
                }
                Err(_) => break,
            }
        }
    }
}

/// Callbacks for a platform adapter. Every method defaults to a no-op.
pub trait ZoneListener {
    fn on_zone_discovered(&mut self, _zone: &Zone) {}

    /// Batched discovery; by default forwards each zone individually
    fn on_zones_discovered(&mut self, zones: &[Zone]) {
        for zone in zones {
            self.on_zone_discovered(zone);
        }
    }

    fn on_zone_updated(
        &mut self,
        _zone_id: &str,
        _attribute: Attribute,
        _value: Option<&AttributeValue>,
    ) {
    }

    fn on_zone_unavailable(&mut self, _zone_id: &str) {}

    fn on_zone_available(&mut self, _zone_id: &str) {}

    fn on_zone_removed(&mut self, _zone_id: &str) {}

    fn on_command_timeout(&mut self, _timeout: &CommandTimeout) {}

    fn on_bridge_offline(&mut self) {}

    fn on_bridge_online(&mut self) {}
}

pub(crate) fn deliver<L: ZoneListener + ?Sized>(listener: &mut L, event: BridgeEvent) {
    match event {
        BridgeEvent::ZonesDiscovered(zones) => listener.on_zones_discovered(&zones),
        BridgeEvent::ZoneDiscovered(zone) => listener.on_zone_discovered(&zone),
        BridgeEvent::ZoneUpdated {
            zone_id, attribute, new, ..
        } => listener.on_zone_updated(&zone_id, attribute, new.as_ref()),
        BridgeEvent::ZoneUnavailable(zone_id) => listener.on_zone_unavailable(&zone_id),
        BridgeEvent::ZoneAvailable(zone_id) => listener.on_zone_available(&zone_id),
        BridgeEvent::ZoneRemoved(zone_id) => listener.on_zone_removed(&zone_id),
        BridgeEvent::CommandTimedOut(timeout) => listener.on_command_timeout(&timeout),
        BridgeEvent::ConnectionChanged(ConnectionState::Connected) => listener.on_bridge_online(),
        BridgeEvent::ConnectionChanged(
            ConnectionState::Reconnecting | ConnectionState::Disconnected,
        ) => listener.on_bridge_offline(),
        BridgeEvent::ConnectionChanged(ConnectionState::Connecting) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        discovered: Vec<ZoneId>,
        updates: Vec<(ZoneId, Attribute)>,
        offline: usize,
        online: usize,
    }

    impl ZoneListener for Recorder {
        fn on_zone_discovered(&mut self, zone: &Zone) {
            self.discovered.push(zone.zone_id.clone());
        }

        fn on_zone_updated(
            &mut self,
            zone_id: &str,
            attribute: Attribute,
            _value: Option<&AttributeValue>,
        ) {
            self.updates.push((zone_id.to_string(), attribute));
        }

        fn on_bridge_offline(&mut self) {
            self.offline += 1;
        }

        fn on_bridge_online(&mut self) {
            self.online += 1;
        }
    }

    #[test]
    fn batch_defaults_to_individual_callbacks() {
        let now = Instant::now();
        let mut recorder = Recorder::default();
        deliver(
            &mut recorder,
            BridgeEvent::ZonesDiscovered(vec![Zone::new("1", now), Zone::new("2", now)]),
        );
        deliver(&mut recorder, BridgeEvent::ZoneDiscovered(Zone::new("3", now)));
        assert_eq!(recorder.discovered, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn dispatch_runs_until_sender_drops() {
        let (tx, rx) = broadcast::channel(8);
        let receiver = EventReceiver::new(rx);

        tx.send(BridgeEvent::ConnectionChanged(ConnectionState::Reconnecting)).unwrap();
        tx.send(BridgeEvent::ConnectionChanged(ConnectionState::Connected)).unwrap();
        tx.send(BridgeEvent::ZoneUpdated {
            zone_id: "1".into(),
            attribute: Attribute::Mute,
            old: None,
            new: Some(AttributeValue::Flag(true)),
        })
        .unwrap();
        drop(tx);

        let mut recorder = Recorder::default();
        receiver.dispatch_to(&mut recorder).await;
        assert_eq!(recorder.offline, 1);
        assert_eq!(recorder.online, 1);
        assert_eq!(recorder.updates, vec![("1".to_string(), Attribute::Mute)]);
    }

    #[tokio::test]
    async fn try_recv_reports_empty_then_closed() {
        let (tx, rx) = broadcast::channel(8);
        let mut receiver = EventReceiver::new(rx);
        assert!(receiver.try_recv().unwrap().is_none());
        drop(tx);
        assert!(matches!(receiver.try_recv(), Err(BridgeError::EngineStopped)));
    }
}
