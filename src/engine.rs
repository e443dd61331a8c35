use crate::config::BridgeConfig;
use crate::connection::OutboundMessage;
use crate::discovery::{DiscoveryAction, DiscoveryCoordinator};
use crate::dispatcher::{
    CommandIntent, CommandKind, Control, EchoOutcome, PendingCommand, PendingCommands,
};
use crate::error::{BridgeError, CommandTimeout, Result};
use crate::protocol::{self, SourceMap, TopicSchema};
use crate::router::{InboundMessage, Route, RoutedUpdate, RouterStats, TopicRouter};
use crate::store::{UpdateOutcome, ZoneChange, ZoneStore};
use crate::subscription::BridgeEvent;
use crate::types::{Attribute, AttributeValue, ConnectionState, VolumeLevel, ZoneSnapshot};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Channels the rest of the crate uses to talk to a running engine
pub(crate) struct EngineHandle {
    pub control_tx: mpsc::UnboundedSender<Control>,
    pub events_tx: broadcast::Sender<BridgeEvent>,
    pub snapshot_rx: watch::Receiver<ZoneSnapshot>,
    pub stats: Arc<RouterStats>,
}

/// Single writer for all zone state.
///
/// Inbound broker messages, command intents and timers are all handled on
/// this one task, so updates to a zone are applied strictly in arrival order
/// and readers only ever see whole snapshots. Nothing here awaits network
/// I/O: publishes go to the connection manager's writer.
pub(crate) struct Engine {
    router: TopicRouter,
    schema: TopicSchema,
    sources: SourceMap,
    volume_range: RangeInclusive<VolumeLevel>,
    liveness_check: Duration,
    store: ZoneStore,
    discovery: DiscoveryCoordinator,
    pending: PendingCommands,
    connection_rx: watch::Receiver<ConnectionState>,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    events_tx: broadcast::Sender<BridgeEvent>,
    snapshot_tx: watch::Sender<ZoneSnapshot>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        config: &BridgeConfig,
        connection_rx: watch::Receiver<ConnectionState>,
        inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
        outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
        cancel: CancellationToken,
    ) -> (Self, EngineHandle) {
        let schema = TopicSchema::new(config.base_topic.clone());
        let sources = SourceMap::new(config.sources.clone());
        let volume_range = config.volume_min..=config.volume_max;
        let router = TopicRouter::new(schema.clone(), volume_range.clone(), sources.clone());
        let stats = router.stats();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.event_buffer);
        let store = ZoneStore::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(store.snapshot());

        let engine = Self {
            router,
            schema,
            sources,
            volume_range,
            liveness_check: config.liveness_check(),
            store,
            discovery: DiscoveryCoordinator::new(config.debounce(), config.liveness_window()),
            pending: PendingCommands::new(config.command_timeout()),
            connection_rx,
            inbound_rx,
            control_rx,
            outbound_tx,
            events_tx: events_tx.clone(),
            snapshot_tx,
            cancel,
        };
        let handle = EngineHandle {
            control_tx,
            events_tx,
            snapshot_rx,
            stats,
        };
        (engine, handle)
    }

    pub async fn run(mut self) {
        if *self.connection_rx.borrow_and_update() == ConnectionState::Connected {
            self.discovery.on_connected(Instant::now());
        }

        let mut liveness = interval_at(Instant::now() + self.liveness_check, self.liveness_check);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connection_open = true;

        loop {
            let window_open = self.discovery.window_open();
            let window_deadline = self.discovery.window_deadline().unwrap_or_else(Instant::now);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Engine stopping");
                    break;
                }
                msg = self.inbound_rx.recv() => match msg {
                    Some(msg) => self.handle_inbound(msg),
                    None => {
                        tracing::debug!("Inbound channel closed");
                        break;
                    }
                },
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                changed = self.connection_rx.changed(), if connection_open => {
                    if changed.is_ok() {
                        let state = *self.connection_rx.borrow_and_update();
                        self.handle_connection(state);
                    } else {
                        connection_open = false;
                    }
                }
                expired = self.pending.next_expired() => self.handle_timeout(expired),
                _ = sleep_until(window_deadline), if window_open => {
                    self.close_discovery_window();
                }
                _ = liveness.tick() => self.sweep_liveness(),
            }
        }

        // In-flight confirmations are discarded, not awaited
        if !self.pending.is_empty() {
            tracing::debug!("Discarding {} pending command(s)", self.pending.len());
        }
        self.pending.clear();
    }

    fn handle_connection(&mut self, state: ConnectionState) {
        if state == ConnectionState::Connected {
            self.discovery.on_connected(Instant::now());
        }
        self.emit(BridgeEvent::ConnectionChanged(state));
    }

    fn handle_inbound(&mut self, msg: InboundMessage) {
        match self.router.route(&msg) {
            Route::Update(update) => self.apply(update),
            Route::Dropped => {}
            Route::Rejected(err) => {
                tracing::warn!(topic = %msg.topic, "{}", err);
            }
        }
    }

    fn apply(&mut self, update: RoutedUpdate) {
        let RoutedUpdate {
            zone_id,
            attribute,
            value,
            timestamp,
        } = update;

        let outcome = self.store.apply_update(&zone_id, attribute, value.clone(), timestamp);
        let UpdateOutcome::Applied { created, revived, change } = outcome else {
            return;
        };

        match self.pending.observe_echo(&zone_id, attribute, &value) {
            EchoOutcome::Confirmed(pending) => {
                tracing::debug!(
                    zone_id = %zone_id,
                    "Command {}={} confirmed after {:?}",
                    attribute,
                    pending.intended_value,
                    pending.issued_at.elapsed()
                );
            }
            EchoOutcome::Diverged => {
                tracing::debug!(
                    zone_id = %zone_id,
                    "Echo {}={} differs from pending command",
                    attribute,
                    value
                );
            }
            EchoOutcome::NoPending => {}
        }

        self.publish_snapshot();

        if created {
            match self.discovery.observe(&zone_id) {
                DiscoveryAction::Buffered => {
                    tracing::debug!(zone_id = %zone_id, "Zone buffered for discovery batch");
                }
                DiscoveryAction::Announce => {
                    if let Some(zone) = self.store.get(&zone_id) {
                        tracing::info!(zone_id = %zone_id, "Discovered zone");
                        self.emit(BridgeEvent::ZoneDiscovered(zone.clone()));
                    }
                }
                DiscoveryAction::Known => {}
            }
            return;
        }

        if self.discovery.is_buffered(&zone_id) {
            return;
        }
        if revived {
            tracing::info!(zone_id = %zone_id, "Zone available again");
            self.emit(BridgeEvent::ZoneAvailable(zone_id.clone()));
        }
        if let Some(change) = change {
            self.emit_change(change);
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Command { intent, reply } => {
                let result = self.execute(intent);
                let _ = reply.send(result);
            }
            Control::RetireZone(zone_id) => {
                self.pending.discard_zone(&zone_id);
                if let Some(change) = self.store.remove_zone(&zone_id, Instant::now()) {
                    tracing::info!(zone_id = %zone_id, "Zone retired");
                    self.publish_snapshot();
                    self.emit_change(change);
                }
            }
            Control::ResetDiscovery => {
                let removed = self.store.reset();
                self.discovery.reset();
                self.pending.clear();
                tracing::info!("Discovery reset, removed {} zone(s)", removed.len());
                self.publish_snapshot();
                for zone_id in removed {
                    self.emit(BridgeEvent::ZoneRemoved(zone_id));
                }
            }
        }
    }

    /// Validate, publish, record and optimistically apply one command
    fn execute(&mut self, intent: CommandIntent) -> Result<()> {
        let CommandIntent { zone_id, kind } = intent;
        let attribute = kind.attribute();

        let zone = self
            .store
            .get(&zone_id)
            .ok_or_else(|| BridgeError::UnknownZone(zone_id.clone()))?;
        if !zone.is_available() {
            return Err(BridgeError::ZoneUnavailable(zone_id));
        }

        let (intended, wire_payload) = match kind {
            CommandKind::SetVolume(level) => {
                let clamped = level.clamp(*self.volume_range.start(), *self.volume_range.end());
                if clamped != level {
                    tracing::warn!(zone_id = %zone_id, "Volume {} clamped to {}", level, clamped);
                }
                let value = AttributeValue::Level(clamped);
                let payload = protocol::encode_command(&value);
                (value, payload)
            }
            CommandKind::SetMute(mute) => {
                let value = AttributeValue::Flag(mute);
                let payload = protocol::encode_command(&value);
                (value, payload)
            }
            CommandKind::ToggleMute => {
                let value = AttributeValue::Flag(!zone.mute.unwrap_or(false));
                let payload = protocol::encode_command(&value);
                (value, payload)
            }
            CommandKind::SetSource(name) => {
                let wire = self
                    .sources
                    .to_wire(&name)
                    .filter(|w| !w.is_empty())
                    .ok_or_else(|| BridgeError::UnknownSource {
                        zone_id: zone_id.clone(),
                        source_name: name.clone(),
                    })?;
                // Store the display form so the translated echo matches
                let value = AttributeValue::Text(self.sources.from_wire(&wire));
                (value, wire)
            }
        };

        let current = zone.get(attribute);
        let topic = self.schema.command_topic(&zone_id, attribute);
        tracing::info!(zone_id = %zone_id, "Publishing {} = {}", topic, wire_payload);
        self.outbound_tx
            .send(OutboundMessage {
                topic,
                payload: wire_payload,
                retain: false,
            })
            .map_err(|_| BridgeError::ChannelError("outbound channel closed".to_string()))?;

        let now = Instant::now();
        self.pending.issue(&zone_id, attribute, intended.clone(), current, now);
        if let Some(change) = self.store.apply_local(&zone_id, attribute, Some(intended), now) {
            self.publish_snapshot();
            self.emit_change(change);
        }
        Ok(())
    }

    fn handle_timeout(&mut self, expired: PendingCommand) {
        let still_optimistic = self.store.get(&expired.zone_id).is_some_and(|zone| {
            zone.get(expired.attribute).as_ref() == Some(&expired.intended_value)
        });

        tracing::warn!(
            zone_id = %expired.zone_id,
            "No echo for {}={} within timeout",
            expired.attribute,
            expired.intended_value
        );

        if still_optimistic {
            // Stamped at issue time: an echo received after the command but
            // dequeued after the deadline must still win
            let change = self.store.apply_local(
                &expired.zone_id,
                expired.attribute,
                expired.confirmed.clone(),
                expired.issued_at,
            );
            if let Some(change) = change {
                self.publish_snapshot();
                self.emit_change(change);
            }
        }

        self.emit(BridgeEvent::CommandTimedOut(CommandTimeout {
            zone_id: expired.zone_id,
            attribute: expired.attribute,
            intended: expired.intended_value,
            reverted_to: expired.confirmed,
        }));
    }

    fn close_discovery_window(&mut self) {
        let batch = self.discovery.close_window();
        if batch.is_empty() {
            return;
        }
        let zones: Vec<_> = batch.iter().filter_map(|id| self.store.get(id).cloned()).collect();
        tracing::info!("Discovered {} zone(s) during initial window", zones.len());
        self.emit(BridgeEvent::ZonesDiscovered(zones));
    }

    fn sweep_liveness(&mut self) {
        let stale = self.discovery.sweep(&mut self.store, Instant::now());
        if stale.is_empty() {
            return;
        }
        self.publish_snapshot();
        for zone_id in stale {
            tracing::warn!(zone_id = %zone_id, "Zone silent for longer than the liveness window");
            self.emit(BridgeEvent::ZoneUnavailable(zone_id));
        }
    }

    fn emit_change(&self, change: ZoneChange) {
        tracing::debug!(
            zone_id = %change.zone_id,
            "{}: {:?} -> {:?}",
            change.attribute,
            change.old_value,
            change.new_value
        );
        self.emit(BridgeEvent::ZoneUpdated {
            zone_id: change.zone_id,
            attribute: change.attribute,
            old: change.old_value,
            new: change.new_value,
        });
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.store.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CommandDispatcher;
    use crate::subscription::EventReceiver;

    struct Harness {
        inbound_tx: mpsc::UnboundedSender<InboundMessage>,
        outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
        connection_tx: watch::Sender<ConnectionState>,
        dispatcher: CommandDispatcher,
        events: EventReceiver,
        snapshot_rx: watch::Receiver<ZoneSnapshot>,
        control_tx: mpsc::UnboundedSender<Control>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn start(config: BridgeConfig) -> Self {
            let (connection_tx, connection_rx) = watch::channel(ConnectionState::Connected);
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let (engine, handle) =
                Engine::new(&config, connection_rx, inbound_rx, outbound_tx, cancel.clone());
            let events = EventReceiver::new(handle.events_tx.subscribe());
            tokio::spawn(engine.run());
            Self {
                inbound_tx,
                outbound_rx,
                connection_tx,
                dispatcher: CommandDispatcher::new(handle.control_tx.clone()),
                events,
                snapshot_rx: handle.snapshot_rx,
                control_tx: handle.control_tx,
                cancel,
            }
        }

        fn send(&self, topic: &str, payload: &str) {
            self.inbound_tx
                .send(InboundMessage::new(format!("ampbridge/zones/{}", topic), payload))
                .unwrap();
        }

        async fn next_event(&mut self) -> BridgeEvent {
            tokio::time::timeout(Duration::from_secs(600), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed")
        }

        /// Let the engine drain its queues without moving the clock
        async fn settle(&self) {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        fn zone(&self, zone_id: &str) -> crate::types::Zone {
            self.snapshot_rx.borrow()[zone_id].clone()
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig::new("localhost", 1883).with_sources(["Echo", "Server", "TV"])
    }

    /// Bring zones online and get past the initial discovery window
    async fn with_zones(h: &mut Harness, ids: &[&str]) {
        for id in ids {
            h.send(&format!("{}/connected", id), "ON");
            h.send(&format!("{}/volume", id), "10");
            h.send(&format!("{}/mute", id), "OFF");
        }
        match h.next_event().await {
            BridgeEvent::ZonesDiscovered(zones) => assert_eq!(zones.len(), ids.len()),
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_batches_initial_zones_then_announces_individually() {
        let mut h = Harness::start(config());
        h.send("1/volume", "10");
        h.send("2/volume", "20");
        h.send("3/volume", "30");
        h.send("2/mute", "ON");

        let start = Instant::now();
        match h.next_event().await {
            BridgeEvent::ZonesDiscovered(zones) => {
                let ids: Vec<_> = zones.iter().map(|z| z.zone_id.as_str()).collect();
                assert_eq!(ids, vec!["1", "2", "3"]);
                assert_eq!(zones[1].mute, Some(true));
            }
            other => panic!("expected batch, got {:?}", other),
        }
        assert!(Instant::now() >= start + Duration::from_secs(2));

        h.send("4/volume", "40");
        match h.next_event().await {
            BridgeEvent::ZoneDiscovered(zone) => {
                assert_eq!(zone.zone_id, "4");
                assert_eq!(zone.volume, Some(40));
            }
            other => panic!("expected single discovery, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn updates_notify_only_on_change() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        h.send("1/volume", "10");
        h.send("1/volume", "25");
        h.send("1/volume", "25");
        h.send("1/mute", "true");

        match h.next_event().await {
            BridgeEvent::ZoneUpdated { zone_id, attribute, old, new } => {
                assert_eq!(zone_id, "1");
                assert_eq!(attribute, Attribute::Volume);
                assert_eq!(old, Some(AttributeValue::Level(10)));
                assert_eq!(new, Some(AttributeValue::Level(25)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match h.next_event().await {
            BridgeEvent::ZoneUpdated { attribute, new, .. } => {
                assert_eq!(attribute, Attribute::Mute);
                assert_eq!(new, Some(AttributeValue::Flag(true)));
            }
            other => panic!("unexpected {:?}", other),
        }
        h.settle().await;
        assert!(h.events.try_recv().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_does_not_affect_other_zones() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1", "2"]).await;

        h.send("1/mute", "sideways");
        h.send("2/volume", "55");

        match h.next_event().await {
            BridgeEvent::ZoneUpdated { zone_id, new, .. } => {
                assert_eq!(zone_id, "2");
                assert_eq!(new, Some(AttributeValue::Level(55)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.zone("1").mute, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_command_keeps_optimistic_value() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        h.dispatcher.set_volume("1", 40).await.unwrap();
        assert_eq!(h.zone("1").volume, Some(40));

        let published = h.outbound_rx.recv().await.unwrap();
        assert_eq!(
            published,
            OutboundMessage {
                topic: "ampbridge/zones/1/volume/set".to_string(),
                payload: "40".to_string(),
                retain: false,
            }
        );
        match h.next_event().await {
            BridgeEvent::ZoneUpdated { new, .. } => {
                assert_eq!(new, Some(AttributeValue::Level(40)))
            }
            other => panic!("unexpected {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.send("1/volume", "40");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.zone("1").volume, Some(40));
        while let Some(event) = h.events.try_recv().unwrap() {
            assert!(
                !matches!(event, BridgeEvent::CommandTimedOut(_) | BridgeEvent::ZoneUpdated { .. }),
                "unexpected {:?}",
                event
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_reverts_and_reports_timeout() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        let issued = Instant::now();
        h.dispatcher.set_volume("1", 40).await.unwrap();
        let _ = h.next_event().await;

        match h.next_event().await {
            BridgeEvent::ZoneUpdated { old, new, .. } => {
                assert_eq!(old, Some(AttributeValue::Level(40)));
                assert_eq!(new, Some(AttributeValue::Level(10)));
            }
            other => panic!("unexpected {:?}", other),
        }
        match h.next_event().await {
            BridgeEvent::CommandTimedOut(timeout) => {
                assert_eq!(timeout.zone_id, "1");
                assert_eq!(timeout.attribute, Attribute::Volume);
                assert_eq!(timeout.intended, AttributeValue::Level(40));
                assert_eq!(timeout.reverted_to, Some(AttributeValue::Level(10)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Instant::now() >= issued + Duration::from_secs(5));
        assert_eq!(h.zone("1").volume, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_to_unknown_or_unavailable_zones_fail_without_publishing() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        let err = h.dispatcher.set_mute("9", true).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownZone(id) if id == "9"));

        h.send("1/connected", "OFF");
        match h.next_event().await {
            BridgeEvent::ZoneUpdated { attribute, .. } => {
                assert_eq!(attribute, Attribute::Connected)
            }
            other => panic!("unexpected {:?}", other),
        }
        let err = h.dispatcher.set_volume("1", 50).await.unwrap_err();
        assert!(matches!(err, BridgeError::ZoneUnavailable(_)));

        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn source_commands_use_amplifier_names() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        h.dispatcher.set_source("1", "Server").await.unwrap();
        let published = h.outbound_rx.recv().await.unwrap();
        assert_eq!(published.topic, "ampbridge/zones/1/source/set");
        assert_eq!(published.payload, "Source 2");
        assert_eq!(h.zone("1").source.as_deref(), Some("Server"));

        // The echo arrives in amplifier form and confirms the display name
        h.send("1/source", "Source 2");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.zone("1").source.as_deref(), Some("Server"));

        let err = h.dispatcher.set_source("1", "Phono").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownSource { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_mute_inverts_current_value() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        h.dispatcher.toggle_mute("1").await.unwrap();
        let published = h.outbound_rx.recv().await.unwrap();
        assert_eq!(published.topic, "ampbridge/zones/1/mute/set");
        assert_eq!(published.payload, "ON");
        assert_eq!(h.zone("1").mute, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_zone_becomes_unavailable_once_and_is_kept() {
        let mut config = config();
        config.liveness_window_secs = 60;
        config.liveness_check_secs = 10;
        let mut h = Harness::start(config);
        with_zones(&mut h, &["1"]).await;

        match h.next_event().await {
            BridgeEvent::ZoneUnavailable(zone_id) => assert_eq!(zone_id, "1"),
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.events.try_recv().unwrap().is_none());
        assert!(h.zone("1").stale);

        h.send("1/volume", "10");
        match h.next_event().await {
            BridgeEvent::ZoneAvailable(zone_id) => assert_eq!(zone_id, "1"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!h.zone("1").stale);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_do_not_keep_a_silent_zone_alive() {
        let mut config = config();
        config.liveness_window_secs = 60;
        config.liveness_check_secs = 10;
        let mut h = Harness::start(config);
        with_zones(&mut h, &["1"]).await;

        let mut accepted = 0;
        for step in 0..10u8 {
            if h.dispatcher.set_volume("1", 40 + step).await.is_ok() {
                accepted += 1;
            }
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        assert!(accepted >= 2);

        let mut unavailable = 0;
        while let Some(event) = h.events.try_recv().unwrap() {
            if let BridgeEvent::ZoneUnavailable(zone_id) = event {
                assert_eq!(zone_id, "1");
                unavailable += 1;
            }
        }
        assert_eq!(unavailable, 1);
        assert!(h.zone("1").stale);
    }

    #[tokio::test(start_paused = true)]
    async fn echo_received_before_deadline_survives_revert() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        let issued = Instant::now();
        h.dispatcher.set_volume("1", 40).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert_eq!(h.zone("1").volume, Some(10));

        // Stamped by the event loop before the deadline, dequeued after it
        h.inbound_tx
            .send(InboundMessage {
                topic: "ampbridge/zones/1/volume".to_string(),
                payload: b"40".to_vec(),
                received_at: issued + Duration::from_millis(4_999),
            })
            .unwrap();

        let mut saw_timeout = false;
        loop {
            match h.next_event().await {
                BridgeEvent::CommandTimedOut(_) => saw_timeout = true,
                BridgeEvent::ZoneUpdated { new, .. } if saw_timeout => {
                    assert_eq!(new, Some(AttributeValue::Level(40)));
                    break;
                }
                BridgeEvent::ZoneUpdated { .. } => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(h.zone("1").volume, Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reopens_window_without_rediscovering_known_zones() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        h.connection_tx.send(ConnectionState::Reconnecting).unwrap();
        match h.next_event().await {
            BridgeEvent::ConnectionChanged(state) => {
                assert_eq!(state, ConnectionState::Reconnecting)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.zone("1").volume, Some(10));

        h.connection_tx.send(ConnectionState::Connected).unwrap();
        let _ = h.next_event().await;

        // Retained replay of known zone plus one new zone
        h.send("1/volume", "10");
        h.send("5/volume", "50");
        match h.next_event().await {
            BridgeEvent::ZonesDiscovered(zones) => {
                assert_eq!(zones.len(), 1);
                assert_eq!(zones[0].zone_id, "5");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retire_and_reset_discovery() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1", "2"]).await;

        h.control_tx.send(Control::RetireZone("1".to_string())).unwrap();
        match h.next_event().await {
            BridgeEvent::ZoneUpdated { zone_id, attribute, new, .. } => {
                assert_eq!(zone_id, "1");
                assert_eq!(attribute, Attribute::Connected);
                assert_eq!(new, Some(AttributeValue::Flag(false)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.snapshot_rx.borrow().len(), 2);

        h.control_tx.send(Control::ResetDiscovery).unwrap();
        let mut removed = Vec::new();
        for _ in 0..2 {
            match h.next_event().await {
                BridgeEvent::ZoneRemoved(zone_id) => removed.push(zone_id),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(removed, vec!["1", "2"]);
        assert!(h.snapshot_rx.borrow().is_empty());

        h.send("1/volume", "10");
        match h.next_event().await {
            BridgeEvent::ZoneDiscovered(zone) => assert_eq!(zone.zone_id, "1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_pending_commands() {
        let mut h = Harness::start(config());
        with_zones(&mut h, &["1"]).await;

        h.dispatcher.set_volume("1", 70).await.unwrap();
        h.cancel.cancel();
        h.settle().await;

        let err = h.dispatcher.set_volume("1", 71).await.unwrap_err();
        assert!(matches!(err, BridgeError::EngineStopped));
    }
}
