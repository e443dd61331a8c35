use crate::config::BridgeConfig;
use crate::connection::ConnectionManager;
use crate::discovery::DiscoveryCoordinator;
use crate::dispatcher::{CommandDispatcher, Control};
use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::protocol::TopicSchema;
use crate::router::RouterStats;
use crate::subscription::{BridgeEvent, EventReceiver};
use crate::types::{ConnectionState, Zone, ZoneId, ZoneSnapshot};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bridge between a home-automation platform and a multi-zone amplifier
/// exposed over MQTT.
///
/// `AmpBridge` owns the broker connection and the engine task that keeps the
/// zone store. Reads are served from the latest snapshot; commands go through
/// the [`CommandDispatcher`]; changes arrive as [`BridgeEvent`]s.
pub struct AmpBridge {
    connection: ConnectionManager,
    dispatcher: CommandDispatcher,
    control_tx: mpsc::UnboundedSender<Control>,
    events_tx: broadcast::Sender<BridgeEvent>,
    snapshot_rx: watch::Receiver<ZoneSnapshot>,
    stats: Arc<RouterStats>,
    cancel: CancellationToken,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl AmpBridge {
    /// Connect to the broker, start the engine and subscribe to zone state.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ampbridge_mqtt::{AmpBridge, BridgeConfig, BridgeEvent};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = BridgeConfig::new("192.168.1.233", 1883)
    ///         .with_sources(["Echo", "Server", "TV"]);
    ///     let bridge = AmpBridge::start(config).await?;
    ///
    ///     let mut events = bridge.subscribe_events();
    ///     if let BridgeEvent::ZonesDiscovered(zones) = events.recv().await? {
    ///         println!("Found {} zones", zones.len());
    ///     }
    ///
    ///     bridge.shutdown().await;
    ///     Ok(())
    /// }
    /// ```
    pub async fn start(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::connect(&config, inbound_tx).await?;

        let cancel = CancellationToken::new();
        let (engine, handle) = Engine::new(
            &config,
            connection.state(),
            inbound_rx,
            connection.outbound(),
            cancel.clone(),
        );
        let engine_handle = tokio::spawn(engine.run());

        let schema = TopicSchema::new(config.base_topic.clone());
        for pattern in DiscoveryCoordinator::subscriptions(&schema) {
            if let Err(e) = connection.subscribe(&pattern).await {
                cancel.cancel();
                connection.shutdown().await;
                return Err(e);
            }
        }

        Ok(Self {
            connection,
            dispatcher: CommandDispatcher::new(handle.control_tx.clone()),
            control_tx: handle.control_tx,
            events_tx: handle.events_tx,
            snapshot_rx: handle.snapshot_rx,
            stats: handle.stats,
            cancel,
            engine: Mutex::new(Some(engine_handle)),
        })
    }

    /// Command dispatcher for volume, mute and source changes
    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    /// Subscribe to bridge events
    ///
    /// Only events emitted after this call are received. Pair with
    /// [`zones`](Self::zones) to get the current picture first.
    pub fn subscribe_events(&self) -> EventReceiver {
        EventReceiver::new(self.events_tx.subscribe())
    }

    /// All known zones, ordered by id
    pub fn zones(&self) -> Vec<Zone> {
        self.snapshot_rx.borrow().values().cloned().collect()
    }

    pub fn zone(&self, zone_id: &str) -> Option<Zone> {
        self.snapshot_rx.borrow().get(zone_id).cloned()
    }

    /// Whole store snapshot, cheap to clone and never half-updated
    pub fn snapshot(&self) -> ZoneSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.state().borrow()
    }

    /// Watch connection state transitions
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state()
    }

    /// Message routing counters
    pub fn router_stats(&self) -> Arc<RouterStats> {
        self.stats.clone()
    }

    /// Topic filters held across reconnects
    pub fn subscriptions(&self) -> Vec<String> {
        self.connection.subscriptions()
    }

    /// Mark a zone disconnected. The record stays in the store.
    pub fn retire_zone(&self, zone_id: impl Into<ZoneId>) -> Result<()> {
        self.control_tx
            .send(Control::RetireZone(zone_id.into()))
            .map_err(|_| BridgeError::EngineStopped)
    }

    /// Forget every zone and rediscover from scratch
    pub fn reset_discovery(&self) -> Result<()> {
        self.control_tx
            .send(Control::ResetDiscovery)
            .map_err(|_| BridgeError::EngineStopped)
    }

    /// Stop the engine, publish `offline` and disconnect.
    ///
    /// Pending command confirmations are discarded. Safe to call more than
    /// once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(engine) = engine {
            if let Err(e) = engine.await {
                tracing::warn!("Engine task ended abnormally: {}", e);
            }
        }
        self.connection.shutdown().await;
    }
}

impl Drop for AmpBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
