//! Rust library bridging multi-zone amplifiers on MQTT to home-automation
//! platforms
//!
//! The amplifier publishes each zone's state on retained topics below a base
//! topic and accepts commands on `.../set` topics. This library keeps an
//! authoritative zone store fed by those messages and exposes it to a
//! platform adapter. It supports:
//!
//! - Zone discovery with a debounce window after every connect
//! - Volume, mute, mute toggle and source commands with optimistic updates
//! - Revert and timeout reporting when the amplifier never confirms
//! - Liveness tracking of quiet zones
//! - Reconnects with jittered exponential backoff and resubscription
//! - Bridge availability via a retained `online`/`offline` topic and last will
//!
//! # Quick Start
//!
//! ```no_run
//! use ampbridge_mqtt::{AmpBridge, BridgeConfig, BridgeEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = AmpBridge::start(BridgeConfig::new("192.168.1.233", 1883)).await?;
//!     let mut events = bridge.subscribe_events();
//!
//!     // The first batch arrives once the discovery window closes
//!     while let Ok(event) = events.recv().await {
//!         if let BridgeEvent::ZonesDiscovered(zones) = event {
//!             for zone in &zones {
//!                 println!("Found zone {} ({})", zone.zone_id, zone.display_name());
//!             }
//!             if let Some(zone) = zones.first() {
//!                 bridge.dispatcher().set_volume(zone.zone_id.clone(), 30).await?;
//!             }
//!             break;
//!         }
//!     }
//!
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: `AmpBridge`, the facade that wires everything together
//! - **Connection**: MQTT session, reconnect backoff, availability messages
//! - **Router**: topic parsing and payload decoding
//! - **Engine**: the single task that owns and mutates the zone store
//! - **Discovery**: debounce window and liveness sweep
//! - **Dispatcher**: command validation and pending-command tracking
//! - **Subscription**: events and the `ZoneListener` callback trait
//! - **Protocol**: topic layout and payload codecs

mod client;
mod config;
mod connection;
mod discovery;
mod dispatcher;
mod engine;
mod error;
mod protocol;
mod router;
mod store;
mod subscription;
mod types;

// Public exports
pub use client::AmpBridge;
pub use config::BridgeConfig;
pub use connection::{Backoff, ConnectionManager, OutboundMessage, SubscriptionRegistry};
pub use discovery::{DiscoveryAction, DiscoveryCoordinator};
pub use dispatcher::{CommandDispatcher, CommandIntent, CommandKind, EchoOutcome, PendingCommand};
pub use error::{BridgeError, CommandTimeout, Result};
pub use protocol::{SourceMap, TopicKind, TopicSchema, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
pub use router::{InboundMessage, Route, RoutedUpdate, RouterStats, TopicRouter};
pub use store::{UpdateOutcome, ZoneChange, ZoneStore};
pub use subscription::{BridgeEvent, EventReceiver, ZoneListener};
pub use types::{
    Attribute, AttributeValue, ConnectionState, VolumeLevel, Zone, ZoneId, ZoneSnapshot,
};
