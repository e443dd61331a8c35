//! Connect to a broker, print zone events and nudge the first zone's volume.
//!
//! ```text
//! cargo run --example bridge -- 192.168.1.233 1883
//! cargo run --example bridge -- --config bridge.json
//! RUST_LOG=ampbridge_mqtt=debug cargo run --example bridge
//! ```

use ampbridge_mqtt::{
    AmpBridge, Attribute, AttributeValue, BridgeConfig, CommandTimeout, Zone, ZoneListener,
};
use tracing_subscriber::EnvFilter;

struct Printer;

impl ZoneListener for Printer {
    fn on_zone_discovered(&mut self, zone: &Zone) {
        println!(
            "+ zone {} \"{}\" volume={:?} mute={:?} source={:?}",
            zone.zone_id,
            zone.display_name(),
            zone.volume,
            zone.mute,
            zone.source
        );
    }

    fn on_zone_updated(
        &mut self,
        zone_id: &str,
        attribute: Attribute,
        value: Option<&AttributeValue>,
    ) {
        match value {
            Some(value) => println!("  zone {} {} = {}", zone_id, attribute, value),
            None => println!("  zone {} {} unknown", zone_id, attribute),
        }
    }

    fn on_zone_unavailable(&mut self, zone_id: &str) {
        println!("- zone {} went quiet", zone_id);
    }

    fn on_zone_available(&mut self, zone_id: &str) {
        println!("+ zone {} is back", zone_id);
    }

    fn on_zone_removed(&mut self, zone_id: &str) {
        println!("- zone {} removed", zone_id);
    }

    fn on_command_timeout(&mut self, timeout: &CommandTimeout) {
        println!("! {}", timeout);
    }

    fn on_bridge_offline(&mut self) {
        println!("! broker connection lost");
    }

    fn on_bridge_online(&mut self) {
        println!("broker connection up");
    }
}

fn load_config() -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.as_slice() {
        [flag, path] if flag == "--config" => BridgeConfig::from_file(path)?,
        [host, port] => BridgeConfig::new(host.as_str(), port.parse()?),
        [host] => BridgeConfig::new(host.as_str(), 1883),
        _ => BridgeConfig::default(),
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ampbridge_mqtt=info")),
        )
        .init();

    let config = load_config()?;
    let bridge = AmpBridge::start(config).await?;
    println!("Bridge started, waiting for zones (Ctrl-C to quit)");

    let events = bridge.subscribe_events();
    let listener = tokio::spawn(async move {
        events.dispatch_to(&mut Printer).await;
    });

    // Once discovery settles, bump the first zone by one step
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    if let Some(zone) = bridge.zones().into_iter().find(|z| z.is_available()) {
        let target = zone.volume.unwrap_or(0).saturating_add(1);
        if let Err(e) = bridge.dispatcher().set_volume(zone.zone_id.clone(), target).await {
            eprintln!("Command failed: {}", e);
        }
    }

    tokio::signal::ctrl_c().await?;
    bridge.shutdown().await;
    drop(bridge);
    let _ = listener.await;
    Ok(())
}
