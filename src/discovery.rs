use crate::protocol::TopicSchema;
use crate::store::ZoneStore;
use crate::types::ZoneId;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// What to do with a zone seen for the first time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryAction {
    /// Held until the debounce window closes
    Buffered,
    /// Announce right away
    Announce,
    /// Already announced or buffered
    Known,
}

/// Decides when newly seen zones are announced to the platform.
///
/// After each connect a debounce window collects the burst of retained
/// messages so the platform gets one batch instead of a registration storm.
/// Once the window closes, new zones are announced one by one. The
/// coordinator also sweeps the store for zones that went quiet.
#[derive(Debug)]
pub struct DiscoveryCoordinator {
    debounce: Duration,
    liveness_window: Duration,
    window_deadline: Option<Instant>,
    buffered: Vec<ZoneId>,
    known: HashSet<ZoneId>,
}

impl DiscoveryCoordinator {
    pub fn new(debounce: Duration, liveness_window: Duration) -> Self {
        Self {
            debounce,
            liveness_window,
            window_deadline: None,
            buffered: Vec::new(),
            known: HashSet::new(),
        }
    }

    /// Topic filters the coordinator needs on every session
    pub fn subscriptions(schema: &TopicSchema) -> Vec<String> {
        vec![schema.state_wildcard()]
    }

    /// Open (or extend) the debounce window. Returns its deadline.
    pub fn on_connected(&mut self, now: Instant) -> Instant {
        let deadline = now + self.debounce;
        self.window_deadline = Some(deadline);
        tracing::debug!("Discovery window open for {:?}", self.debounce);
        deadline
    }

    pub fn window_deadline(&self) -> Option<Instant> {
        self.window_deadline
    }

    pub fn window_open(&self) -> bool {
        self.window_deadline.is_some()
    }

    /// Register a zone id the store just created
    pub fn observe(&mut self, zone_id: &str) -> DiscoveryAction {
        if !self.known.insert(zone_id.to_string()) {
            return DiscoveryAction::Known;
        }
        if self.window_open() {
            self.buffered.push(zone_id.to_string());
            DiscoveryAction::Buffered
        } else {
            DiscoveryAction::Announce
        }
    }

    /// True while the zone waits in the current batch
    pub fn is_buffered(&self, zone_id: &str) -> bool {
        self.buffered.iter().any(|id| id == zone_id)
    }

    /// Close the window and take the batch
    pub fn close_window(&mut self) -> Vec<ZoneId> {
        self.window_deadline = None;
        std::mem::take(&mut self.buffered)
    }

    /// Mark zones without updates for longer than the liveness window as
    /// stale. Returns the zones that just became stale.
    pub fn sweep(&self, store: &mut ZoneStore, now: Instant) -> Vec<ZoneId> {
        store.mark_stale(self.liveness_window, now)
    }

    /// Forget everything announced so far; the window state is kept
    pub fn reset(&mut self) {
        self.buffered.clear();
        self.known.clear();
    }
}
