use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::router::InboundMessage;
use crate::types::ConnectionState;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const REQUEST_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// A publish queued for the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Exponential backoff with full jitter: `uniform(0, min(cap, base * 2^attempt))`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Upper bound of the delay before reconnect attempt `attempt` (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Topic filters to (re)issue on every session. Sessions are clean, so the
/// broker forgets them on disconnect.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    patterns: BTreeSet<String>,
}

impl SubscriptionRegistry {
    /// Returns false when the pattern was already registered
    pub fn register(&mut self, pattern: &str) -> bool {
        self.patterns.insert(pattern.to_string())
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.patterns.contains(pattern)
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().cloned().collect()
    }
}

/// Build client options: credentials, clean session and the `offline` last will
pub fn mqtt_options(config: &BridgeConfig) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    options.set_last_will(LastWill::new(
        config.availability_topic.clone(),
        PAYLOAD_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    options
}

/// Shared between the manager handle and its background tasks
struct Session {
    client: AsyncClient,
    qos: QoS,
    availability_topic: String,
    subscriptions: Mutex<SubscriptionRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    closing: AtomicBool,
}

impl Session {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::info!("Broker connection {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    /// Runs right after every CONNACK, from inside the event loop task.
    /// Uses the non-blocking client calls so it never waits on the loop
    /// that has to drain them.
    fn on_session_established(&self) {
        if let Err(e) = self
            .client
            .try_publish(self.availability_topic.clone(), QoS::AtLeastOnce, true, PAYLOAD_ONLINE)
        {
            tracing::warn!("Failed to queue availability message: {}", e);
        }

        let patterns = lock(&self.subscriptions).patterns();
        for pattern in patterns {
            match self.client.try_subscribe(pattern.clone(), self.qos) {
                Ok(()) => tracing::info!("Subscribed to {}", pattern),
                Err(e) => {
                    let err = BridgeError::Subscription {
                        pattern,
                        reason: e.to_string(),
                    };
                    tracing::error!("{}; will retry on next reconnect", err);
                }
            }
        }
    }
}

/// Owns the broker session: connect, subscribe, reconnect with backoff and
/// the availability/last-will protocol.
///
/// The [`ConnectionState`] is written only here; everyone else holds a
/// `watch::Receiver`.
pub struct ConnectionManager {
    session: Arc<Session>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connect to the broker and start the background event loop.
    ///
    /// Waits for the first CONNACK, so unreachable brokers and rejected
    /// credentials fail here rather than in the reconnect loop. Inbound
    /// publishes are forwarded to `inbound_tx` in arrival order.
    pub async fn connect(
        config: &BridgeConfig,
        inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Self> {
        tracing::info!("Connecting to MQTT broker at {}:{}", config.host, config.port);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);

        match timeout(config.connect_timeout(), wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BridgeError::ConnectTimeout),
        }

        let session = Arc::new(Session {
            client,
            qos: config.mqtt_qos(),
            availability_topic: config.availability_topic.clone(),
            subscriptions: Mutex::new(SubscriptionRegistry::default()),
            state_tx,
            closing: AtomicBool::new(false),
        });
        session.set_state(ConnectionState::Connected);
        session.on_session_established();

        let cancel = CancellationToken::new();
        let backoff = Backoff::new(config.reconnect_base(), config.reconnect_cap());
        let loop_handle = tokio::spawn(run_event_loop(
            eventloop,
            session.clone(),
            inbound_tx,
            backoff,
            cancel.clone(),
        ));

        // Forward outgoing publishes so callers never wait on the broker
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let writer_session = session.clone();
        let writer_cancel = cancel.clone();
        let write_handle = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                tracing::debug!("Publishing {} = {}", msg.topic, msg.payload);
                if let Err(e) = writer_session
                    .client
                    .publish(msg.topic, writer_session.qos, msg.retain, msg.payload)
                    .await
                {
                    tracing::error!("Failed to queue publish: {}", e);
                }
            }
        });

        Ok(Self {
            session,
            outbound_tx,
            cancel,
            tasks: Mutex::new(vec![loop_handle, write_handle]),
        })
    }

    /// Observe the connection state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_tx.subscribe()
    }

    /// Sender for outbound publishes
    pub fn outbound(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    /// Register a topic filter for this and every future session.
    ///
    /// Registering the same filter twice is a no-op. While disconnected the
    /// filter is only recorded and goes out with the next CONNACK.
    pub async fn subscribe(&self, pattern: &str) -> Result<()> {
        let added = lock(&self.session.subscriptions).register(pattern);
        if !added {
            tracing::debug!("Already subscribed to {}", pattern);
            return Ok(());
        }
        if *self.session.state_tx.borrow() != ConnectionState::Connected {
            tracing::info!("Subscription to {} deferred until connected", pattern);
            return Ok(());
        }

        self.session
            .client
            .subscribe(pattern, self.session.qos)
            .await
            .map_err(|e| BridgeError::Subscription {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!("Subscribed to {}", pattern);
        Ok(())
    }

    /// Registered topic filters
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.session.subscriptions).patterns()
    }

    /// Publish `offline`, disconnect cleanly and stop the background tasks.
    ///
    /// The broker does not fire the last will after a clean disconnect, which
    /// is why the offline message is published explicitly first.
    pub async fn shutdown(&self) {
        if self.session.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down broker connection");

        let client = &self.session.client;
        if let Err(e) = client
            .publish(
                self.session.availability_topic.clone(),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_OFFLINE,
            )
            .await
        {
            tracing::warn!("Failed to publish offline message: {}", e);
        }
        if let Err(e) = client.disconnect().await {
            tracing::warn!("Failed to request disconnect: {}", e);
        }

        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        let mut handles = handles.into_iter();
        if let Some(loop_handle) = handles.next() {
            // Give the event loop a moment to flush the offline message
            let _ = timeout(SHUTDOWN_GRACE, loop_handle).await;
        }
        self.cancel.cancel();
        for handle in handles {
            let _ = timeout(SHUTDOWN_GRACE, handle).await;
        }
        self.session.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => {
                        tracing::info!("Connected to MQTT broker");
                        Ok(())
                    }
                    code => Err(BridgeError::ConnectionRefused(code)),
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BridgeError::ConnectionRefused(code))
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Poll the event loop until cancelled. Errors move the state to
/// `Reconnecting` and the next poll, after a backoff sleep, reconnects.
async fn run_event_loop(
    mut eventloop: EventLoop,
    session: Arc<Session>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    backoff: Backoff,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    attempt = 0;
                    session.set_state(ConnectionState::Connected);
                    session.on_session_established();
                } else {
                    tracing::error!("Broker refused reconnect: {:?}", ack.code);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    received_at: Instant::now(),
                };
                if inbound_tx.send(message).is_err() {
                    tracing::debug!("Inbound receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                    tracing::error!(
                        "Broker rejected subscription (packet {}); will retry on next reconnect",
                        ack.pkid
                    );
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("Disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if session.closing.load(Ordering::SeqCst) {
                    break;
                }
                session.set_state(ConnectionState::Reconnecting);
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!("MQTT connection error: {}; reconnecting in {:?}", e, delay);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    session.set_state(ConnectionState::Disconnected);
}
