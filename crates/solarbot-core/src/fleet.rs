//! Fleet manager: one broker connection, many simulated robots
//!
//! Owns the MQTT session, the outbound/inbound queues and the live robot
//! maps, and keeps the fleet reconciled with the enabled roster. All map
//! mutations happen under a single lock; the lock is never held across a
//! broker or robot call.

use crate::robot::{Robot, RobotConfig};
use crate::store::{BrokerSettings, ConfigStore, StoreError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use solarbot_protocol::{DownlinkEnvelope, UplinkTemplate};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Outbound queue depth; enqueue fails fast beyond this
const OUTBOUND_QUEUE_DEPTH: usize = 1024;
/// Inbound queue depth; the broker callback push is wait-free
const INBOUND_QUEUE_DEPTH: usize = 1024;
/// Roster diff period
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
/// Stop-flag poll granularity for the background loops
const STOP_POLL_TICK: Duration = Duration::from_millis(100);
/// Reconnect backoff bounds
const RECONNECT_MIN_BACKOFF: Duration = Duration::from_secs(1);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("robot not in roster: {0}")]
    UnknownRobot(String),

    #[error("subscribe topic {topic:?} already owned by robot {owner}")]
    TopicCollision { topic: String, owner: String },

    #[error("outbound queue full")]
    QueueFull,

    #[error("fleet manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One message waiting on the outbound queue
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
}

/// One message delivered by the broker callback
struct InboundMessage {
    topic: String,
    payload: Vec<u8>,
}

/// The two fleet maps, kept in lockstep under one lock
#[derive(Default)]
struct FleetMaps {
    robots: HashMap<String, Arc<Robot>>,
    topic_to_robot: HashMap<String, String>,
}

struct FleetInner {
    client: AsyncClient,
    store: Arc<ConfigStore>,
    template: Arc<UplinkTemplate>,
    settings: BrokerSettings,
    fleet: Mutex<FleetMaps>,
    /// Taken at shutdown so no new producers appear
    outbound_tx: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    stop: AtomicBool,
    /// Wake the sender / dispatcher at shutdown; a permit is stored, so
    /// the wakeup is never lost
    outbound_stop: Notify,
    inbound_stop: Notify,
    dropped_inbound: AtomicU64,
}

struct Tasks {
    event_loop: JoinHandle<()>,
    sender: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    reconciler: JoinHandle<()>,
}

pub struct FleetManager {
    inner: Arc<FleetInner>,
    tasks: Mutex<Option<Tasks>>,
}

impl FleetManager {
    /// Establish the broker session, start the background tasks and load
    /// the enabled roster
    #[allow(clippy::missing_errors_doc)]
    pub async fn start(
        store: Arc<ConfigStore>,
        template: UplinkTemplate,
    ) -> Result<Self, FleetError> {
        let settings = store.broker_settings();
        let (host, port) = parse_broker_url(&settings.broker_url);
        tracing::info!(
            "connecting to broker {}:{} as {}",
            host,
            port,
            settings.client_id_prefix
        );

        let mut options = MqttOptions::new(settings.client_id_prefix.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(settings.keepalive_secs));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 1024);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let inner = Arc::new(FleetInner {
            client,
            store,
            template: Arc::new(template),
            settings,
            fleet: Mutex::new(FleetMaps::default()),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            stop: AtomicBool::new(false),
            outbound_stop: Notify::new(),
            inbound_stop: Notify::new(),
            dropped_inbound: AtomicU64::new(0),
        });

        let tasks = Tasks {
            event_loop: tokio::spawn(event_loop_task(
                Arc::clone(&inner),
                eventloop,
                inbound_tx,
            )),
            sender: tokio::spawn(sender_task(Arc::clone(&inner), outbound_rx)),
            dispatcher: tokio::spawn(dispatcher_task(Arc::clone(&inner), inbound_rx)),
            reconciler: tokio::spawn(reconciler_task(Arc::clone(&inner))),
        };

        let manager = Self {
            inner,
            tasks: Mutex::new(Some(tasks)),
        };

        // Initial roster load; the reconciler keeps it in sync afterwards
        manager.inner.reconcile().await;
        Ok(manager)
    }

    /// Instantiate and start a robot for an enabled roster row
    #[allow(clippy::missing_errors_doc)]
    pub async fn add(&self, dev_eui: &str) -> Result<(), FleetError> {
        self.inner.add(dev_eui).await
    }

    /// Retire a live robot: stop its reporter, withdraw its subscription
    #[allow(clippy::missing_errors_doc)]
    pub async fn remove(&self, dev_eui: &str) -> Result<(), FleetError> {
        self.inner.remove(dev_eui).await
    }

    #[must_use]
    pub fn get_robot(&self, dev_eui: &str) -> Option<Arc<Robot>> {
        self.inner.fleet.lock().unwrap().robots.get(dev_eui).cloned()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.fleet.lock().unwrap().robots.len()
    }

    /// Inbound messages dropped for parse errors or unmatched EUIs
    #[must_use]
    pub fn dropped_inbound(&self) -> u64 {
        self.inner.dropped_inbound.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.inner.store
    }

    /// Push one message onto the outbound queue
    #[allow(clippy::missing_errors_doc)]
    pub fn enqueue(&self, topic: String, payload: Vec<u8>, qos: u8) -> Result<(), FleetError> {
        self.inner.enqueue(OutboundMessage {
            topic,
            payload,
            qos,
        })
    }

    /// Escape hatch for tests and admin: publish without touching robot state
    #[allow(clippy::missing_errors_doc)]
    pub fn publish_raw(&self, topic: &str, payload: &[u8]) -> Result<(), FleetError> {
        self.enqueue(topic.to_string(), payload.to_vec(), self.inner.settings.qos)
    }

    /// Orderly shutdown: reconciler first, then every reporter, then the
    /// sender (after draining), then the broker session
    pub async fn shutdown(&self) {
        tracing::info!("stopping fleet manager");
        self.inner.stop.store(true, Ordering::Relaxed);

        let tasks = self.tasks.lock().unwrap().take();
        let Some(tasks) = tasks else {
            return; // already stopped
        };

        let _ = tasks.reconciler.await;

        let robots: Vec<Arc<Robot>> = {
            let mut maps = self.inner.fleet.lock().unwrap();
            maps.topic_to_robot.clear();
            maps.robots.drain().map(|(_, robot)| robot).collect()
        };
        for robot in &robots {
            robot.stop().await;
        }
        drop(robots);

        // Drain the outbound queue, then tear the session down
        self.inner.outbound_tx.lock().unwrap().take();
        self.inner.outbound_stop.notify_one();
        let _ = tasks.sender.await;

        if let Err(e) = self.inner.client.disconnect().await {
            tracing::debug!("disconnect: {}", e);
        }
        let _ = tasks.event_loop.await;
        self.inner.inbound_stop.notify_one();
        let _ = tasks.dispatcher.await;
        tracing::info!("fleet manager stopped");
    }
}

impl FleetInner {
    fn outbound_sender(&self) -> Result<mpsc::Sender<OutboundMessage>, FleetError> {
        self.outbound_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(FleetError::ShuttingDown)
    }

    fn enqueue(&self, message: OutboundMessage) -> Result<(), FleetError> {
        self.outbound_sender()?
            .try_send(message)
            .map_err(|_| FleetError::QueueFull)
    }

    async fn add(&self, dev_eui: &str) -> Result<(), FleetError> {
        let row = self
            .store
            .get_robot(dev_eui)?
            .ok_or_else(|| FleetError::UnknownRobot(dev_eui.to_string()))?;

        let publish_topic = self.store.publish_topic(dev_eui);
        let subscribe_topic = self.store.subscribe_topic(dev_eui);

        let robot = Arc::new(Robot::new(
            RobotConfig {
                dev_eui: row.robot_id.clone(),
                serial_number: row.serial_number,
                publish_topic: publish_topic.clone(),
                subscribe_topic: subscribe_topic.clone(),
                qos: self.settings.qos,
                report_interval: Duration::from_secs(self.settings.publish_interval_secs),
                alarm_fa: row.alarm_fa,
                alarm_fb: row.alarm_fb,
                alarm_fc: row.alarm_fc,
                alarm_fd: row.alarm_fd,
            },
            self.outbound_sender()?,
            Arc::clone(&self.template),
        ));

        {
            let mut maps = self.fleet.lock().unwrap();
            if maps.robots.contains_key(dev_eui) {
                tracing::debug!("robot already live: {}", dev_eui);
                return Ok(());
            }
            if let Some(owner) = maps.topic_to_robot.get(&subscribe_topic) {
                return Err(FleetError::TopicCollision {
                    topic: subscribe_topic,
                    owner: owner.clone(),
                });
            }
            maps.robots.insert(dev_eui.to_string(), Arc::clone(&robot));
            maps.topic_to_robot
                .insert(subscribe_topic.clone(), dev_eui.to_string());
        }

        // Subscribe before the first uplink; a failure here is recovered
        // by the re-subscribe on reconnect.
        if let Err(e) = self
            .client
            .subscribe(subscribe_topic.clone(), qos_level(self.settings.qos))
            .await
        {
            tracing::error!("subscribe {} failed: {}", subscribe_topic, e);
        }
        robot.start_reporter();

        tracing::info!(
            "added robot {} (serial {}, publish {}, subscribe {})",
            dev_eui,
            row.serial_number,
            publish_topic,
            subscribe_topic
        );
        Ok(())
    }

    async fn remove(&self, dev_eui: &str) -> Result<(), FleetError> {
        let removed = {
            let mut maps = self.fleet.lock().unwrap();
            maps.robots.remove(dev_eui).map(|robot| {
                let topic = robot.subscribe_topic().to_string();
                maps.topic_to_robot.remove(&topic);
                (robot, topic)
            })
        };
        let Some((robot, topic)) = removed else {
            tracing::debug!("remove: robot not live: {}", dev_eui);
            return Ok(());
        };

        robot.stop().await;
        if let Err(e) = self.client.unsubscribe(topic.clone()).await {
            tracing::warn!("unsubscribe {} failed: {}", topic, e);
        }
        tracing::info!("removed robot {}", dev_eui);
        Ok(())
    }

    /// Diff the enabled roster against the live fleet
    async fn reconcile(&self) {
        let enabled = match self.store.enabled_robot_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("reconciler could not read roster: {}", e);
                return;
            }
        };
        let enabled_set: HashSet<&String> = enabled.iter().collect();
        let live: HashSet<String> = self
            .fleet
            .lock()
            .unwrap()
            .robots
            .keys()
            .cloned()
            .collect();

        for dev_eui in &enabled {
            if !live.contains(dev_eui) {
                tracing::info!("reconciler: enabling {}", dev_eui);
                if let Err(e) = self.add(dev_eui).await {
                    tracing::error!("reconciler could not add {}: {}", dev_eui, e);
                }
            }
        }
        for dev_eui in &live {
            if !enabled_set.contains(dev_eui) {
                tracing::info!("reconciler: disabling {}", dev_eui);
                if let Err(e) = self.remove(dev_eui).await {
                    tracing::error!("reconciler could not remove {}: {}", dev_eui, e);
                }
            }
        }
    }

    /// Re-issue every live subscription after a reconnect
    async fn resubscribe_all(&self) {
        let topics: Vec<String> = {
            let maps = self.fleet.lock().unwrap();
            maps.topic_to_robot.keys().cloned().collect()
        };
        for topic in topics {
            if let Err(e) = self
                .client
                .subscribe(topic.clone(), qos_level(self.settings.qos))
                .await
            {
                tracing::error!("re-subscribe {} failed: {}", topic, e);
            }
        }
    }
}

/// Route one inbound broker message to its robot
fn dispatch(inner: &FleetInner, topic: &str, payload: &[u8]) {
    let envelope = match DownlinkEnvelope::parse(topic, payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("dropping inbound message on {}: {}", topic, e);
            inner.dropped_inbound.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // Hold the fleet lock only for the lookup; the handler runs outside it
    let robot = {
        let maps = inner.fleet.lock().unwrap();
        maps.robots.get(&envelope.dev_eui).cloned()
    };
    match robot {
        Some(robot) => {
            tracing::debug!("routing downlink to {}", envelope.dev_eui);
            robot.handle(&envelope.data);
        }
        None => {
            tracing::warn!("no live robot for devEui {}", envelope.dev_eui);
            inner.dropped_inbound.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Sleep in stop-flag-sized steps so joins stay bounded
async fn interruptible_sleep(stop: &AtomicBool, duration: Duration) -> bool {
    let mut waited = Duration::ZERO;
    while waited < duration {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = STOP_POLL_TICK.min(duration - waited);
        tokio::time::sleep(step).await;
        waited += step;
    }
    !stop.load(Ordering::Relaxed)
}

async fn event_loop_task(
    inner: Arc<FleetInner>,
    mut eventloop: EventLoop,
    inbound_tx: mpsc::Sender<InboundMessage>,
) {
    tracing::debug!("broker event loop started");
    let mut backoff = RECONNECT_MIN_BACKOFF;

    loop {
        if inner.stop.load(Ordering::Relaxed) {
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                backoff = RECONNECT_MIN_BACKOFF;
                tracing::debug!("inbound message on {}", publish.topic);
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if inbound_tx.try_send(message).is_err() {
                    tracing::warn!("inbound queue full, dropping message");
                    inner.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("broker connected");
                backoff = RECONNECT_MIN_BACKOFF;
                // Re-subscribe aside so the event loop keeps draining
                // client requests meanwhile.
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.resubscribe_all().await });
            }
            Ok(_) => {
                backoff = RECONNECT_MIN_BACKOFF;
            }
            Err(e) => {
                if inner.stop.load(Ordering::Relaxed) {
                    break;
                }
                tracing::warn!("broker connection lost: {}; retrying in {:?}", e, backoff);
                if !interruptible_sleep(&inner.stop, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
            }
        }
    }
    tracing::debug!("broker event loop stopped");
}

async fn sender_task(inner: Arc<FleetInner>, mut rx: mpsc::Receiver<OutboundMessage>) {
    tracing::debug!("outbound sender started");
    loop {
        let msg = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(msg) => msg,
                None => break,
            },
            () = inner.outbound_stop.notified() => {
                // Drain what is already queued, then exit
                while let Ok(msg) = rx.try_recv() {
                    publish_one(&inner.client, msg).await;
                }
                break;
            }
        };
        publish_one(&inner.client, msg).await;
    }
    tracing::debug!("outbound sender stopped");
}

async fn publish_one(client: &AsyncClient, msg: OutboundMessage) {
    tracing::debug!("publishing {} bytes to {}", msg.payload.len(), msg.topic);
    if let Err(e) = client
        .publish(msg.topic.clone(), qos_level(msg.qos), false, msg.payload)
        .await
    {
        // Not retried here: delivery guarantees are the broker client's job
        tracing::error!("publish to {} failed: {}", msg.topic, e);
    }
}

async fn dispatcher_task(inner: Arc<FleetInner>, mut rx: mpsc::Receiver<InboundMessage>) {
    tracing::debug!("inbound dispatcher started");
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(msg) => dispatch(&inner, &msg.topic, &msg.payload),
                None => break,
            },
            () = inner.inbound_stop.notified() => {
                while let Ok(msg) = rx.try_recv() {
                    dispatch(&inner, &msg.topic, &msg.payload);
                }
                break;
            }
        }
    }
    tracing::debug!("inbound dispatcher stopped");
}

async fn reconciler_task(inner: Arc<FleetInner>) {
    tracing::debug!("reconciler started");
    loop {
        if !interruptible_sleep(&inner.stop, RECONCILE_INTERVAL).await {
            break;
        }
        inner.reconcile().await;
    }
    tracing::debug!("reconciler stopped");
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Split `tcp://host:port` (scheme optional) into host and port
fn parse_broker_url(url: &str) -> (String, u16) {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .or_else(|| url.strip_prefix("ssl://"))
        .unwrap_or(url);
    match rest.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
        None => (rest.to_string(), 1883),
    }
}
