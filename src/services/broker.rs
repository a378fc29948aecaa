//! MQTT connections: one client per distinct (host, port, tls) among active devices, each device
//! topic subscribed at-least-once, and a periodic full refresh that picks up registry changes.

use crate::config::BrokerSettings;
use crate::db::models::Device;
use crate::db::store::{StoreError, TelemetryStore};
use crate::models::telemetry::{DeviceId, DeviceRef};
use crate::services::ingest::{DeviceWorkers, InboundMessage};
use crate::services::measurements::MeasurementCache;
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode, Transport};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Grace period for a connection task to see its own disconnect before it is aborted.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);
const CLIENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Display for BrokerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// topic -> device
pub type TopicMap = HashMap<String, DeviceRef>;

/// Group active devices by broker. Rows with an unusable port or topic are skipped, and a topic
/// claimed twice on one broker stays with the first device.
pub fn group_devices(devices: Vec<Device>) -> BTreeMap<BrokerKey, TopicMap> {
    let mut groups: BTreeMap<BrokerKey, TopicMap> = BTreeMap::new();
    for d in devices {
        let Ok(port) = u16::try_from(d.broker_port) else {
            warn!("Broker: device {} has invalid broker port {}", d.id, d.broker_port);
            continue;
        };
        let host = d.broker_host.trim();
        let topic = d.mqtt_topic.trim();
        if host.is_empty() || topic.is_empty() {
            warn!("Broker: device {} has no broker host or topic", d.id);
            continue;
        }

        let key = BrokerKey {
            host: host.to_string(),
            port,
            tls: d.broker_tls,
        };
        let topics = groups.entry(key).or_default();
        if let Some(existing) = topics.get(topic) {
            warn!(
                "Broker: topic {:?} already assigned to device {}, ignoring device {}",
                topic, existing.id, d.id
            );
            continue;
        }
        topics.insert(
            topic.to_string(),
            DeviceRef {
                id: DeviceId(d.id),
                serial_number: d.serial_number,
                name: d.name,
            },
        );
    }
    groups
}

pub fn mqtt_options(key: &BrokerKey, settings: &BrokerSettings) -> MqttOptions {
    let client_id = format!("telemetry-hub-{:08x}", rand::random::<u32>());
    let mut options = MqttOptions::new(client_id, key.host.clone(), key.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    if key.tls {
        options.set_transport(Transport::Tls(Default::default()));
    }
    options
}

struct BrokerConnection {
    client: AsyncClient,
    topics: Arc<TopicMap>,
    task: JoinHandle<()>,
}

pub struct BrokerManager {
    store: Arc<dyn TelemetryStore>,
    measurements: Arc<MeasurementCache>,
    workers: Arc<DeviceWorkers>,
    settings: BrokerSettings,
    connections: Mutex<HashMap<BrokerKey, BrokerConnection>>,
}

impl BrokerManager {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        measurements: Arc<MeasurementCache>,
        workers: Arc<DeviceWorkers>,
        settings: BrokerSettings,
    ) -> Self {
        BrokerManager {
            store,
            measurements,
            workers,
            settings,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// First load and connect. The caller starts `run_refresh_loop` afterwards.
    pub async fn initialize(&self) -> Result<usize, StoreError> {
        self.refresh().await
    }

    /// Reload the registry and reconnect everything. Existing connections are kept when the
    /// reload fails.
    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let store = self.store.clone();
        let (devices, catalog) = tokio::task::spawn_blocking(move || {
            let devices = store.load_active_devices()?;
            let catalog = store.load_measurements()?;
            Ok::<_, StoreError>((devices, catalog))
        })
        .await
        .map_err(|e| StoreError::Fatal(format!("registry load task failed: {}", e)))??;

        let device_count = devices.len();
        let measurement_count = self.measurements.load(catalog);
        let groups = group_devices(devices);

        self.teardown_all().await;
        for (key, topics) in groups {
            info!("Broker: connecting {} for {} topic(s)", key, topics.len());
            let connection = self.connect(key.clone(), Arc::new(topics));
            self.connections.lock().insert(key, connection);
        }
        let brokers = self.connections.lock().len();
        info!(
            "Broker: {} active device(s) on {} broker(s), {} measurement(s) cached",
            device_count, brokers, measurement_count
        );
        Ok(brokers)
    }

    fn connect(&self, key: BrokerKey, topics: Arc<TopicMap>) -> BrokerConnection {
        let (client, eventloop) = AsyncClient::new(mqtt_options(&key, &self.settings), CLIENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(poll_loop(
            key,
            client.clone(),
            eventloop,
            topics.clone(),
            self.workers.clone(),
            self.settings.clone(),
        ));
        BrokerConnection { client, topics, task }
    }

    pub fn connected_brokers(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|c| !c.task.is_finished())
            .count()
    }

    /// Unsubscribe and disconnect every broker, then wait briefly for the connection tasks.
    pub async fn teardown_all(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        for (key, mut connection) in connections {
            for topic in connection.topics.keys() {
                if let Err(e) = connection.client.try_unsubscribe(topic.clone()) {
                    debug!("Broker: {} unsubscribe from {} failed: {}", key, topic, e);
                    break;
                }
            }
            if let Err(e) = connection.client.try_disconnect() {
                debug!("Broker: {} disconnect request failed: {}", key, e);
            }
            if tokio::time::timeout(TEARDOWN_GRACE, &mut connection.task).await.is_err() {
                connection.task.abort();
            }
            debug!("Broker: {} torn down", key);
        }
    }

    pub async fn run_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.refresh_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            info!(
                "Broker: periodic refresh, {} of {} connection(s) alive",
                self.connected_brokers(),
                self.connections.lock().len()
            );
            if let Err(e) = self.refresh().await {
                error!("Broker: refresh failed, keeping current connections: {}", e);
            }
        }
    }

    pub async fn shutdown(&self) {
        self.teardown_all().await;
        info!("Broker: all connections closed");
    }
}

async fn subscribe_all(client: AsyncClient, key: BrokerKey, topics: Vec<String>, bound: Duration) {
    for topic in topics {
        match tokio::time::timeout(bound, client.subscribe(topic.clone(), QoS::AtLeastOnce)).await {
            Ok(Ok(())) => debug!("Broker: {} subscribe requested for {}", key, topic),
            Ok(Err(e)) => warn!("Broker: {} subscribe to {} failed: {}", key, topic, e),
            Err(_) => warn!("Broker: {} subscribe to {} timed out", key, topic),
        }
    }
}

async fn poll_loop(
    key: BrokerKey,
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: Arc<TopicMap>,
    workers: Arc<DeviceWorkers>,
    settings: BrokerSettings,
) {
    let mut connected = false;
    let mut failures = 0u32;

    loop {
        let polled = if connected {
            eventloop.poll().await.map_err(|e| e.to_string())
        } else {
            match tokio::time::timeout(settings.connect_timeout, eventloop.poll()).await {
                Ok(r) => r.map_err(|e| e.to_string()),
                Err(_) => Err(format!("no connection within {}s", settings.connect_timeout.as_secs())),
            }
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected = true;
                failures = 0;
                info!("Broker: {} connected ({:?})", key, ack.code);
                let topics = topics.keys().cloned().collect();
                tokio::spawn(subscribe_all(client.clone(), key.clone(), topics, settings.subscribe_timeout));
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => match topics.get(&publish.topic) {
                Some(device) => {
                    workers
                        .dispatch(InboundMessage {
                            device: device.clone(),
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                            received_at: Utc::now(),
                        })
                        .await;
                }
                None => workers.ingestor().note_unknown_topic(&publish.topic),
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .filter(|c| matches!(c, SubscribeReasonCode::Failure))
                    .count();
                if rejected > 0 {
                    warn!(
                        "Broker: {} rejected {} subscription(s) (pkid {}), retried on next refresh",
                        key, rejected, ack.pkid
                    );
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Broker: {} disconnecting", key);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                connected = false;
                failures += 1;
                if failures >= settings.max_reconnect_attempts {
                    error!(
                        "Broker: {} failed {} time(s) in a row, dropping connection until next refresh: {}",
                        key, failures, e
                    );
                    break;
                }
                warn!(
                    "Broker: {} connection error ({}/{}): {}",
                    key, failures, settings.max_reconnect_attempts, e
                );
                tokio::time::sleep(settings.reconnect_delay).await;
            }
        }
    }
}
