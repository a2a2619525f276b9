//! Azure IoT Hub over MQTT
//!
//! One `rumqttc` connection, driven by a background task that owns the
//! event loop. Twin requests are correlated with their responses through a
//! request id (`$rid`) and a map of pending oneshot senders. Desired-property
//! pushes are forwarded to an unbounded channel that exists from connect
//! time, so pushes that arrive before anyone listens are queued, not lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{CloudChannel, DeviceConnectionString, PropertyMap, TwinDocument, TwinPatch};
use crate::error::{BridgeError, Result};

/// MQTT API version sent in the username
pub const API_VERSION: &str = "2021-04-12";

/// IoT Hub MQTT over TLS
pub const IOTHUB_MQTT_PORT: u16 = 8883;

/// Topic names and filters used on the IoT Hub MQTT endpoint
pub mod topics {
    pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
    pub const DESIRED_PATCH_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

    const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
    const DESIRED_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

    pub fn telemetry(device_id: &str) -> String {
        format!("devices/{}/messages/events/", device_id)
    }

    pub fn twin_get(rid: u64) -> String {
        format!("$iothub/twin/GET/?$rid={}", rid)
    }

    pub fn reported_patch(rid: u64) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={}", rid)
    }

    /// `$iothub/twin/res/<status>/?$rid=<rid>[&...]` -> `(status, rid)`
    pub fn parse_twin_response(topic: &str) -> Option<(u16, u64)> {
        let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
        let (status, query) = rest.split_once('/')?;
        let status = status.parse().ok()?;
        let rid = query
            .trim_start_matches('?')
            .split('&')
            .find_map(|pair| pair.strip_prefix("$rid="))?
            .parse()
            .ok()?;
        Some((status, rid))
    }

    pub fn is_desired_patch(topic: &str) -> bool {
        topic.starts_with(DESIRED_PATCH_PREFIX)
    }
}

/// Connection tuning
#[derive(Debug, Clone)]
pub struct IotHubOptions {
    pub port: u16,
    pub keep_alive: Duration,
    /// Deadline for a twin GET / reported PATCH response
    pub request_timeout: Duration,
    /// Lifetime of each generated SAS token
    pub token_ttl: Duration,
    /// Pause after a connection error before the event loop reconnects
    pub reconnect_delay: Duration,
    /// Plain TCP when false; IoT Hub itself only accepts TLS
    pub use_tls: bool,
}

impl Default for IotHubOptions {
    fn default() -> Self {
        Self {
            port: IOTHUB_MQTT_PORT,
            keep_alive: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            token_ttl: Duration::from_secs(3600),
            reconnect_delay: Duration::from_secs(5),
            use_tls: true,
        }
    }
}

#[derive(Debug)]
struct TwinResponse {
    status: u16,
    body: Vec<u8>,
}

type PendingRequests = Arc<DashMap<u64, oneshot::Sender<TwinResponse>>>;

/// `<host>/<device>/?api-version=...`
pub(crate) fn mqtt_username(conn: &DeviceConnectionString) -> String {
    format!(
        "{}/{}/?api-version={}",
        conn.host_name(),
        conn.device_id(),
        API_VERSION
    )
}

fn mqtt_options(conn: &DeviceConnectionString, options: &IotHubOptions) -> Result<MqttOptions> {
    let mut mqtt_options = MqttOptions::new(conn.device_id(), conn.host_name(), options.port);
    mqtt_options.set_credentials(mqtt_username(conn), conn.sas_token(options.token_ttl)?);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(true);
    // Twin documents can reach tens of KB
    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);
    if options.use_tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }
    Ok(mqtt_options)
}

/// Twin operations answer with an HTTP-like status; anything outside 2xx is a failure
fn check_status(status: u16, operation: &str) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(BridgeError::Cloud(format!(
            "{} failed with status {}",
            operation, status
        )))
    }
}

/// Route one incoming PUBLISH
fn dispatch_publish(
    topic: &str,
    payload: &[u8],
    pending: &PendingRequests,
    desired_tx: &mpsc::UnboundedSender<TwinPatch>,
) {
    if let Some((status, rid)) = topics::parse_twin_response(topic) {
        match pending.remove(&rid) {
            Some((_, tx)) => {
                let response = TwinResponse {
                    status,
                    body: payload.to_vec(),
                };
                if tx.send(response).is_err() {
                    debug!("Twin response rid={} arrived after the caller gave up", rid);
                }
            },
            None => debug!("Ignoring twin response for unknown rid={}", rid),
        }
    } else if topics::is_desired_patch(topic) {
        match TwinPatch::from_slice(payload) {
            Ok(patch) => {
                if desired_tx.send(patch).is_err() {
                    warn!("Desired property update dropped: no listener");
                }
            },
            Err(e) => warn!("Ignoring desired property update: {}", e),
        }
    } else {
        debug!("Ignoring message on topic {}", topic);
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    conn: DeviceConnectionString,
    options: IotHubOptions,
    pending: PendingRequests,
    desired_tx: mpsc::UnboundedSender<TwinPatch>,
) {
    let mut connected_once = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("[OK] Connected to IoT Hub {} ({:?})", conn.host_name(), ack.code);
                // First subscriptions were queued at connect time
                if connected_once {
                    for filter in [topics::TWIN_RESPONSE_FILTER, topics::DESIRED_PATCH_FILTER] {
                        if let Err(e) = client.try_subscribe(filter, QoS::AtLeastOnce) {
                            error!("Failed to re-subscribe to {}: {}", filter, e);
                        }
                    }
                }
                connected_once = true;
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatch_publish(&publish.topic, &publish.payload, &pending, &desired_tx);
            },
            Ok(_) => {},
            Err(e) => {
                error!("[FAIL] IoT Hub connection error: {}", e);
                match conn.sas_token(options.token_ttl) {
                    Ok(token) => {
                        eventloop
                            .mqtt_options
                            .set_credentials(mqtt_username(&conn), token);
                    },
                    Err(e) => error!("Failed to refresh SAS token: {}", e),
                }
                sleep(options.reconnect_delay).await;
            },
        }
    }
}

/// [`CloudChannel`] backed by Azure IoT Hub
pub struct IotHubChannel {
    client: AsyncClient,
    telemetry_topic: String,
    request_timeout: Duration,
    next_rid: AtomicU64,
    pending: PendingRequests,
    desired_rx: Mutex<Option<mpsc::UnboundedReceiver<TwinPatch>>>,
    event_loop: JoinHandle<()>,
}

impl IotHubChannel {
    /// Open the connection. The MQTT session is established in the background;
    /// requests issued before it is up are queued by the client.
    pub async fn connect(conn: DeviceConnectionString, options: IotHubOptions) -> Result<Self> {
        let mqtt_options = mqtt_options(&conn, &options)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options, 32);

        // Queued ahead of any twin request so responses are never missed
        client
            .subscribe(topics::TWIN_RESPONSE_FILTER, QoS::AtLeastOnce)
            .await?;
        client
            .subscribe(topics::DESIRED_PATCH_FILTER, QoS::AtLeastOnce)
            .await?;

        let pending: PendingRequests = Arc::new(DashMap::new());
        let (desired_tx, desired_rx) = mpsc::unbounded_channel();

        info!(
            "Connecting to IoT Hub {} as device {}",
            conn.host_name(),
            conn.device_id()
        );

        let telemetry_topic = topics::telemetry(conn.device_id());
        let request_timeout = options.request_timeout;
        let event_loop = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            conn,
            options,
            pending.clone(),
            desired_tx,
        ));

        Ok(Self {
            client,
            telemetry_topic,
            request_timeout,
            next_rid: AtomicU64::new(1),
            pending,
            desired_rx: Mutex::new(Some(desired_rx)),
            event_loop,
        })
    }

    async fn request(&self, topic_for: fn(u64) -> String, body: Vec<u8>) -> Result<TwinResponse> {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
        let topic = topic_for(rid);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(rid, tx);

        if let Err(e) = self.client.publish(topic.as_str(), QoS::AtMostOnce, false, body).await {
            self.pending.remove(&rid);
            return Err(e.into());
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BridgeError::Internal(format!(
                "Response channel for {} closed",
                topic
            ))),
            Err(_) => {
                self.pending.remove(&rid);
                Err(BridgeError::Timeout(format!(
                    "No response to {} within {:?}",
                    topic, self.request_timeout
                )))
            },
        }
    }
}

impl Drop for IotHubChannel {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl CloudChannel for IotHubChannel {
    async fn send_event(&self, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(self.telemetry_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await?;
        debug!("Published telemetry to {}", self.telemetry_topic);
        Ok(())
    }

    async fn get_twin(&self) -> Result<TwinDocument> {
        let response = self.request(topics::twin_get, Vec::new()).await?;
        check_status(response.status, "Twin GET")?;
        TwinDocument::from_slice(&response.body)
    }

    async fn update_reported(&self, properties: PropertyMap) -> Result<()> {
        let body = serde_json::to_vec(&properties)?;
        let response = self.request(topics::reported_patch, body).await?;
        check_status(response.status, "Reported properties update")
    }

    fn take_desired_updates(&self) -> Option<mpsc::UnboundedReceiver<TwinPatch>> {
        match self.desired_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
