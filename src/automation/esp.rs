//! Wi-Fi station and MQTT adapters for the bridge.

use super::{forward_broker_event, BridgeError, BrokerEvent, BrokerSession, NetworkLink};
use crate::system::config::{AutomationConfig, NetworkConfig};
use anyhow::anyhow;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EspMqttConnection, EventPayload, LwtConfiguration, MqttClientConfiguration, QoS,
};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{info, warn};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread;

const BROKER_EVENT_QUEUE_DEPTH: usize = 16;

pub struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WifiLink {
    /// Configures and starts the station. A failed first association is not
    /// fatal; the bridge keeps retrying.
    pub fn start(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        let auth_method = if network.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("📶 WiFi started, connecting to '{}'", network.ssid);

        let mut link = Self { wifi };
        match link.reconnect() {
            Ok(()) => info!("📶 WiFi connected"),
            Err(e) => warn!("📶 Initial WiFi connect failed: {}", e),
        }
        Ok(link)
    }
}

impl NetworkLink for WifiLink {
    fn is_up(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn reconnect(&mut self) -> Result<(), BridgeError> {
        self.wifi
            .connect()
            .and_then(|_| self.wifi.wait_netif_up())
            .map_err(|e| BridgeError::Network(e.to_string()))
    }
}

pub struct MqttSession {
    client: EspMqttClient<'static>,
    events: Receiver<BrokerEvent>,
}

impl MqttSession {
    pub fn start(config: &AutomationConfig) -> anyhow::Result<Self> {
        let conf = MqttClientConfiguration {
            client_id: Some(config.client_id.as_str()),
            username: config.username.as_deref(),
            password: config.password.as_deref(),
            lwt: Some(LwtConfiguration {
                topic: config.presence_topic.as_str(),
                payload: b"offline",
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        };
        let (client, conn) = EspMqttClient::new(config.broker_url.as_str(), &conf)?;

        let (tx, rx) = mpsc::sync_channel(BROKER_EVENT_QUEUE_DEPTH);
        spawn_receiver(conn, tx)?;
        info!("🏠 MQTT client created for {}", config.broker_url);

        Ok(Self { client, events: rx })
    }
}

fn spawn_receiver(mut conn: EspMqttConnection, tx: SyncSender<BrokerEvent>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(e) => {
                    warn!("MQTT connection closed: {:?}", e);
                    break;
                }
            };
            let forwarded = match event.payload() {
                EventPayload::Connected(_) => Some(BrokerEvent::Connected),
                EventPayload::Disconnected => Some(BrokerEvent::Disconnected),
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => Some(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: data.to_vec(),
                }),
                _ => None,
            };
            if let Some(forwarded) = forwarded {
                if !forward_broker_event(&tx, forwarded) {
                    break;
                }
            }
        })?;
    Ok(())
}

impl BrokerSession for MqttSession {
    fn poll(&mut self) -> Option<BrokerEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            // Receiver thread exited; the session stays down.
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BridgeError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|e| BridgeError::Broker(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BridgeError> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .map(|_| ())
            .map_err(|e| BridgeError::Broker(e.to_string()))
    }
}
