//! Home-automation bridge.
//!
//! Keeps the network link and the MQTT session alive on its own thread and
//! mirrors the espresso machine's controls. The bridge never touches the
//! radio: inbound commands go to [`ControlHandler`]s.

pub mod controls;
#[cfg(target_os = "espidf")]
pub mod esp;
pub mod mock;

use crate::system::config::AutomationConfig;
use controls::{Control, ControlValue, MachineShadow, PreinfusionMode, TopicKind, Topics};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

pub const OUTBOUND_QUEUE_DEPTH: usize = 8;

pub type OutboundChannel = Channel<CriticalSectionRawMutex, ControlValue, OUTBOUND_QUEUE_DEPTH>;

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    InvalidPayload { control: Control, payload: String },
    OutOfRange { control: Control, payload: String },
    Network(String),
    Broker(String),
    QueueFull(ControlValue),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::InvalidPayload { control, payload } => {
                write!(f, "Invalid {} payload: {:?}", control.object_id(), payload)
            }
            BridgeError::OutOfRange { control, payload } => {
                write!(f, "{} out of range: {}", control.object_id(), payload)
            }
            BridgeError::Network(e) => write!(f, "Network error: {}", e),
            BridgeError::Broker(e) => write!(f, "Broker error: {}", e),
            BridgeError::QueueFull(value) => write!(f, "Outbound queue full, dropped {:?}", value),
        }
    }
}

impl std::error::Error for BridgeError {}

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Station link to the access point.
pub trait NetworkLink {
    fn is_up(&mut self) -> bool;
    fn reconnect(&mut self) -> Result<(), BridgeError>;
}

/// Broker session. `poll` never blocks.
pub trait BrokerSession {
    fn poll(&mut self) -> Option<BrokerEvent>;
    fn subscribe(&mut self, topic: &str) -> Result<(), BridgeError>;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BridgeError>;
}

/// Receives validated hub commands.
pub trait ControlHandler: Send + Sync {
    fn on_command(&self, value: ControlValue);

    fn on_shadow_changed(&self, _shadow: &MachineShadow) {}
}

pub struct LogControlHandler;

impl ControlHandler for LogControlHandler {
    fn on_command(&self, value: ControlValue) {
        info!("🏠 Hub command: {} = {}", value.control().object_id(), value.encode());
    }
}

/// Local setters for machine state, callable from any thread. Values are
/// published as state by the bridge on its next step.
#[derive(Clone, Copy)]
pub struct AutomationHandle {
    outbound: &'static OutboundChannel,
}

impl AutomationHandle {
    pub fn new(outbound: &'static OutboundChannel) -> Self {
        Self { outbound }
    }

    fn send(&self, value: ControlValue) -> Result<(), BridgeError> {
        // Round-trip through the wire format to apply the same ranges and step as inbound.
        let value = ControlValue::parse(value.control(), value.encode().as_bytes())?;
        self.outbound
            .try_send(value)
            .map_err(|_| BridgeError::QueueFull(value))
    }

    pub fn set_machine_power(&self, on: bool) -> Result<(), BridgeError> {
        self.send(ControlValue::Power(on))
    }

    pub fn set_preinfusion_mode(&self, index: usize) -> Result<(), BridgeError> {
        let mode = PreinfusionMode::from_index(index).ok_or_else(|| BridgeError::OutOfRange {
            control: Control::Mode,
            payload: index.to_string(),
        })?;
        self.send(ControlValue::Mode(mode))
    }

    pub fn set_target_temperature(&self, celsius: f32) -> Result<(), BridgeError> {
        self.send(ControlValue::TargetTemperature(celsius))
    }

    pub fn set_steam_power(&self, level: u8) -> Result<(), BridgeError> {
        self.send(ControlValue::SteamPower(level))
    }

    pub fn set_preinfusion_time(&self, seconds: f32) -> Result<(), BridgeError> {
        self.send(ControlValue::PreinfusionTime(seconds))
    }

    pub fn trigger_backflush(&self) -> Result<(), BridgeError> {
        self.send(ControlValue::Backflush(true))
    }
}

/// Hands one event from the broker's receive thread to the bridge without
/// blocking. A full queue drops the event. Returns `false` once the bridge side
/// is gone.
pub fn forward_broker_event(tx: &SyncSender<BrokerEvent>, event: BrokerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!("Broker event queue full, dropping {:?}", dropped);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Outcome of one bridge iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Link was down; a reconnect was attempted.
    Backoff,
    /// Link up; this many broker events were handled.
    Serviced(usize),
}

/// Discovery document announcing one control to the hub.
pub fn discovery_config(topics: &Topics, device: &str, control: Control) -> serde_json::Value {
    let unique_id = format!("{}_{}", device, control.object_id());
    let mut config = json!({
        "name": control.object_id().replace('_', " "),
        "unique_id": unique_id,
        "state_topic": topics.state(control),
        "command_topic": topics.command(control),
        "device": { "identifiers": [device], "name": device },
    });
    match control {
        Control::Mode => {
            config["options"] = json!(PreinfusionMode::OPTIONS.iter().map(|m| m.as_str()).collect::<Vec<_>>());
        }
        Control::TargetTemperature => {
            config["min"] = json!(controls::TARGET_TEMPERATURE_RANGE.0);
            config["max"] = json!(controls::TARGET_TEMPERATURE_RANGE.1);
            config["step"] = json!(0.1);
            config["unit_of_measurement"] = json!("°C");
        }
        Control::SteamPower => {
            config["min"] = json!(controls::STEAM_POWER_RANGE.0);
            config["max"] = json!(controls::STEAM_POWER_RANGE.1);
            config["step"] = json!(1);
        }
        Control::PreinfusionTime => {
            config["min"] = json!(controls::PREINFUSION_TIME_RANGE.0);
            config["max"] = json!(controls::PREINFUSION_TIME_RANGE.1);
            config["step"] = json!(0.1);
            config["unit_of_measurement"] = json!("s");
        }
        Control::LastShot => {
            config["min"] = json!(0);
            config["step"] = json!(0.1);
            config["unit_of_measurement"] = json!("s");
        }
        Control::Power | Control::Backflush => {}
    }
    config
}

pub struct AutomationBridge<L: NetworkLink, S: BrokerSession> {
    link: L,
    session: S,
    config: AutomationConfig,
    topics: Topics,
    shadow: MachineShadow,
    handlers: Vec<Arc<dyn ControlHandler>>,
    outbound: &'static OutboundChannel,
    link_up: bool,
    session_up: bool,
}

impl<L: NetworkLink, S: BrokerSession> AutomationBridge<L, S> {
    pub fn new(link: L, session: S, config: AutomationConfig, outbound: &'static OutboundChannel) -> Self {
        let topics = Topics::new(&config.discovery_prefix, &config.device_id);
        Self {
            link,
            session,
            config,
            topics,
            shadow: MachineShadow::default(),
            handlers: Vec::new(),
            outbound,
            link_up: false,
            session_up: false,
        }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn ControlHandler>) {
        self.handlers.push(handler);
    }

    pub fn shadow(&self) -> &MachineShadow {
        &self.shadow
    }

    pub fn is_session_up(&self) -> bool {
        self.session_up
    }

    pub fn step(&mut self) -> Step {
        if !self.link.is_up() {
            if self.link_up {
                warn!("📶 Network link lost");
                self.link_up = false;
                self.session_up = false;
            }
            match self.link.reconnect() {
                Ok(()) => info!("📶 Network link reconnected"),
                Err(e) => warn!("📶 Reconnect failed: {}", e),
            }
            return Step::Backoff;
        }
        self.link_up = true;

        let mut handled = 0;
        while let Some(event) = self.session.poll() {
            self.on_event(event);
            handled += 1;
        }
        if self.session_up {
            self.flush_outbound();
        }
        Step::Serviced(handled)
    }

    pub fn run(mut self) -> ! {
        let backoff = Duration::from_millis(self.config.reconnect_backoff_ms);
        let period = Duration::from_millis(self.config.loop_period_ms);
        info!("🏠 Automation bridge running ({})", self.config.broker_url);
        loop {
            match self.step() {
                Step::Backoff => std::thread::sleep(backoff),
                Step::Serviced(_) => std::thread::sleep(period),
            }
        }
    }

    fn on_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => self.on_session_up(),
            BrokerEvent::Disconnected => {
                if self.session_up {
                    warn!("🏠 Broker session lost");
                }
                self.session_up = false;
            }
            BrokerEvent::Message { topic, payload } => self.on_message(&topic, &payload),
        }
    }

    fn on_session_up(&mut self) {
        info!("🏠 Broker session established");
        self.session_up = true;

        for control in Control::ALL {
            let config_topic = format!(
                "{}/{}/{}_{}/config",
                self.config.discovery_prefix,
                control.component(),
                self.config.device_id,
                control.object_id()
            );
            let document = discovery_config(&self.topics, &self.config.device_id, control).to_string();
            if let Err(e) = self.session.publish(&config_topic, document.as_bytes(), true) {
                warn!("Discovery for {} failed: {}", control.object_id(), e);
            }
        }
        for topic in self.topics.subscriptions() {
            if let Err(e) = self.session.subscribe(&topic) {
                warn!("Subscribe {} failed: {}", topic, e);
            }
        }
        if let Err(e) = self.session.publish(&self.config.presence_topic, b"online", false) {
            warn!("Presence publish failed: {}", e);
        }
    }

    fn on_message(&mut self, topic: &str, payload: &[u8]) {
        let Some((control, kind)) = self.topics.classify(topic) else {
            debug!("Ignoring message on {}", topic);
            return;
        };
        let value = match ControlValue::parse(control, payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("🏠 Rejected {}: {}", topic, e);
                return;
            }
        };

        match kind {
            TopicKind::Command => {
                self.shadow.apply(value);
                if control.acknowledges() {
                    self.publish_state(value);
                }
                for handler in &self.handlers {
                    handler.on_command(value);
                }
                self.notify_shadow();
            }
            TopicKind::State => {
                let before = self.shadow.clone();
                self.shadow.apply(value);
                if self.shadow != before {
                    debug!("Mirror {} = {}", control.object_id(), value.encode());
                    self.notify_shadow();
                }
            }
        }
    }

    fn flush_outbound(&mut self) {
        while let Ok(value) = self.outbound.try_receive() {
            self.shadow.apply(value);
            self.publish_state(value);
            self.notify_shadow();
        }
    }

    fn publish_state(&mut self, value: ControlValue) {
        let topic = self.topics.state(value.control());
        if let Err(e) = self.session.publish(&topic, value.encode().as_bytes(), true) {
            warn!("State publish on {} failed: {}", topic, e);
        }
    }

    fn notify_shadow(&self) {
        for handler in &self.handlers {
            handler.on_shadow_changed(&self.shadow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockBroker, MockNetwork, Published};
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingHandler {
        commands: Mutex<Vec<ControlValue>>,
        shadows: Mutex<Vec<MachineShadow>>,
    }

    impl ControlHandler for CapturingHandler {
        fn on_command(&self, value: ControlValue) {
            self.commands.lock().unwrap().push(value);
        }

        fn on_shadow_changed(&self, shadow: &MachineShadow) {
            self.shadows.lock().unwrap().push(shadow.clone());
        }
    }

    fn leak_outbound() -> &'static OutboundChannel {
        Box::leak(Box::new(OutboundChannel::new()))
    }

    struct Rig {
        network: MockNetwork,
        broker: MockBroker,
        handler: Arc<CapturingHandler>,
        outbound: &'static OutboundChannel,
        bridge: AutomationBridge<MockNetwork, MockBroker>,
    }

    fn rig(link_up: bool) -> Rig {
        let network = MockNetwork::new(link_up);
        let broker = MockBroker::new();
        let handler = Arc::new(CapturingHandler::default());
        let outbound = leak_outbound();
        let mut bridge = AutomationBridge::new(network.clone(), broker.clone(), AutomationConfig::default(), outbound);
        bridge.add_handler(handler.clone());
        Rig { network, broker, handler, outbound, bridge }
    }

    fn connected_rig() -> Rig {
        let mut rig = rig(true);
        rig.broker.push(BrokerEvent::Connected);
        rig.bridge.step();
        rig.broker.take_published();
        rig
    }

    fn command(rig: &Rig, control: Control, payload: &str) {
        let topics = Topics::new("homeassistant", "linea_micra");
        rig.broker.push(BrokerEvent::Message {
            topic: topics.command(control),
            payload: payload.as_bytes().to_vec(),
        });
    }

    #[test]
    fn test_session_up_subscribes_and_announces() {
        let mut rig = rig(true);
        rig.broker.push(BrokerEvent::Connected);

        assert_eq!(rig.bridge.step(), Step::Serviced(1));

        assert!(rig.bridge.is_session_up());
        assert_eq!(rig.broker.subscriptions().len(), 14);
        let published = rig.broker.take_published();
        assert_eq!(
            published.last(),
            Some(&Published {
                topic: "shotstopper/status".to_string(),
                payload: b"online".to_vec(),
                retain: false,
            })
        );
        let discovery = published.iter().filter(|p| p.topic.ends_with("/config")).count();
        assert_eq!(discovery, 7);
    }

    #[test]
    fn test_resubscribes_after_reconnect() {
        let mut rig = connected_rig();
        rig.broker.push(BrokerEvent::Disconnected);
        rig.broker.push(BrokerEvent::Connected);

        rig.bridge.step();

        assert_eq!(rig.broker.subscriptions().len(), 28);
        assert!(rig
            .broker
            .take_published()
            .iter()
            .any(|p| p.topic == "shotstopper/status"));
    }

    #[test]
    fn test_link_down_reconnects_and_backs_off() {
        let mut rig = rig(false);
        rig.broker.push(BrokerEvent::Connected);

        assert_eq!(rig.bridge.step(), Step::Backoff);
        assert_eq!(rig.network.reconnects(), 1);
        // Broker is not serviced while the link is down.
        assert!(!rig.bridge.is_session_up());

        assert_eq!(rig.bridge.step(), Step::Serviced(1));
        assert!(rig.bridge.is_session_up());
    }

    #[test]
    fn test_link_loss_drops_session() {
        let mut rig = connected_rig();
        rig.network.set_up(false);
        rig.network.set_recovers(false);

        assert_eq!(rig.bridge.step(), Step::Backoff);
        assert!(!rig.bridge.is_session_up());
        assert_eq!(rig.bridge.step(), Step::Backoff);
        assert_eq!(rig.network.reconnects(), 2);
    }

    #[test]
    fn test_command_updates_shadow_acks_and_notifies() {
        let mut rig = connected_rig();
        command(&rig, Control::TargetTemperature, "93.5");

        rig.bridge.step();

        assert_eq!(rig.bridge.shadow().target_temperature, Some(93.5));
        assert_eq!(
            rig.broker.take_published(),
            vec![Published {
                topic: "homeassistant/number/linea_micra_target_temp/state".to_string(),
                payload: b"93.5".to_vec(),
                retain: true,
            }]
        );
        assert_eq!(*rig.handler.commands.lock().unwrap(), vec![ControlValue::TargetTemperature(93.5)]);
        assert_eq!(rig.handler.shadows.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_command_is_rejected_silently() {
        let mut rig = connected_rig();
        command(&rig, Control::SteamPower, "4");
        command(&rig, Control::Mode, "Espresso");

        rig.bridge.step();

        assert_eq!(rig.bridge.shadow(), &MachineShadow::default());
        assert!(rig.broker.take_published().is_empty());
        assert!(rig.handler.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_last_shot_is_not_echoed() {
        let mut rig = connected_rig();
        command(&rig, Control::LastShot, "27.3");

        rig.bridge.step();

        assert_eq!(rig.bridge.shadow().last_shot, Some(27.3));
        assert!(rig.broker.take_published().is_empty());
    }

    #[test]
    fn test_state_mirror_updates_shadow_without_echo() {
        let mut rig = connected_rig();
        let topics = Topics::new("homeassistant", "linea_micra");
        rig.broker.push(BrokerEvent::Message {
            topic: topics.state(Control::Power),
            payload: b"ON".to_vec(),
        });
        rig.broker.push(BrokerEvent::Message {
            topic: topics.state(Control::Power),
            payload: b"ON".to_vec(),
        });

        rig.bridge.step();

        assert_eq!(rig.bridge.shadow().power, Some(true));
        assert!(rig.broker.take_published().is_empty());
        assert!(rig.handler.commands.lock().unwrap().is_empty());
        // Second identical mirror is not a change.
        assert_eq!(rig.handler.shadows.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_outbound_setters_publish_state() {
        let mut rig = connected_rig();
        let handle = AutomationHandle::new(rig.outbound);

        handle.set_machine_power(true).unwrap();
        handle.trigger_backflush().unwrap();
        handle.set_preinfusion_mode(1).unwrap();
        rig.bridge.step();

        let topics: Vec<String> = rig.broker.take_published().into_iter().map(|p| p.topic).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/switch/linea_micra_power/state",
                "homeassistant/switch/linea_micra_backflush/state",
                "homeassistant/select/linea_micra_mode/state",
            ]
        );
        assert_eq!(rig.bridge.shadow().mode, Some(PreinfusionMode::PreInfusion));
    }

    #[test]
    fn test_outbound_setters_validate() {
        let handle = AutomationHandle::new(leak_outbound());

        assert!(matches!(handle.set_steam_power(0), Err(BridgeError::OutOfRange { .. })));
        assert!(matches!(handle.set_preinfusion_mode(3), Err(BridgeError::OutOfRange { .. })));
        assert!(matches!(handle.set_target_temperature(120.0), Err(BridgeError::OutOfRange { .. })));
        assert!(handle.set_preinfusion_time(2.5).is_ok());
    }

    #[test]
    fn test_outbound_held_until_session_up() {
        let mut rig = rig(true);
        let handle = AutomationHandle::new(rig.outbound);
        handle.set_steam_power(2).unwrap();

        rig.bridge.step();
        assert!(rig.broker.take_published().is_empty());

        rig.broker.push(BrokerEvent::Connected);
        rig.bridge.step();
        assert!(rig
            .broker
            .take_published()
            .iter()
            .any(|p| p.topic == "homeassistant/number/linea_micra_steam_power/state" && p.payload == b"2"));
    }

    #[test]
    fn test_forwarding_never_blocks_on_full_queue() {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        assert!(forward_broker_event(&tx, BrokerEvent::Connected));
        assert!(forward_broker_event(&tx, BrokerEvent::Disconnected));

        assert_eq!(rx.try_recv().unwrap(), BrokerEvent::Connected);
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!forward_broker_event(&tx, BrokerEvent::Connected));
    }

    #[test]
    fn test_discovery_document() {
        let topics = Topics::new("homeassistant", "linea_micra");
        let doc = discovery_config(&topics, "linea_micra", Control::Mode);
        assert_eq!(doc["unique_id"], "linea_micra_mode");
        assert_eq!(doc["command_topic"], "homeassistant/select/linea_micra_mode/set");
        assert_eq!(doc["options"][2], "Disabled");

        let doc = discovery_config(&topics, "linea_micra", Control::LastShot);
        assert_eq!(doc["command_topic"], "homeassistant/number/linea_micra_last_shot/set");
    }

    #[test]
    fn test_every_subscribed_command_topic_is_advertised() {
        let mut rig = rig(true);
        rig.broker.push(BrokerEvent::Connected);
        rig.bridge.step();

        let published = rig.broker.take_published();
        let subscriptions = rig.broker.subscriptions();
        for control in Control::ALL {
            let command = rig.bridge.topics.command(control);
            assert!(subscriptions.contains(&command));
            let config = published
                .iter()
                .find(|p| p.topic.ends_with(&format!("linea_micra_{}/config", control.object_id())))
                .map(|p| serde_json::from_slice::<serde_json::Value>(&p.payload).unwrap())
                .unwrap();
            assert_eq!(config["command_topic"], command.as_str());
        }
    }
}
