//! The single consumer of the command queue and the only code that touches the radio.

use crate::commands::CommandChannel;
use crate::radio::{
    decode_value, encode_value, RadioError, RadioEvent, RadioEventChannel, RadioSession, RadioStack,
};
use crate::session::{SessionInput, SessionMachine, SessionPhase};
use crate::state::StateManager;
use crate::system::config::RadioConfig;
use crate::types::{Command, CommandKind, LinkStatus};
use embassy_futures::select::{select, Either};
use embassy_time::{with_timeout, Duration, TimeoutError};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;

/// Extra time granted on top of the scan window before the scan call is abandoned.
const SCAN_MARGIN: Duration = Duration::from_secs(2);

async fn bounded<T, F>(budget: Duration, op: &'static str, fut: F) -> Result<T, RadioError>
where
    F: Future<Output = Result<T, RadioError>>,
{
    match with_timeout(budget, fut).await {
        Ok(result) => result,
        Err(TimeoutError) => Err(RadioError::Timeout(op)),
    }
}

pub struct RadioWorker<R: RadioStack> {
    radio: R,
    config: RadioConfig,
    state: Arc<StateManager>,
    commands: &'static CommandChannel,
    events: &'static RadioEventChannel,
    machine: SessionMachine,
    session: Option<RadioSession<R>>,
}

impl<R: RadioStack> RadioWorker<R> {
    pub fn new(
        radio: R,
        config: RadioConfig,
        state: Arc<StateManager>,
        commands: &'static CommandChannel,
        events: &'static RadioEventChannel,
    ) -> Self {
        Self {
            radio,
            config,
            state,
            commands,
            events,
            machine: SessionMachine::new(),
            session: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.machine.phase()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub async fn run(&mut self) -> ! {
        info!("Radio worker started");
        loop {
            match select(self.commands.receive(), self.events.receive()).await {
                Either::First(command) => self.handle(command).await,
                Either::Second(event) => self.on_radio_event(event),
            }
        }
    }

    /// Runs one command to completion. In-flight commands are never cancelled.
    pub async fn handle(&mut self, command: Command) {
        info!("Radio command: {:?}", command);
        self.drain_events();

        match command.kind {
            CommandKind::Connect => {
                self.establish().await;
            }
            CommandKind::Disconnect => self.teardown().await,
            CommandKind::ReadValue => {
                self.read_value().await;
                self.teardown().await;
            }
            CommandKind::WriteValue => {
                self.write_value(command.payload).await;
                self.teardown().await;
            }
        }
    }

    fn apply(&mut self, input: SessionInput) {
        for status in self.machine.handle(input) {
            self.state.set_link_status(status);
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::PeerDisconnected { reason } => {
                // The link is already gone; dropping the session skips the radio release.
                if self.session.take().is_some() {
                    warn!("Peripheral dropped the link (reason {})", reason);
                } else {
                    debug!("Disconnect event without a session (reason {})", reason);
                }
                self.apply(SessionInput::PeerDisconnected);
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_receive() {
            self.on_radio_event(event);
        }
    }

    /// True when an operation failure was caused by the peer going away.
    fn link_lost(&mut self) -> bool {
        self.drain_events();
        self.session.is_none()
    }

    /// Scan, connect and resolve. Returns whether the session is Ready.
    async fn establish(&mut self) -> bool {
        if self.session.is_some() && self.machine.is_ready() {
            debug!("Session already ready");
            self.state.set_link_status(LinkStatus::Connected);
            return true;
        }

        self.apply(SessionInput::ConnectRequested);

        let scan_budget = self.config.scan.duration() + SCAN_MARGIN;
        let service_uuid = self.config.service_uuid;
        let scanned = bounded(
            scan_budget,
            "scan",
            self.radio.scan(&self.config.scan, &service_uuid),
        )
        .await
        .and_then(|found| found.ok_or(RadioError::PeripheralNotFound));
        let device = match scanned {
            Ok(device) => device,
            Err(e) => {
                warn!("Scan failed: {}", e);
                self.apply(SessionInput::ScanFailed);
                self.apply(SessionInput::Released);
                return false;
            }
        };
        self.apply(SessionInput::DeviceFound);

        let timeout = self.config.operation_timeout();
        let link = match bounded(timeout, "connect", self.radio.connect(&device)).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.apply(SessionInput::LinkFailed);
                self.apply(SessionInput::Released);
                return false;
            }
        };

        match self.resolve(&link).await {
            Ok(characteristic) => {
                self.session = Some(RadioSession {
                    device,
                    link,
                    characteristic,
                });
                self.apply(SessionInput::Resolved);
                true
            }
            Err(e) => {
                warn!("GATT lookup failed: {}", e);
                self.apply(SessionInput::ResolveFailed);
                self.release(link).await;
                self.apply(SessionInput::Released);
                false
            }
        }
    }

    async fn resolve(&mut self, link: &R::Link) -> Result<R::Characteristic, RadioError> {
        let timeout = self.config.operation_timeout();
        let service_uuid = self.config.service_uuid;
        let characteristic_uuid = self.config.characteristic_uuid;

        let service = bounded(timeout, "service discovery", self.radio.find_service(link, &service_uuid))
            .await?
            .ok_or(RadioError::ServiceNotFound(service_uuid))?;
        bounded(
            timeout,
            "characteristic discovery",
            self.radio.find_characteristic(link, &service, &characteristic_uuid),
        )
        .await?
        .ok_or(RadioError::CharacteristicNotFound(characteristic_uuid))
    }

    async fn release(&mut self, link: R::Link) {
        let timeout = self.config.operation_timeout();
        if let Err(e) = bounded(timeout, "disconnect", self.radio.disconnect(link)).await {
            warn!("Releasing link: {}", e);
        }
    }

    async fn teardown(&mut self) {
        if self.machine.is_idle() && self.session.is_none() {
            return;
        }
        self.apply(SessionInput::DisconnectRequested);
        if let Some(session) = self.session.take() {
            self.release(session.link).await;
        }
        self.apply(SessionInput::Released);
    }

    async fn read_current(&mut self) -> Result<Option<i8>, RadioError> {
        let timeout = self.config.operation_timeout();
        let session = self.session.as_ref().ok_or(RadioError::NotConnected)?;
        let payload = bounded(
            timeout,
            "read",
            self.radio.read(&session.link, &session.characteristic),
        )
        .await?;
        Ok(decode_value(&payload))
    }

    async fn write_and_verify(&mut self, value: i8) -> Result<Option<i8>, RadioError> {
        let timeout = self.config.operation_timeout();
        let session = self.session.as_ref().ok_or(RadioError::NotConnected)?;
        bounded(
            timeout,
            "write",
            self.radio
                .write(&session.link, &session.characteristic, &encode_value(value), true),
        )
        .await?;
        self.read_current().await
    }

    async fn read_value(&mut self) {
        if !self.establish().await {
            return;
        }

        let mut result = self.read_current().await;
        if result.is_err() && self.link_lost() {
            info!("Link lost during read, re-establishing once");
            if !self.establish().await {
                return;
            }
            result = self.read_current().await;
        }

        match result {
            Ok(Some(value)) => self.state.confirm(value),
            Ok(None) => debug!("Empty read, keeping {}", self.state.desired()),
            Err(e) => {
                warn!("Read failed: {}", e);
                self.apply(SessionInput::OperationFailed);
            }
        }
    }

    async fn write_value(&mut self, value: i8) {
        if !self.establish().await {
            return;
        }

        let mut result = self.write_and_verify(value).await;
        if result.is_err() && self.link_lost() {
            info!("Link lost during write, re-establishing once");
            if !self.establish().await {
                return;
            }
            result = self.write_and_verify(value).await;
        }

        match result {
            Ok(Some(read_back)) if read_back == value => self.state.confirm(value),
            Ok(read_back) => {
                warn!("Wrote {} but peripheral reports {:?}", value, read_back);
                self.apply(SessionInput::OperationFailed);
            }
            Err(e) => {
                warn!("Write failed: {}", e);
                self.apply(SessionInput::OperationFailed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{leak_channel, CommandSender};
    use crate::radio::sim::{SimHandle, SimPeripheral, SimulatedPeripheral};
    use crate::system::config::{DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};
    use crate::system::events::recording::{Notification, RecordingNotifier};
    use embassy_futures::block_on;

    struct Rig {
        worker: RadioWorker<SimulatedPeripheral>,
        sim: SimHandle,
        state: Arc<StateManager>,
        rec: Arc<RecordingNotifier>,
        sender: CommandSender,
        commands: &'static CommandChannel,
    }

    impl Rig {
        fn new(peripheral_value: i8) -> Self {
            let rec = RecordingNotifier::new();
            let state = Arc::new(StateManager::new(rec.clone()));
            let commands = leak_channel();
            let events: &'static RadioEventChannel = Box::leak(Box::new(RadioEventChannel::new()));
            let radio = SimulatedPeripheral::new(
                SimPeripheral::new(DEFAULT_SERVICE_UUID, DEFAULT_CHARACTERISTIC_UUID, peripheral_value),
                events,
            );
            let sim = radio.handle();
            let config = RadioConfig {
                operation_timeout_ms: 50,
                ..RadioConfig::default()
            };
            let worker = RadioWorker::new(radio, config, state.clone(), commands, events);
            let sender = CommandSender::new(commands, state.clone(), Duration::from_millis(10));
            Self {
                worker,
                sim,
                state,
                rec,
                sender,
                commands,
            }
        }

        /// Submit through the producer path, then let the worker consume it.
        fn run(&mut self, command: Command) {
            self.sender.try_submit(command).unwrap();
            let queued = self.commands.try_receive().unwrap();
            block_on(self.worker.handle(queued));
        }
    }

    #[test]
    fn test_boot_read_confirms_peripheral_value() {
        let mut rig = Rig::new(40);
        rig.run(Command::read_value());

        assert_eq!(rig.state.desired(), 40);
        assert!(rig.state.is_confirmed());
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
        assert_eq!(
            rig.rec.link_history(),
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Disconnected
            ]
        );
        let stats = rig.sim.stats();
        assert_eq!((stats.connects, stats.disconnects), (1, 1));
    }

    #[test]
    fn test_boot_read_unreachable_peripheral() {
        let mut rig = Rig::new(40);
        rig.sim.configure(|p| p.advertising = false);

        rig.run(Command::read_value());

        assert_eq!(rig.state.desired(), 36);
        assert_eq!(
            rig.rec.link_history(),
            vec![LinkStatus::Connecting, LinkStatus::Failed]
        );
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
        assert_eq!(rig.sim.stats().connects, 0);
    }

    #[test]
    fn test_read_with_failed_connect() {
        let mut rig = Rig::new(40);
        rig.sim.configure(|p| p.accepts_connections = false);

        rig.run(Command::read_value());

        assert_eq!(rig.state.desired(), 36);
        let failures = rig
            .rec
            .link_history()
            .into_iter()
            .filter(|s| *s == LinkStatus::Failed)
            .count();
        assert_eq!(failures, 1);
        assert!(!rig.state.is_confirmed());
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_write_confirmed_after_read_back() {
        let mut rig = Rig::new(36);
        rig.run(Command::write_value(33));

        assert_eq!(rig.sim.stats().writes, vec![33]);
        assert_eq!(rig.sim.stored_value(), Some(33));
        assert_eq!(rig.state.desired(), 33);
        let notes: Vec<_> = rig
            .rec
            .take()
            .into_iter()
            .filter(|n| !matches!(n, Notification::Link(_)))
            .collect();
        assert_eq!(notes, vec![Notification::Value(33), Notification::Confirmed(33)]);
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_write_mismatch_fails_without_confirmation() {
        let mut rig = Rig::new(36);
        rig.sim.configure(|p| p.write_skew = -1);

        rig.run(Command::write_value(50));

        assert_eq!(rig.sim.stored_value(), Some(49));
        assert_eq!(rig.state.desired(), 36);
        assert!(!rig.state.is_confirmed());
        let notes = rig.rec.take();
        assert!(!notes.iter().any(|n| matches!(n, Notification::Confirmed(_))));
        assert_eq!(notes.last(), Some(&Notification::Link(LinkStatus::Failed)));
        assert_eq!(rig.state.link_status(), LinkStatus::Failed);
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
        assert_eq!(rig.sim.stats().disconnects, 1);
    }

    #[test]
    fn test_empty_read_is_noop() {
        let mut rig = Rig::new(36);
        rig.sim.configure(|p| p.value = None);

        rig.run(Command::read_value());

        assert_eq!(rig.state.desired(), 36);
        assert!(!rig.state.is_confirmed());
        assert_eq!(rig.state.link_status(), LinkStatus::Disconnected);
    }

    #[test]
    fn test_missing_characteristic_releases_link() {
        let mut rig = Rig::new(36);
        rig.sim.configure(|p| p.exposes_characteristic = false);

        rig.run(Command::read_value());

        assert_eq!(rig.state.link_status(), LinkStatus::Failed);
        assert!(!rig.sim.is_linked());
        assert_eq!(rig.sim.stats().disconnects, 1);
        assert!(!rig.worker.has_session());
    }

    #[test]
    fn test_connect_timeout_is_a_failure() {
        let mut rig = Rig::new(36);
        rig.sim.configure(|p| p.connect_hangs = true);

        rig.run(Command::connect());

        assert_eq!(rig.state.link_status(), LinkStatus::Failed);
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_connect_keeps_session_until_disconnect() {
        let mut rig = Rig::new(36);
        rig.run(Command::connect());
        assert_eq!(rig.worker.phase(), SessionPhase::Ready);
        assert!(rig.sim.is_linked());

        rig.run(Command::disconnect());
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
        assert!(!rig.sim.is_linked());
        assert_eq!(rig.state.link_status(), LinkStatus::Disconnected);
    }

    #[test]
    fn test_read_reuses_open_session() {
        let mut rig = Rig::new(42);
        rig.run(Command::connect());
        rig.run(Command::read_value());

        let stats = rig.sim.stats();
        assert_eq!(stats.scans, 1);
        assert_eq!(stats.connects, 1);
        assert_eq!(rig.state.desired(), 42);
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
        assert_eq!(
            rig.rec.link_history(),
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Disconnected
            ]
        );
    }

    #[test]
    fn test_peer_disconnect_between_commands() {
        let mut rig = Rig::new(36);
        rig.run(Command::connect());

        rig.sim.drop_link(0x13);
        rig.run(Command::disconnect());

        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
        // The peer already released the link; no second release.
        assert_eq!(rig.sim.stats().disconnects, 0);
        assert_eq!(rig.state.link_status(), LinkStatus::Disconnected);
    }

    #[test]
    fn test_peer_disconnect_mid_read_reestablishes_once() {
        let mut rig = Rig::new(45);
        rig.sim.configure(|p| p.drop_on_next_read = true);

        rig.run(Command::read_value());

        let stats = rig.sim.stats();
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.reads, 2);
        assert_eq!(rig.state.desired(), 45);
        assert!(rig.state.is_confirmed());
        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_run_loop_handles_peer_event() {
        let mut rig = Rig::new(36);
        rig.run(Command::connect());
        rig.sim.drop_link(8);

        // The event is consumed by the next receive in the run loop.
        let event = rig.worker.events.try_receive().unwrap();
        rig.worker.on_radio_event(event);

        assert_eq!(rig.worker.phase(), SessionPhase::Idle);
        assert!(!rig.worker.has_session());
    }
}
