use embassy_executor::Spawner;
use log::{error, info, warn};
use shotstopper_rs::automation::OutboundChannel;
use shotstopper_rs::commands::{CommandChannel, CommandSender};
use shotstopper_rs::debounce::DebounceTimer;
use shotstopper_rs::input::InputAdapter;
use shotstopper_rs::radio::RadioEventChannel;
use shotstopper_rs::state::StateManager;
use shotstopper_rs::storage::{SettingsPersister, SettingsStore};
use shotstopper_rs::system::config::{ConfigManager, ControllerConfig};
use shotstopper_rs::system::events::{LogNotifier, Notifiers};
use shotstopper_rs::types::Command;
use shotstopper_rs::worker::RadioWorker;
use std::sync::Arc;

static COMMANDS: CommandChannel = CommandChannel::new();
static RADIO_EVENTS: RadioEventChannel = RadioEventChannel::new();
static OUTBOUND: OutboundChannel = OutboundChannel::new();

#[cfg(target_os = "espidf")]
type Radio = shotstopper_rs::radio::nimble::NimbleRadio;
#[cfg(not(target_os = "espidf"))]
type Radio = shotstopper_rs::radio::sim::SimulatedPeripheral;

/// Everything the radio core and the knob share.
struct Core {
    state: Arc<StateManager>,
    sender: CommandSender,
    debounce: Arc<DebounceTimer>,
    input: InputAdapter,
}

fn build_core(config: &ControllerConfig, notifiers: Notifiers, store: &SettingsStore) -> Core {
    let initial = if store.is_mock() {
        config.input.default_value
    } else {
        store.settings().last_target
    };
    info!("Starting with target weight {}g", initial);

    let state = Arc::new(StateManager::with_bounds(
        Arc::new(notifiers),
        initial,
        config.input.min_value,
        config.input.max_value,
    ));
    let sender = CommandSender::new(&COMMANDS, state.clone(), config.radio.submit_wait());
    let debounce = Arc::new(DebounceTimer::new(config.input.debounce()));
    let input = InputAdapter::new(state.clone(), debounce.clone());
    Core {
        state,
        sender,
        debounce,
        input,
    }
}

#[embassy_executor::task]
async fn radio_task(mut worker: RadioWorker<Radio>) {
    worker.run().await
}

#[embassy_executor::task]
async fn debounce_task(timer: Arc<DebounceTimer>, state: Arc<StateManager>, sender: CommandSender) {
    timer.run(&state, &sender).await
}

fn spawn_core(spawner: &Spawner, core: &Core, radio: Radio, config: &ControllerConfig) -> anyhow::Result<()> {
    let worker = RadioWorker::new(radio, config.radio.clone(), core.state.clone(), &COMMANDS, &RADIO_EVENTS);
    spawner
        .spawn(radio_task(worker))
        .map_err(|_| anyhow::anyhow!("Failed to spawn radio task"))?;
    spawner
        .spawn(debounce_task(core.debounce.clone(), core.state.clone(), core.sender.clone()))
        .map_err(|_| anyhow::anyhow!("Failed to spawn debounce task"))?;
    Ok(())
}

async fn boot_read(core: &Core) {
    if let Err(e) = core.sender.submit(Command::read_value()).await {
        warn!("Boot read not queued: {}", e);
    }
}

#[cfg(target_os = "espidf")]
mod device {
    use super::*;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::cpu::Core as CpuCore;
    use esp_idf_svc::hal::delay::FreeRtos;
    use esp_idf_svc::hal::gpio::IOPin;
    use esp_idf_svc::hal::i2c::I2cDriver;
    use esp_idf_svc::hal::prelude::Peripherals;
    use esp_idf_svc::hal::task::thread::ThreadSpawnConfiguration;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use shotstopper_rs::automation::esp::{MqttSession, WifiLink};
    use shotstopper_rs::automation::{AutomationBridge, LogControlHandler};
    use shotstopper_rs::hardware::display::{create_display_controller, DisplayController, DisplaySink};
    use shotstopper_rs::hardware::knob::Knob;
    use shotstopper_rs::radio::nimble::NimbleRadio;
    use std::time::{Duration, Instant};

    const REDRAW_INTERVAL: Duration = Duration::from_millis(50);

    fn spawn_pinned<F>(name: &'static [u8], core: CpuCore, stack_size: usize, f: F) -> anyhow::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        ThreadSpawnConfiguration {
            name: Some(name),
            stack_size,
            pin_to_core: Some(core),
            ..Default::default()
        }
        .set()?;
        std::thread::Builder::new().stack_size(stack_size).spawn(f)?;
        ThreadSpawnConfiguration::default().set()?;
        Ok(())
    }

    fn ui_loop(
        mut knob: Knob,
        mut display: Option<DisplayController<I2cDriver<'static>>>,
        sink: Arc<DisplaySink>,
        input: InputAdapter,
    ) -> ! {
        let mut last_draw = Instant::now();
        loop {
            if let Some(tick) = knob.poll() {
                input.on_tick(tick);
            }
            if last_draw.elapsed() >= REDRAW_INTERVAL {
                last_draw = Instant::now();
                if let (Some(panel), Some(state)) = (display.as_mut(), sink.take_dirty()) {
                    if let Err(e) = panel.render(&state) {
                        warn!("Display refresh failed: {:?}", e);
                    }
                }
            }
            FreeRtos::delay_ms(1);
        }
    }

    pub async fn run(spawner: Spawner) -> anyhow::Result<()> {
        let config = ConfigManager::load()?.get_handle();

        let peripherals = Peripherals::take()?;
        let nvs = EspDefaultNvsPartition::take()?;
        let sys_loop = EspSystemEventLoop::take()?;

        let store = Arc::new(SettingsStore::new(nvs.clone()));
        let sink = Arc::new(DisplaySink::new());
        let notifiers = Notifiers::new()
            .with(Arc::new(LogNotifier))
            .with(sink.clone())
            .with(Arc::new(SettingsPersister::new(store.clone())));
        let core = build_core(&config, notifiers, &store);

        let radio = NimbleRadio::new(&config.radio, &RADIO_EVENTS)?;
        spawn_core(&spawner, &core, radio, &config)?;

        // Home automation shares the radio core with the worker.
        let wifi = WifiLink::start(peripherals.modem, sys_loop, nvs, &config.network)?;
        let mqtt = MqttSession::start(&config.automation)?;
        let mut bridge = AutomationBridge::new(wifi, mqtt, config.automation.clone(), &OUTBOUND);
        bridge.add_handler(Arc::new(LogControlHandler));
        bridge.add_handler(sink.clone());
        spawn_pinned(b"automation\0", CpuCore::Core1, 8 * 1024, move || bridge.run())?;

        let knob = Knob::new(
            peripherals.pins.gpio8.downgrade(),
            peripherals.pins.gpio7.downgrade(),
        )?;
        let display = match create_display_controller(
            peripherals.i2c0,
            peripherals.pins.gpio5.downgrade(),
            peripherals.pins.gpio6.downgrade(),
        ) {
            Ok(display) => Some(display),
            Err(e) => {
                warn!("Display unavailable: {:?} - continuing headless", e);
                None
            }
        };
        let input = core.input.clone();
        spawn_pinned(b"ui\0", CpuCore::Core0, 8 * 1024, move || ui_loop(knob, display, sink, input))?;

        boot_read(&core).await;
        Ok(())
    }
}

#[cfg(not(target_os = "espidf"))]
mod host {
    use super::*;
    use shotstopper_rs::automation::controls::{Control, Topics};
    use shotstopper_rs::automation::mock::{MockBroker, MockNetwork};
    use shotstopper_rs::automation::{AutomationBridge, AutomationHandle, BrokerEvent, LogControlHandler};
    use shotstopper_rs::radio::sim::{SimPeripheral, SimulatedPeripheral};
    use shotstopper_rs::types::Tick;
    use std::time::Duration;

    /// Drives the same core against a simulated peripheral and an in-memory broker.
    pub async fn run(spawner: Spawner) -> anyhow::Result<()> {
        let config = ConfigManager::new(ControllerConfig::default()).get_handle();
        let store = SettingsStore::mock();
        let core = build_core(&config, Notifiers::new().with(Arc::new(LogNotifier)), &store);

        let radio = SimulatedPeripheral::new(
            SimPeripheral::new(config.radio.service_uuid, config.radio.characteristic_uuid, 40),
            &RADIO_EVENTS,
        );
        let peripheral = radio.handle();
        spawn_core(&spawner, &core, radio, &config)?;

        let broker = MockBroker::new();
        let mut bridge = AutomationBridge::new(MockNetwork::new(true), broker.clone(), config.automation.clone(), &OUTBOUND);
        bridge.add_handler(Arc::new(LogControlHandler));
        std::thread::Builder::new()
            .name("automation".into())
            .spawn(move || bridge.run())?;

        let topics = Topics::new(&config.automation.discovery_prefix, &config.automation.device_id);
        broker.push(BrokerEvent::Connected);
        broker.push(BrokerEvent::Message {
            topic: topics.command(Control::TargetTemperature),
            payload: b"93.5".to_vec(),
        });
        if let Err(e) = AutomationHandle::new(&OUTBOUND).trigger_backflush() {
            warn!("{}", e);
        }

        boot_read(&core).await;

        let input = core.input.clone();
        let state = core.state.clone();
        std::thread::Builder::new().name("knob".into()).spawn(move || {
            std::thread::sleep(Duration::from_secs(1));
            for _ in 0..3 {
                input.on_tick(Tick::Left);
                std::thread::sleep(Duration::from_millis(100));
            }
            std::thread::sleep(Duration::from_secs(3));
            info!(
                "Demo done: target {}g, confirmed {}, peripheral holds {:?}, published {} messages",
                state.desired(),
                state.is_confirmed(),
                peripheral.stored_value(),
                broker.take_published().len()
            );
            std::process::exit(0);
        })?;
        Ok(())
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    #[cfg(target_os = "espidf")]
    {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
    }
    #[cfg(not(target_os = "espidf"))]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting ShotStopper knob controller");

    #[cfg(target_os = "espidf")]
    let result = device::run(spawner).await;
    #[cfg(not(target_os = "espidf"))]
    let result = host::run(spawner).await;

    if let Err(e) = result {
        error!("Startup failed: {:?}", e);
    }
}
