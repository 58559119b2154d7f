// nimble.rs - RadioStack over the ESP-IDF NimBLE host, via direct FFI.
//
// NimBLE reports everything through C callbacks on its own host task. The
// callbacks only translate into `GattEvent`s on a static channel; the async
// side of each operation drains stale events, starts the call and waits for
// the matching completion.

use super::{advertises_service, uuid_le_bytes, RadioError, RadioEvent, RadioEventChannel, RadioStack};
use crate::system::config::{RadioConfig, ScanConfig};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::{with_timeout, Duration, Timer};
use esp_idf_svc::sys as esp_idf_sys;
use log::{debug, error, info, warn};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use uuid::Uuid;

const GATT_EVENT_QUEUE_DEPTH: usize = 8;
const MAX_READ_LEN: usize = 20;
/// BLE_ERR_REM_USER_CONN_TERM
const TERMINATE_REASON: u8 = 0x13;
const TERMINATE_WAIT: Duration = Duration::from_secs(2);

static SYNCED: AtomicBool = AtomicBool::new(false);

// Target of the current scan or discovery.
static TARGET_UUID: LazyLock<Mutex<Option<Uuid>>> = LazyLock::new(|| Mutex::new(None));

// Handle we are tearing down ourselves; its disconnect is not a peer event.
static LOCAL_TERMINATION: LazyLock<Mutex<Option<u16>>> = LazyLock::new(|| Mutex::new(None));

static PEER_EVENTS: LazyLock<Mutex<Option<&'static RadioEventChannel>>> = LazyLock::new(|| Mutex::new(None));

type GattEventChannel = Channel<CriticalSectionRawMutex, GattEvent, GATT_EVENT_QUEUE_DEPTH>;
static GATT_EVENTS: GattEventChannel = Channel::new();

#[derive(Clone, Debug)]
enum GattEvent {
    DeviceFound(BleAddress),
    ScanComplete,
    Connected { status: i32, handle: u16 },
    Terminated { handle: u16 },
    ServiceFound { start: u16, end: u16 },
    CharacteristicFound { val_handle: u16 },
    DiscoveryDone { status: u16 },
    ReadDone { status: u16, data: heapless::Vec<u8, MAX_READ_LEN> },
    WriteDone { status: u16 },
}

#[derive(Debug, Clone, Copy)]
pub struct BleAddress {
    pub addr: [u8; 6],
    pub addr_type: u8,
}

#[derive(Debug)]
pub struct NimbleLink {
    handle: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct NimbleService {
    start: u16,
    end: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct NimbleCharacteristic {
    val_handle: u16,
}

fn set_target(uuid: Option<&Uuid>) {
    if let Ok(mut target) = TARGET_UUID.lock() {
        *target = uuid.copied();
    }
}

fn target() -> Option<Uuid> {
    TARGET_UUID.lock().ok().and_then(|t| *t)
}

fn uuid_matches(uuid: &esp_idf_sys::ble_uuid_any_t, target: &Uuid) -> bool {
    unsafe {
        if uuid.u.type_ == esp_idf_sys::BLE_UUID_TYPE_128 as u8 {
            return uuid.u128_.value == uuid_le_bytes(target);
        }
        false
    }
}

fn check(op: &'static str, code: i32) -> Result<(), RadioError> {
    if code == 0 {
        Ok(())
    } else {
        Err(RadioError::Stack { op, code })
    }
}

fn gatt_status(op: &'static str, status: u16) -> Result<(), RadioError> {
    match status as u32 {
        0 => Ok(()),
        esp_idf_sys::BLE_HS_ENOTCONN => Err(RadioError::NotConnected),
        _ => Err(RadioError::Stack { op, code: status as i32 }),
    }
}

fn own_addr_type() -> u8 {
    let mut own_addr_type: u8 = 0;
    let ret = unsafe { esp_idf_sys::ble_hs_id_infer_auto(0, &mut own_addr_type) };
    if ret != 0 {
        warn!("Failed to infer own address type: {}", ret);
        own_addr_type = esp_idf_sys::BLE_OWN_ADDR_PUBLIC as u8;
    }
    own_addr_type
}

fn drain_stale() {
    while let Ok(event) = GATT_EVENTS.try_receive() {
        debug!("Discarding stale GATT event {:?}", event);
    }
}

fn push(event: GattEvent) {
    if GATT_EVENTS.try_send(event).is_err() {
        warn!("GATT event queue full");
    }
}

/// Cancels an in-flight GAP connect if the waiting future is dropped first.
struct PendingConnect {
    armed: bool,
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        if self.armed {
            warn!("Connect abandoned, cancelling GAP procedure");
            unsafe {
                esp_idf_sys::ble_gap_conn_cancel();
            }
        }
    }
}

pub struct NimbleRadio {
    connect_timeout: Duration,
}

impl NimbleRadio {
    /// Brings up the NimBLE host and routes peer disconnects to `events`.
    pub fn new(config: &RadioConfig, events: &'static RadioEventChannel) -> Result<Self, RadioError> {
        if let Ok(mut peer_events) = PEER_EVENTS.lock() {
            *peer_events = Some(events);
        }
        Self::initialize()?;
        Ok(Self {
            connect_timeout: config.link_timeout(),
        })
    }

    fn initialize() -> Result<(), RadioError> {
        info!("Initializing BLE host stack");
        unsafe {
            check("nimble_port_init", esp_idf_sys::nimble_port_init())?;
            esp_idf_sys::ble_hs_cfg.reset_cb = Some(Self::on_reset);
            esp_idf_sys::ble_hs_cfg.sync_cb = Some(Self::on_sync);
            esp_idf_sys::ble_hs_cfg.store_status_cb = Some(esp_idf_sys::ble_store_util_status_rr);
            esp_idf_sys::nimble_port_freertos_init(Some(Self::host_task));
        }
        Ok(())
    }

    extern "C" fn on_reset(reason: i32) {
        error!("BLE host reset, reason: {}", reason);
        SYNCED.store(false, Ordering::SeqCst);
    }

    extern "C" fn on_sync() {
        info!("BLE host synced");
        SYNCED.store(true, Ordering::SeqCst);
    }

    extern "C" fn host_task(_param: *mut c_void) {
        unsafe {
            esp_idf_sys::nimble_port_run();
        }
    }

    async fn wait_synced(&self) {
        while !SYNCED.load(Ordering::SeqCst) {
            Timer::after_millis(50).await;
        }
    }

    extern "C" fn scan_event_handler(event: *mut esp_idf_sys::ble_gap_event, _arg: *mut c_void) -> i32 {
        if event.is_null() {
            return 0;
        }
        unsafe {
            let event_ref = &*event;
            match event_ref.type_ as u32 {
                esp_idf_sys::BLE_GAP_EVENT_DISC => {
                    let disc = &event_ref.__bindgen_anon_1.disc;
                    let adv_data = std::slice::from_raw_parts(disc.data, disc.length_data as usize);
                    let Some(target) = target() else {
                        return 0;
                    };
                    if advertises_service(adv_data, &target) {
                        info!("Found peripheral (RSSI: {})", disc.rssi);
                        push(GattEvent::DeviceFound(BleAddress {
                            addr: disc.addr.val,
                            addr_type: disc.addr.type_,
                        }));
                    }
                }
                esp_idf_sys::BLE_GAP_EVENT_DISC_COMPLETE => push(GattEvent::ScanComplete),
                other => debug!("Unhandled scan event type: {}", other),
            }
        }
        0
    }

    extern "C" fn connection_event_handler(event: *mut esp_idf_sys::ble_gap_event, _arg: *mut c_void) -> i32 {
        if event.is_null() {
            return 0;
        }
        unsafe {
            let event_ref = &*event;
            match event_ref.type_ as u32 {
                esp_idf_sys::BLE_GAP_EVENT_CONNECT => {
                    let conn = &event_ref.__bindgen_anon_1.connect;
                    push(GattEvent::Connected {
                        status: conn.status,
                        handle: conn.conn_handle,
                    });
                }
                esp_idf_sys::BLE_GAP_EVENT_DISCONNECT => {
                    let disconnect = &event_ref.__bindgen_anon_1.disconnect;
                    let handle = disconnect.conn.conn_handle;
                    let local = match LOCAL_TERMINATION.lock() {
                        Ok(mut pending) if *pending == Some(handle) => {
                            *pending = None;
                            true
                        }
                        _ => false,
                    };
                    if local {
                        push(GattEvent::Terminated { handle });
                    } else {
                        warn!("Peer dropped link {}, reason: {}", handle, disconnect.reason);
                        if let Ok(Some(events)) = PEER_EVENTS.lock().map(|e| *e) {
                            let _ = events.try_send(RadioEvent::PeerDisconnected {
                                reason: disconnect.reason,
                            });
                        }
                    }
                }
                other => debug!("Unhandled connection event type: {}", other),
            }
        }
        0
    }

    extern "C" fn service_discovery_handler(
        _conn_handle: u16,
        error: *const esp_idf_sys::ble_gatt_error,
        service: *const esp_idf_sys::ble_gatt_svc,
        _arg: *mut c_void,
    ) -> i32 {
        unsafe {
            let status = if error.is_null() { 0 } else { (*error).status };
            if status != 0 {
                let status = if status as u32 == esp_idf_sys::BLE_HS_EDONE { 0 } else { status };
                push(GattEvent::DiscoveryDone { status });
                return 0;
            }
            if service.is_null() {
                return 0;
            }
            let svc = &*service;
            if target().is_some_and(|t| uuid_matches(&svc.uuid, &t)) {
                push(GattEvent::ServiceFound {
                    start: svc.start_handle,
                    end: svc.end_handle,
                });
            }
        }
        0
    }

    extern "C" fn characteristic_discovery_handler(
        _conn_handle: u16,
        error: *const esp_idf_sys::ble_gatt_error,
        chr: *const esp_idf_sys::ble_gatt_chr,
        _arg: *mut c_void,
    ) -> i32 {
        unsafe {
            let status = if error.is_null() { 0 } else { (*error).status };
            if status != 0 {
                let status = if status as u32 == esp_idf_sys::BLE_HS_EDONE { 0 } else { status };
                push(GattEvent::DiscoveryDone { status });
                return 0;
            }
            if chr.is_null() {
                return 0;
            }
            let chr_ref = &*chr;
            if target().is_some_and(|t| uuid_matches(&chr_ref.uuid, &t)) {
                push(GattEvent::CharacteristicFound {
                    val_handle: chr_ref.val_handle,
                });
            }
        }
        0
    }

    extern "C" fn read_handler(
        _conn_handle: u16,
        error: *const esp_idf_sys::ble_gatt_error,
        attr: *mut esp_idf_sys::ble_gatt_attr,
        _arg: *mut c_void,
    ) -> i32 {
        unsafe {
            let status = if error.is_null() { 0 } else { (*error).status };
            let mut data = heapless::Vec::new();
            if status == 0 && !attr.is_null() && !(*attr).om.is_null() {
                let om = &*(*attr).om;
                let bytes = std::slice::from_raw_parts(om.om_data, om.om_len as usize);
                let _ = data.extend_from_slice(&bytes[..bytes.len().min(MAX_READ_LEN)]);
            }
            push(GattEvent::ReadDone { status, data });
        }
        0
    }

    extern "C" fn write_handler(
        _conn_handle: u16,
        error: *const esp_idf_sys::ble_gatt_error,
        _attr: *mut esp_idf_sys::ble_gatt_attr,
        _arg: *mut c_void,
    ) -> i32 {
        let status = if error.is_null() { 0 } else { unsafe { (*error).status } };
        push(GattEvent::WriteDone { status });
        0
    }
}

impl RadioStack for NimbleRadio {
    type Device = BleAddress;
    type Link = NimbleLink;
    type Service = NimbleService;
    type Characteristic = NimbleCharacteristic;

    async fn scan(&mut self, scan: &ScanConfig, service: &Uuid) -> Result<Option<BleAddress>, RadioError> {
        self.wait_synced().await;
        unsafe {
            esp_idf_sys::ble_gap_disc_cancel();
        }
        drain_stale();
        set_target(Some(service));

        let mut disc_params: esp_idf_sys::ble_gap_disc_params = unsafe { std::mem::zeroed() };
        disc_params.itvl = scan.interval;
        disc_params.window = scan.window;
        disc_params.filter_policy = 0;
        disc_params.set_passive(if scan.active { 0 } else { 1 });
        disc_params.set_limited(0);
        disc_params.set_filter_duplicates(1);

        info!("Scanning for {} ({} ms)", service, scan.duration_ms);
        check("scan", unsafe {
            esp_idf_sys::ble_gap_disc(
                own_addr_type(),
                scan.duration_ms as i32,
                &disc_params,
                Some(Self::scan_event_handler),
                std::ptr::null_mut(),
            )
        })?;

        loop {
            match GATT_EVENTS.receive().await {
                GattEvent::DeviceFound(address) => {
                    unsafe {
                        esp_idf_sys::ble_gap_disc_cancel();
                    }
                    return Ok(Some(address));
                }
                GattEvent::ScanComplete => return Ok(None),
                other => debug!("Ignoring {:?} during scan", other),
            }
        }
    }

    async fn connect(&mut self, device: &BleAddress) -> Result<NimbleLink, RadioError> {
        unsafe {
            esp_idf_sys::ble_gap_disc_cancel();
            esp_idf_sys::ble_gap_conn_cancel();
        }
        drain_stale();

        let peer = esp_idf_sys::ble_addr_t {
            type_: device.addr_type,
            val: device.addr,
        };
        let conn_params = esp_idf_sys::ble_gap_conn_params {
            scan_itvl: 0x10,
            scan_window: 0x10,
            itvl_min: 24,
            itvl_max: 40,
            latency: 0,
            supervision_timeout: 256,
            min_ce_len: 0,
            max_ce_len: 0,
        };
        info!(
            "Connecting to {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            peer.val[5], peer.val[4], peer.val[3], peer.val[2], peer.val[1], peer.val[0]
        );
        check("connect", unsafe {
            esp_idf_sys::ble_gap_connect(
                own_addr_type(),
                &peer,
                self.connect_timeout.as_millis() as i32,
                &conn_params,
                Some(Self::connection_event_handler),
                std::ptr::null_mut(),
            )
        })?;
        let mut pending = PendingConnect { armed: true };

        loop {
            match GATT_EVENTS.receive().await {
                GattEvent::Connected { status: 0, handle } => {
                    pending.armed = false;
                    info!("BLE connection established, handle {}", handle);
                    return Ok(NimbleLink { handle });
                }
                GattEvent::Connected { status, .. } => {
                    pending.armed = false;
                    return Err(RadioError::Stack { op: "connect", code: status });
                }
                other => debug!("Ignoring {:?} during connect", other),
            }
        }
    }

    async fn find_service(&mut self, link: &NimbleLink, uuid: &Uuid) -> Result<Option<NimbleService>, RadioError> {
        drain_stale();
        set_target(Some(uuid));
        check("service discovery", unsafe {
            esp_idf_sys::ble_gattc_disc_all_svcs(link.handle, Some(Self::service_discovery_handler), std::ptr::null_mut())
        })?;

        let mut found = None;
        loop {
            match GATT_EVENTS.receive().await {
                GattEvent::ServiceFound { start, end } => {
                    debug!("Service {} at handles {}-{}", uuid, start, end);
                    found.get_or_insert(NimbleService { start, end });
                }
                GattEvent::DiscoveryDone { status } => {
                    gatt_status("service discovery", status)?;
                    return Ok(found);
                }
                other => debug!("Ignoring {:?} during service discovery", other),
            }
        }
    }

    async fn find_characteristic(
        &mut self,
        link: &NimbleLink,
        service: &NimbleService,
        uuid: &Uuid,
    ) -> Result<Option<NimbleCharacteristic>, RadioError> {
        drain_stale();
        set_target(Some(uuid));
        check("characteristic discovery", unsafe {
            esp_idf_sys::ble_gattc_disc_all_chrs(
                link.handle,
                service.start,
                service.end,
                Some(Self::characteristic_discovery_handler),
                std::ptr::null_mut(),
            )
        })?;

        let mut found = None;
        loop {
            match GATT_EVENTS.receive().await {
                GattEvent::CharacteristicFound { val_handle } => {
                    debug!("Characteristic {} at handle {}", uuid, val_handle);
                    found.get_or_insert(NimbleCharacteristic { val_handle });
                }
                GattEvent::DiscoveryDone { status } => {
                    gatt_status("characteristic discovery", status)?;
                    return Ok(found);
                }
                other => debug!("Ignoring {:?} during characteristic discovery", other),
            }
        }
    }

    async fn read(&mut self, link: &NimbleLink, characteristic: &NimbleCharacteristic) -> Result<Vec<u8>, RadioError> {
        drain_stale();
        check("read", unsafe {
            esp_idf_sys::ble_gattc_read(
                link.handle,
                characteristic.val_handle,
                Some(Self::read_handler),
                std::ptr::null_mut(),
            )
        })?;

        loop {
            match GATT_EVENTS.receive().await {
                GattEvent::ReadDone { status, data } => {
                    gatt_status("read", status)?;
                    return Ok(data.to_vec());
                }
                other => debug!("Ignoring {:?} during read", other),
            }
        }
    }

    async fn write(
        &mut self,
        link: &NimbleLink,
        characteristic: &NimbleCharacteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), RadioError> {
        drain_stale();
        if !with_response {
            return check("write", unsafe {
                esp_idf_sys::ble_gattc_write_no_rsp_flat(
                    link.handle,
                    characteristic.val_handle,
                    data.as_ptr() as *const c_void,
                    data.len() as u16,
                )
            });
        }

        check("write", unsafe {
            esp_idf_sys::ble_gattc_write_flat(
                link.handle,
                characteristic.val_handle,
                data.as_ptr() as *const c_void,
                data.len() as u16,
                Some(Self::write_handler),
                std::ptr::null_mut(),
            )
        })?;

        loop {
            match GATT_EVENTS.receive().await {
                GattEvent::WriteDone { status } => return gatt_status("write", status),
                other => debug!("Ignoring {:?} during write", other),
            }
        }
    }

    async fn disconnect(&mut self, link: NimbleLink) -> Result<(), RadioError> {
        set_target(None);
        drain_stale();
        if let Ok(mut local) = LOCAL_TERMINATION.lock() {
            *local = Some(link.handle);
        }

        let ret = unsafe { esp_idf_sys::ble_gap_terminate(link.handle, TERMINATE_REASON) };
        if ret as u32 == esp_idf_sys::BLE_HS_ENOTCONN {
            // Already gone; nothing will be reported for it.
            if let Ok(mut local) = LOCAL_TERMINATION.lock() {
                *local = None;
            }
            return Ok(());
        }
        check("disconnect", ret)?;

        let terminated = with_timeout(TERMINATE_WAIT, async {
            loop {
                if let GattEvent::Terminated { handle } = GATT_EVENTS.receive().await {
                    if handle == link.handle {
                        return;
                    }
                }
            }
        })
        .await;
        if terminated.is_err() {
            warn!("No disconnect confirmation for link {}", link.handle);
        }
        info!("BLE link {} released", link.handle);
        Ok(())
    }
}
