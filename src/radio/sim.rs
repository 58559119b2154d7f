//! In-memory stand-in for the target-weight peripheral.
//!
//! Used by the unit tests and by the host build's demo run. Behaviour is
//! scripted through a cloneable [`SimHandle`] so a test can reconfigure the
//! peripheral after the radio has been moved into the worker.

use super::{RadioError, RadioEvent, RadioEventChannel, RadioStack};
use crate::system::config::ScanConfig;
use embassy_time::Timer;
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub advertising: bool,
    pub accepts_connections: bool,
    /// Connect never completes; only a caller-side timeout gets out of it.
    pub connect_hangs: bool,
    pub exposes_service: bool,
    pub exposes_characteristic: bool,
    /// `None` reads back as an empty payload.
    pub value: Option<u8>,
    /// Added to every written byte before it is stored, to model a peripheral
    /// that quietly adjusts what it was sent.
    pub write_skew: i8,
    /// The next read drops the link instead of answering.
    pub drop_on_next_read: bool,
}

impl SimPeripheral {
    pub fn new(service: Uuid, characteristic: Uuid, value: i8) -> Self {
        Self {
            service,
            characteristic,
            advertising: true,
            accepts_connections: true,
            connect_hangs: false,
            exposes_service: true,
            exposes_characteristic: true,
            value: Some(value as u8),
            write_skew: 0,
            drop_on_next_read: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimStats {
    pub scans: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub reads: u32,
    pub writes: Vec<u8>,
}

struct SimState {
    peripheral: SimPeripheral,
    stats: SimStats,
    live_link: Option<u32>,
    next_link: u32,
}

#[derive(Clone)]
pub struct SimHandle {
    inner: Arc<Mutex<SimState>>,
    events: &'static RadioEventChannel,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn configure(&self, f: impl FnOnce(&mut SimPeripheral)) {
        f(&mut self.lock().peripheral);
    }

    pub fn stored_value(&self) -> Option<i8> {
        self.lock().peripheral.value.map(|b| b as i8)
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }

    pub fn is_linked(&self) -> bool {
        self.lock().live_link.is_some()
    }

    /// The peripheral walks away: the link dies and the stack reports it.
    pub fn drop_link(&self, reason: i32) {
        let dropped = self.lock().live_link.take();
        if dropped.is_some() {
            info!("[SIM] Peripheral dropped link (reason {})", reason);
            let _ = self.events.try_send(RadioEvent::PeerDisconnected { reason });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimDevice;

#[derive(Debug, PartialEq, Eq)]
pub struct SimLink(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimCharacteristic;

pub struct SimulatedPeripheral {
    handle: SimHandle,
}

impl SimulatedPeripheral {
    pub fn new(peripheral: SimPeripheral, events: &'static RadioEventChannel) -> Self {
        Self {
            handle: SimHandle {
                inner: Arc::new(Mutex::new(SimState {
                    peripheral,
                    stats: SimStats::default(),
                    live_link: None,
                    next_link: 1,
                })),
                events,
            },
        }
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    fn check_link(state: &SimState, link: &SimLink) -> Result<(), RadioError> {
        if state.live_link == Some(link.0) {
            Ok(())
        } else {
            Err(RadioError::NotConnected)
        }
    }
}

impl RadioStack for SimulatedPeripheral {
    type Device = SimDevice;
    type Link = SimLink;
    type Service = SimService;
    type Characteristic = SimCharacteristic;

    async fn scan(&mut self, _scan: &ScanConfig, service: &Uuid) -> Result<Option<SimDevice>, RadioError> {
        let mut state = self.handle.lock();
        state.stats.scans += 1;
        let found = state.peripheral.advertising && state.peripheral.service == *service;
        debug!("[SIM] Scan for {} -> {}", service, found);
        Ok(found.then_some(SimDevice))
    }

    async fn connect(&mut self, _device: &SimDevice) -> Result<SimLink, RadioError> {
        let hangs = {
            let mut state = self.handle.lock();
            state.stats.connects += 1;
            if !state.peripheral.accepts_connections {
                return Err(RadioError::Stack { op: "connect", code: 13 });
            }
            state.peripheral.connect_hangs
        };
        if hangs {
            loop {
                Timer::after_secs(3600).await;
            }
        }
        let mut state = self.handle.lock();
        let id = state.next_link;
        state.next_link += 1;
        state.live_link = Some(id);
        Ok(SimLink(id))
    }

    async fn find_service(&mut self, link: &SimLink, uuid: &Uuid) -> Result<Option<SimService>, RadioError> {
        let state = self.handle.lock();
        Self::check_link(&state, link)?;
        Ok((state.peripheral.exposes_service && state.peripheral.service == *uuid).then_some(SimService))
    }

    async fn find_characteristic(
        &mut self,
        link: &SimLink,
        _service: &SimService,
        uuid: &Uuid,
    ) -> Result<Option<SimCharacteristic>, RadioError> {
        let state = self.handle.lock();
        Self::check_link(&state, link)?;
        Ok((state.peripheral.exposes_characteristic && state.peripheral.characteristic == *uuid)
            .then_some(SimCharacteristic))
    }

    async fn read(&mut self, link: &SimLink, _characteristic: &SimCharacteristic) -> Result<Vec<u8>, RadioError> {
        let drop_now = {
            let mut state = self.handle.lock();
            Self::check_link(&state, link)?;
            state.stats.reads += 1;
            std::mem::replace(&mut state.peripheral.drop_on_next_read, false)
        };
        if drop_now {
            self.handle.drop_link(0x08);
            return Err(RadioError::NotConnected);
        }
        let state = self.handle.lock();
        Ok(state.peripheral.value.map(|b| vec![b]).unwrap_or_default())
    }

    async fn write(
        &mut self,
        link: &SimLink,
        _characteristic: &SimCharacteristic,
        data: &[u8],
        _with_response: bool,
    ) -> Result<(), RadioError> {
        let mut state = self.handle.lock();
        Self::check_link(&state, link)?;
        let byte = *data
            .first()
            .ok_or_else(|| RadioError::Rejected("empty write".to_string()))?;
        state.stats.writes.push(byte);
        let stored = (byte as i8).wrapping_add(state.peripheral.write_skew);
        state.peripheral.value = Some(stored as u8);
        Ok(())
    }

    async fn disconnect(&mut self, link: SimLink) -> Result<(), RadioError> {
        let mut state = self.handle.lock();
        state.stats.disconnects += 1;
        if state.live_link == Some(link.0) {
            state.live_link = None;
            Ok(())
        } else {
            Err(RadioError::NotConnected)
        }
    }
}
