//! Radio abstraction for the one-characteristic target-weight peripheral.
//!
//! The worker only talks to [`RadioStack`]; the device build plugs in the
//! NimBLE host, tests and the host build plug in [`sim::SimulatedPeripheral`].

#[cfg(target_os = "espidf")]
pub mod nimble;
pub mod sim;

use crate::system::config::ScanConfig;
use crate::types::RADIO_EVENT_QUEUE_DEPTH;
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use uuid::Uuid;

/// Asynchronous notifications raised by the radio stack outside of any call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    PeerDisconnected { reason: i32 },
}

pub type RadioEventChannel = Channel<CriticalSectionRawMutex, RadioEvent, RADIO_EVENT_QUEUE_DEPTH>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Host stack returned a non-zero status.
    Stack { op: &'static str, code: i32 },
    PeripheralNotFound,
    ServiceNotFound(Uuid),
    CharacteristicNotFound(Uuid),
    NotConnected,
    Timeout(&'static str),
    Rejected(String),
}

impl std::fmt::Display for RadioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RadioError::Stack { op, code } => write!(f, "BLE {} failed: {}", op, code),
            RadioError::PeripheralNotFound => write!(f, "No peripheral advertising the service"),
            RadioError::ServiceNotFound(uuid) => write!(f, "Service {} not found", uuid),
            RadioError::CharacteristicNotFound(uuid) => write!(f, "Characteristic {} not found", uuid),
            RadioError::NotConnected => write!(f, "Not connected to peripheral"),
            RadioError::Timeout(op) => write!(f, "BLE {} timed out", op),
            RadioError::Rejected(msg) => write!(f, "Peripheral rejected request: {}", msg),
        }
    }
}

impl std::error::Error for RadioError {}

/// The radio operations the session needs, in the order it needs them.
///
/// Lookups return `Ok(None)` for "not there" and reserve `Err` for transport
/// problems. Handles are owned by the caller; `disconnect` consumes the link so
/// it can only be released once.
#[allow(async_fn_in_trait)]
pub trait RadioStack {
    type Device;
    type Link;
    type Service;
    type Characteristic;

    /// First advertiser of `service` within the scan window.
    async fn scan(&mut self, scan: &ScanConfig, service: &Uuid) -> Result<Option<Self::Device>, RadioError>;

    async fn connect(&mut self, device: &Self::Device) -> Result<Self::Link, RadioError>;

    async fn find_service(&mut self, link: &Self::Link, uuid: &Uuid) -> Result<Option<Self::Service>, RadioError>;

    async fn find_characteristic(
        &mut self,
        link: &Self::Link,
        service: &Self::Service,
        uuid: &Uuid,
    ) -> Result<Option<Self::Characteristic>, RadioError>;

    async fn read(&mut self, link: &Self::Link, characteristic: &Self::Characteristic) -> Result<Vec<u8>, RadioError>;

    async fn write(
        &mut self,
        link: &Self::Link,
        characteristic: &Self::Characteristic,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), RadioError>;

    async fn disconnect(&mut self, link: Self::Link) -> Result<(), RadioError>;
}

/// One connected, resolved session. Created per attempt and consumed on release.
pub struct RadioSession<R: RadioStack> {
    pub device: R::Device,
    pub link: R::Link,
    pub characteristic: R::Characteristic,
}

/// Interprets a characteristic payload: the first byte, signed. Empty means no value.
pub fn decode_value(payload: &[u8]) -> Option<i8> {
    payload.first().map(|b| *b as i8)
}

pub fn encode_value(value: i8) -> [u8; 1] {
    [value as u8]
}

/// 128-bit UUID in the little-endian order the host stack uses on the air.
pub fn uuid_le_bytes(uuid: &Uuid) -> [u8; 16] {
    let mut bytes = *uuid.as_bytes();
    bytes.reverse();
    bytes
}

/// Whether advertisement data lists `service` among its 128-bit service UUIDs.
pub fn advertises_service(adv_data: &[u8], service: &Uuid) -> bool {
    let target = uuid_le_bytes(service);
    let mut offset = 0;

    while offset + 1 < adv_data.len() {
        let length = adv_data[offset] as usize;
        if length == 0 || offset + length >= adv_data.len() {
            break;
        }
        let ad_type = adv_data[offset + 1];
        // Incomplete (0x06) or complete (0x07) list of 128-bit service UUIDs
        if ad_type == 0x06 || ad_type == 0x07 {
            let field = &adv_data[offset + 2..offset + 1 + length];
            if field.chunks_exact(16).any(|chunk| chunk == target) {
                return true;
            }
        }
        offset += 1 + length;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_signed_first_byte() {
        assert_eq!(decode_value(&[0x24]), Some(36));
        assert_eq!(decode_value(&[0xff, 0x01]), Some(-1));
        assert_eq!(decode_value(&[0x80]), Some(-128));
        assert_eq!(decode_value(&[]), None);
    }

    fn adv_with_service(uuid: &Uuid) -> Vec<u8> {
        let mut adv = vec![0x02, 0x01, 0x06];
        adv.push(17);
        adv.push(0x07);
        adv.extend_from_slice(&uuid_le_bytes(uuid));
        adv.extend_from_slice(&[0x05, 0x09, b'K', b'n', b'o', b'b']);
        adv
    }

    #[test]
    fn test_uuid_le_bytes() {
        let bytes = uuid_le_bytes(&Uuid::from_u128(0xffe));
        assert_eq!(bytes[0], 0xfe);
        assert_eq!(bytes[1], 0x0f);
        assert!(bytes[2..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_advertises_service() {
        let service = Uuid::from_u128(0xffe);
        let adv = adv_with_service(&service);
        assert!(advertises_service(&adv, &service));
        assert!(!advertises_service(&adv, &Uuid::from_u128(0xff11)));
    }

    #[test]
    fn test_advertises_service_truncated() {
        let service = Uuid::from_u128(0xffe);
        let adv = adv_with_service(&service);
        assert!(!advertises_service(&adv[..10], &service));
        assert!(!advertises_service(&[], &service));
        assert!(!advertises_service(&[0x00, 0x07], &service));
    }

    #[test]
    fn test_encode_single_byte() {
        assert_eq!(encode_value(-1), [0xff]);
        assert_eq!(encode_value(50), [50]);
    }
}
