//! In-memory network link and broker for the host build and tests.

use super::{BridgeError, BrokerEvent, BrokerSession, NetworkLink};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct MockNetwork {
    up: Arc<AtomicBool>,
    recovers: Arc<AtomicBool>,
    reconnects: Arc<AtomicUsize>,
}

impl MockNetwork {
    pub fn new(up: bool) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
            recovers: Arc::new(AtomicBool::new(true)),
            reconnects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Whether the next `reconnect` brings the link back.
    pub fn set_recovers(&self, recovers: bool) {
        self.recovers.store(recovers, Ordering::SeqCst);
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl NetworkLink for MockNetwork {
    fn is_up(&mut self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn reconnect(&mut self) -> Result<(), BridgeError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.recovers.load(Ordering::SeqCst) {
            self.up.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(BridgeError::Network("access point unreachable".to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Default)]
struct BrokerState {
    inbox: VecDeque<BrokerEvent>,
    published: Vec<Published>,
    subscriptions: Vec<String>,
}

/// Broker double. Clones share one inbox, so a test keeps a clone to inject
/// events and inspect what the bridge published.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, event: BrokerEvent) {
        self.lock().inbox.push_back(event);
    }

    pub fn take_published(&self) -> Vec<Published> {
        std::mem::take(&mut self.lock().published)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }
}

impl BrokerSession for MockBroker {
    fn poll(&mut self) -> Option<BrokerEvent> {
        self.lock().inbox.pop_front()
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BridgeError> {
        self.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BridgeError> {
        self.lock().published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }
}
