use crate::system::events::Notifier;
use crate::types::{LinkStatus, DEFAULT_TARGET_WEIGHT};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use log::{debug, info};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerState {
    pub desired: i8,
    pub link_status: LinkStatus,
    pub confirmed: bool,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            desired: DEFAULT_TARGET_WEIGHT,
            link_status: LinkStatus::Disconnected,
            confirmed: false,
        }
    }
}

/// Owner of the desired value, link status and confirmation flag.
///
/// Shared between the radio core, the knob thread and the debounce timer.
/// Each mutation and its notifications run under `order`, so sinks see changes
/// in the order they were applied. The state lock itself is only held to read
/// or swap a field; a notifier may read the manager but must not mutate it.
pub struct StateManager {
    state: Mutex<CriticalSectionRawMutex, RefCell<ControllerState>>,
    order: StdMutex<()>,
    bounds: (i8, i8),
    notifier: Arc<dyn Notifier>,
}

impl StateManager {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_bounds(notifier, DEFAULT_TARGET_WEIGHT, i8::MIN, i8::MAX)
    }

    /// `initial` is clamped into `min..=max`.
    pub fn with_bounds(notifier: Arc<dyn Notifier>, initial: i8, min: i8, max: i8) -> Self {
        let state = ControllerState {
            desired: initial.clamp(min, max),
            ..ControllerState::default()
        };
        Self {
            state: Mutex::new(RefCell::new(state)),
            order: StdMutex::new(()),
            bounds: (min, max),
            notifier,
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    fn sequenced(&self) -> MutexGuard<'_, ()> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ControllerState {
        self.state.lock(|cell| *cell.borrow())
    }

    pub fn desired(&self) -> i8 {
        self.snapshot().desired
    }

    pub fn link_status(&self) -> LinkStatus {
        self.snapshot().link_status
    }

    pub fn is_confirmed(&self) -> bool {
        self.snapshot().confirmed
    }

    /// One knob detent. Always notifies, even when the value is pinned at a bound.
    pub fn adjust_desired(&self, delta: i8) -> i8 {
        let (min, max) = self.bounds;
        let _order = self.sequenced();
        let value = self.update(|s| {
            s.desired = s.desired.saturating_add(delta).clamp(min, max);
            s.desired
        });
        debug!("Desired value adjusted by {} -> {}", delta, value);
        self.notifier.on_value_changed(value);
        value
    }

    /// The peripheral holds `value`. Emits value-changed then value-confirmed.
    ///
    /// A confirmed value is taken as-is even outside the knob bounds; the
    /// peripheral is the source of truth.
    pub fn confirm(&self, value: i8) {
        let _order = self.sequenced();
        self.update(|s| {
            s.desired = value;
            s.confirmed = true;
        });
        info!("Value {} confirmed by peripheral", value);
        self.notifier.on_value_changed(value);
        self.notifier.on_value_confirmed(value);
    }

    pub fn clear_confirmation(&self) {
        let _order = self.sequenced();
        let was_confirmed = self.update(|s| core::mem::replace(&mut s.confirmed, false));
        if was_confirmed {
            self.notifier.on_confirmation_cleared();
        }
    }

    pub fn set_link_status(&self, status: LinkStatus) {
        let _order = self.sequenced();
        let previous = self.update(|s| core::mem::replace(&mut s.link_status, status));
        if previous != status {
            info!("Link status changed: {:?} -> {:?}", previous, status);
            self.notifier.on_link_status_changed(status);
        }
    }
}
