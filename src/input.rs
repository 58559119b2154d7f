use crate::debounce::DebounceTimer;
use crate::state::StateManager;
use crate::types::Tick;
use log::debug;
use std::sync::Arc;

/// Turns knob ticks into desired-value changes.
///
/// The display updates immediately; the peripheral is only written once the
/// knob has been still for the debounce period.
#[derive(Clone)]
pub struct InputAdapter {
    state: Arc<StateManager>,
    debounce: Arc<DebounceTimer>,
}

impl InputAdapter {
    pub fn new(state: Arc<StateManager>, debounce: Arc<DebounceTimer>) -> Self {
        Self { state, debounce }
    }

    pub fn on_tick(&self, tick: Tick) {
        let value = self.state.adjust_desired(tick.delta());
        self.state.clear_confirmation();
        self.debounce.arm();
        debug!("Tick {:?} -> {}", tick, value);
    }
}
