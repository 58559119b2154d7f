//! Presentation hooks for the controller
//!
//! Everything that shows state to the user (log, OLED, persistence) implements
//! [`Notifier`]. Callbacks arrive from whichever task changed the state, so
//! implementations must be cheap and must not block on the radio.

use crate::types::LinkStatus;
use log::info;
use std::sync::Arc;

pub trait Notifier: Send + Sync {
    /// Desired value changed, either from the knob or from a confirmed read/write.
    fn on_value_changed(&self, value: i8);

    fn on_link_status_changed(&self, status: LinkStatus);

    /// The peripheral reported the value the controller expected.
    fn on_value_confirmed(&self, value: i8);

    /// A previously confirmed value is stale again.
    fn on_confirmation_cleared(&self);
}

/// Serial log output, always installed.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn on_value_changed(&self, value: i8) {
        info!("Target weight: {}g", value);
    }

    fn on_link_status_changed(&self, status: LinkStatus) {
        info!("Link: {}", status.as_str());
    }

    fn on_value_confirmed(&self, value: i8) {
        info!("Peripheral confirmed {}g", value);
    }

    fn on_confirmation_cleared(&self) {
        info!("Confirmation cleared");
    }
}

/// Fans every callback out to a list of notifiers in registration order.
#[derive(Default, Clone)]
pub struct Notifiers {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Notifier for Notifiers {
    fn on_value_changed(&self, value: i8) {
        self.sinks.iter().for_each(|s| s.on_value_changed(value));
    }

    fn on_link_status_changed(&self, status: LinkStatus) {
        self.sinks.iter().for_each(|s| s.on_link_status_changed(status));
    }

    fn on_value_confirmed(&self, value: i8) {
        self.sinks.iter().for_each(|s| s.on_value_confirmed(value));
    }

    fn on_confirmation_cleared(&self) {
        self.sinks.iter().for_each(|s| s.on_confirmation_cleared());
    }
}


#[cfg(test)]
mod tests {
    use super::recording::{Notification, RecordingNotifier};
    use super::*;

    #[test]
    fn test_fan_out_preserves_order() {
        let a = RecordingNotifier::new();
        let b = RecordingNotifier::new();
        let fan = Notifiers::new().with(a.clone()).with(b.clone());

        fan.on_value_changed(37);
        fan.on_link_status_changed(LinkStatus::Connecting);
        fan.on_confirmation_cleared();

        let expected = vec![
            Notification::Value(37),
            Notification::Link(LinkStatus::Connecting),
            Notification::Cleared,
        ];
        assert_eq!(a.take(), expected);
        assert_eq!(b.take(), expected);
    }

    #[test]
    fn test_empty_fan_out() {
        let fan = Notifiers::new();
        fan.on_value_changed(1);
        fan.on_value_confirmed(1);
    }
}
