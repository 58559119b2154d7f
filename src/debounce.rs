use crate::commands::CommandSender;
use crate::state::StateManager;
use crate::types::Command;
use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::{Duration, Timer};
use log::{debug, info, warn};

/// Restartable one-shot timer.
///
/// `arm` may be called from any thread. Every call pushes the expiry out by a
/// full quiet period, so a burst of ticks produces a single write carrying the
/// value as it stands at expiry.
pub struct DebounceTimer {
    signal: Signal<CriticalSectionRawMutex, ()>,
    quiet: Duration,
}

impl DebounceTimer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            signal: Signal::new(),
            quiet,
        }
    }

    pub fn arm(&self) {
        self.signal.signal(());
    }

    /// Resolves one quiet period after the last `arm`.
    pub async fn next_expiry(&self) {
        self.signal.wait().await;
        loop {
            match select(self.signal.wait(), Timer::after(self.quiet)).await {
                Either::First(()) => debug!("Debounce re-armed"),
                Either::Second(()) => return,
            }
        }
    }

    pub async fn run(&self, state: &StateManager, sender: &CommandSender) -> ! {
        loop {
            self.next_expiry().await;
            let value = state.desired();
            info!("Knob settled at {}, writing", value);
            if let Err(e) = sender.submit(Command::write_value(value)).await {
                warn!("Debounced write dropped: {}", e);
            }
        }
    }
}
