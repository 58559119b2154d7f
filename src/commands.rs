//! Bounded command queue in front of the radio worker.

use crate::state::StateManager;
use crate::types::{Command, LinkStatus, COMMAND_QUEUE_DEPTH};
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Channel, Receiver, Sender},
};
use embassy_time::{with_timeout, Duration};
use log::{debug, warn};
use std::sync::Arc;

pub type CommandChannel = Channel<CriticalSectionRawMutex, Command, COMMAND_QUEUE_DEPTH>;
pub type CommandReceiver = Receiver<'static, CriticalSectionRawMutex, Command, COMMAND_QUEUE_DEPTH>;
type RawSender = Sender<'static, CriticalSectionRawMutex, Command, COMMAND_QUEUE_DEPTH>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// No slot freed up within the wait budget; the command was dropped.
    QueueFull(Command),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::QueueFull(cmd) => write!(f, "Command queue full, dropped {:?}", cmd.kind),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Producer handle shared by the boot sequence, the debounce timer and anything
/// else that wants the radio to do something.
#[derive(Clone)]
pub struct CommandSender {
    inner: RawSender,
    state: Arc<StateManager>,
    wait: Duration,
}

impl CommandSender {
    pub fn new(channel: &'static CommandChannel, state: Arc<StateManager>, wait: Duration) -> Self {
        Self {
            inner: channel.sender(),
            state,
            wait,
        }
    }

    fn prepare(&self, command: &Command) {
        if command.opens_session() {
            self.state.clear_confirmation();
            self.state.set_link_status(LinkStatus::Connecting);
        }
    }

    fn reject(&self, command: Command) -> SubmitError {
        warn!("Command queue full, dropping {:?}", command);
        self.state.set_link_status(LinkStatus::Failed);
        SubmitError::QueueFull(command)
    }

    /// Waits up to the configured budget for a free slot.
    pub async fn submit(&self, command: Command) -> Result<(), SubmitError> {
        self.prepare(&command);
        match with_timeout(self.wait, self.inner.send(command)).await {
            Ok(()) => {
                debug!("Queued {:?}", command);
                Ok(())
            }
            Err(_) => Err(self.reject(command)),
        }
    }

    /// Immediate attempt, for callers outside the executor.
    pub fn try_submit(&self, command: Command) -> Result<(), SubmitError> {
        self.prepare(&command);
        match self.inner.try_send(command) {
            Ok(()) => {
                debug!("Queued {:?}", command);
                Ok(())
            }
            Err(_) => Err(self.reject(command)),
        }
    }
}

#[cfg(test)]
pub(crate) fn leak_channel() -> &'static CommandChannel {
    Box::leak(Box::new(CommandChannel::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::events::recording::{Notification, RecordingNotifier};
    use embassy_futures::block_on;
    use embassy_time::Instant;

    fn setup() -> (&'static CommandChannel, CommandSender, Arc<RecordingNotifier>) {
        let rec = RecordingNotifier::new();
        let state = Arc::new(StateManager::new(rec.clone()));
        let channel = leak_channel();
        let sender = CommandSender::new(channel, state, Duration::from_millis(10));
        (channel, sender, rec)
    }

    #[test]
    fn test_fifo_order() {
        let (channel, sender, _) = setup();
        sender.try_submit(Command::read_value()).unwrap();
        sender.try_submit(Command::write_value(40)).unwrap();
        sender.try_submit(Command::disconnect()).unwrap();

        assert_eq!(channel.try_receive().unwrap(), Command::read_value());
        assert_eq!(channel.try_receive().unwrap(), Command::write_value(40));
        assert_eq!(channel.try_receive().unwrap(), Command::disconnect());
    }

    #[test]
    fn test_opening_command_marks_connecting() {
        let (_, sender, rec) = setup();
        sender.try_submit(Command::read_value()).unwrap();
        assert_eq!(rec.take(), vec![Notification::Link(LinkStatus::Connecting)]);
    }

    #[test]
    fn test_disconnect_leaves_status_alone() {
        let (_, sender, rec) = setup();
        sender.try_submit(Command::disconnect()).unwrap();
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let (channel, sender, rec) = setup();
        for v in 0..COMMAND_QUEUE_DEPTH as i8 {
            sender.try_submit(Command::write_value(v)).unwrap();
        }

        let result = sender.try_submit(Command::write_value(99));
        assert_eq!(result, Err(SubmitError::QueueFull(Command::write_value(99))));
        assert_eq!(channel.len(), COMMAND_QUEUE_DEPTH);
        assert_eq!(rec.link_history().last(), Some(&LinkStatus::Failed));
    }

    #[test]
    fn test_async_submit_times_out_when_full() {
        let (_, sender, rec) = setup();
        for _ in 0..COMMAND_QUEUE_DEPTH {
            sender.try_submit(Command::read_value()).unwrap();
        }

        let started = Instant::now();
        let result = block_on(sender.submit(Command::write_value(1)));

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(rec.link_history().last(), Some(&LinkStatus::Failed));
    }

    #[test]
    fn test_async_submit_succeeds() {
        let (channel, sender, _) = setup();
        block_on(sender.submit(Command::connect())).unwrap();
        assert_eq!(channel.try_receive().unwrap(), Command::connect());
    }
}
