//! BLE session lifecycle: Idle -> Scanning -> Connecting -> Ready -> Disconnecting -> Idle
//!
//! The machine only tracks where the session is and which link status to
//! report; the radio worker performs the actual radio calls and feeds the
//! results back in as [`SessionInput`]s.

use crate::types::LinkStatus;
use log::info;
use statig::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    ConnectRequested,
    DeviceFound,
    ScanFailed,
    LinkFailed,
    /// Service and characteristic both resolved.
    Resolved,
    ResolveFailed,
    OperationFailed,
    DisconnectRequested,
    /// The worker released the link (or there was none to release).
    Released,
    PeerDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Scanning,
    Connecting,
    Ready,
    Disconnecting,
}

#[derive(Debug, Default)]
pub struct SessionContext {
    /// Set when the current attempt failed; the final `Disconnected` is then
    /// suppressed so the UI keeps showing `Failed`.
    failed: bool,
    outputs: heapless::Vec<LinkStatus, 4>,
}

impl SessionContext {
    fn emit(&mut self, status: LinkStatus) {
        let _ = self.outputs.push(status);
    }

    fn fail(&mut self) -> Response<State> {
        self.failed = true;
        self.emit(LinkStatus::Failed);
        Response::Transition(State::disconnecting())
    }

    fn settle(&mut self) -> Response<State> {
        if !self.failed {
            self.emit(LinkStatus::Disconnected);
        }
        Response::Transition(State::idle())
    }
}

#[derive(Debug, Default)]
pub struct SessionStateMachine;

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug)),
    on_transition = "Self::on_transition"
)]
impl SessionStateMachine {
    #[state]
    fn idle(context: &mut SessionContext, event: &SessionInput) -> Response<State> {
        use Response::*;

        match event {
            SessionInput::ConnectRequested => {
                context.failed = false;
                context.emit(LinkStatus::Connecting);
                Transition(State::scanning())
            }
            _ => Handled,
        }
    }

    #[state]
    fn scanning(context: &mut SessionContext, event: &SessionInput) -> Response<State> {
        use Response::*;

        match event {
            SessionInput::DeviceFound => Transition(State::connecting()),
            SessionInput::ScanFailed => context.fail(),
            SessionInput::DisconnectRequested => Transition(State::disconnecting()),
            SessionInput::PeerDisconnected => context.settle(),
            _ => Handled,
        }
    }

    #[state]
    fn connecting(context: &mut SessionContext, event: &SessionInput) -> Response<State> {
        use Response::*;

        match event {
            SessionInput::Resolved => {
                context.emit(LinkStatus::Connected);
                Transition(State::ready())
            }
            SessionInput::LinkFailed | SessionInput::ResolveFailed => context.fail(),
            SessionInput::DisconnectRequested => Transition(State::disconnecting()),
            SessionInput::PeerDisconnected => context.settle(),
            _ => Handled,
        }
    }

    #[state]
    fn ready(context: &mut SessionContext, event: &SessionInput) -> Response<State> {
        use Response::*;

        match event {
            SessionInput::OperationFailed => context.fail(),
            SessionInput::DisconnectRequested => Transition(State::disconnecting()),
            SessionInput::PeerDisconnected => context.settle(),
            _ => Handled,
        }
    }

    #[state]
    fn disconnecting(context: &mut SessionContext, event: &SessionInput) -> Response<State> {
        use Response::*;

        match event {
            SessionInput::Released | SessionInput::PeerDisconnected => context.settle(),
            _ => Handled,
        }
    }
}

impl SessionStateMachine {
    fn on_transition(&mut self, source: &State, target: &State) {
        info!(
            "Session: {:?} -> {:?}",
            Self::phase_of(source),
            Self::phase_of(target)
        );
    }

    fn phase_of(state: &State) -> SessionPhase {
        match state {
            State::Idle {} => SessionPhase::Idle,
            State::Scanning {} => SessionPhase::Scanning,
            State::Connecting {} => SessionPhase::Connecting,
            State::Ready {} => SessionPhase::Ready,
            State::Disconnecting {} => SessionPhase::Disconnecting,
        }
    }
}

/// Owns the statig machine plus its context and hands back the statuses each
/// input produced, in order.
pub struct SessionMachine {
    machine: statig::prelude::StateMachine<SessionStateMachine>,
    context: SessionContext,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            machine: SessionStateMachine::default().state_machine(),
            context: SessionContext::default(),
        }
    }

    pub fn handle(&mut self, input: SessionInput) -> heapless::Vec<LinkStatus, 4> {
        self.context.outputs.clear();
        let _ = self.machine.handle_with_context(&input, &mut self.context);
        std::mem::take(&mut self.context.outputs)
    }

    pub fn phase(&self) -> SessionPhase {
        SessionStateMachine::phase_of(self.machine.state())
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == SessionPhase::Idle
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == SessionPhase::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(machine: &mut SessionMachine, inputs: &[SessionInput]) -> Vec<LinkStatus> {
        inputs
            .iter()
            .flat_map(|i| machine.handle(*i).into_iter())
            .collect()
    }

    #[test]
    fn test_happy_path_to_ready() {
        let mut m = SessionMachine::new();
        let out = run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::DeviceFound,
                SessionInput::Resolved,
            ],
        );
        assert_eq!(out, vec![LinkStatus::Connecting, LinkStatus::Connected]);
        assert!(m.is_ready());
    }

    #[test]
    fn test_clean_disconnect() {
        let mut m = SessionMachine::new();
        run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::DeviceFound,
                SessionInput::Resolved,
            ],
        );
        let out = run(
            &mut m,
            &[SessionInput::DisconnectRequested, SessionInput::Released],
        );
        assert_eq!(out, vec![LinkStatus::Disconnected]);
        assert!(m.is_idle());
    }

    #[test]
    fn test_scan_miss_keeps_failed() {
        let mut m = SessionMachine::new();
        let out = run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::ScanFailed,
                SessionInput::Released,
            ],
        );
        assert_eq!(out, vec![LinkStatus::Connecting, LinkStatus::Failed]);
        assert!(m.is_idle());
    }

    #[test]
    fn test_resolve_failure_goes_through_disconnecting() {
        let mut m = SessionMachine::new();
        run(
            &mut m,
            &[SessionInput::ConnectRequested, SessionInput::DeviceFound],
        );
        assert_eq!(m.handle(SessionInput::ResolveFailed).as_slice(), &[LinkStatus::Failed]);
        assert_eq!(m.phase(), SessionPhase::Disconnecting);
        assert!(m.handle(SessionInput::Released).is_empty());
        assert!(m.is_idle());
    }

    #[test]
    fn test_operation_failure_from_ready() {
        let mut m = SessionMachine::new();
        run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::DeviceFound,
                SessionInput::Resolved,
            ],
        );
        let out = run(
            &mut m,
            &[SessionInput::OperationFailed, SessionInput::Released],
        );
        assert_eq!(out, vec![LinkStatus::Failed]);
    }

    #[test]
    fn test_peer_disconnect_forces_idle() {
        let mut m = SessionMachine::new();
        run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::DeviceFound,
                SessionInput::Resolved,
            ],
        );
        assert_eq!(
            m.handle(SessionInput::PeerDisconnected).as_slice(),
            &[LinkStatus::Disconnected]
        );
        assert!(m.is_idle());
        // A late release from the worker is harmless.
        assert!(m.handle(SessionInput::Released).is_empty());
    }

    #[test]
    fn test_peer_disconnect_in_idle_ignored() {
        let mut m = SessionMachine::new();
        assert!(m.handle(SessionInput::PeerDisconnected).is_empty());
        assert!(m.is_idle());
    }

    #[test]
    fn test_failure_flag_reset_on_next_attempt() {
        let mut m = SessionMachine::new();
        run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::ScanFailed,
                SessionInput::Released,
            ],
        );
        let out = run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::DeviceFound,
                SessionInput::Resolved,
                SessionInput::DisconnectRequested,
                SessionInput::Released,
            ],
        );
        assert_eq!(
            out,
            vec![
                LinkStatus::Connecting,
                LinkStatus::Connected,
                LinkStatus::Disconnected
            ]
        );
    }

    #[test]
    fn test_connect_ignored_while_ready() {
        let mut m = SessionMachine::new();
        run(
            &mut m,
            &[
                SessionInput::ConnectRequested,
                SessionInput::DeviceFound,
                SessionInput::Resolved,
            ],
        );
        assert!(m.handle(SessionInput::ConnectRequested).is_empty());
        assert!(m.is_ready());
    }
}
