//! Connection lifecycle state machine.
//!
//! [`Lifecycle`] is the single transition gate for the channel. It performs no
//! I/O: every input (owner commands, transport callbacks, timer callbacks) is
//! applied through [`Lifecycle::apply`], which returns the transitions taken
//! and the [`Effect`]s the driver must carry out.
//!
//! Every input originating from a transport or timer carries the
//! [`Generation`] it was scheduled under. The generation advances on every
//! connect attempt and on every teardown, so a callback from a superseded
//! connection or a cancelled timer is ignored here even if it was already
//! queued when the cancellation happened.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use url::Url;

use crate::backoff::BackoffState;
use crate::heartbeat::HeartbeatTicket;
use crate::identity::ChannelIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    ReconnectPending,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::ReconnectPending => "reconnect_pending",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Start,
    TransportOpened,
    TransportFailed,
    TransportClosed,
    WatchdogExpired,
    Stop,
    CloseConfirmed,
    CloseGraceElapsed,
    RetryElapsed,
    IdentityChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub trigger: Trigger,
    pub to: ConnectionState,
}

#[derive(Debug, Clone)]
pub enum Input {
    Start {
        identity: ChannelIdentity,
        address: Url,
    },
    Stop,
    TransportOpened {
        generation: Generation,
    },
    TransportFailed {
        generation: Generation,
    },
    TransportClosed {
        generation: Generation,
    },
    FrameReceived {
        generation: Generation,
    },
    HeartbeatDue {
        generation: Generation,
    },
    WatchdogCheck {
        generation: Generation,
    },
    RetryDue {
        generation: Generation,
    },
    CloseGraceElapsed {
        generation: Generation,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport { generation: Generation, address: Url },
    /// Ask the server for an orderly close of the current link.
    CloseTransport { generation: Generation },
    /// Abandon the current link (and any in-flight connect) immediately.
    DropTransport,
    SendPing { generation: Generation },
    StartHeartbeat { generation: Generation, interval: Duration },
    StopHeartbeat,
    ArmWatchdog { generation: Generation, after: Duration },
    ScheduleRetry { generation: Generation, delay: Duration, attempt: u32 },
    CancelRetry,
    ArmCloseGrace { generation: Generation, after: Duration },
    CancelCloseGrace,
}

/// Result of applying one input.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Step {
    pub transitions: Vec<Transition>,
    pub effects: Vec<Effect>,
}

impl Step {
    pub fn is_noop(&self) -> bool {
        self.transitions.is_empty() && self.effects.is_empty()
    }

    fn transition(&mut self, from: ConnectionState, trigger: Trigger, to: ConnectionState) {
        self.transitions.push(Transition { from, trigger, to });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub heartbeat_interval: Duration,
    pub close_grace: Duration,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    generation: Generation,
    target: Option<(ChannelIdentity, Url)>,
    backoff: BackoffState,
    heartbeat: Option<HeartbeatTicket>,
    settings: LifecycleSettings,
    /// Set when the owner re-subscribes while a close is in flight.
    resume_after_close: bool,
}

impl Lifecycle {
    pub fn new(settings: LifecycleSettings, backoff: BackoffState) -> Self {
        Self {
            state: ConnectionState::Idle,
            generation: Generation::default(),
            target: None,
            backoff,
            heartbeat: None,
            settings,
            resume_after_close: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn identity(&self) -> Option<&ChannelIdentity> {
        self.target.as_ref().map(|(identity, _)| identity)
    }

    pub fn address(&self) -> Option<&Url> {
        self.target.as_ref().map(|(_, address)| address)
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub fn heartbeat(&self) -> Option<&HeartbeatTicket> {
        self.heartbeat.as_ref()
    }

    pub fn apply(&mut self, input: Input, now: Instant) -> Step {
        let mut step = Step::default();
        match input {
            Input::Start { identity, address } => self.on_start(identity, address, &mut step),
            Input::Stop => self.on_stop(&mut step),
            Input::TransportOpened { generation } if self.is_current(generation) => {
                self.on_opened(now, &mut step)
            }
            Input::TransportFailed { generation } if self.is_current(generation) => {
                if self.state == ConnectionState::Connecting {
                    step.effects.push(Effect::DropTransport);
                    self.enter_reconnect_pending(Trigger::TransportFailed, &mut step);
                }
            }
            Input::TransportClosed { generation } if self.is_current(generation) => {
                self.on_closed(&mut step)
            }
            Input::FrameReceived { generation } if self.is_current(generation) => {
                if let Some(ticket) = self.heartbeat.as_mut() {
                    ticket.record_received(now);
                }
            }
            Input::HeartbeatDue { generation } if self.is_current(generation) => {
                if let Some(ticket) = self.heartbeat.as_mut() {
                    ticket.record_sent(now);
                    step.effects.push(Effect::SendPing { generation });
                }
            }
            Input::WatchdogCheck { generation } if self.is_current(generation) => {
                self.on_watchdog(generation, now, &mut step)
            }
            Input::RetryDue { generation } if self.is_current(generation) => {
                if self.state == ConnectionState::ReconnectPending {
                    self.begin_connect(ConnectionState::ReconnectPending, Trigger::RetryElapsed, &mut step);
                }
            }
            Input::CloseGraceElapsed { generation } if self.is_current(generation) => {
                if self.state == ConnectionState::Closing {
                    step.effects.push(Effect::DropTransport);
                    self.finish_close(Trigger::CloseGraceElapsed, &mut step);
                }
            }
            // Stale generation: the callback belongs to a superseded connection
            // or a cancelled timer.
            _ => {}
        }
        self.debug_check_invariants();
        step
    }

    fn is_current(&self, generation: Generation) -> bool {
        generation == self.generation
    }

    fn on_start(&mut self, identity: ChannelIdentity, address: Url, step: &mut Step) {
        if self.state == ConnectionState::Closing && self.identity() == Some(&identity) {
            // Let the requested close finish, then reconnect from Idle.
            self.resume_after_close = true;
            self.target = Some((identity, address));
            return;
        }
        if self.state != ConnectionState::Idle {
            if self.identity() == Some(&identity) {
                return;
            }
            let from = self.state;
            self.teardown(step);
            step.transition(from, Trigger::IdentityChanged, ConnectionState::Idle);
        }
        self.backoff.reset();
        self.target = Some((identity, address));
        self.begin_connect(ConnectionState::Idle, Trigger::Start, step);
    }

    fn on_stop(&mut self, step: &mut Step) {
        match self.state {
            ConnectionState::Idle => {}
            ConnectionState::Closing => self.resume_after_close = false,
            ConnectionState::Open => {
                self.heartbeat = None;
                step.effects.push(Effect::StopHeartbeat);
                step.effects.push(Effect::CloseTransport {
                    generation: self.generation,
                });
                step.effects.push(Effect::ArmCloseGrace {
                    generation: self.generation,
                    after: self.settings.close_grace,
                });
                self.state = ConnectionState::Closing;
                step.transition(ConnectionState::Open, Trigger::Stop, ConnectionState::Closing);
            }
            ConnectionState::Connecting | ConnectionState::ReconnectPending => {
                let from = self.state;
                self.teardown(step);
                step.transition(from, Trigger::Stop, ConnectionState::Idle);
            }
        }
    }

    fn on_opened(&mut self, now: Instant, step: &mut Step) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.backoff.reset();
        let ticket = HeartbeatTicket::start(self.settings.heartbeat_interval, now);
        step.effects.push(Effect::StartHeartbeat {
            generation: self.generation,
            interval: ticket.interval(),
        });
        step.effects.push(Effect::ArmWatchdog {
            generation: self.generation,
            after: ticket.silence_limit(),
        });
        self.heartbeat = Some(ticket);
        self.state = ConnectionState::Open;
        step.transition(ConnectionState::Connecting, Trigger::TransportOpened, ConnectionState::Open);
    }

    fn on_closed(&mut self, step: &mut Step) {
        match self.state {
            ConnectionState::Open => {
                self.heartbeat = None;
                step.effects.push(Effect::StopHeartbeat);
                step.effects.push(Effect::DropTransport);
                self.enter_reconnect_pending(Trigger::TransportClosed, step);
            }
            // A link that dies before reporting open is a failed attempt.
            ConnectionState::Connecting => {
                step.effects.push(Effect::DropTransport);
                self.enter_reconnect_pending(Trigger::TransportFailed, step);
            }
            ConnectionState::Closing => {
                step.effects.push(Effect::DropTransport);
                self.finish_close(Trigger::CloseConfirmed, step);
            }
            ConnectionState::Idle | ConnectionState::ReconnectPending => {}
        }
    }

    fn on_watchdog(&mut self, generation: Generation, now: Instant, step: &mut Step) {
        let Some(ticket) = self.heartbeat.as_ref() else {
            return;
        };
        if ticket.is_silent(now) {
            self.heartbeat = None;
            step.effects.push(Effect::StopHeartbeat);
            step.effects.push(Effect::DropTransport);
            self.enter_reconnect_pending(Trigger::WatchdogExpired, step);
        } else {
            step.effects.push(Effect::ArmWatchdog {
                generation,
                after: ticket.remaining(now),
            });
        }
    }

    fn begin_connect(&mut self, from: ConnectionState, trigger: Trigger, step: &mut Step) {
        let Some((_, address)) = self.target.as_ref() else {
            return;
        };
        self.generation = self.generation.next();
        step.effects.push(Effect::OpenTransport {
            generation: self.generation,
            address: address.clone(),
        });
        self.state = ConnectionState::Connecting;
        step.transition(from, trigger, ConnectionState::Connecting);
    }

    fn enter_reconnect_pending(&mut self, trigger: Trigger, step: &mut Step) {
        let from = self.state;
        let delay = self.backoff.next_delay();
        step.effects.push(Effect::ScheduleRetry {
            generation: self.generation,
            delay,
            attempt: self.backoff.attempt_count(),
        });
        self.state = ConnectionState::ReconnectPending;
        step.transition(from, trigger, ConnectionState::ReconnectPending);
    }

    fn finish_close(&mut self, trigger: Trigger, step: &mut Step) {
        step.effects.push(Effect::CancelCloseGrace);
        step.effects.push(Effect::CancelRetry);
        self.generation = self.generation.next();
        self.state = ConnectionState::Idle;
        step.transition(ConnectionState::Closing, trigger, ConnectionState::Idle);
        if std::mem::take(&mut self.resume_after_close) {
            self.backoff.reset();
            self.begin_connect(ConnectionState::Idle, Trigger::Start, step);
        } else {
            self.target = None;
        }
    }

    /// Cancels everything tied to the current channel and lands in `Idle`.
    fn teardown(&mut self, step: &mut Step) {
        step.effects.extend([
            Effect::StopHeartbeat,
            Effect::DropTransport,
            Effect::CancelRetry,
            Effect::CancelCloseGrace,
        ]);
        self.heartbeat = None;
        self.resume_after_close = false;
        self.generation = self.generation.next();
        self.target = None;
        self.state = ConnectionState::Idle;
    }

    fn debug_check_invariants(&self) {
        debug_assert_eq!(
            self.heartbeat.is_some(),
            self.state == ConnectionState::Open,
            "heartbeat ticket must exist exactly while open"
        );
        debug_assert_eq!(
            self.target.is_some(),
            self.state != ConnectionState::Idle,
            "only an idle lifecycle may lack a target"
        );
    }
}
