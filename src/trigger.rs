//! Per-channel trigger engine.
//!
//! The engine arms on a configurable source and, once triggered, executes
//! either the programmed fixed setpoints, a list program or a step (ramp)
//! transition. Transition structure lives in a state machine; applying
//! values to channels — and every validation that entails — is driven from
//! the control tick, which feeds events into the machine based on what it
//! observes.

use crate::list::{ListExecution, ListProgram};
use crate::scheduler::{Duration, Instant};

/// Dwell countdowns are only surfaced for steps at least this long.
pub const DWELL_COUNTDOWN_DISPLAY_THRESHOLD: Duration = Duration::from_ticks(5_000);

/// What arms the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TriggerSource {
    Bus,
    #[default]
    Immediate,
    Manual,
    Pin1,
    Pin2,
}

/// What a trigger executes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TriggerMode {
    #[default]
    Fixed,
    List,
    Step,
    FunctionGenerator,
}

/// Behavior applied once when a list run stops.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum TriggerOnListStop {
    #[default]
    OutputOff,
    SetToFirstStep,
    SetToLastStep,
    Standby,
}

/// External trigger input pins.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerPin {
    One,
    Two,
}

impl From<TriggerPin> for TriggerSource {
    fn from(pin: TriggerPin) -> Self {
        match pin {
            TriggerPin::One => TriggerSource::Pin1,
            TriggerPin::Two => TriggerSource::Pin2,
        }
    }
}

/// Externally observable engine state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub enum TriggerState {
    #[default]
    Idle,
    Armed,
    Triggered,
    Initiating,
    Running,
    Stopped,
}

/// Trigger configuration plus execution bookkeeping for one channel.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub(crate) source: TriggerSource,
    pub(crate) mode: TriggerMode,
    pub(crate) on_list_stop: TriggerOnListStop,
    /// Wait between the trigger event and execution start.
    pub(crate) delay: Duration,
    /// Fixed/step-mode target levels.
    pub(crate) u_level: f32,
    pub(crate) i_level: f32,
    /// Step-mode ramp durations and the leading output-enable delay.
    pub(crate) u_ramp_duration: Duration,
    pub(crate) i_ramp_duration: Duration,
    pub(crate) output_delay: Duration,
    /// Whether execution start drives the output on.
    pub(crate) output_on_trigger: bool,
    pub(crate) list: ListProgram,
    pub(crate) exec: ListExecution,
    pub(crate) fired_at: Option<Instant>,
}

impl Default for TriggerContext {
    fn default() -> Self {
        Self {
            source: TriggerSource::default(),
            mode: TriggerMode::default(),
            on_list_stop: TriggerOnListStop::default(),
            delay: Duration::from_ticks(0),
            u_level: 0.0,
            i_level: 0.0,
            u_ramp_duration: Duration::from_ticks(0),
            i_ramp_duration: Duration::from_ticks(0),
            output_delay: Duration::from_ticks(0),
            output_on_trigger: true,
            list: ListProgram::default(),
            exec: ListExecution::default(),
            fired_at: None,
        }
    }
}

impl TriggerContext {
    pub fn source(&self) -> TriggerSource {
        self.source
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn on_list_stop(&self) -> TriggerOnListStop {
        self.on_list_stop
    }

    pub fn list(&self) -> &ListProgram {
        &self.list
    }

    pub fn list_mut(&mut self) -> &mut ListProgram {
        &mut self.list
    }

    pub fn execution(&self) -> &ListExecution {
        &self.exec
    }

    /// Reset configuration to power-on defaults, as coupling activation
    /// requires.
    pub(crate) fn reset_config(&mut self) {
        self.source = TriggerSource::default();
        self.mode = TriggerMode::default();
        self.on_list_stop = TriggerOnListStop::default();
        self.delay = Duration::from_ticks(0);
        self.u_level = 0.0;
        self.i_level = 0.0;
        self.output_on_trigger = true;
        self.list.clear();
        self.exec = ListExecution::default();
    }
}

mod sm {
    use super::{TriggerContext, TriggerMode, TriggerSource};
    use smlang::statemachine;

    statemachine! {
        transitions: {
            *Idle + Initiate [guard_arm] = Armed,
            Idle + Abort = Idle,
            Armed + Fire(TriggerSource) [source_matches] = Triggered,
            Armed + Abort = Idle,
            Triggered + DelayElapsed = Initiating,
            Triggered + Abort = Idle,
            Initiating + ExecutionStarted / reset_execution = Running,
            Initiating + ExecutionFinished = Stopped,
            Initiating + Abort = Idle,
            Running + ExecutionFinished = Stopped,
            Running + Abort = Idle,
            Stopped + Initiate [guard_arm] = Armed,
            Stopped + Abort = Idle,
        }
    }

    impl Copy for States {}
    impl Clone for States {
        fn clone(&self) -> States {
            *self
        }
    }

    impl StateMachineContext for TriggerContext {
        /// Refuse to arm configurations that can never execute.
        fn guard_arm(&self) -> Result<bool, ()> {
            match self.mode {
                TriggerMode::List => {
                    if self.list.is_empty() {
                        Ok(false)
                    } else {
                        Ok(true)
                    }
                }
                TriggerMode::FunctionGenerator => Ok(false),
                _ => Ok(true),
            }
        }

        fn source_matches(&self, source: &TriggerSource) -> Result<bool, ()> {
            Ok(*source == self.source)
        }

        fn reset_execution(&mut self) -> Result<(), ()> {
            self.exec = Default::default();
            Ok(())
        }
    }
}

pub(crate) use sm::Events as TriggerEvents;

/// The per-channel trigger state machine.
pub type TriggerMachine = sm::StateMachine<TriggerContext>;

impl sm::StateMachine<TriggerContext> {
    pub fn trigger_state(&self) -> TriggerState {
        match self.state() {
            sm::States::Idle => TriggerState::Idle,
            sm::States::Armed => TriggerState::Armed,
            sm::States::Triggered => TriggerState::Triggered,
            sm::States::Initiating => TriggerState::Initiating,
            sm::States::Running => TriggerState::Running,
            sm::States::Stopped => TriggerState::Stopped,
        }
    }

    pub(crate) fn arm(&mut self) -> bool {
        self.process_event(TriggerEvents::Initiate).is_ok()
    }

    /// Deliver a source event. Returns true if this engine fired.
    ///
    /// Only an armed engine with a matching source transitions; an engine
    /// that is already triggered or executing ignores further events.
    pub(crate) fn fire(&mut self, source: TriggerSource, now: Instant) -> bool {
        if self.process_event(TriggerEvents::Fire(source)).is_ok() {
            self.context_mut().fired_at = Some(now);
            true
        } else {
            false
        }
    }

    /// Whether the post-trigger delay has elapsed.
    pub(crate) fn delay_elapsed(&self, now: Instant) -> bool {
        match self.context().fired_at {
            Some(fired) => now
                .checked_duration_since(fired)
                .map_or(false, |since| since >= self.context().delay),
            None => true,
        }
    }

    pub(crate) fn abort(&mut self) {
        self.process_event(TriggerEvents::Abort).ok();
        self.context_mut().fired_at = None;
        self.context_mut().exec = Default::default();
    }

    /// Dwell countdown display values in whole seconds for the running
    /// step, or `None` when hidden.
    pub fn dwell_countdown(&self) -> Option<(u64, u64)> {
        if !matches!(self.state(), sm::States::Running) {
            return None;
        }

        if !matches!(self.context().mode, TriggerMode::List) {
            return None;
        }

        let total = self.context().list.dwell_of(self.context().exec.step_index());
        if total < DWELL_COUNTDOWN_DISPLAY_THRESHOLD {
            return None;
        }

        let round_secs = |d: Duration| (d.ticks() + 500) / 1_000;
        Some((
            round_secs(self.context().exec.dwell_remaining()),
            round_secs(total),
        ))
    }
}
