//! List program storage and step arithmetic.
//!
//! A list program is a bounded sequence of (voltage, current, dwell) steps
//! executed by the trigger engine. Step advancement and cycle counting are
//! pure bookkeeping here; applying the step values to a channel (and the
//! validation that entails) is the trigger engine's job.

use crate::error::{Error, Result};
use crate::scheduler::{duration_from_secs, Duration};

/// Hard maximum number of steps in a single channel's list program.
pub const MAX_LIST_LENGTH: usize = 256;

/// One program step.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ListStep {
    /// Programmed voltage in volts.
    pub voltage: f32,
    /// Programmed current in amperes.
    pub current: f32,
    /// How long the step holds before advancing, in seconds.
    pub dwell: f32,
}

/// Result of a dwell expiry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// Apply the step at this index and restart its dwell countdown.
    Apply(usize),
    /// The configured cycle count has completed.
    Finished,
}

/// A channel's stored list program.
#[derive(Debug, Clone, Default)]
pub struct ListProgram {
    steps: heapless::Vec<ListStep, MAX_LIST_LENGTH>,
    count: u16,
}

impl ListProgram {
    /// Replace the program contents.
    ///
    /// Rejects programs longer than [`MAX_LIST_LENGTH`] or containing a
    /// non-positive dwell.
    pub fn set_steps(&mut self, steps: &[ListStep]) -> Result<()> {
        if steps.len() > MAX_LIST_LENGTH {
            return Err(Error::DataOutOfRange);
        }

        if steps.iter().any(|step| step.dwell <= 0.0) {
            return Err(Error::DataOutOfRange);
        }

        self.steps.clear();
        self.steps.extend_from_slice(steps).ok();
        Ok(())
    }

    pub fn steps(&self) -> &[ListStep] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&ListStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of complete passes to run. Zero means run indefinitely.
    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn set_count(&mut self, count: u16) {
        self.count = count;
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.count = 0;
    }

    /// The dwell of the step at `index` on the control clock.
    pub(crate) fn dwell_of(&self, index: usize) -> Duration {
        self.steps
            .get(index)
            .map(|step| duration_from_secs(step.dwell))
            .unwrap_or(Duration::from_ticks(0))
    }

    /// Advance past the step recorded in `exec`. Wrapping past the last step
    /// completes a cycle; once the configured count of cycles has completed
    /// the program is finished.
    pub(crate) fn advance(&self, exec: &mut ListExecution) -> StepOutcome {
        debug_assert!(!self.is_empty());

        let next = exec.step_index + 1;
        if next < self.len() {
            exec.step_index = next;
            return StepOutcome::Apply(next);
        }

        exec.cycles_done = exec.cycles_done.saturating_add(1);
        if self.count != 0 && exec.cycles_done >= self.count {
            return StepOutcome::Finished;
        }

        exec.step_index = 0;
        StepOutcome::Apply(0)
    }
}

/// Runtime bookkeeping of an executing list.
#[derive(Debug, Copy, Clone)]
pub struct ListExecution {
    pub(crate) step_index: usize,
    pub(crate) cycles_done: u16,
    pub(crate) dwell_remaining: Duration,
}

impl Default for ListExecution {
    fn default() -> Self {
        Self {
            step_index: 0,
            cycles_done: 0,
            dwell_remaining: Duration::from_ticks(0),
        }
    }
}

impl ListExecution {
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn cycles_done(&self) -> u16 {
        self.cycles_done
    }

    pub fn dwell_remaining(&self) -> Duration {
        self.dwell_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(dwells: &[f32], count: u16) -> ListProgram {
        let steps: heapless::Vec<ListStep, MAX_LIST_LENGTH> = dwells
            .iter()
            .enumerate()
            .map(|(i, dwell)| ListStep {
                voltage: i as f32 + 1.0,
                current: 1.0,
                dwell: *dwell,
            })
            .collect();
        let mut program = ListProgram::default();
        program.set_steps(&steps).unwrap();
        program.set_count(count);
        program
    }

    #[test]
    fn rejects_overlong_and_invalid_programs() {
        let mut program = ListProgram::default();
        let step = ListStep {
            voltage: 1.0,
            current: 1.0,
            dwell: 1.0,
        };

        let too_long = [step; MAX_LIST_LENGTH + 1];
        assert_eq!(program.set_steps(&too_long), Err(Error::DataOutOfRange));

        let zero_dwell = [ListStep { dwell: 0.0, ..step }];
        assert_eq!(program.set_steps(&zero_dwell), Err(Error::DataOutOfRange));
        assert!(program.is_empty());
    }

    #[test]
    fn advance_wraps_and_counts_cycles() {
        let program = program(&[1.0, 1.0, 1.0], 2);
        let mut exec = ListExecution::default();

        assert_eq!(program.advance(&mut exec), StepOutcome::Apply(1));
        assert_eq!(program.advance(&mut exec), StepOutcome::Apply(2));

        // Wrap completes cycle one and restarts at step zero.
        assert_eq!(program.advance(&mut exec), StepOutcome::Apply(0));
        assert_eq!(exec.cycles_done(), 1);

        assert_eq!(program.advance(&mut exec), StepOutcome::Apply(1));
        assert_eq!(program.advance(&mut exec), StepOutcome::Apply(2));
        assert_eq!(program.advance(&mut exec), StepOutcome::Finished);
    }

    #[test]
    fn zero_count_never_finishes() {
        let program = program(&[1.0], 0);
        let mut exec = ListExecution::default();
        for _ in 0..1_000 {
            assert_eq!(program.advance(&mut exec), StepOutcome::Apply(0));
        }
    }

    #[test]
    fn dwell_converts_to_control_clock() {
        let program = program(&[0.5, 2.0], 1);
        assert_eq!(program.dwell_of(0), Duration::from_ticks(500));
        assert_eq!(program.dwell_of(1), Duration::from_ticks(2_000));
    }
}
