//! Step programs
//!
//! A sequence is an ordered list of at most 64 steps interpreted
//! against the process image. Programs are serializable so they can be
//! stored next to the topology.

use crate::error::{CoreError, CoreResult};
use crate::wire::ActuatorCommand;
use serde::{Deserialize, Serialize};

pub const MAX_STEPS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Above,
    Below,
}

/// One step of a control program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Write an actuator; completes immediately
    SetOutput {
        station: String,
        slot: u16,
        command: ActuatorCommand,
        pwm: u8,
    },
    /// Wait a fixed time
    WaitTime { duration_ms: u64 },
    /// Wait until a sensor crosses a threshold; faults on timeout
    WaitCondition {
        station: String,
        slot: u16,
        op: CompareOp,
        threshold: f32,
        timeout_ms: u64,
    },
    /// Wait until a sensor settles within a band around a target
    WaitLevel {
        station: String,
        slot: u16,
        target: f32,
        tolerance: f32,
        timeout_ms: u64,
    },
    /// Jump to another step; completes immediately
    Goto { target_step: usize },
    /// Terminal step
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    Idle,
    Running,
    Paused,
    Complete,
    Aborted,
    Faulted,
}

impl std::fmt::Display for SequenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// A step program plus its run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: u32,
    pub name: String,
    pub enabled: bool,
    #[serde(skip, default = "idle_state")]
    pub state: SequenceState,
    pub steps: Vec<Step>,
    #[serde(skip)]
    pub current_step: usize,
    #[serde(skip)]
    pub(crate) sequence_start_ms: u64,
    #[serde(skip)]
    pub(crate) step_start_ms: u64,
    #[serde(skip)]
    pub(crate) paused_at_ms: Option<u64>,
    /// 0 means unlimited
    pub sequence_timeout_ms: u64,
    /// Applied to WAIT_* steps that carry no timeout of their own;
    /// 0 means unlimited
    pub default_step_timeout_ms: u64,
}

fn idle_state() -> SequenceState {
    SequenceState::Idle
}

impl Sequence {
    pub fn new(id: u32, name: &str, steps: Vec<Step>) -> CoreResult<Self> {
        if steps.is_empty() || steps.len() > MAX_STEPS {
            return Err(CoreError::Full(MAX_STEPS));
        }
        Ok(Self {
            id,
            name: name.to_string(),
            enabled: true,
            state: SequenceState::Idle,
            steps,
            current_step: 0,
            sequence_start_ms: 0,
            step_start_ms: 0,
            paused_at_ms: None,
            sequence_timeout_ms: 0,
            default_step_timeout_ms: 0,
        })
    }

    /// The filter backwash program: drop the outlet, flush backwards
    /// through the media until the waste runs clear, then settle and
    /// return to service.
    pub fn backwash(id: u32, station: &str) -> Self {
        let set = |slot: u16, command: ActuatorCommand| Step::SetOutput {
            station: station.to_string(),
            slot,
            command,
            pwm: 0,
        };
        let steps = vec![
            set(11, ActuatorCommand::Off), // close service outlet
            Step::WaitTime { duration_ms: 5000 },
            set(10, ActuatorCommand::On), // open waste valve
            Step::WaitTime { duration_ms: 2000 },
            set(9, ActuatorCommand::On), // start backwash pump
            Step::WaitCondition {
                station: station.to_string(),
                slot: 3,
                op: CompareOp::Below,
                threshold: 10.0,
                timeout_ms: 600_000,
            },
            set(9, ActuatorCommand::Off),
            Step::WaitTime { duration_ms: 5000 },
            set(10, ActuatorCommand::Off),
            Step::WaitTime { duration_ms: 2000 },
            set(11, ActuatorCommand::On), // back in service
            Step::End,
        ];
        Self::new(id, "filter-backwash", steps).expect("backwash fits the step limit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_limit_is_enforced() {
        let too_many = vec![Step::End; MAX_STEPS + 1];
        assert!(matches!(
            Sequence::new(1, "too-big", too_many),
            Err(CoreError::Full(MAX_STEPS))
        ));
        assert!(Sequence::new(1, "empty", vec![]).is_err());
    }

    #[test]
    fn backwash_program_matches_the_procedure() {
        let seq = Sequence::backwash(1, "rtu-4b64");
        assert_eq!(seq.steps.len(), 12);
        assert_eq!(
            seq.steps[0],
            Step::SetOutput {
                station: "rtu-4b64".to_string(),
                slot: 11,
                command: ActuatorCommand::Off,
                pwm: 0,
            }
        );
        assert_eq!(seq.steps[1], Step::WaitTime { duration_ms: 5000 });
        assert!(matches!(
            seq.steps[5],
            Step::WaitCondition {
                slot: 3,
                op: CompareOp::Below,
                ..
            }
        ));
        assert_eq!(seq.steps[11], Step::End);
    }

    #[test]
    fn programs_serialize_for_storage() {
        let seq = Sequence::backwash(7, "rtu-4b64");
        let json = serde_json::to_string(&seq).unwrap();
        let back: Sequence = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps, seq.steps);
        assert_eq!(back.state, SequenceState::Idle);
    }
}
