//! Step-sequence engine
//!
//! Interprets operator-authored step programs against the process
//! image at the control-scan cadence.

pub mod engine;
pub mod step;

pub use engine::{CommandSink, SequenceEngine, SequenceEvent};
pub use step::{CompareOp, Sequence, SequenceState, Step, MAX_STEPS};
