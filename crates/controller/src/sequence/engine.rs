//! Sequence interpreter
//!
//! The caller drives cadence: one `process()` call runs one tick over
//! every RUNNING sequence. WAIT_* steps are re-entrant across ticks;
//! SET_OUTPUT and GOTO complete within their tick. Actuator writes go
//! through the `CommandSink` so the engine never touches IOCR buffers
//! directly.

use crate::clock::now_monotonic_ms;
use crate::error::{CoreError, CoreResult};
use crate::registry::Registry;
use crate::sequence::step::{CompareOp, Sequence, SequenceState, Step};
use crate::wire::ActuatorCommand;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const MAX_SEQUENCES: usize = 16;
const MAX_EVENT_SUBSCRIBERS: usize = 64;

/// Where SET_OUTPUT steps land. The controller routes them into the
/// AR output buffers; tests plug in a recorder.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn submit(
        &self,
        station: &str,
        slot: u16,
        command: ActuatorCommand,
        pwm: u8,
    ) -> CoreResult<()>;
}

/// Lifecycle notifications, the typed replacement for per-sequence
/// callback pointers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SequenceEvent {
    Started { id: u32 },
    StepStarted { id: u32, step: usize },
    /// Fires exactly once per run: true on COMPLETE, false on FAULTED
    Completed { id: u32, success: bool },
    Paused { id: u32 },
    Resumed { id: u32 },
    Aborted { id: u32 },
}

pub struct SequenceEngine {
    registry: Arc<Registry>,
    sink: Arc<dyn CommandSink>,
    sequences: Mutex<Vec<Sequence>>,
    event_tx: broadcast::Sender<SequenceEvent>,
}

impl SequenceEngine {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn CommandSink>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(MAX_EVENT_SUBSCRIBERS);
        Arc::new(Self {
            registry,
            sink,
            sequences: Mutex::new(Vec::new()),
            event_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SequenceEvent) {
        let _ = self.event_tx.send(event);
    }

    pub async fn add(&self, sequence: Sequence) -> CoreResult<u32> {
        let mut sequences = self.sequences.lock().await;
        if sequences.iter().any(|s| s.id == sequence.id) {
            return Err(CoreError::AlreadyExists(format!(
                "sequence {}",
                sequence.id
            )));
        }
        if sequences.len() >= MAX_SEQUENCES {
            return Err(CoreError::Full(MAX_SEQUENCES));
        }
        let id = sequence.id;
        sequences.push(sequence);
        Ok(id)
    }

    pub async fn remove(&self, id: u32) -> CoreResult<()> {
        let mut sequences = self.sequences.lock().await;
        let idx = sequences
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("sequence {id}")))?;
        sequences.remove(idx);
        Ok(())
    }

    pub async fn get(&self, id: u32) -> CoreResult<Sequence> {
        let sequences = self.sequences.lock().await;
        sequences
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("sequence {id}")))
    }

    pub async fn list(&self) -> Vec<Sequence> {
        self.sequences.lock().await.clone()
    }

    /// Start a sequence from rest. Restarting a finished sequence is
    /// allowed; a running or paused one is not.
    pub async fn start(&self, id: u32) -> CoreResult<()> {
        let mut sequences = self.sequences.lock().await;
        let seq = find_mut(&mut sequences, id)?;
        match seq.state {
            SequenceState::Running | SequenceState::Paused => {
                return Err(CoreError::Busy(format!(
                    "sequence {id} is {}",
                    seq.state
                )));
            }
            SequenceState::Idle
            | SequenceState::Complete
            | SequenceState::Aborted
            | SequenceState::Faulted => {}
        }
        if !seq.enabled {
            return Err(CoreError::InvalidParam(format!("sequence {id} is disabled")));
        }
        let now = now_monotonic_ms();
        seq.state = SequenceState::Running;
        seq.current_step = 0;
        seq.sequence_start_ms = now;
        seq.step_start_ms = now;
        seq.paused_at_ms = None;
        info!("sequence {} ({}) started", id, seq.name);
        drop(sequences);
        self.emit(SequenceEvent::Started { id });
        self.emit(SequenceEvent::StepStarted { id, step: 0 });
        Ok(())
    }

    /// Abort unconditionally
    pub async fn stop(&self, id: u32) -> CoreResult<()> {
        let mut sequences = self.sequences.lock().await;
        let seq = find_mut(&mut sequences, id)?;
        seq.state = SequenceState::Aborted;
        info!("sequence {} aborted", id);
        drop(sequences);
        self.emit(SequenceEvent::Aborted { id });
        Ok(())
    }

    pub async fn pause(&self, id: u32) -> CoreResult<()> {
        let mut sequences = self.sequences.lock().await;
        let seq = find_mut(&mut sequences, id)?;
        if seq.state != SequenceState::Running {
            return Err(CoreError::NotInitialized(format!(
                "sequence {id} is {}, not running",
                seq.state
            )));
        }
        seq.state = SequenceState::Paused;
        seq.paused_at_ms = Some(now_monotonic_ms());
        drop(sequences);
        self.emit(SequenceEvent::Paused { id });
        Ok(())
    }

    /// Resume a paused sequence. Timers are rebased so an in-flight
    /// WAIT_TIME does not complete just because the pause was long.
    pub async fn resume(&self, id: u32) -> CoreResult<()> {
        let mut sequences = self.sequences.lock().await;
        let seq = find_mut(&mut sequences, id)?;
        if seq.state != SequenceState::Paused {
            return Err(CoreError::NotInitialized(format!(
                "sequence {id} is {}, not paused",
                seq.state
            )));
        }
        let paused_at = seq.paused_at_ms.take().unwrap_or_else(now_monotonic_ms);
        let paused_for = now_monotonic_ms().saturating_sub(paused_at);
        seq.step_start_ms += paused_for;
        seq.sequence_start_ms += paused_for;
        seq.state = SequenceState::Running;
        drop(sequences);
        self.emit(SequenceEvent::Resumed { id });
        Ok(())
    }

    /// One tick over all running sequences
    pub async fn process(&self) {
        let mut sequences = self.sequences.lock().await;
        for i in 0..sequences.len() {
            if sequences[i].state != SequenceState::Running {
                continue;
            }
            let mut seq = sequences[i].clone();
            let events = self.tick(&mut seq).await;
            sequences[i] = seq;
            for event in events {
                self.emit(event);
            }
        }
    }

    /// Advance one sequence by one tick. Immediate steps chain within
    /// the tick; a completing WAIT advances once and yields.
    async fn tick(&self, seq: &mut Sequence) -> Vec<SequenceEvent> {
        let mut events = Vec::new();
        let now = now_monotonic_ms();

        if seq.sequence_timeout_ms > 0
            && now.saturating_sub(seq.sequence_start_ms) >= seq.sequence_timeout_ms
        {
            warn!(
                "sequence {} exceeded its {} ms deadline",
                seq.id, seq.sequence_timeout_ms
            );
            seq.state = SequenceState::Faulted;
            events.push(SequenceEvent::Completed {
                id: seq.id,
                success: false,
            });
            return events;
        }

        loop {
            let Some(step) = seq.steps.get(seq.current_step).cloned() else {
                // ran off the end of the program
                seq.state = SequenceState::Complete;
                events.push(SequenceEvent::Completed {
                    id: seq.id,
                    success: true,
                });
                return events;
            };

            match step {
                Step::SetOutput {
                    station,
                    slot,
                    command,
                    pwm,
                } => {
                    if let Err(e) = self.sink.submit(&station, slot, command, pwm).await {
                        warn!(
                            "sequence {} step {}: actuator write failed: {e}",
                            seq.id, seq.current_step
                        );
                        seq.state = SequenceState::Faulted;
                        events.push(SequenceEvent::Completed {
                            id: seq.id,
                            success: false,
                        });
                        return events;
                    }
                    advance(seq, now, &mut events);
                }
                Step::Goto { target_step } => {
                    if target_step >= seq.steps.len() {
                        seq.state = SequenceState::Faulted;
                        events.push(SequenceEvent::Completed {
                            id: seq.id,
                            success: false,
                        });
                        return events;
                    }
                    seq.current_step = target_step;
                    seq.step_start_ms = now;
                    events.push(SequenceEvent::StepStarted {
                        id: seq.id,
                        step: target_step,
                    });
                }
                Step::End => {
                    seq.state = SequenceState::Complete;
                    info!("sequence {} complete", seq.id);
                    events.push(SequenceEvent::Completed {
                        id: seq.id,
                        success: true,
                    });
                    return events;
                }
                Step::WaitTime { duration_ms } => {
                    if now.saturating_sub(seq.step_start_ms) >= duration_ms {
                        advance(seq, now, &mut events);
                    }
                    return events;
                }
                Step::WaitCondition {
                    station,
                    slot,
                    op,
                    threshold,
                    timeout_ms,
                } => {
                    if self.wait_timed_out(seq, timeout_ms, now) {
                        seq.state = SequenceState::Faulted;
                        events.push(SequenceEvent::Completed {
                            id: seq.id,
                            success: false,
                        });
                        return events;
                    }
                    if let Some(value) = self.usable_value(&station, slot).await {
                        let done = match op {
                            CompareOp::Above => value > threshold,
                            CompareOp::Below => value < threshold,
                        };
                        if done {
                            advance(seq, now, &mut events);
                        }
                    }
                    return events;
                }
                Step::WaitLevel {
                    station,
                    slot,
                    target,
                    tolerance,
                    timeout_ms,
                } => {
                    if self.wait_timed_out(seq, timeout_ms, now) {
                        seq.state = SequenceState::Faulted;
                        events.push(SequenceEvent::Completed {
                            id: seq.id,
                            success: false,
                        });
                        return events;
                    }
                    if let Some(value) = self.usable_value(&station, slot).await {
                        if (value - target).abs() <= tolerance {
                            advance(seq, now, &mut events);
                        }
                    }
                    return events;
                }
            }
        }
    }

    fn wait_timed_out(&self, seq: &Sequence, step_timeout_ms: u64, now: u64) -> bool {
        let timeout = if step_timeout_ms > 0 {
            step_timeout_ms
        } else {
            seq.default_step_timeout_ms
        };
        timeout > 0 && now.saturating_sub(seq.step_start_ms) >= timeout
    }

    /// A sensor value fit to drive control: GOOD or UNCERTAIN, not
    /// stale. Anything else keeps the wait pending.
    async fn usable_value(&self, station: &str, slot: u16) -> Option<f32> {
        match self.registry.get_sensor(station, slot).await {
            Ok(reading) if reading.quality.usable_for_control() && !reading.stale => {
                Some(reading.value)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("wait step cannot read {station}/{slot}: {e}");
                None
            }
        }
    }
}

fn advance(seq: &mut Sequence, now: u64, events: &mut Vec<SequenceEvent>) {
    seq.current_step += 1;
    seq.step_start_ms = now;
    if seq.current_step < seq.steps.len() {
        events.push(SequenceEvent::StepStarted {
            id: seq.id,
            step: seq.current_step,
        });
    }
}

fn find_mut<'a>(sequences: &'a mut [Sequence], id: u32) -> CoreResult<&'a mut Sequence> {
    sequences
        .iter_mut()
        .find(|s| s.id == id)
        .ok_or_else(|| CoreError::NotFound(format!("sequence {id}")))
}
