//! Execution engine with an explicit run-state machine.
//!
//! The [`Engine`] runs the units of a [`CompiledGraph`] in compiled order.
//! State transitions are `Ready -> Running -> (Completed | Failed)`; a
//! completed engine may run again, a failed one must be [reset](Engine::reset)
//! first.
//!
//! # Scheduling
//!
//! Command units are dispatched to their bound backend and stay in flight
//! until their token is waited on. Before a unit is dispatched, the engine
//! waits for every in-flight unit up to the last one it conflicts with:
//!
//! - read after write: the unit reads bytes an in-flight unit writes
//! - write after read/write: the unit writes bytes an in-flight unit touches
//!
//! Case-of units drain all in-flight work before evaluating their
//! predicate, then run the selected branch's units on the same arena.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_compile::{
    ArenaBuffer, CaseOfUnit, CommandUnit, CompiledGraph, Direction, ExecUnit, GraphExecArena,
    TensorBinding,
};
use tessera_core::{BackendId, ExecSymbol, TensorView, PASS_THROUGH};

use crate::backend::{Backend, BackendDispatcher, CompletionToken};
use crate::error::RuntimeError;

// ---------------------------------------------------------------------------
// Configuration, state and trace
// ---------------------------------------------------------------------------

/// Configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Whether to record a [`TraceEntry`] per executed unit.
    pub trace_enabled: bool,
    /// Maximum number of units in flight at once. Default: 8.
    pub max_in_flight: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            trace_enabled: false,
            max_in_flight: 8,
        }
    }
}

impl EngineConfig {
    /// Parses a config from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Run state of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Ready,
    Running,
    Completed,
    /// Stopped at a failing unit. Writes made before the failure stay in the
    /// arena.
    Failed { error: RuntimeError },
}

impl RunState {
    fn name(&self) -> &'static str {
        match self {
            RunState::Ready => "ready",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed { .. } => "failed",
        }
    }
}

/// One executed unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub unit: ExecSymbol,
    pub name: String,
    /// Backend of a command unit.
    pub backend: Option<BackendId>,
    /// Predicate result of a case-of unit.
    pub selected: Option<i32>,
    /// Case-of nesting depth; root units are at 0.
    pub depth: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct InFlight {
    unit: ExecSymbol,
    name: String,
    backend: Arc<dyn Backend>,
    token: CompletionToken,
    reads: Vec<Range<usize>>,
    writes: Vec<Range<usize>>,
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
}

fn ranges(bindings: &[TensorBinding]) -> Vec<Range<usize>> {
    bindings.iter().map(TensorBinding::range).collect()
}

/// Runs compiled graphs against a set of backends.
#[derive(Debug)]
pub struct Engine {
    dispatcher: BackendDispatcher,
    config: EngineConfig,
    state: RunState,
    trace: Option<Vec<TraceEntry>>,
}

impl Engine {
    pub fn new(dispatcher: BackendDispatcher, config: EngineConfig) -> Self {
        let trace = config.trace_enabled.then(Vec::new);
        Engine {
            dispatcher,
            config,
            state: RunState::Ready,
            trace,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &BackendDispatcher {
        &self.dispatcher
    }

    /// Trace of the last run, when tracing is enabled.
    pub fn trace(&self) -> Option<&[TraceEntry]> {
        self.trace.as_deref()
    }

    /// Returns a failed engine to `Ready`. The arena is left as it is.
    pub fn reset(&mut self) {
        self.state = RunState::Ready;
    }

    /// Runs every unit of `compiled` once.
    ///
    /// On failure the engine waits for the remaining in-flight units,
    /// enters `Failed` and returns the error.
    pub fn run(&mut self, compiled: &CompiledGraph) -> Result<(), RuntimeError> {
        if matches!(self.state, RunState::Running | RunState::Failed { .. }) {
            return Err(RuntimeError::InvalidState {
                state: self.state.name(),
            });
        }
        self.state = RunState::Running;
        if let Some(trace) = &mut self.trace {
            trace.clear();
        }

        let arena = compiled.arena().buffer().clone();
        let mut in_flight = VecDeque::new();
        let result = self
            .run_arena(compiled.exec_arena(), &arena, &mut in_flight, 0)
            .and_then(|()| retire(&mut in_flight, usize::MAX));

        match result {
            Ok(()) => {
                tracing::debug!(units = compiled.exec_arena().len(), "run completed");
                self.state = RunState::Completed;
                Ok(())
            }
            Err(err) => {
                abandon(&mut in_flight);
                tracing::warn!(error = %err, "run failed");
                self.state = RunState::Failed { error: err.clone() };
                Err(err)
            }
        }
    }

    fn run_arena(
        &mut self,
        exec_arena: &GraphExecArena,
        arena: &ArenaBuffer,
        in_flight: &mut VecDeque<InFlight>,
        depth: usize,
    ) -> Result<(), RuntimeError> {
        for unit in &exec_arena.units {
            match unit {
                ExecUnit::Command(command) => {
                    self.dispatch(command, arena, in_flight, depth)?;
                }
                ExecUnit::CaseOf(case_of) => {
                    retire(in_flight, usize::MAX)?;
                    self.run_case_of(case_of, arena, in_flight, depth)?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        unit: &CommandUnit,
        arena: &ArenaBuffer,
        in_flight: &mut VecDeque<InFlight>,
        depth: usize,
    ) -> Result<(), RuntimeError> {
        let backend = self
            .dispatcher
            .get(unit.backend)
            .cloned()
            .ok_or(RuntimeError::UnknownBackend {
                unit: unit.exec,
                backend: unit.backend,
            })?;

        let reads = ranges(&unit.inputs);
        let writes = ranges(&unit.outputs);
        let conflict = in_flight.iter().rposition(|other| {
            reads
                .iter()
                .any(|r| other.writes.iter().any(|w| overlaps(r, w)))
                || writes.iter().any(|w| {
                    other
                        .writes
                        .iter()
                        .chain(&other.reads)
                        .any(|o| overlaps(w, o))
                })
        });
        if let Some(position) = conflict {
            retire(in_flight, position + 1)?;
        }
        let limit = self.config.max_in_flight.max(1);
        if in_flight.len() >= limit {
            let excess = in_flight.len() + 1 - limit;
            retire(in_flight, excess)?;
        }

        tracing::trace!(unit = %unit.exec, name = %unit.name, backend = %unit.backend, "dispatch");
        let token = backend.dispatch(&unit.command, arena, &unit.inputs, &unit.outputs);
        self.record(TraceEntry {
            unit: unit.exec,
            name: unit.name.clone(),
            backend: Some(unit.backend),
            selected: None,
            depth,
        });
        in_flight.push_back(InFlight {
            unit: unit.exec,
            name: unit.name.clone(),
            backend,
            token,
            reads,
            writes,
        });
        Ok(())
    }

    fn run_case_of(
        &mut self,
        unit: &CaseOfUnit,
        arena: &ArenaBuffer,
        in_flight: &mut VecDeque<InFlight>,
        depth: usize,
    ) -> Result<(), RuntimeError> {
        let selected = select(unit, arena);
        tracing::debug!(
            unit = %unit.exec,
            name = %unit.name,
            backward = unit.direction == Direction::Backward,
            selected,
            "case-of"
        );
        self.record(TraceEntry {
            unit: unit.exec,
            name: unit.name.clone(),
            backend: None,
            selected: Some(selected),
            depth,
        });

        if selected == PASS_THROUGH {
            let pairs = unit
                .pass_through
                .as_ref()
                .ok_or(RuntimeError::PassThroughUnavailable { unit: unit.exec })?;
            for (from, to) in pairs {
                arena.copy(from, to);
            }
            for zero in &unit.zero_fill {
                arena.fill(zero, 0.0);
            }
            return Ok(());
        }

        let branch = usize::try_from(selected)
            .ok()
            .and_then(|index| unit.branches.get(&index))
            .ok_or(RuntimeError::MissingBranch {
                unit: unit.exec,
                index: selected,
            })?;
        self.run_arena(branch, arena, in_flight, depth + 1)
    }

    fn record(&mut self, entry: TraceEntry) {
        if let Some(trace) = &mut self.trace {
            trace.push(entry);
        }
    }
}

/// Evaluates the predicate of `unit` on the current arena contents.
fn select(unit: &CaseOfUnit, arena: &ArenaBuffer) -> i32 {
    let bytes: Vec<Vec<u8>> = unit
        .predicate_inputs
        .iter()
        .map(|b| arena.read_bytes(b))
        .collect();
    let views: Vec<TensorView<'_>> = unit
        .predicate_inputs
        .iter()
        .zip(&bytes)
        .map(|(b, bytes)| TensorView::new(&b.params, bytes))
        .collect();
    unit.predicate.select(&views)
}

/// Waits for the `count` oldest in-flight units.
fn retire(in_flight: &mut VecDeque<InFlight>, count: usize) -> Result<(), RuntimeError> {
    for _ in 0..count {
        let Some(done) = in_flight.pop_front() else {
            break;
        };
        let backend = done.backend.id();
        done.backend
            .wait(done.token)
            .map_err(|source| RuntimeError::BackendDispatchFailure {
                unit: done.unit,
                name: done.name,
                backend,
                source,
            })?;
    }
    Ok(())
}

/// Waits for everything still in flight after a failure, ignoring results.
fn abandon(in_flight: &mut VecDeque<InFlight>) {
    while let Some(done) = in_flight.pop_front() {
        if let Err(err) = done.backend.wait(done.token) {
            tracing::debug!(unit = %done.unit, error = %err, "abandoned unit also failed");
        }
    }
}
