//! Resumable loop frames
//!
//! Every loop construct runs through one `LoopFrame`. When a body yields
//! or suspends, the frame records where the body stopped (and the frame of
//! a nested loop that stopped with it) and travels up inside the
//! `CommandResult`. Handing the frame back to `run_loop` continues from
//! exactly that point.

use super::{CommandResult, ExecError, Executor, GeneratorStep, Mode, SeqOutcome};
use crate::ast::{ParsedCommand, Position, Value};
use crate::list::StoredList;
use crate::state::{ExecutionState, MacroFrame};
use crate::store::ObjectStore;
use std::sync::Arc;
use tracing::debug;

/// Where a `for` loop draws its values from
#[derive(Debug, Clone, PartialEq)]
pub enum ForSource {
    /// Inclusive numeric range
    Range { current: f64, end: f64, step: f64 },
    Items { items: Vec<Value>, index: usize },
    /// Generator or iterator token, advanced once per iteration
    Generator(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopKind {
    While {
        condition: Arc<Vec<ParsedCommand>>,
    },
    For {
        var: String,
        source: ForSource,
    },
    /// Runs `count` times; each iteration's result is collected
    Repeat {
        count: usize,
        var: Option<String>,
        results: Vec<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopFrame {
    pub kind: LoopKind,
    pub body: Arc<Vec<ParsedCommand>>,
    /// Body index to continue from after a yield or suspend
    pub resume_at: Option<usize>,
    pub iteration: usize,
    /// Nested loop that stopped at `body[resume_at]`
    pub inner: Option<Box<LoopFrame>>,
    pub position: Position,
}

impl LoopFrame {
    pub fn new(kind: LoopKind, body: Arc<Vec<ParsedCommand>>, position: Position) -> Self {
        LoopFrame {
            kind,
            body,
            resume_at: None,
            iteration: 0,
            inner: None,
            position,
        }
    }

    /// Drop the claims of collected results, nested frames included
    pub fn release(self, store: &ObjectStore) {
        if let LoopKind::Repeat { results, .. } = self.kind {
            for value in &results {
                store.release_value(value);
            }
        }
        if let Some(inner) = self.inner {
            inner.release(store);
        }
    }
}

enum BodyFlow {
    Next,
    Break,
    Exit(CommandResult),
}

impl Executor {
    /// Run a loop to completion or to the next yield/suspend
    pub fn run_loop(
        &self,
        mut frame: LoopFrame,
        state: &Arc<ExecutionState>,
        mframe: Option<&Arc<MacroFrame>>,
    ) -> CommandResult {
        if let Some(start) = frame.resume_at.take() {
            debug!(target: "tether::flow", "loop resumes at body[{}] in iteration {}", start, frame.iteration);
            match self.resume_body(&mut frame, start, state, mframe) {
                BodyFlow::Next => {}
                BodyFlow::Break => return self.finish_loop(frame, state),
                BodyFlow::Exit(result) => return result,
            }
        }

        loop {
            if self.config().exceeds_iterations(frame.iteration + 1) {
                let max = self.config().max_iterations;
                let position = frame.position;
                frame.release(self.store());
                return self.fail(position, ExecError::IterationLimit(max));
            }
            match self.advance(&mut frame, state, mframe) {
                Ok(true) => {}
                Ok(false) => break,
                Err(result) => {
                    frame.release(self.store());
                    return result;
                }
            }
            frame.iteration += 1;
            match self.run_body(&mut frame, 0, state, mframe) {
                BodyFlow::Next => {}
                BodyFlow::Break => break,
                BodyFlow::Exit(result) => return result,
            }
        }
        self.finish_loop(frame, state)
    }

    /// Continue a body that stopped at `start`
    fn resume_body(
        &self,
        frame: &mut LoopFrame,
        start: usize,
        state: &Arc<ExecutionState>,
        mframe: Option<&Arc<MacroFrame>>,
    ) -> BodyFlow {
        let Some(inner) = frame.inner.take() else {
            return self.run_body(frame, start, state, mframe);
        };
        let result = self.run_loop(*inner, state, mframe);
        match SeqOutcome::from_command(result, 0) {
            SeqOutcome::Status(s) => {
                state.set_last_status(s);
                self.run_body(frame, start + 1, state, mframe)
            }
            outcome => self.body_flow(frame, start, outcome, state),
        }
    }

    fn run_body(
        &self,
        frame: &mut LoopFrame,
        start: usize,
        state: &Arc<ExecutionState>,
        mframe: Option<&Arc<MacroFrame>>,
    ) -> BodyFlow {
        let body = Arc::clone(&frame.body);
        let start = start.min(body.len());
        let outcome = self.execute_sequence(&body[start..], state, mframe, Mode::Await);
        self.body_flow(frame, start, outcome, state)
    }

    fn body_flow(
        &self,
        frame: &mut LoopFrame,
        start: usize,
        outcome: SeqOutcome,
        state: &Arc<ExecutionState>,
    ) -> BodyFlow {
        match outcome {
            SeqOutcome::Status(s) => {
                self.collect_iteration(frame, state, s);
                BodyFlow::Next
            }
            SeqOutcome::Continue(n) if n <= 1 => {
                self.collect_iteration(frame, state, true);
                BodyFlow::Next
            }
            SeqOutcome::Continue(n) => self.exit_loop(frame, CommandResult::Continue(n - 1)),
            SeqOutcome::Break(n) if n <= 1 => BodyFlow::Break,
            SeqOutcome::Break(n) => self.exit_loop(frame, CommandResult::Break(n - 1)),
            SeqOutcome::EarlyReturn { status, result } => {
                self.exit_loop(frame, CommandResult::EarlyReturn { status, result })
            }
            SeqOutcome::Yield {
                value,
                frame: inner,
                resume_at,
            } => {
                frame.resume_at = Some(start + resume_at);
                frame.inner = inner;
                BodyFlow::Exit(CommandResult::Yield {
                    value,
                    frame: Some(Box::new(frame.clone())),
                })
            }
            SeqOutcome::Suspend {
                frame: inner,
                resume_at,
            } => {
                frame.resume_at = Some(start + resume_at);
                frame.inner = inner;
                BodyFlow::Exit(CommandResult::Suspend {
                    frame: Some(Box::new(frame.clone())),
                })
            }
            SeqOutcome::Token(id) => {
                // Bodies run in await mode, so this is a token nobody waited on
                let result = self.fail(frame.position, ExecError::Argument(format!("loop body left token {} pending", id)));
                self.exit_loop(frame, result)
            }
        }
    }

    fn exit_loop(&self, frame: &mut LoopFrame, result: CommandResult) -> BodyFlow {
        if let LoopKind::Repeat { results, .. } = &mut frame.kind {
            for value in results.drain(..) {
                self.store().release_value(&value);
            }
        }
        BodyFlow::Exit(result)
    }

    fn collect_iteration(&self, frame: &mut LoopFrame, state: &Arc<ExecutionState>, status: bool) {
        if let LoopKind::Repeat { results, .. } = &mut frame.kind {
            results.push(state.take_result().unwrap_or(Value::Bool(status)));
        }
    }

    /// Check the condition or bind the next value; false ends the loop
    fn advance(
        &self,
        frame: &mut LoopFrame,
        state: &Arc<ExecutionState>,
        mframe: Option<&Arc<MacroFrame>>,
    ) -> Result<bool, CommandResult> {
        let store = self.store();
        let position = frame.position;
        let iteration = frame.iteration;
        match &mut frame.kind {
            LoopKind::While { condition } => {
                let condition = Arc::clone(condition);
                match self.execute_sequence(&condition, state, mframe, Mode::Await) {
                    SeqOutcome::Status(s) => Ok(s),
                    SeqOutcome::EarlyReturn { status, result } => Err(CommandResult::EarlyReturn { status, result }),
                    _ => Err(self.fail(
                        position,
                        ExecError::Argument("while condition must finish with a status".into()),
                    )),
                }
            }
            LoopKind::For { var, source } => {
                let value = match source {
                    ForSource::Range { current, end, step } => {
                        let done = if *step > 0.0 { *current > *end } else { *current < *end };
                        if done {
                            return Ok(false);
                        }
                        let value = number_value(*current);
                        *current += *step;
                        value
                    }
                    ForSource::Items { items, index } => match items.get(*index) {
                        Some(v) => {
                            *index += 1;
                            v.clone()
                        }
                        None => return Ok(false),
                    },
                    ForSource::Generator(id) => match self.next_generated(id, position)? {
                        Some(v) => v,
                        None => return Ok(false),
                    },
                };
                state.set_variable(store, var, value);
                Ok(true)
            }
            LoopKind::Repeat { count, var, .. } => {
                if iteration >= *count {
                    return Ok(false);
                }
                if let Some(var) = var {
                    state.set_variable(store, var, Value::Int(iteration as i64));
                }
                Ok(true)
            }
        }
    }

    /// Next value of a generator-driven `for`; `None` once it retires
    fn next_generated(&self, id: &str, position: Position) -> Result<Option<Value>, CommandResult> {
        loop {
            match self.resume_generator(id) {
                GeneratorStep::Yielded(v) => return Ok(Some(v)),
                GeneratorStep::Suspended => continue,
                GeneratorStep::Finished { result, .. } => {
                    if let Some(v) = result {
                        self.store().release_value(&v);
                    }
                    return Ok(None);
                }
                GeneratorStep::NotFound => return Ok(None),
                GeneratorStep::NotGenerator => {
                    return Err(self.fail(
                        position,
                        ExecError::Argument(format!("{} is not a generator", id)),
                    ))
                }
            }
        }
    }

    fn finish_loop(&self, frame: LoopFrame, state: &Arc<ExecutionState>) -> CommandResult {
        debug!(target: "tether::flow", "loop finished after {} iteration(s)", frame.iteration);
        if let LoopKind::Repeat { results, .. } = frame.kind {
            let store = self.store();
            let list = store.store_list(StoredList::new(results.clone()));
            // The list now holds its own claims on the items
            for value in &results {
                store.release_value(value);
            }
            state.set_result(store, Some(Value::Ref(list)));
        }
        CommandResult::Status(true)
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}
