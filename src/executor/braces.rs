//! Brace sub-expressions
//!
//! Top-level `{...}` expressions of a command run first, left to right,
//! each in a brace child state that shares the caller's variables but has
//! its own result slot. Their values are spliced back into the command
//! text. When some of them suspend, a coordinator token collects the late
//! values and finishes the command once the last one is in.

use super::resume::Step;
use super::sequence::BraceSubst;
use super::{CommandResult, ExecError, Executor, Mode, SeqOutcome, TokenRequest};
use crate::ast::{ObjectRef, Position, Value};
use crate::state::{ExecutionState, MacroFrame};
use crate::substitution::{find_braces, format_brace_value, splice};
use crate::token::{BraceCoordinator, BraceOutcome, BraceRecord, BraceResume, Continuation};
use std::sync::Arc;
use tracing::{debug, warn};

enum BraceEval {
    /// Value carrying its claim
    Value(Value),
    Failed,
    Pending(String),
}

impl Executor {
    pub(crate) fn substitute_braces(
        &self,
        text: &str,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
        invert: bool,
    ) -> BraceSubst {
        let spans = find_braces(text);
        if spans.is_empty() {
            return BraceSubst::Text(text.to_string(), Vec::new());
        }

        let mut records = Vec::with_capacity(spans.len());
        for span in spans {
            let child = Arc::new(state.brace_child());
            let (token, outcome) = match self.evaluate_brace(&span.inner, &child, frame, position) {
                BraceEval::Value(v) => (None, Some(BraceOutcome::Value(v))),
                BraceEval::Pending(id) => (Some(id), None),
                BraceEval::Failed => {
                    child.release(self.store());
                    self.discard_records(records);
                    return BraceSubst::Failed;
                }
            };
            records.push(BraceRecord {
                span,
                state: child,
                token,
                outcome,
            });
        }

        if records.iter().all(BraceRecord::is_complete) {
            let (spliced, claims) = self.splice_records(text, records);
            return BraceSubst::Text(spliced, claims);
        }
        BraceSubst::Async(self.coordinate_braces(text, records, state, frame, position, invert))
    }

    fn evaluate_brace(
        &self,
        inner: &str,
        child: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
    ) -> BraceEval {
        let commands = match self.parse_cached(inner) {
            Ok(commands) => commands,
            Err(e) => {
                self.fail(position, e);
                return BraceEval::Failed;
            }
        };
        debug!(target: "tether::command", "brace {{{}}}", inner);
        match self.execute_sequence(&commands, child, frame, Mode::Async) {
            SeqOutcome::Status(true) => BraceEval::Value(child.take_result().unwrap_or(Value::Bool(true))),
            SeqOutcome::EarlyReturn { status: true, result } => match result {
                Some(v) => {
                    self.store().claim_value(&v);
                    BraceEval::Value(v)
                }
                None => BraceEval::Value(child.take_result().unwrap_or(Value::Bool(true))),
            },
            SeqOutcome::Yield { value, .. } => {
                self.store().claim_value(&value);
                BraceEval::Value(value)
            }
            SeqOutcome::Token(id) => BraceEval::Pending(id),
            SeqOutcome::Status(false) | SeqOutcome::EarlyReturn { .. } => BraceEval::Failed,
            SeqOutcome::Suspend { .. } => {
                self.fail(position, ExecError::Argument("suspend inside a brace expression".into()));
                BraceEval::Failed
            }
            SeqOutcome::Break(_) | SeqOutcome::Continue(_) => {
                self.fail(position, ExecError::Argument("break or continue inside a brace expression".into()));
                BraceEval::Failed
            }
        }
    }

    /// Splice completed values; references stay claimed for the command
    fn splice_records(&self, text: &str, records: Vec<BraceRecord>) -> (String, Vec<ObjectRef>) {
        let store = self.store();
        let mut spans = Vec::with_capacity(records.len());
        let mut replacements = Vec::with_capacity(records.len());
        let mut claims = Vec::new();
        for record in records {
            if let Some(BraceOutcome::Value(value)) = &record.outcome {
                replacements.push(format_brace_value(store, value, &record.span));
                if let Value::Ref(r) = value {
                    claims.push(*r);
                }
            } else {
                replacements.push("nil".to_string());
            }
            record.state.release(store);
            spans.push(record.span);
        }
        (splice(text, &spans, &replacements), claims)
    }

    fn discard_records(&self, records: Vec<BraceRecord>) {
        let store = self.store();
        for record in records {
            if let Some(BraceOutcome::Value(value)) = &record.outcome {
                store.release_value(value);
            }
            record.state.release(store);
        }
    }

    fn coordinate_braces(
        &self,
        text: &str,
        records: Vec<BraceRecord>,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
        invert: bool,
    ) -> String {
        let pending: Vec<(usize, String)> = records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.token.clone().map(|t| (i, t)))
            .collect();

        let coordinator = self.request_token(
            TokenRequest::new()
                .at(position)
                .with_state(Arc::clone(state))
                .with_continuation(Continuation::Braces(BraceCoordinator {
                    text: text.to_string(),
                    records,
                    waiter: BraceResume {
                        state: Arc::clone(state),
                        frame: frame.cloned(),
                        position,
                        invert,
                    },
                })),
        );
        debug!(target: "tether::async", "brace coordinator {} waits on {} token(s)", coordinator, pending.len());

        for (index, token) in pending {
            let link = self.request_token(
                TokenRequest::new()
                    .at(position)
                    .with_parent(&coordinator)
                    .with_continuation(Continuation::BraceLink {
                        coordinator: coordinator.clone(),
                        index,
                    }),
            );
            self.chain_tokens(&token, &link);
        }
        coordinator
    }

    /// One asynchronous brace finished; wake the coordinator after the last
    pub(crate) fn link_brace(&self, coordinator: &str, index: usize, status: bool) -> Step {
        let mut tokens = self.tokens();
        let Some(Continuation::Braces(braces)) = tokens
            .get_mut(coordinator)
            .and_then(|record| record.continuation.as_mut())
        else {
            warn!(target: "tether::async", "brace coordinator {} is gone", coordinator);
            return Step::Done(status);
        };
        let Some(record) = braces.records.get_mut(index) else {
            return Step::Done(status);
        };
        record.outcome = Some(if status {
            BraceOutcome::Value(record.state.take_result().unwrap_or(Value::Bool(true)))
        } else {
            BraceOutcome::Failed
        });
        if braces.pending() == 0 {
            Step::Forward {
                status: true,
                target: coordinator.to_string(),
            }
        } else {
            Step::Done(status)
        }
    }

    /// Every brace is in: splice and run the command
    pub(crate) fn finish_braces(&self, coordinator: BraceCoordinator, _status: bool) -> Step {
        let BraceCoordinator {
            text,
            records,
            waiter,
        } = coordinator;

        let failed = records
            .iter()
            .any(|r| !matches!(r.outcome, Some(BraceOutcome::Value(_))));
        if failed {
            warn!(target: "tether::command", "{}: Command in brace expression failed", waiter.position);
            self.discard_records(records);
            return Step::Done(false);
        }

        let (spliced, claims) = self.splice_records(&text, records);
        let result = self.complete_command(
            &spliced,
            &waiter.state,
            waiter.frame.as_ref(),
            waiter.position,
            waiter.invert,
            claims,
        );
        match result {
            CommandResult::Status(s) => Step::Done(s),
            CommandResult::Token(id) => Step::Pending(id),
            CommandResult::EarlyReturn { status, result } => {
                if let Some(v) = result {
                    waiter.state.set_result(self.store(), Some(v));
                }
                Step::Return(status)
            }
            CommandResult::Yield { value, .. } => {
                waiter.state.set_result(self.store(), Some(value));
                Step::Done(true)
            }
            CommandResult::Suspend { .. } => {
                warn!(target: "tether::async", "suspend after an asynchronous brace cannot be resumed; continuing");
                Step::Done(true)
            }
            CommandResult::Break(_) | CommandResult::Continue(_) => {
                self.fail(
                    waiter.position,
                    ExecError::Argument("break or continue outside of a loop".into()),
                );
                Step::Done(false)
            }
        }
    }
}
