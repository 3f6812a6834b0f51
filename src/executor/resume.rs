//! Token protocol: request, resume, chain, cancel, wait, generators
//!
//! Lock discipline: the token table lock is never held while a continuation
//! runs, a cleanup fires or a waiter is signalled. Records are taken out
//! (or marked `running`) under the lock and processed after it is dropped.

use super::{CommandResult, ExecError, Executor, LoopFrame, Mode, SeqOutcome};
use crate::ast::{ObjectRef, ParsedCommand, Position, Value};
use crate::list::StoredList;
use crate::state::{ExecutionState, MacroFrame};
use crate::store::Stored;
use crate::token::{
    BraceOutcome, Cleanup, Continuation, GeneratorState, IteratorCursor, TokenError, TokenRecord,
};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Parameters of a new token
#[derive(Default)]
pub struct TokenRequest {
    cleanup: Option<Cleanup>,
    parent: Option<String>,
    timeout: Option<Duration>,
    state: Option<Arc<ExecutionState>>,
    position: Position,
    continuation: Option<Continuation>,
    invert: bool,
}

impl TokenRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once when the token retires, however it retires
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Cancelling the parent cancels this token too
    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_state(mut self, state: Arc<ExecutionState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = Some(continuation);
        self
    }

    /// Flip the completion status
    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }
}

/// Outcome of running a continuation
pub(crate) enum Step {
    Done(bool),
    /// Done, and an early return skips the sequences chained after it
    Return(bool),
    /// Waiting on another token
    Pending(String),
    /// Done; then resume `target`
    Forward { status: bool, target: String },
}

/// One step of a generator or iterator
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorStep {
    Yielded(Value),
    Suspended,
    /// Retired. The result carries a claim the caller takes over.
    Finished { status: bool, result: Option<Value> },
    /// Live token without generator state
    NotGenerator,
    NotFound,
}

impl Executor {
    pub fn request_token(&self, request: TokenRequest) -> String {
        let TokenRequest {
            cleanup,
            parent,
            timeout,
            state,
            position,
            continuation,
            invert,
        } = request;
        let timeout = timeout.unwrap_or(self.config().token_timeout);
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();

        let id = {
            let mut tokens = self.tokens();
            let id = tokens.next_id();
            if let Some(parent) = &parent {
                match tokens.get_mut(parent) {
                    Some(p) => p.children.push(id.clone()),
                    None => warn!(target: "tether::async", "parent token {} not found for {}", parent, id),
                }
            }
            let mut record = TokenRecord::new(id.clone());
            record.parent = parent;
            record.cleanup = cleanup;
            record.state = state;
            record.position = position;
            record.invert = invert;
            record.timer = Some(cancel_tx);
            record.continuation = continuation;
            debug!(target: "tether::async", "token {} requested ({:?})", id, record.continuation);
            tokens.insert(record);
            id
        };

        self.spawn_timer(&id, timeout, cancel_rx);
        id
    }

    /// The timer thread exits as soon as the record's sender is dropped
    fn spawn_timer(&self, id: &str, timeout: Duration, cancel: Receiver<()>) {
        let weak = self.weak();
        let token = id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("tether-timer-{}", id))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel.recv_timeout(timeout) {
                    if let Some(executor) = Executor::from_weak(&weak) {
                        warn!(target: "tether::async", "token {} timed out", token);
                        executor.cancel_token(&token);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(target: "tether::async", "no timer for token {}: {}", id, e);
        }
    }

    /// Resume a token with a status. Returns false for unknown, retired or
    /// already running tokens.
    pub fn resume_token(&self, id: &str, status: bool) -> bool {
        let (continuation, invert) = {
            let mut tokens = self.tokens();
            match tokens.get_mut(id) {
                Some(record) if record.running => {
                    warn!(target: "tether::async", "{}", TokenError::Busy(id.to_string()));
                    return false;
                }
                Some(record) => {
                    record.running = true;
                    (record.continuation.take(), record.invert)
                }
                None => {
                    warn!(target: "tether::async", "{}", TokenError::NotFound(id.to_string()));
                    return false;
                }
            }
        };
        let status = status != invert;
        debug!(target: "tether::async", "resuming {} with {}", id, status);

        match self.run_continuation(continuation, status) {
            Step::Done(s) => self.settle_token(id, s, false),
            Step::Return(s) => self.settle_token(id, s, true),
            Step::Forward { status, target } => {
                self.settle_token(id, status, false);
                self.resume_token(&target, status);
            }
            Step::Pending(next) => {
                if let Some(record) = self.tokens().get_mut(id) {
                    record.running = false;
                    record.invert = false;
                }
                // This token now settles with whatever `next` settles with
                self.chain_tokens(&next, id);
            }
        }
        true
    }

    /// Retire a token: timer, cleanup, children, waiters, then the chain
    pub(crate) fn settle_token(&self, id: &str, status: bool, returning: bool) {
        let record = {
            let mut tokens = self.tokens();
            let record = tokens.remove(id);
            if record.is_some() {
                tokens.settle(id, status);
            }
            record
        };
        let Some(mut record) = record else {
            return;
        };
        debug!(target: "tether::async", "token {} settled with {}", id, status);

        record.timer.take();
        if let Some(cleanup) = record.cleanup.take() {
            cleanup();
        }
        self.detach_from_parent(&record);
        for child in std::mem::take(&mut record.children) {
            self.cancel_token(&child);
        }
        for waiter in record.waiters.drain(..) {
            let _ = waiter.send(status);
        }
        if let Some(next) = record.chained.take() {
            if returning {
                self.return_through(&next, status);
            } else {
                self.resume_token(&next, status);
            }
        }
    }

    /// Propagate an early return: pending sequence remainders and plain
    /// pass-through tokens settle without running
    fn return_through(&self, id: &str, status: bool) {
        let skipped = {
            let mut tokens = self.tokens();
            match tokens.get_mut(id) {
                Some(record)
                    if !record.running
                        && matches!(record.continuation, None | Some(Continuation::Sequence { .. })) =>
                {
                    record.continuation = None;
                    Some(status != record.invert)
                }
                _ => None,
            }
        };
        match skipped {
            Some(status) => {
                debug!(target: "tether::flow", "early return skips the rest of {}", id);
                self.settle_token(id, status, true);
            }
            None => {
                self.resume_token(id, status);
            }
        }
    }

    fn detach_from_parent(&self, record: &TokenRecord) {
        if let Some(parent) = &record.parent {
            if let Some(p) = self.tokens().get_mut(parent) {
                p.children.retain(|c| c != &record.id);
            }
        }
    }

    /// Cancel a token and everything hanging off it. Waiters see false.
    pub fn cancel_token(&self, id: &str) -> bool {
        let record = {
            let mut tokens = self.tokens();
            let record = tokens.remove(id);
            if record.is_some() {
                tokens.settle(id, false);
            }
            record
        };
        let Some(mut record) = record else {
            return false;
        };
        debug!(target: "tether::async", "token {} cancelled", id);

        record.timer.take();
        if let Some(continuation) = record.continuation.take() {
            self.discard_continuation(continuation);
        }
        if let Some(cleanup) = record.cleanup.take() {
            cleanup();
        }
        self.detach_from_parent(&record);
        for child in std::mem::take(&mut record.children) {
            self.cancel_token(&child);
        }
        for waiter in record.waiters.drain(..) {
            let _ = waiter.send(false);
        }
        if let Some(next) = record.chained.take() {
            self.cancel_token(&next);
        }
        true
    }

    /// Drop claims a continuation holds; state claims belong to cleanups
    fn discard_continuation(&self, continuation: Continuation) {
        match continuation {
            Continuation::Braces(coordinator) => {
                for record in coordinator.records {
                    if let Some(BraceOutcome::Value(value)) = record.outcome {
                        self.store().release_value(&value);
                    }
                    record.state.release(self.store());
                }
            }
            Continuation::Generator(generator) => {
                if let Some(frame) = generator.pending_loop {
                    frame.release(self.store());
                }
            }
            _ => {}
        }
    }

    /// Resume `then` once `first` settles. A `first` that already settled
    /// resumes `then` immediately with the remembered status.
    pub fn chain_tokens(&self, first: &str, then: &str) -> bool {
        let settled = {
            let mut tokens = self.tokens();
            if let Some(record) = tokens.get_mut(first) {
                if let Some(previous) = record.chained.replace(then.to_string()) {
                    warn!(target: "tether::async", "token {} was chained to {}; now {}", first, previous, then);
                }
                return true;
            }
            tokens.settled(first)
        };
        match settled {
            Some(status) => {
                self.resume_token(then, status);
                true
            }
            None => {
                warn!(target: "tether::async", "cannot chain {} after unknown token {}", then, first);
                false
            }
        }
    }

    /// Block until a token settles
    pub fn wait_token(&self, id: &str, timeout: Duration) -> Result<bool, TokenError> {
        let receiver = {
            let mut tokens = self.tokens();
            match tokens.get_mut(id) {
                Some(record) => {
                    let (tx, rx) = mpsc::channel();
                    record.waiters.push(tx);
                    rx
                }
                None => {
                    return tokens
                        .settled(id)
                        .ok_or_else(|| TokenError::NotFound(id.to_string()))
                }
            }
        };
        receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TokenError::WaitTimeout(id.to_string()),
            RecvTimeoutError::Disconnected => TokenError::NotFound(id.to_string()),
        })
    }

    /// Live token ids in creation order
    pub fn active_tokens(&self) -> Vec<String> {
        self.tokens().ids()
    }

    pub fn token_valid(&self, id: &str) -> bool {
        self.tokens().contains(id)
    }

    fn run_continuation(&self, continuation: Option<Continuation>, status: bool) -> Step {
        let store = self.store();
        match continuation {
            None => Step::Done(status),
            Some(Continuation::Sequence {
                commands,
                state,
                frame,
            }) => {
                state.set_last_status(status);
                let outcome = self.execute_sequence(&commands, &state, frame.as_ref(), Mode::Async);
                let step = self.sequence_step(outcome, &state);
                if !matches!(step, Step::Pending(_)) && Arc::ptr_eq(state.env(), self.root_env()) {
                    self.root_env().merge_exports_into(self.root_env());
                }
                step
            }
            Some(Continuation::Braces(coordinator)) => self.finish_braces(coordinator, status),
            Some(Continuation::BraceLink { coordinator, index }) => {
                self.link_brace(&coordinator, index, status)
            }
            Some(Continuation::ScopeExit { child, parent }) => {
                if let Some(v) = child.take_result() {
                    parent.put_result(store, Some(v));
                }
                child.env().merge_exports_into(parent.env());
                parent.absorb_bubbles(child.take_bubbles());
                child.release(store);
                Step::Done(status)
            }
            Some(Continuation::Generator(_)) | Some(Continuation::Iterator(_)) => Step::Done(status),
        }
    }

    /// Map the outcome of a resumed sequence onto a step
    pub(crate) fn sequence_step(&self, outcome: SeqOutcome, state: &Arc<ExecutionState>) -> Step {
        let store = self.store();
        match outcome {
            SeqOutcome::Status(s) => Step::Done(s),
            SeqOutcome::EarlyReturn { status, result } => {
                if let Some(v) = result {
                    state.set_result(store, Some(v));
                }
                Step::Return(status)
            }
            SeqOutcome::Yield { value, .. } => {
                state.set_result(store, Some(value));
                Step::Done(true)
            }
            SeqOutcome::Suspend { .. } => {
                warn!(target: "tether::async", "suspend after an asynchronous step cannot be resumed; continuing");
                Step::Done(true)
            }
            SeqOutcome::Token(id) => Step::Pending(id),
            SeqOutcome::Break(_) | SeqOutcome::Continue(_) => {
                self.fail(
                    Position::default(),
                    ExecError::Argument("break or continue outside of a loop".into()),
                );
                Step::Done(false)
            }
        }
    }

    // === Generators and iterators ===

    /// Token whose continuation runs `commands` from `next`. With
    /// `owns_state` the state is released when the generator retires.
    pub(crate) fn create_generator(
        &self,
        commands: Arc<Vec<ParsedCommand>>,
        next: usize,
        state: Arc<ExecutionState>,
        frame: Option<Arc<MacroFrame>>,
        pending_loop: Option<Box<LoopFrame>>,
        owns_state: bool,
    ) -> (String, ObjectRef) {
        let mut request = TokenRequest::new()
            .with_timeout(self.config().generator_timeout)
            .with_state(Arc::clone(&state))
            .with_continuation(Continuation::Generator(GeneratorState {
                commands,
                next,
                state: Arc::clone(&state),
                frame,
                pending_loop,
            }));
        if owns_state {
            let weak = self.weak();
            request = request.with_cleanup(move || {
                if let Some(executor) = Executor::from_weak(&weak) {
                    state.release(executor.store());
                }
            });
        }
        let id = self.request_token(request);
        let token = self.store().store(Stored::Token(id.clone()));
        debug!(target: "tether::async", "generator {} created", id);
        (id, token)
    }

    /// Iterator over a list. Claims the list until the iterator retires.
    pub(crate) fn create_iterator(&self, list: ObjectRef, pairs: bool) -> Option<(String, ObjectRef)> {
        let store = self.store();
        let contents = store.get_list(list)?;
        store.claim(list);
        let cursor = if pairs {
            IteratorCursor::Pair {
                list,
                keys: contents.named().keys().cloned().collect(),
                index: 0,
            }
        } else {
            IteratorCursor::Each { list, index: 0 }
        };
        let weak = self.weak();
        let id = self.request_token(
            TokenRequest::new()
                .with_timeout(self.config().generator_timeout)
                .with_continuation(Continuation::Iterator(cursor))
                .with_cleanup(move || {
                    if let Some(executor) = Executor::from_weak(&weak) {
                        executor.store().release(list);
                    }
                }),
        );
        let token = store.store(Stored::Token(id.clone()));
        Some((id, token))
    }

    /// Run a generator or iterator to its next yield
    pub fn resume_generator(&self, id: &str) -> GeneratorStep {
        let continuation = {
            let mut tokens = self.tokens();
            match tokens.get_mut(id) {
                Some(record) if record.running => {
                    warn!(target: "tether::async", "{}", TokenError::Busy(id.to_string()));
                    return GeneratorStep::NotFound;
                }
                Some(record) if record.is_generator() => {
                    record.running = true;
                    record.continuation.take()
                }
                Some(_) => return GeneratorStep::NotGenerator,
                None => {
                    warn!(target: "tether::async", "{}", TokenError::NotFound(id.to_string()));
                    return GeneratorStep::NotFound;
                }
            }
        };
        match continuation {
            Some(Continuation::Generator(generator)) => self.step_generator(id, generator),
            Some(Continuation::Iterator(cursor)) => self.step_iterator(id, cursor),
            _ => {
                self.settle_token(id, false, false);
                GeneratorStep::NotFound
            }
        }
    }

    fn step_generator(&self, id: &str, mut generator: GeneratorState) -> GeneratorStep {
        let state = Arc::clone(&generator.state);
        let frame = generator.frame.clone();

        if let Some(pending) = generator.pending_loop.take() {
            let result = self.run_loop(*pending, &state, frame.as_ref());
            match SeqOutcome::from_command(result, 0) {
                SeqOutcome::Status(s) => {
                    state.set_last_status(s);
                    generator.next += 1;
                }
                outcome => return self.generator_outcome(id, generator, outcome),
            }
        }

        let commands = Arc::clone(&generator.commands);
        generator.next = generator.next.min(commands.len());
        let outcome = self.execute_sequence(&commands[generator.next..], &state, frame.as_ref(), Mode::Await);
        self.generator_outcome(id, generator, outcome)
    }

    fn generator_outcome(&self, id: &str, mut generator: GeneratorState, outcome: SeqOutcome) -> GeneratorStep {
        let store = self.store();
        match outcome {
            SeqOutcome::Yield {
                value,
                frame,
                resume_at,
            } => {
                generator.next += resume_at;
                generator.pending_loop = frame;
                self.park(id, Continuation::Generator(generator));
                GeneratorStep::Yielded(value)
            }
            SeqOutcome::Suspend { frame, resume_at } => {
                generator.next += resume_at;
                generator.pending_loop = frame;
                self.park(id, Continuation::Generator(generator));
                GeneratorStep::Suspended
            }
            SeqOutcome::Status(status) => {
                let result = generator.state.take_result();
                self.settle_token(id, status, false);
                GeneratorStep::Finished { status, result }
            }
            SeqOutcome::EarlyReturn { status, result } => {
                let result = match result {
                    Some(v) => {
                        store.claim_value(&v);
                        Some(v)
                    }
                    None => generator.state.take_result(),
                };
                self.settle_token(id, status, false);
                GeneratorStep::Finished { status, result }
            }
            SeqOutcome::Token(_) | SeqOutcome::Break(_) | SeqOutcome::Continue(_) => {
                self.fail(
                    Position::default(),
                    ExecError::Argument(format!("generator {} ended with a stray loop control", id)),
                );
                self.settle_token(id, false, false);
                GeneratorStep::Finished {
                    status: false,
                    result: None,
                }
            }
        }
    }

    fn step_iterator(&self, id: &str, cursor: IteratorCursor) -> GeneratorStep {
        let store = self.store();
        let exhausted = |executor: &Executor| {
            executor.settle_token(id, false, false);
            GeneratorStep::Finished {
                status: false,
                result: None,
            }
        };
        let Some(contents) = store.get_list(cursor.list()) else {
            return exhausted(self);
        };

        match cursor {
            IteratorCursor::Each { list, index } => match contents.get(index).cloned() {
                Some(item) => {
                    self.park(
                        id,
                        Continuation::Iterator(IteratorCursor::Each {
                            list,
                            index: index + 1,
                        }),
                    );
                    GeneratorStep::Yielded(item)
                }
                None => exhausted(self),
            },
            IteratorCursor::Pair { list, keys, index } => {
                let pair = if index < contents.len() {
                    contents
                        .get(index)
                        .map(|v| vec![Value::Int(index as i64), v.clone()])
                } else {
                    keys.get(index - contents.len()).and_then(|key| {
                        contents
                            .named()
                            .get(key)
                            .map(|v| vec![Value::quoted(key.clone()), v.clone()])
                    })
                };
                match pair {
                    Some(items) => {
                        let pair = store.store_list(StoredList::new(items));
                        self.park(
                            id,
                            Continuation::Iterator(IteratorCursor::Pair {
                                list,
                                keys,
                                index: index + 1,
                            }),
                        );
                        GeneratorStep::Yielded(Value::Ref(pair))
                    }
                    None => exhausted(self),
                }
            }
        }
    }

    /// Put a continuation back for the next resume
    fn park(&self, id: &str, continuation: Continuation) {
        let orphan = {
            let mut tokens = self.tokens();
            if let Some(record) = tokens.get_mut(id) {
                record.continuation = Some(continuation);
                record.running = false;
                None
            } else {
                Some(continuation)
            }
        };
        if let Some(continuation) = orphan {
            debug!(target: "tether::async", "token {} retired while running", id);
            self.discard_continuation(continuation);
        }
    }

    /// Wait for a command result that may be a token
    pub(crate) fn await_result(&self, result: CommandResult, position: Position) -> CommandResult {
        match result {
            CommandResult::Token(id) => {
                let waited = self.wait_token(&id, self.config().wait_timeout);
                match waited {
                    Ok(status) => CommandResult::Status(status),
                    Err(e) => self.fail(position, e),
                }
            }
            other => other,
        }
    }
}
