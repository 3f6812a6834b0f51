//! Command sequences, single commands and macro calls

use super::{CommandResult, Completion, ExecError, Executor, LoopFrame, TokenRequest};
use crate::ast::{ObjectRef, ParsedCommand, Position, Separator, Value};
use crate::lexer::{self, named_prefix};
use crate::list::StoredList;
use crate::module_env::{Macro, ModuleEnvironment};
use crate::parser::{parse_arguments, parse_command, CommandParts};
use crate::state::{ExecutionState, MacroFrame};
use crate::store::Stored;
use crate::substitution::{
    interpolate_tildes, protect_escapes, restore_dollars, restore_tildes, substitute_macro_args,
};
use crate::token::Continuation;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do when a command returns a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Hand the rest of the sequence to a continuation and return a token
    Async,
    /// Block until the token settles (loop bodies, generator steps)
    Await,
}

/// How a sequence stopped. `resume_at` is relative to the slice that ran.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SeqOutcome {
    Status(bool),
    EarlyReturn {
        status: bool,
        result: Option<Value>,
    },
    Yield {
        value: Value,
        frame: Option<Box<LoopFrame>>,
        resume_at: usize,
    },
    Suspend {
        frame: Option<Box<LoopFrame>>,
        resume_at: usize,
    },
    Token(String),
    Break(u32),
    Continue(u32),
}

impl SeqOutcome {
    /// Lift a single command's result; a loop frame means the command
    /// itself resumes, otherwise execution resumes after it
    pub(crate) fn from_command(result: CommandResult, index: usize) -> SeqOutcome {
        match result {
            CommandResult::Status(s) => SeqOutcome::Status(s),
            CommandResult::EarlyReturn { status, result } => SeqOutcome::EarlyReturn { status, result },
            CommandResult::Yield { value, frame } => {
                let resume_at = if frame.is_some() { index } else { index + 1 };
                SeqOutcome::Yield {
                    value,
                    frame,
                    resume_at,
                }
            }
            CommandResult::Suspend { frame } => {
                let resume_at = if frame.is_some() { index } else { index + 1 };
                SeqOutcome::Suspend { frame, resume_at }
            }
            CommandResult::Token(id) => SeqOutcome::Token(id),
            CommandResult::Break(n) => SeqOutcome::Break(n),
            CommandResult::Continue(n) => SeqOutcome::Continue(n),
        }
    }
}

/// Result of substituting braces in one command
pub(crate) enum BraceSubst {
    Text(String, Vec<ObjectRef>),
    Failed,
    /// Coordinator token; the command finishes when it resumes
    Async(String),
}

impl Executor {
    pub(crate) fn execute_sequence(
        &self,
        commands: &[ParsedCommand],
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        mode: Mode,
    ) -> SeqOutcome {
        let mut status = state.last_status();

        for (i, cmd) in commands.iter().enumerate() {
            let run = match cmd.separator {
                Separator::None => true,
                Separator::AndThen => status,
                Separator::OrElse => !status,
            };
            if !run {
                debug!(target: "tether::flow", "skipping '{}' (status {})", cmd.command, status);
                continue;
            }

            let result = match self.execute_command(cmd, state, frame) {
                CommandResult::Token(id) if mode == Mode::Async => {
                    if i + 1 == commands.len() {
                        return SeqOutcome::Token(id);
                    }
                    let rest = commands[i + 1..].to_vec();
                    debug!(target: "tether::async", "sequence suspended on {} with {} command(s) left", id, rest.len());
                    let next = self.request_token(
                        TokenRequest::new()
                            .at(cmd.position)
                            .with_state(Arc::clone(state))
                            .with_continuation(Continuation::Sequence {
                                commands: rest,
                                state: Arc::clone(state),
                                frame: frame.cloned(),
                            }),
                    );
                    self.chain_tokens(&id, &next);
                    return SeqOutcome::Token(next);
                }
                // Loop bodies and generator steps block here
                result => self.await_result(result, cmd.position),
            };
            match result {
                CommandResult::Status(s) => status = s,
                other => return SeqOutcome::from_command(other, i),
            }
            state.set_last_status(status);
        }
        SeqOutcome::Status(status)
    }

    /// Boundary of a top-level execution
    pub(crate) fn finish_top_level(
        &self,
        outcome: SeqOutcome,
        commands: &Arc<Vec<ParsedCommand>>,
        state: &Arc<ExecutionState>,
    ) -> Completion {
        let status = match outcome {
            SeqOutcome::Status(s) => s,
            SeqOutcome::EarlyReturn { status, result } => {
                if let Some(v) = result {
                    state.set_result(self.store(), Some(v));
                }
                status
            }
            SeqOutcome::Yield { value, .. } => {
                state.set_result(self.store(), Some(value));
                true
            }
            SeqOutcome::Suspend { frame, resume_at } => {
                let (_, token) =
                    self.create_generator(Arc::clone(commands), resume_at, Arc::clone(state), None, frame, false);
                state.set_variable(self.store(), "#token", Value::Ref(token));
                state.set_result(self.store(), Some(Value::Ref(token)));
                true
            }
            SeqOutcome::Token(id) => return Completion::Pending(id),
            SeqOutcome::Break(_) | SeqOutcome::Continue(_) => {
                self.fail(
                    Position::default(),
                    ExecError::Argument("break or continue outside of a loop".into()),
                );
                false
            }
        };
        state.env().merge_exports_into(self.root_env());
        state.set_last_status(status);
        Completion::Done(status)
    }

    /// Run one parsed command: inversion, braces, then the rest of
    /// substitution and dispatch
    pub(crate) fn execute_command(
        &self,
        cmd: &ParsedCommand,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
    ) -> CommandResult {
        let mut text = cmd.command.trim();
        let invert = text.starts_with('!');
        if invert {
            text = text[1..].trim_start();
        }
        let protected = protect_escapes(text);

        match self.substitute_braces(&protected, state, frame, cmd.position, invert) {
            BraceSubst::Text(text, claims) => {
                self.complete_command(&text, state, frame, cmd.position, invert, claims)
            }
            BraceSubst::Failed => {
                warn!(target: "tether::command", "{}: Command in brace expression failed", cmd.position);
                CommandResult::Status(false)
            }
            BraceSubst::Async(token) => CommandResult::Token(token),
        }
    }

    /// Everything after braces: macro arguments, tildes, dispatch and
    /// inversion. `claims` are brace values kept alive for the command.
    pub(crate) fn complete_command(
        &self,
        text: &str,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
        invert: bool,
        mut claims: Vec<ObjectRef>,
    ) -> CommandResult {
        let store = self.store();
        let mut text = text.to_string();
        if let Some(frame) = frame {
            text = substitute_macro_args(&text, frame, store, || {
                if frame.args.is_empty() && frame.named.is_empty() {
                    return "()".to_string();
                }
                let list = store.store_list(StoredList::with_named(frame.args.clone(), frame.named.clone()));
                store.claim(list);
                claims.push(list);
                list.to_marker()
            });
        }
        let text = restore_dollars(&text);
        let text = interpolate_tildes(&text, |name| {
            state.get_variable(name).map(|v| store.display(&v))
        });
        let text = restore_tildes(&text);

        let result = self.dispatch(&text, state, frame, position);

        if matches!(result, CommandResult::Token(_)) {
            // The handler may still read its arguments
            for r in claims {
                state.hold(r);
            }
        } else {
            for r in claims {
                store.release(r);
            }
        }
        self.invert_result(result, invert, position)
    }

    fn invert_result(&self, result: CommandResult, invert: bool, position: Position) -> CommandResult {
        if !invert {
            return result;
        }
        match result {
            CommandResult::Status(s) => CommandResult::Status(!s),
            CommandResult::EarlyReturn { status, result } => CommandResult::EarlyReturn {
                status: !status,
                result,
            },
            CommandResult::Token(id) => {
                let inverter = self.request_token(TokenRequest::new().at(position).inverted());
                self.chain_tokens(&id, &inverter);
                CommandResult::Token(inverter)
            }
            other => other,
        }
    }

    /// Resolve and run a fully substituted command
    pub(crate) fn dispatch(
        &self,
        text: &str,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
    ) -> CommandResult {
        let text = text.trim();
        if text.is_empty() {
            return CommandResult::Status(state.last_status());
        }

        let (name, rest) = lexer::split_command(text);
        if Self::is_module_command(name) {
            return self.module_command(name, rest, state, position);
        }

        if let Some((var, value_text)) = named_prefix(text) {
            return self.assign(var, value_text, state, position);
        }

        let parts = match parse_command(text) {
            Ok(parts) => parts,
            Err(e) => return self.fail(position, e),
        };

        if let Some(var) = parts.name.strip_prefix('~') {
            let Some(value) = state.get_variable(var) else {
                return self.fail(position, ExecError::Argument(format!("undefined variable: ~{}", var)));
            };
            if parts.args.is_empty() && parts.named.is_empty() {
                state.set_result(self.store(), Some(value));
                return CommandResult::Status(true);
            }
            return self.call_value(&value, parts, state, frame, position);
        }

        if parts.name.starts_with('(') && parts.name.ends_with(')') && parts.name.len() >= 2 {
            let body = parts.name[1..parts.name.len() - 1].to_string();
            return match self.resolve_parts(parts, state, position) {
                Ok(parts) => self.call_block(&body, parts, state, position),
                Err(result) => result,
            };
        }

        if let Some(r) = ObjectRef::parse_marker(&parts.name) {
            return self.call_value(&Value::Ref(r), parts, state, frame, position);
        }

        let parts = match self.resolve_parts(parts, state, position) {
            Ok(parts) => parts,
            Err(result) => return result,
        };

        let env = state.env();
        if let Some(mac) = env.get_macro(&parts.name) {
            return self.call_macro(&mac, parts, state, position);
        }
        if let Some(handler) = env.get_command(&parts.name) {
            return self.call_handler(&handler, parts, state, frame, position);
        }
        if let Some(handler) = self.fallback() {
            return self.call_handler(&handler, parts, state, frame, position);
        }
        self.fail(position, ExecError::UnknownCommand(parts.name))
    }

    /// `name: value` binds a variable; `name: undefined` removes it
    fn assign(&self, var: &str, value_text: &str, state: &Arc<ExecutionState>, position: Position) -> CommandResult {
        let store = self.store();
        let (args, named) = match parse_arguments(value_text) {
            Ok(parsed) => parsed,
            Err(e) => return self.fail(position, e),
        };
        let mut args = match self.resolve_values(args, state, position) {
            Ok(args) => args,
            Err(result) => return result,
        };
        let named = match self.resolve_named(named, state, position) {
            Ok(named) => named,
            Err(result) => return result,
        };

        let value = if args.len() == 1 && named.is_empty() {
            args.remove(0)
        } else if args.is_empty() && named.is_empty() {
            Value::Nil
        } else {
            Value::Ref(store.store_list(StoredList::with_named(args, named)))
        };

        if value == Value::symbol("undefined") {
            state.remove_variable(store, var);
        } else {
            state.set_variable(store, var, value);
        }
        CommandResult::Status(true)
    }

    fn resolve_parts(
        &self,
        mut parts: CommandParts,
        state: &Arc<ExecutionState>,
        position: Position,
    ) -> Result<CommandParts, CommandResult> {
        parts.args = self.resolve_values(std::mem::take(&mut parts.args), state, position)?;
        parts.named = self.resolve_named(std::mem::take(&mut parts.named), state, position)?;
        Ok(parts)
    }

    fn resolve_named(
        &self,
        named: std::collections::BTreeMap<String, Value>,
        state: &Arc<ExecutionState>,
        position: Position,
    ) -> Result<std::collections::BTreeMap<String, Value>, CommandResult> {
        named
            .into_iter()
            .map(|(k, v)| Ok((k, self.resolve_value(v, state, position)?)))
            .collect()
    }

    fn resolve_values(
        &self,
        values: Vec<Value>,
        state: &Arc<ExecutionState>,
        position: Position,
    ) -> Result<Vec<Value>, CommandResult> {
        values
            .into_iter()
            .map(|v| self.resolve_value(v, state, position))
            .collect()
    }

    /// `~name` reads a variable; `#name` reads a module object, then a
    /// `#name` variable
    fn resolve_value(&self, value: Value, state: &Arc<ExecutionState>, position: Position) -> Result<Value, CommandResult> {
        let Value::Symbol(word) = &value else {
            return Ok(value);
        };
        if let Some(var) = word.strip_prefix('~') {
            if lexer::is_identifier(var) || var.starts_with('#') {
                return state.get_variable(var).ok_or_else(|| {
                    self.fail(position, ExecError::Argument(format!("undefined variable: ~{}", var)))
                });
            }
        }
        if word.len() > 1 && word.starts_with('#') {
            if let Some(v) = state.env().get_object(word).or_else(|| state.get_variable(word)) {
                return Ok(v);
            }
        }
        Ok(value)
    }

    fn call_handler(
        &self,
        handler: &super::Handler,
        parts: CommandParts,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
    ) -> CommandResult {
        debug!(target: "tether::command", "{} ({} arg(s))", parts.name, parts.args.len());
        let mut ctx = super::Context {
            name: parts.name,
            args: parts.args,
            named: parts.named,
            raw_args: parts.raw_args,
            position,
            state,
            frame: frame.cloned(),
            executor: self,
        };
        handler(&mut ctx)
    }

    /// Invoke a callable value: a macro, command or block reference
    pub(crate) fn call_value(
        &self,
        value: &Value,
        parts: CommandParts,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
    ) -> CommandResult {
        let parts = match self.resolve_parts(parts, state, position) {
            Ok(parts) => parts,
            Err(result) => return result,
        };
        match value {
            Value::Block(body) => self.call_block(body, parts, state, position),
            Value::Ref(r) => match self.store().get(*r) {
                Some(Stored::Macro(mac)) => self.call_macro(&mac, parts, state, position),
                Some(Stored::Command(handler)) => self.call_handler(&handler, parts, state, frame, position),
                Some(Stored::Block(body)) => self.call_block(&body, parts, state, position),
                Some(other) => self.fail(
                    position,
                    ExecError::Argument(format!("{} is not callable", other.kind().name())),
                ),
                None => self.fail(position, ExecError::Argument(format!("stale reference {}", r))),
            },
            other => self.fail(
                position,
                ExecError::Argument(format!("'{}' is not callable", self.store().display(other))),
            ),
        }
    }

    /// Call a target given as a value: a macro or command name, a callable
    /// reference or a block
    pub(crate) fn invoke(
        &self,
        target: &Value,
        args: Vec<Value>,
        named: std::collections::BTreeMap<String, Value>,
        state: &Arc<ExecutionState>,
        frame: Option<&Arc<MacroFrame>>,
        position: Position,
    ) -> CommandResult {
        let parts = CommandParts {
            name: self.store().display(target),
            args,
            named,
            raw_args: Vec::new(),
        };
        match target {
            Value::Symbol(name) | Value::Quoted(name) => {
                let env = state.env();
                if let Some(mac) = env.get_macro(name) {
                    self.call_macro(&mac, parts, state, position)
                } else if let Some(handler) = env.get_command(name) {
                    self.call_handler(&handler, parts, state, frame, position)
                } else {
                    self.fail(position, ExecError::UnknownCommand(name.clone()))
                }
            }
            other => self.call_value(other, parts, state, frame, position),
        }
    }

    /// `(block) a, b`: run in the current scope with a fresh argument frame
    pub(crate) fn call_block(
        &self,
        body: &str,
        parts: CommandParts,
        state: &Arc<ExecutionState>,
        position: Position,
    ) -> CommandResult {
        let commands = match self.parse_cached(body) {
            Ok(commands) => commands,
            Err(e) => return self.fail(position, e),
        };
        let frame = Arc::new(MacroFrame::new(parts.args, parts.named));
        match self.execute_sequence(&commands, state, Some(&frame), Mode::Async) {
            SeqOutcome::Status(s) => CommandResult::Status(s),
            SeqOutcome::EarlyReturn { status, result } => CommandResult::EarlyReturn { status, result },
            // The block's own position is not kept; execution resumes after it
            SeqOutcome::Yield { value, .. } => CommandResult::Yield { value, frame: None },
            SeqOutcome::Suspend { .. } => CommandResult::Suspend { frame: None },
            SeqOutcome::Token(id) => CommandResult::Token(id),
            SeqOutcome::Break(n) => CommandResult::Break(n),
            SeqOutcome::Continue(n) => CommandResult::Continue(n),
        }
    }

    /// Run a macro in a child scope of its defining environment
    pub(crate) fn call_macro(
        &self,
        mac: &Arc<Macro>,
        parts: CommandParts,
        state: &Arc<ExecutionState>,
        position: Position,
    ) -> CommandResult {
        let store = self.store();
        debug!(target: "tether::macro", "calling {} with {} arg(s)", mac.name.as_deref().unwrap_or("<anonymous>"), parts.args.len());

        let commands = match self.parse_cached(&mac.body) {
            Ok(commands) => commands,
            Err(e) => return self.fail(position, e),
        };
        let defining: &ModuleEnvironment = match &mac.env {
            Some(env) => env,
            None => state.env(),
        };
        let env = ModuleEnvironment::new_macro_scope(defining);
        let child = Arc::new(state.macro_child(env));
        for value in parts.args.iter().chain(parts.named.values()) {
            if let Value::Ref(r) = value {
                if store.claim(*r) {
                    child.hold(*r);
                }
            }
        }
        let frame = Arc::new(MacroFrame::new(parts.args, parts.named));
        let outcome = self.execute_sequence(&commands, &child, Some(&frame), Mode::Async);
        self.close_macro(outcome, commands, child, frame, state, position)
    }

    fn close_macro(
        &self,
        outcome: SeqOutcome,
        commands: Arc<Vec<ParsedCommand>>,
        child: Arc<ExecutionState>,
        frame: Arc<MacroFrame>,
        parent: &Arc<ExecutionState>,
        position: Position,
    ) -> CommandResult {
        let store = self.store();
        let status = match outcome {
            SeqOutcome::Status(s) => {
                if let Some(v) = child.take_result() {
                    parent.put_result(store, Some(v));
                }
                s
            }
            SeqOutcome::EarlyReturn { status, result } => {
                match result {
                    Some(v) => parent.set_result(store, Some(v)),
                    None => {
                        if let Some(v) = child.take_result() {
                            parent.put_result(store, Some(v));
                        }
                    }
                }
                status
            }
            SeqOutcome::Yield { value, .. } => {
                parent.set_result(store, Some(value));
                true
            }
            SeqOutcome::Suspend { frame: loop_frame, resume_at } => {
                let (_, token) = self.create_generator(
                    commands,
                    resume_at,
                    Arc::clone(&child),
                    Some(frame),
                    loop_frame,
                    true,
                );
                child.set_variable(store, "#token", Value::Ref(token));
                parent.set_result(store, Some(Value::Ref(token)));
                child.env().merge_exports_into(parent.env());
                // The generator owns the child scope from here on
                return CommandResult::Status(true);
            }
            SeqOutcome::Token(id) => {
                let weak = self.weak();
                let held = Arc::clone(&child);
                let exit = self.request_token(
                    TokenRequest::new()
                        .at(position)
                        .with_state(Arc::clone(parent))
                        .with_continuation(Continuation::ScopeExit {
                            child,
                            parent: Arc::clone(parent),
                        })
                        .with_cleanup(move || {
                            if let Some(executor) = Executor::from_weak(&weak) {
                                held.release(executor.store());
                            }
                        }),
                );
                self.chain_tokens(&id, &exit);
                return CommandResult::Token(exit);
            }
            SeqOutcome::Break(_) | SeqOutcome::Continue(_) => {
                self.fail(
                    position,
                    ExecError::Argument("break or continue outside of a loop".into()),
                );
                false
            }
        };
        child.env().merge_exports_into(parent.env());
        parent.absorb_bubbles(child.take_bubbles());
        child.release(store);
        CommandResult::Status(status)
    }
}
