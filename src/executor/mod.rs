//! Executor for tether - parse, substitute, dispatch, suspend, resume
//!
//! The executor drives every command through the same pipeline:
//! - parse the source into `ParsedCommand`s (cached by text)
//! - substitute brace expressions and macro arguments
//! - resolve the name against the scope's module environment
//! - run the handler and interpret the `CommandResult` it returns
//!
//! # Suspension
//!
//! A handler that cannot finish synchronously returns `CommandResult::Token`.
//! The executor records what remains to be done as a continuation on a new
//! token and chains it behind the handler's token, so the remaining commands
//! run once the first step resolves. Tokens are owned by the executor's
//! token table; see `resume.rs`.
//!
//! # File layout
//!
//! Each concern adds an `impl Executor` block in its own file:
//! - `sequence.rs`: command sequences, single commands, macro calls
//! - `braces.rs`: brace sub-expressions and their coordinator
//! - `resume.rs`: token requests, resume, chain, cancel, wait, generators
//! - `loops.rs`: resumable loop frames
//! - `modules.rs`: `MODULE`, `LIBRARY`, `IMPORT`, `REMOVE`, `EXPORT`

mod braces;
mod loops;
mod modules;
mod resume;
mod sequence;
mod tests;

pub use loops::{ForSource, LoopFrame, LoopKind};
pub use resume::{GeneratorStep, TokenRequest};
pub(crate) use sequence::{Mode, SeqOutcome};

use crate::ast::{ObjectRef, ParsedCommand, Position, Value};
use crate::config::Config;
use crate::lexer::LexError;
use crate::list::StoredList;
use crate::module_env::{ModuleEnvironment, ModuleError, ModuleItem};
use crate::parser::{parse_arguments, parse_sequence, ParseError};
use crate::state::{ExecutionState, MacroFrame};
use crate::store::{ObjectStore, Stored};
use crate::token::{TokenError, TokenTable};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use thiserror::Error;
use tracing::{error, warn};

/// A registered command
pub type Handler = Arc<dyn Fn(&mut Context<'_>) -> CommandResult + Send + Sync>;

/// What a handler hands back to the executor
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Status(bool),
    /// Ends the enclosing sequence up to the nearest macro or top level
    EarlyReturn { status: bool, result: Option<Value> },
    /// Caught by the nearest generator; `frame` lets a loop resume mid-body
    Yield {
        value: Value,
        frame: Option<Box<LoopFrame>>,
    },
    /// Turn the rest of the sequence into a generator token
    Suspend { frame: Option<Box<LoopFrame>> },
    /// Completes later, when the token is resumed
    Token(String),
    Break(u32),
    Continue(u32),
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("syntax error: {0}")]
    Lex(#[from] LexError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0}")]
    Argument(String),
    #[error("loop exceeded {0} iterations")]
    IterationLimit(usize),
}

/// How a top-level execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Done(bool),
    /// Still running; the token settles with the final status
    Pending(String),
}

/// Final status and result of a synchronous run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: bool,
    pub result: Option<Value>,
    /// Result rendered while its objects were still alive
    pub display: Option<String>,
}

enum Output {
    Stdout,
    Captured(Arc<Mutex<String>>),
}

/// Parsed sequences keyed by source text, oldest evicted first
struct ParseCache {
    capacity: usize,
    entries: HashMap<String, Arc<Vec<ParsedCommand>>>,
    order: VecDeque<String>,
}

impl ParseCache {
    fn new(capacity: usize) -> Self {
        ParseCache {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, text: &str) -> Option<Arc<Vec<ParsedCommand>>> {
        self.entries.get(text).cloned()
    }

    fn insert(&mut self, text: &str, commands: Arc<Vec<ParsedCommand>>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(text.to_string(), commands).is_none() {
            self.order.push_back(text.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

/// Write and flush; a failure is logged, not propagated to the script
fn emit(out: &mut impl Write, text: &str) -> bool {
    match out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        Ok(()) => true,
        Err(e) => {
            warn!(target: "tether::system", "writing output failed: {}", e);
            false
        }
    }
}

pub(crate) fn locked<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct Shared {
    store: ObjectStore,
    tokens: Mutex<TokenTable>,
    root_env: Arc<ModuleEnvironment>,
    fallback: RwLock<Option<Handler>>,
    config: Config,
    output: Mutex<Output>,
    parse_cache: Mutex<ParseCache>,
}

/// One runtime instance. Cloning is cheap and yields a handle to the same
/// store, token table and root environment.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Executor {
    pub fn new(config: Config) -> Self {
        Executor {
            shared: Arc::new(Shared {
                store: ObjectStore::new(),
                tokens: Mutex::new(TokenTable::new(config.settled_memo)),
                root_env: Arc::new(ModuleEnvironment::new()),
                fallback: RwLock::new(None),
                parse_cache: Mutex::new(ParseCache::new(config.parse_cache)),
                output: Mutex::new(Output::Stdout),
                config,
            }),
        }
    }

    /// Executor with the command library registered, configured from the
    /// environment
    pub fn with_stdlib() -> Self {
        let executor = Self::new(Config::from_env());
        executor.register_stdlib();
        executor
    }

    pub fn register_stdlib(&self) {
        crate::stdlib::register(self);
    }

    pub(crate) fn weak(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_weak(weak: &Weak<Shared>) -> Option<Executor> {
        weak.upgrade().map(|shared| Executor { shared })
    }

    // === Registration ===

    /// Register a global command visible in every scope
    pub fn register_command(&self, name: &str, handler: Handler) {
        self.shared.root_env.install_command(name, handler);
    }

    /// Register an item that only becomes callable after `IMPORT`
    pub fn register_module_item(&self, module: &str, item: &str, value: ModuleItem) {
        self.shared.root_env.install_module_item(module, item, value);
    }

    pub fn register_module_command(&self, module: &str, item: &str, handler: Handler) {
        self.register_module_item(module, item, ModuleItem::Command(handler));
    }

    /// Handler consulted for names nothing else resolves
    pub fn set_fallback(&self, handler: Handler) {
        *self
            .shared
            .fallback
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub(crate) fn fallback(&self) -> Option<Handler> {
        self.shared
            .fallback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // === Accessors ===

    pub fn store(&self) -> &ObjectStore {
        &self.shared.store
    }

    pub fn root_env(&self) -> &Arc<ModuleEnvironment> {
        &self.shared.root_env
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub(crate) fn tokens(&self) -> MutexGuard<'_, TokenTable> {
        locked(&self.shared.tokens)
    }

    /// Send command output to a buffer instead of stdout
    pub fn capture_output(&self) -> Arc<Mutex<String>> {
        let buffer = Arc::new(Mutex::new(String::new()));
        *locked(&self.shared.output) = Output::Captured(Arc::clone(&buffer));
        buffer
    }

    pub fn write_output(&self, text: &str) {
        match &*locked(&self.shared.output) {
            Output::Stdout => {
                emit(&mut std::io::stdout().lock(), text);
            }
            Output::Captured(buffer) => locked(buffer).push_str(text),
        }
    }

    /// Top-level state over the root environment
    pub fn new_state(&self) -> Arc<ExecutionState> {
        Arc::new(ExecutionState::new(Arc::clone(&self.shared.root_env)))
    }

    pub fn parse_cached(&self, text: &str) -> Result<Arc<Vec<ParsedCommand>>, ParseError> {
        if let Some(hit) = locked(&self.shared.parse_cache).get(text) {
            return Ok(hit);
        }
        let commands = Arc::new(parse_sequence(text)?);
        locked(&self.shared.parse_cache).insert(text, Arc::clone(&commands));
        Ok(commands)
    }

    /// Log an error with its position and turn it into a false status
    pub(crate) fn fail(&self, position: Position, err: impl Into<ExecError>) -> CommandResult {
        let err = err.into();
        match &err {
            ExecError::Parse(parse) => error!(target: "tether::parse", "{}", parse.render()),
            ExecError::Lex(_) => error!(target: "tether::parse", "{}: {}", position, err),
            ExecError::Module(_) => error!(target: "tether::system", "{}: {}", position, err),
            ExecError::Token(_) => error!(target: "tether::async", "{}: {}", position, err),
            ExecError::IterationLimit(_) => error!(target: "tether::flow", "{}: {}", position, err),
            _ => error!(target: "tether::command", "{}: {}", position, err),
        }
        CommandResult::Status(false)
    }

    // === Entry points ===

    /// Run text in a fresh top-level state
    pub fn execute(&self, text: &str) -> Completion {
        let state = self.new_state();
        let completion = self.execute_in(text, &state);
        match &completion {
            Completion::Done(_) => self.release_if_unshared(state),
            Completion::Pending(id) => {
                let weak = self.weak();
                let release = self.request_token(TokenRequest::new().with_cleanup(move || {
                    if let Some(executor) = Executor::from_weak(&weak) {
                        executor.release_if_unshared(state);
                    }
                }));
                self.chain_tokens(id, &release);
            }
        }
        completion
    }

    /// Run text in the given state; variables and imports persist in it
    pub fn execute_in(&self, text: &str, state: &Arc<ExecutionState>) -> Completion {
        let commands = match self.parse_cached(text) {
            Ok(commands) => commands,
            Err(e) => {
                self.fail(e.position(), e);
                state.set_last_status(false);
                return Completion::Done(false);
            }
        };
        let outcome = self.execute_sequence(&commands, state, None, Mode::Async);
        self.finish_top_level(outcome, &commands, state)
    }

    /// Run text in `state` and block until it settles
    pub fn run_in(&self, text: &str, state: &Arc<ExecutionState>) -> RunOutcome {
        let status = match self.execute_in(text, state) {
            Completion::Done(status) => status,
            Completion::Pending(id) => match self.wait_token(&id, self.config().wait_timeout) {
                Ok(status) => status,
                Err(e) => {
                    error!(target: "tether::async", "{}", e);
                    false
                }
            },
        };
        let result = state.result();
        let display = result.as_ref().map(|v| self.store().display(v));
        RunOutcome {
            status,
            result,
            display,
        }
    }

    /// Run a whole script in a fresh state, waiting for async completion.
    /// Parse errors are returned rather than logged.
    pub fn run_script(&self, text: &str) -> Result<RunOutcome, ExecError> {
        self.parse_cached(text)?;
        let state = self.new_state();
        let outcome = self.run_in(text, &state);
        self.release_if_unshared(state);
        Ok(outcome)
    }

    /// Release a top-level state unless a continuation still holds it
    fn release_if_unshared(&self, state: Arc<ExecutionState>) {
        if Arc::strong_count(&state) == 1 {
            state.release(self.store());
        }
    }
}

/// Everything a handler can see and do
pub struct Context<'a> {
    pub name: String,
    pub args: Vec<Value>,
    pub named: BTreeMap<String, Value>,
    /// Argument text before resolution, for diagnostics
    pub raw_args: Vec<String>,
    pub position: Position,
    pub state: &'a Arc<ExecutionState>,
    pub frame: Option<Arc<MacroFrame>>,
    pub executor: &'a Executor,
}

impl<'a> Context<'a> {
    pub fn store(&self) -> &ObjectStore {
        self.executor.store()
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn int_arg(&self, index: usize) -> Option<i64> {
        self.args.get(index).and_then(Value::as_int)
    }

    pub fn named_arg(&self, key: &str) -> Option<&Value> {
        self.named.get(key)
    }

    /// Set the pending result, claiming a reference
    pub fn set_result(&self, value: Option<Value>) {
        self.state.set_result(self.store(), value);
    }

    pub fn result(&self) -> Option<Value> {
        self.state.result()
    }

    pub fn display(&self, value: &Value) -> String {
        self.store().display(value)
    }

    /// Report an argument error at this command and return false
    pub fn error(&self, message: impl AsRef<str>) -> CommandResult {
        self.executor.fail(
            self.position,
            ExecError::Argument(format!("{}: {}", self.name, message.as_ref())),
        )
    }

    pub fn output(&self, text: &str) {
        self.executor.write_output(text);
    }

    /// Request a token positioned at this command
    pub fn request_token(&self, request: TokenRequest) -> String {
        self.executor.request_token(request.at(self.position))
    }

    pub fn resume_token(&self, id: &str, status: bool) -> bool {
        self.executor.resume_token(id, status)
    }

    /// Store a new list and return its (unclaimed) reference
    pub fn store_list(&self, list: StoredList) -> Value {
        Value::Ref(self.store().store_list(list))
    }

    /// Code of a block argument: `(...)` or a stored block
    pub fn block_text(&self, value: &Value) -> Option<String> {
        match value {
            Value::Block(text) => Some(text.clone()),
            Value::Ref(r) => match self.store().get(*r) {
                Some(Stored::Block(text)) => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// List view of an argument; a `(...)` block is read as list literal
    pub fn list(&self, value: &Value) -> Option<StoredList> {
        match value {
            Value::Ref(r) => self.store().get_list(*r),
            Value::Block(text) => parse_arguments(text)
                .ok()
                .map(|(items, named)| StoredList::with_named(items, named)),
            _ => None,
        }
    }

    /// Token id named by a token reference or a live id string
    pub fn token_id(&self, value: &Value) -> Option<String> {
        match value {
            Value::Ref(ObjectRef { .. }) => match self.store().get(value.as_ref()?) {
                Some(Stored::Token(id)) => Some(id),
                _ => None,
            },
            Value::Symbol(s) | Value::Quoted(s) if self.executor.token_valid(s) => Some(s.clone()),
            _ => None,
        }
    }
}
