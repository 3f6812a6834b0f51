//! tether - a continuation-based command scripting runtime
//!
//! # Overview
//!
//! tether runs scripts made of comma-argument commands joined by `;`,
//! newline, `&` (and-then) and `|` (or-else). Any command may finish later:
//! it hands back a *token*, and the rest of the script is parked on that
//! token as an explicit continuation until the token is resumed.
//!
//! # Core Concepts
//!
//! ## Commands and Statuses
//!
//! ```text
//! # Every command ends with a status; & and | branch on it
//! eq 1, 2 & echo same | echo different
//!
//! # Besides the status, a command may leave a result
//! add 2, 3 => sum; echo ~sum
//! ```
//!
//! ## Brace Expressions
//!
//! ```text
//! # {...} runs first; its result is spliced into the command text
//! echo "total: {add 1, {add 2, 3}}"
//! ```
//!
//! ## Macros, Modules and Generators
//!
//! ```text
//! macro greet, (echo "hello $1")
//! greet world
//!
//! IMPORT math
//! mul 6, 7
//!
//! g: {generator (for 1, 3, i, (yield ~i))}
//! resume ~g
//! ```
//!
//! ## Asynchronous Commands
//!
//! ```text
//! # msleep returns a token; echo runs when the timer resumes it
//! msleep 100; echo later
//! ```
//!
//! # Example
//!
//! ```rust
//! let outcome = tether::run("add 40, 2").unwrap();
//! assert!(outcome.status);
//! assert_eq!(outcome.display.as_deref(), Some("42"));
//! ```

pub mod ast;
pub mod config;
pub mod executor;
pub mod lexer;
pub mod list;
pub mod module_env;
pub mod parser;
pub mod state;
pub mod stdlib;
pub mod store;
pub mod substitution;
pub mod token;

// Re-export commonly used items
pub use ast::{ObjectKind, ObjectRef, ParsedCommand, Position, Separator, Value};
pub use config::Config;
pub use executor::{
    CommandResult, Completion, Context, ExecError, Executor, GeneratorStep, Handler, RunOutcome,
    TokenRequest,
};
pub use lexer::LexError;
pub use list::StoredList;
pub use module_env::{Macro, ModuleEnvironment, ModuleError, ModuleItem};
pub use parser::{parse_sequence, ParseError};
pub use state::ExecutionState;
pub use store::{ObjectStore, Stored};
pub use token::TokenError;

/// Convenience function to run a script with the command library,
/// waiting for any asynchronous work to finish
pub fn run(input: &str) -> Result<RunOutcome, String> {
    let executor = Executor::with_stdlib();
    executor.run_script(input).map_err(|e| e.to_string())
}
