//! Command library
//!
//! Ordinary registrants of the dispatch table. Each file groups one family
//! of commands and exposes a `register` function:
//! - `core`: status, results, output, comparison
//! - `macros`: definition and invocation of macros
//! - `lists`: list construction and inspection
//! - `flow`: loops, `break`/`continue`, bubbles
//! - `generators`: generators, iterators and `resume`
//! - `math`, `sys`: library-only modules, callable after `IMPORT`
//!
//! Everything except `math` and `sys` is global and also mirrored into the
//! `stdlib` library module, so a scope that removed a command can
//! `IMPORT "stdlib::name"` it back.

mod core;
mod flow;
mod generators;
mod lists;
mod macros;
mod math;
mod sys;

use crate::ast::{ParsedCommand, Value};
use crate::executor::{CommandResult, Context, Executor, Handler};
use std::sync::Arc;

/// Name of the library module mirroring the global commands
pub const STDLIB_MODULE: &str = "stdlib";

type Builtin = fn(&mut Context<'_>) -> CommandResult;

pub fn register(executor: &Executor) {
    core::register(executor);
    macros::register(executor);
    lists::register(executor);
    flow::register(executor);
    generators::register(executor);
    executor.root_env().populate_stdlib(STDLIB_MODULE);

    math::register(executor);
    sys::register(executor);
}

fn handler(f: Builtin) -> Handler {
    Arc::new(f)
}

fn register_all(executor: &Executor, builtins: &[(&str, Builtin)]) {
    for (name, f) in builtins {
        executor.register_command(name, handler(*f));
    }
}

fn register_module(executor: &Executor, module: &str, builtins: &[(&str, Builtin)]) {
    for (name, f) in builtins {
        executor.register_module_command(module, name, handler(*f));
    }
}

/// Parsed body of a block argument
fn body(ctx: &Context<'_>, value: Option<&Value>) -> Result<Arc<Vec<ParsedCommand>>, CommandResult> {
    let Some(text) = value.and_then(|v| ctx.block_text(v)) else {
        return Err(ctx.error("expected a (block) argument"));
    };
    ctx.executor
        .parse_cached(&text)
        .map_err(|e| ctx.executor.fail(e.position(), e))
}

/// Plain strings named by an argument: a list's items or a single value
fn words(ctx: &Context<'_>, value: &Value) -> Vec<String> {
    match ctx.list(value) {
        Some(list) => list.items().iter().map(|v| ctx.display(v)).collect(),
        None => vec![ctx.display(value)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdlib_module_mirrors_globals() {
        let executor = Executor::default();
        register(&executor);
        let env = executor.root_env();
        assert!(env.get_command("echo").is_some());
        assert!(env.library_module(STDLIB_MODULE).is_some_and(|m| m.contains_key("echo")));
        // Library-only modules stay out of the global table
        assert!(env.get_command("mul").is_none());
        assert!(env.library_module("math").is_some_and(|m| m.contains_key("mul")));
    }
}
