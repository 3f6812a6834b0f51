//! `sys` library module, callable after `IMPORT sys`

use super::{register_module, Builtin};
use crate::ast::Value;
use crate::executor::{CommandResult, Context, Executor};
use crate::list::StoredList;

pub(super) fn register(executor: &Executor) {
    let builtins: &[(&str, Builtin)] = &[("getenv", getenv), ("now", now), ("tokens", tokens)];
    register_module(executor, "sys", builtins);
}

/// getenv: name - environment variable, false when unset
fn getenv(ctx: &mut Context<'_>) -> CommandResult {
    let Some(name) = ctx.arg(0).map(Value::as_text) else {
        return ctx.error("usage: getenv <name>");
    };
    match std::env::var(&name) {
        Ok(value) => {
            ctx.set_result(Some(Value::quoted(value)));
            CommandResult::Status(true)
        }
        Err(_) => {
            ctx.set_result(None);
            CommandResult::Status(false)
        }
    }
}

/// now - milliseconds since the Unix epoch; `iso: true` for RFC 3339 text
fn now(ctx: &mut Context<'_>) -> CommandResult {
    let now = chrono::Utc::now();
    let iso = ctx.named_arg("iso").is_some_and(Value::is_truthy);
    let value = if iso {
        Value::quoted(now.to_rfc3339())
    } else {
        Value::Int(now.timestamp_millis())
    };
    ctx.set_result(Some(value));
    CommandResult::Status(true)
}

/// tokens - ids of the live tokens
fn tokens(ctx: &mut Context<'_>) -> CommandResult {
    let ids = ctx
        .executor
        .active_tokens()
        .into_iter()
        .map(Value::quoted)
        .collect();
    let list = ctx.store_list(StoredList::new(ids));
    ctx.set_result(Some(list));
    CommandResult::Status(true)
}
