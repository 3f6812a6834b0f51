use super::{register_all, Builtin};
use crate::ast::Value;
use crate::executor::{CommandResult, Context, Executor, TokenRequest};
use std::cmp::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub(super) fn register(executor: &Executor) {
    let builtins: &[(&str, Builtin)] = &[
        ("true", succeed),
        ("false", fail),
        ("ret", ret),
        ("set_result", set_result),
        ("get_result", get_result),
        ("get_status", get_status),
        ("echo", echo),
        ("msleep", msleep),
        ("eq", eq),
        ("lt", lt),
        ("gt", gt),
        ("add", add),
        ("not", not),
        ("json", json),
    ];
    register_all(executor, builtins);
}

fn succeed(_: &mut Context<'_>) -> CommandResult {
    CommandResult::Status(true)
}

fn fail(_: &mut Context<'_>) -> CommandResult {
    CommandResult::Status(false)
}

/// ret: [value] - end the enclosing macro or script, keeping the status
fn ret(ctx: &mut Context<'_>) -> CommandResult {
    if ctx.args.len() > 1 {
        return ctx.error("usage: ret [value]");
    }
    CommandResult::EarlyReturn {
        status: ctx.state.last_status(),
        result: ctx.args.first().cloned(),
    }
}

fn set_result(ctx: &mut Context<'_>) -> CommandResult {
    ctx.set_result(ctx.args.first().cloned());
    CommandResult::Status(true)
}

/// get_result - keep the current result; inside a brace, adopt the result
/// of the command line the brace belongs to
fn get_result(ctx: &mut Context<'_>) -> CommandResult {
    if ctx.state.has_result() {
        return CommandResult::Status(true);
    }
    match ctx.state.outer_result() {
        Some(v) => {
            ctx.set_result(Some(v));
            CommandResult::Status(true)
        }
        None => CommandResult::Status(false),
    }
}

/// get_status - previous status as a bool result, status unchanged
fn get_status(ctx: &mut Context<'_>) -> CommandResult {
    let status = ctx.state.last_status();
    ctx.set_result(Some(Value::Bool(status)));
    CommandResult::Status(status)
}

/// echo: args... - print display text joined by spaces
fn echo(ctx: &mut Context<'_>) -> CommandResult {
    let line: Vec<String> = ctx.args.iter().map(|v| ctx.display(v)).collect();
    ctx.output(&format!("{}\n", line.join(" ")));
    CommandResult::Status(true)
}

/// msleep: ms - complete asynchronously after a delay
fn msleep(ctx: &mut Context<'_>) -> CommandResult {
    let Some(ms) = ctx.int_arg(0).filter(|ms| *ms >= 0) else {
        return ctx.error("usage: msleep <milliseconds>");
    };
    let token = ctx.request_token(TokenRequest::new());
    let executor = ctx.executor.clone();
    let id = token.clone();
    let spawned = thread::Builder::new()
        .name(format!("tether-msleep-{}", token))
        .spawn(move || {
            thread::sleep(Duration::from_millis(ms as u64));
            debug!(target: "tether::async", "msleep {} done", id);
            executor.resume_token(&id, true);
        });
    if let Err(e) = spawned {
        warn!(target: "tether::async", "msleep could not start a timer: {}", e);
        ctx.executor.cancel_token(&token);
        return CommandResult::Status(false);
    }
    CommandResult::Token(token)
}

/// Numbers compare numerically, everything else by display text
fn compare(ctx: &Context<'_>, a: &Value, b: &Value) -> Option<Ordering> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) if !matches!(a, Value::Quoted(_)) && !matches!(b, Value::Quoted(_)) => {
            x.partial_cmp(&y)
        }
        _ => Some(ctx.display(a).cmp(&ctx.display(b))),
    }
}

fn comparison(ctx: &mut Context<'_>, accept: fn(Ordering) -> bool) -> CommandResult {
    let (Some(a), Some(b)) = (ctx.arg(0), ctx.arg(1)) else {
        return ctx.error("needs two arguments");
    };
    let verdict = compare(ctx, a, b).is_some_and(accept);
    ctx.set_result(Some(Value::Bool(verdict)));
    CommandResult::Status(verdict)
}

fn eq(ctx: &mut Context<'_>) -> CommandResult {
    if let (Some(Value::Ref(a)), Some(Value::Ref(b))) = (ctx.arg(0), ctx.arg(1)) {
        if a == b {
            ctx.set_result(Some(Value::Bool(true)));
            return CommandResult::Status(true);
        }
    }
    comparison(ctx, Ordering::is_eq)
}

fn lt(ctx: &mut Context<'_>) -> CommandResult {
    comparison(ctx, Ordering::is_lt)
}

fn gt(ctx: &mut Context<'_>) -> CommandResult {
    comparison(ctx, Ordering::is_gt)
}

/// add: a, b, ... - integer sum when every operand is integral
fn add(ctx: &mut Context<'_>) -> CommandResult {
    match super::math::fold(ctx, |a, b| Some(a + b), |a, b| a.checked_add(b)) {
        Ok(v) => {
            ctx.set_result(Some(v));
            CommandResult::Status(true)
        }
        Err(result) => result,
    }
}

/// not: [value] - negate a value's truthiness, or the last status
fn not(ctx: &mut Context<'_>) -> CommandResult {
    let verdict = match ctx.arg(0) {
        Some(v) => !v.is_truthy(),
        None => !ctx.state.last_status(),
    };
    ctx.set_result(Some(Value::Bool(verdict)));
    CommandResult::Status(verdict)
}

/// json: value - JSON text of a value, lists become arrays or objects
fn json(ctx: &mut Context<'_>) -> CommandResult {
    let Some(value) = ctx.arg(0) else {
        return ctx.error("usage: json <value>");
    };
    let text = ctx.store().to_json(value).to_string();
    ctx.set_result(Some(Value::quoted(text)));
    CommandResult::Status(true)
}
