//! Loops, loop control and bubbles
//!
//! Every loop here only builds a `LoopFrame` and hands it to
//! `Executor::run_loop`, which owns iteration, yields and resumption.

use super::{body, register_all, words, Builtin};
use crate::ast::Value;
use crate::executor::{CommandResult, Context, Executor, ForSource, LoopFrame, LoopKind};
use tracing::debug;

pub(super) fn register(executor: &Executor) {
    let builtins: &[(&str, Builtin)] = &[
        ("while", while_loop),
        ("for", for_loop),
        ("repeat", repeat),
        ("fizz", fizz),
        ("bubble", bubble),
        ("break", break_loop),
        ("continue", continue_loop),
    ];
    register_all(executor, builtins);
}

fn run(ctx: &mut Context<'_>, frame: LoopFrame) -> CommandResult {
    ctx.executor.run_loop(frame, ctx.state, ctx.frame.as_ref())
}

/// while: (condition), (body) - repeat body while condition succeeds
fn while_loop(ctx: &mut Context<'_>) -> CommandResult {
    if ctx.args.len() != 2 {
        return ctx.error("usage: while (condition), (body)");
    }
    let condition = match body(ctx, ctx.arg(0)) {
        Ok(commands) => commands,
        Err(result) => return result,
    };
    let commands = match body(ctx, ctx.arg(1)) {
        Ok(commands) => commands,
        Err(result) => return result,
    };
    let frame = LoopFrame::new(LoopKind::While { condition }, commands, ctx.position);
    run(ctx, frame)
}

/// for: start, end, var, (body), by: step - inclusive numeric range
/// for: list|token, var, (body) - items of a list, or values of a generator
///
/// The range direction follows start and end; `by` only gives the step size.
fn for_loop(ctx: &mut Context<'_>) -> CommandResult {
    let source = match ctx.args.len() {
        4 => match range(ctx) {
            Ok(source) => source,
            Err(result) => return result,
        },
        3 => {
            let Some(arg) = ctx.arg(0) else {
                return ctx.error("missing source");
            };
            if let Some(list) = ctx.list(arg) {
                ForSource::Items {
                    items: list.items().to_vec(),
                    index: 0,
                }
            } else if let Some(id) = ctx.token_id(arg) {
                ForSource::Generator(id)
            } else {
                return ctx.error(format!("cannot iterate over {}", ctx.display(arg)));
            }
        }
        _ => return ctx.error("usage: for start, end, var, (body) | for list, var, (body)"),
    };
    let last = ctx.args.len() - 1;
    let var = ctx.args[last - 1].as_text();
    let commands = match body(ctx, ctx.arg(last)) {
        Ok(commands) => commands,
        Err(result) => return result,
    };
    let frame = LoopFrame::new(LoopKind::For { var, source }, commands, ctx.position);
    run(ctx, frame)
}

fn range(ctx: &Context<'_>) -> Result<ForSource, CommandResult> {
    let bound = |index: usize| {
        ctx.arg(index)
            .and_then(Value::as_number)
            .ok_or_else(|| ctx.error(format!("range bound {} is not a number", index + 1)))
    };
    let start = bound(0)?;
    let end = bound(1)?;
    let by = match ctx.named_arg("by") {
        Some(v) => v
            .as_number()
            .ok_or_else(|| ctx.error("by: must be a number"))?
            .abs(),
        None => 1.0,
    };
    if by == 0.0 {
        return Err(ctx.error("by: must not be zero"));
    }
    let step = if end < start { -by } else { by };
    Ok(ForSource::Range {
        current: start,
        end,
        step,
    })
}

/// repeat: (body), count, [var] - run body count times; the result is the
/// list of each iteration's result (or status when it left none)
fn repeat(ctx: &mut Context<'_>) -> CommandResult {
    let count = match ctx.int_arg(1) {
        Some(n) if n >= 0 => n as usize,
        _ => return ctx.error("usage: repeat (body), count, [var]"),
    };
    let var = ctx.arg(2).map(Value::as_text);
    let commands = match body(ctx, ctx.arg(0)) {
        Ok(commands) => commands,
        Err(result) => return result,
    };
    let kind = LoopKind::Repeat {
        count,
        var,
        results: Vec::new(),
    };
    let frame = LoopFrame::new(kind, commands, ctx.position);
    run(ctx, frame)
}

/// bubble: flavor(s), content - record content under each flavor; bubbles
/// travel up to the caller when a macro returns
fn bubble(ctx: &mut Context<'_>) -> CommandResult {
    let (Some(flavors), Some(content)) = (ctx.arg(0), ctx.arg(1)) else {
        return ctx.error("usage: bubble flavor(s), content");
    };
    let flavors = words(ctx, flavors);
    let content = content.clone();
    for flavor in &flavors {
        ctx.state.add_bubble(ctx.store(), flavor, content.clone());
    }
    debug!(target: "tether::flow", "bubble {} into {:?}", ctx.display(&content), flavors);
    CommandResult::Status(true)
}

/// fizz: flavor(s), var, (body) - run body once per recorded bubble
fn fizz(ctx: &mut Context<'_>) -> CommandResult {
    let (Some(flavors), Some(var)) = (ctx.arg(0), ctx.arg(1)) else {
        return ctx.error("usage: fizz flavor(s), var, (body)");
    };
    let var = var.as_text();
    let mut items: Vec<Value> = Vec::new();
    for flavor in words(ctx, flavors) {
        for value in ctx.state.bubbles(&flavor) {
            // A bubble recorded under several flavors is visited once
            let seen = matches!(value, Value::Ref(_)) && items.contains(&value);
            if !seen {
                items.push(value);
            }
        }
    }
    let commands = match body(ctx, ctx.arg(2)) {
        Ok(commands) => commands,
        Err(result) => return result,
    };
    let kind = LoopKind::For {
        var,
        source: ForSource::Items { items, index: 0 },
    };
    let frame = LoopFrame::new(kind, commands, ctx.position);
    run(ctx, frame)
}

fn levels(ctx: &Context<'_>) -> Result<u32, CommandResult> {
    match ctx.arg(0) {
        None => Ok(1),
        Some(v) => match v.as_int() {
            Some(n) if n >= 1 => Ok(n as u32),
            _ => Err(ctx.error(format!("level must be a positive integer: {}", ctx.display(v)))),
        },
    }
}

/// break: [n] - leave n enclosing loops
fn break_loop(ctx: &mut Context<'_>) -> CommandResult {
    match levels(ctx) {
        Ok(n) => CommandResult::Break(n),
        Err(result) => result,
    }
}

/// continue: [n] - next iteration of the nth enclosing loop
fn continue_loop(ctx: &mut Context<'_>) -> CommandResult {
    match levels(ctx) {
        Ok(n) => CommandResult::Continue(n),
        Err(result) => result,
    }
}
