use super::{register_all, Builtin};
use crate::ast::Value;
use crate::executor::{CommandResult, Context, Executor, GeneratorStep};
use crate::module_env::ModuleEnvironment;
use crate::state::MacroFrame;
use crate::store::Stored;
use crate::token::TokenError;
use std::sync::Arc;
use tracing::debug;

pub(super) fn register(executor: &Executor) {
    let builtins: &[(&str, Builtin)] = &[
        ("generator", generator),
        ("resume", resume),
        ("yield", yield_value),
        ("suspend", suspend),
        ("token_valid", token_valid),
        ("each", each),
        ("pair", pair),
    ];
    register_all(executor, builtins);
}

/// generator: macro|(block), args... - generator token over the body
///
/// The body runs in its own macro scope with `#token` bound to the
/// generator, and only advances when resumed.
fn generator(ctx: &mut Context<'_>) -> CommandResult {
    let Some(target) = ctx.arg(0) else {
        return ctx.error("usage: generator macro|(block), [args...]");
    };
    let (text, defining) = match target {
        Value::Symbol(name) | Value::Quoted(name) => match ctx.state.env().get_macro(name) {
            Some(mac) => (mac.body.clone(), mac.env.clone()),
            None => return ctx.error(format!("macro \"{}\" not found", name)),
        },
        Value::Ref(r) => match ctx.store().get(*r) {
            Some(Stored::Macro(mac)) => (mac.body.clone(), mac.env.clone()),
            Some(Stored::Block(text)) => (text, None),
            _ => return ctx.error(format!("{} is not a macro or block", ctx.display(target))),
        },
        Value::Block(text) => (text.clone(), None),
        other => return ctx.error(format!("{} is not a macro or block", ctx.display(other))),
    };
    let commands = match ctx.executor.parse_cached(&text) {
        Ok(commands) => commands,
        Err(e) => return ctx.executor.fail(e.position(), e),
    };

    let args = ctx.args[1..].to_vec();
    let named = std::mem::take(&mut ctx.named);
    let store = ctx.store();
    let defining = defining.unwrap_or_else(|| Arc::clone(ctx.state.env()));
    let child = Arc::new(ctx.state.macro_child(ModuleEnvironment::new_macro_scope(&defining)));
    for value in args.iter().chain(named.values()) {
        if let Value::Ref(r) = value {
            if store.claim(*r) {
                child.hold(*r);
            }
        }
    }
    let frame = Arc::new(MacroFrame::new(args, named));
    let (id, token) = ctx
        .executor
        .create_generator(commands, 0, Arc::clone(&child), Some(frame), None, true);
    child.set_variable(store, "#token", Value::Ref(token));
    debug!(target: "tether::async", "generator {} ready", id);
    ctx.set_result(Some(Value::Ref(token)));
    CommandResult::Status(true)
}

/// resume: token, [status] - advance a generator or iterator, or complete
/// an ordinary token with the given status
fn resume(ctx: &mut Context<'_>) -> CommandResult {
    let Some(arg) = ctx.arg(0) else {
        return ctx.error("usage: resume <token>, [status]");
    };
    let Some(id) = ctx.token_id(arg) else {
        let text = ctx.display(arg);
        ctx.set_result(None);
        return ctx.executor.fail(ctx.position, TokenError::NotFound(text));
    };
    match ctx.executor.resume_generator(&id) {
        GeneratorStep::Yielded(value) => {
            ctx.set_result(Some(value));
            CommandResult::Status(true)
        }
        GeneratorStep::Suspended => {
            ctx.set_result(None);
            CommandResult::Status(true)
        }
        GeneratorStep::Finished { status, result } => {
            // `result` arrives claimed; put_result takes that claim over
            ctx.state.put_result(ctx.store(), result);
            CommandResult::Status(status)
        }
        GeneratorStep::NotFound => {
            ctx.set_result(None);
            CommandResult::Status(false)
        }
        GeneratorStep::NotGenerator => {
            let status = ctx.arg(1).map_or(true, Value::is_truthy);
            CommandResult::Status(ctx.resume_token(&id, status))
        }
    }
}

/// yield: [token,] value - hand a value to whoever resumed the generator
fn yield_value(ctx: &mut Context<'_>) -> CommandResult {
    let value = match ctx.args.as_slice() {
        [] => ctx.result().unwrap_or(Value::Nil),
        [value] | [_, value] => value.clone(),
        _ => return ctx.error("usage: yield [token,] value"),
    };
    CommandResult::Yield { value, frame: None }
}

/// suspend - pause here until resumed
fn suspend(_: &mut Context<'_>) -> CommandResult {
    CommandResult::Suspend { frame: None }
}

/// token_valid: token - whether the token is still live
fn token_valid(ctx: &mut Context<'_>) -> CommandResult {
    let valid = ctx
        .arg(0)
        .and_then(|arg| ctx.token_id(arg))
        .is_some_and(|id| ctx.executor.token_valid(&id));
    ctx.set_result(Some(Value::Bool(valid)));
    CommandResult::Status(valid)
}

fn iterator(ctx: &mut Context<'_>, pairs: bool) -> CommandResult {
    let Some(arg) = ctx.arg(0) else {
        return ctx.error("missing list argument");
    };
    let list = match arg {
        Value::Ref(r) if ctx.store().get_list(*r).is_some() => *r,
        other => match ctx.list(other) {
            Some(list) => ctx.store().store_list(list),
            None => return ctx.error(format!("not a list: {}", ctx.display(other))),
        },
    };
    match ctx.executor.create_iterator(list, pairs) {
        Some((_, token)) => {
            ctx.set_result(Some(Value::Ref(token)));
            CommandResult::Status(true)
        }
        None => ctx.error("list vanished before the iterator started"),
    }
}

/// each: list - iterator over the positional items
fn each(ctx: &mut Context<'_>) -> CommandResult {
    iterator(ctx, false)
}

/// pair: list - iterator over (index, item) then (key, value) pairs
fn pair(ctx: &mut Context<'_>) -> CommandResult {
    iterator(ctx, true)
}
