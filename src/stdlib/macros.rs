use super::{register_all, Builtin};
use crate::ast::Value;
use crate::executor::{CommandResult, Context, Executor};
use crate::list::StoredList;
use crate::module_env::Macro;
use crate::store::Stored;
use std::sync::Arc;
use tracing::debug;

pub(super) fn register(executor: &Executor) {
    let builtins: &[(&str, Builtin)] = &[
        ("macro", define),
        ("call", call),
        ("macro_list", list),
        ("macro_delete", delete),
        ("command_ref", command_ref),
    ];
    register_all(executor, builtins);
}

/// macro: name, (body) - define a macro in the current scope
/// macro: (body) - anonymous macro; the result is a reference to it
///
/// Either form captures the defining environment, so the body later
/// resolves names the way the definition site did.
fn define(ctx: &mut Context<'_>) -> CommandResult {
    let (name, body) = match ctx.args.as_slice() {
        [body] => (None, body),
        [name, body] => (Some(name.as_text()), body),
        _ => return ctx.error("usage: macro [name,] (body)"),
    };
    let Some(text) = ctx.block_text(body) else {
        return ctx.error("macro body must be a (block)");
    };
    let env = Arc::clone(ctx.state.env());
    let mac = Arc::new(Macro::new(name.clone(), text, ctx.position).with_env(Arc::clone(&env)));
    match name {
        Some(name) => {
            debug!(target: "tether::macro", "defined {}", name);
            env.register_macro(&name, mac);
        }
        None => {
            let r = ctx.store().store(Stored::Macro(mac));
            ctx.set_result(Some(Value::Ref(r)));
        }
    }
    CommandResult::Status(true)
}

/// call: target, args... - call a macro or command by name or reference
fn call(ctx: &mut Context<'_>) -> CommandResult {
    let Some((target, args)) = ctx.args.split_first() else {
        return ctx.error("usage: call <macro or command>, [args...]");
    };
    let target = target.clone();
    let args = args.to_vec();
    let named = std::mem::take(&mut ctx.named);
    ctx.executor
        .invoke(&target, args, named, ctx.state, ctx.frame.as_ref(), ctx.position)
}

/// macro_list - names of the macros visible here
fn list(ctx: &mut Context<'_>) -> CommandResult {
    let names = ctx
        .state
        .env()
        .macro_names()
        .into_iter()
        .map(Value::quoted)
        .collect();
    let list = ctx.store_list(StoredList::new(names));
    ctx.set_result(Some(list));
    CommandResult::Status(true)
}

/// macro_delete: name - drop a macro defined in this scope
fn delete(ctx: &mut Context<'_>) -> CommandResult {
    let Some(name) = ctx.arg(0).map(Value::as_text) else {
        return ctx.error("usage: macro_delete <name>");
    };
    let env = ctx.state.env();
    if !env.has_local_macro(&name) {
        return ctx.error(format!("macro \"{}\" not found in this scope", name));
    }
    match env.remove_mine(&[name]) {
        Ok(()) => CommandResult::Status(true),
        Err(e) => ctx.executor.fail(ctx.position, e),
    }
}

/// command_ref: name - reference to a command or macro, callable later
fn command_ref(ctx: &mut Context<'_>) -> CommandResult {
    let Some(name) = ctx.arg(0).map(Value::as_text) else {
        return ctx.error("usage: command_ref <name>");
    };
    let env = ctx.state.env();
    let stored = match env.get_command(&name) {
        Some(handler) => Stored::Command(handler),
        None => match env.get_macro(&name) {
            Some(mac) => Stored::Macro(mac),
            None => return ctx.error(format!("command \"{}\" not found", name)),
        },
    };
    let r = ctx.store().store(stored);
    ctx.set_result(Some(Value::Ref(r)));
    CommandResult::Status(true)
}
