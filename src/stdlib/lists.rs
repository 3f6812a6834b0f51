use super::{register_all, Builtin};
use crate::ast::Value;
use crate::executor::{CommandResult, Context, Executor};
use crate::list::{StoredList, TypeInfo};
use tracing::debug;

pub(super) fn register(executor: &Executor) {
    let builtins: &[(&str, Builtin)] = &[
        ("list", list),
        ("len", len),
        ("item", item),
        ("append", append),
        ("slice", slice),
        ("concat", concat),
        ("keys", keys),
        ("arrtype", arrtype),
        ("arrsolid", arrsolid),
        ("arrser", arrser),
        ("maptype", maptype),
        ("mapsolid", mapsolid),
        ("mapser", mapser),
    ];
    register_all(executor, builtins);
}

/// Resolve argument `index` as a list or report the failure
fn list_arg(ctx: &Context<'_>, index: usize) -> Result<StoredList, CommandResult> {
    match ctx.arg(index) {
        Some(value) => ctx
            .list(value)
            .ok_or_else(|| ctx.error(format!("not a list: {}", ctx.display(value)))),
        None => Err(ctx.error("missing list argument")),
    }
}

/// Position from a possibly negative index; negatives count from the end
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    (0..len as i64).contains(&resolved).then_some(resolved as usize)
}

/// Like `resolve_index` but clamped, for slice bounds
fn clamp_index(index: i64, len: usize) -> usize {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    resolved.clamp(0, len as i64) as usize
}

fn set_list(ctx: &mut Context<'_>, list: StoredList) -> CommandResult {
    let value = ctx.store_list(list);
    ctx.set_result(Some(value));
    CommandResult::Status(true)
}

/// list: items..., key: value... - build a list from the arguments
fn list(ctx: &mut Context<'_>) -> CommandResult {
    let items = std::mem::take(&mut ctx.args);
    let named = std::mem::take(&mut ctx.named);
    set_list(ctx, StoredList::with_named(items, named))
}

/// len: list|string - positional item count or character count
fn len(ctx: &mut Context<'_>) -> CommandResult {
    let Some(value) = ctx.arg(0) else {
        return ctx.error("usage: len <list|string>");
    };
    let n = match ctx.list(value) {
        Some(list) => list.len(),
        None => ctx.display(value).chars().count(),
    };
    ctx.set_result(Some(Value::Int(n as i64)));
    CommandResult::Status(true)
}

/// item: list, index|key - positional item (0-based, negative from the end)
/// or named item; false and nil when absent
fn item(ctx: &mut Context<'_>) -> CommandResult {
    let list = match list_arg(ctx, 0) {
        Ok(list) => list,
        Err(result) => return result,
    };
    let Some(selector) = ctx.arg(1) else {
        return ctx.error("usage: item <list>, <index|key>");
    };
    let found = match selector {
        Value::Int(i) => resolve_index(*i, list.len()).and_then(|i| list.get(i)),
        key => list.named().get(&key.as_text()),
    }
    .cloned();
    let status = found.is_some();
    if !status {
        debug!(target: "tether::list", "item {} not present", ctx.display(selector));
    }
    ctx.set_result(found);
    CommandResult::Status(status)
}

/// append: list, values... - new list with the values added at the end
fn append(ctx: &mut Context<'_>) -> CommandResult {
    let list = match list_arg(ctx, 0) {
        Ok(list) => list,
        Err(result) => return result,
    };
    let extended = ctx.args[1..]
        .iter()
        .fold(list, |acc, value| acc.append(value.clone()));
    set_list(ctx, extended)
}

/// slice: list, start, [end] - items from start up to (not including) end
fn slice(ctx: &mut Context<'_>) -> CommandResult {
    let list = match list_arg(ctx, 0) {
        Ok(list) => list,
        Err(result) => return result,
    };
    let len = list.len();
    let Some(start) = ctx.int_arg(1) else {
        return ctx.error("usage: slice <list>, <start>, [end]");
    };
    let end = match ctx.arg(2) {
        None => len,
        Some(v) => match v.as_int() {
            Some(end) => clamp_index(end, len),
            None => return ctx.error(format!("end is not an integer: {}", ctx.display(v))),
        },
    };
    set_list(ctx, list.slice(clamp_index(start, len), end))
}

/// concat: lists... - items in order; named clashes take the later value
fn concat(ctx: &mut Context<'_>) -> CommandResult {
    let mut combined = StoredList::default();
    for index in 0..ctx.args.len() {
        match list_arg(ctx, index) {
            Ok(list) => combined = combined.concat(&list),
            Err(result) => return result,
        }
    }
    set_list(ctx, combined)
}

/// keys: list - named item keys, sorted
fn keys(ctx: &mut Context<'_>) -> CommandResult {
    let list = match list_arg(ctx, 0) {
        Ok(list) => list,
        Err(result) => return result,
    };
    let keys = list.named().keys().cloned().map(Value::quoted).collect();
    set_list(ctx, StoredList::new(keys))
}

fn report(
    ctx: &mut Context<'_>,
    info: fn(&StoredList) -> &TypeInfo,
    answer: fn(&TypeInfo) -> Value,
) -> CommandResult {
    match list_arg(ctx, 0) {
        Ok(list) => {
            ctx.set_result(Some(answer(info(&list))));
            CommandResult::Status(true)
        }
        Err(result) => result,
    }
}

fn type_name(info: &TypeInfo) -> Value {
    Value::quoted(info.elem.name())
}

fn solid(info: &TypeInfo) -> Value {
    Value::Bool(info.solid)
}

fn serializable(info: &TypeInfo) -> Value {
    Value::Bool(info.serializable)
}

/// arrtype: list - element type of the positional items
fn arrtype(ctx: &mut Context<'_>) -> CommandResult {
    report(ctx, StoredList::items_info, type_name)
}

/// arrsolid: list - true when no positional item is nil or undefined
fn arrsolid(ctx: &mut Context<'_>) -> CommandResult {
    report(ctx, StoredList::items_info, solid)
}

/// arrser: list - true when every positional item can be serialized
fn arrser(ctx: &mut Context<'_>) -> CommandResult {
    report(ctx, StoredList::items_info, serializable)
}

fn maptype(ctx: &mut Context<'_>) -> CommandResult {
    report(ctx, StoredList::named_info, type_name)
}

fn mapsolid(ctx: &mut Context<'_>) -> CommandResult {
    report(ctx, StoredList::named_info, solid)
}

fn mapser(ctx: &mut Context<'_>) -> CommandResult {
    report(ctx, StoredList::named_info, serializable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_index() {
        assert_eq!(resolve_index(0, 3), Some(0));
        assert_eq!(resolve_index(-1, 3), Some(2));
        assert_eq!(resolve_index(3, 3), None);
        assert_eq!(resolve_index(-4, 3), None);
    }

    #[test]
    fn test_clamp_index() {
        assert_eq!(clamp_index(10, 3), 3);
        assert_eq!(clamp_index(-10, 3), 0);
        assert_eq!(clamp_index(-1, 3), 2);
    }
}
