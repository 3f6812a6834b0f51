//! `math` library module, callable after `IMPORT math`

use super::{register_module, Builtin};
use crate::ast::Value;
use crate::executor::{CommandResult, Context, Executor};

pub(super) fn register(executor: &Executor) {
    let builtins: &[(&str, Builtin)] = &[
        ("add", add),
        ("sub", sub),
        ("mul", mul),
        ("div", div),
        ("mod", modulo),
        ("min", min),
        ("max", max),
    ];
    register_module(executor, "math", builtins);
}

/// Left fold over the numeric arguments. Stays in integers while every
/// operand is an integer and `int_op` succeeds, otherwise uses floats.
pub(super) fn fold(
    ctx: &Context<'_>,
    float_op: fn(f64, f64) -> Option<f64>,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, CommandResult> {
    let Some((first, rest)) = ctx.args.split_first() else {
        return Err(ctx.error("needs at least one number"));
    };
    let mut acc = number(ctx, first, 0)?;
    for (i, arg) in rest.iter().enumerate() {
        let operand = number(ctx, arg, i + 1)?;
        acc = match (&acc, &operand) {
            (Value::Int(a), Value::Int(b)) => match int_op(*a, *b) {
                Some(n) => Value::Int(n),
                None => float(float_op(*a as f64, *b as f64), ctx)?,
            },
            _ => {
                let a = acc.as_number().unwrap_or(0.0);
                let b = operand.as_number().unwrap_or(0.0);
                float(float_op(a, b), ctx)?
            }
        };
    }
    Ok(acc)
}

fn number(ctx: &Context<'_>, value: &Value, index: usize) -> Result<Value, CommandResult> {
    match value {
        Value::Int(_) | Value::Float(_) => Ok(value.clone()),
        other => match other.as_number() {
            Some(n) if n.fract() == 0.0 && other.as_int().is_some() => Ok(Value::Int(n as i64)),
            Some(n) => Ok(Value::Float(n)),
            None => Err(ctx.error(format!(
                "argument {} is not a number: {}",
                index + 1,
                ctx.display(other)
            ))),
        },
    }
}

fn float(n: Option<f64>, ctx: &Context<'_>) -> Result<Value, CommandResult> {
    finite(n).map(Value::Float).map_err(|message| ctx.error(message))
}

/// `None` from a float op means its divisor was zero
fn finite(n: Option<f64>) -> Result<f64, String> {
    match n {
        Some(n) if n.is_finite() => Ok(n),
        Some(n) => Err(format!("result out of range: {}", n)),
        None => Err("division by zero".to_string()),
    }
}

fn finish(ctx: &mut Context<'_>, result: Result<Value, CommandResult>) -> CommandResult {
    match result {
        Ok(v) => {
            ctx.set_result(Some(v));
            CommandResult::Status(true)
        }
        Err(result) => result,
    }
}

fn add(ctx: &mut Context<'_>) -> CommandResult {
    let result = fold(ctx, |a, b| Some(a + b), i64::checked_add);
    finish(ctx, result)
}

fn sub(ctx: &mut Context<'_>) -> CommandResult {
    let result = fold(ctx, |a, b| Some(a - b), i64::checked_sub);
    finish(ctx, result)
}

fn mul(ctx: &mut Context<'_>) -> CommandResult {
    let result = fold(ctx, |a, b| Some(a * b), i64::checked_mul);
    finish(ctx, result)
}

/// div: a, b - integer division only when exact
fn div(ctx: &mut Context<'_>) -> CommandResult {
    let result = fold(
        ctx,
        |a, b| (b != 0.0).then(|| a / b),
        |a, b| (a.checked_rem(b) == Some(0)).then(|| a / b),
    );
    finish(ctx, result)
}

fn modulo(ctx: &mut Context<'_>) -> CommandResult {
    let result = fold(ctx, |a, b| (b != 0.0).then(|| a % b), |a, b| a.checked_rem(b));
    finish(ctx, result)
}

fn min(ctx: &mut Context<'_>) -> CommandResult {
    let result = fold(ctx, |a, b| Some(a.min(b)), |a, b| Some(a.min(b)));
    finish(ctx, result)
}

fn max(ctx: &mut Context<'_>) -> CommandResult {
    let result = fold(ctx, |a, b| Some(a.max(b)), |a, b| Some(a.max(b)));
    finish(ctx, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_distinguishes_overflow_from_zero_divisor() {
        assert_eq!(finite(Some(1.5)), Ok(1.5));
        assert_eq!(finite(None), Err("division by zero".to_string()));
        let overflow = finite(Some(f64::INFINITY)).unwrap_err();
        assert!(overflow.starts_with("result out of range"), "{}", overflow);
    }

    #[test]
    fn test_overflow_and_zero_divisor_fail() {
        let executor = Executor::default();
        crate::stdlib::register(&executor);
        let overflow = executor.run_script("IMPORT math; mul 1e308, 10").unwrap();
        assert!(!overflow.status);
        let zero = executor.run_script("IMPORT math; div 1, 0").unwrap();
        assert!(!zero.status);
        let exact = executor.run_script("IMPORT math; div 6, 3").unwrap();
        assert_eq!(exact.display.as_deref(), Some("2"));
    }
}
