//! The builtin test library, invoked with `is`.

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::value::{CallArgs, Value, ops};
use std::cmp::Ordering;

/// Takes the single argument most tests need.
fn one_arg(test: &'static str, mut args: CallArgs) -> Result<Value> {
    if args.positional.len() != 1 || !args.named.is_empty() {
        return Err(Error::runtime(format!(
            "test '{test}' takes exactly one argument"
        )));
    }
    Ok(args.positional.pop().unwrap())
}

/// Registers every builtin test.
pub(crate) fn register_builtins(env: &mut Environment) {
    env.add_test("boolean", |_, value, _| Ok(matches!(value, Value::Bool(_))));
    env.add_test("callable", |_, value, _| {
        Ok(matches!(value, Value::Dynamic(_)))
    });
    env.add_test("defined", |_, value, _| Ok(!value.is_undefined()));
    env.add_test("undefined", |_, value, _| Ok(value.is_undefined()));
    env.add_test("none", |_, value, _| Ok(value.is_none()));

    env.add_test("divisibleby", |_, value, args| {
        let divisor = one_arg("divisibleby", args)?;
        let remainder = ops::rem(&value, &divisor)?;
        Ok(!remainder.is_true()?)
    });

    env.add_test("even", |_, value, _| {
        Ok(value.as_int().is_some_and(|v| v % 2 == 0))
    });
    env.add_test("odd", |_, value, _| {
        Ok(value.as_int().is_some_and(|v| v % 2 != 0))
    });

    env.add_test("escaped", |_, value, _| Ok(value.is_safe()));

    let eq = |_: &mut crate::render::State<'_, '_>, value: Value, args: CallArgs| {
        Ok(ops::eq(&value, &one_arg("eq", args)?))
    };
    env.add_test("eq", eq);
    env.add_test("equalto", eq);
    env.add_test("==", eq);
    let ne = |_: &mut crate::render::State<'_, '_>, value: Value, args: CallArgs| {
        Ok(!ops::eq(&value, &one_arg("ne", args)?))
    };
    env.add_test("ne", ne);
    env.add_test("!=", ne);

    let lt = |_: &mut crate::render::State<'_, '_>, value: Value, args: CallArgs| {
        Ok(ops::cmp(&value, &one_arg("lt", args)?)? == Ordering::Less)
    };
    env.add_test("lt", lt);
    env.add_test("lessthan", lt);
    env.add_test("<", lt);
    let le = |_: &mut crate::render::State<'_, '_>, value: Value, args: CallArgs| {
        Ok(ops::cmp(&value, &one_arg("le", args)?)? != Ordering::Greater)
    };
    env.add_test("le", le);
    env.add_test("<=", le);
    let gt = |_: &mut crate::render::State<'_, '_>, value: Value, args: CallArgs| {
        Ok(ops::cmp(&value, &one_arg("gt", args)?)? == Ordering::Greater)
    };
    env.add_test("gt", gt);
    env.add_test("greaterthan", gt);
    env.add_test(">", gt);
    let ge = |_: &mut crate::render::State<'_, '_>, value: Value, args: CallArgs| {
        Ok(ops::cmp(&value, &one_arg("ge", args)?)? != Ordering::Less)
    };
    env.add_test("ge", ge);
    env.add_test(">=", ge);

    env.add_test("false", |_, value, _| Ok(matches!(value, Value::Bool(false))));
    env.add_test("true", |_, value, _| Ok(matches!(value, Value::Bool(true))));

    env.add_test("filter", |state, value, _| {
        let Some(name) = value.as_str() else {
            return Ok(false);
        };
        Ok(state.env.get_filter(name).is_some())
    });
    env.add_test("test", |state, value, _| {
        let Some(name) = value.as_str() else {
            return Ok(false);
        };
        Ok(state.env.get_test(name).is_some())
    });

    env.add_test("float", |_, value, _| Ok(matches!(value, Value::Float(_))));
    env.add_test("integer", |_, value, _| {
        Ok(matches!(value, Value::Int(_) | Value::BigInt(_)))
    });
    env.add_test("number", |_, value, _| {
        Ok(matches!(
            value,
            Value::Int(_) | Value::BigInt(_) | Value::Float(_) | Value::Bool(_)
        ))
    });

    env.add_test("in", |_, value, args| {
        let container = one_arg("in", args)?;
        ops::contains(&container, &value)
    });

    env.add_test("iterable", |_, value, _| {
        Ok(matches!(
            value,
            Value::Seq(_) | Value::Tuple(_) | Value::Map(_) | Value::Str(_) | Value::Safe(_)
        ))
    });
    env.add_test("mapping", |_, value, _| Ok(matches!(value, Value::Map(_))));
    env.add_test("sequence", |_, value, _| {
        Ok(matches!(
            value,
            Value::Seq(_) | Value::Tuple(_) | Value::Str(_) | Value::Safe(_)
        ))
    });
    env.add_test("string", |_, value, _| {
        Ok(matches!(value, Value::Str(_) | Value::Safe(_)))
    });

    env.add_test("lower", |_, value, _| {
        Ok(value
            .as_str()
            .is_some_and(|s| !s.chars().any(char::is_uppercase)))
    });
    env.add_test("upper", |_, value, _| {
        Ok(value
            .as_str()
            .is_some_and(|s| !s.chars().any(char::is_lowercase)))
    });

    env.add_test("sameas", |_, value, args| {
        Ok(value.same_as(&one_arg("sameas", args)?))
    });
}
