//! Expression evaluation over the compiled form.
//!
//! Failures from filters, tests, attribute access, and operators are
//! wrapped with the template name and the failing node's line as they
//! surface, so runtime diagnostics point into the template source.

use super::State;
use super::objects::SelfRef;
use crate::compile::code::{CallArgsIr, Ex, FilterIr};
use crate::error::{Error, Result};
use crate::syntax::ast::{BinOpKind, CmpOp};
use crate::value::{CallArgs, Key, Value, ValueMap, ops};
use std::rc::Rc;

/// Evaluates a compiled expression.
pub(crate) fn eval(state: &mut State<'_, '_>, ex: &Ex) -> Result<Value> {
    match ex {
        Ex::Const(value) => Ok(value.clone()),
        Ex::Name { name, line } => {
            resolve_name(state, name).map_err(|err| err.locate(&state.name, *line))
        }
        Ex::Tuple(items) => Ok(Value::Tuple(Rc::new(eval_list(state, items)?))),
        Ex::List(items) => Ok(Value::Seq(Rc::new(eval_list(state, items)?))),
        Ex::Dict(pairs) => {
            let mut map = ValueMap::with_capacity(pairs.len());
            for (key, value) in pairs {
                let key = Key::try_from_value(&eval(state, key)?)?;
                map.insert(key, eval(state, value)?);
            }
            Ok(Value::from(map))
        }
        Ex::GetAttr { obj, name, line } => {
            let obj = eval(state, obj)?;
            obj.get_attr(state.undefined_kind(), name)
                .map_err(|err| err.locate(&state.name, *line))
        }
        Ex::GetItem { obj, index, line } => {
            let obj = eval(state, obj)?;
            let index = eval(state, index)?;
            obj.get_item(state.undefined_kind(), &index)
                .map_err(|err| err.locate(&state.name, *line))
        }
        Ex::Slice {
            obj,
            start,
            stop,
            step,
            line,
        } => {
            let obj = eval(state, obj)?;
            let start = eval_bound(state, start.as_deref())?;
            let stop = eval_bound(state, stop.as_deref())?;
            let step = eval_bound(state, step.as_deref())?;
            ops::slice(&obj, start, stop, step).map_err(|err| err.locate(&state.name, *line))
        }
        Ex::Call { callee, args, line } => {
            let callee = eval(state, callee)?;
            let args = build_args(state, args)?;
            call_value(state, &callee, args).map_err(|err| err.locate(&state.name, *line))
        }
        Ex::Filter {
            value,
            name,
            args,
            line,
        } => {
            let value = match value {
                Some(value) => eval(state, value)?,
                None => Value::None,
            };
            dispatch_filter(state, name, value, args, *line)
        }
        Ex::Test {
            value,
            name,
            args,
            negated,
            line,
        } => {
            let value = eval(state, value)?;
            let args = build_args(state, args)?;
            let test = state
                .env
                .get_test(name)
                .ok_or_else(|| Error::runtime(format!("no test named '{name}'")))?;
            let result =
                test(state, value, args).map_err(|err| err.locate(&state.name, *line))?;
            Ok(Value::Bool(result != *negated))
        }
        Ex::Cond {
            test,
            then,
            otherwise,
            line,
        } => {
            let truthy = eval(state, test)?
                .is_true()
                .map_err(|err| Error::from(err).locate(&state.name, *line))?;
            if truthy {
                eval(state, then)
            } else {
                match otherwise {
                    Some(otherwise) => eval(state, otherwise),
                    None => Ok(Value::undefined_hint(
                        state.undefined_kind(),
                        "the inline if-expression evaluated to false and no else \
                         section was defined"
                            .to_string(),
                    )),
                }
            }
        }
        Ex::BinOp {
            op,
            left,
            right,
            line,
        } => eval_binop(state, *op, left, right).map_err(|err| err.locate(&state.name, *line)),
        Ex::Concat { parts, line } => {
            let autoescape = state.ctx.eval.autoescape;
            let mut result = Value::safe("");
            for part in parts {
                let part = eval(state, part)?;
                result = ops::concat(autoescape, &result, &part)
                    .map_err(|err| err.locate(&state.name, *line))?;
            }
            Ok(result)
        }
        Ex::Compare { first, rest, line } => {
            let mut left = eval(state, first)?;
            for (op, operand) in rest {
                let right = eval(state, operand)?;
                let holds = eval_comparison(*op, &left, &right)
                    .map_err(|err| err.locate(&state.name, *line))?;
                if !holds {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Ex::Not { expr, line } => {
            let value = eval(state, expr)?;
            let truthy = value
                .is_true()
                .map_err(|err| Error::from(err).locate(&state.name, *line))?;
            Ok(Value::Bool(!truthy))
        }
        Ex::Neg { expr, line } => {
            let value = eval(state, expr)?;
            ops::neg(&value).map_err(|err| err.locate(&state.name, *line))
        }
        Ex::Pos { expr, line } => {
            let value = eval(state, expr)?;
            ops::pos(&value).map_err(|err| err.locate(&state.name, *line))
        }
    }
}

/// Evaluates a list of expressions.
fn eval_list(state: &mut State<'_, '_>, items: &[Ex]) -> Result<Vec<Value>> {
    items.iter().map(|item| eval(state, item)).collect()
}

/// Evaluates a slice bound into an optional integer.
fn eval_bound(state: &mut State<'_, '_>, bound: Option<&Ex>) -> Result<Option<i64>> {
    match bound {
        None => Ok(None),
        Some(expr) => match eval(state, expr)? {
            Value::None => Ok(None),
            value => value
                .as_int()
                .map(Some)
                .ok_or_else(|| Error::runtime("slice indices must be integers")),
        },
    }
}

/// Resolves a name through the scope chain, the template reference, the
/// environment globals, and finally the undefined sentinel.
fn resolve_name(state: &mut State<'_, '_>, name: &str) -> Result<Value> {
    if let Some(value) = state.ctx.lookup(name) {
        return Ok(value);
    }
    if name == "self" {
        return Ok(Value::object(SelfRef));
    }
    if let Some(value) = state.env.global(name) {
        return Ok(value);
    }
    Ok(Value::undefined(state.undefined_kind(), name.into()))
}

/// Evaluates one binary operation, with short-circuiting boolean
/// operators returning their deciding operand.
fn eval_binop(state: &mut State<'_, '_>, op: BinOpKind, left: &Ex, right: &Ex) -> Result<Value> {
    match op {
        BinOpKind::And => {
            let left = eval(state, left)?;
            if left.is_true()? { eval(state, right) } else { Ok(left) }
        }
        BinOpKind::Or => {
            let left = eval(state, left)?;
            if left.is_true()? { Ok(left) } else { eval(state, right) }
        }
        _ => {
            let left = eval(state, left)?;
            let right = eval(state, right)?;
            match op {
                BinOpKind::Add => ops::add(&left, &right),
                BinOpKind::Sub => ops::sub(&left, &right),
                BinOpKind::Mul => ops::mul(&left, &right),
                BinOpKind::Div => ops::div(&left, &right),
                BinOpKind::FloorDiv => ops::floordiv(&left, &right),
                BinOpKind::Mod => ops::rem(&left, &right),
                BinOpKind::Pow => ops::pow(&left, &right),
                BinOpKind::And | BinOpKind::Or => unreachable!("handled above"),
            }
        }
    }
}

/// Evaluates one link of a comparison chain.
fn eval_comparison(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    use std::cmp::Ordering;
    Ok(match op {
        CmpOp::Eq => ops::eq(left, right),
        CmpOp::Ne => !ops::eq(left, right),
        CmpOp::Lt => ops::cmp(left, right)? == Ordering::Less,
        CmpOp::Le => ops::cmp(left, right)? != Ordering::Greater,
        CmpOp::Gt => ops::cmp(left, right)? == Ordering::Greater,
        CmpOp::Ge => ops::cmp(left, right)? != Ordering::Less,
        CmpOp::In => ops::contains(right, left)?,
        CmpOp::NotIn => !ops::contains(right, left)?,
    })
}

/// Builds runtime call arguments, expanding `*args` and `**kwargs`.
pub(crate) fn build_args(state: &mut State<'_, '_>, args: &CallArgsIr) -> Result<CallArgs> {
    let mut out = CallArgs::default();
    for arg in &args.positional {
        out.positional.push(eval(state, arg)?);
    }
    if let Some(rest) = &args.var_args {
        let rest = eval(state, rest)?;
        out.positional.extend(rest.try_iter()?);
    }
    for (name, arg) in &args.named {
        out.named.insert(Rc::clone(name), eval(state, arg)?);
    }
    if let Some(rest) = &args.var_kwargs {
        let rest = eval(state, rest)?;
        match rest {
            Value::Map(map) => {
                for (key, value) in map.iter() {
                    match key {
                        Key::Str(name) => {
                            out.named.insert(Rc::clone(name), value.clone());
                        }
                        other => {
                            return Err(Error::runtime(format!(
                                "keyword argument names must be strings, got {other}"
                            )));
                        }
                    }
                }
            }
            other => {
                return Err(Error::runtime(format!(
                    "** expansion requires a mapping, got {}",
                    other.type_name()
                )));
            }
        }
    }
    Ok(out)
}

/// Calls a callable value.
pub(crate) fn call_value(state: &mut State<'_, '_>, callee: &Value, args: CallArgs) -> Result<Value> {
    match callee {
        Value::Dynamic(obj) => obj.call(state, args),
        Value::Undefined(undef) => Err(undef.fail("call").into()),
        other => Err(Error::runtime(format!(
            "type error: {} object is not callable",
            other.type_name()
        ))),
    }
}

/// Evaluates a call expression with an injected `caller` argument, for
/// `{% call %}` blocks.
pub(crate) fn eval_call_with_caller(
    state: &mut State<'_, '_>,
    call: &Ex,
    caller: Value,
) -> Result<Value> {
    let Ex::Call { callee, args, line } = call else {
        return Err(Error::runtime("expected a call expression"));
    };
    let callee = eval(state, callee)?;
    let mut args = build_args(state, args)?;
    args.named.insert("caller".into(), caller);
    call_value(state, &callee, args).map_err(|err| err.locate(&state.name, *line))
}

/// Applies one compiled filter to a value.
pub(crate) fn apply_filter(
    state: &mut State<'_, '_>,
    filter: &FilterIr,
    value: Value,
) -> Result<Value> {
    dispatch_filter(state, &filter.name, value, &filter.args, filter.line)
}

/// Looks a filter up and invokes it.
fn dispatch_filter(
    state: &mut State<'_, '_>,
    name: &str,
    value: Value,
    args: &CallArgsIr,
    line: u32,
) -> Result<Value> {
    let args = build_args(state, args)?;
    let filter = state
        .env
        .get_filter(name)
        .ok_or_else(|| Error::runtime(format!("no filter named '{name}'")))?;
    filter(state, value, args).map_err(|err| err.locate(&state.name, line))
}
