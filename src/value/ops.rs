//! Binary and unary operator semantics over runtime values.
//!
//! Integer arithmetic runs on `i64` and promotes to a big integer on
//! overflow; results demote back to the machine width when they fit. Mixed
//! integer/float arithmetic coerces to float. Undefined operands fail before
//! any coercion happens.

use super::{Key, Value, resolve_index};
use crate::error::{Error, Result};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::rc::Rc;

/// Numeric operand pairs after type coercion.
enum Coerced {
    /// Both operands fit machine integers.
    Ints(i64, i64),
    /// At least one operand was a big integer.
    Bigs(BigInt, BigInt),
    /// At least one operand was a float.
    Floats(f64, f64),
}

/// Coerces two values into a common numeric representation.
///
/// Booleans participate as 0/1, matching the value model's boolean
/// coercion rules.
fn coerce(a: &Value, b: &Value) -> Option<Coerced> {
    match (a, b) {
        (Value::Float(_), _) | (_, Value::Float(_)) => Some(Coerced::Floats(a.as_float()?, b.as_float()?)),
        (Value::BigInt(x), Value::BigInt(y)) => Some(Coerced::Bigs((**x).clone(), (**y).clone())),
        (Value::BigInt(x), _) => Some(Coerced::Bigs((**x).clone(), BigInt::from(int_of(b)?))),
        (_, Value::BigInt(y)) => Some(Coerced::Bigs(BigInt::from(int_of(a)?), (**y).clone())),
        _ => Some(Coerced::Ints(int_of(a)?, int_of(b)?)),
    }
}

/// The integer behind an int-like value.
fn int_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(*v),
        Value::Bool(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Fails if either operand is undefined, naming the operation.
fn reject_undefined(op: &str, a: &Value, b: &Value) -> Result {
    for value in [a, b] {
        if let Value::Undefined(undef) = value {
            return Err(undef.fail(op).into());
        }
    }
    Ok(())
}

/// The error for operands an operator does not support.
fn unsupported(op: &str, a: &Value, b: &Value) -> Error {
    Error::runtime(format!(
        "type error: unsupported operand types for {op}: {} and {}",
        a.type_name(),
        b.type_name()
    ))
}

/// Addition: numbers, string concatenation, and sequence concatenation.
pub(crate) fn add(a: &Value, b: &Value) -> Result<Value> {
    reject_undefined("add", a, b)?;
    match (a, b) {
        (Value::Str(_) | Value::Safe(_), Value::Str(_) | Value::Safe(_)) => {
            let text = format!("{}{}", a.as_str().unwrap(), b.as_str().unwrap());
            Ok(if a.is_safe() && b.is_safe() {
                Value::safe(text)
            } else {
                Value::from(text)
            })
        }
        (Value::Seq(x), Value::Seq(y)) => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            Ok(Value::from(items))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            Ok(Value::Tuple(Rc::new(items)))
        }
        _ => match coerce(a, b) {
            Some(Coerced::Ints(x, y)) => Ok(x
                .checked_add(y)
                .map_or_else(|| Value::from(BigInt::from(x) + BigInt::from(y)), Value::Int)),
            Some(Coerced::Bigs(x, y)) => Ok(Value::from(x + y)),
            Some(Coerced::Floats(x, y)) => Ok(Value::Float(x + y)),
            None => Err(unsupported("+", a, b)),
        },
    }
}

/// Subtraction.
pub(crate) fn sub(a: &Value, b: &Value) -> Result<Value> {
    reject_undefined("subtract", a, b)?;
    match coerce(a, b) {
        Some(Coerced::Ints(x, y)) => Ok(x
            .checked_sub(y)
            .map_or_else(|| Value::from(BigInt::from(x) - BigInt::from(y)), Value::Int)),
        Some(Coerced::Bigs(x, y)) => Ok(Value::from(x - y)),
        Some(Coerced::Floats(x, y)) => Ok(Value::Float(x - y)),
        None => Err(unsupported("-", a, b)),
    }
}

/// Multiplication: numbers, plus string and sequence repetition.
pub(crate) fn mul(a: &Value, b: &Value) -> Result<Value> {
    reject_undefined("multiply", a, b)?;
    match (a, b) {
        (Value::Str(_) | Value::Safe(_), Value::Int(n))
        | (Value::Int(n), Value::Str(_) | Value::Safe(_)) => {
            let text = a.as_str().or_else(|| b.as_str()).unwrap();
            let repeated = text.repeat(usize::try_from((*n).max(0)).unwrap_or(0));
            Ok(if a.is_safe() || b.is_safe() {
                Value::safe(repeated)
            } else {
                Value::from(repeated)
            })
        }
        (Value::Seq(items), Value::Int(n)) | (Value::Int(n), Value::Seq(items)) => {
            let count = usize::try_from((*n).max(0)).unwrap_or(0);
            let mut out = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(Value::from(out))
        }
        _ => match coerce(a, b) {
            Some(Coerced::Ints(x, y)) => Ok(x
                .checked_mul(y)
                .map_or_else(|| Value::from(BigInt::from(x) * BigInt::from(y)), Value::Int)),
            Some(Coerced::Bigs(x, y)) => Ok(Value::from(x * y)),
            Some(Coerced::Floats(x, y)) => Ok(Value::Float(x * y)),
            None => Err(unsupported("*", a, b)),
        },
    }
}

/// True division; the result is always a float.
pub(crate) fn div(a: &Value, b: &Value) -> Result<Value> {
    reject_undefined("divide", a, b)?;
    let (x, y) = match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(unsupported("/", a, b)),
    };
    if y == 0.0 {
        return Err(Error::runtime("division by zero"));
    }
    Ok(Value::Float(x / y))
}

/// Floor division; rounds toward negative infinity like the source
/// expression language.
pub(crate) fn floordiv(a: &Value, b: &Value) -> Result<Value> {
    reject_undefined("divide", a, b)?;
    match coerce(a, b) {
        Some(Coerced::Ints(_, 0)) => Err(Error::runtime("division by zero")),
        Some(Coerced::Ints(x, y)) => {
            let quotient = x / y;
            let remainder = x % y;
            Ok(Value::Int(
                if remainder != 0 && (remainder < 0) != (y < 0) {
                    quotient - 1
                } else {
                    quotient
                },
            ))
        }
        Some(Coerced::Bigs(x, y)) => {
            if y.is_zero() {
                return Err(Error::runtime("division by zero"));
            }
            Ok(Value::from(num_integer_div_floor(&x, &y)))
        }
        Some(Coerced::Floats(x, y)) => {
            if y == 0.0 {
                return Err(Error::runtime("division by zero"));
            }
            Ok(Value::Float((x / y).floor()))
        }
        None => Err(unsupported("//", a, b)),
    }
}

/// Floor division over big integers.
fn num_integer_div_floor(x: &BigInt, y: &BigInt) -> BigInt {
    let quotient = x / y;
    let remainder = x % y;
    if !remainder.is_zero() && (remainder.is_negative() != y.is_negative()) {
        quotient - 1
    } else {
        quotient
    }
}

/// Remainder; the result takes the sign of the divisor.
pub(crate) fn rem(a: &Value, b: &Value) -> Result<Value> {
    reject_undefined("divide", a, b)?;
    match coerce(a, b) {
        Some(Coerced::Ints(_, 0)) => Err(Error::runtime("division by zero")),
        Some(Coerced::Ints(x, y)) => {
            let remainder = x % y;
            Ok(Value::Int(
                if remainder != 0 && (remainder < 0) != (y < 0) {
                    remainder + y
                } else {
                    remainder
                },
            ))
        }
        Some(Coerced::Bigs(x, y)) => {
            if y.is_zero() {
                return Err(Error::runtime("division by zero"));
            }
            let remainder = &x % &y;
            Ok(Value::from(
                if !remainder.is_zero() && (remainder.is_negative() != y.is_negative()) {
                    remainder + y
                } else {
                    remainder
                },
            ))
        }
        Some(Coerced::Floats(x, y)) => {
            if y == 0.0 {
                return Err(Error::runtime("division by zero"));
            }
            let remainder = x % y;
            Ok(Value::Float(
                if remainder != 0.0 && (remainder < 0.0) != (y < 0.0) {
                    remainder + y
                } else {
                    remainder
                },
            ))
        }
        None => Err(unsupported("%", a, b)),
    }
}

/// Exponentiation. A negative integer exponent produces a float.
pub(crate) fn pow(a: &Value, b: &Value) -> Result<Value> {
    reject_undefined("raise to a power", a, b)?;
    match coerce(a, b) {
        Some(Coerced::Ints(x, y)) => {
            if y < 0 {
                return Ok(Value::Float((x as f64).powi(
                    i32::try_from(y).map_err(|_| Error::runtime("exponent out of range"))?,
                )));
            }
            let exponent =
                u32::try_from(y).map_err(|_| Error::runtime("exponent out of range"))?;
            Ok(match x.checked_pow(exponent) {
                Some(v) => Value::Int(v),
                None => Value::from(num_traits::Pow::pow(BigInt::from(x), exponent)),
            })
        }
        Some(Coerced::Bigs(x, y)) => {
            if y.is_negative() {
                let (x, y) = (
                    x.to_f64().ok_or_else(|| Error::runtime("exponent out of range"))?,
                    y.to_f64().ok_or_else(|| Error::runtime("exponent out of range"))?,
                );
                return Ok(Value::Float(x.powf(y)));
            }
            let exponent = y
                .to_u32()
                .ok_or_else(|| Error::runtime("exponent out of range"))?;
            Ok(Value::from(num_traits::Pow::pow(x, exponent)))
        }
        Some(Coerced::Floats(x, y)) => Ok(Value::Float(x.powf(y))),
        None => Err(unsupported("**", a, b)),
    }
}

/// Unary negation.
pub(crate) fn neg(value: &Value) -> Result<Value> {
    match value {
        Value::Undefined(undef) => Err(undef.fail("negate").into()),
        Value::Int(v) => Ok(v
            .checked_neg()
            .map_or_else(|| Value::from(-BigInt::from(*v)), Value::Int)),
        Value::BigInt(v) => Ok(Value::from(-(**v).clone())),
        Value::Float(v) => Ok(Value::Float(-v)),
        Value::Bool(v) => Ok(Value::Int(-i64::from(*v))),
        other => Err(Error::runtime(format!(
            "type error: cannot negate {}",
            other.type_name()
        ))),
    }
}

/// Unary plus; a no-op on numbers.
pub(crate) fn pos(value: &Value) -> Result<Value> {
    match value {
        Value::Undefined(undef) => Err(undef.fail("apply unary plus to").into()),
        Value::Int(_) | Value::BigInt(_) | Value::Float(_) => Ok(value.clone()),
        Value::Bool(v) => Ok(Value::Int(i64::from(*v))),
        other => Err(Error::runtime(format!(
            "type error: cannot apply unary plus to {}",
            other.type_name()
        ))),
    }
}

/// Structural equality with cross-type numeric coercion.
pub(crate) fn eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Undefined(_), Value::Undefined(_)) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x) | Value::Safe(x), Value::Str(y) | Value::Safe(y)) => x == y,
        (Value::Seq(x), Value::Seq(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| eq(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, value)| y.get(key).is_some_and(|other| eq(value, other)))
        }
        (Value::Dynamic(x), Value::Dynamic(y)) => Rc::ptr_eq(x, y),
        _ => match coerce(a, b) {
            Some(Coerced::Ints(x, y)) => x == y,
            Some(Coerced::Bigs(x, y)) => x == y,
            #[allow(clippy::float_cmp)]
            Some(Coerced::Floats(x, y)) => x == y,
            None => false,
        },
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        eq(self, other)
    }
}

/// Ordering for comparison operators and sorting.
///
/// Numbers order numerically across representations, strings
/// lexicographically, sequences elementwise. Anything else is a type error.
pub(crate) fn cmp(a: &Value, b: &Value) -> Result<Ordering> {
    reject_undefined("compare", a, b)?;
    match (a, b) {
        (Value::Str(x) | Value::Safe(x), Value::Str(y) | Value::Safe(y)) => Ok(x.cmp(y)),
        (Value::Seq(x), Value::Seq(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            for (item_a, item_b) in x.iter().zip(y.iter()) {
                match cmp(item_a, item_b)? {
                    Ordering::Equal => {}
                    other => return Ok(other),
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => match coerce(a, b) {
            Some(Coerced::Ints(x, y)) => Ok(x.cmp(&y)),
            Some(Coerced::Bigs(x, y)) => Ok(x.cmp(&y)),
            Some(Coerced::Floats(x, y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| Error::runtime("cannot order nan values")),
            None => Err(Error::runtime(format!(
                "type error: '{}' and '{}' are not orderable",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

/// Membership (`in`): substring for strings, key lookup for mappings, and
/// element search for sequences.
pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool> {
    reject_undefined("test membership of", container, item)?;
    match container {
        Value::Str(s) | Value::Safe(s) => match item.as_str() {
            Some(needle) => Ok(s.contains(needle)),
            None => Err(Error::runtime(
                "type error: 'in <string>' requires a string operand",
            )),
        },
        Value::Seq(items) | Value::Tuple(items) => Ok(items.iter().any(|v| eq(v, item))),
        Value::Map(map) => Ok(Key::try_from_value(item)
            .is_ok_and(|key| map.contains_key(&key))),
        other => Err(Error::runtime(format!(
            "type error: {} object is not a container",
            other.type_name()
        ))),
    }
}

/// String concatenation (`~`).
///
/// Both operands are stringified. When autoescaping is active, unsafe pieces
/// are escaped and the result carries the safety tag; otherwise the result
/// is safe only if every operand already was.
pub(crate) fn concat(autoescape: bool, a: &Value, b: &Value) -> Result<Value> {
    let mut out = String::new();
    let mut all_safe = true;
    for value in [a, b] {
        let piece = match value {
            Value::Undefined(undef) => undef.to_output().map_err(Error::from)?,
            other => other.to_display_string(),
        };
        if value.is_safe() || !autoescape {
            all_safe &= value.is_safe();
            out.push_str(&piece);
        } else {
            crate::output::escape_into(&mut out, &piece);
        }
    }
    Ok(if autoescape || all_safe {
        Value::safe(out)
    } else {
        Value::from(out)
    })
}

/// Slicing with optional start, stop, and step.
pub(crate) fn slice(
    value: &Value,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Value> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Error::runtime("slice step cannot be zero"));
    }

    match value {
        Value::Str(s) | Value::Safe(s) => {
            let chars: Vec<char> = s.chars().collect();
            let text: String = slice_indices(chars.len(), start, stop, step)
                .map(|i| chars[i])
                .collect();
            Ok(if value.is_safe() {
                Value::safe(text)
            } else {
                Value::from(text)
            })
        }
        Value::Seq(items) => Ok(Value::from(
            slice_indices(items.len(), start, stop, step)
                .map(|i| items[i].clone())
                .collect::<Vec<_>>(),
        )),
        Value::Tuple(items) => Ok(Value::Tuple(Rc::new(
            slice_indices(items.len(), start, stop, step)
                .map(|i| items[i].clone())
                .collect(),
        ))),
        Value::Undefined(undef) => Err(undef.fail("slice").into()),
        other => Err(Error::runtime(format!(
            "type error: {} object is not sliceable",
            other.type_name()
        ))),
    }
}

/// Computes the element indices selected by a slice.
fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: i64,
) -> impl Iterator<Item = usize> {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |index: i64, max: i64| -> i64 {
        let index = if index < 0 { index + len_i } else { index };
        index.clamp(if step < 0 { -1 } else { 0 }, max)
    };
    let (start, stop) = if step > 0 {
        (
            clamp(start.unwrap_or(0), len_i),
            clamp(stop.unwrap_or(len_i), len_i),
        )
    } else {
        (
            clamp(start.unwrap_or(len_i - 1), len_i - 1),
            clamp(stop.unwrap_or(-len_i - 1), len_i - 1),
        )
    };

    let mut indices = Vec::new();
    let mut index = start;
    while (step > 0 && index < stop) || (step < 0 && index > stop) {
        if let Some(i) = resolve_index(index, len) {
            indices.push(i);
        }
        index += step;
    }
    indices.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Formats a value for assertions with floats normalized.
    fn display(value: &Value) -> String {
        match value {
            Value::Float(v) => super::super::fmt_float(*v),
            other => other.to_display_string(),
        }
    }

    #[test]
    fn integer_overflow_promotes() {
        let result = add(&Value::Int(i64::MAX), &Value::Int(1)).unwrap();
        assert!(matches!(result, Value::BigInt(_)));
        assert_eq!(display(&result), "9223372036854775808");
        // And demotes when the result fits again.
        let back = sub(&result, &Value::Int(1)).unwrap();
        assert!(matches!(back, Value::Int(i64::MAX)));
    }

    #[test]
    fn floor_semantics_match_the_source_language() {
        assert_eq!(
            floordiv(&Value::Int(-7), &Value::Int(2)).unwrap(),
            Value::Int(-4)
        );
        assert_eq!(
            floordiv(&Value::Int(7), &Value::Int(-2)).unwrap(),
            Value::Int(-4)
        );
        assert_eq!(rem(&Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(rem(&Value::Int(7), &Value::Int(-2)).unwrap(), Value::Int(-1));
    }

    #[test]
    fn true_division_is_float() {
        assert_eq!(
            div(&Value::Int(3), &Value::Int(2)).unwrap(),
            Value::Float(1.5)
        );
        assert!(div(&Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn safe_concat_keeps_safety() {
        let safe = add(&Value::safe("<b>"), &Value::safe("</b>")).unwrap();
        assert!(safe.is_safe());
        let demoted = add(&Value::safe("<b>"), &Value::from("x")).unwrap();
        assert!(!demoted.is_safe());
    }

    #[test]
    fn tilde_concat_escapes_under_autoescape() {
        let joined = concat(true, &Value::from("<"), &Value::safe("<b>")).unwrap();
        assert_eq!(joined.as_str(), Some("&lt;<b>"));
        assert!(joined.is_safe());
    }

    #[test]
    fn slices() {
        let seq = Value::from((0..6).map(Value::Int).collect::<Vec<_>>());
        assert_eq!(
            slice(&seq, Some(1), Some(4), None).unwrap(),
            Value::from(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            slice(&seq, None, None, Some(-2)).unwrap(),
            Value::from(vec![Value::Int(5), Value::Int(3), Value::Int(1)])
        );
        assert_eq!(
            slice(&Value::from("hello"), None, Some(-1), None)
                .unwrap()
                .as_str(),
            Some("hell")
        );
    }

    #[test]
    fn chained_comparisons_use_numeric_ordering() {
        assert_eq!(
            cmp(&Value::Int(1), &Value::Float(1.5)).unwrap(),
            Ordering::Less
        );
        assert!(cmp(&Value::Int(1), &Value::from("x")).is_err());
    }

    #[test]
    fn membership() {
        assert!(contains(&Value::from("hello"), &Value::from("ell")).unwrap());
        let mut map = crate::value::ValueMap::new();
        map.insert(Key::from("k"), Value::Int(1));
        assert!(contains(&Value::from(map), &Value::from("k")).unwrap());
        assert!(contains(&Value::Int(1), &Value::Int(1)).is_err());
    }
}
