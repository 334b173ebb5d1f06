//! The uniform runtime value model.
//!
//! Every piece of data a template can touch is a [`Value`]. Scalars are
//! stored inline; aggregates are reference-counted so that cloning a value is
//! always cheap. Mappings and namespaces preserve insertion order, which is
//! observable through iteration.

use crate::error::{Error, Result, UndefinedError};
use crate::render::State;
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub(crate) mod ops;
mod undefined;

pub use undefined::UndefinedKind;
pub(crate) use undefined::Undefined;

/// An ordered mapping from keys to values.
pub type ValueMap = IndexMap<Key, Value>;

/// A uniform runtime value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The null value.
    #[default]
    None,
    /// A boolean.
    Bool(bool),
    /// A machine-width integer.
    Int(i64),
    /// An integer that does not fit in a machine word. Arithmetic promotes
    /// to this variant on overflow and demotes opportunistically.
    BigInt(Rc<BigInt>),
    /// A floating point number.
    Float(f64),
    /// A Unicode string.
    Str(Rc<str>),
    /// A string already safe for the output medium; escaping is a no-op.
    Safe(Rc<str>),
    /// An ordered, immutable-from-template sequence.
    Seq(Rc<Vec<Value>>),
    /// An immutable sequence with tuple display semantics.
    Tuple(Rc<Vec<Value>>),
    /// An ordered mapping.
    Map(Rc<ValueMap>),
    /// A mutable attribute bag created by the `namespace()` global.
    Namespace(Rc<Namespace>),
    /// A dynamic object: a macro, loop context, module, host function, or
    /// other engine-provided behavior bundle.
    Dynamic(Rc<dyn Object>),
    /// The sentinel for failed lookups; behavior depends on the configured
    /// [`UndefinedKind`].
    Undefined(Rc<Undefined>),
}

/// A hashable mapping key: strings or a small set of scalar values.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Key {
    /// The null key.
    None,
    /// A boolean key.
    Bool(bool),
    /// An integer key.
    Int(i64),
    /// A string key.
    Str(Rc<str>),
}

impl Key {
    /// Converts a runtime value into a key, failing for unhashable values.
    pub(crate) fn try_from_value(value: &Value) -> Result<Self> {
        match value {
            Value::None => Ok(Self::None),
            Value::Bool(v) => Ok(Self::Bool(*v)),
            Value::Int(v) => Ok(Self::Int(*v)),
            Value::Str(s) | Value::Safe(s) => Ok(Self::Str(Rc::clone(s))),
            Value::Float(v) if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 =>
            {
                #[allow(clippy::cast_possible_truncation)]
                Ok(Self::Int(*v as i64))
            }
            other => Err(Error::runtime(format!(
                "cannot use {} as a mapping key",
                other.type_name()
            ))),
        }
    }

    /// The key as a value.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(v) => Value::Bool(*v),
            Self::Int(v) => Value::Int(*v),
            Self::Str(s) => Value::Str(Rc::clone(s)),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// A mutable attribute bag.
///
/// This is the only value whose attributes may be assigned from a template
/// (`{% set ns.attr = ... %}`).
#[derive(Debug, Default)]
pub struct Namespace {
    /// The attribute storage.
    fields: RefCell<IndexMap<Rc<str>, Value>>,
}

impl Namespace {
    /// Creates a namespace from initial attributes.
    pub(crate) fn new(fields: IndexMap<Rc<str>, Value>) -> Self {
        Self {
            fields: RefCell::new(fields),
        }
    }

    /// Reads an attribute.
    pub(crate) fn get(&self, name: &str) -> Option<Value> {
        self.fields.borrow().get(name).cloned()
    }

    /// Writes an attribute.
    pub(crate) fn set(&self, name: Rc<str>, value: Value) {
        self.fields.borrow_mut().insert(name, value);
    }
}

/// Call arguments for macros, host functions, and dynamic objects.
///
/// Keyword arguments preserve their written order.
#[derive(Debug, Default)]
pub struct CallArgs {
    /// Positional arguments.
    pub positional: Vec<Value>,
    /// Keyword arguments.
    pub named: IndexMap<Rc<str>, Value>,
}

impl CallArgs {
    /// Creates an argument pack from positional arguments only.
    pub(crate) fn positional(args: Vec<Value>) -> Self {
        Self {
            positional: args,
            named: IndexMap::new(),
        }
    }

    /// Removes and returns a named argument.
    pub(crate) fn take_named(&mut self, name: &str) -> Option<Value> {
        self.named.shift_remove(name)
    }
}

/// Behavior bundle for dynamic runtime objects.
///
/// Macros, loop contexts, template modules, and host-supplied callables all
/// live behind this trait so the value model stays closed.
pub trait Object: fmt::Debug {
    /// A short name for the object's type, used in error messages.
    fn kind(&self) -> &'static str;

    /// Reads an attribute, or `None` when the attribute does not exist.
    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Calls the object.
    fn call(&self, _state: &mut State<'_, '_>, _args: CallArgs) -> Result<Value> {
        Err(Error::runtime(format!(
            "{} object is not callable",
            self.kind()
        )))
    }

    /// The boolean interpretation of the object.
    fn is_true(&self) -> bool {
        true
    }

    /// The number of items in the object, when it has a length.
    fn len(&self) -> Option<usize> {
        None
    }

    /// Writes the display form of the object.
    fn write_display(&self, out: &mut String) {
        out.push('<');
        out.push_str(self.kind());
        out.push('>');
    }
}

impl Value {
    /// Creates a string value marked safe for the output medium.
    pub fn safe(s: impl Into<Rc<str>>) -> Self {
        Self::Safe(s.into())
    }

    /// Creates a dynamic object value.
    pub fn object(object: impl Object + 'static) -> Self {
        Self::Dynamic(Rc::new(object))
    }

    /// Creates an undefined value for the given unresolved name.
    pub(crate) fn undefined(kind: UndefinedKind, name: Rc<str>) -> Self {
        Self::Undefined(Rc::new(Undefined::new(kind, name)))
    }

    /// Creates an undefined value with an explicit message.
    pub(crate) fn undefined_hint(kind: UndefinedKind, hint: String) -> Self {
        Self::Undefined(Rc::new(Undefined::with_hint(kind, hint)))
    }

    /// A short name for the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::BigInt(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) | Self::Safe(_) => "string",
            Self::Seq(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Map(_) => "dict",
            Self::Namespace(_) => "namespace",
            Self::Dynamic(obj) => obj.kind(),
            Self::Undefined(_) => "undefined",
        }
    }

    /// A description of the value used as the parent part of lookup-path
    /// error messages.
    fn describe(&self) -> String {
        format!("{} object", self.type_name())
    }

    /// True if the value is the undefined sentinel.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined(_))
    }

    /// True if the value is null.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// True if the value is a string carrying the safety tag.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Safe(_))
    }

    /// The value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a sequence slice, if it is one.
    pub(crate) fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Seq(items) | Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// The value as an integer, if it is integral.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::BigInt(v) => v.to_i64(),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// The value as a float, if it is numeric.
    pub(crate) fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::BigInt(v) => v.to_f64(),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }

    /// The boolean interpretation of the value.
    ///
    /// Empty strings, sequences, and mappings are false, as are zero and
    /// null. A strict undefined refuses the question.
    pub fn is_true(&self) -> Result<bool, UndefinedError> {
        Ok(match self {
            Self::None => false,
            Self::Bool(v) => *v,
            Self::Int(v) => *v != 0,
            Self::BigInt(v) => !num_traits::Zero::is_zero(&**v),
            Self::Float(v) => *v != 0.0,
            Self::Str(s) | Self::Safe(s) => !s.is_empty(),
            Self::Seq(items) | Self::Tuple(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::Namespace(_) => true,
            Self::Dynamic(obj) => obj.is_true(),
            Self::Undefined(undef) => undef.to_bool()?,
        })
    }

    /// The number of items in the value, when it has a length.
    pub(crate) fn len(&self) -> Option<usize> {
        match self {
            Self::Str(s) | Self::Safe(s) => Some(s.chars().count()),
            Self::Seq(items) | Self::Tuple(items) => Some(items.len()),
            Self::Map(map) => Some(map.len()),
            Self::Dynamic(obj) => obj.len(),
            _ => None,
        }
    }

    /// True if `self` and `other` are the same object (or identical
    /// scalar), for the `sameas` test.
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) | (Self::Safe(a), Self::Safe(b)) => Rc::ptr_eq(a, b),
            (Self::Seq(a), Self::Seq(b)) | (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::Map(a), Self::Map(b)) => Rc::ptr_eq(a, b),
            (Self::Namespace(a), Self::Namespace(b)) => Rc::ptr_eq(a, b),
            (Self::Dynamic(a), Self::Dynamic(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Reads an attribute of the value.
    ///
    /// Mappings treat string attributes as item lookups. Missing attributes
    /// produce an undefined value carrying the lookup path rather than an
    /// immediate error.
    pub(crate) fn get_attr(&self, kind: UndefinedKind, name: &str) -> Result<Value> {
        let name_rc: Rc<str> = name.into();
        Ok(match self {
            Self::Map(map) => match map.get(&Key::Str(Rc::clone(&name_rc))) {
                Some(value) => value.clone(),
                None => self.missing_attr(kind, name_rc),
            },
            Self::Namespace(ns) => match ns.get(name) {
                Some(value) => value,
                None => self.missing_attr(kind, name_rc),
            },
            Self::Dynamic(obj) => match obj.get_attr(name) {
                Some(value) => value,
                None => self.missing_attr(kind, name_rc),
            },
            Self::Undefined(undef) => Self::Undefined(Rc::new(undef.chain(name_rc)?)),
            _ => self.missing_attr(kind, name_rc),
        })
    }

    /// Builds the undefined value for a missing attribute.
    fn missing_attr(&self, kind: UndefinedKind, name: Rc<str>) -> Value {
        Self::Undefined(Rc::new(Undefined::attribute(kind, name, self.describe())))
    }

    /// Reads an item of the value by key or index.
    pub(crate) fn get_item(&self, kind: UndefinedKind, index: &Value) -> Result<Value> {
        match self {
            Self::Seq(items) | Self::Tuple(items) => {
                if let Some(idx) = index.as_int() {
                    if let Some(value) = lookup_index(items, idx) {
                        return Ok(value.clone());
                    }
                    return Ok(self.missing_attr(kind, format!("{idx}").into()));
                }
            }
            Self::Map(map) => {
                if let Ok(key) = Key::try_from_value(index) {
                    if let Some(value) = map.get(&key) {
                        return Ok(value.clone());
                    }
                    return Ok(self.missing_attr(kind, key.to_string().into()));
                }
            }
            Self::Str(s) | Self::Safe(s) => {
                if let Some(idx) = index.as_int() {
                    let count = s.chars().count();
                    if let Some(offset) = resolve_index(idx, count) {
                        let ch: String = s.chars().skip(offset).take(1).collect();
                        return Ok(Value::from(ch));
                    }
                    return Ok(self.missing_attr(kind, format!("{idx}").into()));
                }
            }
            Self::Namespace(_) | Self::Dynamic(_) => {
                if let Some(name) = index.as_str() {
                    return self.get_attr(kind, name);
                }
            }
            Self::Undefined(undef) => {
                return Ok(Self::Undefined(Rc::new(
                    undef.chain(index.to_display_string().into())?,
                )));
            }
            _ => {}
        }
        Ok(self.missing_attr(kind, index.to_display_string().into()))
    }

    /// Materializes the value into a sequence of iteration items.
    ///
    /// Mappings iterate over their keys, strings over their characters.
    /// Non-iterable values are a type error.
    pub(crate) fn try_iter(&self) -> Result<Vec<Value>> {
        match self {
            Self::Seq(items) | Self::Tuple(items) => Ok(items.as_ref().clone()),
            Self::Map(map) => Ok(map.keys().map(Key::to_value).collect()),
            Self::Str(s) | Self::Safe(s) => {
                Ok(s.chars().map(|c| Value::from(c.to_string())).collect())
            }
            Self::Undefined(undef) => Err(undef.fail("iterate").into()),
            other => Err(Error::runtime(format!(
                "type error: {} object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// The display form of the value, as `{{ value }}` would print with
    /// autoescaping off.
    pub(crate) fn to_display_string(&self) -> String {
        let mut out = String::new();
        self.write_display(&mut out);
        out
    }

    /// Writes the display form of the value.
    pub(crate) fn write_display(&self, out: &mut String) {
        match self {
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(v) => {
                out.push_str(&v.to_string());
            }
            Self::BigInt(v) => {
                out.push_str(&v.to_string());
            }
            Self::Float(v) => out.push_str(&fmt_float(*v)),
            Self::Str(s) | Self::Safe(s) => out.push_str(s),
            Self::Seq(_) | Self::Tuple(_) | Self::Map(_) => self.write_repr(out),
            Self::Namespace(_) => out.push_str("<namespace>"),
            Self::Dynamic(obj) => obj.write_display(out),
            // Strict undefined display failures are caught in the output
            // path; a bare Display cannot fail, so fall back to empty.
            Self::Undefined(undef) => out.push_str(&undef.to_output().unwrap_or_default()),
        }
    }

    /// Writes the canonical (repr) form of the value, used inside rendered
    /// containers.
    pub(crate) fn write_repr(&self, out: &mut String) {
        match self {
            Self::Str(s) | Self::Safe(s) => {
                out.push('\'');
                for c in s.chars() {
                    match c {
                        '\'' => out.push_str("\\'"),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\t' => out.push_str("\\t"),
                        '\r' => out.push_str("\\r"),
                        c => out.push(c),
                    }
                }
                out.push('\'');
            }
            Self::Seq(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out);
                }
                out.push(']');
            }
            Self::Tuple(items) => {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Self::Map(map) => {
                out.push('{');
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.to_value().write_repr(out);
                    out.push_str(": ");
                    value.write_repr(out);
                }
                out.push('}');
            }
            other => other.write_display(out),
        }
    }
}

/// Resolves a possibly-negative index against a collection length.
pub(crate) fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len_i = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len_i } else { index };
    if (0..len_i).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

/// Looks up a possibly-negative index in a slice.
fn lookup_index(items: &[Value], index: i64) -> Option<&Value> {
    resolve_index(index, items.len()).map(|i| &items[i])
}

/// Formats a float the way the template language prints it: `1.0` keeps its
/// decimal point, exponents render with an explicit sign, and non-finite
/// values use lowercase words.
pub(crate) fn fmt_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let mut buffer = ryu::Buffer::new();
    let formatted = buffer.format_finite(v);
    match formatted.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => formatted.to_string(),
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        i64::try_from(v).map_or_else(|_| Self::BigInt(Rc::new(BigInt::from(v))), Self::Int)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Seq(Rc::new(v))
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Self::Map(Rc::new(v))
    }
}

impl From<BigInt> for Value {
    /// Demotes to the machine-width variant when the value fits.
    fn from(v: BigInt) -> Self {
        match v.to_i64() {
            Some(small) => Self::Int(small),
            None => Self::BigInt(Rc::new(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_formatting() {
        assert_eq!(fmt_float(1.0), "1.0");
        assert_eq!(fmt_float(42.5), "42.5");
        assert_eq!(fmt_float(1e30), "1e+30");
        assert_eq!(fmt_float(1e-7), "1e-7");
        assert_eq!(fmt_float(f64::NAN), "nan");
        assert_eq!(fmt_float(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn container_repr() {
        let value = Value::from(vec![
            Value::from(1i64),
            Value::from("a'b"),
            Value::Tuple(Rc::new(vec![Value::from(2i64)])),
        ]);
        assert_eq!(value.to_display_string(), "[1, 'a\\'b', (2,)]");
    }

    #[test]
    fn negative_indexing() {
        let seq = Value::from(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]);
        let item = seq
            .get_item(UndefinedKind::Default, &Value::from(-1i64))
            .unwrap();
        assert_eq!(item.as_int(), Some(3));
        let missing = seq
            .get_item(UndefinedKind::Default, &Value::from(5i64))
            .unwrap();
        assert!(missing.is_undefined());
    }

    #[test]
    fn mapping_iteration_yields_keys_in_order() {
        let mut map = ValueMap::new();
        map.insert(Key::from("b"), Value::from(1i64));
        map.insert(Key::from("a"), Value::from(2i64));
        let keys = Value::from(map).try_iter().unwrap();
        assert_eq!(keys[0].as_str(), Some("b"));
        assert_eq!(keys[1].as_str(), Some("a"));
    }

    #[test]
    fn iterating_an_int_is_a_type_error() {
        let err = Value::from(3i64).try_iter().unwrap_err();
        assert!(err.to_string().contains("not iterable"));
    }
}
