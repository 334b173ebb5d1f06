//! Dynamic runtime objects: macros, block references, and template
//! modules.

use super::State;
use super::context::Scope;
use crate::compile::code::MacroDef;
use crate::error::Result;
use crate::value::{CallArgs, Object, Value};
use indexmap::IndexMap;
use std::rc::{Rc, Weak};

/// A user-defined macro bound to the scopes it was defined in.
#[derive(Debug)]
pub(crate) struct MacroValue {
    /// The compiled definition.
    pub def: Rc<MacroDef>,
    /// Default values, evaluated at definition time.
    pub defaults: Vec<Value>,
    /// The captured scope stack of the defining frame.
    pub closure: Vec<Scope>,
    /// A weak self-handle so the body can see its own name.
    self_weak: Weak<MacroValue>,
}

impl MacroValue {
    /// Creates a macro value with a working self-handle.
    pub fn new(def: Rc<MacroDef>, defaults: Vec<Value>, closure: Vec<Scope>) -> Rc<dyn Object> {
        Rc::new_cyclic(|weak| Self {
            def,
            defaults,
            closure,
            self_weak: weak.clone(),
        })
    }

    /// The macro as a value, bound inside its own body for recursion.
    pub fn self_value(&self) -> Value {
        match self.self_weak.upgrade() {
            Some(rc) => Value::Dynamic(rc),
            None => Value::None,
        }
    }
}

impl Object for MacroValue {
    fn kind(&self) -> &'static str {
        "macro"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::Str(Rc::clone(&self.def.name))),
            "arguments" => Some(Value::Tuple(Rc::new(
                self.def
                    .params
                    .iter()
                    .map(|p| Value::Str(Rc::clone(p)))
                    .collect(),
            ))),
            "catch_kwargs" => Some(Value::Bool(self.def.accepts_kwargs)),
            "catch_varargs" => Some(Value::Bool(self.def.accepts_varargs)),
            "caller" => Some(Value::Bool(self.def.accepts_caller)),
            _ => None,
        }
    }

    fn call(&self, state: &mut State<'_, '_>, args: CallArgs) -> Result<Value> {
        state.call_macro(self, args)
    }

    fn write_display(&self, out: &mut String) {
        out.push_str("<macro ");
        out.push_str(&self.def.name);
        out.push('>');
    }
}

/// The callable bound to `super` inside a block with a parent definition.
#[derive(Debug)]
pub(crate) struct SuperRef {
    /// The block name.
    pub name: Rc<str>,
    /// The chain index of the next-outer definition.
    pub index: usize,
}

impl Object for SuperRef {
    fn kind(&self) -> &'static str {
        "super"
    }

    fn call(&self, state: &mut State<'_, '_>, _args: CallArgs) -> Result<Value> {
        // The derived context keeps flowing: no isolation on the way up.
        state.invoke_block_captured(&self.name, self.index, false)
    }

    fn write_display(&self, out: &mut String) {
        out.push_str("<super: ");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// The `self` template reference: exposes every block as a callable
/// attribute.
#[derive(Debug)]
pub(crate) struct SelfRef;

impl Object for SelfRef {
    fn kind(&self) -> &'static str {
        "template reference"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        Some(Value::object(BlockRef { name: name.into() }))
    }
}

/// A callable rendering the innermost definition of a named block.
#[derive(Debug)]
pub(crate) struct BlockRef {
    /// The block name.
    name: Rc<str>,
}

impl Object for BlockRef {
    fn kind(&self) -> &'static str {
        "block reference"
    }

    fn call(&self, state: &mut State<'_, '_>, _args: CallArgs) -> Result<Value> {
        state.invoke_block_captured(&self.name, 0, true)
    }
}

/// A rendered template used as a module: exposes its toplevel exports and
/// macros as attributes.
#[derive(Debug)]
pub(crate) struct ModuleObject {
    /// The template name.
    pub name: Rc<str>,
    /// The exported names, in export order.
    pub fields: IndexMap<Rc<str>, Value>,
    /// The rendered body, reusable by `include`-like consumers.
    pub body: String,
}

impl Object for ModuleObject {
    fn kind(&self) -> &'static str {
        "module"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        if name == "_body_stream" {
            return Some(Value::Seq(Rc::new(vec![Value::safe(
                self.body.as_str(),
            )])));
        }
        self.fields.get(name).cloned()
    }

    fn write_display(&self, out: &mut String) {
        out.push_str("<module '");
        out.push_str(&self.name);
        out.push_str("'>");
    }
}

/// A host function exposed to templates as a global or helper.
pub(crate) struct FuncValue {
    /// The function name, for diagnostics.
    pub name: &'static str,
    /// The implementation.
    pub f: Box<dyn Fn(&mut State<'_, '_>, CallArgs) -> Result<Value>>,
}

impl std::fmt::Debug for FuncValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncValue").field("name", &self.name).finish()
    }
}

impl Object for FuncValue {
    fn kind(&self) -> &'static str {
        "function"
    }

    fn call(&self, state: &mut State<'_, '_>, args: CallArgs) -> Result<Value> {
        (self.f)(state, args)
    }

    fn write_display(&self, out: &mut String) {
        out.push_str("<function ");
        out.push_str(self.name);
        out.push('>');
    }
}
