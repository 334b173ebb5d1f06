//! The per-render context: variable scopes, block chains, the eval
//! context, and the parent-template slot.

use crate::compile::code::BlockDef;
use crate::environment::CompiledTemplate;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

/// One layer of the variable scope stack.
pub(crate) type Scope = IndexMap<Rc<str>, Value>;

/// The mutable evaluation flags, saved and restored at scope boundaries.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EvalContext {
    /// Whether expression output is escaped.
    pub autoescape: bool,
    /// Whether the autoescape setting may change at runtime, forcing
    /// per-write decisions.
    pub volatile: bool,
}

/// The per-render state shared by every frame of one render.
pub(crate) struct Context {
    /// The variable scope stack; index 0 holds the render variables and
    /// toplevel assignments.
    scopes: Vec<Scope>,
    /// Block definition chains by name, innermost child first.
    pub blocks: HashMap<Rc<str>, Vec<Rc<BlockDef>>>,
    /// The evaluation flags.
    pub eval: EvalContext,
    /// The pending parent template, set by `extends`.
    pub parent: Option<Rc<CompiledTemplate>>,
    /// Names the template exposes when imported as a module.
    pub exported: BTreeSet<Rc<str>>,
}

impl Context {
    /// Creates a context over the given render variables.
    pub fn new(vars: Scope, autoescape: bool) -> Self {
        Self {
            scopes: vec![vars],
            blocks: HashMap::new(),
            eval: EvalContext {
                autoescape,
                volatile: false,
            },
            parent: None,
            exported: BTreeSet::new(),
        }
    }

    /// Installs a template's own block definitions.
    pub fn install_blocks(&mut self, template: &CompiledTemplate) {
        for (name, def) in &template.program.blocks {
            self.blocks
                .entry(Rc::clone(name))
                .or_default()
                .push(Rc::clone(def));
        }
    }

    /// Appends a parent template's block definitions after the child's.
    ///
    /// Chains push at the end, so the child's definitions stay innermost
    /// and `super()` walks outwards.
    pub fn append_parent_blocks(&mut self, parent: &CompiledTemplate) {
        self.install_blocks(parent);
    }

    /// Looks a name up through the scope chain, innermost first.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
    }

    /// Assigns a name in the innermost scope.
    pub fn set(&mut self, name: Rc<str>, value: Value) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(name, value);
    }

    /// True while assignments land in the toplevel scope, where they
    /// become exported names.
    pub fn at_toplevel(&self) -> bool {
        self.scopes.len() == 1
    }

    /// Pushes a fresh scope.
    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Pops the innermost scope.
    pub fn pop_scope(&mut self) {
        self.scopes.pop();
        debug_assert!(!self.scopes.is_empty());
    }

    /// A clone of the current scope stack, captured by macro closures.
    pub fn snapshot(&self) -> Vec<Scope> {
        self.scopes.clone()
    }

    /// Replaces the scope stack, returning the old one.
    pub fn swap_scopes(&mut self, scopes: Vec<Scope>) -> Vec<Scope> {
        std::mem::replace(&mut self.scopes, scopes)
    }

    /// Restricts the scope stack to the toplevel scope, returning the
    /// detached tail for later restoration.
    ///
    /// Used when invoking a non-`scoped` block, which must not see the
    /// invocation site's locals.
    pub fn isolate(&mut self) -> Vec<Scope> {
        self.scopes.split_off(1)
    }

    /// Reattaches scopes detached by [`Self::isolate`].
    pub fn restore(&mut self, tail: Vec<Scope>) {
        self.scopes.extend(tail);
    }

    /// The toplevel scope, for module export collection.
    pub fn toplevel_scope(&self) -> &Scope {
        &self.scopes[0]
    }

    /// Flattens the scope stack into one map, innermost bindings winning.
    ///
    /// Used to seed the root scope of `with context` includes and imports.
    pub fn flatten(&self) -> Scope {
        let mut flat = Scope::new();
        for scope in &self.scopes {
            for (name, value) in scope {
                flat.insert(Rc::clone(name), value.clone());
            }
        }
        flat
    }
}
