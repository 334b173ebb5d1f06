//! The template runtime: renders compiled programs against a context.
//!
//! Rendering is single-threaded and strictly top-down. A child template's
//! root runs first; when an `extends` fires, the parent's block definitions
//! are appended after the child's and, once the child's root finishes, the
//! parent's root takes over. Output statements compiled under a conditional
//! `extends` re-check the parent slot at runtime.

use crate::compile::code::{EscapeMode, ExtendsMode, Inst, SetTarget, TargetIr};
use crate::environment::{CompiledTemplate, Environment};
use crate::error::{Error, Result};
use crate::output::Output;
use crate::value::{CallArgs, Key, UndefinedKind, Value, ValueMap};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::rc::Rc;

pub(crate) mod context;
pub(crate) mod eval;
pub(crate) mod loops;
pub(crate) mod objects;

use context::{Context, Scope};
use objects::{MacroValue, SuperRef};

/// The hard limit on template-level recursion (macros, includes, blocks,
/// recursive loops).
const MAX_RECURSION: usize = 500;

/// The display name of a template for diagnostics.
fn display_name(template: &CompiledTemplate) -> Rc<str> {
    template
        .name
        .clone()
        .unwrap_or_else(|| Rc::from("<template>"))
}

/// Renders a compiled template into the given sink.
pub(crate) fn render(
    env: &Environment,
    template: &Rc<CompiledTemplate>,
    vars: Scope,
    out: &mut Output,
) -> Result {
    let mut state = State::new(env, template, vars, out);
    state.run_template(Rc::clone(template))
}

/// Renders a compiled template and returns its module exports.
pub(crate) fn render_module(
    env: &Environment,
    template: &Rc<CompiledTemplate>,
    vars: Scope,
) -> Result<(IndexMap<Rc<str>, Value>, String)> {
    let mut out = Output::new();
    let mut state = State::new(env, template, vars, &mut out);
    state.out.push_capture();
    let result = state.run_template(Rc::clone(template));
    let body = state.out.pop_capture();
    result?;
    let fields = state.collect_exports();
    Ok((fields, body))
}

/// The per-render evaluation state.
///
/// One `State` exists per render; everything the runtime touches flows
/// through it: the environment, the output sink, and the context.
pub struct State<'env, 'out> {
    /// The shared, read-only environment.
    pub(crate) env: &'env Environment,
    /// The output sink.
    pub(crate) out: &'out mut Output,
    /// The per-render context.
    pub(crate) ctx: Context,
    /// The display name of the template currently executing.
    pub(crate) name: Rc<str>,
    /// Template-level recursion depth.
    depth: usize,
}

impl<'env, 'out> State<'env, 'out> {
    /// Creates the state for a fresh render.
    fn new(
        env: &'env Environment,
        template: &Rc<CompiledTemplate>,
        vars: Scope,
        out: &'out mut Output,
    ) -> Self {
        let mut ctx = Context::new(vars, template.program.initial_autoescape);
        ctx.install_blocks(template);
        Self {
            env,
            out,
            ctx,
            name: display_name(template),
            depth: 0,
        }
    }

    /// Creates a minimal state for host-side macro calls outside a
    /// render.
    pub(crate) fn for_host(env: &'env Environment, out: &'out mut Output) -> Self {
        Self {
            env,
            out,
            ctx: Context::new(Scope::new(), env.autoescape_default(None)),
            name: Rc::from("<module>"),
            depth: 0,
        }
    }

    /// Whether autoescaping is currently active.
    pub fn autoescape(&self) -> bool {
        self.ctx.eval.autoescape
    }

    /// The undefined variant configured on the environment.
    pub(crate) fn undefined_kind(&self) -> UndefinedKind {
        self.env.undefined_kind()
    }

    /// Guards against runaway template recursion.
    fn enter(&mut self) -> Result {
        self.depth += 1;
        if self.depth > MAX_RECURSION {
            self.depth -= 1;
            return Err(Error::runtime("template recursion limit exceeded"));
        }
        Ok(())
    }

    /// Leaves a recursion guard.
    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Runs a template's root and then walks up the inheritance chain.
    fn run_template(&mut self, mut current: Rc<CompiledTemplate>) -> Result {
        loop {
            self.exec_body(&current.program.root)?;
            if current.program.extends == ExtendsMode::No {
                debug_assert!(self.ctx.parent.is_none());
                return Ok(());
            }
            match self.ctx.parent.take() {
                Some(parent) => {
                    self.ctx.eval.autoescape = parent.program.initial_autoescape;
                    self.name = display_name(&parent);
                    current = parent;
                }
                None => return Ok(()),
            }
        }
    }

    /// Executes an instruction sequence.
    pub(crate) fn exec_body(&mut self, body: &[Inst]) -> Result {
        for inst in body {
            self.exec_inst(inst)?;
        }
        Ok(())
    }

    /// Executes one instruction.
    fn exec_inst(&mut self, inst: &Inst) -> Result {
        match inst {
            Inst::EmitRaw(text) => {
                self.out.write_str(text);
                Ok(())
            }
            Inst::Emit { expr, escape, line } => {
                let mut value = eval::eval(self, expr)?;
                if let Some(finalize) = self.env.finalize() {
                    value = finalize(self, value).map_err(|err| err.locate(&self.name, *line))?;
                }
                let escape = match escape {
                    EscapeMode::Yes => true,
                    EscapeMode::No => false,
                    EscapeMode::Volatile => self.ctx.eval.autoescape,
                };
                self.out
                    .write_value(&value, escape)
                    .map_err(|err| err.locate(&self.name, *line))
            }
            Inst::Guarded { body } => {
                if self.ctx.parent.is_none() {
                    self.exec_body(body)?;
                }
                Ok(())
            }
            Inst::If {
                arms,
                else_body,
                line,
            } => {
                for (cond, body) in arms {
                    let value = eval::eval(self, cond)?;
                    if value
                        .is_true()
                        .map_err(|err| Error::from(err).locate(&self.name, *line))?
                    {
                        return self.exec_body(body);
                    }
                }
                self.exec_body(else_body)
            }
            Inst::For(def) => {
                let iter_value = eval::eval(self, &def.iter)?;
                self.exec_for(def, iter_value, 0)
                    .map_err(|err| err.locate(&self.name, def.line))
            }
            Inst::Set {
                target,
                value,
                line,
            } => {
                let value = eval::eval(self, value)?;
                self.assign(target, value)
                    .map_err(|err| err.locate(&self.name, *line))
            }
            Inst::SetBlock {
                target,
                filters,
                body,
                line,
            } => {
                let captured = self.capture(|state| state.exec_body(body))?;
                let mut value = if self.ctx.eval.autoescape {
                    Value::safe(captured)
                } else {
                    Value::from(captured)
                };
                for filter in filters {
                    value = eval::apply_filter(self, filter, value)?;
                }
                self.assign(target, value)
                    .map_err(|err| err.locate(&self.name, *line))
            }
            Inst::Macro { def, line } => {
                let value = self
                    .make_macro(def)
                    .map_err(|err| err.locate(&self.name, *line))?;
                self.bind_export(Rc::clone(&def.name), value);
                Ok(())
            }
            Inst::CallBlock { def, call, line } => {
                let caller = self.make_macro(def)?;
                let result = eval::eval_call_with_caller(self, call, caller)
                    .map_err(|err| err.locate(&self.name, *line))?;
                self.out
                    .write_value(&result, self.ctx.eval.autoescape)
                    .map_err(|err| err.locate(&self.name, *line))
            }
            Inst::FilterBlock {
                filters,
                body,
                line,
            } => {
                let captured = self.capture(|state| state.exec_body(body))?;
                let mut value = if self.ctx.eval.autoescape {
                    Value::safe(captured)
                } else {
                    Value::from(captured)
                };
                for filter in filters {
                    value = eval::apply_filter(self, filter, value)?;
                }
                self.out
                    .write_value(&value, self.ctx.eval.autoescape)
                    .map_err(|err| err.locate(&self.name, *line))
            }
            Inst::Block { name, scoped, line } => self
                .invoke_block(name, 0, !scoped)
                .map_err(|err| err.locate(&self.name, *line)),
            Inst::Extends { template, line } => self
                .exec_extends(template)
                .map_err(|err| err.locate(&self.name, *line)),
            Inst::Include {
                template,
                with_context,
                ignore_missing,
                line,
            } => self
                .exec_include(template, *with_context, *ignore_missing)
                .map_err(|err| err.locate(&self.name, *line)),
            Inst::Import {
                template,
                alias,
                with_context,
                line,
            } => {
                let value = eval::eval(self, template)?;
                let module = self
                    .load_module(&value, *with_context)
                    .map_err(|err| err.locate(&self.name, *line))?;
                self.bind_export(Rc::clone(alias), module);
                Ok(())
            }
            Inst::FromImport {
                template,
                names,
                with_context,
                line,
            } => {
                let value = eval::eval(self, template)?;
                let module = self
                    .load_module(&value, *with_context)
                    .map_err(|err| err.locate(&self.name, *line))?;
                for (name, alias) in names {
                    let imported = module
                        .get_attr(self.undefined_kind(), name)
                        .map_err(|err| err.locate(&self.name, *line))?;
                    let imported = if imported.is_undefined() {
                        Value::undefined_hint(
                            self.undefined_kind(),
                            format!(
                                "the template '{}' does not export the requested name '{name}'",
                                value.to_display_string()
                            ),
                        )
                    } else {
                        imported
                    };
                    self.bind_export(Rc::clone(alias), imported);
                }
                Ok(())
            }
            Inst::With {
                bindings,
                body,
                line: _,
            } => {
                self.ctx.push_scope();
                let result = (|| -> Result {
                    for (target, value) in bindings {
                        let value = eval::eval(self, value)?;
                        self.bind_target(target, value)?;
                    }
                    self.exec_body(body)
                })();
                self.ctx.pop_scope();
                result
            }
            Inst::AutoEscape {
                enabled,
                body,
                line,
            } => {
                let saved = self.ctx.eval;
                let value = eval::eval(self, enabled)?;
                self.ctx.eval.autoescape = value
                    .is_true()
                    .map_err(|err| Error::from(err).locate(&self.name, *line))?;
                if enabled.as_const().is_none() {
                    self.ctx.eval.volatile = true;
                }
                let result = self.exec_body(body);
                self.ctx.eval = saved;
                result
            }
        }
    }

    /// Runs a closure with output captured, returning the captured text.
    pub(crate) fn capture(&mut self, f: impl FnOnce(&mut Self) -> Result) -> Result<String> {
        self.out.push_capture();
        let result = f(self);
        let text = self.out.pop_capture();
        result?;
        Ok(text)
    }

    /// Creates a macro value closing over the current scopes.
    fn make_macro(&mut self, def: &Rc<crate::compile::code::MacroDef>) -> Result<Value> {
        let mut defaults = Vec::with_capacity(def.defaults.len());
        for default in &def.defaults {
            defaults.push(eval::eval(self, default)?);
        }
        Ok(Value::Dynamic(MacroValue::new(
            Rc::clone(def),
            defaults,
            self.ctx.snapshot(),
        )))
    }

    /// Assigns through a `set` destination.
    fn assign(&mut self, target: &SetTarget, value: Value) -> Result {
        match target {
            SetTarget::Var(target) => self.bind_target_exported(target, value),
            SetTarget::Attr { name, attr } => {
                let holder = self.ctx.lookup(name).unwrap_or_default();
                match holder {
                    Value::Namespace(ns) => {
                        ns.set(Rc::clone(attr), value);
                        Ok(())
                    }
                    _ => Err(Error::runtime(
                        "cannot assign attribute on non-namespace object",
                    )),
                }
            }
        }
    }

    /// Binds a target, recording exports at the toplevel.
    fn bind_target_exported(&mut self, target: &TargetIr, value: Value) -> Result {
        let export = self.ctx.at_toplevel();
        self.bind_target(target, value)?;
        if export {
            let mut names = Vec::new();
            collect_target_names(target, &mut names);
            for name in names {
                if !name.starts_with('_') {
                    self.ctx.exported.insert(name);
                }
            }
        }
        Ok(())
    }

    /// Binds a name at the current scope, recording it as exported when at
    /// the toplevel.
    fn bind_export(&mut self, name: Rc<str>, value: Value) {
        if self.ctx.at_toplevel() && !name.starts_with('_') {
            self.ctx.exported.insert(Rc::clone(&name));
        }
        self.ctx.set(name, value);
    }

    /// Binds a (possibly unpacking) target.
    pub(crate) fn bind_target(&mut self, target: &TargetIr, value: Value) -> Result {
        match target {
            TargetIr::Name(name) => {
                self.ctx.set(Rc::clone(name), value);
                Ok(())
            }
            TargetIr::Tuple(targets) => {
                let items = value.try_iter()?;
                if items.len() != targets.len() {
                    return Err(Error::runtime(format!(
                        "cannot unpack {} value(s) into {} target(s)",
                        items.len(),
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.bind_target(target, item)?;
                }
                Ok(())
            }
        }
    }

    /// Executes an `extends`: resolves the parent, merges its blocks, and
    /// arms the parent slot.
    fn exec_extends(&mut self, template: &crate::compile::code::Ex) -> Result {
        if self.ctx.parent.is_some() {
            return Err(Error::runtime("extended multiple times"));
        }
        let value = eval::eval(self, template)?;
        let name = value
            .as_str()
            .ok_or_else(|| Error::runtime("extends requires a template name"))?;
        let parent = self.env.get_template_compiled(name)?;
        self.ctx.append_parent_blocks(&parent);
        self.ctx.parent = Some(parent);
        Ok(())
    }

    /// Invokes the block definition at `index` of the named chain.
    ///
    /// `isolate` hides the invocation site's locals from the body; it is
    /// false for `scoped` invocations and for `super()`, which flows the
    /// derived context onwards.
    pub(crate) fn invoke_block(&mut self, name: &str, index: usize, isolate: bool) -> Result {
        self.enter()?;
        let result = self.invoke_block_inner(name, index, isolate);
        self.leave();
        result
    }

    /// The unguarded body of [`Self::invoke_block`].
    fn invoke_block_inner(&mut self, name: &str, index: usize, isolate: bool) -> Result {
        let Some(def) = self
            .ctx
            .blocks
            .get(name)
            .and_then(|chain| chain.get(index))
            .map(Rc::clone)
        else {
            return Err(Error::runtime(format!(
                "block '{name}' is not defined in this template"
            )));
        };
        if index == 0 && def.required {
            return Err(Error::runtime(format!(
                "Required block '{name}' not found"
            )));
        }

        let has_super = self
            .ctx
            .blocks
            .get(name)
            .is_some_and(|chain| chain.len() > index + 1);

        let detached = if isolate {
            Some(self.ctx.isolate())
        } else {
            None
        };
        self.ctx.push_scope();
        if has_super {
            self.ctx.set(
                "super".into(),
                Value::object(SuperRef {
                    name: name.into(),
                    index: index + 1,
                }),
            );
        }
        let result = self.exec_body(&def.body);
        self.ctx.pop_scope();
        if let Some(tail) = detached {
            self.ctx.restore(tail);
        }
        result
    }

    /// Invokes a block with output captured, for `super()` and
    /// `self.block()`.
    pub(crate) fn invoke_block_captured(
        &mut self,
        name: &str,
        index: usize,
        isolate: bool,
    ) -> Result<Value> {
        let text = self.capture(|state| state.invoke_block(name, index, isolate))?;
        Ok(if self.ctx.eval.autoescape {
            Value::safe(text)
        } else {
            Value::from(text)
        })
    }

    /// Executes an `include`.
    fn exec_include(
        &mut self,
        template: &crate::compile::code::Ex,
        with_context: bool,
        ignore_missing: bool,
    ) -> Result {
        let value = eval::eval(self, template)?;
        let resolved = match self.select_template(&value) {
            Ok(resolved) => resolved,
            Err(err @ (Error::NotFound { .. } | Error::NotFoundMultiple { .. }))
                if ignore_missing =>
            {
                log::debug!("ignoring missing include: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.enter()?;
        let root = self.child_root_scope(with_context);
        let result = self.run_in_child(&resolved, root).map(|_| ());
        self.leave();
        result
    }

    /// Resolves a template name value, trying each entry of a sequence in
    /// order.
    fn select_template(&mut self, value: &Value) -> Result<Rc<CompiledTemplate>> {
        if let Some(name) = value.as_str() {
            return self.env.get_template_compiled(name);
        }
        if let Some(names) = value.as_seq() {
            let mut tried = Vec::with_capacity(names.len());
            for name in names {
                let Some(name) = name.as_str() else {
                    return Err(Error::runtime(
                        "template names must be strings",
                    ));
                };
                match self.env.get_template_compiled(name) {
                    Ok(found) => return Ok(found),
                    Err(Error::NotFound { .. }) => tried.push(name.to_string()),
                    Err(err) => return Err(err),
                }
            }
            return Err(Error::NotFoundMultiple { names: tried });
        }
        Err(Error::runtime(format!(
            "expected a template name or list of names, got {}",
            value.type_name()
        )))
    }

    /// Loads a template as a module value.
    fn load_module(&mut self, name_value: &Value, with_context: bool) -> Result<Value> {
        let template = self.select_template(name_value)?;
        self.enter()?;
        let vars = self.child_root_scope(with_context);
        let result = crate::render::render_module(self.env, &template, vars);
        self.leave();
        let (fields, body) = result?;
        Ok(Value::object(objects::ModuleObject {
            name: display_name(&template),
            fields,
            body,
        }))
    }

    /// The root scope for a child render: the caller's flattened variables
    /// when context is shared, empty otherwise.
    fn child_root_scope(&self, with_context: bool) -> Scope {
        if with_context {
            self.ctx.flatten()
        } else {
            Scope::new()
        }
    }

    /// Renders another template against this state's sink, with its own
    /// blocks, exports, and eval context.
    fn run_in_child(
        &mut self,
        template: &Rc<CompiledTemplate>,
        root: Scope,
    ) -> Result<BTreeSet<Rc<str>>> {
        let saved_blocks = std::mem::take(&mut self.ctx.blocks);
        let saved_parent = self.ctx.parent.take();
        let saved_exported = std::mem::take(&mut self.ctx.exported);
        let saved_eval = self.ctx.eval;
        let saved_name = std::mem::replace(&mut self.name, display_name(template));
        let saved_scopes = self.ctx.swap_scopes(vec![root]);

        self.ctx.eval.autoescape = template.program.initial_autoescape;
        self.ctx.eval.volatile = false;
        self.ctx.install_blocks(template);

        let result = self.run_template(Rc::clone(template));

        let exported = std::mem::replace(&mut self.ctx.exported, saved_exported);
        self.ctx.swap_scopes(saved_scopes);
        self.ctx.blocks = saved_blocks;
        self.ctx.parent = saved_parent;
        self.ctx.eval = saved_eval;
        self.name = saved_name;

        result?;
        Ok(exported)
    }

    /// Collects the exported names of a finished module render.
    fn collect_exports(&self) -> IndexMap<Rc<str>, Value> {
        let scope = self.ctx.toplevel_scope();
        let mut fields = IndexMap::new();
        for name in &self.ctx.exported {
            if let Some(value) = scope.get(name) {
                fields.insert(Rc::clone(name), value.clone());
            }
        }
        fields
    }

    /// Calls a macro value.
    pub(crate) fn call_macro(&mut self, mac: &MacroValue, mut args: CallArgs) -> Result<Value> {
        let def = &mac.def;
        let caller = args.take_named("caller");
        if caller.is_some() && !def.accepts_caller {
            return Err(Error::runtime(format!(
                "the macro '{}' does not accept 'caller'",
                def.name
            )));
        }

        let mut scope = Scope::new();
        // The macro's own name is visible inside the body, so recursion
        // works without threading the definition through the context. A
        // parameter of the same name simply shadows it below.
        scope.insert(Rc::clone(&def.name), mac.self_value());

        let mut bound = vec![false; def.params.len()];
        let mut extra_positional = Vec::new();
        for (index, value) in args.positional.drain(..).enumerate() {
            match def.params.get(index) {
                Some(param) => {
                    scope.insert(Rc::clone(param), value);
                    bound[index] = true;
                }
                None => extra_positional.push(value),
            }
        }
        let mut extra_named = ValueMap::new();
        for (name, value) in args.named.drain(..) {
            match def.params.iter().position(|p| **p == *name) {
                Some(index) => {
                    if bound[index] {
                        return Err(Error::runtime(format!(
                            "macro '{}' got multiple values for parameter '{name}'",
                            def.name
                        )));
                    }
                    scope.insert(Rc::clone(&def.params[index]), value);
                    bound[index] = true;
                }
                None => {
                    extra_named.insert(Key::Str(name), value);
                }
            }
        }

        let defaults_offset = def.params.len() - mac.defaults.len();
        for (index, param) in def.params.iter().enumerate() {
            if bound[index] {
                continue;
            }
            let value = if index >= defaults_offset {
                mac.defaults[index - defaults_offset].clone()
            } else {
                Value::undefined_hint(
                    self.undefined_kind(),
                    format!("parameter '{param}' was not provided"),
                )
            };
            scope.insert(Rc::clone(param), value);
        }

        if !extra_positional.is_empty() && !def.accepts_varargs {
            return Err(Error::runtime(format!(
                "macro '{}' takes at most {} positional argument(s)",
                def.name,
                def.params.len()
            )));
        }
        if def.accepts_varargs {
            scope.insert("varargs".into(), Value::Tuple(Rc::new(extra_positional)));
        }
        if !extra_named.is_empty() && !def.accepts_kwargs {
            let name = extra_named.keys().next().unwrap();
            return Err(Error::runtime(format!(
                "macro '{}' got an unexpected keyword argument '{name}'",
                def.name
            )));
        }
        if def.accepts_kwargs {
            scope.insert("kwargs".into(), Value::from(extra_named));
        }
        if def.accepts_caller {
            scope.insert(
                "caller".into(),
                caller.unwrap_or_else(|| {
                    Value::undefined_hint(
                        self.undefined_kind(),
                        "no caller was provided to this macro".to_string(),
                    )
                }),
            );
        }

        self.enter()?;
        let mut stack = mac.closure.clone();
        stack.push(scope);
        let saved = self.ctx.swap_scopes(stack);
        let render_result = self.capture(|state| state.exec_body(&def.body));
        self.ctx.swap_scopes(saved);
        self.leave();
        let text = render_result?;
        Ok(if self.ctx.eval.autoescape {
            Value::safe(text)
        } else {
            Value::from(text)
        })
    }
}

/// Collects the names bound by a target.
fn collect_target_names(target: &TargetIr, names: &mut Vec<Rc<str>>) {
    match target {
        TargetIr::Name(name) => names.push(Rc::clone(name)),
        TargetIr::Tuple(targets) => {
            for target in targets {
                collect_target_names(target, names);
            }
        }
    }
}
