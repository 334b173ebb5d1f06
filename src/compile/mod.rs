//! Lowering from the AST to the executable instruction tree.
//!
//! Beyond the mechanical translation, this stage enforces the compile-time
//! semantic rules (duplicate blocks, unknown filters and tests, `extends`
//! placement, reserved names, required-block bodies), folds constant output,
//! decides escaping lexically wherever the autoescape state is statically
//! known, and splits block and macro bodies into separately invocable
//! definitions.

use crate::environment::Environment;
use crate::error::SyntaxError;
use crate::syntax::ast::{self, AssignTarget, Expr, Stmt, Target, TemplateAst};
use crate::value::{Value, ops};
use indexmap::IndexMap;
use std::rc::Rc;

pub(crate) mod code;
pub(crate) mod symbols;

use code::{
    BlockDef, CallArgsIr, EscapeMode, Ex, ExtendsMode, FilterIr, ForDef, Inst, MacroDef, Program,
    SetTarget, TargetIr,
};

/// The compile-time autoescape knowledge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EscapeState {
    /// The setting is statically known.
    Known(bool),
    /// The setting may change at runtime; decide per write.
    Volatile,
}

impl EscapeState {
    /// The escape mode for an output write under this state.
    fn mode(self) -> EscapeMode {
        match self {
            Self::Known(true) => EscapeMode::Yes,
            Self::Known(false) => EscapeMode::No,
            Self::Volatile => EscapeMode::Volatile,
        }
    }
}

/// The lexical position of the statements being lowered.
#[derive(Clone, Copy)]
struct Ctx {
    /// Root statements plus `if` arms at the root.
    toplevel: bool,
    /// Root statements only; where a statically-known `extends` can occur.
    rootlevel: bool,
    /// Whether output must check the parent-template slot at runtime.
    require_output_check: bool,
    /// The autoescape knowledge at this point.
    escape: EscapeState,
    /// Whether the statements sit inside a `for` body.
    in_loop: bool,
}

impl Ctx {
    /// A derived context for bodies that leave the root.
    fn inner(self) -> Self {
        Self {
            toplevel: false,
            rootlevel: false,
            ..self
        }
    }

    /// A derived context for buffered bodies (macros, captures), which
    /// never check the parent slot.
    fn buffered(self) -> Self {
        Self {
            toplevel: false,
            rootlevel: false,
            require_output_check: false,
            ..self
        }
    }
}

/// Compiles a parsed template against an environment.
pub(crate) fn compile(
    env: &Environment,
    name: Option<&str>,
    ast: &TemplateAst,
) -> Result<Program, SyntaxError> {
    let initial_autoescape = env.autoescape_default(name);
    let have_extends = stmts_contain_extends(&ast.body);
    let mut compiler = Compiler {
        env,
        blocks: IndexMap::new(),
        has_known_extends: false,
        extends_so_far: 0,
    };
    let ctx = Ctx {
        toplevel: true,
        rootlevel: true,
        require_output_check: have_extends,
        escape: EscapeState::Known(initial_autoescape),
        in_loop: false,
    };
    let root = compiler.lower_stmts(&ast.body, ctx)?;
    let extends = if !have_extends {
        ExtendsMode::No
    } else if compiler.has_known_extends {
        ExtendsMode::Static
    } else {
        ExtendsMode::Conditional
    };
    Ok(Program {
        root,
        blocks: compiler.blocks,
        extends,
        initial_autoescape,
    })
}

/// True if any statement (at any depth) is an `extends`.
fn stmts_contain_extends(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match stmt {
        Stmt::Extends(_) => true,
        Stmt::If(node) => {
            node.arms.iter().any(|(_, body)| stmts_contain_extends(body))
                || stmts_contain_extends(&node.else_body)
        }
        Stmt::For(node) => {
            stmts_contain_extends(&node.body) || stmts_contain_extends(&node.else_body)
        }
        Stmt::Block(node) => stmts_contain_extends(&node.body),
        Stmt::With(node) => stmts_contain_extends(&node.body),
        Stmt::AutoEscape(node) => stmts_contain_extends(&node.body),
        Stmt::FilterBlock(node) => stmts_contain_extends(&node.body),
        _ => false,
    })
}

/// The compiler state.
struct Compiler<'env> {
    /// The environment, consulted for registries and policy.
    env: &'env Environment,
    /// Blocks collected so far, by name.
    blocks: IndexMap<Rc<str>, Rc<BlockDef>>,
    /// Whether an unconditional root-level `extends` has been lowered;
    /// output lowered after that point is dropped.
    has_known_extends: bool,
    /// The number of `extends` statements lowered so far.
    extends_so_far: u32,
}

impl Compiler<'_> {
    /// Lowers a statement list.
    fn lower_stmts(&mut self, stmts: &[Stmt], ctx: Ctx) -> Result<Vec<Inst>, SyntaxError> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            self.lower_stmt(stmt, ctx, &mut out)?;
        }
        Ok(out)
    }

    /// Lowers one statement into `out`.
    fn lower_stmt(&mut self, stmt: &Stmt, ctx: Ctx, out: &mut Vec<Inst>) -> Result<(), SyntaxError> {
        match stmt {
            Stmt::Output(node) => self.lower_output(node, ctx, out),
            Stmt::If(node) => {
                let soft = Ctx {
                    rootlevel: false,
                    ..ctx
                };
                let mut arms = Vec::with_capacity(node.arms.len());
                for (cond, body) in &node.arms {
                    arms.push((self.lower_expr(cond, ctx)?, self.lower_stmts(body, soft)?));
                }
                let else_body = self.lower_stmts(&node.else_body, soft)?;
                out.push(Inst::If {
                    arms,
                    else_body,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::For(node) => {
                let target = self.lower_target(&node.target, true, node.line)?;
                let iter = self.lower_expr(&node.iter, ctx)?;
                let body_ctx = Ctx {
                    in_loop: true,
                    ..ctx.inner()
                };
                let filter = node
                    .filter
                    .as_ref()
                    .map(|filter| self.lower_expr(filter, body_ctx))
                    .transpose()?;
                let has_loop = node.recursive || symbols::reads_name(&node.body, "loop");
                let body = Rc::new(self.lower_stmts(&node.body, body_ctx)?);
                let else_body = self.lower_stmts(&node.else_body, ctx.inner())?;
                out.push(Inst::For(Rc::new(ForDef {
                    target,
                    iter,
                    filter,
                    body,
                    else_body,
                    has_loop,
                    recursive: node.recursive,
                    line: node.line,
                })));
                Ok(())
            }
            Stmt::Block(node) => {
                self.declare_block(node, ctx)?;
                let invoke = Inst::Block {
                    name: node.name.as_str().into(),
                    scoped: node.scoped,
                    line: node.line,
                };
                if ctx.toplevel {
                    if self.has_known_extends {
                        return Ok(());
                    }
                    if self.extends_so_far > 0 {
                        out.push(Inst::Guarded { body: vec![invoke] });
                        return Ok(());
                    }
                }
                out.push(invoke);
                Ok(())
            }
            Stmt::Extends(node) => {
                if !ctx.toplevel {
                    return Err(SyntaxError::new(
                        "cannot use extends from a non top-level scope",
                        node.line,
                    ));
                }
                let template = self.lower_expr(&node.template, ctx)?;
                out.push(Inst::Extends {
                    template,
                    line: node.line,
                });
                if ctx.rootlevel {
                    self.has_known_extends = true;
                }
                self.extends_so_far += 1;
                Ok(())
            }
            Stmt::Include(node) => {
                let template = self.lower_expr(&node.template, ctx)?;
                out.push(Inst::Include {
                    template,
                    with_context: node.with_context,
                    ignore_missing: node.ignore_missing,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::Import(node) => {
                let template = self.lower_expr(&node.template, ctx)?;
                out.push(Inst::Import {
                    template,
                    alias: node.alias.as_str().into(),
                    with_context: node.with_context,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::FromImport(node) => {
                let template = self.lower_expr(&node.template, ctx)?;
                let names = node
                    .names
                    .iter()
                    .map(|(name, alias)| {
                        (
                            Rc::from(name.as_str()),
                            Rc::from(alias.as_deref().unwrap_or(name)),
                        )
                    })
                    .collect();
                out.push(Inst::FromImport {
                    template,
                    names,
                    with_context: node.with_context,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::Assign(node) => {
                let target = self.lower_set_target(&node.target, ctx, node.line)?;
                let value = self.lower_expr(&node.value, ctx)?;
                out.push(Inst::Set {
                    target,
                    value,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::AssignBlock(node) => {
                let target = self.lower_set_target(&node.target, ctx, node.line)?;
                let filters = self.lower_filter_chain(&node.filters, ctx)?;
                let body = self.lower_stmts(&node.body, ctx.buffered())?;
                out.push(Inst::SetBlock {
                    target,
                    filters,
                    body,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::Macro(node) => {
                let def = self.lower_macro(
                    node.name.as_str(),
                    &node.params,
                    &node.defaults,
                    &node.body,
                    ctx,
                )?;
                out.push(Inst::Macro {
                    def,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::CallBlock(node) => {
                let def = self.lower_macro(
                    "caller",
                    &node.params,
                    &node.defaults,
                    &node.body,
                    ctx,
                )?;
                let call = self.lower_expr(&node.call, ctx)?;
                out.push(Inst::CallBlock {
                    def,
                    call,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::FilterBlock(node) => {
                let filters = self.lower_filter_chain(&node.filters, ctx)?;
                let body = self.lower_stmts(&node.body, ctx.buffered())?;
                out.push(Inst::FilterBlock {
                    filters,
                    body,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::With(node) => {
                let mut bindings = Vec::with_capacity(node.bindings.len());
                for (target, value) in &node.bindings {
                    bindings.push((
                        self.lower_target(target, ctx.in_loop, node.line)?,
                        self.lower_expr(value, ctx)?,
                    ));
                }
                let body = self.lower_stmts(&node.body, ctx.inner())?;
                out.push(Inst::With {
                    bindings,
                    body,
                    line: node.line,
                });
                Ok(())
            }
            Stmt::AutoEscape(node) => {
                let enabled = self.lower_expr(&node.enabled, ctx)?;
                let escape = match enabled.as_const() {
                    Some(value) => EscapeState::Known(value.is_true().unwrap_or(false)),
                    None => EscapeState::Volatile,
                };
                let body = self.lower_stmts(
                    &node.body,
                    Ctx {
                        escape,
                        ..ctx.inner()
                    },
                )?;
                out.push(Inst::AutoEscape {
                    enabled,
                    body,
                    line: node.line,
                });
                Ok(())
            }
        }
    }

    /// Registers a block definition and lowers its body.
    fn declare_block(&mut self, node: &ast::Block, ctx: Ctx) -> Result<(), SyntaxError> {
        if self.blocks.contains_key(node.name.as_str()) {
            return Err(SyntaxError::new(
                format!("block '{}' defined twice", node.name),
                node.line,
            ));
        }
        if node.required && !body_is_trivial(&node.body) {
            return Err(SyntaxError::new(
                "required blocks can only contain comments or whitespace",
                node.line,
            ));
        }
        // Reserve the name first so nested redefinitions of it are caught
        // while the body is lowered.
        let name: Rc<str> = node.name.as_str().into();
        self.blocks.insert(
            Rc::clone(&name),
            Rc::new(BlockDef {
                body: Vec::new(),
                required: node.required,
            }),
        );
        let body = self.lower_stmts(&node.body, ctx.buffered())?;
        self.blocks.insert(
            name,
            Rc::new(BlockDef {
                body,
                required: node.required,
            }),
        );
        Ok(())
    }

    /// Lowers a macro or caller definition.
    fn lower_macro(
        &mut self,
        name: &str,
        params: &[String],
        defaults: &[Expr],
        body: &[Stmt],
        ctx: Ctx,
    ) -> Result<Rc<MacroDef>, SyntaxError> {
        let undeclared = symbols::undeclared_names(body, params);
        let lowered_body = self.lower_stmts(body, ctx.buffered())?;
        let lowered_defaults = defaults
            .iter()
            .map(|default| self.lower_expr(default, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Rc::new(MacroDef {
            name: name.into(),
            params: params.iter().map(|p| Rc::from(p.as_str())).collect(),
            defaults: lowered_defaults,
            body: Rc::new(lowered_body),
            accepts_caller: undeclared.contains("caller"),
            accepts_varargs: undeclared.contains("varargs"),
            accepts_kwargs: undeclared.contains("kwargs"),
        }))
    }

    /// Lowers an output statement, folding constant pieces.
    fn lower_output(
        &mut self,
        node: &ast::Output,
        ctx: Ctx,
        out: &mut Vec<Inst>,
    ) -> Result<(), SyntaxError> {
        if ctx.require_output_check && self.has_known_extends {
            return Ok(());
        }

        let mut insts: Vec<Inst> = Vec::with_capacity(node.items.len());
        let mut constant = String::new();
        let can_fold = !self.env.has_finalize() && ctx.escape != EscapeState::Volatile;

        macro_rules! flush_constant {
            () => {
                if !constant.is_empty() {
                    insts.push(Inst::EmitRaw(std::mem::take(&mut constant).into()));
                }
            };
        }

        for item in &node.items {
            if let Expr::TemplateData(data) = item {
                constant.push_str(&data.text);
                continue;
            }
            let expr = self.lower_expr(item, ctx)?;
            match expr.as_const() {
                Some(value) if can_fold && !value.is_undefined() => {
                    let piece = value.to_display_string();
                    if ctx.escape == EscapeState::Known(true) && !value.is_safe() {
                        crate::output::escape_into(&mut constant, &piece);
                    } else {
                        constant.push_str(&piece);
                    }
                }
                _ => {
                    flush_constant!();
                    insts.push(Inst::Emit {
                        expr,
                        escape: ctx.escape.mode(),
                        line: item.line(),
                    });
                }
            }
        }
        flush_constant!();

        if ctx.require_output_check {
            out.push(Inst::Guarded { body: insts });
        } else {
            out.append(&mut insts);
        }
        Ok(())
    }

    /// Lowers a binding target, rejecting the reserved loop name where it
    /// is off limits.
    fn lower_target(
        &mut self,
        target: &Target,
        in_loop: bool,
        line: u32,
    ) -> Result<TargetIr, SyntaxError> {
        match target {
            Target::Name(name) => {
                if in_loop && name == "loop" {
                    return Err(SyntaxError::new(
                        "cannot assign to reserved name 'loop'",
                        line,
                    ));
                }
                Ok(TargetIr::Name(name.as_str().into()))
            }
            Target::Tuple(items) => Ok(TargetIr::Tuple(
                items
                    .iter()
                    .map(|item| self.lower_target(item, in_loop, line))
                    .collect::<Result<_, _>>()?,
            )),
        }
    }

    /// Lowers a `set` destination.
    fn lower_set_target(
        &mut self,
        target: &AssignTarget,
        ctx: Ctx,
        line: u32,
    ) -> Result<SetTarget, SyntaxError> {
        match target {
            AssignTarget::Plain(target) => {
                Ok(SetTarget::Var(self.lower_target(target, ctx.in_loop, line)?))
            }
            AssignTarget::NamespaceAttr { name, attr } => Ok(SetTarget::Attr {
                name: name.as_str().into(),
                attr: attr.as_str().into(),
            }),
        }
    }

    /// Lowers a filter chain, verifying every name.
    fn lower_filter_chain(
        &mut self,
        filters: &[ast::FilterCall],
        ctx: Ctx,
    ) -> Result<Vec<FilterIr>, SyntaxError> {
        filters
            .iter()
            .map(|filter| {
                self.check_filter(&filter.name, filter.line)?;
                Ok(FilterIr {
                    name: filter.name.as_str().into(),
                    args: self.lower_call_args(&filter.args, ctx)?,
                    line: filter.line,
                })
            })
            .collect()
    }

    /// Fails unless the filter is registered.
    fn check_filter(&self, name: &str, line: u32) -> Result<(), SyntaxError> {
        if self.env.has_filter(name) {
            Ok(())
        } else {
            Err(SyntaxError::new(format!("no filter named '{name}'"), line))
        }
    }

    /// Lowers call arguments.
    fn lower_call_args(
        &mut self,
        args: &ast::CallArgsAst,
        ctx: Ctx,
    ) -> Result<CallArgsIr, SyntaxError> {
        Ok(CallArgsIr {
            positional: args
                .positional
                .iter()
                .map(|arg| self.lower_expr(arg, ctx))
                .collect::<Result<_, _>>()?,
            named: args
                .named
                .iter()
                .map(|(name, arg)| Ok((Rc::from(name.as_str()), self.lower_expr(arg, ctx)?)))
                .collect::<Result<Vec<_>, SyntaxError>>()?,
            var_args: args
                .var_args
                .as_deref()
                .map(|arg| self.lower_expr(arg, ctx).map(Box::new))
                .transpose()?,
            var_kwargs: args
                .var_kwargs
                .as_deref()
                .map(|arg| self.lower_expr(arg, ctx).map(Box::new))
                .transpose()?,
        })
    }

    /// Lowers an expression, folding constant subtrees.
    fn lower_expr(&mut self, expr: &Expr, ctx: Ctx) -> Result<Ex, SyntaxError> {
        Ok(match expr {
            Expr::Const(node) => Ex::Const(node.value.clone()),
            Expr::TemplateData(node) => Ex::Const(Value::safe(node.text.as_str())),
            Expr::Name(node) => Ex::Name {
                name: node.name.as_str().into(),
                line: node.line,
            },
            Expr::Tuple(node) => Ex::Tuple(self.lower_exprs(&node.items, ctx)?),
            Expr::List(node) => Ex::List(self.lower_exprs(&node.items, ctx)?),
            Expr::Dict(node) => Ex::Dict(
                node.pairs
                    .iter()
                    .map(|(key, value)| {
                        Ok((self.lower_expr(key, ctx)?, self.lower_expr(value, ctx)?))
                    })
                    .collect::<Result<Vec<_>, SyntaxError>>()?,
            ),
            Expr::GetAttr(node) => Ex::GetAttr {
                obj: Box::new(self.lower_expr(&node.obj, ctx)?),
                name: node.name.as_str().into(),
                line: node.line,
            },
            Expr::GetItem(node) => Ex::GetItem {
                obj: Box::new(self.lower_expr(&node.obj, ctx)?),
                index: Box::new(self.lower_expr(&node.index, ctx)?),
                line: node.line,
            },
            Expr::Slice(node) => Ex::Slice {
                obj: Box::new(self.lower_expr(&node.obj, ctx)?),
                start: self.lower_opt(&node.start, ctx)?,
                stop: self.lower_opt(&node.stop, ctx)?,
                step: self.lower_opt(&node.step, ctx)?,
                line: node.line,
            },
            Expr::Call(node) => Ex::Call {
                callee: Box::new(self.lower_expr(&node.callee, ctx)?),
                args: self.lower_call_args(&node.args, ctx)?,
                line: node.line,
            },
            Expr::Filter(node) => {
                self.check_filter(&node.name, node.line)?;
                Ex::Filter {
                    value: node
                        .value
                        .as_ref()
                        .map(|value| self.lower_expr(value, ctx).map(Box::new))
                        .transpose()?,
                    name: node.name.as_str().into(),
                    args: self.lower_call_args(&node.args, ctx)?,
                    line: node.line,
                }
            }
            Expr::Test(node) => {
                if !self.env.has_test(&node.name) {
                    return Err(SyntaxError::new(
                        format!("no test named '{}'", node.name),
                        node.line,
                    ));
                }
                Ex::Test {
                    value: Box::new(self.lower_expr(&node.value, ctx)?),
                    name: node.name.as_str().into(),
                    args: self.lower_call_args(&node.args, ctx)?,
                    negated: node.negated,
                    line: node.line,
                }
            }
            Expr::CondExpr(node) => {
                let test = self.lower_expr(&node.test, ctx)?;
                let then = self.lower_expr(&node.then, ctx)?;
                let otherwise = self.lower_opt_expr(node.otherwise.as_ref(), ctx)?;
                if let (Some(value), Some(then_const)) = (test.as_const(), then.as_const()) {
                    if let Ok(truthy) = value.is_true() {
                        if truthy {
                            return Ok(Ex::Const(then_const.clone()));
                        }
                        if let Some(otherwise) = &otherwise
                            && let Some(other_const) = otherwise.as_const()
                        {
                            return Ok(Ex::Const(other_const.clone()));
                        }
                    }
                }
                Ex::Cond {
                    test: Box::new(test),
                    then: Box::new(then),
                    otherwise: otherwise.map(Box::new),
                    line: node.line,
                }
            }
            Expr::BinOp(node) => {
                let left = self.lower_expr(&node.left, ctx)?;
                let right = self.lower_expr(&node.right, ctx)?;
                if let (Some(a), Some(b)) = (left.as_const(), right.as_const())
                    && let Some(folded) = fold_binop(node.op, a, b)
                {
                    return Ok(Ex::Const(folded));
                }
                Ex::BinOp {
                    op: node.op,
                    left: Box::new(left),
                    right: Box::new(right),
                    line: node.line,
                }
            }
            Expr::Concat(node) => {
                let parts = self.lower_exprs(&node.parts, ctx)?;
                if let EscapeState::Known(autoescape) = ctx.escape
                    && parts.iter().all(|part| part.as_const().is_some())
                {
                    let mut folded = Value::safe("");
                    let mut ok = true;
                    for part in &parts {
                        match ops::concat(autoescape, &folded, part.as_const().unwrap()) {
                            Ok(next) => folded = next,
                            Err(_) => {
                                ok = false;
                                break;
                            }
                        }
                    }
                    if ok {
                        return Ok(Ex::Const(folded));
                    }
                }
                Ex::Concat {
                    parts,
                    line: node.line,
                }
            }
            Expr::Compare(node) => Ex::Compare {
                first: Box::new(self.lower_expr(&node.first, ctx)?),
                rest: node
                    .rest
                    .iter()
                    .map(|(op, operand)| Ok((*op, self.lower_expr(operand, ctx)?)))
                    .collect::<Result<Vec<_>, SyntaxError>>()?,
                line: node.line,
            },
            Expr::Not(node) => {
                let inner = self.lower_expr(&node.expr, ctx)?;
                if let Some(value) = inner.as_const()
                    && let Ok(truthy) = value.is_true()
                {
                    return Ok(Ex::Const(Value::Bool(!truthy)));
                }
                Ex::Not {
                    expr: Box::new(inner),
                    line: node.line,
                }
            }
            Expr::Neg(node) => {
                let inner = self.lower_expr(&node.expr, ctx)?;
                if let Some(value) = inner.as_const()
                    && let Ok(folded) = ops::neg(value)
                {
                    return Ok(Ex::Const(folded));
                }
                Ex::Neg {
                    expr: Box::new(inner),
                    line: node.line,
                }
            }
            Expr::Pos(node) => {
                let inner = self.lower_expr(&node.expr, ctx)?;
                if let Some(value) = inner.as_const()
                    && let Ok(folded) = ops::pos(value)
                {
                    return Ok(Ex::Const(folded));
                }
                Ex::Pos {
                    expr: Box::new(inner),
                    line: node.line,
                }
            }
        })
    }

    /// Lowers a list of expressions.
    fn lower_exprs(&mut self, exprs: &[Expr], ctx: Ctx) -> Result<Vec<Ex>, SyntaxError> {
        exprs.iter().map(|expr| self.lower_expr(expr, ctx)).collect()
    }

    /// Lowers an optional boxed expression.
    fn lower_opt(
        &mut self,
        expr: &Option<Expr>,
        ctx: Ctx,
    ) -> Result<Option<Box<Ex>>, SyntaxError> {
        expr.as_ref()
            .map(|expr| self.lower_expr(expr, ctx).map(Box::new))
            .transpose()
    }

    /// Lowers an optional expression without boxing.
    fn lower_opt_expr(
        &mut self,
        expr: Option<&Expr>,
        ctx: Ctx,
    ) -> Result<Option<Ex>, SyntaxError> {
        expr.map(|expr| self.lower_expr(expr, ctx)).transpose()
    }
}

/// Folds a binary operation over two constants, when safe.
///
/// `and`/`or` need truthiness; arithmetic reuses the runtime operator
/// implementations. Failures simply skip folding so the error surfaces at
/// runtime with a line number.
fn fold_binop(op: ast::BinOpKind, a: &Value, b: &Value) -> Option<Value> {
    use ast::BinOpKind;
    match op {
        BinOpKind::And => match a.is_true() {
            Ok(true) => Some(b.clone()),
            Ok(false) => Some(a.clone()),
            Err(_) => None,
        },
        BinOpKind::Or => match a.is_true() {
            Ok(true) => Some(a.clone()),
            Ok(false) => Some(b.clone()),
            Err(_) => None,
        },
        BinOpKind::Add => ops::add(a, b).ok(),
        BinOpKind::Sub => ops::sub(a, b).ok(),
        BinOpKind::Mul => ops::mul(a, b).ok(),
        BinOpKind::Div => ops::div(a, b).ok(),
        BinOpKind::FloorDiv => ops::floordiv(a, b).ok(),
        BinOpKind::Mod => ops::rem(a, b).ok(),
        BinOpKind::Pow => ops::pow(a, b).ok(),
    }
}

/// True if a block body holds only whitespace output.
fn body_is_trivial(body: &[Stmt]) -> bool {
    body.iter().all(|stmt| match stmt {
        Stmt::Output(output) => output.items.iter().all(|item| match item {
            Expr::TemplateData(data) => data.text.trim().is_empty(),
            _ => false,
        }),
        _ => false,
    })
}
