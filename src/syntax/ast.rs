//! The abstract syntax tree produced by the parser.
//!
//! Nodes split into two families: statements and expressions. Every node
//! carries the 1-indexed source line it started on so that diagnostics from
//! any later stage can point back into the template.

use crate::value::Value;

/// The root of a parsed template.
#[derive(Debug)]
pub(crate) struct TemplateAst {
    /// The toplevel statements.
    pub body: Vec<Stmt>,
}

/// A statement node.
#[derive(Debug)]
pub(crate) enum Stmt {
    /// A run of literal data and print expressions.
    Output(Output),
    /// A `{% for %}` loop.
    For(Box<For>),
    /// An `{% if %}` conditional chain.
    If(Box<If>),
    /// A `{% macro %}` definition.
    Macro(Box<Macro>),
    /// A `{% call %}` block: an anonymous caller macro plus the call.
    CallBlock(Box<CallBlock>),
    /// A `{% filter %}` block.
    FilterBlock(Box<FilterBlock>),
    /// A `{% block %}` definition.
    Block(Box<Block>),
    /// An `{% extends %}` statement.
    Extends(Box<Extends>),
    /// An `{% include %}` statement.
    Include(Box<Include>),
    /// An `{% import ... as ... %}` statement.
    Import(Box<Import>),
    /// A `{% from ... import ... %}` statement.
    FromImport(Box<FromImport>),
    /// A simple `{% set %}` assignment.
    Assign(Box<Assign>),
    /// A `{% set ... %}...{% endset %}` capture assignment.
    AssignBlock(Box<AssignBlock>),
    /// A `{% with %}` scope.
    With(Box<With>),
    /// An `{% autoescape %}` scoped eval-context modifier.
    AutoEscape(Box<AutoEscape>),
}

impl Stmt {
    /// The source line the statement starts on.
    pub fn line(&self) -> u32 {
        match self {
            Self::Output(node) => node.line,
            Self::For(node) => node.line,
            Self::If(node) => node.line,
            Self::Macro(node) => node.line,
            Self::CallBlock(node) => node.line,
            Self::FilterBlock(node) => node.line,
            Self::Block(node) => node.line,
            Self::Extends(node) => node.line,
            Self::Include(node) => node.line,
            Self::Import(node) => node.line,
            Self::FromImport(node) => node.line,
            Self::Assign(node) => node.line,
            Self::AssignBlock(node) => node.line,
            Self::With(node) => node.line,
            Self::AutoEscape(node) => node.line,
        }
    }
}

/// Literal data and expressions printed in source order.
#[derive(Debug)]
pub(crate) struct Output {
    /// The items to emit; literal text appears as
    /// [`Expr::TemplateData`].
    pub items: Vec<Expr>,
    /// The source line.
    pub line: u32,
}

/// A `for` loop.
#[derive(Debug)]
pub(crate) struct For {
    /// The bound name or unpacking tuple.
    pub target: Target,
    /// The iterable expression, evaluated once at loop entry.
    pub iter: Expr,
    /// An optional inline `if` filter over iteration items.
    pub filter: Option<Expr>,
    /// The loop body.
    pub body: Vec<Stmt>,
    /// The `else` clause, run when no iteration happened.
    pub else_body: Vec<Stmt>,
    /// Whether the loop may re-enter itself through `loop(...)`.
    pub recursive: bool,
    /// The source line.
    pub line: u32,
}

/// A name-binding target: a single name or an unpacking tuple.
#[derive(Debug)]
pub(crate) enum Target {
    /// A single name.
    Name(String),
    /// A nested unpacking tuple.
    Tuple(Vec<Target>),
}

impl Target {
    /// Visits every bound name.
    pub fn each_name(&self, f: &mut impl FnMut(&str)) {
        match self {
            Self::Name(name) => f(name),
            Self::Tuple(items) => {
                for item in items {
                    item.each_name(f);
                }
            }
        }
    }
}

/// An `if`/`elif`/`else` chain, stored flat.
#[derive(Debug)]
pub(crate) struct If {
    /// The condition and body of the `if` arm followed by each `elif` arm.
    pub arms: Vec<(Expr, Vec<Stmt>)>,
    /// The `else` body.
    pub else_body: Vec<Stmt>,
    /// The source line.
    pub line: u32,
}

/// A macro definition.
#[derive(Debug)]
pub(crate) struct Macro {
    /// The macro name.
    pub name: String,
    /// Ordered parameter names.
    pub params: Vec<String>,
    /// Default expressions filling the tail of `params`.
    pub defaults: Vec<Expr>,
    /// The macro body.
    pub body: Vec<Stmt>,
    /// The source line.
    pub line: u32,
}

/// A `{% call %}` block.
#[derive(Debug)]
pub(crate) struct CallBlock {
    /// Parameter names of the anonymous caller macro.
    pub params: Vec<String>,
    /// Defaults for the caller parameters.
    pub defaults: Vec<Expr>,
    /// The call expression that receives the caller.
    pub call: Expr,
    /// The caller body.
    pub body: Vec<Stmt>,
    /// The source line.
    pub line: u32,
}

/// A `{% filter %}` block.
#[derive(Debug)]
pub(crate) struct FilterBlock {
    /// The filter chain applied to the captured body, left to right.
    pub filters: Vec<FilterCall>,
    /// The body whose rendered output is filtered.
    pub body: Vec<Stmt>,
    /// The source line.
    pub line: u32,
}

/// One link of a filter chain.
#[derive(Debug)]
pub(crate) struct FilterCall {
    /// The filter name.
    pub name: String,
    /// Extra arguments after the piped value.
    pub args: CallArgsAst,
    /// The source line.
    pub line: u32,
}

/// A `{% block %}` definition.
#[derive(Debug)]
pub(crate) struct Block {
    /// The block name, unique within a template.
    pub name: String,
    /// The block body.
    pub body: Vec<Stmt>,
    /// Whether the block sees the enclosing frame's locals when overridden.
    pub scoped: bool,
    /// Whether rendering fails unless a child overrides the block.
    pub required: bool,
    /// The source line.
    pub line: u32,
}

/// An `{% extends %}` statement.
#[derive(Debug)]
pub(crate) struct Extends {
    /// The parent template name expression.
    pub template: Expr,
    /// The source line.
    pub line: u32,
}

/// An `{% include %}` statement.
#[derive(Debug)]
pub(crate) struct Include {
    /// The template name, or a sequence of names tried in order.
    pub template: Expr,
    /// Whether the included template shares the caller's variables.
    pub with_context: bool,
    /// Whether a missing template is silently skipped.
    pub ignore_missing: bool,
    /// The source line.
    pub line: u32,
}

/// An `{% import ... as ... %}` statement.
#[derive(Debug)]
pub(crate) struct Import {
    /// The template name expression.
    pub template: Expr,
    /// The name the module is bound to.
    pub alias: String,
    /// Whether the imported module sees the caller's variables.
    pub with_context: bool,
    /// The source line.
    pub line: u32,
}

/// A `{% from ... import ... %}` statement.
#[derive(Debug)]
pub(crate) struct FromImport {
    /// The template name expression.
    pub template: Expr,
    /// Imported names with optional aliases.
    pub names: Vec<(String, Option<String>)>,
    /// Whether the imported module sees the caller's variables.
    pub with_context: bool,
    /// The source line.
    pub line: u32,
}

/// The target of an assignment.
#[derive(Debug)]
pub(crate) enum AssignTarget {
    /// A plain name or unpacking tuple.
    Plain(Target),
    /// An attribute path on a namespace value.
    NamespaceAttr {
        /// The namespace variable name.
        name: String,
        /// The attribute being assigned.
        attr: String,
    },
}

/// A simple `{% set %}`.
#[derive(Debug)]
pub(crate) struct Assign {
    /// The assignment target.
    pub target: AssignTarget,
    /// The assigned value.
    pub value: Expr,
    /// The source line.
    pub line: u32,
}

/// A block `{% set %}...{% endset %}` capture.
#[derive(Debug)]
pub(crate) struct AssignBlock {
    /// The assignment target.
    pub target: AssignTarget,
    /// An optional filter chain applied to the captured output.
    pub filters: Vec<FilterCall>,
    /// The body whose rendered output becomes the value.
    pub body: Vec<Stmt>,
    /// The source line.
    pub line: u32,
}

/// A `{% with %}` scope.
#[derive(Debug)]
pub(crate) struct With {
    /// The scope-local bindings, evaluated in order in the outer scope.
    pub bindings: Vec<(Target, Expr)>,
    /// The scoped body.
    pub body: Vec<Stmt>,
    /// The source line.
    pub line: u32,
}

/// An `{% autoescape %}` block.
#[derive(Debug)]
pub(crate) struct AutoEscape {
    /// The new autoescape setting.
    pub enabled: Expr,
    /// The body rendered under the modified eval context.
    pub body: Vec<Stmt>,
    /// The source line.
    pub line: u32,
}

/// An expression node.
#[derive(Debug)]
pub(crate) enum Expr {
    /// A literal constant.
    Const(Const),
    /// A name load.
    Name(NameRef),
    /// Literal template data inside an output statement.
    TemplateData(TemplateData),
    /// A tuple display.
    Tuple(Seq),
    /// A list display.
    List(Seq),
    /// A dict display.
    Dict(Dict),
    /// Attribute access `obj.name`.
    GetAttr(Box<GetAttr>),
    /// Item access `obj[index]`.
    GetItem(Box<GetItem>),
    /// Slice access `obj[a:b:c]`.
    Slice(Box<Slice>),
    /// A call `f(args)`.
    Call(Box<Call>),
    /// A filter application `value | name(args)`.
    Filter(Box<Filter>),
    /// A test application `value is [not] name(args)`.
    Test(Box<Test>),
    /// The conditional expression `a if cond else b`.
    CondExpr(Box<CondExpr>),
    /// A binary operation.
    BinOp(Box<BinOp>),
    /// String concatenation `a ~ b ~ ...`.
    Concat(Box<Concat>),
    /// A chained comparison.
    Compare(Box<Compare>),
    /// Logical negation.
    Not(Box<Unary>),
    /// Arithmetic negation.
    Neg(Box<Unary>),
    /// Unary plus.
    Pos(Box<Unary>),
}

impl Expr {
    /// The source line the expression starts on.
    pub fn line(&self) -> u32 {
        match self {
            Self::Const(node) => node.line,
            Self::Name(node) => node.line,
            Self::TemplateData(node) => node.line,
            Self::Tuple(node) | Self::List(node) => node.line,
            Self::Dict(node) => node.line,
            Self::GetAttr(node) => node.line,
            Self::GetItem(node) => node.line,
            Self::Slice(node) => node.line,
            Self::Call(node) => node.line,
            Self::Filter(node) => node.line,
            Self::Test(node) => node.line,
            Self::CondExpr(node) => node.line,
            Self::BinOp(node) => node.line,
            Self::Concat(node) => node.line,
            Self::Compare(node) => node.line,
            Self::Not(node) | Self::Neg(node) | Self::Pos(node) => node.line,
        }
    }
}

/// A literal constant.
#[derive(Debug)]
pub(crate) struct Const {
    /// The constant value.
    pub value: Value,
    /// The source line.
    pub line: u32,
}

/// A name load.
#[derive(Debug)]
pub(crate) struct NameRef {
    /// The name.
    pub name: String,
    /// The source line.
    pub line: u32,
}

/// Literal template data.
#[derive(Debug)]
pub(crate) struct TemplateData {
    /// The literal text.
    pub text: String,
    /// The source line.
    pub line: u32,
}

/// An item sequence (tuple or list display).
#[derive(Debug)]
pub(crate) struct Seq {
    /// The items.
    pub items: Vec<Expr>,
    /// The source line.
    pub line: u32,
}

/// A dict display.
#[derive(Debug)]
pub(crate) struct Dict {
    /// Key/value pairs in source order.
    pub pairs: Vec<(Expr, Expr)>,
    /// The source line.
    pub line: u32,
}

/// Attribute access.
#[derive(Debug)]
pub(crate) struct GetAttr {
    /// The object.
    pub obj: Expr,
    /// The attribute name.
    pub name: String,
    /// The source line.
    pub line: u32,
}

/// Item access.
#[derive(Debug)]
pub(crate) struct GetItem {
    /// The object.
    pub obj: Expr,
    /// The index expression.
    pub index: Expr,
    /// The source line.
    pub line: u32,
}

/// Slice access.
#[derive(Debug)]
pub(crate) struct Slice {
    /// The object.
    pub obj: Expr,
    /// The start bound.
    pub start: Option<Expr>,
    /// The stop bound.
    pub stop: Option<Expr>,
    /// The step.
    pub step: Option<Expr>,
    /// The source line.
    pub line: u32,
}

/// A call.
#[derive(Debug)]
pub(crate) struct Call {
    /// The callee.
    pub callee: Expr,
    /// The arguments.
    pub args: CallArgsAst,
    /// The source line.
    pub line: u32,
}

/// Call arguments: positional, keyword, `*args`, `**kwargs`, in that order.
#[derive(Debug, Default)]
pub(crate) struct CallArgsAst {
    /// Positional arguments.
    pub positional: Vec<Expr>,
    /// Keyword arguments in source order.
    pub named: Vec<(String, Expr)>,
    /// A `*args` expansion.
    pub var_args: Option<Box<Expr>>,
    /// A `**kwargs` expansion.
    pub var_kwargs: Option<Box<Expr>>,
}

/// A filter application.
#[derive(Debug)]
pub(crate) struct Filter {
    /// The filtered value; `None` inside `{% filter %}` chains where the
    /// captured body is piped in.
    pub value: Option<Expr>,
    /// The filter name.
    pub name: String,
    /// Extra arguments.
    pub args: CallArgsAst,
    /// The source line.
    pub line: u32,
}

/// A test application.
#[derive(Debug)]
pub(crate) struct Test {
    /// The tested value.
    pub value: Expr,
    /// The test name.
    pub name: String,
    /// Extra arguments.
    pub args: CallArgsAst,
    /// Whether the test is negated (`is not`).
    pub negated: bool,
    /// The source line.
    pub line: u32,
}

/// The conditional expression.
#[derive(Debug)]
pub(crate) struct CondExpr {
    /// The condition.
    pub test: Expr,
    /// The value when the condition holds.
    pub then: Expr,
    /// The value otherwise; missing means undefined.
    pub otherwise: Option<Expr>,
    /// The source line.
    pub line: u32,
}

/// A binary operator kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BinOpKind {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//`
    FloorDiv,
    /// `%`
    Mod,
    /// `**`
    Pow,
    /// `and`
    And,
    /// `or`
    Or,
}

/// A binary operation.
#[derive(Debug)]
pub(crate) struct BinOp {
    /// The operator.
    pub op: BinOpKind,
    /// The left operand.
    pub left: Expr,
    /// The right operand.
    pub right: Expr,
    /// The source line.
    pub line: u32,
}

/// String concatenation.
#[derive(Debug)]
pub(crate) struct Concat {
    /// The concatenated parts.
    pub parts: Vec<Expr>,
    /// The source line.
    pub line: u32,
}

/// A comparison operator kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `in`
    In,
    /// `not in`
    NotIn,
}

/// A chained comparison: `a < b <= c` holds when every link holds.
#[derive(Debug)]
pub(crate) struct Compare {
    /// The first operand.
    pub first: Expr,
    /// Each following operator and operand.
    pub rest: Vec<(CmpOp, Expr)>,
    /// The source line.
    pub line: u32,
}

/// A unary operation.
#[derive(Debug)]
pub(crate) struct Unary {
    /// The operand.
    pub expr: Expr,
    /// The source line.
    pub line: u32,
}
