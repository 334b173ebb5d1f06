//! The compiled, executable form of a template.
//!
//! The compiler lowers the AST into an instruction tree with names interned,
//! constants folded, and per-block bodies split out. Compiled programs are
//! immutable after construction and shared between renders.

use crate::syntax::ast::{BinOpKind, CmpOp};
use crate::value::Value;
use indexmap::IndexMap;
use std::rc::Rc;

/// A compiled template.
#[derive(Debug)]
pub(crate) struct Program {
    /// The root instruction sequence.
    pub root: Vec<Inst>,
    /// Every block defined in the template, by name.
    pub blocks: IndexMap<Rc<str>, Rc<BlockDef>>,
    /// How the template participates in inheritance.
    pub extends: ExtendsMode,
    /// The autoescape default the template was compiled against.
    pub initial_autoescape: bool,
}

/// The escape decision attached to an output write.
///
/// Escaping is decided lexically at compile time wherever the autoescape
/// setting is statically known; inside an `{% autoescape %}` scope with a
/// dynamic condition the decision is deferred to the per-render eval
/// context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EscapeMode {
    /// Write the value unescaped.
    No,
    /// Escape the value unless it is already safe.
    Yes,
    /// Consult the eval context at write time.
    Volatile,
}

/// How a template relates to `extends`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ExtendsMode {
    /// The template never extends; root output always renders.
    No,
    /// An unconditional root-level `extends`: root output outside blocks
    /// was compiled out.
    Static,
    /// An `extends` behind a condition: root output checks the parent slot
    /// at runtime and renders only while it is unset.
    Conditional,
}

/// A compiled block definition.
#[derive(Debug)]
pub(crate) struct BlockDef {
    /// The block body.
    pub body: Vec<Inst>,
    /// Whether rendering the definition directly (no override) fails.
    pub required: bool,
}

/// A compiled macro (or `{% call %}` caller) definition.
#[derive(Debug)]
pub(crate) struct MacroDef {
    /// The macro name; `caller` for call-block callers.
    pub name: Rc<str>,
    /// Ordered parameter names.
    pub params: Vec<Rc<str>>,
    /// Defaults filling the tail of `params`, evaluated at definition time.
    pub defaults: Vec<Ex>,
    /// The body.
    pub body: Rc<Vec<Inst>>,
    /// Whether the body references `caller`.
    pub accepts_caller: bool,
    /// Whether the body references `varargs`.
    pub accepts_varargs: bool,
    /// Whether the body references `kwargs`.
    pub accepts_kwargs: bool,
}

/// A compiled binding target.
#[derive(Debug)]
pub(crate) enum TargetIr {
    /// A single name.
    Name(Rc<str>),
    /// An unpacking tuple.
    Tuple(Vec<TargetIr>),
}

/// The destination of a `set`.
#[derive(Debug)]
pub(crate) enum SetTarget {
    /// A plain binding.
    Var(TargetIr),
    /// An attribute on a namespace value.
    Attr {
        /// The namespace variable name.
        name: Rc<str>,
        /// The attribute.
        attr: Rc<str>,
    },
}

/// One link of a compiled filter chain.
#[derive(Debug)]
pub(crate) struct FilterIr {
    /// The filter name.
    pub name: Rc<str>,
    /// Extra arguments after the piped value.
    pub args: CallArgsIr,
    /// The source line.
    pub line: u32,
}

/// Compiled call arguments.
#[derive(Debug, Default)]
pub(crate) struct CallArgsIr {
    /// Positional arguments.
    pub positional: Vec<Ex>,
    /// Keyword arguments in source order.
    pub named: Vec<(Rc<str>, Ex)>,
    /// A `*args` expansion.
    pub var_args: Option<Box<Ex>>,
    /// A `**kwargs` expansion.
    pub var_kwargs: Option<Box<Ex>>,
}

/// A compiled instruction.
#[derive(Debug)]
pub(crate) enum Inst {
    /// Emits pre-folded literal output.
    EmitRaw(Rc<str>),
    /// Evaluates and emits an expression.
    Emit {
        /// The expression.
        expr: Ex,
        /// The escape decision for this write.
        escape: EscapeMode,
        /// The source line.
        line: u32,
    },
    /// An `if`/`elif` chain.
    If {
        /// Condition/body pairs, tried in order.
        arms: Vec<(Ex, Vec<Inst>)>,
        /// The `else` body.
        else_body: Vec<Inst>,
        /// The source line.
        line: u32,
    },
    /// A `for` loop.
    For(Rc<ForDef>),
    /// A simple assignment.
    Set {
        /// The destination.
        target: SetTarget,
        /// The value.
        value: Ex,
        /// The source line.
        line: u32,
    },
    /// A block-capture assignment.
    SetBlock {
        /// The destination.
        target: SetTarget,
        /// The filter chain over the captured output.
        filters: Vec<FilterIr>,
        /// The captured body.
        body: Vec<Inst>,
        /// The source line.
        line: u32,
    },
    /// Binds a macro.
    Macro {
        /// The definition.
        def: Rc<MacroDef>,
        /// The source line.
        line: u32,
    },
    /// A `{% call %}` block.
    CallBlock {
        /// The anonymous caller definition.
        def: Rc<MacroDef>,
        /// The call expression receiving the caller.
        call: Ex,
        /// The source line.
        line: u32,
    },
    /// A `{% filter %}` block.
    FilterBlock {
        /// The filter chain over the captured output.
        filters: Vec<FilterIr>,
        /// The captured body.
        body: Vec<Inst>,
        /// The source line.
        line: u32,
    },
    /// Invokes a block by name through the context's block chains.
    Block {
        /// The block name.
        name: Rc<str>,
        /// Whether the invocation site shares its locals with the winning
        /// definition (the `scoped` modifier).
        scoped: bool,
        /// The source line.
        line: u32,
    },
    /// Resolves and installs the parent template.
    Extends {
        /// The parent name expression.
        template: Ex,
        /// The source line.
        line: u32,
    },
    /// Renders another template inline.
    Include {
        /// The template name, or a sequence of fallback names.
        template: Ex,
        /// Whether the caller's variables are visible.
        with_context: bool,
        /// Whether missing templates are skipped.
        ignore_missing: bool,
        /// The source line.
        line: u32,
    },
    /// Imports a template as a module.
    Import {
        /// The template name expression.
        template: Ex,
        /// The binding name.
        alias: Rc<str>,
        /// Whether the module render sees the caller's variables.
        with_context: bool,
        /// The source line.
        line: u32,
    },
    /// Imports selected names from a template module.
    FromImport {
        /// The template name expression.
        template: Ex,
        /// `(exported name, local binding)` pairs.
        names: Vec<(Rc<str>, Rc<str>)>,
        /// Whether the module render sees the caller's variables.
        with_context: bool,
        /// The source line.
        line: u32,
    },
    /// A `{% with %}` scope.
    With {
        /// The bindings, evaluated in the outer scope.
        bindings: Vec<(TargetIr, Ex)>,
        /// The scoped body.
        body: Vec<Inst>,
        /// The source line.
        line: u32,
    },
    /// An `{% autoescape %}` scope.
    AutoEscape {
        /// The new setting.
        enabled: Ex,
        /// The scoped body.
        body: Vec<Inst>,
        /// The source line.
        line: u32,
    },
    /// Output that only renders while no parent template is installed.
    ///
    /// Produced for root-level output in templates whose `extends` is
    /// conditional.
    Guarded {
        /// The guarded instructions.
        body: Vec<Inst>,
    },
}

/// A compiled `for` loop.
#[derive(Debug)]
pub(crate) struct ForDef {
    /// The bound target.
    pub target: TargetIr,
    /// The iterable, evaluated once at entry.
    pub iter: Ex,
    /// The optional inline filter.
    pub filter: Option<Ex>,
    /// The body; shared so recursive loops can re-enter it.
    pub body: Rc<Vec<Inst>>,
    /// The `else` body.
    pub else_body: Vec<Inst>,
    /// Whether a `loop` context object must be installed.
    pub has_loop: bool,
    /// Whether the loop may be re-entered through `loop(...)`.
    pub recursive: bool,
    /// The source line.
    pub line: u32,
}

/// A compiled expression.
#[derive(Debug)]
pub(crate) enum Ex {
    /// A constant.
    Const(Value),
    /// A name load, resolved through the scope chain.
    Name {
        /// The name.
        name: Rc<str>,
        /// The source line.
        line: u32,
    },
    /// A tuple display.
    Tuple(Vec<Ex>),
    /// A list display.
    List(Vec<Ex>),
    /// A dict display.
    Dict(Vec<(Ex, Ex)>),
    /// Attribute access.
    GetAttr {
        /// The object.
        obj: Box<Ex>,
        /// The attribute name.
        name: Rc<str>,
        /// The source line.
        line: u32,
    },
    /// Item access.
    GetItem {
        /// The object.
        obj: Box<Ex>,
        /// The index.
        index: Box<Ex>,
        /// The source line.
        line: u32,
    },
    /// Slice access.
    Slice {
        /// The object.
        obj: Box<Ex>,
        /// The start bound.
        start: Option<Box<Ex>>,
        /// The stop bound.
        stop: Option<Box<Ex>>,
        /// The step.
        step: Option<Box<Ex>>,
        /// The source line.
        line: u32,
    },
    /// A call.
    Call {
        /// The callee.
        callee: Box<Ex>,
        /// The arguments.
        args: CallArgsIr,
        /// The source line.
        line: u32,
    },
    /// A filter application.
    Filter {
        /// The filtered value; `None` when the captured body is piped in.
        value: Option<Box<Ex>>,
        /// The filter name.
        name: Rc<str>,
        /// Extra arguments.
        args: CallArgsIr,
        /// The source line.
        line: u32,
    },
    /// A test application.
    Test {
        /// The tested value.
        value: Box<Ex>,
        /// The test name.
        name: Rc<str>,
        /// Extra arguments.
        args: CallArgsIr,
        /// Whether the result is negated.
        negated: bool,
        /// The source line.
        line: u32,
    },
    /// The conditional expression.
    Cond {
        /// The condition.
        test: Box<Ex>,
        /// The value when true.
        then: Box<Ex>,
        /// The value when false; missing means undefined.
        otherwise: Option<Box<Ex>>,
        /// The source line.
        line: u32,
    },
    /// A binary operation.
    BinOp {
        /// The operator.
        op: BinOpKind,
        /// The left operand.
        left: Box<Ex>,
        /// The right operand.
        right: Box<Ex>,
        /// The source line.
        line: u32,
    },
    /// String concatenation.
    Concat {
        /// The parts.
        parts: Vec<Ex>,
        /// The source line.
        line: u32,
    },
    /// A chained comparison.
    Compare {
        /// The first operand.
        first: Box<Ex>,
        /// The following operators and operands.
        rest: Vec<(CmpOp, Ex)>,
        /// The source line.
        line: u32,
    },
    /// Logical negation.
    Not {
        /// The operand.
        expr: Box<Ex>,
        /// The source line.
        line: u32,
    },
    /// Arithmetic negation.
    Neg {
        /// The operand.
        expr: Box<Ex>,
        /// The source line.
        line: u32,
    },
    /// Unary plus.
    Pos {
        /// The operand.
        expr: Box<Ex>,
        /// The source line.
        line: u32,
    },
}

impl Ex {
    /// The constant behind the expression, if it folded to one.
    pub fn as_const(&self) -> Option<&Value> {
        match self {
            Self::Const(value) => Some(value),
            _ => None,
        }
    }
}
