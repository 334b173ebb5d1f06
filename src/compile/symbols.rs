//! Per-frame name resolution analysis.
//!
//! Each template scope (the root, a block, a macro body, a loop body, a
//! `with` body) is a frame. The analyzer walks a frame's statements once and
//! classifies every user-visible name: bound parameters, names resolved from
//! the context or an enclosing frame, imported aliases, and names that are
//! only assigned on some branches (undefined at frame entry). Branches of an
//! `if` are analyzed independently and their stores merged afterwards, so a
//! name assigned in any arm counts as local for the code that follows.

use crate::syntax::ast::{AssignTarget, Expr, Stmt, Target};
use indexmap::{IndexMap, IndexSet};

/// How a name load resolves within its frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum LoadKind {
    /// Bound by a parameter-like construct: macro parameters, `for`
    /// targets, `with` targets.
    Parameter,
    /// Resolved from the render context (or an enclosing frame) at runtime.
    Resolve,
    /// Bound by an import.
    Alias,
    /// Assigned somewhere in the frame but not at entry; reads before the
    /// first store see the undefined sentinel.
    Undefined,
}

/// A name's resolution record.
#[derive(Clone, Debug)]
pub(crate) struct Symbol {
    /// A stable per-frame reference id, e.g. `l_0_item`.
    #[allow(dead_code)]
    pub id: String,
    /// The load classification.
    pub load: LoadKind,
}

/// The symbol table of one analyzed frame.
#[derive(Debug, Default)]
pub(crate) struct FrameSymbols {
    /// Every name observed in the frame, in first-seen order.
    pub names: IndexMap<String, Symbol>,
}

impl FrameSymbols {
    /// The names that resolve from the context, in first-seen order.
    pub fn resolved(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .filter(|(_, symbol)| symbol.load == LoadKind::Resolve)
            .map(|(name, _)| name.as_str())
    }
}

/// Analyzes one frame of statements.
///
/// `params` are bound at frame entry (macro parameters and the like);
/// `level` feeds the reference ids.
pub(crate) fn analyze(body: &[Stmt], params: &[String], level: u32) -> FrameSymbols {
    let mut analyzer = Analyzer {
        symbols: FrameSymbols::default(),
        declared: IndexSet::new(),
        level,
    };
    for param in params {
        analyzer.declare(param, LoadKind::Parameter);
    }
    analyzer.visit_stmts(body);
    analyzer.symbols
}

/// The names a frame reads from the context, with frame-internal special
/// bindings excluded.
pub(crate) fn undeclared_names(body: &[Stmt], params: &[String]) -> IndexSet<String> {
    analyze(body, params, 0)
        .resolved()
        .map(str::to_string)
        .collect()
}

/// The walking state for one frame.
struct Analyzer {
    /// The accumulated symbol table.
    symbols: FrameSymbols,
    /// Names currently known to be bound on this control path.
    declared: IndexSet<String>,
    /// Frame nesting depth, for reference ids.
    level: u32,
}

impl Analyzer {
    /// Records a binding.
    fn declare(&mut self, name: &str, load: LoadKind) {
        self.declared.insert(name.to_string());
        let id = format!("l_{}_{name}", self.level);
        match self.symbols.names.get_mut(name) {
            // A name that was read before its first store stays classified
            // as undefined-at-entry.
            Some(symbol) if symbol.load == LoadKind::Resolve => {
                symbol.load = LoadKind::Undefined;
            }
            Some(_) => {}
            None => {
                self.symbols.names.insert(name.to_string(), Symbol { id, load });
            }
        }
    }

    /// Records a name read.
    fn read(&mut self, name: &str) {
        if self.symbols.names.contains_key(name) {
            return;
        }
        let load = if self.declared.contains(name) {
            LoadKind::Parameter
        } else {
            LoadKind::Resolve
        };
        let id = format!("l_{}_{name}", self.level);
        self.symbols.names.insert(name.to_string(), Symbol { id, load });
    }

    /// Declares every name in a binding target.
    fn declare_target(&mut self, target: &Target, load: &LoadKind) {
        target.each_name(&mut |name| self.declare(name, load.clone()));
    }

    /// Analyzes a nested frame and surfaces its context reads into this
    /// one.
    fn nested(&mut self, body: &[Stmt], params: &[String]) {
        let mut child = Analyzer {
            symbols: FrameSymbols::default(),
            declared: IndexSet::new(),
            level: self.level + 1,
        };
        for param in params {
            child.declare(param, LoadKind::Parameter);
        }
        // The child frame sees this frame's locals.
        for name in &self.declared {
            child.declared.insert(name.clone());
        }
        child.visit_stmts(body);
        for name in child.symbols.resolved() {
            if !self.declared.contains(name) {
                self.read(name);
            }
        }
    }

    /// Walks a statement list.
    fn visit_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.visit_stmt(stmt);
        }
    }

    /// Walks one statement.
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Output(output) => {
                for item in &output.items {
                    self.visit_expr(item);
                }
            }
            Stmt::For(node) => {
                self.visit_expr(&node.iter);
                let mut params = Vec::new();
                node.target.each_name(&mut |name| params.push(name.to_string()));
                if let Some(filter) = &node.filter {
                    // The filter expression sees the loop target but not
                    // `loop` itself.
                    self.visit_expr_with_params(filter, &params);
                }
                params.push("loop".to_string());
                self.nested(&node.body, &params);
                self.visit_stmts(&node.else_body);
            }
            Stmt::If(node) => {
                let before = self.declared.clone();
                let mut merged = before.clone();
                for (cond, body) in &node.arms {
                    self.visit_expr(cond);
                    self.declared = before.clone();
                    self.visit_stmts(body);
                    merged.extend(self.declared.iter().cloned());
                }
                self.declared = before;
                self.visit_stmts(&node.else_body);
                merged.extend(self.declared.iter().cloned());
                self.declared = merged;
            }
            Stmt::Macro(node) => {
                for default in &node.defaults {
                    self.visit_expr(default);
                }
                self.nested(&node.body, &node.params);
                self.declare(&node.name, LoadKind::Parameter);
            }
            Stmt::CallBlock(node) => {
                for default in &node.defaults {
                    self.visit_expr(default);
                }
                self.visit_expr(&node.call);
                self.nested(&node.body, &node.params);
            }
            Stmt::FilterBlock(node) => {
                for filter in &node.filters {
                    self.visit_call_args(&filter.args);
                }
                self.visit_stmts(&node.body);
            }
            Stmt::Block(node) => {
                self.nested(&node.body, &[]);
            }
            Stmt::Extends(node) => self.visit_expr(&node.template),
            Stmt::Include(node) => self.visit_expr(&node.template),
            Stmt::Import(node) => {
                self.visit_expr(&node.template);
                self.declare(&node.alias, LoadKind::Alias);
            }
            Stmt::FromImport(node) => {
                self.visit_expr(&node.template);
                for (name, alias) in &node.names {
                    self.declare(alias.as_deref().unwrap_or(name), LoadKind::Alias);
                }
            }
            Stmt::Assign(node) => {
                self.visit_expr(&node.value);
                self.visit_assign_target(&node.target);
            }
            Stmt::AssignBlock(node) => {
                for filter in &node.filters {
                    self.visit_call_args(&filter.args);
                }
                self.visit_stmts(&node.body);
                self.visit_assign_target(&node.target);
            }
            Stmt::With(node) => {
                let mut params = Vec::new();
                for (target, value) in &node.bindings {
                    self.visit_expr(value);
                    target.each_name(&mut |name| params.push(name.to_string()));
                }
                self.nested(&node.body, &params);
            }
            Stmt::AutoEscape(node) => {
                self.visit_expr(&node.enabled);
                self.visit_stmts(&node.body);
            }
        }
    }

    /// Records an assignment through either target form.
    fn visit_assign_target(&mut self, target: &AssignTarget) {
        match target {
            AssignTarget::Plain(target) => self.declare_target(target, &LoadKind::Undefined),
            AssignTarget::NamespaceAttr { name, .. } => self.read(name),
        }
    }

    /// Walks an expression with extra temporarily-bound names.
    fn visit_expr_with_params(&mut self, expr: &Expr, params: &[String]) {
        let added: Vec<String> = params
            .iter()
            .filter(|p| self.declared.insert((*p).clone()))
            .cloned()
            .collect();
        self.visit_expr(expr);
        for name in added {
            self.declared.shift_remove(&name);
        }
    }

    /// Walks an expression.
    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Const(_) | Expr::TemplateData(_) => {}
            Expr::Name(node) => self.read(&node.name),
            Expr::Tuple(node) | Expr::List(node) => {
                for item in &node.items {
                    self.visit_expr(item);
                }
            }
            Expr::Dict(node) => {
                for (key, value) in &node.pairs {
                    self.visit_expr(key);
                    self.visit_expr(value);
                }
            }
            Expr::GetAttr(node) => self.visit_expr(&node.obj),
            Expr::GetItem(node) => {
                self.visit_expr(&node.obj);
                self.visit_expr(&node.index);
            }
            Expr::Slice(node) => {
                self.visit_expr(&node.obj);
                for part in [&node.start, &node.stop, &node.step].into_iter().flatten() {
                    self.visit_expr(part);
                }
            }
            Expr::Call(node) => {
                self.visit_expr(&node.callee);
                self.visit_call_args(&node.args);
            }
            Expr::Filter(node) => {
                if let Some(value) = &node.value {
                    self.visit_expr(value);
                }
                self.visit_call_args(&node.args);
            }
            Expr::Test(node) => {
                self.visit_expr(&node.value);
                self.visit_call_args(&node.args);
            }
            Expr::CondExpr(node) => {
                self.visit_expr(&node.test);
                self.visit_expr(&node.then);
                if let Some(otherwise) = &node.otherwise {
                    self.visit_expr(otherwise);
                }
            }
            Expr::BinOp(node) => {
                self.visit_expr(&node.left);
                self.visit_expr(&node.right);
            }
            Expr::Concat(node) => {
                for part in &node.parts {
                    self.visit_expr(part);
                }
            }
            Expr::Compare(node) => {
                self.visit_expr(&node.first);
                for (_, operand) in &node.rest {
                    self.visit_expr(operand);
                }
            }
            Expr::Not(node) | Expr::Neg(node) | Expr::Pos(node) => self.visit_expr(&node.expr),
        }
    }

    /// Walks call arguments.
    fn visit_call_args(&mut self, args: &crate::syntax::ast::CallArgsAst) {
        for arg in &args.positional {
            self.visit_expr(arg);
        }
        for (_, arg) in &args.named {
            self.visit_expr(arg);
        }
        if let Some(rest) = &args.var_args {
            self.visit_expr(rest);
        }
        if let Some(rest) = &args.var_kwargs {
            self.visit_expr(rest);
        }
    }
}

/// True if any statement in the body reads the given name.
pub(crate) fn reads_name(body: &[Stmt], name: &str) -> bool {
    undeclared_names(body, &[]).contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::lexer::tokenize;
    use crate::syntax::parser::parse;
    use crate::syntax::{Syntax, Whitespace};

    fn body(source: &str) -> Vec<Stmt> {
        parse(tokenize(source, &Syntax::default(), &Whitespace::default()).unwrap())
            .unwrap()
            .body
    }

    #[test]
    fn reads_before_stores_resolve_from_context() {
        let stmts = body("{{ a }}{% set a = 1 %}{{ a }}");
        let symbols = analyze(&stmts, &[], 0);
        assert_eq!(symbols.names["a"].load, LoadKind::Undefined);
    }

    #[test]
    fn plain_reads_resolve() {
        let stmts = body("{{ a + b }}");
        let undeclared = undeclared_names(&stmts, &[]);
        assert!(undeclared.contains("a") && undeclared.contains("b"));
    }

    #[test]
    fn for_targets_are_parameters() {
        let stmts = body("{% for x in seq %}{{ x }}{{ loop.index }}{% endfor %}");
        let undeclared = undeclared_names(&stmts, &[]);
        assert!(undeclared.contains("seq"));
        assert!(!undeclared.contains("x"));
        assert!(!undeclared.contains("loop"));
    }

    #[test]
    fn branch_stores_merge() {
        let stmts = body("{% if c %}{% set y = 1 %}{% endif %}{{ y }}");
        let undeclared = undeclared_names(&stmts, &[]);
        assert!(undeclared.contains("c"));
        assert!(!undeclared.contains("y"));
    }

    #[test]
    fn macro_bodies_surface_context_reads() {
        let stmts = body("{% macro m(a) %}{{ a }}{{ b }}{{ caller() }}{% endmacro %}");
        let undeclared = undeclared_names(&stmts, &[]);
        assert!(undeclared.contains("b"));
        assert!(undeclared.contains("caller"));
        assert!(!undeclared.contains("a"));
        assert!(!undeclared.contains("m"));
    }

    #[test]
    fn imports_are_aliases() {
        let stmts = body("{% import 'helpers.html' as h %}{{ h.x() }}");
        let symbols = analyze(&stmts, &[], 0);
        assert_eq!(symbols.names["h"].load, LoadKind::Alias);
        assert!(undeclared_names(&stmts, &[]).is_empty());
    }

    #[test]
    fn reference_ids_carry_the_level() {
        let stmts = body("{{ item }}");
        let symbols = analyze(&stmts, &[], 2);
        assert_eq!(symbols.names["item"].id, "l_2_item");
    }
}
