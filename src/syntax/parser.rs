//! The recursive descent template parser.
//!
//! Statements dispatch on the first identifier after a statement-tag begin
//! token. Expressions follow the documented precedence ladder, from the
//! conditional expression at the loosest down through boolean operators,
//! chained comparisons, `~` concatenation, arithmetic, unary operators,
//! `**`, tests, filters, and postfix operations.

use super::ast::{
    Assign, AssignBlock, AssignTarget, AutoEscape, BinOp, BinOpKind, Block, Call, CallArgsAst,
    CallBlock, CmpOp, Compare, CondExpr, Const, Dict, Expr, Extends, Filter, FilterBlock,
    FilterCall, For, FromImport, GetAttr, GetItem, If, Import, Include, Macro, NameRef, Output,
    Seq, Slice, Stmt, Target, TemplateAst, TemplateData, Test, Unary, With,
};
use super::lexer::{Op, Token, TokenKind};
use crate::error::SyntaxError;
use crate::value::Value;
use std::rc::Rc;

/// Names that can never be assignment targets.
static RESERVED_TARGETS: phf::Set<&'static str> = phf::phf_set! {
    "true", "false", "none", "True", "False", "None",
};

/// Parses a token stream into a template AST.
pub(crate) fn parse(tokens: Vec<Token<'_>>) -> Result<TemplateAst, SyntaxError> {
    let mut parser = Parser { tokens, pos: 0 };
    let body = parser.subparse(&[])?;
    match parser.peek() {
        TokenKind::Eof => Ok(TemplateAst { body }),
        other => Err(SyntaxError::new(
            format!("unexpected {}", other.describe()),
            parser.line(),
        )),
    }
}

/// The parser state: the token stream and a cursor.
struct Parser<'src> {
    /// The tokens, terminated by an EOF token.
    tokens: Vec<Token<'src>>,
    /// The cursor. Look-ahead peeks relative to it; pushback rewinds it.
    pos: usize,
}

impl<'src> Parser<'src> {
    /// The current token kind.
    fn peek(&self) -> &TokenKind<'src> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    /// The token kind after the current one.
    fn peek2(&self) -> &TokenKind<'src> {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].kind
    }

    /// The current line.
    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    /// Advances past the current token.
    fn bump(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    /// Takes ownership of the current token's payload and advances.
    fn take(&mut self) -> TokenKind<'src> {
        let index = self.pos.min(self.tokens.len() - 1);
        let kind = std::mem::replace(&mut self.tokens[index].kind, TokenKind::Eof);
        self.bump();
        kind
    }

    /// Builds an "unexpected token" error.
    fn unexpected<T>(&self, expected: &str) -> Result<T, SyntaxError> {
        Err(SyntaxError::new(
            format!("unexpected {}, expected {expected}", self.peek().describe()),
            self.line(),
        ))
    }

    /// Consumes a name token.
    fn expect_name(&mut self, expected: &str) -> Result<&'src str, SyntaxError> {
        match self.peek() {
            TokenKind::Name(name) => {
                let name = *name;
                self.bump();
                Ok(name)
            }
            _ => self.unexpected(expected),
        }
    }

    /// Consumes a specific keyword.
    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SyntaxError> {
        match self.peek() {
            TokenKind::Name(name) if *name == keyword => {
                self.bump();
                Ok(())
            }
            _ => self.unexpected(&format!("'{keyword}'")),
        }
    }

    /// Consumes a keyword if present.
    fn skip_name(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), TokenKind::Name(name) if *name == keyword) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Consumes an operator token.
    fn expect_op(&mut self, op: Op) -> Result<(), SyntaxError> {
        match self.peek() {
            TokenKind::Op(found) if *found == op => {
                self.bump();
                Ok(())
            }
            _ => self.unexpected(&format!("'{op}'")),
        }
    }

    /// Consumes an operator if present.
    fn skip_op(&mut self, op: Op) -> bool {
        if matches!(self.peek(), TokenKind::Op(found) if *found == op) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Consumes the end of a statement tag.
    fn expect_block_end(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            TokenKind::BlockEnd => {
                self.bump();
                Ok(())
            }
            _ => self.unexpected("end of statement block"),
        }
    }

    /// Parses statements until one of the given end tags.
    ///
    /// On return the cursor sits on the end tag's name token, with the tag
    /// begin already consumed; the caller consumes the name and the tag
    /// end. With no end tags, parses to the end of the template.
    fn subparse(&mut self, end_names: &[&str]) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        let mut output: Vec<Expr> = Vec::new();
        let mut output_line = self.line();

        macro_rules! flush {
            () => {
                if !output.is_empty() {
                    body.push(Stmt::Output(Output {
                        items: std::mem::take(&mut output),
                        line: output_line,
                    }));
                }
            };
        }

        loop {
            match self.peek() {
                TokenKind::Data(_) => {
                    let line = self.line();
                    let TokenKind::Data(text) = self.take() else {
                        unreachable!();
                    };
                    if output.is_empty() {
                        output_line = line;
                    }
                    output.push(Expr::TemplateData(TemplateData { text, line }));
                }
                TokenKind::VariableBegin => {
                    let line = self.line();
                    self.bump();
                    if output.is_empty() {
                        output_line = line;
                    }
                    let expr = self.parse_tuple(true, &[])?;
                    match self.peek() {
                        TokenKind::VariableEnd => self.bump(),
                        _ => return self.unexpected("end of print statement"),
                    }
                    output.push(expr);
                }
                TokenKind::BlockBegin => {
                    flush!();
                    self.bump();
                    if let TokenKind::Name(name) = self.peek()
                        && end_names.contains(name)
                    {
                        return Ok(body);
                    }
                    let stmt = self.parse_statement()?;
                    body.push(stmt);
                }
                TokenKind::Eof => {
                    flush!();
                    if end_names.is_empty() {
                        return Ok(body);
                    }
                    return Err(SyntaxError::new(
                        format!(
                            "unexpected end of template, expected {}",
                            end_names
                                .iter()
                                .map(|n| format!("'{n}'"))
                                .collect::<Vec<_>>()
                                .join(" or ")
                        ),
                        self.line(),
                    ));
                }
                _ => return self.unexpected("template data or tag"),
            }
        }
    }

    /// Parses one statement, dispatching on the tag name.
    fn parse_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        let name = self.expect_name("statement name")?;
        match name {
            "for" => self.parse_for(line),
            "if" => self.parse_if(line),
            "block" => self.parse_block(line),
            "extends" => {
                let template = self.parse_expression()?;
                self.expect_block_end()?;
                Ok(Stmt::Extends(Box::new(Extends { template, line })))
            }
            "include" => self.parse_include(line),
            "import" => self.parse_import(line),
            "from" => self.parse_from(line),
            "macro" => self.parse_macro(line),
            "call" => self.parse_call_block(line),
            "filter" => self.parse_filter_block(line),
            "set" => self.parse_set(line),
            "with" => self.parse_with(line),
            "autoescape" => self.parse_autoescape(line),
            name if name.starts_with("end") => Err(SyntaxError::new(
                format!("unexpected end tag '{name}'"),
                line,
            )),
            name => Err(SyntaxError::new(format!("unknown tag '{name}'"), line)),
        }
    }

    /// Parses a `for` statement after its tag name.
    fn parse_for(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let target = self.parse_target_list(&["in"])?;
        self.expect_keyword("in")?;
        let iter = self.parse_tuple(false, &["recursive"])?;
        let filter = if self.skip_name("if") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let recursive = self.skip_name("recursive");
        self.expect_block_end()?;
        let body = self.subparse(&["endfor", "else"])?;
        let mut else_body = Vec::new();
        match self.expect_name("'endfor' or 'else'")? {
            "else" => {
                self.expect_block_end()?;
                else_body = self.subparse(&["endfor"])?;
                self.expect_keyword("endfor")?;
            }
            _ => {}
        }
        self.expect_block_end()?;
        Ok(Stmt::For(Box::new(For {
            target,
            iter,
            filter,
            body,
            else_body,
            recursive,
            line,
        })))
    }

    /// Parses an `if` statement after its tag name.
    fn parse_if(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let mut arms = Vec::new();
        let mut else_body = Vec::new();
        loop {
            let cond = self.parse_tuple(false, &[])?;
            self.expect_block_end()?;
            let body = self.subparse(&["elif", "else", "endif"])?;
            arms.push((cond, body));
            match self.expect_name("'elif', 'else' or 'endif'")? {
                "elif" => {}
                "else" => {
                    self.expect_block_end()?;
                    else_body = self.subparse(&["endif"])?;
                    self.expect_keyword("endif")?;
                    break;
                }
                _ => break,
            }
        }
        self.expect_block_end()?;
        Ok(Stmt::If(Box::new(If {
            arms,
            else_body,
            line,
        })))
    }

    /// Parses a `block` statement after its tag name.
    fn parse_block(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let name = self.expect_name("block name")?;
        let mut scoped = false;
        let mut required = false;
        while let TokenKind::Name(modifier @ ("scoped" | "required")) = self.peek() {
            let seen = match *modifier {
                "scoped" => &mut scoped,
                _ => &mut required,
            };
            if *seen {
                return Err(SyntaxError::new(
                    format!("block modifier '{}' used twice", modifier),
                    self.line(),
                ));
            }
            *seen = true;
            self.bump();
        }
        self.expect_block_end()?;
        let body = self.subparse(&["endblock"])?;
        self.expect_keyword("endblock")?;
        if let TokenKind::Name(trailing) = self.peek() {
            if *trailing != name {
                return Err(SyntaxError::new(
                    format!("mismatching name on endblock, expected '{name}' got '{trailing}'"),
                    self.line(),
                ));
            }
            self.bump();
        }
        self.expect_block_end()?;
        Ok(Stmt::Block(Box::new(Block {
            name: name.to_string(),
            body,
            scoped,
            required,
            line,
        })))
    }

    /// Parses an `include` statement after its tag name.
    fn parse_include(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let template = self.parse_expression()?;
        let ignore_missing = if self.skip_name("ignore") {
            self.expect_keyword("missing")?;
            true
        } else {
            false
        };
        let with_context = self.parse_context_flag(true);
        self.expect_block_end()?;
        Ok(Stmt::Include(Box::new(Include {
            template,
            with_context,
            ignore_missing,
            line,
        })))
    }

    /// Parses an `import` statement after its tag name.
    fn parse_import(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let template = self.parse_expression()?;
        self.expect_keyword("as")?;
        let alias = self.expect_name("import alias")?;
        let with_context = self.parse_context_flag(false);
        self.expect_block_end()?;
        Ok(Stmt::Import(Box::new(Import {
            template,
            alias: alias.to_string(),
            with_context,
            line,
        })))
    }

    /// Parses a `from ... import` statement after its tag name.
    fn parse_from(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let template = self.parse_expression()?;
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        let mut with_context = false;
        loop {
            if !names.is_empty() && !self.skip_op(Op::Comma) {
                break;
            }
            if matches!(self.peek(), TokenKind::Name("with" | "without"))
                && matches!(self.peek2(), TokenKind::Name("context"))
            {
                with_context = self.skip_name("with");
                if !with_context {
                    self.skip_name("without");
                }
                self.bump();
                break;
            }
            if matches!(self.peek(), TokenKind::BlockEnd) {
                break;
            }
            let name = self.expect_name("import name")?;
            if name.starts_with('_') {
                return Err(SyntaxError::new(
                    "names starting with an underscore cannot be imported",
                    self.line(),
                ));
            }
            let alias = if self.skip_name("as") {
                Some(self.expect_name("import alias")?.to_string())
            } else {
                None
            };
            names.push((name.to_string(), alias));
        }
        if names.is_empty() {
            return self.unexpected("import name");
        }
        self.expect_block_end()?;
        Ok(Stmt::FromImport(Box::new(FromImport {
            template,
            names,
            with_context,
            line,
        })))
    }

    /// Parses an optional `with context` / `without context` suffix.
    fn parse_context_flag(&mut self, default: bool) -> bool {
        if matches!(self.peek(), TokenKind::Name("with" | "without"))
            && matches!(self.peek2(), TokenKind::Name("context"))
        {
            let with_context = self.skip_name("with");
            if !with_context {
                self.skip_name("without");
            }
            self.bump();
            with_context
        } else {
            default
        }
    }

    /// Parses a macro signature: `(name, name=default, ...)`.
    fn parse_signature(&mut self) -> Result<(Vec<String>, Vec<Expr>), SyntaxError> {
        let mut params = Vec::new();
        let mut defaults = Vec::new();
        self.expect_op(Op::LParen)?;
        while !self.skip_op(Op::RParen) {
            if !params.is_empty() {
                self.expect_op(Op::Comma)?;
                if self.skip_op(Op::RParen) {
                    break;
                }
            }
            let line = self.line();
            let name = self.expect_name("parameter name")?;
            if RESERVED_TARGETS.contains(name) {
                return Err(SyntaxError::new(format!("cannot assign to '{name}'"), line));
            }
            if self.skip_op(Op::Assign) {
                defaults.push(self.parse_expression()?);
            } else if !defaults.is_empty() {
                return Err(SyntaxError::new(
                    "non-default parameter follows default parameter",
                    line,
                ));
            }
            params.push(name.to_string());
        }
        Ok((params, defaults))
    }

    /// Parses a `macro` statement after its tag name.
    fn parse_macro(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let name = self.expect_name("macro name")?;
        let (params, defaults) = self.parse_signature()?;
        self.expect_block_end()?;
        let body = self.subparse(&["endmacro"])?;
        self.expect_keyword("endmacro")?;
        self.expect_block_end()?;
        Ok(Stmt::Macro(Box::new(Macro {
            name: name.to_string(),
            params,
            defaults,
            body,
            line,
        })))
    }

    /// Parses a `call` block after its tag name.
    fn parse_call_block(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let (params, defaults) = if matches!(self.peek(), TokenKind::Op(Op::LParen)) {
            self.parse_signature()?
        } else {
            (Vec::new(), Vec::new())
        };
        let call = self.parse_expression()?;
        if !matches!(call, Expr::Call(_)) {
            return Err(SyntaxError::new("expected call", line));
        }
        self.expect_block_end()?;
        let body = self.subparse(&["endcall"])?;
        self.expect_keyword("endcall")?;
        self.expect_block_end()?;
        Ok(Stmt::CallBlock(Box::new(CallBlock {
            params,
            defaults,
            call,
            body,
            line,
        })))
    }

    /// Parses a `filter` block after its tag name.
    fn parse_filter_block(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let filters = self.parse_filter_chain()?;
        self.expect_block_end()?;
        let body = self.subparse(&["endfilter"])?;
        self.expect_keyword("endfilter")?;
        self.expect_block_end()?;
        Ok(Stmt::FilterBlock(Box::new(FilterBlock {
            filters,
            body,
            line,
        })))
    }

    /// Parses a pipe-separated chain of filter applications.
    fn parse_filter_chain(&mut self) -> Result<Vec<FilterCall>, SyntaxError> {
        let mut filters = Vec::new();
        loop {
            let line = self.line();
            let name = self.parse_dotted_name()?;
            let args = if matches!(self.peek(), TokenKind::Op(Op::LParen)) {
                self.parse_call_args()?
            } else {
                CallArgsAst::default()
            };
            filters.push(FilterCall { name, args, line });
            if !self.skip_op(Op::Pipe) {
                break;
            }
        }
        Ok(filters)
    }

    /// Parses a possibly dotted filter or test name.
    fn parse_dotted_name(&mut self) -> Result<String, SyntaxError> {
        let mut name = self.expect_name("name")?.to_string();
        while self.skip_op(Op::Dot) {
            name.push('.');
            name.push_str(self.expect_name("name")?);
        }
        Ok(name)
    }

    /// Parses a `set` statement after its tag name.
    fn parse_set(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let target = self.parse_assign_target()?;
        if self.skip_op(Op::Assign) {
            let value = self.parse_tuple(true, &[])?;
            self.expect_block_end()?;
            return Ok(Stmt::Assign(Box::new(Assign {
                target,
                value,
                line,
            })));
        }
        let filters = if self.skip_op(Op::Pipe) {
            self.parse_filter_chain()?
        } else {
            Vec::new()
        };
        self.expect_block_end()?;
        let body = self.subparse(&["endset"])?;
        self.expect_keyword("endset")?;
        self.expect_block_end()?;
        Ok(Stmt::AssignBlock(Box::new(AssignBlock {
            target,
            filters,
            body,
            line,
        })))
    }

    /// Parses the target of a `set`: a name, a namespace attribute, or an
    /// unpacking tuple.
    fn parse_assign_target(&mut self) -> Result<AssignTarget, SyntaxError> {
        if let TokenKind::Name(name) = self.peek()
            && matches!(self.peek2(), TokenKind::Op(Op::Dot))
        {
            let name = name.to_string();
            self.bump();
            self.bump();
            let attr = self.expect_name("attribute name")?;
            return Ok(AssignTarget::NamespaceAttr {
                name,
                attr: attr.to_string(),
            });
        }
        Ok(AssignTarget::Plain(self.parse_target_list(&[])?))
    }

    /// Parses a `with` statement after its tag name.
    fn parse_with(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let mut bindings = Vec::new();
        while !matches!(self.peek(), TokenKind::BlockEnd) {
            if !bindings.is_empty() {
                self.expect_op(Op::Comma)?;
            }
            let target = self.parse_target()?;
            self.expect_op(Op::Assign)?;
            let value = self.parse_expression()?;
            bindings.push((target, value));
        }
        self.expect_block_end()?;
        let body = self.subparse(&["endwith"])?;
        self.expect_keyword("endwith")?;
        self.expect_block_end()?;
        Ok(Stmt::With(Box::new(With {
            bindings,
            body,
            line,
        })))
    }

    /// Parses an `autoescape` statement after its tag name.
    fn parse_autoescape(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let enabled = self.parse_expression()?;
        self.expect_block_end()?;
        let body = self.subparse(&["endautoescape"])?;
        self.expect_keyword("endautoescape")?;
        self.expect_block_end()?;
        Ok(Stmt::AutoEscape(Box::new(AutoEscape {
            enabled,
            body,
            line,
        })))
    }

    /// Parses a comma-separated list of binding targets.
    fn parse_target_list(&mut self, end_names: &[&str]) -> Result<Target, SyntaxError> {
        let mut targets = vec![self.parse_target()?];
        let mut is_tuple = false;
        while self.skip_op(Op::Comma) {
            is_tuple = true;
            if matches!(self.peek(), TokenKind::BlockEnd | TokenKind::Op(Op::Assign))
                || matches!(self.peek(), TokenKind::Name(name) if end_names.contains(name))
            {
                break;
            }
            targets.push(self.parse_target()?);
        }
        Ok(if is_tuple || targets.len() > 1 {
            Target::Tuple(targets)
        } else {
            targets.pop().unwrap()
        })
    }

    /// Parses one binding target: a name or a parenthesized tuple.
    fn parse_target(&mut self) -> Result<Target, SyntaxError> {
        if self.skip_op(Op::LParen) {
            let target = self.parse_target_list(&[])?;
            self.expect_op(Op::RParen)?;
            return Ok(target);
        }
        let line = self.line();
        let name = self.expect_name("assignment target")?;
        if RESERVED_TARGETS.contains(name) {
            return Err(SyntaxError::new(format!("cannot assign to '{name}'"), line));
        }
        Ok(Target::Name(name.to_string()))
    }

    /// Parses a comma-delimited expression, producing a tuple when a comma
    /// appears.
    fn parse_tuple(
        &mut self,
        with_condexpr: bool,
        end_names: &[&str],
    ) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let mut items = Vec::new();
        let mut is_tuple = false;
        loop {
            if self.at_tuple_end(end_names) {
                break;
            }
            items.push(if with_condexpr {
                self.parse_expression()?
            } else {
                self.parse_or()?
            });
            if self.skip_op(Op::Comma) {
                is_tuple = true;
            } else {
                break;
            }
        }
        if !is_tuple {
            match items.len() {
                1 => return Ok(items.pop().unwrap()),
                0 => return self.unexpected("expression"),
                _ => unreachable!(),
            }
        }
        Ok(Expr::Tuple(Seq { items, line }))
    }

    /// True if the cursor sits on something that ends a tuple display.
    fn at_tuple_end(&self, end_names: &[&str]) -> bool {
        match self.peek() {
            TokenKind::VariableEnd | TokenKind::BlockEnd | TokenKind::Eof => true,
            TokenKind::Op(Op::RParen | Op::RBracket | Op::RBrace | Op::Colon) => true,
            TokenKind::Name(name) => end_names.contains(name),
            _ => false,
        }
    }

    /// Parses a full expression (the conditional expression level).
    fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let expr = self.parse_or()?;
        if self.skip_name("if") {
            let test = self.parse_or()?;
            let otherwise = if self.skip_name("else") {
                Some(self.parse_expression()?)
            } else {
                None
            };
            return Ok(Expr::CondExpr(Box::new(CondExpr {
                test,
                then: expr,
                otherwise,
                line,
            })));
        }
        Ok(expr)
    }

    /// Parses `or` chains.
    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_and()?;
        while self.skip_name("or") {
            let line = left.line();
            let right = self.parse_and()?;
            left = Expr::BinOp(Box::new(BinOp {
                op: BinOpKind::Or,
                left,
                right,
                line,
            }));
        }
        Ok(left)
    }

    /// Parses `and` chains.
    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_not()?;
        while self.skip_name("and") {
            let line = left.line();
            let right = self.parse_not()?;
            left = Expr::BinOp(Box::new(BinOp {
                op: BinOpKind::And,
                left,
                right,
                line,
            }));
        }
        Ok(left)
    }

    /// Parses `not` prefixes.
    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if matches!(self.peek(), TokenKind::Name("not"))
            && !matches!(self.peek2(), TokenKind::Name("in"))
        {
            let line = self.line();
            self.bump();
            let expr = self.parse_not()?;
            return Ok(Expr::Not(Box::new(Unary { expr, line })));
        }
        self.parse_compare()
    }

    /// Parses chained comparisons.
    fn parse_compare(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let first = self.parse_concat()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                TokenKind::Op(Op::Eq) => CmpOp::Eq,
                TokenKind::Op(Op::Ne) => CmpOp::Ne,
                TokenKind::Op(Op::Lt) => CmpOp::Lt,
                TokenKind::Op(Op::Le) => CmpOp::Le,
                TokenKind::Op(Op::Gt) => CmpOp::Gt,
                TokenKind::Op(Op::Ge) => CmpOp::Ge,
                TokenKind::Name("in") => CmpOp::In,
                TokenKind::Name("not") if matches!(self.peek2(), TokenKind::Name("in")) => {
                    self.bump();
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.bump();
            rest.push((op, self.parse_concat()?));
        }
        if rest.is_empty() {
            return Ok(first);
        }
        Ok(Expr::Compare(Box::new(Compare { first, rest, line })))
    }

    /// Parses `~` concatenation chains.
    fn parse_concat(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        let first = self.parse_math1()?;
        if !matches!(self.peek(), TokenKind::Op(Op::Tilde)) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.skip_op(Op::Tilde) {
            parts.push(self.parse_math1()?);
        }
        Ok(Expr::Concat(Box::new(super::ast::Concat { parts, line })))
    }

    /// Parses additive chains.
    fn parse_math1(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_math2()?;
        loop {
            let op = match self.peek() {
                TokenKind::Op(Op::Add) => BinOpKind::Add,
                TokenKind::Op(Op::Sub) => BinOpKind::Sub,
                _ => break,
            };
            let line = self.line();
            self.bump();
            let right = self.parse_math2()?;
            left = Expr::BinOp(Box::new(BinOp {
                op,
                left,
                right,
                line,
            }));
        }
        Ok(left)
    }

    /// Parses multiplicative chains.
    fn parse_math2(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Op(Op::Mul) => BinOpKind::Mul,
                TokenKind::Op(Op::Div) => BinOpKind::Div,
                TokenKind::Op(Op::FloorDiv) => BinOpKind::FloorDiv,
                TokenKind::Op(Op::Mod) => BinOpKind::Mod,
                _ => break,
            };
            let line = self.line();
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::BinOp(Box::new(BinOp {
                op,
                left,
                right,
                line,
            }));
        }
        Ok(left)
    }

    /// Parses unary `-`/`+` prefixes.
    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        if self.skip_op(Op::Sub) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(Unary { expr, line })));
        }
        if self.skip_op(Op::Add) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Pos(Box::new(Unary { expr, line })));
        }
        self.parse_pow()
    }

    /// Parses `**`, which is right-associative.
    fn parse_pow(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.parse_filtered()?;
        if matches!(self.peek(), TokenKind::Op(Op::Pow)) {
            let line = self.line();
            self.bump();
            let right = self.parse_unary()?;
            return Ok(Expr::BinOp(Box::new(BinOp {
                op: BinOpKind::Pow,
                left,
                right,
                line,
            })));
        }
        Ok(left)
    }

    /// Parses filter (`|`) and test (`is`) applications.
    fn parse_filtered(&mut self) -> Result<Expr, SyntaxError> {
        let mut node = self.parse_postfix()?;
        loop {
            if self.skip_op(Op::Pipe) {
                let line = self.line();
                let name = self.parse_dotted_name()?;
                let args = if matches!(self.peek(), TokenKind::Op(Op::LParen)) {
                    self.parse_call_args()?
                } else {
                    CallArgsAst::default()
                };
                node = Expr::Filter(Box::new(Filter {
                    value: Some(node),
                    name,
                    args,
                    line,
                }));
            } else if matches!(self.peek(), TokenKind::Name("is")) {
                self.bump();
                let line = self.line();
                let negated = self.skip_name("not");
                let name = self.parse_dotted_name()?;
                let args = self.parse_test_args()?;
                node = Expr::Test(Box::new(Test {
                    value: node,
                    name,
                    args,
                    negated,
                    line,
                }));
            } else {
                return Ok(node);
            }
        }
    }

    /// Parses the arguments of a test: a parenthesized list, or a single
    /// primary expression (`x is divisibleby 3`).
    fn parse_test_args(&mut self) -> Result<CallArgsAst, SyntaxError> {
        if matches!(self.peek(), TokenKind::Op(Op::LParen)) {
            return self.parse_call_args();
        }
        let arg_follows = match self.peek() {
            TokenKind::Str(_)
            | TokenKind::Int(_)
            | TokenKind::BigInt(_)
            | TokenKind::Float(_) => true,
            TokenKind::Op(Op::LBracket | Op::LBrace) => true,
            TokenKind::Name(name) => {
                !matches!(*name, "else" | "or" | "and" | "if" | "is" | "in" | "not")
            }
            _ => false,
        };
        let mut args = CallArgsAst::default();
        if arg_follows {
            args.positional.push(self.parse_primary()?);
        }
        Ok(args)
    }

    /// Parses postfix operations: attribute access, subscripts, slices,
    /// and calls.
    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                TokenKind::Op(Op::Dot) => {
                    let line = self.line();
                    self.bump();
                    let name = self.expect_name("attribute name")?;
                    node = Expr::GetAttr(Box::new(GetAttr {
                        obj: node,
                        name: name.to_string(),
                        line,
                    }));
                }
                TokenKind::Op(Op::LBracket) => {
                    let line = self.line();
                    self.bump();
                    node = self.parse_subscript(node, line)?;
                }
                TokenKind::Op(Op::LParen) => {
                    let line = self.line();
                    let args = self.parse_call_args()?;
                    node = Expr::Call(Box::new(Call {
                        callee: node,
                        args,
                        line,
                    }));
                }
                _ => return Ok(node),
            }
        }
    }

    /// Parses the inside of a `[...]` subscript, which may be an index or a
    /// slice.
    fn parse_subscript(&mut self, obj: Expr, line: u32) -> Result<Expr, SyntaxError> {
        let mut parts: [Option<Expr>; 3] = [None, None, None];
        let mut slot = 0;
        let mut is_slice = false;
        loop {
            if self.skip_op(Op::Colon) {
                is_slice = true;
                slot += 1;
                if slot > 2 {
                    return self.unexpected("']'");
                }
                continue;
            }
            if self.skip_op(Op::RBracket) {
                break;
            }
            if parts[slot].is_some() {
                return self.unexpected("':' or ']'");
            }
            parts[slot] = Some(self.parse_expression()?);
        }
        let [start, stop, step] = parts;
        if is_slice {
            Ok(Expr::Slice(Box::new(Slice {
                obj,
                start,
                stop,
                step,
                line,
            })))
        } else {
            match start {
                Some(index) => Ok(Expr::GetItem(Box::new(GetItem { obj, index, line }))),
                None => self.unexpected("subscript expression"),
            }
        }
    }

    /// Parses a parenthesized call argument list, including the `*args` and
    /// `**kwargs` expansions.
    fn parse_call_args(&mut self) -> Result<CallArgsAst, SyntaxError> {
        self.expect_op(Op::LParen)?;
        let mut args = CallArgsAst::default();
        let mut first = true;
        loop {
            if self.skip_op(Op::RParen) {
                break;
            }
            if !first {
                self.expect_op(Op::Comma)?;
                if self.skip_op(Op::RParen) {
                    break;
                }
            }
            first = false;

            if self.skip_op(Op::Pow) {
                if args.var_kwargs.is_some() {
                    return self.unexpected("')'");
                }
                args.var_kwargs = Some(Box::new(self.parse_expression()?));
            } else if self.skip_op(Op::Mul) {
                if args.var_args.is_some() || args.var_kwargs.is_some() {
                    return Err(SyntaxError::new(
                        "invalid argument order in call",
                        self.line(),
                    ));
                }
                args.var_args = Some(Box::new(self.parse_expression()?));
            } else if let TokenKind::Name(name) = self.peek()
                && matches!(self.peek2(), TokenKind::Op(Op::Assign))
            {
                let name = name.to_string();
                self.bump();
                self.bump();
                let value = self.parse_expression()?;
                args.named.push((name, value));
            } else {
                if !args.named.is_empty() || args.var_args.is_some() || args.var_kwargs.is_some() {
                    return Err(SyntaxError::new(
                        "positional argument follows keyword argument",
                        self.line(),
                    ));
                }
                args.positional.push(self.parse_expression()?);
            }
        }
        Ok(args)
    }

    /// Parses an atom: a literal, a name, or a bracketed display.
    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        match self.peek() {
            TokenKind::Name(name) => {
                let value = match *name {
                    "true" | "True" => Some(Value::Bool(true)),
                    "false" | "False" => Some(Value::Bool(false)),
                    "none" | "None" => Some(Value::None),
                    _ => None,
                };
                let name = name.to_string();
                self.bump();
                Ok(match value {
                    Some(value) => Expr::Const(Const { value, line }),
                    None => Expr::Name(NameRef { name, line }),
                })
            }
            TokenKind::Str(_) => {
                let TokenKind::Str(mut text) = self.take() else {
                    unreachable!();
                };
                // Adjacent string literals concatenate.
                while let TokenKind::Str(_) = self.peek() {
                    let TokenKind::Str(next) = self.take() else {
                        unreachable!();
                    };
                    text.push_str(&next);
                }
                Ok(Expr::Const(Const {
                    value: Value::Str(Rc::from(text)),
                    line,
                }))
            }
            TokenKind::Int(v) => {
                let value = Value::Int(*v);
                self.bump();
                Ok(Expr::Const(Const { value, line }))
            }
            TokenKind::BigInt(_) => {
                let TokenKind::BigInt(v) = self.take() else {
                    unreachable!();
                };
                Ok(Expr::Const(Const {
                    value: Value::from(v),
                    line,
                }))
            }
            TokenKind::Float(v) => {
                let value = Value::Float(*v);
                self.bump();
                Ok(Expr::Const(Const { value, line }))
            }
            TokenKind::Op(Op::LParen) => {
                self.bump();
                if self.skip_op(Op::RParen) {
                    return Ok(Expr::Tuple(Seq {
                        items: Vec::new(),
                        line,
                    }));
                }
                let expr = self.parse_tuple(true, &[])?;
                self.expect_op(Op::RParen)?;
                Ok(expr)
            }
            TokenKind::Op(Op::LBracket) => {
                self.bump();
                let mut items = Vec::new();
                loop {
                    if self.skip_op(Op::RBracket) {
                        break;
                    }
                    if !items.is_empty() {
                        self.expect_op(Op::Comma)?;
                        if self.skip_op(Op::RBracket) {
                            break;
                        }
                    }
                    items.push(self.parse_expression()?);
                }
                Ok(Expr::List(Seq { items, line }))
            }
            TokenKind::Op(Op::LBrace) => {
                self.bump();
                let mut pairs = Vec::new();
                loop {
                    if self.skip_op(Op::RBrace) {
                        break;
                    }
                    if !pairs.is_empty() {
                        self.expect_op(Op::Comma)?;
                        if self.skip_op(Op::RBrace) {
                            break;
                        }
                    }
                    let key = self.parse_expression()?;
                    self.expect_op(Op::Colon)?;
                    let value = self.parse_expression()?;
                    pairs.push((key, value));
                }
                Ok(Expr::Dict(Dict { pairs, line }))
            }
            _ => self.unexpected("expression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::super::{Syntax, Whitespace};
    use super::*;

    fn parse_source(source: &str) -> Result<TemplateAst, SyntaxError> {
        parse(tokenize(source, &Syntax::default(), &Whitespace::default()).unwrap())
    }

    fn parse_expr(source: &str) -> Expr {
        let ast = parse_source(&format!("{{{{ {source} }}}}")).unwrap();
        let mut body = ast.body;
        assert_eq!(body.len(), 1);
        match body.pop().unwrap() {
            Stmt::Output(mut output) => {
                assert_eq!(output.items.len(), 1);
                output.items.pop().unwrap()
            }
            other => panic!("expected output statement, got {other:?}"),
        }
    }

    #[test]
    fn operator_precedence() {
        // `1 + 2 * 3` parses as `1 + (2 * 3)`.
        let expr = parse_expr("1 + 2 * 3");
        let Expr::BinOp(add) = expr else {
            panic!("expected binop");
        };
        assert_eq!(add.op, BinOpKind::Add);
        let Expr::BinOp(mul) = &add.right else {
            panic!("expected nested mul");
        };
        assert_eq!(mul.op, BinOpKind::Mul);
    }

    #[test]
    fn concat_binds_looser_than_additive() {
        // `a ~ b + c` parses as `a ~ (b + c)`.
        let Expr::Concat(concat) = parse_expr("a ~ b + c") else {
            panic!("expected concat");
        };
        assert_eq!(concat.parts.len(), 2);
        assert!(matches!(concat.parts[1], Expr::BinOp(_)));
    }

    #[test]
    fn pow_is_right_associative() {
        let Expr::BinOp(outer) = parse_expr("2 ** 3 ** 2") else {
            panic!("expected pow");
        };
        assert_eq!(outer.op, BinOpKind::Pow);
        assert!(matches!(&outer.right, Expr::BinOp(inner) if inner.op == BinOpKind::Pow));
    }

    #[test]
    fn unary_minus_binds_looser_than_pow() {
        let Expr::Neg(neg) = parse_expr("-2 ** 2") else {
            panic!("expected negation at the top");
        };
        assert!(matches!(&neg.expr, Expr::BinOp(inner) if inner.op == BinOpKind::Pow));
    }

    #[test]
    fn chained_comparison() {
        let Expr::Compare(cmp) = parse_expr("1 < x <= 10") else {
            panic!("expected comparison");
        };
        assert_eq!(cmp.rest.len(), 2);
        assert_eq!(cmp.rest[0].0, CmpOp::Lt);
        assert_eq!(cmp.rest[1].0, CmpOp::Le);
    }

    #[test]
    fn not_in_is_one_operator() {
        let Expr::Compare(cmp) = parse_expr("x not in [1, 2]") else {
            panic!("expected comparison");
        };
        assert_eq!(cmp.rest[0].0, CmpOp::NotIn);
    }

    #[test]
    fn filters_and_tests() {
        let Expr::Test(test) = parse_expr("x | default(1) is divisibleby 3") else {
            panic!("expected test at the top");
        };
        assert_eq!(test.name, "divisibleby");
        assert_eq!(test.args.positional.len(), 1);
        assert!(matches!(&test.value, Expr::Filter(f) if f.name == "default"));
    }

    #[test]
    fn slices_and_subscripts() {
        assert!(matches!(parse_expr("a[1]"), Expr::GetItem(_)));
        let Expr::Slice(slice) = parse_expr("a[1:2:3]") else {
            panic!("expected slice");
        };
        assert!(slice.start.is_some() && slice.stop.is_some() && slice.step.is_some());
        let Expr::Slice(slice) = parse_expr("a[:2]") else {
            panic!("expected slice");
        };
        assert!(slice.start.is_none() && slice.stop.is_some() && slice.step.is_none());
    }

    #[test]
    fn single_element_tuple_needs_trailing_comma() {
        assert!(matches!(parse_expr("(1)"), Expr::Const(_)));
        let Expr::Tuple(tuple) = parse_expr("(1,)") else {
            panic!("expected tuple");
        };
        assert_eq!(tuple.items.len(), 1);
        let Expr::Tuple(empty) = parse_expr("()") else {
            panic!("expected empty tuple");
        };
        assert!(empty.items.is_empty());
    }

    #[test]
    fn call_argument_order_is_enforced() {
        assert!(parse_source("{{ f(1, a=2, *rest, **kw) }}").is_ok());
        let err = parse_source("{{ f(a=1, 2) }}").unwrap_err();
        assert!(err.message.contains("positional argument"));
    }

    #[test]
    fn statement_structure() {
        let ast = parse_source(
            "{% for x in seq if x recursive %}{{ x }}{% else %}none{% endfor %}",
        )
        .unwrap();
        let [Stmt::For(for_stmt)] = &ast.body[..] else {
            panic!("expected for");
        };
        assert!(for_stmt.recursive);
        assert!(for_stmt.filter.is_some());
        assert_eq!(for_stmt.else_body.len(), 1);
    }

    #[test]
    fn block_modifiers() {
        let ast = parse_source("{% block x required scoped %}{% endblock x %}").unwrap();
        let [Stmt::Block(block)] = &ast.body[..] else {
            panic!("expected block");
        };
        assert!(block.scoped && block.required);

        let err = parse_source("{% block x scoped scoped %}{% endblock %}").unwrap_err();
        assert!(err.message.contains("used twice"));

        let err = parse_source("{% block x %}{% endblock y %}").unwrap_err();
        assert!(err.message.contains("mismatching name"));
    }

    #[test]
    fn mismatched_end_tag() {
        let err = parse_source("{% if x %}{% endfor %}").unwrap_err();
        assert!(err.message.contains("unexpected"), "{}", err.message);
    }

    #[test]
    fn unknown_tag() {
        let err = parse_source("{% flub %}").unwrap_err();
        assert!(err.message.contains("unknown tag 'flub'"));
    }

    #[test]
    fn set_variants() {
        assert!(matches!(
            parse_source("{% set a = 1 %}").unwrap().body[..],
            [Stmt::Assign(_)]
        ));
        assert!(matches!(
            parse_source("{% set ns.attr = 1 %}").unwrap().body[..],
            [Stmt::Assign(_)]
        ));
        assert!(matches!(
            parse_source("{% set a | upper %}x{% endset %}").unwrap().body[..],
            [Stmt::AssignBlock(_)]
        ));
    }

    #[test]
    fn from_import_rejects_underscore_names() {
        let err = parse_source("{% from 'm' import _secret %}").unwrap_err();
        assert!(err.message.contains("underscore"));
    }

    #[test]
    fn extends_and_includes() {
        let ast = parse_source(
            "{% extends base %}{% include ['a', 'b'] ignore missing without context %}",
        )
        .unwrap();
        let [Stmt::Extends(_), Stmt::Include(include)] = &ast.body[..] else {
            panic!("expected extends + include");
        };
        assert!(include.ignore_missing);
        assert!(!include.with_context);
    }

    #[test]
    fn reserved_assignment_targets() {
        let err = parse_source("{% set true = 1 %}").unwrap_err();
        assert!(err.message.contains("cannot assign to 'true'"));
    }

    #[test]
    fn deeply_chained_elifs_stay_flat() {
        let mut source = String::from("{% if a %}0");
        for i in 0..500 {
            source.push_str(&format!("{{% elif a{i} %}}{i}"));
        }
        source.push_str("{% endif %}");
        let ast = parse_source(&source).unwrap();
        let [Stmt::If(if_stmt)] = &ast.body[..] else {
            panic!("expected if");
        };
        assert_eq!(if_stmt.arms.len(), 501);
    }

    #[test]
    fn conditional_expression() {
        let Expr::CondExpr(cond) = parse_expr("'a' if x else 'b'") else {
            panic!("expected conditional expression");
        };
        assert!(cond.otherwise.is_some());
    }

    #[test]
    fn adjacent_strings_concatenate() {
        let Expr::Const(c) = parse_expr("'a' 'b'") else {
            panic!("expected const");
        };
        assert_eq!(c.value.as_str(), Some("ab"));
    }
}
