//! The template lexer.
//!
//! The lexer walks the source in two alternating modes. In data mode it
//! scans for the earliest start delimiter with precomputed substring
//! finders, emitting the literal text in between (with whitespace controls
//! and newline normalization applied). In expression mode it tokenizes
//! names, literals, and operators until the matching end delimiter is seen
//! at bracket depth zero.
//!
//! Comments are consumed and never reach the parser. `{% raw %}` sections
//! pass through verbatim as a single data token.

use super::{Newline, Syntax, Whitespace, idents};
use crate::error::SyntaxError;
use memchr::memmem;
use num_bigint::BigInt;
use std::fmt;

/// A punctuation or operator token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Op {
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
    /// `~`
    Tilde,
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
    /// `=`
    Assign,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `.`
    Dot,
    /// `,`
    Comma,
    /// `:`
    Colon,
    /// `|`
    Pipe,
    /// `;`
    Semicolon,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::Tilde => "~",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Assign => "=",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::Dot => ".",
            Self::Comma => ",",
            Self::Colon => ":",
            Self::Pipe => "|",
            Self::Semicolon => ";",
        })
    }
}

/// Two-character operators, matched before single characters.
static OPERATORS2: phf::Map<&'static str, Op> = phf::phf_map! {
    "//" => Op::FloorDiv,
    "**" => Op::Pow,
    "==" => Op::Eq,
    "!=" => Op::Ne,
    "<=" => Op::Le,
    ">=" => Op::Ge,
};

/// Single-character operators.
static OPERATORS1: phf::Map<&'static str, Op> = phf::phf_map! {
    "+" => Op::Add,
    "-" => Op::Sub,
    "*" => Op::Mul,
    "/" => Op::Div,
    "%" => Op::Mod,
    "~" => Op::Tilde,
    "<" => Op::Lt,
    ">" => Op::Gt,
    "=" => Op::Assign,
    "(" => Op::LParen,
    ")" => Op::RParen,
    "[" => Op::LBracket,
    "]" => Op::RBracket,
    "{" => Op::LBrace,
    "}" => Op::RBrace,
    "." => Op::Dot,
    "," => Op::Comma,
    ":" => Op::Colon,
    "|" => Op::Pipe,
    ";" => Op::Semicolon,
};

/// A lexed token.
#[derive(Debug, PartialEq)]
pub(crate) struct Token<'src> {
    /// The token payload.
    pub kind: TokenKind<'src>,
    /// The 1-indexed source line the token starts on.
    pub line: u32,
}

/// The payload of a token.
#[derive(Debug, PartialEq)]
pub(crate) enum TokenKind<'src> {
    /// Literal template data, already normalized and trimmed.
    Data(String),
    /// The start of a statement tag.
    BlockBegin,
    /// The end of a statement tag.
    BlockEnd,
    /// The start of a print expression.
    VariableBegin,
    /// The end of a print expression.
    VariableEnd,
    /// An identifier or keyword.
    Name(&'src str),
    /// A string literal, with escapes resolved.
    Str(String),
    /// An integer literal.
    Int(i64),
    /// An integer literal exceeding the machine width.
    BigInt(BigInt),
    /// A float literal.
    Float(f64),
    /// An operator or punctuation.
    Op(Op),
    /// The end of the token stream.
    Eof,
}

impl TokenKind<'_> {
    /// A short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Data(_) => "template data".to_string(),
            Self::BlockBegin => "begin of statement block".to_string(),
            Self::BlockEnd => "end of statement block".to_string(),
            Self::VariableBegin => "begin of print statement".to_string(),
            Self::VariableEnd => "end of print statement".to_string(),
            Self::Name(name) => format!("'{name}'"),
            Self::Str(_) => "string literal".to_string(),
            Self::Int(_) | Self::BigInt(_) => "integer literal".to_string(),
            Self::Float(_) => "float literal".to_string(),
            Self::Op(op) => format!("'{op}'"),
            Self::Eof => "end of template".to_string(),
        }
    }
}

/// Which kind of tag a start delimiter opened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TagKind {
    /// `{{ ... }}`
    Variable,
    /// `{% ... %}`
    Block,
    /// `{# ... #}`
    Comment,
    /// A line statement.
    LineStatement,
    /// A line comment.
    LineComment,
}

/// What terminates the current expression region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExprEnd {
    /// The variable end delimiter.
    Variable,
    /// The block end delimiter.
    Block,
    /// The end of the line (line statements).
    Line,
}

/// A located tag start.
struct TagMatch {
    /// The tag kind.
    kind: TagKind,
    /// The byte position of the delimiter (or prefix).
    start: usize,
    /// The delimiter length.
    len: usize,
}

/// Tokenizes a template source.
pub(crate) fn tokenize<'src>(
    source: &'src str,
    syntax: &Syntax,
    ws: &Whitespace,
) -> Result<Vec<Token<'src>>, SyntaxError> {
    let source = if ws.keep_trailing_newline {
        source
    } else if let Some(stripped) = source.strip_suffix("\r\n") {
        stripped
    } else if let Some(stripped) = source.strip_suffix(['\n', '\r']) {
        stripped
    } else {
        source
    };

    let mut lexer = Lexer {
        source,
        syntax,
        ws,
        find_var: memmem::Finder::new(syntax.variable_start.as_bytes()),
        find_block: memmem::Finder::new(syntax.block_start.as_bytes()),
        find_comment: memmem::Finder::new(syntax.comment_start.as_bytes()),
        pos: 0,
        line: 1,
        at_line_start: true,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

/// The lexer state.
struct Lexer<'env, 'src> {
    /// The source text (with the trailing newline already policy-trimmed).
    source: &'src str,
    /// The delimiter configuration.
    syntax: &'env Syntax,
    /// The whitespace policy.
    ws: &'env Whitespace,
    /// Finder for the variable start delimiter.
    find_var: memmem::Finder<'env>,
    /// Finder for the block start delimiter.
    find_block: memmem::Finder<'env>,
    /// Finder for the comment start delimiter.
    find_comment: memmem::Finder<'env>,
    /// The current byte position.
    pos: usize,
    /// The current 1-indexed line.
    line: u32,
    /// Whether only whitespace has been seen since the last newline.
    at_line_start: bool,
    /// The produced tokens.
    tokens: Vec<Token<'src>>,
}

impl<'src> Lexer<'_, 'src> {
    /// Runs the lexer to completion.
    fn run(&mut self) -> Result<(), SyntaxError> {
        let source = self.source;
        while self.pos < source.len() {
            match self.find_tag() {
                Some(tag) => {
                    let segment_at_line_start = self.at_line_start;
                    let data = &source[self.pos..tag.start];
                    self.emit_data(data, &tag, segment_at_line_start);
                    self.advance_over(data);
                    self.handle_tag(&tag)?;
                }
                None => {
                    let data = &source[self.pos..];
                    self.emit_trailing_data(data);
                    self.pos = source.len();
                }
            }
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            line: self.line,
        });
        Ok(())
    }

    /// Finds the earliest tag start at or after the current position.
    fn find_tag(&self) -> Option<TagMatch> {
        let haystack = &self.source.as_bytes()[self.pos..];
        let mut best: Option<TagMatch> = None;

        let mut consider = |kind, offset: Option<usize>, len: usize| {
            if let Some(offset) = offset {
                let start = self.pos + offset;
                let better = match &best {
                    Some(existing) => {
                        start < existing.start || (start == existing.start && len > existing.len)
                    }
                    None => true,
                };
                if better {
                    best = Some(TagMatch { kind, start, len });
                }
            }
        };

        consider(
            TagKind::Variable,
            self.find_var.find(haystack),
            self.syntax.variable_start.len(),
        );
        consider(
            TagKind::Block,
            self.find_block.find(haystack),
            self.syntax.block_start.len(),
        );
        consider(
            TagKind::Comment,
            self.find_comment.find(haystack),
            self.syntax.comment_start.len(),
        );

        if let Some(prefix) = &self.syntax.line_statement_prefix {
            consider(
                TagKind::LineStatement,
                self.find_line_prefix(prefix, true),
                prefix.len(),
            );
        }
        if let Some(prefix) = &self.syntax.line_comment_prefix {
            consider(
                TagKind::LineComment,
                self.find_line_prefix(prefix, false),
                prefix.len(),
            );
        }

        best
    }

    /// Finds the next occurrence of a line prefix.
    ///
    /// Line statements must be the first non-whitespace on their line; line
    /// comments may appear anywhere.
    fn find_line_prefix(&self, prefix: &str, line_start_only: bool) -> Option<usize> {
        let finder = memmem::Finder::new(prefix.as_bytes());
        let mut from = self.pos;
        while let Some(offset) = finder.find(&self.source.as_bytes()[from..]) {
            let at = from + offset;
            if !line_start_only || self.only_blank_before(at) {
                return Some(at - self.pos);
            }
            from = at + prefix.len();
        }
        None
    }

    /// True if only horizontal whitespace sits between the start of the
    /// line (or the data segment) and `at`.
    fn only_blank_before(&self, at: usize) -> bool {
        let line_start = self.source[..at].rfind('\n').map_or_else(
            || if self.at_line_start { Some(self.pos) } else { None },
            |nl| Some(nl + 1),
        );
        line_start.is_some_and(|start| {
            self.source[start..at].bytes().all(|b| b == b' ' || b == b'\t')
        })
    }

    /// Emits a data token for the text before a tag, applying whitespace
    /// controls.
    fn emit_data(&mut self, data: &'src str, tag: &TagMatch, segment_at_line_start: bool) {
        let marker = match tag.kind {
            TagKind::Variable | TagKind::Block | TagKind::Comment => {
                self.source[tag.start + tag.len..].chars().next()
            }
            TagKind::LineStatement | TagKind::LineComment => None,
        };

        let trimmed = if marker == Some('-') {
            data.trim_end()
        } else if marker != Some('+') && self.should_lstrip(tag.kind) {
            lstrip_line(data, segment_at_line_start)
        } else {
            data
        };

        self.push_data(trimmed);
    }

    /// True if the tag kind participates in `lstrip_blocks`-style trimming.
    fn should_lstrip(&self, kind: TagKind) -> bool {
        match kind {
            TagKind::Block | TagKind::Comment => self.ws.lstrip_blocks,
            // Line statements and comments always own their leading
            // whitespace.
            TagKind::LineStatement | TagKind::LineComment => true,
            TagKind::Variable => false,
        }
    }

    /// Emits the data after the final tag.
    fn emit_trailing_data(&mut self, data: &'src str) {
        self.push_data(data);
    }

    /// Pushes a normalized data token, if anything remains.
    fn push_data(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        self.tokens.push(Token {
            kind: TokenKind::Data(normalize_newlines(data, self.ws.newline_sequence)),
            line: self.line,
        });
    }

    /// Advances the position over raw source text, tracking lines.
    fn advance_over(&mut self, text: &str) {
        self.line += count_newlines(text);
        if let Some(last_nl) = text.rfind(['\n', '\r']) {
            self.at_line_start = text[last_nl + 1..]
                .bytes()
                .all(|b| b == b' ' || b == b'\t');
        } else if !text.is_empty() {
            self.at_line_start =
                self.at_line_start && text.bytes().all(|b| b == b' ' || b == b'\t');
        }
        self.pos += text.len();
    }

    /// Dispatches on a located tag.
    fn handle_tag(&mut self, tag: &TagMatch) -> Result<(), SyntaxError> {
        debug_assert_eq!(self.pos, tag.start);
        match tag.kind {
            TagKind::Variable => {
                self.pos += tag.len;
                self.consume_marker();
                self.tokens.push(Token {
                    kind: TokenKind::VariableBegin,
                    line: self.line,
                });
                self.lex_expr(ExprEnd::Variable)?;
                Ok(())
            }
            TagKind::Block => self.handle_block_tag(tag),
            TagKind::Comment => self.handle_comment(tag),
            TagKind::LineStatement => {
                self.pos += tag.len;
                self.tokens.push(Token {
                    kind: TokenKind::BlockBegin,
                    line: self.line,
                });
                self.lex_expr(ExprEnd::Line)?;
                Ok(())
            }
            TagKind::LineComment => {
                self.pos += tag.len;
                let rest = &self.source[self.pos..];
                let end = rest.find(['\n', '\r']).unwrap_or(rest.len());
                self.pos += end;
                self.at_line_start = false;
                Ok(())
            }
        }
    }

    /// Handles a statement tag, special-casing `{% raw %}`.
    fn handle_block_tag(&mut self, tag: &TagMatch) -> Result<(), SyntaxError> {
        let open_line = self.line;
        self.pos += tag.len;
        self.consume_marker();

        // Peek for `raw`, which suspends lexing entirely.
        let save = self.pos;
        let save_line = self.line;
        self.skip_expr_whitespace();
        if let Some(name) = self.peek_name()
            && name == "raw"
        {
            self.pos += name.len();
            self.skip_expr_whitespace();
            let inner_lstrip = self.consume_block_end(open_line)?;
            return self.lex_raw_body(open_line, inner_lstrip);
        }
        self.pos = save;
        self.line = save_line;

        self.tokens.push(Token {
            kind: TokenKind::BlockBegin,
            line: open_line,
        });
        self.lex_expr(ExprEnd::Block)
    }

    /// Consumes a block end delimiter (with optional whitespace marker) and
    /// applies trailing whitespace policy. Returns true when the marker
    /// requests stripping what follows.
    fn consume_block_end(&mut self, open_line: u32) -> Result<bool, SyntaxError> {
        let rest = &self.source[self.pos..];
        let (marker, skip) = match rest.chars().next() {
            Some(c @ ('-' | '+')) if rest[1..].starts_with(&self.syntax.block_end) => {
                (Some(c), 1 + self.syntax.block_end.len())
            }
            _ if rest.starts_with(&self.syntax.block_end) => (None, self.syntax.block_end.len()),
            _ => {
                return Err(SyntaxError::new(
                    "expected 'end of statement block'",
                    open_line,
                ));
            }
        };
        self.pos += skip;
        self.strip_after_tag(marker, true);
        Ok(marker == Some('-'))
    }

    /// Lexes the body of a raw section, emitting it as one data token.
    fn lex_raw_body(&mut self, open_line: u32, lstrip: bool) -> Result<(), SyntaxError> {
        let source = self.source;
        let content_start = self.pos;
        let mut search = self.pos;
        loop {
            let Some(offset) = self.find_block.find(&source.as_bytes()[search..]) else {
                return Err(SyntaxError::new(
                    "unexpected end of template, expected 'endraw'",
                    open_line,
                ));
            };
            let candidate = search + offset;
            let mut scan = candidate + self.syntax.block_start.len();
            let mut rstrip = false;
            if let Some(c @ ('-' | '+')) = source[scan..].chars().next() {
                rstrip = c == '-';
                scan += 1;
            }
            let rest = source[scan..].trim_start();
            if let Some(after) = rest.strip_prefix("endraw") {
                let after = after.trim_start();
                let (marker, tail) = match after.chars().next() {
                    Some(c @ ('-' | '+')) if after[1..].starts_with(&self.syntax.block_end) => {
                        (Some(c), &after[1 + self.syntax.block_end.len()..])
                    }
                    _ if after.starts_with(&self.syntax.block_end) => {
                        (None, &after[self.syntax.block_end.len()..])
                    }
                    _ => {
                        search = candidate + self.syntax.block_start.len();
                        continue;
                    }
                };

                let mut content = &source[content_start..candidate];
                if lstrip {
                    content = content.trim_start();
                }
                if rstrip {
                    content = content.trim_end();
                }
                self.push_data(content);

                self.line += count_newlines(&source[content_start..candidate]);
                self.line += count_newlines(&source[candidate..source.len() - tail.len()]);
                self.pos = source.len() - tail.len();
                self.at_line_start = false;
                self.strip_after_tag(marker, true);
                return Ok(());
            }
            search = candidate + self.syntax.block_start.len();
        }
    }

    /// Handles a comment tag.
    fn handle_comment(&mut self, tag: &TagMatch) -> Result<(), SyntaxError> {
        let open_line = self.line;
        self.pos += tag.len;
        self.consume_marker();
        let finder = memmem::Finder::new(self.syntax.comment_end.as_bytes());
        let Some(offset) = finder.find(&self.source.as_bytes()[self.pos..]) else {
            return Err(SyntaxError::new("unclosed comment", open_line));
        };
        let content_end = self.pos + offset;
        let marker = match self.source[..content_end].chars().next_back() {
            Some(c @ ('-' | '+')) => Some(c),
            _ => None,
        };
        let consumed = &self.source[self.pos..content_end + self.syntax.comment_end.len()];
        self.line += count_newlines(consumed);
        self.pos = content_end + self.syntax.comment_end.len();
        self.at_line_start = false;
        self.strip_after_tag(marker, true);
        Ok(())
    }

    /// Consumes a `-`/`+` whitespace control marker after a start
    /// delimiter. The data-side effect was already applied when the
    /// preceding data token was emitted.
    fn consume_marker(&mut self) {
        if let Some('-' | '+') = self.source[self.pos..].chars().next() {
            self.pos += 1;
        }
    }

    /// Applies post-tag whitespace policy.
    ///
    /// `-` strips all following whitespace, `+` keeps everything, and
    /// otherwise `trim_blocks` consumes a single newline after statement
    /// and comment tags.
    fn strip_after_tag(&mut self, marker: Option<char>, block_like: bool) {
        match marker {
            Some('-') => {
                let rest = &self.source[self.pos..];
                let trimmed = rest.trim_start();
                let skipped = &rest[..rest.len() - trimmed.len()];
                self.line += count_newlines(skipped);
                if skipped.contains(['\n', '\r']) {
                    self.at_line_start = true;
                }
                self.pos += skipped.len();
            }
            Some(_) => {}
            None => {
                if block_like && self.ws.trim_blocks {
                    let rest = &self.source[self.pos..];
                    let skip = if rest.starts_with("\r\n") {
                        2
                    } else if rest.starts_with(['\n', '\r']) {
                        1
                    } else {
                        0
                    };
                    if skip > 0 {
                        self.line += 1;
                        self.at_line_start = true;
                        self.pos += skip;
                    }
                }
            }
        }
    }

    /// Lexes expression tokens until the end of the current tag.
    fn lex_expr(&mut self, end: ExprEnd) -> Result<(), SyntaxError> {
        let open_line = self.line;
        let mut depth = 0usize;
        loop {
            if end != ExprEnd::Line {
                self.skip_expr_whitespace();
            } else {
                // Inside brackets a line statement may span lines.
                loop {
                    let rest = &self.source[self.pos..];
                    let c = rest.chars().next();
                    match c {
                        Some(' ' | '\t') => self.pos += 1,
                        Some('\n' | '\r') if depth > 0 => {
                            let skip = if rest.starts_with("\r\n") { 2 } else { 1 };
                            self.line += 1;
                            self.pos += skip;
                        }
                        _ => break,
                    }
                }
            }

            let rest = &self.source[self.pos..];
            if rest.is_empty() {
                match end {
                    ExprEnd::Line => {
                        self.tokens.push(Token {
                            kind: TokenKind::BlockEnd,
                            line: self.line,
                        });
                        return Ok(());
                    }
                    ExprEnd::Variable => {
                        return Err(SyntaxError::new("unclosed variable tag", open_line));
                    }
                    ExprEnd::Block => {
                        return Err(SyntaxError::new("unclosed block tag", open_line));
                    }
                }
            }

            if depth == 0 {
                match end {
                    ExprEnd::Variable => {
                        if let Some(consumed) =
                            match_end_delimiter(rest, &self.syntax.variable_end)
                        {
                            self.tokens.push(Token {
                                kind: TokenKind::VariableEnd,
                                line: self.line,
                            });
                            self.pos += consumed.len;
                            self.at_line_start = false;
                            self.strip_after_tag(consumed.marker, false);
                            return Ok(());
                        }
                    }
                    ExprEnd::Block => {
                        if let Some(consumed) = match_end_delimiter(rest, &self.syntax.block_end) {
                            self.tokens.push(Token {
                                kind: TokenKind::BlockEnd,
                                line: self.line,
                            });
                            self.pos += consumed.len;
                            self.at_line_start = false;
                            self.strip_after_tag(consumed.marker, true);
                            return Ok(());
                        }
                    }
                    ExprEnd::Line => {
                        if rest.starts_with(['\n', '\r']) {
                            self.tokens.push(Token {
                                kind: TokenKind::BlockEnd,
                                line: self.line,
                            });
                            let skip = if rest.starts_with("\r\n") { 2 } else { 1 };
                            self.line += 1;
                            self.pos += skip;
                            self.at_line_start = true;
                            return Ok(());
                        }
                    }
                }
            }

            self.lex_expr_token(&mut depth)?;
        }
    }

    /// Skips whitespace inside an expression, tracking lines.
    fn skip_expr_whitespace(&mut self) {
        let rest = &self.source[self.pos..];
        let trimmed = rest.trim_start();
        let skipped = &rest[..rest.len() - trimmed.len()];
        self.line += count_newlines(skipped);
        self.pos += skipped.len();
    }

    /// Lexes one expression token.
    fn lex_expr_token(&mut self, depth: &mut usize) -> Result<(), SyntaxError> {
        let rest = &self.source[self.pos..];
        let c = rest.chars().next().expect("caller checked non-empty");

        if c == '"' || c == '\'' {
            return self.lex_string(c);
        }
        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if idents::is_ident_start(c) {
            let name = self.peek_name().expect("ident start implies a name");
            self.tokens.push(Token {
                kind: TokenKind::Name(name),
                line: self.line,
            });
            self.pos += name.len();
            return Ok(());
        }

        let (op, len) = match OPERATORS2.get(rest.get(..2).unwrap_or("")) {
            Some(op) => (*op, 2),
            None => match rest.get(..c.len_utf8()).and_then(|s| OPERATORS1.get(s)) {
                Some(op) => (*op, c.len_utf8()),
                None => {
                    return Err(SyntaxError::new(
                        format!("unexpected character {c:?}"),
                        self.line,
                    ));
                }
            },
        };

        match op {
            Op::LParen | Op::LBracket | Op::LBrace => *depth += 1,
            Op::RParen | Op::RBracket | Op::RBrace => {
                *depth = depth.checked_sub(1).ok_or_else(|| {
                    SyntaxError::new(format!("unexpected '{op}'"), self.line)
                })?;
            }
            _ => {}
        }

        self.tokens.push(Token {
            kind: TokenKind::Op(op),
            line: self.line,
        });
        self.pos += len;
        Ok(())
    }

    /// Peeks the identifier at the current position.
    fn peek_name(&self) -> Option<&'src str> {
        let source = self.source;
        let rest = &source[self.pos..];
        let first = rest.chars().next()?;
        if !idents::is_ident_start(first) {
            return None;
        }
        let end = rest
            .char_indices()
            .find(|&(_, c)| !idents::is_ident_continue(c))
            .map_or(rest.len(), |(i, _)| i);
        Some(&rest[..end])
    }

    /// Lexes a string literal.
    fn lex_string(&mut self, quote: char) -> Result<(), SyntaxError> {
        let start_line = self.line;
        let mut value = String::new();
        let mut chars = self.source[self.pos + 1..].char_indices();
        loop {
            let Some((offset, c)) = chars.next() else {
                return Err(SyntaxError::new("unterminated string literal", start_line));
            };
            match c {
                c if c == quote => {
                    self.pos += 1 + offset + c.len_utf8();
                    self.tokens.push(Token {
                        kind: TokenKind::Str(value),
                        line: start_line,
                    });
                    return Ok(());
                }
                '\\' => {
                    let Some((_, escaped)) = chars.next() else {
                        return Err(SyntaxError::new("unterminated string literal", start_line));
                    };
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '\\' | '\'' | '"' => value.push(escaped),
                        other => {
                            value.push('\\');
                            value.push(other);
                        }
                    }
                    if escaped == '\n' {
                        self.line += 1;
                    }
                }
                '\n' => {
                    self.line += 1;
                    value.push(c);
                }
                c => value.push(c),
            }
        }
    }

    /// Lexes a numeric literal.
    fn lex_number(&mut self) -> Result<(), SyntaxError> {
        let rest = &self.source[self.pos..];

        // Radix prefixes.
        for (prefix, radix) in [("0x", 16u32), ("0o", 8), ("0b", 2)] {
            if rest.len() > 2 && rest[..2].eq_ignore_ascii_case(prefix) {
                let digits: String = rest[2..]
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                    .collect();
                let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
                let value = i64::from_str_radix(&cleaned, radix)
                    .map(TokenKind::Int)
                    .or_else(|_| {
                        BigInt::parse_bytes(cleaned.as_bytes(), radix)
                            .map(TokenKind::BigInt)
                            .ok_or(())
                    })
                    .map_err(|()| {
                        SyntaxError::new(
                            format!("invalid integer literal '{prefix}{digits}'"),
                            self.line,
                        )
                    })?;
                self.tokens.push(Token {
                    kind: value,
                    line: self.line,
                });
                self.pos += 2 + digits.len();
                return Ok(());
            }
        }

        let mut end = scan_digits(rest, 0);
        let mut is_float = false;

        if rest[end..].starts_with('.')
            && rest[end + 1..].starts_with(|c: char| c.is_ascii_digit())
        {
            is_float = true;
            end = scan_digits(rest, end + 1);
        }
        if rest[end..].starts_with(['e', 'E']) {
            let mut exp = end + 1;
            if rest[exp..].starts_with(['+', '-']) {
                exp += 1;
            }
            if rest[exp..].starts_with(|c: char| c.is_ascii_digit()) {
                is_float = true;
                end = scan_digits(rest, exp);
            }
        }

        let text = &rest[..end];
        let cleaned: String = text.chars().filter(|c| *c != '_').collect();
        let kind = if is_float {
            cleaned
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| SyntaxError::new(format!("invalid float literal '{text}'"), self.line))?
        } else {
            match cleaned.parse::<i64>() {
                Ok(value) => TokenKind::Int(value),
                Err(_) => BigInt::parse_bytes(cleaned.as_bytes(), 10)
                    .map(TokenKind::BigInt)
                    .ok_or_else(|| {
                        SyntaxError::new(format!("invalid decimal literal '{text}'"), self.line)
                    })?,
            }
        };
        self.tokens.push(Token {
            kind,
            line: self.line,
        });
        self.pos += end;
        Ok(())
    }
}

/// A matched end delimiter with its whitespace control marker.
struct EndMatch {
    /// The total consumed length, including the marker.
    len: usize,
    /// The whitespace control marker, if any.
    marker: Option<char>,
}

/// Matches an end delimiter with an optional adjacent `-`/`+` marker.
fn match_end_delimiter(rest: &str, delim: &str) -> Option<EndMatch> {
    if rest.starts_with(delim) {
        return Some(EndMatch {
            len: delim.len(),
            marker: None,
        });
    }
    match rest.chars().next() {
        Some(c @ ('-' | '+')) if rest[1..].starts_with(delim) => Some(EndMatch {
            len: 1 + delim.len(),
            marker: Some(c),
        }),
        _ => None,
    }
}

/// Scans an underscore-separated digit run starting at `from`.
fn scan_digits(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|&(_, c)| !c.is_ascii_digit() && c != '_')
        .map_or(text.len(), |(i, _)| from + i)
}

/// Counts logical newlines (`\r\n`, `\r`, `\n`) in raw source text.
fn count_newlines(text: &str) -> u32 {
    let bytes = text.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                count += 1;
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
            }
            b'\n' => count += 1,
            _ => {}
        }
        i += 1;
    }
    count
}

/// Normalizes every newline in a data segment to the configured sequence.
fn normalize_newlines(text: &str, newline: Newline) -> String {
    if newline == Newline::Lf && !text.contains('\r') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(newline.as_str());
            }
            '\n' => out.push_str(newline.as_str()),
            c => out.push(c),
        }
    }
    out
}

/// Strips trailing horizontal whitespace back to the last newline, when the
/// line holds nothing else.
fn lstrip_line(data: &str, segment_at_line_start: bool) -> &str {
    match data.rfind(['\n', '\r']) {
        Some(nl) => {
            if data[nl + 1..].bytes().all(|b| b == b' ' || b == b'\t') {
                &data[..=nl]
            } else {
                data
            }
        }
        None => {
            if segment_at_line_start && data.bytes().all(|b| b == b' ' || b == b'\t') {
                ""
            } else {
                data
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token<'_>> {
        tokenize(source, &Syntax::default(), &Whitespace::default()).unwrap()
    }

    fn kinds(source: &str) -> Vec<String> {
        lex(source)
            .into_iter()
            .map(|t| format!("{:?}", t.kind))
            .collect()
    }

    #[test]
    fn plain_data() {
        let tokens = lex("hello world");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].kind, TokenKind::Data("hello world".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::Eof);
    }

    #[test]
    fn variable_tag() {
        let tokens = lex("a{{ name }}b");
        assert_eq!(tokens[0].kind, TokenKind::Data("a".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::VariableBegin);
        assert_eq!(tokens[2].kind, TokenKind::Name("name"));
        assert_eq!(tokens[3].kind, TokenKind::VariableEnd);
        assert_eq!(tokens[4].kind, TokenKind::Data("b".to_string()));
    }

    #[test]
    fn operators_longest_match() {
        let tokens = lex("{{ a // b ** 2 <= 3 }}");
        let ops: Vec<_> = tokens
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Op(op) => Some(op),
                _ => None,
            })
            .collect();
        assert_eq!(ops, vec![Op::FloorDiv, Op::Pow, Op::Le]);
    }

    #[test]
    fn minus_marker_is_not_subtraction() {
        let tokens = lex("{{ 2 - 1 -}}  x");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Op(Op::Sub)));
        assert_eq!(
            tokens.last().map(|t| &t.kind),
            Some(&TokenKind::Eof),
        );
        // The trailing data was stripped by the `-}}` marker.
        assert_eq!(
            tokens[tokens.len() - 2].kind,
            TokenKind::Data("x".to_string())
        );
    }

    #[test]
    fn whitespace_control_markers() {
        let tokens = lex("a  {{- 1 }}");
        assert_eq!(tokens[0].kind, TokenKind::Data("a".to_string()));
        let tokens = lex("a  {{+ 1 }}");
        assert_eq!(tokens[0].kind, TokenKind::Data("a  ".to_string()));
    }

    #[test]
    fn trim_blocks_consumes_one_newline() {
        let ws = Whitespace {
            trim_blocks: true,
            ..Whitespace::default()
        };
        let tokens = tokenize("{% if x %}\na\n{% endif %}", &Syntax::default(), &ws).unwrap();
        let data: Vec<_> = tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Data(d) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec!["a\n"]);
    }

    #[test]
    fn lstrip_blocks_strips_blank_prefix_only() {
        let ws = Whitespace {
            lstrip_blocks: true,
            ..Whitespace::default()
        };
        let tokens = tokenize("x\n    {% if y %}{% endif %}", &Syntax::default(), &ws).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Data("x\n".to_string()));
        let tokens = tokenize("x  {% if y %}{% endif %}", &Syntax::default(), &ws).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Data("x  ".to_string()));
    }

    #[test]
    fn raw_passes_through() {
        let tokens = lex("{% raw %}{{ not_a_var }}{% endraw %}");
        assert_eq!(
            tokens[0].kind,
            TokenKind::Data("{{ not_a_var }}".to_string())
        );
        assert_eq!(tokens[1].kind, TokenKind::Eof);
    }

    #[test]
    fn raw_with_inner_markers() {
        let tokens = lex("{% raw -%}  spaced  {%- endraw %}");
        assert_eq!(tokens[0].kind, TokenKind::Data("spaced".to_string()));
    }

    #[test]
    fn comments_are_consumed() {
        let tokens = lex("a{# comment {{ x }} #}b");
        assert_eq!(tokens[0].kind, TokenKind::Data("a".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::Data("b".to_string()));
    }

    #[test]
    fn unclosed_comment_errors() {
        let err = tokenize("a\n{# oops", &Syntax::default(), &Whitespace::default()).unwrap_err();
        assert_eq!(err.lineno, 2);
        assert!(err.message.contains("unclosed comment"));
    }

    #[test]
    fn keep_trailing_newline() {
        assert_eq!(kinds("x\n"), vec!["Data(\"x\")", "Eof"]);
        let ws = Whitespace {
            keep_trailing_newline: true,
            ..Whitespace::default()
        };
        let tokens = tokenize("x\n", &Syntax::default(), &ws).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Data("x\n".to_string()));
    }

    #[test]
    fn newline_normalization() {
        let ws = Whitespace {
            newline_sequence: Newline::CrLf,
            keep_trailing_newline: true,
            ..Whitespace::default()
        };
        let tokens = tokenize("a\nb\r\nc\r", &Syntax::default(), &ws).unwrap();
        assert_eq!(
            tokens[0].kind,
            TokenKind::Data("a\r\nb\r\nc\r\n".to_string())
        );
    }

    #[test]
    fn number_literals() {
        let tokens = lex("{{ 12_000 3.5 1e3 0xff 123456789123456789123456789 }}");
        assert_eq!(tokens[1].kind, TokenKind::Int(12_000));
        assert_eq!(tokens[2].kind, TokenKind::Float(3.5));
        assert_eq!(tokens[3].kind, TokenKind::Float(1e3));
        assert_eq!(tokens[4].kind, TokenKind::Int(255));
        assert!(matches!(tokens[5].kind, TokenKind::BigInt(_)));
    }

    #[test]
    fn string_escapes() {
        let tokens = lex(r#"{{ "a\n\"b" 'c\'' }}"#);
        assert_eq!(tokens[1].kind, TokenKind::Str("a\n\"b".to_string()));
        assert_eq!(tokens[2].kind, TokenKind::Str("c'".to_string()));
    }

    #[test]
    fn bracket_depth_hides_tag_end() {
        // The `}}` inside the dict display must not end the variable tag.
        let tokens = lex("{{ {'a': 1}['a'] }}");
        assert!(
            tokens
                .iter()
                .filter(|t| t.kind == TokenKind::VariableEnd)
                .count()
                == 1
        );
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn unbalanced_bracket_errors() {
        let err = tokenize("{{ a) }}", &Syntax::default(), &Whitespace::default()).unwrap_err();
        assert!(err.message.contains("unexpected ')'"));
    }

    #[test]
    fn unclosed_variable_tag_errors() {
        let err = tokenize("{{ (a }}", &Syntax::default(), &Whitespace::default()).unwrap_err();
        assert!(err.message.contains("unclosed variable tag"));
    }

    #[test]
    fn custom_delimiters() {
        let syntax = Syntax {
            block_start: "<%".to_string(),
            block_end: "%>".to_string(),
            variable_start: "${".to_string(),
            variable_end: "}".to_string(),
            comment_start: "<#".to_string(),
            comment_end: "#>".to_string(),
            ..Syntax::default()
        };
        let tokens = tokenize("a${x}b<% if x %><% endif %>", &syntax, &Whitespace::default())
            .unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Data("a".to_string()));
        assert_eq!(tokens[2].kind, TokenKind::Name("x"));
        assert_eq!(tokens[3].kind, TokenKind::VariableEnd);
    }

    #[test]
    fn line_statements() {
        let syntax = Syntax {
            line_statement_prefix: Some("#".to_string()),
            ..Syntax::default()
        };
        let tokens = tokenize(
            "<ul>\n# for item in seq\n<li>{{ item }}</li>\n# endfor\n</ul>",
            &syntax,
            &Whitespace::default(),
        )
        .unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Data("<ul>\n".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::BlockBegin);
        assert_eq!(tokens[2].kind, TokenKind::Name("for"));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Name("endfor")));
    }

    #[test]
    fn line_comments() {
        let syntax = Syntax {
            line_comment_prefix: Some("##".to_string()),
            ..Syntax::default()
        };
        let tokens = tokenize("foo ## ignored\nbar", &syntax, &Whitespace::default()).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Data("foo ".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::Data("\nbar".to_string()));
    }

    #[test]
    fn token_lines() {
        let tokens = lex("a\nb\n{{ x }}");
        let var = tokens
            .iter()
            .find(|t| t.kind == TokenKind::VariableBegin)
            .unwrap();
        assert_eq!(var.line, 3);
    }
}
