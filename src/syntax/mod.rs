//! Template syntax: source maps, tokens, the lexer, and the parser.
//!
//! The lexer honors a configurable [`Syntax`] (delimiters) and
//! [`Whitespace`] (trimming policy); the parser is a recursive descent over
//! the token stream producing the AST in [`ast`].

use crate::error::SyntaxError;

pub(crate) mod ast;
pub(crate) mod codemap;
pub(crate) mod idents;
pub(crate) mod lexer;
pub(crate) mod parser;

/// The delimiter configuration for a template dialect.
#[derive(Clone, Debug)]
pub struct Syntax {
    /// The start of a statement tag. Default `{%`.
    pub block_start: String,
    /// The end of a statement tag. Default `%}`.
    pub block_end: String,
    /// The start of a print expression. Default `{{`.
    pub variable_start: String,
    /// The end of a print expression. Default `}}`.
    pub variable_end: String,
    /// The start of a comment. Default `{#`.
    pub comment_start: String,
    /// The end of a comment. Default `#}`.
    pub comment_end: String,
    /// A prefix that turns a whole line into a statement, e.g. `#`.
    pub line_statement_prefix: Option<String>,
    /// A prefix that turns the rest of a line into a comment, e.g. `##`.
    pub line_comment_prefix: Option<String>,
}

impl Default for Syntax {
    fn default() -> Self {
        Self {
            block_start: "{%".to_string(),
            block_end: "%}".to_string(),
            variable_start: "{{".to_string(),
            variable_end: "}}".to_string(),
            comment_start: "{#".to_string(),
            comment_end: "#}".to_string(),
            line_statement_prefix: None,
            line_comment_prefix: None,
        }
    }
}

impl Syntax {
    /// Validates the configuration.
    ///
    /// Start delimiters must be non-empty and distinguishable from each
    /// other at the point they are matched.
    pub(crate) fn validate(&self) -> Result<(), SyntaxError> {
        let starts = [
            &self.block_start,
            &self.variable_start,
            &self.comment_start,
        ];
        for delim in starts {
            if delim.is_empty() {
                return Err(SyntaxError::new("delimiters must not be empty", 1));
            }
        }
        for (i, a) in starts.iter().enumerate() {
            for b in &starts[i + 1..] {
                if a == b {
                    return Err(SyntaxError::new(
                        format!("ambiguous delimiter configuration: '{a}' is used twice"),
                        1,
                    ));
                }
            }
        }
        if self.block_end.is_empty() || self.variable_end.is_empty() || self.comment_end.is_empty()
        {
            return Err(SyntaxError::new("delimiters must not be empty", 1));
        }
        Ok(())
    }
}

/// The whitespace handling policy for the lexer.
#[derive(Clone, Debug)]
pub struct Whitespace {
    /// Remove one newline after a statement tag.
    pub trim_blocks: bool,
    /// Strip whitespace from the start of a line to a statement tag, when
    /// the line holds nothing else before it.
    pub lstrip_blocks: bool,
    /// Keep a single trailing newline at the end of the source.
    pub keep_trailing_newline: bool,
    /// The sequence all literal newlines are normalized to.
    pub newline_sequence: Newline,
}

impl Default for Whitespace {
    fn default() -> Self {
        Self {
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: false,
            newline_sequence: Newline::Lf,
        }
    }
}

/// A newline sequence for normalized template data.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Newline {
    /// `\n`, the default.
    #[default]
    Lf,
    /// `\r\n`.
    CrLf,
    /// `\r`.
    Cr,
}

impl Newline {
    /// The literal newline text.
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
            Self::Cr => "\r",
        }
    }
}
