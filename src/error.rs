//! The template error taxonomy.
//!
//! All errors surface through the single [`enum@Error`] type. Lexing and
//! parsing failures carry a [`SyntaxError`] payload with enough information
//! to reconstruct a human-readable report (message, template name, line, and
//! the offending source line). Runtime failures are wrapped with the active
//! template name and line number as they unwind, so a failure deep inside an
//! included template reads like a backtrace.

use crate::syntax::codemap::FileMap;
use core::fmt;
use serde::Serialize;

/// A template error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lexing or parsing error.
    #[error(transparent)]
    Syntax(Box<SyntaxError>),

    /// A compile-time semantic error (duplicate block, unknown filter or
    /// test, more than one `extends`, non-trivial `required` block body).
    #[error(transparent)]
    Assertion(Box<SyntaxError>),

    /// A template could not be loaded by name.
    #[error("template not found: '{name}'")]
    NotFound {
        /// The requested template name.
        name: String,
    },

    /// None of a list of templates could be loaded.
    #[error("none of the templates could be found: {}", names.join(", "))]
    NotFoundMultiple {
        /// Every requested template name, in the order tried.
        names: Vec<String>,
    },

    /// A runtime failure not covered by a more specific kind (extended
    /// multiple times, required block not found, namespace misuse,
    /// operations on incompatible types).
    #[error("{message}")]
    Runtime {
        /// A description of the failure.
        message: String,
    },

    /// An operation was performed on an undefined value that the active
    /// undefined variant disallows.
    #[error(transparent)]
    Undefined(#[from] UndefinedError),

    /// A filter was called with invalid arguments.
    #[error("filter '{filter}': {message}")]
    FilterArgument {
        /// The name of the offending filter.
        filter: String,
        /// A description of what was wrong with the arguments.
        message: String,
    },

    /// A backtraced template error.
    #[error("{err}\n  at '{name}', line {line}")]
    Located {
        /// The name of the template where the error occurred.
        name: String,
        /// The line in the template where the error occurred.
        line: u32,
        /// The error.
        #[source]
        err: Box<Self>,
    },

    /// A write to an output buffer failed.
    #[error("fmt error: {0}")]
    Fmt(#[from] fmt::Error),
}

impl Error {
    /// Creates a new runtime error with the given message.
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Creates a new filter argument error.
    pub(crate) fn filter_argument(filter: &str, message: impl Into<String>) -> Self {
        Self::FilterArgument {
            filter: filter.to_string(),
            message: message.into(),
        }
    }

    /// Wraps an error with the template name and line where it surfaced.
    ///
    /// Within one template the innermost location wins; crossing into
    /// another template (an include, import, or parent) adds a frame, so
    /// the report reads like a backtrace. Syntax errors already carry
    /// their own position.
    pub(crate) fn locate(self, name: &str, line: u32) -> Self {
        match self {
            Self::Syntax(_) | Self::Assertion(_) => self,
            Self::Located {
                name: ref located, ..
            } if located == name => self,
            err => Self::Located {
                name: name.to_string(),
                line,
                err: Box::new(err),
            },
        }
    }
}

/// The standard result type used by all fallible template functions.
pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// A lexing, parsing, or compile-time assertion error.
///
/// The payload is serializable so that build tooling can persist diagnostics
/// across processes.
#[derive(Debug, Serialize)]
pub struct SyntaxError {
    /// The description of the error.
    pub message: String,
    /// The 1-indexed line where the error was detected.
    pub lineno: u32,
    /// The logical name of the template, if known.
    pub name: Option<String>,
    /// The file name the template was loaded from, if known.
    pub filename: Option<String>,
    /// The full template source, if available.
    pub source: Option<String>,
}

impl SyntaxError {
    /// Creates a new syntax error at the given line.
    pub(crate) fn new(message: impl Into<String>, lineno: u32) -> Self {
        Self {
            message: message.into(),
            lineno,
            name: None,
            filename: None,
            source: None,
        }
    }

    /// Attaches template identity and source text to the error.
    pub(crate) fn in_template(
        mut self,
        name: Option<&str>,
        filename: Option<&str>,
        source: &str,
    ) -> Self {
        self.name = name.map(str::to_string);
        self.filename = filename.map(str::to_string);
        self.source = Some(source.to_string());
        self
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        write!(
            f,
            "  File \"{}\", line {}",
            self.name.as_deref().or(self.filename.as_deref()).unwrap_or("<template>"),
            self.lineno
        )?;
        if let Some(source) = &self.source
            && let Some(line) = FileMap::new(source).line_text(self.lineno)
        {
            write!(f, "\n    {}", line.trim())?;
        }
        Ok(())
    }
}

impl std::error::Error for SyntaxError {}

impl From<SyntaxError> for Error {
    fn from(err: SyntaxError) -> Self {
        Self::Syntax(Box::new(err))
    }
}

/// An error raised by using an undefined value in a way that the configured
/// undefined variant disallows.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct UndefinedError {
    /// The description of the failed operation, naming the symbol and its
    /// lookup path.
    pub message: String,
}

impl UndefinedError {
    /// Creates a new undefined error with the given message.
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_report() {
        let err = SyntaxError::new("unexpected 'end of template'", 2).in_template(
            Some("child.html"),
            None,
            "line one\n{% block x %",
        );
        let report = err.to_string();
        assert!(report.contains("unexpected 'end of template'"));
        assert!(report.contains("File \"child.html\", line 2"));
        assert!(report.contains("{% block x %"));
    }

    #[test]
    fn located_runtime_error_chains() {
        let err = Error::runtime("extended multiple times")
            .locate("child.html", 4)
            .locate("child.html", 4);
        // A second locate on the same frame is a no-op.
        let text = err.to_string();
        assert_eq!(text.matches("at 'child.html'").count(), 1);
        assert!(text.starts_with("extended multiple times"));
    }
}
