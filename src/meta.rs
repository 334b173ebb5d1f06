//! Static template analysis helpers.
//!
//! These reuse the compile-time symbol analyzer to answer questions about a
//! template without rendering it.

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::syntax::{lexer, parser};
use std::collections::BTreeSet;

/// Names the symbol analyzer reserves for engine-provided bindings; never
/// reported as undeclared.
const SPECIAL_NAMES: &[&str] = &["self", "super", "caller", "varargs", "kwargs", "loop"];

/// Returns the variables a template will look up from the render context.
///
/// A name counts as undeclared when it is read before any assignment binds
/// it in its frame. Globals are not subtracted; a template using `range`
/// without a `range` variable reports it.
///
/// ```
/// use stencil::{Environment, meta};
///
/// let env = Environment::new();
/// let names = meta::find_undeclared_variables(
///     &env,
///     "{% set a = 1 %}{{ a }}{{ b }}{% for x in items %}{{ x }}{% endfor %}",
/// )
/// .unwrap();
/// assert_eq!(
///     names.into_iter().collect::<Vec<_>>(),
///     vec!["b".to_string(), "items".to_string()]
/// );
/// ```
pub fn find_undeclared_variables(env: &Environment, source: &str) -> Result<BTreeSet<String>> {
    let ast = parse(env, source)?;
    Ok(crate::compile::symbols::undeclared_names(&ast.body, &[])
        .into_iter()
        .filter(|name| !SPECIAL_NAMES.contains(&name.as_str()))
        .collect())
}

/// Parses a source against the environment's syntax configuration.
fn parse(env: &Environment, source: &str) -> Result<crate::syntax::ast::TemplateAst> {
    let tokens = lexer::tokenize(source, env.syntax_config(), env.whitespace_config())
        .map_err(|err| Error::Syntax(Box::new(err)))?;
    parser::parse(tokens).map_err(|err| Error::Syntax(Box::new(err)))
}
