//! The environment: delimiters, whitespace policy, registries of filters,
//! tests, and globals, the loader, the autoescape policy, and the compiled
//! template cache.
//!
//! An environment is configured once and then treated as read-only by
//! renders. Rendering state lives in per-render contexts; the only interior
//! mutability here is the compiled-template cache. Environments hold
//! reference-counted values and are confined to one thread; use one
//! environment per rendering thread, the way pooled renderers do.

use crate::compile::code::Program;
use crate::error::{Error, Result, SyntaxError};
use crate::loader::{Loader, check_template_name};
use crate::output::Output;
use crate::render::State;
use crate::render::context::Scope;
use crate::syntax::{Newline, Syntax, Whitespace, lexer, parser};
use crate::value::{CallArgs, UndefinedKind, Value};
use indexmap::IndexMap;
use schnellru::{ByLength, LruMap};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A filter implementation: takes the piped value plus extra call
/// arguments. The state argument carries the environment and the eval
/// context, so context-sensitive filters need no separate registration
/// marker.
pub type FilterFunc = dyn Fn(&mut State<'_, '_>, Value, CallArgs) -> Result<Value>;

/// A test implementation: a predicate over the tested value.
pub type TestFunc = dyn Fn(&mut State<'_, '_>, Value, CallArgs) -> Result<bool>;

/// The output finalizer hook, applied to every expression output before
/// escaping.
pub type FinalizeFunc = dyn Fn(&mut State<'_, '_>, Value) -> Result<Value>;

/// The autoescape policy.
#[derive(Clone, Default)]
pub enum AutoEscape {
    /// Never escape (the default).
    #[default]
    Disabled,
    /// Always escape.
    Enabled,
    /// Decide per template name; anonymous templates pass `None`.
    Select(Rc<dyn Fn(Option<&str>) -> bool>),
}

impl fmt::Debug for AutoEscape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled => f.write_str("Enabled"),
            Self::Select(_) => f.write_str("Select(..)"),
        }
    }
}

/// A compiled template plus its identity.
#[derive(Debug)]
pub(crate) struct CompiledTemplate {
    /// The logical template name, when loaded by name.
    pub name: Option<Rc<str>>,
    /// The file name hint from the loader.
    pub filename: Option<Rc<str>>,
    /// The executable program.
    pub program: Program,
}

/// A cached compile with its freshness probe.
struct CacheEntry {
    /// The compiled template.
    template: Rc<CompiledTemplate>,
    /// The loader's up-to-date probe.
    uptodate: Option<Rc<dyn Fn() -> bool>>,
}

/// The template engine configuration and registries.
pub struct Environment {
    /// The delimiter configuration.
    syntax: Syntax,
    /// The whitespace policy.
    whitespace: Whitespace,
    /// The autoescape policy.
    autoescape: AutoEscape,
    /// The undefined variant handed out for failed lookups.
    undefined: UndefinedKind,
    /// The output finalizer hook.
    finalize: Option<Rc<FinalizeFunc>>,
    /// The filter registry.
    filters: IndexMap<String, Rc<FilterFunc>>,
    /// The test registry.
    tests: IndexMap<String, Rc<TestFunc>>,
    /// The global variables visible to every render.
    globals: IndexMap<Rc<str>, Value>,
    /// The template loader.
    loader: Option<Rc<dyn Loader>>,
    /// The compiled template cache; `None` when caching is disabled.
    cache: RefCell<Option<LruMap<Rc<str>, CacheEntry, ByLength>>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("syntax", &self.syntax)
            .field("autoescape", &self.autoescape)
            .field("filters", &self.filters.len())
            .field("tests", &self.tests.len())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Creates an environment with the default configuration and the
    /// builtin filters, tests, and globals registered.
    pub fn new() -> Self {
        let mut env = Self {
            syntax: Syntax::default(),
            whitespace: Whitespace::default(),
            autoescape: AutoEscape::default(),
            undefined: UndefinedKind::default(),
            finalize: None,
            filters: IndexMap::new(),
            tests: IndexMap::new(),
            globals: IndexMap::new(),
            loader: None,
            cache: RefCell::new(Some(LruMap::new(ByLength::new(400)))),
        };
        crate::filters::register_builtins(&mut env);
        crate::tests::register_builtins(&mut env);
        crate::globals::register_builtins(&mut env);
        env
    }

    /// Replaces the delimiter configuration.
    pub fn set_syntax(&mut self, syntax: Syntax) -> Result {
        syntax.validate().map_err(|err| Error::Syntax(Box::new(err)))?;
        self.syntax = syntax;
        Ok(())
    }

    /// Removes one newline after each statement tag.
    pub fn set_trim_blocks(&mut self, enabled: bool) {
        self.whitespace.trim_blocks = enabled;
    }

    /// Strips whitespace from line start to a statement tag on otherwise
    /// blank line heads.
    pub fn set_lstrip_blocks(&mut self, enabled: bool) {
        self.whitespace.lstrip_blocks = enabled;
    }

    /// Keeps the single trailing newline at the end of a source.
    pub fn set_keep_trailing_newline(&mut self, enabled: bool) {
        self.whitespace.keep_trailing_newline = enabled;
    }

    /// Sets the sequence literal newlines are normalized to.
    pub fn set_newline_sequence(&mut self, newline: Newline) {
        self.whitespace.newline_sequence = newline;
    }

    /// Sets the autoescape policy.
    pub fn set_autoescape(&mut self, autoescape: AutoEscape) {
        self.autoescape = autoescape;
    }

    /// Sets the undefined variant.
    pub fn set_undefined(&mut self, undefined: UndefinedKind) {
        self.undefined = undefined;
    }

    /// Installs an output finalizer applied to every expression output.
    pub fn set_finalize(
        &mut self,
        finalize: impl Fn(&mut State<'_, '_>, Value) -> Result<Value> + 'static,
    ) {
        self.finalize = Some(Rc::new(finalize));
    }

    /// Installs the template loader.
    pub fn set_loader(&mut self, loader: impl Loader + 'static) {
        self.loader = Some(Rc::new(loader));
    }

    /// Sets the compiled-template cache capacity: negative for unbounded,
    /// zero to disable caching, positive for an LRU cap.
    pub fn set_cache_size(&mut self, size: i64) {
        let cache = match size {
            0 => None,
            size if size < 0 => Some(LruMap::new(ByLength::new(u32::MAX))),
            size => Some(LruMap::new(ByLength::new(
                u32::try_from(size).unwrap_or(u32::MAX),
            ))),
        };
        *self.cache.borrow_mut() = cache;
    }

    /// Registers a filter.
    pub fn add_filter(
        &mut self,
        name: impl Into<String>,
        filter: impl Fn(&mut State<'_, '_>, Value, CallArgs) -> Result<Value> + 'static,
    ) {
        self.filters.insert(name.into(), Rc::new(filter));
    }

    /// Registers a test.
    pub fn add_test(
        &mut self,
        name: impl Into<String>,
        test: impl Fn(&mut State<'_, '_>, Value, CallArgs) -> Result<bool> + 'static,
    ) {
        self.tests.insert(name.into(), Rc::new(test));
    }

    /// Registers a global value.
    pub fn add_global(&mut self, name: impl Into<Rc<str>>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// True if a filter with the given name is registered.
    pub(crate) fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// True if a test with the given name is registered.
    pub(crate) fn has_test(&self, name: &str) -> bool {
        self.tests.contains_key(name)
    }

    /// Looks up a filter.
    pub(crate) fn get_filter(&self, name: &str) -> Option<Rc<FilterFunc>> {
        self.filters.get(name).cloned()
    }

    /// Looks up a test.
    pub(crate) fn get_test(&self, name: &str) -> Option<Rc<TestFunc>> {
        self.tests.get(name).cloned()
    }

    /// Looks up a global.
    pub(crate) fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// The configured undefined variant.
    pub(crate) fn undefined_kind(&self) -> UndefinedKind {
        self.undefined
    }

    /// The finalizer hook, if configured.
    pub(crate) fn finalize(&self) -> Option<Rc<FinalizeFunc>> {
        self.finalize.clone()
    }

    /// True if a finalizer is configured, which disables constant output
    /// folding.
    pub(crate) fn has_finalize(&self) -> bool {
        self.finalize.is_some()
    }

    /// The active delimiter configuration.
    pub(crate) fn syntax_config(&self) -> &Syntax {
        &self.syntax
    }

    /// The active whitespace policy.
    pub(crate) fn whitespace_config(&self) -> &Whitespace {
        &self.whitespace
    }

    /// The autoescape default for a template name.
    pub(crate) fn autoescape_default(&self, name: Option<&str>) -> bool {
        match &self.autoescape {
            AutoEscape::Disabled => false,
            AutoEscape::Enabled => true,
            AutoEscape::Select(select) => select(name),
        }
    }

    /// Compiles a template from a string, without naming or caching it.
    pub fn template_from_str(&self, source: &str) -> Result<Template<'_>> {
        Ok(Template {
            env: self,
            compiled: self.compile_source(source, None, None)?,
        })
    }

    /// Loads a template by name through the configured loader.
    pub fn get_template(&self, name: &str) -> Result<Template<'_>> {
        Ok(Template {
            env: self,
            compiled: self.get_template_compiled(name)?,
        })
    }

    /// Loads the first template of a list of names that exists.
    pub fn select_template(&self, names: &[&str]) -> Result<Template<'_>> {
        let mut tried = Vec::with_capacity(names.len());
        for name in names {
            match self.get_template(name) {
                Err(Error::NotFound { .. }) => tried.push((*name).to_string()),
                other => return other,
            }
        }
        Err(Error::NotFoundMultiple { names: tried })
    }

    /// Resolves a compiled template by name, consulting the cache and its
    /// freshness probes.
    pub(crate) fn get_template_compiled(&self, name: &str) -> Result<Rc<CompiledTemplate>> {
        check_template_name(name)?;
        let key: Rc<str> = Rc::from(name);

        if let Some(cache) = self.cache.borrow_mut().as_mut()
            && let Some(entry) = cache.get(&key)
        {
            let fresh = entry.uptodate.as_ref().is_none_or(|probe| probe());
            if fresh {
                return Ok(Rc::clone(&entry.template));
            }
            log::debug!("cached template '{name}' is stale, recompiling");
            cache.remove(&key);
        }

        let Some(loader) = &self.loader else {
            return Err(Error::runtime(
                "no loader configured; cannot load templates by name",
            ));
        };
        let source = loader.get_source(self, name)?;
        let compiled =
            self.compile_source(&source.source, Some(name), source.filename.as_deref())?;

        if let Some(cache) = self.cache.borrow_mut().as_mut() {
            cache.insert(
                key,
                CacheEntry {
                    template: Rc::clone(&compiled),
                    uptodate: source.uptodate,
                },
            );
        }
        Ok(compiled)
    }

    /// Runs the full compile pipeline over one source.
    fn compile_source(
        &self,
        source: &str,
        name: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Rc<CompiledTemplate>> {
        let located = |err: SyntaxError| err.in_template(name, filename, source);

        let tokens = lexer::tokenize(source, &self.syntax, &self.whitespace)
            .map_err(|err| Error::Syntax(Box::new(located(err))))?;
        let ast = parser::parse(tokens).map_err(|err| Error::Syntax(Box::new(located(err))))?;
        let program = crate::compile::compile(self, name, &ast)
            .map_err(|err| Error::Assertion(Box::new(located(err))))?;

        Ok(Rc::new(CompiledTemplate {
            name: name.map(Rc::from),
            filename: filename.map(Rc::from),
            program,
        }))
    }
}

/// A handle to a compiled template, ready to render.
pub struct Template<'env> {
    /// The owning environment.
    env: &'env Environment,
    /// The compiled template.
    compiled: Rc<CompiledTemplate>,
}

impl fmt::Debug for Template<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.compiled.name)
            .finish_non_exhaustive()
    }
}

impl Template<'_> {
    /// The template's logical name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.compiled.name.as_deref()
    }

    /// The file name the template was loaded from, if the loader provided
    /// one.
    pub fn filename(&self) -> Option<&str> {
        self.compiled.filename.as_deref()
    }

    /// Renders the template to a string.
    pub fn render<I, K>(&self, vars: I) -> Result<String>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Rc<str>>,
    {
        let mut out = Output::new();
        crate::render::render(self.env, &self.compiled, collect_vars(vars), &mut out)?;
        Ok(out.into_string())
    }

    /// Renders the template into any [`fmt::Write`] sink.
    pub fn render_to<I, K>(&self, sink: &mut impl fmt::Write, vars: I) -> Result
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Rc<str>>,
    {
        for piece in self.render_stream(vars)? {
            sink.write_str(&piece)?;
        }
        Ok(())
    }

    /// Renders the template and returns its output pieces as a stream.
    pub fn render_stream<I, K>(&self, vars: I) -> Result<RenderStream>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Rc<str>>,
    {
        let mut out = Output::new();
        crate::render::render(self.env, &self.compiled, collect_vars(vars), &mut out)?;
        Ok(RenderStream {
            pieces: out.into_pieces().into_iter(),
        })
    }

    /// Renders the template for its side effects and returns the module
    /// of exported names and macros.
    pub fn module<I, K>(&self, vars: I) -> Result<Module<'_>>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<Rc<str>>,
    {
        let (fields, body) =
            crate::render::render_module(self.env, &self.compiled, collect_vars(vars))?;
        Ok(Module {
            env: self.env,
            fields,
            body,
        })
    }
}

/// Collects render variables into the root scope.
fn collect_vars<I, K>(vars: I) -> Scope
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<Rc<str>>,
{
    vars.into_iter()
        .map(|(name, value)| (name.into(), value))
        .collect()
}

/// A stream of rendered output pieces, in source order.
pub struct RenderStream {
    /// The remaining pieces.
    pieces: std::vec::IntoIter<String>,
}

impl RenderStream {
    /// Wraps the stream so pieces are yielded in groups of `n`, joined.
    pub fn buffered(self, n: usize) -> BufferedStream {
        BufferedStream {
            inner: self,
            group: n.max(1),
        }
    }
}

impl Iterator for RenderStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.pieces.next()
    }
}

/// A piece stream that joins every N pieces before yielding.
pub struct BufferedStream {
    /// The underlying stream.
    inner: RenderStream,
    /// The group size.
    group: usize,
}

impl Iterator for BufferedStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut joined = self.inner.next()?;
        for _ in 1..self.group {
            match self.inner.next() {
                Some(piece) => joined.push_str(&piece),
                None => break,
            }
        }
        Some(joined)
    }
}

/// A rendered template module: the host-side view of `import`.
pub struct Module<'env> {
    /// The owning environment.
    env: &'env Environment,
    /// The exported names.
    fields: IndexMap<Rc<str>, Value>,
    /// The rendered body.
    body: String,
}

impl Module<'_> {
    /// The exported value under a name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The exported names, in export order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|name| &**name)
    }

    /// The rendered template body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Calls an exported macro from host code, returning its rendered
    /// output.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let Some(value) = self.fields.get(name) else {
            return Err(Error::runtime(format!(
                "the module does not export '{name}'"
            )));
        };
        let mut out = Output::new();
        let mut state = State::for_host(self.env, &mut out);
        crate::render::eval::call_value(&mut state, value, CallArgs::positional(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MapLoader;
    use std::cell::Cell;

    #[test]
    fn template_cache_round_trip() {
        let mut env = Environment::new();
        let mut loader = MapLoader::new();
        loader.insert("a.txt", "hello {{ name }}");
        env.set_loader(loader);
        let first = env.get_template("a.txt").unwrap();
        let second = env.get_template("a.txt").unwrap();
        assert!(Rc::ptr_eq(&first.compiled, &second.compiled));
    }

    #[test]
    fn disabled_cache_recompiles() {
        let mut env = Environment::new();
        let mut loader = MapLoader::new();
        loader.insert("a.txt", "x");
        env.set_loader(loader);
        env.set_cache_size(0);
        let first = env.get_template("a.txt").unwrap();
        let second = env.get_template("a.txt").unwrap();
        assert!(!Rc::ptr_eq(&first.compiled, &second.compiled));
    }

    #[test]
    fn stale_probe_forces_recompile() {
        struct Probed(Rc<Cell<bool>>);
        impl Loader for Probed {
            fn get_source(&self, _env: &Environment, _name: &str) -> Result<TemplateSource> {
                let fresh = Rc::clone(&self.0);
                Ok(TemplateSource {
                    source: "x".to_string(),
                    filename: None,
                    uptodate: Some(Rc::new(move || fresh.get())),
                })
            }
        }
        use crate::loader::TemplateSource;

        let fresh = Rc::new(Cell::new(true));
        let mut env = Environment::new();
        env.set_loader(Probed(Rc::clone(&fresh)));
        let first = env.get_template("t").unwrap();
        let cached = env.get_template("t").unwrap();
        assert!(Rc::ptr_eq(&first.compiled, &cached.compiled));
        fresh.set(false);
        let recompiled = env.get_template("t").unwrap();
        assert!(!Rc::ptr_eq(&first.compiled, &recompiled.compiled));
    }

    #[test]
    fn select_template_reports_every_name() {
        let mut env = Environment::new();
        env.set_loader(MapLoader::new());
        let err = env.select_template(&["a", "b"]).unwrap_err();
        assert!(err.to_string().contains("a, b"));
    }
}
