//! Template loaders: the contract the environment uses to resolve template
//! names to source text.
//!
//! Loaders are consulted with `/`-separated logical names. Names that try
//! to escape upwards (`..` segments) or smuggle NUL bytes are rejected
//! before any loader sees them.

use crate::environment::Environment;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::rc::Rc;

/// The source text a loader hands back for a template name.
pub struct TemplateSource {
    /// The template source text.
    pub source: String,
    /// A file name hint for diagnostics.
    pub filename: Option<String>,
    /// An optional probe returning true while a compile of this source
    /// remains valid. Absent means always valid.
    pub uptodate: Option<Rc<dyn Fn() -> bool>>,
}

impl TemplateSource {
    /// Creates a plain source with no filename or probe.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            filename: None,
            uptodate: None,
        }
    }
}

/// An external collaborator mapping template names to source text.
pub trait Loader {
    /// Resolves a template name.
    ///
    /// Fails with [`Error::NotFound`] when the loader does not know the
    /// name.
    fn get_source(&self, env: &Environment, name: &str) -> Result<TemplateSource>;
}

/// Validates a logical template name.
pub(crate) fn check_template_name(name: &str) -> Result {
    if name.contains('\0') {
        return Err(Error::runtime(format!(
            "template name contains a NUL byte: {name:?}"
        )));
    }
    if name.split('/').any(|segment| segment == "..") {
        return Err(Error::runtime(format!(
            "template name may not reference parent directories: '{name}'"
        )));
    }
    Ok(())
}

/// An in-memory loader over a fixed name-to-source map.
#[derive(Default)]
pub struct MapLoader {
    /// The stored templates.
    templates: IndexMap<String, String>,
}

impl MapLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a template, replacing any previous source under the name.
    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.templates.insert(name.into(), source.into());
        self
    }
}

impl FromIterator<(String, String)> for MapLoader {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            templates: iter.into_iter().collect(),
        }
    }
}

impl Loader for MapLoader {
    fn get_source(&self, _env: &Environment, name: &str) -> Result<TemplateSource> {
        match self.templates.get(name) {
            Some(source) => Ok(TemplateSource::new(source.clone())),
            None => Err(Error::NotFound {
                name: name.to_string(),
            }),
        }
    }
}

/// Composes loaders by sequential fallback: the first one that knows the
/// name wins.
#[derive(Default)]
pub struct ChainLoader {
    /// The loaders, in consultation order.
    loaders: Vec<Rc<dyn Loader>>,
}

impl ChainLoader {
    /// Creates a chain over the given loaders.
    pub fn new(loaders: Vec<Rc<dyn Loader>>) -> Self {
        Self { loaders }
    }
}

impl Loader for ChainLoader {
    fn get_source(&self, env: &Environment, name: &str) -> Result<TemplateSource> {
        for loader in &self.loaders {
            match loader.get_source(env, name) {
                Err(Error::NotFound { .. }) => {}
                other => return other,
            }
        }
        Err(Error::NotFound {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_safety() {
        assert!(check_template_name("a/b/c.html").is_ok());
        assert!(check_template_name("..").is_err());
        assert!(check_template_name("a/../b").is_err());
        assert!(check_template_name("a\0b").is_err());
        // A dotted file name is fine.
        assert!(check_template_name("a/..b/c..html").is_ok());
    }

    #[test]
    fn chain_falls_through() {
        let env = Environment::new();
        let mut first = MapLoader::new();
        first.insert("a", "first");
        let mut second = MapLoader::new();
        second.insert("a", "second").insert("b", "second-b");
        let chain = ChainLoader::new(vec![Rc::new(first), Rc::new(second)]);
        assert_eq!(chain.get_source(&env, "a").unwrap().source, "first");
        assert_eq!(chain.get_source(&env, "b").unwrap().source, "second-b");
        assert!(matches!(
            chain.get_source(&env, "c"),
            Err(Error::NotFound { .. })
        ));
    }
}
