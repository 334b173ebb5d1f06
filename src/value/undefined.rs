//! The undefined value and its behavior variants.

use crate::error::UndefinedError;
use std::rc::Rc;

/// The behavior variant for undefined values produced by an environment.
///
/// The variant decides which operations on an undefined value fail and which
/// are silently tolerated.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UndefinedKind {
    /// Renders as the empty string; most other uses fail.
    #[default]
    Default,
    /// Like [`Self::Default`], but attribute and item access return another
    /// undefined value instead of failing, so deep lookups like
    /// `settings.theme.color` can fail late (or never, if only printed).
    Chainable,
    /// Renders a `{{ name }}` diagnostic instead of the empty string.
    Debug,
    /// Every use fails, including printing and boolean tests.
    Strict,
}

/// A runtime undefined value.
///
/// Carries the name that failed to resolve and, for attribute and item
/// lookups, the value it was looked up on, so error messages can name the
/// full path.
#[derive(Debug)]
pub struct Undefined {
    /// The behavior variant.
    pub(crate) kind: UndefinedKind,
    /// The name that was looked up, if known.
    pub(crate) name: Option<Rc<str>>,
    /// A description of the object the lookup was performed on, if the
    /// undefined value came from an attribute or item access.
    pub(crate) parent: Option<String>,
    /// An explicit message overriding the derived one.
    pub(crate) hint: Option<String>,
}

impl Undefined {
    /// Creates an undefined value for a name that did not resolve.
    pub(crate) fn new(kind: UndefinedKind, name: Rc<str>) -> Self {
        Self {
            kind,
            name: Some(name),
            parent: None,
            hint: None,
        }
    }

    /// Creates an undefined value for a failed attribute or item lookup.
    pub(crate) fn attribute(kind: UndefinedKind, name: Rc<str>, parent: String) -> Self {
        Self {
            kind,
            name: Some(name),
            parent: Some(parent),
            hint: None,
        }
    }

    /// Creates an undefined value with an explicit message.
    pub(crate) fn with_hint(kind: UndefinedKind, hint: String) -> Self {
        Self {
            kind,
            name: None,
            parent: None,
            hint: Some(hint),
        }
    }

    /// The message describing why this value is undefined.
    pub(crate) fn message(&self) -> String {
        if let Some(hint) = &self.hint {
            return hint.clone();
        }
        match (&self.name, &self.parent) {
            (Some(name), Some(parent)) => {
                format!("{parent} has no attribute '{name}'")
            }
            (Some(name), None) => format!("'{name}' is undefined"),
            (None, _) => "value is undefined".to_string(),
        }
    }

    /// Builds the error for an operation this variant disallows.
    pub(crate) fn fail(&self, operation: &str) -> UndefinedError {
        UndefinedError::new(format!("{}: cannot {operation}", self.message()))
    }

    /// Whether string conversion is allowed, and what it produces.
    ///
    /// Only the strict variant refuses to stringify; the debug variant
    /// renders a diagnostic instead of the empty string.
    pub(crate) fn to_output(&self) -> Result<String, UndefinedError> {
        match self.kind {
            UndefinedKind::Strict => Err(self.fail("convert to string")),
            UndefinedKind::Debug => Ok(match &self.name {
                Some(name) => format!("{{{{ {name} }}}}"),
                None => format!("{{{{ undefined: {} }}}}", self.message()),
            }),
            UndefinedKind::Default | UndefinedKind::Chainable => Ok(String::new()),
        }
    }

    /// Whether boolean coercion is allowed. Undefined is always falsy when
    /// coercion is allowed at all.
    pub(crate) fn to_bool(&self) -> Result<bool, UndefinedError> {
        if self.kind == UndefinedKind::Strict {
            Err(self.fail("test truthiness"))
        } else {
            Ok(false)
        }
    }

    /// Performs an attribute or item lookup on this undefined value.
    ///
    /// The chainable variant hands back a deeper undefined value; every
    /// other variant fails.
    pub(crate) fn chain(&self, attr: Rc<str>) -> Result<Self, UndefinedError> {
        if self.kind == UndefinedKind::Chainable {
            Ok(Self {
                kind: self.kind,
                name: Some(attr),
                parent: Some(match (&self.name, &self.parent) {
                    (Some(name), Some(parent)) => format!("{parent}.{name}"),
                    (Some(name), None) => format!("'{name}'"),
                    (None, _) => "undefined value".to_string(),
                }),
                hint: None,
            })
        } else {
            Err(self.fail("get attribute"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_renders_empty() {
        let undef = Undefined::new(UndefinedKind::Default, "missing".into());
        assert_eq!(undef.to_output().unwrap(), "");
        assert!(!undef.to_bool().unwrap());
        assert!(undef.chain("attr".into()).is_err());
    }

    #[test]
    fn strict_fails_everything() {
        let undef = Undefined::new(UndefinedKind::Strict, "missing".into());
        assert!(undef.to_output().is_err());
        assert!(undef.to_bool().is_err());
        assert!(undef.chain("attr".into()).is_err());
    }

    #[test]
    fn chainable_tracks_the_path() {
        let undef = Undefined::new(UndefinedKind::Chainable, "settings".into());
        let deep = undef.chain("theme".into()).unwrap().chain("color".into()).unwrap();
        let err = deep.fail("add");
        assert!(err.to_string().contains("'settings'.theme"), "{err}");
    }

    #[test]
    fn debug_renders_diagnostic() {
        let undef = Undefined::new(UndefinedKind::Debug, "missing".into());
        assert_eq!(undef.to_output().unwrap(), "{{ missing }}");
    }
}
