#![doc = include_str!("../README.md")]
#![warn(
    clippy::pedantic,
    clippy::missing_docs_in_private_items,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

mod compile;
mod environment;
mod error;
mod filters;
mod globals;
mod loader;
pub mod meta;
mod output;
mod render;
mod syntax;
mod tests;
mod value;

pub use environment::{
    AutoEscape, BufferedStream, Environment, FilterFunc, FinalizeFunc, Module, RenderStream,
    Template, TestFunc,
};
pub use error::{Error, Result, SyntaxError, UndefinedError};
pub use loader::{ChainLoader, Loader, MapLoader, TemplateSource};
pub use render::State;
pub use syntax::{Newline, Syntax};
pub use value::{CallArgs, Key, Namespace, Object, UndefinedKind, Value, ValueMap};
