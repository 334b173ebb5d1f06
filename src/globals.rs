//! The builtin global functions: `range`, `dict`, `namespace`, `cycler`,
//! and `joiner`.

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::render::objects::FuncValue;
use crate::value::{CallArgs, Key, Namespace, Object, Value, ValueMap};
use std::cell::Cell;
use std::rc::Rc;

/// Wraps a host function as a global value.
fn func(
    name: &'static str,
    f: impl Fn(&mut crate::render::State<'_, '_>, CallArgs) -> Result<Value> + 'static,
) -> Value {
    Value::object(FuncValue {
        name,
        f: Box::new(f),
    })
}

/// Registers every builtin global.
pub(crate) fn register_builtins(env: &mut Environment) {
    env.add_global(
        "range",
        func("range", |_, args| {
            let mut ints = Vec::with_capacity(args.positional.len());
            for value in &args.positional {
                ints.push(value.as_int().ok_or_else(|| {
                    Error::runtime("range() arguments must be integers")
                })?);
            }
            let (start, stop, step) = match ints[..] {
                [stop] => (0, stop, 1),
                [start, stop] => (start, stop, 1),
                [start, stop, step] => (start, stop, step),
                _ => return Err(Error::runtime("range() takes one to three arguments")),
            };
            if step == 0 {
                return Err(Error::runtime("range() step must not be zero"));
            }
            let mut items = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                items.push(Value::Int(current));
                current += step;
                if items.len() > 1_000_000 {
                    return Err(Error::runtime("range() result is too large"));
                }
            }
            Ok(Value::from(items))
        }),
    );

    env.add_global(
        "dict",
        func("dict", |_, args| {
            if !args.positional.is_empty() {
                return Err(Error::runtime("dict() takes only keyword arguments"));
            }
            let mut map = ValueMap::with_capacity(args.named.len());
            for (name, value) in args.named {
                map.insert(Key::Str(name), value);
            }
            Ok(Value::from(map))
        }),
    );

    env.add_global(
        "namespace",
        func("namespace", |_, args| {
            if !args.positional.is_empty() {
                return Err(Error::runtime("namespace() takes only keyword arguments"));
            }
            let fields = args.named.into_iter().collect();
            Ok(Value::Namespace(Rc::new(Namespace::new(fields))))
        }),
    );

    env.add_global(
        "cycler",
        func("cycler", |_, args| {
            if args.positional.is_empty() {
                return Err(Error::runtime("cycler() requires at least one value"));
            }
            let cycler: Rc<dyn Object> = Rc::new_cyclic(|weak| Cycler {
                items: args.positional,
                index: Cell::new(0),
                self_weak: weak.clone(),
            });
            Ok(Value::Dynamic(cycler))
        }),
    );

    env.add_global(
        "joiner",
        func("joiner", |_, mut args| {
            let sep = match args.positional.pop() {
                None => ", ".to_string(),
                Some(value) => value
                    .as_str()
                    .ok_or_else(|| Error::runtime("joiner() separator must be a string"))?
                    .to_string(),
            };
            Ok(Value::object(Joiner {
                sep,
                used: Cell::new(false),
            }))
        }),
    );
}

/// A stateful round-robin over a fixed set of values.
#[derive(Debug)]
struct Cycler {
    /// The cycled values.
    items: Vec<Value>,
    /// The index of the next value.
    index: Cell<usize>,
    /// Self-handle for bound methods.
    self_weak: std::rc::Weak<Cycler>,
}

impl Cycler {
    /// Advances and returns the next value.
    fn advance(&self) -> Value {
        let index = self.index.get();
        self.index.set(index + 1);
        self.items[index % self.items.len()].clone()
    }
}

impl Object for Cycler {
    fn kind(&self) -> &'static str {
        "cycler"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        let owner = self.self_weak.upgrade()?;
        match name {
            "current" => Some(self.items[self.index.get() % self.items.len()].clone()),
            "next" => Some(func("cycler.next", move |_, _| Ok(owner.advance()))),
            "reset" => Some(func("cycler.reset", move |_, _| {
                owner.index.set(0);
                Ok(Value::None)
            })),
            _ => None,
        }
    }

    fn call(&self, _state: &mut crate::render::State<'_, '_>, args: CallArgs) -> Result<Value> {
        if !args.positional.is_empty() || !args.named.is_empty() {
            return Err(Error::runtime("a cycler takes no arguments"));
        }
        Ok(self.advance())
    }
}

/// A separator emitter that stays silent on its first use.
#[derive(Debug)]
struct Joiner {
    /// The separator text.
    sep: String,
    /// Whether the joiner has been called before.
    used: Cell<bool>,
}

impl Object for Joiner {
    fn kind(&self) -> &'static str {
        "joiner"
    }

    fn call(&self, _state: &mut crate::render::State<'_, '_>, _args: CallArgs) -> Result<Value> {
        if self.used.replace(true) {
            Ok(Value::from(self.sep.clone()))
        } else {
            Ok(Value::from(""))
        }
    }
}
