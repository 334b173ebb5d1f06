//! `for` loop execution and the `loop` context object.

use super::State;
use crate::compile::code::ForDef;
use crate::error::{Error, Result};
use crate::value::{CallArgs, Object, UndefinedKind, Value};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

impl State<'_, '_> {
    /// Executes a `for` loop over an already-evaluated iterable.
    ///
    /// The iterable is materialized once at entry; the inline `if` filter
    /// is applied up front so `loop.length` and friends see the filtered
    /// item count.
    pub(crate) fn exec_for(
        &mut self,
        def: &Rc<ForDef>,
        iter_value: Value,
        depth0: usize,
    ) -> Result {
        let raw_items = iter_value.try_iter()?;

        let items = match &def.filter {
            Some(filter) => {
                let mut kept = Vec::with_capacity(raw_items.len());
                for item in raw_items {
                    self.ctx.push_scope();
                    let result = self
                        .bind_target(&def.target, item.clone())
                        .and_then(|()| super::eval::eval(self, filter))
                        .and_then(|value| value.is_true().map_err(Error::from));
                    self.ctx.pop_scope();
                    if result? {
                        kept.push(item);
                    }
                }
                kept
            }
            None => raw_items,
        };

        if items.is_empty() {
            return self.exec_body(&def.else_body);
        }

        let items = Rc::new(items);
        let loop_obj = def.has_loop.then(|| {
            LoopObject::new(
                Rc::clone(def),
                Rc::clone(&items),
                depth0,
                self.undefined_kind(),
            )
        });

        for index in 0..items.len() {
            self.ctx.push_scope();
            let result = self.bind_target(&def.target, items[index].clone()).and_then(
                |()| {
                    if let Some(loop_obj) = &loop_obj {
                        loop_obj.index0.set(index);
                        let handle: Rc<dyn Object> = loop_obj.clone() as Rc<dyn Object>;
                        self.ctx.set("loop".into(), Value::Dynamic(handle));
                    }
                    self.exec_body(&def.body)
                },
            );
            self.ctx.pop_scope();
            result?;
        }
        Ok(())
    }
}

/// The `loop` variable installed in `for` bodies that reference it.
#[derive(Debug)]
pub(crate) struct LoopObject {
    /// The loop definition, for recursive re-entry.
    def: Rc<ForDef>,
    /// The materialized (already filtered) items.
    items: Rc<Vec<Value>>,
    /// The current 0-based index, updated per iteration.
    pub(crate) index0: Cell<usize>,
    /// The 0-based recursion depth.
    depth0: usize,
    /// The undefined variant for missing neighbor items.
    undefined: UndefinedKind,
    /// The values seen by the last `changed(...)` call.
    last_changed: RefCell<Option<Vec<Value>>>,
    /// Self-handle for producing bound helpers.
    self_weak: Weak<LoopObject>,
}

impl LoopObject {
    /// Creates a loop object for one loop execution.
    fn new(
        def: Rc<ForDef>,
        items: Rc<Vec<Value>>,
        depth0: usize,
        undefined: UndefinedKind,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            def,
            items,
            index0: Cell::new(0),
            depth0,
            undefined,
            last_changed: RefCell::new(None),
            self_weak: weak.clone(),
        })
    }

    /// A strong self-handle.
    fn strong(&self) -> Rc<Self> {
        self.self_weak.upgrade().expect("loop object is alive")
    }
}

impl Object for LoopObject {
    fn kind(&self) -> &'static str {
        "loop"
    }

    fn len(&self) -> Option<usize> {
        Some(self.items.len())
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        let index0 = self.index0.get();
        let length = self.items.len();
        Some(match name {
            "index" => Value::from(index0 + 1),
            "index0" => Value::from(index0),
            "revindex" => Value::from(length - index0),
            "revindex0" => Value::from(length - index0 - 1),
            "first" => Value::Bool(index0 == 0),
            "last" => Value::Bool(index0 + 1 == length),
            "length" => Value::from(length),
            "depth" => Value::from(self.depth0 + 1),
            "depth0" => Value::from(self.depth0),
            "previtem" => match index0.checked_sub(1).and_then(|i| self.items.get(i)) {
                Some(item) => item.clone(),
                None => Value::undefined_hint(
                    self.undefined,
                    "there is no previous item".to_string(),
                ),
            },
            "nextitem" => match self.items.get(index0 + 1) {
                Some(item) => item.clone(),
                None => {
                    Value::undefined_hint(self.undefined, "there is no next item".to_string())
                }
            },
            "cycle" => Value::object(CycleRef {
                owner: self.strong(),
            }),
            "changed" => Value::object(ChangedRef {
                owner: self.strong(),
            }),
            _ => return None,
        })
    }

    fn call(&self, state: &mut State<'_, '_>, mut args: CallArgs) -> Result<Value> {
        if !self.def.recursive {
            return Err(Error::runtime(
                "cannot call loop: the containing for-loop is not marked recursive",
            ));
        }
        if args.positional.len() != 1 {
            return Err(Error::runtime("loop(...) takes exactly one iterable"));
        }
        let iterable = args.positional.pop().unwrap();
        let def = Rc::clone(&self.def);
        let depth = self.depth0 + 1;
        state.enter()?;
        let result = state.capture(|state| state.exec_for(&def, iterable, depth));
        state.leave();
        let text = result?;
        Ok(if state.autoescape() {
            Value::safe(text)
        } else {
            Value::from(text)
        })
    }

    fn write_display(&self, out: &mut String) {
        out.push_str("<loop>");
    }
}

/// The bound `loop.cycle` helper.
#[derive(Debug)]
struct CycleRef {
    /// The owning loop.
    owner: Rc<LoopObject>,
}

impl Object for CycleRef {
    fn kind(&self) -> &'static str {
        "loop.cycle"
    }

    fn call(&self, _state: &mut State<'_, '_>, args: CallArgs) -> Result<Value> {
        if args.positional.is_empty() {
            return Err(Error::runtime("loop.cycle requires at least one value"));
        }
        let index = self.owner.index0.get() % args.positional.len();
        Ok(args.positional[index].clone())
    }
}

/// The bound `loop.changed` helper.
#[derive(Debug)]
struct ChangedRef {
    /// The owning loop.
    owner: Rc<LoopObject>,
}

impl Object for ChangedRef {
    fn kind(&self) -> &'static str {
        "loop.changed"
    }

    fn call(&self, _state: &mut State<'_, '_>, args: CallArgs) -> Result<Value> {
        let mut last = self.owner.last_changed.borrow_mut();
        let changed = last.as_ref() != Some(&args.positional);
        *last = Some(args.positional);
        Ok(Value::Bool(changed))
    }
}
