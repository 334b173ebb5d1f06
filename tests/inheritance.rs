//! Template inheritance, includes, and imports.

use pretty_assertions::assert_eq;
use stencil::{Environment, MapLoader, Value};

fn env_with(templates: &[(&str, &str)]) -> Environment {
    let _ = env_logger::try_init();
    let mut loader = MapLoader::new();
    for (name, source) in templates {
        loader.insert(*name, *source);
    }
    let mut env = Environment::new();
    env.set_loader(loader);
    env
}

fn render(env: &Environment, name: &str, vars: Vec<(&str, Value)>) -> String {
    env.get_template(name)
        .expect("template loads")
        .render(vars)
        .expect("template renders")
}

#[test]
fn single_level_inheritance() {
    let env = env_with(&[
        ("base", "head|{% block body %}default{% endblock %}|tail"),
        ("child", "{% extends 'base' %}{% block body %}override{% endblock %}"),
    ]);
    assert_eq!(render(&env, "base", vec![]), "head|default|tail");
    assert_eq!(render(&env, "child", vec![]), "head|override|tail");
}

#[test]
fn three_level_super_chain() {
    let env = env_with(&[
        (
            "a",
            "{% block intro %}INTRO{% endblock %}|BEFORE|{% block data %}INNER{% endblock %}|AFTER",
        ),
        (
            "b",
            "{% extends \"a\" %}{% block data %}({{ super() }}){% endblock %}",
        ),
        (
            "c",
            "{% extends \"b\" %}{% block intro %}--{{ super() }}--{% endblock %}\
             {% block data %}[{{ super() }}]{% endblock %}",
        ),
    ]);
    assert_eq!(render(&env, "c", vec![]), "--INTRO--|BEFORE|[(INNER)]|AFTER");
}

#[test]
fn super_exhaustion_is_undefined() {
    let env = env_with(&[
        ("a", "{% block x %}root {{ super() }}{% endblock %}"),
        ("b", "{% extends 'a' %}{% block x %}child {{ super() }}{% endblock %}"),
    ]);
    // One super() from the child reaches the root; the root's own super()
    // is unbound and fails when called.
    let err = env
        .get_template("b")
        .unwrap()
        .render(Vec::<(&str, Value)>::new())
        .unwrap_err();
    assert!(err.to_string().contains("'super' is undefined"), "{err}");
}

#[test]
fn child_output_outside_blocks_is_suppressed() {
    let env = env_with(&[
        ("base", "[{% block b %}x{% endblock %}]"),
        (
            "child",
            "{% extends 'base' %}IGNORED{% block b %}y{% endblock %}ALSO IGNORED",
        ),
    ]);
    assert_eq!(render(&env, "child", vec![]), "[y]");
}

#[test]
fn output_before_extends_renders_while_parent_is_null() {
    // Output ahead of the extends statement runs while the parent slot is
    // still unset, so it is emitted; everything after is suppressed.
    let env = env_with(&[
        ("base", "[{% block b %}x{% endblock %}]"),
        (
            "child",
            "LEAD{% extends 'base' %}TAIL{% block b %}y{% endblock %}",
        ),
    ]);
    assert_eq!(render(&env, "child", vec![]), "LEAD[y]");
}

#[test]
fn conditional_extends_emits_while_parent_unset() {
    let env = env_with(&[
        ("base", "[{% block b %}base{% endblock %}]"),
        (
            "child",
            "A{% if flag %}{% extends 'base' %}{% endif %}B{% block b %}child{% endblock %}",
        ),
    ]);
    // With the extends suppressed, the child renders standalone.
    assert_eq!(
        render(&env, "child", vec![("flag", Value::Bool(false))]),
        "ABchild"
    );
    // With the extends active, output before it still renders (the parent
    // slot was null at that point), output after it is suppressed.
    assert_eq!(
        render(&env, "child", vec![("flag", Value::Bool(true))]),
        "A[child]"
    );
}

#[test]
fn double_extends_is_a_runtime_error() {
    let env = env_with(&[
        ("base", "{% block b %}{% endblock %}"),
        (
            "child",
            "{% if true %}{% extends 'base' %}{% endif %}{% if true %}{% extends 'base' %}{% endif %}",
        ),
    ]);
    let err = env
        .get_template("child")
        .unwrap()
        .render(Vec::<(&str, Value)>::new())
        .unwrap_err();
    assert!(err.to_string().contains("extended multiple times"), "{err}");
}

#[test]
fn two_static_extends_also_fail_at_render() {
    let env = env_with(&[
        ("base", ""),
        ("child", "{% extends 'base' %}{% extends 'base' %}"),
    ]);
    // The second extends is unreachable dead code in a statically
    // extending template; executing it is the runtime error.
    let err = env
        .get_template("child")
        .unwrap()
        .render(Vec::<(&str, Value)>::new())
        .unwrap_err();
    assert!(err.to_string().contains("extended multiple times"), "{err}");
}

#[test]
fn required_blocks() {
    let env = env_with(&[
        ("p", "{% block x required %}{% endblock %}"),
        ("child", "{% extends 'p' %}{% block x %}[1]{% endblock %}"),
        ("lazy", "{% extends 'p' %}"),
    ]);
    let err = env
        .get_template("p")
        .unwrap()
        .render(Vec::<(&str, Value)>::new())
        .unwrap_err();
    assert!(
        err.to_string().contains("Required block 'x' not found"),
        "{err}"
    );
    assert_eq!(render(&env, "child", vec![]), "[1]");
    let err = env
        .get_template("lazy")
        .unwrap()
        .render(Vec::<(&str, Value)>::new())
        .unwrap_err();
    assert!(
        err.to_string().contains("Required block 'x' not found"),
        "{err}"
    );
}

#[test]
fn required_block_with_content_is_rejected() {
    let env = env_with(&[("p", "{% block x required %}content{% endblock %}")]);
    let err = env.get_template("p").unwrap_err();
    assert!(
        err.to_string().contains("comments or whitespace"),
        "{err}"
    );
}

#[test]
fn duplicate_blocks_are_rejected() {
    let env = env_with(&[(
        "t",
        "{% block x %}{% endblock %}{% block x %}{% endblock %}",
    )]);
    let err = env.get_template("t").unwrap_err();
    assert!(err.to_string().contains("defined twice"), "{err}");
}

#[test]
fn scoped_blocks_see_loop_variables() {
    let env = env_with(&[
        (
            "base",
            "{% for item in seq %}{% block row scoped %}{{ item }}{% endblock %}{% endfor %}",
        ),
        (
            "child",
            "{% extends 'base' %}{% block row %}<{{ item }}>{% endblock %}",
        ),
    ]);
    let seq = Value::from(vec![Value::Int(1), Value::Int(2)]);
    assert_eq!(render(&env, "child", vec![("seq", seq)]), "<1><2>");
}

#[test]
fn unscoped_blocks_do_not_see_locals() {
    let env = env_with(&[(
        "t",
        "{% for item in seq %}{% block row %}[{{ item }}]{% endblock %}{% endfor %}",
    )]);
    let seq = Value::from(vec![Value::Int(1)]);
    assert_eq!(render(&env, "t", vec![("seq", seq)]), "[]");
}

#[test]
fn self_reference_renders_blocks() {
    let env = env_with(&[(
        "t",
        "{% block title %}T{% endblock %}|{{ self.title() }}",
    )]);
    assert_eq!(render(&env, "t", vec![]), "T|T");
}

#[test]
fn include_with_and_without_context() {
    let env = env_with(&[
        ("inner", "[{{ x }}]"),
        ("with", "{% set x = 1 %}{% include 'inner' %}"),
        ("without", "{% set x = 1 %}{% include 'inner' without context %}"),
    ]);
    assert_eq!(render(&env, "with", vec![]), "[1]");
    assert_eq!(render(&env, "without", vec![]), "[]");
}

#[test]
fn include_ignore_missing() {
    let env = env_with(&[("t", "a{% include 'nope' ignore missing %}b")]);
    assert_eq!(render(&env, "t", vec![]), "ab");

    let env = env_with(&[("t", "a{% include 'nope' %}b")]);
    let err = env
        .get_template("t")
        .unwrap()
        .render(Vec::<(&str, Value)>::new())
        .unwrap_err();
    assert!(err.to_string().contains("template not found"), "{err}");
}

#[test]
fn include_list_fallback() {
    let env = env_with(&[
        ("second", "found second"),
        ("t", "{% include ['first', 'second'] %}"),
        ("u", "{% include ['first', 'zeroth'] %}"),
    ]);
    assert_eq!(render(&env, "t", vec![]), "found second");
    let err = env
        .get_template("u")
        .unwrap()
        .render(Vec::<(&str, Value)>::new())
        .unwrap_err();
    assert!(
        err.to_string().contains("first") && err.to_string().contains("zeroth"),
        "{err}"
    );
}

#[test]
fn import_binds_a_module() {
    let env = env_with(&[
        (
            "helpers",
            "{% macro shout(x) %}{{ x|upper }}!{% endmacro %}{% set version = 3 %}\
             {% set _private = 'hidden' %}",
        ),
        (
            "t",
            "{% import 'helpers' as h %}{{ h.shout('hi') }}{{ h.version }}{{ h._private }}",
        ),
    ]);
    // The underscore name is not exported and resolves to empty undefined.
    assert_eq!(render(&env, "t", vec![]), "HI!3");
}

#[test]
fn from_import_with_aliases() {
    let env = env_with(&[
        ("helpers", "{% macro a() %}A{% endmacro %}{% macro b() %}B{% endmacro %}"),
        (
            "t",
            "{% from 'helpers' import a, b as bee %}{{ a() }}{{ bee() }}",
        ),
    ]);
    assert_eq!(render(&env, "t", vec![]), "AB");
}

#[test]
fn import_context_visibility() {
    let env = env_with(&[
        ("mod", "{% macro show() %}[{{ x }}]{% endmacro %}"),
        (
            "plain",
            "{% set x = 1 %}{% import 'mod' as m %}{{ m.show() }}",
        ),
        (
            "ctx",
            "{% set x = 1 %}{% import 'mod' as m with context %}{{ m.show() }}",
        ),
    ]);
    assert_eq!(render(&env, "plain", vec![]), "[]");
    assert_eq!(render(&env, "ctx", vec![]), "[1]");
}

#[test]
fn module_api_from_host() {
    let env = env_with(&[(
        "helpers",
        "{% macro greet(name) %}hello {{ name }}{% endmacro %}{% set n = 2 %}body",
    )]);
    let template = env.get_template("helpers").unwrap();
    let module = template.module(Vec::<(&str, Value)>::new()).unwrap();
    assert_eq!(module.get("n").and_then(Value::as_int), Some(2));
    assert_eq!(module.body(), "body");
    let names: Vec<_> = module.names().collect();
    assert!(names.contains(&"greet") && names.contains(&"n"));
    let out = module.call("greet", vec![Value::from("you")]).unwrap();
    assert_eq!(out.as_str(), Some("hello you"));
}

#[test]
fn inherited_template_sees_child_variables() {
    let env = env_with(&[
        ("base", "{{ greeting }} {% block who %}{% endblock %}"),
        (
            "child",
            "{% extends 'base' %}{% block who %}{{ name }}{% endblock %}",
        ),
    ]);
    assert_eq!(
        render(
            &env,
            "child",
            vec![
                ("greeting", Value::from("hi")),
                ("name", Value::from("there"))
            ]
        ),
        "hi there"
    );
}

#[test]
fn toplevel_sets_are_visible_to_blocks() {
    let env = env_with(&[(
        "t",
        "{% set x = 'seen' %}{% block b %}{{ x }}{% endblock %}",
    )]);
    assert_eq!(render(&env, "t", vec![]), "seen");
}

#[test]
fn dynamic_extends_target() {
    let env = env_with(&[
        ("base-a", "A{% block b %}{% endblock %}"),
        ("base-b", "B{% block b %}{% endblock %}"),
        (
            "child",
            "{% extends parent %}{% block b %}!{% endblock %}",
        ),
    ]);
    assert_eq!(
        render(&env, "child", vec![("parent", Value::from("base-a"))]),
        "A!"
    );
    assert_eq!(
        render(&env, "child", vec![("parent", Value::from("base-b"))]),
        "B!"
    );
}
