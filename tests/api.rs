//! The host-facing API surface: error reporting, streams, configuration,
//! and static analysis.

use pretty_assertions::assert_eq;
use stencil::{Environment, Error, MapLoader, Newline, Value, meta};

fn env() -> Environment {
    let _ = env_logger::try_init();
    Environment::new()
}

fn no_vars() -> Vec<(&'static str, Value)> {
    Vec::new()
}

#[test]
fn syntax_error_reports_name_line_and_source() {
    let mut environment = env();
    let mut loader = MapLoader::new();
    loader.insert("broken.html", "line one\n{% if x %}\nno endif");
    environment.set_loader(loader);
    let err = environment.get_template("broken.html").unwrap_err();
    let report = err.to_string();
    assert!(report.contains("File \"broken.html\", line 3"), "{report}");
    assert!(report.contains("unexpected end of template"), "{report}");
}

#[test]
fn syntax_errors_serialize() {
    let environment = env();
    let Err(Error::Syntax(payload)) = environment.template_from_str("{{ (a }}") else {
        panic!("expected a syntax error");
    };
    let json = serde_json::to_string(&*payload).unwrap();
    assert!(json.contains("\"lineno\":1"), "{json}");
    assert!(json.contains("unclosed variable tag"), "{json}");
}

#[test]
fn unknown_filter_is_a_compile_error() {
    let environment = env();
    let err = environment
        .template_from_str("{{ x | definitely_not_a_filter }}")
        .unwrap_err();
    assert!(matches!(err, Error::Assertion(_)), "{err}");
    assert!(
        err.to_string().contains("no filter named 'definitely_not_a_filter'"),
        "{err}"
    );
}

#[test]
fn unknown_test_is_a_compile_error() {
    let environment = env();
    let err = environment
        .template_from_str("{{ x is bogus_test }}")
        .unwrap_err();
    assert!(matches!(err, Error::Assertion(_)), "{err}");
}

#[test]
fn runtime_errors_carry_template_name_and_line() {
    let mut environment = env();
    let mut loader = MapLoader::new();
    loader.insert("t.html", "ok line\n{{ 1 + 'x' }}");
    environment.set_loader(loader);
    let err = environment
        .get_template("t.html")
        .unwrap()
        .render(no_vars())
        .unwrap_err();
    let report = err.to_string();
    assert!(report.contains("at 't.html', line 2"), "{report}");
    assert!(report.contains("unsupported operand types"), "{report}");
}

#[test]
fn errors_inside_includes_chain_both_frames() {
    let mut environment = env();
    let mut loader = MapLoader::new();
    loader.insert("outer", "{% include 'inner' %}");
    loader.insert("inner", "\n{{ [1] + 'x' }}");
    environment.set_loader(loader);
    let err = environment
        .get_template("outer")
        .unwrap()
        .render(no_vars())
        .unwrap_err();
    let report = err.to_string();
    assert!(report.contains("at 'inner', line 2"), "{report}");
    assert!(report.contains("at 'outer', line 1"), "{report}");
}

#[test]
fn render_stream_yields_pieces_in_order() {
    let environment = env();
    let template = environment
        .template_from_str("a{{ x }}b{{ y }}c")
        .unwrap();
    let pieces: Vec<String> = template
        .render_stream(vec![("x", Value::Int(1)), ("y", Value::Int(2))])
        .unwrap()
        .collect();
    assert_eq!(pieces.concat(), "a1b2c");
    assert!(pieces.len() >= 3);
}

#[test]
fn buffered_stream_groups_pieces() {
    let environment = env();
    let template = environment
        .template_from_str("{% for x in [1, 2, 3, 4] %}{{ x }},{% endfor %}")
        .unwrap();
    let grouped: Vec<String> = template
        .render_stream(no_vars())
        .unwrap()
        .buffered(4)
        .collect();
    assert_eq!(grouped.concat(), "1,2,3,4,");
    assert!(grouped.len() < 8);
}

#[test]
fn render_to_writes_into_a_sink() {
    let environment = env();
    let template = environment.template_from_str("x={{ x }}").unwrap();
    let mut sink = String::new();
    template
        .render_to(&mut sink, vec![("x", Value::Int(5))])
        .unwrap();
    assert_eq!(sink, "x=5");
}

#[test]
fn keep_trailing_newline_and_newline_sequence() {
    let mut environment = env();
    environment.set_keep_trailing_newline(true);
    environment.set_newline_sequence(Newline::CrLf);
    let out = environment
        .template_from_str("a\nb\n")
        .unwrap()
        .render(no_vars())
        .unwrap();
    assert_eq!(out, "a\r\nb\r\n");

    let mut environment = env();
    environment.set_newline_sequence(Newline::Lf);
    let out = environment
        .template_from_str("a\r\nb\r\n")
        .unwrap()
        .render(no_vars())
        .unwrap();
    assert_eq!(out, "a\nb");
}

#[test]
fn ambiguous_delimiters_are_rejected() {
    let mut environment = env();
    let syntax = stencil::Syntax {
        block_start: "{{".to_string(),
        ..stencil::Syntax::default()
    };
    assert!(environment.set_syntax(syntax).is_err());
}

#[test]
fn find_undeclared_variables() {
    let environment = env();
    let names = meta::find_undeclared_variables(
        &environment,
        "{% set a = 1 %}{{ a }}{{ b }}{% for x in items %}{{ x }}{{ c }}{% endfor %}\
         {% macro m(p) %}{{ p }}{{ d }}{% endmacro %}",
    )
    .unwrap();
    let names: Vec<String> = names.into_iter().collect();
    assert_eq!(names, vec!["b", "c", "d", "items"]);
}

#[test]
fn custom_filters_and_globals() {
    let mut environment = env();
    environment.add_filter("excited", |_, value, _| {
        Ok(Value::from(format!("{}!!", value.as_str().unwrap_or(""))))
    });
    environment.add_global("answer", Value::Int(42));
    environment.add_test("shouty", |_, value, _| {
        Ok(value.as_str().is_some_and(|s| s.ends_with("!!")))
    });
    let out = environment
        .template_from_str("{{ 'wow'|excited }} {{ answer }} {{ 'hi!!' is shouty }}")
        .unwrap()
        .render(no_vars())
        .unwrap();
    assert_eq!(out, "wow!! 42 True");
}

#[test]
fn template_name_safety() {
    let mut environment = env();
    environment.set_loader(MapLoader::new());
    assert!(environment.get_template("../etc/passwd").is_err());
    assert!(environment.get_template("a/../b").is_err());
}

#[test]
fn pure_literal_templates_round_trip() {
    let mut environment = env();
    environment.set_keep_trailing_newline(true);
    for source in ["plain text", "multi\nline\ntext\n", "unicode: héllo 漢字"] {
        let out = environment
            .template_from_str(source)
            .unwrap()
            .render(no_vars())
            .unwrap();
        assert_eq!(out, source);
    }
}
