//! Behavior of the builtin filter library.

use pretty_assertions::assert_eq;
use stencil::{Environment, Error, Key, Value, ValueMap};

fn render(source: &str, vars: Vec<(&str, Value)>) -> String {
    let _ = env_logger::try_init();
    Environment::new()
        .template_from_str(source)
        .expect("template compiles")
        .render(vars)
        .expect("template renders")
}

fn render_err(source: &str, vars: Vec<(&str, Value)>) -> Error {
    Environment::new()
        .template_from_str(source)
        .expect("template compiles")
        .render(vars)
        .expect_err("template fails")
}

fn ints(values: impl IntoIterator<Item = i64>) -> Value {
    Value::from(values.into_iter().map(Value::Int).collect::<Vec<_>>())
}

fn strs(values: &[&str]) -> Value {
    Value::from(values.iter().map(|s| Value::from(*s)).collect::<Vec<_>>())
}

fn map(pairs: &[(&str, i64)]) -> Value {
    let mut out = ValueMap::new();
    for (key, value) in pairs {
        out.insert(Key::from(*key), Value::Int(*value));
    }
    Value::from(out)
}

#[test]
fn string_case_filters() {
    assert_eq!(
        render(
            "{{ s|upper }} {{ s|capitalize }} {{ 'bIG tOP'|title }} {{ 'UP'|lower }}",
            vec![("s", Value::from("heLLo"))]
        ),
        "HELLO Hello Big Top up"
    );
}

#[test]
fn trim_center_indent() {
    assert_eq!(render("[{{ '  x  '|trim }}]", vec![]), "[x]");
    assert_eq!(render("[{{ 'xy'|trim('y') }}]", vec![]), "[x]");
    assert_eq!(render("[{{ 'ab'|center(6) }}]", vec![]), "[  ab  ]");
    assert_eq!(
        render("{{ 'a\nb'|indent(2) }}", vec![]),
        "a\n  b"
    );
    assert_eq!(
        render("{{ 'a\nb'|indent(2, first=true) }}", vec![]),
        "  a\n  b"
    );
}

#[test]
fn numeric_filters() {
    assert_eq!(render("{{ -3|abs }} {{ 3.7|abs }}", vec![]), "3 3.7");
    assert_eq!(render("{{ '42'|int }} {{ 'x'|int(7) }} {{ 3.9|int }}", vec![]), "42 7 3");
    assert_eq!(render("{{ 'ff'|int(base=16) }}", vec![]), "255");
    assert_eq!(render("{{ '1.5'|float }} {{ 1|float }}", vec![]), "1.5 1.0");
    assert_eq!(
        render("{{ 2.1234|round(2) }} {{ 2.5|round }} {{ 2.9|round(method='floor') }}", vec![]),
        "2.12 3.0 2.0"
    );
    assert_eq!(render("{{ [1, 2, 3]|sum }} {{ [1, 2]|sum(start=10) }}", vec![]), "6 13");
}

#[test]
fn sequence_filters() {
    assert_eq!(render("{{ seq|first }}{{ seq|last }}", vec![("seq", ints(1..4))]), "13");
    assert_eq!(render("{{ seq|length }}", vec![("seq", ints(0..7))]), "7");
    assert_eq!(render("{{ 'abc'|list|join('-') }}", vec![]), "a-b-c");
    assert_eq!(render("{{ seq|reverse|join(',') }}", vec![("seq", ints(1..4))]), "3,2,1");
    assert_eq!(render("{{ 'abc'|reverse }}", vec![]), "cba");
    assert_eq!(
        render("{{ [3, 1, 2]|sort|join(',') }} {{ ['b', 'A']|sort|join(',') }}", vec![]),
        "1,2,3 A,b"
    );
    assert_eq!(
        render("{{ [1, 2, 2, 3, 1]|unique|join(',') }}", vec![]),
        "1,2,3"
    );
    assert_eq!(render("{{ [1, 2, 3]|max }} {{ [1, 2, 3]|min }}", vec![]), "3 1");
}

#[test]
fn batch_and_slice() {
    assert_eq!(
        render(
            "{% for row in seq|batch(3) %}{{ row|join('') }};{% endfor %}",
            vec![("seq", ints(0..7))]
        ),
        "012;345;6;"
    );
    assert_eq!(
        render(
            "{% for row in seq|batch(3, '-') %}{{ row|join('') }};{% endfor %}",
            vec![("seq", ints(0..7))]
        ),
        "012;345;6--;"
    );
    assert_eq!(
        render(
            "{% for col in seq|slice(3) %}{{ col|join('') }};{% endfor %}",
            vec![("seq", ints(0..7))]
        ),
        "012;34;56;"
    );
}

#[test]
fn default_filter() {
    assert_eq!(render("{{ missing|default('fallback') }}", vec![]), "fallback");
    assert_eq!(
        render("{{ present|default('fallback') }}", vec![("present", Value::from(""))]),
        ""
    );
    assert_eq!(
        render("{{ present|d('fallback', true) }}", vec![("present", Value::from(""))]),
        "fallback"
    );
}

#[test]
fn join_with_attribute() {
    let users = Value::from(vec![
        map(&[("age", 30)]),
        map(&[("age", 40)]),
    ]);
    assert_eq!(
        render("{{ users|join(', ', attribute='age') }}", vec![("users", users)]),
        "30, 40"
    );
}

#[test]
fn map_select_reject() {
    assert_eq!(
        render("{{ ['a', 'b']|map('upper')|join(',') }}", vec![]),
        "A,B"
    );
    let users = Value::from(vec![
        map(&[("age", 12)]),
        map(&[("age", 30)]),
    ]);
    assert_eq!(
        render(
            "{{ users|map(attribute='age')|join(',') }}",
            vec![("users", users.clone())]
        ),
        "12,30"
    );
    assert_eq!(
        render("{{ [0, 1, 2, 3]|select('odd')|join(',') }}", vec![]),
        "1,3"
    );
    assert_eq!(
        render("{{ [0, 1, 2, 3]|reject('odd')|join(',') }}", vec![]),
        "0,2"
    );
    assert_eq!(
        render("{{ [0, 1, 2]|select|join(',') }}", vec![]),
        "1,2"
    );
    assert_eq!(
        render(
            "{{ users|selectattr('age', 'ge', 18)|map(attribute='age')|join(',') }}",
            vec![("users", users.clone())]
        ),
        "30"
    );
    assert_eq!(
        render(
            "{{ users|rejectattr('age', 'ge', 18)|map(attribute='age')|join(',') }}",
            vec![("users", users)]
        ),
        "12"
    );
}

#[test]
fn dictsort() {
    let d = map(&[("c", 1), ("a", 3), ("b", 2)]);
    assert_eq!(
        render(
            "{% for k, v in d|dictsort %}{{ k }}{{ v }};{% endfor %}",
            vec![("d", d.clone())]
        ),
        "a3;b2;c1;"
    );
    assert_eq!(
        render(
            "{% for k, v in d|dictsort(by='value') %}{{ k }}{{ v }};{% endfor %}",
            vec![("d", d)]
        ),
        "c1;b2;a3;"
    );
}

#[test]
fn replace_truncate_wordcount() {
    assert_eq!(
        render("{{ 'hello world'|replace('l', 'L', 2) }}", vec![]),
        "heLLo world"
    );
    assert_eq!(
        render("{{ 'one two three four'|truncate(12) }}", vec![]),
        "one two..."
    );
    assert_eq!(
        render("{{ 'short'|truncate(12) }}", vec![]),
        "short"
    );
    assert_eq!(render("{{ 'a b  c\nd'|wordcount }}", vec![]), "4");
}

#[test]
fn escape_family() {
    assert_eq!(render("{{ '<x>'|escape }}", vec![]), "&lt;x&gt;");
    assert_eq!(render("{{ '<x>'|e|e }}", vec![]), "&lt;x&gt;");
    assert_eq!(
        render("{{ ('<x>'|safe)|forceescape }}", vec![]),
        "&lt;x&gt;"
    );
    assert_eq!(
        render("{{ '<p>hi   <b>there</b></p>'|striptags }}", vec![]),
        "hi there"
    );
}

#[test]
fn urlencode_and_format() {
    assert_eq!(
        render("{{ 'a b/c'|urlencode }}", vec![]),
        "a%20b%2Fc"
    );
    assert_eq!(
        render("{{ d|urlencode }}", vec![("d", map(&[("a b", 1)]))]),
        "a%20b=1"
    );
    assert_eq!(
        render("{{ '%s has %d items'|format('cart', 3) }}", vec![]),
        "cart has 3 items"
    );
}

#[test]
fn attr_filter() {
    assert_eq!(
        render("{{ d|attr('k') }}", vec![("d", map(&[("k", 9)]))]),
        "9"
    );
}

#[test]
fn string_filter_keeps_safety() {
    assert_eq!(render("{{ 42|string }}", vec![]), "42");
    assert_eq!(render("{{ [1, 'a']|string }}", vec![]), "[1, 'a']");
}

#[test]
fn filter_argument_errors() {
    let err = render_err("{{ 'x'|replace }}", vec![]);
    assert!(
        matches!(err, Error::FilterArgument { .. }),
        "{err}"
    );
    let err = render_err("{{ 1|upper(1, 2, 3) }}", vec![]);
    assert!(err.to_string().contains("too many positional arguments"), "{err}");
    let err = render_err("{{ [1]|join(bogus=1) }}", vec![]);
    assert!(err.to_string().contains("unexpected keyword argument"), "{err}");
}

#[test]
fn filters_compose_left_to_right() {
    assert_eq!(
        render("{{ ' aBc '|trim|upper|replace('B', 'b') }}", vec![]),
        "AbC"
    );
}

#[test]
fn sort_by_attribute() {
    let users = Value::from(vec![
        map(&[("age", 40)]),
        map(&[("age", 12)]),
        map(&[("age", 30)]),
    ]);
    assert_eq!(
        render(
            "{{ users|sort(attribute='age')|map(attribute='age')|join(',') }}",
            vec![("users", users)]
        ),
        "12,30,40"
    );
}

#[test]
fn sequence_tests_via_strings() {
    assert_eq!(
        render(
            "{{ s is string }}|{{ s is sequence }}|{{ d is mapping }}|{{ 1.5 is float }}|{{ 1 is integer }}|{{ 1 is number }}",
            vec![("s", strs(&["x"])), ("d", map(&[]))]
        ),
        // A list of strings is a sequence but not a string.
        "False|True|True|True|True|True"
    );
}
