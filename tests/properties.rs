//! Property-based tests for the grammar, whitespace controls, and the
//! escape invariants.

use proptest::prelude::*;
use stencil::{AutoEscape, Environment, Value};

fn render(env: &Environment, source: &str, vars: Vec<(&str, Value)>) -> String {
    env.template_from_str(source)
        .expect("template compiles")
        .render(vars)
        .expect("template renders")
}

proptest! {
    /// Escaping an already-escaped value is a no-op at the value layer.
    #[test]
    fn escape_is_idempotent(s in "\\PC{0,40}") {
        let mut env = Environment::new();
        env.set_autoescape(AutoEscape::Enabled);
        let once = render(&env, "{{ s|e }}", vec![("s", Value::from(s.clone()))]);
        let twice = render(&env, "{{ s|e|e }}", vec![("s", Value::from(s))]);
        prop_assert_eq!(once, twice);
    }

    /// In autoescape mode no expression output contains unescaped HTML
    /// metacharacters unless the value was marked safe.
    #[test]
    fn autoescape_leaves_no_metacharacters(s in "\\PC{0,40}") {
        let mut env = Environment::new();
        env.set_autoescape(AutoEscape::Enabled);
        let out = render(&env, "{{ s }}", vec![("s", Value::from(s))]);
        prop_assert!(!out.contains('<'));
        prop_assert!(!out.contains('>'));
        prop_assert!(!out.contains('"'));
        prop_assert!(!out.contains('\''));
        // A bare ampersand only survives as part of an entity.
        for (index, _) in out.match_indices('&') {
            prop_assert!(out[index..].len() >= 4, "dangling ampersand in {out:?}");
        }
    }

    /// Multiplicative binds tighter than additive, which binds tighter
    /// than `~` concatenation.
    #[test]
    fn arithmetic_precedence(a in -50i64..50, b in -50i64..50, c in -50i64..50) {
        let env = Environment::new();
        let vars = |_: ()| vec![
            ("a", Value::Int(a)),
            ("b", Value::Int(b)),
            ("c", Value::Int(c)),
        ];
        prop_assert_eq!(
            render(&env, "{{ a + b * c }}", vars(())),
            (a + b * c).to_string()
        );
        prop_assert_eq!(
            render(&env, "{{ (a + b) * c }}", vars(())),
            ((a + b) * c).to_string()
        );
        // Subtraction is left-associative.
        prop_assert_eq!(
            render(&env, "{{ a - b - c }}", vars(())),
            (a - b - c).to_string()
        );
        // Concatenation binds looser than additive.
        prop_assert_eq!(
            render(&env, "{{ a ~ b + c }}", vars(())),
            format!("{a}{}", b + c)
        );
    }

    /// A chained comparison holds exactly when every link holds.
    #[test]
    fn chained_comparison(a in -10i64..10, b in -10i64..10, c in -10i64..10) {
        let env = Environment::new();
        let out = render(
            &env,
            "{{ a < b <= c }}",
            vec![
                ("a", Value::Int(a)),
                ("b", Value::Int(b)),
                ("c", Value::Int(c)),
            ],
        );
        prop_assert_eq!(out, if a < b && b <= c { "True" } else { "False" });
    }

    /// The `-` markers strip exactly the adjacent whitespace runs.
    #[test]
    fn minus_marker_strips_adjacent_whitespace(
        a in "[ \\ta-z\\n]{0,20}",
        b in "[ \\ta-z\\n]{0,20}",
    ) {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        let source = format!("{a}{{{{- 'x' -}}}}{b}");
        let out = render(&env, &source, vec![]);
        prop_assert_eq!(out, format!("{}x{}", a.trim_end(), b.trim_start()));
    }

    /// `trim_blocks` composes with explicit `+` markers: the marker wins.
    #[test]
    fn plus_marker_overrides_trim_blocks(tail in "[a-z]{0,10}") {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        let trimmed = render(&env, &format!("{{% if true %}}{{% endif %}}\n{tail}"), vec![]);
        prop_assert_eq!(trimmed, tail.clone());
        let kept = render(&env, &format!("{{% if true %}}{{% endif +%}}\n{tail}"), vec![]);
        prop_assert_eq!(kept, format!("\n{tail}"));
    }

    /// Templates holding only literal data render to their input, modulo
    /// newline normalization.
    #[test]
    fn pure_literal_round_trip(s in "[a-zA-Z0-9 .,!?é\\n-]{0,60}") {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        let out = render(&env, &s, vec![]);
        prop_assert_eq!(out, s);
    }

    /// Integer arithmetic never wraps: results promote instead.
    #[test]
    fn no_silent_overflow(a in proptest::num::i64::ANY, b in proptest::num::i64::ANY) {
        let env = Environment::new();
        let out = render(
            &env,
            "{{ a * b }}",
            vec![("a", Value::Int(a)), ("b", Value::Int(b))],
        );
        let expected = num_bigint::BigInt::from(a) * num_bigint::BigInt::from(b);
        prop_assert_eq!(out, expected.to_string());
    }
}
