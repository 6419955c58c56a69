//! Expression evaluator tests: grammar, precedence, binding failures.

use recon_core::expr::{Expr, FieldRef, Scope};
use recon_core::types::Document;
use serde_json::json;
use std::collections::BTreeSet;

fn doc(value: serde_json::Value) -> Document {
    value.as_object().expect("test doc must be an object").clone()
}

fn eval(text: &str, fields: serde_json::Value) -> Result<f64, String> {
    let expr = Expr::parse(text).map_err(|e| e.to_string())?;
    let fields = doc(fields);
    let outputs = Document::new();
    let scope = Scope {
        fields: &fields,
        outputs: &outputs,
    };
    expr.eval(&scope).map_err(|e| e.to_string())
}

#[test]
fn left_associative_add_sub() {
    // a - b + c must evaluate as (a - b) + c.
    let result = eval(
        "src.a - src.b + src.c",
        json!({"src.a": 100, "src.b": 10, "src.c": 5}),
    )
    .unwrap();
    assert_eq!(result, 95.0);
}

#[test]
fn multiplication_binds_tighter() {
    let result = eval("src.a + src.b * src.c", json!({"src.a": 2, "src.b": 3, "src.c": 4})).unwrap();
    assert_eq!(result, 14.0);
}

#[test]
fn parentheses_override_precedence() {
    let result = eval("(src.a + src.b) * src.c", json!({"src.a": 2, "src.b": 3, "src.c": 4})).unwrap();
    assert_eq!(result, 20.0);
}

#[test]
fn unary_minus() {
    let result = eval("-src.a + 10", json!({"src.a": 3})).unwrap();
    assert_eq!(result, 7.0);
    let result = eval("-(src.a - src.b)", json!({"src.a": 3, "src.b": 8})).unwrap();
    assert_eq!(result, 5.0);
}

#[test]
fn numeric_literals_and_division() {
    let result = eval("src.total / 2 + 0.5", json!({"src.total": 9})).unwrap();
    assert_eq!(result, 5.0);
}

#[test]
fn numeric_strings_count_as_numbers() {
    // Source data arrives from spreadsheet uploads as strings.
    let result = eval("src.a * src.b", json!({"src.a": " 12.5 ", "src.b": "2"})).unwrap();
    assert_eq!(result, 25.0);
}

#[test]
fn missing_field_fails_evaluation() {
    let err = eval("src.a + src.missing", json!({"src.a": 1})).unwrap_err();
    assert!(err.contains("missing"), "unexpected error: {err}");
}

#[test]
fn non_numeric_field_fails_evaluation() {
    let err = eval("src.name * 2", json!({"src.name": "alice"})).unwrap_err();
    assert!(err.contains("not numeric"), "unexpected error: {err}");
}

#[test]
fn division_by_zero_fails() {
    let err = eval("src.a / src.b", json!({"src.a": 1, "src.b": 0})).unwrap_err();
    assert!(err.contains("division by zero"), "unexpected error: {err}");
}

#[test]
fn rejects_malformed_expressions() {
    assert!(Expr::parse("src.a +").is_err());
    assert!(Expr::parse("* src.a").is_err());
    assert!(Expr::parse("(src.a + 1").is_err());
    assert!(Expr::parse("src.").is_err());
    assert!(Expr::parse("1 2").is_err());
    assert!(Expr::parse("src.a @ 2").is_err());
}

#[test]
fn grammar_is_closed_no_calls_or_strings() {
    // Function-call and string syntax must not parse; the grammar is
    // arithmetic only.
    assert!(Expr::parse("max(src.a, src.b)").is_err());
    assert!(Expr::parse("\"drop table\"").is_err());
}

#[test]
fn referenced_fields_are_collected_at_parse_time() {
    let expr = Expr::parse("zomato.bill_subtotal - pos.net_amount + zomato.tax").unwrap();
    let mut refs = BTreeSet::new();
    expr.referenced_fields(&mut refs);
    let expected: BTreeSet<FieldRef> = [
        FieldRef {
            alias: "zomato".into(),
            field: "bill_subtotal".into(),
        },
        FieldRef {
            alias: "zomato".into(),
            field: "tax".into(),
        },
        FieldRef {
            alias: "pos".into(),
            field: "net_amount".into(),
        },
    ]
    .into_iter()
    .collect();
    assert_eq!(refs, expected);
}

#[test]
fn bare_identifiers_bind_to_outputs() {
    let expr = Expr::parse("NET - GROSS").unwrap();
    let fields = Document::new();
    let outputs = doc(json!({"NET": 95, "GROSS": 80}));
    let scope = Scope {
        fields: &fields,
        outputs: &outputs,
    };
    assert_eq!(expr.eval(&scope).unwrap(), 15.0);

    let mut names = BTreeSet::new();
    expr.referenced_outputs(&mut names);
    assert_eq!(names.len(), 2);
}

#[test]
fn is_ready_reflects_field_presence() {
    let expr = Expr::parse("zomato.amount - pos.amount").unwrap();
    let partial = doc(json!({"zomato.amount": 10}));
    let outputs = Document::new();
    assert!(!expr.is_ready(&Scope {
        fields: &partial,
        outputs: &outputs
    }));

    let complete = doc(json!({"zomato.amount": 10, "pos.amount": 4}));
    assert!(expr.is_ready(&Scope {
        fields: &complete,
        outputs: &outputs
    }));
}
