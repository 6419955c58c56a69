//! Formula document compilation tests: the validation gate a report
//! passes before any record is scanned.

use recon_core::formula::FormulaDocument;
use serde_json::json;

fn formula_doc(value: serde_json::Value) -> FormulaDocument {
    serde_json::from_value(value).unwrap()
}

fn compile_err(value: serde_json::Value) -> String {
    formula_doc(value)
        .compile()
        .expect_err("document must not compile")
        .to_string()
}

#[test]
fn rejects_missing_report_name_and_empty_formulas() {
    let err = compile_err(json!({
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
    }));
    assert!(err.contains("report_name"), "unexpected error: {err}");

    let err = compile_err(json!({"report_name": "r", "formulas": []}));
    assert!(err.contains("empty formulas"), "unexpected error: {err}");
}

#[test]
fn rejects_duplicate_output_names() {
    let err = compile_err(json!({
        "report_name": "r",
        "formulas": [
            {"logicNameKey": "NET", "formulaText": "src.a"},
            {"logicNameKey": "NET", "formulaText": "src.b"},
        ],
    }));
    assert!(err.contains("duplicate"), "unexpected error: {err}");
}

#[test]
fn rejects_delta_over_unknown_output() {
    let err = compile_err(json!({
        "report_name": "r",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
        "delta_columns": [{"delta_column_name": "d", "value": "GROSS"}],
    }));
    assert!(err.contains("unknown output"), "unexpected error: {err}");
}

#[test]
fn rejects_reason_over_unknown_delta_column() {
    let err = compile_err(json!({
        "report_name": "r",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
        "reasons": [{"reason": "x", "delta_column": "nope",
                     "threshold": 1.0, "comparison": "signed"}],
    }));
    assert!(err.contains("unknown delta column"), "unexpected error: {err}");
}

#[test]
fn rejects_mapping_keys_that_omit_a_referenced_alias() {
    // With "pos" unmapped its collection would never be scanned and the
    // GAP formula could never complete, silently.
    let err = compile_err(json!({
        "report_name": "r",
        "formulas": [{"logicNameKey": "GAP", "formulaText": "zomato.amount - pos.amount"}],
        "mapping_keys": {"zomato": ["order_id"]},
    }));
    assert!(err.contains("'pos'"), "unexpected error: {err}");
}

#[test]
fn accepts_mapping_keys_covering_every_referenced_alias() {
    let report = formula_doc(json!({
        "report_name": "r",
        "formulas": [{"logicNameKey": "GAP", "formulaText": "zomato.amount - pos.amount"}],
        "mapping_keys": {"zomato": ["order_id"], "pos": ["order_id"]},
    }))
    .compile()
    .unwrap();
    assert_eq!(report.aliases, vec!["pos".to_string(), "zomato".to_string()]);
}

#[test]
fn rejects_reserved_output_names() {
    // "mapping_key" and "reason" belong to the engine's own row fields.
    let err = compile_err(json!({
        "report_name": "r",
        "formulas": [{"logicNameKey": "reason", "formulaText": "src.a"}],
    }));
    assert!(err.contains("reserved"), "unexpected error: {err}");

    let err = compile_err(json!({
        "report_name": "r",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
        "delta_columns": [{"delta_column_name": "mapping_key", "value": "NET"}],
    }));
    assert!(err.contains("reserved"), "unexpected error: {err}");
}
