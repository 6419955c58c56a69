//! End-to-end job runner tests: full reconciliation passes over an
//! in-memory store.

use recon_core::{
    config::JobConfig,
    formula::FormulaDocument,
    runner::{JobRunner, RunStatus},
    store::DocStore,
    types::Document,
};
use serde_json::json;

fn doc(value: serde_json::Value) -> Document {
    value.as_object().unwrap().clone()
}

fn formula_doc(value: serde_json::Value) -> FormulaDocument {
    serde_json::from_value(value).unwrap()
}

fn store_with(formula: serde_json::Value) -> DocStore {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = DocStore::in_memory().unwrap();
    store.migrate().unwrap();
    store.save_formula_document(&formula_doc(formula)).unwrap();
    store
}

fn run(store: &DocStore) -> recon_core::runner::RunSummary {
    let mut config = JobConfig::default();
    config.formula_batch_size = 10;
    JobRunner::new(store, config).run().unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: single-alias formula computes the documented NET scenario
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn net_formula_over_single_record() {
    let store = store_with(json!({
        "report_name": "net_report",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a - src.b + src.c"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    store
        .insert_document(
            "src_processed",
            &doc(json!({"order_id": "O-1", "a": 100, "b": 10, "c": 5})),
        )
        .unwrap();

    let summary = run(&store);
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.reports_processed, 1);
    assert_eq!(summary.documents_processed, 1);
    assert_eq!(summary.errors, 0);

    let row = store.get_by_key("net_report", "O-1").unwrap().unwrap();
    assert_eq!(row["NET"], 95.0);
    assert_eq!(row["mapping_key"], "O-1");
    assert_eq!(row["reason"], "no_discrepancy");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: records from two aliases merge into one output row by key
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn cross_alias_records_merge_by_mapping_key() {
    let store = store_with(json!({
        "report_name": "platform_vs_pos",
        "formulas": [{"logicNameKey": "GAP", "formulaText": "zomato.amount - pos.amount"}],
        "mapping_keys": {"zomato": ["order_id"], "pos": ["order_id"]},
        "delta_columns": [{"delta_column_name": "gap_delta", "value": "GAP"}],
        "reasons": [
            {"reason": "major_mismatch", "delta_column": "gap_delta",
             "threshold": 10.0, "comparison": "absolute"},
            {"reason": "minor_mismatch", "delta_column": "gap_delta",
             "threshold": 0.01, "comparison": "absolute"}
        ],
    }));
    store
        .insert_document(
            "zomato_processed",
            &doc(json!({"order_id": "O-9", "amount": 112})),
        )
        .unwrap();
    store
        .insert_document(
            "pos_processed",
            &doc(json!({"order_id": "O-9", "amount": 100})),
        )
        .unwrap();

    let summary = run(&store);
    assert_eq!(summary.documents_processed, 2);
    assert_eq!(store.count_documents("platform_vs_pos").unwrap(), 1);

    let row = store.get_by_key("platform_vs_pos", "O-9").unwrap().unwrap();
    assert_eq!(row["zomato.amount"], 112);
    assert_eq!(row["pos.amount"], 100);
    assert_eq!(row["GAP"], 12.0);
    assert_eq!(row["gap_delta"], 12.0);
    // Delta 12 matches both rules; the first declared rule wins.
    assert_eq!(row["reason"], "major_mismatch");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: re-running over unchanged sources is idempotent
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rerun_produces_identical_output() {
    let store = store_with(json!({
        "report_name": "idem",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a - src.b"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    for i in 0..37 {
        store
            .insert_document(
                "src_processed",
                &doc(json!({"order_id": format!("O-{i}"), "a": 100 + i, "b": i})),
            )
            .unwrap();
    }

    let first = run(&store);
    let after_first = store.get_all("idem").unwrap();

    let second = run(&store);
    let after_second = store.get_all("idem").unwrap();

    assert_eq!(first.documents_processed, 37);
    assert_eq!(second.documents_processed, 37);
    assert_eq!(after_first.len(), 37);
    assert_eq!(after_first, after_second, "re-run must not change output");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: invalid formula documents are skipped, the run continues
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn malformed_formula_documents_are_skipped() {
    let store = store_with(json!({
        "report_name": "good",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    // Empty formulas list.
    store
        .save_formula_document(&formula_doc(json!({
            "report_name": "no_formulas",
            "formulas": [],
        })))
        .unwrap();
    // Unparseable formula text.
    store
        .save_formula_document(&formula_doc(json!({
            "report_name": "bad_syntax",
            "formulas": [{"logicNameKey": "X", "formulaText": "src.a +"}],
        })))
        .unwrap();
    store
        .insert_document("src_processed", &doc(json!({"order_id": "O-1", "a": 5})))
        .unwrap();

    let summary = run(&store);
    assert_eq!(summary.reports_processed, 1, "only the valid report runs");
    assert!(store.get_by_key("good", "O-1").unwrap().is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: record-scoped failures are counted, never fatal
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn non_numeric_field_counts_as_error() {
    let store = store_with(json!({
        "report_name": "errors",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a * 2"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    store
        .insert_document("src_processed", &doc(json!({"order_id": "O-1", "a": 10})))
        .unwrap();
    store
        .insert_document(
            "src_processed",
            &doc(json!({"order_id": "O-2", "a": "not a number"})),
        )
        .unwrap();

    let summary = run(&store);
    assert_eq!(summary.documents_processed, 1);
    assert_eq!(summary.errors, 1);
    assert!(store.get_by_key("errors", "O-1").unwrap().is_some());
    // The failed record contributes nothing.
    assert!(store.get_by_key("errors", "O-2").unwrap().is_none());
}

#[test]
fn missing_key_field_counts_as_skipped() {
    let store = store_with(json!({
        "report_name": "skips",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    store
        .insert_document("src_processed", &doc(json!({"order_id": "O-1", "a": 1})))
        .unwrap();
    store
        .insert_document("src_processed", &doc(json!({"a": 2})))
        .unwrap();

    let summary = run(&store);
    assert_eq!(summary.documents_processed, 1);
    assert_eq!(summary.documents_skipped, 1);
    assert_eq!(summary.errors, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: absent mapping configuration falls back, dropping nothing
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn missing_mapping_keys_never_drops_records() {
    let store = store_with(json!({
        "report_name": "fallback",
        "formulas": [{"logicNameKey": "DOUBLED", "formulaText": "src.amount * 2"}],
    }));
    for i in 0..12 {
        store
            .insert_document("src_processed", &doc(json!({"amount": i})))
            .unwrap();
    }

    let summary = run(&store);
    assert_eq!(summary.documents_processed, 12);
    assert_eq!(summary.documents_skipped, 0);
    // One output row per record under its fallback identity.
    assert_eq!(store.count_documents("fallback").unwrap(), 12);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: counter arithmetic and batch-size invariance
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn counters_partition_the_scanned_records() {
    let store = store_with(json!({
        "report_name": "partition",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a * 2"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    // 23 records at batch size 10: three batches, last one partial.
    for i in 0..20 {
        store
            .insert_document("src_processed", &doc(json!({"order_id": format!("O-{i}"), "a": i})))
            .unwrap();
    }
    store
        .insert_document("src_processed", &doc(json!({"a": 1})))
        .unwrap(); // no key
    store
        .insert_document("src_processed", &doc(json!({"order_id": "O-x", "a": "bad"})))
        .unwrap(); // eval error
    store
        .insert_document("src_processed", &doc(json!({"order_id": "O-y", "a": 3})))
        .unwrap();

    let summary = run(&store);
    assert_eq!(
        summary.documents_processed + summary.documents_skipped + summary.errors,
        23
    );
    assert_eq!(summary.documents_skipped, 1);
    assert_eq!(summary.errors, 1);
}

#[test]
fn batch_size_does_not_change_final_output() {
    let seed = |store: &DocStore| {
        for i in 0..57 {
            store
                .insert_document(
                    "src_processed",
                    &doc(json!({"order_id": format!("O-{i}"), "a": i, "b": i * 2})),
                )
                .unwrap();
        }
    };
    let formula = json!({
        "report_name": "sizes",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.b - src.a"}],
        "mapping_keys": {"src": ["order_id"]},
    });

    let small = store_with(formula.clone());
    seed(&small);
    let mut config = JobConfig::default();
    config.formula_batch_size = 3;
    JobRunner::new(&small, config).run().unwrap();

    let large = store_with(formula);
    seed(&large);
    let mut config = JobConfig::default();
    config.formula_batch_size = 50;
    JobRunner::new(&large, config).run().unwrap();

    let rows_small: Vec<_> = small.get_all("sizes").unwrap();
    let rows_large: Vec<_> = large.get_all("sizes").unwrap();
    assert_eq!(rows_small, rows_large);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 9: each run is recorded in the job_run log
// ─────────────────────────────────────────────────────────────────────────────

// ─────────────────────────────────────────────────────────────────────────────
// Test 8: one undeserializable stored document must not abort the run
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn structurally_malformed_document_does_not_abort_the_run() {
    let store = store_with(json!({
        "report_name": "survivor",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    // Raw row that fails deserialization outright: the reason rule has
    // no comparison mode. Only the broken report may be lost.
    store
        .insert_document(
            "formulas",
            &doc(json!({
                "report_name": "broken",
                "formulas": [{"logicNameKey": "X", "formulaText": "src.a"}],
                "reasons": [{"reason": "r", "delta_column": "d", "threshold": 1.0}],
            })),
        )
        .unwrap();
    store
        .insert_document("src_processed", &doc(json!({"order_id": "O-1", "a": 4})))
        .unwrap();

    let summary = run(&store);
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.reports_processed, 1);
    assert!(store.get_by_key("survivor", "O-1").unwrap().is_some());
}

#[test]
fn runs_are_recorded() {
    let store = store_with(json!({
        "report_name": "logged",
        "formulas": [{"logicNameKey": "NET", "formulaText": "src.a"}],
        "mapping_keys": {"src": ["order_id"]},
    }));
    store
        .insert_document("src_processed", &doc(json!({"order_id": "O-1", "a": 1})))
        .unwrap();

    assert_eq!(store.job_run_count().unwrap(), 0);
    run(&store);
    run(&store);
    assert_eq!(store.job_run_count().unwrap(), 2);
}
