//! The job runner — one complete reconciliation pass over every
//! configured report.
//!
//! RULES:
//!   - Only store connectivity at load time aborts a run.
//!   - A bad formula document skips that report; the run continues.
//!   - A bad record is counted and skipped; the batch continues.
//!   - Every skipped or failed record increments a counter and emits a
//!     log signal. Nothing is dropped silently.
//!
//! Per record the flow is: build mapping key → merge the record's
//! required fields into the output row for that key → evaluate every
//! formula whose inputs are present → compute delta columns → classify
//! the reason → upsert. The output row is the merge point across
//! aliases, so the final state is a pure function of the final merged
//! field set: batch order and re-runs cannot change it.

use crate::{
    classifier,
    config::JobConfig,
    error::{EngineError, EngineResult},
    expr::Scope,
    formula::CompiledReport,
    mapping_key,
    store::{DocStore, JobRunRow, SourceRecord},
    types::RunId,
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// Reserved field on every output row holding the mapping key value.
pub const MAPPING_KEY_FIELD: &str = "mapping_key";
/// Reserved field on every output row holding the assigned reason.
pub const REASON_FIELD: &str = "reason";

/// Ephemeral counters for one run. Not persisted as-is; the store's
/// job_run log keeps a flattened copy.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub reports_processed: u64,
    pub documents_processed: u64,
    pub documents_skipped: u64,
    pub errors: u64,
    #[serde(skip)]
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Progress through one run. Logged on every transition; useful when a
/// long run needs diagnosing from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    ProcessingReport(usize),
    ProcessingBatch(usize),
    Writing,
    Completed,
    Failed,
}

pub struct JobRunner<'a> {
    store: &'a DocStore,
    config: JobConfig,
    cancel: Arc<AtomicBool>,
    state: RunState,
}

struct ReportCounters {
    processed: u64,
    skipped: u64,
    errors: u64,
}

impl<'a> JobRunner<'a> {
    pub fn new(store: &'a DocStore, config: JobConfig) -> Self {
        Self::with_cancel(store, config, Arc::new(AtomicBool::new(false)))
    }

    /// Build a runner sharing an externally owned cancellation flag.
    /// The flag is checked between batches; setting it stops the run
    /// after the current batch completes.
    pub fn with_cancel(store: &'a DocStore, config: JobConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            store,
            config,
            cancel,
            state: RunState::Idle,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn set_state(&mut self, state: RunState) {
        log::debug!("run state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Execute one complete run across all configured reports.
    ///
    /// Returns `Err` only for store connectivity failure at load time;
    /// every other failure is recovered locally and surfaces through
    /// the summary counters.
    pub fn run(&mut self) -> EngineResult<RunSummary> {
        let run_id: RunId = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let started_at = chrono::Utc::now();
        log::info!("formula calculation run {run_id} started");

        self.set_state(RunState::Loading);
        let documents = self.store.load_formula_documents().map_err(|e| {
            self.state = RunState::Failed;
            EngineError::Connectivity(format!("cannot load formula documents: {e}"))
        })?;
        log::info!("loaded {} formula document(s)", documents.len());

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            status: RunStatus::Completed,
            reports_processed: 0,
            documents_processed: 0,
            documents_skipped: 0,
            errors: 0,
            duration: Duration::ZERO,
        };

        for (index, document) in documents.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                log::warn!("run {run_id} cancelled before report {index}");
                summary.status = RunStatus::Cancelled;
                break;
            }

            self.set_state(RunState::ProcessingReport(index));
            let report = match document.compile() {
                Ok(report) => report,
                Err(e) => {
                    log::warn!("skipping formula document {index}: {e}");
                    continue;
                }
            };

            log::info!("report '{}' started", report.report_name);
            match self.process_report(&report) {
                Ok(counters) => {
                    summary.reports_processed += 1;
                    summary.documents_processed += counters.processed;
                    summary.documents_skipped += counters.skipped;
                    summary.errors += counters.errors;
                    log::info!(
                        "report '{}' completed: {} processed, {} skipped, {} errors",
                        report.report_name,
                        counters.processed,
                        counters.skipped,
                        counters.errors
                    );
                }
                Err(e) => {
                    // Report-scoped failure: log and move to the next report.
                    log::error!("report '{}' failed: {e}", report.report_name);
                }
            }
        }

        if self.cancel.load(Ordering::Relaxed) {
            summary.status = RunStatus::Cancelled;
        }
        summary.duration = started.elapsed();
        if summary.status == RunStatus::Completed {
            self.set_state(RunState::Completed);
        }
        log::info!(
            "run {run_id} {:?}: {} report(s), {} processed, {} skipped, {} errors in {:.2?}",
            summary.status,
            summary.reports_processed,
            summary.documents_processed,
            summary.documents_skipped,
            summary.errors,
            summary.duration
        );

        let row = JobRunRow {
            run_id,
            started_at: started_at.to_rfc3339(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            status: match summary.status {
                RunStatus::Completed => "completed".into(),
                RunStatus::Cancelled => "cancelled".into(),
            },
            reports_processed: summary.reports_processed,
            documents_processed: summary.documents_processed,
            documents_skipped: summary.documents_skipped,
            errors: summary.errors,
            duration_ms: summary.duration.as_millis() as u64,
        };
        if let Err(e) = self.store.insert_job_run(&row) {
            log::warn!("could not persist job run record: {e}");
        }

        Ok(summary)
    }

    // ── Per-report processing ──────────────────────────────────

    fn process_report(&mut self, report: &CompiledReport) -> EngineResult<ReportCounters> {
        let batch_size = self.config.effective_batch_size();
        let mut counters = ReportCounters {
            processed: 0,
            skipped: 0,
            errors: 0,
        };

        self.store.ensure_collection(&report.report_name)?;

        for alias in &report.aliases {
            let collection = CompiledReport::source_collection(alias);
            if !self.store.collection_exists(&collection)? {
                log::warn!(
                    "report '{}': source collection '{collection}' does not exist, skipping alias",
                    report.report_name
                );
                continue;
            }

            let filter = report.filter_for_alias(alias);
            let total = if filter.is_none() {
                Some(self.store.count_documents(&collection)?)
            } else {
                None
            };
            let total_batches = total.map(|t| t.div_ceil(batch_size as u64).max(1));

            let mut cursor = self.store.stream(&collection, filter, batch_size)?;
            let mut batch_index = 0u64;
            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    log::warn!(
                        "report '{}' alias '{alias}': cancelled after batch {batch_index}",
                        report.report_name
                    );
                    return Ok(counters);
                }

                // The batch vec is owned by this scope and dropped at
                // the bottom of the loop, before the next fetch.
                let batch = cursor.next_batch()?;
                if batch.is_empty() {
                    break;
                }
                batch_index += 1;
                self.set_state(RunState::ProcessingBatch(batch_index as usize));

                for record in &batch {
                    match self.process_record(report, alias, record) {
                        Ok(true) => counters.processed += 1,
                        Ok(false) => counters.skipped += 1,
                        Err(e) => {
                            counters.errors += 1;
                            log::debug!(
                                "report '{}' alias '{alias}' record {}: {e}",
                                report.report_name,
                                record.id
                            );
                        }
                    }
                }
                self.set_state(RunState::Writing);

                match total_batches {
                    Some(n) => log::info!(
                        "report '{}' alias '{alias}': batch {batch_index}/{n} ({} records)",
                        report.report_name,
                        batch.len()
                    ),
                    None => log::info!(
                        "report '{}' alias '{alias}': batch {batch_index} ({} records)",
                        report.report_name,
                        batch.len()
                    ),
                }
            }
        }

        Ok(counters)
    }

    /// Process one source record. Returns Ok(true) when it contributed
    /// to the output collection, Ok(false) when skipped for lack of a
    /// mapping key, and Err for record-scoped failures.
    fn process_record(
        &self,
        report: &CompiledReport,
        alias: &str,
        record: &SourceRecord,
    ) -> EngineResult<bool> {
        let key_fields = report.key_fields(alias);
        let Some(key) = mapping_key::build_key(alias, record.id, &record.doc, key_fields) else {
            return Ok(false);
        };

        // Merge point: start from the stored row for this key, if any.
        let mut row = self
            .store
            .get_by_key(&report.report_name, &key)?
            .unwrap_or_default();
        row.insert(
            MAPPING_KEY_FIELD.to_string(),
            serde_json::Value::String(key.clone()),
        );

        if let Some(required) = report.required_fields.get(alias) {
            for field in required {
                if let Some(value) = record.doc.get(field) {
                    row.insert(format!("{alias}.{field}"), value.clone());
                }
            }
        }

        // Evaluate whatever is evaluable against the merged row.
        // Formulas still waiting on another alias's record stay absent;
        // that is deferral, not an error for this record.
        for formula in &report.formulas {
            let scope = Scope {
                fields: &row,
                outputs: &row,
            };
            if !formula.expr.is_ready(&scope) {
                continue;
            }
            let value = formula.expr.eval(&scope)?;
            row.insert(formula.name.clone(), json_number(value)?);
        }

        for delta in &report.delta_columns {
            let scope = Scope {
                fields: &row,
                outputs: &row,
            };
            if !delta.expr.is_ready(&scope) {
                continue;
            }
            let value = delta.expr.eval(&scope)?;
            row.insert(delta.name.clone(), json_number(value)?);
        }

        row.insert(
            REASON_FIELD.to_string(),
            serde_json::Value::String(classifier::classify(&report.reasons, &row)),
        );

        if let Err(e) = self.store.upsert(&report.report_name, &key, &row) {
            // Persistence failure is counted, never aborts the batch.
            log::warn!(
                "report '{}': upsert failed for key '{key}': {e}",
                report.report_name
            );
            return Err(e);
        }

        Ok(true)
    }
}

fn json_number(value: f64) -> EngineResult<serde_json::Value> {
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .ok_or_else(|| EngineError::Eval(format!("non-finite result {value}")))
}
