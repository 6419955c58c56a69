//! Formula documents — per-report reconciliation configuration.
//!
//! A raw `FormulaDocument` mirrors the JSON stored in the `formulas`
//! collection. `compile()` turns it into a `CompiledReport`: every
//! expression parsed exactly once, output names checked for uniqueness,
//! and the required-field set per alias computed up front. A document
//! that fails to compile is a configuration error — the report is
//! skipped and the run continues.

use crate::{
    classifier::ReasonRule,
    error::{EngineError, EngineResult},
    expr::{Expr, FieldRef},
    runner::{MAPPING_KEY_FIELD, REASON_FIELD},
    types::{Alias, FieldName, ReportName},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Suffix appended to an alias to name its source collection.
pub const PROCESSED_SUFFIX: &str = "_processed";

// ── Raw document shape (as stored) ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaSpec {
    #[serde(rename = "logicNameKey")]
    pub logic_name_key: String,
    #[serde(rename = "formulaText")]
    pub formula_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaColumnSpec {
    pub delta_column_name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaDocument {
    #[serde(default)]
    pub report_name: String,
    #[serde(default)]
    pub formulas: Vec<FormulaSpec>,
    /// alias → ordered key field names. Absent or empty means the
    /// fallback identity applies (see mapping_key module).
    #[serde(default)]
    pub mapping_keys: Option<BTreeMap<Alias, Vec<FieldName>>>,
    /// Opaque filter predicates, passed through to the cursor as
    /// per-alias field equality when shaped as `{alias: {field: value}}`.
    #[serde(default)]
    pub conditions: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub delta_columns: Vec<DeltaColumnSpec>,
    #[serde(default)]
    pub reasons: Vec<ReasonRule>,
}

// ── Compiled form ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompiledFormula {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone)]
pub struct CompiledDelta {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone)]
pub struct CompiledReport {
    pub report_name: ReportName,
    pub formulas: Vec<CompiledFormula>,
    pub delta_columns: Vec<CompiledDelta>,
    pub reasons: Vec<ReasonRule>,
    pub mapping_keys: BTreeMap<Alias, Vec<FieldName>>,
    pub conditions: Option<serde_json::Map<String, serde_json::Value>>,
    /// Aliases this report reads, in processing order: the configured
    /// mapping-key aliases when present, otherwise every alias the
    /// formulas and delta columns reference.
    pub aliases: Vec<Alias>,
    /// Fields each alias must supply, declared at compile time so the
    /// runner merges exactly what evaluation will read.
    pub required_fields: BTreeMap<Alias, BTreeSet<FieldName>>,
}

impl FormulaDocument {
    /// Formula and delta outputs land on the output row next to the
    /// engine's own fields, so the reserved names cannot be claimed.
    fn check_output_name(&self, name: &str) -> EngineResult<()> {
        if name == MAPPING_KEY_FIELD || name == REASON_FIELD {
            return Err(EngineError::Config {
                report: self.report_name.clone(),
                reason: format!("output name '{name}' is reserved"),
            });
        }
        Ok(())
    }

    pub fn compile(&self) -> EngineResult<CompiledReport> {
        if self.report_name.trim().is_empty() {
            return Err(EngineError::Config {
                report: "<unnamed>".into(),
                reason: "missing report_name".into(),
            });
        }
        if self.formulas.is_empty() {
            return Err(EngineError::Config {
                report: self.report_name.clone(),
                reason: "empty formulas list".into(),
            });
        }

        let mut formulas = Vec::with_capacity(self.formulas.len());
        let mut seen_names = BTreeSet::new();
        let mut field_refs: BTreeSet<FieldRef> = BTreeSet::new();

        for spec in &self.formulas {
            self.check_output_name(&spec.logic_name_key)?;
            if !seen_names.insert(spec.logic_name_key.clone()) {
                return Err(EngineError::Config {
                    report: self.report_name.clone(),
                    reason: format!("duplicate formula output '{}'", spec.logic_name_key),
                });
            }
            let expr = Expr::parse(&spec.formula_text).map_err(|e| EngineError::Config {
                report: self.report_name.clone(),
                reason: format!("formula '{}': {e}", spec.logic_name_key),
            })?;
            expr.referenced_fields(&mut field_refs);
            formulas.push(CompiledFormula {
                name: spec.logic_name_key.clone(),
                expr,
            });
        }

        let mut delta_columns = Vec::with_capacity(self.delta_columns.len());
        for spec in &self.delta_columns {
            self.check_output_name(&spec.delta_column_name)?;
            let expr = Expr::parse(&spec.value).map_err(|e| EngineError::Config {
                report: self.report_name.clone(),
                reason: format!("delta column '{}': {e}", spec.delta_column_name),
            })?;
            let mut outputs = BTreeSet::new();
            expr.referenced_outputs(&mut outputs);
            for output in &outputs {
                if !seen_names.contains(output) {
                    return Err(EngineError::Config {
                        report: self.report_name.clone(),
                        reason: format!(
                            "delta column '{}' references unknown output '{output}'",
                            spec.delta_column_name
                        ),
                    });
                }
            }
            expr.referenced_fields(&mut field_refs);
            delta_columns.push(CompiledDelta {
                name: spec.delta_column_name.clone(),
                expr,
            });
        }

        let delta_names: BTreeSet<&str> =
            delta_columns.iter().map(|d| d.name.as_str()).collect();
        for rule in &self.reasons {
            if !delta_names.contains(rule.delta_column.as_str()) {
                return Err(EngineError::Config {
                    report: self.report_name.clone(),
                    reason: format!(
                        "reason '{}' references unknown delta column '{}'",
                        rule.reason, rule.delta_column
                    ),
                });
            }
        }

        let mut required_fields: BTreeMap<Alias, BTreeSet<FieldName>> = BTreeMap::new();
        for field_ref in &field_refs {
            required_fields
                .entry(field_ref.alias.clone())
                .or_default()
                .insert(field_ref.field.clone());
        }

        let mapping_keys = self.mapping_keys.clone().unwrap_or_default();
        let aliases: Vec<Alias> = if mapping_keys.values().any(|fields| !fields.is_empty()) {
            // An alias the formulas read but the mapping omits would
            // never be scanned, leaving its formulas permanently
            // deferred with no signal. Reject the document instead.
            for alias in required_fields.keys() {
                if !mapping_keys.contains_key(alias) {
                    return Err(EngineError::Config {
                        report: self.report_name.clone(),
                        reason: format!(
                            "formulas reference alias '{alias}' but mapping_keys omits it"
                        ),
                    });
                }
            }
            mapping_keys.keys().cloned().collect()
        } else {
            required_fields.keys().cloned().collect()
        };

        if aliases.is_empty() {
            return Err(EngineError::Config {
                report: self.report_name.clone(),
                reason: "no source aliases: formulas reference no alias.field and no \
                         mapping_keys are configured"
                    .into(),
            });
        }

        Ok(CompiledReport {
            report_name: self.report_name.clone(),
            formulas,
            delta_columns,
            reasons: self.reasons.clone(),
            mapping_keys,
            conditions: self.conditions.clone(),
            aliases,
            required_fields,
        })
    }
}

impl CompiledReport {
    /// Source collection name for an alias.
    pub fn source_collection(alias: &str) -> String {
        format!("{alias}{PROCESSED_SUFFIX}")
    }

    /// Key fields configured for an alias; empty slice means the
    /// fallback identity applies.
    pub fn key_fields(&self, alias: &str) -> &[FieldName] {
        self.mapping_keys
            .get(alias)
            .map(|fields| fields.as_slice())
            .unwrap_or(&[])
    }

    /// Equality filter for an alias, extracted from the opaque
    /// conditions object when it is shaped as `{alias: {field: value}}`.
    pub fn filter_for_alias(
        &self,
        alias: &str,
    ) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.conditions
            .as_ref()
            .and_then(|conditions| conditions.get(alias))
            .and_then(|value| value.as_object())
    }
}
