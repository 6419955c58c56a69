//! Shared primitive types used across the reconciliation engine.

use serde_json::Value;

/// A schema-less document: ordered field-name → JSON value mapping.
/// Source collections carry arbitrary field sets, so this is the only
/// record representation the engine sees at its boundaries.
pub type Document = serde_json::Map<String, Value>;

/// Short name identifying a data source within qualified field
/// references (the `zomato` in `zomato.bill_subtotal`).
pub type Alias = String;

/// A single field name inside a source or output document.
pub type FieldName = String;

/// Unique name of a configured report. Also names the output collection
/// and, via `<alias>_processed`, the source collections.
pub type ReportName = String;

/// Composite identity value correlating records across source aliases;
/// also the upsert key of the output collection.
pub type MappingKey = String;

/// The canonical identifier of one scheduled run.
pub type RunId = String;
