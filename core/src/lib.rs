//! recon-core — scheduled formula-calculation and reconciliation engine.
//!
//! Reconciles large document collections against user-defined
//! arithmetic formulas: loads formula documents, correlates source
//! records via configurable composite mapping keys, evaluates a
//! restricted expression grammar, computes delta columns, classifies
//! discrepancy reasons and upserts reconciled rows batch by batch.
//!
//! Layering, leaf-first: expr / mapping_key / classifier are pure;
//! formula compiles configuration; store owns all persistence; runner
//! orchestrates one run; scheduler owns the recurring trigger.

pub mod classifier;
pub mod config;
pub mod error;
pub mod expr;
pub mod formula;
pub mod mapping_key;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod types;
