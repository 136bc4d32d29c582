//! Reconciliation engines.
//!
//! Every engine takes the store explicitly, works one unit at a time (one
//! bulk delete, one record update, one schema step), folds isolated
//! failures into its outcome and returns early only on connectivity loss.
//! A cancelled token stops the engine between units with a partial outcome.
//!
//! - [`grouper`]: partition records by logical key
//! - [`dedup`]: keep the most recent record per key
//! - [`relink`]: reattach orphans through a secondary identifier
//! - [`rename`]: rewrite a unique column in place
//! - [`patch`]: additive schema steps and session clearing
//! - [`audit`]: read-only link audit

pub mod audit;
pub mod dedup;
pub mod grouper;
pub mod patch;
pub mod relink;
pub mod rename;
