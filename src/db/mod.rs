//! Storage layer: schema, transactional entity store, audit ledger, baselines

pub mod audit;
pub mod baseline;
pub mod schema;
pub mod store;

pub use audit::{AuditLedger, Operation, VerifyReport};
pub use baseline::{BaselineInfo, BaselineView, OnCollision};
pub use store::EntityStore;
