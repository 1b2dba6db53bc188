//! Strata: Strata Analysis Toolkit
//!
//! An integrity-and-versioning engine for hierarchically-structured safety
//! analysis datasets: hierarchical identity allocation, a per-table
//! hash-chained audit ledger, immutable named baselines, and offline
//! branch/merge collaboration with manual conflict resolution.

pub mod cli;
pub mod collab;
pub mod core;
pub mod db;
pub mod entities;
