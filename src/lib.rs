//! Secure Groups - membership eligibility engine
//!
//! Decides, for every (secure group, user) pair, whether the user currently
//! qualifies for membership and propagates that decision into a downstream
//! permission group.
//!
//! ## Pipeline
//! Override -> Rule chain -> Filter evaluator -> Grace -> Applier
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use secure_groups::config::EngineConfig;
//! use secure_groups::eligibility::{BatchOrchestrator, RunContext};
//! use secure_groups::store::Stores;
//! use secure_groups::store_memory::MemoryStore;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::load_fixture("fixture.yaml").await?);
//! let engine = BatchOrchestrator::new(Stores::from_backend(store), EngineConfig::default());
//! let report = engine.evaluate_all(&RunContext::new("cron")).await?;
//! println!("{} pairs, {} failed", report.pairs_processed, report.failed);
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Engine configuration
pub mod config;

// Domain types
pub mod api;

// Persistence ports and the in-memory backend
pub mod store;
pub mod store_memory;

// Filter evaluation, rule chains, grace, overrides, batch runs
pub mod eligibility;

// Database integration (when enabled)
#[cfg(feature = "database")]
pub mod database;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
