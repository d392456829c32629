//! Public data model shared by the engine, the stores and their callers.

pub mod secure_group_types;

pub use secure_group_types::*;
