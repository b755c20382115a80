//! Infrastructure layer for Chainflow.
//!
//! Contains the SQLite implementation of the `ChainRepository` trait defined
//! in `chainflow-core`: split read/write pools in WAL mode, migrations, and
//! row mapping for the chain, execution, step, job, and entity tables.

pub mod sqlite;
