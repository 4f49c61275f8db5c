//! Job-record persistence.
//!
//! The production store is an external, strongly consistent keyed table with
//! conditional writes and a secondary index on `user_id`. This module defines
//! the contract the workers rely on plus an in-memory implementation.
//!
//! ## Contract
//!
//! - `get` / `put` are plain keyed reads and overwrites
//! - `update` applies a partial field set; with a `Condition` it is a
//!   compare-and-set that fails without effect when the precondition does
//!   not hold
//! - `query_by_user` reads the `user_id` index

pub mod store;

pub use store::{InMemoryJobRecordStore, JobRecordStore, RecordStoreError};
