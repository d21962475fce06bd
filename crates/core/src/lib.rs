//! Domain types shared by every evidence automation crate.
//!
//! Identifiers, script keys, the run state machine, the execution report
//! contract, and the [`RunStore`](run_store::RunStore) persistence seam.

pub mod error;
pub mod execution;
pub mod request;
pub mod run;
pub mod run_store;
pub mod script_key;
pub mod types;
