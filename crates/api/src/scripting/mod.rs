//! Run dispatch and tracking.
//!
//! The [`RunTracker`] ties the sandbox provisioner to the run store,
//! providing a single entry point for dispatching automation runs and
//! querying their status.

pub mod tracker;

pub use tracker::{RunTracker, TrackerConfig};
