//! Sandboxed execution of tenant automation scripts.
//!
//! - [`engine`]: runs one script in a fresh JavaScript isolate.
//! - [`capabilities`]: the host functions a script may call.
//! - [`runner`]: the `evidence-runner` binary's entry point, used for
//!   child-process and interactive execution.
//! - [`provisioner`]: single-invocation and interactive sandbox backends.

pub mod capabilities;
pub mod engine;
pub mod error;
pub mod provisioner;
pub mod runner;
pub mod subprocess;

pub use capabilities::{CapabilityProfile, CapabilitySurface};
pub use engine::{Engine, ExecutionJob, ExecutionLimits};
pub use error::BackendError;
pub use provisioner::{BackendRun, DetachedRun, DispatchJob, Provisioner, SandboxBackend};
