//! Run records and their status state machine.
//!
//! ```text
//! PENDING ──► EXECUTING ──► COMPLETED | FAILED | TIMED_OUT | CANCELED
//!    └──────────────────────► CANCELED
//! ```
//!
//! Terminal records never change again. Every mutation goes through
//! [`RunRecord::apply`], which enforces the transitions above for both the
//! in-memory and the PostgreSQL stores.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::execution::{ErrorKind, ExecutionReport};
use crate::request::ExecutionRequest;
use crate::types::{OrganizationId, RunId, SandboxId, TaskId, Timestamp};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Canceled => "CANCELED",
        }
    }

    /// Terminal status a failure of `kind` resolves to.
    pub fn for_failure(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::Canceled => Self::Canceled,
            _ => Self::Failed,
        }
    }
}

/// Which provisioner backend serviced the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunBackend {
    Single,
    Interactive,
}

/// Tenant-visible failure detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything the tracker knows about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: RunId,
    pub organization_id: OrganizationId,
    pub task_id: TaskId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<SandboxId>,
    pub backend: RunBackend,
    pub attempts: u32,
    #[serde(default)]
    pub logs: Vec<String>,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

/// A single state change applied to a [`RunRecord`].
#[derive(Debug, Clone)]
pub enum RunTransition {
    /// The execution task picked the run up.
    Started,
    /// A (re)try against the backend is starting.
    Attempt(u32),
    /// The backend produced a final report.
    Finished(ExecutionReport),
    /// The caller canceled the run.
    Canceled,
}

impl RunRecord {
    /// A fresh `PENDING` record for `request`.
    pub fn pending(run_id: RunId, request: &ExecutionRequest) -> Self {
        let backend = if request.sandbox_id.is_some() {
            RunBackend::Interactive
        } else {
            RunBackend::Single
        };
        Self {
            run_id,
            organization_id: request.organization_id.clone(),
            task_id: request.task_id.clone(),
            status: RunStatus::Pending,
            output: None,
            error: None,
            sandbox_id: request.sandbox_id.clone(),
            backend,
            attempts: 0,
            logs: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply `transition`, rejecting anything that would leave the state
    /// machine or touch a terminal record.
    pub fn apply(&mut self, transition: RunTransition) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "run {} is already {}",
                self.run_id,
                self.status.as_str()
            )));
        }

        match (self.status, transition) {
            (RunStatus::Pending, RunTransition::Started) => {
                self.status = RunStatus::Executing;
                self.started_at = Some(Utc::now());
            }
            (RunStatus::Executing, RunTransition::Attempt(attempt)) => {
                self.attempts = attempt;
            }
            (RunStatus::Executing, RunTransition::Finished(report)) => {
                self.finish(report);
            }
            (_, RunTransition::Canceled) => {
                self.status = RunStatus::Canceled;
                self.error = Some(RunError {
                    kind: ErrorKind::Canceled,
                    message: "run was canceled".to_string(),
                });
                self.finished_at = Some(Utc::now());
            }
            (status, transition) => {
                return Err(CoreError::Conflict(format!(
                    "run {} cannot apply {transition:?} while {}",
                    self.run_id,
                    status.as_str()
                )));
            }
        }
        Ok(())
    }

    fn finish(&mut self, report: ExecutionReport) {
        match report.failure_kind() {
            None => {
                self.status = RunStatus::Completed;
                self.output = Some(report.result);
            }
            Some(kind) => {
                self.status = RunStatus::for_failure(kind);
                self.error = Some(RunError {
                    kind,
                    message: report.message.unwrap_or_else(|| kind.to_string()),
                });
            }
        }
        self.logs = report.logs;
        self.finished_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn record() -> RunRecord {
        let request = ExecutionRequest::new(
            OrganizationId::parse("acme").expect("org"),
            TaskId::parse("t1").expect("task"),
        );
        RunRecord::pending(RunId::generate(), &request)
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut run = record();
        assert_eq!(run.backend, RunBackend::Single);
        run.apply(RunTransition::Started).expect("start");
        run.apply(RunTransition::Attempt(1)).expect("attempt");
        run.apply(RunTransition::Finished(ExecutionReport::success(
            json!(42),
            vec!["hi".into()],
        )))
        .expect("finish");

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!(42)));
        assert_eq!(run.attempts, 1);
        assert_eq!(run.logs, vec!["hi".to_string()]);
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn failure_kinds_map_to_statuses() {
        let cases = [
            (ErrorKind::TimedOut, RunStatus::TimedOut),
            (ErrorKind::Canceled, RunStatus::Canceled),
            (ErrorKind::InvalidExport, RunStatus::Failed),
            (ErrorKind::SandboxUnavailable, RunStatus::Failed),
        ];
        for (kind, expected) in cases {
            let mut run = record();
            run.apply(RunTransition::Started).expect("start");
            run.apply(RunTransition::Finished(ExecutionReport::failure(
                kind,
                "boom",
                vec![],
            )))
            .expect("finish");
            assert_eq!(run.status, expected);
            let error = run.error.expect("error recorded");
            assert_eq!(error.kind, kind);
            assert_eq!(error.message, "boom");
        }
    }

    #[test]
    fn terminal_records_are_immutable() {
        let mut run = record();
        run.apply(RunTransition::Started).expect("start");
        run.apply(RunTransition::Finished(ExecutionReport::success(json!(1), vec![])))
            .expect("finish");
        let snapshot = run.clone();

        assert_matches!(run.apply(RunTransition::Canceled), Err(CoreError::Conflict(_)));
        assert_matches!(
            run.apply(RunTransition::Finished(ExecutionReport::success(json!(2), vec![]))),
            Err(CoreError::Conflict(_))
        );
        assert_eq!(run, snapshot);
    }

    #[test]
    fn pending_can_be_canceled_but_not_finished() {
        let mut run = record();
        assert_matches!(
            run.apply(RunTransition::Finished(ExecutionReport::success(json!(1), vec![]))),
            Err(CoreError::Conflict(_))
        );
        run.apply(RunTransition::Canceled).expect("cancel");
        assert_eq!(run.status, RunStatus::Canceled);
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::Canceled));
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(RunStatus::TimedOut).expect("serialize"),
            json!("TIMED_OUT")
        );
        let run = record();
        let value = serde_json::to_value(&run).expect("serialize");
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["backend"], "single");
        assert!(value.get("output").is_none());
    }
}
