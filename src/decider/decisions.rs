//! The decisions we send back to the workflow service.

use uuid::Uuid;

use crate::prelude::*;

/// Longest ID the workflow service accepts for tasks and timers.
const MAX_ID_LEN: usize = 256;

/// Longest function name the workflow service accepts.
const MAX_FUNCTION_NAME_LEN: usize = 64;

/// Longest `input`, `control`, `result` or `details` value.
const MAX_PAYLOAD_LEN: usize = 32_768;

/// Longest failure reason.
const MAX_REASON_LEN: usize = 256;

/// A single decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Run a compute task.
    ScheduleTask {
        id: String,
        function: String,
        input: String,
        control: String,
        timeout_secs: u64,
    },

    /// Start a timer. `control` holds the scheduled-event ID of the task we
    /// will retry when it fires.
    StartTimer {
        id: String,
        delay_secs: u64,
        control: String,
    },

    /// Finish the workflow successfully.
    CompleteWorkflow { result: String },

    /// Finish the workflow with a failure.
    FailWorkflow { reason: String, details: String },
}

impl Decision {
    /// Does this decision end the workflow?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Decision::CompleteWorkflow { .. } | Decision::FailWorkflow { .. }
        )
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Decision::ScheduleTask { .. } => "ScheduleTask",
            Decision::StartTimer { .. } => "StartTimer",
            Decision::CompleteWorkflow { .. } => "CompleteWorkflow",
            Decision::FailWorkflow { .. } => "FailWorkflow",
        }
    }

    /// Check that the workflow service would accept this decision.
    pub fn validate(&self) -> Result<()> {
        match self {
            Decision::ScheduleTask {
                id,
                function,
                input,
                control,
                timeout_secs,
            } => {
                check_id(id)?;
                check_len("function name", function, 1, MAX_FUNCTION_NAME_LEN)?;
                check_len("task input", input, 0, MAX_PAYLOAD_LEN)?;
                check_len("task control", control, 0, MAX_PAYLOAD_LEN)?;
                if *timeout_secs == 0 {
                    return Err(anyhow!("task timeout must be positive"));
                }
            }
            Decision::StartTimer {
                id,
                delay_secs: _,
                control,
            } => {
                check_id(id)?;
                check_len("timer control", control, 0, MAX_PAYLOAD_LEN)?;
            }
            Decision::CompleteWorkflow { result } => {
                check_len("workflow result", result, 0, MAX_PAYLOAD_LEN)?;
            }
            Decision::FailWorkflow { reason, details } => {
                check_len("failure reason", reason, 0, MAX_REASON_LEN)?;
                check_len("failure details", details, 0, MAX_PAYLOAD_LEN)?;
            }
        }
        Ok(())
    }
}

fn check_id(id: &str) -> Result<()> {
    check_len("ID", id, 1, MAX_ID_LEN)?;
    if id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ':' | '/' | '|'))
    {
        return Err(anyhow!("ID {id:?} contains forbidden characters"));
    }
    Ok(())
}

fn check_len(what: &str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(anyhow!(
            "{what} has length {len}, expected between {min} and {max}"
        ));
    }
    Ok(())
}

/// Builds decisions, filling in our configured task function and timeouts.
#[derive(Clone, Debug)]
pub struct DecisionBuilder {
    /// The compute function that OCRs a page.
    function: String,

    /// Start-to-close timeout for each compute task.
    timeout_secs: u64,
}

impl DecisionBuilder {
    /// Create a new builder.
    pub fn new(function: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            function: function.into(),
            timeout_secs,
        }
    }

    /// Schedule a compute task with a fresh ID.
    pub fn schedule_task(&self, input: String, control: impl Into<String>) -> Decision {
        Decision::ScheduleTask {
            id: fresh_id(),
            function: self.function.clone(),
            input,
            control: control.into(),
            timeout_secs: self.timeout_secs,
        }
    }

    /// Start a timer with a fresh ID.
    pub fn start_timer(&self, delay_secs: u64, control: impl Into<String>) -> Decision {
        Decision::StartTimer {
            id: fresh_id(),
            delay_secs,
            control: control.into(),
        }
    }

    /// Complete the workflow.
    pub fn complete_workflow(&self, result: impl Into<String>) -> Decision {
        Decision::CompleteWorkflow {
            result: result.into(),
        }
    }

    /// Fail the workflow.
    pub fn fail_workflow(
        &self,
        reason: impl Into<String>,
        details: impl Into<String>,
    ) -> Decision {
        Decision::FailWorkflow {
            reason: reason.into(),
            details: details.into(),
        }
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}
