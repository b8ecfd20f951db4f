//! Workflow history events, and lookups over a history.
//!
//! We keep our own small event model instead of passing SDK types around, so
//! that the replay logic can be tested with hand-written histories. Only the
//! attributes the decider actually reads are carried over.

use std::collections::BTreeMap;

/// Event families the decider dispatches on.
///
/// Compute tasks may be lambda functions or activities depending on how the
/// workflow is configured, so both tag spellings map onto the same family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    WorkflowExecutionStarted,
    WorkflowExecutionFailed,
    WorkflowExecutionSignaled,
    WorkflowExecutionCancelRequested,
    TaskScheduled,
    TaskCompleted,
    TaskFailed,
    TaskTimedOut,
    TimerStarted,
    TimerFired,
    StartTimerFailed,
    CompleteWorkflowExecutionFailed,
    FailWorkflowExecutionFailed,
    /// Decision task bookkeeping (`DecisionTask*`). Never part of `recent`.
    Decision,
    /// Anything else. The decider ignores these.
    Other,
}

impl EventKind {
    /// Classify an event type tag.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "WorkflowExecutionStarted" => Self::WorkflowExecutionStarted,
            "WorkflowExecutionFailed" => Self::WorkflowExecutionFailed,
            "WorkflowExecutionSignaled" => Self::WorkflowExecutionSignaled,
            "WorkflowExecutionCancelRequested" => Self::WorkflowExecutionCancelRequested,
            "LambdaFunctionScheduled" | "ActivityTaskScheduled" => Self::TaskScheduled,
            "LambdaFunctionCompleted" | "ActivityTaskCompleted" => Self::TaskCompleted,
            "LambdaFunctionFailed" | "ActivityTaskFailed" => Self::TaskFailed,
            "LambdaFunctionTimedOut" | "ActivityTaskTimedOut" => Self::TaskTimedOut,
            "TimerStarted" => Self::TimerStarted,
            "TimerFired" => Self::TimerFired,
            "StartTimerFailed" => Self::StartTimerFailed,
            "CompleteWorkflowExecutionFailed" => Self::CompleteWorkflowExecutionFailed,
            "FailWorkflowExecutionFailed" => Self::FailWorkflowExecutionFailed,
            t if t.starts_with("Decision") => Self::Decision,
            _ => Self::Other,
        }
    }
}

/// Attributes of a history event that the decider cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventAttributes {
    WorkflowStarted {
        input: Option<String>,
    },
    WorkflowFailed {
        reason: Option<String>,
        details: Option<String>,
    },
    WorkflowSignaled {
        signal_name: String,
    },
    TaskScheduled {
        task_id: String,
        input: Option<String>,
        control: Option<String>,
    },
    TaskCompleted {
        scheduled_event_id: i64,
        result: Option<String>,
    },
    TaskFailed {
        scheduled_event_id: i64,
        reason: Option<String>,
        details: Option<String>,
    },
    TaskTimedOut {
        scheduled_event_id: i64,
        timeout_type: Option<String>,
    },
    TimerStarted {
        timer_id: String,
        control: Option<String>,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
    /// Events whose only interesting attribute is a cause, like
    /// `StartTimerFailed` or `CompleteWorkflowExecutionFailed`.
    Cause(Option<String>),
    None,
}

/// A single event from a workflow history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEvent {
    /// Monotonically increasing within a history.
    pub id: i64,

    /// The event type tag, exactly as the workflow service sent it.
    pub tag: String,

    /// Type-specific attributes.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Create a new event.
    pub fn new(id: i64, tag: impl Into<String>, attributes: EventAttributes) -> Self {
        Self {
            id,
            tag: tag.into(),
            attributes,
        }
    }

    /// Which family does this event belong to?
    pub fn kind(&self) -> EventKind {
        EventKind::from_tag(&self.tag)
    }

    /// For task completion, failure and timeout events, the ID of the
    /// `TaskScheduled` event they answer.
    pub fn scheduled_event_id(&self) -> Option<i64> {
        match &self.attributes {
            EventAttributes::TaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::TaskFailed {
                scheduled_event_id, ..
            }
            | EventAttributes::TaskTimedOut {
                scheduled_event_id, ..
            } => Some(*scheduled_event_id),
            _ => None,
        }
    }

    /// The `control` field of a scheduled task or a started timer.
    pub fn control(&self) -> Option<&str> {
        match &self.attributes {
            EventAttributes::TaskScheduled { control, .. }
            | EventAttributes::TimerStarted { control, .. } => control.as_deref(),
            _ => None,
        }
    }

    /// The `input` field of a workflow start or a scheduled task.
    pub fn input(&self) -> Option<&str> {
        match &self.attributes {
            EventAttributes::WorkflowStarted { input }
            | EventAttributes::TaskScheduled { input, .. } => input.as_deref(),
            _ => None,
        }
    }
}

/// Find an event by ID. Histories may be partial, so we don't assume that
/// IDs match positions.
pub fn by_id(events: &[HistoryEvent], id: i64) -> Option<&HistoryEvent> {
    events.iter().find(|e| e.id == id)
}

/// Find the first event of a given kind, in history order.
pub fn first_by_kind(events: &[HistoryEvent], kind: EventKind) -> Option<&HistoryEvent> {
    events.iter().find(|e| e.kind() == kind)
}

/// Count events by type tag.
pub fn counts_by_type(events: &[HistoryEvent]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(event.tag.as_str()).or_insert(0) += 1;
    }
    counts
}
