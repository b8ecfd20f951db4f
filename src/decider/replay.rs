//! Rebuilding workflow state from its history, and choosing what to do next.
//!
//! The workflow service is our only durable memory. Every decision task
//! carries the full history, and we re-derive everything from it each time:
//! which pages are done, which tasks need retrying, and how many attempts
//! each page has had. Replaying the same history twice yields the same
//! decisions, apart from random task IDs and retry jitter.

use std::collections::{BTreeSet, HashSet};

use crate::{
    codec::{TaskFailureDetails, TaskInput, WorkflowRequest, decode_workflow_input},
    prelude::*,
};

use super::{
    decisions::{Decision, DecisionBuilder},
    events::{EventAttributes, EventKind, HistoryEvent, by_id, counts_by_type},
    finalize::{Finalization, collect_pages},
    retry_policy::{RetryAction, RetryPolicy, parse_attempt},
};

/// Reason attached to every failure decision we make.
pub const FAILURE_REASON: &str = "failure";

/// Failure message when a page has run out of attempts.
pub const MAX_ATTEMPTS_MESSAGE: &str = "maximum OCR attempts reached for one or more pages";

/// Failure message for workflows with no pages.
pub const NO_PAGES_MESSAGE: &str = "No PIDs to process";

/// Failure message for canceled workflows.
pub const CANCELED_MESSAGE: &str = "workflow execution canceled";

/// Failure message when the workflow service reports the execution failed.
pub const EXECUTION_FAILED_MESSAGE: &str = "workflow execution failed";

/// Failure message for a resubmitted failure whose cause we can't find.
pub const RESUBMITTED_MESSAGE: &str = "workflow failure resubmitted";

/// A decision task, with its history pages already stitched together.
#[derive(Clone, Debug, Default)]
pub struct DecisionTask {
    /// Token identifying this task when we respond.
    pub task_token: String,

    /// The workflow this task belongs to.
    pub workflow_id: String,

    /// The last event a previous decider saw. Everything after this is new.
    pub previous_started_event_id: i64,

    /// The complete event history.
    pub events: Vec<HistoryEvent>,
}

/// How far along a request is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub reqid: String,
    pub completed: usize,
    pub total: usize,
}

/// Everything a replay produced.
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Decisions to submit, in order.
    pub decisions: Vec<Decision>,

    /// Set when this replay newly chose a terminal decision, and the
    /// requestor should hear about it.
    pub finalization: Option<Finalization>,

    /// Page progress, when we know which request this is.
    pub progress: Option<Progress>,
}

impl ReplayOutcome {
    /// Does this outcome end the workflow?
    pub fn is_terminal(&self) -> bool {
        self.decisions.iter().any(Decision::is_terminal)
    }
}

/// Facts gathered from a single pass over the history.
struct HistoryScan<'a> {
    /// The decoded workflow request, if we found a start event.
    request: Option<Result<WorkflowRequest>>,

    /// Every task completion event.
    completed: Vec<&'a HistoryEvent>,

    /// Has the workflow already failed?
    halted: bool,

    /// Events newer than the previous decider's cursor, minus decision task
    /// bookkeeping.
    recent: Vec<&'a HistoryEvent>,
}

impl<'a> HistoryScan<'a> {
    fn new(task: &'a DecisionTask) -> Self {
        let mut request = None;
        let mut completed = vec![];
        let mut halted = false;
        let mut recent = vec![];
        for event in &task.events {
            match event.kind() {
                EventKind::WorkflowExecutionStarted if request.is_none() => {
                    request = Some(decode_workflow_input(event.input().unwrap_or("")));
                }
                EventKind::TaskCompleted => completed.push(event),
                EventKind::WorkflowExecutionFailed => halted = true,
                _ => {}
            }
            if event.id > task.previous_started_event_id
                && event.kind() != EventKind::Decision
            {
                recent.push(event);
            }
        }
        Self {
            request,
            completed,
            halted,
            recent,
        }
    }

    fn recent_contains(&self, kind: EventKind) -> bool {
        self.recent.iter().any(|e| e.kind() == kind)
    }
}

/// Turns histories into decisions.
#[derive(Clone, Debug)]
pub struct ReplayEngine {
    builder: DecisionBuilder,
    policy: RetryPolicy,
}

impl ReplayEngine {
    /// Create a new replay engine.
    pub fn new(builder: DecisionBuilder, policy: RetryPolicy) -> Self {
        Self { builder, policy }
    }

    /// Work out the next batch of decisions for a decision task.
    #[instrument(level = "debug", skip_all, fields(workflow_id = %task.workflow_id))]
    pub fn replay(&self, task: &DecisionTask) -> ReplayOutcome {
        let mut scan = HistoryScan::new(task);
        trace!(counts = ?counts_by_type(&task.events), "History summary");

        let request = match scan.request.take() {
            Some(Ok(request)) => request,
            Some(Err(err)) => {
                error!("Could not decode workflow input: {err:#}");
                return self.fail_without_request(format!("{err:#}"));
            }
            None => {
                error!("History has no WorkflowExecutionStarted event");
                return self.fail_without_request("workflow input not found".to_owned());
            }
        };

        if request.pages.is_empty() {
            warn!(reqid = %request.reqid, "Workflow has no pages");
            return self.fail(request, NO_PAGES_MESSAGE, "no pages to process");
        }

        if scan.halted && !scan.recent_contains(EventKind::WorkflowExecutionFailed) {
            debug!("Workflow already failed; nothing to decide");
            return ReplayOutcome::default();
        }

        if scan.recent_contains(EventKind::WorkflowExecutionStarted) {
            return self.start(request);
        }

        // Which pages are finished?
        let pages = collect_pages(&task.events, &scan.completed);
        let done: HashSet<String> = pages.iter().map(|p| p.pid.clone()).collect();
        let wanted: BTreeSet<String> = request.pages.iter().map(|p| p.pid.clone()).collect();
        let completed = wanted.iter().filter(|pid| done.contains(*pid)).count();
        let progress = Progress {
            reqid: request.reqid.clone(),
            completed,
            total: wanted.len(),
        };
        debug!(completed, total = wanted.len(), "Page progress");

        if completed == wanted.len() {
            let mut outcome = if scan.recent_contains(EventKind::CompleteWorkflowExecutionFailed) {
                warn!("Previous completion was rejected; retrying it");
                ReplayOutcome {
                    decisions: vec![self.builder.complete_workflow("SUCCESS")],
                    ..Default::default()
                }
            } else {
                info!(reqid = %request.reqid, "All pages complete");
                ReplayOutcome {
                    decisions: vec![self.builder.complete_workflow("success")],
                    finalization: Some(Finalization::Succeeded { request, pages }),
                    ..Default::default()
                }
            };
            outcome.progress = Some(progress);
            return outcome;
        }

        let mut outcome = self.mid_flight(task, &scan, request, &done);
        outcome.progress = Some(progress);
        outcome
    }

    /// Schedule a task for every page.
    fn start(&self, request: WorkflowRequest) -> ReplayOutcome {
        info!(reqid = %request.reqid, pages = request.pages.len(), "Starting workflow");
        let mut decisions = Vec::with_capacity(request.pages.len());
        for page in &request.pages {
            match request.task_input_for(page).to_json() {
                Ok(input) => decisions.push(self.builder.schedule_task(input, "1")),
                Err(err) => {
                    error!(pid = %page.pid, "Could not encode task input: {err:#}");
                    let message = format!("{err:#}");
                    return self.fail(request, &message, "could not encode page input");
                }
            }
        }
        ReplayOutcome {
            decisions,
            ..Default::default()
        }
    }

    /// React to everything that happened since the last decision.
    fn mid_flight(
        &self,
        task: &DecisionTask,
        scan: &HistoryScan<'_>,
        request: WorkflowRequest,
        done: &HashSet<String>,
    ) -> ReplayOutcome {
        let events = &task.events[..];
        let mut decisions = vec![];
        let mut timers_for = HashSet::new();

        for event in &scan.recent {
            match event.kind() {
                EventKind::WorkflowExecutionFailed => {
                    let details = match &event.attributes {
                        EventAttributes::WorkflowFailed { reason, details } => details
                            .clone()
                            .or_else(|| reason.clone())
                            .unwrap_or_else(|| EXECUTION_FAILED_MESSAGE.to_owned()),
                        _ => EXECUTION_FAILED_MESSAGE.to_owned(),
                    };
                    error!("Workflow execution failed: {details}");
                    return self.fail(request, EXECUTION_FAILED_MESSAGE, &details);
                }
                EventKind::FailWorkflowExecutionFailed => {
                    warn!(cause = ?event.attributes, "Previous failure was rejected; retrying it");
                    let message = self.original_failure(events);
                    decisions.push(self.builder.fail_workflow(FAILURE_REASON, message));
                    return ReplayOutcome {
                        decisions,
                        ..Default::default()
                    };
                }
                EventKind::StartTimerFailed => {
                    warn!(cause = ?event.attributes, "Could not start retry timer");
                }
                EventKind::WorkflowExecutionSignaled => {
                    info!(signal = ?event.attributes, "Workflow signaled");
                }
                EventKind::WorkflowExecutionCancelRequested => {
                    info!("Workflow cancellation requested");
                    return self.fail(request, CANCELED_MESSAGE, "process was canceled");
                }
                EventKind::TaskFailed | EventKind::TaskTimedOut => {
                    let Some(scheduled_id) = event.scheduled_event_id() else {
                        warn!(event_id = event.id, "Task event without a scheduled event ID");
                        continue;
                    };
                    log_task_problem(event);
                    if timers_for.contains(&scheduled_id)
                        || retry_timer_started(events, scheduled_id)
                    {
                        debug!(scheduled_id, "Retry timer already started");
                        continue;
                    }
                    let Some(scheduled) = by_id(events, scheduled_id) else {
                        warn!(scheduled_id, "Scheduled event missing from history");
                        continue;
                    };
                    let attempt = parse_attempt(scheduled.control());
                    match self.policy.after_failure(attempt) {
                        RetryAction::GiveUp => {
                            error!(scheduled_id, attempt, "Page ran out of attempts");
                            return self.fail(
                                request,
                                MAX_ATTEMPTS_MESSAGE,
                                MAX_ATTEMPTS_MESSAGE,
                            );
                        }
                        RetryAction::Delay { delay_secs } => {
                            debug!(scheduled_id, attempt, delay_secs, "Scheduling retry timer");
                            timers_for.insert(scheduled_id);
                            decisions.push(
                                self.builder
                                    .start_timer(delay_secs, scheduled_id.to_string()),
                            );
                        }
                    }
                }
                EventKind::TimerFired => {
                    match self.retry_after_timer(events, event, done) {
                        Ok(Some(decision)) => decisions.push(decision),
                        Ok(None) => {}
                        Err(err) => {
                            error!("Could not build retry: {err:#}");
                            let message = format!("{err:#}");
                            return self.fail(request, &message, "could not retry a page");
                        }
                    }
                }
                _ => {}
            }
        }

        ReplayOutcome {
            decisions,
            ..Default::default()
        }
    }

    /// Reschedule the task a fired timer was waiting to retry.
    fn retry_after_timer(
        &self,
        events: &[HistoryEvent],
        fired: &HistoryEvent,
        done: &HashSet<String>,
    ) -> Result<Option<Decision>> {
        let EventAttributes::TimerFired {
            started_event_id, ..
        } = &fired.attributes
        else {
            warn!(event_id = fired.id, "TimerFired event without attributes");
            return Ok(None);
        };
        let Some(timer) = by_id(events, *started_event_id) else {
            warn!(started_event_id, "TimerStarted event missing from history");
            return Ok(None);
        };
        let Some(scheduled_id) = timer.control().and_then(|c| c.trim().parse::<i64>().ok())
        else {
            // Not one of our retry timers.
            warn!(timer = ?timer.attributes, "Timer has no scheduled event ID");
            return Ok(None);
        };
        let scheduled = by_id(events, scheduled_id)
            .ok_or_else(|| anyhow!("scheduled event {scheduled_id} missing from history"))?;
        let input = TaskInput::from_json(scheduled.input().unwrap_or(""))?;
        if done.contains(input.pid.as_str()) {
            debug!(pid = %input.pid, "Page already complete; not retrying");
            return Ok(None);
        }

        let timed_out = events.iter().any(|e| {
            e.kind() == EventKind::TaskTimedOut && e.scheduled_event_id() == Some(scheduled_id)
        });
        let attempt = parse_attempt(scheduled.control());
        let (input, attempt) = self.policy.retry_input(attempt, &input, timed_out);
        info!(pid = %input.pid, attempt, scale = input.scale, "Retrying page");
        Ok(Some(
            self.builder
                .schedule_task(input.to_json()?, attempt.to_string()),
        ))
    }

    /// Work out the message of the failure we decided earlier, from the same
    /// events that made us fail the first time.
    fn original_failure(&self, events: &[HistoryEvent]) -> &'static str {
        for event in events {
            match event.kind() {
                EventKind::WorkflowExecutionCancelRequested => return CANCELED_MESSAGE,
                EventKind::WorkflowExecutionFailed => return EXECUTION_FAILED_MESSAGE,
                EventKind::TaskFailed | EventKind::TaskTimedOut => {
                    let attempt = event
                        .scheduled_event_id()
                        .and_then(|id| by_id(events, id))
                        .map(|scheduled| parse_attempt(scheduled.control()));
                    if let Some(attempt) = attempt {
                        if self.policy.after_failure(attempt) == RetryAction::GiveUp {
                            return MAX_ATTEMPTS_MESSAGE;
                        }
                    }
                }
                _ => {}
            }
        }
        RESUBMITTED_MESSAGE
    }

    /// Fail the workflow and tell the requestor.
    fn fail(&self, request: WorkflowRequest, message: &str, why: &str) -> ReplayOutcome {
        ReplayOutcome {
            decisions: vec![self.builder.fail_workflow(FAILURE_REASON, message)],
            finalization: Some(Finalization::Failed {
                request,
                details: format!("OCR generation process failed ({why})"),
            }),
            progress: None,
        }
    }

    /// Fail a workflow whose request we couldn't even read. There's nobody we
    /// can notify.
    fn fail_without_request(&self, message: String) -> ReplayOutcome {
        ReplayOutcome {
            decisions: vec![self.builder.fail_workflow(FAILURE_REASON, message)],
            ..Default::default()
        }
    }
}

/// Have we already started a retry timer for this scheduled task?
fn retry_timer_started(events: &[HistoryEvent], scheduled_id: i64) -> bool {
    let control = scheduled_id.to_string();
    events
        .iter()
        .any(|e| e.kind() == EventKind::TimerStarted && e.control() == Some(control.as_str()))
}

fn log_task_problem(event: &HistoryEvent) {
    match &event.attributes {
        EventAttributes::TaskFailed {
            reason, details, ..
        } => {
            let details = TaskFailureDetails::parse(details.as_deref());
            warn!(
                reason = reason.as_deref().unwrap_or(""),
                error = %details.summary(),
                "Task failed"
            );
        }
        EventAttributes::TaskTimedOut { timeout_type, .. } => {
            warn!(
                timeout_type = timeout_type.as_deref().unwrap_or(""),
                "Task timed out"
            );
        }
        _ => {}
    }
}
