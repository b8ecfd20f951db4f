//! Test helpers: hand-built histories and in-memory collaborators.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    codec::{PageDescriptor, WorkflowRequest, encode_workflow_input},
    prelude::*,
};

use super::{
    decisions::Decision,
    events::{EventAttributes, EventKind, HistoryEvent},
    finalize::{OcrPage, RequestOutput, StagingCleanup},
    poll::{DecisionTaskPage, WorkflowService},
    replay::DecisionTask,
};

/// A two-page request.
pub fn sample_request() -> WorkflowRequest {
    WorkflowRequest {
        pid: "uva-lib:100".to_owned(),
        path: "/tmp/work/R".to_owned(),
        lang: "eng".to_owned(),
        reqid: "R".to_owned(),
        bucket: "B".to_owned(),
        pages: vec![
            PageDescriptor {
                pid: "pidA".to_owned(),
                filename: "a.tif".to_owned(),
            },
            PageDescriptor {
                pid: "pidB".to_owned(),
                filename: "b.tif".to_owned(),
            },
        ],
    }
}

/// Builds workflow histories one event at a time, assigning IDs the way the
/// workflow service does.
#[derive(Debug, Default)]
pub struct HistoryBuilder {
    events: Vec<HistoryEvent>,
}

impl HistoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, tag: &str, attributes: EventAttributes) -> i64 {
        let id = self.events.len() as i64 + 1;
        self.events.push(HistoryEvent::new(id, tag, attributes));
        id
    }

    /// Start the workflow with an encoded request.
    pub fn started(&mut self, request: &WorkflowRequest) -> i64 {
        let input = encode_workflow_input(request).unwrap();
        self.started_raw(&input)
    }

    /// Start the workflow with arbitrary input.
    pub fn started_raw(&mut self, input: &str) -> i64 {
        self.push(
            "WorkflowExecutionStarted",
            EventAttributes::WorkflowStarted {
                input: Some(input.to_owned()),
            },
        )
    }

    /// Add a scheduled/started/completed decision task triple, returning the
    /// ID of the started event.
    pub fn decision_round(&mut self) -> i64 {
        self.push("DecisionTaskScheduled", EventAttributes::None);
        let started = self.push("DecisionTaskStarted", EventAttributes::None);
        self.push("DecisionTaskCompleted", EventAttributes::None);
        started
    }

    /// Start the workflow and schedule its first two pages, returning their
    /// scheduled event IDs.
    pub fn started_and_scheduled(&mut self, request: &WorkflowRequest) -> (i64, i64) {
        self.started(request);
        self.decision_round();
        let ids: Vec<i64> = request
            .pages
            .iter()
            .map(|page| {
                let input = request.task_input_for(page).to_json().unwrap();
                self.scheduled(&input, "1")
            })
            .collect();
        (ids[0], ids[1])
    }

    fn scheduled(&mut self, input: &str, control: &str) -> i64 {
        let task_id = format!("task-{}", self.events.len() + 1);
        self.push(
            "LambdaFunctionScheduled",
            EventAttributes::TaskScheduled {
                task_id,
                input: Some(input.to_owned()),
                control: Some(control.to_owned()),
            },
        )
    }

    /// Complete a task with the given OCR text.
    pub fn completed(&mut self, scheduled_event_id: i64, text: &str) -> i64 {
        let inner = serde_json::json!({ "text": text }).to_string();
        let result = serde_json::to_string(&inner).unwrap();
        self.completed_raw(scheduled_event_id, &result)
    }

    /// Complete a task with a raw result string.
    pub fn completed_raw(&mut self, scheduled_event_id: i64, result: &str) -> i64 {
        self.push(
            "LambdaFunctionCompleted",
            EventAttributes::TaskCompleted {
                scheduled_event_id,
                result: Some(result.to_owned()),
            },
        )
    }

    pub fn failed(&mut self, scheduled_event_id: i64, details: &str) -> i64 {
        self.push(
            "LambdaFunctionFailed",
            EventAttributes::TaskFailed {
                scheduled_event_id,
                reason: Some("Unhandled".to_owned()),
                details: Some(details.to_owned()),
            },
        )
    }

    pub fn timed_out(&mut self, scheduled_event_id: i64) -> i64 {
        self.push(
            "LambdaFunctionTimedOut",
            EventAttributes::TaskTimedOut {
                scheduled_event_id,
                timeout_type: Some("START_TO_CLOSE".to_owned()),
            },
        )
    }

    pub fn timer_fired(&mut self, started_event_id: i64) -> i64 {
        let timer_id = match &self.event(started_event_id).attributes {
            EventAttributes::TimerStarted { timer_id, .. } => timer_id.clone(),
            other => panic!("event {started_event_id} is not a timer: {other:?}"),
        };
        self.push(
            "TimerFired",
            EventAttributes::TimerFired {
                timer_id,
                started_event_id,
            },
        )
    }

    pub fn cancel_requested(&mut self) -> i64 {
        self.push("WorkflowExecutionCancelRequested", EventAttributes::None)
    }

    pub fn workflow_failed(&mut self, details: &str) -> i64 {
        self.push(
            "WorkflowExecutionFailed",
            EventAttributes::WorkflowFailed {
                reason: Some("failure".to_owned()),
                details: Some(details.to_owned()),
            },
        )
    }

    pub fn complete_failed(&mut self) -> i64 {
        self.push(
            "CompleteWorkflowExecutionFailed",
            EventAttributes::Cause(Some("UNHANDLED_DECISION".to_owned())),
        )
    }

    pub fn fail_failed(&mut self) -> i64 {
        self.push(
            "FailWorkflowExecutionFailed",
            EventAttributes::Cause(Some("UNHANDLED_DECISION".to_owned())),
        )
    }

    pub fn signaled(&mut self) -> i64 {
        self.push(
            "WorkflowExecutionSignaled",
            EventAttributes::WorkflowSignaled {
                signal_name: "poke".to_owned(),
            },
        )
    }

    pub fn start_timer_failed(&mut self) -> i64 {
        self.push(
            "StartTimerFailed",
            EventAttributes::Cause(Some("TIMER_ID_ALREADY_IN_USE".to_owned())),
        )
    }

    /// Record a decision round and the events the service would add for
    /// `decisions`. Returns the new cursor.
    pub fn apply(&mut self, decisions: &[Decision]) -> i64 {
        let cursor = self.decision_round();
        for decision in decisions {
            match decision {
                Decision::ScheduleTask { input, control, .. } => {
                    self.scheduled(input, control);
                }
                Decision::StartTimer { id, control, .. } => {
                    self.push(
                        "TimerStarted",
                        EventAttributes::TimerStarted {
                            timer_id: id.clone(),
                            control: Some(control.clone()),
                        },
                    );
                }
                Decision::CompleteWorkflow { .. } | Decision::FailWorkflow { .. } => {}
            }
        }
        cursor
    }

    fn event(&self, id: i64) -> &HistoryEvent {
        self.events
            .iter()
            .find(|e| e.id == id)
            .unwrap_or_else(|| panic!("no event {id}"))
    }

    fn last_of(&self, kind: EventKind) -> i64 {
        self.events
            .iter()
            .rev()
            .find(|e| e.kind() == kind)
            .map(|e| e.id)
            .unwrap_or_else(|| panic!("no {kind:?} event"))
    }

    /// ID of the most recent `TimerStarted` event.
    pub fn last_timer(&self) -> i64 {
        self.last_of(EventKind::TimerStarted)
    }

    /// ID of the most recent scheduled task.
    pub fn last_scheduled(&self) -> i64 {
        self.last_of(EventKind::TaskScheduled)
    }

    /// The attempt counter of a scheduled task.
    pub fn scheduled_control(&self, id: i64) -> Option<String> {
        self.event(id).control().map(str::to_owned)
    }

    pub fn events(&self) -> Vec<HistoryEvent> {
        self.events.clone()
    }

    /// A decision task for this history.
    pub fn task(&self, previous_started_event_id: i64) -> DecisionTask {
        DecisionTask {
            task_token: "token".to_owned(),
            workflow_id: "ocr-R".to_owned(),
            previous_started_event_id,
            events: self.events(),
        }
    }
}

/// Records everything the finalizer asks of it.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingOutput {
    /// An output whose deliveries always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            Err(anyhow!("delivery failed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RequestOutput for RecordingOutput {
    async fn record_progress(&self, reqid: &str, completed: usize) -> Result<()> {
        self.record(format!("progress {reqid}: {completed}"))
    }

    async fn succeeded(&self, request: &WorkflowRequest, pages: &[OcrPage]) -> Result<()> {
        self.record(format!("succeeded {}: {} pages", request.reqid, pages.len()))
    }

    async fn failed(&self, request: &WorkflowRequest, details: &str) -> Result<()> {
        self.record(format!("failed {}: {details}", request.reqid))
    }
}

#[async_trait]
impl StagingCleanup for RecordingOutput {
    async fn delete_request_inputs(&self, bucket: &str, reqid: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("cleanup {bucket}/{reqid}"));
        Ok(())
    }
}

/// A workflow service that replays queued pages and records responses.
#[derive(Debug, Default)]
pub struct FakeWorkflowService {
    pages: Mutex<VecDeque<Result<DecisionTaskPage, String>>>,
    page_tokens: Mutex<Vec<Option<String>>>,
    responses: Mutex<Vec<(String, Vec<Decision>)>>,
    fail_responses: AtomicBool,
}

impl FakeWorkflowService {
    pub fn push_page(&self, page: DecisionTaskPage) {
        self.pages.lock().unwrap().push_back(Ok(page));
    }

    /// Queue a single-page decision task.
    pub fn push_task(&self, token: &str, cursor: i64, events: Vec<HistoryEvent>) {
        self.push_page(DecisionTaskPage {
            task_token: Some(token.to_owned()),
            workflow_id: Some("ocr-R".to_owned()),
            previous_started_event_id: Some(cursor),
            events,
            next_page_token: None,
        });
    }

    pub fn push_error(&self, message: &str) {
        self.pages
            .lock()
            .unwrap()
            .push_back(Err(message.to_owned()));
    }

    /// Make every `respond_decisions` call fail.
    pub fn fail_responses(&self) {
        self.fail_responses.store(true, Ordering::SeqCst);
    }

    /// The page tokens we were polled with, in order.
    pub fn page_tokens(&self) -> Vec<Option<String>> {
        self.page_tokens.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<(String, Vec<Decision>)> {
        self.responses.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowService for FakeWorkflowService {
    async fn poll_decision_page(
        &self,
        _task_list: &str,
        next_page_token: Option<&str>,
    ) -> Result<DecisionTaskPage> {
        self.page_tokens
            .lock()
            .unwrap()
            .push(next_page_token.map(str::to_owned));
        match self.pages.lock().unwrap().pop_front() {
            Some(Ok(page)) => Ok(page),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(DecisionTaskPage::default()),
        }
    }

    async fn respond_decisions(&self, task_token: &str, decisions: &[Decision]) -> Result<()> {
        if self.fail_responses.load(Ordering::SeqCst) {
            return Err(anyhow!("throttled"));
        }
        self.responses
            .lock()
            .unwrap()
            .push((task_token.to_owned(), decisions.to_vec()));
        Ok(())
    }
}
