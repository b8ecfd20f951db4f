//! The decider's poll loop.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time};

use crate::prelude::*;

use super::{
    decisions::Decision,
    events::HistoryEvent,
    finalize::Finalizer,
    replay::{DecisionTask, ReplayEngine},
};

/// How long to wait after a transport error before polling again.
pub const TRANSPORT_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// One page of a decision task, as returned by a poll.
#[derive(Clone, Debug, Default)]
pub struct DecisionTaskPage {
    /// Empty polls have no task token.
    pub task_token: Option<String>,
    pub workflow_id: Option<String>,
    pub previous_started_event_id: Option<i64>,
    pub events: Vec<HistoryEvent>,
    pub next_page_token: Option<String>,
}

/// The workflow service, as seen by the decider.
#[async_trait]
pub trait WorkflowService: Send + Sync + 'static {
    /// Long-poll for a decision task, or fetch a further page of one.
    async fn poll_decision_page(
        &self,
        task_list: &str,
        next_page_token: Option<&str>,
    ) -> Result<DecisionTaskPage>;

    /// Submit a batch of decisions for a decision task.
    async fn respond_decisions(&self, task_token: &str, decisions: &[Decision])
    -> Result<()>;
}

/// What happened during a single poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// The poll returned without a task.
    Empty,

    /// We produced decisions but at least one was invalid, so we sent none.
    /// The workflow service will hand the task out again.
    Invalid,

    /// We handled a task. If the workflow finished, `finalizing` is the
    /// background task delivering its results.
    Handled {
        decisions: usize,
        submitted: bool,
        finalizing: Option<JoinHandle<()>>,
    },
}

/// Polls one task list for decision tasks and answers them.
#[derive(Clone)]
pub struct Poller {
    service: Arc<dyn WorkflowService>,
    engine: ReplayEngine,
    finalizer: Finalizer,
    task_list: String,
    error_backoff: Duration,
}

impl Poller {
    /// Create a new poller.
    pub fn new(
        service: Arc<dyn WorkflowService>,
        engine: ReplayEngine,
        finalizer: Finalizer,
        task_list: impl Into<String>,
    ) -> Self {
        Self {
            service,
            engine,
            finalizer,
            task_list: task_list.into(),
            error_backoff: TRANSPORT_ERROR_BACKOFF,
        }
    }

    /// Poll forever.
    #[instrument(level = "info", skip_all, fields(task_list = %self.task_list))]
    pub async fn run(self) -> Result<()> {
        info!("Decider polling for decision tasks");
        loop {
            if let Err(err) = self.poll_once().await {
                error!(
                    "Polling for decision tasks failed, retrying in {:?}: {err:#}",
                    self.error_backoff
                );
                time::sleep(self.error_backoff).await;
            }
        }
    }

    /// Poll for one decision task and handle it. Only transport errors while
    /// polling are returned; everything else is logged.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let Some(task) = self.poll_decision_task().await? else {
            trace!("Empty poll");
            return Ok(PollOutcome::Empty);
        };
        Ok(self.handle(task).await)
    }

    /// Poll for a decision task, following history pages until we have the
    /// whole history.
    async fn poll_decision_task(&self) -> Result<Option<DecisionTask>> {
        let mut task_token: Option<String> = None;
        let mut workflow_id: Option<String> = None;
        let mut cursor: Option<i64> = None;
        let mut events = vec![];
        let mut next_page_token: Option<String> = None;
        loop {
            let page = self
                .service
                .poll_decision_page(&self.task_list, next_page_token.as_deref())
                .await
                .context("could not poll for decision task")?;
            if task_token.is_none() {
                task_token = page.task_token.filter(|t| !t.is_empty());
            }
            if workflow_id.is_none() {
                workflow_id = page.workflow_id;
            }
            if cursor.is_none() {
                cursor = page.previous_started_event_id;
            }
            events.extend(page.events);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => next_page_token = Some(token),
                None => break,
            }
        }

        Ok(task_token.map(|task_token| DecisionTask {
            task_token,
            workflow_id: workflow_id.unwrap_or_default(),
            previous_started_event_id: cursor.unwrap_or(0),
            events,
        }))
    }

    /// Replay a task and submit the result.
    #[instrument(level = "debug", skip_all, fields(workflow_id = %task.workflow_id))]
    async fn handle(&self, task: DecisionTask) -> PollOutcome {
        debug!(
            events = task.events.len(),
            cursor = task.previous_started_event_id,
            "Handling decision task"
        );
        let outcome = self.engine.replay(&task);

        for decision in &outcome.decisions {
            if let Err(err) = decision.validate() {
                error!(decision = ?decision, "Invalid decision, not responding: {err:#}");
                return PollOutcome::Invalid;
            }
        }

        if let Some(progress) = outcome.progress.clone() {
            let finalizer = self.finalizer.clone();
            tokio::spawn(async move {
                finalizer
                    .record_progress(&progress.reqid, progress.completed)
                    .await;
            });
        }

        // Output I/O can be slow, so don't make the response wait for it.
        let finalizing = outcome.finalization.map(|finalization| {
            let finalizer = self.finalizer.clone();
            tokio::spawn(async move { finalizer.finalize(finalization).await })
        });

        let names: Vec<_> = outcome.decisions.iter().map(Decision::name).collect();
        debug!(decisions = ?names, "Responding to decision task");
        let submitted = match self
            .service
            .respond_decisions(&task.task_token, &outcome.decisions)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                // The service will hand the task out again.
                error!("Could not submit decisions: {err:#}");
                false
            }
        };

        PollOutcome::Handled {
            decisions: outcome.decisions.len(),
            submitted,
            finalizing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::TaskInput,
        decider::{
            decisions::DecisionBuilder,
            retry_policy::RetryPolicy,
            testing::{FakeWorkflowService, HistoryBuilder, RecordingOutput, sample_request},
        },
    };

    fn poller(service: Arc<FakeWorkflowService>, output: Arc<RecordingOutput>) -> Poller {
        let engine = ReplayEngine::new(
            DecisionBuilder::new("ocr-page", 600),
            RetryPolicy::new(3),
        );
        Poller::new(
            service,
            engine,
            Finalizer::new(output.clone(), output),
            "ocr-decisions",
        )
    }

    #[tokio::test]
    async fn empty_polls_do_nothing() {
        let service = Arc::new(FakeWorkflowService::default());
        service.push_page(DecisionTaskPage::default());
        let poller = poller(service.clone(), Arc::new(RecordingOutput::default()));
        assert!(matches!(poller.poll_once().await.unwrap(), PollOutcome::Empty));
        assert!(service.responses().is_empty());
    }

    #[tokio::test]
    async fn transport_errors_are_returned() {
        let service = Arc::new(FakeWorkflowService::default());
        service.push_error("connection reset");
        let poller = poller(service.clone(), Arc::new(RecordingOutput::default()));
        assert!(poller.poll_once().await.is_err());
    }

    #[tokio::test]
    async fn history_pages_are_stitched_together() {
        let mut history = HistoryBuilder::new();
        history.started(&sample_request());
        history.decision_round();
        let events = history.events();
        let (first, second) = events.split_at(2);

        let service = Arc::new(FakeWorkflowService::default());
        service.push_page(DecisionTaskPage {
            task_token: Some("token-1".to_owned()),
            workflow_id: Some("ocr-R".to_owned()),
            previous_started_event_id: Some(0),
            events: first.to_vec(),
            next_page_token: Some("page-2".to_owned()),
        });
        service.push_page(DecisionTaskPage {
            events: second.to_vec(),
            ..Default::default()
        });

        let poller = poller(service.clone(), Arc::new(RecordingOutput::default()));
        let PollOutcome::Handled {
            decisions,
            submitted,
            finalizing,
        } = poller.poll_once().await.unwrap()
        else {
            panic!("expected a handled task");
        };
        assert_eq!(decisions, 2);
        assert!(submitted);
        assert!(finalizing.is_none());

        assert_eq!(
            service.page_tokens(),
            vec![None, Some("page-2".to_owned())]
        );
        let responses = service.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "token-1");
        let pids: Vec<_> = responses[0]
            .1
            .iter()
            .map(|d| match d {
                Decision::ScheduleTask { input, .. } => TaskInput::from_json(input).unwrap().pid,
                other => panic!("unexpected decision {other:?}"),
            })
            .collect();
        assert_eq!(pids, vec!["pidA", "pidB"]);
    }

    #[tokio::test]
    async fn terminal_decisions_trigger_finalization() {
        let mut history = HistoryBuilder::new();
        let (a, b) = history.started_and_scheduled(&sample_request());
        let cursor = history.decision_round();
        history.completed(a, "foo");
        history.completed(b, "bar");

        let service = Arc::new(FakeWorkflowService::default());
        service.push_task("token-2", cursor, history.events());
        let output = Arc::new(RecordingOutput::default());
        let poller = poller(service.clone(), output.clone());

        let PollOutcome::Handled {
            finalizing: Some(finalizing),
            ..
        } = poller.poll_once().await.unwrap()
        else {
            panic!("expected finalization");
        };
        finalizing.await.unwrap();
        let calls = output.calls();
        assert!(calls.contains(&"succeeded R: 2 pages".to_owned()));
        assert!(calls.contains(&"cleanup B/R".to_owned()));
        assert_eq!(
            service.responses()[0].1,
            vec![Decision::CompleteWorkflow {
                result: "success".to_owned()
            }]
        );
    }

    #[tokio::test]
    async fn submission_errors_are_dropped() {
        let mut history = HistoryBuilder::new();
        history.started(&sample_request());
        let service = Arc::new(FakeWorkflowService::default());
        service.push_task("token-3", 0, history.events());
        service.fail_responses();
        let poller = poller(service.clone(), Arc::new(RecordingOutput::default()));
        let PollOutcome::Handled { submitted, .. } = poller.poll_once().await.unwrap() else {
            panic!("expected a handled task");
        };
        assert!(!submitted);
    }

    #[tokio::test]
    async fn invalid_decisions_are_not_submitted() {
        let mut history = HistoryBuilder::new();
        history.started(&sample_request());
        let service = Arc::new(FakeWorkflowService::default());
        service.push_task("token-4", 0, history.events());
        let engine = ReplayEngine::new(DecisionBuilder::new("", 600), RetryPolicy::new(3));
        let output = Arc::new(RecordingOutput::default());
        let poller = Poller::new(
            service.clone(),
            engine,
            Finalizer::new(output.clone(), output),
            "ocr-decisions",
        );
        assert!(matches!(
            poller.poll_once().await.unwrap(),
            PollOutcome::Invalid
        ));
        assert!(service.responses().is_empty());
    }
}
