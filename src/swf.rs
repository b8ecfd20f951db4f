//! The AWS Simple Workflow Service, behind our own traits.

use std::fmt::Debug;

use aws_sdk_swf::{
    Client,
    types::{
        ChildPolicy, CompleteWorkflowExecutionDecisionAttributes, Decision as SwfDecision,
        DecisionType, FailWorkflowExecutionDecisionAttributes,
        HistoryEvent as SwfHistoryEvent, ScheduleLambdaFunctionDecisionAttributes,
        StartTimerDecisionAttributes, TaskList, WorkflowType,
    },
};

use crate::{
    aws::swf_client,
    config::ServiceOpts,
    decider::{Decision, DecisionTaskPage, EventAttributes, HistoryEvent, WorkflowService},
    prelude::*,
};

/// Largest history page the service will return.
const MAX_PAGE_SIZE: i32 = 1000;

/// Starts OCR workflows.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync + 'static {
    /// Start a workflow with the given ID and encoded input.
    async fn start_workflow(&self, workflow_id: &str, input: &str) -> Result<()>;
}

/// A launcher for when the workflow service is turned off.
pub struct DisabledLauncher;

#[async_trait]
impl WorkflowLauncher for DisabledLauncher {
    async fn start_workflow(&self, workflow_id: &str, _input: &str) -> Result<()> {
        Err(anyhow!(
            "workflow service is disabled; not starting {workflow_id}"
        ))
    }
}

/// The workflow ID for a request.
pub fn workflow_id_for(reqid: &str) -> String {
    format!("ocr-{reqid}")
}

/// Settings for starting workflows.
#[derive(Clone, Debug)]
struct WorkflowSettings {
    workflow_type: String,
    workflow_version: String,
    start_task_list: String,
    workflow_timeout: u64,
    decision_timeout: u64,
    lambda_role: Option<String>,
}

/// Talks to SWF.
#[derive(Clone)]
pub struct SwfClient {
    client: Client,
    domain: String,
    identity: String,
    settings: WorkflowSettings,
}

impl SwfClient {
    /// Create a client using the standard AWS configuration.
    pub async fn new(opts: &ServiceOpts) -> Result<Self> {
        let start_task_list = opts
            .start_task_list()
            .ok_or_else(|| anyhow!("no task list configured"))?;
        Ok(Self {
            client: swf_client().await?,
            domain: opts.workflow_domain.clone(),
            identity: format!("ocr-ws-{}", std::process::id()),
            settings: WorkflowSettings {
                workflow_type: opts.workflow_type.clone(),
                workflow_version: opts.workflow_version.clone(),
                start_task_list,
                workflow_timeout: opts.workflow_timeout,
                decision_timeout: opts.decision_timeout,
                lambda_role: opts.lambda_role.clone(),
            },
        })
    }
}

#[async_trait]
impl WorkflowService for SwfClient {
    #[instrument(level = "trace", skip(self))]
    async fn poll_decision_page(
        &self,
        task_list: &str,
        next_page_token: Option<&str>,
    ) -> Result<DecisionTaskPage> {
        let output = self
            .client
            .poll_for_decision_task()
            .domain(&self.domain)
            .task_list(task_list_named(task_list)?)
            .identity(&self.identity)
            .maximum_page_size(MAX_PAGE_SIZE)
            .set_next_page_token(next_page_token.map(str::to_owned))
            .send()
            .await
            .context("PollForDecisionTask failed")?;

        let task_token = Some(output.task_token())
            .filter(|t| !t.is_empty())
            .map(str::to_owned);
        Ok(DecisionTaskPage {
            previous_started_event_id: task_token
                .as_ref()
                .map(|_| output.previous_started_event_id()),
            task_token,
            workflow_id: output
                .workflow_execution()
                .map(|e| e.workflow_id().to_owned()),
            events: output.events().iter().map(convert_event).collect(),
            next_page_token: output.next_page_token().map(str::to_owned),
        })
    }

    #[instrument(level = "debug", skip_all, fields(decisions = decisions.len()))]
    async fn respond_decisions(&self, task_token: &str, decisions: &[Decision]) -> Result<()> {
        let decisions = decisions
            .iter()
            .map(to_swf_decision)
            .collect::<Result<Vec<_>>>()?;
        self.client
            .respond_decision_task_completed()
            .task_token(task_token)
            .set_decisions(Some(decisions))
            .send()
            .await
            .context("RespondDecisionTaskCompleted failed")?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowLauncher for SwfClient {
    #[instrument(level = "info", skip(self, input))]
    async fn start_workflow(&self, workflow_id: &str, input: &str) -> Result<()> {
        let settings = &self.settings;
        let workflow_type = WorkflowType::builder()
            .name(&settings.workflow_type)
            .version(&settings.workflow_version)
            .build()
            .context("invalid workflow type")?;
        let output = self
            .client
            .start_workflow_execution()
            .domain(&self.domain)
            .workflow_id(workflow_id)
            .workflow_type(workflow_type)
            .task_list(task_list_named(&settings.start_task_list)?)
            .input(input)
            .execution_start_to_close_timeout(settings.workflow_timeout.to_string())
            .task_start_to_close_timeout(settings.decision_timeout.to_string())
            .child_policy(ChildPolicy::Terminate)
            .set_lambda_role(settings.lambda_role.clone())
            .send()
            .await
            .with_context(|| format!("could not start workflow {workflow_id}"))?;
        info!(run_id = ?output.run_id(), "Started workflow");
        Ok(())
    }
}

fn task_list_named(name: &str) -> Result<TaskList> {
    TaskList::builder()
        .name(name)
        .build()
        .context("invalid task list")
}

/// Render an SDK enum or optional value for logging.
fn describe<T: Debug>(value: T) -> Option<String> {
    Some(format!("{value:?}"))
}

/// Convert an SDK history event to our own model, keeping only what the
/// decider reads.
fn convert_event(event: &SwfHistoryEvent) -> HistoryEvent {
    let tag = event.event_type().as_str();
    let attributes = if let Some(a) = event.workflow_execution_started_event_attributes() {
        EventAttributes::WorkflowStarted {
            input: a.input().map(str::to_owned),
        }
    } else if let Some(a) = event.workflow_execution_failed_event_attributes() {
        EventAttributes::WorkflowFailed {
            reason: a.reason().map(str::to_owned),
            details: a.details().map(str::to_owned),
        }
    } else if let Some(a) = event.workflow_execution_signaled_event_attributes() {
        EventAttributes::WorkflowSignaled {
            signal_name: a.signal_name().to_owned(),
        }
    } else if let Some(a) = event.lambda_function_scheduled_event_attributes() {
        EventAttributes::TaskScheduled {
            task_id: a.id().to_owned(),
            input: a.input().map(str::to_owned),
            control: a.control().map(str::to_owned),
        }
    } else if let Some(a) = event.activity_task_scheduled_event_attributes() {
        EventAttributes::TaskScheduled {
            task_id: a.activity_id().to_owned(),
            input: a.input().map(str::to_owned),
            control: a.control().map(str::to_owned),
        }
    } else if let Some(a) = event.lambda_function_completed_event_attributes() {
        EventAttributes::TaskCompleted {
            scheduled_event_id: a.scheduled_event_id(),
            result: a.result().map(str::to_owned),
        }
    } else if let Some(a) = event.activity_task_completed_event_attributes() {
        EventAttributes::TaskCompleted {
            scheduled_event_id: a.scheduled_event_id(),
            result: a.result().map(str::to_owned),
        }
    } else if let Some(a) = event.lambda_function_failed_event_attributes() {
        EventAttributes::TaskFailed {
            scheduled_event_id: a.scheduled_event_id(),
            reason: a.reason().map(str::to_owned),
            details: a.details().map(str::to_owned),
        }
    } else if let Some(a) = event.activity_task_failed_event_attributes() {
        EventAttributes::TaskFailed {
            scheduled_event_id: a.scheduled_event_id(),
            reason: a.reason().map(str::to_owned),
            details: a.details().map(str::to_owned),
        }
    } else if let Some(a) = event.lambda_function_timed_out_event_attributes() {
        EventAttributes::TaskTimedOut {
            scheduled_event_id: a.scheduled_event_id(),
            timeout_type: describe(a.timeout_type()),
        }
    } else if let Some(a) = event.activity_task_timed_out_event_attributes() {
        EventAttributes::TaskTimedOut {
            scheduled_event_id: a.scheduled_event_id(),
            timeout_type: describe(a.timeout_type()),
        }
    } else if let Some(a) = event.timer_started_event_attributes() {
        EventAttributes::TimerStarted {
            timer_id: a.timer_id().to_owned(),
            control: a.control().map(str::to_owned),
        }
    } else if let Some(a) = event.timer_fired_event_attributes() {
        EventAttributes::TimerFired {
            timer_id: a.timer_id().to_owned(),
            started_event_id: a.started_event_id(),
        }
    } else if let Some(a) = event.start_timer_failed_event_attributes() {
        EventAttributes::Cause(describe(a.cause()))
    } else if let Some(a) = event.complete_workflow_execution_failed_event_attributes() {
        EventAttributes::Cause(describe(a.cause()))
    } else if let Some(a) = event.fail_workflow_execution_failed_event_attributes() {
        EventAttributes::Cause(describe(a.cause()))
    } else {
        EventAttributes::None
    };
    HistoryEvent::new(event.event_id(), tag, attributes)
}

/// Convert one of our decisions to an SDK decision.
fn to_swf_decision(decision: &Decision) -> Result<SwfDecision> {
    let builder = SwfDecision::builder();
    let builder = match decision {
        Decision::ScheduleTask {
            id,
            function,
            input,
            control,
            timeout_secs,
        } => builder
            .decision_type(DecisionType::ScheduleLambdaFunction)
            .schedule_lambda_function_decision_attributes(
                ScheduleLambdaFunctionDecisionAttributes::builder()
                    .id(id)
                    .name(function)
                    .input(input)
                    .control(control)
                    .start_to_close_timeout(timeout_secs.to_string())
                    .build()
                    .context("invalid ScheduleLambdaFunction decision")?,
            ),
        Decision::StartTimer {
            id,
            delay_secs,
            control,
        } => builder
            .decision_type(DecisionType::StartTimer)
            .start_timer_decision_attributes(
                StartTimerDecisionAttributes::builder()
                    .timer_id(id)
                    .start_to_fire_timeout(delay_secs.to_string())
                    .control(control)
                    .build()
                    .context("invalid StartTimer decision")?,
            ),
        Decision::CompleteWorkflow { result } => builder
            .decision_type(DecisionType::CompleteWorkflowExecution)
            .complete_workflow_execution_decision_attributes(
                CompleteWorkflowExecutionDecisionAttributes::builder()
                    .result(result)
                    .build(),
            ),
        Decision::FailWorkflow { reason, details } => builder
            .decision_type(DecisionType::FailWorkflowExecution)
            .fail_workflow_execution_decision_attributes(
                FailWorkflowExecutionDecisionAttributes::builder()
                    .reason(reason)
                    .details(details)
                    .build(),
            ),
    };
    builder.build().context("invalid decision")
}
