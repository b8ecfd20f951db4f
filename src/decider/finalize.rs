//! Handing finished workflows to the output side.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    codec::{TaskInput, WorkflowRequest, decode_task_result},
    prelude::*,
};

use super::events::{EventAttributes, HistoryEvent, by_id};

/// OCR text for one page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OcrPage {
    pub pid: String,
    pub text: String,
}

/// How a workflow ended.
#[derive(Clone, Debug)]
pub enum Finalization {
    /// Every page has text. `pages` is sorted by page PID.
    Succeeded {
        request: WorkflowRequest,
        pages: Vec<OcrPage>,
    },

    /// The workflow failed. `details` is meant for humans.
    Failed {
        request: WorkflowRequest,
        details: String,
    },
}

impl Finalization {
    /// The request this finalization is for.
    pub fn request(&self) -> &WorkflowRequest {
        match self {
            Finalization::Succeeded { request, .. } | Finalization::Failed { request, .. } => {
                request
            }
        }
    }
}

/// Pull page text out of completion events.
///
/// Results we can't decode are logged and skipped, which leaves that page
/// incomplete. Duplicate completions for a page keep the first one seen.
pub fn collect_pages(events: &[HistoryEvent], completed: &[&HistoryEvent]) -> Vec<OcrPage> {
    let mut pages = BTreeMap::new();
    for event in completed {
        match page_from_completion(events, event) {
            Ok(page) => {
                pages.entry(page.pid.clone()).or_insert(page);
            }
            Err(err) => warn!(event_id = event.id, "Skipping task result: {err:#}"),
        }
    }
    pages.into_values().collect()
}

fn page_from_completion(events: &[HistoryEvent], completed: &HistoryEvent) -> Result<OcrPage> {
    let scheduled_id = completed
        .scheduled_event_id()
        .ok_or_else(|| anyhow!("completion has no scheduled event ID"))?;
    let scheduled = by_id(events, scheduled_id)
        .ok_or_else(|| anyhow!("scheduled event {scheduled_id} missing from history"))?;
    let input = TaskInput::from_json(scheduled.input().unwrap_or(""))?;
    let result = match &completed.attributes {
        EventAttributes::TaskCompleted { result, .. } => result.as_deref(),
        _ => None,
    }
    .ok_or_else(|| anyhow!("completion for {} has no result", input.pid))?;
    let text = decode_task_result(result)
        .with_context(|| format!("bad result for page {}", input.pid))?;
    Ok(OcrPage {
        pid: input.pid,
        text: text.trim().to_owned(),
    })
}

/// Where finished requests go: files, the metadata service, email and
/// callbacks.
///
/// Implementations must tolerate being called more than once for the same
/// request, because a terminal decision may be replayed.
#[async_trait]
pub trait RequestOutput: Send + Sync + 'static {
    /// Record how many pages of a request are done.
    async fn record_progress(&self, reqid: &str, completed: usize) -> Result<()>;

    /// Deliver the text of a successful request.
    async fn succeeded(&self, request: &WorkflowRequest, pages: &[OcrPage]) -> Result<()>;

    /// Tell requestors that a request failed.
    async fn failed(&self, request: &WorkflowRequest, details: &str) -> Result<()>;
}

/// Cleans up staged page images.
#[async_trait]
pub trait StagingCleanup: Send + Sync + 'static {
    /// Delete the staged inputs for a request.
    async fn delete_request_inputs(&self, bucket: &str, reqid: &str) -> Result<()>;
}

/// Runs the output side of a finished workflow.
#[derive(Clone)]
pub struct Finalizer {
    output: Arc<dyn RequestOutput>,
    staging: Arc<dyn StagingCleanup>,
}

impl Finalizer {
    /// Create a new finalizer.
    pub fn new(output: Arc<dyn RequestOutput>, staging: Arc<dyn StagingCleanup>) -> Self {
        Self { output, staging }
    }

    /// Record progress. Errors are logged, not returned.
    pub async fn record_progress(&self, reqid: &str, completed: usize) {
        if let Err(err) = self.output.record_progress(reqid, completed).await {
            warn!(reqid, "Could not record progress: {err:#}");
        }
    }

    /// Deliver results and clean up. Nothing here is retried: failures are
    /// logged and the workflow ends regardless.
    #[instrument(level = "info", skip_all, fields(reqid = %finalization.request().reqid))]
    pub async fn finalize(&self, finalization: Finalization) {
        let request = finalization.request().clone();
        let result = match &finalization {
            Finalization::Succeeded { request, pages } => {
                info!(pages = pages.len(), "Delivering OCR results");
                self.output.succeeded(request, pages).await
            }
            Finalization::Failed { request, details } => {
                info!(%details, "Reporting OCR failure");
                self.output.failed(request, details).await
            }
        };
        if let Err(err) = result {
            error!("Could not deliver results: {err:#}");
        }

        if let Err(err) = self
            .staging
            .delete_request_inputs(&request.bucket, &request.reqid)
            .await
        {
            warn!("Could not clean up staged inputs: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decider::{
        events::EventKind,
        testing::{HistoryBuilder, RecordingOutput, sample_request},
    };

    fn completions(events: &[HistoryEvent]) -> Vec<&HistoryEvent> {
        events
            .iter()
            .filter(|e| e.kind() == EventKind::TaskCompleted)
            .collect()
    }

    #[test]
    fn pages_are_sorted_trimmed_and_deduplicated() {
        let mut history = HistoryBuilder::new();
        let (a, b) = history.started_and_scheduled(&sample_request());
        history.completed(b, "  bar\n");
        history.completed(a, "foo");
        history.completed(a, "foo again");
        let events = history.events();
        let pages = collect_pages(&events, &completions(&events));
        assert_eq!(
            pages,
            vec![
                OcrPage {
                    pid: "pidA".to_owned(),
                    text: "foo".to_owned()
                },
                OcrPage {
                    pid: "pidB".to_owned(),
                    text: "bar".to_owned()
                },
            ]
        );
    }

    #[test]
    fn bad_results_are_skipped() {
        let mut history = HistoryBuilder::new();
        let (a, b) = history.started_and_scheduled(&sample_request());
        history.completed_raw(a, "{{");
        history.completed(b, "bar");
        history.completed(999, "orphan");
        let events = history.events();
        let pages = collect_pages(&events, &completions(&events));
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].pid, "pidB");
    }

    #[tokio::test]
    async fn finalizer_delivers_and_cleans_up() {
        let output = Arc::new(RecordingOutput::default());
        let finalizer = Finalizer::new(output.clone(), output.clone());
        finalizer
            .finalize(Finalization::Failed {
                request: sample_request(),
                details: "OCR generation process failed (process was canceled)".to_owned(),
            })
            .await;
        finalizer
            .finalize(Finalization::Succeeded {
                request: sample_request(),
                pages: vec![],
            })
            .await;
        let calls = output.calls();
        assert_eq!(
            calls,
            vec![
                "failed R: OCR generation process failed (process was canceled)",
                "cleanup B/R",
                "succeeded R: 0 pages",
                "cleanup B/R",
            ]
        );
    }

    #[tokio::test]
    async fn output_errors_do_not_stop_cleanup() {
        let output = Arc::new(RecordingOutput::failing());
        let finalizer = Finalizer::new(output.clone(), output.clone());
        finalizer
            .finalize(Finalization::Failed {
                request: sample_request(),
                details: "boom".to_owned(),
            })
            .await;
        assert_eq!(output.calls().last().unwrap(), "cleanup B/R");
    }
}
