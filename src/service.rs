//! Handling OCR requests: deciding whether to start, join or answer them,
//! and getting new workflows off the ground.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
    codec::{PageDescriptor, WorkflowRequest, encode_workflow_input},
    decider::{OcrPage, RequestOutput},
    metadata::{ItemMetadata, MetadataClient},
    output::{Delivery, Notifier, document::format_document},
    prelude::*,
    staging::PageStager,
    swf::{WorkflowLauncher, workflow_id_for},
    tracking::{Outcome, Recipient, RequestStore},
};

/// Language we OCR in when nobody says otherwise.
const DEFAULT_LANG: &str = "eng";

/// Parameters of an OCR request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OcrParams {
    pub unit: Option<String>,
    pub email: Option<String>,
    pub callback: Option<String>,
    pub force: Option<String>,
    pub lang: Option<String>,
}

impl OcrParams {
    fn force(&self) -> bool {
        self.force
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("true"))
    }

    fn recipient(&self) -> Recipient {
        Recipient::new(self.email.as_deref(), self.callback.as_deref())
    }
}

/// What we did with an OCR request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// We started a new workflow.
    Started { reqid: String },
    /// A request was already running, so we added a recipient to it.
    Joined { reqid: String },
    /// The item already has OCR text, which we sent right away.
    AlreadyDone { reqid: String },
    /// The metadata service has never heard of this PID.
    UnknownPid,
    /// This item can't be OCRed.
    NotCandidate,
}

/// A handled request, plus any work still running in the background.
#[derive(Debug)]
pub struct Accepted {
    pub outcome: RequestOutcome,
    pub background: Option<JoinHandle<()>>,
}

impl Accepted {
    fn now(outcome: RequestOutcome) -> Self {
        Self {
            outcome,
            background: None,
        }
    }
}

/// OCR status for an item.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct OcrStatus {
    pub has_ocr: bool,
    pub has_transcription: bool,
    pub is_ocr_candidate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_progress: Option<String>,
}

/// Everything needed to take and launch OCR requests.
#[derive(Clone)]
pub struct OcrService {
    store: Arc<RequestStore>,
    metadata: Arc<MetadataClient>,
    notifier: Arc<Notifier>,
    stager: Arc<dyn PageStager>,
    launcher: Arc<dyn WorkflowLauncher>,
    bucket: String,
}

impl OcrService {
    /// Create a new service.
    pub fn new(
        store: Arc<RequestStore>,
        metadata: Arc<MetadataClient>,
        notifier: Arc<Notifier>,
        stager: Arc<dyn PageStager>,
        launcher: Arc<dyn WorkflowLauncher>,
        bucket: &str,
    ) -> Self {
        Self {
            store,
            metadata,
            notifier,
            stager,
            launcher,
            bucket: bucket.to_owned(),
        }
    }

    /// Handle a request for OCR text.
    #[instrument(level = "info", skip(self, params))]
    pub async fn request_ocr(&self, pid: &str, params: &OcrParams) -> Result<Accepted> {
        let Some(item) = self.metadata.item(pid, params.unit.as_deref()).await? else {
            return Ok(Accepted::now(RequestOutcome::UnknownPid));
        };
        if !item.ocr_candidate {
            return Ok(Accepted::now(RequestOutcome::NotCandidate));
        }

        let recipient = params.recipient();
        if !params.force() {
            if let Some(record) = self.store.in_progress(pid).await? {
                info!(reqid = %record.reqid, "Request already in progress; adding recipient");
                self.store.add_recipient(&record.reqid, recipient).await?;
                return Ok(Accepted::now(RequestOutcome::Joined {
                    reqid: record.reqid,
                }));
            }
            if item.has_ocr {
                return self.send_existing_text(item, recipient).await;
            }
        }

        let record = self.store.create(pid, &item.title, recipient).await?;
        let lang = params
            .lang
            .clone()
            .filter(|l| !l.trim().is_empty())
            .or_else(|| Some(item.lang.clone()).filter(|l| !l.is_empty()))
            .unwrap_or_else(|| DEFAULT_LANG.to_owned());
        let request = WorkflowRequest {
            pid: pid.to_owned(),
            path: self.store.workdir(&record.reqid).display().to_string(),
            lang,
            reqid: record.reqid.clone(),
            bucket: self.bucket.clone(),
            pages: item
                .pages
                .iter()
                .map(|page| PageDescriptor {
                    pid: page.pid.clone(),
                    filename: page.filename.clone(),
                })
                .collect(),
        };

        let service = self.clone();
        let background = tokio::spawn(async move { service.launch(request).await });
        Ok(Accepted {
            outcome: RequestOutcome::Started {
                reqid: record.reqid,
            },
            background: Some(background),
        })
    }

    /// Tell a new recipient about text we already have.
    async fn send_existing_text(
        &self,
        item: ItemMetadata,
        recipient: Recipient,
    ) -> Result<Accepted> {
        let pages = existing_pages(&item);
        let record = self
            .store
            .create(&item.pid, &item.title, recipient.clone())
            .await?;
        self.store.set_total(&record.reqid, pages.len()).await?;
        let Some(record) = self
            .store
            .claim_outcome(&record.reqid, Outcome::Success)
            .await?
        else {
            return Err(anyhow!("request {} finished twice", record.reqid));
        };
        info!(reqid = %record.reqid, "Item already has OCR text; sending it");

        let notifier = self.notifier.clone();
        let reqid = record.reqid.clone();
        let background = tokio::spawn(async move {
            let delivery = Delivery::Success {
                document: format_document(&pages),
            };
            notifier.deliver(&record, &[recipient], &delivery).await;
        });
        Ok(Accepted {
            outcome: RequestOutcome::AlreadyDone { reqid },
            background: Some(background),
        })
    }

    /// Stage page images and start the workflow. Problems are reported to the
    /// request's recipients.
    #[instrument(level = "info", skip_all, fields(reqid = %request.reqid))]
    async fn launch(&self, request: WorkflowRequest) {
        if let Err(err) = self.try_launch(&request).await {
            error!("Could not start OCR: {err:#}");
            let details = format!("OCR generation process failed ({err:#})");
            if let Err(err) = self.notifier.failed(&request, &details).await {
                error!("Could not report failure: {err:#}");
            }
        }
    }

    async fn try_launch(&self, request: &WorkflowRequest) -> Result<()> {
        self.store
            .set_total(&request.reqid, request.pages.len())
            .await?;
        self.stager
            .stage_pages(&request.reqid, &request.pages)
            .await?;
        let input = encode_workflow_input(request)?;
        self.launcher
            .start_workflow(&workflow_id_for(&request.reqid), &input)
            .await?;
        self.store.mark_enqueued(&request.reqid).await?;
        info!(pages = request.pages.len(), "Workflow started");
        Ok(())
    }

    /// Report OCR status for an item. Returns `None` for unknown PIDs.
    pub async fn status(&self, pid: &str) -> Result<Option<OcrStatus>> {
        let Some(item) = self.metadata.item(pid, None).await? else {
            return Ok(None);
        };
        let ocr_progress = self
            .store
            .in_progress(pid)
            .await?
            .and_then(|record| record.progress());
        Ok(Some(OcrStatus {
            has_ocr: item.has_ocr,
            has_transcription: item.has_transcription,
            is_ocr_candidate: item.ocr_candidate,
            ocr_progress,
        }))
    }

    /// The OCR document for an item, built from stored page text. Returns
    /// `None` for unknown PIDs.
    pub async fn text(&self, pid: &str, unit: Option<&str>) -> Result<Option<String>> {
        let Some(item) = self.metadata.item(pid, unit).await? else {
            return Ok(None);
        };
        Ok(Some(format_document(&existing_pages(&item))))
    }
}

/// Pages with stored text, in catalog order.
fn existing_pages(item: &ItemMetadata) -> Vec<OcrPage> {
    item.pages
        .iter()
        .map(|page| OcrPage {
            pid: page.pid.clone(),
            text: page.text.clone().unwrap_or_default(),
        })
        .collect()
}
