//! Delivering OCR results: files, the metadata service, email and callbacks.

use std::sync::Arc;

use tokio::fs;

use crate::{
    codec::WorkflowRequest,
    decider::{OcrPage, RequestOutput},
    metadata::MetadataClient,
    prelude::*,
    tracking::{Outcome, Recipient, RequestRecord, RequestStore},
};

pub mod callback;
pub mod document;
pub mod email;

use self::{
    callback::{CallbackPayload, post_callback},
    document::format_document,
    email::{Email, Mailer},
};

/// What we're telling recipients.
#[derive(Clone, Debug)]
pub enum Delivery {
    /// OCR succeeded. Holds the formatted document.
    Success { document: String },
    /// OCR failed, for the given reason.
    Failure { details: String },
}

impl Delivery {
    fn status(&self) -> &'static str {
        match self {
            Delivery::Success { .. } => "success",
            Delivery::Failure { .. } => "fail",
        }
    }
}

/// Sends finished requests wherever they need to go.
pub struct Notifier {
    store: Arc<RequestStore>,
    metadata: Arc<MetadataClient>,
    mailer: Arc<dyn Mailer>,
    http: reqwest::Client,
}

impl Notifier {
    /// Create a new notifier.
    pub fn new(
        store: Arc<RequestStore>,
        metadata: Arc<MetadataClient>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            store,
            metadata,
            mailer,
            http: reqwest::Client::new(),
        }
    }

    /// Tell `recipients` how a request went. Individual failures are logged
    /// and don't stop the other notifications.
    #[instrument(level = "debug", skip_all, fields(reqid = %record.reqid))]
    pub async fn deliver(
        &self,
        record: &RequestRecord,
        recipients: &[Recipient],
        delivery: &Delivery,
    ) {
        let title = if record.title.is_empty() {
            &record.pid
        } else {
            &record.title
        };
        for recipient in recipients {
            if let Some(address) = &recipient.email {
                let email = build_email(address, title, &record.pid, delivery);
                if let Err(err) = self.mailer.send(&email).await {
                    error!("Could not email {address}: {err:#}");
                }
            }
            if let Some(url) = &recipient.callback {
                let message = match delivery {
                    Delivery::Success { .. } => "OCR complete".to_owned(),
                    Delivery::Failure { details } => details.clone(),
                };
                let payload = CallbackPayload {
                    status: delivery.status().to_owned(),
                    message,
                    started: RequestRecord::format_time(Some(record.started)),
                    finished: RequestRecord::format_time(record.finished),
                };
                if let Err(err) = post_callback(&self.http, url, &payload).await {
                    error!("Could not call back {url}: {err:#}");
                }
            }
        }
    }

    async fn write_document(&self, request: &WorkflowRequest, document: &str) -> Result<()> {
        let dir = if request.path.is_empty() {
            self.store.workdir(&request.reqid)
        } else {
            PathBuf::from(&request.path)
        };
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("could not create {}", dir.display()))?;
        let path = dir.join(format!("{}.txt", request.pid));
        fs::write(&path, document)
            .await
            .with_context(|| format!("could not write {}", path.display()))?;
        debug!(path = %path.display(), "Wrote OCR document");
        Ok(())
    }
}

fn build_email(address: &str, title: &str, pid: &str, delivery: &Delivery) -> Email {
    let subject = format!("OCR results for {title}");
    match delivery {
        Delivery::Success { document } => Email {
            to: address.to_owned(),
            subject,
            body: format!("OCR results for {title} are attached."),
            attachment: Some((format!("{pid}.txt"), document.clone())),
        },
        Delivery::Failure { details } => Email {
            to: address.to_owned(),
            subject,
            body: format!("OCR processing for {title} failed.\n\n{details}"),
            attachment: None,
        },
    }
}

#[async_trait]
impl RequestOutput for Notifier {
    async fn record_progress(&self, reqid: &str, completed: usize) -> Result<()> {
        self.store.set_completed(reqid, completed).await
    }

    #[instrument(level = "info", skip_all, fields(reqid = %request.reqid, pid = %request.pid))]
    async fn succeeded(&self, request: &WorkflowRequest, pages: &[OcrPage]) -> Result<()> {
        let Some(record) = self
            .store
            .claim_outcome(&request.reqid, Outcome::Success)
            .await?
        else {
            info!("Results already delivered");
            return Ok(());
        };

        // Output channels fail independently.
        let document = format_document(pages);
        if let Err(err) = self.write_document(request, &document).await {
            error!("Could not write OCR document: {err:#}");
        }
        for page in pages {
            if let Err(err) = self.metadata.store_page_text(&page.pid, &page.text).await {
                error!(page = %page.pid, "Could not store page text: {err:#}");
            }
        }
        self.deliver(&record, &record.recipients, &Delivery::Success { document })
            .await;
        Ok(())
    }

    #[instrument(level = "info", skip_all, fields(reqid = %request.reqid, pid = %request.pid))]
    async fn failed(&self, request: &WorkflowRequest, details: &str) -> Result<()> {
        let Some(record) = self
            .store
            .claim_outcome(&request.reqid, Outcome::Failure)
            .await?
        else {
            info!("Failure already reported");
            return Ok(());
        };
        let delivery = Delivery::Failure {
            details: details.to_owned(),
        };
        self.deliver(&record, &record.recipients, &delivery).await;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::{testing::RecordingMailer, *};

    struct Fixture {
        _dir: tempfile::TempDir,
        server: mockito::ServerGuard,
        store: Arc<RequestStore>,
        mailer: Arc<RecordingMailer>,
        notifier: Notifier,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let server = mockito::Server::new_async().await;
        let store = Arc::new(RequestStore::open(dir.path()).await.unwrap());
        let metadata = Arc::new(MetadataClient::new(&server.url(), "k", false));
        let mailer = Arc::new(RecordingMailer::default());
        let notifier = Notifier::new(store.clone(), metadata, mailer.clone());
        Fixture {
            _dir: dir,
            server,
            store,
            mailer,
            notifier,
        }
    }

    fn request_for(record: &RequestRecord, path: &Path) -> WorkflowRequest {
        WorkflowRequest {
            pid: record.pid.clone(),
            path: path.display().to_string(),
            lang: "eng".to_owned(),
            reqid: record.reqid.clone(),
            bucket: "B".to_owned(),
            pages: vec![],
        }
    }

    #[tokio::test]
    async fn success_is_delivered_once() {
        let mut f = fixture().await;
        let text_mock = f
            .server
            .mock("POST", Matcher::Regex("^/api/ocr/".to_owned()))
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let callback_mock = f
            .server
            .mock("POST", "/callback")
            .match_body(Matcher::Regex("success".to_owned()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let record = f
            .store
            .create(
                "uva-lib:1",
                "Diary",
                Recipient::new(Some("alice@example.com"), None),
            )
            .await
            .unwrap();
        let callback = format!("{}/callback", f.server.url());
        f.store
            .add_recipient(&record.reqid, Recipient::new(None, Some(callback.as_str())))
            .await
            .unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let request = request_for(&record, out_dir.path());
        let pages = vec![
            OcrPage {
                pid: "uva-lib:2".to_owned(),
                text: "first page".to_owned(),
            },
            OcrPage {
                pid: "uva-lib:3".to_owned(),
                text: "second page".to_owned(),
            },
        ];
        f.notifier.succeeded(&request, &pages).await.unwrap();
        f.notifier.succeeded(&request, &pages).await.unwrap();

        text_mock.assert_async().await;
        callback_mock.assert_async().await;
        let sent = f.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "OCR results for Diary");
        let (name, document) = sent[0].attachment.clone().unwrap();
        assert_eq!(name, "uva-lib:1.txt");
        assert!(document.starts_with("========\nPage 1 of 2\n========\n\nfirst page"));
        let written = fs::read_to_string(out_dir.path().join("uva-lib:1.txt"))
            .await
            .unwrap();
        assert_eq!(written, document);

        let record = f.store.load(&record.reqid).await.unwrap().unwrap();
        assert_eq!(record.outcome, Some(Outcome::Success));
    }

    #[tokio::test]
    async fn unwritable_output_still_notifies() {
        let mut f = fixture().await;
        f.server
            .mock("POST", Matcher::Regex("^/api/ocr/".to_owned()))
            .with_status(200)
            .create_async()
            .await;
        let record = f
            .store
            .create(
                "uva-lib:1",
                "Diary",
                Recipient::new(Some("alice@example.com"), None),
            )
            .await
            .unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let blocker = out_dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let request = request_for(&record, &blocker.join("sub"));
        let pages = vec![OcrPage {
            pid: "uva-lib:2".to_owned(),
            text: "only page".to_owned(),
        }];
        f.notifier.succeeded(&request, &pages).await.unwrap();

        let sent = f.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].attachment.is_some());
        let record = f.store.load(&record.reqid).await.unwrap().unwrap();
        assert_eq!(record.outcome, Some(Outcome::Success));
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let mut f = fixture().await;
        let callback_mock = f
            .server
            .mock("POST", "/callback")
            .match_body(Matcher::Regex("fail".to_owned()))
            .with_status(200)
            .create_async()
            .await;
        let callback = format!("{}/callback", f.server.url());
        let record = f
            .store
            .create(
                "uva-lib:1",
                "",
                Recipient::new(Some("bob@example.com"), Some(callback.as_str())),
            )
            .await
            .unwrap();
        let request = request_for(&record, Path::new(""));
        f.notifier
            .failed(&request, "OCR generation process failed (boom)")
            .await
            .unwrap();
        callback_mock.assert_async().await;
        let sent = f.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "OCR results for uva-lib:1");
        assert!(sent[0].body.contains("OCR generation process failed (boom)"));
        assert!(sent[0].attachment.is_none());
    }

    #[tokio::test]
    async fn progress_is_recorded() {
        let f = fixture().await;
        let record = f
            .store
            .create("uva-lib:1", "Diary", Recipient::default())
            .await
            .unwrap();
        f.store.set_total(&record.reqid, 2).await.unwrap();
        f.notifier.record_progress(&record.reqid, 1).await.unwrap();
        let record = f.store.load(&record.reqid).await.unwrap().unwrap();
        assert_eq!(record.completed, 1);
        assert_eq!(record.progress().as_deref(), Some("25%"));
    }
}
