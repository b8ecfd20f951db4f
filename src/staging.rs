//! Staging page images where the OCR compute tasks can read them.

use std::sync::Arc;

use aws_sdk_s3::primitives::ByteStream;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use tokio::fs;

use crate::{
    async_utils::run_bounded,
    codec::{PageDescriptor, staged_key},
    config::PID_PLACEHOLDER,
    decider::StagingCleanup,
    prelude::*,
    retry::{IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
    tracking::RequestStore,
};

/// Where to get a page image from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    /// An archival master on local disk.
    File(PathBuf),
    /// A IIIF image URL.
    Url(String),
}

/// Pick the image source for a page, preferring the local archive.
pub async fn image_source(
    archive_dir: &Path,
    iiif_url_template: &str,
    page: &PageDescriptor,
) -> ImageSource {
    let path = archive_dir.join(&page.filename);
    if fs::try_exists(&path).await.unwrap_or(false) {
        ImageSource::File(path)
    } else {
        ImageSource::Url(iiif_url_template.replace(PID_PLACEHOLDER, &page.pid))
    }
}

/// Stages the pages of a request.
#[async_trait]
pub trait PageStager: Send + Sync + 'static {
    /// Stage every page, or fail if any page can't be staged.
    async fn stage_pages(&self, reqid: &str, pages: &[PageDescriptor]) -> Result<()>;
}

/// Uploads page images to S3.
#[derive(Clone)]
pub struct S3Stager {
    s3: aws_sdk_s3::Client,
    http: reqwest::Client,
    bucket: String,
    archive_dir: PathBuf,
    iiif_url_template: String,
    workers: usize,
    store: Arc<RequestStore>,
}

impl S3Stager {
    /// Create a new stager.
    pub fn new(
        s3: aws_sdk_s3::Client,
        bucket: &str,
        archive_dir: &Path,
        iiif_url_template: &str,
        workers: usize,
        store: Arc<RequestStore>,
    ) -> Self {
        Self {
            s3,
            http: reqwest::Client::new(),
            bucket: bucket.to_owned(),
            archive_dir: archive_dir.to_owned(),
            iiif_url_template: iiif_url_template.to_owned(),
            workers,
            store,
        }
    }

    /// Upload one page, retrying transient failures.
    #[instrument(level = "debug", skip(self, page), fields(pid = %page.pid))]
    async fn stage_page(&self, reqid: &str, page: &PageDescriptor) -> Result<()> {
        let source = image_source(&self.archive_dir, &self.iiif_url_template, page).await;
        let key = staged_key(reqid, &page.filename);

        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: 5,
            jitter_ratio: 0.2,
        };
        let result = self
            .upload_once(&source, &key)
            .await
            .retry_with_async(|_| self.upload_once(&source, &key))
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "Upload succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "Upload FAILED after {} retries with error {fatal_error:?}",
                    retry_errors_list.len()
                )
            });

        let outcome = match result {
            ResolvedResult::Ok { .. } | ResolvedResult::Recovered { .. } => {
                if let Err(err) = self.store.record_upload(reqid).await {
                    warn!("Could not record upload: {err:#}");
                }
                Ok(())
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        };
        outcome.with_context(|| format!("could not stage page {}", page.pid))
    }

    async fn upload_once(
        &self,
        source: &ImageSource,
        key: &str,
    ) -> RetryResult<(), (), (), anyhow::Error> {
        let bytes = match source {
            ImageSource::File(path) => try_fatal!(
                fs::read(path)
                    .await
                    .with_context(|| format!("could not read {}", path.display()))
            ),
            ImageSource::Url(url) => {
                let response = try_potentially_transient!(self.http.get(url).send().await);
                let response = try_potentially_transient!(response.error_for_status());
                try_potentially_transient!(response.bytes().await).to_vec()
            }
        };
        trace!(key, bytes = bytes.len(), "Uploading page image");
        try_potentially_transient!(
            self.s3
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(bytes))
                .send()
                .await
        );
        retry_result_ok(())
    }
}

#[async_trait]
impl PageStager for S3Stager {
    #[instrument(level = "info", skip(self, pages), fields(pages = pages.len()))]
    async fn stage_pages(&self, reqid: &str, pages: &[PageDescriptor]) -> Result<()> {
        let stager = self.clone();
        let reqid_owned = reqid.to_owned();
        let count = run_bounded(self.workers, pages.to_vec(), move |page| {
            let stager = stager.clone();
            let reqid = reqid_owned.clone();
            async move { stager.stage_page(&reqid, &page).await }
        })
        .await?;
        info!(count, "Staged page images");
        Ok(())
    }
}

#[async_trait]
impl StagingCleanup for S3Stager {
    async fn delete_request_inputs(&self, bucket: &str, reqid: &str) -> Result<()> {
        // Staged objects expire under the bucket's lifecycle policy.
        debug!(bucket, reqid, "Leaving staged inputs for the bucket to expire");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(pid: &str, filename: &str) -> PageDescriptor {
        PageDescriptor {
            pid: pid.to_owned(),
            filename: filename.to_owned(),
        }
    }

    #[tokio::test]
    async fn archive_files_win_over_iiif() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0001.tif"), b"II*").unwrap();
        let template = "https://iiif.example.com/{PID}/full/full/0/default.jpg";

        assert_eq!(
            image_source(dir.path(), template, &page("uva-lib:2", "0001.tif")).await,
            ImageSource::File(dir.path().join("0001.tif"))
        );
        assert_eq!(
            image_source(dir.path(), template, &page("uva-lib:3", "0002.tif")).await,
            ImageSource::Url(
                "https://iiif.example.com/uva-lib:3/full/full/0/default.jpg".to_owned()
            )
        );
    }
}
