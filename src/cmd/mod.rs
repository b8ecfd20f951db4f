//! Command-line entry points.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::{
    async_utils::JoinWorker,
    aws::s3_client,
    config::ServiceOpts,
    decider::{DecisionBuilder, Finalizer, Poller, ReplayEngine, WorkflowService},
    metadata::MetadataClient,
    output::{Notifier, email::SmtpMailer},
    prelude::*,
    staging::S3Stager,
    tracking::RequestStore,
};

pub mod decide;
pub mod decode_input;
pub mod serve;

/// Collaborators shared by the HTTP API and the decider.
struct Components {
    store: Arc<RequestStore>,
    metadata: Arc<MetadataClient>,
    notifier: Arc<Notifier>,
    stager: Arc<S3Stager>,
}

impl Components {
    /// Build everything from our options.
    #[instrument(level = "debug", skip_all)]
    async fn new(opts: &ServiceOpts) -> Result<Self> {
        let store = Arc::new(RequestStore::open(&opts.storage_dir).await?);
        let metadata = Arc::new(MetadataClient::new(
            &opts.metadata_url,
            &opts.metadata_key,
            opts.metadata_read_only,
        ));
        let mailer = Arc::new(SmtpMailer::new(
            &opts.smtp_host,
            opts.smtp_port,
            &opts.smtp_sender,
        )?);
        let notifier = Arc::new(Notifier::new(store.clone(), metadata.clone(), mailer));
        let stager = Arc::new(S3Stager::new(
            s3_client().await?,
            &opts.bucket,
            &opts.archive_dir,
            &opts.iiif_url_template,
            opts.upload_workers(),
            store.clone(),
        ));
        Ok(Self {
            store,
            metadata,
            notifier,
            stager,
        })
    }

    /// Start one decider poller per task list.
    fn spawn_pollers(
        &self,
        opts: &ServiceOpts,
        service: Arc<dyn WorkflowService>,
    ) -> Vec<JoinWorker> {
        let engine = ReplayEngine::new(
            DecisionBuilder::new(&opts.lambda_function, opts.lambda_timeout),
            opts.retry_policy(),
        );
        let finalizer = Finalizer::new(self.notifier.clone(), self.stager.clone());
        opts.task_lists()
            .into_iter()
            .map(|task_list| {
                let poller =
                    Poller::new(service.clone(), engine.clone(), finalizer.clone(), task_list);
                JoinWorker::from_handle(tokio::spawn(poller.run()))
            })
            .collect()
    }
}

/// Wait for workers, returning the first error.
async fn join_all(workers: Vec<JoinWorker>) -> Result<()> {
    try_join_all(workers.into_iter().map(JoinWorker::join)).await?;
    Ok(())
}
