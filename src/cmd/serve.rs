//! The `serve` subcommand.

use std::{net::SocketAddr, sync::Arc};

use clap::Args;
use tokio::net::TcpListener;

use super::{Components, join_all};
use crate::{
    async_utils::JoinWorker,
    config::ServiceOpts,
    prelude::*,
    service::OcrService,
    swf::{DisabledLauncher, SwfClient, WorkflowLauncher},
    web,
};

/// Serve command line arguments.
#[derive(Debug, Args)]
pub struct ServeOpts {
    #[clap(flatten)]
    pub service: ServiceOpts,
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    let opts = &opts.service;
    opts.validate()?;
    let components = Components::new(opts).await?;

    let mut workers = vec![];
    let launcher: Arc<dyn WorkflowLauncher> = if opts.workflow_disabled {
        warn!("Workflow service disabled; OCR requests will fail to start");
        Arc::new(DisabledLauncher)
    } else {
        let swf = Arc::new(SwfClient::new(opts).await?);
        workers.extend(components.spawn_pollers(opts, swf.clone()));
        swf
    };

    let service = OcrService::new(
        components.store.clone(),
        components.metadata.clone(),
        components.notifier.clone(),
        components.stager.clone(),
        launcher,
        &opts.bucket,
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], opts.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not listen on {addr}"))?;
    info!(%addr, "Listening for HTTP requests");
    let app = web::router(service);
    workers.push(JoinWorker::from_handle(tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .context("HTTP server failed")
    })));

    join_all(workers).await
}
