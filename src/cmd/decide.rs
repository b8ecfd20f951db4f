//! The `decide` subcommand.

use std::sync::Arc;

use clap::Args;

use super::{Components, join_all};
use crate::{config::ServiceOpts, prelude::*, swf::SwfClient};

/// Decide command line arguments.
#[derive(Debug, Args)]
pub struct DecideOpts {
    #[clap(flatten)]
    pub service: ServiceOpts,
}

/// The `decide` subcommand. Runs decider pollers without the HTTP API.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_decide(opts: &DecideOpts) -> Result<()> {
    let opts = &opts.service;
    opts.validate()?;
    if opts.workflow_disabled {
        return Err(anyhow!(
            "the workflow service is disabled, so there is nothing to decide"
        ));
    }
    let components = Components::new(opts).await?;
    let swf = Arc::new(SwfClient::new(opts).await?);
    join_all(components.spawn_pollers(opts, swf)).await
}
