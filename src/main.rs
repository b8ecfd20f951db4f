use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::prelude::*;

mod async_utils;
mod aws;
mod cmd;
mod codec;
mod config;
mod decider;
mod metadata;
mod output;
mod prelude;
mod retry;
mod service;
mod staging;
mod swf;
mod tracking;
mod web;

/// Request OCR text for digitized items, and run the workflow decider that
/// produces it.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCRWS_*: Every option may also be set using the environment variable
    shown in its help.

  Standard AWS environment variables and credential files
  are used for the workflow service and S3.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the HTTP API, plus the decider unless the workflow service is
    /// disabled.
    Serve(cmd::serve::ServeOpts),
    /// Run only the decider.
    Decide(cmd::decide::DecideOpts),
    /// Decode a workflow input string and print it as JSON.
    DecodeInput(cmd::decode_input::DecodeInputOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Serve(opts) => {
            cmd::serve::cmd_serve(opts).await?;
        }
        Cmd::Decide(opts) => {
            cmd::decide::cmd_decide(opts).await?;
        }
        Cmd::DecodeInput(opts) => {
            cmd::decode_input::cmd_decode_input(opts).await?;
        }
    }
    Ok(())
}
