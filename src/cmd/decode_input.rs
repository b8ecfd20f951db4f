//! The `decode-input` subcommand.

use clap::Args;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::{codec::decode_workflow_input, prelude::*};

/// Decode-input command line arguments.
#[derive(Debug, Args)]
pub struct DecodeInputOpts {
    /// A workflow input string, as shown in the workflow console. Use `-` to
    /// read it from standard input.
    #[clap(value_name = "INPUT")]
    pub input: String,
}

/// The `decode-input` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_decode_input(opts: &DecodeInputOpts) -> Result<()> {
    let input = if opts.input == "-" {
        let mut input = String::new();
        tokio::io::stdin()
            .read_to_string(&mut input)
            .await
            .context("failed to read standard input")?;
        input
    } else {
        opts.input.clone()
    };

    let request = decode_workflow_input(input.trim())?;
    let mut json =
        serde_json::to_string_pretty(&request).context("failed to serialize request")?;
    json.push('\n');
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(json.as_bytes())
        .await
        .context("failed to write request")?;
    stdout.flush().await.context("failed to flush request")?;
    Ok(())
}
