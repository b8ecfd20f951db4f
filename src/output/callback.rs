//! HTTP callbacks to requestors.

use crate::prelude::*;

/// The JSON document we post to callback URLs.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CallbackPayload {
    /// `"success"` or `"fail"`.
    pub status: String,
    pub message: String,
    pub started: String,
    pub finished: String,
}

/// Post a payload to a callback URL as the form field `json`.
#[instrument(level = "debug", skip(client, payload))]
pub async fn post_callback(
    client: &reqwest::Client,
    url: &str,
    payload: &CallbackPayload,
) -> Result<()> {
    let json = serde_json::to_string(payload).context("could not serialize callback")?;
    client
        .post(url)
        .form(&[("json", json)])
        .send()
        .await
        .with_context(|| format!("could not post callback to {url}"))?
        .error_for_status()
        .with_context(|| format!("callback to {url} failed"))?;
    Ok(())
}
