//! Client for the catalog metadata service.

use reqwest::StatusCode;

use crate::prelude::*;

/// One page of a cataloged item.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PageMetadata {
    pub pid: String,
    pub filename: String,
    #[serde(default)]
    pub title: String,
    /// Existing OCR text, if the item already has some.
    #[serde(default)]
    pub text: Option<String>,
}

/// What the metadata service knows about an item.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ItemMetadata {
    pub pid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub ocr_candidate: bool,
    #[serde(default)]
    pub has_ocr: bool,
    #[serde(default)]
    pub has_transcription: bool,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub pages: Vec<PageMetadata>,
}

/// Talks to the metadata service over HTTP.
pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
    key: String,
    read_only: bool,
}

impl MetadataClient {
    /// Create a new client.
    pub fn new(base_url: &str, key: &str, read_only: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            key: key.to_owned(),
            read_only,
        }
    }

    fn item_url(&self, pid: &str) -> String {
        format!("{}/api/ocr/{pid}", self.base_url)
    }

    /// Look up an item, optionally restricted to one unit. Returns `None` for
    /// unknown PIDs.
    #[instrument(level = "debug", skip(self))]
    pub async fn item(&self, pid: &str, unit: Option<&str>) -> Result<Option<ItemMetadata>> {
        let response = self
            .client
            .get(self.item_url(pid))
            .query(&[("unit", unit.unwrap_or(""))])
            .send()
            .await
            .with_context(|| format!("could not fetch metadata for {pid}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("metadata service failed for {pid}"))?;
        let item = response
            .json::<ItemMetadata>()
            .await
            .with_context(|| format!("could not parse metadata for {pid}"))?;
        Ok(Some(item))
    }

    /// Save OCR text for a page.
    #[instrument(level = "debug", skip(self, text))]
    pub async fn store_page_text(&self, pid: &str, text: &str) -> Result<()> {
        if self.read_only {
            info!("Metadata service is read-only; not storing text");
            return Ok(());
        }
        self.client
            .post(self.item_url(pid))
            .form(&[("key", self.key.as_str()), ("text", text)])
            .send()
            .await
            .with_context(|| format!("could not store text for {pid}"))?
            .error_for_status()
            .with_context(|| format!("metadata service rejected text for {pid}"))?;
        Ok(())
    }
}
