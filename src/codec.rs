//! Wire formats shared by the decider, the compute tasks and the workflow
//! starter.
//!
//! The workflow input is JSON, gzipped and base64-encoded, because the
//! workflow service caps input sizes and page lists can get long. Everything
//! else is plain JSON.

use std::io::{Read as _, Write as _};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserializer, Serializer, de};

use crate::prelude::*;

/// The smallest scale we will ever ask a compute task to use.
pub const MIN_SCALE: u32 = 10;

/// The scale we start every page at.
pub const FULL_SCALE: u32 = 100;

/// How much we shrink a page each time its task times out.
pub const SCALE_STEP: u32 = 10;

/// A request to OCR every page of one catalog item. Carried in the workflow's
/// start event.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct WorkflowRequest {
    /// The metadata PID the request was made for.
    pub pid: String,

    /// Local working directory for this request's outputs.
    #[serde(default)]
    pub path: String,

    /// OCR language hint.
    #[serde(default)]
    pub lang: String,

    /// Our request ID.
    pub reqid: String,

    /// Bucket holding the staged page images.
    #[serde(default)]
    pub bucket: String,

    /// Pages to OCR, in catalog order.
    #[serde(default)]
    pub pages: Vec<PageDescriptor>,
}

/// One page of a [`WorkflowRequest`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct PageDescriptor {
    /// Page PID.
    #[serde(rename = "p")]
    pub pid: String,

    /// Staged image filename, relative to the request's staging prefix.
    #[serde(rename = "f")]
    pub filename: String,
}

impl WorkflowRequest {
    /// Build the compute task input for one of our pages, at full scale.
    pub fn task_input_for(&self, page: &PageDescriptor) -> TaskInput {
        TaskInput {
            lang: self.lang.clone(),
            scale: FULL_SCALE,
            bucket: self.bucket.clone(),
            key: staged_key(&self.reqid, &page.filename),
            parent_pid: self.pid.clone(),
            pid: page.pid.clone(),
        }
    }
}

/// The object key a page image is staged under.
pub fn staged_key(reqid: &str, filename: &str) -> String {
    format!("requests/{reqid}/{filename}")
}

/// Encode a workflow request for use as a workflow input.
pub fn encode_workflow_input(request: &WorkflowRequest) -> Result<String> {
    let json =
        serde_json::to_string(request).context("failed to serialize workflow request")?;
    compress(&json)
}

/// Decode a workflow input. Accepts both compressed and raw JSON inputs.
pub fn decode_workflow_input(input: &str) -> Result<WorkflowRequest> {
    let json = decompress(input);
    serde_json::from_str(&json).context("failed to parse workflow request")
}

/// Gzip and base64-encode a string.
pub fn compress(s: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(s.as_bytes())
        .context("failed to gzip data")?;
    let bytes = encoder.finish().context("failed to finish gzip stream")?;
    Ok(BASE64.encode(bytes))
}

/// Reverse [`compress`]. If `s` isn't base64-encoded gzip data holding UTF-8
/// text, it is returned unchanged.
pub fn decompress(s: &str) -> String {
    let Ok(bytes) = BASE64.decode(s.trim()) else {
        return s.to_owned();
    };
    let mut decoded = String::new();
    match GzDecoder::new(&bytes[..]).read_to_string(&mut decoded) {
        Ok(_) => decoded,
        Err(err) => {
            trace!("input is not gzipped, using as-is: {err}");
            s.to_owned()
        }
    }
}

/// What each compute task receives.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct TaskInput {
    /// OCR language hint.
    pub lang: String,

    /// Image scale percentage, in `[MIN_SCALE, FULL_SCALE]`.
    #[serde(with = "scale_as_string")]
    pub scale: u32,

    /// Bucket holding the staged image.
    pub bucket: String,

    /// Key of the staged image.
    pub key: String,

    /// The metadata PID this page belongs to.
    #[serde(rename = "parentpid")]
    pub parent_pid: String,

    /// Page PID.
    pub pid: String,
}

impl TaskInput {
    /// Parse a task input.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse task input")
    }

    /// Serialize a task input.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize task input")
    }

    /// Return a copy of this input with the scale reduced by one step.
    pub fn with_reduced_scale(&self) -> Self {
        Self {
            scale: self.scale.saturating_sub(SCALE_STEP).max(MIN_SCALE),
            ..self.clone()
        }
    }
}

/// `scale` travels as a decimal string.
mod scale_as_string {
    use super::*;

    pub fn serialize<S>(scale: &u32, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&scale.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u32, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Be lenient and accept bare numbers too.
        match Value::deserialize(deserializer)? {
            Value::String(s) => s.trim().parse().map_err(de::Error::custom),
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| de::Error::custom(format!("invalid scale: {n}"))),
            other => Err(de::Error::custom(format!("invalid scale: {other}"))),
        }
    }
}

/// The payload a compute task returns on success.
#[derive(Debug, Deserialize)]
struct TaskResult {
    text: String,
}

/// Extract the OCR text from a task result.
///
/// The task returns a JSON string whose contents are themselves a JSON object,
/// so this takes two decodes.
pub fn decode_task_result(result: &str) -> Result<String> {
    let outer: Value =
        serde_json::from_str(result).context("task result is not valid JSON")?;
    let parsed: TaskResult = match outer {
        Value::String(inner) => serde_json::from_str(&inner)
            .context("task result string does not hold an OCR result")?,
        obj @ Value::Object(_) => serde_json::from_value(obj)
            .context("task result object is not an OCR result")?,
        other => return Err(anyhow!("unexpected task result: {other}")),
    };
    Ok(parsed.text)
}

/// Failure details reported by a compute task.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailureDetails {
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl TaskFailureDetails {
    /// Parse failure details, tolerating missing or malformed input.
    pub fn parse(details: Option<&str>) -> Self {
        details
            .and_then(|d| serde_json::from_str(d).ok())
            .unwrap_or_default()
    }

    /// A one-line summary for logging.
    pub fn summary(&self) -> String {
        match (&self.error_type, &self.error_message) {
            (Some(t), Some(m)) => format!("{t}: {m}"),
            (None, Some(m)) => m.clone(),
            (Some(t), None) => t.clone(),
            (None, None) => "unknown error".to_owned(),
        }
    }
}
