//! Local bookkeeping for OCR requests.
//!
//! The workflow service owns workflow state. This store only remembers who
//! asked for what, so we know whom to notify and can answer status queries.
//! Each request is one JSON file, and writes to a request are serialized.

use std::{
    hash::{DefaultHasher, Hash as _, Hasher as _},
    time::Duration,
};

use chrono::{DateTime, Local, Utc};
use tokio::{fs, sync::Mutex as AsyncMutex};
use uuid::Uuid;

use crate::prelude::*;

/// How long a request may sit between being started and being enqueued
/// before we stop treating it as in progress.
pub const STALE_AFTER: Duration = Duration::from_secs(3600);

/// Timestamp format used in callbacks.
pub const CALLBACK_TIME_FORMAT: &str = "%Y-%m-%d %I:%M:%S %p";

/// Someone waiting for a request to finish.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Recipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl Recipient {
    /// Build a recipient from optional query parameters, ignoring blanks.
    pub fn new(email: Option<&str>, callback: Option<&str>) -> Self {
        let clean = |s: Option<&str>| {
            s.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        Self {
            email: clean(email),
            callback: clean(callback),
        }
    }

    /// Is there anyone to notify?
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.callback.is_none()
    }
}

/// How a request ended.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Everything we remember about a request.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub reqid: String,
    pub pid: String,
    #[serde(default)]
    pub title: String,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub enqueued: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub uploaded: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

impl RequestRecord {
    /// Is this request still running, as of `now`?
    pub fn is_in_progress(&self, now: DateTime<Utc>) -> bool {
        if self.finished.is_some() {
            return false;
        }
        if self.enqueued.is_some() {
            return true;
        }
        let age = now.signed_duration_since(self.started);
        age.to_std().map(|age| age < STALE_AFTER).unwrap_or(true)
    }

    /// Progress as a percentage string. Uploading and OCR each count for
    /// half.
    pub fn progress(&self) -> Option<String> {
        if self.total == 0 {
            return None;
        }
        let done = (self.uploaded + self.completed).min(2 * self.total);
        Some(format!("{}%", done * 100 / (2 * self.total)))
    }

    /// Format a timestamp the way callbacks expect.
    pub fn format_time(time: Option<DateTime<Utc>>) -> String {
        time.map(|t| {
            t.with_timezone(&Local)
                .format(CALLBACK_TIME_FORMAT)
                .to_string()
        })
        .unwrap_or_default()
    }
}

/// Number of lock stripes serializing request writes.
const LOCK_STRIPES: usize = 64;

/// A directory of request records.
pub struct RequestStore {
    root: PathBuf,
    /// Writes to a request hold the stripe its ID hashes to.
    locks: Vec<AsyncMutex<()>>,
}

impl RequestStore {
    /// Open a store rooted at `root`, creating directories as needed.
    pub async fn open(root: &Path) -> Result<Self> {
        for dir in ["requests", "pids", "work"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .await
                .with_context(|| format!("could not create {}", path.display()))?;
        }
        Ok(Self {
            root: root.to_owned(),
            locks: (0..LOCK_STRIPES).map(|_| AsyncMutex::new(())).collect(),
        })
    }

    fn record_path(&self, reqid: &str) -> PathBuf {
        self.root.join("requests").join(format!("{reqid}.json"))
    }

    fn pid_path(&self, pid: &str) -> PathBuf {
        self.root.join("pids").join(sanitize(pid))
    }

    /// The working directory for a request's output.
    pub fn workdir(&self, reqid: &str) -> PathBuf {
        self.root.join("work").join(reqid)
    }

    fn lock_for(&self, reqid: &str) -> &AsyncMutex<()> {
        let mut hasher = DefaultHasher::new();
        reqid.hash(&mut hasher);
        &self.locks[(hasher.finish() % LOCK_STRIPES as u64) as usize]
    }

    /// Start tracking a new request for `pid`, and make it the pid's active
    /// request.
    #[instrument(level = "debug", skip(self, recipient))]
    pub async fn create(
        &self,
        pid: &str,
        title: &str,
        recipient: Recipient,
    ) -> Result<RequestRecord> {
        let record = RequestRecord {
            reqid: Uuid::new_v4().simple().to_string(),
            pid: pid.to_owned(),
            title: title.to_owned(),
            started: Utc::now(),
            enqueued: None,
            finished: None,
            total: 0,
            uploaded: 0,
            completed: 0,
            recipients: if recipient.is_empty() {
                vec![]
            } else {
                vec![recipient]
            },
            outcome: None,
        };
        self.write(&record).await?;
        write_atomically(&self.pid_path(pid), record.reqid.as_bytes()).await?;
        debug!(reqid = %record.reqid, "Created request");
        Ok(record)
    }

    /// Load a request, if we have it.
    pub async fn load(&self, reqid: &str) -> Result<Option<RequestRecord>> {
        let path = self.record_path(reqid);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("could not read {}", path.display()));
            }
        };
        let record = serde_json::from_slice(&data)
            .with_context(|| format!("could not parse {}", path.display()))?;
        Ok(Some(record))
    }

    /// The most recent request for `pid`, if any.
    pub async fn latest_for_pid(&self, pid: &str) -> Result<Option<RequestRecord>> {
        let path = self.pid_path(pid);
        let reqid = match fs::read_to_string(&path).await {
            Ok(reqid) => reqid,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("could not read {}", path.display()));
            }
        };
        self.load(reqid.trim()).await
    }

    /// The request for `pid` that is still running, if any.
    pub async fn in_progress(&self, pid: &str) -> Result<Option<RequestRecord>> {
        let now = Utc::now();
        Ok(self
            .latest_for_pid(pid)
            .await?
            .filter(|record| record.is_in_progress(now)))
    }

    /// Apply `change` to a request under its lock, and save it.
    pub async fn update<F>(&self, reqid: &str, change: F) -> Result<RequestRecord>
    where
        F: FnOnce(&mut RequestRecord),
    {
        let lock = self.lock_for(reqid);
        let _guard = lock.lock().await;
        let mut record = self
            .load(reqid)
            .await?
            .ok_or_else(|| anyhow!("unknown request {reqid}"))?;
        change(&mut record);
        self.write(&record).await?;
        Ok(record)
    }

    /// Add someone to a request's notification list.
    pub async fn add_recipient(&self, reqid: &str, recipient: Recipient) -> Result<()> {
        if recipient.is_empty() {
            return Ok(());
        }
        self.update(reqid, |record| {
            if !record.recipients.contains(&recipient) {
                record.recipients.push(recipient);
            }
        })
        .await?;
        Ok(())
    }

    /// Record the page count before staging starts.
    pub async fn set_total(&self, reqid: &str, total: usize) -> Result<()> {
        self.update(reqid, |record| record.total = total).await?;
        Ok(())
    }

    /// Count one more uploaded page.
    pub async fn record_upload(&self, reqid: &str) -> Result<()> {
        self.update(reqid, |record| record.uploaded += 1).await?;
        Ok(())
    }

    /// Note that the workflow has been started.
    pub async fn mark_enqueued(&self, reqid: &str) -> Result<()> {
        self.update(reqid, |record| record.enqueued = Some(Utc::now()))
            .await?;
        Ok(())
    }

    /// Record how many pages have OCR text.
    pub async fn set_completed(&self, reqid: &str, completed: usize) -> Result<()> {
        self.update(reqid, |record| record.completed = completed)
            .await?;
        Ok(())
    }

    /// Claim the right to deliver `outcome` for a request. Returns the record
    /// the first time it's called for a request, and `None` afterwards, so
    /// that replayed terminal decisions don't notify anyone twice.
    pub async fn claim_outcome(
        &self,
        reqid: &str,
        outcome: Outcome,
    ) -> Result<Option<RequestRecord>> {
        let mut claimed = false;
        let record = self
            .update(reqid, |record| {
                if record.outcome.is_none() {
                    record.outcome = Some(outcome);
                    record.finished = Some(Utc::now());
                    claimed = true;
                }
            })
            .await?;
        Ok(claimed.then_some(record))
    }

    async fn write(&self, record: &RequestRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record).context("could not serialize request")?;
        write_atomically(&self.record_path(&record.reqid), &json).await
    }
}

/// Write a file by renaming a temporary file into place.
async fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)
        .await
        .with_context(|| format!("could not write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("could not rename {} into place", tmp.display()))
}

/// PIDs look like `uva-lib:1234`. Keep them safe for use as file names.
fn sanitize(pid: &str) -> String {
    pid.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
