//! Service configuration.
//!
//! Everything can be set with a command-line flag or an `OCRWS_*` environment
//! variable, and environment variables may come from a `.env` file.

use clap::Args;

use crate::{decider::RetryPolicy, prelude::*};

/// Placeholder in the IIIF URL template that is replaced with a page PID.
pub const PID_PLACEHOLDER: &str = "{PID}";

/// Options shared by every subcommand that runs part of the service.
#[derive(Args, Clone, Debug)]
pub struct ServiceOpts {
    /// Port for the HTTP API.
    #[clap(long, env = "OCRWS_LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,

    /// Directory for request records and OCR output.
    #[clap(long, env = "OCRWS_STORAGE_DIR", default_value = "./storage")]
    pub storage_dir: PathBuf,

    /// Directory of archival master images, checked before IIIF.
    #[clap(long, env = "OCRWS_ARCHIVE_DIR", default_value = "./archive")]
    pub archive_dir: PathBuf,

    /// Maximum attempts per page. Values below 1 are treated as 1.
    #[clap(
        long,
        env = "OCRWS_MAX_ATTEMPTS",
        default_value_t = 3,
        allow_negative_numbers = true
    )]
    pub max_attempts: i64,

    /// Number of concurrent image uploads. 0 means one per CPU.
    #[clap(long, env = "OCRWS_CONCURRENT_UPLOADS", default_value = "0")]
    pub concurrent_uploads: String,

    /// IIIF image URL template. Must contain `{PID}`.
    #[clap(
        long,
        env = "OCRWS_IIIF_URL_TEMPLATE",
        default_value = "https://iiif.lib.virginia.edu/iiif/{PID}/full/full/0/default.jpg"
    )]
    pub iiif_url_template: String,

    /// Base URL of the metadata service.
    #[clap(
        long,
        env = "OCRWS_METADATA_URL",
        default_value = "http://localhost:8085"
    )]
    pub metadata_url: String,

    /// Key for writing OCR text to the metadata service.
    #[clap(long, env = "OCRWS_METADATA_KEY", default_value = "", hide_env_values = true)]
    pub metadata_key: String,

    /// Never write to the metadata service.
    #[clap(long, env = "OCRWS_METADATA_READ_ONLY")]
    pub metadata_read_only: bool,

    /// SMTP relay host.
    #[clap(long, env = "OCRWS_SMTP_HOST", default_value = "localhost")]
    pub smtp_host: String,

    /// SMTP relay port.
    #[clap(long, env = "OCRWS_SMTP_PORT", default_value_t = 25)]
    pub smtp_port: u16,

    /// Sender address for notification emails.
    #[clap(long, env = "OCRWS_SMTP_SENDER", default_value = "no-reply@virginia.edu")]
    pub smtp_sender: String,

    /// Don't talk to the workflow service at all.
    #[clap(long, env = "OCRWS_WORKFLOW_DISABLED")]
    pub workflow_disabled: bool,

    /// Workflow domain.
    #[clap(long, env = "OCRWS_WORKFLOW_DOMAIN", default_value = "ocr")]
    pub workflow_domain: String,

    /// Decision task lists to poll, comma-separated. The first one is used
    /// when starting workflows.
    #[clap(
        long,
        env = "OCRWS_TASK_LISTS",
        value_delimiter = ',',
        default_value = "ocr-decisions"
    )]
    pub task_lists: Vec<String>,

    /// Workflow type name.
    #[clap(long, env = "OCRWS_WORKFLOW_TYPE", default_value = "ocr-workflow")]
    pub workflow_type: String,

    /// Workflow type version.
    #[clap(long, env = "OCRWS_WORKFLOW_VERSION", default_value = "1")]
    pub workflow_version: String,

    /// Workflow execution timeout, in seconds.
    #[clap(long, env = "OCRWS_WORKFLOW_TIMEOUT", default_value_t = 86_400)]
    pub workflow_timeout: u64,

    /// Decision task timeout, in seconds.
    #[clap(long, env = "OCRWS_DECISION_TIMEOUT", default_value_t = 60)]
    pub decision_timeout: u64,

    /// Compute function that OCRs a single page.
    #[clap(long, env = "OCRWS_LAMBDA_FUNCTION", default_value = "ocr-page")]
    pub lambda_function: String,

    /// Start-to-close timeout for each page, in seconds.
    #[clap(long, env = "OCRWS_LAMBDA_TIMEOUT", default_value_t = 900)]
    pub lambda_timeout: u64,

    /// IAM role the workflow uses to invoke the compute function.
    #[clap(long, env = "OCRWS_LAMBDA_ROLE")]
    pub lambda_role: Option<String>,

    /// Bucket for staged page images.
    #[clap(long, env = "OCRWS_BUCKET", default_value = "ocr-staging")]
    pub bucket: String,
}

impl ServiceOpts {
    /// Check options that clap can't check for us.
    pub fn validate(&self) -> Result<()> {
        if !self.iiif_url_template.contains(PID_PLACEHOLDER) {
            return Err(anyhow!(
                "IIIF URL template {:?} does not contain {PID_PLACEHOLDER}",
                self.iiif_url_template
            ));
        }
        if self.task_lists.iter().all(|t| t.trim().is_empty()) {
            return Err(anyhow!("at least one task list is required"));
        }
        Ok(())
    }

    /// The retry policy for pages.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    /// How many uploads to run at once.
    pub fn upload_workers(&self) -> usize {
        parse_worker_count(&self.concurrent_uploads)
    }

    /// The task lists to poll, with blanks removed.
    pub fn task_lists(&self) -> Vec<String> {
        self.task_lists
            .iter()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// The task list new workflows are started on.
    pub fn start_task_list(&self) -> Option<String> {
        self.task_lists().into_iter().next()
    }
}

/// Parse a worker count. `0` means one per CPU, and anything unparsable
/// means 1.
pub fn parse_worker_count(value: &str) -> usize {
    match value.trim().parse::<usize>() {
        Ok(0) => num_cpus::get(),
        Ok(n) => n,
        Err(_) => {
            warn!(value, "Unparsable worker count, using 1");
            1
        }
    }
}
