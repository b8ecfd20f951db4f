//! AWS-related code shared by different modules.

use aws_config::BehaviorVersion;

use crate::prelude::*;

/// Load the user's AWS configuration using standard conventions.
pub async fn load_aws_config() -> Result<aws_config::SdkConfig> {
    Ok(aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await)
}

/// An S3 client for staging page images.
pub async fn s3_client() -> Result<aws_sdk_s3::Client> {
    let config = load_aws_config().await?;
    Ok(aws_sdk_s3::Client::new(&config))
}

/// An SWF client for polling decisions and starting workflows.
pub async fn swf_client() -> Result<aws_sdk_swf::Client> {
    let config = load_aws_config().await?;
    Ok(aws_sdk_swf::Client::new(&config))
}
