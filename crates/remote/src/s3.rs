//! S3 implementation of the remote tier
//!
//! One object per action: the object body is the output blob and the
//! `outputid` user-metadata field carries the action→output indirection,
//! so a lookup costs a single round trip.
//!
//! The SDK client must be constructed with retries disabled: the put body
//! is signed over its full length, and a retry after partial consumption
//! would resend a truncated payload.

use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use gostash_cache::{Error, RemoteCache, RemoteHit, Result};
use tracing::{debug, info};

/// User-metadata key carrying the OutputID on every cached object
const OUTPUT_ID_METADATA_KEY: &str = "outputid";

/// Remote tier backed by an S3 bucket
pub struct S3Remote {
    client: aws_sdk_s3::Client,
    config: S3Config,
}

impl S3Remote {
    /// Wrap a pre-configured SDK client.
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client, config: S3Config) -> Self {
        info!(
            bucket = %config.bucket,
            prefix = %config.key_prefix(),
            "remote cache configured to s3://{}/{}",
            config.bucket,
            config.key_prefix()
        );
        Self { client, config }
    }

    /// The key space this remote writes into
    #[must_use]
    pub fn config(&self) -> &S3Config {
        &self.config
    }
}

#[async_trait]
impl RemoteCache for S3Remote {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn get(&self, action_id: &str) -> Result<Option<RemoteHit>> {
        let key = self.config.object_key(action_id);
        let resp = match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) if treat_as_miss(err.code()) => {
                debug!(key = %key, "remote object not found");
                return Ok(None);
            }
            Err(err) => {
                return Err(Error::remote(format!(
                    "GetObject {key}: {}",
                    DisplayErrorContext(&err)
                )));
            }
        };

        let output_id = resp
            .metadata()
            .and_then(|m| m.get(OUTPUT_ID_METADATA_KEY))
            .cloned()
            .ok_or_else(|| {
                Error::remote(format!("object {key} is missing {OUTPUT_ID_METADATA_KEY} metadata"))
            })?;
        let size = u64::try_from(resp.content_length().unwrap_or_default()).unwrap_or(0);

        Ok(Some(RemoteHit {
            output_id,
            size,
            body: Box::new(resp.body.into_async_read()),
        }))
    }

    async fn put(&self, action_id: &str, output_id: &str, size: u64, body: Bytes) -> Result<()> {
        if self.config.should_skip_put(size) {
            debug!(action = action_id, "skipping zero-byte remote put");
            return Ok(());
        }
        let key = self.config.object_key(action_id);
        // The body is already fully in memory, so the SDK can compute the
        // signature without re-reading anything.
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .metadata(OUTPUT_ID_METADATA_KEY, output_id)
            .content_length(size as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                Error::remote(format!("PutObject {key}: {}", DisplayErrorContext(&err)))
            })?;
        debug!(key = %key, bytes = size, "remote put complete");
        Ok(())
    }
}

/// Service codes equivalent to "not cached".
///
/// Buckets without list permission answer missing keys with
/// `AccessDenied`, so that code is a miss too. `SignatureDoesNotMatch`
/// is deliberately not here: it means misconfigured credentials, not
/// absence, and has to surface as an error.
fn treat_as_miss(code: Option<&str>) -> bool {
    matches!(code, Some("NoSuchKey" | "NotFound" | "AccessDenied"))
}
