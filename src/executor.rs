use crate::cache_key::CacheKey;
use crate::codec::{CodecRequest, ImageCodec};
use crate::fetch::SourceFetcher;
use crate::format::{FormatHint, OutputFormat};
use crate::storage::BlobStore;
use crate::transform::TransformSpec;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything a background run needs, resolved at request time.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub key: CacheKey,
    pub source_url: String,
    pub object_name: String,
    pub target: FormatHint,
    pub source_format: FormatHint,
    pub transform: TransformSpec,
    pub scale: u8,
}

/// Fetch, transform and store one cache object.
#[derive(Clone)]
pub struct TransformExecutor {
    fetcher: Arc<dyn SourceFetcher>,
    codec: Arc<dyn ImageCodec>,
    store: Arc<dyn BlobStore>,
}

impl TransformExecutor {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        codec: Arc<dyn ImageCodec>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            fetcher,
            codec,
            store,
        }
    }

    /// Runs the job and logs the outcome. Errors end here; the caller was
    /// answered before the job started.
    pub async fn execute(self, job: GenerationJob) {
        let started = Instant::now();
        match self.run(&job).await {
            Ok(format) => info!(
                key = %job.key,
                object = %job.object_name,
                format = format.extension(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "transformed image stored"
            ),
            Err(err) => warn!(
                key = %job.key,
                source = %job.source_url,
                error = ?err,
                "transform job failed"
            ),
        }
    }

    pub async fn run(&self, job: &GenerationJob) -> Result<OutputFormat> {
        let source = self
            .fetcher
            .fetch(&job.source_url)
            .await
            .with_context(|| format!("fetch source {}", job.source_url))?;
        let origin_format = source
            .content_type
            .as_deref()
            .and_then(OutputFormat::from_content_type);
        let target = resolve_target_format(job.target, origin_format);
        let scale = u32::from(job.scale);
        let request = CodecRequest {
            source_format: job.source_format.known().or(origin_format),
            target,
            width: job.transform.width.map(|width| width.saturating_mul(scale)),
            height: job.transform.height.map(|height| height.saturating_mul(scale)),
            fit: job.transform.fit,
            position: job.transform.position.clone(),
            quality: job.transform.quality,
        };
        let output = self
            .codec
            .transform(source.bytes, request)
            .await
            .context("transform image")?;
        self.store
            .write(&job.object_name, output, target.mime())
            .await
            .with_context(|| format!("store {}", job.object_name))?;
        Ok(target)
    }
}

/// An "unknown" request-time format becomes whatever the origin declared,
/// or PNG when the origin declared nothing usable.
pub fn resolve_target_format(hint: FormatHint, origin: Option<OutputFormat>) -> OutputFormat {
    match hint {
        FormatHint::Known(format) => format,
        FormatHint::Unknown => origin.unwrap_or(OutputFormat::Png),
    }
}
