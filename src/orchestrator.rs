use crate::cache_key::CacheKey;
use crate::executor::GenerationJob;
use crate::format::{FormatHint, sniff_extension};
use crate::jobs::Admission;
use crate::locator::{QueryPairs, ResolvedLocator, resolve_locator};
use crate::state::AppState;
use crate::storage::{StorageError, StoredObject};
use crate::transform::{TransformSpec, resolve_transform};
use tracing::{debug, info, warn};

const EXT_QUERY_PARAM: &str = "ext";

pub struct MediaRequest {
    pub transformation: String,
    pub locator: String,
    pub query: QueryPairs,
    pub accept: String,
}

pub enum Outcome {
    Forbidden,
    /// Send the caller to the original. `cache_miss` marks redirects issued
    /// while a generation job may be running.
    Redirect {
        location: String,
        cache_miss: bool,
    },
    Cached {
        object: StoredObject,
        format: FormatHint,
    },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatPlan {
    pub target: FormatHint,
    pub source: FormatHint,
}

/// Resolves one media request into a response decision. Never waits for
/// generation: a miss schedules a job and redirects in the same call.
pub async fn serve_media(state: &AppState, request: MediaRequest) -> Outcome {
    let resolved = resolve_locator(&request.locator, request.query, &request.accept);
    if !state.allow_list.is_allowed(&resolved.url) {
        debug!(url = %resolved.url, "source url rejected by allow list");
        return Outcome::Forbidden;
    }

    let requested_url = resolved.requested_url();
    let Some(transform) = resolve_transform(
        &request.transformation,
        state.presets(),
        state.config.allow_custom_transformations,
    ) else {
        debug!(transformation = %request.transformation, "no transformation resolved");
        return passthrough(requested_url);
    };
    let Some(formats) = plan_formats(&resolved, &transform) else {
        debug!(url = %requested_url, "unsupported image format");
        return passthrough(requested_url);
    };

    let key = CacheKey::derive(
        &transform,
        resolved.scale,
        resolved.cast.as_deref(),
        &requested_url,
    );
    let object_name = key.object_name(formats.target.extension());
    match state.store.exists(&object_name).await {
        Ok(true) => match state.store.read(&object_name).await {
            Ok(object) => {
                return Outcome::Cached {
                    object,
                    format: formats.target,
                };
            }
            Err(StorageError::NotFound(_)) => {
                debug!(object = %object_name, "cached object vanished before read");
            }
            Err(err) => {
                warn!(object = %object_name, error = %err, "cached object read failed");
                return Outcome::Failed;
            }
        },
        Ok(false) => {}
        Err(err) => {
            warn!(object = %object_name, error = %err, "storage existence check failed");
            return Outcome::Failed;
        }
    }

    let job = GenerationJob {
        key,
        source_url: requested_url.clone(),
        object_name,
        target: formats.target,
        source_format: formats.source,
        transform,
        scale: resolved.scale,
    };
    schedule(state, job);
    Outcome::Redirect {
        location: requested_url,
        cache_miss: true,
    }
}

fn passthrough(location: String) -> Outcome {
    Outcome::Redirect {
        location,
        cache_miss: false,
    }
}

/// Over-capacity and duplicate admissions are dropped; the caller already
/// has the redirect and the next request for the key retries.
fn schedule(state: &AppState, job: GenerationJob) {
    let key = job.key.clone();
    let source = job.source_url.clone();
    let executor = state.executor.clone();
    match state.jobs.try_admit(key.clone(), executor.execute(job)) {
        Admission::Started => info!(key = %key, source = %source, "transform job started"),
        Admission::AlreadyRunning => debug!(key = %key, "transform job already running"),
        Admission::AtCapacity => debug!(
            key = %key,
            capacity = state.jobs.capacity(),
            "transform job declined at capacity"
        ),
    }
}

/// Output format precedence: honoured cast, then the transform's `o`, then
/// the `ext` query parameter, then the source extension. `None` when either
/// side falls outside the supported set.
pub fn plan_formats(resolved: &ResolvedLocator, transform: &TransformSpec) -> Option<FormatPlan> {
    let source = match sniff_extension(&resolved.url) {
        Some(ext) => FormatHint::parse(&ext)?,
        None => FormatHint::Unknown,
    };
    let target = if let Some(cast) = &resolved.cast {
        FormatHint::parse(cast)?
    } else if let Some(output) = transform.output {
        FormatHint::Known(output)
    } else if let Some(ext) = resolved.query_param(EXT_QUERY_PARAM) {
        FormatHint::parse(ext)?
    } else {
        source
    };
    Some(FormatPlan { target, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RasterCodec;
    use crate::config::Config;
    use crate::fetch::testing::StaticFetcher;
    use crate::format::OutputFormat;
    use crate::storage::{BlobStore, MemoryBlobStore};
    use crate::transform::PresetTable;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;

    fn config() -> Config {
        let mut presets = PresetTable::default();
        presets.insert("thumb", "w:100,h:100");
        Config {
            presets,
            ..Config::default()
        }
    }

    fn state_with(config: Config, store: Arc<dyn BlobStore>) -> AppState {
        AppState::new(
            config,
            store,
            Arc::new(StaticFetcher::default()),
            Arc::new(RasterCodec::new(1_000_000)),
        )
        .unwrap()
    }

    fn request(transformation: &str, locator: &str) -> MediaRequest {
        MediaRequest {
            transformation: transformation.to_string(),
            locator: locator.to_string(),
            query: Vec::new(),
            accept: String::new(),
        }
    }

    fn locator(url: &str, cast: Option<&str>, query: &[(&str, &str)]) -> ResolvedLocator {
        ResolvedLocator {
            url: url.to_string(),
            query: query
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            scale: 1,
            cast: cast.map(str::to_string),
        }
    }

    fn redirect_location(outcome: Outcome) -> (String, bool) {
        match outcome {
            Outcome::Redirect {
                location,
                cache_miss,
            } => (location, cache_miss),
            _ => panic!("expected redirect"),
        }
    }

    /// Reports every object as present but fails reads in a chosen way.
    struct RacingStore {
        read_error: fn(&str) -> StorageError,
    }

    #[async_trait]
    impl BlobStore for RacingStore {
        async fn exists(&self, _name: &str) -> Result<bool, StorageError> {
            Ok(true)
        }

        async fn read(&self, name: &str) -> Result<StoredObject, StorageError> {
            Err((self.read_error)(name))
        }

        async fn write(&self, _: &str, _: Bytes, _: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn backend(&self) -> &'static str {
            "racing"
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl BlobStore for BrokenStore {
        async fn exists(&self, _name: &str) -> Result<bool, StorageError> {
            Err(StorageError::Backend("connection reset".to_string()))
        }

        async fn read(&self, name: &str) -> Result<StoredObject, StorageError> {
            Err(StorageError::NotFound(name.to_string()))
        }

        async fn write(&self, _: &str, _: Bytes, _: &str) -> Result<(), StorageError> {
            Ok(())
        }

        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn format_precedence() {
        let plain = TransformSpec::parse("w:10");
        let forced = TransformSpec::parse("w:10,o:avif");
        let jpg = "https://example.com/a.jpg";

        let plan = plan_formats(&locator(jpg, None, &[]), &plain).unwrap();
        assert_eq!(plan.target, FormatHint::Known(OutputFormat::Jpeg));
        assert_eq!(plan.source, FormatHint::Known(OutputFormat::Jpeg));

        let plan = plan_formats(&locator(jpg, None, &[("ext", "png")]), &plain).unwrap();
        assert_eq!(plan.target, FormatHint::Known(OutputFormat::Png));

        let plan = plan_formats(&locator(jpg, None, &[("ext", "png")]), &forced).unwrap();
        assert_eq!(plan.target, FormatHint::Known(OutputFormat::Avif));

        let plan = plan_formats(&locator(jpg, Some("webp"), &[]), &forced).unwrap();
        assert_eq!(plan.target, FormatHint::Known(OutputFormat::Webp));
    }

    #[test]
    fn unsupported_formats_are_rejected() {
        let plain = TransformSpec::parse("w:10");
        assert!(plan_formats(&locator("https://e.test/a.bmp", None, &[]), &plain).is_none());
        assert!(
            plan_formats(&locator("https://e.test/a.png", None, &[("ext", "tiff")]), &plain)
                .is_none()
        );
        let plan = plan_formats(&locator("https://e.test/image", None, &[]), &plain).unwrap();
        assert_eq!(plan.source, FormatHint::Unknown);
        assert_eq!(plan.target, FormatHint::Unknown);
    }

    #[tokio::test]
    async fn disallowed_url_is_forbidden() {
        let state = state_with(
            Config {
                allowed_urls: Some(vec!["https://cdn.test/*".to_string()]),
                ..config()
            },
            Arc::new(BrokenStore),
        );
        let outcome = serve_media(&state, request("thumb", "https://evil.test/a.jpg")).await;
        assert!(matches!(outcome, Outcome::Forbidden));
    }

    #[tokio::test]
    async fn unknown_preset_redirects_to_original_with_query() {
        let state = state_with(config(), Arc::new(BrokenStore));
        let mut req = request("huge", "https://example.com/a.jpg");
        req.query = vec![("v".to_string(), "3".to_string())];
        let (location, cache_miss) = redirect_location(serve_media(&state, req).await);
        assert_eq!(location, "https://example.com/a.jpg?v=3");
        assert!(!cache_miss);
        assert_eq!(state.jobs.running(), 0);
    }

    #[tokio::test]
    async fn custom_descriptor_needs_opt_in() {
        let store = Arc::new(MemoryBlobStore::new());
        let state = state_with(config(), store.clone());
        let (_, cache_miss) =
            redirect_location(serve_media(&state, request("w:50", "https://e.test/a.png")).await);
        assert!(!cache_miss);

        let state = state_with(
            Config {
                allow_custom_transformations: true,
                ..config()
            },
            store,
        );
        let (_, cache_miss) =
            redirect_location(serve_media(&state, request("w:50", "https://e.test/a.png")).await);
        assert!(cache_miss);
    }

    #[tokio::test]
    async fn miss_admits_one_job_per_key() {
        let state = state_with(
            Config {
                max_parallel_transformations: 4,
                ..config()
            },
            Arc::new(MemoryBlobStore::new()),
        );
        for _ in 0..3 {
            let outcome = serve_media(&state, request("thumb", "https://e.test/a.jpg")).await;
            let (location, cache_miss) = redirect_location(outcome);
            assert_eq!(location, "https://e.test/a.jpg");
            assert!(cache_miss);
        }
        assert!(state.jobs.running() <= 1);
    }

    #[tokio::test]
    async fn vanished_object_is_treated_as_miss() {
        let state = state_with(
            config(),
            Arc::new(RacingStore {
                read_error: |name| StorageError::NotFound(name.to_string()),
            }),
        );
        let (_, cache_miss) =
            redirect_location(serve_media(&state, request("thumb", "https://e.test/a.jpg")).await);
        assert!(cache_miss);
    }

    #[tokio::test]
    async fn storage_errors_fail_the_request() {
        let state = state_with(config(), Arc::new(BrokenStore));
        let outcome = serve_media(&state, request("thumb", "https://e.test/a.jpg")).await;
        assert!(matches!(outcome, Outcome::Failed));

        let state = state_with(
            config(),
            Arc::new(RacingStore {
                read_error: |_| StorageError::Backend("timeout".to_string()),
            }),
        );
        let outcome = serve_media(&state, request("thumb", "https://e.test/a.jpg")).await;
        assert!(matches!(outcome, Outcome::Failed));
    }

    #[tokio::test]
    async fn cached_object_is_served_with_planned_format() {
        let store = Arc::new(MemoryBlobStore::new());
        let transform = TransformSpec::parse("w:100,h:100");
        let key = CacheKey::derive(&transform, 1, None, "https://e.test/a.jpg");
        store
            .write(&key.object_name("jpeg"), Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .unwrap();
        let state = state_with(config(), store);
        match serve_media(&state, request("thumb", "https://e.test/a.jpg")).await {
            Outcome::Cached { object, format } => {
                assert_eq!(format, FormatHint::Known(OutputFormat::Jpeg));
                assert_eq!(object.content_length, Some(4));
            }
            _ => panic!("expected cache hit"),
        }
        assert_eq!(state.jobs.running(), 0);
    }
}
