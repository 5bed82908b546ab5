#![allow(clippy::collapsible_if)]

mod allowlist;
mod cache_key;
mod codec;
mod config;
mod executor;
mod fetch;
mod format;
mod http;
mod jobs;
mod locator;
mod orchestrator;
mod s3;
mod state;
mod storage;
mod transform;

use crate::codec::RasterCodec;
use crate::config::{Config, StorageConfig};
use crate::fetch::HttpFetcher;
use crate::s3::S3BlobStore;
use crate::state::AppState;
use crate::storage::{BlobStore, FsBlobStore, MemoryBlobStore};
use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    http::router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

async fn build_store(storage: &StorageConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    let store: Arc<dyn BlobStore> = match storage {
        StorageConfig::Filesystem { dir } => Arc::new(
            FsBlobStore::new(dir.clone())
                .await
                .with_context(|| format!("create storage dir {}", dir.display()))?,
        ),
        StorageConfig::Memory => Arc::new(MemoryBlobStore::new()),
        StorageConfig::S3(s3) => Arc::new(S3BlobStore::new(s3)),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        max_parallel_transformations = config.max_parallel_transformations,
        allow_custom_transformations = config.allow_custom_transformations,
        presets = ?config.presets.names(),
        job_timeout_secs = config.job_timeout.as_secs(),
        "startup config summary"
    );

    let store = build_store(&config.storage).await?;
    info!(backend = store.backend(), "storage ready");
    let fetcher = Arc::new(HttpFetcher::new(
        config.fetch_timeout,
        config.max_source_bytes,
    )?);
    let codec = Arc::new(RasterCodec::new(config.max_source_pixels));
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, store, fetcher, codec)?);
    if !state.allow_list.is_restricted() {
        info!("ALLOWED_URLS not set; every source url is allowed");
    }

    let app = build_app(state);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(address = %addr, "imgcache listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::StaticFetcher;
    use crate::storage::{StorageError, StoredObject};
    use crate::transform::PresetTable;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const SOURCE: &str = "https://example.com/a.jpg";

    /// Memory store that counts every call.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryBlobStore,
        operations: AtomicUsize,
    }

    impl CountingStore {
        fn operations(&self) -> usize {
            self.operations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BlobStore for CountingStore {
        async fn exists(&self, name: &str) -> Result<bool, StorageError> {
            self.operations.fetch_add(1, Ordering::SeqCst);
            self.inner.exists(name).await
        }

        async fn read(&self, name: &str) -> Result<StoredObject, StorageError> {
            self.operations.fetch_add(1, Ordering::SeqCst);
            self.inner.read(name).await
        }

        async fn write(
            &self,
            name: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> Result<(), StorageError> {
            self.operations.fetch_add(1, Ordering::SeqCst);
            self.inner.write(name, bytes, content_type).await
        }

        fn backend(&self) -> &'static str {
            "counting"
        }
    }

    struct Harness {
        app: Router,
        state: Arc<AppState>,
        store: Arc<CountingStore>,
        fetcher: Arc<StaticFetcher>,
    }

    fn jpeg_source() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([10, 120, 200])));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    fn test_config() -> Config {
        let mut presets = PresetTable::default();
        presets.insert("thumb", "w:100,h:100");
        Config {
            presets,
            storage: StorageConfig::Memory,
            ..Config::default()
        }
    }

    fn harness(config: Config) -> Harness {
        let store = Arc::new(CountingStore::default());
        let fetcher = Arc::new(StaticFetcher::default().with(
            SOURCE,
            jpeg_source(),
            Some("image/jpeg"),
        ));
        let state = Arc::new(
            AppState::new(
                config,
                store.clone(),
                fetcher.clone(),
                Arc::new(RasterCodec::new(10_000_000)),
            )
            .unwrap(),
        );
        Harness {
            app: build_app(state.clone()),
            state,
            store,
            fetcher,
        }
    }

    async fn get(app: &Router, uri: &str) -> axum::response::Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn wait_for_object(store: &CountingStore) -> String {
        for _ in 0..500 {
            if let Some(name) = store.inner.names().into_iter().next() {
                return name;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transformed object never appeared");
    }

    #[tokio::test]
    async fn miss_redirects_then_hit_streams_cached_bytes() {
        let h = harness(test_config());
        let response = get(&h.app, "/thumb/https://example.com/a.jpg").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], SOURCE);
        assert_eq!(response.headers()["X-Cache"], "MISS");

        let name = wait_for_object(&h.store).await;
        assert!(name.ends_with(".jpeg"));
        let (bytes, content_type) = h.store.inner.get(&name).unwrap();
        assert_eq!(content_type, "image/jpeg");
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert!(decoded.width() <= 100 && decoded.height() <= 100);

        for _ in 0..100 {
            if h.state.jobs.running() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let response = get(&h.app, "/thumb/https://example.com/a.jpg").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "public, max-age=31536000"
        );
        assert_eq!(response.headers()["X-Cache"], "HIT");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, bytes);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.state.jobs.running(), 0);
    }

    #[tokio::test]
    async fn disallowed_url_is_rejected_without_storage_access() {
        let h = harness(Config {
            allowed_urls: Some(vec!["https://cdn.example.com/*".to_string()]),
            ..test_config()
        });
        let response = get(&h.app, "/thumb/https://example.com/a.jpg").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"URL is not allowed");
        assert_eq!(h.store.operations(), 0);
    }

    #[tokio::test]
    async fn unsupported_extension_redirects_without_job() {
        let h = harness(test_config());
        let response = get(&h.app, "/thumb/https://example.com/legacy.bmp").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.com/legacy.bmp"
        );
        assert!(response.headers().get("X-Cache").is_none());
        assert_eq!(h.state.jobs.running(), 0);
        assert_eq!(h.store.operations(), 0);
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_preset_redirects_to_original() {
        let h = harness(test_config());
        let response = get(&h.app, "/giant/https://example.com/a.jpg?v=2").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.com/a.jpg?v=2"
        );
        assert_eq!(h.store.operations(), 0);
    }

    #[tokio::test]
    async fn encoded_locator_with_scale_redirects_to_decoded_url() {
        let h = harness(test_config());
        let encoded = STANDARD.encode("2x/https://example.com/a.jpg?v=1");
        let response = get(&h.app, &format!("/thumb/b64:{encoded}")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.com/a.jpg?v=1"
        );
    }

    #[tokio::test]
    async fn health_and_status_endpoints() {
        let h = harness(test_config());
        let response = get(&h.app, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = get(&h.app, "/status").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["jobs"]["capacity"], 10);
        assert_eq!(status["presets"], 1);
        assert_eq!(status["custom_transformations"], false);
    }

    #[tokio::test]
    async fn build_store_honours_backend_selection() {
        let dir = tempdir().unwrap();
        let store = build_store(&StorageConfig::Filesystem {
            dir: dir.path().join("cache"),
        })
        .await
        .unwrap();
        assert_eq!(store.backend(), "fs");
        assert!(dir.path().join("cache").is_dir());

        let store = build_store(&StorageConfig::Memory).await.unwrap();
        assert_eq!(store.backend(), "memory");
    }
}
