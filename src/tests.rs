//! Pipeline and HTTP tests driven through the trait seams with stub and
//! mock collaborators, so no Chrome process is needed.

use crate::{
    cache_key, router, AppState, BrowserPoolStats, Config, MemoryCache, MemoryRateLimiter,
    MockRateLimiter, MockRenderer, MockScreenshotCache, PoolHealth, RenderRequest, Renderer,
    ScreenshotCache, ScreenshotError, ScreenshotService,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

/// Renderer stub that counts invocations and optionally stalls, so tests
/// can observe coalescing and cache behavior.
struct CountingRenderer {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingRenderer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for CountingRenderer {
    async fn render(&self, _url: &str) -> Result<Vec<u8>, ScreenshotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(PNG_MAGIC.to_vec())
    }
}

fn test_config() -> Config {
    Config {
        rate_limit_window: Duration::from_secs(60),
        rate_limit_points: 10,
        cache_ttl: Duration::from_secs(60),
        ..Config::default()
    }
}

fn service_with(
    renderer: Arc<dyn Renderer>,
    config: &Config,
) -> (ScreenshotService, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new());
    let service = ScreenshotService::new(
        Arc::new(MemoryRateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_points,
        )),
        cache.clone(),
        renderer,
        config,
    );
    (service, cache)
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_short_circuits_the_pipeline() {
        let mut limiter = MockRateLimiter::new();
        limiter.expect_consume().times(0);
        let mut cache = MockScreenshotCache::new();
        cache.expect_get().times(0);
        cache.expect_put().times(0);
        let mut renderer = MockRenderer::new();
        renderer.expect_render().times(0);

        let service = ScreenshotService::new(
            Arc::new(limiter),
            Arc::new(cache),
            Arc::new(renderer),
            &test_config(),
        );

        let err = service
            .handle(&RenderRequest::new("ftp://example.com", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScreenshotError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn second_request_for_same_url_is_a_cache_hit() {
        let renderer = CountingRenderer::new();
        let (service, cache) = service_with(renderer.clone(), &test_config());

        let first = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap();
        assert!(!first.cache_hit);

        let second = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.data, second.data);
        assert_eq!(renderer.calls(), 1);

        // The key is the raw request string, not a normalized URL.
        let stored = cache
            .get(&cache_key("https://example.com"))
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn expired_cache_entry_triggers_a_fresh_render() {
        let config = Config {
            cache_ttl: Duration::from_millis(50),
            ..test_config()
        };
        let renderer = CountingRenderer::new();
        let (service, _) = service_with(renderer.clone(), &config);

        let first = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap();
        assert!(!first.cache_hit);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap();
        assert!(!second.cache_hit);
        assert_eq!(renderer.calls(), 2);
    }

    #[tokio::test]
    async fn caller_exceeding_budget_is_rejected_with_retry_hint() {
        let config = Config {
            rate_limit_points: 3,
            ..test_config()
        };
        let renderer = CountingRenderer::new();
        let (service, _) = service_with(renderer.clone(), &config);

        for _ in 0..3 {
            service
                .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
                .await
                .unwrap();
        }

        let err = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap_err();
        match err {
            ScreenshotError::RateLimited { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= config.rate_limit_window);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        // Budgets are per caller.
        service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cache_hits_still_consume_rate_limit_points() {
        let config = Config {
            rate_limit_points: 2,
            ..test_config()
        };
        let renderer = CountingRenderer::new();
        let (service, _) = service_with(renderer.clone(), &config);

        service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap();
        let hit = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap();
        assert!(hit.cache_hit);

        let err = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScreenshotError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn limiter_outage_denies_the_request() {
        let mut limiter = MockRateLimiter::new();
        limiter
            .expect_consume()
            .returning(|_| Err(ScreenshotError::LimiterUnavailable));
        let mut cache = MockScreenshotCache::new();
        cache.expect_get().times(0);
        let mut renderer = MockRenderer::new();
        renderer.expect_render().times(0);

        let service = ScreenshotService::new(
            Arc::new(limiter),
            Arc::new(cache),
            Arc::new(renderer),
            &test_config(),
        );

        let err = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScreenshotError::LimiterUnavailable));
    }

    #[tokio::test]
    async fn cache_store_outage_degrades_to_a_render() {
        let mut limiter = MockRateLimiter::new();
        limiter.expect_consume().returning(|_| Ok(()));
        let mut cache = MockScreenshotCache::new();
        cache
            .expect_get()
            .returning(|_| Err(ScreenshotError::CacheUnavailable("store down".to_string())));
        cache
            .expect_put()
            .returning(|_, _, _| Err(ScreenshotError::CacheUnavailable("store down".to_string())));
        let mut renderer = MockRenderer::new();
        renderer
            .expect_render()
            .times(1)
            .returning(|_| Ok(PNG_MAGIC.to_vec()));

        let service = ScreenshotService::new(
            Arc::new(limiter),
            Arc::new(cache),
            Arc::new(renderer),
            &test_config(),
        );

        // Neither the failed read nor the failed write surfaces to the
        // caller.
        let screenshot = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(screenshot.data, PNG_MAGIC.to_vec());
        assert!(!screenshot.cache_hit);
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_url_share_a_single_render() {
        let renderer = CountingRenderer::slow(Duration::from_millis(100));
        let (service, _) = service_with(renderer.clone(), &test_config());
        let service = Arc::new(service);

        let leader = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .handle(&RenderRequest::new("https://example.com/big", "10.0.0.1"))
                    .await
            })
        };

        // Let the leader register its in-flight entry before the second
        // request arrives.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.in_flight_renders(), 1);

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .handle(&RenderRequest::new("https://example.com/big", "10.0.0.2"))
                    .await
            })
        };

        let first = leader.await.unwrap().unwrap();
        let second = waiter.await.unwrap().unwrap();

        assert_eq!(renderer.calls(), 1);
        assert_eq!(first.data, second.data);
        assert_eq!(service.in_flight_renders(), 0);
    }

    #[tokio::test]
    async fn distinct_urls_render_independently() {
        let renderer = CountingRenderer::new();
        let (service, _) = service_with(renderer.clone(), &test_config());

        service
            .handle(&RenderRequest::new("https://example.com/a", "10.0.0.1"))
            .await
            .unwrap();
        service
            .handle(&RenderRequest::new("https://example.com/b", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(renderer.calls(), 2);
    }

    #[tokio::test]
    async fn render_failure_propagates_to_the_caller() {
        let mut limiter = MockRateLimiter::new();
        limiter.expect_consume().returning(|_| Ok(()));
        let mut cache = MockScreenshotCache::new();
        cache.expect_get().returning(|_| Ok(None));
        cache.expect_put().times(0);
        let mut renderer = MockRenderer::new();
        renderer
            .expect_render()
            .returning(|_| Err(ScreenshotError::RenderFailed("net::ERR_FAILED".to_string())));

        let service = ScreenshotService::new(
            Arc::new(limiter),
            Arc::new(cache),
            Arc::new(renderer),
            &test_config(),
        );

        let err = service
            .handle(&RenderRequest::new("https://example.com", "10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScreenshotError::RenderFailed(_)));
        // Failed renders must not leave a registry entry behind.
        assert_eq!(service.in_flight_renders(), 0);
    }
}

mod http_tests {
    use super::*;

    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use axum::Router;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    struct StaticPool;

    #[async_trait]
    impl PoolHealth for StaticPool {
        async fn stats(&self) -> BrowserPoolStats {
            BrowserPoolStats {
                total_instances: 2,
                idle_instances: 2,
                leased_instances: 0,
                total_captures: 0,
                restarts: 0,
            }
        }
    }

    fn test_app(config: &Config) -> (Router, Arc<MemoryCache>, Arc<CountingRenderer>) {
        let renderer = CountingRenderer::new();
        let (service, cache) = service_with(renderer.clone(), config);
        let app = router(AppState {
            service: Arc::new(service),
            pool: Arc::new(StaticPool),
        })
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))));
        (app, cache, renderer)
    }

    fn post_screenshot(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/screenshot")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn post_screenshot_returns_a_png_data_url() {
        let (app, cache, renderer) = test_app(&test_config());

        let response = app
            .clone()
            .oneshot(post_screenshot(r#"{"url": "https://example.com"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "miss");
        assert_eq!(
            response.headers()[header::CONTENT_SECURITY_POLICY],
            "default-src 'self'; img-src data: https:;"
        );

        let body = json_body(response).await;
        let image = body["image"].as_str().unwrap();
        assert!(image.starts_with("data:image/png;base64,"));

        assert!(cache
            .get("screenshot:https://example.com")
            .await
            .unwrap()
            .is_some());
        assert_eq!(renderer.calls(), 1);

        // Replay is served from cache.
        let response = app
            .oneshot(post_screenshot(r#"{"url": "https://example.com"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "hit");
        assert_eq!(renderer.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_url_returns_400() {
        let (app, _, renderer) = test_app(&test_config());

        let response = app
            .oneshot(post_screenshot(r#"{"url": "not-a-url"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Invalid or missing URL");
        assert_eq!(renderer.calls(), 0);
    }

    #[tokio::test]
    async fn missing_url_field_returns_400() {
        let (app, _, _) = test_app(&test_config());

        let response = app.oneshot(post_screenshot("{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Invalid or missing URL");
    }

    #[tokio::test]
    async fn wrong_method_returns_405() {
        let (app, _, _) = test_app(&test_config());

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/screenshot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Method not allowed");
    }

    #[tokio::test]
    async fn throttled_request_returns_429_with_retry_after() {
        let config = Config {
            rate_limit_points: 1,
            ..test_config()
        };
        let (app, _, _) = test_app(&config);

        let response = app
            .clone()
            .oneshot(post_screenshot(r#"{"url": "https://example.com"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_screenshot(r#"{"url": "https://example.com"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let retry_after: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
        assert!(retry_after <= config.rate_limit_window.as_secs());

        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Too many requests"));
    }

    #[tokio::test]
    async fn health_reports_pool_statistics() {
        let (app, _, _) = test_app(&test_config());

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["browser_pool"]["total_instances"], 2);
        assert_eq!(body["in_flight_renders"], 0);
    }
}
