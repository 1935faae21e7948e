//! Integration tests against an in-process HTTP/2 server.
//!
//! The canned mock-server crates speak HTTP/1.1 only, so these tests serve
//! axum routers through `axum::serve`, whose connection handling accepts
//! HTTP/2 with prior knowledge over plain TCP. The client connects with
//! `allow_insecure_http`.

use axum::extract::{ConnectInfo, Json, Query};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use esiflow::backoff::DelayScheduleFactory;
use esiflow::{Client, ConnectionSettings, Error, RequestOptions};
use http::StatusCode;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const DATE: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
const EXPIRES: &str = "Wed, 21 Oct 2015 07:29:00 GMT";
const EXPIRES_SPLIT: &str = "Wed, 21 Oct 2015 07:30:00 GMT";

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn settings(addr: SocketAddr) -> ConnectionSettings {
    ConnectionSettings::default()
        .esi_url(format!("http://{addr}"))
        .unwrap()
        .allow_insecure_http()
}

fn client(addr: SocketAddr) -> Client {
    Client::builder()
        .connection_settings(settings(addr))
        .build()
        .unwrap()
}

fn constant_delay(ms: u64) -> DelayScheduleFactory {
    Arc::new(move || Box::new(std::iter::repeat(Duration::from_millis(ms))))
}

fn status_app() -> Router {
    Router::new().route("/v1/status/", get(|| async { Json(json!({"players": 42})) }))
}

#[tokio::test]
async fn single_get_returns_json_data() {
    let addr = serve(status_app()).await;
    let client = client(addr);

    let response = client
        .request("/v1/status/", RequestOptions::get())
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.is_none());
    assert!(!response.is_paginated());
    assert_eq!(*response.data.unwrap(), json!({"players": 42}));
}

#[tokio::test]
async fn non_json_body_is_kept_raw() {
    let app = Router::new().route(
        "/v1/motd/",
        get(|| async { ([("content-type", "text/plain")], "fly safe") }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let response = client
        .request("/v1/motd/", RequestOptions::get())
        .await
        .unwrap();

    assert!(response.data.is_none());
    assert_eq!(response.body.as_deref(), Some("fly safe"));
}

#[tokio::test]
async fn path_parameters_and_default_query_reach_the_server() {
    let app = Router::new().route(
        "/v1/characters/{id}/",
        get(
            |axum::extract::Path(id): axum::extract::Path<u64>,
             Query(query): Query<HashMap<String, String>>| async move {
                Json(json!({
                    "id": id,
                    "datasource": query.get("datasource"),
                }))
            },
        ),
    );
    let addr = serve(app).await;
    let client = Client::builder()
        .connection_settings(settings(addr))
        .default_query("datasource", "tranquility")
        .build()
        .unwrap();

    let response = client
        .request(
            "/v1/characters/{character_id}/",
            RequestOptions::get().parameter("character_id", 2114794365u64),
        )
        .await
        .unwrap();

    assert_eq!(
        *response.data.unwrap(),
        json!({"id": 2114794365u64, "datasource": "tranquility"})
    );
}

#[tokio::test]
async fn missing_path_parameter_fails_before_io() {
    // No server at all: the configuration error fires first.
    let client = Client::builder()
        .connection_settings(settings(([127, 0, 0, 1], 1).into()))
        .build()
        .unwrap();

    let result = client
        .request("/v1/characters/{character_id}/", RequestOptions::get())
        .await;
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn bearer_token_is_attached() {
    let app = Router::new().route(
        "/v1/secret/",
        get(|headers: http::HeaderMap| async move {
            if headers
                .get("authorization")
                .is_some_and(|v| v == "Bearer sekrit")
            {
                Json(json!({"ok": true})).into_response()
            } else {
                StatusCode::FORBIDDEN.into_response()
            }
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let response = client
        .request("/v1/secret/", RequestOptions::get().token("sekrit"))
        .await
        .unwrap();
    assert_eq!(*response.data.unwrap(), json!({"ok": true}));

    // An async provider resolves to the same header.
    struct Provider;
    #[async_trait::async_trait]
    impl esiflow::TokenProvider for Provider {
        async fn token(&self) -> esiflow::Result<String> {
            Ok("sekrit".to_string())
        }
    }
    let token = esiflow::Token::Provider(Arc::new(Provider));
    let response = client
        .request("/v1/secret/", RequestOptions::get().token(token))
        .await
        .unwrap();
    assert_eq!(*response.data.unwrap(), json!({"ok": true}));
}

#[tokio::test]
async fn stripped_headers_are_removed() {
    let app = Router::new().route(
        "/v1/status/",
        get(|| async {
            (
                [
                    ("strict-transport-security", "max-age=31536000"),
                    ("x-pages", "1"),
                ],
                Json(json!({"players": 1})),
            )
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let response = client
        .request("/v1/status/", RequestOptions::get())
        .await
        .unwrap();

    assert!(response.header("strict-transport-security").is_none());
    assert_eq!(response.header("x-pages"), Some("1"));
}

#[tokio::test]
async fn gzip_response_is_decompressed() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let app = Router::new().route(
        "/v1/gzipped/",
        get(|| async {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(br#"{"players":7}"#).unwrap();
            let compressed = encoder.finish().unwrap();
            (
                [
                    ("content-type", "application/json"),
                    ("content-encoding", "gzip"),
                ],
                compressed,
            )
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let response = client
        .request("/v1/gzipped/", RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(*response.data.unwrap(), json!({"players": 7}));
}

#[tokio::test]
async fn paginated_get_merges_two_pages() {
    let app = Router::new().route(
        "/v1/items/",
        get(|Query(query): Query<HashMap<String, String>>| async move {
            let page = query.get("page").map(String::as_str).unwrap_or("1");
            let body = if page == "1" { json!([1, 2]) } else { json!([3, 4]) };
            (
                [("x-pages", "2"), ("expires", EXPIRES), ("date", DATE)],
                Json(body),
            )
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let response = client
        .request("/v1/items/", RequestOptions::get())
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(*response.data.clone().unwrap(), json!([1, 2, 3, 4]));
    assert_eq!(response.header("expires"), Some(EXPIRES));
    assert_eq!(response.responses.len(), 2);
    assert_eq!(*response.responses[0].data.clone().unwrap(), json!([1, 2]));
    assert_eq!(*response.responses[1].data.clone().unwrap(), json!([3, 4]));
}

#[tokio::test]
async fn page_split_is_detected() {
    let app = Router::new().route(
        "/v1/items/",
        get(|Query(query): Query<HashMap<String, String>>| async move {
            let page = query.get("page").map(String::as_str).unwrap_or("1");
            let expires = if page == "1" { EXPIRES } else { EXPIRES_SPLIT };
            (
                [("x-pages", "2"), ("expires", expires), ("date", DATE)],
                Json(json!([0])),
            )
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let result = client.request("/v1/items/", RequestOptions::get()).await;

    match result {
        Err(Error::PageSplit { responses }) => assert_eq!(responses.len(), 2),
        other => panic!("expected PageSplit, got {:?}", other),
    }
}

#[tokio::test]
async fn closing_cache_window_triggers_one_rerequest() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/items/",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Window of expires - date + 1s = 1s, well under the
                        // ten-page budget: the client should wait it out.
                        (
                            [("x-pages", "10"), ("expires", DATE), ("date", DATE)],
                            Json(json!([])),
                        )
                            .into_response()
                    } else {
                        ([("x-pages", "1")], Json(json!([1]))).into_response()
                    }
                }
            }
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let started = Instant::now();
    let response = client
        .request("/v1/items/", RequestOptions::get())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_millis(900), "slept {:?}", elapsed);
    assert!(!response.is_paginated());
    assert_eq!(*response.data.unwrap(), json!([1]));
}

#[tokio::test]
async fn retry_after_is_honored_on_503() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/flaky/",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            [("retry-after", "1")],
                            Json(json!({"error": "down for maintenance"})),
                        )
                            .into_response()
                    } else {
                        Json(json!({"ok": true})).into_response()
                    }
                }
            }
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let started = Instant::now();
    let response = client
        .request("/v1/flaky/", RequestOptions::get())
        .await
        .unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_millis(950));
    assert_eq!(*response.data.unwrap(), json!({"ok": true}));
}

#[tokio::test]
async fn error_limit_signal_selects_the_high_schedule() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/flaky/",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        (
                            StatusCode::BAD_GATEWAY,
                            [("x-esi-error-limit-reset", "30")],
                            "",
                        )
                            .into_response()
                    } else {
                        Json(json!({"ok": true})).into_response()
                    }
                }
            }
        }),
    );
    let addr = serve(app).await;
    let client = Client::builder()
        .connection_settings(settings(addr))
        .retry_delay_low(constant_delay(10))
        .retry_delay_high(constant_delay(400))
        .build()
        .unwrap();

    let started = Instant::now();
    client
        .request("/v1/flaky/", RequestOptions::get())
        .await
        .unwrap();

    // The wait came from the high schedule, not the 10 ms low one.
    assert!(started.elapsed() >= Duration::from_millis(350));
}

#[tokio::test]
async fn zero_retries_permits_exactly_one_attempt() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/down/",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }
        }),
    );
    let addr = serve(app).await;
    let client = Client::builder()
        .connection_settings(settings(addr))
        .max_retries(0)
        .build()
        .unwrap();

    let result = client.request("/v1/down/", RequestOptions::get()).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    match result {
        Err(Error::RetryLimit { response }) => {
            assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("expected RetryLimit, got {:?}", other),
    }
}

#[tokio::test]
async fn non_retryable_status_maps_the_error_body() {
    let app = Router::new()
        .route(
            "/v1/missing/",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "Character not found"})),
                )
            }),
        )
        .route(
            "/v1/bad/",
            get(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    [("content-type", "text/plain")],
                    "nope",
                )
            }),
        );
    let addr = serve(app).await;
    let client = client(addr);

    match client.request("/v1/missing/", RequestOptions::get()).await {
        Err(Error::Http { message, response }) => {
            assert_eq!(message, "Character not found");
            assert_eq!(response.status, StatusCode::NOT_FOUND);
        }
        other => panic!("expected Http, got {:?}", other),
    }

    match client.request("/v1/bad/", RequestOptions::get()).await {
        Err(Error::Http { message, .. }) => assert_eq!(message, "Response code 400"),
        other => panic!("expected Http, got {:?}", other),
    }
}

#[tokio::test]
async fn post_chunking_splits_and_merges_in_order() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route(
        "/v1/universe/names/",
        post({
            let sizes = sizes.clone();
            move |Json(ids): Json<Vec<i64>>| {
                let sizes = sizes.clone();
                async move {
                    sizes.lock().unwrap().push(ids.len());
                    let names: Vec<String> =
                        ids.iter().map(|id| format!("name-{id}")).collect();
                    ([("expires", EXPIRES), ("date", DATE)], Json(names))
                }
            }
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let ids: Vec<i64> = (0..2500).collect();
    let response = client
        .request(
            "/v1/universe/names/",
            RequestOptions::post()
                .body(&ids)
                .unwrap()
                .body_page_size(1000)
                .unwrap(),
        )
        .await
        .unwrap();

    let mut observed = sizes.lock().unwrap().clone();
    observed.sort_unstable();
    assert_eq!(observed, vec![500, 1000, 1000]);

    let data = response.data.unwrap();
    let merged = data.as_array().unwrap();
    assert_eq!(merged.len(), 2500);
    let expected: Vec<Value> = (0..2500).map(|id| json!(format!("name-{id}"))).collect();
    assert_eq!(*merged, expected);
    assert_eq!(response.responses.len(), 3);
}

#[tokio::test]
async fn post_without_chunking_is_a_single_request() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/universe/names/",
        post({
            let hits = hits.clone();
            move |Json(ids): Json<Value>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(ids)
                }
            }
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    // body_page_size set, but the body is not an array: falls through to a
    // single exchange.
    let response = client
        .request(
            "/v1/universe/names/",
            RequestOptions::post()
                .body(&json!({"ids": [1, 2, 3]}))
                .unwrap()
                .body_page_size(2)
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!response.is_paginated());
}

#[tokio::test]
async fn etag_304_reuses_previous_data() {
    let app = Router::new().route(
        "/v1/alliances/",
        get(|headers: http::HeaderMap| async move {
            if headers
                .get("if-none-match")
                .is_some_and(|v| v == "\"abc123\"")
            {
                (StatusCode::NOT_MODIFIED, [("etag", "\"abc123\"")], "").into_response()
            } else {
                ([("etag", "\"abc123\"")], Json(json!([99005443, 99005784]))).into_response()
            }
        }),
    );
    let addr = serve(app).await;
    let client = client(addr);

    let first = client
        .request("/v1/alliances/", RequestOptions::get())
        .await
        .unwrap();
    assert_eq!(first.header("etag"), Some("\"abc123\""));

    let second = client
        .request(
            "/v1/alliances/",
            RequestOptions::get().previous_response(first.clone()),
        )
        .await
        .unwrap();

    // The 304 presents the prior status and the very same data value.
    assert_eq!(second.status, StatusCode::OK);
    assert!(Arc::ptr_eq(
        first.data.as_ref().unwrap(),
        second.data.as_ref().unwrap()
    ));
}

#[tokio::test]
async fn pool_round_robins_across_connections() {
    let peers = Arc::new(Mutex::new(HashSet::new()));
    let app = Router::new().route(
        "/v1/status/",
        get({
            let peers = peers.clone();
            move |ConnectInfo(peer): ConnectInfo<SocketAddr>| {
                let peers = peers.clone();
                async move {
                    peers.lock().unwrap().insert(peer);
                    Json(json!({"players": 42}))
                }
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    let client = Client::builder()
        .connection_settings(settings(addr))
        .pool_size(2)
        .build()
        .unwrap();

    for _ in 0..4 {
        client
            .request("/v1/status/", RequestOptions::get())
            .await
            .unwrap();
    }

    // Two distinct TCP peers prove both pooled sessions carried traffic.
    assert_eq!(peers.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn requests_queue_until_the_server_appears() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::builder()
        .connection_settings(
            settings(addr)
                .reconnect_delay(constant_delay(100))
                .max_pending_time(Duration::from_secs(10)),
        )
        .build()
        .unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.request("/v1/status/", RequestOptions::get()).await }
    });

    // Let a few connection attempts fail, then bring the server up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, status_app()).await.unwrap();
    });

    let response = pending.await.unwrap().unwrap();
    assert_eq!(*response.data.unwrap(), json!({"players": 42}));
}

#[tokio::test]
async fn queued_request_ages_out() {
    // Nothing listens here; every connection attempt fails fast.
    let client = Client::builder()
        .connection_settings(
            settings(([127, 0, 0, 1], 1).into())
                .reconnect_delay(constant_delay(50))
                .max_pending_time(Duration::from_millis(100)),
        )
        .build()
        .unwrap();

    let result = client.request("/v1/status/", RequestOptions::get()).await;
    assert!(matches!(result, Err(Error::ConnectionTimeout { .. })));
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_later_requests() {
    let addr = serve(status_app()).await;
    let client = client(addr);

    client
        .request("/v1/status/", RequestOptions::get())
        .await
        .unwrap();

    client.close();
    client.close();

    let result = client.request("/v1/status/", RequestOptions::get()).await;
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}
