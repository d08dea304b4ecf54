use axum::body::Body;
use axum::http::{header::HeaderName, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use ridepool_common::request_id::{RequestId, RequestIdLayer};
use ridepool_common::security_headers::SecurityHeadersLayer;
use tower::ServiceExt;

const RID_HEADER: &str = "x-request-id";

#[tokio::test]
async fn request_id_is_minted_when_absent() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(RequestIdLayer::new(HeaderName::from_static(RID_HEADER)));

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let rid = resp
        .headers()
        .get(RID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert_eq!(rid.len(), 32);
    assert!(rid.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn request_id_echoes_well_formed_caller_id() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(RequestIdLayer::new(HeaderName::from_static(RID_HEADER)));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header(RID_HEADER, "caller-supplied-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        resp.headers()
            .get(RID_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("caller-supplied-42")
    );
}

#[tokio::test]
async fn request_id_discards_malformed_caller_id() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(RequestIdLayer::new(HeaderName::from_static(RID_HEADER)));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header(RID_HEADER, "not acceptable; drop table")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let rid = resp
        .headers()
        .get(RID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert_ne!(rid, "not acceptable; drop table");
    assert_eq!(rid.len(), 32);
}

#[tokio::test]
async fn request_id_is_visible_to_handlers() {
    async fn echo(ext: axum::Extension<RequestId>) -> String {
        ext.0 .0.clone()
    }

    let app = Router::new()
        .route("/x", get(echo))
        .layer(RequestIdLayer::new(HeaderName::from_static(RID_HEADER)));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/x")
                .header(RID_HEADER, "trace-me")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"trace-me");
}

#[tokio::test]
async fn security_headers_added_when_enabled() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(SecurityHeadersLayer::new(true, true));

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(
        resp.headers()
            .get("x-content-type-options")
            .and_then(|v| v.to_str().ok()),
        Some("nosniff")
    );
    assert_eq!(
        resp.headers()
            .get("content-security-policy")
            .and_then(|v| v.to_str().ok()),
        Some("default-src 'none'; frame-ancestors 'none'")
    );
    assert!(resp.headers().get("strict-transport-security").is_some());
}

#[tokio::test]
async fn security_headers_hsts_off_by_flag() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(SecurityHeadersLayer::new(true, false));

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(resp.headers().get("strict-transport-security").is_none());
    assert!(resp.headers().get("x-content-type-options").is_some());
}

#[tokio::test]
async fn security_headers_disabled_layer_adds_nothing() {
    let app = Router::new()
        .route("/x", get(|| async { "ok" }))
        .layer(SecurityHeadersLayer::new(false, true));

    let resp = app
        .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(resp.headers().get("x-content-type-options").is_none());
    assert!(resp.headers().get("content-security-policy").is_none());
}
