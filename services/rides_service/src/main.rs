mod config;
mod db;
mod error;
mod fare;
mod gateway;
mod handlers;
mod models;
mod notify;
mod reconcile;
mod state;

use axum::extract::MatchedPath;
use axum::http::{header, header::HeaderName, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use config::Config;
use ridepool_common::request_id::RequestIdLayer;
use ridepool_common::security_headers::SecurityHeadersLayer;
use state::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let pool = match db::connect(&cfg.db_url).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "db connect failed");
            std::process::exit(2);
        }
    };
    if let Err(e) = db::ensure_schema(&pool, &cfg.db_schema).await {
        tracing::error!(error = %e, "db ensure_schema failed");
        std::process::exit(2);
    }

    let http = match reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "http client init failed");
            std::process::exit(2);
        }
    };

    let state = AppState {
        pool,
        db_schema: cfg.db_schema.clone(),
        env_name: cfg.env_name.clone(),
        env_lower: cfg.env_lower.clone(),
        currency: cfg.currency.clone(),
        gateway_base_url: cfg.gateway_base_url.clone(),
        gateway_key_id: cfg.gateway_key_id.clone(),
        gateway_webhook_secret: cfg.gateway_webhook_secret.clone(),
        admin_api_secret: cfg.admin_api_secret.clone(),
        notify_base_url: cfg.notify_base_url.clone(),
        http,
    };

    reconcile::spawn(
        state.clone(),
        cfg.reconcile_interval_secs,
        cfg.pending_payment_ttl_secs,
    );

    let app = router(&cfg).with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));
    tracing::info!(%addr, "starting ridepool_rides_service");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

fn router(cfg: &Config) -> Router<AppState> {
    let api = Router::new()
        .route("/users", post(handlers::drivers::create_user))
        .route("/users/:user_id", get(handlers::drivers::get_user))
        .route(
            "/drivers/:driver_id/approve",
            post(handlers::drivers::approve_driver),
        )
        .route(
            "/drivers/:driver_id/reject",
            post(handlers::drivers::reject_driver),
        )
        .route(
            "/drivers/:driver_id/rating",
            get(handlers::reviews::driver_rating),
        )
        .route(
            "/drivers/:driver_id/wallet",
            get(handlers::payments::driver_wallet),
        )
        .route("/rides", post(handlers::rides::post_ride))
        .route("/rides/search", get(handlers::rides::search_rides))
        .route("/rides/mine", get(handlers::rides::my_rides))
        .route(
            "/rides/:ride_id",
            get(handlers::rides::ride_detail).patch(handlers::rides::update_ride),
        )
        .route("/rides/:ride_id/start", post(handlers::rides::start_ride))
        .route(
            "/rides/:ride_id/complete",
            post(handlers::rides::complete_ride),
        )
        .route("/rides/:ride_id/cancel", post(handlers::rides::cancel_ride))
        .route(
            "/rides/:ride_id/bookings",
            get(handlers::bookings::ride_bookings).post(handlers::bookings::create_booking),
        )
        .route("/bookings/mine", get(handlers::bookings::my_bookings))
        .route("/bookings/driver", get(handlers::bookings::driver_bookings))
        .route(
            "/bookings/:booking_id",
            get(handlers::bookings::booking_detail),
        )
        .route(
            "/bookings/:booking_id/cancel",
            post(handlers::bookings::cancel_booking),
        )
        .route(
            "/bookings/:booking_id/review",
            post(handlers::reviews::submit_review),
        )
        .route(
            "/bookings/:booking_id/reviewed",
            get(handlers::reviews::has_reviewed),
        )
        .route("/payments/order", post(handlers::payments::create_order))
        .route("/payments/verify", post(handlers::payments::verify_payment))
        .route(
            "/payments/history",
            get(handlers::payments::payment_history),
        )
        .route(
            "/payments/driver/history",
            get(handlers::payments::driver_payment_history),
        )
        .route(
            "/payments/payout",
            post(handlers::payments::transfer_to_driver),
        );

    let cors = if cfg.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
            .allow_headers(cors_allowed_headers())
            .allow_credentials(false)
    } else {
        let origins: Vec<axum::http::HeaderValue> = cfg
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
            .allow_headers(cors_allowed_headers())
            .allow_credentials(false)
            .allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(cfg.max_body_bytes))
        .layer(SecurityHeadersLayer::from_env(&cfg.env_name))
        // Log the matched route template rather than the raw path so query
        // strings and ids stay out of the logs.
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or_else(|| req.uri().path());
                tracing::span!(
                    tracing::Level::INFO,
                    "http_request",
                    method = %req.method(),
                    path = %path
                )
            }),
        )
        .layer(RequestIdLayer::new(HeaderName::from_static("x-request-id")))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn cors_allowed_headers() -> Vec<HeaderName> {
    vec![
        header::ACCEPT,
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        HeaderName::from_static("x-request-id"),
        HeaderName::from_static("x-user-id"),
    ]
}

#[cfg(test)]
mod router_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    #[tokio::test]
    async fn unknown_routes_return_404() {
        let app = Router::new()
            .route("/health", get(ok_handler))
            .fallback(|| async { StatusCode::NOT_FOUND });

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/does_not_exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn cors_whitelist_excludes_admin_and_proxy_headers() {
        let headers = cors_allowed_headers();
        let has = |name: &str| {
            headers
                .iter()
                .any(|h| h.as_str().eq_ignore_ascii_case(name))
        };

        assert!(has("content-type"));
        assert!(has("x-request-id"));
        assert!(has("x-user-id"));

        // The admin gate is server-to-server only; browsers never send it.
        assert!(!has("x-admin-secret"));
        assert!(!has("x-forwarded-for"));
        assert!(!has("x-forwarded-host"));
        assert!(!has("x-real-ip"));
        assert!(!has("cookie"));
    }
}
